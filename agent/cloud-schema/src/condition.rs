//! Trigger condition trees.
//!
//! Conditions arrive as recursive protobuf messages and are flattened into an
//! arena of indexed nodes. The arena form is what gets cloned into inspection
//! matrix snapshots, so it carries no heap links between nodes — children are
//! plain indices.

use signal_core::SignalId;

use crate::proto::{
    self, read_double, read_len_delim, read_string, read_tag, read_varint, skip_field, WIRE_FIXED64,
    WIRE_LEN, WIRE_VARINT,
};
use crate::SchemaError;

pub type NodeIndex = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
}

/// Sliding-window aggregate selector. `Last*` reads the most recently closed
/// window, `Prev*` the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    LastMin,
    LastMax,
    LastAvg,
    PrevMin,
    PrevMax,
    PrevAvg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionNode {
    BoolLiteral(bool),
    DoubleLiteral(f64),
    StringLiteral(String),
    SignalRef(SignalId),
    WindowFunction {
        signal_id: SignalId,
        window: WindowType,
    },
    Unary {
        op: UnaryOp,
        operand: NodeIndex,
    },
    Binary {
        op: BinaryOp,
        left: NodeIndex,
        right: NodeIndex,
    },
    CustomFunction {
        name: String,
        params: Vec<NodeIndex>,
    },
    IsNull(NodeIndex),
}

/// A flattened condition tree. `root` always refers into `nodes`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExpressionArena {
    pub nodes: Vec<ExpressionNode>,
    pub root: NodeIndex,
}

impl ExpressionArena {
    /// Builds the single-node tree `true`, used for time-based schemes.
    pub fn always_true() -> Self {
        ExpressionArena {
            nodes: vec![ExpressionNode::BoolLiteral(true)],
            root: 0,
        }
    }

    pub fn node(&self, index: NodeIndex) -> &ExpressionNode {
        &self.nodes[index as usize]
    }

    /// All signal ids referenced by value or window function.
    pub fn referenced_signals(&self) -> Vec<SignalId> {
        let mut ids: Vec<SignalId> = self
            .nodes
            .iter()
            .filter_map(|n| match n {
                ExpressionNode::SignalRef(id) => Some(*id),
                ExpressionNode::WindowFunction { signal_id, .. } => Some(*signal_id),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// True if any node reads a windowed aggregate of `signal_id`.
    pub fn uses_window(&self, signal_id: SignalId) -> bool {
        self.nodes.iter().any(
            |n| matches!(n, ExpressionNode::WindowFunction { signal_id: s, .. } if *s == signal_id),
        )
    }
}

// ── Wire layout ───────────────────────────────────────────────────────────
//
// Node message:
//   1  operator            varint  (OperatorCode below; has left/right children)
//   2  signal_id           varint
//   3  double_value        fixed64
//   4  boolean_value       varint
//   5  string_value        bytes
//   6  left                message
//   7  right               message
//   8  window_function     message { 1 signal_id, 2 window_type }
//   9  custom_function     message { 1 name, 2 params (repeated Node) }
//  10  is_null             message { 1 operand (Node) }

const OP_AND: u64 = 1;
const OP_OR: u64 = 2;
const OP_NOT: u64 = 3;
const OP_LESS: u64 = 4;
const OP_LESS_EQUAL: u64 = 5;
const OP_GREATER: u64 = 6;
const OP_GREATER_EQUAL: u64 = 7;
const OP_EQUAL: u64 = 8;
const OP_NOT_EQUAL: u64 = 9;
const OP_ADD: u64 = 10;
const OP_SUBTRACT: u64 = 11;
const OP_MULTIPLY: u64 = 12;
const OP_DIVIDE: u64 = 13;

fn binary_op_from_code(code: u64) -> Option<BinaryOp> {
    Some(match code {
        OP_AND => BinaryOp::And,
        OP_OR => BinaryOp::Or,
        OP_LESS => BinaryOp::Less,
        OP_LESS_EQUAL => BinaryOp::LessEqual,
        OP_GREATER => BinaryOp::Greater,
        OP_GREATER_EQUAL => BinaryOp::GreaterEqual,
        OP_EQUAL => BinaryOp::Equal,
        OP_NOT_EQUAL => BinaryOp::NotEqual,
        OP_ADD => BinaryOp::Add,
        OP_SUBTRACT => BinaryOp::Subtract,
        OP_MULTIPLY => BinaryOp::Multiply,
        OP_DIVIDE => BinaryOp::Divide,
        _ => return None,
    })
}

fn window_from_code(code: u64) -> Option<WindowType> {
    Some(match code {
        1 => WindowType::LastMin,
        2 => WindowType::LastMax,
        3 => WindowType::LastAvg,
        4 => WindowType::PrevMin,
        5 => WindowType::PrevMax,
        6 => WindowType::PrevAvg,
        _ => return None,
    })
}

/// Decodes a serialized Node message into `arena`, returning the index of the
/// decoded node.
pub fn decode_node(buf: &[u8], arena: &mut ExpressionArena) -> Result<NodeIndex, SchemaError> {
    let mut pos = 0usize;
    let mut operator: Option<u64> = None;
    let mut signal_id: Option<SignalId> = None;
    let mut double_value: Option<f64> = None;
    let mut bool_value: Option<bool> = None;
    let mut string_value: Option<String> = None;
    let mut left: Option<NodeIndex> = None;
    let mut right: Option<NodeIndex> = None;
    let mut window: Option<(SignalId, WindowType)> = None;
    let mut custom: Option<(String, Vec<NodeIndex>)> = None;
    let mut is_null: Option<NodeIndex> = None;

    while pos < buf.len() {
        let (field, wire) = read_tag(buf, &mut pos)?;
        match (field, wire) {
            (1, WIRE_VARINT) => operator = Some(read_varint(buf, &mut pos)?),
            (2, WIRE_VARINT) => signal_id = Some(read_varint(buf, &mut pos)? as SignalId),
            (3, WIRE_FIXED64) => double_value = Some(read_double(buf, &mut pos)?),
            (4, WIRE_VARINT) => bool_value = Some(read_varint(buf, &mut pos)? != 0),
            (5, WIRE_LEN) => string_value = Some(read_string(buf, &mut pos)?),
            (6, WIRE_LEN) => {
                let child = read_len_delim(buf, &mut pos)?;
                left = Some(decode_node(child, arena)?);
            }
            (7, WIRE_LEN) => {
                let child = read_len_delim(buf, &mut pos)?;
                right = Some(decode_node(child, arena)?);
            }
            (8, WIRE_LEN) => {
                let inner = read_len_delim(buf, &mut pos)?;
                window = Some(decode_window_function(inner)?);
            }
            (9, WIRE_LEN) => {
                let inner = read_len_delim(buf, &mut pos)?;
                custom = Some(decode_custom_function(inner, arena)?);
            }
            (10, WIRE_LEN) => {
                let inner = read_len_delim(buf, &mut pos)?;
                is_null = Some(decode_is_null(inner, arena)?);
            }
            (_, w) => skip_field(buf, &mut pos, w)?,
        }
    }

    let node = if let Some(code) = operator {
        if code == OP_NOT {
            let operand = left.ok_or(SchemaError::Malformed("not without operand"))?;
            ExpressionNode::Unary {
                op: UnaryOp::Not,
                operand,
            }
        } else {
            let op = binary_op_from_code(code).ok_or(SchemaError::Malformed("unknown operator"))?;
            ExpressionNode::Binary {
                op,
                left: left.ok_or(SchemaError::Malformed("operator without left child"))?,
                right: right.ok_or(SchemaError::Malformed("operator without right child"))?,
            }
        }
    } else if let Some((signal_id, window)) = window {
        ExpressionNode::WindowFunction { signal_id, window }
    } else if let Some((name, params)) = custom {
        ExpressionNode::CustomFunction { name, params }
    } else if let Some(operand) = is_null {
        ExpressionNode::IsNull(operand)
    } else if let Some(id) = signal_id {
        ExpressionNode::SignalRef(id)
    } else if let Some(v) = double_value {
        ExpressionNode::DoubleLiteral(v)
    } else if let Some(s) = string_value {
        ExpressionNode::StringLiteral(s)
    } else if let Some(b) = bool_value {
        ExpressionNode::BoolLiteral(b)
    } else {
        return Err(SchemaError::Malformed("empty expression node"));
    };

    arena.nodes.push(node);
    Ok((arena.nodes.len() - 1) as NodeIndex)
}

fn decode_window_function(buf: &[u8]) -> Result<(SignalId, WindowType), SchemaError> {
    let mut pos = 0usize;
    let mut signal_id = None;
    let mut window = None;
    while pos < buf.len() {
        let (field, wire) = read_tag(buf, &mut pos)?;
        match (field, wire) {
            (1, WIRE_VARINT) => signal_id = Some(read_varint(buf, &mut pos)? as SignalId),
            (2, WIRE_VARINT) => {
                let code = read_varint(buf, &mut pos)?;
                window =
                    Some(window_from_code(code).ok_or(SchemaError::Malformed("unknown window type"))?);
            }
            (_, w) => skip_field(buf, &mut pos, w)?,
        }
    }
    match (signal_id, window) {
        (Some(s), Some(w)) => Ok((s, w)),
        _ => Err(SchemaError::Malformed("incomplete window function")),
    }
}

fn decode_custom_function(
    buf: &[u8],
    arena: &mut ExpressionArena,
) -> Result<(String, Vec<NodeIndex>), SchemaError> {
    let mut pos = 0usize;
    let mut name = None;
    let mut params = Vec::new();
    while pos < buf.len() {
        let (field, wire) = read_tag(buf, &mut pos)?;
        match (field, wire) {
            (1, WIRE_LEN) => name = Some(read_string(buf, &mut pos)?),
            (2, WIRE_LEN) => {
                let child = read_len_delim(buf, &mut pos)?;
                params.push(decode_node(child, arena)?);
            }
            (_, w) => skip_field(buf, &mut pos, w)?,
        }
    }
    Ok((
        name.ok_or(SchemaError::Malformed("custom function without name"))?,
        params,
    ))
}

fn decode_is_null(buf: &[u8], arena: &mut ExpressionArena) -> Result<NodeIndex, SchemaError> {
    let mut pos = 0usize;
    let mut operand = None;
    while pos < buf.len() {
        let (field, wire) = read_tag(buf, &mut pos)?;
        match (field, wire) {
            (1, WIRE_LEN) => {
                let child = read_len_delim(buf, &mut pos)?;
                operand = Some(decode_node(child, arena)?);
            }
            (_, w) => skip_field(buf, &mut pos, w)?,
        }
    }
    operand.ok_or(SchemaError::Malformed("is_null without operand"))
}

// ── Test-side encoding ────────────────────────────────────────────────────

/// Builders producing the wire form of condition trees. Production code only
/// decodes conditions, but tests across the workspace need to synthesize
/// cloud documents, so the encoders live here rather than in each test.
pub mod encode {
    use super::*;

    #[derive(Debug, Clone)]
    pub enum Node {
        Bool(bool),
        Double(f64),
        Str(String),
        Signal(SignalId),
        Window(SignalId, WindowType),
        Not(Box<Node>),
        Binary(BinaryOp, Box<Node>, Box<Node>),
        Custom(String, Vec<Node>),
        IsNull(Box<Node>),
    }

    impl Node {
        pub fn signal_greater(signal: SignalId, threshold: f64) -> Node {
            Node::Binary(
                BinaryOp::Greater,
                Box::new(Node::Signal(signal)),
                Box::new(Node::Double(threshold)),
            )
        }
    }

    fn op_code(op: BinaryOp) -> u64 {
        match op {
            BinaryOp::And => OP_AND,
            BinaryOp::Or => OP_OR,
            BinaryOp::Less => OP_LESS,
            BinaryOp::LessEqual => OP_LESS_EQUAL,
            BinaryOp::Greater => OP_GREATER,
            BinaryOp::GreaterEqual => OP_GREATER_EQUAL,
            BinaryOp::Equal => OP_EQUAL,
            BinaryOp::NotEqual => OP_NOT_EQUAL,
            BinaryOp::Add => OP_ADD,
            BinaryOp::Subtract => OP_SUBTRACT,
            BinaryOp::Multiply => OP_MULTIPLY,
            BinaryOp::Divide => OP_DIVIDE,
        }
    }

    fn window_code(window: WindowType) -> u64 {
        match window {
            WindowType::LastMin => 1,
            WindowType::LastMax => 2,
            WindowType::LastAvg => 3,
            WindowType::PrevMin => 4,
            WindowType::PrevMax => 5,
            WindowType::PrevAvg => 6,
        }
    }

    pub fn encode_node(node: &Node, buf: &mut Vec<u8>) {
        match node {
            Node::Bool(v) => proto::write_bool_field(buf, 4, *v),
            Node::Double(v) => proto::write_double_field(buf, 3, *v),
            Node::Str(s) => proto::write_string_field(buf, 5, s),
            Node::Signal(id) => proto::write_uint_field(buf, 2, u64::from(*id)),
            Node::Window(id, window) => proto::write_message_field(buf, 8, |inner| {
                proto::write_uint_field(inner, 1, u64::from(*id));
                proto::write_uint_field(inner, 2, window_code(*window));
            }),
            Node::Not(operand) => {
                proto::write_uint_field(buf, 1, OP_NOT);
                proto::write_message_field(buf, 6, |inner| encode_node(operand, inner));
            }
            Node::Binary(op, left, right) => {
                proto::write_uint_field(buf, 1, op_code(*op));
                proto::write_message_field(buf, 6, |inner| encode_node(left, inner));
                proto::write_message_field(buf, 7, |inner| encode_node(right, inner));
            }
            Node::Custom(name, params) => proto::write_message_field(buf, 9, |inner| {
                proto::write_string_field(inner, 1, name);
                for param in params {
                    proto::write_message_field(inner, 2, |p| encode_node(param, p));
                }
            }),
            Node::IsNull(operand) => proto::write_message_field(buf, 10, |inner| {
                proto::write_message_field(inner, 1, |p| encode_node(operand, p));
            }),
        }
    }

    pub fn to_bytes(node: &Node) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_node(node, &mut buf);
        buf
    }
}
