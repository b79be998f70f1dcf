//! Strictly-typed evaluation of condition trees against the sample store.

use std::collections::HashSet;
use std::sync::Mutex;

use cloud_schema::{BinaryOp, ExpressionArena, ExpressionNode, NodeIndex, UnaryOp, WindowType};
use signal_core::SignalId;
use tracing::warn;

use crate::store::SampleStore;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Double(f64),
    Text(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("type mismatch in expression")]
    TypeMismatch,
    #[error("no sample for signal {0}")]
    SignalMissing(SignalId),
    #[error("no closed window for signal {0}")]
    WindowMissing(SignalId),
}

type CustomFunction = dyn Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync;

/// Process-local registry of named custom condition functions.
#[derive(Default)]
pub struct CustomFunctionRegistry {
    functions: std::collections::HashMap<String, Box<CustomFunction>>,
    warned_unknown: Mutex<HashSet<String>>,
}

impl CustomFunctionRegistry {
    pub fn register(
        &mut self,
        name: impl Into<String>,
        function: impl Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    ) {
        self.functions.insert(name.into(), Box::new(function));
    }

    fn invoke(&self, name: &str, params: &[Value]) -> Result<Value, EvalError> {
        match self.functions.get(name) {
            Some(function) => function(params),
            None => {
                let mut warned = self.warned_unknown.lock().expect("registry poisoned");
                if warned.insert(name.to_string()) {
                    warn!(function = name, "unknown custom function, evaluating to false");
                }
                Ok(Value::Bool(false))
            }
        }
    }
}

/// Evaluates the arena's root against the store.
pub fn evaluate(
    arena: &ExpressionArena,
    store: &SampleStore,
    registry: &CustomFunctionRegistry,
) -> Result<Value, EvalError> {
    evaluate_node(arena, arena.root, store, registry)
}

/// Convenience wrapper mapping every evaluation error to `false`.
pub fn evaluate_as_trigger(
    arena: &ExpressionArena,
    store: &SampleStore,
    registry: &CustomFunctionRegistry,
) -> bool {
    match evaluate(arena, store, registry) {
        Ok(Value::Bool(result)) => result,
        Ok(Value::Double(value)) => value != 0.0 && !value.is_nan(),
        Ok(Value::Text(_)) => false,
        Err(e) => {
            metrics::counter!("canflux.inspection.eval_errors").increment(1);
            tracing::trace!(error = %e, "condition evaluated with error, treating as false");
            false
        }
    }
}

fn evaluate_node(
    arena: &ExpressionArena,
    index: NodeIndex,
    store: &SampleStore,
    registry: &CustomFunctionRegistry,
) -> Result<Value, EvalError> {
    match arena.node(index) {
        ExpressionNode::BoolLiteral(value) => Ok(Value::Bool(*value)),
        ExpressionNode::DoubleLiteral(value) => Ok(Value::Double(*value)),
        ExpressionNode::StringLiteral(value) => Ok(Value::Text(value.clone())),
        ExpressionNode::SignalRef(signal_id) => store
            .latest(*signal_id)
            .map(|sample| Value::Double(sample.value.as_f64()))
            .ok_or(EvalError::SignalMissing(*signal_id)),
        ExpressionNode::WindowFunction { signal_id, window } => {
            let (last, prev) = store.window_aggregates(*signal_id);
            let aggregate = match window {
                WindowType::LastMin | WindowType::LastMax | WindowType::LastAvg => last,
                WindowType::PrevMin | WindowType::PrevMax | WindowType::PrevAvg => prev,
            }
            .ok_or(EvalError::WindowMissing(*signal_id))?;
            let value = match window {
                WindowType::LastMin | WindowType::PrevMin => aggregate.min,
                WindowType::LastMax | WindowType::PrevMax => aggregate.max,
                WindowType::LastAvg | WindowType::PrevAvg => aggregate.avg(),
            };
            Ok(Value::Double(value))
        }
        ExpressionNode::Unary { op, operand } => {
            let value = evaluate_node(arena, *operand, store, registry)?;
            match (op, value) {
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                _ => Err(EvalError::TypeMismatch),
            }
        }
        ExpressionNode::Binary { op, left, right } => {
            evaluate_binary(arena, *op, *left, *right, store, registry)
        }
        ExpressionNode::CustomFunction { name, params } => {
            let mut values = Vec::with_capacity(params.len());
            for param in params {
                values.push(evaluate_node(arena, *param, store, registry)?);
            }
            registry.invoke(name, &values)
        }
        ExpressionNode::IsNull(operand) => match arena.node(*operand) {
            ExpressionNode::SignalRef(signal_id) => Ok(Value::Bool(!store.has_sample(*signal_id))),
            _ => {
                // Non-signal operands always have a value.
                evaluate_node(arena, *operand, store, registry)?;
                Ok(Value::Bool(false))
            }
        },
    }
}

fn evaluate_binary(
    arena: &ExpressionArena,
    op: BinaryOp,
    left: NodeIndex,
    right: NodeIndex,
    store: &SampleStore,
    registry: &CustomFunctionRegistry,
) -> Result<Value, EvalError> {
    // Logical operators short-circuit before the right side is touched.
    match op {
        BinaryOp::And => {
            let lhs = expect_bool(evaluate_node(arena, left, store, registry)?)?;
            if !lhs {
                return Ok(Value::Bool(false));
            }
            let rhs = expect_bool(evaluate_node(arena, right, store, registry)?)?;
            return Ok(Value::Bool(rhs));
        }
        BinaryOp::Or => {
            let lhs = expect_bool(evaluate_node(arena, left, store, registry)?)?;
            if lhs {
                return Ok(Value::Bool(true));
            }
            let rhs = expect_bool(evaluate_node(arena, right, store, registry)?)?;
            return Ok(Value::Bool(rhs));
        }
        _ => {}
    }

    let lhs = evaluate_node(arena, left, store, registry)?;
    let rhs = evaluate_node(arena, right, store, registry)?;

    match op {
        BinaryOp::Equal | BinaryOp::NotEqual => {
            let equal = match (&lhs, &rhs) {
                (Value::Double(a), Value::Double(b)) => {
                    if a.is_nan() || b.is_nan() {
                        return Ok(Value::Bool(false));
                    }
                    a == b
                }
                (Value::Text(a), Value::Text(b)) => a == b,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                _ => return Err(EvalError::TypeMismatch),
            };
            Ok(Value::Bool(if op == BinaryOp::Equal { equal } else { !equal }))
        }
        BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => {
            let (a, b) = (expect_double(lhs)?, expect_double(rhs)?);
            if a.is_nan() || b.is_nan() {
                return Ok(Value::Bool(false));
            }
            let result = match op {
                BinaryOp::Less => a < b,
                BinaryOp::LessEqual => a <= b,
                BinaryOp::Greater => a > b,
                _ => a >= b,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide => {
            let (a, b) = (expect_double(lhs)?, expect_double(rhs)?);
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Subtract => a - b,
                BinaryOp::Multiply => a * b,
                _ => {
                    if b == 0.0 {
                        // Propagates as NaN; comparisons above turn it into
                        // false.
                        f64::NAN
                    } else {
                        a / b
                    }
                }
            };
            Ok(Value::Double(result))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn expect_bool(value: Value) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(b),
        _ => Err(EvalError::TypeMismatch),
    }
}

fn expect_double(value: Value) -> Result<f64, EvalError> {
    match value {
        Value::Double(v) => Ok(v),
        _ => Err(EvalError::TypeMismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_schema::condition::encode::{self, Node};
    use cloud_schema::condition::decode_node;
    use policy_manager::{InspectionCondition, InspectionMatrix, SignalSpec};
    use signal_core::{Sample, SignalValue};

    fn arena(node: &Node) -> ExpressionArena {
        let bytes = encode::to_bytes(node);
        let mut arena = ExpressionArena::default();
        arena.root = decode_node(&bytes, &mut arena).unwrap();
        arena
    }

    fn store_with(signals: &[(SignalId, u32)], samples: &[(SignalId, u64, f64)]) -> SampleStore {
        let mut store = SampleStore::default();
        let matrix = InspectionMatrix {
            conditions: vec![InspectionCondition {
                scheme_id: "t".into(),
                condition: ExpressionArena::always_true(),
                minimum_trigger_interval_ms: 100,
                trigger_mode: cloud_schema::TriggerMode::Always,
                after_duration_ms: 0,
                include_dtcs: false,
                priority: 0,
                persist: false,
                compress: false,
                signals: signals
                    .iter()
                    .map(|(id, window)| SignalSpec {
                        signal_id: *id,
                        sample_buffer_size: 10,
                        minimum_sample_interval_ms: 0,
                        fixed_window_period_ms: *window,
                        condition_only: false,
                    })
                    .collect(),
            }],
        };
        store.reconfigure(&matrix);
        for (id, ts, value) in samples {
            store.insert(Sample::new(*id, *ts, SignalValue::Double(*value)));
        }
        store
    }

    fn eval_bool(node: &Node, store: &SampleStore) -> Result<Value, EvalError> {
        evaluate(&arena(node), store, &CustomFunctionRegistry::default())
    }

    #[test]
    fn comparison_against_latest_sample() {
        let store = store_with(&[(5, 0)], &[(5, 0, 12.0)]);
        assert_eq!(
            eval_bool(&Node::signal_greater(5, 10.0), &store),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            eval_bool(&Node::signal_greater(5, 20.0), &store),
            Ok(Value::Bool(false))
        );
    }

    #[test]
    fn missing_signal_is_an_error_and_trigger_false() {
        let store = store_with(&[(5, 0)], &[]);
        let tree = arena(&Node::signal_greater(5, 10.0));
        assert_eq!(
            evaluate(&tree, &store, &CustomFunctionRegistry::default()),
            Err(EvalError::SignalMissing(5))
        );
        assert!(!evaluate_as_trigger(
            &tree,
            &store,
            &CustomFunctionRegistry::default()
        ));
    }

    #[test]
    fn division_by_zero_compares_false() {
        let store = store_with(&[(5, 0)], &[(5, 0, 1.0)]);
        // (signal / 0) > -inf would be true for any real number; NaN makes
        // it false.
        let tree = Node::Binary(
            BinaryOp::Greater,
            Box::new(Node::Binary(
                BinaryOp::Divide,
                Box::new(Node::Signal(5)),
                Box::new(Node::Double(0.0)),
            )),
            Box::new(Node::Double(f64::MIN)),
        );
        assert_eq!(eval_bool(&tree, &store), Ok(Value::Bool(false)));
    }

    #[test]
    fn type_mismatch_is_reported() {
        let store = store_with(&[], &[]);
        let tree = Node::Binary(
            BinaryOp::Greater,
            Box::new(Node::Str("fast".into())),
            Box::new(Node::Double(1.0)),
        );
        assert_eq!(eval_bool(&tree, &store), Err(EvalError::TypeMismatch));
    }

    #[test]
    fn string_equality_works() {
        let store = store_with(&[], &[]);
        let tree = Node::Binary(
            BinaryOp::Equal,
            Box::new(Node::Str("a".into())),
            Box::new(Node::Str("a".into())),
        );
        assert_eq!(eval_bool(&tree, &store), Ok(Value::Bool(true)));
    }

    #[test]
    fn and_short_circuits_missing_right_side() {
        // signal 99 has no ring at all; the left false must short-circuit.
        let store = store_with(&[(5, 0)], &[(5, 0, 1.0)]);
        let tree = Node::Binary(
            BinaryOp::And,
            Box::new(Node::signal_greater(5, 100.0)),
            Box::new(Node::signal_greater(99, 0.0)),
        );
        assert_eq!(eval_bool(&tree, &store), Ok(Value::Bool(false)));
    }

    #[test]
    fn or_short_circuits() {
        let store = store_with(&[(5, 0)], &[(5, 0, 1.0)]);
        let tree = Node::Binary(
            BinaryOp::Or,
            Box::new(Node::signal_greater(5, 0.0)),
            Box::new(Node::signal_greater(99, 0.0)),
        );
        assert_eq!(eval_bool(&tree, &store), Ok(Value::Bool(true)));
    }

    #[test]
    fn is_null_reflects_ring_state() {
        let mut store = store_with(&[(5, 0)], &[]);
        let tree = Node::IsNull(Box::new(Node::Signal(5)));
        assert_eq!(eval_bool(&tree, &store), Ok(Value::Bool(true)));
        store.insert(Sample::new(5, 0, SignalValue::Double(1.0)));
        assert_eq!(eval_bool(&tree, &store), Ok(Value::Bool(false)));
    }

    #[test]
    fn window_average_scenario() {
        // Window average observed through the evaluator.
        let mut store = store_with(&[(7, 100)], &[]);
        for (ts, v) in [(10, 2.0), (40, 4.0), (70, 6.0)] {
            store.insert(Sample::new(7, ts, SignalValue::Double(v)));
        }
        for (ts, v) in [(110, 8.0), (150, 10.0)] {
            store.insert(Sample::new(7, ts, SignalValue::Double(v)));
        }
        let tree = Node::Binary(
            BinaryOp::Greater,
            Box::new(Node::Window(7, WindowType::LastAvg)),
            Box::new(Node::Double(5.0)),
        );

        store.advance_windows(150);
        assert_eq!(eval_bool(&tree, &store), Ok(Value::Bool(false)));

        store.advance_windows(200);
        assert_eq!(eval_bool(&tree, &store), Ok(Value::Bool(true)));
    }

    #[test]
    fn unknown_custom_function_is_false() {
        let store = store_with(&[], &[]);
        let tree = Node::Custom("no_such_function".into(), vec![Node::Double(1.0)]);
        assert_eq!(eval_bool(&tree, &store), Ok(Value::Bool(false)));
    }

    #[test]
    fn registered_custom_function_runs() {
        let store = store_with(&[(5, 0)], &[(5, 0, 4.0)]);
        let mut registry = CustomFunctionRegistry::default();
        registry.register("above_three", |params: &[Value]| match params {
            [Value::Double(v)] => Ok(Value::Bool(*v > 3.0)),
            _ => Err(EvalError::TypeMismatch),
        });
        let tree = arena(&Node::Custom("above_three".into(), vec![Node::Signal(5)]));
        assert_eq!(evaluate(&tree, &store, &registry), Ok(Value::Bool(true)));
    }
}
