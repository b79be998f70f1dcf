//! Collection scheme list: the cloud's policy of what to collect and when.

use signal_core::{SignalId, Timestamp};

use crate::condition::{self, ExpressionArena};
use crate::proto::{
    self, read_double, read_len_delim, read_repeated_u32, read_string, read_tag, read_varint,
    skip_field, WIRE_FIXED64, WIRE_LEN, WIRE_VARINT,
};
use crate::{SchemaError, SyncId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    /// Fire on every true evaluation.
    #[default]
    Always,
    /// Fire only on a false → true transition.
    RisingEdge,
}

/// Per-signal collection parameters inside a scheme.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SignalInformation {
    pub signal_id: SignalId,
    pub sample_buffer_size: u32,
    pub minimum_sample_interval_ms: u32,
    pub fixed_window_period_ms: u32,
    /// Signal participates in the condition but is not uploaded.
    pub condition_only: bool,
    pub data_partition_id: u32,
    /// Non-empty when this entry references a sub-path of a structured
    /// signal; `signal_id` is then the parent.
    pub signal_path: Vec<u32>,
}

/// One action executed when a fetch directive triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchAction {
    pub function_name: String,
    pub params: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchTrigger {
    Time {
        max_executions: u64,
        period_ms: u64,
        reset_window_ms: u64,
    },
    Condition {
        condition: ExpressionArena,
        rising_edge_only: bool,
    },
}

/// Directive to proactively acquire a signal.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchInformation {
    pub target_signal_id: SignalId,
    pub trigger: FetchTrigger,
    pub actions: Vec<FetchAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionScheme {
    pub scheme_id: SyncId,
    pub manifest_id: SyncId,
    pub start_time_ms: Timestamp,
    pub expiry_time_ms: Timestamp,
    pub after_duration_ms: u32,
    pub include_dtcs: bool,
    pub persist_collected_data: bool,
    pub compress_collected_data: bool,
    pub priority: u32,
    pub minimum_trigger_interval_ms: u32,
    pub trigger_mode: TriggerMode,
    pub condition: ExpressionArena,
    pub signals: Vec<SignalInformation>,
    pub fetch_informations: Vec<FetchInformation>,
}

impl CollectionScheme {
    pub fn signal_info(&self, signal_id: SignalId) -> Option<&SignalInformation> {
        self.signals.iter().find(|s| s.signal_id == signal_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectionSchemeList {
    pub schemes: Vec<CollectionScheme>,
}

impl CollectionSchemeList {
    /// Decodes and validates a scheme list blob.
    ///
    /// Wire layout: 1 collection_schemes (repeated message).
    /// Scheme message:
    ///   1 campaign_sync_id  2 decoder_manifest_sync_id  3 start_time_ms
    ///   4 expiry_time_ms  5 after_duration_ms  6 include_active_dtcs
    ///   7 persist_all_collected_data  8 compress_collected_data  9 priority
    ///  10 time_based { 1 period_ms }
    ///  11 condition_based { 1 minimum_interval_ms  2 language_version
    ///                       3 trigger_mode  4 condition_tree }
    ///  12 signal_information*  13 signal_fetch_information*
    pub fn decode(buf: &[u8]) -> Result<Self, SchemaError> {
        let mut list = CollectionSchemeList::default();
        let mut pos = 0usize;
        while pos < buf.len() {
            let (field, wire) = read_tag(buf, &mut pos)?;
            match (field, wire) {
                (1, WIRE_LEN) => {
                    let inner = read_len_delim(buf, &mut pos)?;
                    list.schemes.push(decode_scheme(inner)?);
                }
                (_, w) => skip_field(buf, &mut pos, w)?,
            }
        }
        Ok(list)
    }
}

fn decode_scheme(buf: &[u8]) -> Result<CollectionScheme, SchemaError> {
    let mut scheme = CollectionScheme {
        scheme_id: String::new(),
        manifest_id: String::new(),
        start_time_ms: 0,
        expiry_time_ms: 0,
        after_duration_ms: 0,
        include_dtcs: false,
        persist_collected_data: false,
        compress_collected_data: false,
        priority: 0,
        minimum_trigger_interval_ms: 0,
        trigger_mode: TriggerMode::Always,
        condition: ExpressionArena::always_true(),
        signals: Vec::new(),
        fetch_informations: Vec::new(),
    };
    let mut saw_policy = false;
    let mut pos = 0usize;
    while pos < buf.len() {
        let (field, wire) = read_tag(buf, &mut pos)?;
        match (field, wire) {
            (1, WIRE_LEN) => scheme.scheme_id = read_string(buf, &mut pos)?,
            (2, WIRE_LEN) => scheme.manifest_id = read_string(buf, &mut pos)?,
            (3, WIRE_VARINT) => scheme.start_time_ms = read_varint(buf, &mut pos)?,
            (4, WIRE_VARINT) => scheme.expiry_time_ms = read_varint(buf, &mut pos)?,
            (5, WIRE_VARINT) => scheme.after_duration_ms = read_varint(buf, &mut pos)? as u32,
            (6, WIRE_VARINT) => scheme.include_dtcs = read_varint(buf, &mut pos)? != 0,
            (7, WIRE_VARINT) => scheme.persist_collected_data = read_varint(buf, &mut pos)? != 0,
            (8, WIRE_VARINT) => scheme.compress_collected_data = read_varint(buf, &mut pos)? != 0,
            (9, WIRE_VARINT) => scheme.priority = read_varint(buf, &mut pos)? as u32,
            (10, WIRE_LEN) => {
                let inner = read_len_delim(buf, &mut pos)?;
                // Time-based schemes compile to an always-true condition
                // fired at the configured period.
                scheme.minimum_trigger_interval_ms = decode_time_based(inner)?;
                scheme.condition = ExpressionArena::always_true();
                scheme.trigger_mode = TriggerMode::Always;
                saw_policy = true;
            }
            (11, WIRE_LEN) => {
                let inner = read_len_delim(buf, &mut pos)?;
                decode_condition_based(inner, &mut scheme)?;
                saw_policy = true;
            }
            (12, WIRE_LEN) => {
                let inner = read_len_delim(buf, &mut pos)?;
                scheme.signals.push(decode_signal_information(inner)?);
            }
            (13, WIRE_LEN) => {
                let inner = read_len_delim(buf, &mut pos)?;
                scheme.fetch_informations.push(decode_fetch_information(inner)?);
            }
            (_, w) => skip_field(buf, &mut pos, w)?,
        }
    }
    validate_scheme(&scheme, saw_policy)?;
    Ok(scheme)
}

fn validate_scheme(scheme: &CollectionScheme, saw_policy: bool) -> Result<(), SchemaError> {
    let invalid = |reason: &str| SchemaError::InvalidScheme {
        scheme_id: scheme.scheme_id.clone(),
        reason: reason.to_string(),
    };
    if scheme.scheme_id.is_empty() {
        return Err(invalid("missing campaign sync id"));
    }
    if scheme.manifest_id.is_empty() {
        return Err(invalid("missing decoder manifest sync id"));
    }
    if scheme.start_time_ms >= scheme.expiry_time_ms {
        return Err(invalid("start time is not before expiry time"));
    }
    if !saw_policy {
        return Err(invalid("neither time-based nor condition-based policy"));
    }
    Ok(())
}

fn decode_time_based(buf: &[u8]) -> Result<u32, SchemaError> {
    let mut pos = 0usize;
    let mut period_ms = 0u32;
    while pos < buf.len() {
        let (field, wire) = read_tag(buf, &mut pos)?;
        match (field, wire) {
            (1, WIRE_VARINT) => period_ms = read_varint(buf, &mut pos)? as u32,
            (_, w) => skip_field(buf, &mut pos, w)?,
        }
    }
    if period_ms == 0 {
        return Err(SchemaError::Malformed("time-based policy without period"));
    }
    Ok(period_ms)
}

fn decode_condition_based(buf: &[u8], scheme: &mut CollectionScheme) -> Result<(), SchemaError> {
    let mut pos = 0usize;
    let mut saw_tree = false;
    while pos < buf.len() {
        let (field, wire) = read_tag(buf, &mut pos)?;
        match (field, wire) {
            (1, WIRE_VARINT) => {
                scheme.minimum_trigger_interval_ms = read_varint(buf, &mut pos)? as u32
            }
            (2, WIRE_VARINT) => {
                // language_version: accepted and ignored, only version 1 exists.
                read_varint(buf, &mut pos)?;
            }
            (3, WIRE_VARINT) => {
                scheme.trigger_mode = if read_varint(buf, &mut pos)? == 1 {
                    TriggerMode::RisingEdge
                } else {
                    TriggerMode::Always
                };
            }
            (4, WIRE_LEN) => {
                let tree = read_len_delim(buf, &mut pos)?;
                let mut arena = ExpressionArena::default();
                arena.root = condition::decode_node(tree, &mut arena)?;
                scheme.condition = arena;
                saw_tree = true;
            }
            (_, w) => skip_field(buf, &mut pos, w)?,
        }
    }
    if !saw_tree {
        return Err(SchemaError::Malformed("condition-based policy without tree"));
    }
    Ok(())
}

fn decode_signal_information(buf: &[u8]) -> Result<SignalInformation, SchemaError> {
    let mut info = SignalInformation::default();
    let mut pos = 0usize;
    while pos < buf.len() {
        let (field, wire) = read_tag(buf, &mut pos)?;
        match (field, wire) {
            (1, WIRE_VARINT) => info.signal_id = read_varint(buf, &mut pos)? as SignalId,
            (2, WIRE_VARINT) => info.sample_buffer_size = read_varint(buf, &mut pos)? as u32,
            (3, WIRE_VARINT) => {
                info.minimum_sample_interval_ms = read_varint(buf, &mut pos)? as u32
            }
            (4, WIRE_VARINT) => info.fixed_window_period_ms = read_varint(buf, &mut pos)? as u32,
            (5, WIRE_VARINT) => info.condition_only = read_varint(buf, &mut pos)? != 0,
            (6, WIRE_VARINT) => info.data_partition_id = read_varint(buf, &mut pos)? as u32,
            (7, w) => read_repeated_u32(buf, &mut pos, w, &mut info.signal_path)?,
            (_, w) => skip_field(buf, &mut pos, w)?,
        }
    }
    Ok(info)
}

fn decode_fetch_information(buf: &[u8]) -> Result<FetchInformation, SchemaError> {
    let mut target_signal_id = 0;
    let mut trigger: Option<FetchTrigger> = None;
    let mut condition: Option<ExpressionArena> = None;
    let mut rising_edge_only = false;
    let mut actions = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let (field, wire) = read_tag(buf, &mut pos)?;
        match (field, wire) {
            (1, WIRE_VARINT) => target_signal_id = read_varint(buf, &mut pos)? as SignalId,
            (2, WIRE_LEN) => {
                let inner = read_len_delim(buf, &mut pos)?;
                trigger = Some(decode_fetch_time_trigger(inner)?);
            }
            (3, WIRE_LEN) => {
                let tree = read_len_delim(buf, &mut pos)?;
                let mut arena = ExpressionArena::default();
                arena.root = condition::decode_node(tree, &mut arena)?;
                condition = Some(arena);
            }
            (4, WIRE_VARINT) => rising_edge_only = read_varint(buf, &mut pos)? != 0,
            (5, WIRE_LEN) => {
                let inner = read_len_delim(buf, &mut pos)?;
                actions.push(decode_fetch_action(inner)?);
            }
            (_, w) => skip_field(buf, &mut pos, w)?,
        }
    }
    let trigger = match (trigger, condition) {
        (Some(t), _) => t,
        (None, Some(condition)) => FetchTrigger::Condition {
            condition,
            rising_edge_only,
        },
        (None, None) => return Err(SchemaError::Malformed("fetch directive without trigger")),
    };
    if actions.is_empty() {
        return Err(SchemaError::Malformed("fetch directive without actions"));
    }
    Ok(FetchInformation {
        target_signal_id,
        trigger,
        actions,
    })
}

fn decode_fetch_time_trigger(buf: &[u8]) -> Result<FetchTrigger, SchemaError> {
    let mut max_executions = u64::MAX;
    let mut period_ms = 0;
    let mut reset_window_ms = 0;
    let mut pos = 0usize;
    while pos < buf.len() {
        let (field, wire) = read_tag(buf, &mut pos)?;
        match (field, wire) {
            (1, WIRE_VARINT) => max_executions = read_varint(buf, &mut pos)?,
            (2, WIRE_VARINT) => period_ms = read_varint(buf, &mut pos)?,
            (3, WIRE_VARINT) => reset_window_ms = read_varint(buf, &mut pos)?,
            (_, w) => skip_field(buf, &mut pos, w)?,
        }
    }
    if period_ms == 0 {
        return Err(SchemaError::Malformed("time fetch trigger without period"));
    }
    Ok(FetchTrigger::Time {
        max_executions,
        period_ms,
        reset_window_ms,
    })
}

fn decode_fetch_action(buf: &[u8]) -> Result<FetchAction, SchemaError> {
    let mut function_name = String::new();
    let mut params = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let (field, wire) = read_tag(buf, &mut pos)?;
        match (field, wire) {
            (1, WIRE_LEN) => function_name = read_string(buf, &mut pos)?,
            (2, WIRE_FIXED64) => params.push(read_double(buf, &mut pos)?),
            (_, w) => skip_field(buf, &mut pos, w)?,
        }
    }
    if function_name.is_empty() {
        return Err(SchemaError::Malformed("fetch action without function name"));
    }
    Ok(FetchAction {
        function_name,
        params,
    })
}

/// Test-side encoders for synthesizing cloud scheme documents.
pub mod encode {
    use super::*;
    use crate::condition::encode::Node;

    /// Scheme builder mirroring the wire layout.
    #[derive(Debug, Clone)]
    pub struct SchemeSpec {
        pub scheme_id: String,
        pub manifest_id: String,
        pub start_time_ms: Timestamp,
        pub expiry_time_ms: Timestamp,
        pub after_duration_ms: u32,
        pub include_dtcs: bool,
        pub persist: bool,
        pub compress: bool,
        pub priority: u32,
        pub policy: PolicySpec,
        pub signals: Vec<SignalInformation>,
        pub fetch: Vec<FetchSpec>,
    }

    #[derive(Debug, Clone)]
    pub enum PolicySpec {
        TimeBased { period_ms: u32 },
        ConditionBased {
            minimum_interval_ms: u32,
            mode: TriggerMode,
            tree: Node,
        },
    }

    #[derive(Debug, Clone)]
    pub enum FetchSpec {
        Time {
            target_signal_id: SignalId,
            max_executions: u64,
            period_ms: u64,
            reset_window_ms: u64,
            actions: Vec<FetchAction>,
        },
        Condition {
            target_signal_id: SignalId,
            tree: Node,
            rising_edge_only: bool,
            actions: Vec<FetchAction>,
        },
    }

    impl SchemeSpec {
        pub fn new(scheme_id: &str, manifest_id: &str, start: Timestamp, expiry: Timestamp) -> Self {
            Self {
                scheme_id: scheme_id.to_string(),
                manifest_id: manifest_id.to_string(),
                start_time_ms: start,
                expiry_time_ms: expiry,
                after_duration_ms: 0,
                include_dtcs: false,
                persist: false,
                compress: false,
                priority: 0,
                policy: PolicySpec::TimeBased { period_ms: 1000 },
                signals: Vec::new(),
                fetch: Vec::new(),
            }
        }

        pub fn with_signal(mut self, info: SignalInformation) -> Self {
            self.signals.push(info);
            self
        }
    }

    pub fn list_to_bytes(specs: &[SchemeSpec]) -> Vec<u8> {
        let mut buf = Vec::new();
        for spec in specs {
            proto::write_message_field(&mut buf, 1, |inner| encode_scheme(spec, inner));
        }
        buf
    }

    fn encode_scheme(spec: &SchemeSpec, buf: &mut Vec<u8>) {
        proto::write_string_field(buf, 1, &spec.scheme_id);
        proto::write_string_field(buf, 2, &spec.manifest_id);
        proto::write_uint_field(buf, 3, spec.start_time_ms);
        proto::write_uint_field(buf, 4, spec.expiry_time_ms);
        proto::write_uint_field(buf, 5, u64::from(spec.after_duration_ms));
        proto::write_bool_field(buf, 6, spec.include_dtcs);
        proto::write_bool_field(buf, 7, spec.persist);
        proto::write_bool_field(buf, 8, spec.compress);
        proto::write_uint_field(buf, 9, u64::from(spec.priority));
        match &spec.policy {
            PolicySpec::TimeBased { period_ms } => {
                proto::write_message_field(buf, 10, |inner| {
                    proto::write_uint_field(inner, 1, u64::from(*period_ms));
                });
            }
            PolicySpec::ConditionBased {
                minimum_interval_ms,
                mode,
                tree,
            } => {
                proto::write_message_field(buf, 11, |inner| {
                    proto::write_uint_field(inner, 1, u64::from(*minimum_interval_ms));
                    proto::write_uint_field(inner, 2, 1);
                    proto::write_uint_field(
                        inner,
                        3,
                        u64::from(*mode == TriggerMode::RisingEdge),
                    );
                    proto::write_message_field(inner, 4, |tree_buf| {
                        condition::encode::encode_node(tree, tree_buf)
                    });
                });
            }
        }
        for info in &spec.signals {
            proto::write_message_field(buf, 12, |inner| {
                proto::write_uint_field(inner, 1, u64::from(info.signal_id));
                proto::write_uint_field(inner, 2, u64::from(info.sample_buffer_size));
                proto::write_uint_field(inner, 3, u64::from(info.minimum_sample_interval_ms));
                proto::write_uint_field(inner, 4, u64::from(info.fixed_window_period_ms));
                proto::write_bool_field(inner, 5, info.condition_only);
                proto::write_uint_field(inner, 6, u64::from(info.data_partition_id));
                for step in &info.signal_path {
                    proto::write_uint_field(inner, 7, u64::from(*step));
                }
            });
        }
        for fetch in &spec.fetch {
            proto::write_message_field(buf, 13, |inner| encode_fetch(fetch, inner));
        }
    }

    fn encode_fetch(spec: &FetchSpec, buf: &mut Vec<u8>) {
        match spec {
            FetchSpec::Time {
                target_signal_id,
                max_executions,
                period_ms,
                reset_window_ms,
                actions,
            } => {
                proto::write_uint_field(buf, 1, u64::from(*target_signal_id));
                proto::write_message_field(buf, 2, |inner| {
                    proto::write_uint_field(inner, 1, *max_executions);
                    proto::write_uint_field(inner, 2, *period_ms);
                    proto::write_uint_field(inner, 3, *reset_window_ms);
                });
                encode_actions(actions, buf);
            }
            FetchSpec::Condition {
                target_signal_id,
                tree,
                rising_edge_only,
                actions,
            } => {
                proto::write_uint_field(buf, 1, u64::from(*target_signal_id));
                proto::write_message_field(buf, 3, |inner| {
                    condition::encode::encode_node(tree, inner)
                });
                proto::write_bool_field(buf, 4, *rising_edge_only);
                encode_actions(actions, buf);
            }
        }
    }

    fn encode_actions(actions: &[FetchAction], buf: &mut Vec<u8>) {
        for action in actions {
            proto::write_message_field(buf, 5, |inner| {
                proto::write_string_field(inner, 1, &action.function_name);
                for p in &action.params {
                    proto::write_double_field(inner, 2, *p);
                }
            });
        }
    }
}
