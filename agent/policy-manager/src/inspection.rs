//! Inspection matrix: the compiled runtime form of the active trigger
//! conditions, plus the per-signal windowing parameters the sample store
//! needs.

use std::collections::HashMap;

use cloud_schema::{
    CollectionScheme, ExpressionArena, SchemaError, SyncId, TriggerMode,
};
use signal_core::SignalId;
use tracing::warn;

use crate::dictionary::PartialSignalAllocator;

/// Windowing and buffering requirements of one signal inside one condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSpec {
    pub signal_id: SignalId,
    pub sample_buffer_size: u32,
    pub minimum_sample_interval_ms: u32,
    pub fixed_window_period_ms: u32,
    pub condition_only: bool,
}

/// One compiled trigger condition.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectionCondition {
    pub scheme_id: SyncId,
    pub condition: ExpressionArena,
    pub minimum_trigger_interval_ms: u32,
    pub trigger_mode: TriggerMode,
    pub after_duration_ms: u32,
    pub include_dtcs: bool,
    pub priority: u32,
    pub persist: bool,
    pub compress: bool,
    /// Ordered set of signals this condition needs buffered.
    pub signals: Vec<SignalSpec>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InspectionMatrix {
    pub conditions: Vec<InspectionCondition>,
}

impl InspectionMatrix {
    pub fn any_condition_includes_dtcs(&self) -> bool {
        self.conditions.iter().any(|c| c.include_dtcs)
    }

    /// Smallest trigger interval across conditions, used as the engine tick.
    pub fn minimum_trigger_interval_ms(&self) -> Option<u32> {
        self.conditions
            .iter()
            .map(|c| c.minimum_trigger_interval_ms.max(1))
            .min()
    }

    /// Ring size required per signal: the maximum buffer size any condition
    /// demands for it.
    pub fn required_buffer_sizes(&self) -> HashMap<SignalId, u32> {
        let mut sizes: HashMap<SignalId, u32> = HashMap::new();
        for condition in &self.conditions {
            for spec in &condition.signals {
                let entry = sizes.entry(spec.signal_id).or_insert(0);
                *entry = (*entry).max(spec.sample_buffer_size.max(1));
            }
        }
        sizes
    }
}

/// Compiles the in-sync enabled schemes into an inspection matrix.
///
/// A scheme demanding a `fixed_window_period_ms` that contradicts what an
/// earlier scheme registered for the same signal is excluded entirely and
/// counted as a schema error.
pub fn extract_inspection_matrix(
    schemes: &[&CollectionScheme],
    allocator: &mut PartialSignalAllocator,
) -> InspectionMatrix {
    let mut matrix = InspectionMatrix::default();
    let mut window_periods: HashMap<SignalId, u32> = HashMap::new();

    'schemes: for scheme in schemes {
        let mut signals = Vec::with_capacity(scheme.signals.len());
        for info in &scheme.signals {
            let signal_id = if info.signal_path.is_empty() {
                info.signal_id
            } else {
                match allocator.lookup(info.signal_id, &info.signal_path) {
                    Some(internal) => internal,
                    // Partial reference that the dictionary extractor
                    // rejected (e.g. parent is not complex).
                    None => continue,
                }
            };
            if info.fixed_window_period_ms > 0 {
                match window_periods.get(&signal_id) {
                    Some(&existing) if existing != info.fixed_window_period_ms => {
                        let err = SchemaError::InconsistentWindow {
                            signal_id,
                            existing_ms: existing,
                            requested_ms: info.fixed_window_period_ms,
                        };
                        warn!(scheme_id = %scheme.scheme_id, %err, "excluding scheme");
                        metrics::counter!("canflux.policy.schema_errors").increment(1);
                        continue 'schemes;
                    }
                    _ => {
                        window_periods.insert(signal_id, info.fixed_window_period_ms);
                    }
                }
            }
            signals.push(SignalSpec {
                signal_id,
                sample_buffer_size: info.sample_buffer_size.max(1),
                minimum_sample_interval_ms: info.minimum_sample_interval_ms,
                fixed_window_period_ms: info.fixed_window_period_ms,
                condition_only: info.condition_only,
            });
        }

        matrix.conditions.push(InspectionCondition {
            scheme_id: scheme.scheme_id.clone(),
            condition: scheme.condition.clone(),
            minimum_trigger_interval_ms: scheme.minimum_trigger_interval_ms,
            trigger_mode: scheme.trigger_mode,
            after_duration_ms: scheme.after_duration_ms,
            include_dtcs: scheme.include_dtcs,
            priority: scheme.priority,
            persist: scheme.persist_collected_data,
            compress: scheme.compress_collected_data,
            signals,
        });
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_schema::condition::encode::Node;
    use cloud_schema::schemes::encode::{PolicySpec, SchemeSpec};
    use cloud_schema::schemes::SignalInformation;
    use cloud_schema::CollectionSchemeList;

    fn decode_scheme(spec: SchemeSpec) -> CollectionScheme {
        let bytes = cloud_schema::schemes::encode::list_to_bytes(&[spec]);
        CollectionSchemeList::decode(&bytes).unwrap().schemes.remove(0)
    }

    fn scheme(name: &str, signal: SignalId, window_ms: u32, buffer: u32) -> CollectionScheme {
        let mut spec = SchemeSpec::new(name, "DM1", 0, u64::MAX).with_signal(SignalInformation {
            signal_id: signal,
            sample_buffer_size: buffer,
            fixed_window_period_ms: window_ms,
            ..Default::default()
        });
        spec.policy = PolicySpec::ConditionBased {
            minimum_interval_ms: 500,
            mode: TriggerMode::Always,
            tree: Node::signal_greater(signal, 0.0),
        };
        decode_scheme(spec)
    }

    #[test]
    fn merges_buffer_sizes_to_maximum() {
        let a = scheme("a", 5, 0, 10);
        let b = scheme("b", 5, 0, 3);
        let mut allocator = PartialSignalAllocator::default();
        let matrix = extract_inspection_matrix(&[&a, &b], &mut allocator);
        assert_eq!(matrix.conditions.len(), 2);
        assert_eq!(matrix.required_buffer_sizes().get(&5), Some(&10));
        assert_eq!(matrix.minimum_trigger_interval_ms(), Some(500));
    }

    #[test]
    fn conflicting_window_periods_exclude_the_later_scheme() {
        let a = scheme("a", 5, 100, 1);
        let b = scheme("b", 5, 250, 1);
        let mut allocator = PartialSignalAllocator::default();
        let matrix = extract_inspection_matrix(&[&a, &b], &mut allocator);
        assert_eq!(matrix.conditions.len(), 1);
        assert_eq!(matrix.conditions[0].scheme_id, "a");
    }

    #[test]
    fn equal_window_periods_coexist() {
        let a = scheme("a", 5, 100, 1);
        let b = scheme("b", 5, 100, 1);
        let mut allocator = PartialSignalAllocator::default();
        let matrix = extract_inspection_matrix(&[&a, &b], &mut allocator);
        assert_eq!(matrix.conditions.len(), 2);
    }

    #[test]
    fn dtc_flag_aggregates_across_conditions() {
        let a = scheme("a", 5, 0, 1);
        let mut spec = SchemeSpec::new("b", "DM1", 0, u64::MAX);
        spec.include_dtcs = true;
        let b = decode_scheme(spec);
        let mut allocator = PartialSignalAllocator::default();
        let matrix = extract_inspection_matrix(&[&a, &b], &mut allocator);
        assert!(matrix.any_condition_includes_dtcs());
    }

    #[test]
    fn empty_matrix_has_no_tick() {
        let matrix = InspectionMatrix::default();
        assert_eq!(matrix.minimum_trigger_interval_ms(), None);
        assert!(!matrix.any_condition_includes_dtcs());
    }
}
