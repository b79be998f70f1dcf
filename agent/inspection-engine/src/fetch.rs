//! Fetch scheduling: turns fetch-matrix directives into fetch requests on
//! the trigger engine's tick.

use std::sync::Arc;

use cloud_schema::{FetchAction, FetchTrigger, SyncId};
use policy_manager::FetchMatrix;
use signal_core::{SignalId, Timestamp};
use tracing::trace;

use crate::eval::{evaluate_as_trigger, CustomFunctionRegistry};
use crate::store::SampleStore;

/// One request to proactively acquire a signal, handed to the configured
/// fetch consumers (OBD transactor, custom data sources).
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub scheme_id: SyncId,
    pub signal_id: SignalId,
    pub actions: Vec<FetchAction>,
}

#[derive(Debug, Default, Clone)]
struct DirectiveState {
    executions: u64,
    window_started_ms: Option<Timestamp>,
    next_due_ms: Option<Timestamp>,
    last_condition: Option<bool>,
}

/// Evaluates fetch directives against time and the sample store.
#[derive(Default)]
pub struct FetchScheduler {
    matrix: Arc<FetchMatrix>,
    states: Vec<DirectiveState>,
}

impl FetchScheduler {
    /// Installs a new fetch matrix, resetting all directive state.
    pub fn apply(&mut self, matrix: Arc<FetchMatrix>) {
        self.states = vec![DirectiveState::default(); matrix.directives.len()];
        self.matrix = matrix;
    }

    /// Returns the requests due at `now_ms`.
    pub fn tick(
        &mut self,
        now_ms: Timestamp,
        store: &SampleStore,
        registry: &CustomFunctionRegistry,
    ) -> Vec<FetchRequest> {
        let mut requests = Vec::new();
        for (directive, state) in self.matrix.directives.iter().zip(self.states.iter_mut()) {
            let fire = match &directive.info.trigger {
                FetchTrigger::Time {
                    max_executions,
                    period_ms,
                    reset_window_ms,
                } => {
                    if *reset_window_ms > 0 {
                        match state.window_started_ms {
                            Some(started) if now_ms.saturating_sub(started) >= *reset_window_ms => {
                                state.window_started_ms = Some(now_ms);
                                state.executions = 0;
                            }
                            None => state.window_started_ms = Some(now_ms),
                            _ => {}
                        }
                    }
                    if state.executions >= *max_executions {
                        false
                    } else if state.next_due_ms.is_none_or(|due| now_ms >= due) {
                        state.next_due_ms = Some(now_ms + period_ms);
                        state.executions += 1;
                        true
                    } else {
                        false
                    }
                }
                FetchTrigger::Condition {
                    condition,
                    rising_edge_only,
                } => {
                    let result = evaluate_as_trigger(condition, store, registry);
                    let fire = if *rising_edge_only {
                        result && !state.last_condition.unwrap_or(false)
                    } else {
                        result
                    };
                    state.last_condition = Some(result);
                    fire
                }
            };
            if fire {
                trace!(
                    scheme_id = %directive.scheme_id,
                    signal_id = directive.info.target_signal_id,
                    "fetch directive fired"
                );
                requests.push(FetchRequest {
                    scheme_id: directive.scheme_id.clone(),
                    signal_id: directive.info.target_signal_id,
                    actions: directive.info.actions.clone(),
                });
            }
        }
        requests
    }
}
