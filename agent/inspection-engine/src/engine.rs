//! Trigger engine: consumes the signal buffer, evaluates conditions on a
//! periodic tick, detects edges and assembles telemetry payloads.

use std::sync::Arc;
use std::time::Duration;

use cloud_schema::{TelemetryPayload, TelemetrySignal, TriggerMode};
use policy_manager::{FetchMatrix, InspectionMatrix};
use signal_core::{Clock, CollectedFrame, SignalBufferRx, Timestamp};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::eval::{evaluate_as_trigger, CustomFunctionRegistry};
use crate::fetch::{FetchRequest, FetchScheduler};
use crate::store::SampleStore;

/// Tick used while no condition is active.
const IDLE_TICK_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, Default)]
struct ConditionState {
    last_result: Option<bool>,
    last_fire_monotonic_ms: Option<u64>,
}

/// A fired condition waiting out its after-duration before the payload is
/// assembled, so samples arriving after the trigger are included.
struct PendingEvent {
    matrix: Arc<InspectionMatrix>,
    condition_index: usize,
    event_id: u32,
    fire_time_ms: Timestamp,
    due_time_ms: Timestamp,
}

pub struct TriggerEngine {
    clock: Arc<dyn Clock>,
    buffer_rx: SignalBufferRx,
    inspection_rx: watch::Receiver<Arc<InspectionMatrix>>,
    fetch_rx: watch::Receiver<Arc<FetchMatrix>>,
    payload_tx: mpsc::Sender<TelemetryPayload>,
    fetch_tx: mpsc::Sender<FetchRequest>,
    registry: Arc<CustomFunctionRegistry>,
    shutdown: watch::Receiver<bool>,

    store: SampleStore,
    matrix: Arc<InspectionMatrix>,
    condition_states: Vec<ConditionState>,
    fetch_scheduler: FetchScheduler,
    pending_events: Vec<PendingEvent>,
    event_counter: u32,
}

impl TriggerEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        buffer_rx: SignalBufferRx,
        inspection_rx: watch::Receiver<Arc<InspectionMatrix>>,
        fetch_rx: watch::Receiver<Arc<FetchMatrix>>,
        payload_tx: mpsc::Sender<TelemetryPayload>,
        fetch_tx: mpsc::Sender<FetchRequest>,
        registry: Arc<CustomFunctionRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            clock,
            buffer_rx,
            inspection_rx,
            fetch_rx,
            payload_tx,
            fetch_tx,
            registry,
            shutdown,
            store: SampleStore::default(),
            matrix: Arc::new(InspectionMatrix::default()),
            condition_states: Vec::new(),
            fetch_scheduler: FetchScheduler::default(),
            pending_events: Vec::new(),
            event_counter: 0,
        }
    }

    pub async fn run(mut self) {
        info!("trigger engine started");
        self.apply_matrix();
        self.apply_fetch_matrix();

        let mut next_tick = tokio::time::Instant::now() + Duration::from_millis(self.tick_ms());
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                frame = self.buffer_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            self.ingest(frame);
                            let mut ready = Vec::new();
                            self.buffer_rx.drain_ready(&mut ready);
                            for frame in ready {
                                self.ingest(frame);
                            }
                        }
                        None => {
                            debug!("signal buffer closed, trigger engine exiting");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(next_tick) => {
                    self.tick();
                    next_tick = tokio::time::Instant::now()
                        + Duration::from_millis(self.tick_ms());
                }
                changed = self.inspection_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.apply_matrix();
                    next_tick = tokio::time::Instant::now()
                        + Duration::from_millis(self.tick_ms());
                }
                changed = self.fetch_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.apply_fetch_matrix();
                }
                _ = self.shutdown.changed() => break,
            }
        }
        info!("trigger engine stopped");
    }

    fn tick_ms(&self) -> u64 {
        self.matrix
            .minimum_trigger_interval_ms()
            .map_or(IDLE_TICK_MS, u64::from)
    }

    fn apply_matrix(&mut self) {
        let matrix = self.inspection_rx.borrow_and_update().clone();
        info!(conditions = matrix.conditions.len(), "inspection matrix updated");
        self.store.reconfigure(&matrix);
        self.condition_states = vec![ConditionState::default(); matrix.conditions.len()];
        self.matrix = matrix;
    }

    fn apply_fetch_matrix(&mut self) {
        let matrix = self.fetch_rx.borrow_and_update().clone();
        debug!(directives = matrix.directives.len(), "fetch matrix updated");
        self.fetch_scheduler.apply(matrix);
    }

    fn ingest(&mut self, frame: CollectedFrame) {
        match frame {
            CollectedFrame::Signals(samples) => {
                for sample in samples {
                    self.store.insert(sample);
                }
            }
            CollectedFrame::Dtcs(info) => {
                self.store.set_dtcs(info);
            }
        }
    }

    /// One evaluation pass over all conditions plus fetch scheduling and
    /// delivery of due events.
    fn tick(&mut self) {
        let now_wall = self.clock.system_time_ms();
        let now_monotonic = self.clock.monotonic_ms();
        self.store.advance_windows(now_wall);

        for index in 0..self.matrix.conditions.len() {
            let condition = &self.matrix.conditions[index];
            let state = &mut self.condition_states[index];

            // Per-condition rate limit between triggers.
            if let Some(last_fire) = state.last_fire_monotonic_ms {
                if now_monotonic.saturating_sub(last_fire)
                    < u64::from(condition.minimum_trigger_interval_ms)
                {
                    continue;
                }
            }

            let result = evaluate_as_trigger(&condition.condition, &self.store, &self.registry);
            let fires = match condition.trigger_mode {
                TriggerMode::Always => result,
                TriggerMode::RisingEdge => result && !state.last_result.unwrap_or(false),
            };
            state.last_result = Some(result);

            if fires {
                state.last_fire_monotonic_ms = Some(now_monotonic);
                self.event_counter = self.event_counter.wrapping_add(1);
                trace!(
                    scheme_id = %condition.scheme_id,
                    event_id = self.event_counter,
                    after_duration_ms = condition.after_duration_ms,
                    "condition fired"
                );
                self.pending_events.push(PendingEvent {
                    matrix: Arc::clone(&self.matrix),
                    condition_index: index,
                    event_id: self.event_counter,
                    fire_time_ms: now_wall,
                    due_time_ms: now_wall + u64::from(condition.after_duration_ms),
                });
            }
        }

        let requests = self.fetch_scheduler.tick(now_wall, &self.store, &self.registry);
        for request in requests {
            if self.fetch_tx.try_send(request).is_err() {
                metrics::counter!("canflux.inspection.fetch_drops").increment(1);
            }
        }

        self.flush_due_events(now_wall);
    }

    /// Assembles and enqueues payloads whose after-duration elapsed.
    /// Simultaneously due events go out in descending priority, ties broken
    /// by scheme id.
    fn flush_due_events(&mut self, now_wall: Timestamp) {
        if self.pending_events.is_empty() {
            return;
        }
        let mut due: Vec<PendingEvent> = Vec::new();
        let mut remaining: Vec<PendingEvent> = Vec::new();
        for event in self.pending_events.drain(..) {
            if event.due_time_ms <= now_wall {
                due.push(event);
            } else {
                remaining.push(event);
            }
        }
        self.pending_events = remaining;

        due.sort_by(|a, b| {
            let pa = a.matrix.conditions[a.condition_index].priority;
            let pb = b.matrix.conditions[b.condition_index].priority;
            pb.cmp(&pa).then_with(|| {
                a.matrix.conditions[a.condition_index]
                    .scheme_id
                    .cmp(&b.matrix.conditions[b.condition_index].scheme_id)
            })
        });

        for event in due {
            let payload = self.assemble_payload(&event);
            trace!(
                scheme_id = %payload.scheme_id,
                signals = payload.signals.len(),
                "enqueueing payload"
            );
            if self.payload_tx.try_send(payload).is_err() {
                metrics::counter!("canflux.inspection.payload_drops").increment(1);
                warn!("outbound payload queue full, dropping newest payload");
            }
        }
    }

    fn assemble_payload(&self, event: &PendingEvent) -> TelemetryPayload {
        let condition = &event.matrix.conditions[event.condition_index];
        let mut signals = Vec::new();
        for spec in &condition.signals {
            if spec.condition_only {
                continue;
            }
            for sample in self
                .store
                .recent(spec.signal_id, spec.sample_buffer_size.max(1) as usize)
            {
                signals.push(TelemetrySignal {
                    signal_id: sample.signal_id,
                    timestamp_ms: sample.timestamp_ms,
                    value: sample.value.as_f64(),
                });
            }
        }
        let dtcs = if condition.include_dtcs {
            Some(
                self.store
                    .latest_dtcs()
                    .map(|info| info.codes.clone())
                    .unwrap_or_default(),
            )
        } else {
            None
        };
        TelemetryPayload {
            scheme_id: condition.scheme_id.clone(),
            event_id: event.event_id,
            event_time_ms: event.fire_time_ms,
            signals,
            dtcs,
            persist: condition.persist,
            compress: condition.compress,
        }
    }
}
