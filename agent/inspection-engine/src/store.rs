//! Per-signal sample rings and fixed-window aggregates.
//!
//! Ring sizes follow the inspection matrix: each signal's capacity is the
//! largest buffer any active condition demands. Samples arriving faster
//! than the merged minimum sample interval are thinned out before they
//! reach the ring.

use std::collections::HashMap;

use policy_manager::InspectionMatrix;
use signal_core::{DtcInfo, Sample, SignalId, Timestamp};
use std::collections::VecDeque;

/// Aggregates of one closed or accumulating window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowAggregate {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u32,
}

impl WindowAggregate {
    fn new() -> Self {
        WindowAggregate {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            count: 0,
        }
    }

    fn add(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }

    pub fn avg(&self) -> f64 {
        self.sum / f64::from(self.count)
    }
}

/// Fixed-period window accumulator: one open window plus the two most
/// recently closed ones.
#[derive(Debug, Clone)]
struct WindowState {
    period_ms: u64,
    current_bucket: Option<u64>,
    current: WindowAggregate,
    last: Option<WindowAggregate>,
    prev: Option<WindowAggregate>,
}

impl WindowState {
    fn new(period_ms: u64) -> Self {
        WindowState {
            period_ms,
            current_bucket: None,
            current: WindowAggregate::new(),
            last: None,
            prev: None,
        }
    }

    /// Closes windows up to the bucket containing `now_ms`.
    fn advance(&mut self, now_ms: Timestamp) {
        let bucket = now_ms / self.period_ms;
        let Some(mut current_bucket) = self.current_bucket else {
            self.current_bucket = Some(bucket);
            return;
        };
        while current_bucket < bucket {
            self.prev = self.last.take();
            self.last = if self.current.count > 0 {
                Some(self.current)
            } else {
                None
            };
            self.current = WindowAggregate::new();
            current_bucket += 1;
        }
        self.current_bucket = Some(current_bucket);
    }

    fn add(&mut self, timestamp_ms: Timestamp, value: f64) {
        self.advance(timestamp_ms);
        self.current.add(value);
    }
}

struct SignalRing {
    samples: VecDeque<Sample>,
    capacity: usize,
    min_sample_interval_ms: u64,
    last_accepted_ms: Option<Timestamp>,
    window: Option<WindowState>,
}

impl SignalRing {
    fn new(capacity: usize, min_sample_interval_ms: u64, window_period_ms: u64) -> Self {
        SignalRing {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            min_sample_interval_ms,
            last_accepted_ms: None,
            window: if window_period_ms > 0 {
                Some(WindowState::new(window_period_ms))
            } else {
                None
            },
        }
    }

    fn insert(&mut self, sample: Sample) -> bool {
        if let Some(last) = self.last_accepted_ms {
            if self.min_sample_interval_ms > 0
                && sample.timestamp_ms.saturating_sub(last) < self.min_sample_interval_ms
            {
                return false;
            }
        }
        self.last_accepted_ms = Some(sample.timestamp_ms);
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        if let Some(window) = &mut self.window {
            window.add(sample.timestamp_ms, sample.value.as_f64());
        }
        true
    }
}

/// The engine's view of all buffered data.
#[derive(Default)]
pub struct SampleStore {
    rings: HashMap<SignalId, SignalRing>,
    latest_dtcs: Option<DtcInfo>,
}

impl SampleStore {
    /// Re-sizes the store for a new inspection matrix. Rings for signals no
    /// longer referenced are dropped; surviving rings keep their newest
    /// samples and take the capacity the new matrix demands.
    pub fn reconfigure(&mut self, matrix: &InspectionMatrix) {
        let mut required: HashMap<SignalId, (usize, u64, u64)> = HashMap::new();
        for condition in &matrix.conditions {
            for spec in &condition.signals {
                let entry = required
                    .entry(spec.signal_id)
                    .or_insert((0, u64::MAX, 0));
                entry.0 = entry.0.max(spec.sample_buffer_size.max(1) as usize);
                entry.1 = entry.1.min(u64::from(spec.minimum_sample_interval_ms));
                if spec.fixed_window_period_ms > 0 {
                    entry.2 = u64::from(spec.fixed_window_period_ms);
                }
            }
            // Signals referenced only in the expression still need a slot
            // for their latest value.
            for signal_id in condition.condition.referenced_signals() {
                required.entry(signal_id).or_insert((1, u64::MAX, 0));
            }
        }

        self.rings.retain(|id, _| required.contains_key(id));
        for (signal_id, (capacity, min_interval, window_period)) in required {
            let min_interval = if min_interval == u64::MAX { 0 } else { min_interval };
            match self.rings.get_mut(&signal_id) {
                Some(ring) => {
                    ring.capacity = capacity;
                    while ring.samples.len() > ring.capacity {
                        ring.samples.pop_front();
                    }
                    ring.min_sample_interval_ms = min_interval;
                    if window_period == 0 {
                        ring.window = None;
                    } else if let Some(window) = &mut ring.window {
                        window.period_ms = window_period;
                    } else {
                        ring.window = Some(WindowState::new(window_period));
                    }
                }
                None => {
                    self.rings.insert(
                        signal_id,
                        SignalRing::new(capacity, min_interval, window_period),
                    );
                }
            }
        }
    }

    /// Inserts a decoded sample. Samples for unreferenced signals and
    /// samples violating the minimum interval are dropped.
    pub fn insert(&mut self, sample: Sample) -> bool {
        match self.rings.get_mut(&sample.signal_id) {
            Some(ring) => ring.insert(sample),
            None => false,
        }
    }

    pub fn set_dtcs(&mut self, dtcs: DtcInfo) {
        self.latest_dtcs = Some(dtcs);
    }

    pub fn latest_dtcs(&self) -> Option<&DtcInfo> {
        self.latest_dtcs.as_ref()
    }

    pub fn latest(&self, signal_id: SignalId) -> Option<&Sample> {
        self.rings.get(&signal_id)?.samples.back()
    }

    pub fn has_sample(&self, signal_id: SignalId) -> bool {
        self.rings
            .get(&signal_id)
            .is_some_and(|ring| !ring.samples.is_empty())
    }

    /// The most recent `count` samples, oldest first.
    pub fn recent(&self, signal_id: SignalId, count: usize) -> Vec<Sample> {
        let Some(ring) = self.rings.get(&signal_id) else {
            return Vec::new();
        };
        let skip = ring.samples.len().saturating_sub(count);
        ring.samples.iter().skip(skip).copied().collect()
    }

    /// Closes any windows whose period elapsed before `now_ms`.
    pub fn advance_windows(&mut self, now_ms: Timestamp) {
        for ring in self.rings.values_mut() {
            if let Some(window) = &mut ring.window {
                window.advance(now_ms);
            }
        }
    }

    /// `(last, prev)` closed-window aggregates of a signal.
    pub fn window_aggregates(
        &self,
        signal_id: SignalId,
    ) -> (Option<WindowAggregate>, Option<WindowAggregate>) {
        match self.rings.get(&signal_id).and_then(|r| r.window.as_ref()) {
            Some(window) => (window.last, window.prev),
            None => (None, None),
        }
    }

    pub fn ring_len(&self, signal_id: SignalId) -> usize {
        self.rings.get(&signal_id).map_or(0, |r| r.samples.len())
    }

    pub fn ring_capacity(&self, signal_id: SignalId) -> usize {
        self.rings.get(&signal_id).map_or(0, |r| r.capacity)
    }
}
