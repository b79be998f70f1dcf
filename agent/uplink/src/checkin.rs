//! Checkin emitter: periodically acknowledges the schema documents the
//! agent currently holds.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cloud_schema::{encode_checkin, SyncId};
use signal_core::Clock;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::CloudSink;

pub struct CheckinSender {
    clock: Arc<dyn Clock>,
    sink: Arc<dyn CloudSink>,
    /// Latest document set published by the policy manager.
    documents_rx: watch::Receiver<Vec<SyncId>>,
    interval_ms: u64,
    shutdown: watch::Receiver<bool>,
}

impl CheckinSender {
    pub fn new(
        clock: Arc<dyn Clock>,
        sink: Arc<dyn CloudSink>,
        documents_rx: watch::Receiver<Vec<SyncId>>,
        interval_ms: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            clock,
            sink,
            documents_rx,
            interval_ms,
            shutdown,
        }
    }

    /// Sends a checkin at most once per interval; a document change wakes the
    /// loop but the rate limit still applies.
    pub async fn run(mut self) {
        info!(interval_ms = self.interval_ms, "checkin sender started");
        let interval = self.interval_ms.max(1);
        let mut last_sent_ms: Option<u64> = None;

        loop {
            let now = self.clock.monotonic_ms();
            let due_in = match last_sent_ms {
                None => 0,
                Some(last) => interval.saturating_sub(now.saturating_sub(last)),
            };

            if due_in == 0 {
                self.send_checkin().await;
                last_sent_ms = Some(self.clock.monotonic_ms());
                continue;
            }

            tokio::select! {
                changed = self.documents_rx.changed() => {
                    if changed.is_err() {
                        debug!("policy manager gone, checkin sender exiting");
                        return;
                    }
                    trace!("checkin documents changed");
                }
                _ = tokio::time::sleep(Duration::from_millis(due_in)) => {}
                _ = self.shutdown.changed() => {
                    debug!("checkin sender stopping");
                    return;
                }
            }
        }
    }

    async fn send_checkin(&mut self) {
        let documents = self.documents_rx.borrow_and_update().clone();
        let payload = encode_checkin(self.clock.system_time_ms(), &documents);
        match self.sink.send_checkin(Bytes::from(payload)).await {
            Ok(()) => {
                trace!(documents = documents.len(), "checkin sent");
                metrics::counter!("canflux.uplink.checkins_sent").increment(1);
            }
            Err(e) => {
                debug!(error = %e, "checkin send failed");
                metrics::counter!("canflux.uplink.checkin_failures").increment(1);
            }
        }
    }
}
