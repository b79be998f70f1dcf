//! Sender worker: drains the outbound payload queue and retries persisted
//! payloads while connected.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cloud_schema::{encode_telemetry, TelemetryPayload};
use signal_core::Clock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::persistence::{BlobStore, PayloadMetadata};
use crate::CloudSink;

pub struct SenderWorker {
    clock: Arc<dyn Clock>,
    sink: Arc<dyn CloudSink>,
    store: Arc<dyn BlobStore>,
    payload_rx: mpsc::Receiver<TelemetryPayload>,
    retry_interval_ms: u64,
    shutdown: watch::Receiver<bool>,
}

impl SenderWorker {
    pub fn new(
        clock: Arc<dyn Clock>,
        sink: Arc<dyn CloudSink>,
        store: Arc<dyn BlobStore>,
        payload_rx: mpsc::Receiver<TelemetryPayload>,
        retry_interval_ms: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            clock,
            sink,
            store,
            payload_rx,
            retry_interval_ms,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(retry_interval_ms = self.retry_interval_ms, "sender worker started");
        let mut uploaded_persisted_once = false;
        let mut last_retry_ms = self.clock.monotonic_ms();

        loop {
            let wait_ms = if self.retry_interval_ms > 0 {
                let elapsed = self.clock.monotonic_ms().saturating_sub(last_retry_ms);
                self.retry_interval_ms.saturating_sub(elapsed).max(1)
            } else {
                // No retry timer configured: only queue arrivals wake us.
                u64::MAX
            };

            tokio::select! {
                payload = self.payload_rx.recv() => {
                    match payload {
                        Some(payload) => self.process_payload(payload).await,
                        None => {
                            debug!("outbound queue closed, sender worker exiting");
                            return;
                        }
                    }
                }
                _ = sleep_or_forever(wait_ms) => {}
                _ = self.shutdown.changed() => {
                    debug!("sender worker stopping");
                    return;
                }
            }

            let retry_due = self.retry_interval_ms > 0
                && self.clock.monotonic_ms().saturating_sub(last_retry_ms) >= self.retry_interval_ms;
            if (!uploaded_persisted_once) || retry_due {
                last_retry_ms = self.clock.monotonic_ms();
                if self.sink.is_alive() {
                    self.retry_persisted().await;
                    uploaded_persisted_once = true;
                }
            }
        }
    }

    async fn process_payload(&self, payload: TelemetryPayload) {
        let (bytes, compressed) = encode_telemetry(&payload);
        trace!(
            scheme_id = %payload.scheme_id,
            signals = payload.signals.len(),
            bytes = bytes.len(),
            compressed,
            "sending telemetry payload"
        );
        match self.sink.send_telemetry(Bytes::from(bytes.clone())).await {
            Ok(()) => {
                metrics::counter!("canflux.uplink.payloads_sent").increment(1);
            }
            Err(e) => {
                metrics::counter!("canflux.uplink.send_failures").increment(1);
                if payload.persist {
                    let meta = PayloadMetadata {
                        scheme_id: payload.scheme_id.clone(),
                        creation_time_ms: self.clock.system_time_ms(),
                        size: bytes.len(),
                        compressed,
                    };
                    match self.store.put_payload(&meta, &bytes) {
                        Ok(id) => {
                            info!(scheme_id = %payload.scheme_id, blob = %id, error = %e,
                                  "send failed, payload persisted for retry");
                        }
                        Err(pe) => {
                            warn!(scheme_id = %payload.scheme_id, error = %pe,
                                  "send failed and payload could not be persisted");
                        }
                    }
                } else {
                    warn!(scheme_id = %payload.scheme_id, error = %e,
                          "send failed, payload discarded");
                }
            }
        }
    }

    /// Re-sends the persisted backlog oldest-first. Stops at the first
    /// failure; the remainder stays for the next tick.
    async fn retry_persisted(&self) {
        let payloads = match self.store.list_payloads() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "could not list persisted payloads");
                return;
            }
        };
        if payloads.is_empty() {
            return;
        }
        info!(count = payloads.len(), "re-sending persisted payloads");
        for (id, meta) in payloads {
            let data = match self.store.get_payload(&id) {
                Ok(data) => data,
                Err(e) => {
                    warn!(blob = %id, error = %e, "could not read persisted payload, erasing");
                    let _ = self.store.erase_payload(&id);
                    continue;
                }
            };
            match self.sink.send_telemetry(Bytes::from(data)).await {
                Ok(()) => {
                    metrics::counter!("canflux.uplink.persisted_resent").increment(1);
                    if let Err(e) = self.store.erase_payload(&id) {
                        warn!(blob = %id, error = %e, "sent but could not erase persisted payload");
                    }
                }
                Err(e) => {
                    debug!(blob = %id, scheme_id = %meta.scheme_id, error = %e,
                           "persisted payload re-send failed, keeping for next tick");
                    break;
                }
            }
        }
    }
}

async fn sleep_or_forever(wait_ms: u64) {
    if wait_ms == u64::MAX {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::FileBlobStore;
    use crate::SendError;
    use cloud_schema::TelemetrySignal;
    use signal_core::SystemClock;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        alive: AtomicBool,
        fail_sends: AtomicBool,
        sent: Mutex<Vec<Vec<u8>>>,
        send_count: AtomicUsize,
    }

    impl CloudSink for RecordingSink {
        fn send_telemetry(
            &self,
            payload: Bytes,
        ) -> Pin<Box<dyn Future<Output = Result<(), SendError>> + Send>> {
            self.send_count.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail_sends.load(Ordering::SeqCst);
            if !fail {
                self.sent.lock().unwrap().push(payload.to_vec());
            }
            Box::pin(async move {
                if fail {
                    Err(SendError::NotConnected)
                } else {
                    Ok(())
                }
            })
        }

        fn send_checkin(
            &self,
            _payload: Bytes,
        ) -> Pin<Box<dyn Future<Output = Result<(), SendError>> + Send>> {
            Box::pin(async { Ok(()) })
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    fn payload(persist: bool) -> TelemetryPayload {
        TelemetryPayload {
            scheme_id: "s1".into(),
            event_id: 1,
            event_time_ms: 1_000,
            signals: vec![TelemetrySignal {
                signal_id: 5,
                timestamp_ms: 1_000,
                value: 42.0,
            }],
            dtcs: None,
            persist,
            compress: false,
        }
    }

    fn spawn_worker(
        sink: Arc<RecordingSink>,
        store: Arc<FileBlobStore>,
        retry_interval_ms: u64,
    ) -> (mpsc::Sender<TelemetryPayload>, watch::Sender<bool>) {
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = SenderWorker::new(
            SystemClock::new(),
            sink,
            store,
            rx,
            retry_interval_ms,
            shutdown_rx,
        );
        tokio::spawn(worker.run());
        (tx, shutdown_tx)
    }

    #[tokio::test]
    async fn sends_queued_payloads() {
        let sink = Arc::new(RecordingSink::default());
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileBlobStore::new(dir.path()).unwrap());
        let (tx, _shutdown) = spawn_worker(Arc::clone(&sink), store, 0);

        tx.send(payload(false)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_persistent_payload_is_stored_then_retried() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail_sends.store(true, Ordering::SeqCst);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileBlobStore::new(dir.path()).unwrap());
        let (tx, _shutdown) = spawn_worker(Arc::clone(&sink), Arc::clone(&store), 20);

        tx.send(payload(true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.list_payloads().unwrap().len(), 1);

        // Transport comes back: the next retry tick resends and erases.
        sink.fail_sends.store(false, Ordering::SeqCst);
        sink.alive.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.list_payloads().unwrap().is_empty());
        assert!(!sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_persistent_payload_is_discarded_on_failure() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail_sends.store(true, Ordering::SeqCst);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileBlobStore::new(dir.path()).unwrap());
        let (tx, _shutdown) = spawn_worker(Arc::clone(&sink), Arc::clone(&store), 0);

        tx.send(payload(false)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.list_payloads().unwrap().is_empty());
    }
}
