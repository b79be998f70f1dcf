//! Per-interface CAN reader task.
//!
//! The task sleeps while no decoder dictionary covers its channel, wakes on
//! dictionary updates, and otherwise alternates between socket readiness and
//! a bounded idle wait. The first batch read after waking from sleep is
//! discarded so frames that queued up in the kernel while the dictionary was
//! absent don't get decoded against the new one.

use std::sync::Arc;
use std::time::Duration;

use policy_manager::{CanDecoderDictionary, DecoderDictionaries};
use signal_core::{Clock, CollectedFrame, SignalBufferTx, Timestamp};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::socket::RawCanSocket;
use crate::{decoder, BusError, CanSourceConfig};

pub struct CanDataSource {
    config: CanSourceConfig,
    clock: Arc<dyn Clock>,
    buffer: SignalBufferTx,
    dictionaries: watch::Receiver<DecoderDictionaries>,
    shutdown: watch::Receiver<bool>,
    /// Signals a fatal bus condition (interface removed) to the supervisor.
    fatal_tx: tokio::sync::mpsc::Sender<BusError>,
}

impl CanDataSource {
    pub fn new(
        config: CanSourceConfig,
        clock: Arc<dyn Clock>,
        buffer: SignalBufferTx,
        dictionaries: watch::Receiver<DecoderDictionaries>,
        shutdown: watch::Receiver<bool>,
        fatal_tx: tokio::sync::mpsc::Sender<BusError>,
    ) -> Self {
        Self {
            config,
            clock,
            buffer,
            dictionaries,
            shutdown,
            fatal_tx,
        }
    }

    pub async fn run(mut self) {
        let socket = match RawCanSocket::open(
            &self.config.interface_name,
            self.config.force_can_fd,
            self.config.timestamp_mode,
        ) {
            Ok(socket) => socket,
            Err(e) => {
                error!(interface = %self.config.interface_name, error = %e, "cannot open CAN socket");
                let _ = self.fatal_tx.send(e).await;
                return;
            }
        };
        let async_fd = match AsyncFd::with_interest(socket, Interest::READABLE) {
            Ok(fd) => fd,
            Err(e) => {
                error!(interface = %self.config.interface_name, error = %e, "cannot register CAN socket");
                let _ = self.fatal_tx.send(BusError::Fatal(e)).await;
                return;
            }
        };

        info!(
            interface = %self.config.interface_name,
            channel_id = self.config.channel_id,
            "CAN data source running"
        );

        let mut last_frame_time: Timestamp = 0;
        let mut received_frames: u64 = 0;
        let mut activations: u32 = 0;
        let mut last_activation_log = self.clock.monotonic_ms();
        let mut woke_up_from_sleep = false;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let dictionary = self.current_dictionary();
            let Some(dictionary) = dictionary else {
                trace!(
                    interface = %self.config.interface_name,
                    "no decoding rules for this channel, going to sleep"
                );
                tokio::select! {
                    changed = self.dictionaries.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        woke_up_from_sleep = true;
                    }
                    _ = self.shutdown.changed() => break,
                }
                continue;
            };

            activations += 1;
            let batch = match async_fd.get_ref().read_batch() {
                Ok(batch) => batch,
                Err(BusError::Transient(e)) => {
                    warn!(
                        interface = %self.config.interface_name,
                        error = %e,
                        "network down or unreachable, keeping socket"
                    );
                    metrics::counter!("canflux.can.transient_errors").increment(1);
                    Vec::new()
                }
                Err(fatal) => {
                    error!(interface = %self.config.interface_name, error = %fatal, "CAN socket fatal");
                    let _ = self.fatal_tx.send(fatal).await;
                    return;
                }
            };

            if woke_up_from_sleep {
                // Drop whatever the kernel queued while we slept.
                woke_up_from_sleep = false;
                debug!(
                    interface = %self.config.interface_name,
                    discarded = batch.len(),
                    "discarded first batch after wake"
                );
            } else {
                for frame in &batch {
                    let timestamp_ms = if frame.kernel_timestamp_ms != 0 {
                        frame.kernel_timestamp_ms
                    } else {
                        metrics::counter!("canflux.can.polling_timestamps").increment(1);
                        self.clock.system_time_ms()
                    };
                    if timestamp_ms < last_frame_time {
                        metrics::counter!("canflux.can.non_monotonic_frames").increment(1);
                    }
                    last_frame_time = timestamp_ms;
                    received_frames += 1;
                    self.process_frame(&dictionary, frame.frame_id, frame.data.as_slice(), timestamp_ms);
                }
            }

            let batch_was_full = batch.len() == crate::socket::BATCH_SIZE;
            if !batch_was_full {
                // Drained the kernel queue; idle until readiness, dictionary
                // change or the configured bound.
                let now = self.clock.monotonic_ms();
                if now.saturating_sub(last_activation_log) > 60_000 {
                    debug!(
                        interface = %self.config.interface_name,
                        activations,
                        frames = received_frames,
                        "reader statistics"
                    );
                    activations = 0;
                    last_activation_log = now;
                }
                tokio::select! {
                    guard = async_fd.readable() => {
                        if let Ok(mut guard) = guard {
                            guard.clear_ready();
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(self.config.idle_time_ms.max(1))) => {}
                    changed = self.dictionaries.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = self.shutdown.changed() => break,
                }
            }
        }
        info!(interface = %self.config.interface_name, "CAN data source stopped");
    }

    fn current_dictionary(&mut self) -> Option<Arc<CanDecoderDictionary>> {
        let snapshot = self.dictionaries.borrow_and_update();
        let can = snapshot.can.as_ref()?;
        if can.frames.contains_key(&self.config.channel_id) {
            Some(Arc::clone(can))
        } else {
            None
        }
    }

    fn process_frame(
        &self,
        dictionary: &CanDecoderDictionary,
        frame_id: u32,
        payload: &[u8],
        timestamp_ms: Timestamp,
    ) {
        let Some(samples) =
            decoder::decode_frame(dictionary, self.config.channel_id, frame_id, payload, timestamp_ms)
        else {
            // No rules for this frame: O(1) drop.
            return;
        };
        if !samples.is_empty() {
            self.buffer.push(CollectedFrame::Signals(samples));
        }
    }
}
