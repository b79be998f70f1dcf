//! The OBD worker: ECU auto-discovery followed by the PID/DTC acquisition
//! loop. Runs blocking on the runtime's blocking pool; all waits are short
//! polls so stop requests are honored promptly.

use std::collections::HashSet;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use can_adapter::socket::{RawCanSocket, CAN_EFF_FLAG, CAN_EFF_MASK};
use can_adapter::{BusError, CanTimestampMode};
use policy_manager::{DecoderDictionaries, InspectionMatrix, ObdDecoderDictionary};
use signal_core::{Clock, CollectedFrame, DtcInfo, SignalBufferTx};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::decoder::{decode_dtcs, decode_pid_payload, pid_response_payload};
use crate::ecu::{poll_in, ObdEcu};
use crate::{
    tx_id_for_rx, ObdConfig, BROADCAST_ID_EXTENDED, BROADCAST_ID_STANDARD, DISCOVERY_RETRY_MS,
    HIGHEST_RX_ID_EXTENDED, HIGHEST_RX_ID_STANDARD, LOWEST_RX_ID_EXTENDED, LOWEST_RX_ID_STANDARD,
    P2_TIMEOUT_MS, SERVICE_CURRENT_DATA, SERVICE_STORED_DTCS,
};

/// Bound for every internal wait so shutdown is observed quickly.
const SLEEP_SLICE_MS: u64 = 100;
const DISCOVERY_WINDOW_MS: u64 = 1_000;

pub struct ObdOverCanModule {
    config: ObdConfig,
    clock: Arc<dyn Clock>,
    buffer: SignalBufferTx,
    dictionaries: watch::Receiver<DecoderDictionaries>,
    inspection: watch::Receiver<Arc<InspectionMatrix>>,
    shutdown: watch::Receiver<bool>,
    fatal_tx: mpsc::Sender<BusError>,

    ecus: Vec<ObdEcu>,
    broadcast_socket: Option<RawCanSocket>,
    extended_ids: bool,
}

impl ObdOverCanModule {
    pub fn new(
        config: ObdConfig,
        clock: Arc<dyn Clock>,
        buffer: SignalBufferTx,
        dictionaries: watch::Receiver<DecoderDictionaries>,
        inspection: watch::Receiver<Arc<InspectionMatrix>>,
        shutdown: watch::Receiver<bool>,
        fatal_tx: mpsc::Sender<BusError>,
    ) -> Self {
        Self {
            config,
            clock,
            buffer,
            dictionaries,
            inspection,
            shutdown,
            fatal_tx,
            ecus: Vec::new(),
            broadcast_socket: None,
            extended_ids: false,
        }
    }

    fn should_stop(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Blocking worker entry point; run via `spawn_blocking`.
    pub fn run(mut self) {
        if !self.config.is_enabled() {
            info!("PID and DTC intervals are both 0, OBD worker not started");
            return;
        }
        info!(
            interface = %self.config.gateway_interface_name,
            pid_interval_s = self.config.pid_request_interval_seconds,
            dtc_interval_s = self.config.dtc_request_interval_seconds,
            broadcast = self.config.broadcast_requests,
            "OBD worker started"
        );

        if !self.detect_and_init_ecus() {
            return;
        }

        self.acquisition_loop();
        info!("OBD worker stopped");
    }

    /// Discovery phase: sleeps until there is something to do, then probes
    /// with 11-bit addressing and falls back to 29-bit.
    fn detect_and_init_ecus(&mut self) -> bool {
        loop {
            if self.should_stop() {
                return false;
            }
            if !self.has_work() {
                trace!("no OBD decoding rules and DTC polling inactive, sleeping");
                self.sleep_slice(SLEEP_SLICE_MS);
                continue;
            }

            let mut extended = false;
            let mut responses = self.auto_detect_ecus(false);
            if responses.is_empty() {
                extended = true;
                responses = self.auto_detect_ecus(true);
            }
            if responses.is_empty() {
                trace!(retry_ms = DISCOVERY_RETRY_MS, "no ECU answered discovery");
                self.sleep_slice(DISCOVERY_RETRY_MS);
                continue;
            }

            self.extended_ids = extended;
            if self.config.broadcast_requests {
                match RawCanSocket::open(
                    &self.config.gateway_interface_name,
                    false,
                    CanTimestampMode::Polling,
                ) {
                    Ok(socket) => self.broadcast_socket = Some(socket),
                    Err(e) => {
                        // Broadcast socket setup is unrecoverable.
                        error!(error = %e, "failed to open OBD broadcast socket");
                        let _ = self.fatal_tx.blocking_send(e);
                        return false;
                    }
                }
            }

            let unique: std::collections::BTreeSet<u32> = responses.into_iter().collect();
            for rx_id in unique {
                let tx_id = tx_id_for_rx(rx_id, extended);
                match ObdEcu::connect(&self.config.gateway_interface_name, rx_id, tx_id, extended) {
                    Ok(ecu) => self.ecus.push(ecu),
                    Err(e) => {
                        error!(
                            rx_id = %format_args!("{rx_id:X}"),
                            error = %e,
                            "ISO-TP socket setup failed, check the kernel isotp module"
                        );
                        let _ = self
                            .fatal_tx
                            .blocking_send(BusError::Fatal(e));
                        return false;
                    }
                }
            }
            info!(ecus = self.ecus.len(), extended, "ECU discovery finished");
            return true;
        }
    }

    /// Broadcasts a Service-01 / PID-00 request and collects responding ids
    /// within a one second window. Any socket failure yields an empty set.
    fn auto_detect_ecus(&self, extended: bool) -> Vec<u32> {
        let socket = match RawCanSocket::open(
            &self.config.gateway_interface_name,
            false,
            CanTimestampMode::Polling,
        ) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "discovery socket open failed");
                return Vec::new();
            }
        };
        let can_id = if extended {
            BROADCAST_ID_EXTENDED | CAN_EFF_FLAG
        } else {
            BROADCAST_ID_STANDARD
        };
        // Single frame, length 2: Service 01, PID 00.
        if let Err(e) = socket.write_classic(can_id, &[0x02, SERVICE_CURRENT_DATA, 0x00, 0, 0, 0, 0, 0]) {
            warn!(error = %e, "discovery broadcast write failed");
            return Vec::new();
        }
        trace!(extended, "sent discovery broadcast");

        let (low, high) = if extended {
            (LOWEST_RX_ID_EXTENDED, HIGHEST_RX_ID_EXTENDED)
        } else {
            (LOWEST_RX_ID_STANDARD, HIGHEST_RX_ID_STANDARD)
        };
        let mut responses = Vec::new();
        let deadline = self.clock.monotonic_ms() + DISCOVERY_WINDOW_MS;
        while self.clock.monotonic_ms() < deadline && !self.should_stop() {
            if !poll_in(socket.as_raw_fd(), P2_TIMEOUT_MS) {
                break;
            }
            let batch = match socket.read_batch() {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "discovery read failed");
                    return Vec::new();
                }
            };
            for frame in batch {
                let id = if frame.extended {
                    frame.frame_id & CAN_EFF_MASK
                } else {
                    frame.frame_id
                };
                if (low..=high).contains(&id) {
                    trace!(rx_id = %format_args!("{id:X}"), "ECU answered discovery");
                    responses.push(id);
                }
            }
        }
        debug!(count = responses.len(), extended, "discovery window closed");
        responses
    }

    fn acquisition_loop(&mut self) {
        let pid_interval_ms = self.config.pid_request_interval_seconds * 1_000;
        let dtc_interval_ms = self.config.dtc_request_interval_seconds * 1_000;
        let mut next_pid_at = self.clock.monotonic_ms();
        let mut next_dtc_at = self.clock.monotonic_ms();
        let mut has_acquired_supported_pids = false;
        let mut last_requested_pids: Vec<u8> = Vec::new();

        while !self.should_stop() {
            let now = self.clock.monotonic_ms();

            if pid_interval_ms > 0 && now >= next_pid_at {
                next_pid_at = now + pid_interval_ms;
                if let Some(dictionary) = self.current_obd_dictionary() {
                    let requested = dictionary.requested_pids();
                    if !has_acquired_supported_pids || requested != last_requested_pids {
                        has_acquired_supported_pids = true;
                        last_requested_pids = requested.clone();
                        self.assign_pids_to_ecus(&requested);
                        next_pid_at = self.clock.monotonic_ms() + pid_interval_ms;
                    }
                    self.request_all_pids(&dictionary);
                }
            }

            let now = self.clock.monotonic_ms();
            if dtc_interval_ms > 0 && now >= next_dtc_at {
                next_dtc_at = now + dtc_interval_ms;
                if self.should_request_dtcs() {
                    self.request_all_dtcs();
                }
            }

            let now = self.clock.monotonic_ms();
            let mut sleep_ms = SLEEP_SLICE_MS;
            if pid_interval_ms > 0 {
                sleep_ms = sleep_ms.min(next_pid_at.saturating_sub(now).max(1));
            }
            if dtc_interval_ms > 0 {
                sleep_ms = sleep_ms.min(next_dtc_at.saturating_sub(now).max(1));
            }
            self.sleep_slice(sleep_ms);
        }
    }

    fn has_work(&self) -> bool {
        let has_dictionary = self.dictionaries.borrow().obd.is_some();
        has_dictionary || self.should_request_dtcs()
    }

    fn current_obd_dictionary(&self) -> Option<Arc<ObdDecoderDictionary>> {
        self.dictionaries.borrow().obd.as_ref().map(Arc::clone)
    }

    /// DTC polling is active while any published condition asks for DTCs.
    fn should_request_dtcs(&self) -> bool {
        self.inspection.borrow().any_condition_includes_dtcs()
    }

    /// Requests supported-PID bitmaps once per ECU, then partitions the
    /// dictionary's PIDs: the first ECU supporting a PID owns it for good.
    fn assign_pids_to_ecus(&mut self, requested: &[u8]) {
        let mut assigned: HashSet<u8> = HashSet::new();
        for ecu in &mut self.ecus {
            ecu.acquire_supported_pids();
            ecu.update_pid_request_list(requested, &mut assigned);
        }
    }

    fn request_all_pids(&mut self, dictionary: &ObdDecoderDictionary) {
        let timestamp_ms = self.clock.system_time_ms();
        let broadcast = self.config.broadcast_requests;
        for index in 0..self.ecus.len() {
            let pids: Vec<u8> = self.ecus[index].pids_to_request().to_vec();
            let mut requests_sent = 0usize;
            for pid in pids {
                let response = if broadcast {
                    if !self.send_broadcast_request(&[0x02, SERVICE_CURRENT_DATA, pid, 0, 0, 0, 0, 0]) {
                        continue;
                    }
                    requests_sent += 1;
                    self.ecus[index].read_response(P2_TIMEOUT_MS)
                } else {
                    self.ecus[index].transact(&[SERVICE_CURRENT_DATA, pid], P2_TIMEOUT_MS)
                };
                let Some(response) = response else {
                    trace!(pid, rx_id = %format_args!("{:X}", self.ecus[index].rx_id), "PID timed out");
                    metrics::counter!("canflux.obd.request_timeouts").increment(1);
                    continue;
                };
                let Some(payload) = pid_response_payload(&response, pid) else {
                    continue;
                };
                let Some(rules) = dictionary.pids.get(&pid) else {
                    continue;
                };
                let samples = decode_pid_payload(rules, payload, timestamp_ms);
                if !samples.is_empty() {
                    self.buffer.push(CollectedFrame::Signals(samples));
                }
            }
            self.flush_other_ecus(index, requests_sent);
        }
    }

    /// Polls stored DTCs from every ECU. A cycle that got at least one
    /// answer publishes a DtcInfo even when no codes are stored, so
    /// conditions can observe "no DTCs".
    fn request_all_dtcs(&mut self) {
        let mut info = DtcInfo {
            receive_time_ms: self.clock.system_time_ms(),
            codes: Vec::new(),
        };
        let mut any_success = false;
        let broadcast = self.config.broadcast_requests;
        for index in 0..self.ecus.len() {
            let response = if broadcast {
                if !self.send_broadcast_request(&[0x01, SERVICE_STORED_DTCS, 0, 0, 0, 0, 0, 0]) {
                    continue;
                }
                let r = self.ecus[index].read_response(P2_TIMEOUT_MS);
                self.flush_other_ecus(index, 1);
                r
            } else {
                self.ecus[index].transact(&[SERVICE_STORED_DTCS], P2_TIMEOUT_MS)
            };
            let Some(response) = response else {
                continue;
            };
            if let Some(codes) = decode_dtcs(&response) {
                any_success = true;
                info.codes.extend(codes);
            }
        }
        if any_success {
            debug!(count = info.codes.len(), "publishing DTC poll result");
            self.buffer.push(CollectedFrame::Dtcs(info));
        }
    }

    fn send_broadcast_request(&self, frame: &[u8]) -> bool {
        let Some(socket) = &self.broadcast_socket else {
            return false;
        };
        let can_id = if self.extended_ids {
            BROADCAST_ID_EXTENDED | CAN_EFF_FLAG
        } else {
            BROADCAST_ID_STANDARD
        };
        match socket.write_classic(can_id, frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "broadcast request failed");
                false
            }
        }
    }

    /// In broadcast mode every ECU answers every request; drain the other
    /// ECUs' queues within a shared P2 budget before the next request.
    fn flush_other_ecus(&mut self, except: usize, request_count: usize) {
        if !self.config.broadcast_requests || request_count == 0 {
            return;
        }
        let mut budget_ms = P2_TIMEOUT_MS;
        for index in 0..self.ecus.len() {
            if index == except {
                continue;
            }
            for _ in 0..request_count {
                let used = self.ecus[index].flush(budget_ms);
                budget_ms = budget_ms.saturating_sub(used);
                if budget_ms == 0 {
                    return;
                }
            }
        }
    }

    /// Sleeps in shutdown-aware slices; dictionary or matrix updates end the
    /// sleep early.
    fn sleep_slice(&mut self, total_ms: u64) {
        let deadline = self.clock.monotonic_ms() + total_ms;
        loop {
            if self.should_stop() {
                return;
            }
            if self.dictionaries.has_changed().unwrap_or(false)
                || self.inspection.has_changed().unwrap_or(false)
            {
                let _ = self.dictionaries.borrow_and_update();
                let _ = self.inspection.borrow_and_update();
                return;
            }
            let now = self.clock.monotonic_ms();
            if now >= deadline {
                return;
            }
            std::thread::sleep(Duration::from_millis((deadline - now).min(SLEEP_SLICE_MS)));
        }
    }
}
