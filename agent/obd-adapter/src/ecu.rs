//! One discovered ECU: its ISO-TP socket and PID bookkeeping.

use std::collections::HashSet;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Instant;

use socketcan_isotp::{ExtendedId, Id, IsoTpSocket, StandardId};
use tracing::{debug, trace, warn};

use crate::{P2_TIMEOUT_MS, POSITIVE_RESPONSE_OFFSET, SERVICE_CURRENT_DATA};
use crate::decoder::{decode_supported_pids, next_range_supported, pid_response_payload};

pub struct ObdEcu {
    pub rx_id: u32,
    pub tx_id: u32,
    pub extended: bool,
    socket: IsoTpSocket,
    /// PIDs this ECU reported in its supported-PID bitmaps.
    supported_pids: Vec<u8>,
    /// Subset of the dictionary's requested PIDs partitioned to this ECU.
    pids_to_request: Vec<u8>,
}

impl ObdEcu {
    pub fn connect(
        interface: &str,
        rx_id: u32,
        tx_id: u32,
        extended: bool,
    ) -> Result<Self, std::io::Error> {
        let invalid = || std::io::Error::from(std::io::ErrorKind::InvalidInput);
        let open = |rx: Id, tx: Id| {
            IsoTpSocket::open(interface, rx, tx)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        };
        let socket = if extended {
            let rx = ExtendedId::new(rx_id).map(Id::Extended).ok_or_else(invalid)?;
            let tx = ExtendedId::new(tx_id).map(Id::Extended).ok_or_else(invalid)?;
            open(rx, tx)?
        } else {
            let rx = StandardId::new(rx_id as u16)
                .map(Id::Standard)
                .ok_or_else(invalid)?;
            let tx = StandardId::new(tx_id as u16)
                .map(Id::Standard)
                .ok_or_else(invalid)?;
            open(rx, tx)?
        };
        debug!(rx_id = %format_args!("{rx_id:X}"), tx_id = %format_args!("{tx_id:X}"), "ECU connected");
        Ok(Self {
            rx_id,
            tx_id,
            extended,
            socket,
            supported_pids: Vec::new(),
            pids_to_request: Vec::new(),
        })
    }

    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Sends a physical request on this ECU's socket.
    pub fn send_request(&self, request: &[u8]) -> bool {
        match self.socket.write(request) {
            Ok(_) => true,
            Err(e) => {
                warn!(rx_id = %format_args!("{:X}", self.rx_id), error = %e, "ISO-TP write failed");
                false
            }
        }
    }

    /// Waits up to `timeout_ms` for a response and returns it.
    pub fn read_response(&mut self, timeout_ms: u64) -> Option<Vec<u8>> {
        if !poll_in(self.fd(), timeout_ms) {
            return None;
        }
        match self.socket.read() {
            Ok(buffer) => Some(buffer.to_vec()),
            Err(e) => {
                warn!(rx_id = %format_args!("{:X}", self.rx_id), error = %e, "ISO-TP read failed");
                None
            }
        }
    }

    /// Physical request/response round trip.
    pub fn transact(&mut self, request: &[u8], timeout_ms: u64) -> Option<Vec<u8>> {
        if !self.send_request(request) {
            return None;
        }
        self.read_response(timeout_ms)
    }

    /// Drains responses queued by another ECU's broadcast request, staying
    /// within `budget_ms`. Returns the time actually spent.
    pub fn flush(&mut self, budget_ms: u64) -> u64 {
        let start = Instant::now();
        let mut remaining = budget_ms;
        loop {
            if !poll_in(self.fd(), remaining.min(P2_TIMEOUT_MS)) {
                break;
            }
            match self.socket.read() {
                Ok(buffer) => trace!(
                    rx_id = %format_args!("{:X}", self.rx_id),
                    len = buffer.len(),
                    "flushed broadcast response"
                ),
                Err(_) => break,
            }
            let spent = start.elapsed().as_millis() as u64;
            if spent >= budget_ms {
                break;
            }
            remaining = budget_ms - spent;
        }
        start.elapsed().as_millis() as u64
    }

    /// Queries the supported-PID bitmap ranges (0x00, 0x20, ...). The
    /// result is cached; later assignment rounds reuse it.
    pub fn acquire_supported_pids(&mut self) {
        if !self.supported_pids.is_empty() {
            return;
        }
        let mut base = 0x00u8;
        loop {
            let Some(response) = self.transact(&[SERVICE_CURRENT_DATA, base], P2_TIMEOUT_MS) else {
                break;
            };
            let Some(payload) = pid_response_payload(&response, base) else {
                break;
            };
            self.supported_pids.extend(decode_supported_pids(base, payload));
            if next_range_supported(payload) && base < 0xC0 {
                base += 0x20;
            } else {
                break;
            }
        }
        debug!(
            rx_id = %format_args!("{:X}", self.rx_id),
            supported = self.supported_pids.len(),
            "supported PIDs acquired"
        );
    }

    /// Partitions `requested` PIDs to this ECU: every supported PID not yet
    /// assigned to an earlier ECU is claimed here and never reassigned.
    pub fn update_pid_request_list(&mut self, requested: &[u8], assigned: &mut HashSet<u8>) {
        self.pids_to_request = requested
            .iter()
            .copied()
            .filter(|pid| self.supported_pids.contains(pid) && assigned.insert(*pid))
            .collect();
        debug!(
            rx_id = %format_args!("{:X}", self.rx_id),
            pids = ?self.pids_to_request,
            "PID request list updated"
        );
    }

    pub fn pids_to_request(&self) -> &[u8] {
        &self.pids_to_request
    }

    pub fn supports(&self, pid: u8) -> bool {
        self.supported_pids.contains(&pid)
    }
}

/// Positive response header byte for a service id.
pub fn positive_response(service: u8) -> u8 {
    service + POSITIVE_RESPONSE_OFFSET
}

pub(crate) fn poll_in(fd: RawFd, timeout_ms: u64) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms.min(i32::MAX as u64) as libc::c_int) };
    rc > 0 && (pfd.revents & libc::POLLIN) != 0
}
