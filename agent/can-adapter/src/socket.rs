//! Non-blocking raw CAN socket with batched reads and kernel timestamps.
//!
//! Uses the PF_CAN raw socket interface directly: `recvmmsg` pulls up to
//! [`BATCH_SIZE`] frames per syscall and each frame's receive timestamp is
//! taken from the SO_TIMESTAMPING control message, so a burst of frames
//! keeps its kernel-observed timing even when the reader task is scheduled
//! late.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::{info, warn};

use crate::{BusError, CanTimestampMode};

/// Frames fetched from the kernel in one syscall.
pub const BATCH_SIZE: usize = 10;

const CAN_MTU: usize = 16;
const CANFD_MTU: usize = 72;
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;

// linux/net_tstamp.h
const SOF_TIMESTAMPING_RX_HARDWARE: libc::c_int = 1 << 2;
const SOF_TIMESTAMPING_RX_SOFTWARE: libc::c_int = 1 << 3;
const SOF_TIMESTAMPING_SOFTWARE: libc::c_int = 1 << 4;
const SOF_TIMESTAMPING_RAW_HARDWARE: libc::c_int = 1 << 6;

/// linux/can.h struct canfd_frame. Classic can_frame shares the prefix
/// layout (id, length byte, padding, 8 data bytes), so reads of either
/// flavor land correctly in this buffer and are told apart by message size.
#[repr(C)]
#[derive(Clone, Copy)]
struct CanFdFrameRaw {
    can_id: u32,
    len: u8,
    flags: u8,
    res0: u8,
    res1: u8,
    data: [u8; 64],
}

impl CanFdFrameRaw {
    fn zeroed() -> Self {
        CanFdFrameRaw {
            can_id: 0,
            len: 0,
            flags: 0,
            res0: 0,
            res1: 0,
            data: [0; 64],
        }
    }
}

// scm_timestamping from linux/errqueue.h: ts[0] software, ts[2] hardware.
#[repr(C)]
#[derive(Clone, Copy)]
struct ScmTimestamping {
    ts: [libc::timespec; 3],
}

/// One frame plus its receive timestamp (0 when the kernel provided none).
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    pub frame_id: u32,
    pub extended: bool,
    pub data: CanFrameData,
    pub kernel_timestamp_ms: u64,
}

/// Payload bytes of a classic or FD frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CanFrameData {
    bytes: [u8; 64],
    len: u8,
}

impl CanFrameData {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

pub struct RawCanSocket {
    fd: OwnedFd,
    timestamp_mode: CanTimestampMode,
}

impl AsRawFd for RawCanSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl RawCanSocket {
    /// Opens, configures and binds a non-blocking raw CAN socket on
    /// `interface_name`. CAN-FD frames are enabled opportunistically;
    /// `force_can_fd` turns the fallback into an error.
    pub fn open(
        interface_name: &str,
        force_can_fd: bool,
        timestamp_mode: CanTimestampMode,
    ) -> Result<Self, BusError> {
        let raw = unsafe {
            libc::socket(
                libc::PF_CAN,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::CAN_RAW,
            )
        };
        if raw < 0 {
            return Err(BusError::Fatal(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let canfd_on: libc::c_int = 1;
        let enabled = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_CAN_RAW,
                libc::CAN_RAW_FD_FRAMES,
                &canfd_on as *const _ as *const libc::c_void,
                mem::size_of_val(&canfd_on) as libc::socklen_t,
            )
        };
        if enabled != 0 {
            if force_can_fd {
                warn!(interface = interface_name, "CAN-FD required but not supported");
                return Err(BusError::Fatal(io::Error::last_os_error()));
            }
            info!(interface = interface_name, "CAN-FD not supported, falling back to classic CAN");
        }

        if timestamp_mode != CanTimestampMode::Polling {
            let flags: libc::c_int = SOF_TIMESTAMPING_RX_HARDWARE
                | SOF_TIMESTAMPING_RX_SOFTWARE
                | SOF_TIMESTAMPING_SOFTWARE
                | SOF_TIMESTAMPING_RAW_HARDWARE;
            let rc = unsafe {
                libc::setsockopt(
                    fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_TIMESTAMPING,
                    &flags as *const _ as *const libc::c_void,
                    mem::size_of_val(&flags) as libc::socklen_t,
                )
            };
            if rc != 0 {
                warn!(
                    interface = interface_name,
                    "kernel timestamping requested but not supported"
                );
                return Err(BusError::Fatal(io::Error::last_os_error()));
            }
        }

        let ifindex = interface_index(interface_name)?;
        bind_can(fd.as_raw_fd(), ifindex)?;

        info!(interface = interface_name, ifindex, "raw CAN socket bound");
        Ok(Self { fd, timestamp_mode })
    }

    /// Reads up to [`BATCH_SIZE`] frames with one syscall. Returns an empty
    /// batch when nothing is queued (the socket never blocks).
    pub fn read_batch(&self) -> Result<Vec<ReceivedFrame>, BusError> {
        let mut frames = [CanFdFrameRaw::zeroed(); BATCH_SIZE];
        let mut iovecs: [libc::iovec; BATCH_SIZE] = unsafe { mem::zeroed() };
        let mut msgs: [libc::mmsghdr; BATCH_SIZE] = unsafe { mem::zeroed() };
        const CMSG_BUF_LEN: usize = 64;
        let mut cmsg_buffers = [[0u8; CMSG_BUF_LEN]; BATCH_SIZE];

        for i in 0..BATCH_SIZE {
            iovecs[i].iov_base = &mut frames[i] as *mut _ as *mut libc::c_void;
            iovecs[i].iov_len = mem::size_of::<CanFdFrameRaw>();
            msgs[i].msg_hdr.msg_iov = &mut iovecs[i];
            msgs[i].msg_hdr.msg_iovlen = 1;
            msgs[i].msg_hdr.msg_control = cmsg_buffers[i].as_mut_ptr() as *mut libc::c_void;
            msgs[i].msg_hdr.msg_controllen = CMSG_BUF_LEN as _;
        }

        let received = unsafe {
            libc::recvmmsg(
                self.fd.as_raw_fd(),
                msgs.as_mut_ptr(),
                BATCH_SIZE as libc::c_uint,
                0,
                std::ptr::null_mut(),
            )
        };
        if received < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(Vec::new());
            }
            return Err(BusError::from_errno(err));
        }

        let mut out = Vec::with_capacity(received as usize);
        for i in 0..received as usize {
            let frame = &frames[i];
            let msg_len = msgs[i].msg_len as usize;
            let data_len = match msg_len {
                CANFD_MTU => usize::from(frame.len).min(64),
                CAN_MTU => usize::from(frame.len).min(8),
                _ => continue,
            };
            let mut bytes = [0u8; 64];
            bytes[..data_len].copy_from_slice(&frame.data[..data_len]);
            let extended = frame.can_id & CAN_EFF_FLAG != 0;
            out.push(ReceivedFrame {
                frame_id: if extended {
                    frame.can_id & CAN_EFF_MASK
                } else {
                    frame.can_id & CAN_SFF_MASK
                },
                extended,
                data: CanFrameData {
                    bytes,
                    len: data_len as u8,
                },
                kernel_timestamp_ms: extract_timestamp(&msgs[i].msg_hdr, self.timestamp_mode),
            });
        }
        Ok(out)
    }

    /// Sends one classic CAN frame (discovery broadcast path).
    pub fn write_classic(&self, can_id: u32, data: &[u8]) -> Result<(), BusError> {
        #[repr(C)]
        struct CanFrameRaw {
            can_id: u32,
            can_dlc: u8,
            pad: u8,
            res0: u8,
            res1: u8,
            data: [u8; 8],
        }
        let mut frame = CanFrameRaw {
            can_id,
            can_dlc: data.len().min(8) as u8,
            pad: 0,
            res0: 0,
            res1: 0,
            data: [0; 8],
        };
        frame.data[..data.len().min(8)].copy_from_slice(&data[..data.len().min(8)]);
        let written = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &frame as *const _ as *const libc::c_void,
                CAN_MTU,
            )
        };
        if written != CAN_MTU as isize {
            return Err(BusError::from_errno(io::Error::last_os_error()));
        }
        Ok(())
    }
}

fn interface_index(interface_name: &str) -> Result<libc::c_uint, BusError> {
    let name = std::ffi::CString::new(interface_name)
        .map_err(|_| BusError::Fatal(io::Error::from(io::ErrorKind::InvalidInput)))?;
    let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if ifindex == 0 {
        warn!(interface = interface_name, "CAN interface is not accessible");
        return Err(BusError::Fatal(io::Error::last_os_error()));
    }
    Ok(ifindex)
}

fn bind_can(fd: RawFd, ifindex: libc::c_uint) -> Result<(), BusError> {
    let mut addr: libc::sockaddr_can = unsafe { mem::zeroed() };
    addr.can_family = libc::AF_CAN as libc::sa_family_t;
    addr.can_ifindex = ifindex as libc::c_int;
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_can>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(BusError::Fatal(io::Error::last_os_error()));
    }
    Ok(())
}

/// Walks the control messages of one received message looking for the
/// SO_TIMESTAMPING payload. Returns 0 when no usable timestamp is present;
/// the caller then falls back to the wall clock.
fn extract_timestamp(msg: &libc::msghdr, mode: CanTimestampMode) -> u64 {
    if mode == CanTimestampMode::Polling {
        return 0;
    }
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let header = unsafe { &*cmsg };
        if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == libc::SO_TIMESTAMPING {
            let stamps = unsafe { &*(libc::CMSG_DATA(cmsg) as *const ScmTimestamping) };
            // ts[0] carries software timestamps, ts[2] raw hardware ones.
            let ts = match mode {
                CanTimestampMode::KernelHardware => &stamps.ts[2],
                _ => &stamps.ts[0],
            };
            return (ts.tv_sec as u64) * 1_000 + (ts.tv_nsec as u64) / 1_000_000;
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    0
}
