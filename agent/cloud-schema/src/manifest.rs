//! Decoder manifest: the cloud's rule set mapping bus messages to signals.

use signal_core::{RawSignalType, SignalId, SignalType};

use crate::proto::{
    self, read_double, read_len_delim, read_string, read_tag, read_varint, skip_field, WIRE_FIXED64,
    WIRE_LEN, WIRE_VARINT,
};
use crate::{SchemaError, SyncId};

/// Which acquisition path decodes a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalProtocol {
    RawCan,
    Obd,
    Custom,
    Complex,
}

/// Decoding rule for one signal inside a raw CAN frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CanSignalDecoder {
    pub signal_id: SignalId,
    /// Interface name as the cloud knows it; translated to a numeric channel
    /// id via the configured interface table.
    pub interface_id: String,
    pub message_id: u32,
    pub is_big_endian: bool,
    pub is_signed: bool,
    pub start_bit: u16,
    pub length: u16,
    pub factor: f64,
    pub offset: f64,
    pub signal_type: SignalType,
    pub raw_signal_type: RawSignalType,
}

/// Decoding rule for one signal packed into an OBD-II PID response.
#[derive(Debug, Clone, PartialEq)]
pub struct PidSignalDecoder {
    pub signal_id: SignalId,
    pub service_mode: u8,
    pub pid: u8,
    pub pid_response_length: usize,
    pub scaling: f64,
    pub offset: f64,
    pub start_byte: usize,
    pub byte_length: usize,
    pub bit_right_shift: u8,
    pub bit_mask_length: u8,
    pub is_signed: bool,
    pub signal_type: SignalType,
}

/// Signal decoded by a named custom data source.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomSignalDecoder {
    pub signal_id: SignalId,
    pub interface_id: String,
    pub decoder_name: String,
    pub signal_type: SignalType,
}

/// Root reference for a structured (complex) signal; sub-paths of it are
/// resolved to internal partial-signal ids by the policy manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexSignalDecoder {
    pub signal_id: SignalId,
    pub interface_id: String,
    pub message_id: String,
}

/// Validated decoder manifest.
#[derive(Debug, Clone, Default)]
pub struct DecoderManifest {
    pub sync_id: SyncId,
    pub can_signals: Vec<CanSignalDecoder>,
    pub obd_signals: Vec<PidSignalDecoder>,
    pub custom_signals: Vec<CustomSignalDecoder>,
    pub complex_signals: Vec<ComplexSignalDecoder>,
}

// A CAN-FD payload is at most 64 bytes.
const MAX_FRAME_BITS: u32 = 64 * 8;

impl DecoderManifest {
    /// Decodes and validates a manifest blob.
    ///
    /// Wire layout:
    ///   1 sync_id  2 can_signals*  3 obd_pid_signals*  4 custom_decoding_signals*
    ///   5 complex_signals*
    pub fn decode(buf: &[u8]) -> Result<Self, SchemaError> {
        let mut manifest = DecoderManifest::default();
        let mut pos = 0usize;
        while pos < buf.len() {
            let (field, wire) = read_tag(buf, &mut pos)?;
            match (field, wire) {
                (1, WIRE_LEN) => manifest.sync_id = read_string(buf, &mut pos)?,
                (2, WIRE_LEN) => {
                    let inner = read_len_delim(buf, &mut pos)?;
                    manifest.can_signals.push(decode_can_signal(inner)?);
                }
                (3, WIRE_LEN) => {
                    let inner = read_len_delim(buf, &mut pos)?;
                    manifest.obd_signals.push(decode_obd_signal(inner)?);
                }
                (4, WIRE_LEN) => {
                    let inner = read_len_delim(buf, &mut pos)?;
                    manifest.custom_signals.push(decode_custom_signal(inner)?);
                }
                (5, WIRE_LEN) => {
                    let inner = read_len_delim(buf, &mut pos)?;
                    manifest.complex_signals.push(decode_complex_signal(inner)?);
                }
                (_, w) => skip_field(buf, &mut pos, w)?,
            }
        }
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        if self.sync_id.is_empty() {
            return Err(SchemaError::InvalidManifest("missing sync id".into()));
        }
        for can in &self.can_signals {
            if can.length == 0 || can.length > 64 {
                return Err(SchemaError::InvalidManifest(format!(
                    "signal {} has bit length {}",
                    can.signal_id, can.length
                )));
            }
            if u32::from(can.start_bit) + u32::from(can.length) > MAX_FRAME_BITS {
                return Err(SchemaError::InvalidManifest(format!(
                    "signal {} exceeds frame bounds (start {} len {})",
                    can.signal_id, can.start_bit, can.length
                )));
            }
        }
        for obd in &self.obd_signals {
            if obd.byte_length == 0 || obd.start_byte + obd.byte_length > obd.pid_response_length {
                return Err(SchemaError::InvalidManifest(format!(
                    "PID signal {} exceeds response bounds",
                    obd.signal_id
                )));
            }
        }
        Ok(())
    }

    /// Protocol of a cloud-assigned signal id, `None` if unknown to this
    /// manifest. Signal tables are a few hundred entries at most, so the
    /// scan stays off any hot path.
    pub fn protocol_of(&self, signal_id: SignalId) -> Option<SignalProtocol> {
        if self.can_signals.iter().any(|s| s.signal_id == signal_id) {
            return Some(SignalProtocol::RawCan);
        }
        if self.obd_signals.iter().any(|s| s.signal_id == signal_id) {
            return Some(SignalProtocol::Obd);
        }
        if self.custom_signals.iter().any(|s| s.signal_id == signal_id) {
            return Some(SignalProtocol::Custom);
        }
        if self.complex_signals.iter().any(|s| s.signal_id == signal_id) {
            return Some(SignalProtocol::Complex);
        }
        None
    }

    pub fn signal_type_of(&self, signal_id: SignalId) -> Option<SignalType> {
        if let Some(s) = self.can_signals.iter().find(|s| s.signal_id == signal_id) {
            return Some(s.signal_type);
        }
        if let Some(s) = self.obd_signals.iter().find(|s| s.signal_id == signal_id) {
            return Some(s.signal_type);
        }
        if let Some(s) = self.custom_signals.iter().find(|s| s.signal_id == signal_id) {
            return Some(s.signal_type);
        }
        None
    }
}

fn signal_type_from_code(code: u64) -> SignalType {
    match code {
        0 => SignalType::Bool,
        1 => SignalType::Uint8,
        2 => SignalType::Uint16,
        3 => SignalType::Uint32,
        4 => SignalType::Uint64,
        5 => SignalType::Int8,
        6 => SignalType::Int16,
        7 => SignalType::Int32,
        8 => SignalType::Int64,
        9 => SignalType::Float,
        _ => SignalType::Double,
    }
}

fn signal_type_to_code(ty: SignalType) -> u64 {
    match ty {
        SignalType::Bool => 0,
        SignalType::Uint8 => 1,
        SignalType::Uint16 => 2,
        SignalType::Uint32 => 3,
        SignalType::Uint64 => 4,
        SignalType::Int8 => 5,
        SignalType::Int16 => 6,
        SignalType::Int32 => 7,
        SignalType::Int64 => 8,
        SignalType::Float => 9,
        SignalType::Double => 10,
    }
}

fn decode_can_signal(buf: &[u8]) -> Result<CanSignalDecoder, SchemaError> {
    let mut s = CanSignalDecoder {
        signal_id: 0,
        interface_id: String::new(),
        message_id: 0,
        is_big_endian: false,
        is_signed: false,
        start_bit: 0,
        length: 0,
        factor: 1.0,
        offset: 0.0,
        signal_type: SignalType::Double,
        raw_signal_type: RawSignalType::Integer,
    };
    let mut pos = 0usize;
    while pos < buf.len() {
        let (field, wire) = read_tag(buf, &mut pos)?;
        match (field, wire) {
            (1, WIRE_VARINT) => s.signal_id = read_varint(buf, &mut pos)? as SignalId,
            (2, WIRE_LEN) => s.interface_id = read_string(buf, &mut pos)?,
            (3, WIRE_VARINT) => s.message_id = read_varint(buf, &mut pos)? as u32,
            (4, WIRE_VARINT) => s.is_big_endian = read_varint(buf, &mut pos)? != 0,
            (5, WIRE_VARINT) => s.is_signed = read_varint(buf, &mut pos)? != 0,
            (6, WIRE_VARINT) => s.start_bit = read_varint(buf, &mut pos)? as u16,
            (7, WIRE_VARINT) => s.length = read_varint(buf, &mut pos)? as u16,
            (8, WIRE_FIXED64) => s.factor = read_double(buf, &mut pos)?,
            (9, WIRE_FIXED64) => s.offset = read_double(buf, &mut pos)?,
            (10, WIRE_VARINT) => s.signal_type = signal_type_from_code(read_varint(buf, &mut pos)?),
            (11, WIRE_VARINT) => {
                s.raw_signal_type = if read_varint(buf, &mut pos)? == 1 {
                    RawSignalType::FloatingPoint
                } else {
                    RawSignalType::Integer
                }
            }
            (_, w) => skip_field(buf, &mut pos, w)?,
        }
    }
    Ok(s)
}

fn decode_obd_signal(buf: &[u8]) -> Result<PidSignalDecoder, SchemaError> {
    let mut s = PidSignalDecoder {
        signal_id: 0,
        service_mode: 1,
        pid: 0,
        pid_response_length: 0,
        scaling: 1.0,
        offset: 0.0,
        start_byte: 0,
        byte_length: 0,
        bit_right_shift: 0,
        bit_mask_length: 8,
        is_signed: false,
        signal_type: SignalType::Double,
    };
    let mut pos = 0usize;
    while pos < buf.len() {
        let (field, wire) = read_tag(buf, &mut pos)?;
        match (field, wire) {
            (1, WIRE_VARINT) => s.signal_id = read_varint(buf, &mut pos)? as SignalId,
            (2, WIRE_VARINT) => s.service_mode = read_varint(buf, &mut pos)? as u8,
            (3, WIRE_VARINT) => s.pid = read_varint(buf, &mut pos)? as u8,
            (4, WIRE_VARINT) => s.pid_response_length = read_varint(buf, &mut pos)? as usize,
            (5, WIRE_FIXED64) => s.scaling = read_double(buf, &mut pos)?,
            (6, WIRE_FIXED64) => s.offset = read_double(buf, &mut pos)?,
            (7, WIRE_VARINT) => s.start_byte = read_varint(buf, &mut pos)? as usize,
            (8, WIRE_VARINT) => s.byte_length = read_varint(buf, &mut pos)? as usize,
            (9, WIRE_VARINT) => s.bit_right_shift = read_varint(buf, &mut pos)? as u8,
            (10, WIRE_VARINT) => s.bit_mask_length = read_varint(buf, &mut pos)? as u8,
            (11, WIRE_VARINT) => s.signal_type = signal_type_from_code(read_varint(buf, &mut pos)?),
            (12, WIRE_VARINT) => s.is_signed = read_varint(buf, &mut pos)? != 0,
            (_, w) => skip_field(buf, &mut pos, w)?,
        }
    }
    Ok(s)
}

fn decode_custom_signal(buf: &[u8]) -> Result<CustomSignalDecoder, SchemaError> {
    let mut s = CustomSignalDecoder {
        signal_id: 0,
        interface_id: String::new(),
        decoder_name: String::new(),
        signal_type: SignalType::Double,
    };
    let mut pos = 0usize;
    while pos < buf.len() {
        let (field, wire) = read_tag(buf, &mut pos)?;
        match (field, wire) {
            (1, WIRE_VARINT) => s.signal_id = read_varint(buf, &mut pos)? as SignalId,
            (2, WIRE_LEN) => s.interface_id = read_string(buf, &mut pos)?,
            (3, WIRE_LEN) => s.decoder_name = read_string(buf, &mut pos)?,
            (4, WIRE_VARINT) => s.signal_type = signal_type_from_code(read_varint(buf, &mut pos)?),
            (_, w) => skip_field(buf, &mut pos, w)?,
        }
    }
    Ok(s)
}

fn decode_complex_signal(buf: &[u8]) -> Result<ComplexSignalDecoder, SchemaError> {
    let mut s = ComplexSignalDecoder {
        signal_id: 0,
        interface_id: String::new(),
        message_id: String::new(),
    };
    let mut pos = 0usize;
    while pos < buf.len() {
        let (field, wire) = read_tag(buf, &mut pos)?;
        match (field, wire) {
            (1, WIRE_VARINT) => s.signal_id = read_varint(buf, &mut pos)? as SignalId,
            (2, WIRE_LEN) => s.interface_id = read_string(buf, &mut pos)?,
            (3, WIRE_LEN) => s.message_id = read_string(buf, &mut pos)?,
            (_, w) => skip_field(buf, &mut pos, w)?,
        }
    }
    Ok(s)
}

/// Test-side encoders, mirrored from the decoders above.
pub mod encode {
    use super::*;

    pub fn manifest_to_bytes(manifest: &DecoderManifest) -> Vec<u8> {
        let mut buf = Vec::new();
        proto::write_string_field(&mut buf, 1, &manifest.sync_id);
        for s in &manifest.can_signals {
            proto::write_message_field(&mut buf, 2, |inner| encode_can_signal(s, inner));
        }
        for s in &manifest.obd_signals {
            proto::write_message_field(&mut buf, 3, |inner| encode_obd_signal(s, inner));
        }
        for s in &manifest.custom_signals {
            proto::write_message_field(&mut buf, 4, |inner| {
                proto::write_uint_field(inner, 1, u64::from(s.signal_id));
                proto::write_string_field(inner, 2, &s.interface_id);
                proto::write_string_field(inner, 3, &s.decoder_name);
                proto::write_uint_field(inner, 4, signal_type_to_code(s.signal_type));
            });
        }
        for s in &manifest.complex_signals {
            proto::write_message_field(&mut buf, 5, |inner| {
                proto::write_uint_field(inner, 1, u64::from(s.signal_id));
                proto::write_string_field(inner, 2, &s.interface_id);
                proto::write_string_field(inner, 3, &s.message_id);
            });
        }
        buf
    }

    fn encode_can_signal(s: &CanSignalDecoder, buf: &mut Vec<u8>) {
        proto::write_uint_field(buf, 1, u64::from(s.signal_id));
        proto::write_string_field(buf, 2, &s.interface_id);
        proto::write_uint_field(buf, 3, u64::from(s.message_id));
        proto::write_bool_field(buf, 4, s.is_big_endian);
        proto::write_bool_field(buf, 5, s.is_signed);
        proto::write_uint_field(buf, 6, u64::from(s.start_bit));
        proto::write_uint_field(buf, 7, u64::from(s.length));
        proto::write_double_field(buf, 8, s.factor);
        proto::write_double_field(buf, 9, s.offset);
        proto::write_uint_field(buf, 10, signal_type_to_code(s.signal_type));
        proto::write_uint_field(
            buf,
            11,
            u64::from(s.raw_signal_type == RawSignalType::FloatingPoint),
        );
    }

    fn encode_obd_signal(s: &PidSignalDecoder, buf: &mut Vec<u8>) {
        proto::write_uint_field(buf, 1, u64::from(s.signal_id));
        proto::write_uint_field(buf, 2, u64::from(s.service_mode));
        proto::write_uint_field(buf, 3, u64::from(s.pid));
        proto::write_uint_field(buf, 4, s.pid_response_length as u64);
        proto::write_double_field(buf, 5, s.scaling);
        proto::write_double_field(buf, 6, s.offset);
        proto::write_uint_field(buf, 7, s.start_byte as u64);
        proto::write_uint_field(buf, 8, s.byte_length as u64);
        proto::write_uint_field(buf, 9, u64::from(s.bit_right_shift));
        proto::write_uint_field(buf, 10, u64::from(s.bit_mask_length));
        proto::write_uint_field(buf, 11, signal_type_to_code(s.signal_type));
        proto::write_bool_field(buf, 12, s.is_signed);
    }
}
