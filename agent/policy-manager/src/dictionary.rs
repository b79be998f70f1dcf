//! Decoder dictionaries: the per-protocol runtime form of the manifest,
//! restricted to signals the enabled schemes actually need.
//!
//! Dictionaries are rebuilt from scratch on every change and published as
//! immutable snapshots; data sources swap to the new snapshot atomically and
//! never see a half-built dictionary.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use cloud_schema::{CollectionScheme, DecoderManifest};
use signal_core::{RawSignalType, SignalId, SignalType, INTERNAL_SIGNAL_ID_BITMASK};
use tracing::{trace, warn};

/// Decoding rule for one signal within a CAN frame, ready for the hot path.
#[derive(Debug, Clone, PartialEq)]
pub struct CanSignalRule {
    pub signal_id: SignalId,
    pub start_bit: u16,
    pub length: u16,
    pub is_big_endian: bool,
    pub is_signed: bool,
    pub factor: f64,
    pub offset: f64,
    pub signal_type: SignalType,
    pub raw_signal_type: RawSignalType,
}

/// Decoding rule for one signal within an OBD PID response.
#[derive(Debug, Clone, PartialEq)]
pub struct PidSignalRule {
    pub signal_id: SignalId,
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

/// Rules for raw CAN acquisition, keyed by numeric channel then frame id.
#[derive(Debug, Clone, Default)]
pub struct CanDecoderDictionary {
    pub frames: HashMap<u32, HashMap<u32, Vec<CanSignalRule>>>,
    pub signal_ids_to_collect: HashSet<SignalId>,
}

impl CanDecoderDictionary {
    pub fn rules_for(&self, channel_id: u32, frame_id: u32) -> Option<&[CanSignalRule]> {
        self.frames
            .get(&channel_id)
            .and_then(|frames| frames.get(&frame_id))
            .map(Vec::as_slice)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.values().map(HashMap::len).sum()
    }
}

/// Rules for OBD acquisition, keyed by PID (service mode 1 only).
#[derive(Debug, Clone, Default)]
pub struct ObdDecoderDictionary {
    pub pids: BTreeMap<u8, Vec<PidSignalRule>>,
    pub signal_ids_to_collect: HashSet<SignalId>,
}

impl ObdDecoderDictionary {
    /// PIDs that decode at least one signal an enabled scheme collects,
    /// sorted ascending.
    pub fn requested_pids(&self) -> Vec<u8> {
        self.pids
            .iter()
            .filter(|(_, rules)| {
                rules
                    .iter()
                    .any(|r| self.signal_ids_to_collect.contains(&r.signal_id))
            })
            .map(|(pid, _)| *pid)
            .collect()
    }
}

/// Rules for named custom data sources, keyed by (interface, decoder name).
#[derive(Debug, Clone, Default)]
pub struct CustomDecoderDictionary {
    pub decoders: HashMap<(String, String), CustomDecodingRule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomDecodingRule {
    pub signal_id: SignalId,
    pub signal_type: SignalType,
}

/// Resolution of device-synthesized partial signals back to their parent
/// structured signal and path.
#[derive(Debug, Clone, Default)]
pub struct ComplexDecoderDictionary {
    pub partial_signals: HashMap<SignalId, PartialSignalRule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartialSignalRule {
    pub parent_signal_id: SignalId,
    pub signal_path: Vec<u32>,
    pub interface_id: String,
    pub message_id: String,
}

/// The full per-protocol dictionary set published to data sources.
///
/// `None` for a protocol means "nothing to decode" — the corresponding
/// source goes to sleep until a non-empty dictionary arrives.
#[derive(Debug, Clone, Default)]
pub struct DecoderDictionaries {
    pub can: Option<Arc<CanDecoderDictionary>>,
    pub obd: Option<Arc<ObdDecoderDictionary>>,
    pub custom: Option<Arc<CustomDecoderDictionary>>,
    pub complex: Option<Arc<ComplexDecoderDictionary>>,
}

/// Allocates stable internal signal ids for `(parent, path)` partial-signal
/// references. Lives as long as the policy manager so ids stay stable across
/// scheme updates that reference the same path.
#[derive(Debug, Default)]
pub struct PartialSignalAllocator {
    by_reference: HashMap<(SignalId, Vec<u32>), SignalId>,
    next: SignalId,
}

impl PartialSignalAllocator {
    pub fn resolve(&mut self, parent: SignalId, path: &[u32]) -> SignalId {
        if let Some(id) = self.by_reference.get(&(parent, path.to_vec())) {
            return *id;
        }
        self.next += 1;
        let id = INTERNAL_SIGNAL_ID_BITMASK | self.next;
        self.by_reference.insert((parent, path.to_vec()), id);
        id
    }

    pub fn lookup(&self, parent: SignalId, path: &[u32]) -> Option<SignalId> {
        self.by_reference.get(&(parent, path.to_vec())).copied()
    }
}

/// Maps cloud-side interface names to the numeric channel ids used on the
/// hot path.
#[derive(Debug, Clone, Default)]
pub struct InterfaceTranslator {
    by_name: HashMap<String, u32>,
}

impl InterfaceTranslator {
    pub fn new(mappings: impl IntoIterator<Item = (String, u32)>) -> Self {
        Self {
            by_name: mappings.into_iter().collect(),
        }
    }

    pub fn channel_of(&self, interface_id: &str) -> Option<u32> {
        self.by_name.get(interface_id).copied()
    }
}

/// Builds the dictionaries for the given manifest restricted to the signals
/// referenced by `schemes` (the in-sync enabled schemes).
pub fn extract_dictionaries(
    manifest: &DecoderManifest,
    schemes: &[&CollectionScheme],
    translator: &InterfaceTranslator,
    allocator: &mut PartialSignalAllocator,
) -> DecoderDictionaries {
    let mut referenced: HashSet<SignalId> = HashSet::new();
    let mut complex = ComplexDecoderDictionary::default();

    for scheme in schemes {
        for info in &scheme.signals {
            if info.signal_path.is_empty() {
                referenced.insert(info.signal_id);
            } else {
                // Partial reference into a structured signal: synthesize a
                // stable internal id, deduplicated by (parent, path).
                let Some(parent) = manifest
                    .complex_signals
                    .iter()
                    .find(|c| c.signal_id == info.signal_id)
                else {
                    warn!(
                        signal_id = info.signal_id,
                        scheme_id = %scheme.scheme_id,
                        "partial reference to a signal that is not complex, skipping"
                    );
                    continue;
                };
                let internal = allocator.resolve(info.signal_id, &info.signal_path);
                complex.partial_signals.insert(
                    internal,
                    PartialSignalRule {
                        parent_signal_id: info.signal_id,
                        signal_path: info.signal_path.clone(),
                        interface_id: parent.interface_id.clone(),
                        message_id: parent.message_id.clone(),
                    },
                );
            }
        }
        for id in scheme.condition.referenced_signals() {
            referenced.insert(id);
        }
        for fetch in &scheme.fetch_informations {
            referenced.insert(fetch.target_signal_id);
            if let cloud_schema::FetchTrigger::Condition { condition, .. } = &fetch.trigger {
                for id in condition.referenced_signals() {
                    referenced.insert(id);
                }
            }
        }
    }

    let mut can = CanDecoderDictionary::default();
    let mut obd = ObdDecoderDictionary::default();
    let mut custom = CustomDecoderDictionary::default();

    for &signal_id in &referenced {
        if let Some(decoder) = manifest
            .can_signals
            .iter()
            .find(|s| s.signal_id == signal_id)
        {
            let Some(channel) = translator.channel_of(&decoder.interface_id) else {
                warn!(
                    interface = %decoder.interface_id,
                    signal_id,
                    "decoder manifest references an unconfigured CAN interface"
                );
                continue;
            };
            can.frames
                .entry(channel)
                .or_default()
                .entry(decoder.message_id)
                .or_default()
                .push(CanSignalRule {
                    signal_id,
                    start_bit: decoder.start_bit,
                    length: decoder.length,
                    is_big_endian: decoder.is_big_endian,
                    is_signed: decoder.is_signed,
                    factor: decoder.factor,
                    offset: decoder.offset,
                    signal_type: decoder.signal_type,
                    raw_signal_type: decoder.raw_signal_type,
                });
            can.signal_ids_to_collect.insert(signal_id);
        } else if let Some(decoder) = manifest
            .obd_signals
            .iter()
            .find(|s| s.signal_id == signal_id)
        {
            obd.pids.entry(decoder.pid).or_default().push(PidSignalRule {
                signal_id,
                pid: decoder.pid,
                pid_response_length: decoder.pid_response_length,
                scaling: decoder.scaling,
                offset: decoder.offset,
                start_byte: decoder.start_byte,
                byte_length: decoder.byte_length,
                bit_right_shift: decoder.bit_right_shift,
                bit_mask_length: decoder.bit_mask_length,
                is_signed: decoder.is_signed,
                signal_type: decoder.signal_type,
            });
            obd.signal_ids_to_collect.insert(signal_id);
        } else if let Some(decoder) = manifest
            .custom_signals
            .iter()
            .find(|s| s.signal_id == signal_id)
        {
            custom.decoders.insert(
                (decoder.interface_id.clone(), decoder.decoder_name.clone()),
                CustomDecodingRule {
                    signal_id,
                    signal_type: decoder.signal_type,
                },
            );
        } else if manifest
            .complex_signals
            .iter()
            .any(|s| s.signal_id == signal_id)
        {
            // Whole-signal complex references are handled by their partial
            // entries; nothing to decode at this level.
            trace!(signal_id, "complex signal referenced without a path");
        } else if !signal_core::is_internal_signal_id(signal_id) {
            warn!(signal_id, "scheme references a signal unknown to the manifest");
        }
    }

    DecoderDictionaries {
        can: (!can.frames.is_empty()).then(|| Arc::new(can)),
        obd: (!obd.pids.is_empty()).then(|| Arc::new(obd)),
        custom: (!custom.decoders.is_empty()).then(|| Arc::new(custom)),
        complex: (!complex.partial_signals.is_empty()).then(|| Arc::new(complex)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_schema::schemes::encode::{PolicySpec, SchemeSpec};
    use cloud_schema::schemes::SignalInformation;
    use cloud_schema::condition::encode::Node;
    use cloud_schema::manifest::{
        CanSignalDecoder, ComplexSignalDecoder, CustomSignalDecoder, PidSignalDecoder,
    };
    use cloud_schema::CollectionSchemeList;

    fn manifest() -> DecoderManifest {
        let mut m = DecoderManifest {
            sync_id: "DM1".into(),
            can_signals: vec![
                CanSignalDecoder {
                    signal_id: 1,
                    interface_id: "can0".into(),
                    message_id: 0x100,
                    is_big_endian: false,
                    is_signed: false,
                    start_bit: 0,
                    length: 8,
                    factor: 1.0,
                    offset: 0.0,
                    signal_type: SignalType::Double,
                    raw_signal_type: RawSignalType::Integer,
                },
                CanSignalDecoder {
                    signal_id: 2,
                    interface_id: "can0".into(),
                    message_id: 0x200,
                    is_big_endian: true,
                    is_signed: true,
                    start_bit: 8,
                    length: 16,
                    factor: 0.1,
                    offset: -40.0,
                    signal_type: SignalType::Double,
                    raw_signal_type: RawSignalType::Integer,
                },
            ],
            obd_signals: vec![PidSignalDecoder {
                signal_id: 3,
                service_mode: 1,
                pid: 0x0C,
                pid_response_length: 2,
                scaling: 0.25,
                offset: 0.0,
                start_byte: 0,
                byte_length: 2,
                bit_right_shift: 0,
                bit_mask_length: 8,
                is_signed: false,
                signal_type: SignalType::Double,
            }],
            custom_signals: vec![CustomSignalDecoder {
                signal_id: 4,
                interface_id: "LOC".into(),
                decoder_name: "Vehicle.Lat".into(),
                signal_type: SignalType::Double,
            }],
            complex_signals: vec![ComplexSignalDecoder {
                signal_id: 20,
                interface_id: "ros2".into(),
                message_id: "/imu".into(),
            }],
        };
        let bytes = cloud_schema::manifest::encode::manifest_to_bytes(&m);
        m = DecoderManifest::decode(&bytes).unwrap();
        m
    }

    fn scheme_with_signals(signals: &[SignalId]) -> CollectionScheme {
        let mut spec = SchemeSpec::new("s1", "DM1", 0, u64::MAX);
        spec.policy = PolicySpec::ConditionBased {
            minimum_interval_ms: 100,
            mode: cloud_schema::TriggerMode::Always,
            tree: Node::Bool(true),
        };
        for id in signals {
            spec = spec.with_signal(SignalInformation {
                signal_id: *id,
                sample_buffer_size: 1,
                ..Default::default()
            });
        }
        let bytes = cloud_schema::schemes::encode::list_to_bytes(&[spec]);
        CollectionSchemeList::decode(&bytes).unwrap().schemes.remove(0)
    }

    fn translator() -> InterfaceTranslator {
        InterfaceTranslator::new([("can0".to_string(), 10u32)])
    }

    #[test]
    fn dictionary_contains_only_referenced_frames() {
        let manifest = manifest();
        let scheme = scheme_with_signals(&[1]);
        let mut allocator = PartialSignalAllocator::default();
        let dicts = extract_dictionaries(&manifest, &[&scheme], &translator(), &mut allocator);

        let can = dicts.can.expect("can dictionary");
        assert!(can.rules_for(10, 0x100).is_some());
        // Signal 2 is in the manifest but no scheme wants it.
        assert!(can.rules_for(10, 0x200).is_none());
        assert_eq!(can.frame_count(), 1);
        assert!(dicts.obd.is_none());
    }

    #[test]
    fn obd_and_custom_partitions() {
        let manifest = manifest();
        let scheme = scheme_with_signals(&[3, 4]);
        let mut allocator = PartialSignalAllocator::default();
        let dicts = extract_dictionaries(&manifest, &[&scheme], &translator(), &mut allocator);

        assert!(dicts.can.is_none());
        let obd = dicts.obd.expect("obd dictionary");
        assert_eq!(obd.requested_pids(), vec![0x0C]);
        let custom = dicts.custom.expect("custom dictionary");
        assert_eq!(
            custom
                .decoders
                .get(&("LOC".to_string(), "Vehicle.Lat".to_string()))
                .map(|r| r.signal_id),
            Some(4)
        );
    }

    #[test]
    fn condition_only_signals_still_decode() {
        let manifest = manifest();
        let mut spec = SchemeSpec::new("s1", "DM1", 0, u64::MAX);
        spec.policy = PolicySpec::ConditionBased {
            minimum_interval_ms: 100,
            mode: cloud_schema::TriggerMode::Always,
            tree: Node::signal_greater(2, 0.0),
        };
        let bytes = cloud_schema::schemes::encode::list_to_bytes(&[spec]);
        let scheme = CollectionSchemeList::decode(&bytes).unwrap().schemes.remove(0);

        let mut allocator = PartialSignalAllocator::default();
        let dicts = extract_dictionaries(&manifest, &[&scheme], &translator(), &mut allocator);
        let can = dicts.can.expect("can dictionary");
        assert!(can.rules_for(10, 0x200).is_some());
    }

    #[test]
    fn partial_signal_ids_are_stable_across_schemes() {
        let manifest = manifest();
        let make_partial_scheme = |name: &str| {
            let spec = SchemeSpec::new(name, "DM1", 0, u64::MAX).with_signal(SignalInformation {
                signal_id: 20,
                sample_buffer_size: 1,
                signal_path: vec![1, 2],
                ..Default::default()
            });
            let bytes = cloud_schema::schemes::encode::list_to_bytes(&[spec]);
            CollectionSchemeList::decode(&bytes).unwrap().schemes.remove(0)
        };
        let a = make_partial_scheme("a");
        let b = make_partial_scheme("b");

        let mut allocator = PartialSignalAllocator::default();
        let dicts = extract_dictionaries(&manifest, &[&a, &b], &translator(), &mut allocator);
        let complex = dicts.complex.expect("complex dictionary");
        assert_eq!(complex.partial_signals.len(), 1);
        let (internal, rule) = complex.partial_signals.iter().next().unwrap();
        assert!(signal_core::is_internal_signal_id(*internal));
        assert_eq!(rule.parent_signal_id, 20);
        assert_eq!(rule.signal_path, vec![1, 2]);

        // A second extraction resolves to the same internal id.
        let id_before = allocator.lookup(20, &[1, 2]).unwrap();
        let _ = extract_dictionaries(&manifest, &[&a], &translator(), &mut allocator);
        assert_eq!(allocator.lookup(20, &[1, 2]).unwrap(), id_before);
    }

    #[test]
    fn empty_scheme_set_yields_no_dictionaries() {
        let manifest = manifest();
        let mut allocator = PartialSignalAllocator::default();
        let dicts = extract_dictionaries(&manifest, &[], &translator(), &mut allocator);
        assert!(dicts.can.is_none());
        assert!(dicts.obd.is_none());
        assert!(dicts.custom.is_none());
        assert!(dicts.complex.is_none());
    }
}
