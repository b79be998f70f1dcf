//! End-to-end pipeline test without bus sockets: cloud documents go into
//! the policy manager, frames are decoded against the published dictionary
//! and the trigger engine produces payloads.

use std::sync::Arc;

use cloud_schema::condition::encode::Node;
use cloud_schema::manifest::{encode as manifest_encode, CanSignalDecoder};
use cloud_schema::schemes::encode::{list_to_bytes, PolicySpec, SchemeSpec};
use cloud_schema::schemes::SignalInformation;
use cloud_schema::{DecoderManifest, TriggerMode};
use inspection_engine::{CustomFunctionRegistry, SampleStore};
use policy_manager::{InterfaceTranslator, PolicyManager};
use signal_core::{RawSignalType, SignalType, TestClock};
use tokio::sync::watch;
use uplink::FileBlobStore;

fn manifest_bytes() -> Vec<u8> {
    let manifest = DecoderManifest {
        sync_id: "DM1".to_string(),
        can_signals: vec![CanSignalDecoder {
            signal_id: 5,
            interface_id: "10".into(),
            message_id: 0x100,
            is_big_endian: false,
            is_signed: false,
            start_bit: 0,
            length: 8,
            factor: 1.0,
            offset: 0.0,
            signal_type: SignalType::Double,
            raw_signal_type: RawSignalType::Integer,
        }],
        ..Default::default()
    };
    manifest_encode::manifest_to_bytes(&manifest)
}

fn heartbeat_scheme() -> Vec<u8> {
    let mut spec = SchemeSpec::new("heartbeat", "DM1", 0, u64::MAX).with_signal(SignalInformation {
        signal_id: 5,
        sample_buffer_size: 1,
        ..Default::default()
    });
    spec.policy = PolicySpec::TimeBased { period_ms: 1_000 };
    list_to_bytes(&[spec])
}

#[test]
fn heartbeat_payloads_from_frame_to_uplink() {
    let clock = TestClock::new(1_000);
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileBlobStore::new(dir.path()).unwrap());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let (mut manager, inbox, outputs) = PolicyManager::new(
        clock.clone(),
        store,
        InterfaceTranslator::new([("10".to_string(), 10u32)]),
        1_000,
        shutdown_rx,
    );

    inbox.post_manifest(manifest_bytes());
    inbox.post_scheme_list(heartbeat_scheme());
    manager.rebuild_pass(true);

    // Dictionary contains exactly the heartbeat frame.
    let dictionaries = outputs.dictionaries.borrow().clone();
    let can = dictionaries.can.expect("can dictionary published");
    assert_eq!(can.frame_count(), 1);

    // Checkin announces both documents.
    let docs = outputs.checkin_documents.borrow().clone();
    assert_eq!(docs, vec!["heartbeat".to_string(), "DM1".to_string()]);

    // Frames at t = 1000, 2000, 3000 carrying 0x2A decode to 42.0 samples.
    let matrix = outputs.inspection.borrow().clone();
    let mut sample_store = SampleStore::default();
    sample_store.reconfigure(&matrix);
    let registry = CustomFunctionRegistry::default();

    for t in [1_000u64, 2_000, 3_000] {
        let samples = can_adapter::decoder::decode_frame(
            &can,
            10,
            0x100,
            &[0x2A, 0, 0, 0, 0, 0, 0, 0],
            t,
        )
        .expect("frame has rules");
        assert_eq!(samples.len(), 1);
        for sample in samples {
            sample_store.insert(sample);
        }
        // The compiled heartbeat condition is always-true and fires.
        let condition = &matrix.conditions[0];
        assert_eq!(condition.minimum_trigger_interval_ms, 1_000);
        assert!(inspection_engine::evaluate_as_trigger(
            &condition.condition,
            &sample_store,
            &registry,
        ));
        let latest = sample_store.latest(5).expect("sample buffered");
        assert_eq!(latest.timestamp_ms, t);
        assert_eq!(latest.value.as_f64(), 42.0);
    }
}

#[test]
fn condition_scheme_round_trip_through_documents() {
    // A condition-based scheme decoded from wire bytes references the same
    // signal the manifest decodes, and the published matrix evaluates it.
    let clock = TestClock::new(1_000);
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileBlobStore::new(dir.path()).unwrap());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let (mut manager, inbox, outputs) = PolicyManager::new(
        clock,
        store,
        InterfaceTranslator::new([("10".to_string(), 10u32)]),
        1_000,
        shutdown_rx,
    );

    let mut spec = SchemeSpec::new("speeding", "DM1", 0, u64::MAX).with_signal(SignalInformation {
        signal_id: 5,
        sample_buffer_size: 4,
        ..Default::default()
    });
    spec.policy = PolicySpec::ConditionBased {
        minimum_interval_ms: 100,
        mode: TriggerMode::RisingEdge,
        tree: Node::signal_greater(5, 10.0),
    };

    inbox.post_manifest(manifest_bytes());
    inbox.post_scheme_list(list_to_bytes(&[spec]));
    manager.rebuild_pass(true);

    let matrix = outputs.inspection.borrow().clone();
    assert_eq!(matrix.conditions.len(), 1);
    let condition = &matrix.conditions[0];
    assert_eq!(condition.trigger_mode, TriggerMode::RisingEdge);

    let mut sample_store = SampleStore::default();
    sample_store.reconfigure(&matrix);
    let registry = CustomFunctionRegistry::default();
    assert!(!inspection_engine::evaluate_as_trigger(
        &condition.condition,
        &sample_store,
        &registry,
    ));

    sample_store.insert(signal_core::Sample::new(
        5,
        1_000,
        signal_core::SignalValue::Double(12.0),
    ));
    assert!(inspection_engine::evaluate_as_trigger(
        &condition.condition,
        &sample_store,
        &registry,
    ));
}
