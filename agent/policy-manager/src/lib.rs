//! Policy manager: turns cloud schema documents into the runtime artifacts
//! the rest of the agent consumes.
//!
//! One long-lived task owns the decoder manifest, the collection scheme maps
//! (Enabled / Idle) and the activation timeline. Inputs arrive through
//! single-slot mailboxes; outputs are immutable snapshots published on watch
//! channels:
//!
//!   [cloud receiver] → SchemaInbox → PolicyManager ─┬→ DecoderDictionaries → bus adapters
//!                                                   ├→ InspectionMatrix    → trigger engine
//!                                                   ├→ FetchMatrix         → fetchers
//!                                                   └→ checkin documents   → checkin sender
//!
//! The timeline is the only thing that flips schemes between Idle and
//! Enabled. Scheme updates never modify heap entries; stale entries are
//! recognized on pop because their time no longer matches the scheme's
//! current start/expiry.

pub mod dictionary;
pub mod fetch;
pub mod inspection;
pub mod mailbox;
pub mod timeline;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use cloud_schema::{CollectionScheme, CollectionSchemeList, DecoderManifest, SyncId};
use signal_core::{Clock, TimePoint};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};
use uplink::{BlobStore, SchemaKind};

pub use dictionary::{
    CanDecoderDictionary, CanSignalRule, ComplexDecoderDictionary, CustomDecoderDictionary,
    DecoderDictionaries, InterfaceTranslator, ObdDecoderDictionary, PartialSignalAllocator,
    PidSignalRule,
};
pub use fetch::{FetchDirective, FetchMatrix};
pub use inspection::{InspectionCondition, InspectionMatrix, SignalSpec};
pub use mailbox::SchemaInbox;

use timeline::Timeline;

/// Read sides of everything the policy manager publishes.
#[derive(Clone)]
pub struct PolicyOutputs {
    pub dictionaries: watch::Receiver<DecoderDictionaries>,
    pub inspection: watch::Receiver<Arc<InspectionMatrix>>,
    pub fetch: watch::Receiver<Arc<FetchMatrix>>,
    pub checkin_documents: watch::Receiver<Vec<SyncId>>,
}

pub struct PolicyManager {
    clock: Arc<dyn Clock>,
    store: Arc<dyn BlobStore>,
    inbox: Arc<SchemaInbox>,
    translator: InterfaceTranslator,
    idle_time_ms: u64,

    enabled: BTreeMap<SyncId, CollectionScheme>,
    idle: BTreeMap<SyncId, CollectionScheme>,
    timeline: Timeline,
    manifest: Option<DecoderManifest>,
    allocator: PartialSignalAllocator,
    last_state_templates_version: u64,

    dictionaries_tx: watch::Sender<DecoderDictionaries>,
    inspection_tx: watch::Sender<Arc<InspectionMatrix>>,
    fetch_tx: watch::Sender<Arc<FetchMatrix>>,
    checkin_tx: watch::Sender<Vec<SyncId>>,
    shutdown: watch::Receiver<bool>,
}

const DEFAULT_IDLE_TIME_MS: u64 = 1_000;

impl PolicyManager {
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Arc<dyn BlobStore>,
        translator: InterfaceTranslator,
        idle_time_ms: u64,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, Arc<SchemaInbox>, PolicyOutputs) {
        let inbox = Arc::new(SchemaInbox::default());
        let (dictionaries_tx, dictionaries_rx) = watch::channel(DecoderDictionaries::default());
        let (inspection_tx, inspection_rx) = watch::channel(Arc::new(InspectionMatrix::default()));
        let (fetch_tx, fetch_rx) = watch::channel(Arc::new(FetchMatrix::default()));
        let (checkin_tx, checkin_rx) = watch::channel(Vec::new());

        let manager = Self {
            clock,
            store,
            inbox: Arc::clone(&inbox),
            translator,
            idle_time_ms: if idle_time_ms == 0 {
                DEFAULT_IDLE_TIME_MS
            } else {
                idle_time_ms
            },
            enabled: BTreeMap::new(),
            idle: BTreeMap::new(),
            timeline: Timeline::default(),
            manifest: None,
            allocator: PartialSignalAllocator::default(),
            last_state_templates_version: 0,
            dictionaries_tx,
            inspection_tx,
            fetch_tx,
            checkin_tx,
            shutdown,
        };
        let outputs = PolicyOutputs {
            dictionaries: dictionaries_rx,
            inspection: inspection_rx,
            fetch: fetch_rx,
            checkin_documents: checkin_rx,
        };
        (manager, inbox, outputs)
    }

    pub async fn run(mut self) {
        info!("policy manager started");
        self.bootstrap_from_persistence();

        let mut first_pass = true;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.rebuild_pass(first_pass);
            first_pass = false;

            let now_ms = self.clock.system_time_ms();
            match self.timeline.peek() {
                Some(entry) if now_ms >= entry.time_ms => {
                    // Next activation already due, go straight into the
                    // next pass.
                    continue;
                }
                Some(entry) => {
                    let wait_ms = (entry.time_ms - now_ms).min(self.idle_time_ms);
                    trace!(wait_ms, "waiting for next timeline entry");
                    tokio::select! {
                        _ = self.inbox.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
                        _ = self.shutdown.changed() => break,
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.inbox.notified() => {}
                        _ = self.shutdown.changed() => break,
                    }
                }
            }
        }
        info!("policy manager stopped");
    }

    /// Loads previously persisted schema documents and queues them as if
    /// they had just arrived from the cloud.
    fn bootstrap_from_persistence(&mut self) {
        match self.store.get_schema(SchemaKind::CollectionSchemeList) {
            Ok(Some(bytes)) => self.inbox.post_scheme_list(bytes),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "could not retrieve persisted scheme list"),
        }
        match self.store.get_schema(SchemaKind::DecoderManifest) {
            Ok(Some(bytes)) => self.inbox.post_manifest(bytes),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "could not retrieve persisted decoder manifest"),
        }
    }

    /// One wake-up of the manager: consume pending inputs, service the
    /// timeline, re-extract artifacts if anything changed.
    pub fn rebuild_pass(&mut self, first_pass: bool) {
        let mut decoder_changed = false;
        let mut schemes_changed = false;

        if let Some(bytes) = self.inbox.take_manifest() {
            decoder_changed = self.process_manifest(&bytes);
        }
        if let Some(bytes) = self.inbox.take_scheme_list() {
            schemes_changed = self.process_scheme_list(&bytes);
        }
        if let Some(bytes) = self.inbox.take_state_templates() {
            self.process_state_templates(&bytes);
        }

        if self.check_timeline(self.clock.time_point()) {
            schemes_changed = true;
        }

        let documents_changed = decoder_changed || schemes_changed;
        if documents_changed || first_pass {
            self.update_checkin_documents();
        }
        if documents_changed {
            self.extract_and_publish();
        }
    }

    fn process_manifest(&mut self, bytes: &[u8]) -> bool {
        let manifest = match DecoderManifest::decode(bytes) {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "failed to build incoming decoder manifest");
                metrics::counter!("canflux.policy.schema_errors").increment(1);
                return false;
            }
        };
        if let Some(current) = &self.manifest {
            if current.sync_id == manifest.sync_id {
                trace!(sync_id = %manifest.sync_id, "ignoring decoder manifest with same id");
                return false;
            }
        }
        info!(
            old = %self.manifest.as_ref().map(|m| m.sync_id.as_str()).unwrap_or(""),
            new = %manifest.sync_id,
            enabled = self.enabled.len(),
            idle = self.idle.len(),
            "replacing decoder manifest"
        );
        if let Err(e) = self.store.put_schema(SchemaKind::DecoderManifest, bytes) {
            warn!(error = %e, "could not persist decoder manifest");
        }
        self.manifest = Some(manifest);
        true
    }

    fn process_scheme_list(&mut self, bytes: &[u8]) -> bool {
        let list = match CollectionSchemeList::decode(bytes) {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "incoming collection scheme list failed to build");
                metrics::counter!("canflux.policy.schema_errors").increment(1);
                return false;
            }
        };
        if let Err(e) = self.store.put_schema(SchemaKind::CollectionSchemeList, bytes) {
            warn!(error = %e, "could not persist collection scheme list");
        }
        let now = self.clock.time_point();
        if self.enabled.is_empty() && self.idle.is_empty() {
            self.rebuild_maps_and_timeline(list, now)
        } else {
            self.update_maps_and_timeline(list, now)
        }
    }

    fn process_state_templates(&mut self, bytes: &[u8]) {
        // Last-known-state collection is handled by an external collaborator;
        // the diff is only version-gated and persisted here.
        let mut pos = 0usize;
        let version = cloud_schema::proto::read_varint(bytes, &mut pos).unwrap_or(0);
        if version < self.last_state_templates_version {
            trace!(
                version,
                current = self.last_state_templates_version,
                "ignoring state templates diff older than current"
            );
            return;
        }
        self.last_state_templates_version = version;
        if let Err(e) = self.store.put_schema(SchemaKind::StateTemplateList, bytes) {
            warn!(error = %e, "could not persist state template list");
        }
    }

    /// Sorts schemes into Enabled/Idle from scratch. Returns true when a
    /// scheme was activated immediately.
    fn rebuild_maps_and_timeline(&mut self, list: CollectionSchemeList, now: TimePoint) -> bool {
        let mut changed = false;
        for scheme in list.schemes {
            let id = scheme.scheme_id.clone();
            let start = scheme.start_time_ms;
            let stop = scheme.expiry_time_ms;
            if start > now.system_time_ms {
                self.timeline.push(start, id.clone());
                self.timeline.push(stop, id.clone());
                self.idle.insert(id, scheme);
            } else if stop > now.system_time_ms {
                // Start time already passed: enable immediately.
                self.timeline.push(stop, id.clone());
                self.enabled.insert(id, scheme);
                changed = true;
            }
            // Already expired schemes are dropped on the floor.
        }
        self.log_scheme_maps();
        changed
    }

    /// Applies an updated scheme list against the loaded maps. Returns true
    /// when the enabled map changed.
    fn update_maps_and_timeline(&mut self, list: CollectionSchemeList, now: TimePoint) -> bool {
        let mut changed = false;
        let mut seen: HashSet<SyncId> = HashSet::new();

        for scheme in list.schemes {
            let id = scheme.scheme_id.clone();
            let start = scheme.start_time_ms;
            let stop = scheme.expiry_time_ms;
            seen.insert(id.clone());

            if let Some(current) = self.enabled.get(&id) {
                // Already running: only the expiry matters.
                if stop <= now.system_time_ms {
                    debug!(scheme_id = %id, stop, "stopping enabled scheme now");
                    self.enabled.remove(&id);
                    changed = true;
                } else {
                    if stop != current.expiry_time_ms {
                        self.timeline.push(stop, id.clone());
                    }
                    if scheme != *current {
                        changed = true;
                    }
                    self.enabled.insert(id, scheme);
                }
            } else if let Some(current) = self.idle.get(&id) {
                if start <= now.system_time_ms && stop > now.system_time_ms {
                    debug!(scheme_id = %id, "starting idle scheme now");
                    self.idle.remove(&id);
                    self.timeline.push(stop, id.clone());
                    self.enabled.insert(id, scheme);
                    changed = true;
                } else if start > now.system_time_ms
                    && (start != current.start_time_ms || stop != current.expiry_time_ms)
                {
                    self.timeline.push(start, id.clone());
                    self.timeline.push(stop, id.clone());
                    self.idle.insert(id, scheme);
                } else {
                    self.idle.insert(id, scheme);
                }
            } else {
                // Brand new scheme; it may already be overdue.
                debug!(scheme_id = %id, start, stop, "adding new scheme");
                if start <= now.system_time_ms && stop > now.system_time_ms {
                    self.timeline.push(stop, id.clone());
                    self.enabled.insert(id, scheme);
                    changed = true;
                } else if start > now.system_time_ms {
                    self.timeline.push(start, id.clone());
                    self.timeline.push(stop, id.clone());
                    self.idle.insert(id, scheme);
                }
            }
        }

        // Schemes missing from the update are unloaded.
        let removed_idle: Vec<SyncId> = self
            .idle
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in removed_idle {
            debug!(scheme_id = %id, "removing idle scheme missing from update");
            self.idle.remove(&id);
        }
        let removed_enabled: Vec<SyncId> = self
            .enabled
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in removed_enabled {
            debug!(scheme_id = %id, "removing enabled scheme missing from update");
            self.enabled.remove(&id);
            changed = true;
        }

        self.log_scheme_maps();
        changed
    }

    /// Services the timeline: pops every due entry, discards stale ones and
    /// flips valid ones. Returns true when the enabled map changed.
    fn check_timeline(&mut self, now: TimePoint) -> bool {
        let mut changed = false;
        if self
            .timeline
            .peek()
            .map_or(true, |top| now.system_time_ms < top.time_ms)
        {
            return false;
        }
        while let Some(top) = self.timeline.peek().cloned() {
            let (found_in_enabled, time_of_interest) =
                if let Some(scheme) = self.enabled.get(&top.scheme_id) {
                    (true, scheme.expiry_time_ms)
                } else if let Some(scheme) = self.idle.get(&top.scheme_id) {
                    (false, scheme.start_time_ms)
                } else {
                    // Unloaded earlier; the entry is obsolete.
                    trace!(scheme_id = %top.scheme_id, "timeline entry for unloaded scheme");
                    self.timeline.pop();
                    continue;
                };

            if time_of_interest != top.time_ms {
                // Start/expiry was updated after this entry was pushed.
                trace!(
                    scheme_id = %top.scheme_id,
                    entry_time = top.time_ms,
                    current_time = time_of_interest,
                    "discarding stale timeline entry"
                );
                self.timeline.pop();
                continue;
            }

            if top.time_ms > now.system_time_ms {
                // Next valid entry is in the future; it sets the timer.
                break;
            }

            changed = true;
            if found_in_enabled {
                info!(scheme_id = %top.scheme_id, at = top.time_ms, "disabling expired scheme");
                self.enabled.remove(&top.scheme_id);
            } else if let Some(scheme) = self.idle.remove(&top.scheme_id) {
                // The expiry entry was pushed together with this start entry,
                // so nothing new goes onto the heap here.
                info!(scheme_id = %top.scheme_id, at = top.time_ms, "enabling idle scheme");
                self.enabled.insert(top.scheme_id.clone(), scheme);
            }
            self.timeline.pop();
        }
        changed
    }

    fn extract_and_publish(&mut self) {
        let started = self.clock.monotonic_ms();

        let (dictionaries, matrix, fetch_matrix) = match &self.manifest {
            Some(manifest) => {
                let schemes = in_sync_enabled(&self.enabled, manifest);
                let dictionaries = dictionary::extract_dictionaries(
                    manifest,
                    &schemes,
                    &self.translator,
                    &mut self.allocator,
                );
                let matrix = inspection::extract_inspection_matrix(&schemes, &mut self.allocator);
                let fetch_matrix = fetch::extract_fetch_matrix(&schemes);
                (dictionaries, matrix, fetch_matrix)
            }
            None => (
                DecoderDictionaries::default(),
                InspectionMatrix::default(),
                FetchMatrix::default(),
            ),
        };

        info!(
            enabled = self.enabled.len(),
            idle = self.idle.len(),
            conditions = matrix.conditions.len(),
            can_frames = dictionaries.can.as_ref().map_or(0, |d| d.frame_count()),
            obd_pids = dictionaries.obd.as_ref().map_or(0, |d| d.pids.len()),
            fetch_directives = fetch_matrix.directives.len(),
            elapsed_ms = self.clock.monotonic_ms() - started,
            "activated collection schemes"
        );

        // Dictionary first: sources must be able to decode everything the
        // inspection matrix is about to reference.
        let _ = self.dictionaries_tx.send(dictionaries);
        let _ = self.inspection_tx.send(Arc::new(matrix));
        let _ = self.fetch_tx.send(Arc::new(fetch_matrix));
    }

    fn update_checkin_documents(&mut self) {
        let mut documents: Vec<SyncId> = Vec::with_capacity(self.enabled.len() + self.idle.len() + 1);
        documents.extend(self.enabled.keys().cloned());
        documents.extend(self.idle.keys().cloned());
        if let Some(manifest) = &self.manifest {
            documents.push(manifest.sync_id.clone());
        }
        self.checkin_tx.send_if_modified(|current| {
            if *current == documents {
                false
            } else {
                *current = documents;
                true
            }
        });
    }

    fn log_scheme_maps(&self) {
        if tracing::enabled!(tracing::Level::TRACE) {
            let enabled: Vec<&str> = self.enabled.keys().map(String::as_str).collect();
            let idle: Vec<&str> = self.idle.keys().map(String::as_str).collect();
            trace!(?enabled, ?idle, "scheme maps");
        }
    }

    #[cfg(test)]
    fn enabled_ids(&self) -> Vec<SyncId> {
        self.enabled.keys().cloned().collect()
    }

    #[cfg(test)]
    fn idle_ids(&self) -> Vec<SyncId> {
        self.idle.keys().cloned().collect()
    }
}

/// Enabled schemes whose manifest reference matches the active manifest.
fn in_sync_enabled<'a>(
    enabled: &'a BTreeMap<SyncId, CollectionScheme>,
    manifest: &DecoderManifest,
) -> Vec<&'a CollectionScheme> {
    enabled
        .values()
        .filter(|scheme| {
            let in_sync = scheme.manifest_id == manifest.sync_id;
            if !in_sync {
                warn!(
                    scheme_id = %scheme.scheme_id,
                    wants = %scheme.manifest_id,
                    active = %manifest.sync_id,
                    "scheme decoder manifest out of sync, excluding from inspection"
                );
            }
            in_sync
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_schema::condition::encode::Node;
    use cloud_schema::manifest::{encode as manifest_encode, CanSignalDecoder};
    use cloud_schema::schemes::encode::{list_to_bytes, PolicySpec, SchemeSpec};
    use cloud_schema::schemes::SignalInformation;
    use cloud_schema::TriggerMode;
    use signal_core::{RawSignalType, SignalType, TestClock, Timestamp};
    use uplink::FileBlobStore;

    struct Fixture {
        clock: Arc<TestClock>,
        manager: PolicyManager,
        outputs: PolicyOutputs,
        inbox: Arc<SchemaInbox>,
        _shutdown_tx: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    fn fixture(start_ms: Timestamp) -> Fixture {
        let clock = TestClock::new(start_ms);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileBlobStore::new(dir.path()).unwrap());
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (manager, inbox, outputs) = PolicyManager::new(
            clock.clone(),
            store,
            InterfaceTranslator::new([("can0".to_string(), 10u32)]),
            1_000,
            shutdown,
        );
        Fixture {
            clock,
            manager,
            outputs,
            inbox,
            _shutdown_tx: shutdown_tx,
            _dir: dir,
        }
    }

    fn manifest_bytes(sync_id: &str) -> Vec<u8> {
        let manifest = DecoderManifest {
            sync_id: sync_id.to_string(),
            can_signals: vec![CanSignalDecoder {
                signal_id: 5,
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
            }],
            ..Default::default()
        };
        manifest_encode::manifest_to_bytes(&manifest)
    }

    fn scheme_spec(id: &str, start: Timestamp, stop: Timestamp) -> SchemeSpec {
        let mut spec = SchemeSpec::new(id, "DM1", start, stop).with_signal(SignalInformation {
            signal_id: 5,
            sample_buffer_size: 1,
            ..Default::default()
        });
        spec.policy = PolicySpec::ConditionBased {
            minimum_interval_ms: 100,
            mode: TriggerMode::Always,
            tree: Node::signal_greater(5, 10.0),
        };
        spec
    }

    #[test]
    fn scheme_activates_and_expires_via_timeline() {
        let mut f = fixture(500);
        f.inbox.post_manifest(manifest_bytes("DM1"));
        f.inbox
            .post_scheme_list(list_to_bytes(&[scheme_spec("p1", 1_000, 5_000)]));
        f.manager.rebuild_pass(true);

        assert_eq!(f.manager.idle_ids(), vec!["p1"]);
        assert!(f.manager.enabled_ids().is_empty());

        f.clock.set_system_time(1_000);
        f.manager.rebuild_pass(false);
        assert_eq!(f.manager.enabled_ids(), vec!["p1"]);
        assert_eq!(f.outputs.inspection.borrow().conditions.len(), 1);

        f.clock.set_system_time(5_000);
        f.manager.rebuild_pass(false);
        assert!(f.manager.enabled_ids().is_empty());
        assert!(f.manager.idle_ids().is_empty());
        assert!(f.outputs.inspection.borrow().conditions.is_empty());
    }

    #[test]
    fn updated_expiry_obsoletes_old_timeline_entry() {
        // p1 starts at 1000 and expires at 5000; an update at t=2000 moves
        // the expiry to 3000. The old entry at 5000 is discarded as stale.
        let mut f = fixture(500);
        f.inbox.post_manifest(manifest_bytes("DM1"));
        f.inbox
            .post_scheme_list(list_to_bytes(&[scheme_spec("p1", 1_000, 5_000)]));
        f.manager.rebuild_pass(true);

        f.clock.set_system_time(2_000);
        f.manager.rebuild_pass(false);
        assert_eq!(f.manager.enabled_ids(), vec!["p1"]);

        f.inbox
            .post_scheme_list(list_to_bytes(&[scheme_spec("p1", 1_000, 3_000)]));
        f.manager.rebuild_pass(false);

        f.clock.set_system_time(2_500);
        f.manager.rebuild_pass(false);
        assert_eq!(f.manager.enabled_ids(), vec!["p1"]);

        f.clock.set_system_time(3_000);
        f.manager.rebuild_pass(false);
        assert!(f.manager.enabled_ids().is_empty());

        // The stale entry at 5000 must not resurrect anything.
        f.clock.set_system_time(5_000);
        f.manager.rebuild_pass(false);
        assert!(f.manager.enabled_ids().is_empty());
        assert!(f.manager.timeline.is_empty());
    }

    #[test]
    fn out_of_sync_scheme_is_loaded_but_not_inspected() {
        // The scheme references DM2 while DM1 is active.
        let mut f = fixture(1_000);
        f.inbox.post_manifest(manifest_bytes("DM1"));
        let mut spec = scheme_spec("s-dm2", 0, u64::MAX);
        spec.manifest_id = "DM2".into();
        f.inbox.post_scheme_list(list_to_bytes(&[spec]));
        f.manager.rebuild_pass(true);

        assert_eq!(f.manager.enabled_ids(), vec!["s-dm2"]);
        assert!(f.outputs.inspection.borrow().conditions.is_empty());
        // Checkin still lists the out-of-sync scheme.
        let docs = f.outputs.checkin_documents.borrow().clone();
        assert!(docs.contains(&"s-dm2".to_string()));
        assert!(docs.contains(&"DM1".to_string()));
    }

    #[test]
    fn same_manifest_id_is_ignored() {
        let mut f = fixture(1_000);
        f.inbox.post_manifest(manifest_bytes("DM1"));
        f.manager.rebuild_pass(true);
        let before = f.outputs.dictionaries.borrow().can.is_some();

        f.inbox.post_manifest(manifest_bytes("DM1"));
        f.manager.rebuild_pass(false);
        assert_eq!(f.outputs.dictionaries.borrow().can.is_some(), before);
    }

    #[test]
    fn checkin_lists_enabled_idle_and_manifest() {
        let mut f = fixture(1_000);
        f.inbox.post_manifest(manifest_bytes("DM1"));
        f.inbox.post_scheme_list(list_to_bytes(&[
            scheme_spec("active", 0, u64::MAX),
            scheme_spec("later", 10_000, 20_000),
        ]));
        f.manager.rebuild_pass(true);

        let docs = f.outputs.checkin_documents.borrow().clone();
        assert_eq!(docs, vec!["active".to_string(), "later".to_string(), "DM1".to_string()]);
    }

    #[test]
    fn malformed_documents_leave_state_untouched() {
        let mut f = fixture(1_000);
        f.inbox.post_manifest(manifest_bytes("DM1"));
        f.inbox
            .post_scheme_list(list_to_bytes(&[scheme_spec("good", 0, u64::MAX)]));
        f.manager.rebuild_pass(true);
        assert_eq!(f.manager.enabled_ids(), vec!["good"]);

        f.inbox.post_manifest(vec![0xFF, 0xFF, 0xFF]);
        f.inbox.post_scheme_list(vec![0xFF, 0xFF, 0xFF]);
        f.manager.rebuild_pass(false);
        assert_eq!(f.manager.enabled_ids(), vec!["good"]);
        assert_eq!(f.manager.manifest.as_ref().unwrap().sync_id, "DM1");
    }

    #[test]
    fn removed_schemes_are_unloaded_on_update() {
        let mut f = fixture(1_000);
        f.inbox.post_manifest(manifest_bytes("DM1"));
        f.inbox.post_scheme_list(list_to_bytes(&[
            scheme_spec("a", 0, u64::MAX),
            scheme_spec("b", 0, u64::MAX),
        ]));
        f.manager.rebuild_pass(true);
        assert_eq!(f.manager.enabled_ids(), vec!["a", "b"]);

        f.inbox
            .post_scheme_list(list_to_bytes(&[scheme_spec("b", 0, u64::MAX)]));
        f.manager.rebuild_pass(false);
        assert_eq!(f.manager.enabled_ids(), vec!["b"]);
    }

    #[test]
    fn dictionary_covers_only_enabled_schemes() {
        let mut f = fixture(1_000);
        f.inbox.post_manifest(manifest_bytes("DM1"));
        f.inbox
            .post_scheme_list(list_to_bytes(&[scheme_spec("later", 10_000, 20_000)]));
        f.manager.rebuild_pass(true);
        // Only an idle scheme exists: nothing to decode yet.
        assert!(f.outputs.dictionaries.borrow().can.is_none());

        f.clock.set_system_time(10_000);
        f.manager.rebuild_pass(false);
        assert!(f.outputs.dictionaries.borrow().can.is_some());
    }

    #[test]
    fn persisted_documents_bootstrap_on_start() {
        let clock = TestClock::new(1_000);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileBlobStore::new(dir.path()).unwrap());
        store
            .put_schema(SchemaKind::DecoderManifest, &manifest_bytes("DM1"))
            .unwrap();
        store
            .put_schema(
                SchemaKind::CollectionSchemeList,
                &list_to_bytes(&[scheme_spec("persisted", 0, u64::MAX)]),
            )
            .unwrap();

        let (_shutdown_tx, shutdown) = watch::channel(false);
        let (mut manager, _inbox, outputs) = PolicyManager::new(
            clock,
            store,
            InterfaceTranslator::new([("can0".to_string(), 10u32)]),
            1_000,
            shutdown,
        );
        manager.bootstrap_from_persistence();
        manager.rebuild_pass(true);
        assert_eq!(manager.enabled_ids(), vec!["persisted"]);
        assert_eq!(outputs.inspection.borrow().conditions.len(), 1);
    }

    #[test]
    fn at_most_one_manifest_switch_per_pass() {
        // Two manifests posted between wake-ups: only the latest is visible,
        // the intermediate one is never activated.
        let mut f = fixture(1_000);
        f.inbox.post_manifest(manifest_bytes("DM1"));
        f.manager.rebuild_pass(true);
        assert_eq!(f.manager.manifest.as_ref().unwrap().sync_id, "DM1");

        f.inbox.post_manifest(manifest_bytes("DM2"));
        f.inbox.post_manifest(manifest_bytes("DM3"));
        f.manager.rebuild_pass(false);
        assert_eq!(f.manager.manifest.as_ref().unwrap().sync_id, "DM3");
    }

    #[test]
    fn state_templates_are_version_gated() {
        let mut f = fixture(1_000);
        let mut v2 = Vec::new();
        cloud_schema::proto::write_varint(&mut v2, 2);
        f.inbox.post_state_templates(v2);
        f.manager.rebuild_pass(true);
        assert_eq!(f.manager.last_state_templates_version, 2);

        let mut v1 = Vec::new();
        cloud_schema::proto::write_varint(&mut v1, 1);
        f.inbox.post_state_templates(v1);
        f.manager.rebuild_pass(false);
        assert_eq!(f.manager.last_state_templates_version, 2);
    }
}
