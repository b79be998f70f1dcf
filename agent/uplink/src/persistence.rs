//! Blob persistence for schema documents and undelivered payloads.
//!
//! Layout under the configured root directory:
//!   decoder-manifest.bin
//!   collection-scheme-list.bin
//!   state-template-list.bin
//!   payload-<uuid>.bin        undelivered telemetry
//!   payload-<uuid>.json       its metadata sidecar
//!
//! The in-memory state of the agent is always authoritative; persistence
//! failures are reported but never fatal.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use signal_core::Timestamp;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence io: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt metadata for {0}")]
    CorruptMetadata(String),
}

/// Logical name of a persisted schema document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    DecoderManifest,
    CollectionSchemeList,
    StateTemplateList,
}

impl SchemaKind {
    fn file_name(self) -> &'static str {
        match self {
            SchemaKind::DecoderManifest => "decoder-manifest.bin",
            SchemaKind::CollectionSchemeList => "collection-scheme-list.bin",
            SchemaKind::StateTemplateList => "state-template-list.bin",
        }
    }
}

/// Metadata stored next to each undelivered payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    pub scheme_id: String,
    pub creation_time_ms: Timestamp,
    pub size: usize,
    pub compressed: bool,
}

/// Storage interface used by the policy manager (schemas) and the sender
/// worker (payload backlog).
pub trait BlobStore: Send + Sync + 'static {
    fn put_schema(&self, kind: SchemaKind, data: &[u8]) -> Result<(), PersistenceError>;
    fn get_schema(&self, kind: SchemaKind) -> Result<Option<Vec<u8>>, PersistenceError>;
    fn erase_schema(&self, kind: SchemaKind) -> Result<(), PersistenceError>;

    /// Stores one undelivered payload, returning its blob id.
    fn put_payload(&self, meta: &PayloadMetadata, data: &[u8]) -> Result<String, PersistenceError>;
    fn list_payloads(&self) -> Result<Vec<(String, PayloadMetadata)>, PersistenceError>;
    fn get_payload(&self, id: &str) -> Result<Vec<u8>, PersistenceError>;
    fn erase_payload(&self, id: &str) -> Result<(), PersistenceError>;
}

/// Directory-backed blob store.
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn payload_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.bin"))
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, PersistenceError> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl BlobStore for FileBlobStore {
    fn put_schema(&self, kind: SchemaKind, data: &[u8]) -> Result<(), PersistenceError> {
        fs::write(self.root.join(kind.file_name()), data)?;
        Ok(())
    }

    fn get_schema(&self, kind: SchemaKind) -> Result<Option<Vec<u8>>, PersistenceError> {
        read_optional(&self.root.join(kind.file_name()))
    }

    fn erase_schema(&self, kind: SchemaKind) -> Result<(), PersistenceError> {
        match fs::remove_file(self.root.join(kind.file_name())) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn put_payload(&self, meta: &PayloadMetadata, data: &[u8]) -> Result<String, PersistenceError> {
        let id = format!("payload-{}", Uuid::new_v4());
        let metadata = serde_json::to_vec(meta)
            .map_err(|_| PersistenceError::CorruptMetadata(id.clone()))?;
        fs::write(self.payload_path(&id), data)?;
        fs::write(self.metadata_path(&id), metadata)?;
        Ok(id)
    }

    fn list_payloads(&self) -> Result<Vec<(String, PayloadMetadata)>, PersistenceError> {
        let mut payloads = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = name
                .strip_suffix(".json")
                .filter(|id| id.starts_with("payload-"))
            else {
                continue;
            };
            let raw = fs::read(entry.path())?;
            match serde_json::from_slice::<PayloadMetadata>(&raw) {
                Ok(meta) => payloads.push((id.to_string(), meta)),
                Err(_) => {
                    warn!(blob = %id, "dropping payload with corrupt metadata");
                    let _ = fs::remove_file(self.payload_path(id));
                    let _ = fs::remove_file(self.metadata_path(id));
                }
            }
        }
        // Oldest first so the backlog drains in creation order.
        payloads.sort_by_key(|(_, meta)| meta.creation_time_ms);
        Ok(payloads)
    }

    fn get_payload(&self, id: &str) -> Result<Vec<u8>, PersistenceError> {
        Ok(fs::read(self.payload_path(id))?)
    }

    fn erase_payload(&self, id: &str) -> Result<(), PersistenceError> {
        fs::remove_file(self.payload_path(id))?;
        fs::remove_file(self.metadata_path(id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FileBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn schema_roundtrip_and_erase() {
        let (_dir, store) = store();
        assert!(store.get_schema(SchemaKind::DecoderManifest).unwrap().is_none());
        store.put_schema(SchemaKind::DecoderManifest, b"manifest").unwrap();
        assert_eq!(
            store.get_schema(SchemaKind::DecoderManifest).unwrap().as_deref(),
            Some(&b"manifest"[..])
        );
        store.erase_schema(SchemaKind::DecoderManifest).unwrap();
        assert!(store.get_schema(SchemaKind::DecoderManifest).unwrap().is_none());
        // Erasing twice is fine.
        store.erase_schema(SchemaKind::DecoderManifest).unwrap();
    }

    #[test]
    fn payloads_list_oldest_first() {
        let (_dir, store) = store();
        let meta = |t: Timestamp| PayloadMetadata {
            scheme_id: "s".into(),
            creation_time_ms: t,
            size: 3,
            compressed: false,
        };
        store.put_payload(&meta(200), b"two").unwrap();
        store.put_payload(&meta(100), b"one").unwrap();

        let listed = store.list_payloads().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].1.creation_time_ms, 100);
        assert_eq!(store.get_payload(&listed[0].0).unwrap(), b"one");

        store.erase_payload(&listed[0].0).unwrap();
        assert_eq!(store.list_payloads().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_metadata_is_dropped() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("payload-bad.json"), b"{nope").unwrap();
        std::fs::write(dir.path().join("payload-bad.bin"), b"data").unwrap();
        assert!(store.list_payloads().unwrap().is_empty());
        assert!(!dir.path().join("payload-bad.bin").exists());
    }
}
