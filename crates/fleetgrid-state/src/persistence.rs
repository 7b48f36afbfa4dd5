//! Persistence primitive and the diff-only JSON writer built on it.
//!
//! Components never talk to redb directly; they receive an
//! `Arc<dyn Persistence>` so tests can inject failing or in-memory stores.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};

/// Key/value persistence over string keys and opaque byte values.
pub trait Persistence: Send + Sync {
    fn read(&self, key: &str) -> StateResult<Option<Vec<u8>>>;
    fn write(&self, key: &str, value: &[u8]) -> StateResult<()>;
    fn exists(&self, key: &str) -> StateResult<bool>;
    /// Returns true if the key existed.
    fn remove(&self, key: &str) -> StateResult<bool>;
    /// Keys starting with `prefix`, in key order.
    fn list(&self, prefix: &str) -> StateResult<Vec<String>>;
}

/// Read and deserialize a JSON document.
pub fn read_json<T: DeserializeOwned>(
    store: &dyn Persistence,
    key: &str,
) -> StateResult<Option<T>> {
    match store.read(key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StateError::Deserialize(format!("{key}: {e}"))),
        None => Ok(None),
    }
}

/// Writes a JSON document only when its bytes differ from the last
/// successful write.
///
/// The cached bytes are updated only after the backing write succeeds, so a
/// failed write is retried on the next call even if nothing changed.
#[derive(Debug, Clone)]
pub struct DiffWriter {
    key: String,
    last: Option<Vec<u8>>,
}

impl DiffWriter {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            last: None,
        }
    }

    /// Seed the cache with bytes known to be persisted already (after recovery).
    pub fn with_last(mut self, bytes: Vec<u8>) -> Self {
        self.last = Some(bytes);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serialize `value` without writing it.
    pub fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| StateError::Serialize(e.to_string()))
    }

    /// Returns `Ok(true)` if a write happened, `Ok(false)` if skipped.
    pub fn write<T: Serialize>(&mut self, store: &dyn Persistence, value: &T) -> StateResult<bool> {
        let bytes = Self::encode(value)?;
        self.write_bytes(store, bytes)
    }

    pub fn write_bytes(&mut self, store: &dyn Persistence, bytes: Vec<u8>) -> StateResult<bool> {
        if self.last.as_deref() == Some(bytes.as_slice()) {
            return Ok(false);
        }
        store.write(&self.key, &bytes)?;
        debug!(key = %self.key, bytes = bytes.len(), "document changed, written");
        self.last = Some(bytes);
        Ok(true)
    }

    /// Forget the cached bytes so the next write always goes through.
    pub fn invalidate(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use std::collections::BTreeMap;

    #[test]
    fn skips_identical_write() {
        let store = StateStore::open_in_memory().unwrap();
        let mut writer = DiffWriter::new("doc");
        let mut doc = BTreeMap::new();
        doc.insert("a", 1);

        assert!(writer.write(&store, &doc).unwrap());
        assert!(!writer.write(&store, &doc).unwrap());

        doc.insert("b", 2);
        assert!(writer.write(&store, &doc).unwrap());
    }

    #[test]
    fn invalidate_forces_rewrite() {
        let store = StateStore::open_in_memory().unwrap();
        let mut writer = DiffWriter::new("doc");
        writer.write(&store, &1u32).unwrap();
        writer.invalidate();
        assert!(writer.write(&store, &1u32).unwrap());
    }

    #[test]
    fn read_json_roundtrip_and_missing() {
        let store = StateStore::open_in_memory().unwrap();
        let mut writer = DiffWriter::new("doc");
        writer.write(&store, &vec![1u32, 2, 3]).unwrap();

        let back: Option<Vec<u32>> = read_json(&store, "doc").unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
        let missing: Option<Vec<u32>> = read_json(&store, "other").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn read_json_reports_corrupt_document() {
        let store = StateStore::open_in_memory().unwrap();
        store.write("doc", b"not json").unwrap();
        let result: StateResult<Option<u32>> = read_json(&store, "doc");
        assert!(matches!(result, Err(StateError::Deserialize(_))));
    }
}
