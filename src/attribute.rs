//! Attribute value store: dense document-id → payload mapping.
//!
//! Each document slot holds a [`BlobRef`] into a private [`BlobStore`];
//! payloads here are opaque byte strings (serialized tensors in the
//! original deployment). The store distinguishes allocated capacity from
//! the committed document-id limit: readers never observe a slot at or
//! beyond the committed limit, so a partially-written batch is never
//! partially visible.
//!
//! `set`/`set_absent`/`commit`/`compact_worst` form the single-writer
//! mutation path; `get` may be called concurrently from any number of
//! readers, each bounded by a [`Guard`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::blob::{BlobRef, BlobStore, BlobStoreStats, BlobView};
use crate::error::Result;
use crate::generation::{GenerationHandler, Guard};

fn default_max_dead_bytes_ratio() -> f64 {
    0.2
}

/// Configuration for an [`AttributeStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeConfig {
    /// Attribute name.
    pub name: String,
    /// Serial number recorded when the attribute was created; persisted in
    /// the file header.
    #[serde(default)]
    pub create_serial_num: u64,
    /// Compact once dead bytes exceed this share of total payload bytes.
    #[serde(default = "default_max_dead_bytes_ratio")]
    pub max_dead_bytes_ratio: f64,
}

impl AttributeConfig {
    /// Configuration with default compaction threshold.
    pub fn new<S: Into<String>>(name: S) -> Self {
        AttributeConfig {
            name: name.into(),
            create_serial_num: 0,
            max_dead_bytes_ratio: default_max_dead_bytes_ratio(),
        }
    }
}

/// Generation-protected variable-length value store.
#[derive(Debug)]
pub struct AttributeStore {
    config: AttributeConfig,
    generations: Arc<GenerationHandler>,
    store: BlobStore,
    /// Slot per document id; the slot (not the referenced payload) is
    /// mutated on each set.
    refs: RwLock<Vec<BlobRef>>,
    /// Prefix of the ref vector visible to readers.
    committed_doc_id_limit: AtomicU32,
}

impl AttributeStore {
    /// Create an empty store with its own generation handler.
    pub fn new(config: AttributeConfig) -> Self {
        let generations = Arc::new(GenerationHandler::new());
        let store = BlobStore::new(Arc::clone(&generations));
        AttributeStore {
            config,
            generations,
            store,
            refs: RwLock::new(Vec::new()),
            committed_doc_id_limit: AtomicU32::new(0),
        }
    }

    /// Attribute name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Serial number recorded at attribute creation.
    pub fn create_serial_num(&self) -> u64 {
        self.config.create_serial_num
    }

    /// One past the highest allocated document id.
    pub fn doc_id_limit(&self) -> u32 {
        self.refs.read().len() as u32
    }

    /// One past the highest document id visible to readers.
    pub fn committed_doc_id_limit(&self) -> u32 {
        self.committed_doc_id_limit.load(Ordering::Acquire)
    }

    /// Take a reader guard; reads stay consistent for the guard's lifetime.
    pub fn take_guard(&self) -> Guard {
        self.generations.take_guard()
    }

    /// Set a document's payload. Writer-only; not visible to readers until
    /// [`commit`](Self::commit). A zero-length payload is normalized to
    /// "no payload", matching what a persistence round-trip yields.
    pub fn set(&self, doc_id: u32, payload: &[u8]) -> Result<()> {
        let new_ref = if payload.is_empty() {
            BlobRef::invalid()
        } else {
            self.store.put(payload)?
        };
        let old_ref = {
            let mut refs = self.refs.write();
            grow_for(&mut refs, doc_id);
            std::mem::replace(&mut refs[doc_id as usize], new_ref)
        };
        self.store.remove(old_ref);
        Ok(())
    }

    /// Clear a document's payload, retiring any previous one. Writer-only.
    pub fn set_absent(&self, doc_id: u32) {
        let old_ref = {
            let mut refs = self.refs.write();
            grow_for(&mut refs, doc_id);
            std::mem::replace(&mut refs[doc_id as usize], BlobRef::invalid())
        };
        self.store.remove(old_ref);
    }

    /// Publish all initialized slots to readers: advances the committed
    /// limit, bumps the generation, and reclaims what no guard can still
    /// observe.
    pub fn commit(&self) {
        let limit = self.refs.read().len() as u32;
        self.committed_doc_id_limit.store(limit, Ordering::Release);
        self.generations.increment_generation();
        self.store.reclaim();
    }

    /// Read a document's payload. `None` for uncommitted document ids and
    /// for documents without a payload. The view stays valid for the
    /// caller's guard lifetime.
    pub fn get(&self, doc_id: u32) -> Option<BlobView> {
        if doc_id >= self.committed_doc_id_limit() {
            return None;
        }
        let blob_ref = {
            let refs = self.refs.read();
            refs.get(doc_id as usize).copied()?
        };
        if !blob_ref.valid() {
            return None;
        }
        self.store.read(blob_ref)
    }

    /// Compact the payload store if the dead-byte share crossed the
    /// configured threshold, remapping every slot. Writer-only. Returns
    /// whether compaction ran.
    pub fn compact_worst(&self) -> Result<bool> {
        let stats = self.store.stats();
        let total = stats.live_bytes + stats.dead_bytes;
        if total == 0 {
            return Ok(false);
        }
        if (stats.dead_bytes as f64) <= self.config.max_dead_bytes_ratio * (total as f64) {
            return Ok(false);
        }
        {
            let mut refs = self.refs.write();
            self.store.compact(&mut refs)?;
        }
        self.generations.increment_generation();
        self.store.reclaim();
        Ok(true)
    }

    /// Payload-store memory counters.
    pub fn blob_stats(&self) -> BlobStoreStats {
        self.store.stats()
    }

    /// Copy of the ref vector, for the saver. Call under a guard so the
    /// copy is consistent with the payloads read afterwards.
    pub(crate) fn ref_copy(&self) -> Vec<BlobRef> {
        self.refs.read().clone()
    }

    pub(crate) fn read_blob(&self, blob_ref: BlobRef) -> Option<BlobView> {
        self.store.read(blob_ref)
    }

    pub(crate) fn alloc_loaded<F>(&self, size: usize, fill: F) -> Result<BlobRef>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        self.store.alloc_raw(size, fill)
    }

    pub(crate) fn install_refs(&self, refs: Vec<BlobRef>) {
        let limit = refs.len() as u32;
        *self.refs.write() = refs;
        self.committed_doc_id_limit.store(limit, Ordering::Release);
    }

    pub(crate) fn set_create_serial_num(&mut self, serial: u64) {
        self.config.create_serial_num = serial;
    }
}

impl Drop for AttributeStore {
    fn drop(&mut self) {
        // Shutdown: force-drain the hold list before the backing store goes
        // away, equivalent to waiting out every guard.
        self.store.reclaim_all();
    }
}

/// Extend `refs` so `doc_id` is a valid slot, growing capacity
/// geometrically so repeated single-document growth stays amortized O(1).
fn grow_for(refs: &mut Vec<BlobRef>, doc_id: u32) {
    let needed = doc_id as usize + 1;
    if needed <= refs.len() {
        return;
    }
    if needed > refs.capacity() {
        let mut capacity = refs.capacity().max(32);
        while capacity < needed {
            capacity *= 2;
        }
        refs.reserve_exact(capacity - refs.len());
    }
    refs.resize(needed, BlobRef::invalid());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_store() -> AttributeStore {
        AttributeStore::new(AttributeConfig::new("test"))
    }

    #[test]
    fn test_set_invisible_until_commit() {
        let store = new_store();
        store.set(0, b"v0").unwrap();
        store.set(3, b"v3").unwrap();

        assert_eq!(store.doc_id_limit(), 4);
        assert_eq!(store.committed_doc_id_limit(), 0);
        assert!(store.get(0).is_none());

        store.commit();
        assert_eq!(store.committed_doc_id_limit(), 4);
        assert_eq!(&*store.get(0).unwrap(), b"v0");
        // Slots grown but never set read as absent.
        assert!(store.get(1).is_none());
        assert!(store.get(2).is_none());
        assert_eq!(&*store.get(3).unwrap(), b"v3");
        // Beyond the committed limit is absent, not an error.
        assert!(store.get(100).is_none());
    }

    #[test]
    fn test_overwrite_retires_old_payload() {
        let store = new_store();
        store.set(0, b"old").unwrap();
        store.commit();

        let guard = store.take_guard();
        let old_view = store.get(0).unwrap();

        store.set(0, b"new").unwrap();
        store.commit();

        // The pre-overwrite view stays byte-identical.
        assert_eq!(&*old_view, b"old");
        assert_eq!(&*store.get(0).unwrap(), b"new");
        drop(guard);

        store.commit();
        let stats = store.blob_stats();
        assert_eq!(stats.dead_bytes, 0);
        assert_eq!(stats.blob_count, 1);
    }

    #[test]
    fn test_set_absent_and_empty_payload() {
        let store = new_store();
        store.set(0, b"value").unwrap();
        store.set(1, b"").unwrap();
        store.commit();

        assert!(store.get(0).is_some());
        // Zero-length payloads are normalized to absence.
        assert!(store.get(1).is_none());

        store.set_absent(0);
        store.commit();
        assert!(store.get(0).is_none());
    }

    #[test]
    fn test_geometric_growth_keeps_committed_limit() {
        let store = new_store();
        store.set(0, b"a").unwrap();
        store.commit();
        store.set(1000, b"b").unwrap();

        // The bulk-grown tail is not visible before commit.
        assert_eq!(store.committed_doc_id_limit(), 1);
        assert_eq!(store.doc_id_limit(), 1001);
        assert!(store.get(1000).is_none());

        store.commit();
        assert_eq!(&*store.get(1000).unwrap(), b"b");
    }

    #[test]
    fn test_compact_worst_threshold() {
        let store = new_store();
        for doc_id in 0..8u32 {
            store.set(doc_id, &[doc_id as u8; 64]).unwrap();
        }
        store.commit();
        assert!(!store.compact_worst().unwrap(), "no dead bytes yet");

        // Overwrite half the documents while a slow reader pins the old
        // payloads, so the dead bytes survive the commit's reclaim pass.
        let guard = store.take_guard();
        for doc_id in 0..4u32 {
            store.set(doc_id, &[0x40 + doc_id as u8; 64]).unwrap();
        }
        store.commit();
        assert_eq!(store.blob_stats().dead_bytes, 4 * 64);
        drop(guard);

        assert!(store.compact_worst().unwrap());
        for doc_id in 0..4u32 {
            assert_eq!(&*store.get(doc_id).unwrap(), &[0x40 + doc_id as u8; 64]);
        }
        for doc_id in 4..8u32 {
            assert_eq!(&*store.get(doc_id).unwrap(), &[doc_id as u8; 64]);
        }
        assert_eq!(store.blob_stats().dead_bytes, 0);
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = AttributeConfig::new("embedding");
        let json = serde_json::to_string(&config).unwrap();
        let back: AttributeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "embedding");
        assert_eq!(back.create_serial_num, 0);
        assert!((back.max_dead_bytes_ratio - 0.2).abs() < f64::EPSILON);
    }
}
