//! Blob store: variable-length byte payloads with deferred reclamation.
//!
//! Payloads are immutable once published and addressed by a compact
//! [`BlobRef`]. Removal never frees synchronously: the entry is retired to a
//! per-generation hold list and only forgotten once no reader guard can
//! still observe it. Reference ids are handed out monotonically and never
//! reused, so a stale ref can never alias a later payload.
//!
//! Mutating operations are single-writer by contract; readers may call
//! [`BlobStore::read`] concurrently at any time. A returned [`BlobView`]
//! stays valid for as long as the caller holds it, which callers bound by
//! their guard lifetime.

use std::ops::Deref;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{KontosError, Result};
use crate::generation::{GenerationHandler, HoldList};

/// Compact, copyable handle addressing a payload inside a [`BlobStore`].
///
/// Holding a `BlobRef` never implies ownership; ownership is the store's.
/// The zero value is the distinguished invalid ref ("no payload").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobRef(u32);

impl BlobRef {
    /// The distinguished invalid reference.
    pub const fn invalid() -> Self {
        BlobRef(0)
    }

    /// True if this reference addresses a payload.
    pub fn valid(&self) -> bool {
        self.0 != 0
    }
}

impl Default for BlobRef {
    fn default() -> Self {
        Self::invalid()
    }
}

/// Read-only view of a payload.
///
/// Owns a handle on the payload bytes, so the view remains stable even if
/// the writer retires the blob while the view is held.
#[derive(Debug, Clone)]
pub struct BlobView {
    data: Arc<[u8]>,
}

impl Deref for BlobView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for BlobView {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug)]
struct BlobEntry {
    data: Arc<[u8]>,
    dead: bool,
}

#[derive(Debug)]
struct BlobTable {
    entries: AHashMap<u32, BlobEntry>,
    next_id: u32,
    live_count: usize,
    live_bytes: usize,
    dead_bytes: usize,
}

impl BlobTable {
    fn retire(&mut self, id: u32) -> Option<usize> {
        let entry = self.entries.get_mut(&id)?;
        if entry.dead {
            return None;
        }
        entry.dead = true;
        let size = entry.data.len();
        self.live_count -= 1;
        self.live_bytes -= size;
        self.dead_bytes += size;
        Some(size)
    }

    fn insert(&mut self, data: Arc<[u8]>) -> Result<BlobRef> {
        let id = self.next_id;
        if id == u32::MAX {
            return Err(KontosError::resource_exhausted(
                "blob reference space exhausted",
            ));
        }
        self.next_id = id + 1;
        self.live_count += 1;
        self.live_bytes += data.len();
        self.entries.insert(id, BlobEntry { data, dead: false });
        Ok(BlobRef(id))
    }
}

/// Memory usage counters for a [`BlobStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStoreStats {
    /// Bytes held by live payloads.
    pub live_bytes: usize,
    /// Bytes held by retired payloads awaiting reclamation.
    pub dead_bytes: usize,
    /// Number of live payloads.
    pub blob_count: usize,
    /// Number of retired payloads awaiting reclamation.
    pub hold_count: usize,
}

#[derive(Debug)]
struct HeldBlob {
    id: u32,
    bytes: usize,
}

/// Append-mostly store of immutable byte payloads.
#[derive(Debug)]
pub struct BlobStore {
    table: RwLock<BlobTable>,
    hold: Mutex<HoldList<HeldBlob>>,
    generations: Arc<GenerationHandler>,
}

impl BlobStore {
    /// Create a store coordinating reclamation through `generations`.
    pub fn new(generations: Arc<GenerationHandler>) -> Self {
        BlobStore {
            table: RwLock::new(BlobTable {
                entries: AHashMap::new(),
                // Id 0 is reserved for BlobRef::invalid().
                next_id: 1,
                live_count: 0,
                live_bytes: 0,
                dead_bytes: 0,
            }),
            hold: Mutex::new(HoldList::new()),
            generations,
        }
    }

    /// The generation handler this store reclaims under.
    pub fn generation_handler(&self) -> &Arc<GenerationHandler> {
        &self.generations
    }

    /// Copy `bytes` into a new payload and return its reference.
    pub fn put(&self, bytes: &[u8]) -> Result<BlobRef> {
        self.alloc_raw(bytes.len(), |buf| {
            buf.copy_from_slice(bytes);
            Ok(())
        })
    }

    /// Allocate a payload of `size` bytes, initialize it through `fill`,
    /// then publish it. Used by the load path to read straight from an
    /// input stream without an intermediate copy.
    pub fn alloc_raw<F>(&self, size: usize, fill: F) -> Result<BlobRef>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        let mut data = vec![0u8; size].into_boxed_slice();
        fill(&mut data)?;
        let data: Arc<[u8]> = Arc::from(data);
        self.table.write().insert(data)
    }

    /// Read a payload. Returns `None` for the invalid reference or for a
    /// reference that has already been reclaimed; callers must only use
    /// references obtained while holding a guard taken at or after the
    /// write, which makes the latter unreachable.
    pub fn read(&self, blob_ref: BlobRef) -> Option<BlobView> {
        if !blob_ref.valid() {
            return None;
        }
        let table = self.table.read();
        match table.entries.get(&blob_ref.0) {
            Some(entry) => Some(BlobView {
                data: Arc::clone(&entry.data),
            }),
            None => {
                debug_assert!(false, "read of reclaimed blob ref {}", blob_ref.0);
                None
            }
        }
    }

    /// Retire a payload. The bytes stay readable through the old reference
    /// until every guard recorded at or before the current generation is
    /// released; only then is the entry reclaimed.
    pub fn remove(&self, blob_ref: BlobRef) {
        if !blob_ref.valid() {
            return;
        }
        let retired = {
            let mut table = self.table.write();
            table.retire(blob_ref.0)
        };
        if let Some(bytes) = retired {
            let generation = self.generations.current_generation();
            self.hold.lock().hold(
                HeldBlob {
                    id: blob_ref.0,
                    bytes,
                },
                generation,
            );
        }
    }

    /// Copy every live payload referenced by `refs` into a fresh entry,
    /// rewriting each slot in place, and retire the old entries through the
    /// hold list. Readers mid-read keep their views; readers resolving
    /// pre-compaction references under an old guard still find them until
    /// reclamation.
    pub fn compact(&self, refs: &mut [BlobRef]) -> Result<()> {
        let mut retired = Vec::new();
        {
            let mut table = self.table.write();
            for slot in refs.iter_mut() {
                if !slot.valid() {
                    continue;
                }
                let data = match table.entries.get(&slot.0) {
                    Some(entry) => {
                        debug_assert!(!entry.dead, "compacting a retired blob ref");
                        Arc::clone(&entry.data)
                    }
                    None => {
                        debug_assert!(false, "compacting a reclaimed blob ref {}", slot.0);
                        continue;
                    }
                };
                let copied: Arc<[u8]> = Arc::from(&data[..]);
                let new_ref = table.insert(copied)?;
                if let Some(bytes) = table.retire(slot.0) {
                    retired.push(HeldBlob { id: slot.0, bytes });
                }
                *slot = new_ref;
            }
        }
        let generation = self.generations.current_generation();
        let mut hold = self.hold.lock();
        for held in retired {
            hold.hold(held, generation);
        }
        Ok(())
    }

    /// Drain the hold list up to the oldest generation still observed by a
    /// live guard. Returns the number of payloads reclaimed.
    pub fn reclaim(&self) -> usize {
        let oldest_used = self.generations.oldest_used_generation();
        let mut hold = self.hold.lock();
        let mut table = self.table.write();
        hold.reclaim_with(oldest_used, |held| {
            if table.entries.remove(&held.id).is_some() {
                table.dead_bytes -= held.bytes;
            }
        })
    }

    /// Force-drain the hold list. Shutdown path: equivalent to waiting out
    /// every guard.
    pub fn reclaim_all(&self) -> usize {
        let mut hold = self.hold.lock();
        let mut table = self.table.write();
        hold.reclaim_all_with(|held| {
            if table.entries.remove(&held.id).is_some() {
                table.dead_bytes -= held.bytes;
            }
        })
    }

    /// Current memory usage counters.
    pub fn stats(&self) -> BlobStoreStats {
        let table = self.table.read();
        BlobStoreStats {
            live_bytes: table.live_bytes,
            dead_bytes: table.dead_bytes,
            blob_count: table.live_count,
            hold_count: self.hold.lock().len(),
        }
    }
}
