//! Generation (epoch) tracking for concurrent readers.
//!
//! A [`GenerationHandler`] is an owned, per-structure epoch counter. Readers
//! take a [`Guard`] recording the generation they observed; the single
//! writer bumps the generation after each mutation batch. Data superseded at
//! generation `g` may only be freed once no live guard records a generation
//! `<= g`, which [`HoldList`] enforces by queueing retired objects until the
//! handler reports them reclaimable.
//!
//! Construct one handler per index or store instance and share it by `Arc`;
//! there is no process-wide singleton.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Per-instance generation counter with reader-guard bookkeeping.
///
/// This component cannot fail: a long-lived guard only stalls reclamation,
/// it never affects correctness.
#[derive(Debug)]
pub struct GenerationHandler {
    /// Current generation, advanced by the writer after each mutation batch.
    current: AtomicU64,
    /// Live guard count per recorded generation.
    guards: Mutex<BTreeMap<u64, usize>>,
}

impl GenerationHandler {
    /// Create a new handler starting at generation 1.
    pub fn new() -> Self {
        GenerationHandler {
            current: AtomicU64::new(1),
            guards: Mutex::new(BTreeMap::new()),
        }
    }

    /// The generation the writer is currently mutating under.
    pub fn current_generation(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Advance the generation. Writer-only, called after a mutation batch
    /// and before tagging newly retired objects.
    pub fn increment_generation(&self) {
        // Hold the guard table lock so a concurrent take_guard either sees
        // the old generation while registered, or the new one.
        let _guards = self.guards.lock();
        self.current.fetch_add(1, Ordering::AcqRel);
    }

    /// Record the current generation and return an RAII guard for it.
    ///
    /// O(1). Dropping the guard releases it; early abandonment is exactly
    /// equivalent to normal release.
    pub fn take_guard(self: &Arc<Self>) -> Guard {
        let mut guards = self.guards.lock();
        let generation = self.current.load(Ordering::Acquire);
        *guards.entry(generation).or_insert(0) += 1;
        Guard {
            generation,
            handler: Arc::clone(self),
        }
    }

    /// The oldest generation any live guard still observes, or the current
    /// generation when no guard is live.
    pub fn oldest_used_generation(&self) -> u64 {
        let guards = self.guards.lock();
        guards
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.current.load(Ordering::Acquire))
    }

    /// True iff no live guard has a recorded generation `<= generation`,
    /// i.e. objects retired at `generation` are safe to free.
    pub fn reclaimable(&self, generation: u64) -> bool {
        generation < self.oldest_used_generation()
    }

    /// Number of live guards.
    pub fn guard_count(&self) -> usize {
        self.guards.lock().values().sum()
    }

    fn release(&self, generation: u64) {
        let mut guards = self.guards.lock();
        if let Some(count) = guards.get_mut(&generation) {
            *count -= 1;
            if *count == 0 {
                guards.remove(&generation);
            }
        }
    }
}

impl Default for GenerationHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// A reader's record of the generation it observed.
///
/// Held for the duration of one read operation (e.g. one query execution);
/// released on drop. Reclamation cannot proceed past the oldest live guard.
#[derive(Debug)]
pub struct Guard {
    generation: u64,
    handler: Arc<GenerationHandler>,
}

impl Guard {
    /// The generation recorded when this guard was taken.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.handler.release(self.generation);
    }
}

/// Per-generation queue of retired objects awaiting safe reclamation.
///
/// Items are pushed in nondecreasing generation order (the writer retires
/// under the generation current at retirement time) and drained from the
/// front once the handler confirms their generation is reclaimable.
#[derive(Debug)]
pub struct HoldList<T> {
    held: VecDeque<(u64, T)>,
}

impl<T> HoldList<T> {
    /// Create an empty hold list.
    pub fn new() -> Self {
        HoldList {
            held: VecDeque::new(),
        }
    }

    /// Queue a retired object under the generation it was superseded at.
    pub fn hold(&mut self, item: T, generation: u64) {
        debug_assert!(
            self.held.back().is_none_or(|(g, _)| *g <= generation),
            "hold list generations must be nondecreasing"
        );
        self.held.push_back((generation, item));
    }

    /// Drop every held object retired before `oldest_used`. Returns the
    /// number of objects reclaimed.
    pub fn reclaim(&mut self, oldest_used: u64) -> usize {
        let mut freed = 0;
        while let Some((generation, _)) = self.held.front() {
            if *generation < oldest_used {
                self.held.pop_front();
                freed += 1;
            } else {
                break;
            }
        }
        freed
    }

    /// Like [`reclaim`](Self::reclaim), but hands each reclaimed object to
    /// `free` so the owner can release associated resources.
    pub fn reclaim_with<F>(&mut self, oldest_used: u64, mut free: F) -> usize
    where
        F: FnMut(T),
    {
        let mut freed = 0;
        while let Some((generation, _)) = self.held.front() {
            if *generation >= oldest_used {
                break;
            }
            let (_, item) = self.held.pop_front().unwrap();
            free(item);
            freed += 1;
        }
        freed
    }

    /// Force-drain the list regardless of live guards. Shutdown path only:
    /// equivalent to waiting out every guard.
    pub fn reclaim_all_with<F>(&mut self, free: F) -> usize
    where
        F: FnMut(T),
    {
        self.reclaim_with(u64::MAX, free)
    }

    /// Number of objects currently held.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// True if nothing is held.
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl<T> Default for HoldList<T> {
    fn default() -> Self {
        Self::new()
    }
}
