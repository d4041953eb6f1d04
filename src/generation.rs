//! Generation-guarded reclamation.
//!
//! Grounded on `vespalib::GenerationHandler` as used throughout
//! `logdatastore.cpp` (`_genHandler.takeGuard()`,
//! `updateFirstUsedGeneration()`, `incGeneration()`). Replaces the
//! original's shared-ownership smart-pointer scheme: a reader takes a
//! guard before touching anything that might be concurrently freed (a
//! frozen chunk file mid-compaction); the compactor bumps the generation
//! counter after swapping the file out, then waits until no live guard
//! predates that generation before unlinking it.
//!
//! `logdatastore.cpp` has no concurrent readers to imitate line-for-line,
//! so this module is built up from the shape of `vespalib::GenerationHandler`
//! itself: an atomic generation counter plus a registry of live low-water-mark
//! guards.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub struct GenerationHandler {
    generation: AtomicU64,
    live: Mutex<BTreeMap<u64, u64>>,
    next_guard_id: AtomicU64,
}

impl GenerationHandler {
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            live: Mutex::new(BTreeMap::new()),
            next_guard_id: AtomicU64::new(0),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Bump the generation and return the new value. Called after a
    /// compactor swaps a file out of the live set, before it starts
    /// waiting for readers to drain.
    pub fn inc_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Take a guard pinning the current generation. Cheap: one atomic load
    /// plus one short-held mutex for registry bookkeeping.
    pub fn take_guard(&self) -> GenerationGuard<'_> {
        let generation = self.current_generation();
        let id = self.next_guard_id.fetch_add(1, Ordering::Relaxed);
        self.live.lock().unwrap().insert(id, generation);
        GenerationGuard {
            handler: self,
            id,
            generation,
        }
    }

    /// The oldest generation any live guard still pins, or the current
    /// generation if no guard is outstanding. A compactor may free memory
    /// from generation `g` once this value exceeds `g`.
    pub fn oldest_used_generation(&self) -> u64 {
        let live = self.live.lock().unwrap();
        live.values()
            .copied()
            .min()
            .unwrap_or_else(|| self.current_generation())
    }
}

impl Default for GenerationHandler {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GenerationGuard<'a> {
    handler: &'a GenerationHandler,
    id: u64,
    generation: u64,
}

impl GenerationGuard<'_> {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.handler.live.lock().unwrap().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_used_generation_tracks_live_guards() {
        let h = GenerationHandler::new();
        assert_eq!(h.oldest_used_generation(), 0);
        let g1 = h.take_guard();
        h.inc_generation();
        let g2 = h.take_guard();
        assert_eq!(h.oldest_used_generation(), 0);
        drop(g1);
        assert_eq!(h.oldest_used_generation(), 1);
        drop(g2);
        assert_eq!(h.oldest_used_generation(), 1);
    }
}
