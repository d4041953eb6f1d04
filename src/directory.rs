//! Lid directory — in-memory `lid → {fileId, chunkId, size}` table.
//!
//! The original packs this triple into a single 64-bit word. We keep the
//! fields unpacked in a small `Copy` struct instead: clearer call sites,
//! identical semantics, and no risk of silently truncating a `fileId` or
//! `size` that happens to need more bits than the original's packing
//! scheme assumed. `None` is the "not present" sentinel.
//!
//! A grow-on-demand `Vec` behind a `RwLock` stands in for the original's
//! hand-rolled generation-guarded vector: readers take the read lock (no
//! real contention against the rare `put`/`compact_lid_space` writers), so
//! the directory's own backing memory doesn't need manual reclamation. The
//! generation handler (`generation.rs`) is still load-bearing — it guards
//! the lifetime of the *chunk file* a directory entry points into, which is
//! the part of this design the original calls out as safety-critical
//! (`logdatastore.cpp`'s compact/free sequencing).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LidEntry {
    pub file_id: u32,
    pub chunk_id: u32,
    pub size: u32,
}

pub struct LidDirectory {
    entries: RwLock<Vec<Option<LidEntry>>>,
    doc_id_limit: AtomicU32,
}

impl LidDirectory {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            doc_id_limit: AtomicU32::new(0),
        }
    }

    pub fn get(&self, lid: u32) -> Option<LidEntry> {
        self.entries
            .read()
            .unwrap()
            .get(lid as usize)
            .copied()
            .flatten()
    }

    /// Install `entry` for `lid`, returning whatever was there before.
    /// Extends `docIdLimit` to `lid + 1` if `lid` is beyond the current
    /// limit.
    pub fn put(&self, lid: u32, entry: LidEntry) -> Option<LidEntry> {
        let old = {
            let mut g = self.entries.write().unwrap();
            if lid as usize >= g.len() {
                g.resize(lid as usize + 1, None);
            }
            std::mem::replace(&mut g[lid as usize], Some(entry))
        };
        self.update_doc_id_limit(lid + 1);
        old
    }

    /// Clear `lid`'s entry (a logical remove), returning whatever was there.
    pub fn remove(&self, lid: u32) -> Option<LidEntry> {
        let mut g = self.entries.write().unwrap();
        if lid as usize >= g.len() {
            return None;
        }
        std::mem::replace(&mut g[lid as usize], None)
    }

    /// Replace `lid`'s entry with `new_entry` only if it currently equals
    /// `expected`. Returns whether the swap happened. Lets the compactor
    /// install a migrated entry without clobbering a write that raced ahead
    /// of it and already moved the lid somewhere else.
    pub fn compare_and_put(&self, lid: u32, expected: LidEntry, new_entry: LidEntry) -> bool {
        let mut g = self.entries.write().unwrap();
        if lid as usize >= g.len() || g[lid as usize] != Some(expected) {
            return false;
        }
        g[lid as usize] = Some(new_entry);
        true
    }

    /// Snapshot of every present `(lid, entry)` pair. Used by the compactor
    /// to find which lids are currently live in a given source file; O(n)
    /// in `docIdLimit`, acceptable since it only runs once per compaction
    /// candidate.
    pub fn snapshot(&self) -> Vec<(u32, LidEntry)> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .enumerate()
            .filter_map(|(lid, e)| e.map(|e| (lid as u32, e)))
            .collect()
    }

    pub fn doc_id_limit(&self) -> u32 {
        self.doc_id_limit.load(Ordering::Acquire)
    }

    /// Monotonic high-water mark: never moves backwards from this call.
    pub fn update_doc_id_limit(&self, n: u32) {
        let mut cur = self.doc_id_limit.load(Ordering::Acquire);
        while n > cur {
            match self.doc_id_limit.compare_exchange_weak(
                cur,
                n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Zero every entry at or beyond `new_limit` and lower the high-water
    /// mark. The caller is responsible for having waited out any reader
    /// that might still be observing a generation before `new_limit`'s
    /// entries are physically reclaimed by a later `shrink_lid_space`.
    pub fn compact_lid_space(&self, new_limit: u32) -> Result<()> {
        if new_limit > self.doc_id_limit() {
            return Err(StoreError::InvalidArgument(format!(
                "compact_lid_space({new_limit}) exceeds current docIdLimit {}",
                self.doc_id_limit()
            )));
        }
        let mut g = self.entries.write().unwrap();
        for e in g.iter_mut().skip(new_limit as usize) {
            *e = None;
        }
        drop(g);
        self.doc_id_limit.store(new_limit, Ordering::Release);
        Ok(())
    }

    /// Physically shrink the backing vector down to `docIdLimit`. Safe to
    /// call any time; it is a pure capacity optimization over what
    /// `compact_lid_space` already made logically empty.
    pub fn shrink_lid_space(&self) {
        let mut g = self.entries.write().unwrap();
        let limit = self.doc_id_limit() as usize;
        if g.len() > limit {
            g.truncate(limit);
            g.shrink_to_fit();
        }
    }

    pub fn memory_footprint(&self) -> usize {
        self.entries.read().unwrap().capacity() * std::mem::size_of::<Option<LidEntry>>()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

impl Default for LidDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_extends_doc_id_limit() {
        let dir = LidDirectory::new();
        dir.put(
            5,
            LidEntry {
                file_id: 0,
                chunk_id: 0,
                size: 10,
            },
        );
        assert_eq!(dir.doc_id_limit(), 6);
        assert!(dir.get(5).is_some());
        assert!(dir.get(4).is_none());
    }

    #[test]
    fn compact_lid_space_clears_tail() {
        let dir = LidDirectory::new();
        for lid in 0..10u32 {
            dir.put(
                lid,
                LidEntry {
                    file_id: 0,
                    chunk_id: 0,
                    size: 1,
                },
            );
        }
        dir.compact_lid_space(4).unwrap();
        assert_eq!(dir.doc_id_limit(), 4);
        assert!(dir.get(3).is_some());
        assert!(dir.get(4).is_none());
        assert!(dir.get(9).is_none());
    }

    #[test]
    fn compact_lid_space_rejects_growth() {
        let dir = LidDirectory::new();
        dir.put(
            0,
            LidEntry {
                file_id: 0,
                chunk_id: 0,
                size: 1,
            },
        );
        assert!(dir.compact_lid_space(100).is_err());
    }
}
