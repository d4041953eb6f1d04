//! Background compaction: reclaim bloat (and, with a bucketizer, improve
//! bucket locality) by rewriting a frozen file's still-live records into a
//! destination and retiring the source.
//!
//! Grounded on `logdatastore.cpp`'s `compact`/`compactWorst`/
//! `findNextToCompact`/`compactFile`: candidate selection scores every
//! frozen file by bloat ratio (and bucket spread, if configured) and picks
//! the worst one above a threshold; the original's careful "don't free the
//! source until every reader holding it has moved on" sequencing is
//! reproduced here with [`crate::generation::GenerationHandler`] standing in
//! for its hand-rolled generation vector.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::bucketizer::{bucket_spread, cluster_key, significant_bucket_bits, Bucketizer};
use crate::chunkfile::{ChunkFile, FileId};
use crate::config::Config;
use crate::directory::{LidDirectory, LidEntry};
use crate::error::{Result, StoreError};
use crate::store::DocumentStore;

fn bloat_ratio(cf: &ChunkFile) -> f64 {
    let footprint = cf.disk_footprint().max(1);
    cf.disk_bloat() as f64 / footprint as f64
}

/// Pick the single best compaction candidate, if any frozen file currently
/// exceeds either the bloat or bucket-spread threshold. Never considers the
/// active file or a file already mid-compaction.
fn select_candidate(
    files: &HashMap<FileId, Arc<ChunkFile>>,
    active: Option<FileId>,
    compacting: &std::collections::HashSet<crate::chunkfile::NameId>,
    config: &Config,
    directory: &LidDirectory,
    bucketizer: Option<&dyn Bucketizer>,
) -> Option<FileId> {
    let mut best: Option<(FileId, f64)> = None;
    for (&file_id, cf) in files {
        if Some(file_id) == active || compacting.contains(&cf.name_id()) || !cf.is_frozen() {
            continue;
        }
        let ratio = bloat_ratio(cf);
        let mut eligible = ratio >= config.max_disk_bloat_factor;
        let mut score = ratio;

        if let Some(b) = bucketizer {
            let lids = directory
                .snapshot()
                .into_iter()
                .filter(|(_, e)| e.file_id == file_id)
                .map(|(lid, _)| lid);
            let spread = bucket_spread(b, lids);
            if spread >= config.max_bucket_spread {
                eligible = true;
            }
            score = score.max(spread / config.max_bucket_spread.max(f64::EPSILON));
        }

        if eligible && best.as_ref().map_or(true, |&(_, s)| score > s) {
            best = Some((file_id, score));
        }
    }
    best.map(|(id, _)| id)
}

/// Sum of `disk_bloat` across every frozen file — an upper bound on how many
/// bytes a full compaction pass could reclaim.
pub fn estimate_gain(store: &DocumentStore) -> u64 {
    let state = store.shared.state.lock().unwrap();
    state.files.values().map(|f| f.disk_bloat()).sum()
}

/// Run a single compaction round: select one candidate, migrate its live
/// records, and retire it. Returns `false` if nothing was eligible.
pub fn compact_round(store: &DocumentStore) -> Result<bool> {
    let (candidate, active_id) = {
        let state = store.shared.state.lock().unwrap();
        let candidate = select_candidate(
            &state.files,
            state.active,
            &state.compacting,
            &store.config,
            &store.directory,
            store.bucketizer.as_deref(),
        );
        (candidate, state.active)
    };
    let Some(source_id) = candidate else {
        return Ok(false);
    };

    let source = {
        let mut state = store.shared.state.lock().unwrap();
        let cf = state.files.get(&source_id).cloned();
        if let Some(cf) = &cf {
            state.compacting.insert(cf.name_id());
        }
        cf
    };
    let Some(source) = source else { return Ok(false) };

    let result = run_compaction(store, &source, active_id);

    {
        let mut state = store.shared.state.lock().unwrap();
        state.compacting.remove(&source.name_id());
    }
    result.map(|_| true)
}

fn run_compaction(store: &DocumentStore, source: &Arc<ChunkFile>, active_id: Option<FileId>) -> Result<()> {
    let source_id = source.file_id();

    // Snapshot which lids are live in `source` right now, from the
    // directory rather than the file's own contents, so a write that moves
    // a lid out from under us mid-compaction is never resurrected.
    let live: Vec<(u32, u32)> = store
        .directory
        .snapshot()
        .into_iter()
        .filter(|(_, e)| e.file_id == source_id)
        .map(|(lid, e)| (lid, e.chunk_id))
        .collect();

    if live.is_empty() {
        return finish_compaction(store, source);
    }

    let projected_live_bytes: u64 = live
        .iter()
        .filter_map(|(lid, _)| store.directory.get(*lid))
        .map(|e| e.size as u64)
        .sum();
    let min_bytes = (store.config.min_file_size_factor * store.config.max_file_size as f64) as u64;
    let use_active = store.config.compact_to_active_file || projected_live_bytes < min_bytes;

    if use_active {
        let dest_id = active_id
            .ok_or_else(|| StoreError::InvalidState("no active file to compact into".into()))?;
        let dest = {
            let state = store.shared.state.lock().unwrap();
            state.files.get(&dest_id).unwrap().clone()
        };
        migrate_records(store, source, &live, &dest, dest_id)?;
        dest.flush()?;
    } else {
        let (name_id, file_id) = {
            let mut state = store.shared.state.lock().unwrap();
            let name_id = state.next_name_id;
            let file_id = state.next_file_id;
            state.next_name_id += 1;
            state.next_file_id += 1;
            (name_id, file_id)
        };
        let dest = Arc::new(ChunkFile::create_active(
            &store.dir,
            name_id,
            file_id,
            &store.header_ctx,
            store.config.crc_on_write,
        )?);
        {
            let mut state = store.shared.state.lock().unwrap();
            state.files.insert(file_id, dest.clone());
        }
        migrate_records(store, source, &live, &dest, file_id)?;
        dest.flush()?;
        dest.freeze(store.directory.doc_id_limit())?;
    }

    finish_compaction(store, source)
}

/// Rewrite every still-live record of `live` from `source` into `dest`,
/// preserving each record's original serial (compaction must not disturb
/// recovery ordering), applying `compact_compression` on the way. When a
/// bucketizer is configured the rewrite order is grouped by cluster key
/// rather than source chunk order, so bucket-clustered compaction actually
/// improves locality instead of just measuring spread.
///
/// Reading and checksum-verifying each source chunk is independent of every
/// other chunk, so with the `parallel` feature enabled this fans the
/// per-chunk reads out across Rayon's pool; only the directory CAS and the
/// `store.write_direct` call (already serialized behind `dest`'s own writer
/// lock) stay on the calling thread.
fn migrate_records(
    store: &DocumentStore,
    source: &Arc<ChunkFile>,
    live: &[(u32, u32)],
    dest: &Arc<ChunkFile>,
    dest_file_id: FileId,
) -> Result<()> {
    let mut by_chunk: HashMap<u32, std::collections::HashSet<u32>> = HashMap::new();
    for &(lid, chunk_id) in live {
        by_chunk.entry(chunk_id).or_default().insert(lid);
    }
    let skip_crc = store.config.skip_crc_on_read;
    let chunk_ids: Vec<u32> = by_chunk.keys().copied().collect();

    #[cfg(feature = "parallel")]
    let decoded: Vec<Result<Vec<crate::record::Record>>> = {
        use rayon::prelude::*;
        chunk_ids
            .par_iter()
            .map(|&chunk_id| source.read_chunk(chunk_id, skip_crc))
            .collect()
    };
    #[cfg(not(feature = "parallel"))]
    let decoded: Vec<Result<Vec<crate::record::Record>>> = chunk_ids
        .iter()
        .map(|&chunk_id| source.read_chunk(chunk_id, skip_crc))
        .collect();

    let mut wanted_records: Vec<(u32, crate::record::Record)> = Vec::new();
    for (chunk_id, records) in chunk_ids.into_iter().zip(decoded) {
        let wanted = &by_chunk[&chunk_id];
        for r in records? {
            if wanted.contains(&r.lid) {
                wanted_records.push((chunk_id, r));
            }
        }
    }

    // With a bucketizer configured, rewrite in cluster-key order rather than
    // source chunk order, so records sharing a bucket land adjacently in
    // `dest` (bucket-clustered compaction). `sort_by_key` is stable, so
    // records that land in the same cluster keep their source-chunk
    // relative order.
    if let Some(b) = store.bucketizer.as_deref() {
        let bits = significant_bucket_bits(wanted_records.iter().map(|(_, r)| b.bucket_of(r.lid)));
        wanted_records.sort_by_key(|(_, r)| cluster_key(b.bucket_of(r.lid), bits));
    }

    for (chunk_id, r) in wanted_records {
        let expected = LidEntry {
            file_id: source.file_id(),
            chunk_id,
            size: r.framed_size(),
        };
        let (new_chunk_id, size) = store.write_direct(dest_file_id, r.serial, r.lid, &r.bytes)?;
        let new_entry = LidEntry {
            file_id: dest_file_id,
            chunk_id: new_chunk_id,
            size,
        };
        if !store.directory.compare_and_put(r.lid, expected, new_entry) {
            // A concurrent write already moved this lid elsewhere; the
            // copy we just wrote into `dest` is dead on arrival.
            dest.add_bloat(size);
        }
    }
    Ok(())
}

/// Drop `source` from the live file set, wait until every reader that might
/// still be touching it has moved on, then unlink it. Matches the
/// original's generation-bump-then-poll sequencing: no condvar signals this
/// wait, since a compaction round is already a low-frequency background
/// operation and a fixed poll keeps it simple.
fn finish_compaction(store: &DocumentStore, source: &Arc<ChunkFile>) -> Result<()> {
    let source_id = source.file_id();
    {
        let mut state = store.shared.state.lock().unwrap();
        state.files.remove(&source_id);
    }
    let bumped = store.generation.inc_generation();
    loop {
        let drained = store.generation.oldest_used_generation() >= bumped;
        let unheld = {
            let state = store.shared.state.lock().unwrap();
            state.hold_counts.get(&source_id).copied().unwrap_or(0) == 0
        };
        if drained && unheld {
            break;
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    source.erase()
}
