//! The document store proper: owns the ordered set of chunk files, the lid
//! directory, and the write/flush/compaction protocol that ties them
//! together.
//!
//! Grounded on `logdatastore.cpp`'s `LogDataStore` (the file-set manager
//! wrapping many `FileChunk`s) generalized to Rust ownership: where the
//! original keeps a `std::vector<FileChunk::SP>` guarded by a single mutex
//! plus a separate generation-guarded reader path, this keeps the same
//! shape — a `Mutex<ManagerState>` for the sparse file-id table and a
//! `GenerationHandler` guarding reads against a concurrent compaction
//! unlinking the file a reader is part-way through.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use crate::bucketizer::Bucketizer;
use crate::chunkfile::{self, ChunkFile, FileId, NameId};
use crate::config::Config;
use crate::directory::{LidDirectory, LidEntry};
use crate::error::{Result, StoreError};
use crate::executor::Executor;
use crate::generation::GenerationHandler;
use crate::header::FileHeaderContext;
use crate::tlog::TlogSync;
use crate::visitor::{DataStoreVisitor, DataStoreVisitorProgress};
use crate::compactor;

pub(crate) struct ManagerState {
    pub(crate) files: HashMap<FileId, Arc<ChunkFile>>,
    pub(crate) active: Option<FileId>,
    pub(crate) compacting: HashSet<NameId>,
    pub(crate) hold_counts: HashMap<FileId, u64>,
    pub(crate) last_serial: u64,
    pub(crate) last_synced_serial: u64,
    pub(crate) next_name_id: NameId,
    pub(crate) next_file_id: FileId,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<ManagerState>,
    pub(crate) sync_cv: Condvar,
}

/// Summary counters surfaced to callers that want to monitor the store
/// without walking its internals directly.
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub num_files: usize,
    pub disk_footprint: u64,
    pub disk_bloat: u64,
    pub num_live_lids: usize,
    pub doc_id_limit: u32,
    pub last_serial: u64,
    pub last_synced_serial: u64,
    /// Largest per-file bucket spread across every frozen file, or `None`
    /// when no bucketizer is configured.
    pub max_bucket_spread: Option<f64>,
}

pub struct DocumentStore {
    pub(crate) dir: PathBuf,
    pub(crate) config: Config,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) tlog: Arc<dyn TlogSync>,
    pub(crate) bucketizer: Option<Arc<dyn Bucketizer>>,
    pub(crate) header_ctx: FileHeaderContext,
    pub(crate) generation: Arc<GenerationHandler>,
    pub(crate) directory: Arc<LidDirectory>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) read_only: bool,
}

struct HoldGuard<'a> {
    shared: &'a Shared,
    file_id: FileId,
}

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(c) = state.hold_counts.get_mut(&self.file_id) {
            if *c <= 1 {
                state.hold_counts.remove(&self.file_id);
            } else {
                *c -= 1;
            }
        }
    }
}

impl DocumentStore {
    /// Open (creating if empty) the chunk-file set rooted at `dir`.
    ///
    /// Recovery replays every complete `(dat, idx)` pair in ascending
    /// `nameId` order into the lid directory, then always starts a fresh
    /// active file on top — this store never resumes appending into
    /// whatever file was active when the process last stopped, which also
    /// means a crash mid-write never needs a special "repair the active
    /// file" code path: `ChunkFile::open_frozen`'s truncation handling
    /// already covers a dat file that ends mid-chunk.
    pub fn open(
        dir: impl AsRef<Path>,
        config: Config,
        executor: Arc<dyn Executor>,
        tlog: Arc<dyn TlogSync>,
        bucketizer: Option<Arc<dyn Bucketizer>>,
        header_ctx: FileHeaderContext,
        read_only: bool,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let name_ids = scan_existing(&dir)?;
        verify_modification_time(&dir, &name_ids);

        let directory = Arc::new(LidDirectory::new());
        let mut files = HashMap::new();
        let mut next_file_id: FileId = 0;
        let mut max_name_id: NameId = 0;
        let mut total_skipped = 0usize;

        for &name_id in &name_ids {
            let cf = Arc::new(ChunkFile::open_frozen(&dir, name_id, next_file_id, &config)?);
            let stats = cf.update_lid_directory(&directory, config.skip_crc_on_read)?;
            total_skipped += stats.skipped;
            max_name_id = max_name_id.max(name_id);
            files.insert(next_file_id, cf);
            next_file_id += 1;
        }
        if total_skipped > 0 {
            tracing::warn!(
                skipped = total_skipped,
                "lid entries skipped during recovery: beyond their file's recorded docIdLimit"
            );
        }

        let active = if read_only {
            None
        } else {
            let name_id = max_name_id + 1;
            let file_id = next_file_id;
            let cf = Arc::new(ChunkFile::create_active(
                &dir,
                name_id,
                file_id,
                &header_ctx,
                config.crc_on_write,
            )?);
            files.insert(file_id, cf);
            next_file_id += 1;
            Some(file_id)
        };
        let next_name_id = max_name_id + if active.is_some() { 2 } else { 1 };
        let last_serial = files.values().map(|f| f.last_persisted_serial()).max().unwrap_or(0);

        Ok(Self {
            dir,
            config,
            executor,
            tlog,
            bucketizer,
            header_ctx,
            generation: Arc::new(GenerationHandler::new()),
            directory,
            shared: Arc::new(Shared {
                state: Mutex::new(ManagerState {
                    files,
                    active,
                    compacting: HashSet::new(),
                    hold_counts: HashMap::new(),
                    last_serial,
                    last_synced_serial: last_serial,
                    next_name_id,
                    next_file_id,
                }),
                sync_cv: Condvar::new(),
            }),
            read_only,
        })
    }

    fn hold(&self, file_id: FileId) -> HoldGuard<'_> {
        {
            let mut state = self.shared.state.lock().unwrap();
            *state.hold_counts.entry(file_id).or_insert(0) += 1;
        }
        HoldGuard {
            shared: &self.shared,
            file_id,
        }
    }

    fn write_internal(&self, serial: u64, lid: u32, bytes: &[u8], is_remove: bool) -> Result<()> {
        if self.read_only {
            return Err(StoreError::InvalidState("store is read-only".into()));
        }
        if lid >= (1u32 << 31) {
            return Err(StoreError::InvalidArgument(format!(
                "lid {lid} exceeds the 2^31 limit"
            )));
        }
        let mut state = self.shared.state.lock().unwrap();
        let active_id = state
            .active
            .ok_or_else(|| StoreError::InvalidState("no active file".into()))?;
        let active = state.files.get(&active_id).unwrap().clone();

        let (chunk_id, size) = active.append(serial, lid, bytes, &self.config)?;

        let old = if is_remove {
            self.directory.remove(lid)
        } else {
            self.directory.put(
                lid,
                LidEntry {
                    file_id: active_id,
                    chunk_id,
                    size,
                },
            )
        };
        if let Some(old) = old {
            if let Some(old_file) = state.files.get(&old.file_id) {
                old_file.add_bloat(old.size);
            }
        }
        state.last_serial = state.last_serial.max(serial);

        let rotate_task = if self.config.max_file_size != 0
            && active.logical_size() >= self.config.max_file_size
        {
            Some(self.rotate_locked(&mut state)?)
        } else {
            None
        };
        // Drop the manager lock before handing work to the executor: an
        // `InlineExecutor` runs the task on this same thread, and the task
        // itself needs to take this same lock to record its completion.
        drop(state);
        if let Some(task) = rotate_task {
            self.executor.execute(task);
        }
        Ok(())
    }

    /// Append directly to a specific destination file, bypassing the
    /// active-file routing `write`/`remove` use. Exists only for the
    /// compactor, which migrates a still-live record into whichever file
    /// it chose as this round's compaction destination — a file that may
    /// or may not be the current active file. Errors with `InvalidState`
    /// if `file_id` does not name a file currently in the live set (or
    /// names one that has already been frozen, since `ChunkFile::append`
    /// itself refuses writes past that point).
    pub(crate) fn write_direct(
        &self,
        file_id: FileId,
        serial: u64,
        lid: u32,
        bytes: &[u8],
    ) -> Result<(u32, u32)> {
        let dest = {
            let state = self.shared.state.lock().unwrap();
            state.files.get(&file_id).cloned()
        };
        let dest = dest.ok_or_else(|| {
            StoreError::InvalidState(format!("write_direct target file {file_id} is not live"))
        })?;
        dest.append(serial, lid, bytes, &self.config)
    }

    /// Append `bytes` under `lid`. An empty payload is a logical remove,
    /// same as calling `remove` directly.
    pub fn write(&self, serial: u64, lid: u32, bytes: &[u8]) -> Result<()> {
        self.write_internal(serial, lid, bytes, bytes.is_empty())
    }

    pub fn remove(&self, serial: u64, lid: u32) -> Result<()> {
        self.write_internal(serial, lid, &[], true)
    }

    /// Swap in a fresh active file and return the background task that
    /// finalizes the one being retired (flush, tlog sync, freeze). Called
    /// automatically from `write`/`remove` once the active file crosses
    /// `max_file_size`. The caller must release the manager lock before
    /// running the returned task: it takes that same lock to record its own
    /// completion, and an `InlineExecutor` runs it on the calling thread.
    fn rotate_locked(&self, state: &mut ManagerState) -> Result<Box<dyn FnOnce() + Send>> {
        let old_active_id = state
            .active
            .take()
            .ok_or_else(|| StoreError::InvalidState("no active file to rotate".into()))?;
        let old_active = state.files.get(&old_active_id).unwrap().clone();

        let new_name_id = state.next_name_id;
        let new_file_id = state.next_file_id;
        state.next_name_id += 1;
        state.next_file_id += 1;

        let new_active = Arc::new(ChunkFile::create_active(
            &self.dir,
            new_name_id,
            new_file_id,
            &self.header_ctx,
            self.config.crc_on_write,
        )?);
        state.files.insert(new_file_id, new_active);
        state.active = Some(new_file_id);

        let doc_id_limit = self.directory.doc_id_limit();
        let shared = self.shared.clone();
        let tlog = self.tlog.clone();
        Ok(Box::new(move || {
            let result = old_active.flush().and_then(|last_serial| {
                tlog.sync(last_serial)?;
                old_active.freeze(doc_id_limit)?;
                Ok(last_serial)
            });
            match result {
                Ok(last_serial) => {
                    let mut s = shared.state.lock().unwrap();
                    s.last_synced_serial = s.last_synced_serial.max(last_serial);
                    drop(s);
                    shared.sync_cv.notify_all();
                }
                Err(e) => tracing::error!(error = %e, "failed to finalize rotated chunk file"),
            }
        }))
    }

    pub fn read(&self, lid: u32, buf: &mut Vec<u8>) -> Result<usize> {
        let _guard = self.generation.take_guard();
        let entry = match self.directory.get(lid) {
            Some(e) => e,
            None => {
                buf.clear();
                return Ok(0);
            }
        };
        let file = {
            let state = self.shared.state.lock().unwrap();
            state.files.get(&entry.file_id).cloned()
        };
        let Some(file) = file else {
            buf.clear();
            return Ok(0);
        };
        let _hold = self.hold(entry.file_id);
        let payload = file.read_payload(lid, entry.chunk_id, self.config.skip_crc_on_read)?;
        buf.clear();
        buf.extend_from_slice(&payload);
        Ok(payload.len())
    }

    pub fn read_batch(&self, lids: &[u32], visitor: &mut dyn DataStoreVisitor) -> Result<()> {
        let _guard = self.generation.take_guard();
        let mut by_file: HashMap<FileId, Vec<(u32, u32)>> = HashMap::new();
        for &lid in lids {
            if let Some(entry) = self.directory.get(lid) {
                by_file.entry(entry.file_id).or_default().push((lid, entry.chunk_id));
            }
        }
        for (file_id, items) in by_file {
            let file = {
                let state = self.shared.state.lock().unwrap();
                state.files.get(&file_id).cloned()
            };
            let Some(file) = file else { continue };
            let _hold = self.hold(file_id);
            for (lid, chunk_id) in items {
                if let Ok(bytes) = file.read_payload(lid, chunk_id, self.config.skip_crc_on_read) {
                    visitor.visit(lid, &bytes);
                }
            }
        }
        Ok(())
    }

    /// Visit every currently-live record exactly once, in ascending
    /// `nameId` order. `prune`, if set, clears each visited lid from the
    /// directory as it is delivered (a one-shot export-and-wipe).
    pub fn accept(
        &self,
        visitor: &mut dyn DataStoreVisitor,
        mut progress: Option<&mut dyn DataStoreVisitorProgress>,
        prune: bool,
    ) -> Result<()> {
        let _guard = self.generation.take_guard();
        let files: Vec<Arc<ChunkFile>> = {
            let state = self.shared.state.lock().unwrap();
            let mut v: Vec<_> = state.files.values().cloned().collect();
            v.sort_by_key(|f| f.name_id());
            v
        };
        let total = files.len().max(1);
        for (i, file) in files.iter().enumerate() {
            let file_id = file.file_id();
            let _hold = self.hold(file_id);
            let directory = &self.directory;
            let mut visited = Vec::new();
            file.visit_all(self.config.skip_crc_on_read, |_serial, lid, chunk_id, bytes| {
                if let Some(entry) = directory.get(lid) {
                    if entry.file_id == file_id && entry.chunk_id == chunk_id {
                        visitor.visit(lid, bytes);
                        visited.push(lid);
                    }
                }
            })?;
            if prune {
                for lid in visited {
                    self.directory.remove(lid);
                }
            }
            if let Some(p) = progress.as_deref_mut() {
                p.update_progress((i + 1) as f64 / total as f64);
            }
        }
        Ok(())
    }

    /// Flush the active file's pending chunks and ask the tlog synchronizer
    /// to sync, without blocking for that sync to finish. Returns the
    /// serial a subsequent `flush` call should wait for.
    pub fn init_flush(&self) -> Result<u64> {
        let active = {
            let state = self.shared.state.lock().unwrap();
            state.active.and_then(|id| state.files.get(&id).cloned())
        };
        if let Some(active) = active {
            let last = active.flush()?;
            self.tlog.sync(last)?;
            let mut state = self.shared.state.lock().unwrap();
            state.last_synced_serial = state.last_synced_serial.max(last);
            drop(state);
            self.shared.sync_cv.notify_all();
        }
        Ok(self.shared.state.lock().unwrap().last_serial)
    }

    /// Block until every operation up to `sync_token` is durable.
    pub fn flush(&self, sync_token: u64) -> Result<()> {
        self.init_flush()?;
        let mut state = self.shared.state.lock().unwrap();
        while state.last_synced_serial < sync_token {
            state = self.shared.sync_cv.wait(state).unwrap();
        }
        Ok(())
    }

    pub fn last_sync_token(&self) -> u64 {
        self.shared.state.lock().unwrap().last_synced_serial
    }

    pub fn compact(&self) -> Result<bool> {
        compactor::compact_round(self)
    }

    pub fn estimate_compact_gain(&self) -> u64 {
        compactor::estimate_gain(self)
    }

    pub fn compact_lid_space(&self, new_limit: u32) -> Result<()> {
        self.directory.compact_lid_space(new_limit)
    }

    pub fn shrink_lid_space(&self) {
        self.directory.shrink_lid_space()
    }

    pub fn memory_used(&self) -> usize {
        self.directory.memory_footprint()
    }

    pub fn memory_meta(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.files.len() * std::mem::size_of::<ChunkFile>()
    }

    pub fn storage_stats(&self) -> StorageStats {
        let state = self.shared.state.lock().unwrap();
        let mut stats = StorageStats {
            num_files: state.files.len(),
            doc_id_limit: self.directory.doc_id_limit(),
            last_serial: state.last_serial,
            last_synced_serial: state.last_synced_serial,
            ..Default::default()
        };
        for f in state.files.values() {
            stats.disk_footprint += f.disk_footprint();
            stats.disk_bloat += f.disk_bloat();
        }
        let live = self.directory.snapshot();
        stats.num_live_lids = live.len();
        if let Some(b) = self.bucketizer.as_deref() {
            let mut spread_by_file: HashMap<FileId, HashSet<u32>> = HashMap::new();
            for (lid, entry) in &live {
                spread_by_file
                    .entry(entry.file_id)
                    .or_default()
                    .insert(b.bucket_of(*lid));
            }
            stats.max_bucket_spread = spread_by_file
                .values()
                .map(|s| s.len() as f64)
                .fold(None, |acc, n| Some(acc.map_or(n, |m: f64| m.max(n))));
        }
        stats
    }
}

/// Discover every complete `(dat, idx)` pair under `dir`, in ascending
/// `nameId` order, removing any half-written pair along the way. A dangling
/// file from a crash between creating the `.dat` and the `.idx` (or a
/// partial write of either) is never a recovered chunk file, so erasing it
/// loses nothing that `update_lid_directory` could have replayed.
fn scan_existing(dir: &Path) -> Result<Vec<NameId>> {
    let mut dat_ids = BTreeSet::new();
    let mut idx_ids = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".dat") {
            if let Ok(id) = stem.parse::<u64>() {
                dat_ids.insert(id);
            }
        } else if let Some(stem) = name.strip_suffix(".idx") {
            if let Ok(id) = stem.parse::<u64>() {
                idx_ids.insert(id);
            }
        }
    }
    for &id in dat_ids.difference(&idx_ids) {
        tracing::warn!(name_id = id, "dangling .dat file with no matching .idx, removing");
        let _ = std::fs::remove_file(chunkfile::dat_path(dir, id));
    }
    for &id in idx_ids.difference(&dat_ids) {
        tracing::warn!(name_id = id, "dangling .idx file with no matching .dat, removing");
        let _ = std::fs::remove_file(chunkfile::idx_path(dir, id));
    }
    let mut complete: Vec<NameId> = dat_ids.intersection(&idx_ids).copied().collect();
    complete.sort_unstable();
    Ok(complete)
}

/// Diagnostic-only check: chunk files should be modified in `nameId` order.
/// A violation (clock skew, manual tampering, a restored backup) is logged
/// and otherwise ignored — recovery never refuses to start over it.
fn verify_modification_time(dir: &Path, name_ids: &[NameId]) {
    let mut prev: Option<std::time::SystemTime> = None;
    for &id in name_ids {
        let meta = match std::fs::metadata(chunkfile::dat_path(dir, id)) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let Ok(mtime) = meta.modified() else { continue };
        if let Some(p) = prev {
            if mtime < p {
                tracing::warn!(
                    name_id = id,
                    "chunk file modification time precedes an earlier file; \
                     clock skew or manual file manipulation suspected"
                );
            }
        }
        prev = Some(mtime);
    }
}
