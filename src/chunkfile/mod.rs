//! Chunk-file pair — one `.dat` (framed chunks) plus one `.idx` (per-chunk
//! directory), sharing a numeric `nameId`.
//!
//! Grounded on `io_stream/mod.rs`'s `SixCyWriter`/`SixCyReader` split
//! between an append-only accumulator and a random-access reader that
//! reconstructs its view by scanning headers, generalized from a single
//! whole-archive container to one chunk file among many, addressed by a
//! dense `fileId` at the store layer.
//!
//! A `ChunkFile` starts active (`create_active`) and is later frozen
//! (`freeze`). Offloading flush/compaction work to a background executor
//! happens one layer up, in `store.rs` — `ChunkFile` itself is a plain
//! synchronous `&self` API so it has no executor-lifetime plumbing of its
//! own.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use crate::config::{ChecksumFlavor, CompressionAlgo, Config};
use crate::directory::{LidDirectory, LidEntry};
use crate::error::{Result, StoreError};
use crate::header::{self, FileHeader, FileHeaderContext};
use crate::record::{self, Record, RECORD_HEADER_SIZE};

pub type NameId = u64;
pub type FileId = u32;

const IDX_ENTRY_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdxEntry {
    pub chunk_id: u32,
    pub file_offset: u64,
    pub last_serial: u64,
    pub num_entries: u32,
}

impl IdxEntry {
    fn encode(&self) -> [u8; IDX_ENTRY_SIZE] {
        let mut buf = [0u8; IDX_ENTRY_SIZE];
        buf[0..4].copy_from_slice(&self.chunk_id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.file_offset.to_le_bytes());
        buf[12..20].copy_from_slice(&self.last_serial.to_le_bytes());
        buf[20..24].copy_from_slice(&self.num_entries.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; IDX_ENTRY_SIZE]) -> Self {
        Self {
            chunk_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            file_offset: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            last_serial: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            num_entries: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Default)]
pub struct UpdateStats {
    pub applied: usize,
    pub skipped: usize,
}

struct WriterState {
    current: Vec<Record>,
    current_bytes: usize,
    next_chunk_id: u32,
    pending: Vec<(IdxEntry, Vec<u8>)>,
    dat_write_pos: u64,
}

pub struct ChunkFile {
    file_id: FileId,
    name_id: NameId,
    dat_path: PathBuf,
    idx_path: PathBuf,
    dat_file: File,
    idx_file: Mutex<File>,
    #[allow(dead_code)]
    header_len: u64,
    writer: Mutex<Option<WriterState>>,
    idx: RwLock<Vec<IdxEntry>>,
    disk_footprint: AtomicU64,
    disk_bloat: AtomicU64,
    last_persisted_serial: AtomicU64,
    /// `u32::MAX` means "no trailer yet" — either still active, or a
    /// legacy/crashed frozen file. Both are treated as `docIdLimit = ∞`.
    doc_id_limit: AtomicU32,
    frozen: AtomicBool,
    write_flavor: ChecksumFlavor,
}

pub fn dat_path(dir: &Path, name_id: NameId) -> PathBuf {
    dir.join(format!("{name_id:020}.dat"))
}

pub fn idx_path(dir: &Path, name_id: NameId) -> PathBuf {
    dir.join(format!("{name_id:020}.idx"))
}

impl ChunkFile {
    pub fn create_active(
        dir: &Path,
        name_id: NameId,
        file_id: FileId,
        ctx: &FileHeaderContext,
        flavor: ChecksumFlavor,
    ) -> Result<Self> {
        let dp = dat_path(dir, name_id);
        let ip = idx_path(dir, name_id);

        let mut dat_file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&dp)?;
        let header_len = FileHeader::new(ctx, "docstore chunk data").write(&mut dat_file)?;
        dat_file.sync_all()?;

        let mut idx_file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&ip)?;
        FileHeader::new(ctx, "docstore chunk index").write(&mut idx_file)?;
        idx_file.sync_all()?;

        Ok(Self {
            file_id,
            name_id,
            dat_path: dp,
            idx_path: ip,
            dat_file,
            idx_file: Mutex::new(idx_file),
            header_len,
            writer: Mutex::new(Some(WriterState {
                current: Vec::new(),
                current_bytes: 0,
                next_chunk_id: 0,
                pending: Vec::new(),
                dat_write_pos: header_len,
            })),
            idx: RwLock::new(Vec::new()),
            disk_footprint: AtomicU64::new(header_len),
            disk_bloat: AtomicU64::new(0),
            last_persisted_serial: AtomicU64::new(0),
            doc_id_limit: AtomicU32::new(u32::MAX),
            frozen: AtomicBool::new(false),
            write_flavor: flavor,
        })
    }

    pub fn open_frozen(
        dir: &Path,
        name_id: NameId,
        file_id: FileId,
        config: &Config,
    ) -> Result<Self> {
        let dp = dat_path(dir, name_id);
        let ip = idx_path(dir, name_id);

        // Writable only when truncation might be needed: a corrupt trailing
        // tail can only be repaired in place if `allow_truncate` lets us
        // shorten the file, and that requires a handle opened for writing.
        let dat_file = std::fs::OpenOptions::new()
            .read(true)
            .write(config.allow_truncate)
            .open(&dp)?;
        let mut dat_reader = CountingReader {
            inner: &dat_file,
            count: 0,
        };
        FileHeader::read(&mut dat_reader)?;
        let header_len = dat_reader.count;

        let mut idx_file = File::open(&ip)?;
        FileHeader::read(&mut idx_file)?;
        let (entries, trailer) = read_idx_entries(&mut idx_file, config.allow_truncate)?;

        let last_persisted_serial = entries.iter().map(|e| e.last_serial).max().unwrap_or(0);
        let dat_len = dat_file.metadata()?.len();
        let dat_end = verify_and_maybe_truncate_dat(
            &dat_file,
            &entries,
            dat_len,
            header_len,
            config.allow_truncate,
        )?;

        Ok(Self {
            file_id,
            name_id,
            dat_path: dp,
            idx_path: ip,
            dat_file,
            idx_file: Mutex::new(idx_file),
            header_len,
            writer: Mutex::new(None),
            idx: RwLock::new(entries),
            disk_footprint: AtomicU64::new(dat_end),
            disk_bloat: AtomicU64::new(0),
            last_persisted_serial: AtomicU64::new(last_persisted_serial),
            doc_id_limit: AtomicU32::new(trailer.unwrap_or(u32::MAX)),
            frozen: AtomicBool::new(true),
            write_flavor: config.crc_on_write,
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn name_id(&self) -> NameId {
        self.name_id
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn disk_footprint(&self) -> u64 {
        self.disk_footprint.load(Ordering::Acquire)
    }

    pub fn disk_bloat(&self) -> u64 {
        self.disk_bloat.load(Ordering::Acquire)
    }

    pub fn add_bloat(&self, n: u32) {
        self.disk_bloat.fetch_add(n as u64, Ordering::AcqRel);
    }

    pub fn last_persisted_serial(&self) -> u64 {
        self.last_persisted_serial.load(Ordering::Acquire)
    }

    /// Total size this file would occupy on disk if everything currently
    /// buffered (the open in-memory chunk plus anything closed but not yet
    /// flushed) were persisted right now. Rotation decisions use this
    /// instead of [`Self::disk_footprint`], which only reflects bytes
    /// already fsynced, so a burst of writes between flushes still rotates
    /// promptly instead of only after the next flush happens to run.
    pub fn logical_size(&self) -> u64 {
        let guard = self.writer.lock().unwrap();
        let pending_extra: u64 = match guard.as_ref() {
            Some(w) => {
                w.current_bytes as u64 + w.pending.iter().map(|(_, f)| f.len() as u64).sum::<u64>()
            }
            None => 0,
        };
        self.disk_footprint() + pending_extra
    }

    pub fn num_chunks(&self) -> usize {
        self.idx.read().unwrap().len()
    }

    pub fn doc_id_limit(&self) -> u32 {
        self.doc_id_limit.load(Ordering::Acquire)
    }

    /// Append a record to the currently open in-memory chunk, closing it
    /// (and queuing it for the next `flush`) if it has reached its
    /// configured size. Never touches disk.
    pub fn append(&self, serial: u64, lid: u32, bytes: &[u8], config: &Config) -> Result<(u32, u32)> {
        if lid >= (1u32 << 31) {
            return Err(StoreError::InvalidArgument(format!(
                "lid {lid} exceeds the 2^31 limit"
            )));
        }
        let mut guard = self.writer.lock().unwrap();
        let w = guard
            .as_mut()
            .ok_or_else(|| StoreError::InvalidState("append on a frozen chunk file".into()))?;

        let chunk_id = w.next_chunk_id;
        let size = (RECORD_HEADER_SIZE + bytes.len()) as u32;
        w.current.push(Record {
            serial,
            lid,
            bytes: bytes.to_vec(),
        });
        w.current_bytes += RECORD_HEADER_SIZE + bytes.len();

        if w.current_bytes >= config.max_chunk_bytes || w.current.len() >= config.max_chunk_records
        {
            self.close_current_locked(w)?;
        }
        Ok((chunk_id, size))
    }

    fn close_current_locked(&self, w: &mut WriterState) -> Result<()> {
        if w.current.is_empty() {
            return Ok(());
        }
        let frame = record::encode_chunk(&w.current, CompressionAlgo::None, self.write_flavor)?;
        let last_serial = w.current.iter().map(|r| r.serial).max().unwrap();
        let num_entries = w.current.len() as u32;
        let entry = IdxEntry {
            chunk_id: w.next_chunk_id,
            file_offset: w.dat_write_pos,
            last_serial,
            num_entries,
        };
        w.dat_write_pos += frame.len() as u64;
        w.pending.push((entry, frame));
        w.current.clear();
        w.current_bytes = 0;
        w.next_chunk_id += 1;
        Ok(())
    }

    /// Freeze the open chunk if any, write every pending chunk to `.dat` in
    /// order, append matching `.idx` entries, then fsync `.dat` then
    /// `.idx`. Returns the new `last_persisted_serial`.
    pub fn flush(&self) -> Result<u64> {
        let mut guard = self.writer.lock().unwrap();
        let w = guard
            .as_mut()
            .ok_or_else(|| StoreError::InvalidState("flush on a frozen chunk file".into()))?;

        self.close_current_locked(w)?;
        if w.pending.is_empty() {
            return Ok(self.last_persisted_serial.load(Ordering::Acquire));
        }
        let pending = std::mem::take(&mut w.pending);
        let max_serial = pending.iter().map(|(e, _)| e.last_serial).max().unwrap();
        let total_bytes: u64 = pending.iter().map(|(_, f)| f.len() as u64).sum();

        let result = (|| -> Result<()> {
            for (entry, frame) in &pending {
                self.dat_file
                    .write_all_at(frame, entry.file_offset)
                    .map_err(|e| StoreError::io_at(e, entry.file_offset))?;
            }
            self.dat_file
                .sync_all()
                .map_err(|e| StoreError::io_at(e, 0))?;
            {
                let mut idx_file = self.idx_file.lock().unwrap();
                for (entry, _) in &pending {
                    idx_file.write_all(&entry.encode())?;
                }
                idx_file.sync_all()?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.idx
                    .write()
                    .unwrap()
                    .extend(pending.iter().map(|(e, _)| *e));
                self.disk_footprint.fetch_add(total_bytes, Ordering::AcqRel);
                self.last_persisted_serial
                    .fetch_max(max_serial, Ordering::AcqRel);
                Ok(self.last_persisted_serial.load(Ordering::Acquire))
            }
            Err(e) => {
                // Roll the pending batch back so a retried flush picks up
                // exactly the same chunks; the writer's in-memory offset
                // bookkeeping (`dat_write_pos`) is unaffected since it was
                // only ever advanced logically, not by the failed I/O.
                w.pending = pending;
                Err(e)
            }
        }
    }

    /// Transition to frozen. Requires a prior `flush` with nothing left
    /// pending. Writes the `.idx` trailer carrying the store's docIdLimit
    /// at the moment of freezing.
    pub fn freeze(&self, doc_id_limit: u32) -> Result<()> {
        let mut guard = self.writer.lock().unwrap();
        let w = guard
            .take()
            .ok_or_else(|| StoreError::InvalidState("chunk file is already frozen".into()))?;
        if !w.current.is_empty() || !w.pending.is_empty() {
            *guard = Some(w);
            return Err(StoreError::InvalidState(
                "freeze requires a prior flush with nothing pending".into(),
            ));
        }
        {
            let mut idx_file = self.idx_file.lock().unwrap();
            header::write_idx_trailer(&mut *idx_file, doc_id_limit)?;
            idx_file.sync_all()?;
        }
        self.doc_id_limit.store(doc_id_limit, Ordering::Release);
        self.frozen.store(true, Ordering::Release);
        Ok(())
    }

    pub fn lookup(&self, chunk_id: u32) -> Result<IdxEntry> {
        let idx = self.idx.read().unwrap();
        idx.binary_search_by_key(&chunk_id, |e| e.chunk_id)
            .map(|i| idx[i])
            .map_err(|_| {
                StoreError::InvalidState(format!(
                    "chunk {chunk_id} not present in file {}",
                    self.name_id
                ))
            })
    }

    fn read_chunk_at(&self, offset: u64, skip_crc: bool) -> Result<Vec<Record>> {
        let mut prefix = [0u8; 5];
        self.dat_file
            .read_exact_at(&mut prefix, offset)
            .map_err(|e| StoreError::io_at(e, offset))?;
        let total = match record::peek_length(&prefix) {
            record::Peek::Length(n) => n,
            record::Peek::NeedMore => unreachable!("prefix is always 5 bytes"),
        };
        let mut frame = vec![0u8; total];
        self.dat_file
            .read_exact_at(&mut frame, offset)
            .map_err(|e| StoreError::io_at(e, offset))?;
        record::decode_chunk(&frame, skip_crc)
    }

    pub fn read_chunk(&self, chunk_id: u32, skip_crc: bool) -> Result<Vec<Record>> {
        let entry = self.lookup(chunk_id)?;
        self.read_chunk_at(entry.file_offset, skip_crc)
    }

    pub fn read_payload(&self, lid: u32, chunk_id: u32, skip_crc: bool) -> Result<Vec<u8>> {
        match self.lookup(chunk_id) {
            Ok(entry) => {
                let records = self.read_chunk_at(entry.file_offset, skip_crc)?;
                records
                    .into_iter()
                    .find(|r| r.lid == lid)
                    .map(|r| r.bytes)
                    .ok_or_else(|| {
                        StoreError::InvalidState(format!(
                            "lid {lid} not present in chunk {chunk_id}"
                        ))
                    })
            }
            // `chunk_id` hasn't reached the persisted `.idx` yet — it may
            // still be the open chunk or a closed-but-unflushed one. Serve
            // it from the write buffer rather than surfacing a lookup miss
            // for a lid the directory says is live.
            Err(_) => self.read_buffered_payload(lid, chunk_id, skip_crc).ok_or_else(|| {
                StoreError::InvalidState(format!("lid {lid} not present in chunk {chunk_id}"))
            }),
        }
    }

    /// Look for `lid` in this file's in-memory write buffer: the currently
    /// open chunk if `chunk_id` names it, otherwise a chunk already closed
    /// by `close_current_locked` but not yet written out by `flush`.
    fn read_buffered_payload(&self, lid: u32, chunk_id: u32, skip_crc: bool) -> Option<Vec<u8>> {
        let guard = self.writer.lock().unwrap();
        let w = guard.as_ref()?;
        if w.next_chunk_id == chunk_id {
            if let Some(r) = w.current.iter().find(|r| r.lid == lid) {
                return Some(r.bytes.clone());
            }
        }
        for (entry, frame) in &w.pending {
            if entry.chunk_id == chunk_id {
                if let Ok(records) = record::decode_chunk(frame, skip_crc) {
                    if let Some(r) = records.into_iter().find(|r| r.lid == lid) {
                        return Some(r.bytes);
                    }
                }
            }
        }
        None
    }

    pub fn visit_all(&self, skip_crc: bool, mut sink: impl FnMut(u64, u32, u32, &[u8])) -> Result<()> {
        let chunks: Vec<(u32, u64)> = self
            .idx
            .read()
            .unwrap()
            .iter()
            .map(|e| (e.chunk_id, e.file_offset))
            .collect();
        for (chunk_id, offset) in chunks {
            for r in self.read_chunk_at(offset, skip_crc)? {
                sink(r.serial, r.lid, chunk_id, &r.bytes);
            }
        }
        Ok(())
    }

    /// Replay every record in this file into `directory`, honoring this
    /// file's own `docIdLimit` ceiling (absent/legacy = no ceiling).
    pub fn update_lid_directory(&self, directory: &LidDirectory, skip_crc: bool) -> Result<UpdateStats> {
        let ceiling = self.doc_id_limit();
        let mut stats = UpdateStats::default();
        let chunks: Vec<(u32, u64)> = self
            .idx
            .read()
            .unwrap()
            .iter()
            .map(|e| (e.chunk_id, e.file_offset))
            .collect();
        for (chunk_id, offset) in chunks {
            for r in self.read_chunk_at(offset, skip_crc)? {
                if r.lid >= ceiling {
                    stats.skipped += 1;
                    continue;
                }
                if r.is_remove() {
                    directory.remove(r.lid);
                } else {
                    directory.put(
                        r.lid,
                        LidEntry {
                            file_id: self.file_id,
                            chunk_id,
                            size: r.framed_size(),
                        },
                    );
                }
                stats.applied += 1;
            }
        }
        Ok(stats)
    }

    pub fn erase(&self) -> Result<()> {
        std::fs::remove_file(&self.dat_path)?;
        std::fs::remove_file(&self.idx_path)?;
        Ok(())
    }
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

fn read_up_to<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match r.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StoreError::from(e)),
        }
    }
    Ok(total)
}

/// Read `.idx` entries after the header, honoring the trailer/truncation
/// rules described in `header.rs`.
fn read_idx_entries<R: Read>(r: &mut R, allow_truncate: bool) -> Result<(Vec<IdxEntry>, Option<u32>)> {
    let mut entries = Vec::new();
    loop {
        let mut buf = [0u8; IDX_ENTRY_SIZE];
        let n = read_up_to(r, &mut buf)?;
        if n == IDX_ENTRY_SIZE {
            entries.push(IdxEntry::decode(&buf));
            continue;
        }
        if n == header::IDX_TRAILER_SIZE as usize {
            if let Some(limit) = header::read_idx_trailer(&buf[..n]) {
                return Ok((entries, Some(limit)));
            }
        }
        let tail = &buf[..n];
        if record::is_zero_tail(tail) {
            return Ok((entries, None));
        }
        if allow_truncate {
            return Ok((entries, None));
        }
        return Err(StoreError::ShortRead {
            expected: IDX_ENTRY_SIZE,
            actual: n,
        });
    }
}

/// Confirm the `.dat` file ends exactly where the last `.idx` entry's frame
/// says it should. A longer tail is tolerated (and, if `allow_truncate`, cut
/// off) when it is zero-padded or the caller explicitly allows truncation;
/// a shorter file, or a non-zero tail without `allow_truncate`, is fatal.
fn verify_and_maybe_truncate_dat(
    dat_file: &File,
    entries: &[IdxEntry],
    dat_len: u64,
    header_len: u64,
    allow_truncate: bool,
) -> Result<u64> {
    let expected_end = if let Some(last) = entries.last() {
        let mut prefix = [0u8; 5];
        dat_file
            .read_exact_at(&mut prefix, last.file_offset)
            .map_err(|e| StoreError::io_at(e, last.file_offset))?;
        match record::peek_length(&prefix) {
            record::Peek::Length(n) => last.file_offset + n as u64,
            record::Peek::NeedMore => unreachable!(),
        }
    } else {
        header_len
    };

    if dat_len == expected_end {
        return Ok(expected_end);
    }
    if dat_len < expected_end {
        return Err(StoreError::ShortRead {
            expected: expected_end as usize,
            actual: dat_len as usize,
        });
    }

    let tail_len = (dat_len - expected_end) as usize;
    let mut tail = vec![0u8; tail_len];
    dat_file
        .read_exact_at(&mut tail, expected_end)
        .map_err(|e| StoreError::io_at(e, expected_end))?;

    if record::is_zero_tail(&tail) || allow_truncate {
        if allow_truncate {
            dat_file.set_len(expected_end)?;
        }
        return Ok(expected_end);
    }

    Err(StoreError::Corrupt(format!(
        "{tail_len} trailing bytes at end of dat file are non-zero and allow_truncate is not set"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::header::FileHeaderContext;

    fn ctx() -> FileHeaderContext {
        FileHeaderContext::new("docstore-tests")
    }

    #[test]
    fn append_flush_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let cf = ChunkFile::create_active(dir.path(), 1, 0, &ctx(), config.crc_on_write).unwrap();

        let (chunk_id, _) = cf.append(1, 10, b"hello", &config).unwrap();
        cf.append(2, 11, b"world", &config).unwrap();
        cf.flush().unwrap();

        let payload = cf.read_payload(10, chunk_id, false).unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(cf.last_persisted_serial(), 2);
    }

    #[test]
    fn freeze_requires_flush() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let cf = ChunkFile::create_active(dir.path(), 2, 0, &ctx(), config.crc_on_write).unwrap();
        cf.append(1, 0, b"x", &config).unwrap();
        assert!(cf.freeze(1).is_err());
        cf.flush().unwrap();
        cf.freeze(1).unwrap();
        assert!(cf.is_frozen());
    }

    #[test]
    fn reopen_frozen_recovers_idx() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let name_id = 3;
        {
            let cf =
                ChunkFile::create_active(dir.path(), name_id, 0, &ctx(), config.crc_on_write)
                    .unwrap();
            cf.append(1, 0, b"abc", &config).unwrap();
            cf.flush().unwrap();
            cf.freeze(1).unwrap();
        }
        let reopened = ChunkFile::open_frozen(dir.path(), name_id, 0, &config).unwrap();
        assert!(reopened.is_frozen());
        assert_eq!(reopened.num_chunks(), 1);
        assert_eq!(reopened.doc_id_limit(), 1);
        let directory = LidDirectory::new();
        let stats = reopened.update_lid_directory(&directory, false).unwrap();
        assert_eq!(stats.applied, 1);
        assert!(directory.get(0).is_some());
    }
}
