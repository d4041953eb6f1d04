//! Generic tagged file header, written once at the start of every `.dat`
//! and `.idx` file.
//!
//! Grounded on `superblock.rs`'s tagged-header-with-trailing-CRC32 layout,
//! generalized from a single fixed 256-byte superblock to a small
//! variable-length tag list. Unlike the superblock, this header is never
//! rewritten in place and is not zero-padded to a fixed size — chunk files
//! are append-only, so the header is written exactly once, at file
//! creation, and its on-disk length becomes the offset of the first chunk.
//!
//! # On-disk layout (all integers little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic        = "DSFH"
//!    4      4   version      format version of this header
//!    8      2   creator_len  (u16)
//!   10      *   creator      UTF-8, creator_len bytes
//!    *      2   desc_len     (u16)
//!    *      *   desc         UTF-8, desc_len bytes
//!    *      2   tag_count    (u16)
//!    *      *   tag_count × (key_len:u16, key, val_len:u16, val)
//!    *      4   header_crc32 CRC32 of everything before this field
//! ```

use crc32fast::Hasher;
use std::io::{self, Read, Write};

use crate::error::{Result, StoreError};

pub const HEADER_MAGIC: &[u8; 4] = b"DSFH";
pub const HEADER_VERSION: u32 = 1;

/// Identity of the binary producing a chunk-file header. Supplied by the
/// caller (ambient "file-header-context" collaborator); not reimplemented,
/// just a value object carried into every header we write.
#[derive(Debug, Clone)]
pub struct FileHeaderContext {
    pub creator: String,
    pub tags: Vec<(String, String)>,
}

impl FileHeaderContext {
    pub fn new(creator: impl Into<String>) -> Self {
        Self {
            creator: creator.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FileHeader {
    pub version: u32,
    pub creator: String,
    pub desc: String,
    pub tags: Vec<(String, String)>,
}

impl FileHeader {
    pub fn new(ctx: &FileHeaderContext, desc: impl Into<String>) -> Self {
        Self {
            version: HEADER_VERSION,
            creator: ctx.creator.clone(),
            desc: desc.into(),
            tags: ctx.tags.clone(),
        }
    }

    /// Write the header and return its on-disk length in bytes.
    pub fn write<W: Write>(&self, mut w: W) -> Result<u64> {
        let mut buf = Vec::new();
        buf.extend_from_slice(HEADER_MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_string(&mut buf, &self.creator)?;
        write_string(&mut buf, &self.desc)?;
        if self.tags.len() > u16::MAX as usize {
            return Err(StoreError::InvalidArgument(
                "too many header tags".into(),
            ));
        }
        buf.extend_from_slice(&(self.tags.len() as u16).to_le_bytes());
        for (k, v) in &self.tags {
            write_string(&mut buf, k)?;
            write_string(&mut buf, v)?;
        }

        let mut h = Hasher::new();
        h.update(&buf);
        buf.extend_from_slice(&h.finalize().to_le_bytes());

        w.write_all(&buf).map_err(StoreError::from)?;
        Ok(buf.len() as u64)
    }

    pub fn read<R: Read>(mut r: R) -> Result<Self> {
        let mut hasher = Hasher::new();

        let mut magic = [0u8; 4];
        read_tracked(&mut r, &mut magic, &mut hasher)?;
        if &magic != HEADER_MAGIC {
            return Err(StoreError::UnknownFormat(
                "bad chunk-file header magic".into(),
            ));
        }

        let mut version_buf = [0u8; 4];
        read_tracked(&mut r, &mut version_buf, &mut hasher)?;
        let version = u32::from_le_bytes(version_buf);

        let creator = read_string(&mut r, &mut hasher)?;
        let desc = read_string(&mut r, &mut hasher)?;

        let mut count_buf = [0u8; 2];
        read_tracked(&mut r, &mut count_buf, &mut hasher)?;
        let count = u16::from_le_bytes(count_buf) as usize;

        let mut tags = Vec::with_capacity(count);
        for _ in 0..count {
            let k = read_string(&mut r, &mut hasher)?;
            let v = read_string(&mut r, &mut hasher)?;
            tags.push((k, v));
        }

        let expected = hasher.finalize();
        let mut stored_buf = [0u8; 4];
        r.read_exact(&mut stored_buf).map_err(StoreError::from)?;
        let stored = u32::from_le_bytes(stored_buf);
        if stored != expected {
            return Err(StoreError::BadChecksum {
                expected,
                actual: stored,
            });
        }

        Ok(Self {
            version,
            creator,
            desc,
            tags,
        })
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(StoreError::InvalidArgument("header string too long".into()));
    }
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_tracked<R: Read>(r: &mut R, buf: &mut [u8], hasher: &mut Hasher) -> Result<()> {
    r.read_exact(buf).map_err(StoreError::from)?;
    hasher.update(buf);
    Ok(())
}

fn read_string<R: Read>(r: &mut R, hasher: &mut Hasher) -> Result<String> {
    let mut len_buf = [0u8; 2];
    read_tracked(r, &mut len_buf, hasher)?;
    let len = u16::from_le_bytes(len_buf) as usize;
    let mut bytes = vec![0u8; len];
    read_tracked(r, &mut bytes, hasher)?;
    String::from_utf8(bytes).map_err(|e| {
        StoreError::Corrupt(format!("header string is not valid UTF-8: {e}"))
    })
}

/// Trailer written once on a `.idx` file when it is frozen (not at
/// creation, since the store's global `docIdLimit` at freeze time isn't
/// known yet when the leading header is written). Its absence — a frozen
/// file that crashed before the trailer was appended — is exactly the
/// "legacy file" case the lid-directory recovery logic treats as
/// `docIdLimit = ∞`.
pub const IDX_TRAILER_SIZE: u64 = 8;

pub fn write_idx_trailer<W: Write>(mut w: W, doc_id_limit: u32) -> Result<()> {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&doc_id_limit.to_le_bytes());
    let mut h = Hasher::new();
    h.update(&buf[0..4]);
    buf[4..8].copy_from_slice(&h.finalize().to_le_bytes());
    w.write_all(&buf).map_err(StoreError::from)
}

/// Returns `None` if the trailer is absent or corrupt (treated as legacy).
pub fn read_idx_trailer<R: Read>(mut r: R) -> Option<u32> {
    let mut buf = [0u8; 8];
    if r.read_exact(&mut buf).is_err() {
        return None;
    }
    let mut h = Hasher::new();
    h.update(&buf[0..4]);
    if h.finalize() != u32::from_le_bytes(buf[4..8].try_into().unwrap()) {
        return None;
    }
    Some(u32::from_le_bytes(buf[0..4].try_into().unwrap()))
}

pub fn io_err_to_store(e: io::Error, offset: u64) -> StoreError {
    StoreError::io_at(e, offset)
}
