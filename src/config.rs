//! Store configuration — the enumerated knobs from the external interface.
//!
//! A plain struct with a `Default` impl rather than a builder. Field
//! defaults are the literal values named in the original `LogDataStore`
//! configuration (`logdatastore.cpp Config::Config()`), translated one for
//! one.

/// Checksum flavor stored in the leading byte of every chunk frame.
///
/// `0` is deliberately unused by either variant: a frame with flavor byte
/// `0` and length `0` at end-of-file is how a zero-padded truncation
/// sentinel is recognized (see `record::decode_chunk`), so no real flavor
/// may claim that discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChecksumFlavor {
    CcittCrc32 = 1,
    Xxh64 = 2,
}

impl ChecksumFlavor {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ChecksumFlavor::CcittCrc32),
            2 => Some(ChecksumFlavor::Xxh64),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Compression applied to a whole chunk's serialized record body.
///
/// Compression is per-chunk: changing this only affects chunks encoded
/// after the change, never chunks already on disk (each chunk carries its
/// own tag, decoded independent of the current config).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionAlgo {
    None = 0,
    Lz4 = 1,
    Zstd = 2,
}

impl CompressionAlgo {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CompressionAlgo::None),
            1 => Some(CompressionAlgo::Lz4),
            2 => Some(CompressionAlgo::Zstd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Rotation threshold for the active file, in bytes. `0` disables
    /// rotation (the active file grows unboundedly).
    pub max_file_size: u64,
    /// Per-file bloat ratio (`disk_bloat / disk_footprint`) above which
    /// compaction is considered.
    pub max_disk_bloat_factor: f64,
    /// Per-file bucket-spread factor above which bucket-clustering
    /// compaction is considered. Only meaningful when a bucketizer is
    /// configured.
    pub max_bucket_spread: f64,
    /// If the compacted live size would fall below this factor times
    /// `max_file_size`, compact straight into the active file regardless
    /// of `compact_to_active_file`.
    pub min_file_size_factor: f64,
    /// Disable checksum verification on read. Recovery-only escape hatch.
    pub skip_crc_on_read: bool,
    /// Force all compactions to target the current active file.
    pub compact_to_active_file: bool,
    /// Compression algorithm applied when the compactor rewrites chunks.
    pub compact_compression: CompressionAlgo,
    /// Checksum flavor stamped on chunks produced by the write path.
    pub crc_on_write: ChecksumFlavor,
    /// Close an in-memory chunk once it reaches this many bytes.
    pub max_chunk_bytes: usize,
    /// Close an in-memory chunk once it holds this many records.
    pub max_chunk_records: usize,
    /// Significant-bit cutoff used when partitioning buckets for
    /// bucket-clustering compaction.
    pub bucket_bits_for_cluster: u32,
    /// Tolerate a truncated `.dat`/`.idx` tail on open instead of failing
    /// startup with `ShortRead`.
    pub allow_truncate: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_file_size: 1_000_000_000,
            max_disk_bloat_factor: 0.2,
            max_bucket_spread: 2.5,
            min_file_size_factor: 0.2,
            skip_crc_on_read: false,
            compact_to_active_file: true,
            compact_compression: CompressionAlgo::Lz4,
            crc_on_write: ChecksumFlavor::CcittCrc32,
            max_chunk_bytes: 128 * 1024,
            max_chunk_records: 4096,
            bucket_bits_for_cluster: 8,
            allow_truncate: false,
        }
    }
}

/// Largest tail region (in bytes) that may be bytewise-zero at end-of-file
/// without being treated as corruption.
pub const MAX_TRUNCATION_SENTINEL: usize = 1024 * 1024;
