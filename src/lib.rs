//! # docstore — crash-safe, append-only, content-addressed document store
//!
//! A `lid` (local document id) maps to an opaque payload blob. Writes are
//! appended to a chunked, log-structured active file; a background
//! compactor reclaims space left behind by overwrites and removes. Recovery
//! after a crash always yields a well-defined prefix of every write ordered
//! by its serial number, and never resumes writing into whatever file was
//! active when the process last stopped.
//!
//! - `record`/`header` — on-disk framing for chunks and file headers
//! - `chunkfile` — one `.dat`/`.idx` pair, append-only while active, frozen
//!   once full
//! - `directory` — the in-memory `lid -> (fileId, chunkId, size)` table
//! - `store` — [`DocumentStore`], the public entry point
//! - `compactor` — background bloat/bucket-spread driven compaction
//! - `executor`/`tlog`/`bucketizer` — narrow interfaces to ambient
//!   collaborators, consumed rather than reimplemented

pub mod error;
pub mod config;
pub mod crc;
pub mod record;
pub mod header;
pub mod generation;
pub mod directory;
pub mod chunkfile;
pub mod executor;
pub mod tlog;
pub mod bucketizer;
pub mod visitor;
pub mod compactor;
pub mod store;

pub use config::{ChecksumFlavor, CompressionAlgo, Config};
pub use error::{Result, StoreError};
pub use header::FileHeaderContext;
pub use store::{DocumentStore, StorageStats};
pub use visitor::{CollectingVisitor, DataStoreVisitor, DataStoreVisitorProgress};
pub use executor::{Executor, InlineExecutor, ThreadPoolExecutor};
pub use tlog::{NoopTlogSync, TlogSync};
pub use bucketizer::{Bucketizer, BucketId};
