//! Checksum computation for the two configured chunk-flavor choices.
//!
//! Both flavors are folded down to a 4-byte on-disk checksum (the `.dat`
//! format reserves exactly 4 trailing bytes per chunk regardless of flavor,
//! per the external interface); `xxh64` is truncated to its low 32 bits.
//! Grounded on `block.rs`'s `crc32fast::Hasher` usage, generalized to a
//! second flavor the way `codec/mod.rs` generalizes over multiple codecs.

use crate::config::ChecksumFlavor;
use crc32fast::Hasher as Crc32Hasher;
use xxhash_rust::xxh64::xxh64;

const XXH64_SEED: u64 = 0;

/// Compute the 4-byte checksum of `data` under the given flavor.
pub fn digest(flavor: ChecksumFlavor, data: &[u8]) -> u32 {
    match flavor {
        ChecksumFlavor::CcittCrc32 => {
            let mut h = Crc32Hasher::new();
            h.update(data);
            h.finalize()
        }
        ChecksumFlavor::Xxh64 => {
            let full = xxh64(data, XXH64_SEED);
            (full & 0xFFFF_FFFF) as u32
        }
    }
}

/// Verify `data` against a stored checksum, returning `Ok(())` or the
/// expected/actual pair for the caller to report as `BadChecksum`.
pub fn verify(flavor: ChecksumFlavor, data: &[u8], expected: u32) -> Result<(), (u32, u32)> {
    let actual = digest(flavor, data);
    if actual == expected {
        Ok(())
    } else {
        Err((expected, actual))
    }
}
