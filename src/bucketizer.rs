//! Bucketizer adapter — an optional collaborator the compactor consults.
//!
//! When supplied, the compactor uses it to compute a frozen file's bucket
//! spread and to drive bucket-clustered compaction. The original's
//! `getGuard()` RAII handle has no counterpart here: Rust's borrow checker
//! already ties the lifetime of any data `bucket_of` hands back to `&self`,
//! which is the guarantee the original needed a manual guard object for.

use std::collections::HashSet;

pub type BucketId = u32;

pub trait Bucketizer: Send + Sync {
    fn bucket_of(&self, lid: u32) -> BucketId;
}

/// Empirical bit-depth analysis: the highest bit position set across a set
/// of bucket ids, used to decide how many bits to partition buckets into
/// for clustering (`logdatastore.cpp::computeNumberOfSignificantBucketIdBits`).
pub fn significant_bucket_bits<I: IntoIterator<Item = BucketId>>(ids: I) -> u32 {
    let mut max_msb = 0u32;
    for id in ids {
        if id != 0 {
            let msb = 32 - id.leading_zeros();
            max_msb = max_msb.max(msb);
        }
    }
    max_msb
}

/// How many distinct buckets a file's live records span, relative to the
/// ideal of 1 (perfectly clustered). `lids` ranges over every live lid in
/// the file being evaluated.
pub fn bucket_spread<I: IntoIterator<Item = u32>>(bucketizer: &dyn Bucketizer, lids: I) -> f64 {
    let mut seen = HashSet::new();
    for lid in lids {
        seen.insert(bucketizer.bucket_of(lid));
    }
    if seen.is_empty() {
        1.0
    } else {
        seen.len() as f64
    }
}

/// Partition key used to group live records during bucket-clustered
/// compaction: the top `bits` significant bits of the bucket id.
pub fn cluster_key(bucket: BucketId, bits: u32) -> u32 {
    if bits == 0 || bits >= 32 {
        return bucket;
    }
    bucket >> (32 - bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn significant_bits_tracks_highest_set_bit() {
        assert_eq!(significant_bucket_bits([0u32]), 0);
        assert_eq!(significant_bucket_bits([1u32, 2, 4]), 3);
        assert_eq!(significant_bucket_bits([0xFF00_0000u32]), 32);
    }

    struct Identity;
    impl Bucketizer for Identity {
        fn bucket_of(&self, lid: u32) -> BucketId {
            lid
        }
    }

    #[test]
    fn bucket_spread_counts_distinct_buckets() {
        let b = Identity;
        assert_eq!(bucket_spread(&b, [1, 1, 1]), 1.0);
        assert_eq!(bucket_spread(&b, [1, 2, 3]), 3.0);
        assert_eq!(bucket_spread(&b, []), 1.0);
    }
}
