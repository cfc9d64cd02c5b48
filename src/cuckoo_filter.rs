//! Per-bin approximate membership filter with tag relocation
//!
//! Every bin in a BinBundle shadows its item set with a small cuckoo filter
//! so that insert/overwrite/remove paths can reject absent items without
//! scanning the bin. The contract the rest of the engine relies on:
//!
//! - **No false negatives.** If an element was added and not removed,
//!   `contains` returns true. False positives are acceptable (callers fall
//!   through to an exact bin scan).
//! - Tags are `bits_per_tag`-bit values derived from a fixed-seed hash, with
//!   zero reserved as the empty-slot marker (derived tags are biased up by
//!   one). The alternate bucket of `(idx, tag)` is
//!   `idx ⊕ (hash(tag) mod bucket_count)`, so buckets pair symmetrically.
//! - Insertion relocates up to [`MAX_CUCKOO_KICKS`] random victims; if the
//!   chain fails, the last evicted `(index, tag)` pair parks in a single
//!   *overflow* slot and the filter is full (`try_add` → false). Removal
//!   frees the overflow slot first chance it gets by re-inserting the parked
//!   tag into the table.
//!
//! Buckets hold [`TAGS_PER_BUCKET`] tags and the bucket count is a power of
//! two, so index masking is a single AND.

#![forbid(unsafe_code)]

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::hashing::HashFunc;
use crate::Felt;

/// Slots per bucket.
pub const TAGS_PER_BUCKET: usize = 4;
/// Relocation budget before an insertion parks in the overflow slot.
pub const MAX_CUCKOO_KICKS: usize = 500;
/// Fixed seed of the filter hash; arbitrary, shared by all filters.
const HASHER_SEED: u64 = 20;

/// Errors surfaced when reconstructing a filter from stored data.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("bits_per_tag must be in [1, 64] (got {0})")]
    BadBitsPerTag(u32),
    #[error("bucket count must be a non-zero power of two (got {0})")]
    BadBucketCount(u64),
    #[error("table holds {got} words but {buckets} buckets at {bits} bits/tag need {expected}")]
    TableSizeMismatch {
        got: usize,
        buckets: u64,
        bits: u32,
        expected: usize,
    },
}

/// Serialized form of a [`CuckooFilter`]: the raw table plus its shape and
/// the overflow slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CuckooFilterData {
    pub bits_per_tag: u32,
    pub bucket_count: u64,
    pub table: Vec<u64>,
    pub num_items: u64,
    pub overflow_index: u64,
    pub overflow_tag: u64,
    pub overflow_used: bool,
}

// ---------------------------- Packed tag table ----------------------------

/// Bit-packed tag storage: `bucket_count × TAGS_PER_BUCKET` tags of
/// `bits_per_tag` bits each, laid out contiguously over `u64` words.
#[derive(Clone, Debug)]
struct CuckooFilterTable {
    words: Vec<u64>,
    bucket_count: u64,
    bits_per_tag: u32,
    tag_mask: u64,
}

impl CuckooFilterTable {
    fn new(key_count_max: usize, bits_per_tag: u32) -> Self {
        debug_assert!((1..=64).contains(&bits_per_tag));
        let bucket_count =
            (((key_count_max + TAGS_PER_BUCKET - 1) / TAGS_PER_BUCKET).max(1) as u64)
                .next_power_of_two();
        let total_bits = bucket_count as usize * TAGS_PER_BUCKET * bits_per_tag as usize;
        let words = vec![0u64; (total_bits + 63) / 64];
        let tag_mask = u64::MAX >> (64 - bits_per_tag);
        Self {
            words,
            bucket_count,
            bits_per_tag,
            tag_mask,
        }
    }

    fn from_raw(
        words: Vec<u64>,
        bucket_count: u64,
        bits_per_tag: u32,
    ) -> Result<Self, FilterError> {
        if !(1..=64).contains(&bits_per_tag) {
            return Err(FilterError::BadBitsPerTag(bits_per_tag));
        }
        if bucket_count == 0 || !bucket_count.is_power_of_two() {
            return Err(FilterError::BadBucketCount(bucket_count));
        }
        let total_bits = bucket_count as usize * TAGS_PER_BUCKET * bits_per_tag as usize;
        let expected = (total_bits + 63) / 64;
        if words.len() != expected {
            return Err(FilterError::TableSizeMismatch {
                got: words.len(),
                buckets: bucket_count,
                bits: bits_per_tag,
                expected,
            });
        }
        let tag_mask = u64::MAX >> (64 - bits_per_tag);
        Ok(Self {
            words,
            bucket_count,
            bits_per_tag,
            tag_mask,
        })
    }

    #[inline]
    fn slot_bit_offset(&self, bucket: u64, slot: usize) -> usize {
        (bucket as usize * TAGS_PER_BUCKET + slot) * self.bits_per_tag as usize
    }

    fn read_tag(&self, bucket: u64, slot: usize) -> u64 {
        let bit = self.slot_bit_offset(bucket, slot);
        let word = bit / 64;
        let shift = (bit % 64) as u32;
        let mut value = self.words[word] >> shift;
        let taken = 64 - shift;
        if (taken as usize) < self.bits_per_tag as usize {
            value |= self.words[word + 1] << taken;
        }
        value & self.tag_mask
    }

    fn write_tag(&mut self, bucket: u64, slot: usize, tag: u64) {
        debug_assert!(tag <= self.tag_mask);
        let bit = self.slot_bit_offset(bucket, slot);
        let word = bit / 64;
        let shift = (bit % 64) as u32;
        self.words[word] = (self.words[word] & !(self.tag_mask << shift)) | (tag << shift);
        let taken = 64 - shift;
        if (taken as usize) < self.bits_per_tag as usize {
            let hi_mask = self.tag_mask >> taken;
            self.words[word + 1] = (self.words[word + 1] & !hi_mask) | (tag >> taken);
        }
    }

    /// Insert `tag` into an empty slot of `bucket`. With `kickout`, a full
    /// bucket evicts a random victim into `old_tag` and the insert succeeds
    /// from the table's point of view (the caller relocates the victim).
    fn insert_tag(&mut self, bucket: u64, tag: u64, kickout: bool, old_tag: &mut u64) -> bool {
        for slot in 0..TAGS_PER_BUCKET {
            if self.read_tag(bucket, slot) == 0 {
                self.write_tag(bucket, slot, tag);
                return true;
            }
        }
        if kickout {
            let slot = rand::thread_rng().gen_range(0..TAGS_PER_BUCKET);
            *old_tag = self.read_tag(bucket, slot);
            self.write_tag(bucket, slot, tag);
        }
        false
    }

    fn delete_tag(&mut self, bucket: u64, tag: u64) -> bool {
        for slot in 0..TAGS_PER_BUCKET {
            if self.read_tag(bucket, slot) == tag {
                self.write_tag(bucket, slot, 0);
                return true;
            }
        }
        false
    }

    fn find_tag_in_buckets(&self, idx1: u64, idx2: u64, tag: u64) -> bool {
        (0..TAGS_PER_BUCKET).any(|slot| {
            self.read_tag(idx1, slot) == tag || self.read_tag(idx2, slot) == tag
        })
    }
}

// ---------------------------- Filter ----------------------------

/// Parked `(index, tag)` from a failed relocation chain.
#[derive(Clone, Copy, Debug, Default)]
struct OverflowCache {
    index: u64,
    tag: u64,
    used: bool,
}

/// The per-bin cuckoo filter.
pub struct CuckooFilter {
    table: CuckooFilterTable,
    num_items: usize,
    overflow: OverflowCache,
    hasher: HashFunc,
}

impl CuckooFilter {
    /// Create an empty filter sized for up to `key_count_max` elements with
    /// `bits_per_tag`-bit tags.
    pub fn new(key_count_max: usize, bits_per_tag: u32) -> Self {
        Self {
            table: CuckooFilterTable::new(key_count_max, bits_per_tag),
            num_items: 0,
            overflow: OverflowCache::default(),
            hasher: HashFunc::new(HASHER_SEED),
        }
    }

    /// Number of elements currently represented.
    #[inline]
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    #[inline]
    fn idx_limit(&self, value: u64) -> u64 {
        value & (self.table.bucket_count - 1)
    }

    /// Clamp a hash to a valid non-zero tag.
    #[inline]
    fn tag_limit(&self, value: u64) -> u64 {
        let tag = value & self.table.tag_mask;
        tag + u64::from(tag == 0)
    }

    fn tag_and_index(&self, element: &[Felt]) -> (u64, u64) {
        let hash = self.hasher.hash_words(element);
        (self.tag_limit(hash), self.idx_limit(hash))
    }

    fn alt_index(&self, idx: u64, tag: u64) -> u64 {
        idx ^ self.idx_limit(self.hasher.hash_u64(tag))
    }

    /// Whether the element looks present (false positives possible).
    pub fn contains(&self, element: &[Felt]) -> bool {
        let (tag, idx1) = self.tag_and_index(element);
        let idx2 = self.alt_index(idx1, tag);

        if self.overflow.used
            && self.overflow.tag == tag
            && (self.overflow.index == idx1 || self.overflow.index == idx2)
        {
            return true;
        }
        self.table.find_tag_in_buckets(idx1, idx2, tag)
    }

    /// Add an element. Returns false when the filter is full (the overflow
    /// slot is occupied), in which case nothing is recorded.
    pub fn try_add(&mut self, element: &[Felt]) -> bool {
        if self.overflow.used {
            return false;
        }
        let (tag, idx) = self.tag_and_index(element);
        self.add_index_tag(idx, tag);
        self.num_items += 1;
        true
    }

    /// Relocation loop. Always records the tag somewhere: either in the
    /// table or, after [`MAX_CUCKOO_KICKS`] evictions, in the overflow slot.
    fn add_index_tag(&mut self, idx: u64, tag: u64) {
        let mut curr_idx = idx;
        let mut curr_tag = tag;

        for kick in 0..MAX_CUCKOO_KICKS {
            let kickout = kick > 0;
            let mut old_tag = 0u64;
            if self.table.insert_tag(curr_idx, curr_tag, kickout, &mut old_tag) {
                return;
            }
            if kickout {
                curr_tag = old_tag;
            }
            curr_idx = self.alt_index(curr_idx, curr_tag);
        }

        // Only reached with overflow free; callers gate on it in try_add.
        self.overflow = OverflowCache {
            index: curr_idx,
            tag: curr_tag,
            used: true,
        };
    }

    /// Remove an element. Returns false if no matching tag was found.
    pub fn remove(&mut self, element: &[Felt]) -> bool {
        let (tag, idx1) = self.tag_and_index(element);
        let idx2 = self.alt_index(idx1, tag);

        if self.table.delete_tag(idx1, tag) || self.table.delete_tag(idx2, tag) {
            self.num_items -= 1;
            self.try_eliminate_overflow();
            return true;
        }

        if self.overflow.used
            && self.overflow.tag == tag
            && (self.overflow.index == idx1 || self.overflow.index == idx2)
        {
            self.overflow.used = false;
            self.num_items -= 1;
            return true;
        }
        false
    }

    /// A removal freed table space; move the parked overflow tag back in.
    fn try_eliminate_overflow(&mut self) {
        if self.overflow.used {
            self.overflow.used = false;
            let OverflowCache { index, tag, .. } = self.overflow;
            self.add_index_tag(index, tag);
        }
    }

    // ---------------------------- Serialization ----------------------------

    /// Snapshot the filter for persistence.
    pub fn to_data(&self) -> CuckooFilterData {
        CuckooFilterData {
            bits_per_tag: self.table.bits_per_tag,
            bucket_count: self.table.bucket_count,
            table: self.table.words.clone(),
            num_items: self.num_items as u64,
            overflow_index: self.overflow.index,
            overflow_tag: self.overflow.tag,
            overflow_used: self.overflow.used,
        }
    }

    /// Reconstruct a filter from persisted data, re-validating its shape.
    pub fn from_data(data: CuckooFilterData) -> Result<Self, FilterError> {
        let table = CuckooFilterTable::from_raw(data.table, data.bucket_count, data.bits_per_tag)?;
        Ok(Self {
            table,
            num_items: data.num_items as usize,
            overflow: OverflowCache {
                index: data.overflow_index,
                tag: data.overflow_tag,
                used: data.overflow_used,
            },
            hasher: HashFunc::new(HASHER_SEED),
        })
    }
}

impl std::fmt::Debug for CuckooFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CuckooFilter")
            .field("bucket_count", &self.table.bucket_count)
            .field("bits_per_tag", &self.table.bits_per_tag)
            .field("num_items", &self.num_items)
            .field("overflow_used", &self.overflow.used)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_contains() {
        let mut filter = CuckooFilter::new(16, 12);
        for i in 0..16u64 {
            assert!(filter.try_add(&[i]));
        }
        for i in 0..16u64 {
            assert!(filter.contains(&[i]), "false negative on {i}");
        }
        assert_eq!(filter.num_items(), 16);
    }

    #[test]
    fn remove_clears_membership() {
        let mut filter = CuckooFilter::new(16, 12);
        for i in 0..8u64 {
            assert!(filter.try_add(&[i]));
        }
        assert!(filter.remove(&[3]));
        assert_eq!(filter.num_items(), 7);
        // Remaining elements must still be present (no collateral negatives).
        for i in (0..8u64).filter(|&i| i != 3) {
            assert!(filter.contains(&[i]));
        }
    }

    #[test]
    fn remove_absent_element_fails() {
        let mut filter = CuckooFilter::new(16, 12);
        assert!(filter.try_add(&[1]));
        assert!(!filter.remove(&[999]));
        assert_eq!(filter.num_items(), 1);
    }

    #[test]
    fn overfill_parks_in_overflow_then_rejects() {
        // A tiny table (1 bucket, 4 slots) forces the overflow path quickly.
        let mut filter = CuckooFilter::new(4, 8);
        let mut added = Vec::new();
        let mut i = 0u64;
        // Keep adding until the filter declares itself full.
        while filter.try_add(&[i]) {
            added.push(i);
            i += 1;
            assert!(i < 1000, "filter never filled");
        }
        // Everything accepted so far must still be visible (overflow slot
        // included), and further adds are refused.
        for &e in &added {
            assert!(filter.contains(&[e]), "false negative after overflow");
        }
        assert!(!filter.try_add(&[i]));

        // Removing one element frees the overflow and re-opens the filter.
        let victim = added[0];
        assert!(filter.remove(&[victim]));
        assert!(filter.try_add(&[i]));
        assert!(filter.contains(&[i]));
    }

    #[test]
    fn wide_tags_cross_word_boundaries() {
        // 24-bit tags with 4 slots/bucket straddle u64 words.
        let mut filter = CuckooFilter::new(64, 24);
        for i in 0..64u64 {
            assert!(filter.try_add(&[i, i + 1]));
        }
        for i in 0..64u64 {
            assert!(filter.contains(&[i, i + 1]));
        }
    }

    #[test]
    fn serialization_roundtrip_preserves_membership() {
        let mut filter = CuckooFilter::new(32, 12);
        for i in 0..20u64 {
            assert!(filter.try_add(&[i * 7 + 1]));
        }
        let restored = CuckooFilter::from_data(filter.to_data()).unwrap();
        assert_eq!(restored.num_items(), filter.num_items());
        for i in 0..20u64 {
            assert!(restored.contains(&[i * 7 + 1]));
        }
    }

    #[test]
    fn from_data_rejects_malformed_shapes() {
        let filter = CuckooFilter::new(8, 12);
        let mut data = filter.to_data();
        data.bits_per_tag = 0;
        assert!(matches!(
            CuckooFilter::from_data(data.clone()),
            Err(FilterError::BadBitsPerTag(0))
        ));

        let mut data = filter.to_data();
        data.bucket_count = 3;
        assert!(matches!(
            CuckooFilter::from_data(data),
            Err(FilterError::BadBucketCount(3))
        ));

        let mut data = filter.to_data();
        data.table.pop();
        assert!(matches!(
            CuckooFilter::from_data(data),
            Err(FilterError::TableSizeMismatch { .. })
        ));
    }
}
