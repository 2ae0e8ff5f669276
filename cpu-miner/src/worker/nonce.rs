//! Nonce space partitioning.

use crate::pool::Job;

/// Size of the full 32-bit nonce space.
const FULL_SPACE: u64 = 1 << 32;

/// Size of the space left to the miner when the pool owns the top byte.
const NICEHASH_SPACE: u64 = 1 << 24;

/// A worker's slice of one job's nonce space.
///
/// Offsets are half-open `[start, end)` within the space; the nonce actually
/// hashed is `prefix | offset`. Under nicehash the prefix is the pool's top
/// byte taken from the blob, otherwise zero. A range that runs out wraps to
/// its start rather than stepping into a neighbour's slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceRange {
    prefix: u32,
    start: u64,
    end: u64,
    cursor: u64,
}

impl NonceRange {
    /// Slice `index` of `count` for `job`.
    pub fn for_job(job: &Job, index: usize, count: usize) -> Self {
        if job.nicehash {
            Self::partition(job.blob_nonce() & 0xff00_0000, NICEHASH_SPACE, index, count)
        } else {
            Self::partition(0, FULL_SPACE, index, count)
        }
    }

    /// Slice `index` of `count` equal-as-possible slices of a `space`-sized
    /// nonce space.
    ///
    /// Boundaries are `space * i / count`, so consecutive slices share an
    /// edge and together cover the space exactly once.
    pub fn partition(prefix: u32, space: u64, index: usize, count: usize) -> Self {
        let count = count.max(1) as u64;
        let index = (index as u64).min(count - 1);
        let start = space * index / count;
        let end = space * (index + 1) / count;
        Self {
            prefix,
            start,
            end,
            cursor: start,
        }
    }

    /// First nonce of the slice.
    pub fn first(&self) -> u32 {
        self.nonce_at(self.start)
    }

    /// Offsets covered, as a half-open pair.
    pub fn bounds(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `nonce` falls inside this slice.
    pub fn contains(&self, nonce: u32) -> bool {
        let offset = match self.prefix {
            0 => nonce as u64,
            prefix if nonce & 0xff00_0000 == prefix => (nonce & 0x00ff_ffff) as u64,
            _ => return false,
        };
        (self.start..self.end).contains(&offset)
    }

    /// Reserve `n` consecutive nonces and return the first.
    ///
    /// When fewer than `n` remain before the end of the slice, the cursor
    /// wraps to the start first, so a batch never crosses into another
    /// worker's slice.
    pub fn next_batch(&mut self, n: u32) -> u32 {
        let n = n as u64;
        if self.cursor + n > self.end {
            self.cursor = self.start;
        }
        let first = self.nonce_at(self.cursor);
        self.cursor += n;
        first
    }

    fn nonce_at(&self, offset: u64) -> u32 {
        self.prefix | offset as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::Algorithm;
    use crate::pool::{PoolId, NONCE_OFFSET};
    use test_case::test_case;

    fn job(nicehash: bool, top: u8) -> Job {
        let mut blob = vec![0u8; 76];
        blob[NONCE_OFFSET + 3] = top;
        Job::from_hex(
            "j",
            &hex::encode(blob),
            "ffffffff",
            Algorithm::Cryptonight,
            PoolId(0),
            1,
            nicehash,
        )
        .unwrap()
    }

    #[test_case(1)]
    #[test_case(3)]
    #[test_case(7)]
    #[test_case(64)]
    fn slices_cover_space_without_overlap(count: usize) {
        for space in [FULL_SPACE, NICEHASH_SPACE] {
            let ranges: Vec<_> = (0..count)
                .map(|i| NonceRange::partition(0, space, i, count))
                .collect();

            assert_eq!(ranges[0].bounds().0, 0);
            assert_eq!(ranges[count - 1].bounds().1, space);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].bounds().1, pair[1].bounds().0);
            }
            assert_eq!(ranges.iter().map(NonceRange::len).sum::<u64>(), space);

            let sizes: Vec<_> = ranges.iter().map(NonceRange::len).collect();
            let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
            assert!(max - min <= 1);
        }
    }

    #[test]
    fn nicehash_keeps_pool_byte() {
        let job = job(true, 0xab);
        let ranges: Vec<_> = (0..4).map(|i| NonceRange::for_job(&job, i, 4)).collect();

        assert_eq!(ranges[0].first(), 0xab00_0000);
        assert_eq!(ranges[1].first(), 0xab40_0000);
        assert_eq!(ranges[3].bounds().1, NICEHASH_SPACE);
        assert!(ranges[1].contains(0xab40_0001));
        assert!(!ranges[1].contains(0xac40_0001));
        assert!(!ranges[0].contains(0xab40_0000));
    }

    #[test]
    fn without_nicehash_top_byte_is_ours() {
        let job = job(false, 0xab);
        let range = NonceRange::for_job(&job, 3, 4);
        assert_eq!(range.first(), 0xc000_0000);
        assert_eq!(range.bounds().1, FULL_SPACE);
    }

    #[test]
    fn batches_advance_and_wrap() {
        let mut range = NonceRange::partition(0, 10, 0, 2);
        assert_eq!(range.bounds(), (0, 5));
        assert_eq!(range.next_batch(2), 0);
        assert_eq!(range.next_batch(2), 2);
        // Only one nonce left: wrap instead of spilling into slice 1.
        assert_eq!(range.next_batch(2), 0);
        assert_eq!(range.next_batch(1), 2);
        assert_eq!(range.next_batch(1), 3);
        assert_eq!(range.next_batch(1), 4);
        assert_eq!(range.next_batch(1), 0);
    }

    #[test]
    fn last_slice_reaches_top_nonce() {
        let mut range = NonceRange::partition(0, FULL_SPACE, 1, 2);
        range.cursor = FULL_SPACE - 1;
        assert_eq!(range.next_batch(1), u32::MAX);
        assert_eq!(range.next_batch(1), 0x8000_0000);
    }
}
