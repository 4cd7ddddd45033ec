use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AvailabilityError {
    #[error("range [{offset}, +{length}) is outside every open gap of a {size}-byte map")]
    OutOfBounds { offset: u64, length: u64, size: u64 },
}

/// Open gaps ("holes") remaining in `[0, size)`.
///
/// Each byte may be filled exactly once: an insertion must sit entirely inside
/// one open gap, so overlapping or repeated ranges are rejected instead of
/// merged. The same structure answers "what should be requested next" (when
/// outstanding requests are overlaid on a copy) and "is the chunk complete".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRangeAvailability {
    size: u64,
    remaining: u64,
    /// gap offset -> gap length
    gaps: BTreeMap<u64, u64>,
}

impl ByteRangeAvailability {
    pub fn new(size: u64) -> Self {
        let mut gaps = BTreeMap::new();
        if size > 0 {
            gaps.insert(0, size);
        }
        Self { size, remaining: size, gaps }
    }

    /// Mark `[offset, offset + length)` as filled.
    ///
    /// Returns `Ok(false)` for a zero-length range, `Ok(true)` when bytes were
    /// filled. On error the map is unchanged.
    pub fn insert(&mut self, offset: u64, length: u64) -> Result<bool, AvailabilityError> {
        if length == 0 {
            return Ok(false);
        }
        let out_of_bounds = AvailabilityError::OutOfBounds { offset, length, size: self.size };
        let end = offset.checked_add(length).ok_or(out_of_bounds)?;
        if end > self.size {
            return Err(out_of_bounds);
        }

        let (gap_start, gap_len) = match self.gaps.range(..=offset).next_back() {
            Some((&start, &len)) => (start, len),
            None => return Err(out_of_bounds),
        };
        let gap_end = gap_start + gap_len;
        if end > gap_end {
            return Err(out_of_bounds);
        }

        self.gaps.remove(&gap_start);
        if offset > gap_start {
            self.gaps.insert(gap_start, offset - gap_start);
        }
        if end < gap_end {
            self.gaps.insert(end, gap_end - end);
        }
        self.remaining -= length;
        Ok(true)
    }

    /// Lowest-offset open gap.
    pub fn first_gap(&self) -> Option<(u64, u64)> {
        self.gaps.iter().next().map(|(&off, &len)| (off, len))
    }

    pub fn gaps(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.gaps.iter().map(|(&off, &len)| (off, len))
    }

    pub fn is_full(&self) -> bool {
        self.remaining == 0
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == self.size
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.remaining
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    #[test]
    fn new_map_is_one_gap() {
        let map = ByteRangeAvailability::new(100);
        assert_eq!(map.first_gap(), Some((0, 100)));
        assert_eq!(map.bytes_remaining(), 100);
        assert!(map.is_empty());
        assert!(!map.is_full());
    }

    #[test]
    fn zero_sized_map_is_full() {
        let map = ByteRangeAvailability::new(0);
        assert!(map.is_full());
        assert_eq!(map.first_gap(), None);
    }

    #[test]
    fn insert_splits_gap() {
        let mut map = ByteRangeAvailability::new(100);
        assert_eq!(map.insert(40, 20), Ok(true));
        let gaps: Vec<_> = map.gaps().collect();
        assert_eq!(gaps, vec![(0, 40), (60, 40)]);
        assert_eq!(map.bytes_remaining(), 80);

        assert_eq!(map.insert(0, 40), Ok(true));
        assert_eq!(map.first_gap(), Some((60, 40)));
    }

    #[test]
    fn zero_length_insert_is_noop() {
        let mut map = ByteRangeAvailability::new(10);
        assert_eq!(map.insert(3, 0), Ok(false));
        assert_eq!(map.bytes_remaining(), 10);
    }

    #[test]
    fn overlap_is_rejected_and_map_unchanged() {
        let mut map = ByteRangeAvailability::new(100);
        map.insert(20, 20).unwrap();
        let before = map.clone();

        // straddles filled range
        assert!(map.insert(10, 20).is_err());
        // exact duplicate
        assert!(map.insert(20, 20).is_err());
        // starts inside filled range
        assert!(map.insert(30, 5).is_err());
        // spans two gaps
        assert!(map.insert(0, 100).is_err());
        assert_eq!(map, before);
    }

    #[test]
    fn out_of_range_is_error_not_panic() {
        let mut map = ByteRangeAvailability::new(100);
        assert_eq!(
            map.insert(90, 20),
            Err(AvailabilityError::OutOfBounds { offset: 90, length: 20, size: 100 })
        );
        assert!(map.insert(u64::MAX, 2).is_err());
        assert!(map.insert(100, 1).is_err());
        assert_eq!(map.bytes_remaining(), 100);
    }

    #[test]
    fn any_disjoint_cover_fills_map_monotonically() {
        let size = 1000u64;
        let mut ranges = Vec::new();
        let mut off = 0u64;
        let mut step = 1u64;
        while off < size {
            let len = step.min(size - off);
            ranges.push((off, len));
            off += len;
            step = step % 37 + 13;
        }

        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            ranges.shuffle(&mut rng);
            let mut map = ByteRangeAvailability::new(size);
            let mut last = map.bytes_remaining();
            for (i, &(off, len)) in ranges.iter().enumerate() {
                assert_eq!(map.insert(off, len), Ok(true));
                assert!(map.bytes_remaining() <= last);
                last = map.bytes_remaining();
                assert_eq!(map.is_full(), i + 1 == ranges.len());
            }
            assert!(map.is_full());
            assert_eq!(map.first_gap(), None);
        }
    }
}
