use std::num::NonZero;

/// Upper bound on the number of size classes a table may hold.
///
/// The default configuration produces far fewer classes; the cap exists so that a
/// pathological min/max combination cannot produce an unboundedly large table.
pub(crate) const MAX_SIZE_CLASSES: usize = 3000;

/// The table of block size classes managed by a pool.
///
/// Classes are generated at two points per doubling of the block size: the current
/// size and 7/4 of it. Interleaving the finer ~1.75x step with the 2x step bounds
/// worst-case internal fragmentation (the gap between a request and the boundary
/// that serves it) to roughly 12.5%, versus ~50% for pure doubling. With the
/// default minimum of 64 bytes the progression starts 64, 112, 128, 224, 256, 448,
/// 512, 896, 1024, ...
///
/// The table is built once and is immutable afterwards, so it can be read from any
/// thread without locking. Class indexes are stable for the table's lifetime.
#[derive(Debug)]
pub(crate) struct SizeClassTable {
    /// Strictly increasing class boundaries. A request is served by the first
    /// boundary greater than or equal to it.
    boundaries: Vec<usize>,

    /// Smallest manageable request size; anything below is passed through.
    min_block_size: usize,

    /// Largest manageable request size; anything above is passed through.
    max_block_size: usize,
}

impl SizeClassTable {
    /// Builds the table covering `[min_block_size, max_block_size]`.
    ///
    /// # Panics
    ///
    /// Panics if `max_block_size` is smaller than `min_block_size`.
    #[must_use]
    pub(crate) fn new(min_block_size: NonZero<usize>, max_block_size: NonZero<usize>) -> Self {
        let min = min_block_size.get();
        let max = max_block_size.get();

        assert!(
            min <= max,
            "max_block_size ({max}) must not be smaller than min_block_size ({min})"
        );

        let mut boundaries = Vec::new();
        let mut size = min;

        while boundaries.len() < MAX_SIZE_CLASSES {
            boundaries.push(size);

            // 7/4 of the current size, computed as (size / 4) * 7 so the growth step
            // cannot overflow before the comparison against the maximum.
            let seven_fourths = (size / 4).saturating_mul(7);

            if seven_fourths > max {
                break;
            }

            // The intermediate boundary only adds a class when it actually lies
            // between the two doubling points (for sizes below 4 it collapses
            // onto the current size).
            if seven_fourths > size && boundaries.len() < MAX_SIZE_CLASSES {
                boundaries.push(seven_fourths);
            }

            size = size.saturating_mul(2);

            if size > max {
                break;
            }
        }

        Self {
            boundaries,
            min_block_size: min,
            max_block_size: max,
        }
    }

    /// The number of size classes in the table.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.boundaries.len()
    }

    /// The block size boundary of a class.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of range.
    #[must_use]
    pub(crate) fn boundary(&self, index: usize) -> usize {
        *self
            .boundaries
            .get(index)
            .expect("size class index out of range")
    }

    /// Maps a requested size to the smallest class that covers it.
    ///
    /// Returns `None` for unmanageable sizes: below the minimum, above the maximum,
    /// or beyond the last generated boundary (possible when the class-count cap
    /// truncated the table).
    #[must_use]
    pub(crate) fn index_of(&self, size: usize) -> Option<usize> {
        if size < self.min_block_size || size > self.max_block_size {
            return None;
        }

        let index = self.boundaries.partition_point(|&boundary| boundary < size);

        if index < self.boundaries.len() {
            Some(index)
        } else {
            None
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;

    use super::*;

    fn default_table() -> SizeClassTable {
        SizeClassTable::new(nz!(64), nz!(1_073_741_824))
    }

    #[test]
    fn progression_interleaves_seven_fourths_step() {
        let table = default_table();

        let expected_prefix = [64_usize, 112, 128, 224, 256, 448, 512, 896, 1024];

        for (index, &boundary) in expected_prefix.iter().enumerate() {
            assert_eq!(table.boundary(index), boundary);
        }
    }

    #[test]
    fn boundaries_strictly_increase() {
        let table = default_table();

        for index in 1..table.len() {
            assert!(table.boundary(index) > table.boundary(index - 1));
        }
    }

    #[test]
    fn table_stays_within_class_cap() {
        let table = default_table();

        assert!(table.len() <= MAX_SIZE_CLASSES);
        // 64..=1 GiB at two classes per doubling is a few dozen classes, nowhere
        // near the cap.
        assert!(table.len() < 64);
    }

    #[test]
    fn lookup_selects_smallest_covering_class() {
        let table = default_table();

        assert_eq!(table.index_of(100), Some(1));
        assert_eq!(table.boundary(1), 112);

        assert_eq!(table.index_of(112), Some(1));
        assert_eq!(table.index_of(113), Some(2));
        assert_eq!(table.boundary(2), 128);
    }

    #[test]
    fn minimum_size_resolves_to_class_zero() {
        let table = default_table();

        assert_eq!(table.index_of(64), Some(0));
        assert_eq!(table.index_of(63), None);
        assert_eq!(table.index_of(1), None);
    }

    #[test]
    fn oversized_requests_are_unmanaged() {
        let table = default_table();

        assert_eq!(table.index_of(usize::MAX), None);
        assert_eq!(table.index_of(1_073_741_825), None);
    }

    #[test]
    fn maximum_is_managed_when_a_boundary_covers_it() {
        // With max = 1024 the table ends exactly on a boundary, so the maximum
        // itself is manageable.
        let table = SizeClassTable::new(nz!(64), nz!(1024));

        assert_eq!(table.index_of(1024), Some(table.len() - 1));
        assert_eq!(table.boundary(table.len() - 1), 1024);
    }

    #[test]
    fn gap_between_last_boundary_and_maximum_is_unmanaged() {
        // Last boundary below 2000 is 1792 (= 1024 * 7/4), so sizes in
        // (1792, 2000] are within [min, max] but have no covering class.
        let table = SizeClassTable::new(nz!(64), nz!(2000));

        assert_eq!(table.index_of(1792), Some(table.len() - 1));
        assert_eq!(table.index_of(1793), None);
        assert_eq!(table.index_of(2000), None);
    }

    #[test]
    fn single_class_table() {
        let table = SizeClassTable::new(nz!(64), nz!(64));

        assert_eq!(table.len(), 1);
        assert_eq!(table.index_of(64), Some(0));
        assert_eq!(table.index_of(65), None);
    }

    #[test]
    #[should_panic]
    fn max_below_min_panics() {
        drop(SizeClassTable::new(nz!(128), nz!(64)));
    }
}
