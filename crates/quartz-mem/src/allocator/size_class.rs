//! Size-class selection for non-contiguous allocation.

use crate::error::{MemoryError, MemoryResult};
use crate::page::MachinePageCount;

/// The decomposition of a page request into size-class runs.
#[derive(Debug, Clone, Default)]
pub(crate) struct SizeMix {
    /// `(class_index, run_count)` pairs, largest class first.
    pub units: Vec<(usize, usize)>,
    /// Total pages across all runs; at least the requested count.
    pub total_pages: MachinePageCount,
}

/// Decomposes `num_pages` into runs drawn from `size_classes`, never using
/// a class smaller than `min_size_class`.
///
/// Walks the classes from the largest down, taking as many whole runs as
/// fit; the smallest admissible class absorbs any remainder with one extra
/// run, so the result overshoots the request by less than one unit of that
/// class.
pub(crate) fn allocation_size(
    size_classes: &[MachinePageCount],
    num_pages: MachinePageCount,
    min_size_class: MachinePageCount,
) -> MemoryResult<SizeMix> {
    if num_pages == 0 {
        return Err(MemoryError::invalid("cannot allocate zero pages"));
    }
    let largest = *size_classes.last().expect("at least one size class");
    if min_size_class > largest {
        return Err(MemoryError::invalid(format!(
            "minimum size class {min_size_class} exceeds largest class {largest}"
        )));
    }

    let mut mix = SizeMix::default();
    let mut needed = num_pages;
    for index in (0..size_classes.len()).rev() {
        let size = size_classes[index];
        let is_smallest = index == 0 || size_classes[index - 1] < min_size_class;
        if size > needed && !is_smallest {
            continue;
        }
        let mut runs = needed / size;
        needed -= runs * size;
        if is_smallest && needed > 0 {
            runs += 1;
            needed = 0;
        }
        if runs > 0 {
            mix.units.push((index, runs));
            mix.total_pages += runs * size;
        }
        if needed == 0 {
            break;
        }
    }
    debug_assert!(mix.total_pages >= num_pages);
    Ok(mix)
}

/// Returns the smallest class holding at least `num_pages`, or `None` when
/// the request is larger than the largest class.
pub(crate) fn class_for_pages(
    size_classes: &[MachinePageCount],
    num_pages: MachinePageCount,
) -> Option<MachinePageCount> {
    size_classes.iter().copied().find(|size| *size >= num_pages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SIZE_CLASSES;

    fn total(mix: &SizeMix) -> MachinePageCount {
        mix.units
            .iter()
            .map(|(index, runs)| SIZE_CLASSES[*index] * runs)
            .sum()
    }

    #[test]
    fn test_exact_class_sizes() {
        for (index, size) in SIZE_CLASSES.iter().enumerate() {
            let mix = allocation_size(&SIZE_CLASSES, *size, 0).unwrap();
            assert_eq!(mix.units, vec![(index, 1)]);
            assert_eq!(mix.total_pages, *size);
        }
    }

    #[test]
    fn test_mixed_decomposition() {
        // 20 pages = one 16-run + one 4-run.
        let mix = allocation_size(&SIZE_CLASSES, 20, 0).unwrap();
        assert_eq!(mix.units, vec![(4, 1), (2, 1)]);
        assert_eq!(mix.total_pages, 20);

        // 21 pages = 16 + 4 + 1.
        let mix = allocation_size(&SIZE_CLASSES, 21, 0).unwrap();
        assert_eq!(total(&mix), 21);
    }

    #[test]
    fn test_overshoot_bounded_by_smallest_class_used() {
        // 19 pages with classes no smaller than 4: 16 + one extra 4-run.
        let mix = allocation_size(&SIZE_CLASSES, 19, 4).unwrap();
        assert_eq!(mix.total_pages, 20);
        for (index, _) in &mix.units {
            assert!(SIZE_CLASSES[*index] >= 4);
        }
    }

    #[test]
    fn test_min_class_at_largest() {
        // One page over the largest class, restricted to the largest class:
        // exactly two largest-class runs.
        let largest = *SIZE_CLASSES.last().unwrap();
        let mix = allocation_size(&SIZE_CLASSES, largest + 1, largest).unwrap();
        assert_eq!(mix.units, vec![(SIZE_CLASSES.len() - 1, 2)]);
        assert_eq!(mix.total_pages, largest * 2);
    }

    #[test]
    fn test_larger_than_largest_class() {
        let largest = *SIZE_CLASSES.last().unwrap();
        let mix = allocation_size(&SIZE_CLASSES, largest * 3 + 5, 0).unwrap();
        assert_eq!(total(&mix), largest * 3 + 5);
        assert_eq!(mix.units[0], (SIZE_CLASSES.len() - 1, 3));
    }

    #[test]
    fn test_invalid_requests() {
        assert!(allocation_size(&SIZE_CLASSES, 0, 0).is_err());
        assert!(allocation_size(&SIZE_CLASSES, 1, 512).is_err());
    }

    #[test]
    fn test_class_for_pages() {
        assert_eq!(class_for_pages(&SIZE_CLASSES, 1), Some(1));
        assert_eq!(class_for_pages(&SIZE_CLASSES, 3), Some(4));
        assert_eq!(class_for_pages(&SIZE_CLASSES, 256), Some(256));
        assert_eq!(class_for_pages(&SIZE_CLASSES, 257), None);
    }
}
