use std::ops::Range;

use crate::error::{PipelineError, Result};

/// ─────────────────────────────────────────────────────────────
///  Contiguous slice of the input collection owned by one worker
/// ─────────────────────────────────────────────────────────────
///
/// `offset` is the position of the first item in the original collection,
/// so `offset + i` is the element ordinal of `items[i]`.
#[derive(Debug)]
pub struct Partition<'a, T> {
    pub index: usize,
    pub offset: usize,
    pub items: &'a [T],
}

impl<T> Clone for Partition<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Partition<'_, T> {}

impl<'a, T> Partition<'a, T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Ordinals this partition covers in the original collection.
    pub fn ordinals(&self) -> Range<usize> {
        self.offset..self.offset + self.items.len()
    }

    /// Items paired with their ordinal in the original collection.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &'a T)> + 'a {
        let offset = self.offset;
        self.items
            .iter()
            .enumerate()
            .map(move |(i, item)| (offset + i, item))
    }
}

/// Index ranges for splitting `len` items across `workers`.
///
/// Every range but the last gets `len / workers` items; the last one absorbs
/// the remainder. With more workers than items the leading ranges are empty.
pub fn chunk_bounds(len: usize, workers: usize) -> Result<Vec<Range<usize>>> {
    if workers == 0 {
        return Err(PipelineError::InvalidConfig(
            "worker count must be at least 1".to_string(),
        ));
    }

    let base = len / workers;
    let mut bounds = Vec::with_capacity(workers);
    let mut start = 0;

    for i in 0..workers {
        let end = if i + 1 == workers { len } else { start + base };
        bounds.push(start..end);
        start = end;
    }

    Ok(bounds)
}

/// Split `collection` into exactly `workers` ordered, contiguous partitions.
pub fn partition<T>(collection: &[T], workers: usize) -> Result<Vec<Partition<'_, T>>> {
    let bounds = chunk_bounds(collection.len(), workers)?;

    Ok(bounds
        .into_iter()
        .enumerate()
        .map(|(index, range)| Partition {
            index,
            offset: range.start,
            items: &collection[range],
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes<T>(parts: &[Partition<'_, T>]) -> Vec<usize> {
        parts.iter().map(|p| p.len()).collect()
    }

    #[test]
    fn test_singletons_when_workers_match_len() {
        let items: Vec<u32> = (0..10).collect();
        let parts = partition(&items, 10).unwrap();

        assert_eq!(parts.len(), 10);
        for (i, p) in parts.iter().enumerate() {
            assert_eq!(p.index, i);
            assert_eq!(p.items, &[i as u32]);
        }
    }

    #[test]
    fn test_even_split() {
        let items: Vec<u32> = (0..1000).collect();
        let parts = partition(&items, 10).unwrap();
        assert_eq!(sizes(&parts), vec![100; 10]);
        assert_eq!(parts[3].ordinals(), 300..400);
    }

    #[test]
    fn test_last_partition_absorbs_remainder() {
        let items: Vec<u32> = (0..7).collect();
        assert_eq!(sizes(&partition(&items, 3).unwrap()), vec![2, 2, 3]);

        let items: Vec<u32> = (0..19).collect();
        assert_eq!(sizes(&partition(&items, 10).unwrap()), vec![1, 1, 1, 1, 1, 1, 1, 1, 1, 10]);
    }

    #[test]
    fn test_more_workers_than_items() {
        let items = vec!["a", "b"];
        let parts = partition(&items, 5).unwrap();
        assert_eq!(sizes(&parts), vec![0, 0, 0, 0, 2]);
        assert!(parts[0].is_empty());
        assert_eq!(parts[4].offset, 0);
    }

    #[test]
    fn test_empty_collection() {
        let items: Vec<u8> = Vec::new();
        let parts = partition(&items, 3).unwrap();
        assert_eq!(sizes(&parts), vec![0, 0, 0]);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let items = vec![1, 2, 3];
        assert!(matches!(
            partition(&items, 0),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_concatenation_reconstructs_input() {
        for len in 0..40usize {
            let items: Vec<usize> = (0..len).collect();
            for workers in 1..15 {
                let parts = partition(&items, workers).unwrap();
                assert_eq!(parts.len(), workers);

                let rebuilt: Vec<usize> = parts
                    .iter()
                    .flat_map(|p| p.iter().map(|(ordinal, item)| {
                        assert_eq!(ordinal, *item);
                        *item
                    }))
                    .collect();
                assert_eq!(rebuilt, items, "len={len} workers={workers}");
            }
        }
    }
}
