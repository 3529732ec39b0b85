//! Splitting oversized batches into bounded chunks.
//!
//! Items are packed greedily in input order. A chunk closes when the next item
//! would exceed either the item-count cap or the weight-unit cap. An item is
//! never split; one that alone exceeds the weight cap travels as a singleton.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BatchError, BatchResult};

/// Default cap on items per chunk.
pub const DEFAULT_MAX_ITEMS_PER_CHUNK: usize = 128;

/// Default cap on weight units per chunk.
pub const DEFAULT_MAX_WEIGHT_UNITS_PER_CHUNK: usize = 500_000;

/// Size limits for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLimits {
    /// Hard cap on the number of items in a chunk.
    pub max_items_per_chunk: usize,
    /// Cap on the summed weight units of a chunk (a proxy for wire size).
    pub max_weight_units_per_chunk: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_items_per_chunk: DEFAULT_MAX_ITEMS_PER_CHUNK,
            max_weight_units_per_chunk: DEFAULT_MAX_WEIGHT_UNITS_PER_CHUNK,
        }
    }
}

impl ChunkLimits {
    /// Create limits from both caps.
    #[must_use]
    pub const fn new(max_items_per_chunk: usize, max_weight_units_per_chunk: usize) -> Self {
        Self {
            max_items_per_chunk,
            max_weight_units_per_chunk,
        }
    }

    /// Check that both caps are usable.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidInput`] if either cap is zero.
    pub fn validate(&self) -> BatchResult<()> {
        if self.max_items_per_chunk == 0 {
            return Err(BatchError::InvalidInput(
                "max_items_per_chunk must be at least 1".to_string(),
            ));
        }
        if self.max_weight_units_per_chunk == 0 {
            return Err(BatchError::InvalidInput(
                "max_weight_units_per_chunk must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// What to do with an empty batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyBatchPolicy {
    /// Return no chunks.
    #[default]
    NoOp,
    /// Fail with [`BatchError::InvalidInput`].
    Reject,
}

/// An ordered sub-batch of a logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<P> {
    /// 0-based position among the batch's chunks.
    pub index: usize,
    /// The chunk contents.
    pub payload: P,
    /// Number of data points in the chunk, used for weighted aggregation.
    pub weight: usize,
    /// Summed weight units of the chunk.
    pub weight_units: usize,
}

/// Greedy batch splitter.
#[derive(Debug, Clone, Copy, Default)]
pub struct Chunker {
    limits: ChunkLimits,
    empty_policy: EmptyBatchPolicy,
}

impl Chunker {
    /// Create a chunker with the given limits and the no-op empty-batch policy.
    #[must_use]
    pub const fn new(limits: ChunkLimits) -> Self {
        Self {
            limits,
            empty_policy: EmptyBatchPolicy::NoOp,
        }
    }

    /// Set the empty-batch policy.
    #[must_use]
    pub const fn with_empty_policy(mut self, policy: EmptyBatchPolicy) -> Self {
        self.empty_policy = policy;
        self
    }

    /// The limits this chunker enforces.
    #[must_use]
    pub const fn limits(&self) -> ChunkLimits {
        self.limits
    }

    /// Split `items` into ordered chunks, measuring each item with `weigh`.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidInput`] if the limits are invalid, or if
    /// `items` is empty under [`EmptyBatchPolicy::Reject`].
    pub fn split<T, F>(&self, items: Vec<T>, weigh: F) -> BatchResult<Vec<Chunk<Vec<T>>>>
    where
        F: Fn(&T) -> usize,
    {
        self.limits.validate()?;

        if items.is_empty() {
            return match self.empty_policy {
                EmptyBatchPolicy::NoOp => Ok(Vec::new()),
                EmptyBatchPolicy::Reject => Err(BatchError::InvalidInput(
                    "batch must contain at least one item".to_string(),
                )),
            };
        }

        let total_items = items.len();
        let mut chunks: Vec<Chunk<Vec<T>>> = Vec::new();
        let mut current: Vec<T> = Vec::new();
        let mut current_units = 0usize;

        for item in items {
            let units = weigh(&item);
            let over_count = current.len() + 1 > self.limits.max_items_per_chunk;
            let over_weight =
                current_units.saturating_add(units) > self.limits.max_weight_units_per_chunk;

            if !current.is_empty() && (over_count || over_weight) {
                let payload = std::mem::take(&mut current);
                chunks.push(Chunk {
                    index: chunks.len(),
                    weight: payload.len(),
                    weight_units: current_units,
                    payload,
                });
                current_units = 0;
            }

            current.push(item);
            current_units = current_units.saturating_add(units);
        }

        chunks.push(Chunk {
            index: chunks.len(),
            weight: current.len(),
            weight_units: current_units,
            payload: current,
        });

        debug!(
            items = total_items,
            chunks = chunks.len(),
            max_items = self.limits.max_items_per_chunk,
            max_weight_units = self.limits.max_weight_units_per_chunk,
            "Split batch into chunks"
        );

        Ok(chunks)
    }
}

/// Split `items` under `limits` with the no-op empty-batch policy.
///
/// # Errors
///
/// Returns [`BatchError::InvalidInput`] if the limits are invalid.
pub fn split<T, F>(items: Vec<T>, limits: ChunkLimits, weigh: F) -> BatchResult<Vec<Chunk<Vec<T>>>>
where
    F: Fn(&T) -> usize,
{
    Chunker::new(limits).split(items, weigh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sizes<T>(chunks: &[Chunk<Vec<T>>]) -> Vec<usize> {
        chunks.iter().map(|chunk| chunk.payload.len()).collect()
    }

    #[test]
    fn test_count_cap_splits_300_into_three() {
        let items: Vec<u32> = (0..300).collect();
        let chunks = split(items, ChunkLimits::new(128, usize::MAX), |_| 1).unwrap();

        assert_eq!(sizes(&chunks), vec![128, 128, 44]);
        assert_eq!(chunks[2].weight, 44);
        assert_eq!(chunks[2].payload[0], 256);
    }

    #[test]
    fn test_weight_cap_closes_chunk() {
        // Weights 4, 4, 4, 4 under a cap of 10 pack two per chunk.
        let chunks = split(vec![4usize; 4], ChunkLimits::new(100, 10), |w| *w).unwrap();
        assert_eq!(sizes(&chunks), vec![2, 2]);
        assert_eq!(chunks[0].weight_units, 8);
    }

    #[test]
    fn test_oversized_item_forms_singleton() {
        let chunks = split(vec![1usize, 50, 1, 1], ChunkLimits::new(10, 10), |w| *w).unwrap();
        assert_eq!(sizes(&chunks), vec![1, 1, 2]);
        assert_eq!(chunks[1].payload, vec![50]);
        assert_eq!(chunks[1].weight_units, 50);
    }

    #[test]
    fn test_empty_batch_policies() {
        let chunker = Chunker::new(ChunkLimits::default());
        assert!(chunker.split(Vec::<u8>::new(), |_| 1).unwrap().is_empty());

        let strict = chunker.with_empty_policy(EmptyBatchPolicy::Reject);
        let err = strict.split(Vec::<u8>::new(), |_| 1).unwrap_err();
        assert!(matches!(err, BatchError::InvalidInput(_)));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let err = split(vec![1u8], ChunkLimits::new(0, 10), |_| 1).unwrap_err();
        assert!(matches!(err, BatchError::InvalidInput(_)));

        let err = split(vec![1u8], ChunkLimits::new(10, 0), |_| 1).unwrap_err();
        assert!(matches!(err, BatchError::InvalidInput(_)));
    }

    proptest! {
        #[test]
        fn prop_chunks_preserve_order_and_respect_caps(
            weights in prop::collection::vec(0usize..40, 1..200),
            max_items in 1usize..20,
            max_units in 1usize..60,
        ) {
            let items: Vec<(usize, usize)> = weights.iter().copied().enumerate().collect();
            let chunks = split(items.clone(), ChunkLimits::new(max_items, max_units), |(_, w)| *w)
                .unwrap();

            let flattened: Vec<(usize, usize)> =
                chunks.iter().flat_map(|chunk| chunk.payload.clone()).collect();
            prop_assert_eq!(flattened, items);

            for (position, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index, position);
                prop_assert!(!chunk.payload.is_empty());
                prop_assert!(chunk.payload.len() <= max_items);
                prop_assert_eq!(chunk.weight, chunk.payload.len());
                if chunk.payload.len() > 1 {
                    prop_assert!(chunk.weight_units <= max_units);
                }
            }
        }
    }
}
