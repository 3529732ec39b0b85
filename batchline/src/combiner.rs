//! Recombining per-chunk results.
//!
//! Payloads are concatenated in chunk-index order, whatever order the jobs
//! finished in. Metrics are merged key by key with a [`Reduction`] chosen from
//! the key's suffix (the text after the last `:`), e.g. `loss:sum`.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{BatchError, BatchResult};
use crate::events::{self, Event, SharedEventSink};
use crate::handle::{JobHandle, JobSnapshot};

/// What one completed job returns: per-item outputs plus a metrics map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput<T> {
    /// Opaque outputs, in the order of the chunk's items.
    pub outputs: Vec<T>,
    /// Named numeric metrics.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl<T> JobOutput<T> {
    /// Output without metrics.
    #[must_use]
    pub const fn new(outputs: Vec<T>) -> Self {
        Self {
            outputs,
            metrics: BTreeMap::new(),
        }
    }

    /// Add a metric.
    #[must_use]
    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }
}

/// How values of one metric are merged across chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// Average weighted by chunk weight.
    Mean,
    /// Unweighted sum.
    Sum,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Largest value minus the weighted mean.
    Slack,
    /// Order-insensitive digest of all values.
    HashUnordered,
    /// Every value kept under `{key}_{chunk_index}`.
    Unique,
}

/// One chunk's value for a metric.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    chunk_index: usize,
    weight: usize,
    value: f64,
}

impl Reduction {
    /// Suffix this reduction is registered under by default.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Slack => "slack",
            Self::HashUnordered => "hash_unordered",
            Self::Unique => "unique",
        }
    }

    const ALL: [Self; 7] = [
        Self::Mean,
        Self::Sum,
        Self::Min,
        Self::Max,
        Self::Slack,
        Self::HashUnordered,
        Self::Unique,
    ];

    fn reduce(self, key: &str, samples: &[Sample], out: &mut BTreeMap<String, f64>) {
        let values = samples.iter().map(|sample| sample.value);
        match self {
            Self::Mean => {
                out.insert(key.to_string(), weighted_mean(samples));
            }
            Self::Sum => {
                out.insert(key.to_string(), values.sum());
            }
            Self::Min => {
                out.insert(key.to_string(), values.fold(f64::INFINITY, f64::min));
            }
            Self::Max => {
                out.insert(key.to_string(), values.fold(f64::NEG_INFINITY, f64::max));
            }
            Self::Slack => {
                let max = values.fold(f64::NEG_INFINITY, f64::max);
                out.insert(key.to_string(), max - weighted_mean(samples));
            }
            Self::HashUnordered => {
                out.insert(key.to_string(), hash_unordered(samples));
            }
            Self::Unique => {
                for sample in samples {
                    out.insert(format!("{key}_{}", sample.chunk_index), sample.value);
                }
            }
        }
    }
}

fn weighted_mean(samples: &[Sample]) -> f64 {
    let total_weight: usize = samples.iter().map(|sample| sample.weight).sum();
    if total_weight == 0 {
        #[allow(clippy::cast_precision_loss)]
        let count = samples.len() as f64;
        return samples.iter().map(|sample| sample.value).sum::<f64>() / count;
    }

    #[allow(clippy::cast_precision_loss)]
    let weighted: f64 = samples
        .iter()
        .map(|sample| sample.value * sample.weight as f64)
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let total = total_weight as f64;
    weighted / total
}

// Sorted so arrival order cannot change the digest; truncated to 48 bits so the
// result is exactly representable as an f64.
fn hash_unordered(samples: &[Sample]) -> f64 {
    let mut values: Vec<f64> = samples.iter().map(|sample| sample.value).collect();
    values.sort_by(f64::total_cmp);

    let mut hasher = Sha256::new();
    for value in values {
        hasher.update(value.to_bits().to_be_bytes());
    }
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes[2..].copy_from_slice(&digest[..6]);
    #[allow(clippy::cast_precision_loss)]
    let hashed = u64::from_be_bytes(bytes) as f64;
    hashed
}

/// Maps metric-key suffixes to reductions.
///
/// Keys without a registered suffix reduce as [`Reduction::Mean`].
#[derive(Debug, Clone)]
pub struct ReductionRegistry {
    by_suffix: HashMap<String, Reduction>,
}

impl Default for ReductionRegistry {
    fn default() -> Self {
        Self {
            by_suffix: Reduction::ALL
                .iter()
                .map(|reduction| (reduction.suffix().to_string(), *reduction))
                .collect(),
        }
    }
}

impl ReductionRegistry {
    /// Registry with the built-in suffixes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `suffix` as an alias for `reduction`.
    #[must_use]
    pub fn with_alias(mut self, suffix: impl Into<String>, reduction: Reduction) -> Self {
        self.register(suffix, reduction);
        self
    }

    /// Register `suffix` as an alias for `reduction`, replacing any previous one.
    pub fn register(&mut self, suffix: impl Into<String>, reduction: Reduction) {
        self.by_suffix.insert(suffix.into(), reduction);
    }

    /// The reduction for a metric key.
    #[must_use]
    pub fn resolve(&self, key: &str) -> Reduction {
        key.rsplit_once(':')
            .and_then(|(_, suffix)| self.by_suffix.get(suffix).copied())
            .unwrap_or(Reduction::Mean)
    }
}

/// One chunk's terminal outcome, as fed to [`Combiner::combine_results`].
#[derive(Debug, Clone)]
pub struct ChunkResult<T> {
    /// Index of the chunk in the original batch.
    pub chunk_index: usize,
    /// Number of data points in the chunk.
    pub weight: usize,
    /// The job's result or error.
    pub outcome: BatchResult<Arc<JobOutput<T>>>,
}

/// The recombined result of a chunked operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedResult<T> {
    /// Every chunk's outputs, concatenated in chunk-index order.
    pub ordered_payloads: Vec<T>,
    /// `chunk_spans[i]` is the range of `ordered_payloads` from chunk `i`.
    pub chunk_spans: Vec<Range<usize>>,
    /// Reduced metrics.
    pub metrics: BTreeMap<String, f64>,
}

impl<T> CombinedResult<T> {
    /// Outputs contributed by chunk `chunk_index`.
    #[must_use]
    pub fn chunk_payloads(&self, chunk_index: usize) -> Option<&[T]> {
        self.chunk_spans
            .get(chunk_index)
            .and_then(|span| self.ordered_payloads.get(span.clone()))
    }
}

/// Merges terminal chunk results into one [`CombinedResult`].
#[derive(Clone)]
pub struct Combiner {
    reductions: ReductionRegistry,
    events: SharedEventSink,
}

impl std::fmt::Debug for Combiner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Combiner")
            .field("reductions", &self.reductions)
            .finish_non_exhaustive()
    }
}

impl Default for Combiner {
    fn default() -> Self {
        Self::new(ReductionRegistry::default())
    }
}

impl Combiner {
    /// Create a combiner using `reductions`.
    #[must_use]
    pub fn new(reductions: ReductionRegistry) -> Self {
        Self {
            reductions,
            events: events::default_sink(),
        }
    }

    /// Report completions to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: SharedEventSink) -> Self {
        self.events = sink;
        self
    }

    /// The suffix registry in use.
    #[must_use]
    pub const fn reductions(&self) -> &ReductionRegistry {
        &self.reductions
    }

    /// Combine the results of terminal handles.
    ///
    /// # Errors
    ///
    /// - [`BatchError::InvalidInput`] if a handle is still pending or the chunk
    ///   indices are not `0..handles.len()`.
    /// - [`BatchError::ChunkFailed`] for the lowest-indexed failed chunk.
    pub fn combine<T: Clone>(
        &self,
        handles: &[JobHandle<JobOutput<T>>],
    ) -> BatchResult<CombinedResult<T>> {
        let results = handles
            .iter()
            .map(|handle| {
                let outcome = match handle.snapshot() {
                    JobSnapshot::Pending(_) => {
                        return Err(BatchError::InvalidInput(format!(
                            "chunk {} (job {}) has not finished",
                            handle.chunk_index(),
                            handle.id()
                        )))
                    }
                    JobSnapshot::Completed(output) => Ok(output),
                    JobSnapshot::Failed(error) => Err(error),
                };
                Ok(ChunkResult {
                    chunk_index: handle.chunk_index(),
                    weight: handle.weight(),
                    outcome,
                })
            })
            .collect::<BatchResult<Vec<_>>>()?;

        self.combine_results(results)
    }

    /// Combine chunk results given in any order.
    ///
    /// # Errors
    ///
    /// - [`BatchError::InvalidInput`] if the chunk indices are not
    ///   `0..results.len()`.
    /// - [`BatchError::ChunkFailed`] for the lowest-indexed failed chunk.
    pub fn combine_results<T: Clone>(
        &self,
        mut results: Vec<ChunkResult<T>>,
    ) -> BatchResult<CombinedResult<T>> {
        results.sort_by_key(|result| result.chunk_index);
        for (position, result) in results.iter().enumerate() {
            if result.chunk_index != position {
                return Err(BatchError::InvalidInput(format!(
                    "chunk indices must be 0..{}, found {} at position {position}",
                    results.len(),
                    result.chunk_index
                )));
            }
        }

        let mut outputs = Vec::with_capacity(results.len());
        for result in results {
            match result.outcome {
                Ok(output) => outputs.push((result.chunk_index, result.weight, output)),
                Err(error) => return Err(BatchError::chunk(result.chunk_index, error)),
            }
        }

        let mut ordered_payloads = Vec::new();
        let mut chunk_spans = Vec::with_capacity(outputs.len());
        let mut samples: BTreeMap<&str, Vec<Sample>> = BTreeMap::new();

        for (chunk_index, weight, output) in &outputs {
            let start = ordered_payloads.len();
            ordered_payloads.extend(output.outputs.iter().cloned());
            chunk_spans.push(start..ordered_payloads.len());

            for (key, value) in &output.metrics {
                samples.entry(key.as_str()).or_default().push(Sample {
                    chunk_index: *chunk_index,
                    weight: *weight,
                    value: *value,
                });
            }
        }

        let mut metrics = BTreeMap::new();
        for (key, samples) in &samples {
            let reduction = self.reductions.resolve(key);
            reduction.reduce(key, samples, &mut metrics);
        }

        debug!(
            chunks = chunk_spans.len(),
            payloads = ordered_payloads.len(),
            metrics = metrics.len(),
            "Combined chunk results"
        );
        self.events.emit(
            &Event::new(events::COMBINE_COMPLETED)
                .with("chunks", chunk_spans.len())
                .with("payloads", ordered_payloads.len())
                .with("metrics", metrics.len()),
        );

        Ok(CombinedResult {
            ordered_payloads,
            chunk_spans,
            metrics,
        })
    }
}
