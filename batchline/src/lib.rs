//! # batchline
//!
//! Client-side core for submitting large batch computations to a remote
//! job service that accepts work asynchronously and reports results by polling.
//!
//! A logical batch is split into chunks, every chunk is submitted as its own
//! job, each job is polled to completion, and the per-chunk results are merged
//! back into one result in the caller's original order.
//!
//! ## Design Principles
//!
//! - **Transport-agnostic**: the core only talks to a [`Transport`](transport::Transport);
//!   the bundled [`HttpTransport`](http::HttpTransport) is one implementation
//! - **Fail fast**: one failed chunk fails the whole operation and stops the
//!   remaining polling loops
//! - **Shared breakers**: every caller of an endpoint shares one circuit breaker
//! - **Backpressure-aware**: poll cadence follows the server's queue state
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use batchline::http::HttpTransport;
//! use batchline::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     batchline::observability::init()?;
//!
//!     let transport: HttpTransport<String, f64> =
//!         HttpTransport::new("https://jobs.example.com/v1")?.with_credential("token");
//!     let key = transport.breaker_key();
//!     let client = BatchClient::new(transport, key);
//!
//!     let items: Vec<String> = (0..300).map(|i| format!("item-{i}")).collect();
//!     let handle = client.submit(items).await?;
//!     let combined = handle.wait(Duration::from_secs(600)).await?;
//!
//!     println!("{} outputs, loss {:?}", combined.ordered_payloads.len(), combined.metrics.get("loss"));
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `http` (default): [`reqwest`]-based [`HttpTransport`](http::HttpTransport)
//! - `otel-metrics`: deliver lifecycle events as OpenTelemetry counters

#![allow(clippy::missing_errors_doc)]

pub mod breaker;
pub mod cancellation;
pub mod chunker;
pub mod client;
pub mod combiner;
pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod observability;
pub mod poller;
pub mod queue_state;
pub mod retry;
pub mod transport;

#[cfg(feature = "http")]
pub mod http;

pub mod prelude {
    //! Convenience re-exports for common types and traits
    //!
    //! ```rust
    //! use batchline::prelude::*;
    //!
    //! let limits = ChunkLimits::default();
    //! assert_eq!(limits.max_items_per_chunk, 128);
    //! ```

    pub use crate::breaker::{BreakerKey, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
    pub use crate::chunker::{ChunkLimits, EmptyBatchPolicy};
    pub use crate::client::{BatchClient, CombinedFutureHandle};
    pub use crate::combiner::{CombinedResult, JobOutput, Reduction, ReductionRegistry};
    pub use crate::config::BatchlineConfig;
    pub use crate::error::{BatchError, BatchResult};
    pub use crate::events::{Event, EventSink, SharedEventSink};
    pub use crate::handle::{JobHandle, JobState};
    pub use crate::queue_state::{PollSettings, QueueState, QueueStateChange};
    pub use crate::retry::RetryPolicy;
    pub use crate::transport::{JobId, PollResponse, Transport, TransportError};
}
