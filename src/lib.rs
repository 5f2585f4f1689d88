//! # Date histogram aggregation
//!
//! The date-histogram engine of a sharded search platform: documents carry
//! timestamps, the engine groups them into buckets of a configured width
//! and counts them, per shard and then globally.
//!
//! There are two interval families: **fixed** intervals of constant
//! millisecond width (`"30d"`, `"90m"`) and **calendar** intervals whose
//! wall-clock length varies (`"month"`, `"quarter"`), rounded on the civil
//! calendar of a configurable time zone, DST included.
//!
//! ## Usage
//!
//! Build a [`DateHistogramRequest`](agg_req::DateHistogramRequest) (plain
//! struct or the platform's JSON), create one
//! [`ShardDateHistogramCollector`] per shard and feed it the shard's
//! visible documents through a [`TimestampAccessor`]. Each collector yields
//! an [`IntermediateDateHistogram`]; [`reduce`] merges them into the final
//! [`DateHistogramResult`](agg_result::DateHistogramResult).
//!
//! ```
//! use datehist::agg_req::DateHistogramRequest;
//! use datehist::AggregationLimits;
//!
//! let req: DateHistogramRequest = serde_json::from_value(serde_json::json!({
//!     "field": "created_at",
//!     "calendar_interval": "year",
//!     "min_doc_count": 0
//! }))?;
//! let limits = AggregationLimits::default();
//! # Ok::<(), serde_json::Error>(())
//! ```
//!
//! ## Distributed execution
//!
//! Shard collections are independent and may run in parallel; every
//! collector holds a clone of the execution's [`AggregationLimits`], whose
//! shared atomic counter bounds bucket creation across all shards, both
//! phases and every nesting level. The reduce is a single-threaded k-way
//! merge of the completed shard histograms; gap filling
//! (`min_doc_count == 0`) happens only there, since a single shard has
//! incomplete knowledge of the global key range.
//!
//! Intermediate results serde-round-trip, so the transport layer can ship
//! them between nodes in whatever encoding it prefers.

pub mod agg_limits;
pub mod agg_req;
pub mod agg_result;
mod collector;
mod date;
mod error;
pub mod intermediate_agg_result;
pub mod interval;
pub mod rounding;


pub use agg_limits::{AggregationLimits, DEFAULT_BUCKET_LIMIT};
pub use collector::{ShardDateHistogramCollector, TimestampAccessor};
pub use error::AggregationError;
pub use intermediate_agg_result::{reduce, reduce_in, IntermediateDateHistogram};
pub use interval::DeprecationLog;

/// Index of a document within one shard.
pub type DocId = u32;

/// The crate's result type.
pub type Result<T> = std::result::Result<T, AggregationError>;
