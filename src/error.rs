use thiserror::Error;

/// Error type for everything that can go wrong while configuring or
/// executing a date histogram aggregation.
///
/// All variants are terminal for the query execution they occur in: there is
/// no internal retry and no partial histogram is surfaced. The message
/// wording is part of the contract, callers match on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    /// Two interval configuration options were set on the same request.
    #[error("{0}")]
    ConfigConflict(String),
    /// The interval could not be parsed or is semantically invalid.
    #[error("{0}")]
    InvalidInterval(String),
    /// The number of buckets created by the aggregation tree exceeded the
    /// configured limit.
    #[error(
        "Aborting aggregation because the number of buckets [{current}] exceeded the configured \
         limit [{limit}]"
    )]
    TooManyBuckets {
        /// The configured limit.
        limit: u32,
        /// The bucket count the failed increment would have reached.
        current: u32,
    },
    /// A timestamp or bucket key fell outside the representable date range.
    #[error("Cannot round [{0}], value is outside of the representable date range")]
    RoundingOverflow(i64),
}
