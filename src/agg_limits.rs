//! Bucket accounting shared across one query execution.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::AggregationError;

/// Default maximum number of buckets one aggregation request may create
/// before it is aborted.
pub const DEFAULT_BUCKET_LIMIT: u32 = 65_000;

/// Bucket budget for one query execution.
///
/// The counter is shared by every collector and the reducer of the
/// execution, including nested sub-histograms, so bucket creation cannot
/// escape the limit by being spread across shards, phases or nesting
/// levels. Cloning shares the underlying counter.
#[derive(Debug)]
pub struct AggregationLimits {
    /// The counter which is shared between the aggregations for one request.
    bucket_count: Arc<AtomicU32>,
    /// The maximum number of buckets before the request fails.
    bucket_limit: u32,
}

impl Clone for AggregationLimits {
    fn clone(&self) -> Self {
        Self {
            bucket_count: Arc::clone(&self.bucket_count),
            bucket_limit: self.bucket_limit,
        }
    }
}

impl Default for AggregationLimits {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AggregationLimits {
    /// Create the limits for one query execution.
    ///
    /// *bucket_limit* defaults to [`DEFAULT_BUCKET_LIMIT`].
    ///
    /// Note: The returned instance contains an Arc shared counter to track
    /// created buckets, shared with every clone.
    pub fn new(bucket_limit: Option<u32>) -> Self {
        Self {
            bucket_count: Default::default(),
            bucket_limit: bucket_limit.unwrap_or(DEFAULT_BUCKET_LIMIT),
        }
    }

    /// Account for one newly created bucket.
    pub(crate) fn add_bucket(&self) -> crate::Result<()> {
        self.add_buckets(1)
    }

    /// Account for `count` newly created buckets.
    ///
    /// The increment and the check are one atomic step: a successful call
    /// never leaves the counter above the limit, and the first call that
    /// would fails the whole execution instead.
    pub(crate) fn add_buckets(&self, count: u32) -> crate::Result<()> {
        self.bucket_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                current
                    .checked_add(count)
                    .filter(|&incremented| incremented <= self.bucket_limit)
            })
            .map(|_previous| ())
            .map_err(|current| AggregationError::TooManyBuckets {
                limit: self.bucket_limit,
                current: current.saturating_add(count),
            })
    }

    /// Number of buckets created so far in this execution.
    pub fn bucket_count(&self) -> u32 {
        self.bucket_count.load(Ordering::Relaxed)
    }

    /// The configured limit.
    pub fn bucket_limit(&self) -> u32 {
        self.bucket_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_shared_between_clones() {
        let limits = AggregationLimits::new(Some(10));
        let clone = limits.clone();
        limits.add_buckets(4).unwrap();
        clone.add_buckets(4).unwrap();
        assert_eq!(limits.bucket_count(), 8);
        assert_eq!(clone.bucket_count(), 8);
    }

    #[test]
    fn increment_fails_instead_of_exceeding() {
        let limits = AggregationLimits::new(Some(3));
        limits.add_buckets(3).unwrap();
        let err = limits.add_bucket().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Aborting aggregation because the number of buckets [4] exceeded the configured \
             limit [3]"
        );
        // the failed increment left no trace
        assert_eq!(limits.bucket_count(), 3);
        assert_eq!(limits.bucket_limit(), 3);
    }

    #[test]
    fn default_limit() {
        let limits = AggregationLimits::default();
        assert_eq!(limits.bucket_limit(), DEFAULT_BUCKET_LIMIT);
    }
}
