//! Per-shard collection of date histogram buckets.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::agg_limits::AggregationLimits;
use crate::agg_req::{DateBounds, DateHistogramRequest};
use crate::intermediate_agg_result::{
    IntermediateDateHistogram, IntermediateHistogramBucketEntry,
};
use crate::interval::DeprecationLog;
use crate::rounding::{Rounding, UtcOffsetLookup};
use crate::DocId;

/// Supplies the timestamp values of the aggregated field, per document.
///
/// This is the boundary to the column store: implementations read the doc
/// values of the documents visible to the shard under the active query.
/// Values are nanosecond precision epoch values and may be multi-valued.
pub trait TimestampAccessor {
    /// Append the values of `field` for `doc` to `out`.
    fn fetch_values(&self, field: &str, doc: DocId, out: &mut Vec<i64>);
}

/// Collects the date histogram of one shard.
///
/// Buckets materialize only for observed keys; gap filling is the reduce's
/// job, a shard has incomplete knowledge of the global key range. The
/// limits handle is a clone shared with the whole execution, so the first
/// bucket that would exceed the budget aborts the shard with
/// [`TooManyBuckets`](crate::AggregationError::TooManyBuckets).
#[derive(Clone, Debug)]
pub struct ShardDateHistogramCollector {
    field: String,
    rounding: Rounding,
    limits: AggregationLimits,
    hard_bounds: Option<DateBounds>,
    buckets: FxHashMap<i64, u64>,
    sub_blueprint: Option<Box<ShardDateHistogramCollector>>,
    sub_collectors: FxHashMap<i64, ShardDateHistogramCollector>,
    value_buffer: Vec<i64>,
    key_buffer: Vec<i64>,
}

impl ShardDateHistogramCollector {
    /// Build a collector for `req`, with the zone taken from the request's
    /// `time_zone`.
    ///
    /// Validation runs here, before any document is touched.
    pub fn from_request_and_validate(
        req: &DateHistogramRequest,
        limits: &AggregationLimits,
        deprecations: &DeprecationLog,
    ) -> crate::Result<Self> {
        req.validate()?;
        Self::build(req, None, limits, deprecations)
    }

    /// Build a collector with an injected zone, for zones whose offset
    /// varies with the instant. The zone applies to every nesting level.
    pub fn from_request_with_zone(
        req: &DateHistogramRequest,
        zone: Arc<dyn UtcOffsetLookup>,
        limits: &AggregationLimits,
        deprecations: &DeprecationLog,
    ) -> crate::Result<Self> {
        req.validate()?;
        Self::build(req, Some(&zone), limits, deprecations)
    }

    fn build(
        req: &DateHistogramRequest,
        zone: Option<&Arc<dyn UtcOffsetLookup>>,
        limits: &AggregationLimits,
        deprecations: &DeprecationLog,
    ) -> crate::Result<Self> {
        let rounding = match zone {
            Some(zone) => req.rounding_in(Arc::clone(zone), deprecations)?,
            None => req.rounding(deprecations)?,
        };
        let sub_blueprint = req
            .sub_aggregation
            .as_ref()
            .map(|sub_req| Self::build(sub_req, zone, limits, deprecations))
            .transpose()?
            .map(Box::new);
        Ok(Self {
            field: req.field.clone(),
            rounding,
            limits: limits.clone(),
            hard_bounds: req.hard_bounds,
            buckets: Default::default(),
            sub_blueprint,
            sub_collectors: Default::default(),
            value_buffer: Vec::new(),
            key_buffer: Vec::new(),
        })
    }

    /// Collect one document.
    ///
    /// A multi-valued document contributes once per distinct rounded key
    /// derived from its values: values that round to the same key collapse,
    /// the document is not double counted within a bucket.
    pub fn collect(&mut self, doc: DocId, accessor: &dyn TimestampAccessor) -> crate::Result<()> {
        let mut values = std::mem::take(&mut self.value_buffer);
        let mut keys = std::mem::take(&mut self.key_buffer);
        values.clear();
        keys.clear();

        accessor.fetch_values(&self.field, doc, &mut values);
        for &nanos in &values {
            // date columns store nanoseconds, bucketing is millisecond precision
            let millis = nanos.div_euclid(1_000_000);
            if let Some(bounds) = &self.hard_bounds {
                if !bounds.contains(millis) {
                    continue;
                }
            }
            keys.push(self.rounding.round(millis)?);
        }
        keys.sort_unstable();
        keys.dedup();

        for &key in &keys {
            if !self.buckets.contains_key(&key) {
                self.limits.add_bucket()?;
            }
            *self.buckets.entry(key).or_insert(0) += 1;
            if let Some(blueprint) = self.sub_blueprint.as_deref() {
                let sub = self
                    .sub_collectors
                    .entry(key)
                    .or_insert_with(|| blueprint.clone());
                sub.collect(doc, accessor)?;
            }
        }

        self.value_buffer = values;
        self.key_buffer = keys;
        Ok(())
    }

    /// Number of distinct keys observed so far.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Converts the collector state into the shard's intermediate
    /// histogram, sorted ascending by key. Arrival order is document order,
    /// not time order, so this is where the sort happens.
    pub fn into_intermediate(self) -> crate::Result<IntermediateDateHistogram> {
        let mut sub_collectors = self.sub_collectors;
        let mut buckets = Vec::with_capacity(self.buckets.len());
        for (key, doc_count) in self.buckets {
            let sub_aggregation = sub_collectors
                .remove(&key)
                .map(|collector| collector.into_intermediate())
                .transpose()?
                .map(Box::new);
            buckets.push(IntermediateHistogramBucketEntry {
                key,
                doc_count,
                sub_aggregation,
            });
        }
        buckets.sort_unstable_by_key(|bucket| bucket.key);
        Ok(IntermediateDateHistogram { buckets })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Single column, one row of nanosecond values per document.
    struct Column(Vec<Vec<i64>>);

    impl TimestampAccessor for Column {
        fn fetch_values(&self, _field: &str, doc: DocId, out: &mut Vec<i64>) {
            out.extend(&self.0[doc as usize]);
        }
    }

    fn nanos(millis: i64) -> i64 {
        millis * 1_000_000
    }

    fn req(json: serde_json::Value) -> DateHistogramRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn collects_in_document_order_emits_in_key_order() {
        let request = req(json!({ "field": "date", "fixed_interval": "1s" }));
        let limits = AggregationLimits::default();
        let mut collector = ShardDateHistogramCollector::from_request_and_validate(
            &request,
            &limits,
            &DeprecationLog::default(),
        )
        .unwrap();

        let column = Column(vec![vec![nanos(5_000)], vec![nanos(1_000)], vec![nanos(5_500)]]);
        for doc in 0..3 {
            collector.collect(doc, &column).unwrap();
        }
        let histogram = collector.into_intermediate().unwrap();
        let keys: Vec<i64> = histogram.buckets.iter().map(|bucket| bucket.key).collect();
        let counts: Vec<u64> = histogram
            .buckets
            .iter()
            .map(|bucket| bucket.doc_count)
            .collect();
        assert_eq!(keys, vec![1_000, 5_000]);
        assert_eq!(counts, vec![1, 2]);
    }

    #[test]
    fn multi_valued_doc_counts_once_per_distinct_key() {
        let request = req(json!({ "field": "date", "fixed_interval": "10s" }));
        let limits = AggregationLimits::default();
        let mut collector = ShardDateHistogramCollector::from_request_and_validate(
            &request,
            &limits,
            &DeprecationLog::default(),
        )
        .unwrap();

        // three values, two of them in the same 10s bucket
        let column = Column(vec![vec![nanos(1_000), nanos(8_000), nanos(15_000)]]);
        collector.collect(0, &column).unwrap();
        let histogram = collector.into_intermediate().unwrap();
        assert_eq!(histogram.buckets.len(), 2);
        assert_eq!(histogram.buckets[0].key, 0);
        assert_eq!(histogram.buckets[0].doc_count, 1);
        assert_eq!(histogram.buckets[1].key, 10_000);
        assert_eq!(histogram.buckets[1].doc_count, 1);
    }

    #[test]
    fn sub_millisecond_values_truncate_before_rounding() {
        let request = req(json!({ "field": "date", "fixed_interval": "1s" }));
        let limits = AggregationLimits::default();
        let mut collector = ShardDateHistogramCollector::from_request_and_validate(
            &request,
            &limits,
            &DeprecationLog::default(),
        )
        .unwrap();

        let column = Column(vec![vec![5_015_298_384], vec![5_015_000_000]]);
        collector.collect(0, &column).unwrap();
        collector.collect(1, &column).unwrap();
        let histogram = collector.into_intermediate().unwrap();
        assert_eq!(histogram.buckets.len(), 1);
        assert_eq!(histogram.buckets[0].key, 5_000);
        assert_eq!(histogram.buckets[0].doc_count, 2);
    }

    #[test]
    fn hard_bounds_clamp_collection() {
        let request = req(json!({
            "field": "date",
            "fixed_interval": "1s",
            "hard_bounds": { "min": 2_000, "max": 6_000 }
        }));
        let limits = AggregationLimits::default();
        let mut collector = ShardDateHistogramCollector::from_request_and_validate(
            &request,
            &limits,
            &DeprecationLog::default(),
        )
        .unwrap();

        let column = Column(vec![vec![nanos(1_000)], vec![nanos(3_000)], vec![nanos(9_000)]]);
        for doc in 0..3 {
            collector.collect(doc, &column).unwrap();
        }
        let histogram = collector.into_intermediate().unwrap();
        assert_eq!(histogram.buckets.len(), 1);
        assert_eq!(histogram.buckets[0].key, 3_000);
    }

    #[test]
    fn bucket_limit_aborts_the_shard() {
        let request = req(json!({ "field": "date", "fixed_interval": "1s" }));
        let limits = AggregationLimits::new(Some(2));
        let mut collector = ShardDateHistogramCollector::from_request_and_validate(
            &request,
            &limits,
            &DeprecationLog::default(),
        )
        .unwrap();

        let column = Column(vec![
            vec![nanos(1_000)],
            vec![nanos(2_000)],
            vec![nanos(3_000)],
        ]);
        collector.collect(0, &column).unwrap();
        collector.collect(1, &column).unwrap();
        let err = collector.collect(2, &column).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Aborting aggregation because the number of buckets [3] exceeded the configured \
             limit [2]"
        );
    }

    #[test]
    fn validation_happens_before_collection() {
        let request = req(json!({
            "field": "date",
            "calendar_interval": "5d",
        }));
        let err = ShardDateHistogramCollector::from_request_and_validate(
            &request,
            &AggregationLimits::default(),
            &DeprecationLog::default(),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The supplied interval [5d] could not be parsed as a calendar interval."
        );
    }
}
