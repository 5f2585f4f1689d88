//! Contains the intermediate histogram tree, that can be merged.
//! Intermediate results are produced per shard and merged between shards or
//! between nodes; the merged tree converts into the final result.

use itertools::Itertools;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::agg_limits::AggregationLimits;
use crate::agg_req::{BucketOrder, DateHistogramRequest, Order, OrderTarget};
use crate::agg_result::{BucketEntries, BucketEntry, DateHistogramResult};
use crate::date::format_date;
use crate::interval::DeprecationLog;
use crate::rounding::{Rounding, UtcOffsetLookup};

/// The histogram of one shard (or a partial merge): sorted ascending by
/// key, one entry per distinct observed key, no gaps filled. Optimized to
/// be merged with other intermediate results; serde round-trips for the
/// transport between nodes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IntermediateDateHistogram {
    /// The buckets.
    pub buckets: Vec<IntermediateHistogramBucketEntry>,
}

/// This is the histogram entry for a bucket, which contains a key, count,
/// and optionally a nested histogram.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntermediateHistogramBucketEntry {
    /// The unique key the bucket is identified with, epoch milliseconds.
    pub key: i64,
    /// The number of documents in the bucket.
    pub doc_count: u64,
    /// The nested histogram collected within this bucket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_aggregation: Option<Box<IntermediateDateHistogram>>,
}

impl IntermediateDateHistogram {
    /// K-way merge of per-shard histograms.
    ///
    /// Inputs are individually key-sorted with unique keys; so is the
    /// output, with counts summed per key and nested histograms merged
    /// recursively. Every key of the merged output counts against `limits`
    /// once, on top of what the collection phase already accounted for, at
    /// every nesting level.
    pub fn merge(
        histograms: Vec<IntermediateDateHistogram>,
        limits: &AggregationLimits,
    ) -> crate::Result<IntermediateDateHistogram> {
        let sorted = histograms
            .into_iter()
            .map(|histogram| histogram.buckets.into_iter())
            .kmerge_by(|left, right| left.key < right.key);

        let mut merged = Vec::new();
        for (key, group) in &sorted.chunk_by(|entry| entry.key) {
            limits.add_bucket()?;
            let mut doc_count = 0;
            let mut sub_histograms = Vec::new();
            for entry in group {
                doc_count += entry.doc_count;
                if let Some(sub) = entry.sub_aggregation {
                    sub_histograms.push(*sub);
                }
            }
            let sub_aggregation = if sub_histograms.is_empty() {
                None
            } else {
                Some(Box::new(Self::merge(sub_histograms, limits)?))
            };
            merged.push(IntermediateHistogramBucketEntry {
                key,
                doc_count,
                sub_aggregation,
            });
        }
        Ok(IntermediateDateHistogram { buckets: merged })
    }

    /// Converts a single, unreduced shard histogram into a final result.
    ///
    /// No gap filling happens on this path: a shard only sees its own slice
    /// of the key range, synthesizing empty buckets is the reduce's call.
    pub fn into_final_result(
        self,
        req: &DateHistogramRequest,
        limits: &AggregationLimits,
        deprecations: &DeprecationLog,
    ) -> crate::Result<DateHistogramResult> {
        req.validate()?;
        into_final(self, req, None, limits, deprecations, false)
    }

    /// [`into_final_result`](Self::into_final_result) with an injected
    /// zone.
    pub fn into_final_result_in(
        self,
        req: &DateHistogramRequest,
        zone: &std::sync::Arc<dyn UtcOffsetLookup>,
        limits: &AggregationLimits,
        deprecations: &DeprecationLog,
    ) -> crate::Result<DateHistogramResult> {
        req.validate()?;
        into_final(self, req, Some(zone), limits, deprecations, false)
    }
}

/// Reduces the per-shard histograms of one query execution into the final
/// histogram.
///
/// Merges the key-sorted inputs, fills gaps between the minimum and maximum
/// observed key (when `min_doc_count == 0`, widened by `extended_bounds`),
/// drops buckets below `min_doc_count`, reapplies the requested ordering
/// and formats the keys. `limits` is the same handle the collection phase
/// used; exceeding it anywhere fails the reduce with no partial result.
pub fn reduce(
    shards: Vec<IntermediateDateHistogram>,
    req: &DateHistogramRequest,
    limits: &AggregationLimits,
    deprecations: &DeprecationLog,
) -> crate::Result<DateHistogramResult> {
    req.validate()?;
    let merged = IntermediateDateHistogram::merge(shards, limits)?;
    into_final(merged, req, None, limits, deprecations, true)
}

/// [`reduce`] with an injected zone, applied to every nesting level.
pub fn reduce_in(
    shards: Vec<IntermediateDateHistogram>,
    req: &DateHistogramRequest,
    zone: &std::sync::Arc<dyn UtcOffsetLookup>,
    limits: &AggregationLimits,
    deprecations: &DeprecationLog,
) -> crate::Result<DateHistogramResult> {
    req.validate()?;
    let merged = IntermediateDateHistogram::merge(shards, limits)?;
    into_final(merged, req, Some(zone), limits, deprecations, true)
}

fn into_final(
    histogram: IntermediateDateHistogram,
    req: &DateHistogramRequest,
    zone: Option<&std::sync::Arc<dyn UtcOffsetLookup>>,
    limits: &AggregationLimits,
    deprecations: &DeprecationLog,
    fill_gaps: bool,
) -> crate::Result<DateHistogramResult> {
    let rounding = match zone {
        Some(zone) => req.rounding_in(std::sync::Arc::clone(zone), deprecations)?,
        None => req.rounding(deprecations)?,
    };

    let buckets = if fill_gaps && req.min_doc_count() == 0 {
        fill_gaps_between(histogram.buckets, req, &rounding, limits)?
    } else {
        histogram.buckets
    };

    let mut entries = Vec::with_capacity(buckets.len());
    for bucket in buckets {
        // dropped buckets were still paid for at the limits when created
        if bucket.doc_count < req.min_doc_count() {
            continue;
        }
        let sub_aggregation = match &req.sub_aggregation {
            Some(sub_req) => {
                let sub_histogram = bucket
                    .sub_aggregation
                    .map(|sub| *sub)
                    .unwrap_or_default();
                Some(Box::new(into_final(
                    sub_histogram,
                    sub_req,
                    zone,
                    limits,
                    deprecations,
                    fill_gaps,
                )?))
            }
            None => None,
        };
        let key_as_string = format_date(bucket.key, Some(rounding.display_offset(bucket.key)))?;
        entries.push(BucketEntry {
            key: bucket.key,
            key_as_string: Some(key_as_string),
            doc_count: bucket.doc_count,
            sub_aggregation,
        });
    }

    apply_order(&mut entries, req.order());

    let buckets = if req.keyed {
        let mut map = FxHashMap::with_capacity_and_hasher(entries.len(), Default::default());
        for entry in entries {
            let formatted = entry
                .key_as_string
                .clone()
                .expect("date buckets always carry a formatted key");
            map.insert(formatted, entry);
        }
        BucketEntries::HashMap(map)
    } else {
        BucketEntries::Vec(entries)
    };
    Ok(DateHistogramResult { buckets })
}

/// Walks the key range from the minimum to the maximum observed key with
/// [`Rounding::next_key`], inserting a zero bucket for every key absent
/// from the merge result. Extended bounds widen the walked range; each
/// inserted bucket counts against the limits.
fn fill_gaps_between(
    buckets: Vec<IntermediateHistogramBucketEntry>,
    req: &DateHistogramRequest,
    rounding: &Rounding,
    limits: &AggregationLimits,
) -> crate::Result<Vec<IntermediateHistogramBucketEntry>> {
    let mut min_key = buckets.first().map(|bucket| bucket.key);
    let mut max_key = buckets.last().map(|bucket| bucket.key);
    if let Some(bounds) = req.extended_bounds {
        let lower = rounding.round(bounds.min)?;
        let upper = rounding.round(bounds.max)?;
        min_key = Some(min_key.map_or(lower, |key| key.min(lower)));
        max_key = Some(max_key.map_or(upper, |key| key.max(upper)));
    }
    let (Some(first), Some(last)) = (min_key, max_key) else {
        // nothing observed and no bounds to span
        return Ok(buckets);
    };

    let mut filled = Vec::with_capacity(buckets.len());
    let mut existing = buckets.into_iter().peekable();
    let mut key = first;
    loop {
        if existing.peek().map(|bucket| bucket.key) == Some(key) {
            filled.push(existing.next().expect("peeked entry exists"));
        } else {
            limits.add_bucket()?;
            filled.push(IntermediateHistogramBucketEntry {
                key,
                doc_count: 0,
                sub_aggregation: None,
            });
        }
        if key >= last {
            break;
        }
        key = rounding.next_key(key)?;
    }
    Ok(filled)
}

fn apply_order(entries: &mut [BucketEntry], order: BucketOrder) {
    match (order.target, order.order) {
        (OrderTarget::Key, Order::Asc) => entries.sort_unstable_by_key(|entry| entry.key),
        (OrderTarget::Key, Order::Desc) => {
            entries.sort_unstable_by_key(|entry| std::cmp::Reverse(entry.key))
        }
        (OrderTarget::Count, Order::Asc) => {
            entries.sort_unstable_by_key(|entry| (entry.doc_count, entry.key))
        }
        (OrderTarget::Count, Order::Desc) => entries.sort_unstable_by(|left, right| {
            right
                .doc_count
                .cmp(&left.doc_count)
                .then(left.key.cmp(&right.key))
        }),
    }
}
