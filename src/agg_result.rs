//! The final date histogram result tree.
//!
//! Produced from [`IntermediateDateHistogram`] once per query execution,
//! after the reduce (or directly from a single unreduced shard). Serializes
//! into the platform's JSON response format.
//!
//! [`IntermediateDateHistogram`]: crate::intermediate_agg_result::IntermediateDateHistogram

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// The final histogram of one query execution. Owned by the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DateHistogramResult {
    /// The buckets, in the requested order.
    pub buckets: BucketEntries,
}

/// List or keyed-map form of the bucket entries, per the request's `keyed`
/// flag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BucketEntries {
    /// Buckets as an ordered list.
    Vec(Vec<BucketEntry>),
    /// Buckets as a map keyed by the formatted bucket key.
    HashMap(FxHashMap<String, BucketEntry>),
}

/// One bucket of the final histogram.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketEntry {
    /// Bucket start, epoch milliseconds.
    pub key: i64,
    /// Bucket start formatted, in UTC unless a display zone is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_as_string: Option<String>,
    /// Number of documents in the bucket.
    pub doc_count: u64,
    /// Result of the nested histogram, when the request has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_aggregation: Option<Box<DateHistogramResult>>,
}

impl DateHistogramResult {
    /// The bucket entries in list form. Panics on keyed results, which have
    /// no defined order.
    pub fn entries(&self) -> &[BucketEntry] {
        match &self.buckets {
            BucketEntries::Vec(entries) => entries,
            BucketEntries::HashMap(_) => {
                panic!("keyed histogram results have no ordered entry list")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn result_serializes_flat_buckets() {
        let result = DateHistogramResult {
            buckets: BucketEntries::Vec(vec![BucketEntry {
                key: 1_420_070_400_000,
                key_as_string: Some("2015-01-01T00:00:00.000Z".to_string()),
                doc_count: 4,
                sub_aggregation: None,
            }]),
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "buckets": [
                    {
                        "key": 1_420_070_400_000i64,
                        "key_as_string": "2015-01-01T00:00:00.000Z",
                        "doc_count": 4
                    }
                ]
            })
        );
    }

    #[test]
    fn result_json_roundtrip() {
        let result = DateHistogramResult {
            buckets: BucketEntries::Vec(vec![BucketEntry {
                key: 0,
                key_as_string: Some("1970-01-01T00:00:00.000Z".to_string()),
                doc_count: 1,
                sub_aggregation: Some(Box::new(DateHistogramResult {
                    buckets: BucketEntries::Vec(vec![]),
                })),
            }]),
        };
        let round: DateHistogramResult =
            serde_json::from_str(&serde_json::to_string(&result).unwrap()).unwrap();
        assert_eq!(result, round);
    }
}
