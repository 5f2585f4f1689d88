//! The date histogram request tree.

use std::fmt::Display;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};

use crate::date::parse_date;
use crate::error::AggregationError;
use crate::interval::{parse_offset, DeprecationLog, IntervalSpec};
use crate::rounding::{FixedTimeZone, Rounding, UtcOffsetLookup};

/// A date histogram aggregation request.
///
/// Groups documents into buckets of the configured interval width, counted
/// per bucket. Requests deserialize from the platform's JSON format:
///
/// ```json
/// {
///     "date_histogram": {
///         "field": "created_at",
///         "calendar_interval": "month",
///         "time_zone": "+01:00",
///         "min_doc_count": 0
///     }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DateHistogramRequest {
    /// The field to aggregate on.
    pub field: String,
    /// Interval configuration, exactly one option set. See [`IntervalSpec`].
    #[serde(flatten)]
    pub interval: IntervalSpec,
    /// The zone rounding happens in, and the zone bucket keys render in.
    /// `UTC` (the default) or a fixed `±HH:MM` offset; zones with varying
    /// offsets are injected programmatically, see
    /// [`UtcOffsetLookup`](crate::rounding::UtcOffsetLookup).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    /// Shifts the bucket grid by a duration expression (`"1h"`, `"-30m"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
    /// The minimum number of documents in a bucket for it to be returned.
    ///
    /// Defaults to 0: the reduce returns every bucket between the first and
    /// last observed key, including empty ones. Empty buckets are never
    /// synthesized during per-shard collection, a shard only sees its own
    /// slice of the key range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_doc_count: Option<u64>,
    /// The order the final buckets are returned in. Defaults to key
    /// ascending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<BucketOrder>,
    /// Widens the gap-filled key range beyond the observed data. Only
    /// meaningful with `min_doc_count == 0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended_bounds: Option<DateBounds>,
    /// Limits collection to `[min, max]`; values outside are not bucketed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hard_bounds: Option<DateBounds>,
    /// Whether to return the buckets as a map keyed by the formatted key.
    #[serde(default)]
    pub keyed: bool,
    /// Nested date histogram computed per bucket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_aggregation: Option<Box<DateHistogramRequest>>,
}

impl DateHistogramRequest {
    /// Effective `min_doc_count`.
    pub fn min_doc_count(&self) -> u64 {
        self.min_doc_count.unwrap_or(0)
    }

    /// Effective bucket order.
    pub fn order(&self) -> BucketOrder {
        self.order.unwrap_or_default()
    }

    /// Validates everything that does not require resolving the interval.
    ///
    /// Runs before any document is collected, so a misconfigured request
    /// never causes shard work.
    pub fn validate(&self) -> crate::Result<()> {
        self.interval.validate()?;
        if self.min_doc_count() > 0 && self.extended_bounds.is_some() {
            return Err(AggregationError::ConfigConflict(
                "Cannot set min_doc_count and extended_bounds at the same time".to_string(),
            ));
        }
        if let (Some(hard_bounds), Some(extended_bounds)) = (self.hard_bounds, self.extended_bounds)
        {
            if extended_bounds.min < hard_bounds.min || extended_bounds.max > hard_bounds.max {
                return Err(AggregationError::ConfigConflict(format!(
                    "extended_bounds have to be inside hard_bounds, extended_bounds: \
                     {extended_bounds}, hard_bounds {hard_bounds}"
                )));
            }
        }
        if let Some(sub_aggregation) = &self.sub_aggregation {
            sub_aggregation.validate()?;
        }
        Ok(())
    }

    /// The rounding of this request, with the zone taken from `time_zone`.
    pub fn rounding(&self, deprecations: &DeprecationLog) -> crate::Result<Rounding> {
        let zone = FixedTimeZone::parse(self.time_zone.as_deref().unwrap_or("UTC"))?;
        self.rounding_in(Arc::new(zone), deprecations)
    }

    /// The rounding of this request in an injected zone, for zones whose
    /// offset varies with the instant.
    pub fn rounding_in(
        &self,
        zone: Arc<dyn UtcOffsetLookup>,
        deprecations: &DeprecationLog,
    ) -> crate::Result<Rounding> {
        let interval = self.interval.resolve(deprecations)?;
        let mut rounding = Rounding::new(interval, zone);
        if let Some(offset) = &self.offset {
            rounding = rounding.with_grid_offset(parse_offset(offset)?);
        }
        Ok(rounding)
    }
}

/// Extended or hard bounds of a date histogram, in epoch milliseconds.
///
/// Deserializes from millisecond numbers or date strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateBounds {
    /// The lower bound.
    #[serde(deserialize_with = "deserialize_date_or_millis")]
    pub min: i64,
    /// The upper bound.
    #[serde(deserialize_with = "deserialize_date_or_millis")]
    pub max: i64,
}

impl Display for DateBounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("[{},{}]", self.min, self.max))
    }
}

impl DateBounds {
    pub(crate) fn contains(&self, value_millis: i64) -> bool {
        value_millis >= self.min && value_millis <= self.max
    }
}

fn deserialize_date_or_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where D: Deserializer<'de> {
    let value: serde_json::Value = Deserialize::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(date) => {
            parse_date(&date).map_err(|err| serde::de::Error::custom(err.to_string()))
        }
        other => other
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom("Invalid number format")),
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// The bucket property an ordering applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderTarget {
    /// Order by bucket key.
    Key,
    /// Order by document count, ties broken by key ascending.
    Count,
}

impl OrderTarget {
    fn as_str(&self) -> &'static str {
        match self {
            OrderTarget::Key => "_key",
            OrderTarget::Count => "_count",
        }
    }
}

/// Bucket ordering of the final histogram.
///
/// Serializes in the platform's single-entry map form, e.g.
/// `{ "_count": "desc" }`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketOrder {
    /// The property the buckets are sorted by.
    pub target: OrderTarget,
    /// The direction.
    pub order: Order,
}

impl Default for BucketOrder {
    fn default() -> Self {
        BucketOrder {
            target: OrderTarget::Key,
            order: Order::Asc,
        }
    }
}

impl Serialize for BucketOrder {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where S: serde::Serializer {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.target.as_str(), &self.order)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for BucketOrder {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where D: Deserializer<'de> {
        use serde::de::{self, MapAccess, Visitor};
        struct OrderVisitor;

        impl<'de> Visitor<'de> for OrderVisitor {
            type Value = BucketOrder;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a map like {\"_key\": \"asc\"} or {\"_count\": \"desc\"}")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where A: MapAccess<'de> {
                let (target, order): (String, Order) = map
                    .next_entry()?
                    .ok_or_else(|| de::Error::custom("expected one order entry"))?;
                let target = match target.as_str() {
                    "_key" => OrderTarget::Key,
                    "_count" => OrderTarget::Count,
                    other => {
                        return Err(de::Error::custom(format!("invalid order target [{other}]")))
                    }
                };
                Ok(BucketOrder { target, order })
            }
        }

        deserializer.deserialize_map(OrderVisitor)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn request_from_json() {
        let req: DateHistogramRequest = serde_json::from_value(json!({
            "field": "created_at",
            "calendar_interval": "month",
            "time_zone": "+01:00",
            "min_doc_count": 0,
            "order": { "_count": "desc" }
        }))
        .unwrap();
        assert_eq!(req.field, "created_at");
        assert_eq!(req.min_doc_count(), 0);
        assert_eq!(
            req.order(),
            BucketOrder {
                target: OrderTarget::Count,
                order: Order::Desc
            }
        );
        req.validate().unwrap();
    }

    #[test]
    fn request_json_roundtrip() {
        let req: DateHistogramRequest = serde_json::from_value(json!({
            "field": "date",
            "fixed_interval": "30d",
            "offset": "-4h",
            "keyed": true,
            "extended_bounds": { "min": 0, "max": 86_400_000 }
        }))
        .unwrap();
        let round: DateHistogramRequest =
            serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();
        assert_eq!(req, round);
    }

    #[test]
    fn bounds_accept_dates_and_millis() {
        let bounds: DateBounds = serde_json::from_value(json!({
            "min": "2015-01-01T00:00:00Z",
            "max": 1_420_156_800_000i64,
        }))
        .unwrap();
        assert_eq!(bounds.min, 1_420_070_400_000);
        assert_eq!(bounds.max, 1_420_156_800_000);
        assert!(bounds.contains(1_420_100_000_000));
        assert!(!bounds.contains(0));
    }

    #[test]
    fn min_doc_count_conflicts_with_extended_bounds() {
        let req: DateHistogramRequest = serde_json::from_value(json!({
            "field": "date",
            "fixed_interval": "1d",
            "min_doc_count": 2,
            "extended_bounds": { "min": 0, "max": 10 }
        }))
        .unwrap();
        let err = req.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot set min_doc_count and extended_bounds at the same time"
        );
    }

    #[test]
    fn extended_bounds_must_lie_inside_hard_bounds() {
        let req: DateHistogramRequest = serde_json::from_value(json!({
            "field": "date",
            "fixed_interval": "1d",
            "extended_bounds": { "min": 1, "max": 12 },
            "hard_bounds": { "min": 2, "max": 12 }
        }))
        .unwrap();
        let err = req.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "extended_bounds have to be inside hard_bounds, extended_bounds: [1,12], hard_bounds \
             [2,12]"
        );
    }

    #[test]
    fn conflicting_interval_options_are_rejected_before_collection() {
        let req: DateHistogramRequest = serde_json::from_value(json!({
            "field": "date",
            "interval": "day",
            "fixed_interval": "1d",
        }))
        .unwrap();
        let err = req.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot use [fixed_interval] with [interval] configuration option."
        );
    }

    #[test]
    fn rounding_honors_time_zone_and_offset() {
        let req: DateHistogramRequest = serde_json::from_value(json!({
            "field": "date",
            "fixed_interval": "1d",
            "time_zone": "bogus",
        }))
        .unwrap();
        let deprecations = DeprecationLog::default();
        assert!(req.rounding(&deprecations).is_err());

        let req: DateHistogramRequest = serde_json::from_value(json!({
            "field": "date",
            "fixed_interval": "1d",
            "offset": "3h",
        }))
        .unwrap();
        let rounding = req.rounding(&deprecations).unwrap();
        // 04:00 falls into the bucket that started at 03:00
        assert_eq!(
            rounding.round(4 * 3_600_000).unwrap(),
            3 * 3_600_000
        );
    }

    #[test]
    fn order_serde() {
        let order: BucketOrder = serde_json::from_value(json!({ "_key": "desc" })).unwrap();
        assert_eq!(order.target, OrderTarget::Key);
        assert_eq!(order.order, Order::Desc);
        assert_eq!(
            serde_json::to_value(order).unwrap(),
            json!({ "_key": "desc" })
        );
    }
}
