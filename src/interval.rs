//! Interval configuration of a date histogram request and its resolution
//! into exactly one rounding family.
//!
//! Three mutually exclusive options exist: the deprecated legacy `interval`,
//! a `calendar_interval` and a `fixed_interval`. The legacy option is kept
//! for compatibility and resolves to one of the two others via the
//! historical keyword mapping.

use std::sync::{Arc, Mutex, PoisonError};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::AggregationError;

pub(crate) const DEPRECATED_INTERVAL_MESSAGE: &str = "[interval] on [date_histogram] is \
     deprecated, use [fixed_interval] or [calendar_interval] in the future.";

/// Per-execution record of deprecation warnings.
///
/// Cloning shares the underlying record, so a warning triggered by several
/// aggregators of one query execution is emitted exactly once. Warnings go
/// to the `log` facade and stay readable for response headers and tests.
#[derive(Clone, Default)]
pub struct DeprecationLog {
    seen: Arc<Mutex<Vec<String>>>,
}

impl DeprecationLog {
    /// Record `message`, logging it on first sight within this execution.
    pub fn deprecated(&self, message: &str) {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if !seen.iter().any(|prior| prior == message) {
            warn!("{message}");
            seen.push(message.to_string());
        }
    }

    /// All distinct warnings recorded so far.
    pub fn warnings(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A calendar unit of variable wall-clock length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarUnit {
    /// One civil second.
    Second,
    /// One civil minute.
    Minute,
    /// One civil hour.
    Hour,
    /// One civil day, midnight to midnight in the histogram's time zone.
    Day,
    /// One ISO-8601 week, starting Monday.
    Week,
    /// One civil month.
    Month,
    /// One quarter, starting Jan/Apr/Jul/Oct 1.
    Quarter,
    /// One civil year.
    Year,
}

impl CalendarUnit {
    /// Matches the bare unit names, case-insensitively.
    fn from_name(value: &str) -> Option<CalendarUnit> {
        match value.to_ascii_lowercase().as_str() {
            "second" => Some(CalendarUnit::Second),
            "minute" => Some(CalendarUnit::Minute),
            "hour" => Some(CalendarUnit::Hour),
            "day" => Some(CalendarUnit::Day),
            "week" => Some(CalendarUnit::Week),
            "month" => Some(CalendarUnit::Month),
            "quarter" => Some(CalendarUnit::Quarter),
            "year" => Some(CalendarUnit::Year),
            _ => None,
        }
    }

    /// Matches everything `calendar_interval` accepts: the bare names plus
    /// the canonical one-unit short forms. The short forms are case
    /// sensitive (`1M` is a month, `1m` a minute).
    fn from_calendar_keyword(value: &str) -> Option<CalendarUnit> {
        match value {
            "1s" => Some(CalendarUnit::Second),
            "1m" => Some(CalendarUnit::Minute),
            "1h" => Some(CalendarUnit::Hour),
            "1d" => Some(CalendarUnit::Day),
            "1w" => Some(CalendarUnit::Week),
            "1M" => Some(CalendarUnit::Month),
            "1q" => Some(CalendarUnit::Quarter),
            "1y" => Some(CalendarUnit::Year),
            _ => CalendarUnit::from_name(value),
        }
    }
}

/// A fully resolved interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolvedInterval {
    /// Variable-length unit, rounded on the civil calendar.
    Calendar(CalendarUnit),
    /// Constant duration.
    Fixed {
        /// Whole, positive bucket width in milliseconds.
        millis: u64,
    },
}

/// Value of the legacy `interval` option.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LegacyInterval {
    /// Interval in milliseconds.
    Millis(u64),
    /// Interval expression, either a calendar keyword (`"month"`) or a
    /// duration with a multiplier (`"5d"`).
    Expression(String),
}

/// Interval configuration of a date histogram.
///
/// At most one of the three options may be set; setting a second one fails
/// with a [`ConfigConflict`](AggregationError::ConfigConflict) naming the
/// rejected and the present option, in either order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IntervalSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<LegacyInterval>,
    #[serde(skip_serializing_if = "Option::is_none")]
    calendar_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fixed_interval: Option<String>,
}

impl IntervalSpec {
    /// Set the legacy `interval` option to a millisecond value.
    pub fn set_interval_millis(&mut self, millis: u64) -> crate::Result<()> {
        if millis < 1 {
            return Err(AggregationError::InvalidInterval(
                "[interval] must be 1 or greater for aggregation [date_histogram]".to_string(),
            ));
        }
        self.set_legacy(LegacyInterval::Millis(millis))
    }

    /// Set the legacy `interval` option to an interval expression.
    pub fn set_interval(&mut self, expression: &str) -> crate::Result<()> {
        self.set_legacy(LegacyInterval::Expression(expression.to_string()))
    }

    fn set_legacy(&mut self, value: LegacyInterval) -> crate::Result<()> {
        if self.calendar_interval.is_some() || self.fixed_interval.is_some() {
            return Err(AggregationError::ConfigConflict(
                "Cannot use [interval] with [fixed_interval] or [calendar_interval] \
                 configuration options."
                    .to_string(),
            ));
        }
        self.interval = Some(value);
        Ok(())
    }

    /// Set the `calendar_interval` option.
    pub fn set_calendar_interval(&mut self, value: &str) -> crate::Result<()> {
        if let Some(existing) = self.existing_option_other_than("calendar_interval") {
            return Err(conflict("calendar_interval", existing));
        }
        self.calendar_interval = Some(value.to_string());
        Ok(())
    }

    /// Set the `fixed_interval` option.
    pub fn set_fixed_interval(&mut self, value: &str) -> crate::Result<()> {
        if let Some(existing) = self.existing_option_other_than("fixed_interval") {
            return Err(conflict("fixed_interval", existing));
        }
        self.fixed_interval = Some(value.to_string());
        Ok(())
    }

    fn existing_option_other_than(&self, attempted: &str) -> Option<&'static str> {
        if self.interval.is_some() {
            return Some("interval");
        }
        if self.calendar_interval.is_some() && attempted != "calendar_interval" {
            return Some("calendar_interval");
        }
        if self.fixed_interval.is_some() && attempted != "fixed_interval" {
            return Some("fixed_interval");
        }
        None
    }

    /// Validates a configuration that arrived through deserialization,
    /// where the setters could not intercept conflicting options.
    pub fn validate(&self) -> crate::Result<()> {
        let set = [
            self.interval.is_some(),
            self.calendar_interval.is_some(),
            self.fixed_interval.is_some(),
        ]
        .iter()
        .filter(|option| **option)
        .count();
        if set > 1 {
            if self.interval.is_some() {
                let attempted = if self.fixed_interval.is_some() {
                    "fixed_interval"
                } else {
                    "calendar_interval"
                };
                return Err(conflict(attempted, "interval"));
            }
            return Err(conflict("fixed_interval", "calendar_interval"));
        }
        Ok(())
    }

    /// Resolve the configuration into exactly one interval family.
    ///
    /// Legacy use records the deprecation warning once per execution.
    pub fn resolve(&self, deprecations: &DeprecationLog) -> crate::Result<ResolvedInterval> {
        self.validate()?;
        if let Some(legacy) = &self.interval {
            deprecations.deprecated(DEPRECATED_INTERVAL_MESSAGE);
            return resolve_legacy(legacy);
        }
        if let Some(calendar) = &self.calendar_interval {
            return CalendarUnit::from_calendar_keyword(calendar)
                .map(ResolvedInterval::Calendar)
                .ok_or_else(|| {
                    AggregationError::InvalidInterval(format!(
                        "The supplied interval [{calendar}] could not be parsed as a calendar \
                         interval."
                    ))
                });
        }
        if let Some(fixed) = &self.fixed_interval {
            let millis = parse_into_milliseconds(fixed)
                .map_err(|err| time_value_error("date_histogram.fixedInterval", fixed, err))?;
            return fixed_from_millis(millis);
        }
        Err(AggregationError::InvalidInterval(
            "Invalid interval specified, must be non-null and non-empty".to_string(),
        ))
    }
}

fn conflict(attempted: &str, existing: &str) -> AggregationError {
    AggregationError::ConfigConflict(format!(
        "Cannot use [{attempted}] with [{existing}] configuration option."
    ))
}

fn fixed_from_millis(millis: u64) -> crate::Result<ResolvedInterval> {
    if millis == 0 {
        return Err(AggregationError::InvalidInterval(
            "Zero or negative time interval not supported".to_string(),
        ));
    }
    Ok(ResolvedInterval::Fixed { millis })
}

fn resolve_legacy(legacy: &LegacyInterval) -> crate::Result<ResolvedInterval> {
    match legacy {
        LegacyInterval::Millis(millis) => fixed_from_millis(*millis),
        LegacyInterval::Expression(expression) => {
            // Bare calendar names keep their historical calendar semantics,
            // multiplied expressions ("5d") are durations.
            if let Some(unit) = CalendarUnit::from_name(expression) {
                return Ok(ResolvedInterval::Calendar(unit));
            }
            match parse_into_milliseconds(expression) {
                Ok(millis) if millis > 0 => Ok(ResolvedInterval::Fixed { millis }),
                _ => Err(AggregationError::InvalidInterval(format!(
                    "Unable to parse interval [{expression}]"
                ))),
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
/// Errors when parsing a duration expression.
pub(crate) enum TimeValueParseError {
    /// Unit not recognized in passed String.
    UnitNotRecognized(String),
    /// Number not found in passed String.
    NumberMissing(String),
    /// Unit not found in passed String.
    UnitMissing(String),
}

fn time_value_error(setting: &str, value: &str, err: TimeValueParseError) -> AggregationError {
    let reason = match err {
        TimeValueParseError::UnitMissing(_) | TimeValueParseError::UnitNotRecognized(_) => {
            ": unit is missing or unrecognized"
        }
        TimeValueParseError::NumberMissing(_) => "",
    };
    AggregationError::InvalidInterval(format!(
        "failed to parse setting [{setting}] with value [{value}] as a time value{reason}"
    ))
}

pub(crate) fn parse_into_milliseconds(input: &str) -> Result<u64, TimeValueParseError> {
    let split_boundary = input
        .as_bytes()
        .iter()
        .take_while(|byte| byte.is_ascii_digit())
        .count();
    let (number, unit) = input.split_at(split_boundary);
    if number.is_empty() {
        return Err(TimeValueParseError::NumberMissing(input.to_string()));
    }
    if unit.is_empty() {
        return Err(TimeValueParseError::UnitMissing(input.to_string()));
    }
    let number: u64 = number
        .parse()
        .map_err(|_err| TimeValueParseError::NumberMissing(input.to_string()))?;

    let multiplier_from_unit = match unit {
        "ms" => 1,
        "s" => 1000,
        "m" => 60 * 1000,
        "h" => 60 * 60 * 1000,
        "d" => 24 * 60 * 60 * 1000,
        _ => return Err(TimeValueParseError::UnitNotRecognized(unit.to_string())),
    };

    Ok(number * multiplier_from_unit)
}

/// Parses a signed grid offset expression like `"1h"` or `"-30m"` into
/// milliseconds.
pub(crate) fn parse_offset(value: &str) -> crate::Result<i64> {
    let (sign, expression) = match value.as_bytes().first() {
        Some(b'-') => (-1i64, &value[1..]),
        Some(b'+') => (1i64, &value[1..]),
        _ => (1i64, value),
    };
    let millis = parse_into_milliseconds(expression)
        .map_err(|err| time_value_error("date_histogram.offset", value, err))?;
    Ok(sign * millis as i64)
}
