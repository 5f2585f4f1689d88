//! Bucket key computation.
//!
//! A [`Rounding`] maps timestamps to the start key of their enclosing bucket
//! and advances keys to the next bucket start, for both constant-width
//! intervals and calendar units of varying wall-clock length. Calendar
//! rounding happens in civil time of the configured zone, so month, quarter
//! and year boundaries as well as DST shifts land where the calendar puts
//! them, not on a fixed grid.

use std::fmt;
use std::sync::Arc;

use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::date::{datetime_from_epoch_millis, epoch_millis};
use crate::error::AggregationError;
use crate::interval::{CalendarUnit, ResolvedInterval};

/// Earliest representable key, `-9999-01-01T00:00:00.000Z`.
pub(crate) const MIN_EPOCH_MILLIS: i64 = -377_705_116_800_000;
/// Latest representable key, `9999-12-31T23:59:59.999Z`.
pub(crate) const MAX_EPOCH_MILLIS: i64 = 253_402_300_799_999;

/// Offset rules of the time zone a histogram is computed in.
///
/// The timezone database is not part of this crate. [`FixedTimeZone`] covers
/// UTC and constant offsets; zones whose offset depends on the instant (DST)
/// implement this trait on top of whatever tz data the embedding platform
/// ships, which also keeps DST edge cases mockable in tests.
pub trait UtcOffsetLookup: Send + Sync {
    /// The UTC offset in effect at `epoch_millis`.
    fn offset_at(&self, epoch_millis: i64) -> UtcOffset;
}

/// A time zone with a constant UTC offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedTimeZone(UtcOffset);

impl FixedTimeZone {
    /// The UTC zone.
    pub const UTC: FixedTimeZone = FixedTimeZone(UtcOffset::UTC);

    /// Zone with the given constant offset.
    pub fn from_offset(offset: UtcOffset) -> FixedTimeZone {
        FixedTimeZone(offset)
    }

    /// Parses `UTC`, `Z` or a fixed `±HH:MM` offset.
    pub fn parse(value: &str) -> crate::Result<FixedTimeZone> {
        if value.eq_ignore_ascii_case("utc") || value == "Z" {
            return Ok(FixedTimeZone::UTC);
        }
        let format = time::macros::format_description!(
            "[offset_hour sign:mandatory]:[offset_minute]"
        );
        UtcOffset::parse(value, format)
            .map(FixedTimeZone)
            .map_err(|_err| {
                AggregationError::InvalidInterval(format!(
                    "Unable to parse time zone [{value}], expected [UTC] or a fixed [+HH:MM] \
                     offset"
                ))
            })
    }
}

impl UtcOffsetLookup for FixedTimeZone {
    fn offset_at(&self, _epoch_millis: i64) -> UtcOffset {
        self.0
    }
}

/// Maps timestamps to bucket keys for one resolved interval, time zone and
/// grid offset. Immutable once built; [`round`](Rounding::round) and
/// [`next_key`](Rounding::next_key) are pure and idempotent in the sense
/// that `round(round(t)) == round(t)`.
#[derive(Clone)]
pub struct Rounding {
    interval: ResolvedInterval,
    zone: Arc<dyn UtcOffsetLookup>,
    /// Shifts the bucket grid: `round(t) = round_unshifted(t - offset) + offset`.
    grid_offset: i64,
}

impl fmt::Debug for Rounding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rounding")
            .field("interval", &self.interval)
            .field("grid_offset", &self.grid_offset)
            .finish()
    }
}

impl Rounding {
    /// Rounding in the given zone.
    pub fn new(interval: ResolvedInterval, zone: Arc<dyn UtcOffsetLookup>) -> Rounding {
        Rounding {
            interval,
            zone,
            grid_offset: 0,
        }
    }

    /// Rounding in UTC.
    pub fn utc(interval: ResolvedInterval) -> Rounding {
        Rounding::new(interval, Arc::new(FixedTimeZone::UTC))
    }

    /// Shift the bucket grid by `offset_millis`.
    pub fn with_grid_offset(mut self, offset_millis: i64) -> Rounding {
        self.grid_offset = offset_millis;
        self
    }

    /// The start key of the bucket enclosing `timestamp_millis`.
    pub fn round(&self, timestamp_millis: i64) -> crate::Result<i64> {
        check_range(timestamp_millis)?;
        let shifted = timestamp_millis
            .checked_sub(self.grid_offset)
            .ok_or(AggregationError::RoundingOverflow(timestamp_millis))?;
        let key = match self.interval {
            ResolvedInterval::Fixed { millis } => self.round_fixed(shifted, millis)?,
            ResolvedInterval::Calendar(unit) => self.round_calendar(shifted, unit)?,
        };
        let key = key
            .checked_add(self.grid_offset)
            .ok_or(AggregationError::RoundingOverflow(timestamp_millis))?;
        check_range(key)?;
        Ok(key)
    }

    /// The start key of the bucket following the one starting at
    /// `key_millis`.
    pub fn next_key(&self, key_millis: i64) -> crate::Result<i64> {
        check_range(key_millis)?;
        let next = match self.interval {
            ResolvedInterval::Fixed { millis } => add_millis(key_millis, millis as i128)?,
            ResolvedInterval::Calendar(unit) => match unit {
                CalendarUnit::Second => add_millis(key_millis, 1_000)?,
                CalendarUnit::Minute => add_millis(key_millis, 60_000)?,
                CalendarUnit::Hour => add_millis(key_millis, 3_600_000)?,
                CalendarUnit::Day => self.advance_civil(key_millis, CivilStep::Days(1))?,
                CalendarUnit::Week => self.advance_civil(key_millis, CivilStep::Days(7))?,
                CalendarUnit::Month => self.advance_civil(key_millis, CivilStep::Months(1))?,
                CalendarUnit::Quarter => self.advance_civil(key_millis, CivilStep::Months(3))?,
                CalendarUnit::Year => self.advance_civil(key_millis, CivilStep::Months(12))?,
            },
        };
        check_range(next)?;
        Ok(next)
    }

    fn round_fixed(&self, timestamp_millis: i64, interval_millis: u64) -> crate::Result<i64> {
        let offset_millis = i64::from(self.zone.offset_at(timestamp_millis).whole_seconds()) * 1000;
        let local = timestamp_millis as i128 + offset_millis as i128;
        let floored = local.div_euclid(interval_millis as i128) * interval_millis as i128;
        i64::try_from(floored - offset_millis as i128)
            .map_err(|_err| AggregationError::RoundingOverflow(timestamp_millis))
    }

    fn round_calendar(&self, timestamp_millis: i64, unit: CalendarUnit) -> crate::Result<i64> {
        let offset = self.zone.offset_at(timestamp_millis);
        let local = datetime_from_epoch_millis(timestamp_millis)?.to_offset(offset);
        let truncated = truncate_to_unit(local, unit)
            .ok_or(AggregationError::RoundingOverflow(timestamp_millis))?;
        self.resolve_local(truncated, offset)
    }

    /// Advance `key_millis` by one calendar step in local civil time and
    /// convert back to an instant.
    fn advance_civil(&self, key_millis: i64, step: CivilStep) -> crate::Result<i64> {
        let offset = self.zone.offset_at(key_millis);
        let local = datetime_from_epoch_millis(key_millis)?.to_offset(offset);
        let advanced = match step {
            CivilStep::Days(days) => local.date().checked_add(Duration::days(days)),
            CivilStep::Months(months) => add_months(local.date(), months),
        }
        .ok_or(AggregationError::RoundingOverflow(key_millis))?;
        self.resolve_local(PrimitiveDateTime::new(advanced, local.time()), offset)
    }

    /// The offset the formatted representation of `key_millis` renders in.
    pub(crate) fn display_offset(&self, key_millis: i64) -> UtcOffset {
        self.zone.offset_at(key_millis)
    }

    /// Convert local civil time back to an instant. The offset in effect at
    /// the result may differ from the one the civil time was derived with
    /// (the truncation or step may have crossed a DST transition), so the
    /// lookup is re-applied until it agrees. Two passes settle any zone
    /// whose offset is piecewise constant.
    fn resolve_local(&self, civil: PrimitiveDateTime, hint: UtcOffset) -> crate::Result<i64> {
        let mut offset = hint;
        for _ in 0..2 {
            let candidate = epoch_millis(civil.assume_offset(offset));
            let effective = self.zone.offset_at(candidate);
            if effective == offset {
                return Ok(candidate);
            }
            offset = effective;
        }
        Ok(epoch_millis(civil.assume_offset(offset)))
    }
}

enum CivilStep {
    Days(i64),
    Months(i32),
}

fn check_range(millis: i64) -> crate::Result<()> {
    if !(MIN_EPOCH_MILLIS..=MAX_EPOCH_MILLIS).contains(&millis) {
        return Err(AggregationError::RoundingOverflow(millis));
    }
    Ok(())
}

fn add_millis(key_millis: i64, amount: i128) -> crate::Result<i64> {
    i64::try_from(key_millis as i128 + amount)
        .map_err(|_err| AggregationError::RoundingOverflow(key_millis))
}

fn truncate_to_unit(local: OffsetDateTime, unit: CalendarUnit) -> Option<PrimitiveDateTime> {
    let date = local.date();
    let time = local.time();
    let (hour, minute, second) = time.as_hms();
    let truncated = match unit {
        CalendarUnit::Second => {
            PrimitiveDateTime::new(date, Time::from_hms(hour, minute, second).ok()?)
        }
        CalendarUnit::Minute => PrimitiveDateTime::new(date, Time::from_hms(hour, minute, 0).ok()?),
        CalendarUnit::Hour => PrimitiveDateTime::new(date, Time::from_hms(hour, 0, 0).ok()?),
        CalendarUnit::Day => date.midnight(),
        CalendarUnit::Week => {
            let days_into_week = i64::from(date.weekday().number_days_from_monday());
            date.checked_sub(Duration::days(days_into_week))?.midnight()
        }
        CalendarUnit::Month => Date::from_calendar_date(date.year(), date.month(), 1)
            .ok()?
            .midnight(),
        CalendarUnit::Quarter => {
            Date::from_calendar_date(date.year(), quarter_start(date.month()), 1)
                .ok()?
                .midnight()
        }
        CalendarUnit::Year => Date::from_calendar_date(date.year(), Month::January, 1)
            .ok()?
            .midnight(),
    };
    Some(truncated)
}

fn quarter_start(month: Month) -> Month {
    match month {
        Month::January | Month::February | Month::March => Month::January,
        Month::April | Month::May | Month::June => Month::April,
        Month::July | Month::August | Month::September => Month::July,
        Month::October | Month::November | Month::December => Month::October,
    }
}

/// Calendar month arithmetic, clamping the day of month to the target
/// month's length (Jan 31 + 1 month = Feb 28/29).
fn add_months(date: Date, months: i32) -> Option<Date> {
    let zero_based =
        i64::from(date.year()) * 12 + i64::from(u8::from(date.month())) - 1 + i64::from(months);
    let year = i32::try_from(zero_based.div_euclid(12)).ok()?;
    let month = Month::try_from((zero_based.rem_euclid(12) + 1) as u8).ok()?;
    let day = date.day().min(time::util::days_in_year_month(year, month));
    Date::from_calendar_date(year, month, day).ok()
}
