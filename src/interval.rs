//! Interval & time bucketing
//!
//! An [`Interval`] is a fixed-width, epoch-aligned bucket size such as
//! `1day` or `2day`. Bucket boundaries are computed by Euclidean division of
//! the timestamp by the bucket width, so any two intervals whose widths
//! divide each other share boundaries over the whole time line.
//!
//! # Example
//!
//! ```rust
//! use kuba_rollup::interval::Interval;
//!
//! let day = Interval::parse("1day").unwrap();
//! let two_days = Interval::parse("2 days").unwrap();
//!
//! assert!(two_days.is_multiple_of(&day));
//! assert_eq!(day.fine_buckets_per(&two_days), Some(2));
//!
//! let cursor = day.span(86_400 * 3 + 15);
//! assert_eq!(cursor.current(), 86_400 * 3);
//! assert_eq!(cursor.previous().current(), 86_400 * 2);
//! assert_eq!(cursor.next().current(), 86_400 * 4);
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::clock::Clock;
use crate::error::ValidationError;
use crate::types::Timestamp;

/// Unit an interval is counted in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    /// One second
    Second,
    /// 60 seconds
    Minute,
    /// 3 600 seconds
    Hour,
    /// 86 400 seconds
    Day,
    /// 604 800 seconds
    Week,
}

impl TimeUnit {
    /// Width of one unit in seconds
    pub const fn seconds(self) -> i64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3_600,
            TimeUnit::Day => 86_400,
            TimeUnit::Week => 604_800,
        }
    }

    fn name(self) -> &'static str {
        match self {
            TimeUnit::Second => "second",
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        let unit = match name.to_ascii_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => TimeUnit::Second,
            "m" | "min" | "minute" | "minutes" => TimeUnit::Minute,
            "h" | "hour" | "hours" => TimeUnit::Hour,
            "d" | "day" | "days" => TimeUnit::Day,
            "w" | "week" | "weeks" => TimeUnit::Week,
            _ => return None,
        };
        Some(unit)
    }
}

/// Fixed-width bucket size: `unit_count` × `unit`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    unit_count: u32,
    unit: TimeUnit,
}

impl Interval {
    /// Create an interval; `unit_count` must be positive
    pub fn new(unit_count: u32, unit: TimeUnit) -> Result<Self, ValidationError> {
        if unit_count == 0 {
            return Err(ValidationError::InvalidInterval(
                "unit count must be positive".to_string(),
            ));
        }
        Ok(Self { unit_count, unit })
    }

    /// `n` days
    pub fn days(n: u32) -> Result<Self, ValidationError> {
        Self::new(n, TimeUnit::Day)
    }

    /// `n` hours
    pub fn hours(n: u32) -> Result<Self, ValidationError> {
        Self::new(n, TimeUnit::Hour)
    }

    /// `n` minutes
    pub fn minutes(n: u32) -> Result<Self, ValidationError> {
        Self::new(n, TimeUnit::Minute)
    }

    /// Parse `<count><unit>`, e.g. `1day`, `2 days`, `15m`, `1week`
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(text.len());
        let (count, unit) = text.split_at(split);

        let unit_count: u32 = count.parse().map_err(|_| {
            ValidationError::InvalidInterval(format!("'{}' does not start with a count", text))
        })?;
        let unit = TimeUnit::from_name(unit.trim()).ok_or_else(|| {
            ValidationError::InvalidInterval(format!("'{}' has an unknown unit", text))
        })?;

        Self::new(unit_count, unit)
    }

    /// Number of units
    pub fn unit_count(&self) -> u32 {
        self.unit_count
    }

    /// Unit
    pub fn unit(&self) -> TimeUnit {
        self.unit
    }

    /// Bucket width in seconds
    pub fn width(&self) -> i64 {
        self.unit_count as i64 * self.unit.seconds()
    }

    /// Start of the bucket containing `t`
    ///
    /// Overflows for the first partial bucket below `i64::MIN`; use
    /// [`Interval::checked_span_start`] for caller-supplied timestamps.
    pub fn span_start(&self, t: Timestamp) -> Timestamp {
        let width = self.width();
        t.div_euclid(width) * width
    }

    /// Start of the bucket containing `t`, or `None` when that start is not
    /// representable as a [`Timestamp`]
    pub fn checked_span_start(&self, t: Timestamp) -> Option<Timestamp> {
        let width = self.width();
        t.div_euclid(width).checked_mul(width)
    }

    /// Index of the bucket containing `t`, counted from the epoch
    pub fn bucket_index(&self, t: Timestamp) -> i64 {
        t.div_euclid(self.width())
    }

    /// Cursor positioned on the bucket containing `t`
    pub fn span(&self, t: Timestamp) -> SpanCursor {
        SpanCursor {
            start: self.span_start(t),
            width: self.width(),
        }
    }

    /// Cursor on the bucket containing `t`, if its start is representable
    pub fn checked_span(&self, t: Timestamp) -> Option<SpanCursor> {
        Some(SpanCursor {
            start: self.checked_span_start(t)?,
            width: self.width(),
        })
    }

    /// Cursor positioned on the bucket containing the clock's now
    pub fn span_current(&self, clock: &dyn Clock) -> SpanCursor {
        self.span(clock.now())
    }

    /// Whether this interval's width is an exact multiple of `fine`'s width
    pub fn is_multiple_of(&self, fine: &Interval) -> bool {
        self.width() % fine.width() == 0
    }

    /// How many buckets of `self` compose one bucket of `coarse`
    pub fn fine_buckets_per(&self, coarse: &Interval) -> Option<usize> {
        if coarse.is_multiple_of(self) {
            Some((coarse.width() / self.width()) as usize)
        } else {
            None
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.unit_count, self.unit.name())
    }
}

impl FromStr for Interval {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::parse(s)
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Interval::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Position on a bucket grid
///
/// Navigation returns a new cursor; a cursor never changes after creation,
/// so cursors can be handed around and stepped independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanCursor {
    start: Timestamp,
    width: i64,
}

impl SpanCursor {
    /// Bucket start timestamp
    pub fn current(&self) -> Timestamp {
        self.start
    }

    /// Exclusive end of the bucket, saturating at `i64::MAX`
    pub fn end(&self) -> Timestamp {
        self.start.saturating_add(self.width)
    }

    /// Exclusive end of the bucket, if representable
    pub fn checked_end(&self) -> Option<Timestamp> {
        self.start.checked_add(self.width)
    }

    /// The bucket before this one
    #[must_use]
    pub fn previous(&self) -> SpanCursor {
        self.shift(-1)
    }

    /// The bucket after this one
    #[must_use]
    pub fn next(&self) -> SpanCursor {
        self.shift(1)
    }

    /// Move by `buckets` bucket widths (negative goes back)
    #[must_use]
    pub fn shift(&self, buckets: i64) -> SpanCursor {
        SpanCursor {
            start: self.start + buckets * self.width,
            width: self.width,
        }
    }

    /// Like [`SpanCursor::shift`], `None` when the target bucket start is
    /// outside the timestamp range
    pub fn checked_shift(&self, buckets: i64) -> Option<SpanCursor> {
        let start = buckets
            .checked_mul(self.width)
            .and_then(|offset| self.start.checked_add(offset))?;
        Some(SpanCursor {
            start,
            width: self.width,
        })
    }

    /// Whether `t` falls in this bucket
    pub fn contains(&self, t: Timestamp) -> bool {
        t >= self.start
            && t.checked_sub(self.start)
                .map_or(false, |offset| offset < self.width)
    }
}

/// RFC 3339 UTC label for a bucket start, e.g. `2024-03-01T00:00:00Z`
pub fn format_label(t: Timestamp) -> String {
    match DateTime::<Utc>::from_timestamp(t, 0) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => t.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const DAY: i64 = 86_400;

    #[test]
    fn test_parse_forms() {
        assert_eq!(Interval::parse("1day").unwrap(), Interval::days(1).unwrap());
        assert_eq!(Interval::parse("2 days").unwrap(), Interval::days(2).unwrap());
        assert_eq!(Interval::parse("15m").unwrap(), Interval::minutes(15).unwrap());
        assert_eq!(Interval::parse("1week").unwrap().width(), 7 * DAY);
        assert_eq!(Interval::parse(" 3hour ").unwrap().width(), 3 * 3_600);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Interval::parse("day").is_err());
        assert!(Interval::parse("0day").is_err());
        assert!(Interval::parse("1month").is_err());
        assert!(Interval::parse("").is_err());
    }

    #[test]
    fn test_display_round_trips_through_serde() {
        let two_days = Interval::days(2).unwrap();
        assert_eq!(two_days.to_string(), "2day");
        let json = serde_json::to_string(&two_days).unwrap();
        assert_eq!(json, "\"2day\"");
        let back: Interval = serde_json::from_str(&json).unwrap();
        assert_eq!(back, two_days);
    }

    #[test]
    fn test_span_start_is_epoch_aligned() {
        let two_days = Interval::days(2).unwrap();
        assert_eq!(two_days.span_start(0), 0);
        assert_eq!(two_days.span_start(2 * DAY - 1), 0);
        assert_eq!(two_days.span_start(2 * DAY), 2 * DAY);
        assert_eq!(two_days.span_start(-1), -2 * DAY);
        assert_eq!(two_days.bucket_index(5 * DAY), 2);
    }

    #[test]
    fn test_cursor_navigation_is_pure() {
        let day = Interval::days(1).unwrap();
        let cursor = day.span(10 * DAY + 5);
        let prev = cursor.previous();
        let next = cursor.next();

        assert_eq!(cursor.current(), 10 * DAY);
        assert_eq!(prev.current(), 9 * DAY);
        assert_eq!(next.current(), 11 * DAY);
        assert_eq!(prev.next(), cursor);
        assert_eq!(cursor.shift(-3).current(), 7 * DAY);
        assert!(cursor.contains(10 * DAY + DAY - 1));
        assert!(!cursor.contains(11 * DAY));
    }

    #[test]
    fn test_merge_compatibility() {
        let day = Interval::days(1).unwrap();
        let week = Interval::parse("1week").unwrap();
        let five_hours = Interval::hours(5).unwrap();

        assert!(week.is_multiple_of(&day));
        assert_eq!(day.fine_buckets_per(&week), Some(7));
        assert!(!day.is_multiple_of(&five_hours));
        assert_eq!(five_hours.fine_buckets_per(&day), None);
    }

    #[test]
    fn test_coarse_boundaries_align_with_fine() {
        let day = Interval::days(1).unwrap();
        let two_days = Interval::days(2).unwrap();
        for t in [0, 3 * DAY + 7, 17 * DAY - 1, 1_700_000_000] {
            let coarse = two_days.span_start(t);
            assert_eq!(day.span_start(coarse), coarse);
        }
    }

    #[test]
    fn test_checked_arithmetic_at_range_ends() {
        let day = Interval::days(1).unwrap();

        // i64::MIN sits inside a bucket that starts below the range
        assert_eq!(day.checked_span_start(i64::MIN), None);
        assert!(day.checked_span(i64::MIN).is_none());
        let lowest = day.checked_span_start(i64::MIN + DAY).unwrap();
        assert!(lowest > i64::MIN && lowest - i64::MIN < DAY);
        assert_eq!(day.span(lowest).checked_shift(-1), None);

        // The bucket holding i64::MAX starts in range but cannot be followed
        let top = day.checked_span(i64::MAX).unwrap();
        assert!(top.contains(i64::MAX));
        assert_eq!(top.checked_end(), None);
        assert_eq!(top.end(), i64::MAX);
        assert_eq!(top.checked_shift(1), None);
        assert_eq!(top.checked_shift(-2), Some(top.shift(-2)));
        assert_eq!(top.checked_shift(i64::MIN), None);
    }

    #[test]
    fn test_span_current() {
        let clock = ManualClock::new(3 * DAY + 100);
        let day = Interval::days(1).unwrap();
        assert_eq!(day.span_current(&clock).current(), 3 * DAY);
    }

    #[test]
    fn test_format_label() {
        assert_eq!(format_label(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_label(19_783 * DAY), "2024-03-01T00:00:00Z");
    }
}
