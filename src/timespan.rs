// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Time Spans
//!
//! A `TimeSpan` describes an interval as a combination of days, hours,
//! minutes, seconds and milliseconds. Scheduling converts it into a message
//! expiration and retry policies return it as the delay before the next
//! attempt.
//!
//! Two spans compare by their total length, so `{ seconds: 1 }` and
//! `{ milliseconds: 1000 }` are equal and `std::cmp::min` picks the shorter.

use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, time::Duration};

const MILLIS_PER_SECOND: u64 = 1_000;
const MILLIS_PER_MINUTE: u64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: u64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: u64 = 24 * MILLIS_PER_HOUR;

/// A time interval built from calendar-free units.
///
/// Every component is optional in practice and defaults to zero.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSpan {
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
    pub milliseconds: u64,
}

impl TimeSpan {
    pub fn from_days(days: u64) -> Self {
        TimeSpan {
            days,
            ..Default::default()
        }
    }

    pub fn from_hours(hours: u64) -> Self {
        TimeSpan {
            hours,
            ..Default::default()
        }
    }

    pub fn from_minutes(minutes: u64) -> Self {
        TimeSpan {
            minutes,
            ..Default::default()
        }
    }

    pub fn from_seconds(seconds: u64) -> Self {
        TimeSpan {
            seconds,
            ..Default::default()
        }
    }

    pub fn from_milliseconds(milliseconds: u64) -> Self {
        TimeSpan {
            milliseconds,
            ..Default::default()
        }
    }

    /// Sets the days component, replacing any previous value.
    pub fn days(mut self, days: u64) -> Self {
        self.days = days;
        self
    }

    /// Sets the hours component, replacing any previous value.
    pub fn hours(mut self, hours: u64) -> Self {
        self.hours = hours;
        self
    }

    /// Sets the minutes component, replacing any previous value.
    pub fn minutes(mut self, minutes: u64) -> Self {
        self.minutes = minutes;
        self
    }

    /// Sets the seconds component, replacing any previous value.
    pub fn seconds(mut self, seconds: u64) -> Self {
        self.seconds = seconds;
        self
    }

    /// Sets the milliseconds component, replacing any previous value.
    pub fn milliseconds(mut self, milliseconds: u64) -> Self {
        self.milliseconds = milliseconds;
        self
    }

    /// Returns the whole span expressed in milliseconds.
    ///
    /// Saturates instead of overflowing for absurdly large components.
    pub fn total_milliseconds(&self) -> u64 {
        self.days
            .saturating_mul(MILLIS_PER_DAY)
            .saturating_add(self.hours.saturating_mul(MILLIS_PER_HOUR))
            .saturating_add(self.minutes.saturating_mul(MILLIS_PER_MINUTE))
            .saturating_add(self.seconds.saturating_mul(MILLIS_PER_SECOND))
            .saturating_add(self.milliseconds)
    }
}

impl From<TimeSpan> for Duration {
    fn from(span: TimeSpan) -> Self {
        Duration::from_millis(span.total_milliseconds())
    }
}

impl From<Duration> for TimeSpan {
    fn from(duration: Duration) -> Self {
        TimeSpan::from_milliseconds(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}

impl PartialEq for TimeSpan {
    fn eq(&self, other: &Self) -> bool {
        self.total_milliseconds() == other.total_milliseconds()
    }
}

impl Eq for TimeSpan {}

impl PartialOrd for TimeSpan {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeSpan {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_milliseconds().cmp(&other.total_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_milliseconds_sums_every_component() {
        let span = TimeSpan::from_seconds(1).milliseconds(500);
        assert_eq!(span.total_milliseconds(), 1500);

        let span = TimeSpan::from_days(1).hours(2).minutes(3).seconds(4).milliseconds(5);
        assert_eq!(
            span.total_milliseconds(),
            86_400_000 + 7_200_000 + 180_000 + 4_000 + 5
        );
    }

    #[test]
    fn setters_replace_the_component() {
        let span = TimeSpan::from_seconds(30).seconds(5);
        assert_eq!(span.total_milliseconds(), 5_000);
    }

    #[test]
    fn empty_span_is_zero() {
        assert_eq!(TimeSpan::default().total_milliseconds(), 0);
    }

    #[test]
    fn min_and_max_compare_by_total_length() {
        let short = TimeSpan::from_seconds(90);
        let long = TimeSpan::from_minutes(2);

        assert_eq!(std::cmp::min(short, long).total_milliseconds(), 90_000);
        assert_eq!(std::cmp::max(short, long).total_milliseconds(), 120_000);
        assert_eq!(short.min(long), short);
    }

    #[test]
    fn spans_with_equal_length_are_equal() {
        assert_eq!(TimeSpan::from_seconds(1), TimeSpan::from_milliseconds(1000));
        assert_ne!(TimeSpan::from_seconds(1), TimeSpan::from_milliseconds(999));
    }

    #[test]
    fn converts_into_std_duration() {
        let duration: Duration = TimeSpan::from_minutes(1).seconds(5).into();
        assert_eq!(duration, Duration::from_secs(65));
    }

    #[test]
    fn deserializes_partial_spans() {
        let span: TimeSpan = serde_json::from_str(r#"{"seconds": 2}"#).unwrap();
        assert_eq!(span.total_milliseconds(), 2000);
    }
}
