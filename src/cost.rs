//! Relay cost accounting
//!
//! The provider bills in whole units (one minute by default). Elapsed time is
//! measured from instance creation and rounded up to the next unit.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::time::Duration;

/// Minutes billed for an instance alive from `start` to `end`
///
/// With a one-minute unit this is `ceil((end - start) / 60s)`. A non-positive span bills nothing.
pub fn billable_minutes(start: DateTime<Utc>, end: DateTime<Utc>, unit: Duration) -> i64 {
    let elapsed_ms = (end - start).num_milliseconds();
    let unit_ms = i64::try_from(unit.as_millis()).unwrap_or(i64::MAX).max(1);
    if elapsed_ms <= 0 {
        return 0;
    }
    let units = (elapsed_ms + unit_ms - 1) / unit_ms;
    let billed_ms = units.saturating_mul(unit_ms);
    (billed_ms + 59_999) / 60_000
}

/// Cost of `minutes` at an hourly rate
pub fn cost_for_minutes(minutes: i64, hourly_rate: f64) -> f64 {
    minutes as f64 / 60.0 * hourly_rate
}

/// First instant of the calendar month containing `now` (UTC)
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Billing parameters for one instance plan
#[derive(Clone, Copy, Debug)]
pub struct CostAccountant {
    hourly_rate: f64,
    unit: Duration,
}

impl CostAccountant {
    /// Create an accountant for a plan
    pub fn new(hourly_rate: f64, unit: Duration) -> Self {
        Self { hourly_rate, unit }
    }

    /// Minutes billed between two instants
    pub fn minutes(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
        billable_minutes(start, end, self.unit)
    }

    /// Cost of a lease alive between two instants
    pub fn cost(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
        cost_for_minutes(self.minutes(start, end), self.hourly_rate)
    }

    /// Cost of a number of already-billed minutes
    pub fn cost_of(&self, minutes: i64) -> f64 {
        cost_for_minutes(minutes, self.hourly_rate)
    }
}
