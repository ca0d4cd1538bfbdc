use chrono::{Datelike, NaiveDateTime, Timelike};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Calendar period a [`PeriodCounter`] accumulates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    pub const ALL: [Granularity; 5] = [
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
        Granularity::Year,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a period boundary is recognised.
///
/// `Component` compares only the bare calendar component (hour-of-day, day-of-month,
/// ISO week, month, year). A gap longer than one full unit between two readings
/// (e.g. no telegram for more than 24h on the hourly counter) lands on the same component
/// value and the rollover is missed.
///
/// `FullDate` keys on the complete calendar position and never misses a rollover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RolloverMode {
    #[default]
    Component,
    FullDate,
}

/// Derives the rollover key of `now` for the given granularity.
pub fn period_key(granularity: Granularity, now: NaiveDateTime, mode: RolloverMode) -> i64 {
    let date = now.date();
    match mode {
        RolloverMode::Component => match granularity {
            Granularity::Hour => now.hour() as i64,
            Granularity::Day => date.day() as i64,
            Granularity::Week => date.iso_week().week() as i64,
            Granularity::Month => date.month() as i64,
            Granularity::Year => date.year() as i64,
        },
        RolloverMode::FullDate => match granularity {
            Granularity::Hour => date.num_days_from_ce() as i64 * 24 + now.hour() as i64,
            Granularity::Day => date.num_days_from_ce() as i64,
            Granularity::Week => {
                let week = date.iso_week();
                week.year() as i64 * 100 + week.week() as i64
            }
            Granularity::Month => date.year() as i64 * 12 + date.month0() as i64,
            Granularity::Year => date.year() as i64,
        },
    }
}

/// Rounds to the three decimals every published and persisted value carries.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Consumption since the start of the current calendar period.
#[derive(Debug, Clone)]
pub struct PeriodCounter {
    granularity: Granularity,
    mode: RolloverMode,
    // None until seeded or until the first reading on a cold start
    baseline: Option<f64>,
    period_key: i64,
    current: f64,
}

impl PeriodCounter {
    /// Creates a counter whose current period is the one containing `now`.
    pub fn new(granularity: Granularity, now: NaiveDateTime, mode: RolloverMode) -> Self {
        Self {
            granularity,
            mode,
            baseline: None,
            period_key: period_key(granularity, now, mode),
            current: 0.0,
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Sets the baseline restored from persisted state. The stored period key is left
    /// alone, so a reading in the same period keeps measuring against this baseline.
    pub fn seed_baseline(&mut self, value: f64) {
        self.baseline = Some(value);
    }

    pub fn update(&mut self, reading: f64, now: NaiveDateTime) {
        let key = period_key(self.granularity, now, self.mode);
        if key != self.period_key || self.baseline.is_none() {
            self.baseline = Some(reading);
            self.period_key = key;
        }
        let baseline = self.baseline.unwrap_or(reading);
        self.current = round3(reading - baseline);
    }

    pub fn value(&self) -> f64 {
        round3(self.current)
    }

    /// `None` until the counter has been seeded or has seen a reading.
    pub fn baseline(&self) -> Option<f64> {
        self.baseline.map(round3)
    }

    pub fn baseline_value(&self) -> f64 {
        self.baseline().unwrap_or_default()
    }
}
