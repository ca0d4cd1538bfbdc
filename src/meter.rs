use chrono::NaiveDateTime;
use serde_derive::{Deserialize, Serialize};

use crate::period_counter::{Granularity, PeriodCounter, RolloverMode};

/// Period baselines of one meter as they are persisted. Missing fields load as 0.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterBaselines {
    pub hour: f64,
    pub day: f64,
    pub week: f64,
    pub month: f64,
    pub year: f64,
}

impl MeterBaselines {
    pub fn get(&self, granularity: Granularity) -> f64 {
        match granularity {
            Granularity::Hour => self.hour,
            Granularity::Day => self.day,
            Granularity::Week => self.week,
            Granularity::Month => self.month,
            Granularity::Year => self.year,
        }
    }

    pub fn set(&mut self, granularity: Granularity, value: f64) {
        let slot = match granularity {
            Granularity::Hour => &mut self.hour,
            Granularity::Day => &mut self.day,
            Granularity::Week => &mut self.week,
            Granularity::Month => &mut self.month,
            Granularity::Year => &mut self.year,
        };
        *slot = value;
    }
}

/// One monotonically increasing physical quantity, tracked over every period granularity.
#[derive(Debug, Clone)]
pub struct Meter {
    name: &'static str,
    latest_reading: Option<f64>,
    counters: [PeriodCounter; 5],
}

impl Meter {
    /// Creates the meter; when `baselines` is given every counter is seeded from it,
    /// otherwise each counter rebases to the first reading.
    pub fn new(
        name: &'static str,
        now: NaiveDateTime,
        mode: RolloverMode,
        baselines: Option<&MeterBaselines>,
    ) -> Self {
        let counters = Granularity::ALL.map(|granularity| {
            let mut counter = PeriodCounter::new(granularity, now, mode);
            if let Some(baselines) = baselines {
                counter.seed_baseline(baselines.get(granularity));
            }
            counter
        });
        Self {
            name,
            latest_reading: None,
            counters,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn latest_reading(&self) -> Option<f64> {
        self.latest_reading
    }

    pub fn update(&mut self, reading: f64, now: NaiveDateTime) {
        if let Some(previous) = self.latest_reading {
            if reading < previous {
                tracing::warn!(
                    meter = self.name,
                    previous,
                    reading,
                    "cumulative reading went down, period deltas will be negative"
                );
            }
        }
        self.latest_reading = Some(reading);
        for counter in &mut self.counters {
            counter.update(reading, now);
        }
    }

    pub fn period_value(&self, granularity: Granularity) -> f64 {
        self.counter(granularity).value()
    }

    pub fn period_baseline(&self, granularity: Granularity) -> f64 {
        self.counter(granularity).baseline_value()
    }

    /// Baselines worth persisting. A cold meter that has not seen a reading yet has none,
    /// and must cold-start again after a restart.
    pub fn baselines(&self) -> Option<MeterBaselines> {
        let mut baselines = MeterBaselines::default();
        for granularity in Granularity::ALL {
            baselines.set(granularity, self.counter(granularity).baseline()?);
        }
        Some(baselines)
    }

    fn counter(&self, granularity: Granularity) -> &PeriodCounter {
        // Counters are stored in Granularity::ALL order
        &self.counters[granularity as usize]
    }
}
