use chrono::NaiveDateTime;

use crate::period_counter::round3;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Instantaneous gas delivery rate (per hour), recomputed at most once per rate interval.
///
/// Gas meters report a new cumulative value only every few minutes, so a slope taken
/// between consecutive telegrams is mostly zero with the odd spike. The tracker instead
/// measures the delta over one whole interval and scales it to an hourly rate.
#[derive(Debug, Clone, Default)]
pub struct GasRateTracker {
    last_reading: Option<f64>,
    last_rate_computed_at: Option<NaiveDateTime>,
    current_rate: f64,
}

impl GasRateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, reading: f64, now: NaiveDateTime, rate_interval_seconds: u64) {
        let (Some(last_reading), Some(computed_at)) =
            (self.last_reading, self.last_rate_computed_at)
        else {
            self.last_reading = Some(reading);
            self.last_rate_computed_at = Some(now);
            return;
        };

        let interval = rate_interval_seconds.max(1);
        let elapsed = (now - computed_at).num_seconds();
        if elapsed < interval as i64 {
            return;
        }

        self.current_rate =
            round3((reading - last_reading) * (SECONDS_PER_HOUR / interval as f64));
        if self.current_rate < 0.0 {
            tracing::warn!(rate = self.current_rate, "gas reading went down");
        }
        self.last_reading = Some(reading);
        self.last_rate_computed_at = Some(now);
    }

    pub fn rate(&self) -> f64 {
        self.current_rate
    }
}
