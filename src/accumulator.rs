use chrono::NaiveDateTime;

use crate::error::MissingFieldError;
use crate::gas_rate::GasRateTracker;
use crate::meter::Meter;
use crate::period_counter::{round3, Granularity, RolloverMode};
use crate::state_store::Snapshot;
use crate::telegram::{Field, Telegram};

/// Billing-rate band an electricity reading accrues under. DSMR calls them tariff 1 and 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tariff {
    Low,
    High,
}

impl Tariff {
    pub const ALL: [Tariff; 2] = [Tariff::Low, Tariff::High];

    fn index(self) -> usize {
        match self {
            Tariff::Low => 0,
            Tariff::High => 1,
        }
    }
}

pub const ELECTRICITY_USED: [&str; 2] = ["electricity_delivered_1", "electricity_delivered_2"];
pub const ELECTRICITY_RETURNED: [&str; 2] = ["electricity_returned_1", "electricity_returned_2"];
pub const GAS: &str = "gas";

const USED_FIELDS: [Field; 2] = [Field::ElectricityUsedTariff1, Field::ElectricityUsedTariff2];
const RETURNED_FIELDS: [Field; 2] = [
    Field::ElectricityReturnedTariff1,
    Field::ElectricityReturnedTariff2,
];

/// All live consumption statistics of one P1 port: four electricity meters, the gas meter
/// and the gas rate. Every mutation goes through `&mut self`; the owner serialises access.
#[derive(Debug, Clone)]
pub struct ConsumptionAccumulator {
    electricity_used: [Meter; 2],
    electricity_returned: [Meter; 2],
    gas: Meter,
    gas_rate: GasRateTracker,
}

impl ConsumptionAccumulator {
    /// Builds the meters for the periods containing `now`, seeding each one whose record is
    /// present in `snapshot`.
    pub fn new(now: NaiveDateTime, mode: RolloverMode, snapshot: Option<&Snapshot>) -> Self {
        let meter = |name: &'static str| {
            Meter::new(name, now, mode, snapshot.and_then(|s| s.meter(name)))
        };
        Self {
            electricity_used: ELECTRICITY_USED.map(&meter),
            electricity_returned: ELECTRICITY_RETURNED.map(&meter),
            gas: meter(GAS),
            gas_rate: GasRateTracker::new(),
        }
    }

    pub fn on_electricity_used(&mut self, tariff: Tariff, reading: f64, now: NaiveDateTime) {
        self.electricity_used[tariff.index()].update(reading, now);
    }

    pub fn on_electricity_returned(&mut self, tariff: Tariff, reading: f64, now: NaiveDateTime) {
        self.electricity_returned[tariff.index()].update(reading, now);
    }

    pub fn on_gas_reading(&mut self, reading: f64, now: NaiveDateTime, rate_interval_seconds: u64) {
        self.gas.update(reading, now);
        self.gas_rate.update(reading, now, rate_interval_seconds);
    }

    /// Feeds every reading category of `telegram`. A category the telegram lacks is skipped
    /// and reported; the others are still applied.
    pub fn apply(
        &mut self,
        telegram: &Telegram,
        now: NaiveDateTime,
        rate_interval_seconds: u64,
    ) -> Vec<MissingFieldError> {
        let mut missing = Vec::new();

        for tariff in Tariff::ALL {
            match require(telegram, USED_FIELDS[tariff.index()]) {
                Ok(reading) => self.on_electricity_used(tariff, reading, now),
                Err(e) => missing.push(e),
            }
            match require(telegram, RETURNED_FIELDS[tariff.index()]) {
                Ok(reading) => self.on_electricity_returned(tariff, reading, now),
                Err(e) => missing.push(e),
            }
        }
        match require(telegram, Field::GasReading) {
            Ok(reading) => self.on_gas_reading(reading, now, rate_interval_seconds),
            Err(e) => missing.push(e),
        }

        missing
    }

    pub fn gas_today(&self) -> f64 {
        self.gas.period_value(Granularity::Day)
    }

    pub fn gas_current_rate(&self) -> f64 {
        self.gas_rate.rate()
    }

    pub fn electricity_used_today(&self) -> f64 {
        day_total(&self.electricity_used)
    }

    pub fn electricity_returned_today(&self) -> f64 {
        day_total(&self.electricity_returned)
    }

    pub fn meters(&self) -> impl Iterator<Item = &Meter> {
        self.electricity_used
            .iter()
            .chain(self.electricity_returned.iter())
            .chain(std::iter::once(&self.gas))
    }

    /// Current baselines stamped with `now`. Meters still waiting for their first reading
    /// are left out.
    pub fn snapshot(&self, now: NaiveDateTime) -> Snapshot {
        let mut snapshot = Snapshot::new(now);
        for meter in self.meters() {
            if let Some(baselines) = meter.baselines() {
                snapshot.set_meter(meter.name(), baselines);
            }
        }
        snapshot
    }
}

fn require(telegram: &Telegram, field: Field) -> Result<f64, MissingFieldError> {
    telegram.number(field).ok_or(MissingFieldError(field))
}

fn day_total(meters: &[Meter; 2]) -> f64 {
    round3(meters.iter().map(|m| m.period_value(Granularity::Day)).sum())
}
