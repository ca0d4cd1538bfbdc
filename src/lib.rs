//! DSMR to MQTT bridge library
//!
//! Reads P1 telegrams from a DSMR smart meter, keeps rolling per-period consumption
//! statistics for electricity and gas, and republishes readings and statistics over MQTT.
//! Period baselines are persisted so that hour/day/week/month/year totals survive restarts.

pub mod accumulator;
pub mod clock;
pub mod config;
pub mod error;
pub mod gas_rate;
pub mod ingest_loop;
pub mod meter;
pub mod p1_reader;
pub mod period_counter;
pub mod publisher;
pub mod state_store;
pub mod telegram;

// Re-export commonly used types for easier access
pub use accumulator::{ConsumptionAccumulator, Tariff};
pub use config::Config;
pub use ingest_loop::IngestLoop;
pub use period_counter::{Granularity, RolloverMode};
pub use publisher::{MqttPublisher, Publisher};
pub use state_store::{Snapshot, StateStore};
pub use telegram::Telegram;
