use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::period_counter::RolloverMode;

/// Serial line settings and checksum presence differ between DSMR protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsmrVersion {
    V2_2,
    V4,
    V5,
}

impl DsmrVersion {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim() {
            "2.2" | "2" => Ok(DsmrVersion::V2_2),
            "4" => Ok(DsmrVersion::V4),
            "5" => Ok(DsmrVersion::V5),
            other => Err(ConfigError::DsmrVersion(other.to_string())),
        }
    }

    pub fn baud_rate(self) -> u32 {
        match self {
            DsmrVersion::V2_2 => 9600,
            DsmrVersion::V4 | DsmrVersion::V5 => 115_200,
        }
    }

    /// DSMR 2.2 telegrams carry no CRC.
    pub fn has_crc(self) -> bool {
        !matches!(self, DsmrVersion::V2_2)
    }
}

/// When the accumulator baselines are written to the state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePolicy {
    Hourly,
    Daily,
}

impl SavePolicy {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(SavePolicy::Hourly),
            "daily" => Ok(SavePolicy::Daily),
            _ => Err(ConfigError::SavePolicy(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub dsmr_port: String,
    pub dsmr_version: DsmrVersion,
    /// Minimum spacing between processed telegrams.
    pub report_interval: Duration,
    pub gas_rate_interval_seconds: u64,
    pub state_file: PathBuf,
    pub save_policy: SavePolicy,
    pub rollover_mode: RolloverMode,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable lookup, `from_env` uses the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let gas_rate_interval_seconds: u64 = parse_number(
            "GAS_RATE_INTERVAL",
            &var("GAS_RATE_INTERVAL", "300"),
        )?;
        if gas_rate_interval_seconds == 0 {
            return Err(ConfigError::Zero {
                name: "GAS_RATE_INTERVAL",
            });
        }

        Ok(Self {
            mqtt_host: var("MQTT_HOST", "mqtt"),
            mqtt_port: parse_number("MQTT_PORT", &var("MQTT_PORT", "1883"))?,
            mqtt_client_id: var("MQTT_CLIENTID", "dsmr2mqtt"),
            dsmr_port: var("DSMR_PORT", "/dev/ttyUSB0"),
            dsmr_version: DsmrVersion::parse(&var("DSMR_VERSION", "5"))?,
            report_interval: Duration::from_secs(parse_number(
                "REPORT_INTERVAL",
                &var("REPORT_INTERVAL", "15"),
            )?),
            gas_rate_interval_seconds,
            state_file: PathBuf::from(var("STATE_FILE", "dsmr_state.json")),
            save_policy: SavePolicy::parse(&var("STATE_SAVE_POLICY", "hourly"))?,
            rollover_mode: if parse_bool_safe(lookup("FULL_DATE_ROLLOVER")) {
                RolloverMode::FullDate
            } else {
                RolloverMode::Component
            },
        })
    }

    /// Logs the effective configuration at start-up.
    pub fn log_banner(&self) {
        tracing::info!("MQTT Host:         {}", self.mqtt_host);
        tracing::info!("MQTT Port:         {}", self.mqtt_port);
        tracing::info!("MQTT Client ID:    {}", self.mqtt_client_id);
        tracing::info!("DSMR port:         {}", self.dsmr_port);
        tracing::info!("DSMR version:      {:?}", self.dsmr_version);
        tracing::info!("Report interval:   {}s", self.report_interval.as_secs());
        tracing::info!("Gas rate interval: {}s", self.gas_rate_interval_seconds);
        tracing::info!("State file:        {}", self.state_file.display());
        tracing::info!("State saved:       {:?}", self.save_policy);
        tracing::info!("Rollover mode:     {:?}", self.rollover_mode);
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::NotANumber {
        name,
        value: value.to_string(),
    })
}

/// Safely parses a boolean from an optional string, defaulting to false
fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}
