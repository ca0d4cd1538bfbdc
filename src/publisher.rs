use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::accumulator::ConsumptionAccumulator;
use crate::config::Config;
use crate::error::MissingFieldError;
use crate::period_counter::Granularity;
use crate::telegram::{Field, Telegram};

/// Raw telegram fields and the topic each one is republished on.
const READING_TOPICS: [(Field, &str); 20] = [
    (Field::DsmrVersion, "dsmr/meter-stats/dsmr_version"),
    (Field::Timestamp, "dsmr/reading/timestamp"),
    (Field::EquipmentId, "dsmr/meter-stats/dsmr_meter_id"),
    (Field::ElectricityUsedTariff1, "dsmr/reading/electricity_delivered_1"),
    (Field::ElectricityUsedTariff2, "dsmr/reading/electricity_delivered_2"),
    (Field::ElectricityReturnedTariff1, "dsmr/reading/electricity_returned_1"),
    (Field::ElectricityReturnedTariff2, "dsmr/reading/electricity_returned_2"),
    (Field::ActiveTariff, "dsmr/meter-stats/electricity_tariff"),
    (Field::CurrentlyDelivered, "dsmr/reading/electricity_currently_delivered"),
    (Field::CurrentlyReturned, "dsmr/reading/electricity_currently_returned"),
    (Field::LongPowerFailureCount, "dsmr/meter-stats/power_failure_count"),
    (Field::VoltageSagCountL1, "dsmr/meter-stats/voltage_sag_count_l1"),
    (Field::VoltageSwellCountL1, "dsmr/meter-stats/voltage_swell_count_l1"),
    (Field::DeviceType, "dsmr/meter-stats/dsmr_meter_type"),
    (Field::PowerDeliveredL1, "dsmr/reading/phase_currently_delivered_l1"),
    (Field::PowerReturnedL1, "dsmr/reading/phase_currently_returned_l1"),
    (Field::GasEquipmentId, "dsmr/meter-stats/gas_meter_id"),
    (Field::GasReading, "dsmr/consumption/gas/read_at"),
    (Field::VoltageL1, "dsmr/reading/phase_voltage_l1"),
    (Field::CurrentL1, "dsmr/reading/phase_power_current_l1"),
];

pub const GAS_RATE_TOPIC: &str = "dsmr/consumption/gas/currently_delivered";

/// Destination of `(topic, payload)` messages.
pub trait Publisher {
    fn publish(&self, topic: &str, payload: String)
        -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// One message per raw field present in `telegram`, plus the fields it lacked.
pub fn reading_messages(telegram: &Telegram) -> (Vec<(String, String)>, Vec<MissingFieldError>) {
    let mut messages = Vec::with_capacity(READING_TOPICS.len());
    let mut missing = Vec::new();
    for (field, topic) in READING_TOPICS {
        match telegram.get(field) {
            Some(value) => messages.push((topic.to_string(), value.to_string())),
            None => missing.push(MissingFieldError(field)),
        }
    }
    (messages, missing)
}

/// Every derived statistic: each meter's period values, the day totals and the gas rate.
pub fn statistics_messages(accumulator: &ConsumptionAccumulator) -> Vec<(String, String)> {
    let mut messages = Vec::new();
    for meter in accumulator.meters() {
        for granularity in Granularity::ALL {
            messages.push((
                format!("dsmr/consumption/{}/{}", meter.name(), granularity),
                meter.period_value(granularity).to_string(),
            ));
        }
    }
    messages.push((
        "dsmr/day-consumption/electricity_delivered".to_string(),
        accumulator.electricity_used_today().to_string(),
    ));
    messages.push((
        "dsmr/day-consumption/electricity_returned".to_string(),
        accumulator.electricity_returned_today().to_string(),
    ));
    messages.push((
        "dsmr/day-consumption/gas".to_string(),
        accumulator.gas_today().to_string(),
    ));
    messages.push((
        GAS_RATE_TOPIC.to_string(),
        accumulator.gas_current_rate().to_string(),
    ));
    messages
}

/// Publishes to an MQTT broker. Connection handling lives in the spawned event loop task,
/// which keeps reconnecting for as long as the process runs.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn connect(config: &Config) -> Self {
        let mut options = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(30));

        let (client, event_loop) = AsyncClient::new(options, 128);
        tokio::spawn(Self::drive(event_loop));
        Self { client }
    }

    async fn drive(mut event_loop: EventLoop) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    tracing::info!(code = ?ack.code, "connected to MQTT broker");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("MQTT connection error: {e}, retrying");
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
}

impl Publisher for MqttPublisher {
    /// Queues the message without waiting. While the broker is unreachable the request
    /// queue fills up and further messages fail instead of stalling ingestion.
    async fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()> {
        self.client.try_publish(topic, QoS::AtMostOnce, false, payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period_counter::RolloverMode;
    use crate::telegram::tests::sample_telegram;
    use chrono::NaiveDate;

    #[test]
    fn test_reading_messages_from_full_telegram() {
        let telegram = Telegram::parse(&sample_telegram(), true).unwrap();
        let (messages, missing) = reading_messages(&telegram);

        assert!(missing.is_empty());
        assert_eq!(messages.len(), READING_TOPICS.len());
        assert!(messages.contains(&(
            "dsmr/reading/electricity_delivered_1".to_string(),
            "123456.789".to_string()
        )));
        assert!(messages.contains(&(
            "dsmr/consumption/gas/read_at".to_string(),
            "12785.123".to_string()
        )));
        assert!(messages.contains(&(
            "dsmr/reading/timestamp".to_string(),
            "2024-01-09 11:30:20+01:00".to_string()
        )));
    }

    #[test]
    fn test_reading_messages_report_missing_fields() {
        let mut telegram = Telegram::default();
        telegram.insert(Field::GasReading, crate::telegram::Value::Number(1.5));
        let (messages, missing) = reading_messages(&telegram);

        assert_eq!(messages.len(), 1);
        assert_eq!(missing.len(), READING_TOPICS.len() - 1);
        assert!(!missing.contains(&MissingFieldError(Field::GasReading)));
    }

    #[test]
    fn test_statistics_messages_cover_every_meter_and_period() {
        let now = NaiveDate::from_ymd_opt(2024, 3, 3)
            .unwrap()
            .and_hms_opt(3, 3, 3)
            .unwrap();
        let accumulator = ConsumptionAccumulator::new(now, RolloverMode::Component, None);
        let messages = statistics_messages(&accumulator);

        assert_eq!(messages.len(), 5 * 5 + 4);
        assert!(messages.contains(&(
            "dsmr/consumption/electricity_returned_2/week".to_string(),
            "0".to_string()
        )));
        assert!(messages.contains(&(GAS_RATE_TOPIC.to_string(), "0".to_string())));
    }

    #[tokio::test]
    async fn test_publish_fails_fast_when_broker_is_unreachable() {
        let config = Config::from_lookup(|name| match name {
            "MQTT_HOST" => Some("127.0.0.1".to_string()),
            "MQTT_PORT" => Some("1".to_string()),
            _ => None,
        })
        .unwrap();
        let publisher = MqttPublisher::connect(&config);

        let outcome = tokio::time::timeout(Duration::from_secs(5), async {
            let mut failed = 0;
            for i in 0..200 {
                if publisher
                    .publish("dsmr/test", i.to_string())
                    .await
                    .is_err()
                {
                    failed += 1;
                }
            }
            failed
        })
        .await;

        let failed = outcome.expect("publishing must not block on a full queue");
        assert!(failed > 0);
    }
}
