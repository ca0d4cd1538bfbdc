use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;

use dsmr2mqtt::clock::Clock;
use dsmr2mqtt::error::PersistenceError;
use dsmr2mqtt::telegram::{crc16, Field, TelegramBuffer};
use dsmr2mqtt::{
    Config, ConsumptionAccumulator, Granularity, IngestLoop, Publisher, StateStore, Telegram,
};

/// Hands out `start`, `start + step`, `start + 2 * step`, ... one per call.
struct SteppingClock {
    next: Mutex<NaiveDateTime>,
    step: TimeDelta,
}

impl Clock for SteppingClock {
    fn now(&self) -> NaiveDateTime {
        let mut next = self.next.lock().unwrap();
        let now = *next;
        *next += self.step;
        now
    }
}

/// Stands in for the MQTT broker, remembering every message in order.
#[derive(Clone, Default)]
struct RecordingPublisher {
    messages: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingPublisher {
    fn last(&self, topic: &str) -> Option<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
    }

    fn count(&self, topic: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .count()
    }
}

impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}

fn at(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 10, 14)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

fn test_config(state_file: &std::path::Path) -> Config {
    let vars: HashMap<&str, String> = HashMap::from([
        ("REPORT_INTERVAL", "0".to_string()),
        ("GAS_RATE_INTERVAL", "1200".to_string()),
        ("STATE_FILE", state_file.display().to_string()),
    ]);
    Config::from_lookup(|name| vars.get(name).cloned()).unwrap()
}

/// Raw DSMR 5 telegram with a valid checksum.
fn p1_telegram(used: [f64; 2], returned: [f64; 2], gas: f64) -> Vec<u8> {
    let body = format!(
        "/XMX5LGBBFG1012345678\r\n\
         \r\n\
         1-3:0.2.8(50)\r\n\
         0-0:1.0.0(241014100000S)\r\n\
         1-0:1.8.1({:010.3}*kWh)\r\n\
         1-0:1.8.2({:010.3}*kWh)\r\n\
         1-0:2.8.1({:010.3}*kWh)\r\n\
         1-0:2.8.2({:010.3}*kWh)\r\n\
         0-0:96.14.0(0001)\r\n\
         1-0:1.7.0(00.350*kW)\r\n\
         1-0:2.7.0(00.000*kW)\r\n\
         0-1:24.2.1(241014100000S)({:09.3}*m3)\r\n\
         !",
        used[0], used[1], returned[0], returned[1], gas
    );
    let crc = crc16(body.as_bytes());
    format!("{body}{crc:04X}\r\n").into_bytes()
}

fn decode(raw: &[u8]) -> Telegram {
    Telegram::parse(raw, true).expect("valid telegram")
}

#[tokio::test]
async fn test_telegrams_flow_to_topics_and_state_file() {
    let dir = TempDir::new().unwrap();
    let state_file = dir.path().join("state.json");
    let config = test_config(&state_file);

    let clock = SteppingClock {
        next: Mutex::new(at(10, 0)),
        step: TimeDelta::minutes(20),
    };
    let publisher = RecordingPublisher::default();
    let accumulator = ConsumptionAccumulator::new(at(10, 0), config.rollover_mode, None);
    let ingest = IngestLoop::new(
        &config,
        accumulator,
        StateStore::new(&config.state_file),
        publisher.clone(),
        clock,
    );

    let (tx, rx) = mpsc::channel(8);
    for telegram in [
        p1_telegram([1000.0, 500.0], [1.0, 2.0], 100.0),
        p1_telegram([1000.5, 500.25], [1.0, 2.0], 100.1),
        p1_telegram([1001.0, 500.5], [1.0, 2.5], 100.2),
    ] {
        tx.send(decode(&telegram)).await.unwrap();
    }
    drop(tx);
    ingest.run(rx).await;

    // Raw readings are republished as they came in
    assert_eq!(
        publisher.last("dsmr/reading/electricity_delivered_1"),
        Some("1001".to_string())
    );
    assert_eq!(
        publisher.last("dsmr/meter-stats/electricity_tariff"),
        Some("0001".to_string())
    );
    assert_eq!(publisher.count("dsmr/reading/timestamp"), 3);
    // Fields this meter does not send are skipped without stopping the rest
    assert_eq!(publisher.count("dsmr/reading/phase_voltage_l1"), 0);

    // Derived statistics
    assert_eq!(
        publisher.last("dsmr/day-consumption/electricity_delivered"),
        Some("1.5".to_string())
    );
    assert_eq!(
        publisher.last("dsmr/day-consumption/electricity_returned"),
        Some("0.5".to_string())
    );
    assert_eq!(
        publisher.last("dsmr/day-consumption/gas"),
        Some("0.2".to_string())
    );
    assert_eq!(
        publisher.last("dsmr/consumption/gas/currently_delivered"),
        Some("0.3".to_string())
    );
    // The third telegram arrived at 11:00 and started a new hour
    assert_eq!(
        publisher.last("dsmr/consumption/electricity_delivered_1/hour"),
        Some("0".to_string())
    );
    assert_eq!(
        publisher.last("dsmr/consumption/electricity_delivered_1/year"),
        Some("1".to_string())
    );

    let saved = StateStore::new(&state_file).load().unwrap();
    assert_eq!(saved.saved_at, Some(at(11, 20)));
    assert_eq!(saved.meters.len(), 5);
    assert_eq!(
        saved.baseline("electricity_delivered_1", Granularity::Hour),
        1001.0
    );
    assert_eq!(
        saved.baseline("electricity_delivered_1", Granularity::Day),
        1000.0
    );
    assert_eq!(saved.baseline("gas", Granularity::Month), 100.0);
}

#[tokio::test]
async fn test_restart_resumes_from_saved_baselines() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));
    let rate_interval = 1200;

    {
        let mut before = ConsumptionAccumulator::new(at(11, 0), Default::default(), None);
        before.apply(
            &decode(&p1_telegram([1000.0, 500.0], [1.0, 2.0], 100.0)),
            at(11, 0),
            rate_interval,
        );
        before.apply(
            &decode(&p1_telegram([1001.0, 500.5], [1.0, 2.0], 100.2)),
            at(11, 10),
            rate_interval,
        );
        store.save(&before.snapshot(at(11, 10))).unwrap();
    }

    let snapshot = store.load().unwrap();
    let mut after = ConsumptionAccumulator::new(at(11, 30), Default::default(), Some(&snapshot));
    after.apply(
        &decode(&p1_telegram([1002.0, 500.75], [1.0, 2.0], 100.5)),
        at(11, 30),
        rate_interval,
    );

    assert_eq!(after.electricity_used_today(), 2.75);
    assert_eq!(after.gas_today(), 0.5);
    let hourly = after
        .meters()
        .find(|m| m.name() == "electricity_delivered_1")
        .unwrap()
        .period_value(Granularity::Hour);
    assert_eq!(hourly, 2.0);
    // The rate tracker is not persisted and needs a fresh interval
    assert_eq!(after.gas_current_rate(), 0.0);
}

#[tokio::test]
async fn test_cold_start_when_state_file_is_corrupt() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "not json").unwrap();

    let store = StateStore::new(&path);
    let loaded = store.load();
    assert!(matches!(loaded, Err(PersistenceError::Corrupt { .. })));

    let mut accumulator =
        ConsumptionAccumulator::new(at(9, 0), Default::default(), loaded.ok().as_ref());
    accumulator.apply(
        &decode(&p1_telegram([5000.0, 6000.0], [7.0, 8.0], 900.0)),
        at(9, 0),
        300,
    );
    assert_eq!(accumulator.electricity_used_today(), 0.0);

    accumulator.apply(
        &decode(&p1_telegram([5000.5, 6000.0], [7.0, 8.0], 900.0)),
        at(9, 5),
        300,
    );
    assert_eq!(accumulator.electricity_used_today(), 0.5);
}

#[test]
fn test_serial_stream_is_split_into_telegrams() {
    let first = p1_telegram([1.0, 2.0], [3.0, 4.0], 5.0);
    let second = p1_telegram([1.5, 2.0], [3.0, 4.0], 5.25);
    let mut stream = b"\x00\x00partial tail of an earlier telegram!ABCD\r\n".to_vec();
    stream.extend_from_slice(&first);
    stream.extend_from_slice(&second);

    let mut buffer = TelegramBuffer::new();
    let mut telegrams = Vec::new();
    for chunk in stream.chunks(64) {
        buffer.append(chunk);
        while let Some(frame) = buffer.next_frame() {
            telegrams.push(decode(&frame));
        }
    }

    assert_eq!(telegrams.len(), 2);
    assert_eq!(telegrams[0].number(Field::ElectricityUsedTariff1), Some(1.0));
    assert_eq!(telegrams[1].number(Field::GasReading), Some(5.25));
}
