use dsmr2mqtt::clock::{Clock, SystemClock};
use dsmr2mqtt::p1_reader::P1Reader;
use dsmr2mqtt::{Config, ConsumptionAccumulator, IngestLoop, MqttPublisher, StateStore};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting DSMR to MQTT bridge");
    let config = Config::from_env()?;
    config.log_banner();

    let store = StateStore::new(&config.state_file);
    let snapshot = match store.load() {
        Ok(snapshot) => {
            tracing::info!(saved_at = ?snapshot.saved_at, "restored meter baselines");
            Some(snapshot)
        }
        Err(e) => {
            tracing::warn!("{e}; starting without baselines");
            None
        }
    };

    let clock = SystemClock;
    let accumulator =
        ConsumptionAccumulator::new(clock.now(), config.rollover_mode, snapshot.as_ref());
    let publisher = MqttPublisher::connect(&config);

    // The reader thread blocks on serial I/O and hands telegrams to the async side
    let (telegram_tx, telegram_rx) = mpsc::channel(16);
    let _reader = P1Reader::new(config.dsmr_port.clone(), config.dsmr_version, telegram_tx).spawn();

    IngestLoop::new(&config, accumulator, store, publisher, clock)
        .run(telegram_rx)
        .await;

    Ok(())
}
