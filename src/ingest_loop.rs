use chrono::NaiveDateTime;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;

use crate::accumulator::ConsumptionAccumulator;
use crate::clock::Clock;
use crate::config::{Config, SavePolicy};
use crate::period_counter::{period_key, Granularity, RolloverMode};
use crate::publisher::{reading_messages, statistics_messages, Publisher};
use crate::state_store::StateStore;
use crate::telegram::Telegram;

/// Single consumer of decoded telegrams and sole owner of the accumulator.
///
/// Telegrams closer together than the report interval are dropped. Every processed telegram
/// updates the accumulator, republishes the raw readings and derived statistics, and saves
/// the baselines when the save period (hour or day) has changed since the last save.
pub struct IngestLoop<P, C> {
    accumulator: ConsumptionAccumulator,
    store: StateStore,
    publisher: P,
    clock: C,
    report_interval: Duration,
    gas_rate_interval_seconds: u64,
    save_policy: SavePolicy,
    last_processed: Option<NaiveDateTime>,
    saved_period: i64,
}

impl<P: Publisher, C: Clock> IngestLoop<P, C> {
    pub fn new(
        config: &Config,
        accumulator: ConsumptionAccumulator,
        store: StateStore,
        publisher: P,
        clock: C,
    ) -> Self {
        let saved_period = save_period(config.save_policy, clock.now());
        Self {
            accumulator,
            store,
            publisher,
            clock,
            report_interval: config.report_interval,
            gas_rate_interval_seconds: config.gas_rate_interval_seconds,
            save_policy: config.save_policy,
            last_processed: None,
            saved_period,
        }
    }

    pub fn accumulator(&self) -> &ConsumptionAccumulator {
        &self.accumulator
    }

    /// Consumes telegrams until every sender is gone, then writes a final snapshot.
    pub async fn run(mut self, mut telegrams: Receiver<Telegram>) {
        tracing::info!("ingest loop started");
        while let Some(telegram) = telegrams.recv().await {
            self.handle(&telegram).await;
        }
        tracing::info!("telegram source closed, saving state");
        self.save(self.clock.now());
    }

    /// Processes one telegram unless it arrives within the report interval of the previous
    /// processed one. Returns whether it was processed.
    pub async fn handle(&mut self, telegram: &Telegram) -> bool {
        let now = self.clock.now();
        if let Some(last) = self.last_processed {
            if let Ok(elapsed) = (now - last).to_std() {
                if elapsed < self.report_interval {
                    tracing::trace!("telegram dropped by report interval");
                    return false;
                }
            }
        }
        self.last_processed = Some(now);

        for skipped in self
            .accumulator
            .apply(telegram, now, self.gas_rate_interval_seconds)
        {
            tracing::debug!("accumulator update skipped: {skipped}");
        }

        let (mut messages, missing) = reading_messages(telegram);
        for field in missing {
            tracing::trace!("not republished: {field}");
        }
        messages.extend(statistics_messages(&self.accumulator));
        let total = messages.len();
        let mut failed = 0;
        for (topic, payload) in messages {
            if let Err(e) = self.publisher.publish(&topic, payload).await {
                if failed == 0 {
                    tracing::warn!(topic = %topic, "publish failed: {e}");
                }
                failed += 1;
            }
        }
        if failed > 1 {
            tracing::warn!("{failed} of {total} messages not published");
        }

        let period = save_period(self.save_policy, now);
        if period != self.saved_period && self.save(now) {
            self.saved_period = period;
        }
        true
    }

    fn save(&self, now: NaiveDateTime) -> bool {
        match self.store.save(&self.accumulator.snapshot(now)) {
            Ok(()) => {
                tracing::info!(path = %self.store.path().display(), "meter baselines saved");
                true
            }
            Err(e) => {
                tracing::error!("{e}");
                false
            }
        }
    }
}

fn save_period(policy: SavePolicy, now: NaiveDateTime) -> i64 {
    let granularity = match policy {
        SavePolicy::Hourly => Granularity::Hour,
        SavePolicy::Daily => Granularity::Day,
    };
    period_key(granularity, now, RolloverMode::FullDate)
}
