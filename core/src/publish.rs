use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::channel::{Delivery, MessageChannel};
use crate::config::{BackfillConfig, LiveConfig};
use crate::error::{ConfigError, PublishError};
use crate::generate::ReadingGenerator;
use crate::pacing::{RateController, pause, rate_of};
use crate::types::Reading;

/// Counters of one finished (or cancelled) run.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReport {
    pub attempted: u64,
    pub failed: u64,
    pub elapsed: Duration,
    pub target_rate: Option<f64>,
    pub window: Option<(OffsetDateTime, OffsetDateTime)>,
    pub cancelled: bool,
}

impl PublishReport {
    fn empty() -> Self {
        Self {
            attempted: 0,
            failed: 0,
            elapsed: Duration::ZERO,
            target_rate: None,
            window: None,
            cancelled: false,
        }
    }

    pub fn sent(&self) -> u64 {
        self.attempted - self.failed
    }

    /// Attempts per second over the whole run.
    pub fn average_rate(&self) -> f64 {
        rate_of(self.attempted, self.elapsed)
    }
}

/// Entity id for the `index`-th message: `(index mod devices) + 1`.
pub fn round_robin_id(index: u64, devices: u32) -> u64 {
    index % u64::from(devices.max(1)) + 1
}

async fn send_reading<C: MessageChannel + ?Sized>(
    channel: &mut C,
    topic: &str,
    reading: &Reading,
    delivery: Delivery,
) -> bool {
    let payload = match reading.to_payload() {
        Ok(payload) => payload,
        Err(err) => {
            warn!(entity = %reading.entity_id, "encode reading failed: {err}");
            return false;
        }
    };
    match channel.publish(topic, payload, delivery).await {
        Ok(()) => true,
        Err(err) => {
            warn!(entity = %reading.entity_id, "publish failed: {err}");
            false
        }
    }
}

async fn open<C: MessageChannel + ?Sized>(channel: &mut C) -> Result<(), PublishError> {
    info!(endpoint = %channel.endpoint(), "connecting");
    channel.connect().await.map_err(PublishError::Connection)
}

async fn release<C: MessageChannel + ?Sized>(channel: &mut C) {
    if let Err(err) = channel.disconnect().await {
        warn!("disconnect failed: {err}");
    }
}

/// Publishes generated readings at a target rate, round-robining entity ids.
pub struct LivePublisher {
    config: LiveConfig,
    topic: String,
    generator: ReadingGenerator,
}

impl LivePublisher {
    pub fn new(config: LiveConfig, topic: impl Into<String>) -> Result<Self, ConfigError> {
        config.validate()?;
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        Ok(Self {
            generator: ReadingGenerator::new(config.seed),
            config,
            topic,
        })
    }

    pub async fn run<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &mut C,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PublishReport, PublishError> {
        if self.config.messages == Some(0) {
            info!("nothing to publish");
            return Ok(PublishReport {
                target_rate: Some(self.config.rate),
                ..PublishReport::empty()
            });
        }
        let mut pacer = RateController::new(self.config.rate, self.config.report_every)?;

        info!(
            topic = %self.topic,
            messages = ?self.config.messages,
            devices = self.config.devices,
            rate = self.config.rate,
            "starting live publish"
        );

        open(channel).await?;
        let report = self.publish_all(channel, &mut pacer, &mut shutdown).await;
        release(channel).await;

        info!(
            "live publish finished | total: {} | failed: {} | elapsed: {:.2}s | average rate: {:.1} msg/s | cancelled: {}",
            report.attempted,
            report.failed,
            report.elapsed.as_secs_f64(),
            report.average_rate(),
            report.cancelled
        );
        Ok(report)
    }

    async fn publish_all<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &mut C,
        pacer: &mut RateController,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PublishReport {
        pacer.restart();
        let mut cancelled = false;
        let mut index: u64 = 0;
        while self.config.messages.is_none_or(|total| index < total) {
            if *shutdown.borrow() {
                cancelled = true;
                break;
            }
            let entity = round_robin_id(index, self.config.devices);
            let reading = self.generator.generate(entity, None);
            let delivered =
                send_reading(channel, &self.topic, &reading, self.config.delivery).await;
            index += 1;

            if let Some(rate) = pacer.record(delivered) {
                match self.config.messages {
                    Some(total) => {
                        info!("sent {index}/{total} | rate: {rate:.1} msg/s | device: {entity}")
                    }
                    None => info!(
                        "sent {index} | device {entity}: ph={} temp={} humidity={}",
                        reading.ph, reading.temperature, reading.humidity
                    ),
                }
            }

            if !pacer.pace(shutdown).await {
                cancelled = true;
                break;
            }
        }

        PublishReport {
            attempted: pacer.attempted(),
            failed: pacer.failed(),
            elapsed: pacer.elapsed(),
            target_rate: Some(pacer.target_rate()),
            window: None,
            cancelled,
        }
    }
}

/// Cursor times `start, start + step, ..` up to and including `end`.
///
/// Ends early rather than stepping past the supported date range.
#[derive(Debug, Clone)]
pub struct BackfillCursor {
    next: Option<OffsetDateTime>,
    end: OffsetDateTime,
    step: time::Duration,
}

impl BackfillCursor {
    pub fn new(now: OffsetDateTime, hours_back: i64, step_minutes: i64) -> Self {
        let span = time::Duration::seconds(hours_back.saturating_mul(3600));
        Self {
            next: now.checked_sub(span),
            end: now,
            step: time::Duration::seconds(step_minutes.max(1).saturating_mul(60)),
        }
    }

    /// First cursor time, `None` when the window starts before the supported range.
    pub fn start(&self) -> Option<OffsetDateTime> {
        self.next
    }
}

impl Iterator for BackfillCursor {
    type Item = OffsetDateTime;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.filter(|at| *at <= self.end)?;
        self.next = current.checked_add(self.step);
        Some(current)
    }
}

/// Regenerates a past window, one reading per entity per cursor step.
pub struct HistoricalBackfillPublisher {
    config: BackfillConfig,
    topic: String,
    generator: ReadingGenerator,
}

impl HistoricalBackfillPublisher {
    pub fn new(config: BackfillConfig, topic: impl Into<String>) -> Result<Self, ConfigError> {
        config.validate()?;
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        Ok(Self {
            generator: ReadingGenerator::new(config.seed),
            config,
            topic,
        })
    }

    pub async fn run<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &mut C,
        shutdown: watch::Receiver<bool>,
    ) -> Result<PublishReport, PublishError> {
        self.run_until(OffsetDateTime::now_utc(), channel, shutdown)
            .await
    }

    /// Backfills the window ending at `now`.
    pub async fn run_until<C: MessageChannel + ?Sized>(
        &mut self,
        now: OffsetDateTime,
        channel: &mut C,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PublishReport, PublishError> {
        let config = self.config.clone();
        let cursor = BackfillCursor::new(now, config.hours_back, config.step_minutes);
        let start = cursor
            .start()
            .ok_or(ConfigError::WindowOutOfRange(config.hours_back))?;

        info!(
            topic = %self.topic,
            from = %start,
            until = %now,
            devices = config.devices,
            step_minutes = config.step_minutes,
            points_per_device = config.points_per_entity(),
            "starting backfill"
        );

        open(channel).await?;
        let report = self
            .publish_window(channel, cursor, (start, now), &mut shutdown)
            .await;
        release(channel).await;

        info!(
            "backfill finished | total: {} | failed: {} | cancelled: {}",
            report.attempted, report.failed, report.cancelled
        );
        Ok(report)
    }

    async fn publish_window<C: MessageChannel + ?Sized>(
        &mut self,
        channel: &mut C,
        cursor: BackfillCursor,
        window: (OffsetDateTime, OffsetDateTime),
        shutdown: &mut watch::Receiver<bool>,
    ) -> PublishReport {
        let started = tokio::time::Instant::now();
        let mut attempted: u64 = 0;
        let mut failed: u64 = 0;
        let mut cancelled = false;

        'steps: for at in cursor {
            for entity in 1..=self.config.devices {
                if *shutdown.borrow() {
                    cancelled = true;
                    break 'steps;
                }
                let reading = self.generator.generate(entity, Some(at));
                if !send_reading(channel, &self.topic, &reading, self.config.delivery).await {
                    failed += 1;
                }
                attempted += 1;
                if self.config.report_every > 0 && attempted % self.config.report_every == 0 {
                    info!("sent {attempted} | cursor: {at}");
                }
            }
            if !pause(self.config.step_pause, shutdown).await {
                cancelled = true;
                break;
            }
        }

        PublishReport {
            attempted,
            failed,
            elapsed: started.elapsed(),
            target_rate: None,
            window: Some(window),
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingChannel;
    use time::macros::datetime;

    fn decode(channel: &RecordingChannel) -> Vec<Reading> {
        channel
            .messages
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect()
    }

    fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    /// Raises the shutdown flag once `after` messages went through.
    struct StopAfter {
        inner: RecordingChannel,
        after: usize,
        stop: watch::Sender<bool>,
    }

    #[async_trait::async_trait]
    impl MessageChannel for StopAfter {
        fn endpoint(&self) -> String {
            self.inner.endpoint()
        }

        async fn connect(&mut self) -> Result<(), crate::error::ChannelError> {
            self.inner.connect().await
        }

        async fn publish(
            &mut self,
            topic: &str,
            payload: Vec<u8>,
            delivery: Delivery,
        ) -> Result<(), crate::error::ChannelError> {
            let sent = self.inner.publish(topic, payload, delivery).await;
            if self.inner.messages.len() == self.after {
                self.stop.send_replace(true);
            }
            sent
        }

        async fn disconnect(&mut self) -> Result<(), crate::error::ChannelError> {
            self.inner.disconnect().await
        }
    }

    fn small_backfill(step_pause: Duration) -> BackfillConfig {
        BackfillConfig {
            devices: 3,
            hours_back: 1,
            step_minutes: 30,
            step_pause,
            ..BackfillConfig::default()
        }
    }

    #[test]
    fn round_robin_wraps() {
        let ids: Vec<u64> = (0..5).map(|i| round_robin_id(i, 2)).collect();
        assert_eq!(ids, vec![1, 2, 1, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn live_run_hits_target_rate() {
        let mut publisher = LivePublisher::new(LiveConfig::batch(500, 10, 100.0), "fleet/test").unwrap();
        let mut channel = RecordingChannel::new();
        let (_tx, rx) = no_shutdown();

        let report = publisher.run(&mut channel, rx).await.unwrap();

        assert_eq!(report.attempted, 500);
        assert_eq!(report.sent(), 500);
        assert_eq!(channel.messages.len(), 500);
        let rate = report.average_rate();
        assert!((90.0..=101.0).contains(&rate), "rate {rate}");
        assert_eq!(channel.disconnects(), 1);

        let readings = decode(&channel);
        assert_eq!(readings[0].entity_id, "1");
        assert_eq!(readings[9].entity_id, "10");
        assert_eq!(readings[10].entity_id, "1");
        assert!(channel.messages.iter().all(|m| m.topic == "fleet/test"));
    }

    #[tokio::test]
    async fn zero_messages_completes_immediately() {
        let mut publisher = LivePublisher::new(LiveConfig::batch(0, 10, 100.0), "t").unwrap();
        let mut channel = RecordingChannel::new();
        let (_tx, rx) = no_shutdown();
        let report = publisher.run(&mut channel, rx).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.elapsed, Duration::ZERO);
        assert!(channel.messages.is_empty());
    }

    #[test]
    fn bad_rate_rejected_before_start() {
        let err = LivePublisher::new(LiveConfig::batch(10, 1, 0.0), "t").err().unwrap();
        assert_eq!(err, ConfigError::NonPositiveRate(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_do_not_stop_the_run() {
        let mut publisher = LivePublisher::new(LiveConfig::batch(20, 3, 50.0), "t").unwrap();
        let mut channel = RecordingChannel::failing_every(4);
        let (_tx, rx) = no_shutdown();
        let report = publisher.run(&mut channel, rx).await.unwrap();
        assert_eq!(report.attempted, 20);
        assert_eq!(report.failed, 5);
        assert_eq!(channel.messages.len(), 15);
    }

    #[tokio::test]
    async fn connect_failure_is_fatal() {
        let mut publisher = LivePublisher::new(LiveConfig::batch(10, 1, 10.0), "t").unwrap();
        let mut channel = RecordingChannel::refusing();
        let (_tx, rx) = no_shutdown();
        let err = publisher.run(&mut channel, rx).await.unwrap_err();
        assert!(matches!(err, PublishError::Connection(_)));
        assert_eq!(channel.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_runs_until_shutdown() {
        let mut publisher = LivePublisher::new(LiveConfig::stream(3, 2.0), "t").unwrap();
        let mut channel = RecordingChannel::new();
        let (tx, rx) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_250)).await;
            tx.send(true).unwrap();
        });
        let report = publisher.run(&mut channel, rx).await.unwrap();
        stopper.await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.attempted, 5);
        assert_eq!(channel.disconnects(), 1);
        assert!(!channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_walks_cursor_across_window() {
        let now = datetime!(2024-05-01 12:00:00 UTC);
        let config = BackfillConfig {
            devices: 2,
            hours_back: 1,
            step_minutes: 30,
            ..BackfillConfig::default()
        };
        let mut publisher = HistoricalBackfillPublisher::new(config, "t").unwrap();
        let mut channel = RecordingChannel::new();
        let (_tx, rx) = no_shutdown();

        let report = publisher.run_until(now, &mut channel, rx).await.unwrap();

        assert_eq!(report.attempted, 6);
        let readings = decode(&channel);
        let stamps: Vec<_> = readings.iter().map(|r| r.timestamp).collect();
        assert_eq!(
            stamps,
            vec![
                datetime!(2024-05-01 11:00:00 UTC),
                datetime!(2024-05-01 11:00:00 UTC),
                datetime!(2024-05-01 11:30:00 UTC),
                datetime!(2024-05-01 11:30:00 UTC),
                now,
                now,
            ]
        );
        let ids: Vec<_> = readings.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "1", "2", "1", "2"]);
        assert_eq!(report.window, Some((datetime!(2024-05-01 11:00:00 UTC), now)));
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_stops_on_shutdown_between_entities() {
        let now = datetime!(2024-05-01 12:00:00 UTC);
        let config = small_backfill(Duration::from_millis(10));
        let total = config.points_per_entity() * u64::from(config.devices);
        let mut publisher = HistoricalBackfillPublisher::new(config, "t").unwrap();
        let (tx, rx) = watch::channel(false);
        let mut channel = StopAfter {
            inner: RecordingChannel::new(),
            after: 4,
            stop: tx,
        };

        let report = publisher.run_until(now, &mut channel, rx).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.attempted, 4);
        assert!(report.attempted < total);
        assert_eq!(channel.inner.disconnects(), 1);
        assert!(!channel.inner.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_stops_on_shutdown_during_step_pause() {
        let now = datetime!(2024-05-01 12:00:00 UTC);
        let config = small_backfill(Duration::from_secs(1));
        let total = config.points_per_entity() * u64::from(config.devices);
        let mut publisher = HistoricalBackfillPublisher::new(config, "t").unwrap();
        let mut channel = RecordingChannel::new();
        let (tx, rx) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            tx.send(true).unwrap();
        });
        let report = publisher.run_until(now, &mut channel, rx).await.unwrap();
        stopper.await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.attempted, 6);
        assert!(report.attempted < total);
        assert_eq!(channel.disconnects(), 1);
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn delivery_guarantee_reaches_the_channel() {
        let config = LiveConfig {
            delivery: Delivery::AtLeastOnce,
            ..LiveConfig::batch(3, 1, 1_000.0)
        };
        let mut publisher = LivePublisher::new(config, "t").unwrap();
        let mut channel = RecordingChannel::new();
        let (_tx, rx) = no_shutdown();
        publisher.run(&mut channel, rx).await.unwrap();
        assert_eq!(channel.messages.len(), 3);
        assert!(channel.messages.iter().all(|m| m.delivery == Delivery::AtLeastOnce));

        let config = BackfillConfig {
            delivery: Delivery::AtLeastOnce,
            ..small_backfill(Duration::ZERO)
        };
        let mut publisher = HistoricalBackfillPublisher::new(config, "t").unwrap();
        let mut channel = RecordingChannel::new();
        let (_tx, rx) = no_shutdown();
        publisher
            .run_until(datetime!(2024-05-01 12:00:00 UTC), &mut channel, rx)
            .await
            .unwrap();
        assert_eq!(channel.messages.len(), 9);
        assert!(channel.messages.iter().all(|m| m.delivery == Delivery::AtLeastOnce));
    }

    #[test]
    fn cursor_ends_at_the_last_representable_step() {
        let now = datetime!(9999-12-31 23:00:00 UTC);
        let steps: Vec<_> = BackfillCursor::new(now, 2, 60).collect();
        assert_eq!(
            steps,
            vec![
                datetime!(9999-12-31 21:00:00 UTC),
                datetime!(9999-12-31 22:00:00 UTC),
                now,
            ]
        );

        let huge_step: Vec<_> = BackfillCursor::new(now, 1, i64::MAX).collect();
        assert_eq!(huge_step, vec![datetime!(9999-12-31 22:00:00 UTC)]);

        let start = datetime!(2024-05-01 11:00:00 UTC);
        let long_step: Vec<_> = BackfillCursor::new(start, 1, 5_000_000_000).collect();
        assert_eq!(long_step, vec![datetime!(2024-05-01 10:00:00 UTC)]);
    }

    #[tokio::test]
    async fn backfill_window_before_supported_dates_is_rejected() {
        let config = BackfillConfig {
            hours_back: 200_000_000,
            ..BackfillConfig::default()
        };
        let mut publisher = HistoricalBackfillPublisher::new(config, "t").unwrap();
        let mut channel = RecordingChannel::new();
        let (_tx, rx) = no_shutdown();
        let err = publisher
            .run_until(datetime!(2024-05-01 12:00:00 UTC), &mut channel, rx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PublishError::Config(ConfigError::WindowOutOfRange(200_000_000))
        ));
        assert!(!channel.is_connected());
        assert_eq!(channel.attempts(), 0);
    }

    #[test]
    fn cursor_stops_past_now_on_uneven_window() {
        let now = datetime!(2024-05-01 12:00:00 UTC);
        let steps: Vec<_> = BackfillCursor::new(now, 1, 25).collect();
        assert_eq!(
            steps,
            vec![
                datetime!(2024-05-01 11:00:00 UTC),
                datetime!(2024-05-01 11:25:00 UTC),
                datetime!(2024-05-01 11:50:00 UTC),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_connect_failure_is_fatal() {
        let mut publisher = HistoricalBackfillPublisher::new(BackfillConfig::default(), "t").unwrap();
        let mut channel = RecordingChannel::refusing();
        let (_tx, rx) = no_shutdown();
        let err = publisher.run(&mut channel, rx).await.unwrap_err();
        assert!(matches!(err, PublishError::Connection(_)));
    }

    #[test]
    fn backfill_rejects_bad_step() {
        let config = BackfillConfig {
            step_minutes: 0,
            ..BackfillConfig::default()
        };
        assert!(HistoricalBackfillPublisher::new(config, "t").is_err());
    }
}
