use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::ConfigError;

/// Fixed-delay pacing: a constant sleep after every publish, no drift correction.
#[derive(Debug)]
pub struct RateController {
    target_rate: f64,
    interval: Duration,
    report_every: u64,
    started: Instant,
    attempted: u64,
    failed: u64,
}

impl RateController {
    pub fn new(rate: f64, report_every: u64) -> Result<Self, ConfigError> {
        Ok(Self {
            target_rate: rate,
            interval: interval_for(rate)?,
            report_every,
            started: Instant::now(),
            attempted: 0,
            failed: 0,
        })
    }

    pub fn target_rate(&self) -> f64 {
        self.target_rate
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn restart(&mut self) {
        self.started = Instant::now();
        self.attempted = 0;
        self.failed = 0;
    }

    /// Counts one publish attempt. Returns the running rate on report boundaries.
    pub fn record(&mut self, delivered: bool) -> Option<f64> {
        self.attempted += 1;
        if !delivered {
            self.failed += 1;
        }
        if self.report_every > 0 && self.attempted % self.report_every == 0 {
            Some(self.current_rate())
        } else {
            None
        }
    }

    pub fn attempted(&self) -> u64 {
        self.attempted
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn current_rate(&self) -> f64 {
        rate_of(self.attempted, self.elapsed())
    }

    /// Sleeps one interval. Returns `false` if shutdown was requested meanwhile.
    pub async fn pace(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        pause(self.interval, shutdown).await
    }
}

/// Sleep between publishes at `rate` messages per second.
pub fn interval_for(rate: f64) -> Result<Duration, ConfigError> {
    if !(rate.is_finite() && rate > 0.0) {
        return Err(ConfigError::NonPositiveRate(rate));
    }
    Duration::try_from_secs_f64(1.0 / rate).map_err(|_| ConfigError::UnrepresentableRate(rate))
}

pub(crate) fn rate_of(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}

/// Waits `delay`, cut short when the shutdown flag flips to `true`.
///
/// A dropped sender means nobody can ask for shutdown any more, so the full
/// delay is still honoured.
pub async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => match changed {
                Ok(()) => {
                    if *shutdown.borrow_and_update() {
                        return false;
                    }
                }
                Err(_) => {
                    (&mut sleep).await;
                    return true;
                }
            },
        }
    }
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
pub async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
