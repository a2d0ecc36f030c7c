use std::time::Duration;

use crate::channel::Delivery;
use crate::error::ConfigError;
use crate::pacing::interval_for;

pub const DEFAULT_BROKER_HOST: &str = "localhost";
pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_TOPIC: &str = "app055/data";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_DRAIN: Duration = Duration::from_secs(2);

pub const DEFAULT_DEVICES: u32 = 10;
pub const DEFAULT_MESSAGES: u64 = 1000;
pub const DEFAULT_RATE: f64 = 100.0;
pub const DEFAULT_STREAM_RATE: f64 = 2.0;
pub const DEFAULT_REPORT_EVERY: u64 = 100;
pub const DEFAULT_STREAM_REPORT_EVERY: u64 = 10;
pub const DEFAULT_HOURS_BACK: i64 = 24;
pub const DEFAULT_INTERVAL_MINUTES: i64 = 5;
pub const DEFAULT_STEP_PAUSE: Duration = Duration::from_millis(10);

pub const DEFAULT_MEASUREMENT: &str = "mqtt_consumer";
pub const DEFAULT_SNAPSHOT_WINDOW: usize = 100;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub connect_timeout: Duration,
    /// How long disconnect waits for in-flight sends.
    pub drain: Duration,
}

impl BrokerConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BROKER_HOST.into(),
            port: DEFAULT_BROKER_PORT,
            topic: DEFAULT_TOPIC.into(),
            client_id: "fleet_publisher".into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            drain: DEFAULT_DRAIN,
        }
    }
}

/// Rate-paced publishing. `messages: None` keeps going until shutdown.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub messages: Option<u64>,
    pub devices: u32,
    pub rate: f64,
    pub report_every: u64,
    pub seed: Option<u64>,
    pub delivery: Delivery,
}

impl LiveConfig {
    pub fn batch(messages: u64, devices: u32, rate: f64) -> Self {
        Self {
            messages: Some(messages),
            devices,
            rate,
            report_every: DEFAULT_REPORT_EVERY,
            seed: None,
            delivery: Delivery::default(),
        }
    }

    pub fn stream(devices: u32, rate: f64) -> Self {
        Self {
            messages: None,
            devices,
            rate,
            report_every: DEFAULT_STREAM_REPORT_EVERY,
            seed: None,
            delivery: Delivery::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        interval_for(self.rate)?;
        if self.devices == 0 {
            return Err(ConfigError::NoDevices);
        }
        Ok(())
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self::batch(DEFAULT_MESSAGES, DEFAULT_DEVICES, DEFAULT_RATE)
    }
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub devices: u32,
    pub hours_back: i64,
    pub step_minutes: i64,
    /// Pause after each cursor step.
    pub step_pause: Duration,
    pub report_every: u64,
    pub seed: Option<u64>,
    pub delivery: Delivery,
}

impl BackfillConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hours_back <= 0 {
            return Err(ConfigError::NonPositiveWindow(self.hours_back));
        }
        if self.span().is_none() {
            return Err(ConfigError::WindowOutOfRange(self.hours_back));
        }
        if self.step_minutes <= 0 {
            return Err(ConfigError::NonPositiveStep(self.step_minutes));
        }
        if self.step().is_none() {
            return Err(ConfigError::StepOutOfRange(self.step_minutes));
        }
        if self.devices == 0 {
            return Err(ConfigError::NoDevices);
        }
        Ok(())
    }

    /// Length of the window, `None` when it overflows a duration.
    pub fn span(&self) -> Option<time::Duration> {
        self.hours_back.checked_mul(3600).map(time::Duration::seconds)
    }

    pub fn step(&self) -> Option<time::Duration> {
        self.step_minutes.checked_mul(60).map(time::Duration::seconds)
    }

    /// Points each entity receives: `floor(hours * 60 / step) + 1`.
    pub fn points_per_entity(&self) -> u64 {
        if self.hours_back <= 0 || self.step_minutes <= 0 {
            return 0;
        }
        (self.hours_back.saturating_mul(60) / self.step_minutes) as u64 + 1
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            devices: DEFAULT_DEVICES,
            hours_back: DEFAULT_HOURS_BACK,
            step_minutes: DEFAULT_INTERVAL_MINUTES,
            step_pause: DEFAULT_STEP_PAUSE,
            report_every: DEFAULT_REPORT_EVERY,
            seed: None,
            delivery: Delivery::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub measurement: String,
    pub snapshot_window: usize,
    pub history_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            measurement: DEFAULT_MEASUREMENT.into(),
            snapshot_window: DEFAULT_SNAPSHOT_WINDOW,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}
