use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Rejected before a run starts.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("rate must be a positive number of messages per second, got {0}")]
    NonPositiveRate(f64),
    #[error("rate {0} gives a publish interval too long to represent")]
    UnrepresentableRate(f64),
    #[error("hours back must be positive, got {0}")]
    NonPositiveWindow(i64),
    #[error("{0} hours back reaches outside the supported date range")]
    WindowOutOfRange(i64),
    #[error("step minutes must be positive, got {0}")]
    NonPositiveStep(i64),
    #[error("step of {0} minutes is too large")]
    StepOutOfRange(i64),
    #[error("device count must be at least 1")]
    NoDevices,
    #[error("topic must not be empty")]
    EmptyTopic,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },
    #[error("channel is not connected")]
    NotConnected,
    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("disconnect failed: {0}")]
    Disconnect(String),
}

/// Fatal outcome of a publish run. Per-message failures never surface here.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("connection failed: {0}")]
    Connection(#[source] ChannelError),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("query on '{measurement}' failed: {source}")]
    Query {
        measurement: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("payload is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error(transparent)]
    Store(#[from] StoreError),
}
