use anyhow::{Result, bail};
use async_trait::async_trait;
use clap::ValueEnum;
use fleet_core::{BrokerConfig, ChannelError, Delivery, MessageChannel};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

mod mqtt;
mod zmq;

pub use mqtt::MqttChannel;
pub use zmq::ZmqChannel;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    Mqtt,
    Zmq,
    /// Accept and discard every message without touching the network.
    DryRun,
}

pub fn channel_for(transport: Transport, broker: &BrokerConfig) -> Box<dyn MessageChannel> {
    match transport {
        Transport::Mqtt => Box::new(MqttChannel::new(broker.clone())),
        Transport::Zmq => Box::new(ZmqChannel::new(broker.clone())),
        Transport::DryRun => Box::new(DryRunChannel::default()),
    }
}

/// A subscribed message, stamped when it came off the wire.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub payload: Vec<u8>,
    pub received_at: OffsetDateTime,
}

impl Inbound {
    pub fn now(payload: Vec<u8>) -> Self {
        Self {
            payload,
            received_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Forwards every message on `broker.topic` into `sink` until shutdown or
/// until the sink is closed.
pub async fn subscribe(
    transport: Transport,
    broker: &BrokerConfig,
    sink: mpsc::Sender<Inbound>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    match transport {
        Transport::Mqtt => mqtt::subscribe(broker, sink, shutdown).await,
        Transport::Zmq => zmq::subscribe(broker, sink, shutdown).await,
        Transport::DryRun => bail!("the dry-run transport has nothing to subscribe to"),
    }
}

#[derive(Debug, Default)]
pub struct DryRunChannel {
    connected: bool,
    published: u64,
}

#[async_trait]
impl MessageChannel for DryRunChannel {
    fn endpoint(&self) -> String {
        "dry-run".to_string()
    }

    async fn connect(&mut self) -> Result<(), ChannelError> {
        self.connected = true;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        _delivery: Delivery,
    ) -> Result<(), ChannelError> {
        if !self.connected {
            return Err(ChannelError::NotConnected);
        }
        self.published += 1;
        debug!(topic, bytes = payload.len(), "dry-run publish");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ChannelError> {
        self.connected = false;
        info!(published = self.published, "dry-run channel closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dry_run_needs_connect() {
        let mut channel = channel_for(Transport::DryRun, &BrokerConfig::default());
        assert_eq!(channel.endpoint(), "dry-run");
        assert!(
            channel
                .publish("t", b"{}".to_vec(), Delivery::AtMostOnce)
                .await
                .is_err()
        );
        channel.connect().await.unwrap();
        channel
            .publish("t", b"{}".to_vec(), Delivery::AtMostOnce)
            .await
            .unwrap();
        channel.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn dry_run_cannot_subscribe() {
        let (tx, _rx) = mpsc::channel(1);
        let (_stop, shutdown) = watch::channel(false);
        let err = subscribe(Transport::DryRun, &BrokerConfig::default(), tx, shutdown)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dry-run"));
    }

    #[test]
    fn endpoints_follow_broker_config() {
        let broker = BrokerConfig {
            host: "10.0.0.5".into(),
            port: 5599,
            ..BrokerConfig::default()
        };
        assert_eq!(channel_for(Transport::Mqtt, &broker).endpoint(), "10.0.0.5:5599");
        assert_eq!(
            channel_for(Transport::Zmq, &broker).endpoint(),
            "tcp://10.0.0.5:5599"
        );
    }
}
