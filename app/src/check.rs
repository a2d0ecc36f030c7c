use anyhow::{Context as _, Result};
use fleet_core::{BrokerConfig, Delivery, Reading, probe_reading};
use time::OffsetDateTime;
use tracing::info;

use crate::transport::{self, Transport};

/// Connects, publishes one probe reading and disconnects.
pub async fn run(transport: Transport, broker: &BrokerConfig) -> Result<Reading> {
    broker.validate()?;
    let mut channel = transport::channel_for(transport, broker);
    let endpoint = channel.endpoint();
    info!(%endpoint, topic = %broker.topic, "checking broker");

    channel
        .connect()
        .await
        .with_context(|| format!("connect to {endpoint}"))?;

    let reading = probe_reading(OffsetDateTime::now_utc());
    let payload = reading.to_payload().context("encode probe reading")?;
    let published = channel
        .publish(&broker.topic, payload, Delivery::AtMostOnce)
        .await;
    channel.disconnect().await.context("disconnect")?;
    published.with_context(|| format!("publish probe reading to '{}'", broker.topic))?;

    info!(id = %reading.entity_id, "probe reading published");
    Ok(reading)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dry_run_check_publishes_probe() {
        let reading = run(Transport::DryRun, &BrokerConfig::default())
            .await
            .expect("check");
        assert_eq!(reading.entity_id, "test_001");
        assert_eq!(reading.display_name, "Test_Device");
        assert_eq!(reading.o2, 21.0);
    }

    #[tokio::test]
    async fn empty_topic_is_rejected() {
        let broker = BrokerConfig {
            topic: " ".into(),
            ..BrokerConfig::default()
        };
        assert!(run(Transport::DryRun, &broker).await.is_err());
    }
}
