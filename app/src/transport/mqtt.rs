use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use fleet_core::{BrokerConfig, ChannelError, Delivery, MessageChannel, stopped};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Inbound;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 1024;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

fn qos(delivery: Delivery) -> QoS {
    match delivery {
        Delivery::AtMostOnce => QoS::AtMostOnce,
        Delivery::AtLeastOnce => QoS::AtLeastOnce,
    }
}

fn options(broker: &BrokerConfig, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, &broker.host, broker.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);
    options
}

/// Polls until the broker answers the CONNECT.
async fn await_connack(eventloop: &mut EventLoop) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(format!("broker refused connection: {:?}", ack.code))
                };
            }
            Ok(_) => {}
            Err(err) => return Err(err.to_string()),
        }
    }
}

async fn connect_within(
    broker: &BrokerConfig,
    eventloop: &mut EventLoop,
) -> Result<(), ChannelError> {
    let endpoint = broker.endpoint();
    match tokio::time::timeout(broker.connect_timeout, await_connack(eventloop)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(reason)) => Err(ChannelError::Connect { endpoint, reason }),
        Err(_) => Err(ChannelError::ConnectTimeout {
            endpoint,
            timeout: broker.connect_timeout,
        }),
    }
}

/// Keeps the connection alive until the DISCONNECT packet has been written.
async fn drive(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("mqtt disconnect written");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                warn!("mqtt connection error: {err}");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

pub struct MqttChannel {
    broker: BrokerConfig,
    client: Option<AsyncClient>,
    driver: Option<JoinHandle<()>>,
}

impl MqttChannel {
    pub fn new(broker: BrokerConfig) -> Self {
        Self {
            broker,
            client: None,
            driver: None,
        }
    }
}

#[async_trait]
impl MessageChannel for MqttChannel {
    fn endpoint(&self) -> String {
        self.broker.endpoint()
    }

    async fn connect(&mut self) -> Result<(), ChannelError> {
        let (client, mut eventloop) =
            AsyncClient::new(options(&self.broker, &self.broker.client_id), REQUEST_CAPACITY);
        connect_within(&self.broker, &mut eventloop).await?;
        info!(endpoint = %self.endpoint(), "mqtt connected");
        self.driver = Some(tokio::spawn(drive(eventloop)));
        self.client = Some(client);
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        delivery: Delivery,
    ) -> Result<(), ChannelError> {
        let client = self.client.as_ref().ok_or(ChannelError::NotConnected)?;
        client
            .publish(topic, qos(delivery), false, payload)
            .await
            .map_err(|err| ChannelError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    async fn disconnect(&mut self) -> Result<(), ChannelError> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        let result = client
            .disconnect()
            .await
            .map_err(|err| ChannelError::Disconnect(err.to_string()));

        if let Some(mut driver) = self.driver.take()
            && tokio::time::timeout(self.broker.drain, &mut driver)
                .await
                .is_err()
        {
            warn!(drain = ?self.broker.drain, "queued messages not flushed before drain deadline");
            driver.abort();
        }
        result
    }
}

/// Ingest side: subscribes with its own client id and resubscribes after
/// every reconnect, since sessions are clean.
pub async fn subscribe(
    broker: &BrokerConfig,
    sink: mpsc::Sender<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let client_id = format!("{}_ingest", broker.client_id);
    let (client, mut eventloop) = AsyncClient::new(options(broker, &client_id), REQUEST_CAPACITY);
    connect_within(broker, &mut eventloop)
        .await
        .context("connect mqtt ingest client")?;
    client
        .subscribe(broker.topic.as_str(), QoS::AtMostOnce)
        .await
        .with_context(|| format!("subscribe {}", broker.topic))?;
    info!(endpoint = %broker.endpoint(), topic = %broker.topic, "mqtt ingest subscribed");

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if sink.send(Inbound::now(publish.payload.to_vec())).await.is_err() {
                        debug!("ingest sink closed");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt reconnected, resubscribing");
                    client
                        .subscribe(broker.topic.as_str(), QoS::AtMostOnce)
                        .await
                        .with_context(|| format!("resubscribe {}", broker.topic))?;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt ingest connection error: {err}");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            },
        }
    }

    if let Err(err) = client.disconnect().await {
        debug!("mqtt ingest disconnect: {err}");
    }
    Ok(())
}
