use anyhow::{Context as _, Result};
use async_trait::async_trait;
use fleet_core::{BrokerConfig, ChannelError, Delivery, MessageChannel, stopped};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use zeromq::{Socket, SocketRecv, SocketSend};

use super::Inbound;

fn endpoint_of(broker: &BrokerConfig) -> String {
    format!("tcp://{}:{}", broker.host, broker.port)
}

/// PUB socket that connects out to the ingest side, which binds.
///
/// Multipart frames: topic, then the JSON payload. ZeroMQ has no
/// acknowledgements, so every delivery mode is best effort.
pub struct ZmqChannel {
    broker: BrokerConfig,
    socket: Option<zeromq::PubSocket>,
}

impl ZmqChannel {
    pub fn new(broker: BrokerConfig) -> Self {
        Self {
            broker,
            socket: None,
        }
    }
}

#[async_trait]
impl MessageChannel for ZmqChannel {
    fn endpoint(&self) -> String {
        endpoint_of(&self.broker)
    }

    async fn connect(&mut self) -> Result<(), ChannelError> {
        let endpoint = self.endpoint();
        let mut socket = zeromq::PubSocket::new();
        match tokio::time::timeout(self.broker.connect_timeout, socket.connect(&endpoint)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return Err(ChannelError::Connect {
                    endpoint,
                    reason: err.to_string(),
                });
            }
            Err(_) => {
                return Err(ChannelError::ConnectTimeout {
                    endpoint,
                    timeout: self.broker.connect_timeout,
                });
            }
        }
        info!(%endpoint, "zmq pub connected");
        self.socket = Some(socket);
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        _delivery: Delivery,
    ) -> Result<(), ChannelError> {
        let socket = self.socket.as_mut().ok_or(ChannelError::NotConnected)?;
        let mut msg = zeromq::ZmqMessage::from(topic);
        msg.push_back(payload.into());
        socket.send(msg).await.map_err(|err| ChannelError::Publish {
            topic: topic.to_string(),
            reason: err.to_string(),
        })
    }

    async fn disconnect(&mut self) -> Result<(), ChannelError> {
        if let Some(socket) = self.socket.take() {
            // sends are queued per peer; give the writer time before the socket goes
            tokio::time::sleep(self.broker.drain).await;
            drop(socket);
        }
        Ok(())
    }
}

pub async fn subscribe(
    broker: &BrokerConfig,
    sink: mpsc::Sender<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let endpoint = endpoint_of(broker);
    let mut socket = zeromq::SubSocket::new();
    socket
        .bind(&endpoint)
        .await
        .with_context(|| format!("bind zmq sub {endpoint}"))?;
    socket
        .subscribe(&broker.topic)
        .await
        .with_context(|| format!("subscribe {}", broker.topic))?;
    info!(%endpoint, topic = %broker.topic, "zmq ingest listening");

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            msg = socket.recv() => {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!("zmq recv failed: {err}");
                        continue;
                    }
                };
                let Some(payload) = msg.get(1) else {
                    debug!(frames = msg.len(), "skipping message without payload frame");
                    continue;
                };
                if sink.send(Inbound::now(payload.to_vec())).await.is_err() {
                    debug!("ingest sink closed");
                    break;
                }
            }
        }
    }
    Ok(())
}
