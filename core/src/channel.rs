use async_trait::async_trait;

use crate::error::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    #[default]
    AtMostOnce,
    AtLeastOnce,
}

/// Outbound side of a topic-based broker.
///
/// `disconnect` must wait for sends that were accepted but not yet flushed.
#[async_trait]
pub trait MessageChannel: Send {
    fn endpoint(&self) -> String;

    async fn connect(&mut self) -> Result<(), ChannelError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        delivery: Delivery,
    ) -> Result<(), ChannelError>;

    async fn disconnect(&mut self) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub topic: String,
    pub payload: Vec<u8>,
    pub delivery: Delivery,
}

/// Keeps published messages in memory, with optional injected failures.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    pub messages: Vec<Recorded>,
    connected: bool,
    refuse_connect: bool,
    fail_every: Option<u64>,
    attempts: u64,
    disconnects: u32,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect attempt fails.
    pub fn refusing() -> Self {
        Self {
            refuse_connect: true,
            ..Self::default()
        }
    }

    /// Every `n`-th publish attempt fails.
    pub fn failing_every(n: u64) -> Self {
        Self {
            fail_every: Some(n.max(1)),
            ..Self::default()
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }
}

#[async_trait]
impl MessageChannel for RecordingChannel {
    fn endpoint(&self) -> String {
        "memory".to_string()
    }

    async fn connect(&mut self) -> Result<(), ChannelError> {
        if self.refuse_connect {
            return Err(ChannelError::Connect {
                endpoint: self.endpoint(),
                reason: "connection refused".to_string(),
            });
        }
        self.connected = true;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        delivery: Delivery,
    ) -> Result<(), ChannelError> {
        if !self.connected {
            return Err(ChannelError::NotConnected);
        }
        self.attempts += 1;
        if let Some(n) = self.fail_every
            && self.attempts % n == 0
        {
            return Err(ChannelError::Publish {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.messages.push(Recorded {
            topic: topic.to_string(),
            payload,
            delivery,
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ChannelError> {
        self.disconnects += 1;
        self.connected = false;
        Ok(())
    }
}
