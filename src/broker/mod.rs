//! Broker collaborator interface.
//!
//! This module contains:
//! - `Connection` / `StreamContext` / `Subscription` / `BrokerMessage` traits:
//!   the capabilities the source and destination cores need from a
//!   JetStream-like broker
//! - Consumer configuration and publish option types
//! - Implementations: NATS JetStream (`async-nats`), Mock

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;

// Implementation modules
pub mod mock;
#[cfg(feature = "nats")]
pub mod nats;

// Re-exports
pub use mock::MockBroker;
#[cfg(feature = "nats")]
pub use nats::{connect, NatsConnection};

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors reported by the broker collaborator.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("connect: {0}")]
    Connection(String),

    #[error("get stream context: {0}")]
    StreamContext(String),

    #[error("add consumer: {0}")]
    ConsumerCreate(String),

    #[error("subscribe: {0}")]
    Subscribe(String),

    #[error("unsubscribe: {0}")]
    Unsubscribe(String),

    #[error("delete consumer: {0}")]
    DeleteConsumer(String),

    #[error("get message metadata: {0}")]
    Metadata(String),

    #[error("ack message: {0}")]
    Ack(String),

    #[error("publish: {0}")]
    Publish(String),

    #[error("connection closed")]
    Closed,
}

// ============================================================================
// Consumer configuration
// ============================================================================

/// Heartbeat interval for push consumers.
///
/// Lets the client detect a push subscription the server has silently
/// stopped serving.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Where in the stream a new consumer starts receiving messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// From the earliest message in the stream.
    #[default]
    All,
    /// Only messages published after the consumer is created.
    New,
    /// From a specific stream sequence.
    ByStartSequence { start_sequence: u64 },
}

impl DeliverPolicy {
    /// The start sequence, if this policy carries one.
    pub fn start_sequence(&self) -> Option<u64> {
        match self {
            Self::ByStartSequence { start_sequence } => Some(*start_sequence),
            _ => None,
        }
    }
}

/// Which delivered messages need acknowledgement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// Every message is acked individually.
    #[default]
    Explicit,
    /// Acking a message acks every message before it.
    All,
    /// No acks are expected.
    None,
}

impl fmt::Display for AckPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Explicit => "explicit",
            Self::All => "all",
            Self::None => "none",
        };
        f.write_str(name)
    }
}

/// How fast messages are replayed to the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplayPolicy {
    #[default]
    Instant,
    Original,
}

/// Durable push consumer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub durable_name: String,
    pub deliver_subject: String,
    pub deliver_policy: DeliverPolicy,
    pub ack_policy: AckPolicy,
    pub replay_policy: ReplayPolicy,
    pub flow_control: bool,
    pub idle_heartbeat: Duration,
}

/// Broker-side identity of a created consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    /// Stream the consumer reads from.
    pub stream: String,
    /// Consumer name.
    pub name: String,
    /// Configuration the consumer was created with.
    pub config: ConsumerConfig,
}

// ============================================================================
// Publish options
// ============================================================================

/// A single option attached to a publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOption {
    /// Wait between publish attempts.
    RetryWait(Duration),
    /// Number of retries after the first attempt.
    RetryAttempts(u32),
}

/// Immutable set of options attached to every publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions(Vec<PublishOption>);

impl PublishOptions {
    pub fn new(options: Vec<PublishOption>) -> Self {
        Self(options)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PublishOption> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Configured wait between attempts, if any.
    pub fn retry_wait(&self) -> Option<Duration> {
        self.0.iter().find_map(|option| match option {
            PublishOption::RetryWait(wait) => Some(*wait),
            _ => None,
        })
    }

    /// Configured retry count, if any.
    pub fn retry_attempts(&self) -> Option<u32> {
        self.0.iter().find_map(|option| match option {
            PublishOption::RetryAttempts(attempts) => Some(*attempts),
            _ => None,
        })
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Metadata the broker attaches to a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMetadata {
    /// Sequence of the message within its stream.
    pub stream_sequence: u64,
    /// When the message was stored. The zero value (`UNIX_EPOCH`) means
    /// the broker did not supply one.
    pub timestamp: DateTime<Utc>,
}

/// A message delivered through a subscription.
#[async_trait]
pub trait BrokerMessage: Send + Sync {
    /// Stream sequence and timestamp of the message.
    fn metadata(&self) -> Result<MessageMetadata>;

    /// Message body.
    fn payload(&self) -> Bytes;

    /// Acknowledge the message with the broker.
    async fn ack(&self) -> Result<()>;
}

/// Message handed from a subscription to its delivery channel.
pub type Delivery = Box<dyn BrokerMessage>;

/// A live push subscription feeding a delivery channel.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Subject the subscription was made on.
    fn subject(&self) -> &str;

    /// Stop deliveries. Calling it again is a no-op.
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// JetStream operations available on a connection.
#[async_trait]
pub trait StreamContext: Send + Sync {
    /// Register a durable consumer on `stream`.
    async fn create_consumer(&self, stream: &str, config: &ConsumerConfig)
        -> Result<ConsumerInfo>;

    /// Bind to an existing consumer and forward its messages into `deliveries`.
    ///
    /// The sender blocks while the channel is full; accepted messages are
    /// never dropped.
    async fn subscribe(
        &self,
        subject: &str,
        deliveries: mpsc::Sender<Delivery>,
        consumer: &ConsumerInfo,
    ) -> Result<Box<dyn Subscription>>;

    /// Remove a consumer registration.
    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<()>;

    /// Publish `payload` and wait for the stream to store it.
    async fn publish(&self, subject: &str, payload: Bytes, options: &PublishOptions) -> Result<()>;
}

/// An established broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// JetStream context for this connection.
    fn stream_context(&self) -> Result<Arc<dyn StreamContext>>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> Result<()>;
}
