//! In-memory broker for testing.
//!
//! Records every consumer registration, publish, ack, and teardown call so
//! tests can assert on what the cores asked of the broker. Messages are
//! injected with [`MockBroker::deliver`], which feeds the delivery channel of
//! the most recent subscription exactly like a push consumer would.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};

use super::{
    BrokerError, BrokerMessage, Connection, ConsumerConfig, ConsumerInfo, Delivery,
    MessageMetadata, PublishOptions, Result, StreamContext, Subscription,
};

/// A publish call captured by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Bytes,
    pub options: PublishOptions,
}

#[derive(Default)]
struct MockState {
    consumers: RwLock<Vec<ConsumerInfo>>,
    deleted_consumers: RwLock<Vec<(String, String)>>,
    deliveries: RwLock<Option<mpsc::Sender<Delivery>>>,
    published: RwLock<Vec<PublishedMessage>>,
    acked: RwLock<Vec<u64>>,
    unsubscribe_count: RwLock<usize>,
    close_count: RwLock<usize>,
    fail_on_create_consumer: RwLock<bool>,
    fail_on_delete_consumer: RwLock<bool>,
    fail_on_unsubscribe: RwLock<bool>,
    fail_on_publish: RwLock<bool>,
    fail_on_ack: RwLock<bool>,
    ack_delay: RwLock<Duration>,
}

/// Mock broker implementing both [`Connection`] and [`StreamContext`].
///
/// Clones share state, so a test can keep one handle while the core under
/// test owns another.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<MockState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a message into the live subscription's delivery channel.
    ///
    /// Waits while the channel is full.
    pub async fn deliver(
        &self,
        stream_sequence: u64,
        timestamp: DateTime<Utc>,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        let sender = self
            .state
            .deliveries
            .read()
            .await
            .clone()
            .ok_or_else(|| BrokerError::Subscribe("no live subscription".to_string()))?;

        let message = MockMessage {
            stream_sequence,
            timestamp,
            payload: payload.into(),
            state: Arc::clone(&self.state),
        };

        sender
            .send(Box::new(message))
            .await
            .map_err(|_| BrokerError::Closed)
    }

    pub async fn set_fail_on_create_consumer(&self, fail: bool) {
        *self.state.fail_on_create_consumer.write().await = fail;
    }

    pub async fn set_fail_on_delete_consumer(&self, fail: bool) {
        *self.state.fail_on_delete_consumer.write().await = fail;
    }

    pub async fn set_fail_on_unsubscribe(&self, fail: bool) {
        *self.state.fail_on_unsubscribe.write().await = fail;
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.state.fail_on_publish.write().await = fail;
    }

    pub async fn set_fail_on_ack(&self, fail: bool) {
        *self.state.fail_on_ack.write().await = fail;
    }

    /// Make every message ack wait this long before completing.
    pub async fn set_ack_delay(&self, delay: Duration) {
        *self.state.ack_delay.write().await = delay;
    }

    pub async fn consumers(&self) -> Vec<ConsumerInfo> {
        self.state.consumers.read().await.clone()
    }

    pub async fn deleted_consumers(&self) -> Vec<(String, String)> {
        self.state.deleted_consumers.read().await.clone()
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.read().await.clone()
    }

    /// Stream sequences acked so far, in ack order.
    pub async fn acked(&self) -> Vec<u64> {
        self.state.acked.read().await.clone()
    }

    pub async fn unsubscribe_count(&self) -> usize {
        *self.state.unsubscribe_count.read().await
    }

    pub async fn close_count(&self) -> usize {
        *self.state.close_count.read().await
    }

    pub async fn is_closed(&self) -> bool {
        self.close_count().await > 0
    }

    async fn ensure_open(&self) -> Result<()> {
        if self.is_closed().await {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MockBroker {
    fn stream_context(&self) -> Result<Arc<dyn StreamContext>> {
        Ok(Arc::new(self.clone()))
    }

    async fn close(&self) -> Result<()> {
        *self.state.close_count.write().await += 1;
        Ok(())
    }
}

#[async_trait]
impl StreamContext for MockBroker {
    async fn create_consumer(
        &self,
        stream: &str,
        config: &ConsumerConfig,
    ) -> Result<ConsumerInfo> {
        self.ensure_open().await?;

        if *self.state.fail_on_create_consumer.read().await {
            return Err(BrokerError::ConsumerCreate(
                "mock consumer failure".to_string(),
            ));
        }

        let info = ConsumerInfo {
            stream: stream.to_string(),
            name: config.durable_name.clone(),
            config: config.clone(),
        };
        self.state.consumers.write().await.push(info.clone());
        Ok(info)
    }

    async fn subscribe(
        &self,
        subject: &str,
        deliveries: mpsc::Sender<Delivery>,
        _consumer: &ConsumerInfo,
    ) -> Result<Box<dyn Subscription>> {
        self.ensure_open().await?;

        *self.state.deliveries.write().await = Some(deliveries);
        Ok(Box::new(MockSubscription {
            subject: subject.to_string(),
            state: Arc::clone(&self.state),
            active: true,
        }))
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<()> {
        if *self.state.fail_on_delete_consumer.read().await {
            return Err(BrokerError::DeleteConsumer(
                "mock delete failure".to_string(),
            ));
        }

        self.state
            .deleted_consumers
            .write()
            .await
            .push((stream.to_string(), consumer.to_string()));
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes, options: &PublishOptions) -> Result<()> {
        self.ensure_open().await?;

        if *self.state.fail_on_publish.read().await {
            return Err(BrokerError::Publish("mock publish failure".to_string()));
        }

        self.state.published.write().await.push(PublishedMessage {
            subject: subject.to_string(),
            payload,
            options: options.clone(),
        });
        Ok(())
    }
}

struct MockSubscription {
    subject: String,
    state: Arc<MockState>,
    active: bool,
}

#[async_trait]
impl Subscription for MockSubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        if *self.state.fail_on_unsubscribe.read().await {
            return Err(BrokerError::Unsubscribe(
                "mock unsubscribe failure".to_string(),
            ));
        }

        *self.state.deliveries.write().await = None;
        *self.state.unsubscribe_count.write().await += 1;
        self.active = false;
        Ok(())
    }
}

struct MockMessage {
    stream_sequence: u64,
    timestamp: DateTime<Utc>,
    payload: Bytes,
    state: Arc<MockState>,
}

#[async_trait]
impl BrokerMessage for MockMessage {
    fn metadata(&self) -> Result<MessageMetadata> {
        Ok(MessageMetadata {
            stream_sequence: self.stream_sequence,
            timestamp: self.timestamp,
        })
    }

    fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    async fn ack(&self) -> Result<()> {
        let delay = *self.state.ack_delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if *self.state.fail_on_ack.read().await {
            return Err(BrokerError::Ack("mock ack failure".to_string()));
        }
        self.state.acked.write().await.push(self.stream_sequence);
        Ok(())
    }
}
