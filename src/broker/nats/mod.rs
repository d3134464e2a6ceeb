//! NATS JetStream broker implementation.
//!
//! Durable consumers are JetStream push consumers with flow control and idle
//! heartbeats. A subscription is a spawned task that drains the consumer's
//! message stream into the iterator's bounded delivery channel; when the
//! channel is full the task waits, and the server's flow control throttles
//! delivery.
//!
//! # Configuration
//!
//! ```yaml
//! connection:
//!   urls: ["nats://localhost:4222"]
//!   connection_name: "orders-bridge"
//!   max_reconnects: 5
//!   reconnect_wait_secs: 5
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{self as js, push},
    context::{PublishError, PublishErrorKind},
    Context,
};
use async_trait::async_trait;
use backon::{BackoffBuilder, ConstantBuilder};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    AckPolicy, BrokerError, BrokerMessage, Connection, ConsumerConfig, ConsumerInfo,
    DeliverPolicy, Delivery, MessageMetadata, PublishOptions, ReplayPolicy, Result,
    StreamContext, Subscription,
};
use crate::config::ConnectionConfig;

/// Wait between publish retries when none is configured.
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_millis(250);

/// Publish retries when none are configured.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 2;

/// Connect to the NATS servers listed in `config`.
pub async fn connect(config: &ConnectionConfig) -> Result<NatsConnection> {
    let reconnect_wait = Duration::from_secs(config.reconnect_wait_secs);

    let mut options = async_nats::ConnectOptions::new()
        .max_reconnects(config.max_reconnects)
        .reconnect_delay_callback(move |_| reconnect_wait);

    if let Some(ref name) = config.connection_name {
        options = options.name(name);
    }

    let client = options
        .connect(config.urls.as_slice())
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))?;

    info!(urls = ?config.urls, "Connected to NATS");

    Ok(NatsConnection::new(client))
}

/// Connection to a NATS server with JetStream enabled.
pub struct NatsConnection {
    client: async_nats::Client,
    closed: AtomicBool,
}

impl NatsConnection {
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connection for NatsConnection {
    fn stream_context(&self) -> Result<Arc<dyn StreamContext>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        Ok(Arc::new(NatsStreamContext {
            context: jetstream::new(self.client.clone()),
        }))
    }

    /// Drain the client: subscriptions are closed, pending writes flushed,
    /// and the connection shut down. Later commands on any handle fail.
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.client
            .drain()
            .await
            .map_err(|e| BrokerError::Connection(format!("drain on close: {}", e)))?;

        info!("NATS connection closed");
        Ok(())
    }
}

/// JetStream context bound to one connection.
pub struct NatsStreamContext {
    context: Context,
}

impl NatsStreamContext {
    async fn publish_once(&self, subject: &str, payload: Bytes) -> std::result::Result<(), PublishError> {
        self.context
            .publish(subject.to_string(), payload)
            .await?
            .await?;
        Ok(())
    }
}

/// Whether a publish failed only because no stream answered yet.
fn is_no_responders(error: &PublishError) -> bool {
    matches!(error.kind(), PublishErrorKind::StreamNotFound)
}

fn to_push_config(config: &ConsumerConfig) -> push::Config {
    push::Config {
        durable_name: Some(config.durable_name.clone()),
        deliver_subject: config.deliver_subject.clone(),
        deliver_policy: match config.deliver_policy {
            DeliverPolicy::All => js::DeliverPolicy::All,
            DeliverPolicy::New => js::DeliverPolicy::New,
            DeliverPolicy::ByStartSequence { start_sequence } => {
                js::DeliverPolicy::ByStartSequence { start_sequence }
            }
        },
        ack_policy: match config.ack_policy {
            AckPolicy::Explicit => js::AckPolicy::Explicit,
            AckPolicy::All => js::AckPolicy::All,
            AckPolicy::None => js::AckPolicy::None,
        },
        replay_policy: match config.replay_policy {
            ReplayPolicy::Instant => js::ReplayPolicy::Instant,
            ReplayPolicy::Original => js::ReplayPolicy::Original,
        },
        flow_control: config.flow_control,
        idle_heartbeat: config.idle_heartbeat,
        ..Default::default()
    }
}

#[async_trait]
impl StreamContext for NatsStreamContext {
    async fn create_consumer(
        &self,
        stream: &str,
        config: &ConsumerConfig,
    ) -> Result<ConsumerInfo> {
        let js_stream = self
            .context
            .get_stream(stream)
            .await
            .map_err(|e| BrokerError::ConsumerCreate(format!("get stream {}: {}", stream, e)))?;

        let consumer: js::PushConsumer = js_stream
            .create_consumer(to_push_config(config))
            .await
            .map_err(|e| BrokerError::ConsumerCreate(e.to_string()))?;

        let info = consumer.cached_info();

        Ok(ConsumerInfo {
            stream: info.stream_name.clone(),
            name: info.name.clone(),
            config: config.clone(),
        })
    }

    async fn subscribe(
        &self,
        subject: &str,
        deliveries: mpsc::Sender<Delivery>,
        consumer: &ConsumerInfo,
    ) -> Result<Box<dyn Subscription>> {
        let js_stream = self
            .context
            .get_stream(&consumer.stream)
            .await
            .map_err(|e| BrokerError::Subscribe(format!("get stream: {}", e)))?;

        let push_consumer: js::PushConsumer = js_stream
            .get_consumer(&consumer.name)
            .await
            .map_err(|e| BrokerError::Subscribe(format!("bind durable {}: {}", consumer.name, e)))?;

        let mut messages = push_consumer
            .messages()
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        let consumer_name = consumer.name.clone();
        let task = tokio::spawn(async move {
            while let Some(delivery) = messages.next().await {
                match delivery {
                    Ok(message) => {
                        if deliveries.send(Box::new(NatsMessage { message })).await.is_err() {
                            debug!(consumer = %consumer_name, "Delivery channel closed");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(consumer = %consumer_name, error = %e, "JetStream delivery error");
                    }
                }
            }
        });

        Ok(Box::new(NatsSubscription {
            subject: subject.to_string(),
            task: Some(task),
        }))
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<()> {
        let js_stream = self
            .context
            .get_stream(stream)
            .await
            .map_err(|e| BrokerError::DeleteConsumer(format!("get stream {}: {}", stream, e)))?;

        js_stream
            .delete_consumer(consumer)
            .await
            .map_err(|e| BrokerError::DeleteConsumer(e.to_string()))?;

        info!(stream = %stream, consumer = %consumer, "Deleted consumer");
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes, options: &PublishOptions) -> Result<()> {
        let wait = options.retry_wait().unwrap_or(DEFAULT_RETRY_WAIT);
        let retries = options.retry_attempts().unwrap_or(DEFAULT_RETRY_ATTEMPTS);

        retry_publish(subject, wait, retries, is_no_responders, || {
            self.publish_once(subject, payload.clone())
        })
        .await
    }
}

/// Run `attempt` once, then up to `retries` more times while `retryable`
/// accepts the error, waiting `wait` before each retry.
async fn retry_publish<F, Fut, E>(
    subject: &str,
    wait: Duration,
    retries: u32,
    retryable: impl Fn(&E) -> bool,
    mut attempt: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: std::fmt::Display,
{
    let backoff = ConstantBuilder::default()
        .with_delay(wait)
        .with_max_times(retries as usize)
        .build();

    let mut last_error = None;

    for (n, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
        if n > 0 {
            tokio::time::sleep(delay).await;
        }

        match attempt().await {
            Ok(()) => return Ok(()),
            Err(e) if retryable(&e) => {
                warn!(
                    subject = %subject,
                    attempt = n + 1,
                    max_retries = retries,
                    error = %e,
                    "No stream responded to publish, retrying..."
                );
                last_error = Some(e);
            }
            Err(e) => return Err(BrokerError::Publish(e.to_string())),
        }
    }

    Err(BrokerError::Publish(
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "retries exhausted".to_string()),
    ))
}

/// Push subscription backed by a forwarding task.
struct NatsSubscription {
    subject: String,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Subscription for NatsSubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        // dropping the aborted task's message stream ends the core subscription
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(subject = %self.subject, "Unsubscribed");
        }
        Ok(())
    }
}

impl Drop for NatsSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct NatsMessage {
    message: jetstream::Message,
}

#[async_trait]
impl BrokerMessage for NatsMessage {
    fn metadata(&self) -> Result<MessageMetadata> {
        let info = self
            .message
            .info()
            .map_err(|e| BrokerError::Metadata(e.to_string()))?;

        let timestamp =
            DateTime::<Utc>::from_timestamp(info.published.unix_timestamp(), info.published.nanosecond())
                .unwrap_or_default();

        Ok(MessageMetadata {
            stream_sequence: info.stream_sequence,
            timestamp,
        })
    }

    fn payload(&self) -> Bytes {
        self.message.payload.clone()
    }

    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::broker::{PublishOption, HEARTBEAT_INTERVAL};

    fn config(deliver_policy: DeliverPolicy, ack_policy: AckPolicy) -> ConsumerConfig {
        ConsumerConfig {
            durable_name: "orders-durable".to_string(),
            deliver_subject: "orders-durable.ORDERS".to_string(),
            deliver_policy,
            ack_policy,
            replay_policy: ReplayPolicy::Instant,
            flow_control: true,
            idle_heartbeat: HEARTBEAT_INTERVAL,
        }
    }

    #[test]
    fn test_push_config_carries_fields() {
        let push = to_push_config(&config(DeliverPolicy::All, AckPolicy::Explicit));
        assert_eq!(push.durable_name.as_deref(), Some("orders-durable"));
        assert_eq!(push.deliver_subject, "orders-durable.ORDERS");
        assert_eq!(push.deliver_policy, js::DeliverPolicy::All);
        assert_eq!(push.ack_policy, js::AckPolicy::Explicit);
        assert_eq!(push.replay_policy, js::ReplayPolicy::Instant);
        assert!(push.flow_control);
        assert_eq!(push.idle_heartbeat, Duration::from_secs(2));
    }

    #[test]
    fn test_push_config_start_sequence() {
        let push = to_push_config(&config(
            DeliverPolicy::ByStartSequence { start_sequence: 12 },
            AckPolicy::None,
        ));
        assert_eq!(
            push.deliver_policy,
            js::DeliverPolicy::ByStartSequence { start_sequence: 12 }
        );
        assert_eq!(push.ack_policy, js::AckPolicy::None);
    }

    #[derive(Debug)]
    enum FakePublishError {
        NoResponders,
        Rejected,
    }

    impl std::fmt::Display for FakePublishError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::NoResponders => f.write_str("no responders"),
                Self::Rejected => f.write_str("rejected"),
            }
        }
    }

    fn no_responders(error: &FakePublishError) -> bool {
        matches!(error, FakePublishError::NoResponders)
    }

    const WAIT: Duration = Duration::from_millis(1);

    #[tokio::test]
    async fn test_retry_succeeds_after_no_responders() {
        let calls = AtomicU32::new(0);

        let result = retry_publish("orders", WAIT, 3, no_responders, || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call < 3 {
                    Err(FakePublishError::NoResponders)
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_makes_one_attempt_plus_retries() {
        let calls = AtomicU32::new(0);

        let result = retry_publish("orders", WAIT, 2, no_responders, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FakePublishError::NoResponders) }
        })
        .await;

        assert!(matches!(result, Err(BrokerError::Publish(ref msg)) if msg == "no responders"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_zero_retries_attempts_once() {
        let calls = AtomicU32::new(0);

        let result = retry_publish("orders", WAIT, 0, no_responders, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FakePublishError::NoResponders) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_returns_other_errors_at_once() {
        let calls = AtomicU32::new(0);

        let result = retry_publish("orders", WAIT, 5, no_responders, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FakePublishError::Rejected) }
        })
        .await;

        assert!(matches!(result, Err(BrokerError::Publish(ref msg)) if msg == "rejected"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_waits_between_attempts() {
        let calls = AtomicU32::new(0);
        let started = std::time::Instant::now();

        let _ = retry_publish("orders", Duration::from_millis(30), 2, no_responders, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FakePublishError::NoResponders) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_retry_defaults_apply_to_empty_options() {
        let options = PublishOptions::default();
        assert_eq!(options.retry_wait().unwrap_or(DEFAULT_RETRY_WAIT), DEFAULT_RETRY_WAIT);

        let options = PublishOptions::new(vec![PublishOption::RetryAttempts(5)]);
        assert_eq!(options.retry_attempts().unwrap_or(DEFAULT_RETRY_ATTEMPTS), 5);
    }
}
