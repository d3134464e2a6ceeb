//! Pull-based iterator over a durable push consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use super::{consumer_config, IteratorError, IteratorParams, Result};
use crate::broker::{
    AckPolicy, BrokerMessage, Connection, ConsumerInfo, Delivery, MessageMetadata, StreamContext,
    Subscription,
};
use crate::position::{Position, PositionToken};
use crate::record::{Payload, Record};

/// Lifecycle of a [`ReadIterator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    /// Consumer and subscription registered, nothing read yet.
    Created,
    /// At least one read has been attempted.
    Running,
    /// Torn down; no further calls are valid.
    Stopped,
}

/// A delivered message waiting for the pipeline's ack.
struct PendingAck {
    position: PositionToken,
    message: Arc<dyn BrokerMessage>,
}

/// Ack handling, chosen once from the consumer's ack policy.
enum AckTracker {
    /// Ack policy `none`: nothing is tracked and acks always succeed.
    Disabled,
    /// Unacknowledged messages in delivery order.
    ///
    /// `pending` is only locked for plain queue operations, never across an
    /// await. `gate` serializes acks and teardown, so the head cannot change
    /// while its broker ack is in flight.
    Ordered {
        pending: StdMutex<VecDeque<PendingAck>>,
        gate: Mutex<()>,
    },
}

impl AckTracker {
    fn for_policy(policy: AckPolicy) -> Self {
        match policy {
            AckPolicy::None => Self::Disabled,
            AckPolicy::Explicit | AckPolicy::All => Self::Ordered {
                pending: StdMutex::new(VecDeque::new()),
                gate: Mutex::new(()),
            },
        }
    }

    fn lock(pending: &StdMutex<VecDeque<PendingAck>>) -> MutexGuard<'_, VecDeque<PendingAck>> {
        pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a delivered message. Does not await.
    fn track(&self, position: PositionToken, message: Delivery) {
        if let Self::Ordered { pending, .. } = self {
            Self::lock(pending).push_back(PendingAck {
                position,
                message: Arc::from(message),
            });
        }
    }

    /// Ack the head of the queue if it matches `position`.
    ///
    /// The gate is held through the broker ack so check, ack, and pop happen
    /// as one step with respect to other acks.
    async fn ack(&self, position: &PositionToken) -> Result<()> {
        let Self::Ordered { pending, gate } = self else {
            return Ok(());
        };

        let _gate = gate.lock().await;

        let head = {
            let pending = Self::lock(pending);
            let head = pending
                .front()
                .ok_or_else(|| IteratorError::NoUnacknowledged {
                    requested: position.clone(),
                })?;

            if head.position != *position {
                return Err(IteratorError::OutOfOrderAck {
                    requested: position.clone(),
                    head: head.position.clone(),
                });
            }

            Arc::clone(&head.message)
        };

        head.ack().await?;
        Self::lock(pending).pop_front();

        Ok(())
    }

    fn len(&self) -> usize {
        match self {
            Self::Disabled => 0,
            Self::Ordered { pending, .. } => Self::lock(pending).len(),
        }
    }

    /// Forget every pending message without acking it.
    async fn drain(&self) -> usize {
        match self {
            Self::Disabled => 0,
            Self::Ordered { pending, gate } => {
                let _gate = gate.lock().await;
                let mut pending = Self::lock(pending);
                let dropped = pending.len();
                pending.clear();
                dropped
            }
        }
    }
}

/// Reads records from a durable JetStream consumer.
///
/// Messages arrive on a bounded channel filled by the broker subscription.
/// [`next`](Self::next) converts them to records in delivery order and, unless
/// the ack policy is `none`, queues them until [`ack`](Self::ack) is called
/// with the matching position. Acks must follow delivery order exactly.
///
/// The iterator owns its connection and closes it in [`stop`](Self::stop).
pub struct ReadIterator {
    connection: Box<dyn Connection>,
    context: Arc<dyn StreamContext>,
    consumer: ConsumerInfo,
    subject: String,
    messages: Mutex<mpsc::Receiver<Delivery>>,
    subscription: Mutex<Box<dyn Subscription>>,
    acks: AckTracker,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl ReadIterator {
    /// Register the durable consumer and start the subscription.
    pub async fn new(connection: Box<dyn Connection>, params: IteratorParams) -> Result<Self> {
        let config = consumer_config(&params)?;
        let context = connection.stream_context()?;

        let consumer = context.create_consumer(&params.stream, &config).await?;

        info!(
            stream = %consumer.stream,
            consumer = %consumer.name,
            deliver_policy = ?consumer.config.deliver_policy,
            ack_policy = %consumer.config.ack_policy,
            "Created durable consumer"
        );

        // a zero-capacity channel would panic; config validation keeps this >= 64
        let (sender, messages) = mpsc::channel(params.buffer_size.max(1));

        let subscription = context.subscribe(&params.subject, sender, &consumer).await?;
        let subject = subscription.subject().to_string();

        info!(
            subject = %subject,
            buffer_size = params.buffer_size,
            "Subscribed to subject"
        );

        Ok(Self {
            connection,
            context,
            acks: AckTracker::for_policy(consumer.config.ack_policy),
            consumer,
            subject,
            messages: Mutex::new(messages),
            subscription: Mutex::new(subscription),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> IteratorState {
        if self.stopped.load(Ordering::SeqCst) {
            IteratorState::Stopped
        } else if self.running.load(Ordering::SeqCst) {
            IteratorState::Running
        } else {
            IteratorState::Created
        }
    }

    /// Consumer this iterator reads from.
    pub fn consumer(&self) -> &ConsumerInfo {
        &self.consumer
    }

    /// Whether a message is buffered right now.
    ///
    /// A hint only: a concurrent `next` may take the message first.
    pub fn has_next(&self) -> bool {
        if self.mark_running().is_err() {
            return false;
        }

        match self.messages.try_lock() {
            Ok(messages) => !messages.is_empty(),
            // another reader is parked on the channel, so it is empty
            Err(_) => false,
        }
    }

    /// Wait for the next record, or until `cancel` becomes `true`.
    ///
    /// On cancellation nothing is read from the channel and the pending-ack
    /// queue is untouched.
    pub async fn next(&self, cancel: &mut watch::Receiver<bool>) -> Result<Record> {
        self.mark_running()?;

        let message = {
            let mut messages = tokio::select! {
                biased;
                _ = cancelled(cancel) => return Err(IteratorError::Cancelled),
                guard = self.messages.lock() => guard,
            };

            tokio::select! {
                biased;
                _ = cancelled(cancel) => return Err(IteratorError::Cancelled),
                message = messages.recv() => message.ok_or(IteratorError::Stopped)?,
            }
        };

        // no await between taking the message and queueing it
        let (position, record) = self.message_to_record(message.as_ref())?;
        self.acks.track(position, message);

        Ok(record)
    }

    /// Acknowledge the oldest unacknowledged record.
    ///
    /// `position` must equal the position of that record; anything else is
    /// rejected and nothing is acked.
    pub async fn ack(&self, position: &PositionToken) -> Result<()> {
        self.ensure_open()?;
        self.acks.ack(position).await?;

        debug!(position = %position, "Acked message");
        Ok(())
    }

    /// Number of records handed out but not yet acked.
    pub async fn unacknowledged(&self) -> usize {
        self.acks.len()
    }

    /// Tear down the subscription, consumer, and connection.
    ///
    /// Steps run in order and the first failure is returned immediately, so
    /// a failed consumer delete leaves the connection open.
    pub async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);

        self.subscription.lock().await.unsubscribe().await?;

        // closing the receiver rejects any further deliveries
        self.messages.lock().await.close();

        let dropped = self.acks.drain().await;
        if dropped > 0 {
            warn!(
                unacknowledged = dropped,
                "Stopping with unacknowledged messages"
            );
        }

        self.context
            .delete_consumer(&self.consumer.stream, &self.consumer.name)
            .await?;

        self.connection.close().await?;

        info!(
            stream = %self.consumer.stream,
            consumer = %self.consumer.name,
            "Iterator stopped"
        );

        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(IteratorError::Stopped);
        }
        Ok(())
    }

    fn mark_running(&self) -> Result<()> {
        self.ensure_open()?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Position of a message: resume from the sequence after it.
    fn message_position(&self, metadata: &MessageMetadata) -> Result<PositionToken> {
        Position {
            durable: self.consumer.name.clone(),
            stream: self.consumer.stream.clone(),
            subject: self.subject.clone(),
            timestamp: metadata.timestamp,
            opt_seq: metadata.stream_sequence + 1,
        }
        .encode()
        .map_err(IteratorError::Position)
    }

    fn message_to_record(&self, message: &dyn BrokerMessage) -> Result<(PositionToken, Record)> {
        let metadata = message.metadata()?;
        let position = self.message_position(&metadata)?;

        let created_at = if is_zero_time(&metadata.timestamp) {
            Utc::now()
        } else {
            metadata.timestamp
        };

        let record = Record {
            position: position.clone(),
            created_at,
            payload: Payload {
                before: None,
                after: message.payload(),
            },
        };

        Ok((position, record))
    }
}

fn is_zero_time(timestamp: &DateTime<Utc>) -> bool {
    *timestamp == DateTime::<Utc>::default()
}

/// Resolves once the cancellation flag is set.
///
/// A dropped sender can never cancel, so that case stays pending.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
