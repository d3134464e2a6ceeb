//! JetStream source: durable consumer setup and the ordered read iterator.
//!
//! The iterator hands out records in delivery order and accepts acks only in
//! that same order. Each record's position resumes *after* the message it was
//! read from, so restarting with the last acked position never replays it.

mod iterator;

pub use iterator::{IteratorState, ReadIterator};

use crate::broker::{
    AckPolicy, BrokerError, ConsumerConfig, DeliverPolicy, ReplayPolicy, HEARTBEAT_INTERVAL,
};
use crate::position::{Position, PositionError, PositionToken};

/// Result type for source operations.
pub type Result<T> = std::result::Result<T, IteratorError>;

/// Errors returned by the read iterator.
#[derive(Debug, thiserror::Error)]
pub enum IteratorError {
    #[error("get consumer config: {0}")]
    Config(#[source] PositionError),

    #[error("message cannot be acknowledged: requested ack for {requested} but no unacknowledged messages found")]
    NoUnacknowledged { requested: PositionToken },

    #[error("message cannot be acknowledged: ack is out-of-order, requested ack for {requested}, but first unacknowledged message is {head}")]
    OutOfOrderAck {
        requested: PositionToken,
        head: PositionToken,
    },

    #[error("read cancelled")]
    Cancelled,

    #[error("iterator stopped")]
    Stopped,

    #[error("convert message to record: {0}")]
    Position(#[source] PositionError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Parameters for [`ReadIterator::new`].
#[derive(Debug, Clone)]
pub struct IteratorParams {
    /// Capacity of the bounded delivery channel.
    pub buffer_size: usize,
    /// Durable consumer name.
    pub durable: String,
    /// Stream to consume.
    pub stream: String,
    /// Subject to subscribe to.
    pub subject: String,
    /// Position to resume from. Empty starts fresh.
    pub position: PositionToken,
    /// Deliver policy used when there is no resume position.
    pub deliver_policy: DeliverPolicy,
    pub ack_policy: AckPolicy,
}

/// Build the durable consumer configuration for `params`.
///
/// A resume position with a non-zero `opt_seq` overrides the configured
/// deliver policy with a start-sequence policy at that sequence.
pub fn consumer_config(params: &IteratorParams) -> Result<ConsumerConfig> {
    let position = Position::decode(&params.position).map_err(IteratorError::Config)?;

    // if the position has a non-zero opt_seq, resume from it
    let deliver_policy = if position.is_resumable() {
        DeliverPolicy::ByStartSequence {
            start_sequence: position.opt_seq,
        }
    } else {
        params.deliver_policy
    };

    Ok(ConsumerConfig {
        durable_name: params.durable.clone(),
        deliver_subject: format!("{}.{}", params.durable, params.stream),
        deliver_policy,
        ack_policy: params.ack_policy,
        replay_policy: ReplayPolicy::Instant,
        flow_control: true,
        idle_heartbeat: HEARTBEAT_INTERVAL,
    })
}
