//! JetStream destination: publishes pipeline records to a subject.

mod publish_options;
mod writer;

pub use publish_options::publish_options;
pub use writer::{Writer, WriterParams};

use crate::broker::BrokerError;

/// Result type for destination operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Errors returned by the writer.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("batched publish is not implemented (batch size {batch_size})")]
    NotImplemented { batch_size: usize },

    #[error("publish sync: {0}")]
    Publish(#[source] BrokerError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[cfg(test)]
mod tests;
