//! Records exchanged with the pipeline.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::position::PositionToken;

/// A single change flowing through the pipeline.
///
/// Records produced by the source carry the raw message bytes in
/// `payload.after`; the destination publishes `payload.after`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// Resume token for this record.
    pub position: PositionToken,
    /// When the underlying message was produced.
    pub created_at: DateTime<Utc>,
    /// Record data.
    pub payload: Payload,
}

impl Record {
    /// Build an outbound record carrying only new data.
    pub fn with_payload(after: impl Into<Bytes>) -> Self {
        Self {
            payload: Payload {
                before: None,
                after: after.into(),
            },
            ..Default::default()
        }
    }
}

/// Before/after images of a change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub before: Option<Bytes>,
    pub after: Bytes,
}
