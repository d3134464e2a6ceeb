//! Resumable read cursor and its opaque token encoding.
//!
//! A position is serialized as JSON so tokens stay self-describing when they
//! are persisted by the pipeline's checkpoint mechanism:
//!
//! ```json
//! {"durable":"orders","stream":"ORDERS","subject":"orders.created",
//!  "timestamp":"2024-05-01T10:00:00Z","opt_seq":42}
//! ```

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result type for position operations.
pub type Result<T> = std::result::Result<T, PositionError>;

/// Errors that can occur while encoding or decoding positions.
#[derive(Debug, thiserror::Error)]
pub enum PositionError {
    #[error("encode position: {0}")]
    Encoding(#[source] serde_json::Error),

    #[error("decode position: {0}")]
    Decoding(#[source] serde_json::Error),
}

/// Read cursor within a stream.
///
/// `opt_seq` is the sequence to resume from, i.e. one past the stream
/// sequence of the message the position was derived from. Zero means there
/// is no prior position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Durable consumer name.
    pub durable: String,
    /// Stream name.
    pub stream: String,
    /// Subject the consumer is subscribed to.
    pub subject: String,
    /// Broker timestamp of the message.
    pub timestamp: DateTime<Utc>,
    /// Next stream sequence to read.
    pub opt_seq: u64,
}

impl Position {
    /// Serialize the position into an opaque token.
    pub fn encode(&self) -> Result<PositionToken> {
        serde_json::to_vec(self)
            .map(PositionToken::from)
            .map_err(PositionError::Encoding)
    }

    /// Deserialize a position from a token.
    ///
    /// An empty token yields the zero position rather than an error.
    pub fn decode(token: &PositionToken) -> Result<Self> {
        if token.is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_slice(token.as_bytes()).map_err(PositionError::Decoding)
    }

    /// Whether this position carries a resume sequence.
    pub fn is_resumable(&self) -> bool {
        self.opt_seq != 0
    }
}

/// Opaque, byte-comparable position token carried on records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PositionToken(Bytes);

impl PositionToken {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Vec<u8>> for PositionToken {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<Bytes> for PositionToken {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<&str> for PositionToken {
    fn from(text: &str) -> Self {
        Self(Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl fmt::Display for PositionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}
