//! jetstream-bridge - NATS JetStream source and destination
//!
//! Turns a durable, flow-controlled JetStream push consumer into a strictly
//! ordered record stream with resumable positions, and publishes pipeline
//! records back to a subject.

pub mod broker;
pub mod config;
pub mod destination;
pub mod position;
pub mod record;
pub mod source;
pub mod utils;

pub use destination::{Writer, WriterParams};
pub use position::{Position, PositionToken};
pub use record::{Payload, Record};
pub use source::{IteratorParams, ReadIterator};
