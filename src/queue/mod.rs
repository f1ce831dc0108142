//! Priority message queuing between the application and the drivers.
//!
//! One [`Queue`] exists per application message type; the
//! [`manager::QueueManager`] owns all of them and, on a driver's data
//! request, packs the highest-priority eligible messages into the
//! outgoing frames. Delivery outcomes come back to the application as
//! [`manager::QueueEvent`]s: exactly one `Ack`, one `Expire`, or a silent
//! pop for every push.

use thiserror::Error;

use crate::codec::CodecError;

pub mod manager;
#[allow(clippy::module_inception)]
pub mod queue;

pub use manager::{QueueEvent, QueueManager, QueueManagerConfig};
pub use queue::{Queue, QueueConfig, Role};

/// Logical queuing failure; recoverable (the portal logs and discards the
/// offending push).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no queue registered for message id {0}")]
    NoSuchQueue(u32),
    #[error("empty message pushed to queue {0}")]
    EmptyMessage(String),
    #[error("invalid role configuration: {0}")]
    InvalidRole(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
