//! Message channel contracts and connection recovery.
//!
//! A [`MessageChannel`] is the pub/sub transport between nodes. The bus
//! publishes [`OutputMessage`]s through it and receives messages through the
//! [`MessageConsumer`] it subscribes. Connectivity failures are retried by a
//! [`RecoveryProcessor`] whose progress is tracked in [`ChannelState`].

mod loopback;
mod recovery;
mod state;

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::health::ComponentHealth;

pub use loopback::{LoopbackChannel, LoopbackHub};
pub use recovery::{RecoveryError, RecoveryProcessor, RecoveryRole, RecoverySettings};
pub use state::{ChannelState, ChannelStateSnapshot};

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The transport lost its connection; the operation may succeed after
    /// recovery.
    #[error("channel connectivity lost: {0}")]
    Connectivity(String),
    #[error("channel is not active")]
    NotActive,
    #[error("channel is closed")]
    Closed,
    #[error("channel rejected the message: {0}")]
    Rejected(String),
}

impl ChannelError {
    pub fn connectivity(reason: impl Into<String>) -> Self {
        Self::Connectivity(reason.into())
    }

    /// Whether the failure is worth handing to the recovery processor.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

/// One encoded event ready for publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMessage {
    /// Routing hash of the event, used by receivers to pick a stripe.
    pub hash: u64,
    pub body: Bytes,
}

impl OutputMessage {
    pub fn new(hash: u64, body: Bytes) -> Self {
        Self { hash, body }
    }
}

/// What a channel receives from the bus when it is activated.
#[derive(Clone)]
pub struct ChannelContext {
    /// Identity of the local node.
    pub node_id: Uuid,
    /// Recovery processor the channel may use for its own reconnects.
    pub recovery: Arc<RecoveryProcessor>,
}

/// Receiver of messages delivered by a channel.
pub trait MessageConsumer: Send + Sync {
    fn accept(&self, hash: u64, body: Bytes);
}

/// Pub/sub transport between nodes.
///
/// Implementations must not deliver a node's own messages back to it.
pub trait MessageChannel: Send + Sync {
    fn activate(&self, context: ChannelContext) -> Result<(), ChannelError>;

    fn send(&self, message: &OutputMessage) -> Result<(), ChannelError>;

    fn subscribe(&self, consumer: Arc<dyn MessageConsumer>) -> Result<(), ChannelError>;

    /// Drop and rebuild the sending side before a retry.
    fn reset_sender(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    fn close(&self) -> Result<(), ChannelError>;

    fn health(&self) -> ComponentHealth;
}
