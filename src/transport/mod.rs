//! Message transport between named nodes.
//!
//! The protocol engines only need fire-and-forget delivery of opaque bytes:
//! they tolerate loss, duplication and reordering through their own
//! timeouts, retries and idempotent handlers.

pub mod local;
#[cfg(feature = "tcp")]
pub mod network;
#[cfg(feature = "tcp")]
mod server;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::protocol::Message;
use crate::types::NodeId;

pub use local::{LocalEndpoint, LocalNetwork};
#[cfg(feature = "tcp")]
pub use network::TcpNetwork;

/// Outbound half of a transport, bound to the sending node's identity.
pub trait Transport: Send + Sync {
    /// The node messages sent through this transport are attributed to.
    fn local_id(&self) -> &NodeId;

    /// Queues `body` for delivery to `target`.
    ///
    /// Success means the message was handed to the network, not that it
    /// arrived.
    fn send(&self, target: &NodeId, body: Vec<u8>) -> Result<()>;
}

/// Inbound half: receives messages addressed to a node.
pub trait MessageHandler: Send + Sync {
    /// Handles one message from `sender`.
    ///
    /// Returns whether the message was understood; a transport may use this
    /// for its own redelivery policy.
    fn deliver(&self, sender: &NodeId, body: &[u8]) -> bool;
}

/// Unit of delivery on a network: a body plus the node that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub body: Vec<u8>,
}

/// Encodes `message` and sends it to `target`.
pub fn send_message(transport: &dyn Transport, target: &NodeId, message: &Message) -> Result<()> {
    transport.send(target, message.encode()?)
}
