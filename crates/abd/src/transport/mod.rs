pub mod memory;
pub mod tcp;

pub use memory::{InMemoryNetwork, InMemoryTransport};
pub use tcp::TcpTransport;

use crate::error::TransportError;
use crate::message::{Envelope, Message};
use crate::types::{ProcessId, View};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

/// What a transport hands to a register when it joins a group
///
/// `views` always holds the latest view of reachable members; `inbox` yields
/// every message addressed to this process, in arrival order.
pub struct Membership<V> {
    pub views: watch::Receiver<View>,
    pub inbox: mpsc::UnboundedReceiver<Envelope<V>>,
}

/// Group membership and point-to-point delivery between named processes
///
/// Delivery is best effort. A failed `send` is reported to the caller but
/// never retried by the transport. `send` must hand the message off without
/// waiting on the network: a register answers peers and collects its own
/// replies on one task.
#[async_trait]
pub trait Transport<V: Send + 'static>: Send + Sync {
    /// Identity of this process within the group
    fn local_id(&self) -> ProcessId;

    /// Join the named group, returning the view feed and the inbox
    async fn join(&self, group: &str) -> Result<Membership<V>, TransportError>;

    /// Send one message to a member of the joined group
    async fn send(&self, to: ProcessId, message: Message<V>) -> Result<(), TransportError>;

    /// Leave the group and release transport resources
    async fn leave(&self) -> Result<(), TransportError>;
}
