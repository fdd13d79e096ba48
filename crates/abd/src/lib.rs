//! ABD atomic register: linearizable reads and writes over a majority
//! quorum of crash-prone replicas.

// Architecture modules
pub mod config;
pub mod error;
pub mod message;
pub mod proto;
pub mod quorum;
pub mod register;
pub mod transport;
pub mod types;

// Public exports
pub use config::Config;
pub use error::{RegisterError, TransportError};
pub use message::{Command, CommandKind, Envelope, Message};
pub use quorum::{Majority, quorum_size};
pub use register::{Register, RegisterOptions};
pub use transport::{InMemoryNetwork, InMemoryTransport, Membership, TcpTransport, Transport};
pub use types::{Label, OperationId, ProcessId, ProcessIdError, View};
