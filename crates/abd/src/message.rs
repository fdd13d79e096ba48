use crate::types::{Label, OperationId, ProcessId};
use std::fmt;

/// The four protocol commands exchanged between replicas
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<V> {
    ReadRequest,
    /// Responder's current state
    ReadReply { value: Option<V>, label: Label },
    /// Proposed value and label to install
    WriteRequest { value: Option<V>, label: Label },
    WriteReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    ReadRequest,
    ReadReply,
    WriteRequest,
    WriteReply,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::ReadRequest => "ReadRequest",
            CommandKind::ReadReply => "ReadReply",
            CommandKind::WriteRequest => "WriteRequest",
            CommandKind::WriteReply => "WriteReply",
        };
        f.write_str(name)
    }
}

impl CommandKind {
    /// Reply kind a request of this kind is answered with
    pub fn reply_kind(&self) -> Option<CommandKind> {
        match self {
            CommandKind::ReadRequest => Some(CommandKind::ReadReply),
            CommandKind::WriteRequest => Some(CommandKind::WriteReply),
            CommandKind::ReadReply | CommandKind::WriteReply => None,
        }
    }
}

impl<V> Command<V> {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::ReadRequest => CommandKind::ReadRequest,
            Command::ReadReply { .. } => CommandKind::ReadReply,
            Command::WriteRequest { .. } => CommandKind::WriteRequest,
            Command::WriteReply => CommandKind::WriteReply,
        }
    }
}

/// A command stamped with the client operation it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<V> {
    pub operation: OperationId,
    pub command: Command<V>,
}

impl<V> Message<V> {
    pub fn read_request(operation: OperationId) -> Self {
        Self {
            operation,
            command: Command::ReadRequest,
        }
    }

    pub fn read_reply(operation: OperationId, value: Option<V>, label: Label) -> Self {
        Self {
            operation,
            command: Command::ReadReply { value, label },
        }
    }

    pub fn write_request(operation: OperationId, value: Option<V>, label: Label) -> Self {
        Self {
            operation,
            command: Command::WriteRequest { value, label },
        }
    }

    pub fn write_reply(operation: OperationId) -> Self {
        Self {
            operation,
            command: Command::WriteReply,
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.command.kind()
    }
}

/// A message together with the process that sent it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<V> {
    pub sender: ProcessId,
    pub message: Message<V>,
}

impl<V> Envelope<V> {
    pub fn new(sender: ProcessId, message: Message<V>) -> Self {
        Self { sender, message }
    }
}
