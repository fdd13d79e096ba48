use crate::types::{OperationId, ProcessId};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to callers of a register
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("register '{0}' is not writable")]
    NotWritable(String),

    #[error("{operation} timed out after {after:?} waiting for a quorum")]
    Timeout {
        operation: OperationId,
        after: Duration,
    },

    #[error("register '{0}' is closed")]
    Closed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors raised by a transport while joining, sending or leaving
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("process {0} is not reachable")]
    Unreachable(ProcessId),

    #[error("transport has not joined a group")]
    NotJoined,

    #[error("transport already joined group '{0}'")]
    AlreadyJoined(String),

    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("connection to {0} timed out")]
    ConnectTimeout(ProcessId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

pub type Result<T, E = RegisterError> = std::result::Result<T, E>;
