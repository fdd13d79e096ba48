//! Protobuf wire format used by the TCP transport.
//!
//! Messages are declared with prost derives so no build script or `protoc`
//! is needed. Each frame on the wire is a 4-byte big-endian length followed
//! by one encoded [`wire::Envelope`].

use crate::error::TransportError;
use crate::message::{Command, Envelope, Message};
use crate::types::{Label, OperationId, ProcessId};
use bytes::{Bytes, BytesMut};
use prost::Message as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected on both sides
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub mod wire {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Envelope {
        /// 4-byte process id of the sender
        #[prost(bytes = "bytes", tag = "1")]
        pub sender: Bytes,
        #[prost(string, tag = "2")]
        pub group: String,
        #[prost(message, optional, tag = "3")]
        pub command: Option<Command>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Command {
        #[prost(uint64, tag = "1")]
        pub operation: u64,
        #[prost(enumeration = "Kind", tag = "2")]
        pub kind: i32,
        #[prost(bytes = "bytes", optional, tag = "3")]
        pub value: Option<Bytes>,
        #[prost(uint64, tag = "4")]
        pub label: u64,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum Kind {
        Unspecified = 0,
        ReadRequest = 1,
        ReadReply = 2,
        WriteRequest = 3,
        WriteReply = 4,
    }
}

/// Convert an internal envelope to its protobuf form
pub fn envelope_to_proto(group: &str, envelope: &Envelope<Bytes>) -> wire::Envelope {
    wire::Envelope {
        sender: Bytes::copy_from_slice(envelope.sender.bytes()),
        group: group.to_string(),
        command: Some(message_to_proto(&envelope.message)),
    }
}

fn message_to_proto(message: &Message<Bytes>) -> wire::Command {
    let (kind, value, label) = match &message.command {
        Command::ReadRequest => (wire::Kind::ReadRequest, None, Label::ZERO),
        Command::ReadReply { value, label } => (wire::Kind::ReadReply, value.clone(), *label),
        Command::WriteRequest { value, label } => {
            (wire::Kind::WriteRequest, value.clone(), *label)
        }
        Command::WriteReply => (wire::Kind::WriteReply, None, Label::ZERO),
    };

    wire::Command {
        operation: message.operation.0,
        kind: kind as i32,
        value,
        label: label.0,
    }
}

/// Convert a protobuf envelope back to the group name and internal envelope
pub fn proto_to_envelope(
    proto: &wire::Envelope,
) -> Result<(String, Envelope<Bytes>), TransportError> {
    let sender = ProcessId::from_bytes(&proto.sender)
        .map_err(|e| TransportError::Malformed(e.to_string()))?;
    let command = proto
        .command
        .as_ref()
        .ok_or_else(|| TransportError::Malformed("envelope without a command".to_string()))?;
    let message = proto_to_message(command)?;
    Ok((proto.group.clone(), Envelope::new(sender, message)))
}

fn proto_to_message(proto: &wire::Command) -> Result<Message<Bytes>, TransportError> {
    let operation = OperationId(proto.operation);
    let label = Label(proto.label);

    let kind = wire::Kind::try_from(proto.kind)
        .map_err(|_| TransportError::Malformed(format!("unknown command kind {}", proto.kind)))?;
    let command = match kind {
        wire::Kind::Unspecified => {
            return Err(TransportError::Malformed(
                "unspecified command kind".to_string(),
            ));
        }
        wire::Kind::ReadRequest => Command::ReadRequest,
        wire::Kind::ReadReply => Command::ReadReply {
            value: proto.value.clone(),
            label,
        },
        wire::Kind::WriteRequest => Command::WriteRequest {
            value: proto.value.clone(),
            label,
        },
        wire::Kind::WriteReply => Command::WriteReply,
    };

    Ok(Message { operation, command })
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, envelope: &wire::Envelope) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(envelope.encoded_len());
    envelope.encode(&mut buf)?;
    if buf.len() > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(buf.len()));
    }

    // Write length prefix (4 bytes big-endian)
    writer.write_u32(buf.len() as u32).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
///
/// Returns Ok(None) when the peer closed the connection between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<wire::Envelope>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(wire::Envelope::decode(&buf[..])?))
}
