use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Identity of one replica process
///
/// Encoded as four bytes, `[version][node_id hi][node_id lo][epoch]`, which is
/// also how it travels on the wire. The epoch distinguishes restarts of the
/// same node. Printed as `v0:7:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId {
    bytes: [u8; 4],
}

impl ProcessId {
    const VERSION: u8 = 0;

    pub fn new(node_id: u16, epoch: u8) -> Self {
        Self::encode(Self::VERSION, node_id, epoch)
    }

    pub fn from_node_id(node_id: u16) -> Self {
        Self::new(node_id, 0)
    }

    fn encode(version: u8, node_id: u16, epoch: u8) -> Self {
        let [hi, lo] = node_id.to_be_bytes();
        Self {
            bytes: [version, hi, lo, epoch],
        }
    }

    /// Decode the four-byte wire form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProcessIdError> {
        let bytes: [u8; 4] = bytes
            .try_into()
            .map_err(|_| ProcessIdError::InvalidLength(bytes.len()))?;
        Ok(Self { bytes })
    }

    pub fn version(&self) -> u8 {
        self.bytes[0]
    }

    pub fn node_id(&self) -> u16 {
        u16::from_be_bytes([self.bytes[1], self.bytes[2]])
    }

    pub fn epoch(&self) -> u8 {
        self.bytes[3]
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}:{}:{}", self.version(), self.node_id(), self.epoch())
    }
}

impl FromStr for ProcessId {
    type Err = ProcessIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(':');
        let (Some(version), Some(node_id), Some(epoch), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(ProcessIdError::InvalidFormat);
        };

        let version = version
            .strip_prefix('v')
            .and_then(|v| v.parse::<u8>().ok())
            .ok_or(ProcessIdError::InvalidFormat)?;
        let node_id = node_id
            .parse::<u16>()
            .map_err(|_| ProcessIdError::InvalidFormat)?;
        let epoch = epoch
            .parse::<u8>()
            .map_err(|_| ProcessIdError::InvalidFormat)?;

        Ok(Self::encode(version, node_id, epoch))
    }
}

/// A process id that could not be decoded or parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessIdError {
    InvalidLength(usize),
    InvalidFormat,
}

impl fmt::Display for ProcessIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessIdError::InvalidLength(len) => {
                write!(f, "process id must be 4 bytes, got {}", len)
            }
            ProcessIdError::InvalidFormat => f.write_str("expected a process id like v0:1:0"),
        }
    }
}

impl std::error::Error for ProcessIdError {}

/// Logical timestamp attached to a register value. Higher always wins.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Label(pub u64);

impl Label {
    pub const ZERO: Label = Label(0);

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one client operation (one quorum round) issued by a replica.
///
/// Requests carry the id of the round that sent them and replies echo it back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Current set of live members of a group, as reported by the transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct View {
    /// Increases every time the transport publishes a new view
    pub id: u64,
    pub members: BTreeSet<ProcessId>,
    /// Quorums drawn from this view are never smaller than this. A transport
    /// with a fixed replica set pins it to a majority of that set, so
    /// dropping unreachable members from the view does not shrink quorums.
    pub min_quorum: usize,
}

impl View {
    pub fn new(id: u64, members: impl IntoIterator<Item = ProcessId>) -> Self {
        Self {
            id,
            members: members.into_iter().collect(),
            min_quorum: 0,
        }
    }

    pub fn with_min_quorum(mut self, min_quorum: usize) -> Self {
        self.min_quorum = min_quorum;
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &ProcessId) -> bool {
        self.members.contains(id)
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members: Vec<String> = self.members.iter().map(ToString::to_string).collect();
        write!(f, "view#{} [{}]", self.id, members.join(", "))
    }
}
