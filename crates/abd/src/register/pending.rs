//! Reply bookkeeping for the one client operation a replica may have in flight.

use crate::message::{Command, CommandKind};
use crate::types::{Label, OperationId, ProcessId};
use std::fmt;

/// What a completed quorum round hands back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<V> {
    /// Highest-labelled state reported by a read quorum
    Read { value: Option<V>, label: Label },
    /// A write quorum acknowledged
    Written,
}

/// Why a reply was not counted toward the in-flight operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// Belongs to an earlier (or foreign) operation
    OtherOperation(OperationId),
    UnexpectedKind(CommandKind),
    NotInQuorum,
    Duplicate,
}

impl fmt::Display for Discard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Discard::OtherOperation(op) => write!(f, "reply belongs to {}", op),
            Discard::UnexpectedKind(kind) => write!(f, "unexpected {}", kind),
            Discard::NotInQuorum => f.write_str("sender is not in the quorum"),
            Discard::Duplicate => f.write_str("sender already replied"),
        }
    }
}

/// One in-flight quorum round: its id, the quorum it targeted and the
/// replies collected so far, in arrival order.
#[derive(Debug)]
pub struct InFlight<V> {
    operation: OperationId,
    expects: CommandKind,
    quorum: Vec<ProcessId>,
    quorum_size: usize,
    replies: Vec<(ProcessId, Command<V>)>,
}

impl<V: Clone> InFlight<V> {
    pub fn new(
        operation: OperationId,
        expects: CommandKind,
        quorum: Vec<ProcessId>,
        quorum_size: usize,
    ) -> Self {
        Self {
            operation,
            expects,
            quorum,
            quorum_size,
            replies: Vec::with_capacity(quorum_size),
        }
    }

    pub fn operation(&self) -> OperationId {
        self.operation
    }

    pub fn received(&self) -> usize {
        self.replies.len()
    }

    /// Count one reply toward the quorum.
    ///
    /// Returns `Ok(Some(_))` exactly once, when the quorum-th reply arrives.
    pub fn record(
        &mut self,
        sender: ProcessId,
        operation: OperationId,
        reply: Command<V>,
    ) -> Result<Option<Resolution<V>>, Discard> {
        if operation != self.operation {
            return Err(Discard::OtherOperation(operation));
        }
        if reply.kind() != self.expects {
            return Err(Discard::UnexpectedKind(reply.kind()));
        }
        if !self.quorum.contains(&sender) {
            return Err(Discard::NotInQuorum);
        }
        if self.replies.iter().any(|(from, _)| *from == sender) {
            return Err(Discard::Duplicate);
        }
        if self.replies.len() >= self.quorum_size {
            // already resolved
            return Err(Discard::OtherOperation(operation));
        }

        self.replies.push((sender, reply));
        if self.replies.len() < self.quorum_size {
            return Ok(None);
        }

        let resolution = match self.expects {
            CommandKind::ReadReply => {
                let (value, label) = select_latest(&self.replies);
                Resolution::Read { value, label }
            }
            _ => Resolution::Written,
        };
        Ok(Some(resolution))
    }
}

/// Pick the highest-labelled state among read replies.
///
/// Among replies sharing the maximum label the first one received wins.
pub fn select_latest<V: Clone>(replies: &[(ProcessId, Command<V>)]) -> (Option<V>, Label) {
    let mut latest: Option<(&Option<V>, Label)> = None;
    for (_, reply) in replies {
        if let Command::ReadReply { value, label } = reply {
            match latest {
                Some((_, max)) if *label <= max => {}
                _ => latest = Some((value, *label)),
            }
        }
    }

    match latest {
        Some((value, label)) => (value.clone(), label),
        None => (None, Label::ZERO),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u16) -> ProcessId {
        ProcessId::from_node_id(n)
    }

    fn read_reply(value: &str, label: u64) -> Command<String> {
        Command::ReadReply {
            value: Some(value.to_string()),
            label: Label(label),
        }
    }

    fn read_round() -> InFlight<String> {
        InFlight::new(
            OperationId(1),
            CommandKind::ReadReply,
            vec![pid(1), pid(2), pid(3)],
            3,
        )
    }

    #[test]
    fn test_resolves_on_quorum_th_reply() {
        let mut round = read_round();
        assert_eq!(round.record(pid(1), OperationId(1), read_reply("a", 1)), Ok(None));
        assert_eq!(round.record(pid(2), OperationId(1), read_reply("b", 3)), Ok(None));
        assert_eq!(
            round.record(pid(3), OperationId(1), read_reply("c", 2)),
            Ok(Some(Resolution::Read {
                value: Some("b".to_string()),
                label: Label(3)
            }))
        );
        assert_eq!(round.received(), 3);
    }

    #[test]
    fn test_tie_keeps_first_arrival() {
        let mut round = read_round();
        round
            .record(pid(3), OperationId(1), read_reply("zeta", 5))
            .unwrap();
        round
            .record(pid(1), OperationId(1), read_reply("alpha", 5))
            .unwrap();
        let resolution = round
            .record(pid(2), OperationId(1), read_reply("omega", 4))
            .unwrap();

        assert_eq!(
            resolution,
            Some(Resolution::Read {
                value: Some("zeta".to_string()),
                label: Label(5)
            })
        );
    }

    #[test]
    fn test_tie_order_reversed() {
        let replies = vec![
            (pid(1), read_reply("alpha", 5)),
            (pid(3), read_reply("zeta", 5)),
        ];
        assert_eq!(select_latest(&replies), (Some("alpha".to_string()), Label(5)));
    }

    #[test]
    fn test_select_latest_of_fresh_replicas() {
        let replies: Vec<(ProcessId, Command<String>)> = vec![
            (
                pid(1),
                Command::ReadReply {
                    value: None,
                    label: Label::ZERO,
                },
            ),
            (
                pid(2),
                Command::ReadReply {
                    value: None,
                    label: Label::ZERO,
                },
            ),
        ];
        assert_eq!(select_latest(&replies), (None, Label::ZERO));
        assert_eq!(select_latest::<String>(&[]), (None, Label::ZERO));
    }

    #[test]
    fn test_write_round_resolves_without_value() {
        let mut round: InFlight<String> = InFlight::new(
            OperationId(7),
            CommandKind::WriteReply,
            vec![pid(1), pid(2)],
            2,
        );
        assert_eq!(round.record(pid(2), OperationId(7), Command::WriteReply), Ok(None));
        assert_eq!(
            round.record(pid(1), OperationId(7), Command::WriteReply),
            Ok(Some(Resolution::Written))
        );
    }

    #[test]
    fn test_discards() {
        let mut round = read_round();
        assert_eq!(
            round.record(pid(1), OperationId(0), read_reply("old", 9)),
            Err(Discard::OtherOperation(OperationId(0)))
        );
        assert_eq!(
            round.record(pid(1), OperationId(1), Command::WriteReply),
            Err(Discard::UnexpectedKind(CommandKind::WriteReply))
        );
        assert_eq!(
            round.record(pid(9), OperationId(1), read_reply("x", 1)),
            Err(Discard::NotInQuorum)
        );

        round.record(pid(1), OperationId(1), read_reply("a", 1)).unwrap();
        assert_eq!(
            round.record(pid(1), OperationId(1), read_reply("a", 1)),
            Err(Discard::Duplicate)
        );
        assert_eq!(round.received(), 1);
    }
}
