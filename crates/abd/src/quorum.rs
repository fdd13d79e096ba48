use crate::types::{ProcessId, View};
use rand::Rng;
use rand::seq::SliceRandom;

/// Majority quorum size for a view of `members` processes: floor(n/2) + 1
pub fn quorum_size(members: usize) -> usize {
    members / 2 + 1
}

/// Majority quorum system derived from one membership view
///
/// Any two quorums picked from the same `Majority` intersect in at least one
/// process. Nothing is carried over from earlier views except the view's
/// `min_quorum` floor.
#[derive(Debug, Clone)]
pub struct Majority {
    view_id: u64,
    members: Vec<ProcessId>,
    size: usize,
}

impl Majority {
    pub fn new(view: &View) -> Self {
        Self {
            view_id: view.id,
            members: view.members.iter().copied().collect(),
            size: quorum_size(view.len()).max(view.min_quorum),
        }
    }

    pub fn quorum_size(&self) -> usize {
        self.size
    }

    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    /// True when the view holds enough members to form a quorum
    pub fn is_available(&self) -> bool {
        !self.members.is_empty() && self.members.len() >= self.size
    }

    /// Pick `quorum_size()` distinct members uniformly at random.
    ///
    /// Returns fewer members only when the quorum is not available.
    pub fn pick_quorum<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<ProcessId> {
        self.members
            .choose_multiple(rng, self.size)
            .copied()
            .collect()
    }
}
