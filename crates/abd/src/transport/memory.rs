use super::{Membership, Transport};
use crate::error::TransportError;
use crate::message::{Envelope, Message};
use crate::types::{ProcessId, View};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, trace};

/// Delivery counters for one group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub delivered: u64,
    pub dropped: u64,
}

struct Group<V> {
    members: BTreeMap<ProcessId, mpsc::UnboundedSender<Envelope<V>>>,
    silenced: HashSet<ProcessId>,
    views: watch::Sender<View>,
    next_view_id: u64,
    stats: NetworkStats,
}

impl<V> Group<V> {
    fn new() -> Self {
        let (views, _) = watch::channel(View::default());
        Self {
            members: BTreeMap::new(),
            silenced: HashSet::new(),
            views,
            next_view_id: 0,
            stats: NetworkStats::default(),
        }
    }

    fn publish_view(&mut self, group: &str) {
        self.next_view_id += 1;
        let view = View::new(self.next_view_id, self.members.keys().copied());
        info!("group {} installed {}", group, view);
        self.views.send_replace(view);
    }
}

struct Hub<V> {
    groups: HashMap<String, Group<V>>,
}

/// In-process network shared by any number of [`InMemoryTransport`] endpoints
///
/// Membership is the set of joined endpoints; every join, leave and crash
/// publishes a new view. Faults are injected through `crash`, `silence`
/// and `restore`.
pub struct InMemoryNetwork<V> {
    hub: Arc<RwLock<Hub<V>>>,
}

impl<V> Clone for InMemoryNetwork<V> {
    fn clone(&self) -> Self {
        Self {
            hub: Arc::clone(&self.hub),
        }
    }
}

impl<V> Default for InMemoryNetwork<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> InMemoryNetwork<V> {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(RwLock::new(Hub {
                groups: HashMap::new(),
            })),
        }
    }

    /// Create an endpoint for `id`. It becomes a member once it joins a group.
    pub fn endpoint(&self, id: ProcessId) -> InMemoryTransport<V> {
        InMemoryTransport {
            local: id,
            hub: Arc::clone(&self.hub),
            group: RwLock::new(None),
        }
    }

    /// Crash a member: it leaves the view and its inbox is closed.
    ///
    /// Returns false if `id` was not a member of the group.
    pub async fn crash(&self, group: &str, id: ProcessId) -> bool {
        let mut hub = self.hub.write().await;
        let Some(g) = hub.groups.get_mut(group) else {
            return false;
        };
        if g.members.remove(&id).is_none() {
            return false;
        }
        g.silenced.remove(&id);
        info!("crashed {} in group {}", id, group);
        g.publish_view(group);
        true
    }

    /// Drop all traffic to and from a member while keeping it in the view
    pub async fn silence(&self, group: &str, id: ProcessId) {
        if let Some(g) = self.hub.write().await.groups.get_mut(group) {
            g.silenced.insert(id);
            info!("silenced {} in group {}", id, group);
        }
    }

    /// Undo a previous `silence`
    pub async fn restore(&self, group: &str, id: ProcessId) {
        if let Some(g) = self.hub.write().await.groups.get_mut(group) {
            g.silenced.remove(&id);
            info!("restored {} in group {}", id, group);
        }
    }

    /// Latest view of a group
    pub async fn view(&self, group: &str) -> Option<View> {
        self.hub
            .read()
            .await
            .groups
            .get(group)
            .map(|g| g.views.borrow().clone())
    }

    pub async fn stats(&self, group: &str) -> Option<NetworkStats> {
        self.hub.read().await.groups.get(group).map(|g| g.stats)
    }
}

/// One process's endpoint on an [`InMemoryNetwork`]
pub struct InMemoryTransport<V> {
    local: ProcessId,
    hub: Arc<RwLock<Hub<V>>>,
    group: RwLock<Option<String>>,
}

impl<V> InMemoryTransport<V> {
    async fn joined_group(&self) -> Result<String, TransportError> {
        self.group.read().await.clone().ok_or(TransportError::NotJoined)
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> Transport<V> for InMemoryTransport<V> {
    fn local_id(&self) -> ProcessId {
        self.local
    }

    async fn join(&self, group: &str) -> Result<Membership<V>, TransportError> {
        let mut joined = self.group.write().await;
        if let Some(existing) = joined.as_ref() {
            return Err(TransportError::AlreadyJoined(existing.clone()));
        }

        let mut hub = self.hub.write().await;
        let g = hub
            .groups
            .entry(group.to_string())
            .or_insert_with(Group::new);
        if g.members.contains_key(&self.local) {
            return Err(TransportError::AlreadyJoined(group.to_string()));
        }

        let (tx, inbox) = mpsc::unbounded_channel();
        g.members.insert(self.local, tx);
        g.publish_view(group);
        *joined = Some(group.to_string());

        Ok(Membership {
            views: g.views.subscribe(),
            inbox,
        })
    }

    async fn send(&self, to: ProcessId, message: Message<V>) -> Result<(), TransportError> {
        let group = self.joined_group().await?;
        let mut hub = self.hub.write().await;
        let g = hub
            .groups
            .get_mut(&group)
            .ok_or(TransportError::NotJoined)?;

        if !g.members.contains_key(&self.local) {
            // crashed endpoints can no longer talk to the group
            return Err(TransportError::NotJoined);
        }
        if g.silenced.contains(&self.local) || g.silenced.contains(&to) {
            g.stats.dropped += 1;
            trace!("dropped {} from {} to {}", message.kind(), self.local, to);
            return Ok(());
        }

        let tx = g.members.get(&to).ok_or(TransportError::Unreachable(to))?;
        if tx.send(Envelope::new(self.local, message)).is_err() {
            // the receiving end is gone without leaving: treat it as crashed
            g.members.remove(&to);
            g.silenced.remove(&to);
            info!("{} stopped receiving in group {}", to, group);
            g.publish_view(&group);
            return Err(TransportError::Unreachable(to));
        }
        g.stats.delivered += 1;
        Ok(())
    }

    async fn leave(&self) -> Result<(), TransportError> {
        let Some(group) = self.group.write().await.take() else {
            return Ok(());
        };

        let mut hub = self.hub.write().await;
        if let Some(g) = hub.groups.get_mut(&group) {
            if g.members.remove(&self.local).is_some() {
                debug!("{} left group {}", self.local, group);
                g.publish_view(&group);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Label, OperationId};

    fn pid(n: u16) -> ProcessId {
        ProcessId::from_node_id(n)
    }

    #[tokio::test]
    async fn test_join_publishes_views() {
        let network = InMemoryNetwork::<u32>::new();
        let a = network.endpoint(pid(1));
        let b = network.endpoint(pid(2));

        let membership_a = a.join("reg").await.unwrap();
        assert_eq!(membership_a.views.borrow().len(), 1);

        let membership_b = b.join("reg").await.unwrap();
        assert_eq!(membership_b.views.borrow().len(), 2);
        // earlier subscribers observe the new view too
        assert_eq!(membership_a.views.borrow().len(), 2);
        assert_eq!(membership_a.views.borrow().id, 2);
    }

    #[tokio::test]
    async fn test_join_twice_fails() {
        let network = InMemoryNetwork::<u32>::new();
        let a = network.endpoint(pid(1));
        a.join("reg").await.unwrap();
        assert!(matches!(
            a.join("reg").await,
            Err(TransportError::AlreadyJoined(_))
        ));

        let duplicate = network.endpoint(pid(1));
        assert!(matches!(
            duplicate.join("reg").await,
            Err(TransportError::AlreadyJoined(_))
        ));
    }

    #[tokio::test]
    async fn test_send_delivers_with_sender() {
        let network = InMemoryNetwork::<u32>::new();
        let a = network.endpoint(pid(1));
        let b = network.endpoint(pid(2));
        let _ma = a.join("reg").await.unwrap();
        let mut mb = b.join("reg").await.unwrap();

        let message = Message::write_request(OperationId(1), Some(5), Label(1));
        a.send(pid(2), message.clone()).await.unwrap();

        let envelope = mb.inbox.recv().await.unwrap();
        assert_eq!(envelope.sender, pid(1));
        assert_eq!(envelope.message, message);
        assert_eq!(network.stats("reg").await.unwrap().delivered, 1);
    }

    #[tokio::test]
    async fn test_send_before_join_or_to_stranger() {
        let network = InMemoryNetwork::<u32>::new();
        let a = network.endpoint(pid(1));
        assert!(matches!(
            a.send(pid(2), Message::read_request(OperationId(1))).await,
            Err(TransportError::NotJoined)
        ));

        let _ma = a.join("reg").await.unwrap();
        assert!(matches!(
            a.send(pid(9), Message::read_request(OperationId(1))).await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_crash_shrinks_view_and_closes_inbox() {
        let network = InMemoryNetwork::<u32>::new();
        let a = network.endpoint(pid(1));
        let b = network.endpoint(pid(2));
        let ma = a.join("reg").await.unwrap();
        let mut mb = b.join("reg").await.unwrap();

        assert!(network.crash("reg", pid(2)).await);
        assert!(!ma.views.borrow().contains(&pid(2)));
        assert!(mb.inbox.recv().await.is_none());
        assert!(!network.crash("reg", pid(2)).await);

        assert!(matches!(
            b.send(pid(1), Message::read_request(OperationId(1))).await,
            Err(TransportError::NotJoined)
        ));
    }

    #[tokio::test]
    async fn test_silence_drops_traffic() {
        let network = InMemoryNetwork::<u32>::new();
        let a = network.endpoint(pid(1));
        let b = network.endpoint(pid(2));
        let _ma = a.join("reg").await.unwrap();
        let mut mb = b.join("reg").await.unwrap();

        network.silence("reg", pid(2)).await;
        a.send(pid(2), Message::read_request(OperationId(1)))
            .await
            .unwrap();
        assert!(mb.inbox.try_recv().is_err());
        assert_eq!(network.view("reg").await.unwrap().len(), 2);

        network.restore("reg", pid(2)).await;
        a.send(pid(2), Message::read_request(OperationId(2)))
            .await
            .unwrap();
        assert_eq!(
            mb.inbox.recv().await.unwrap().message.operation,
            OperationId(2)
        );

        let stats = network.stats("reg").await.unwrap();
        assert_eq!(stats, NetworkStats { delivered: 1, dropped: 1 });
    }

    #[tokio::test]
    async fn test_closed_inbox_counts_as_crash() {
        let network = InMemoryNetwork::<u32>::new();
        let a = network.endpoint(pid(1));
        let b = network.endpoint(pid(2));
        let ma = a.join("reg").await.unwrap();
        let mb = b.join("reg").await.unwrap();
        drop(mb);

        assert!(matches!(
            a.send(pid(2), Message::read_request(OperationId(1))).await,
            Err(TransportError::Unreachable(_))
        ));
        assert_eq!(*ma.views.borrow(), View::new(3, [pid(1)]));
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let network = InMemoryNetwork::<u32>::new();
        let a = network.endpoint(pid(1));
        let b = network.endpoint(pid(2));
        let _ma = a.join("reg").await.unwrap();
        let mb = b.join("reg").await.unwrap();

        a.leave().await.unwrap();
        a.leave().await.unwrap();
        assert_eq!(mb.views.borrow().len(), 1);
    }
}
