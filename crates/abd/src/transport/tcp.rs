use super::{Membership, Transport};
use crate::config::Config;
use crate::error::TransportError;
use crate::message::{Envelope, Message};
use crate::proto::{envelope_to_proto, proto_to_envelope, read_frame, wire, write_frame};
use crate::quorum::quorum_size;
use crate::types::{ProcessId, View};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// Pause between attempts to reach a peer that is down
const RECONNECT_INTERVAL: Duration = Duration::from_millis(200);

struct Joined {
    group: String,
    inbox: mpsc::UnboundedSender<Envelope<Bytes>>,
    views: Arc<watch::Sender<View>>,
    /// One queue per remote peer, drained by that peer's writer task
    outbound: BTreeMap<ProcessId, mpsc::UnboundedSender<wire::Envelope>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Joined {
    fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// TCP transport over a fixed replica set taken from configuration
///
/// Every replica listens on its own address and keeps one outbound
/// connection per peer, owned by a writer task fed through a queue, so
/// `send` never waits on the network. Frames are length-prefixed protobuf
/// envelopes (see [`crate::proto`]).
///
/// The published view holds the peers that are currently reachable. A peer
/// leaves it when connecting or writing fails or its connection drops, and
/// returns once a reconnect succeeds. Quorums stay a majority of the whole
/// configured set however small the view gets.
pub struct TcpTransport {
    local: ProcessId,
    listen_addr: String,
    peers: BTreeMap<ProcessId, String>,
    connect_timeout: Duration,
    prebound: Mutex<Option<TcpListener>>,
    joined: RwLock<Option<Joined>>,
}

impl TcpTransport {
    pub fn new(
        local: ProcessId,
        listen_addr: impl Into<String>,
        replicas: impl IntoIterator<Item = (ProcessId, String)>,
        connect_timeout: Duration,
    ) -> Self {
        Self::build(local, listen_addr.into(), replicas, connect_timeout, None)
    }

    fn build(
        local: ProcessId,
        listen_addr: String,
        replicas: impl IntoIterator<Item = (ProcessId, String)>,
        connect_timeout: Duration,
        prebound: Option<TcpListener>,
    ) -> Self {
        let mut peers: BTreeMap<ProcessId, String> = replicas.into_iter().collect();
        // this process is always part of its own membership
        peers.entry(local).or_insert_with(|| listen_addr.clone());

        Self {
            local,
            listen_addr,
            peers,
            connect_timeout,
            prebound: Mutex::new(prebound),
            joined: RwLock::new(None),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.node.process_id(),
            config.node.listen_addr.clone(),
            config
                .cluster
                .replicas
                .iter()
                .map(|r| (r.process_id(), r.addr.clone())),
            config.register.connect_timeout(),
        )
    }

    /// Build a transport around an already bound listener
    pub fn with_listener(
        local: ProcessId,
        listener: TcpListener,
        replicas: impl IntoIterator<Item = (ProcessId, String)>,
        connect_timeout: Duration,
    ) -> std::io::Result<Self> {
        let listen_addr = listener.local_addr()?.to_string();
        Ok(Self::build(
            local,
            listen_addr,
            replicas,
            connect_timeout,
            Some(listener),
        ))
    }
}

#[async_trait]
impl Transport<Bytes> for TcpTransport {
    fn local_id(&self) -> ProcessId {
        self.local
    }

    async fn join(&self, group: &str) -> Result<Membership<Bytes>, TransportError> {
        let mut joined = self.joined.write().await;
        if let Some(existing) = joined.as_ref() {
            return Err(TransportError::AlreadyJoined(existing.group.clone()));
        }

        let listener = match self.prebound.lock().await.take() {
            Some(listener) => listener,
            None => TcpListener::bind(&self.listen_addr).await?,
        };
        info!(
            "Replica {} listening on {} for group {}",
            self.local, self.listen_addr, group
        );

        // peers join the view as their connections come up
        let view = View::new(1, [self.local]).with_min_quorum(quorum_size(self.peers.len()));
        let (views_tx, views) = watch::channel(view);
        let views_tx = Arc::new(views_tx);

        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let mut tasks = vec![tokio::spawn(accept_loop(
            listener,
            group.to_string(),
            inbox_tx.clone(),
        ))];

        let mut outbound = BTreeMap::new();
        for (&id, addr) in &self.peers {
            if id == self.local {
                continue;
            }
            let (queue, frames) = mpsc::unbounded_channel();
            outbound.insert(id, queue);
            let link = PeerLink {
                id,
                addr: addr.clone(),
                timeout: self.connect_timeout,
                views: Arc::clone(&views_tx),
            };
            tasks.push(tokio::spawn(peer_writer(link, frames)));
        }

        *joined = Some(Joined {
            group: group.to_string(),
            inbox: inbox_tx,
            views: views_tx,
            outbound,
            tasks,
        });

        Ok(Membership { views, inbox })
    }

    async fn send(&self, to: ProcessId, message: Message<Bytes>) -> Result<(), TransportError> {
        let joined = self.joined.read().await;
        let Some(joined) = joined.as_ref() else {
            return Err(TransportError::NotJoined);
        };

        let envelope = Envelope::new(self.local, message);
        if to == self.local {
            return joined
                .inbox
                .send(envelope)
                .map_err(|_| TransportError::NotJoined);
        }

        let queue = joined
            .outbound
            .get(&to)
            .ok_or(TransportError::Unreachable(to))?;
        if !joined.views.borrow().contains(&to) {
            return Err(TransportError::Unreachable(to));
        }
        queue
            .send(envelope_to_proto(&joined.group, &envelope))
            .map_err(|_| TransportError::Unreachable(to))
    }

    async fn leave(&self) -> Result<(), TransportError> {
        let Some(joined) = self.joined.write().await.take() else {
            return Ok(());
        };
        joined.abort();
        info!("Replica {} left group {}", self.local, joined.group);
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(joined) = self.joined.get_mut().as_ref() {
            joined.abort();
        }
    }
}

/// What a writer task needs to reach one peer and report its reachability
struct PeerLink {
    id: ProcessId,
    addr: String,
    timeout: Duration,
    views: Arc<watch::Sender<View>>,
}

impl PeerLink {
    fn set_reachable(&self, reachable: bool) {
        self.views.send_if_modified(|view| {
            let changed = if reachable {
                view.members.insert(self.id)
            } else {
                view.members.remove(&self.id)
            };
            if changed {
                view.id += 1;
                info!(
                    "Peer {} is {}, now {}",
                    self.id,
                    if reachable { "reachable" } else { "unreachable" },
                    view
                );
            }
            changed
        });
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.id))??;
        stream.set_nodelay(true)?;
        debug!("Connected to peer {} at {}", self.id, self.addr);
        Ok(stream)
    }

    /// Sit out the reconnect interval, discarding frames queued meanwhile.
    ///
    /// Returns false once the transport has stopped feeding this peer.
    async fn back_off(&self, frames: &mut mpsc::UnboundedReceiver<wire::Envelope>) -> bool {
        let retry = tokio::time::sleep(RECONNECT_INTERVAL);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                _ = &mut retry => return true,
                frame = frames.recv() => match frame {
                    Some(_) => trace!("Dropping frame for unreachable peer {}", self.id),
                    None => return false,
                },
            }
        }
    }
}

enum Outbound {
    Frame(wire::Envelope),
    Lost,
}

/// Own the outbound connection to one peer and write its queued frames
async fn peer_writer(link: PeerLink, mut frames: mpsc::UnboundedReceiver<wire::Envelope>) {
    let mut connection: Option<(OwnedReadHalf, OwnedWriteHalf)> = None;

    loop {
        if connection.is_none() {
            match link.connect().await {
                Ok(stream) => {
                    connection = Some(stream.into_split());
                    link.set_reachable(true);
                }
                Err(e) => {
                    debug!("Cannot reach peer {} at {}: {}", link.id, link.addr, e);
                    link.set_reachable(false);
                    if !link.back_off(&mut frames).await {
                        return;
                    }
                }
            }
            continue;
        }
        let Some((reader, writer)) = connection.as_mut() else {
            continue;
        };

        // peers never write on this connection, so any read result means it is gone
        let mut peek = [0u8; 1];
        let event = tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => Outbound::Frame(frame),
                None => return,
            },
            _ = reader.read(&mut peek) => Outbound::Lost,
        };

        let failure = match event {
            Outbound::Frame(frame) => {
                match tokio::time::timeout(link.timeout, write_frame(writer, &frame)).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "write timed out".to_string(),
                }
            }
            Outbound::Lost => "connection closed".to_string(),
        };

        warn!("Lost connection to peer {}: {}", link.id, failure);
        connection = None;
        link.set_reachable(false);
        if !link.back_off(&mut frames).await {
            return;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    group: String,
    inbox: mpsc::UnboundedSender<Envelope<Bytes>>,
) {
    // aborting this task drops the set, which aborts every connection task
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer_addr)) => {
                    debug!("Connection from {}", peer_addr);
                    let group = group.clone();
                    let inbox = inbox.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(socket, &group, &inbox).await {
                            error!("Connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    group: &str,
    inbox: &mpsc::UnboundedSender<Envelope<Bytes>>,
) -> Result<(), TransportError> {
    loop {
        let Some(frame) = read_frame(&mut socket).await? else {
            debug!("Peer closed connection");
            return Ok(());
        };

        let (frame_group, envelope) = match proto_to_envelope(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                continue;
            }
        };
        if frame_group != group {
            warn!(
                "Dropping message from {} for group {} (joined {})",
                envelope.sender, frame_group, group
            );
            continue;
        }

        if inbox.send(envelope).is_err() {
            debug!("Inbox closed, dropping connection");
            return Ok(());
        }
    }
}
