pub mod pending;

pub use pending::{Discard, InFlight, Resolution, select_latest};

use crate::config::Config;
use crate::error::{RegisterError, Result};
use crate::message::{Command, Envelope, Message};
use crate::quorum::Majority;
use crate::transport::Transport;
use crate::types::{Label, OperationId, ProcessId, View};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// How a replica takes part in the register
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Only writable replicas may call `write`
    pub writable: bool,
    /// Fail an operation that has not gathered a quorum in time.
    /// None waits forever.
    pub operation_timeout: Option<Duration>,
}

impl RegisterOptions {
    pub fn writable() -> Self {
        Self {
            writable: true,
            operation_timeout: None,
        }
    }

    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }
}

impl From<&Config> for RegisterOptions {
    fn from(config: &Config) -> Self {
        Self {
            writable: config.node.writable,
            operation_timeout: config.register.operation_timeout(),
        }
    }
}

/// The (value, label) pair a replica serves to its peers
#[derive(Debug)]
struct ReplicaState<V> {
    value: Option<V>,
    label: Label,
}

/// Counters owned by the client role, guarded by the single-flight lock
#[derive(Debug, Default)]
struct ClientSide {
    write_counter: u64,
    next_operation: u64,
}

struct Pending<V> {
    round: InFlight<V>,
    completion: oneshot::Sender<Resolution<V>>,
}

/// Shared core of one register replica
///
/// The receive task drives the server role through `handle_message`; callers
/// drive the client role through `execute`. The two only meet on `state`
/// and the in-flight slot.
struct Replica<V, T> {
    id: ProcessId,
    name: String,
    writable: bool,
    operation_timeout: Option<Duration>,
    transport: Arc<T>,
    state: RwLock<ReplicaState<V>>,
    client: Mutex<ClientSide>,
    in_flight: Mutex<Option<Pending<V>>>,
    views: watch::Receiver<View>,
    closed: AtomicBool,
}

impl<V, T> Replica<V, T>
where
    V: Clone + Send + Sync + 'static,
    T: Transport<V> + 'static,
{
    /// Server role: answer a request or feed a reply to the in-flight round
    async fn handle_message(&self, envelope: Envelope<V>) {
        let Envelope { sender, message } = envelope;
        let operation = message.operation;
        trace!(
            "{} received {} {} from {}",
            self.id,
            message.kind(),
            operation,
            sender
        );

        match message.command {
            Command::ReadRequest => {
                let reply = {
                    let state = self.state.read().await;
                    Message::read_reply(operation, state.value.clone(), state.label)
                };
                self.reply(sender, reply).await;
            }
            Command::WriteRequest { value, label } => {
                {
                    let mut state = self.state.write().await;
                    if label > state.label {
                        debug!(
                            "{} adopting label {} (was {}) from {}",
                            self.id, label, state.label, sender
                        );
                        state.value = value;
                        state.label = label;
                    }
                }
                self.reply(sender, Message::write_reply(operation)).await;
            }
            reply @ (Command::ReadReply { .. } | Command::WriteReply) => {
                self.collect_reply(sender, operation, reply).await;
            }
        }
    }

    async fn reply(&self, to: ProcessId, message: Message<V>) {
        let kind = message.kind();
        if let Err(e) = self.transport.send(to, message).await {
            warn!("{} failed to send {} to {}: {}", self.id, kind, to, e);
        }
    }

    async fn collect_reply(&self, sender: ProcessId, operation: OperationId, reply: Command<V>) {
        let kind = reply.kind();
        let mut slot = self.in_flight.lock().await;
        let Some(pending) = slot.as_mut() else {
            debug!(
                "{} discarding {} for {} from {}: no operation in flight",
                self.id, kind, operation, sender
            );
            return;
        };

        match pending.round.record(sender, operation, reply) {
            Ok(None) => {}
            Ok(Some(resolution)) => {
                if let Some(done) = slot.take() {
                    debug!("{} resolved {}", self.id, operation);
                    // the caller may have timed out already
                    let _ = done.completion.send(resolution);
                }
            }
            Err(reason) => {
                debug!(
                    "{} discarding {} from {}: {}",
                    self.id, kind, sender, reason
                );
            }
        }
    }

    /// Client role: run one quorum round for `command`.
    ///
    /// The caller holds the single-flight lock for the whole call.
    async fn execute(&self, client: &mut ClientSide, command: Command<V>) -> Result<Resolution<V>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegisterError::Closed(self.name.clone()));
        }

        client.next_operation += 1;
        let operation = OperationId(client.next_operation);

        let round = self.run_round(operation, command);
        match self.operation_timeout {
            None => round.await,
            Some(after) => match tokio::time::timeout(after, round).await {
                Ok(resolution) => resolution,
                Err(_) => {
                    self.clear_in_flight(operation).await;
                    warn!("{} gave up on {} after {:?}", self.id, operation, after);
                    Err(RegisterError::Timeout { operation, after })
                }
            },
        }
    }

    async fn run_round(&self, operation: OperationId, command: Command<V>) -> Result<Resolution<V>> {
        let expects = command.kind().reply_kind().ok_or_else(|| {
            RegisterError::Protocol(format!("{} is not a request", command.kind()))
        })?;

        let majority = self.current_majority().await?;
        let quorum = majority.pick_quorum(&mut rand::thread_rng());

        let (completion, resolved) = oneshot::channel();
        *self.in_flight.lock().await = Some(Pending {
            round: InFlight::new(operation, expects, quorum.clone(), majority.quorum_size()),
            completion,
        });
        if self.closed.load(Ordering::SeqCst) {
            self.clear_in_flight(operation).await;
            return Err(RegisterError::Closed(self.name.clone()));
        }

        debug!(
            "{} started {} {} on quorum of {} from view#{}",
            self.id,
            command.kind(),
            operation,
            majority.quorum_size(),
            majority.view_id()
        );

        let message = Message { operation, command };
        for member in quorum {
            let kind = message.kind();
            if let Err(e) = self.transport.send(member, message.clone()).await {
                warn!("{} failed to send {} to {}: {}", self.id, kind, member, e);
            }
        }

        resolved
            .await
            .map_err(|_| RegisterError::Closed(self.name.clone()))
    }

    /// Wait until the view holds enough members for a quorum, then build
    /// its quorum system
    async fn current_majority(&self) -> Result<Majority> {
        let mut views = self.views.clone();
        let view = views
            .wait_for(|view| Majority::new(view).is_available())
            .await
            .map_err(|_| RegisterError::Closed(self.name.clone()))?;
        Ok(Majority::new(&view))
    }

    async fn clear_in_flight(&self, operation: OperationId) {
        let mut slot = self.in_flight.lock().await;
        if slot
            .as_ref()
            .is_some_and(|p| p.round.operation() == operation)
        {
            slot.take();
        }
    }

    /// Drop the in-flight round so its caller observes `Closed`
    async fn abandon_in_flight(&self) {
        if let Some(pending) = self.in_flight.lock().await.take() {
            debug!(
                "{} abandoning {} with {} replies",
                self.id,
                pending.round.operation(),
                pending.round.received()
            );
        }
    }
}

/// One replica of an ABD atomic register
///
/// Every replica serves its peers' requests from a background task and can
/// run reads (and, if writable, writes) for its local callers. At most one
/// client operation runs at a time per replica; concurrent callers queue.
///
/// ```no_run
/// # use abd::{InMemoryNetwork, ProcessId, Register, RegisterOptions};
/// # use std::sync::Arc;
/// # async fn demo() -> abd::error::Result<()> {
/// let network = InMemoryNetwork::<String>::new();
/// let transport = Arc::new(network.endpoint(ProcessId::from_node_id(1)));
/// let register = Register::init("demo", transport, RegisterOptions::writable()).await?;
/// register.write("hello".to_string()).await?;
/// assert_eq!(register.read().await?, Some("hello".to_string()));
/// register.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Register<V, T>
where
    V: Send + 'static,
    T: Transport<V> + 'static,
{
    replica: Arc<Replica<V, T>>,
    receiver: JoinHandle<()>,
}

impl<V, T> Register<V, T>
where
    V: Clone + Send + Sync + 'static,
    T: Transport<V> + 'static,
{
    /// Join the named group with empty state (no value, label 0)
    pub async fn init(name: &str, transport: Arc<T>, options: RegisterOptions) -> Result<Self> {
        let membership = transport.join(name).await?;
        let id = transport.local_id();

        let replica = Arc::new(Replica {
            id,
            name: name.to_string(),
            writable: options.writable,
            operation_timeout: options.operation_timeout,
            transport,
            state: RwLock::new(ReplicaState {
                value: None,
                label: Label::ZERO,
            }),
            client: Mutex::new(ClientSide::default()),
            in_flight: Mutex::new(None),
            views: membership.views.clone(),
            closed: AtomicBool::new(false),
        });

        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&replica),
            membership.inbox,
            membership.views,
        ));

        info!(
            "Replica {} joined register '{}' (writable={})",
            id, name, options.writable
        );
        Ok(Self { replica, receiver })
    }

    /// Linearizable read: query a quorum, then write the newest state back
    /// to a quorum before returning it.
    pub async fn read(&self) -> Result<Option<V>> {
        self.read_labeled().await.map(|(value, _)| value)
    }

    /// Like `read`, also returning the label of the value read
    pub async fn read_labeled(&self) -> Result<(Option<V>, Label)> {
        let mut client = self.replica.client.lock().await;

        let (value, label) = match self
            .replica
            .execute(&mut client, Command::ReadRequest)
            .await?
        {
            Resolution::Read { value, label } => (value, label),
            Resolution::Written => {
                return Err(RegisterError::Protocol(
                    "read round resolved as a write".to_string(),
                ));
            }
        };

        // read-repair with the label we found, not a fresh one
        let repair = Command::WriteRequest {
            value: value.clone(),
            label,
        };
        match self.replica.execute(&mut client, repair).await? {
            Resolution::Written => Ok((value, label)),
            Resolution::Read { .. } => Err(RegisterError::Protocol(
                "read-repair round resolved as a read".to_string(),
            )),
        }
    }

    /// Write `value` under a fresh label minted by this replica.
    ///
    /// Returns the label once a quorum has acknowledged.
    pub async fn write(&self, value: V) -> Result<Label> {
        if !self.replica.writable {
            return Err(RegisterError::NotWritable(self.replica.name.clone()));
        }

        let mut client = self.replica.client.lock().await;
        client.write_counter += 1;
        let label = Label(client.write_counter);

        let command = Command::WriteRequest {
            value: Some(value),
            label,
        };
        match self.replica.execute(&mut client, command).await? {
            Resolution::Written => Ok(label),
            Resolution::Read { .. } => Err(RegisterError::Protocol(
                "write round resolved as a read".to_string(),
            )),
        }
    }

    /// Stop serving peers, fail any waiting operation and leave the group
    pub async fn close(&self) -> Result<()> {
        if self.replica.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.receiver.abort();
        self.replica.abandon_in_flight().await;
        self.replica.transport.leave().await?;
        info!(
            "Replica {} closed register '{}'",
            self.replica.id, self.replica.name
        );
        Ok(())
    }

    pub fn id(&self) -> ProcessId {
        self.replica.id
    }

    pub fn name(&self) -> &str {
        &self.replica.name
    }

    pub fn is_writable(&self) -> bool {
        self.replica.writable
    }

    /// Latest membership view reported by the transport
    pub fn view(&self) -> View {
        self.replica.views.borrow().clone()
    }

    /// This replica's local (value, label), without contacting peers
    pub async fn snapshot(&self) -> (Option<V>, Label) {
        let state = self.replica.state.read().await;
        (state.value.clone(), state.label)
    }
}

/// Dropping a register that was not closed stops its receive task and, when
/// a tokio runtime is at hand, leaves the group in the background. Outside a
/// runtime the replica stays in its peers' views; call `close` first.
impl<V, T> Drop for Register<V, T>
where
    V: Send + 'static,
    T: Transport<V> + 'static,
{
    fn drop(&mut self) {
        self.receiver.abort();
        if self.replica.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let transport = Arc::clone(&self.replica.transport);
            let id = self.replica.id;
            runtime.spawn(async move {
                if let Err(e) = transport.leave().await {
                    warn!("{} failed to leave after drop: {}", id, e);
                }
            });
        }
    }
}

async fn receive_loop<V, T>(
    replica: Arc<Replica<V, T>>,
    mut inbox: mpsc::UnboundedReceiver<Envelope<V>>,
    mut views: watch::Receiver<View>,
) where
    V: Clone + Send + Sync + 'static,
    T: Transport<V> + 'static,
{
    let mut watching = true;
    loop {
        tokio::select! {
            envelope = inbox.recv() => match envelope {
                Some(envelope) => replica.handle_message(envelope).await,
                None => {
                    debug!("{} inbox closed", replica.id);
                    break;
                }
            },
            changed = views.changed(), if watching => match changed {
                Ok(()) => {
                    let view = views.borrow_and_update().clone();
                    info!("{} observed {}", replica.id, view);
                }
                Err(_) => watching = false,
            },
        }
    }

    replica.abandon_in_flight().await;
}
