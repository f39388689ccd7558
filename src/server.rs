//! sqlcluster server module.

use crate::command::Command;
use crate::errors::StoreError;
use crate::message::Message;
use crate::raft_log::RaftLog;
use crate::replica::{Applied, RaftConfig, Replica};
use crate::state_machine::StateMachine;
use crate::transport;
use async_notify::Notify;
use async_trait::async_trait;
use crossbeam_channel as channel;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use derivative::Derivative;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// sqlcluster transport layer.
///
/// Peers are addressed by connection string. Implementations provide
/// request/response delivery of consensus messages and forwarding of
/// queries to the leader.
#[async_trait]
pub trait StoreTransport {
    /// Send the consensus request `msg` to the node at `to` and return its
    /// response.
    async fn send(&self, to: &str, msg: Message) -> Result<Message, StoreError>;

    /// Have the node at `to` submit `sql` to its own consensus core.
    async fn delegate(&self, to: &str, sql: String) -> Result<Vec<u8>, StoreError>;
}

type QueryResult = Result<Vec<u8>, StoreError>;
type Reply = oneshot::Sender<QueryResult>;

enum Event {
    Message {
        msg: Message,
        reply: Option<oneshot::Sender<Message>>,
    },
    Propose {
        command: Command,
        reply: Reply,
    },
    Abort(StoreError),
    Halt,
}

struct Pending {
    term: u64,
    reply: Reply,
}

/// State owned by the event loop thread.
struct Core {
    replica: Replica,
    state_machine: Box<dyn StateMachine>,
    events: Receiver<Event>,
    pending: HashMap<u64, Pending>,
}

impl Core {
    fn fail_pending(&mut self, reason: impl Fn() -> StoreError) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(reason()));
        }
    }
}

/// Snapshot of the consensus state shared with request handlers.
#[derive(Debug, Default)]
struct ClusterState {
    leader: Option<String>,
    is_leader: bool,
    term: u64,
    peers: BTreeMap<String, String>,
    commit_index: u64,
    last_applied: u64,
    halted: bool,
    waiters: Vec<Arc<Notify>>,
}

impl ClusterState {
    fn wake_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            waiter.notify();
        }
    }
}

/// sqlcluster server.
///
/// Owns the consensus replica of one node. The replica itself only ever runs
/// on the thread executing [`StoreServer::run`]; everything else talks to it
/// through events and reads the published [`ClusterState`].
#[derive(Derivative)]
#[derivative(Debug)]
pub struct StoreServer<T: StoreTransport + Send + Sync + 'static> {
    name: String,
    connection_string: String,
    cluster: Mutex<ClusterState>,
    #[derivative(Debug = "ignore")]
    transport: Arc<T>,
    #[derivative(Debug = "ignore")]
    core: Mutex<Option<Core>>,
    #[derivative(Debug = "ignore")]
    event_tx: Sender<Event>,
    #[derivative(Debug = "ignore")]
    runtime: Handle,
}

impl<T: StoreTransport + Send + Sync + 'static> StoreServer<T> {
    /// Start a new server for the node `name`, reachable by peers at
    /// `connection_string`.
    ///
    /// Must be called from within a tokio runtime; outgoing messages are
    /// sent from tasks spawned on it.
    pub fn start(
        name: String,
        connection_string: String,
        log: RaftLog,
        state_machine: Box<dyn StateMachine>,
        transport: T,
        config: RaftConfig,
    ) -> Result<Self, StoreError> {
        let runtime = Handle::try_current()
            .map_err(|e| StoreError::Unavailable(format!("no async runtime: {}", e)))?;
        let (event_tx, events) = channel::unbounded();
        let replica = Replica::new(name.clone(), log, config, Instant::now());
        let core = Core {
            replica,
            state_machine,
            events,
            pending: HashMap::new(),
        };
        Ok(StoreServer {
            name,
            connection_string,
            cluster: Mutex::new(ClusterState::default()),
            transport: Arc::new(transport),
            core: Mutex::new(Some(core)),
            event_tx,
            runtime,
        })
    }

    /// Name of this node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection string peers use to reach this node.
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Run the blocking event loop until the server is halted or hits a
    /// fatal error.
    ///
    /// The committed prefix of the log is applied before any event is
    /// processed, so a restarted node rebuilds its database first.
    pub fn run(&self) -> Result<(), StoreError> {
        let core = self.core.lock().unwrap().take();
        let mut core = match core {
            Some(core) => core,
            None => return Ok(()),
        };
        let result = self.event_loop(&mut core);
        match &result {
            Ok(()) => info!("{} halted", self.name),
            Err(e) => error!("{} stopped: {}", self.name, e),
        }
        core.fail_pending(|| StoreError::Shutdown);
        let mut cluster = self.cluster.lock().unwrap();
        cluster.halted = true;
        cluster.is_leader = false;
        cluster.leader = None;
        cluster.wake_waiters();
        result
    }

    fn event_loop(&self, core: &mut Core) -> Result<(), StoreError> {
        self.apply(core)?;
        if core.replica.last_applied() > 0 {
            info!(
                "{} replayed log up to index {}",
                self.name,
                core.replica.last_applied()
            );
        }
        self.publish(core);
        loop {
            let event = match core.replica.next_deadline() {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match core.events.recv_timeout(timeout) {
                        Ok(event) => Some(event),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => return Ok(()),
                    }
                }
                None => match core.events.recv() {
                    Ok(event) => Some(event),
                    Err(_) => return Ok(()),
                },
            };
            if let Some(event) = event {
                match event {
                    Event::Halt => return Ok(()),
                    Event::Abort(e) => return Err(e),
                    Event::Message { msg, reply } => {
                        let response = core.replica.step(msg, Instant::now())?;
                        if let (Some(response), Some(reply)) = (response, reply) {
                            let _ = reply.send(response);
                        }
                    }
                    Event::Propose { command, reply } => {
                        match core.replica.propose(command, Instant::now()) {
                            Ok((index, term)) => {
                                core.pending.insert(index, Pending { term, reply });
                            }
                            Err(e) if e.is_transient() => {
                                let _ = reply.send(Err(e));
                            }
                            Err(e) => {
                                let _ = reply.send(Err(StoreError::Shutdown));
                                return Err(e);
                            }
                        }
                    }
                }
            }
            core.replica.tick(Instant::now())?;
            if !core.replica.is_leader() && !core.pending.is_empty() {
                warn!(
                    "{} lost leadership with {} queries in flight",
                    self.name,
                    core.pending.len()
                );
                core.fail_pending(|| StoreError::NotLeader);
            }
            let replies = self.apply(core)?;
            self.dispatch(core);
            self.publish(core);
            for (reply, result) in replies {
                let _ = reply.send(result);
            }
        }
    }

    /// Applies newly committed entries and returns the replies owed to
    /// local submitters.
    fn apply(&self, core: &mut Core) -> Result<Vec<(Reply, QueryResult)>, StoreError> {
        let applied = core
            .replica
            .apply_committed(core.state_machine.as_mut())?;
        let mut replies = Vec::new();
        for Applied {
            index,
            term,
            result,
        } in applied
        {
            if let Some(pending) = core.pending.remove(&index) {
                // Another leader's entry landed where ours was.
                let result = if pending.term == term {
                    result
                } else {
                    Err(StoreError::NotLeader)
                };
                replies.push((pending.reply, result));
            }
        }
        Ok(replies)
    }

    fn dispatch(&self, core: &mut Core) {
        for (to, msg) in core.replica.take_messages() {
            let address = match core.replica.peers().get(&to) {
                Some(address) => address.clone(),
                None => {
                    debug!("{} has no address for {}", self.name, to);
                    continue;
                }
            };
            let transport = self.transport.clone();
            let events = self.event_tx.clone();
            self.runtime.spawn(async move {
                match transport.send(&address, msg).await {
                    Ok(response) => {
                        let _ = events.send(Event::Message {
                            msg: response,
                            reply: None,
                        });
                    }
                    Err(e) => debug!("failed to reach {}: {}", to, e),
                }
            });
        }
    }

    fn publish(&self, core: &Core) {
        let replica = &core.replica;
        let mut cluster = self.cluster.lock().unwrap();
        let leader = replica.leader().map(str::to_string);
        if cluster.leader != leader {
            match &leader {
                Some(leader) => info!("{} sees {} as leader", self.name, leader),
                None => debug!("{} lost track of the leader", self.name),
            }
        }
        cluster.leader = leader;
        cluster.is_leader = replica.is_leader();
        cluster.term = replica.term();
        if cluster.peers != *replica.peers() {
            cluster.peers = replica.peers().clone();
        }
        cluster.commit_index = replica.commit_index();
        cluster.last_applied = replica.last_applied();
        if cluster.leader.is_some() {
            cluster.wake_waiters();
        }
    }

    /// Stop the event loop. Pending and future submissions fail with
    /// [`StoreError::Shutdown`].
    pub fn halt(&self) {
        let _ = self.event_tx.send(Event::Halt);
    }

    /// Stop the event loop because of a fatal error detected outside it.
    pub fn abort(&self, err: StoreError) {
        let _ = self.event_tx.send(Event::Abort(err));
    }

    /// Has the event loop stopped?
    pub fn is_halted(&self) -> bool {
        self.cluster.lock().unwrap().halted
    }

    /// Is this node the leader?
    pub fn is_leader(&self) -> bool {
        self.cluster.lock().unwrap().is_leader
    }

    /// Name of the current leader, if known.
    pub fn leader(&self) -> Option<String> {
        self.cluster.lock().unwrap().leader.clone()
    }

    /// Current term.
    pub fn term(&self) -> u64 {
        self.cluster.lock().unwrap().term
    }

    /// The other cluster members with their connection strings.
    pub fn peers(&self) -> BTreeMap<String, String> {
        self.cluster.lock().unwrap().peers.clone()
    }

    /// Highest committed log index.
    pub fn commit_index(&self) -> u64 {
        self.cluster.lock().unwrap().commit_index
    }

    /// Highest applied log index.
    pub fn last_applied(&self) -> u64 {
        self.cluster.lock().unwrap().last_applied
    }

    /// Submit `command` to the local consensus core and wait until it is
    /// committed and applied.
    ///
    /// Fails with [`StoreError::NotLeader`] if this node is not the leader or
    /// loses leadership before the command commits.
    pub async fn submit(&self, command: Command) -> Result<Vec<u8>, StoreError> {
        let (reply, result) = oneshot::channel();
        self.event_tx
            .send(Event::Propose { command, reply })
            .map_err(|_| StoreError::Shutdown)?;
        result.await.map_err(|_| StoreError::Shutdown)?
    }

    /// Execute a SQL statement on the cluster.
    ///
    /// The leader submits it locally. Other nodes wait until a leader is
    /// known and is a recognized peer, then forward the statement to it once.
    pub async fn query<S: AsRef<str>>(&self, stmt: S) -> Result<Vec<u8>, StoreError> {
        let sql = stmt.as_ref().to_string();
        let route = self
            .wait_for(|cluster| match &cluster.leader {
                Some(leader) if *leader == self.name => Some(None),
                Some(leader) => cluster
                    .peers
                    .get(leader)
                    .map(|address| Some((leader.clone(), address.clone()))),
                None => None,
            })
            .await?;
        match route {
            None => self.submit(Command::Query { sql }).await,
            Some((leader, address)) => {
                debug!("{} forwarding query to {}", self.name, leader);
                self.transport.delegate(&address, sql).await
            }
        }
    }

    /// Admit `name`, reachable at `connection_string`, to the cluster.
    pub async fn join(&self, name: String, connection_string: String) -> Result<(), StoreError> {
        transport::decode(&connection_string)?;
        info!("{} admitting {} at {}", self.name, name, connection_string);
        self.submit(Command::Join {
            name,
            connection_string,
        })
        .await
        .map(drop)
    }

    /// Wait for a leader to be elected and return its name.
    pub async fn wait_for_leader(&self) -> Result<String, StoreError> {
        self.wait_for(|cluster| cluster.leader.clone()).await
    }

    async fn wait_for<R>(
        &self,
        ready: impl Fn(&ClusterState) -> Option<R>,
    ) -> Result<R, StoreError> {
        loop {
            let notify = {
                let mut cluster = self.cluster.lock().unwrap();
                if let Some(ready) = ready(&cluster) {
                    return Ok(ready);
                }
                if cluster.halted {
                    return Err(StoreError::Shutdown);
                }
                let notify = Arc::new(Notify::new());
                cluster.waiters.push(notify.clone());
                notify
            };
            notify.notified().await;
        }
    }

    /// Receive a consensus request from a peer and return the response.
    pub async fn recv_msg(&self, msg: Message) -> Result<Message, StoreError> {
        let (reply, response) = oneshot::channel();
        self.event_tx
            .send(Event::Message {
                msg,
                reply: Some(reply),
            })
            .map_err(|_| StoreError::Shutdown)?;
        response.await.map_err(|_| StoreError::Shutdown)
    }
}
