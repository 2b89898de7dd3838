mod acceptor;
mod connection;
mod role;

pub use self::acceptor::Acceptor;
pub use self::connection::{
    read_message, write_message, Connection, ConnectionError, ConnectionParameters,
    ConnectionResult, Incoming, Outgoing,
};
pub use self::role::{Candidate, CandidatePhase, Follower, Leader, NodeState, Role, RoleKind};

use crate::raft::{PersistentState, VolatileState};
use crate::storage::{MemoryStorage, Storage, StorageError};
use crate::sync::{apply_many2, Synchronized};
use crate::timer::{on_fired, random_between, Expiry, Timer};
use raftd_api::{
    AppendEntries, AppendEntriesResponse, Message, NodeId, RequestVote, RequestVoteResponse,
    TermId,
};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use std::{fmt, io};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, trace};
use typed_builder::TypedBuilder;

/// Identity and election timing of a node
#[derive(TypedBuilder, Debug, Clone)]
pub struct StateParameters {
    #[builder(default = NodeId::random())]
    pub uuid: NodeId,

    /// How long a follower waits for a leader before becoming a candidate,
    /// and how long a candidate collects votes
    #[builder(default = StateParameters::DEFAULT_ELECTION_TIMEOUT)]
    pub election_timeout: Duration,

    /// Bounds of the randomized delay before a candidate asks for votes
    #[builder(default = StateParameters::DEFAULT_ELECTION_START_MIN)]
    pub election_start_min: Duration,
    #[builder(default = StateParameters::DEFAULT_ELECTION_START_MAX)]
    pub election_start_max: Duration,
}

impl StateParameters {
    pub const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_millis(300);
    pub const DEFAULT_ELECTION_START_MIN: Duration = Duration::from_millis(150);
    pub const DEFAULT_ELECTION_START_MAX: Duration = Duration::from_millis(300);
}

impl Default for StateParameters {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Some parameters of runtime operation
#[derive(TypedBuilder, Debug, Clone)]
pub struct Parameters {
    #[builder(default = Parameters::DEFAULT_BIND_ADDR)]
    pub bind: SocketAddr,

    /// Peers to dial at startup
    #[builder(default)]
    pub neighbours: BTreeSet<SocketAddr>,

    #[builder(default)]
    pub connection: ConnectionParameters,

    #[builder(default)]
    pub state: StateParameters,

    /// Where the persistent raft state goes
    #[builder(default = Parameters::default_storage())]
    pub storage: Arc<dyn Storage>,
}

impl Parameters {
    pub const DEFAULT_BIND_ADDR: SocketAddr =
        SocketAddr::new(std::net::IpAddr::V6(Ipv6Addr::LOCALHOST), 0);

    pub fn default_storage() -> Arc<dyn Storage> {
        Arc::new(MemoryStorage::default())
    }
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;

/// What the node looks like from the outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub role: RoleKind,
    pub term: TermId,
    pub voted_for: Option<NodeId>,
}

impl NodeStatus {
    fn of(role: &Role) -> Self {
        let view = role.state().persistent.acquire();
        Self {
            role: role.kind(),
            term: view.current_term(),
            voted_for: view.voted_for(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
}

/// One consistent observation of both peer tables for an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerTables {
    pub link: Option<LinkState>,
    pub retry_pending: bool,
}

/// Entry of the connection table
#[derive(Debug, Clone)]
enum PeerLink {
    /// Dial in progress
    Connecting(Weak<Connection<Outgoing>>),
    Connected(Weak<Connection<Outgoing>>),
}

impl PeerLink {
    fn state(&self) -> LinkState {
        match self {
            PeerLink::Connecting(_) => LinkState::Connecting,
            PeerLink::Connected(_) => LinkState::Connected,
        }
    }

    fn conn(&self) -> &Weak<Connection<Outgoing>> {
        match self {
            PeerLink::Connecting(c) | PeerLink::Connected(c) => c,
        }
    }

    fn is(&self, conn: &Arc<Connection<Outgoing>>) -> bool {
        Weak::ptr_eq(self.conn(), &Arc::downgrade(conn))
    }

    fn connected(&self) -> Option<Arc<Connection<Outgoing>>> {
        match self {
            PeerLink::Connected(c) => c.upgrade(),
            PeerLink::Connecting(_) => None,
        }
    }
}

/// Non-owning handle to a running [`Node`]
#[derive(Clone)]
pub struct NodeCtrl {
    node: Weak<Node>,
    local_addr: SocketAddr,
    status_rx: watch::Receiver<NodeStatus>,
    is_shutting_down: Arc<AtomicBool>,
}

impl NodeCtrl {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The node, if it's still alive
    pub fn node(&self) -> Option<Arc<Node>> {
        self.node.upgrade()
    }

    pub fn status(&self) -> NodeStatus {
        *self.status_rx.borrow()
    }

    pub fn status_rx(&self) -> watch::Receiver<NodeStatus> {
        self.status_rx.clone()
    }

    /// Stop accepting new connections
    pub fn stop(&self) {
        if let Some(node) = self.node() {
            node.stop();
        }
        self.is_shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self, endpoint: SocketAddr) -> bool {
        self.peer_tables(endpoint).link == Some(LinkState::Connected)
    }

    pub fn is_retry_pending(&self, endpoint: SocketAddr) -> bool {
        self.peer_tables(endpoint).retry_pending
    }

    pub fn peer_tables(&self, endpoint: SocketAddr) -> PeerTables {
        self.node()
            .map(|node| node.peer_tables(endpoint))
            .unwrap_or(PeerTables {
                link: None,
                retry_pending: false,
            })
    }

    /// See [`Node::connect_neighbour`]
    pub fn connect_neighbour(&self, endpoint: SocketAddr) -> bool {
        self.node()
            .map(|node| node.connect_neighbour(endpoint))
            .unwrap_or(false)
    }

    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        debug!("Installing signal handler");
        for sig in TERM_SIGNALS {
            trace!(sig, "Installing signal handler");
            flag::register(*sig, Arc::clone(&self.is_shutting_down))?;
        }
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Wait for a termination signal, a `stop`, or a panicked task
    pub async fn wait_for_shutdown(&self) {
        while !self.is_shutting_down() {
            sleep(Duration::from_millis(100)).await;
        }
    }
}

/// The consensus engine
///
/// Owned by whatever is still working for it: the pending accept, every
/// established incoming link, and the armed election timer. Outgoing
/// links and retry timers only hold weak references; outgoing links are
/// torn down once the node is gone.
///
/// So a stopped node keeps running while it serves a peer or waits on an
/// election timer. A leader has no timer armed, so once stopped it lives
/// only as long as its incoming links.
pub struct Node {
    rt: Handle,
    weak_self: Weak<Node>,
    params: Parameters,
    acceptor: Arc<Acceptor>,
    /// Outgoing connections only; inbound peers are not identified
    connections: Synchronized<BTreeMap<SocketAddr, PeerLink>>,
    /// Neighbours waiting to be dialed again
    retries: Synchronized<BTreeMap<SocketAddr, Timer>>,
    /// Always `Some`, except inside [`Node::change_state`]
    role: Synchronized<Option<Role>>,
    status_tx: watch::Sender<NodeStatus>,
    /// Never sent on; closes when the node is dropped
    alive_tx: watch::Sender<()>,
    is_shutting_down: Arc<AtomicBool>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("local_addr", &self.local_addr())
            .field("status", &self.status())
            .finish()
    }
}

impl Node {
    /// Bind, start accepting, dial all neighbours and become a follower
    ///
    /// All the work happens on `rt`. The returned handle doesn't keep
    /// the node alive; see [`Node`] for what does.
    pub fn create(rt: &Handle, params: Parameters) -> NodeResult<NodeCtrl> {
        let _enter = rt.enter();

        info!(
            bind = %params.bind,
            id = %params.state.uuid,
            neighbours = params.neighbours.len(),
            "Starting raftd node"
        );

        let acceptor = Arc::new(Acceptor::bind(params.bind)?);
        let local_addr = acceptor.local_addr();

        let persisted = params.storage.load()?.unwrap_or_default();
        let state = NodeState {
            persistent: PersistentState::restore(params.storage.clone(), persisted),
            volatile: VolatileState::default(),
        };
        let follower = Follower::new(Timer::new(rt.clone()), state);

        let role = Role::Follower(follower);
        let (status_tx, status_rx) = watch::channel(NodeStatus::of(&role));
        let is_shutting_down = Arc::new(AtomicBool::new(false));

        let node = Arc::new_cyclic(|weak_self| Node {
            rt: rt.clone(),
            weak_self: weak_self.clone(),
            params,
            acceptor,
            connections: Synchronized::default(),
            retries: Synchronized::default(),
            role: Synchronized::new(Some(role)),
            status_tx,
            alive_tx: watch::channel(()).0,
            is_shutting_down: is_shutting_down.clone(),
        });

        node.change_state(|role| match role {
            Role::Follower(mut follower) => {
                node.arm_election_timeout(&mut follower.timer);
                (Role::Follower(follower), ())
            }
            other => (other, ()),
        });

        node.start_accept();
        node.connect_neighbours();

        Ok(NodeCtrl {
            node: Arc::downgrade(&node),
            local_addr,
            status_rx,
            is_shutting_down,
        })
    }

    pub fn id(&self) -> NodeId {
        self.params.state.uuid
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn status(&self) -> NodeStatus {
        *self.status_tx.borrow()
    }

    /// Commit index and last applied index
    pub fn volatile_state(&self) -> VolatileState {
        self.role.apply(|role| {
            role.as_ref()
                .expect("role always present outside a transition")
                .state()
                .volatile
        })
    }

    /// Stop accepting new connections
    ///
    /// Established connections and the election timer keep going.
    pub fn stop(&self) {
        if self.acceptor.close() {
            info!(local_addr = %self.local_addr(), "Node stopped accepting connections");
        }
    }

    fn start_accept(self: &Arc<Self>) {
        Connection::<Incoming>::create(self);
    }

    fn connect_neighbours(&self) {
        for endpoint in &self.params.neighbours {
            self.connect_neighbour(*endpoint);
        }
    }

    /// Dial `endpoint` unless already connected, connecting, or waiting for a retry
    ///
    /// Returns `true` if a new connection attempt was started.
    pub fn connect_neighbour(&self, endpoint: SocketAddr) -> bool {
        apply_many2(&self.connections, &self.retries, |connections, retries| {
            if connections.contains_key(&endpoint) || retries.contains_key(&endpoint) {
                return false;
            }
            self.dial(connections, endpoint);
            true
        })
    }

    /// Must be called with the connection table locked
    fn dial(&self, connections: &mut BTreeMap<SocketAddr, PeerLink>, endpoint: SocketAddr) {
        // the task can't report back before we release the tables
        let conn = Connection::<Outgoing>::create(self, endpoint);
        connections.insert(endpoint, PeerLink::Connecting(Arc::downgrade(&conn)));
    }

    pub fn peer_tables(&self, endpoint: SocketAddr) -> PeerTables {
        apply_many2(&self.connections, &self.retries, |connections, retries| {
            PeerTables {
                link: connections.get(&endpoint).map(PeerLink::state),
                retry_pending: retries.contains_key(&endpoint),
            }
        })
    }

    pub(crate) fn on_connected(&self, conn: &Arc<Connection<Outgoing>>) {
        let endpoint = conn.endpoint();
        apply_many2(&self.connections, &self.retries, |connections, retries| {
            // dropping the timer cancels it
            retries.remove(&endpoint);
            connections.insert(endpoint, PeerLink::Connected(Arc::downgrade(conn)));
        });
        info!(%endpoint, "Connected to peer");
    }

    pub(crate) fn on_disconnected(&self, conn: &Arc<Connection<Outgoing>>) {
        let endpoint = conn.endpoint();
        let scheduled = apply_many2(&self.connections, &self.retries, |connections, retries| {
            if connections.get(&endpoint).map_or(false, |link| link.is(conn)) {
                connections.remove(&endpoint);
            }
            if connections.contains_key(&endpoint) {
                // a newer connection owns the endpoint now
                return false;
            }

            match retries.entry(endpoint) {
                Entry::Occupied(_) => false,
                Entry::Vacant(entry) => {
                    let mut timer = Timer::new(self.rt.clone());
                    let node = self.weak_self.clone();
                    timer.schedule_after(
                        self.params.connection.retry,
                        on_fired(move |expiry| {
                            if let Some(node) = node.upgrade() {
                                node.reconnect(endpoint, expiry);
                            }
                        }),
                    );
                    entry.insert(timer);
                    true
                }
            }
        });

        if scheduled {
            debug!(%endpoint, retry = ?self.params.connection.retry, "Peer disconnected, retry scheduled");
        }
    }

    fn reconnect(&self, endpoint: SocketAddr, expiry: Expiry) {
        apply_many2(&self.connections, &self.retries, |connections, retries| {
            if !retries
                .get(&endpoint)
                .map_or(false, |timer| timer.is_current(expiry))
            {
                return;
            }
            retries.remove(&endpoint);

            if connections.contains_key(&endpoint) {
                return;
            }
            debug!(%endpoint, "Retrying connection");
            self.dial(connections, endpoint);
        });
    }

    /// Queue `msg` on every connected outgoing link
    fn broadcast(&self, msg: Message) {
        let peers: Vec<_> = self.connections.apply(|connections| {
            connections
                .values()
                .filter_map(PeerLink::connected)
                .collect()
        });
        debug!(kind = %msg.kind(), peers = peers.len(), "Broadcasting");
        for peer in peers {
            peer.send(msg.clone());
        }
    }

    /// Run a transition with exclusive access to the role
    ///
    /// `f` gets the current role by value and must hand back the next one.
    /// The new status is published before anyone else can see the role.
    fn change_state<R>(&self, f: impl FnOnce(Role) -> (Role, R)) -> R {
        self.role.apply(|slot| {
            let prev = NodeStatus::of(
                slot.as_ref()
                    .expect("role always present outside a transition"),
            );
            let role = slot
                .take()
                .expect("role always present outside a transition");

            let (role, ret) = f(role);

            let status = NodeStatus::of(&role);
            *slot = Some(role);

            if prev.role != status.role || prev.term != status.term {
                info!(
                    role = %status.role,
                    term = %status.term,
                    voted_for = ?status.voted_for,
                    "State changed"
                );
            }
            if prev != status {
                self.status_tx.send_replace(status);
            }
            ret
        })
    }

    fn arm_election_timeout(self: &Arc<Self>, timer: &mut Timer) -> Expiry {
        self.arm(timer, self.params.state.election_timeout)
    }

    fn arm_election_start(self: &Arc<Self>, timer: &mut Timer) -> Expiry {
        let delay = random_between(
            self.params.state.election_start_min,
            self.params.state.election_start_max,
        );
        self.arm(timer, delay)
    }

    /// The armed timer keeps the node alive until it fires or is re-armed
    fn arm(self: &Arc<Self>, timer: &mut Timer, duration: Duration) -> Expiry {
        let node = self.clone();
        trace!(?duration, "Arming election timer");
        timer.schedule_after(duration, on_fired(move |expiry| node.on_election_timer(expiry)))
    }

    fn on_election_timer(self: &Arc<Self>, expiry: Expiry) {
        let request = self.change_state(|role| {
            if !role.timer().is_current(expiry) {
                // re-armed or replaced after this one fired
                return (role, None);
            }
            self.on_role_timeout(role)
        });

        if let Some(request) = request {
            self.broadcast(request.into());
        }
    }

    fn on_role_timeout(self: &Arc<Self>, role: Role) -> (Role, Option<RequestVote>) {
        match role {
            Role::Follower(follower) => {
                let mut candidate = Candidate::from_follower(follower, self.id());
                self.arm_election_start(&mut candidate.timer);
                (Role::Candidate(candidate), None)
            }
            Role::Candidate(mut candidate) => match candidate.phase {
                CandidatePhase::WaitingToStart => {
                    let request = candidate.start_election(self.id());
                    self.arm_election_timeout(&mut candidate.timer);
                    (Role::Candidate(candidate), Some(request))
                }
                CandidatePhase::Electing => {
                    let neighbours = self.params.neighbours.len();
                    if candidate.has_quorum(neighbours) {
                        info!(votes = candidate.votes.len(), neighbours, "Won the election");
                        (
                            Role::Leader(Leader::from_candidate(candidate, neighbours)),
                            None,
                        )
                    } else {
                        debug!(votes = candidate.votes.len(), neighbours, "No quorum, retrying");
                        candidate.retry();
                        self.arm_election_start(&mut candidate.timer);
                        (Role::Candidate(candidate), None)
                    }
                }
            },
            // no heartbeats yet
            Role::Leader(leader) => (Role::Leader(leader), None),
        }
    }

    /// Become a follower of `term` if it's newer than ours
    fn observe_term(self: &Arc<Self>, role: Role, term: TermId) -> Role {
        if term <= role.current_term() {
            return role;
        }
        debug!(%term, "Discovered newer term");
        let mut follower = Follower::step_down(role, term);
        self.arm_election_timeout(&mut follower.timer);
        Role::Follower(follower)
    }

    /// Handle a request received on an incoming link, returning the response
    pub fn handle_request(self: &Arc<Self>, msg: Message) -> Option<Message> {
        match msg {
            Message::RequestVote(req) => Some(
                self.change_state(|role| self.on_request_vote(role, &req))
                    .into(),
            ),
            Message::AppendEntries(req) => Some(
                self.change_state(|role| self.on_append_entries(role, &req))
                    .into(),
            ),
            other => {
                debug!(kind = %other.kind(), "Ignoring response on an incoming link");
                None
            }
        }
    }

    fn on_request_vote(
        self: &Arc<Self>,
        role: Role,
        req: &RequestVote,
    ) -> (Role, RequestVoteResponse) {
        let mut role = self.observe_term(role, req.term);

        let (term, grant) = {
            let view = role.state().persistent.acquire();
            let grant = req.term == view.current_term()
                && view.voted_for().map_or(true, |id| id == req.candidate_id)
                && view.is_log_up_to_date(req.last_log_term, req.last_log_index);
            (view.current_term(), grant)
        };

        if grant {
            let persistent = &mut role.state_mut().persistent;
            if persistent.acquire().voted_for() != Some(req.candidate_id) {
                *persistent.acquire_mut().voted_for() = Some(req.candidate_id);
            }
            if let Role::Follower(follower) = &mut role {
                self.arm_election_timeout(&mut follower.timer);
            }
        }

        debug!(candidate = %req.candidate_id, %term, grant, "Vote requested");
        (
            role,
            RequestVoteResponse {
                term,
                vote_granted: grant,
            },
        )
    }

    fn on_append_entries(
        self: &Arc<Self>,
        role: Role,
        req: &AppendEntries,
    ) -> (Role, AppendEntriesResponse) {
        let role = self.observe_term(role, req.term);
        let term = role.current_term();
        let accepted = req.term == term;

        let role = match role {
            // a leader of our term exists
            Role::Candidate(candidate) if accepted => {
                let mut follower = Follower::step_down(Role::Candidate(candidate), term);
                self.arm_election_timeout(&mut follower.timer);
                Role::Follower(follower)
            }
            Role::Follower(mut follower) if accepted => {
                self.arm_election_timeout(&mut follower.timer);
                Role::Follower(follower)
            }
            other => other,
        };

        (
            role,
            AppendEntriesResponse {
                term,
                // entries are never applied
                success: accepted && req.entries.is_empty(),
            },
        )
    }

    /// Handle a response the peer at `endpoint` sent on our outgoing link
    pub fn handle_response(self: &Arc<Self>, endpoint: SocketAddr, msg: Message) {
        match msg {
            Message::RequestVoteResponse(resp) => self.change_state(|role| {
                let role = self.observe_term(role, resp.term);
                match role {
                    Role::Candidate(mut candidate)
                        if resp.vote_granted
                            && candidate.phase == CandidatePhase::Electing
                            && resp.term == candidate.state.current_term() =>
                    {
                        if candidate.votes.insert(endpoint) {
                            debug!(%endpoint, term = %resp.term, "Vote granted");
                        }
                        (Role::Candidate(candidate), ())
                    }
                    other => (other, ()),
                }
            }),
            Message::AppendEntriesResponse(resp) => {
                self.change_state(|role| (self.observe_term(role, resp.term), ()))
            }
            other => {
                debug!(%endpoint, kind = %other.kind(), "Ignoring request on an outgoing link");
            }
        }
    }
}
