//! Roles of a node and the transitions between them
//!
//! Every transition consumes the previous role by value, moving the
//! [`NodeState`] over and re-binding the election timer, so there's
//! always exactly one copy of the state and at most one armed timer.
use std::collections::BTreeSet;
use std::net::SocketAddr;

use derive_more::Display;
use raftd_api::{NodeId, RequestVote, TermId};

use crate::raft::{PersistentState, VolatileState};
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RoleKind {
    #[display(fmt = "follower")]
    Follower,
    #[display(fmt = "candidate")]
    Candidate,
    #[display(fmt = "leader")]
    Leader,
}

/// State shared by all roles, handed over on every transition
#[derive(Debug)]
pub struct NodeState {
    pub persistent: PersistentState,
    pub volatile: VolatileState,
}

impl NodeState {
    pub fn current_term(&self) -> TermId {
        self.persistent.acquire().current_term()
    }

    /// Move to a newer term, persisting only if it really is newer
    fn observe_term(&mut self, term: TermId) {
        if self.current_term() < term {
            self.persistent.acquire_mut().advance_term(term);
        }
    }
}

pub struct Follower {
    pub timer: Timer,
    pub state: NodeState,
}

impl Follower {
    pub fn new(timer: Timer, state: NodeState) -> Self {
        Self { timer, state }
    }

    /// Any role discovering `term` becomes its follower
    ///
    /// The vote is forgotten only if `term` is newer than the current one.
    pub fn step_down(role: Role, term: TermId) -> Self {
        let (timer, mut state) = role.into_parts();
        state.observe_term(term);
        Self {
            timer: timer.rebind(),
            state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePhase {
    /// Waiting the randomized delay before asking for votes
    WaitingToStart,
    /// Votes requested, waiting for the election timeout
    Electing,
}

pub struct Candidate {
    pub timer: Timer,
    pub state: NodeState,
    pub phase: CandidatePhase,
    /// Peers that granted us their vote in the current term
    pub votes: BTreeSet<SocketAddr>,
}

impl Candidate {
    /// Election timeout elapsed: bump the term and vote for ourselves
    pub fn from_follower(follower: Follower, me: NodeId) -> Self {
        let mut candidate = Self {
            timer: follower.timer.rebind(),
            state: follower.state,
            phase: CandidatePhase::WaitingToStart,
            votes: BTreeSet::new(),
        };
        candidate.next_term(me);
        candidate
    }

    /// Randomized delay elapsed: start a new round in a new term
    ///
    /// Returns the request to send to every peer.
    pub fn start_election(&mut self, me: NodeId) -> RequestVote {
        self.next_term(me);
        self.phase = CandidatePhase::Electing;

        let view = self.state.persistent.acquire();
        RequestVote {
            term: view.current_term(),
            candidate_id: me,
            last_log_index: view.last_log_index(),
            last_log_term: view.last_log_term(),
        }
    }

    /// Lost (or timed out) the round; wait again, staying in the same term
    pub fn retry(&mut self) {
        self.phase = CandidatePhase::WaitingToStart;
    }

    /// Do we (counting our own vote) have a majority of `neighbours + 1` nodes
    pub fn has_quorum(&self, neighbours: usize) -> bool {
        (self.votes.len() + 1) * 2 > neighbours + 1
    }

    fn next_term(&mut self, me: NodeId) {
        self.votes.clear();
        let mut guard = self.state.persistent.acquire_mut();
        let next = guard.current_term().next();
        *guard.current_term() = next;
        *guard.voted_for() = Some(me);
    }
}

pub struct Leader {
    pub timer: Timer,
    pub state: NodeState,
    /// Per neighbour: index of the next entry to send
    pub next_index: Vec<u64>,
    /// Per neighbour: highest index known to be replicated
    pub match_index: Vec<u64>,
}

impl Leader {
    pub fn from_candidate(candidate: Candidate, neighbours: usize) -> Self {
        let next = u64::from(candidate.state.persistent.acquire().last_log_index().0) + 1;
        Self {
            timer: candidate.timer.rebind(),
            state: candidate.state,
            next_index: vec![next; neighbours],
            match_index: vec![0; neighbours],
        }
    }
}

/// Current role of the node; exactly one at a time
pub enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Follower(_) => RoleKind::Follower,
            Role::Candidate(_) => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
        }
    }

    pub fn timer(&self) -> &Timer {
        match self {
            Role::Follower(r) => &r.timer,
            Role::Candidate(r) => &r.timer,
            Role::Leader(r) => &r.timer,
        }
    }

    pub fn state(&self) -> &NodeState {
        match self {
            Role::Follower(r) => &r.state,
            Role::Candidate(r) => &r.state,
            Role::Leader(r) => &r.state,
        }
    }

    pub fn state_mut(&mut self) -> &mut NodeState {
        match self {
            Role::Follower(r) => &mut r.state,
            Role::Candidate(r) => &mut r.state,
            Role::Leader(r) => &mut r.state,
        }
    }

    pub fn current_term(&self) -> TermId {
        self.state().current_term()
    }

    fn into_parts(self) -> (Timer, NodeState) {
        match self {
            Role::Follower(r) => (r.timer, r.state),
            Role::Candidate(r) => (r.timer, r.state),
            Role::Leader(r) => (r.timer, r.state),
        }
    }
}
