use convi::ExpectFrom;
use raftd_api::{LogEntry, LogIndex, NodeId, TermId};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::storage::{PersistedState, Storage};
use crate::task::blocking;

/// State that has to be on stable storage before the node acts on it
///
/// Fields are only reachable through [`PersistentState::acquire`]
/// and [`PersistentState::acquire_mut`].
#[derive(Debug)]
pub struct PersistentState {
    /// Current term we're aware of
    current_term: TermId,
    /// The node we voted for in the `current_term`
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    storage: Arc<dyn Storage>,
}

impl PersistentState {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::restore(storage, PersistedState::default())
    }

    pub fn restore(storage: Arc<dyn Storage>, persisted: PersistedState) -> Self {
        Self {
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            log: persisted.log,
            storage,
        }
    }

    /// Exclusive, mutable view; the state is persisted when it's released
    pub fn acquire_mut(&mut self) -> PersistentGuard<'_> {
        PersistentGuard { state: self }
    }

    /// Read-only view
    pub fn acquire(&self) -> PersistentView<'_> {
        PersistentView { state: self }
    }

    fn snapshot(&self) -> PersistedState {
        PersistedState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
        }
    }

    fn flush(&self) {
        let snapshot = self.snapshot();
        debug!(
            term = %snapshot.current_term,
            voted_for = ?snapshot.voted_for,
            log_len = snapshot.log.len(),
            "persistent"
        );
        // storage may fsync; nothing may act on the state before it returns
        if let Err(e) = blocking(|| self.storage.persist(&snapshot)) {
            warn!(error = %e, "Could not persist the raft state");
        }
    }
}

#[derive(Clone, Copy)]
pub struct PersistentView<'a> {
    state: &'a PersistentState,
}

impl<'a> PersistentView<'a> {
    pub fn current_term(&self) -> TermId {
        self.state.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.state.voted_for
    }

    pub fn log(&self) -> &'a [LogEntry] {
        &self.state.log
    }

    /// Index of the last log entry (1-based, `0` when empty)
    pub fn last_log_index(&self) -> LogIndex {
        LogIndex(u32::expect_from(self.state.log.len()))
    }

    pub fn last_log_term(&self) -> TermId {
        self.state.log.last().map(|e| e.term).unwrap_or_default()
    }

    /// Is a log ending at (`last_log_term`, `last_log_index`) at least as up to date as ours
    pub fn is_log_up_to_date(&self, last_log_term: TermId, last_log_index: LogIndex) -> bool {
        (last_log_term, last_log_index) >= (self.last_log_term(), self.last_log_index())
    }
}

/// Scoped mutable access to [`PersistentState`]
///
/// Dropping the guard (on any exit path) persists the state through
/// the storage hook. Don't hold it longer than the mutation.
pub struct PersistentGuard<'a> {
    state: &'a mut PersistentState,
}

impl<'a> PersistentGuard<'a> {
    pub fn current_term(&mut self) -> &mut TermId {
        &mut self.state.current_term
    }

    pub fn voted_for(&mut self) -> &mut Option<NodeId> {
        &mut self.state.voted_for
    }

    pub fn log(&mut self) -> &mut Vec<LogEntry> {
        &mut self.state.log
    }

    pub fn view(&self) -> PersistentView<'_> {
        self.state.acquire()
    }

    /// Move to a newer `term`, forgetting the vote of the old one
    ///
    /// Does nothing if `term` is not newer than the current one.
    pub fn advance_term(&mut self, term: TermId) -> bool {
        if term <= self.state.current_term {
            return false;
        }
        self.state.current_term = term;
        self.state.voted_for = None;
        true
    }
}

impl<'a> Drop for PersistentGuard<'a> {
    fn drop(&mut self) {
        self.state.flush();
    }
}

/// State lost on restart
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VolatileState {
    commit_index: u64,
    last_applied: u64,
}

impl VolatileState {
    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Commit index never goes backwards
    pub fn advance_commit_index(&mut self, index: u64) {
        self.commit_index = self.commit_index.max(index);
    }

    /// Record that entries up to `index` were applied; capped at `commit_index`
    pub fn advance_last_applied(&mut self, index: u64) {
        self.last_applied = self.last_applied.max(index.min(self.commit_index));
    }
}
