#![deny(clippy::as_conversions)]

mod config;
mod node;
mod raft;
mod storage;
mod sync;
mod task;
mod timer;

pub use config::*;
pub use node::*;
pub use raft::{PersistentGuard, PersistentState, PersistentView, VolatileState};
pub use storage::*;
pub use sync::{apply_many2, apply_many3, Synchronized};
pub use timer::{random_between, Expiry, Timer, TimerOutcome};
