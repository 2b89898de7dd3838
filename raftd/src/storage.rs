//! Durable storage of the persistent raft state
//!
//! The node calls [`Storage::persist`] every time a
//! [`crate::raft::PersistentGuard`] is released, and [`Storage::load`]
//! once, when it starts.
use binrw::{binrw, BinRead, BinWrite};
use raftd_api::{parse_vec, write_vec, LogEntry, NodeId, TermId};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::sync::Synchronized;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid state file: {0}")]
    Decode(#[from] binrw::Error),
    #[error("fsync failed: {0}")]
    Fsync(#[from] nix::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Everything that must survive a restart
///
/// The trailing zero of the magic is the format version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[binrw]
#[brw(big, magic(b"RFTS\x00"))]
pub struct PersistedState {
    pub current_term: TermId,
    #[br(map = |v: OptionalNodeId| v.into())]
    #[bw(map = |v: &Option<NodeId>| OptionalNodeId::from(*v))]
    pub voted_for: Option<NodeId>,
    #[br(parse_with = parse_vec)]
    #[bw(write_with = write_vec)]
    pub log: Vec<LogEntry>,
}

impl PersistedState {
    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        let mut buf = vec![];
        self.write(&mut Cursor::new(&mut buf))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        Ok(Self::read(&mut Cursor::new(bytes))?)
    }
}

#[derive(Debug, Clone, Copy)]
#[binrw]
#[brw(big)]
enum OptionalNodeId {
    #[brw(magic(0u8))]
    None,
    #[brw(magic(1u8))]
    Some(NodeId),
}

impl From<OptionalNodeId> for Option<NodeId> {
    fn from(v: OptionalNodeId) -> Self {
        match v {
            OptionalNodeId::None => None,
            OptionalNodeId::Some(id) => Some(id),
        }
    }
}

impl From<Option<NodeId>> for OptionalNodeId {
    fn from(v: Option<NodeId>) -> Self {
        match v {
            None => OptionalNodeId::None,
            Some(id) => OptionalNodeId::Some(id),
        }
    }
}

/// Storage hook for the persistent raft state
pub trait Storage: Send + Sync + fmt::Debug {
    /// Durably store `state`; must be idempotent
    fn persist(&self, state: &PersistedState) -> StorageResult<()>;

    /// Last persisted state, `None` if nothing was ever persisted
    fn load(&self) -> StorageResult<Option<PersistedState>>;
}

/// Keeps the state in memory only
///
/// Nothing survives a restart, but it records every flush, which
/// is handy for checking when the state got persisted.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Synchronized<MemoryStorageInner>,
}

#[derive(Debug, Default)]
struct MemoryStorageInner {
    last: Option<PersistedState>,
    flushes: u64,
}

impl MemoryStorage {
    pub fn last(&self) -> Option<PersistedState> {
        self.inner.apply(|inner| inner.last.clone())
    }

    /// How many times the state was persisted
    pub fn flushes(&self) -> u64 {
        self.inner.apply(|inner| inner.flushes)
    }
}

impl Storage for MemoryStorage {
    fn persist(&self, state: &PersistedState) -> StorageResult<()> {
        self.inner.apply(|inner| {
            inner.last = Some(state.clone());
            inner.flushes += 1;
        });
        Ok(())
    }

    fn load(&self) -> StorageResult<Option<PersistedState>> {
        Ok(self.last())
    }
}

/// Stores the state in a single file inside `data_dir`
///
/// Every write goes to a temporary file, which is fsynced and then
/// renamed over the previous one, so a crash leaves either the old
/// or the new state behind, never a torn one.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    tmp_path: PathBuf,
    dir: PathBuf,
}

impl FileStorage {
    pub const FILE_NAME: &'static str = "raft-state";
    pub const TMP_SUFFIX: &'static str = ".tmp";

    pub fn new(data_dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(data_dir)?;
        info!(data_dir = %data_dir.display(), "Using file storage");
        Ok(Self {
            path: data_dir.join(Self::FILE_NAME),
            tmp_path: data_dir.join(format!("{}{}", Self::FILE_NAME, Self::TMP_SUFFIX)),
            dir: data_dir.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for FileStorage {
    fn persist(&self, state: &PersistedState) -> StorageResult<()> {
        let bytes = state.to_bytes()?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.tmp_path)?;
        file.write_all(&bytes)?;
        nix::unistd::fsync(file.as_raw_fd())?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;

        // make the rename itself durable
        let dir = File::open(&self.dir)?;
        nix::unistd::fsync(dir.as_raw_fd())?;

        debug!(path = %self.path.display(), term = %state.current_term, "State persisted");
        Ok(())
    }

    fn load(&self) -> StorageResult<Option<PersistedState>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(PersistedState::from_bytes(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistedState {
        PersistedState {
            current_term: TermId(7),
            voted_for: Some("67e55044-10b1-426f-9247-bb680e5fe0c8".parse().unwrap()),
            log: vec![LogEntry {
                term: TermId(7),
                payload: vec![1, 2, 3],
            }],
        }
    }

    #[test]
    fn file_storage_survives_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        let storage = FileStorage::new(dir.path())?;
        assert_eq!(storage.load()?, None);

        storage.persist(&PersistedState::default())?;
        storage.persist(&sample())?;
        drop(storage);

        let storage = FileStorage::new(dir.path())?;
        assert_eq!(storage.load()?, Some(sample()));
        assert!(!dir.path().join("raft-state.tmp").exists());
        Ok(())
    }

    #[test]
    fn corrupted_file_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = FileStorage::new(dir.path())?;
        fs::write(storage.path(), b"garbage")?;

        assert!(matches!(storage.load(), Err(StorageError::Decode(_))));
        Ok(())
    }

    #[test]
    fn encoding_starts_with_magic_and_version() {
        let bytes = PersistedState::default().to_bytes().unwrap();
        assert_eq!(&bytes, b"RFTS\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00");
    }

    #[test]
    fn memory_storage_counts_flushes() {
        let storage = MemoryStorage::default();
        assert_eq!(storage.load().unwrap(), None);
        storage.persist(&sample()).unwrap();
        storage.persist(&sample()).unwrap();
        assert_eq!(storage.flushes(), 2);
        assert_eq!(storage.last(), Some(sample()));
    }
}
