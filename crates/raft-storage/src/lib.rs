//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: raft-runtime saves through it before any reply leaves the node and loads from it on restart
//! what: Storage trait, FileStorage implementation, InMemoryStorage for testing

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use raft_core::{PersistentState, RaftError};
use thiserror::Error;

/// Failures surfaced by a storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("persisted state is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl From<StorageError> for RaftError {
    fn from(err: StorageError) -> Self {
        RaftError::Persistence(err.to_string())
    }
}

/// trait for durable storage of raft state
///
/// term, vote, log and commit progress are saved together as one record;
/// a successful `save` means the whole record survives a crash.
pub trait Storage: Send {
    /// atomically replace the persisted record
    fn save(&mut self, state: &PersistentState) -> Result<(), StorageError>;

    /// load the persisted record, `None` for a node that never saved
    fn load(&self) -> Result<Option<PersistentState>, StorageError>;

    /// clear all persisted state (for testing)
    fn clear(&mut self) -> Result<(), StorageError>;
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn save(&mut self, state: &PersistentState) -> Result<(), StorageError> {
        (**self).save(state)
    }

    fn load(&self) -> Result<Option<PersistentState>, StorageError> {
        (**self).load()
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        (**self).clear()
    }
}

// -- file storage implementation --

const STATE_FILE: &str = "state.json";
const TEMP_FILE: &str = "state.tmp";

/// file-based storage implementation using std::fs
///
/// keeps the record in `state.json` inside its directory. Writes go to a
/// temp file which is fsynced and then renamed over the old record, so a
/// crash leaves either the previous or the new state, never a mix.
#[derive(Debug, Clone)]
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// path of the live record
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join(TEMP_FILE)
    }
}

impl Storage for FileStorage {
    fn save(&mut self, state: &PersistentState) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(state)?;

        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;

        Ok(())
    }

    fn load(&self) -> Result<Option<PersistentState>, StorageError> {
        let bytes = match fs::read(self.state_path()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        for path in [self.state_path(), self.temp_path()] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across restarts
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    state: Option<PersistentState>,
    saves: usize,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// number of successful saves so far
    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl Storage for InMemoryStorage {
    fn save(&mut self, state: &PersistentState) -> Result<(), StorageError> {
        self.state = Some(state.clone());
        self.saves += 1;
        Ok(())
    }

    fn load(&self) -> Result<Option<PersistentState>, StorageError> {
        Ok(self.state.clone())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.state = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft_core::LogEntry;
    use tempfile::tempdir;

    fn sample() -> PersistentState {
        PersistentState {
            current_term: 5,
            voted_for: Some(2),
            log: vec![
                LogEntry::new(1, 1, vec![1, 2, 3]),
                LogEntry::new(5, 2, vec![4, 5, 6]),
            ],
            commit_index: 1,
            last_applied: 1,
        }
    }

    #[test]
    fn in_memory_storage_round_trips_state() {
        let mut storage = InMemoryStorage::new();
        assert!(storage.load().unwrap().is_none());

        storage.save(&sample()).unwrap();

        assert_eq!(storage.load().unwrap(), Some(sample()));
        assert_eq!(storage.save_count(), 1);
    }

    #[test]
    fn file_storage_survives_restart() {
        let dir = tempdir().unwrap();

        // first "session"
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save(&sample()).unwrap();
        }

        // "restart" - new storage instance
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            assert_eq!(storage.load().unwrap(), Some(sample()));
        }
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        fs::write(storage.state_path(), b"{ not json").unwrap();

        assert!(matches!(storage.load(), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn storage_error_maps_to_persistence_failure() {
        let err = StorageError::Io(io::Error::new(io::ErrorKind::Other, "disk full"));
        let raft: RaftError = err.into();
        assert!(matches!(raft, RaftError::Persistence(msg) if msg.contains("disk full")));
    }
}
