//! In-memory persister implementation for testing
//!
//! Fast, no side effects, no persistence across process restarts.
//! Tests simulate a node restart by handing the same `MemoryPersister`
//! to a freshly constructed node.

use std::sync::Mutex;

use super::{PersistError, Persister};

/// In-memory persister with one slot per blob
#[derive(Debug, Default)]
pub struct MemoryPersister {
    raft_state: Mutex<Option<Vec<u8>>>,
    snapshot: Mutex<Option<Vec<u8>>>,
}

impl MemoryPersister {
    /// Create a new empty in-memory persister
    pub fn new() -> Self {
        MemoryPersister {
            raft_state: Mutex::new(None),
            snapshot: Mutex::new(None),
        }
    }
}

impl Persister for MemoryPersister {
    fn save_raft_state(&self, data: &[u8]) -> Result<(), PersistError> {
        *self.raft_state.lock().unwrap() = Some(data.to_vec());
        Ok(())
    }

    fn read_raft_state(&self) -> Result<Option<Vec<u8>>, PersistError> {
        Ok(self.raft_state.lock().unwrap().clone())
    }

    fn save_snapshot(&self, data: &[u8]) -> Result<(), PersistError> {
        *self.snapshot.lock().unwrap() = Some(data.to_vec());
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Option<Vec<u8>>, PersistError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_persister_is_empty() {
        let persister = MemoryPersister::new();
        assert_eq!(persister.read_raft_state().unwrap(), None);
        assert_eq!(persister.read_snapshot().unwrap(), None);
    }

    #[test]
    fn test_raft_state_round_trip() {
        let persister = MemoryPersister::new();

        persister.save_raft_state(b"state v1").unwrap();
        assert_eq!(persister.read_raft_state().unwrap(), Some(b"state v1".to_vec()));

        // Overwrite
        persister.save_raft_state(b"state v2").unwrap();
        assert_eq!(persister.read_raft_state().unwrap(), Some(b"state v2".to_vec()));
    }

    #[test]
    fn test_slots_are_independent() {
        let persister = MemoryPersister::new();

        persister.save_raft_state(b"raft").unwrap();
        persister.save_snapshot(b"snap").unwrap();

        assert_eq!(persister.read_raft_state().unwrap(), Some(b"raft".to_vec()));
        assert_eq!(persister.read_snapshot().unwrap(), Some(b"snap".to_vec()));
    }
}
