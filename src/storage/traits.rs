//! Persistence abstraction for Raft state and key/value snapshots
//!
//! Raft must persist (current_term, voted_for, log) to stable storage
//! before responding to RPCs, and the key/value layer persists its
//! (data, applied) snapshot on every applied entry. Both are opaque
//! byte blobs from the persister's point of view, stored in two
//! independent slots so the writers never contend on content.

use thiserror::Error;

/// Errors that can occur during persistence operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    /// I/O error (e.g., disk full, permission denied)
    #[error("I/O error: {0}")]
    Io(String),
    /// Stored data failed its checksum or could not be parsed
    #[error("data corruption: {0}")]
    Corruption(String),
}

/// Durable blob storage shared by a Raft instance and its state machine.
///
/// Implementations must ensure durability - a successful save must
/// survive a crash. Methods take `&self` so a single handle can be
/// owned jointly by the Raft core and the key/value applier.
pub trait Persister: Send + Sync {
    /// Save the serialized Raft state (current_term, voted_for, log)
    /// Must be durable before returning
    fn save_raft_state(&self, data: &[u8]) -> Result<(), PersistError>;

    /// Read the serialized Raft state
    /// Returns None if nothing has been persisted (fresh start)
    fn read_raft_state(&self) -> Result<Option<Vec<u8>>, PersistError>;

    /// Save the serialized state machine snapshot
    /// Must be durable before returning
    fn save_snapshot(&self, data: &[u8]) -> Result<(), PersistError>;

    /// Read the serialized state machine snapshot
    /// Returns None if no snapshot has been saved
    fn read_snapshot(&self) -> Result<Option<Vec<u8>>, PersistError>;
}
