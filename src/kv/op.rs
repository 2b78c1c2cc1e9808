//! Client operations carried through the replicated log

use serde::{Deserialize, Serialize};

/// Client-chosen identifier giving a request at-most-once semantics.
/// Retries of the same logical request must reuse the id; every new
/// request must pick a fresh one. Opaque to Raft.
pub type RequestId = u64;

/// Kind of a key/value operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Get,
    Put,
    Append,
}

/// One key/value operation as stored in the Raft log
///
/// Raft carries only the serialized bytes; the key/value layer encodes
/// before `start` and decodes on the apply stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub kind: OpKind,
    pub key: String,
    /// Unused for Get
    #[serde(default)]
    pub value: String,
    pub request_id: RequestId,
}

impl Op {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("op serialization cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
