//! Replicated key/value server
//!
//! One applier task drains the Raft apply stream and mutates the store;
//! the Get / PutAppend handlers route operations through the log and wait
//! for their RequestId to be applied. RequestIds are the sole dedup key:
//! an id that is already in `applied` is never executed a second time, no
//! matter how often the log redelivers it after leader churn.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::raft_core::ApplyMsg;
use crate::core::raft_server::Raft;
use crate::storage::Persister;

use super::op::{Op, OpKind, RequestId};

/// How long a waiting handler goes between leadership re-checks
pub const DEFAULT_WAITER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Closed set of client-visible reply statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ErrNoKey")]
    NoKey,
    #[serde(rename = "ErrLoseLeader")]
    LoseLeader,
    #[serde(rename = "error")]
    Error,
}

/// Reply to a Get request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReply {
    pub wrong_leader: bool,
    pub err: Status,
    pub value: String,
}

/// Reply to a Put or Append request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutAppendReply {
    pub wrong_leader: bool,
    pub err: Status,
}

/// Store contents plus the volatile per-request waiters
struct KvState {
    data: HashMap<String, String>,
    /// RequestIds that have been executed; never shrinks
    applied: HashSet<RequestId>,
    /// One-shot completion signals for requests in flight on this node
    pending: HashMap<RequestId, oneshot::Sender<()>>,
}

/// Replicated key/value server bound to one Raft peer
pub struct KvServer {
    raft: Raft,
    state: Arc<Mutex<KvState>>,
    poll_interval: Duration,
    applier: JoinHandle<()>,
}

impl KvServer {
    /// Create a server, restoring `(data, applied)` from the last
    /// snapshot and spawning the applier over the given apply stream
    pub fn new(
        raft: Raft,
        persister: Arc<dyn Persister>,
        apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
    ) -> Self {
        let restored = persister
            .read_snapshot()
            .expect("failed to read kv snapshot");
        let (data, applied) = match restored {
            Some(bytes) => serde_json::from_slice(&bytes).expect("corrupt kv snapshot"),
            None => (HashMap::new(), HashSet::new()),
        };

        let state = Arc::new(Mutex::new(KvState {
            data,
            applied,
            pending: HashMap::new(),
        }));
        let applier = tokio::spawn(Self::run_applier(state.clone(), persister, apply_rx));

        KvServer {
            raft,
            state,
            poll_interval: DEFAULT_WAITER_POLL_INTERVAL,
            applier,
        }
    }

    /// Override the leadership re-check interval (tests)
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The underlying Raft handle
    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    /// Snapshot of the store contents (tests and status reporting)
    pub async fn data(&self) -> HashMap<String, String> {
        self.state.lock().await.data.clone()
    }

    /// Number of distinct RequestIds executed so far
    pub async fn applied_count(&self) -> usize {
        self.state.lock().await.applied.len()
    }

    /// Single consumer of the apply stream: executes each committed
    /// operation exactly once and signals any waiter for its RequestId
    async fn run_applier(
        state: Arc<Mutex<KvState>>,
        persister: Arc<dyn Persister>,
        mut apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
    ) {
        while let Some(msg) = apply_rx.recv().await {
            let op = match Op::decode(&msg.command) {
                Ok(op) => op,
                Err(err) => {
                    warn!(index = msg.index, %err, "skipping undecodable log entry");
                    continue;
                }
            };

            let mut state = state.lock().await;
            if state.applied.insert(op.request_id) {
                match op.kind {
                    OpKind::Put => {
                        state.data.insert(op.key.clone(), op.value.clone());
                    }
                    OpKind::Append => {
                        state.data.entry(op.key.clone()).or_default().push_str(&op.value);
                    }
                    OpKind::Get => {}
                }
                debug!(index = msg.index, request = op.request_id, "applied operation");

                let blob = serde_json::to_vec(&(&state.data, &state.applied))
                    .expect("failed to encode kv snapshot");
                persister
                    .save_snapshot(&blob)
                    .expect("failed to persist kv snapshot");
            }

            // Signal even on a duplicate delivery: the waiter may have
            // registered after an earlier copy of this request applied
            if let Some(done) = state.pending.remove(&op.request_id) {
                let _ = done.send(());
            }
        }
    }

    /// Linearizable read. The Get travels through the log like a write so
    /// its result reflects every operation committed before it.
    pub async fn get(&self, key: &str, request_id: RequestId) -> GetReply {
        // Fast path: a retry of a request that already executed
        {
            let state = self.state.lock().await;
            if state.applied.contains(&request_id) {
                return Self::read_reply(&state, key);
            }
        }

        let op = Op {
            kind: OpKind::Get,
            key: key.to_string(),
            value: String::new(),
            request_id,
        };
        let Some((_index, term)) = self.raft.start(op.encode()).await else {
            return GetReply {
                wrong_leader: true,
                err: Status::Error,
                value: String::new(),
            };
        };

        match self.await_applied(request_id, term).await {
            Status::Ok => {
                let state = self.state.lock().await;
                Self::read_reply(&state, key)
            }
            err => GetReply {
                wrong_leader: false,
                err,
                value: String::new(),
            },
        }
    }

    /// Put or Append. `kind` must not be `Get`.
    pub async fn put_append(
        &self,
        kind: OpKind,
        key: &str,
        value: &str,
        request_id: RequestId,
    ) -> PutAppendReply {
        debug_assert!(kind != OpKind::Get, "put_append takes Put or Append");

        // Fast path: a retry of a request that already executed
        {
            let state = self.state.lock().await;
            if state.applied.contains(&request_id) {
                return PutAppendReply {
                    wrong_leader: false,
                    err: Status::Ok,
                };
            }
        }

        let op = Op {
            kind,
            key: key.to_string(),
            value: value.to_string(),
            request_id,
        };
        let Some((_index, term)) = self.raft.start(op.encode()).await else {
            return PutAppendReply {
                wrong_leader: true,
                err: Status::Error,
            };
        };

        let err = self.await_applied(request_id, term).await;
        PutAppendReply {
            wrong_leader: false,
            err,
        }
    }

    /// Wait until the request's entry applies, re-checking once per poll
    /// interval that this node still leads the term it started the entry
    /// in. The KV mutex is never held across a wait.
    async fn await_applied(&self, request_id: RequestId, term: u64) -> Status {
        let mut done = {
            let mut state = self.state.lock().await;
            // The entry may have applied between `start` returning and
            // this registration; check under the same lock that installs
            // the waiter
            if state.applied.contains(&request_id) {
                return Status::Ok;
            }
            let (tx, rx) = oneshot::channel();
            state.pending.insert(request_id, tx);
            rx
        };

        loop {
            match tokio::time::timeout(self.poll_interval, &mut done).await {
                Ok(Ok(())) => return Status::Ok,
                // Our waiter slot was displaced by a newer handler for the
                // same RequestId; fall back to the applied set
                Ok(Err(_)) => {
                    let state = self.state.lock().await;
                    return if state.applied.contains(&request_id) {
                        Status::Ok
                    } else {
                        Status::Error
                    };
                }
                Err(_) => {
                    // A timed-out wait does not cancel the log entry; it
                    // may still commit later and is deduped by `applied`
                    let (current_term, is_leader) = self.raft.get_state().await;
                    if !is_leader || current_term != term {
                        let mut state = self.state.lock().await;
                        state.pending.remove(&request_id);
                        return Status::LoseLeader;
                    }
                }
            }
        }
    }

    fn read_reply(state: &KvState, key: &str) -> GetReply {
        match state.data.get(key) {
            Some(value) => GetReply {
                wrong_leader: false,
                err: Status::Ok,
                value: value.clone(),
            },
            None => GetReply {
                wrong_leader: false,
                err: Status::NoKey,
                value: String::new(),
            },
        }
    }
}

impl Drop for KvServer {
    fn drop(&mut self) {
        self.applier.abort();
    }
}
