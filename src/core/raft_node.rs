//! RaftNode - async fan-out for a Raft peer
//!
//! Owns the vote and replication broadcasts. The core mutex is released
//! across every network send; replies re-acquire it and are validated
//! against the current role and term before they take effect.

use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;

use super::raft_core::{RaftCore, SharedCore};
use crate::transport::Transport;

/// High-level Raft node that drives consensus over a transport
pub struct RaftNode<T: Transport> {
    core: SharedCore,
    transport: Arc<T>,
}

impl<T: Transport> Clone for RaftNode<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            transport: self.transport.clone(),
        }
    }
}

impl<T: Transport> RaftNode<T> {
    /// Create a new RaftNode
    pub fn new(core: RaftCore, transport: T) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            transport: Arc::new(transport),
        }
    }

    /// Get a shared reference to the core (for incoming RPC handling)
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    /// Run one election round: become candidate and solicit votes from
    /// every peer concurrently. Returns true if a majority was reached
    /// and this node is now leader; the caller must broadcast
    /// AppendEntries immediately afterwards.
    pub async fn run_election(&self) -> bool {
        let (args, peers) = {
            let mut core = self.core.lock().await;
            core.become_candidate();
            // A cluster of one wins its own election outright
            if core.peers.is_empty() {
                core.become_leader();
                return true;
            }
            (core.vote_request(), core.peers.clone())
        };
        let candidacy_term = args.term;

        // Send all vote requests concurrently, process replies as they arrive
        let mut replies: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer| {
                let args = args.clone();
                let transport = &self.transport;
                async move { (peer, transport.request_vote(peer, args).await) }
            })
            .collect();

        while let Some((peer, reply)) = replies.next().await {
            // An undelivered request simply counts as no vote
            if let Ok(reply) = reply {
                let mut core = self.core.lock().await;
                if core.record_vote(peer, candidacy_term, &reply) {
                    return true; // became leader, don't wait for the rest
                }
                if core.current_term != candidacy_term {
                    return false; // candidacy superseded
                }
            }
        }

        false
    }

    /// Broadcast AppendEntries to every peer, carrying whatever suffix of
    /// the log each one is missing (possibly nothing - a plain heartbeat),
    /// and process the replies. Returns whether this node is still leader.
    pub async fn broadcast_append(&self) -> bool {
        let requests = {
            let core = self.core.lock().await;
            if !core.is_leader() {
                return false;
            }
            core.peers
                .iter()
                .filter_map(|&peer| core.append_args(peer).map(|args| (peer, args)))
                .collect::<Vec<_>>()
        };

        // Send to all peers concurrently (lock released)
        let mut replies: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer, args)| {
                let transport = &self.transport;
                async move {
                    let sent_term = args.term;
                    let prev_log_index = args.prev_log_index;
                    let sent_len = args.entries.len() as u64;
                    let reply = transport.append_entries(peer, args).await;
                    (peer, sent_term, prev_log_index, sent_len, reply)
                }
            })
            .collect();

        // Process every reply so commit can advance and higher terms are
        // noticed; delivery failures are retried on the next broadcast
        while let Some((peer, sent_term, prev_log_index, sent_len, reply)) = replies.next().await {
            if let Ok(reply) = reply {
                let mut core = self.core.lock().await;
                core.handle_append_reply(peer, sent_term, prev_log_index, sent_len, &reply);
            }
        }

        self.core.lock().await.is_leader()
    }
}
