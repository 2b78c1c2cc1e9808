//! RaftServer - background driver for a Raft peer
//!
//! One task per node runs the election timer and the heartbeat loop; a
//! `Notify` wake lets client submissions trigger replication without
//! waiting for the next heartbeat tick.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::debug;

use super::config::RaftConfig;
use super::raft_core::{NodeId, RaftCore, SharedCore};
use super::raft_node::RaftNode;
use crate::transport::Transport;

/// Cheap cloneable handle exposing Raft's public operations to the
/// layer above (the key/value service)
#[derive(Clone)]
pub struct Raft {
    core: SharedCore,
    submit_wake: Arc<Notify>,
}

impl Raft {
    /// Append a command to the replicated log if this peer is the leader.
    /// Returns the new entry's (index, term) immediately, without waiting
    /// for commitment; None when this peer is not the leader.
    pub async fn start(&self, command: Vec<u8>) -> Option<(u64, u64)> {
        let started = self.core.lock().await.start(command);
        if started.is_some() {
            // Wake the replicator instead of waiting for the next tick
            self.submit_wake.notify_one();
        }
        started
    }

    /// Current term and whether this peer believes it is the leader
    pub async fn get_state(&self) -> (u64, bool) {
        self.core.lock().await.get_state()
    }

    /// Last known leader, for client redirection
    pub async fn leader_hint(&self) -> Option<NodeId> {
        self.core.lock().await.current_leader
    }

    /// Shared core, for RPC routers and status reporting
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }
}

/// Handle for stopping a running RaftServer
#[derive(Clone)]
pub struct RaftShutdown {
    shutdown_tx: mpsc::Sender<()>,
}

impl RaftShutdown {
    /// Stop the driver loop gracefully
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Raft server that drives timers and replication for one peer
pub struct RaftServer<T: Transport> {
    node: RaftNode<T>,
    config: RaftConfig,
    submit_wake: Arc<Notify>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// Create a new RaftServer with default config
    /// Returns the server and the public operations handle
    pub fn new(core: RaftCore, transport: T) -> (Self, Raft) {
        Self::with_config(core, transport, RaftConfig::default())
    }

    /// Create a new RaftServer with custom config
    pub fn with_config(core: RaftCore, transport: T, config: RaftConfig) -> (Self, Raft) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let node = RaftNode::new(core, transport);
        let submit_wake = Arc::new(Notify::new());
        let raft = Raft {
            core: node.shared_core(),
            submit_wake: submit_wake.clone(),
        };
        let server = Self {
            node,
            config,
            submit_wake,
            shutdown_rx,
            shutdown_tx,
        };
        (server, raft)
    }

    /// Start the driver loop in the background
    pub fn start(self) -> RaftShutdown {
        let handle = RaftShutdown {
            shutdown_tx: self.shutdown_tx.clone(),
        };
        tokio::spawn(self.run());
        handle
    }

    /// Main driver loop
    async fn run(mut self) {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        // Delay behavior keeps missed ticks from starving the election branch
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Redrawn after every election-deadline firing
        let mut election_timeout = self.config.random_election_timeout();

        loop {
            let deadline = {
                let core = self.node.shared_core();
                let last_heartbeat = core.lock().await.last_heartbeat;
                last_heartbeat + election_timeout
            };
            let election_sleep = sleep_until(deadline);

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    debug!("raft server shutting down");
                    break;
                }
                // A client submission: replicate right away
                _ = self.submit_wake.notified() => {
                    let node = self.node.clone();
                    tokio::spawn(async move { node.broadcast_append().await; });
                }
                // Heartbeat cadence for leaders
                _ = heartbeat.tick() => {
                    let should_send = {
                        let core = self.node.shared_core();
                        let mut core = core.lock().await;
                        if core.is_leader() {
                            // Leaders never time themselves out
                            core.last_heartbeat = Instant::now();
                            true
                        } else {
                            false
                        }
                    };
                    if should_send {
                        let node = self.node.clone();
                        tokio::spawn(async move { node.broadcast_append().await; });
                    }
                }
                // Election timeout: no valid leader traffic for too long
                _ = election_sleep => {
                    let timed_out = {
                        let core = self.node.shared_core();
                        let core = core.lock().await;
                        // The deadline may be stale: a heartbeat can land
                        // between computing it and the timer firing
                        !core.is_leader() && Instant::now() >= core.last_heartbeat + election_timeout
                    };
                    if timed_out {
                        // Bound the round by a fresh timeout so a dead
                        // cluster retries with a new term instead of
                        // waiting on unreachable peers
                        let round = self.config.random_election_timeout();
                        match timeout(round, self.node.run_election()).await {
                            Ok(true) => {
                                // Establish leadership before peers time out
                                let node = self.node.clone();
                                tokio::spawn(async move { node.broadcast_append().await; });
                            }
                            Ok(false) => {}
                            Err(_) => {
                                debug!("election round timed out without a winner");
                            }
                        }
                    }
                    election_timeout = self.config.random_election_timeout();
                }
            }
        }
    }
}
