//! Testing utilities for cluster integration tests
//!
//! Provides `TestCluster` for spinning up in-process clusters over the
//! in-memory network, with crash / restart / partition controls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::core::config::RaftConfig;
use crate::core::raft_core::{NodeId, RaftCore, SharedCore};
use crate::core::raft_server::{Raft, RaftServer, RaftShutdown};
use crate::kv::op::{OpKind, RequestId};
use crate::kv::server::{KvServer, Status};
use crate::storage::memory::MemoryPersister;
use crate::transport::inmemory::InMemoryNetwork;

/// Poll interval used by handlers inside test clusters, shortened so
/// leadership-loss paths resolve quickly
const TEST_WAITER_POLL: Duration = Duration::from_millis(200);

/// A single node of a test cluster
pub struct TestNode {
    pub id: NodeId,
    pub kv: Arc<KvServer>,
    pub raft: Raft,
    pub core: SharedCore,
    raft_shutdown: RaftShutdown,
    rpc_task: JoinHandle<()>,
}

/// An in-process cluster of key/value nodes
pub struct TestCluster {
    /// Running nodes by id; crashed nodes are absent
    pub nodes: HashMap<NodeId, TestNode>,
    pub network: InMemoryNetwork,
    /// Persisters outlive their nodes so a restart finds durable state
    persisters: HashMap<NodeId, Arc<MemoryPersister>>,
    all_ids: Vec<NodeId>,
    config: RaftConfig,
}

impl TestCluster {
    /// Create and start a cluster of `count` nodes with ids 1..=count
    pub async fn new(count: usize) -> Self {
        Self::with_config(count, RaftConfig::default()).await
    }

    /// Create and start a cluster with custom Raft timing
    pub async fn with_config(count: usize, config: RaftConfig) -> Self {
        let all_ids: Vec<NodeId> = (1..=count as NodeId).collect();
        // Initial handles are discarded; every node start goes through
        // renew_handle so first start and restart share one path
        let (network, _handles) = InMemoryNetwork::new(&all_ids);

        let mut cluster = TestCluster {
            nodes: HashMap::new(),
            network,
            persisters: all_ids
                .iter()
                .map(|&id| (id, Arc::new(MemoryPersister::new())))
                .collect(),
            all_ids: all_ids.clone(),
            config,
        };

        for &id in &all_ids {
            cluster.start_node(id);
        }
        cluster
    }

    /// Start (or restart) one node from its persister
    fn start_node(&mut self, id: NodeId) {
        assert!(!self.nodes.contains_key(&id), "node {} already running", id);
        let persister = self.persisters.get(&id).expect("unknown node id").clone();
        let peers: Vec<NodeId> = self.all_ids.iter().copied().filter(|&p| p != id).collect();

        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let core = RaftCore::new(id, peers, persister.clone(), apply_tx);
        let transport = self.network.transport(id);
        let (server, raft) = RaftServer::with_config(core, transport, self.config.clone());

        let rpc_task = self.network.renew_handle(id).serve(raft.shared_core());
        let raft_shutdown = server.start();

        let kv = Arc::new(
            KvServer::new(raft.clone(), persister, apply_rx).with_poll_interval(TEST_WAITER_POLL),
        );

        self.nodes.insert(
            id,
            TestNode {
                id,
                core: raft.shared_core(),
                kv,
                raft,
                raft_shutdown,
                rpc_task,
            },
        );
    }

    /// Stop a node, dropping all volatile state; its persister survives.
    /// Peers see delivery failures until the node is restarted.
    pub async fn crash(&mut self, id: NodeId) {
        let node = self.nodes.remove(&id).expect("node not running");
        node.raft_shutdown.shutdown().await;
        node.rpc_task.abort();
    }

    /// Restart a previously crashed node from its persisted state
    pub fn restart(&mut self, id: NodeId) {
        self.start_node(id);
    }

    /// Disconnect a node from the network (it keeps running)
    pub fn disconnect(&self, id: NodeId) {
        self.network.disconnect(id);
    }

    /// Reconnect a node
    pub fn reconnect(&self, id: NodeId) {
        self.network.reconnect(id);
    }

    /// Ids of currently running nodes
    pub fn running_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Wait until some running node reports leadership, returning its id
    pub async fn wait_for_leader(&self, wait: Duration) -> Option<NodeId> {
        self.wait_for_leader_among(&self.running_ids(), wait).await
    }

    /// Wait until some node from `ids` reports leadership
    pub async fn wait_for_leader_among(&self, ids: &[NodeId], wait: Duration) -> Option<NodeId> {
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            for &id in ids {
                let Some(node) = self.nodes.get(&id) else {
                    continue;
                };
                let (_, is_leader) = node.raft.get_state().await;
                if is_leader {
                    return Some(id);
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
        None
    }

    /// Client-style Put: retry against every node until one accepts,
    /// reusing the same RequestId throughout
    pub async fn put(&self, key: &str, value: &str, request_id: RequestId) -> bool {
        self.put_append(OpKind::Put, key, value, request_id).await
    }

    /// Client-style Append with retries, reusing the same RequestId
    pub async fn append(&self, key: &str, value: &str, request_id: RequestId) -> bool {
        self.put_append(OpKind::Append, key, value, request_id).await
    }

    async fn put_append(
        &self,
        kind: OpKind,
        key: &str,
        value: &str,
        request_id: RequestId,
    ) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            for id in self.running_ids() {
                let node = &self.nodes[&id];
                let reply = node.kv.put_append(kind, key, value, request_id).await;
                if !reply.wrong_leader && reply.err == Status::Ok {
                    return true;
                }
            }
            sleep(Duration::from_millis(50)).await;
        }
        false
    }

    /// Client-style Get with retries, reusing the same RequestId.
    /// Returns None when the key does not exist.
    pub async fn get(&self, key: &str, request_id: RequestId) -> Option<String> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            for id in self.running_ids() {
                let node = &self.nodes[&id];
                let reply = node.kv.get(key, request_id).await;
                if !reply.wrong_leader {
                    match reply.err {
                        Status::Ok => return Some(reply.value),
                        Status::NoKey => return None,
                        _ => {}
                    }
                }
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("get({}) did not complete before the deadline", key);
    }

    /// Wait until every running node's store maps `key` to `expected`.
    /// Panics on timeout.
    pub async fn wait_for_agreement(&self, key: &str, expected: &str, wait: Duration) {
        let deadline = Instant::now() + wait;
        'outer: while Instant::now() < deadline {
            for node in self.nodes.values() {
                let data = node.kv.data().await;
                if data.get(key).map(String::as_str) != Some(expected) {
                    sleep(Duration::from_millis(50)).await;
                    continue 'outer;
                }
            }
            return;
        }
        panic!(
            "stores did not agree that {:?} = {:?} within {:?}",
            key, expected, wait
        );
    }

    /// Stop every node
    pub async fn shutdown(mut self) {
        let ids = self.running_ids();
        for id in ids {
            if let Some(node) = self.nodes.remove(&id) {
                node.raft_shutdown.shutdown().await;
                node.rpc_task.abort();
            }
        }
    }
}
