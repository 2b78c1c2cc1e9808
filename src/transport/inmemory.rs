//! In-memory transport implementation for testing
//!
//! RPCs travel over tokio channels between nodes of one process. The
//! network tracks per-node connectivity and a partition map, so tests can
//! sever links, split the cluster into sides, and heal it again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, NodeId, RaftCore, RequestVoteArgs, RequestVoteResult,
    SharedCore,
};
use crate::transport::{Transport, TransportError};

/// How long a sender waits for a reply before reporting a timeout.
/// Kept well under the minimum election timeout so a dead peer cannot
/// stall an election or heartbeat round past the protocol's deadlines.
const RPC_TIMEOUT: Duration = Duration::from_millis(50);

/// Request types that can be sent to a node
pub(crate) enum Request {
    RequestVote {
        args: RequestVoteArgs,
        reply: oneshot::Sender<RequestVoteResult>,
    },
    AppendEntries {
        args: AppendEntriesArgs,
        reply: oneshot::Sender<AppendEntriesResult>,
    },
}

/// Connectivity state shared by every transport of one network
#[derive(Debug)]
struct Connectivity {
    /// Nodes currently attached to the network
    enabled: HashMap<NodeId, bool>,
    /// Partition side per node; messages only flow within a side
    side: HashMap<NodeId, usize>,
}

impl Connectivity {
    fn can_deliver(&self, from: NodeId, to: NodeId) -> bool {
        self.enabled.get(&from).copied().unwrap_or(false)
            && self.enabled.get(&to).copied().unwrap_or(false)
            && self.side.get(&from) == self.side.get(&to)
    }
}

/// An in-process network connecting a set of nodes
#[derive(Clone)]
pub struct InMemoryNetwork {
    senders: Arc<StdMutex<HashMap<NodeId, mpsc::Sender<Request>>>>,
    connectivity: Arc<StdMutex<Connectivity>>,
    timeout: Duration,
}

impl InMemoryNetwork {
    /// Create a network for the given nodes, returning one handle per
    /// node for serving its incoming requests
    pub fn new(node_ids: &[NodeId]) -> (Self, HashMap<NodeId, NodeHandle>) {
        Self::with_timeout(node_ids, RPC_TIMEOUT)
    }

    /// Create a network with a custom RPC timeout
    pub fn with_timeout(
        node_ids: &[NodeId],
        timeout: Duration,
    ) -> (Self, HashMap<NodeId, NodeHandle>) {
        let mut senders = HashMap::new();
        let mut handles = HashMap::new();
        for &id in node_ids {
            let (tx, rx) = mpsc::channel(64);
            senders.insert(id, tx);
            handles.insert(id, NodeHandle { receiver: rx });
        }

        let connectivity = Connectivity {
            enabled: node_ids.iter().map(|&id| (id, true)).collect(),
            side: node_ids.iter().map(|&id| (id, 0)).collect(),
        };

        let network = InMemoryNetwork {
            senders: Arc::new(StdMutex::new(senders)),
            connectivity: Arc::new(StdMutex::new(connectivity)),
            timeout,
        };
        (network, handles)
    }

    /// Replace a node's request channel, returning the fresh handle.
    /// Used to bring a crashed node back: the old receiver died with its
    /// serve task, so the node needs a new lane into the network.
    pub fn renew_handle(&self, id: NodeId) -> NodeHandle {
        let (tx, rx) = mpsc::channel(64);
        self.senders.lock().unwrap().insert(id, tx);
        NodeHandle { receiver: rx }
    }

    /// Build the transport a node uses to reach its peers
    pub fn transport(&self, id: NodeId) -> InMemoryTransport {
        InMemoryTransport {
            id,
            network: self.clone(),
        }
    }

    /// Detach a node: nothing is delivered to or from it
    pub fn disconnect(&self, id: NodeId) {
        self.connectivity.lock().unwrap().enabled.insert(id, false);
    }

    /// Reattach a previously disconnected node
    pub fn reconnect(&self, id: NodeId) {
        self.connectivity.lock().unwrap().enabled.insert(id, true);
    }

    /// Split the cluster into sides; messages only flow within a side.
    /// Nodes not named keep their current side.
    pub fn partition(&self, sides: &[&[NodeId]]) {
        let mut connectivity = self.connectivity.lock().unwrap();
        for (side_no, side) in sides.iter().enumerate() {
            for &id in *side {
                connectivity.side.insert(id, side_no);
            }
        }
    }

    /// Merge all sides back into one network
    pub fn heal(&self) {
        let mut connectivity = self.connectivity.lock().unwrap();
        for side in connectivity.side.values_mut() {
            *side = 0;
        }
    }

    fn can_deliver(&self, from: NodeId, to: NodeId) -> bool {
        self.connectivity.lock().unwrap().can_deliver(from, to)
    }
}

/// In-memory transport bound to one sending node
pub struct InMemoryTransport {
    id: NodeId,
    network: InMemoryNetwork,
}

impl InMemoryTransport {
    async fn call<Reply>(
        &self,
        target: NodeId,
        make_request: impl FnOnce(oneshot::Sender<Reply>) -> Request,
    ) -> Result<Reply, TransportError> {
        if !self.network.can_deliver(self.id, target) {
            return Err(TransportError::ConnectionFailed);
        }
        let sender = self
            .network
            .senders
            .lock()
            .unwrap()
            .get(&target)
            .cloned()
            .ok_or(TransportError::NodeNotFound)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(make_request(reply_tx))
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        let reply = tokio::time::timeout(self.network.timeout, reply_rx)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|_| TransportError::ConnectionFailed)?;

        // A partition that formed while the request was in flight also
        // swallows the reply
        if !self.network.can_deliver(self.id, target) {
            return Err(TransportError::ConnectionFailed);
        }
        Ok(reply)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.call(target, |reply| Request::RequestVote { args, reply })
            .await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.call(target, |reply| Request::AppendEntries { args, reply })
            .await
    }
}

/// Handle for a node that processes incoming requests
pub struct NodeHandle {
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    /// Process one incoming request against the given core.
    /// Returns false when all senders are gone.
    pub async fn process_one(&mut self, core: &mut RaftCore) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                Self::handle_request(request, core);
                true
            }
            None => false,
        }
    }

    /// Spawn a task that serves requests against a shared core until the
    /// network is dropped. Aborting the task simulates a crashed node.
    pub fn serve(mut self, core: SharedCore) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(request) = self.receiver.recv().await {
                let mut core = core.lock().await;
                Self::handle_request(request, &mut core);
            }
        })
    }

    fn handle_request(request: Request, core: &mut RaftCore) {
        match request {
            Request::RequestVote { args, reply } => {
                let result = core.handle_request_vote(&args);
                let _ = reply.send(result);
            }
            Request::AppendEntries { args, reply } => {
                let result = core.handle_append_entries(&args);
                let _ = reply.send(result);
            }
        }
    }
}
