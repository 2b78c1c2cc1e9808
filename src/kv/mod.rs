//! Linearizable key/value service layered on the Raft log
//!
//! - `Op`: client operations as stored in the log
//! - `KvServer`: the applier and the client-facing Get / PutAppend surface

pub mod op;
pub mod server;

pub use op::{Op, OpKind, RequestId};
pub use server::{GetReply, KvServer, PutAppendReply, Status};
