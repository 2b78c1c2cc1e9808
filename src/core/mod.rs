//! Raft engine: core state machine, async drivers, configuration

pub mod config;
pub mod raft_core;
pub mod raft_node;
pub mod raft_server;
