//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-runtime (timers, rpc, locking), persisted via raft-storage
//! what: role state machine, election logic, log management, commit tracking, message types

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use log::LogEntry;
pub use message::{
    AppendEntriesArgs, AppendEntriesReply, RaftMessage, RequestVoteArgs, RequestVoteReply,
};
pub use node::{NodeState, PersistentState, RaftNode};

/// Identifier of a cluster member
pub type NodeId = u64;

/// Leadership epoch; never decreases on a node
pub type Term = u64;

/// 1-based position in the replicated log; 0 means "before the first entry"
pub type LogIndex = u64;
