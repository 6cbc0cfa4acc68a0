//! # error
//!
//! why: one error taxonomy shared by the core, the storage layer and the runtime
//! relations: returned by node.rs (proposals), config.rs (validation), raft-runtime handlers
//! what: RaftError, Result alias

use thiserror::Error;

use crate::{LogIndex, NodeId, Term};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    /// The local term is behind one observed from a peer
    #[error("stale term: local term {local} is behind observed term {observed}")]
    StaleTerm { local: Term, observed: Term },

    /// Proposal sent to a node that is not the leader; redirect to `leader_id`
    #[error("not the leader (known leader: {leader_id:?})")]
    NotLeader { leader_id: Option<NodeId> },

    /// Receiver has no entry at `prev_log_index` with `prev_log_term`
    #[error("log inconsistency at index {prev_log_index} (expected term {prev_log_term})")]
    LogInconsistency {
        prev_log_index: LogIndex,
        prev_log_term: Term,
    },

    #[error("transport error: {0}")]
    Transport(String),

    /// Durable write failed; the node refuses to serve until storage recovers
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("operation timed out")]
    Timeout,

    #[error("node is shut down")]
    Shutdown,

    #[error("empty commands are reserved for leader no-op entries")]
    EmptyCommand,

    /// The proposed entry was overwritten by a leader of a later term
    #[error("proposal at index {index} (term {term}) was superseded")]
    ProposalDropped { index: LogIndex, term: Term },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RaftError {
    /// Errors a caller can resolve by retrying elsewhere or later
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader { .. }
                | Self::Transport(_)
                | Self::Timeout
                | Self::ProposalDropped { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
