//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, framed by raft-runtime transports
//! what: RequestVote / AppendEntries args and replies, RaftMessage wire envelope

use serde::{Deserialize, Serialize};

use crate::{LogEntry, LogIndex, NodeId, Term};

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to a vote request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

impl AppendEntriesArgs {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry this request covers
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as LogIndex
    }
}

/// Response to AppendEntries
///
/// On success `match_index` is the last index known to match the leader.
/// On a consistency failure `conflict_index`/`conflict_term` tell the leader
/// where to resume; `conflict_index == 0` means no hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
    #[serde(default)]
    pub match_index: LogIndex,
    #[serde(default)]
    pub conflict_index: LogIndex,
    #[serde(default)]
    pub conflict_term: Option<Term>,
}

impl AppendEntriesReply {
    pub fn rejected(term: Term) -> Self {
        Self {
            term,
            success: false,
            match_index: 0,
            conflict_index: 0,
            conflict_term: None,
        }
    }
}

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum RaftMessage {
    VoteRequest(RequestVoteArgs),
    VoteResponse(RequestVoteReply),
    AppendEntries(AppendEntriesArgs),
    AppendEntriesResponse(AppendEntriesReply),
}

impl RaftMessage {
    pub fn term(&self) -> Term {
        match self {
            Self::VoteRequest(m) => m.term,
            Self::VoteResponse(m) => m.term,
            Self::AppendEntries(m) => m.term,
            Self::AppendEntriesResponse(m) => m.term,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
