//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management
//! what: NodeState enum, RaftNode struct, election, replication and commit rules
//!
//! The node never performs I/O. Callers feed it RPCs and replies, send the
//! messages it returns, and persist `persistent_state()` whenever
//! `needs_persist()` is set, before any reply leaves the process.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::log::{self, LogEntry};
use crate::message::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use crate::{LogIndex, NodeId, Term};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// The record written to stable storage as one unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,
    pub commit_index: LogIndex,
    /// Apply cursor at the time of the save. Informational only: advancing it
    /// does not trigger a save, and [`RaftNode::restore`] ignores it because
    /// only the state machine knows what it holds.
    pub last_applied: LogIndex,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Every voting member, including this node
    pub cluster_nodes: Vec<NodeId>,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: Term,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    /// Leader of the current term, once known
    pub leader_id: Option<NodeId>,
    /// Voters that granted us a vote in the current election
    pub votes_received: Vec<NodeId>,
    /// Leader only: next index to send to each peer
    pub next_index: HashMap<NodeId, LogIndex>,
    /// Leader only: highest index known replicated on each peer
    pub match_index: HashMap<NodeId, LogIndex>,
    dirty: bool,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: NodeId, cluster_nodes: Vec<NodeId>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: NodeId, cluster_nodes: Vec<NodeId>, config: RaftConfig) -> Self {
        Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            dirty: false,
        }
    }

    /// Rebuild a follower from a persisted record.
    ///
    /// `last_applied` starts at 0; the host decides how much of the log its
    /// state machine already holds.
    pub fn restore(
        id: NodeId,
        cluster_nodes: Vec<NodeId>,
        config: RaftConfig,
        persisted: PersistentState,
    ) -> Self {
        let mut node = Self::with_config(id, cluster_nodes, config);
        node.current_term = persisted.current_term;
        node.voted_for = persisted.voted_for;
        node.log = persisted.log;
        node.commit_index = persisted.commit_index.min(node.last_log_index());
        node
    }

    // -- persistence --

    pub fn needs_persist(&self) -> bool {
        self.dirty
    }

    pub fn persistent_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
        }
    }

    pub fn mark_persisted(&mut self) {
        self.dirty = false;
    }

    // -- cluster arithmetic --

    /// Other cluster members
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.cluster_nodes.iter().copied().filter(move |p| *p != self.id)
    }

    /// Strict majority of the cluster
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> LogIndex {
        log::last_index(&self.log)
    }

    pub fn last_log_term(&self) -> Term {
        log::last_term(&self.log)
    }

    pub fn get_entry(&self, index: LogIndex) -> Option<&LogEntry> {
        log::entry_at(&self.log, index)
    }

    pub fn get_term_at(&self, index: LogIndex) -> Term {
        log::term_at(&self.log, index)
    }

    /// Election restriction: is a candidate's log at least as up to date as ours
    pub fn is_log_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_term = self.last_log_term();
        last_log_term > our_term
            || (last_log_term == our_term && last_log_index >= self.last_log_index())
    }

    // -- role transitions --

    /// Adopt a term seen in a message; never moves backwards.
    ///
    /// Returns `StaleTerm` when the observed term was newer, after stepping
    /// down, so callers can abandon candidate or leader work.
    pub fn observe_term(&mut self, term: Term) -> Result<()> {
        if term > self.current_term {
            let local = self.current_term;
            self.become_follower(term);
            return Err(RaftError::StaleTerm {
                local,
                observed: term,
            });
        }
        Ok(())
    }

    pub fn become_follower(&mut self, term: Term) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.dirty = true;
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Election timeout fired: become candidate and ask everyone for votes
    pub fn start_election(&mut self) -> RequestVoteArgs {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.votes_received = vec![self.id];
        self.next_index.clear();
        self.match_index.clear();
        self.dirty = true;

        let args = RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };

        if self.has_quorum() {
            self.become_leader();
        }
        args
    }

    /// Won the election: reset per-peer replication state and append a no-op
    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        let peers: Vec<NodeId> = self.peers().collect();
        self.next_index = peers.iter().map(|p| (*p, next)).collect();
        self.match_index = peers.iter().map(|p| (*p, 0)).collect();

        self.push_entry(Vec::new());
        self.advance_commit_index();
    }

    // -- RequestVote --

    /// Returns the reply and whether the election timer should be reset
    pub fn handle_vote_request(&mut self, args: &RequestVoteArgs) -> (RequestVoteReply, bool) {
        if args.term < self.current_term {
            return (self.vote_reply(false), false);
        }
        let _ = self.observe_term(args.term);

        let free = self.voted_for.is_none() || self.voted_for == Some(args.candidate_id);
        let granted = free && self.is_log_up_to_date(args.last_log_index, args.last_log_term);
        if granted && self.voted_for != Some(args.candidate_id) {
            self.voted_for = Some(args.candidate_id);
            self.dirty = true;
        }
        (self.vote_reply(granted), granted)
    }

    fn vote_reply(&self, vote_granted: bool) -> RequestVoteReply {
        RequestVoteReply {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Count a vote. Returns true when this reply made us leader.
    pub fn handle_vote_response(&mut self, from: NodeId, reply: &RequestVoteReply) -> Result<bool> {
        self.observe_term(reply.term)?;
        if self.state != NodeState::Candidate || reply.term != self.current_term {
            return Ok(false);
        }
        if reply.vote_granted && !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        if self.has_quorum() {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }

    // -- AppendEntries, leader side --

    /// Append a client command to the leader's log
    pub fn append_entry(&mut self, command: Vec<u8>) -> Result<LogEntry> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_id: self.leader_id,
            });
        }
        let entry = self.push_entry(command);
        self.advance_commit_index();
        Ok(entry)
    }

    fn push_entry(&mut self, command: Vec<u8>) -> LogEntry {
        let entry = LogEntry::new(self.current_term, self.last_log_index() + 1, command);
        self.log.push(entry.clone());
        self.dirty = true;
        entry
    }

    /// Build the next AppendEntries for `peer`; empty entries act as a heartbeat
    pub fn create_append_entries(&self, peer: NodeId) -> Option<AppendEntriesArgs> {
        if !self.is_leader() {
            return None;
        }
        let last = self.last_log_index();
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(last + 1)
            .clamp(1, last + 1);
        let prev_log_index = next - 1;
        let end = last.min(prev_log_index + self.config.max_entries_per_append as LogIndex);

        Some(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.get_term_at(prev_log_index),
            entries: self.log[prev_log_index as usize..end as usize].to_vec(),
            leader_commit: self.commit_index,
        })
    }

    /// Whether `peer` is missing entries the leader holds
    pub fn has_pending_entries(&self, peer: NodeId) -> bool {
        self.is_leader()
            && self
                .next_index
                .get(&peer)
                .is_some_and(|next| *next <= self.last_log_index())
    }

    /// Process a follower's reply. Returns true when the commit index advanced.
    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        reply: &AppendEntriesReply,
    ) -> Result<bool> {
        self.observe_term(reply.term)?;
        if !self.is_leader() || reply.term != self.current_term {
            return Ok(false);
        }

        let matched = self.match_index.get(&from).copied().unwrap_or(0);
        let next = self
            .next_index
            .get(&from)
            .copied()
            .unwrap_or(self.last_log_index() + 1);

        if reply.success {
            let matched = matched.max(reply.match_index.min(self.last_log_index()));
            self.match_index.insert(from, matched);
            self.next_index.insert(from, next.max(matched + 1));
            return Ok(self.advance_commit_index());
        }

        // consistency failure: move the probe point back
        let hinted = if reply.conflict_index == 0 {
            next.saturating_sub(1)
        } else {
            match reply
                .conflict_term
                .and_then(|term| log::last_index_of_term(&self.log, term))
            {
                Some(index) => index + 1,
                None => reply.conflict_index,
            }
        };
        self.next_index
            .insert(from, hinted.min(next).max(matched + 1).max(1));
        Ok(false)
    }

    /// Advance commit to the highest current-term index held by a majority
    pub fn advance_commit_index(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let quorum = self.quorum_size();
        let mut index = self.last_log_index();
        while index > self.commit_index {
            let term = self.get_term_at(index);
            if term < self.current_term {
                // earlier-term entries only commit indirectly
                break;
            }
            if term == self.current_term {
                let replicas = 1 + self.match_index.values().filter(|m| **m >= index).count();
                if replicas >= quorum {
                    self.commit_index = index;
                    return true;
                }
            }
            index -= 1;
        }
        false
    }

    // -- AppendEntries, follower side --

    /// Returns the reply and whether the election timer should be reset
    pub fn handle_append_entries(
        &mut self,
        args: &AppendEntriesArgs,
    ) -> (AppendEntriesReply, bool) {
        if args.term < self.current_term {
            return (AppendEntriesReply::rejected(self.current_term), false);
        }
        self.become_follower(args.term);
        self.leader_id = Some(args.leader_id);

        if let Err(err) =
            log::check_consistency(&self.log, args.prev_log_index, args.prev_log_term)
        {
            return (self.conflict_reply(&err), true);
        }

        if log::merge_entries(&mut self.log, args.prev_log_index, &args.entries) {
            self.dirty = true;
        }

        let last_new = args.last_index();
        if args.leader_commit > self.commit_index {
            self.commit_index = self.commit_index.max(args.leader_commit.min(last_new));
        }

        let reply = AppendEntriesReply {
            term: self.current_term,
            success: true,
            match_index: last_new,
            conflict_index: 0,
            conflict_term: None,
        };
        (reply, true)
    }

    fn conflict_reply(&self, err: &RaftError) -> AppendEntriesReply {
        let mut reply = AppendEntriesReply::rejected(self.current_term);
        if let RaftError::LogInconsistency { prev_log_index, .. } = *err {
            if prev_log_index > self.last_log_index() {
                reply.conflict_index = self.last_log_index() + 1;
            } else {
                let term = self.get_term_at(prev_log_index);
                reply.conflict_term = Some(term);
                reply.conflict_index = log::first_index_of_term(&self.log, term).unwrap_or(1);
            }
        }
        reply
    }

    // -- applying --

    /// Committed entries not yet handed to the state machine, in log order
    pub fn get_entries_to_apply(&mut self) -> Vec<LogEntry> {
        let end = self.commit_index.min(self.last_log_index());
        if self.last_applied >= end {
            return Vec::new();
        }
        let entries = self.log[self.last_applied as usize..end as usize].to_vec();
        self.last_applied = end;
        entries
    }
}
