//! # node
//!
//! why: give a raft-core node clocks, peers, durable storage and a state machine
//! relations: RaftNode + Storage live behind one lock; transport/ carries outbound rpc; applier.rs receives commits
//! what: spawn_node, NodeHandle (rpc handlers, propose, status, shutdown), election/leader/replication/apply tasks
//!
//! Every task follows the same shape: lock, step the core, persist if the
//! core is dirty, unlock, then do network I/O. Replies that come back after
//! the node has moved to another term are discarded.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, LogEntry, LogIndex, NodeId, NodeState, RaftConfig,
    RaftError, RaftMessage, RaftNode, RequestVoteArgs, RequestVoteReply, Result, Term,
};
use raft_storage::Storage;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::applier::Applier;
use crate::timer::ElectionTimer;
use crate::transport::{with_retries, Transport};

/// A committed proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub index: LogIndex,
    pub term: Term,
    /// What the applier returned for this entry
    pub output: Vec<u8>,
}

/// Point-in-time view of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: NodeState,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub members: Vec<NodeId>,
    /// Storage failed and the node refuses work until a save succeeds
    pub halted: bool,
}

struct Pending {
    term: Term,
    reply: oneshot::Sender<Result<Proposal>>,
}

struct Inner {
    raft: RaftNode,
    storage: Box<dyn Storage>,
    timer: ElectionTimer,
    /// Proposals waiting for their index to be applied
    pending: BTreeMap<LogIndex, Pending>,
    /// Peers with a replication task in flight
    replicating: HashSet<NodeId>,
    halted: bool,
    stopped: bool,
}

impl Inner {
    fn snapshot(&self) -> (NodeState, Term) {
        (self.raft.state, self.raft.current_term)
    }
}

struct Shared {
    id: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,
    inner: Mutex<Inner>,
    transport: Arc<dyn Transport>,
    apply_ready: Notify,
    replicate_now: Notify,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    /// Save when the core changed durable state. A failure halts the node
    /// until a later save of the full state succeeds.
    fn persist(&self, inner: &mut Inner) -> Result<()> {
        if !inner.raft.needs_persist() && !inner.halted {
            return Ok(());
        }
        let state = inner.raft.persistent_state();
        match inner.storage.save(&state) {
            Ok(()) => {
                inner.raft.mark_persisted();
                if inner.halted {
                    inner.halted = false;
                    info!(node = self.id, term = state.current_term, "storage recovered, resuming");
                    self.apply_ready.notify_one();
                    self.replicate_now.notify_one();
                }
                Ok(())
            }
            Err(err) => {
                if !inner.halted {
                    error!(
                        node = self.id,
                        term = state.current_term,
                        error = %err,
                        "failed to persist state, halting"
                    );
                }
                inner.halted = true;
                Err(err.into())
            }
        }
    }

    /// Gate in front of every externally triggered step
    fn ensure_serving(&self, inner: &mut Inner) -> Result<()> {
        if inner.stopped {
            return Err(RaftError::Shutdown);
        }
        if inner.halted {
            self.persist(inner)?;
        }
        Ok(())
    }

    /// Whether a reply to an rpc sent as `role` in `term` can still be used
    fn still_acting_as(&self, role: NodeState, term: Term) -> bool {
        let inner = self.inner.lock();
        !inner.stopped && inner.raft.state == role && inner.raft.current_term == term
    }

    fn after_step(&self, inner: &Inner, before: (NodeState, Term)) {
        let (role, term) = inner.snapshot();
        if before.0 != NodeState::Follower && role == NodeState::Follower {
            info!(node = self.id, term, previous = ?before.0, "stepped down to follower");
        } else if term > before.1 {
            debug!(node = self.id, term, "adopted newer term");
        }
        if inner.raft.commit_index > inner.raft.last_applied {
            self.apply_ready.notify_one();
        }
    }

    fn resolve(&self, entry: &LogEntry, output: Option<Vec<u8>>) {
        let Some(pending) = self.inner.lock().pending.remove(&entry.index) else {
            return;
        };
        let result = match output {
            Some(output) if pending.term == entry.term => Ok(Proposal {
                index: entry.index,
                term: entry.term,
                output,
            }),
            _ => {
                warn!(
                    node = self.id,
                    index = entry.index,
                    proposed_term = pending.term,
                    committed_term = entry.term,
                    "proposal overwritten by another leader"
                );
                Err(RaftError::ProposalDropped {
                    index: entry.index,
                    term: pending.term,
                })
            }
        };
        let _ = pending.reply.send(result);
    }
}

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct NodeHandle {
    shared: Arc<Shared>,
}

/// Start a node and its background tasks on the current tokio runtime.
///
/// State is restored from `storage` when a record exists. `last_applied`
/// starts at the applier's `applied_index()`, so by default every committed
/// entry is replayed into the applier.
pub fn spawn_node<S, A>(
    id: NodeId,
    members: Vec<NodeId>,
    config: RaftConfig,
    storage: S,
    transport: Arc<dyn Transport>,
    applier: A,
) -> Result<NodeHandle>
where
    S: Storage + 'static,
    A: Applier,
{
    config.validate()?;
    if !members.contains(&id) {
        return Err(RaftError::InvalidConfig(format!(
            "node {id} is not in the member list {members:?}"
        )));
    }

    let mut raft = match storage.load()? {
        Some(persisted) => {
            info!(
                node = id,
                term = persisted.current_term,
                entries = persisted.log.len(),
                commit_index = persisted.commit_index,
                "restored persisted state"
            );
            RaftNode::restore(id, members.clone(), config.clone(), persisted)
        }
        None => RaftNode::with_config(id, members.clone(), config.clone()),
    };
    raft.last_applied = applier.applied_index().min(raft.commit_index);

    let (shutdown, _) = watch::channel(false);
    let shared = Arc::new(Shared {
        id,
        peers: raft.peers().collect(),
        inner: Mutex::new(Inner {
            timer: ElectionTimer::new(&config),
            raft,
            storage: Box::new(storage),
            pending: BTreeMap::new(),
            replicating: HashSet::new(),
            halted: false,
            stopped: false,
        }),
        config,
        transport,
        apply_ready: Notify::new(),
        replicate_now: Notify::new(),
        shutdown,
    });

    tokio::spawn(run_election_loop(shared.clone()));
    tokio::spawn(run_apply_loop(shared.clone(), applier));
    // replay anything committed before a restart
    shared.apply_ready.notify_one();

    info!(node = id, ?members, "node started");
    Ok(NodeHandle { shared })
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    /// RequestVote receiver side
    pub fn handle_request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        shared.ensure_serving(&mut inner)?;

        let before = inner.snapshot();
        let (reply, reset_timer) = inner.raft.handle_vote_request(&args);
        shared.persist(&mut inner)?;
        if reset_timer {
            inner.timer.reset();
        }
        if reply.vote_granted {
            debug!(
                node = shared.id,
                candidate = args.candidate_id,
                term = args.term,
                "granted vote"
            );
        }
        shared.after_step(&inner, before);
        Ok(reply)
    }

    /// AppendEntries receiver side
    pub fn handle_append_entries(&self, args: AppendEntriesArgs) -> Result<AppendEntriesReply> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        shared.ensure_serving(&mut inner)?;

        let before = inner.snapshot();
        let (reply, reset_timer) = inner.raft.handle_append_entries(&args);
        shared.persist(&mut inner)?;
        if reset_timer {
            inner.timer.reset();
        }
        if !reply.success && args.term >= before.1 {
            debug!(
                node = shared.id,
                leader = args.leader_id,
                prev_log_index = args.prev_log_index,
                conflict_index = reply.conflict_index,
                "rejected append entries, log diverges"
            );
        }
        shared.after_step(&inner, before);
        Ok(reply)
    }

    /// Answer one inbound wire request
    pub fn handle_message(&self, message: RaftMessage) -> Result<RaftMessage> {
        match message {
            RaftMessage::VoteRequest(args) => self
                .handle_request_vote(args)
                .map(RaftMessage::VoteResponse),
            RaftMessage::AppendEntries(args) => self
                .handle_append_entries(args)
                .map(RaftMessage::AppendEntriesResponse),
            other => Err(RaftError::Transport(format!(
                "unsolicited response frame in term {}",
                other.term()
            ))),
        }
    }

    /// Replicate `command` and wait until it is applied locally.
    ///
    /// Fails with `NotLeader` on followers, `ProposalDropped` when another
    /// leader overwrote the slot, and `Timeout` after `propose_timeout`.
    pub async fn propose(&self, command: Vec<u8>) -> Result<Proposal> {
        if command.is_empty() {
            return Err(RaftError::EmptyCommand);
        }
        let shared = &self.shared;
        let (index, receiver) = {
            let mut inner = shared.inner.lock();
            shared.ensure_serving(&mut inner)?;
            let before = inner.snapshot();
            let entry = inner.raft.append_entry(command)?;
            shared.persist(&mut inner)?;

            let (reply, receiver) = oneshot::channel();
            inner.pending.insert(
                entry.index,
                Pending {
                    term: entry.term,
                    reply,
                },
            );
            debug!(node = shared.id, index = entry.index, term = entry.term, "proposal appended");
            shared.after_step(&inner, before);
            (entry.index, receiver)
        };
        shared.replicate_now.notify_one();

        match time::timeout(shared.config.propose_timeout(), receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => {
                shared.inner.lock().pending.remove(&index);
                Err(RaftError::Timeout)
            }
        }
    }

    pub fn status(&self) -> NodeStatus {
        let inner = self.shared.inner.lock();
        let raft = &inner.raft;
        NodeStatus {
            id: raft.id,
            role: raft.state,
            term: raft.current_term,
            leader_id: raft.leader_id,
            voted_for: raft.voted_for,
            commit_index: raft.commit_index,
            last_applied: raft.last_applied,
            last_log_index: raft.last_log_index(),
            members: raft.cluster_nodes.clone(),
            halted: inner.halted,
        }
    }

    /// Stop timers, loops and servers. Later calls fail with `Shutdown`.
    pub fn shutdown(&self) {
        let pending = {
            let mut inner = self.shared.inner.lock();
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            std::mem::take(&mut inner.pending)
        };
        for (_, pending) in pending {
            let _ = pending.reply.send(Err(RaftError::Shutdown));
        }
        self.shared.shutdown.send_replace(true);
        info!(node = self.shared.id, "node shut down");
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }
}

/// Resolves once the shutdown flag is raised or its sender is gone
pub(crate) async fn wait_shutdown(signal: &mut watch::Receiver<bool>) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}

// -- elections --

async fn run_election_loop(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let deadline = shared.inner.lock().timer.deadline();
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            _ = time::sleep_until(deadline) => {}
        }
        let Some(request) = start_election(&shared) else {
            continue;
        };
        for peer in shared.peers.iter().copied() {
            tokio::spawn(request_vote(shared.clone(), peer, request.clone()));
        }
    }
    debug!(node = shared.id, "election loop stopped");
}

/// Called when the election deadline passes; returns the request to broadcast
fn start_election(shared: &Arc<Shared>) -> Option<RequestVoteArgs> {
    let mut inner = shared.inner.lock();
    if inner.stopped || !inner.timer.is_expired() {
        return None;
    }
    inner.timer.reset();
    if shared.ensure_serving(&mut inner).is_err() || inner.raft.is_leader() {
        return None;
    }

    let args = inner.raft.start_election();
    info!(node = shared.id, term = args.term, "election timeout, starting election");
    if shared.persist(&mut inner).is_err() {
        return None;
    }
    if inner.raft.is_leader() {
        info!(node = shared.id, term = args.term, "won election unopposed");
        shared.after_step(&inner, (NodeState::Candidate, args.term));
        spawn_leader(shared, args.term);
        return None;
    }
    Some(args)
}

async fn request_vote(shared: Arc<Shared>, peer: NodeId, args: RequestVoteArgs) {
    let transport = shared.transport.clone();
    let request = args.clone();
    let result = with_retries(
        &shared.config,
        peer,
        "request_vote",
        || shared.still_acting_as(NodeState::Candidate, args.term),
        move || {
            let transport = transport.clone();
            let request = request.clone();
            async move { transport.send_request_vote(peer, request).await }
        },
    )
    .await;
    let reply = match result {
        Ok(reply) => reply,
        Err(err) => {
            debug!(
                node = shared.id,
                peer,
                term = args.term,
                error = %err,
                "vote request abandoned"
            );
            return;
        }
    };

    let mut inner = shared.inner.lock();
    if inner.stopped || inner.halted {
        return;
    }
    if reply.term <= inner.raft.current_term && args.term != inner.raft.current_term {
        // answer to an election this node already left
        return;
    }
    let before = inner.snapshot();
    match inner.raft.handle_vote_response(peer, &reply) {
        Ok(true) => {
            info!(node = shared.id, term = args.term, "won election");
            let _ = shared.persist(&mut inner);
            spawn_leader(&shared, args.term);
        }
        Ok(false) => {}
        Err(err) => {
            debug!(node = shared.id, peer, error = %err, "vote reply carried a newer term");
            let _ = shared.persist(&mut inner);
        }
    }
    shared.after_step(&inner, before);
}

// -- replication --

fn spawn_leader(shared: &Arc<Shared>, term: Term) {
    tokio::spawn(run_leader_loop(shared.clone(), term));
}

/// Heartbeat fan-out for one term of leadership
async fn run_leader_loop(shared: Arc<Shared>, term: Term) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut ticker = time::interval(shared.config.heartbeat());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {}
            _ = shared.replicate_now.notified() => {}
        }
        let targets: Vec<NodeId> = {
            let mut inner = shared.inner.lock();
            if inner.stopped || !inner.raft.is_leader() || inner.raft.current_term != term {
                break;
            }
            if inner.halted {
                continue;
            }
            let idle: Vec<NodeId> = shared
                .peers
                .iter()
                .copied()
                .filter(|peer| !inner.replicating.contains(peer))
                .collect();
            inner.replicating.extend(idle.iter().copied());
            idle
        };
        for peer in targets {
            tokio::spawn(replicate_to(shared.clone(), peer, term));
        }
    }
    debug!(node = shared.id, term, "leader loop stopped");
}

async fn replicate_to(shared: Arc<Shared>, peer: NodeId, term: Term) {
    replicate_rounds(&shared, peer, term).await;
    shared.inner.lock().replicating.remove(&peer);
}

/// Send AppendEntries to `peer` until it has caught up, backs off, or the
/// term ends
async fn replicate_rounds(shared: &Arc<Shared>, peer: NodeId, term: Term) {
    loop {
        let args = {
            let inner = shared.inner.lock();
            if inner.stopped || inner.halted || inner.raft.current_term != term {
                return;
            }
            match inner.raft.create_append_entries(peer) {
                Some(args) => args,
                None => return,
            }
        };
        let sent_next = args.prev_log_index + 1;

        let transport = shared.transport.clone();
        let result = with_retries(
            &shared.config,
            peer,
            "append_entries",
            || shared.still_acting_as(NodeState::Leader, term),
            move || {
                let transport = transport.clone();
                let request = args.clone();
                async move { transport.send_append_entries(peer, request).await }
            },
        )
        .await;
        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                debug!(
                    node = shared.id,
                    peer,
                    term,
                    error = %err,
                    "append entries round abandoned"
                );
                return;
            }
        };

        let mut inner = shared.inner.lock();
        if inner.stopped {
            return;
        }
        if reply.term <= inner.raft.current_term && inner.raft.current_term != term {
            return;
        }
        let before = inner.snapshot();
        match inner.raft.handle_append_entries_response(peer, &reply) {
            Ok(true) => {
                debug!(
                    node = shared.id,
                    term,
                    commit_index = inner.raft.commit_index,
                    "commit index advanced"
                );
            }
            Ok(false) => {}
            Err(err) => {
                info!(node = shared.id, peer, error = %err, "follower reported a newer term");
                let _ = shared.persist(&mut inner);
                shared.after_step(&inner, before);
                return;
            }
        }
        shared.after_step(&inner, before);

        let more = if reply.success {
            inner.raft.has_pending_entries(peer)
        } else {
            let next = inner.raft.next_index.get(&peer).copied().unwrap_or(sent_next);
            if next < sent_next {
                debug!(
                    node = shared.id,
                    peer,
                    next_index = next,
                    "follower log diverges, backing up"
                );
            }
            next < sent_next
        };
        if !more {
            return;
        }
    }
}

// -- applying --

async fn run_apply_loop<A: Applier>(shared: Arc<Shared>, mut applier: A) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            _ = shared.apply_ready.notified() => {}
        }
        loop {
            let entries = {
                let mut inner = shared.inner.lock();
                if inner.stopped || inner.halted {
                    break;
                }
                inner.raft.get_entries_to_apply()
            };
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                let output = if entry.is_noop() {
                    None
                } else {
                    let output = applier.apply(entry.index, &entry.command);
                    debug!(
                        node = shared.id,
                        index = entry.index,
                        term = entry.term,
                        "applied entry"
                    );
                    Some(output)
                };
                shared.resolve(&entry, output);
            }
        }
    }
    debug!(node = shared.id, "apply loop stopped");
}
