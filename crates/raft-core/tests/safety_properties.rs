//! # safety properties
//!
//! why: the raft guarantees must hold under any message schedule, not just the happy path
//! relations: drives several RaftNode instances through an in-test message pool
//! what: proptest over random timeouts, proposals, drops, duplicates, reorders and restarts

use std::collections::HashMap;

use proptest::prelude::*;
use proptest::sample::Index;
use raft_core::{LogEntry, LogIndex, NodeId, RaftMessage, RaftNode, Term};

#[derive(Debug, Clone)]
enum Action {
    Timeout(Index),
    Heartbeat(Index),
    Propose(Index, u8),
    Deliver(Index),
    Drop(Index),
    Duplicate(Index),
    Restart(Index),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        1 => any::<Index>().prop_map(Action::Timeout),
        2 => any::<Index>().prop_map(Action::Heartbeat),
        2 => (any::<Index>(), any::<u8>()).prop_map(|(i, b)| Action::Propose(i, b)),
        8 => any::<Index>().prop_map(Action::Deliver),
        1 => any::<Index>().prop_map(Action::Drop),
        1 => any::<Index>().prop_map(Action::Duplicate),
        1 => any::<Index>().prop_map(Action::Restart),
    ]
}

#[derive(Debug, Clone)]
struct Envelope {
    from: NodeId,
    to: NodeId,
    msg: RaftMessage,
}

struct Cluster {
    nodes: Vec<RaftNode>,
    pool: Vec<Envelope>,
    leaders_by_term: HashMap<Term, NodeId>,
    applied: HashMap<LogIndex, LogEntry>,
    last_commit: Vec<LogIndex>,
    leader_logs: HashMap<NodeId, (Term, Vec<LogEntry>)>,
}

impl Cluster {
    fn new(size: u64) -> Self {
        let ids: Vec<NodeId> = (1..=size).collect();
        Self {
            nodes: ids.iter().map(|id| RaftNode::new(*id, ids.clone())).collect(),
            pool: Vec::new(),
            leaders_by_term: HashMap::new(),
            applied: HashMap::new(),
            last_commit: vec![0; size as usize],
            leader_logs: HashMap::new(),
        }
    }

    fn node(&mut self, id: NodeId) -> &mut RaftNode {
        &mut self.nodes[(id - 1) as usize]
    }

    fn campaign(&mut self, slot: usize) {
        let node = &mut self.nodes[slot];
        if node.is_leader() {
            return;
        }
        let args = node.start_election();
        let from = node.id;
        let peers: Vec<NodeId> = node.peers().collect();
        for to in peers {
            self.pool.push(Envelope {
                from,
                to,
                msg: RaftMessage::VoteRequest(args.clone()),
            });
        }
    }

    fn broadcast_append(&mut self, slot: usize) {
        let leader = &self.nodes[slot];
        let from = leader.id;
        let batch: Vec<Envelope> = leader
            .peers()
            .filter_map(|to| {
                leader.create_append_entries(to).map(|args| Envelope {
                    from,
                    to,
                    msg: RaftMessage::AppendEntries(args),
                })
            })
            .collect();
        self.pool.extend(batch);
    }

    fn step(&mut self, action: Action) {
        let len = self.nodes.len();
        match action {
            Action::Timeout(i) => self.campaign(i.index(len)),
            Action::Heartbeat(i) => self.broadcast_append(i.index(len)),
            Action::Propose(i, byte) => {
                let node = &mut self.nodes[i.index(len)];
                // zero-length commands are reserved for leader no-ops
                let _ = node.append_entry(vec![byte, 1]);
            }
            Action::Deliver(i) => {
                if !self.pool.is_empty() {
                    let envelope = self.pool.swap_remove(i.index(self.pool.len()));
                    self.deliver(envelope);
                }
            }
            Action::Drop(i) => {
                if !self.pool.is_empty() {
                    self.pool.swap_remove(i.index(self.pool.len()));
                }
            }
            Action::Duplicate(i) => {
                if !self.pool.is_empty() {
                    let copy = self.pool[i.index(self.pool.len())].clone();
                    self.pool.push(copy);
                }
            }
            Action::Restart(i) => {
                let slot = i.index(len);
                let old = &self.nodes[slot];
                let restored = RaftNode::restore(
                    old.id,
                    old.cluster_nodes.clone(),
                    old.config.clone(),
                    old.persistent_state(),
                );
                self.leader_logs.remove(&restored.id);
                self.nodes[slot] = restored;
            }
        }
    }

    fn deliver(&mut self, envelope: Envelope) {
        let Envelope { from, to, msg } = envelope;
        let reply = match msg {
            RaftMessage::VoteRequest(args) => {
                let (reply, _) = self.node(to).handle_vote_request(&args);
                Some(RaftMessage::VoteResponse(reply))
            }
            RaftMessage::VoteResponse(reply) => {
                let _ = self.node(to).handle_vote_response(from, &reply);
                None
            }
            RaftMessage::AppendEntries(args) => {
                let (reply, _) = self.node(to).handle_append_entries(&args);
                Some(RaftMessage::AppendEntriesResponse(reply))
            }
            RaftMessage::AppendEntriesResponse(reply) => {
                let _ = self.node(to).handle_append_entries_response(from, &reply);
                None
            }
        };
        if let Some(msg) = reply {
            self.pool.push(Envelope { from: to, to: from, msg });
        }
    }

    fn check_invariants(&mut self) -> Result<(), TestCaseError> {
        for node in &mut self.nodes {
            node.mark_persisted();
        }

        // election safety: at most one leader per term
        for node in &self.nodes {
            if node.is_leader() {
                let winner = *self.leaders_by_term.entry(node.current_term).or_insert(node.id);
                prop_assert_eq!(winner, node.id, "two leaders in term {}", node.current_term);
            }
        }

        // leader append-only: a sitting leader only extends its log
        for node in &self.nodes {
            if !node.is_leader() {
                self.leader_logs.remove(&node.id);
                continue;
            }
            if let Some((term, before)) = self.leader_logs.get(&node.id) {
                if *term == node.current_term {
                    prop_assert!(node.log.len() >= before.len());
                    prop_assert_eq!(&node.log[..before.len()], &before[..]);
                }
            }
            self.leader_logs
                .insert(node.id, (node.current_term, node.log.clone()));
        }

        // log matching: same index and term implies identical prefixes
        for a in &self.nodes {
            for b in &self.nodes {
                if a.id >= b.id {
                    continue;
                }
                let shared = a.log.len().min(b.log.len());
                for i in (0..shared).rev() {
                    if a.log[i].term == b.log[i].term {
                        prop_assert_eq!(&a.log[..=i], &b.log[..=i]);
                        break;
                    }
                }
            }
        }

        // commit index never moves backwards
        for (slot, node) in self.nodes.iter().enumerate() {
            prop_assert!(node.commit_index >= self.last_commit[slot]);
            prop_assert!(node.commit_index <= node.last_log_index());
            self.last_commit[slot] = node.commit_index;
        }

        // state machine safety: every node applies the same entry at an index
        for node in &mut self.nodes {
            for entry in node.get_entries_to_apply() {
                let first = self.applied.entry(entry.index).or_insert_with(|| entry.clone());
                prop_assert_eq!(&*first, &entry, "divergent apply at {}", entry.index);
            }
        }
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn raft_safety_holds_under_arbitrary_schedules(
        size in 3u64..=5,
        actions in prop::collection::vec(action(), 1..400),
    ) {
        let mut cluster = Cluster::new(size);
        for action in actions {
            cluster.step(action);
            cluster.check_invariants()?;
        }
    }
}

#[test]
fn reliable_schedule_elects_and_commits_everywhere() {
    let mut cluster = Cluster::new(3);
    cluster.campaign(0);
    drain(&mut cluster);
    assert!(cluster.nodes[0].is_leader());

    cluster.nodes[0].append_entry(b"x".to_vec()).unwrap();
    cluster.broadcast_append(0);
    drain(&mut cluster);
    // a second round carries the new commit index to followers
    cluster.broadcast_append(0);
    drain(&mut cluster);

    for node in &cluster.nodes {
        assert_eq!(node.commit_index, 2, "node {}", node.id);
        assert_eq!(node.get_entry(2).unwrap().command, b"x".to_vec());
    }
}

fn drain(cluster: &mut Cluster) {
    while let Some(envelope) = cluster.pool.pop() {
        cluster.deliver(envelope);
    }
}
