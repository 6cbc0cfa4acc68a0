//! # raft-runtime
//!
//! why: run a raft-core node for real, with clocks, peers and a state machine attached
//! relations: drives raft-core under one lock, persists through raft-storage, talks to peers via transport
//! what: spawn_node/NodeHandle, election timer, Transport trait with local and tcp impls, Applier

pub mod applier;
pub mod node;
pub mod timer;
pub mod transport;

pub use applier::{Applier, CommandLog};
pub use node::{spawn_node, NodeHandle, NodeStatus, Proposal};
pub use timer::ElectionTimer;
pub use transport::local::{LocalNetwork, LocalTransport};
pub use transport::tcp::{serve, TcpTransport};
pub use transport::{Transport, TransportError};
