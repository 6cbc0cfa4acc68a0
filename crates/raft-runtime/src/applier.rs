//! # applier
//!
//! why: committed commands leave consensus through one narrow hook
//! relations: called by the apply loop in node.rs, strictly in log order
//! what: Applier trait, CommandLog recorder

use std::sync::Arc;

use parking_lot::Mutex;
use raft_core::LogIndex;

/// The downstream state machine.
///
/// `apply` is called exactly once per committed, non-empty entry, in index
/// order, and must return in bounded time.
pub trait Applier: Send + 'static {
    /// Apply a committed command; the returned bytes answer the proposer
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Vec<u8>;

    /// Highest index already reflected in this state machine when the node
    /// starts. Entries up to it are not applied again.
    fn applied_index(&self) -> LogIndex {
        0
    }
}

/// Records every applied command and echoes it back as the output.
///
/// Clones share the same record, so a test can keep one and hand the
/// other to the node.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    entries: Arc<Mutex<Vec<(LogIndex, Vec<u8>)>>>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of `(index, command)` pairs in apply order
    pub fn entries(&self) -> Vec<(LogIndex, Vec<u8>)> {
        self.entries.lock().clone()
    }

    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.entries.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Applier for CommandLog {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Vec<u8> {
        self.entries.lock().push((index, command.to_vec()));
        command.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_record() {
        let log = CommandLog::new();
        let mut handed_out = log.clone();

        let output = handed_out.apply(3, b"set x");

        assert_eq!(output, b"set x".to_vec());
        assert_eq!(log.entries(), vec![(3, b"set x".to_vec())]);
        assert_eq!(handed_out.applied_index(), 0);
    }
}
