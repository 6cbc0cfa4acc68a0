//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted via raft-storage
//! what: LogEntry struct, log consistency checking, conflict truncation, term lookups

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::{LogIndex, Term};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: LogIndex,
    /// Opaque command handed to the applier; empty for leader no-ops
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }

    /// Entries with no command are written by a new leader and never applied
    pub fn is_noop(&self) -> bool {
        self.command.is_empty()
    }
}

pub fn last_index(log: &[LogEntry]) -> LogIndex {
    log.len() as LogIndex
}

pub fn last_term(log: &[LogEntry]) -> Term {
    log.last().map(|e| e.term).unwrap_or(0)
}

/// Term of the entry at `index`, 0 when absent (including index 0)
pub fn term_at(log: &[LogEntry], index: LogIndex) -> Term {
    entry_at(log, index).map(|e| e.term).unwrap_or(0)
}

pub fn entry_at(log: &[LogEntry], index: LogIndex) -> Option<&LogEntry> {
    if index == 0 {
        return None;
    }
    log.get((index - 1) as usize)
}

/// Log-matching check for an AppendEntries probe
pub fn check_consistency(
    log: &[LogEntry],
    prev_log_index: LogIndex,
    prev_log_term: Term,
) -> Result<()> {
    if prev_log_index == 0 {
        return Ok(());
    }
    match entry_at(log, prev_log_index) {
        Some(entry) if entry.term == prev_log_term => Ok(()),
        _ => Err(RaftError::LogInconsistency {
            prev_log_index,
            prev_log_term,
        }),
    }
}

/// First index holding an entry of `term`
pub fn first_index_of_term(log: &[LogEntry], term: Term) -> Option<LogIndex> {
    log.iter().find(|e| e.term == term).map(|e| e.index)
}

/// Last index holding an entry of `term`
pub fn last_index_of_term(log: &[LogEntry], term: Term) -> Option<LogIndex> {
    log.iter().rev().find(|e| e.term == term).map(|e| e.index)
}

/// Merge `entries` (which start right after `prev_log_index`) into `log`.
///
/// Entries already present with the same term are skipped. At the first
/// term conflict the local suffix is truncated and the remainder appended.
/// A stale or duplicated batch therefore never removes newer matching entries.
///
/// Returns true when the log was modified.
pub fn merge_entries(
    log: &mut Vec<LogEntry>,
    prev_log_index: LogIndex,
    entries: &[LogEntry],
) -> bool {
    for (offset, entry) in entries.iter().enumerate() {
        let index = prev_log_index + 1 + offset as LogIndex;
        match entry_at(log, index) {
            Some(existing) if existing.term == entry.term => continue,
            Some(_) => log.truncate((index - 1) as usize),
            None => {}
        }
        log.extend(entries[offset..].iter().enumerate().map(|(i, e)| LogEntry {
            term: e.term,
            index: index + i as LogIndex,
            command: e.command.clone(),
        }));
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_of(terms: &[Term]) -> Vec<LogEntry> {
        terms
            .iter()
            .enumerate()
            .map(|(i, t)| LogEntry::new(*t, i as LogIndex + 1, vec![i as u8 + 1]))
            .collect()
    }

    #[test]
    fn empty_log_is_always_consistent_at_zero() {
        assert!(check_consistency(&[], 0, 0).is_ok());
        assert!(check_consistency(&[], 1, 1).is_err());
    }

    #[test]
    fn merge_skips_matching_prefix() {
        let mut log = log_of(&[1, 1, 2]);
        let changed = merge_entries(&mut log, 0, &log_of(&[1, 1]));
        assert!(!changed);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn merge_truncates_at_first_conflict() {
        let mut log = log_of(&[1, 1, 1, 1]);
        let incoming = vec![LogEntry::new(3, 3, b"new".to_vec())];
        assert!(merge_entries(&mut log, 2, &incoming));
        assert_eq!(log.len(), 3);
        assert_eq!(log[2].term, 3);
        assert_eq!(log[2].command, b"new".to_vec());
    }

    #[test]
    fn merge_appends_past_the_end() {
        let mut log = log_of(&[1]);
        assert!(merge_entries(&mut log, 1, &[LogEntry::new(1, 2, vec![9])]));
        assert_eq!(last_index(&log), 2);
        assert_eq!(log[1].index, 2);
    }

    #[test]
    fn term_lookups() {
        let log = log_of(&[1, 2, 2, 4]);
        assert_eq!(first_index_of_term(&log, 2), Some(2));
        assert_eq!(last_index_of_term(&log, 2), Some(3));
        assert_eq!(last_index_of_term(&log, 3), None);
        assert_eq!(term_at(&log, 0), 0);
        assert_eq!(last_term(&log), 4);
    }
}
