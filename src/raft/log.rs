use serde::{Deserialize, Serialize};

use crate::state::Command;

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    /// Client-supplied id used for apply-time deduplication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub command: Command,
}

/// What changed since storage last looked at the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogChange {
    None,
    /// Entries from this index onward were appended.
    AppendedFrom(u64),
    /// The log was truncated or compacted; the file must be rewritten.
    Rewrite,
}

/// In-memory log with a compacted prefix.
///
/// Indices start at 1. Everything up to and including `offset` has been
/// folded into a snapshot; `offset_term` is the term of that last entry.
#[derive(Debug, Clone)]
pub struct ReplicatedLog {
    entries: Vec<LogEntry>,
    offset: u64,
    offset_term: u64,
    change: LogChange,
}

impl ReplicatedLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            offset: 0,
            offset_term: 0,
            change: LogChange::None,
        }
    }

    /// Rebuild from persisted parts. Entries at or below `offset` are dropped.
    pub fn restore(offset: u64, offset_term: u64, entries: Vec<LogEntry>) -> Self {
        let mut entries: Vec<LogEntry> = entries.into_iter().filter(|e| e.index > offset).collect();
        // Keep only a contiguous run starting right after the offset.
        let contiguous = entries
            .iter()
            .enumerate()
            .take_while(|(i, e)| e.index == offset + 1 + *i as u64)
            .count();
        entries.truncate(contiguous);
        Self {
            entries,
            offset,
            offset_term,
            change: LogChange::None,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn offset_term(&self) -> u64 {
        self.offset_term
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn last_index(&self) -> u64 {
        self.offset + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.offset_term)
    }

    /// Term of the entry at `index`; known for the compaction point but not before it.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.offset {
            return Some(self.offset_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.offset {
            return None;
        }
        self.entries.get((index - self.offset - 1) as usize)
    }

    /// Up to `max` entries starting at `start` (inclusive).
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        let start = start.max(self.offset + 1);
        let skip = (start - self.offset - 1) as usize;
        if skip >= self.entries.len() {
            return Vec::new();
        }
        self.entries[skip..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    /// Append a new entry as leader and return its index.
    pub fn append(&mut self, term: u64, request_id: Option<String>, command: Command) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            term,
            index,
            request_id,
            command,
        });
        self.mark_appended(index);
        index
    }

    /// Merge entries received from the leader.
    ///
    /// Existing entries that agree are kept; the log is truncated only at the
    /// first conflicting term, so a delayed AppendEntries never erases newer
    /// entries.
    pub fn append_from_leader(&mut self, entries: Vec<LogEntry>) {
        for entry in entries {
            if entry.index <= self.offset {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                }
                None => {}
            }
            if entry.index == self.last_index() + 1 {
                let index = entry.index;
                self.entries.push(entry);
                self.mark_appended(index);
            }
        }
    }

    /// Remove every entry at or after `index`.
    pub fn truncate_from(&mut self, index: u64) {
        let index = index.max(self.offset + 1);
        let keep = (index - self.offset - 1) as usize;
        if keep < self.entries.len() {
            self.entries.truncate(keep);
            self.change = LogChange::Rewrite;
        }
    }

    /// Drop entries up to and including `index` after a local snapshot.
    pub fn compact_to(&mut self, index: u64) {
        if index <= self.offset || index > self.last_index() {
            return;
        }
        let term = self.term_at(index).unwrap_or(self.offset_term);
        let drop = (index - self.offset) as usize;
        self.entries.drain(..drop);
        self.offset = index;
        self.offset_term = term;
        self.change = LogChange::Rewrite;
    }

    /// Align the log with an installed snapshot.
    ///
    /// A matching entry at the snapshot point keeps the suffix after it;
    /// otherwise the whole log is discarded.
    pub fn reset_to_snapshot(&mut self, index: u64, term: u64) {
        if self.term_at(index) == Some(term) && index <= self.last_index() {
            self.compact_to(index);
            return;
        }
        self.entries.clear();
        self.offset = index;
        self.offset_term = term;
        self.change = LogChange::Rewrite;
    }

    /// Report and clear the pending change.
    pub fn take_change(&mut self) -> LogChange {
        std::mem::replace(&mut self.change, LogChange::None)
    }

    /// Force the next save to rewrite the whole file, e.g. after a failed append.
    pub fn require_rewrite(&mut self) {
        self.change = LogChange::Rewrite;
    }

    fn mark_appended(&mut self, index: u64) {
        self.change = match self.change {
            LogChange::None => LogChange::AppendedFrom(index),
            LogChange::AppendedFrom(from) => LogChange::AppendedFrom(from.min(index)),
            LogChange::Rewrite => LogChange::Rewrite,
        };
    }
}

impl Default for ReplicatedLog {
    fn default() -> Self {
        Self::new()
    }
}
