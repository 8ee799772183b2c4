use std::cmp;

use crate::protos::*;

/// In-memory copy of the replicated log
///
/// Index 0 always holds a placeholder entry with term 0 so that the
/// consistency check has a well defined predecessor for the first real entry
/// and the backup scan terminates without a boundary case. Client visible
/// indexes therefore start at 1.
pub struct Log {
	entries: Vec<LogEntry>
}

impl Log {
	pub fn new() -> Log {
		Log {
			entries: vec![LogEntry { term: 0, command: Vec::new() }]
		}
	}

	/// Restores a log from a previously persisted entry sequence
	pub fn from_entries(entries: Vec<LogEntry>) -> Log {
		assert!(!entries.is_empty() && entries[0].term == 0);
		Log { entries }
	}

	/// Total number of slots including the placeholder
	pub fn len(&self) -> LogIndex {
		self.entries.len() as LogIndex
	}

	pub fn last_index(&self) -> LogIndex {
		self.len() - 1
	}

	pub fn last_term(&self) -> Term {
		self.entries[self.entries.len() - 1].term
	}

	pub fn term(&self, index: LogIndex) -> Option<Term> {
		self.entries.get(index as usize).map(|e| e.term)
	}

	pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
		self.entries.get(index as usize)
	}

	pub fn append(&mut self, entry: LogEntry) {
		self.entries.push(entry);
	}

	/// Drops every entry at and after the given index
	/// The placeholder can never be removed
	pub fn truncate_suffix(&mut self, start: LogIndex) {
		assert!(start >= 1);
		self.entries.truncate(start as usize);
	}

	/// Clones the entries in the inclusive index range, clamped to the end of
	/// the log. Empty whenever from > to.
	pub fn range(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
		let to = cmp::min(to, self.last_index());
		if from > to {
			return Vec::new();
		}

		self.entries[from as usize..=to as usize].to_vec()
	}

	/// All entries from the given index through the end of the log
	pub fn entries_from(&self, from: LogIndex) -> Vec<LogEntry> {
		self.range(from, self.last_index())
	}

	/// First index of the contiguous run of the given term that ends at upto
	/// This is the backup hint a follower hands to a rejected leader
	pub fn first_index_in_term(&self, upto: LogIndex, term: Term) -> LogIndex {
		let mut first = 1;
		let mut i = upto;
		while i > 0 {
			if self.entries[i as usize].term != term {
				first = i + 1;
				break;
			}

			i -= 1;
		}

		first
	}

	/// Highest index holding an entry of the given term, if any
	/// Used by the leader to decide how far to back up a lagging follower
	pub fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
		for i in (1..=self.last_index()).rev() {
			if self.entries[i as usize].term == term {
				return Some(i);
			}
		}

		None
	}

	/// Snapshot of the full entry sequence for persistence
	pub fn to_entries(&self) -> Vec<LogEntry> {
		self.entries.clone()
	}
}
