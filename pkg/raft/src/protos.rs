/// Type used to uniquely identify each server in the cluster. The full set of
/// ids is fixed at construction time and every server knows the same ordered
/// set.
pub type ServerId = u64;

pub type Term = u64;

pub type LogIndex = u64;

/// Persistent information describing the state of the current server
/// Must be durable before any response that depends on it goes out
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Metadata {
	/// Latest term this server has seen (starts at 0)
	pub current_term: Term,

	/// The id of the server that we have voted for in the current term
	pub voted_for: Option<ServerId>
}

impl Default for Metadata {
	fn default() -> Self {
		Metadata {
			current_term: 0,
			voted_for: None
		}
	}
}

/// A single slot in the replicated log
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
	pub term: Term,

	/// Opaque payload handed to the state machine once the entry commits
	pub command: Vec<u8>
}

/// Everything that must survive a restart, as one atomically persisted unit
/// The placeholder at index 0 is part of the persisted entry sequence
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PersistentState {
	pub meta: Metadata,
	pub entries: Vec<LogEntry>
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestVoteRequest {
	pub term: Term,
	pub candidate_id: ServerId,
	pub last_log_index: LogIndex,
	pub last_log_term: Term
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestVoteResponse {
	pub term: Term,
	pub vote_granted: bool
}

/// NOTE: The entries are assumed to sequentially follow prev_log_index
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppendEntriesRequest {
	pub term: Term,
	pub leader_id: ServerId,
	pub prev_log_index: LogIndex,
	pub prev_log_term: Term,

	/// Empty for a pure heartbeat
	pub entries: Vec<LogEntry>,

	pub leader_commit: LogIndex
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppendEntriesResponse {
	pub term: Term,
	pub success: bool,

	/// On failure, the term of the entry the follower holds at the conflicting
	/// position. On success, the term of the last entry in the follower's log.
	pub conflict_term: Term,

	/// On failure, the index the leader should back up to. On success, the last
	/// index now stored on the follower (the leader's new match index for it).
	pub first_index: LogIndex
}

/// Record emitted on the apply channel once an entry has been committed
/// valid is true for normal command delivery
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyEntry {
	pub valid: bool,
	pub index: LogIndex,
	pub command: Vec<u8>
}
