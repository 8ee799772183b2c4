use std::collections::{HashMap, HashSet};

use crate::protos::*;

/// Per-server replication bookkeeping maintained only while we are the leader
pub struct ServerProgress {
	/// Next log index we will attempt to send to this server
	pub next_index: LogIndex,

	/// Highest log index known to be safely replicated on this server
	pub match_index: LogIndex
}

impl ServerProgress {
	pub fn new(last_log_index: LogIndex) -> Self {
		ServerProgress {
			next_index: last_log_index + 1,
			match_index: 0
		}
	}
}

pub struct ServerFollowerState {
	/// Id of the last server we saw a valid append from
	/// Used as a redirect hint for clients that reach the wrong server
	pub last_leader_id: Option<ServerId>
}

pub struct ServerCandidateState {
	/// Servers that granted us a vote in this election round, not counting
	/// ourselves. A set so a duplicated reply can not double count.
	pub votes_received: HashSet<ServerId>
}

pub struct ServerLeaderState {
	/// Progress for every server in the cluster including ourselves
	pub servers: HashMap<ServerId, ServerProgress>
}

pub enum ServerState {
	Follower(ServerFollowerState),
	Candidate(ServerCandidateState),
	Leader(ServerLeaderState)
}

impl ServerState {
	pub fn new_follower() -> ServerState {
		ServerState::Follower(ServerFollowerState { last_leader_id: None })
	}

	pub fn is_leader(&self) -> bool {
		match self {
			ServerState::Leader(_) => true,
			_ => false
		}
	}
}
