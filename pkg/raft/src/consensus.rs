use std::cmp;
use std::collections::{HashMap, HashSet};

use crate::log::*;
use crate::protos::*;
use crate::state::*;

/// Position in the log that a proposed command will occupy if it ever commits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Proposal {
	pub term: Term,
	pub index: LogIndex
}

/// On success, the entry has been accepted and may eventually be committed at
/// the given proposal position
pub type ProposeResult = std::result::Result<Proposal, ProposeError>;

#[derive(Debug, PartialEq)]
pub enum ProposeError {
	/// The entry can't be proposed by this server because we are not the
	/// current leader
	NotLeader { leader_hint: Option<ServerId> }
}

/// External side effects requested by the consensus module during a single
/// locked operation
///
/// The caller executes these after the state mutation: persistence must be
/// completed before any response produced by the same operation is released,
/// and before any request derived from the new state goes out.
#[derive(Debug)]
pub struct Tick {
	/// The persistent state changed and must be made durable
	pub persist: bool,

	/// The election timer should be re-armed with a fresh random timeout
	pub reset_timer: bool,

	/// The commit index advanced, so the apply pump has work to do
	pub committed: bool,

	/// We just won an election and the replication loop must be started
	pub leader_elected: bool
}

impl Tick {
	pub fn empty() -> Self {
		Tick {
			persist: false,
			reset_timer: false,
			committed: false,
			leader_elected: false
		}
	}

	pub fn write_state(&mut self) {
		self.persist = true;
	}
}

/// The protocol state machine of a single peer
///
/// All methods assume the caller holds the one mutex wrapping this module; no
/// method blocks. Anything long-latency (sending, persisting, emitting to the
/// apply channel) is requested through the returned values and the Tick and
/// performed by the surrounding server.
pub struct ConsensusModule {
	/// Id of the current server we are representing
	id: ServerId,

	/// Ids of every server in the cluster, ourselves included. Fixed for the
	/// lifetime of the cluster.
	peers: Vec<ServerId>,

	meta: Metadata,

	log: Log,

	/// Highest log index known to be committed
	commit_index: LogIndex,

	/// Highest log index handed to the apply pump
	last_applied: LogIndex,

	state: ServerState
}

impl ConsensusModule {
	/// Creates a module from the given persisted state, or a fresh one when no
	/// state survived
	pub fn new(id: ServerId, peers: Vec<ServerId>, restored: Option<PersistentState>) -> ConsensusModule {
		assert!(peers.contains(&id));

		let (meta, log) = match restored {
			Some(state) => (state.meta, Log::from_entries(state.entries)),
			None => (Metadata::default(), Log::new())
		};

		ConsensusModule {
			id,
			peers,
			meta,
			log,
			commit_index: 0,
			last_applied: 0,
			state: ServerState::new_follower()
		}
	}

	pub fn id(&self) -> ServerId {
		self.id
	}

	pub fn meta(&self) -> &Metadata {
		&self.meta
	}

	pub fn is_leader(&self) -> bool {
		self.state.is_leader()
	}

	pub fn commit_index(&self) -> LogIndex {
		self.commit_index
	}

	pub fn last_applied(&self) -> LogIndex {
		self.last_applied
	}

	/// Snapshot of everything that must be durable
	pub fn persisted(&self) -> PersistentState {
		PersistentState {
			meta: self.meta.clone(),
			entries: self.log.to_entries()
		}
	}

	/// Number of votes required to get anything done
	fn majority_size(&self) -> usize {
		(self.peers.len() / 2) + 1
	}

	/// Run against the term carried by every incoming request and response.
	/// Observing a higher term immediately demotes us to a follower at that
	/// term with our vote cleared.
	fn observe_term(&mut self, term: Term, tick: &mut Tick) {
		if term > self.meta.current_term {
			self.meta.current_term = term;
			self.meta.voted_for = None;
			tick.write_state();

			self.become_follower(tick);
		}
	}

	fn become_follower(&mut self, tick: &mut Tick) {
		let last_leader_id = match self.state {
			ServerState::Follower(ref s) => s.last_leader_id,
			_ => None
		};

		self.state = ServerState::Follower(ServerFollowerState { last_leader_id });
		tick.reset_timer = true;
	}

	/// Reinitializes the per-server bookkeeping and assumes leadership of the
	/// current term
	fn become_leader(&mut self, tick: &mut Tick) {
		let last_log_index = self.log.last_index();

		let mut servers = HashMap::new();
		for id in self.peers.iter() {
			let mut progress = ServerProgress::new(last_log_index);
			if *id == self.id {
				// Our own copy of the log already extends to the tail
				progress.match_index = last_log_index;
			}

			servers.insert(*id, progress);
		}

		info!("server {}: won the election for term {}", self.id, self.meta.current_term);

		self.state = ServerState::Leader(ServerLeaderState { servers });

		// The new leader must not let its own election timer fire either
		tick.reset_timer = true;
		tick.leader_elected = true;
	}

	/// Called by the election activity when no valid leader traffic arrived in
	/// time. Makes us a candidate in the next term and produces the vote
	/// solicitation to broadcast; None when we are already the leader.
	pub fn start_election(&mut self, tick: &mut Tick) -> Option<RequestVoteRequest> {
		if self.state.is_leader() {
			return None;
		}

		self.meta.current_term += 1;
		self.meta.voted_for = Some(self.id);
		self.state = ServerState::Candidate(ServerCandidateState {
			votes_received: HashSet::new()
		});
		tick.write_state();

		info!("server {}: starting election for term {}", self.id, self.meta.current_term);

		let req = RequestVoteRequest {
			term: self.meta.current_term,
			candidate_id: self.id,
			last_log_index: self.log.last_index(),
			last_log_term: self.log.last_term()
		};

		// A cluster of one has its majority already
		if self.peers.len() == 1 {
			self.become_leader(tick);
		}

		Some(req)
	}

	/// Called when another server asks us to vote for it
	pub fn request_vote(&mut self, req: &RequestVoteRequest, tick: &mut Tick) -> RequestVoteResponse {
		self.observe_term(req.term, tick);

		if req.term < self.meta.current_term {
			return RequestVoteResponse {
				term: self.meta.current_term,
				vote_granted: false
			};
		}

		let vote_available = match self.meta.voted_for {
			Some(id) => id == req.candidate_id,
			None => true
		};

		// The candidate must know at least as much of the committed history as
		// we do: a higher last term, or the same last term and no shorter a log
		let up_to_date = req.last_log_term > self.log.last_term()
			|| (req.last_log_term == self.log.last_term()
				&& req.last_log_index >= self.log.last_index());

		if !vote_available || !up_to_date {
			debug!("server {}: refusing vote for {} in term {}",
				self.id, req.candidate_id, self.meta.current_term);

			return RequestVoteResponse {
				term: self.meta.current_term,
				vote_granted: false
			};
		}

		self.meta.voted_for = Some(req.candidate_id);
		tick.write_state();
		tick.reset_timer = true;

		debug!("server {}: voting for {} in term {}",
			self.id, req.candidate_id, self.meta.current_term);

		RequestVoteResponse {
			term: self.meta.current_term,
			vote_granted: true
		}
	}

	/// Handles one reply to a vote solicitation we broadcast in req_term
	pub fn request_vote_callback(
		&mut self, from_id: ServerId, req_term: Term, resp: RequestVoteResponse, tick: &mut Tick
	) {
		self.observe_term(resp.term, tick);

		// Stale: the election this reply belongs to is already over
		if self.meta.current_term != req_term {
			return;
		}

		if from_id == self.id {
			return;
		}

		let majority = self.majority_size();

		let won = match self.state {
			ServerState::Candidate(ref mut s) => {
				if resp.vote_granted {
					s.votes_received.insert(from_id);
				}

				1 + s.votes_received.len() >= majority
			},
			_ => false
		};

		if won {
			self.become_leader(tick);
		}
	}

	/// Called when the leader of the given term (or something claiming to be)
	/// asks us to append entries or just to acknowledge its authority
	pub fn append_entries(&mut self, req: &AppendEntriesRequest, tick: &mut Tick) -> AppendEntriesResponse {
		self.observe_term(req.term, tick);

		if req.term < self.meta.current_term {
			// Not the current leader; our term in the reply will demote it
			return AppendEntriesResponse {
				term: self.meta.current_term,
				success: false,
				conflict_term: 0,
				first_index: 0
			};
		}

		// An equal-term append can only come from the one legitimate leader of
		// this term, so a candidate (or a stale leader) stands down
		match self.state {
			ServerState::Follower(_) => {},
			_ => self.become_follower(tick)
		};

		if let ServerState::Follower(ref mut s) = self.state {
			s.last_leader_id = Some(req.leader_id);
		}

		// Acknowledge the leader so that a restart remembers who we deferred to
		// in this term
		if self.meta.voted_for != Some(req.leader_id) {
			self.meta.voted_for = Some(req.leader_id);
			tick.write_state();
		}

		// Even if the consistency check below fails, the sender is the
		// legitimate current-term leader
		tick.reset_timer = true;

		let matched = match self.log.term(req.prev_log_index) {
			Some(term) => term == req.prev_log_term,
			None => false
		};

		if !matched {
			let (conflict_term, first_index) = match self.log.term(req.prev_log_index) {
				// We hold a different entry at the previous position; point the
				// leader at the start of our conflicting term's run
				Some(term) => (term, self.log.first_index_in_term(req.prev_log_index, term)),

				// Our log is too short; ask the leader to back up to our tail
				None => (self.log.last_term(), self.log.len())
			};

			debug!("server {}: append from {} rejected (conflict term {}, first index {})",
				self.id, req.leader_id, conflict_term, first_index);

			return AppendEntriesResponse {
				term: self.meta.current_term,
				success: false,
				conflict_term,
				first_index
			};
		}

		// The prefix matches. Truncate to the matched point and splice in the
		// leader's entries; under the leader's next_index discipline this never
		// drops anything the cluster has committed.
		let old_last = self.log.last_index();
		self.log.truncate_suffix(req.prev_log_index + 1);
		for e in req.entries.iter() {
			self.log.append(e.clone());
		}

		let last_new = self.log.last_index();
		if old_last != last_new || !req.entries.is_empty() {
			tick.write_state();
		}

		// Only trust the leader's commit index as far as the entries it has
		// actually confirmed to us
		if req.leader_commit > self.commit_index {
			let next_commit = cmp::min(req.leader_commit, last_new);
			if next_commit > self.commit_index {
				self.commit_index = next_commit;
				tick.committed = true;
			}
		}

		AppendEntriesResponse {
			term: self.meta.current_term,
			success: true,
			// The match hint: where our log now ends
			conflict_term: self.log.last_term(),
			first_index: last_new
		}
	}

	/// Handles one reply to an append we sent in req_term
	pub fn append_entries_callback(
		&mut self, from_id: ServerId, req_term: Term, resp: AppendEntriesResponse, tick: &mut Tick
	) {
		self.observe_term(resp.term, tick);

		// Stale: this reply belongs to a request from an older leadership
		if self.meta.current_term != req_term {
			return;
		}

		let log_len = self.log.len();
		let conflict_tail = if !resp.success && resp.conflict_term != 0 {
			self.log.last_index_of_term(resp.conflict_term)
		} else {
			None
		};

		let mut advanced = false;

		if let ServerState::Leader(ref mut s) = self.state {
			let progress = match s.servers.get_mut(&from_id) {
				Some(p) => p,
				None => return
			};

			if resp.success {
				// Replies may arrive out of order; never move the match back
				if resp.first_index > progress.match_index {
					progress.match_index = resp.first_index;
					progress.next_index = progress.match_index + 1;
				}

				advanced = true;
			} else {
				// Quick backup: jump to our last entry of the follower's
				// conflicting term if we have one, otherwise to the follower's
				// own hint
				let mut next = match conflict_tail {
					Some(tail) => cmp::min(tail, resp.first_index),
					None => resp.first_index
				};

				if next > log_len {
					next = log_len;
				}
				if next < 1 {
					next = 1;
				}

				debug!("server {}: backing up next index for {} to {}",
					self.id, from_id, next);

				progress.next_index = next;
			}
		}

		if advanced {
			self.try_advance_commit(tick);
		}
	}

	/// Advances the commit index to the highest index stored on a quorum, but
	/// only through an entry of the current term. Entries from earlier terms
	/// commit as a side effect via the log matching property.
	fn try_advance_commit(&mut self, tick: &mut Tick) {
		let target = {
			let s = match self.state {
				ServerState::Leader(ref s) => s,
				_ => return
			};

			let mut matches: Vec<LogIndex> = s.servers.values()
				.map(|p| p.match_index)
				.collect();
			matches.sort();

			matches[matches.len() / 2]
		};

		if target > self.commit_index && self.log.term(target) == Some(self.meta.current_term) {
			debug!("server {}: commit index {} -> {} @ term {}",
				self.id, self.commit_index, target, self.meta.current_term);

			self.commit_index = target;
			tick.committed = true;
		}
	}

	/// On the leader, produces one append request per other server for this
	/// replication round; None once we are no longer the leader so the loop
	/// can exit. A follower that is behind gets every entry it is missing in
	/// one bundle, an up-to-date one gets a bare heartbeat.
	pub fn replicate_requests(&self) -> Option<Vec<(ServerId, AppendEntriesRequest)>> {
		let s = match self.state {
			ServerState::Leader(ref s) => s,
			_ => return None
		};

		let last_log_index = self.log.last_index();
		let mut requests = Vec::new();

		for id in self.peers.iter().filter(|id| **id != self.id) {
			let progress = match s.servers.get(id) {
				Some(p) => p,
				None => continue
			};

			let next = cmp::max(1, progress.next_index);
			let prev_log_index = next - 1;

			let entries = if next <= last_log_index {
				self.log.entries_from(next)
			} else {
				Vec::new()
			};

			requests.push((*id, AppendEntriesRequest {
				term: self.meta.current_term,
				leader_id: self.id,
				prev_log_index,
				prev_log_term: self.log.term(prev_log_index).unwrap(),
				entries,
				leader_commit: self.commit_index
			}));
		}

		Some(requests)
	}

	/// Proposes a new command for the replicated log
	///
	/// On the leader this appends locally and returns the position the entry
	/// will commit at if this leadership survives; replication itself rides on
	/// the next heartbeat round. Anywhere else it only produces a redirect
	/// hint.
	pub fn propose_command(&mut self, data: Vec<u8>, tick: &mut Tick) -> ProposeResult {
		let term = self.meta.current_term;

		let res = match self.state {
			ServerState::Leader(ref mut s) => {
				let index = self.log.last_index() + 1;
				self.log.append(LogEntry { term, command: data });

				// Our own copy counts towards the quorum immediately
				if let Some(progress) = s.servers.get_mut(&self.id) {
					progress.match_index = index;
					progress.next_index = index + 1;
				}

				tick.write_state();

				debug!("server {}: accepted proposal at index {} term {}", self.id, index, term);

				Ok(Proposal { term, index })
			},
			ServerState::Follower(ref s) => Err(ProposeError::NotLeader {
				leader_hint: s.last_leader_id.or(self.meta.voted_for)
			}),
			ServerState::Candidate(_) => Err(ProposeError::NotLeader { leader_hint: None })
		};

		// A single-node cluster has its quorum without any replies
		if res.is_ok() {
			self.try_advance_commit(tick);
		}

		res
	}

	/// Snapshots the batch of newly committed entries and marks them applied.
	/// Must only ever be called from the single apply pump so that entries
	/// reach the client exactly once and in index order.
	pub fn take_applyable(&mut self) -> (LogIndex, Vec<LogEntry>) {
		let from = self.last_applied + 1;
		let entries = self.log.range(from, self.commit_index);
		self.last_applied = self.commit_index;

		(from, entries)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fresh(n: u64) -> ConsensusModule {
		ConsensusModule::new(0, (0..n).collect(), None)
	}

	fn with_log(n: u64, term: Term, entry_terms: &[Term]) -> ConsensusModule {
		let mut entries = vec![LogEntry { term: 0, command: Vec::new() }];
		for (i, t) in entry_terms.iter().enumerate() {
			entries.push(LogEntry { term: *t, command: vec![i as u8] });
		}

		ConsensusModule::new(0, (0..n).collect(), Some(PersistentState {
			meta: Metadata { current_term: term, voted_for: None },
			entries
		}))
	}

	fn make_leader(m: &mut ConsensusModule) -> Term {
		let mut tick = Tick::empty();
		let req = m.start_election(&mut tick).unwrap();

		for peer in &[1, 2] {
			let mut tick = Tick::empty();
			m.request_vote_callback(*peer, req.term, RequestVoteResponse {
				term: req.term,
				vote_granted: true
			}, &mut tick);
		}

		assert!(m.is_leader());
		req.term
	}

	fn vote_req(term: Term, candidate_id: ServerId, last_log_index: LogIndex, last_log_term: Term) -> RequestVoteRequest {
		RequestVoteRequest { term, candidate_id, last_log_index, last_log_term }
	}

	fn append_req(term: Term, prev_log_index: LogIndex, prev_log_term: Term,
		entries: Vec<LogEntry>, leader_commit: LogIndex) -> AppendEntriesRequest {
		AppendEntriesRequest {
			term,
			leader_id: 1,
			prev_log_index,
			prev_log_term,
			entries,
			leader_commit
		}
	}

	fn entry(term: Term, cmd: &[u8]) -> LogEntry {
		LogEntry { term, command: cmd.to_vec() }
	}

	#[test]
	fn grants_one_vote_per_term() {
		let mut m = fresh(5);

		let mut tick = Tick::empty();
		let resp = m.request_vote(&vote_req(1, 1, 0, 0), &mut tick);
		assert!(resp.vote_granted);
		assert!(tick.persist);
		assert!(tick.reset_timer);

		// Same term, different candidate: the vote is spent
		let mut tick = Tick::empty();
		let resp = m.request_vote(&vote_req(1, 2, 0, 0), &mut tick);
		assert!(!resp.vote_granted);

		// Same term, same candidate: a re-request is honored
		let mut tick = Tick::empty();
		let resp = m.request_vote(&vote_req(1, 1, 0, 0), &mut tick);
		assert!(resp.vote_granted);

		// A new term clears the vote
		let mut tick = Tick::empty();
		let resp = m.request_vote(&vote_req(2, 2, 0, 0), &mut tick);
		assert!(resp.vote_granted);
		assert_eq!(m.meta().current_term, 2);
	}

	#[test]
	fn rejects_vote_for_stale_term() {
		let mut m = with_log(5, 3, &[]);

		let mut tick = Tick::empty();
		let resp = m.request_vote(&vote_req(2, 1, 0, 0), &mut tick);
		assert!(!resp.vote_granted);
		assert_eq!(resp.term, 3);
		assert!(!tick.reset_timer);
	}

	#[test]
	fn enforces_up_to_date_check() {
		// Our log: two entries, last term 2
		let mut m = with_log(5, 2, &[1, 2]);

		// Shorter log at our last term
		let mut tick = Tick::empty();
		assert!(!m.request_vote(&vote_req(3, 1, 1, 2), &mut tick).vote_granted);

		// Longer log but an older last term
		let mut tick = Tick::empty();
		assert!(!m.request_vote(&vote_req(4, 2, 8, 1), &mut tick).vote_granted);

		// Equal last term, equal length
		let mut tick = Tick::empty();
		assert!(m.request_vote(&vote_req(5, 3, 2, 2), &mut tick).vote_granted);
	}

	#[test]
	fn timeout_increments_term_and_votes_self() {
		let mut m = fresh(5);

		let mut tick = Tick::empty();
		let req = m.start_election(&mut tick).unwrap();
		assert_eq!(req.term, 1);
		assert_eq!(req.candidate_id, 0);
		assert_eq!(req.last_log_index, 0);
		assert!(tick.persist);
		assert_eq!(m.meta().voted_for, Some(0));

		// A second timeout without a quorum starts another round higher up
		let mut tick = Tick::empty();
		let req = m.start_election(&mut tick).unwrap();
		assert_eq!(req.term, 2);
	}

	#[test]
	fn wins_election_with_majority() {
		let mut m = fresh(5);

		let mut tick = Tick::empty();
		let req = m.start_election(&mut tick).unwrap();

		let grant = RequestVoteResponse { term: req.term, vote_granted: true };

		let mut tick = Tick::empty();
		m.request_vote_callback(1, req.term, grant.clone(), &mut tick);
		assert!(!m.is_leader());

		// A duplicated reply from the same server must not count twice
		let mut tick = Tick::empty();
		m.request_vote_callback(1, req.term, grant.clone(), &mut tick);
		assert!(!m.is_leader());

		let mut tick = Tick::empty();
		m.request_vote_callback(2, req.term, grant, &mut tick);
		assert!(m.is_leader());
		assert!(tick.leader_elected);
		assert!(tick.reset_timer);
	}

	#[test]
	fn stale_vote_reply_is_ignored() {
		let mut m = fresh(5);

		let mut tick = Tick::empty();
		let old = m.start_election(&mut tick).unwrap();

		let mut tick = Tick::empty();
		let _new = m.start_election(&mut tick).unwrap();

		let grant = RequestVoteResponse { term: old.term, vote_granted: true };
		for peer in &[1, 2, 3, 4] {
			let mut tick = Tick::empty();
			m.request_vote_callback(*peer, old.term, grant.clone(), &mut tick);
		}

		assert!(!m.is_leader());
	}

	#[test]
	fn candidate_steps_down_on_higher_reply_term() {
		let mut m = fresh(5);

		let mut tick = Tick::empty();
		let req = m.start_election(&mut tick).unwrap();

		let mut tick = Tick::empty();
		m.request_vote_callback(1, req.term, RequestVoteResponse {
			term: req.term + 3,
			vote_granted: false
		}, &mut tick);

		assert!(!m.is_leader());
		assert_eq!(m.meta().current_term, req.term + 3);
		assert_eq!(m.meta().voted_for, None);
		assert!(tick.persist);
		assert!(tick.reset_timer);
	}

	#[test]
	fn append_entries_appends_and_commits() {
		let mut m = fresh(5);

		let mut tick = Tick::empty();
		let resp = m.append_entries(&append_req(1, 0, 0,
			vec![entry(1, b"a"), entry(1, b"b")], 1), &mut tick);

		assert!(resp.success);
		assert_eq!(resp.first_index, 2);
		assert_eq!(resp.conflict_term, 1);
		assert_eq!(m.commit_index(), 1);
		assert!(tick.persist);
		assert!(tick.reset_timer);
		assert!(tick.committed);

		// The follower acknowledged the leader for this term
		assert_eq!(m.meta().voted_for, Some(1));

		let (from, entries) = m.take_applyable();
		assert_eq!(from, 1);
		assert_eq!(entries, vec![entry(1, b"a")]);
		assert_eq!(m.last_applied(), 1);
	}

	#[test]
	fn append_entries_rejects_stale_term() {
		let mut m = with_log(5, 5, &[]);

		let mut tick = Tick::empty();
		let resp = m.append_entries(&append_req(3, 0, 0, vec![entry(3, b"x")], 0), &mut tick);

		assert!(!resp.success);
		assert_eq!(resp.term, 5);
		assert!(!tick.reset_timer);
		assert_eq!(m.commit_index(), 0);
	}

	#[test]
	fn append_entries_short_log_hint() {
		// Follower log ends at index 2, all term 1
		let mut m = with_log(5, 1, &[1, 1]);

		let mut tick = Tick::empty();
		let resp = m.append_entries(&append_req(1, 5, 1, vec![], 0), &mut tick);

		assert!(!resp.success);
		// Back up to our tail: first unfilled slot, and the term of our last entry
		assert_eq!(resp.first_index, 3);
		assert_eq!(resp.conflict_term, 1);
	}

	#[test]
	fn append_entries_conflict_hint() {
		// Follower holds terms [1, 1, 2, 2] at indexes 1..=4
		let mut m = with_log(5, 2, &[1, 1, 2, 2]);

		// The leader believes index 4 holds term 3
		let mut tick = Tick::empty();
		let resp = m.append_entries(&append_req(3, 4, 3, vec![], 0), &mut tick);

		assert!(!resp.success);
		assert_eq!(resp.conflict_term, 2);
		// First index of the conflicting term's run
		assert_eq!(resp.first_index, 3);
	}

	#[test]
	fn append_entries_overwrites_conflicting_suffix() {
		// We accepted an entry from a leader of term 2 that never committed
		let mut m = with_log(5, 2, &[2]);

		// The leader of term 3 holds a different entry at index 1
		let mut tick = Tick::empty();
		let resp = m.append_entries(&append_req(3, 0, 0, vec![entry(3, b"winner")], 1), &mut tick);

		assert!(resp.success);
		assert_eq!(resp.first_index, 1);
		assert_eq!(m.commit_index(), 1);

		let (_, entries) = m.take_applyable();
		assert_eq!(entries, vec![entry(3, b"winner")]);
	}

	#[test]
	fn candidate_accepts_current_term_leader() {
		let mut m = fresh(5);

		let mut tick = Tick::empty();
		let req = m.start_election(&mut tick).unwrap();

		// Another candidate won this same term and asserts itself
		let mut tick = Tick::empty();
		let resp = m.append_entries(&append_req(req.term, 0, 0, vec![], 0), &mut tick);

		assert!(resp.success);
		assert!(tick.reset_timer);
		assert!(!m.is_leader());

		// Proposals now redirect towards the acknowledged leader
		let mut tick = Tick::empty();
		let err = m.propose_command(b"cmd".to_vec(), &mut tick).unwrap_err();
		assert_eq!(err, ProposeError::NotLeader { leader_hint: Some(1) });
	}

	#[test]
	fn leader_replicates_and_commits() {
		let mut m = fresh(5);
		let term = make_leader(&mut m);

		let mut tick = Tick::empty();
		let prop = m.propose_command(b"a".to_vec(), &mut tick).unwrap();
		assert_eq!(prop, Proposal { term, index: 1 });
		assert!(tick.persist);

		// The round bundles the new entry for every follower
		let reqs = m.replicate_requests().unwrap();
		assert_eq!(reqs.len(), 4);
		for (_, req) in &reqs {
			assert_eq!(req.prev_log_index, 1 - 1);
			assert_eq!(req.entries.len(), 1);
			assert_eq!(req.leader_commit, 0);
		}

		// First replica stored it: still no quorum
		let ok = AppendEntriesResponse { term, success: true, conflict_term: term, first_index: 1 };
		let mut tick = Tick::empty();
		m.append_entries_callback(1, term, ok.clone(), &mut tick);
		assert_eq!(m.commit_index(), 0);
		assert!(!tick.committed);

		// Second replica completes the quorum of three
		let mut tick = Tick::empty();
		m.append_entries_callback(2, term, ok, &mut tick);
		assert_eq!(m.commit_index(), 1);
		assert!(tick.committed);

		// Followers now learn the commit index with the next round
		let reqs = m.replicate_requests().unwrap();
		for (peer, req) in &reqs {
			assert_eq!(req.leader_commit, 1);
			// Matched followers fall back to bare heartbeats
			if *peer == 1 || *peer == 2 {
				assert!(req.entries.is_empty());
				assert_eq!(req.prev_log_index, 1);
			}
		}
	}

	#[test]
	fn leader_never_directly_commits_old_term() {
		// An entry of term 1 sits uncommitted in our log
		let mut m = with_log(5, 1, &[1]);
		let term = make_leader(&mut m);
		assert_eq!(term, 2);

		let stored_old = AppendEntriesResponse {
			term, success: true, conflict_term: 1, first_index: 1
		};

		// A quorum stores the old entry, but it is not from our term
		for peer in &[1, 2] {
			let mut tick = Tick::empty();
			m.append_entries_callback(*peer, term, stored_old.clone(), &mut tick);
			assert!(!tick.committed);
		}
		assert_eq!(m.commit_index(), 0);

		// A current-term entry on a quorum carries the old one with it
		let mut tick = Tick::empty();
		m.propose_command(b"new".to_vec(), &mut tick).unwrap();

		let stored_new = AppendEntriesResponse {
			term, success: true, conflict_term: term, first_index: 2
		};
		for peer in &[1, 2] {
			let mut tick = Tick::empty();
			m.append_entries_callback(*peer, term, stored_new.clone(), &mut tick);
		}

		assert_eq!(m.commit_index(), 2);
	}

	#[test]
	fn leader_backs_up_with_conflict_term() {
		// Leader log: terms [1, 1, 2] at indexes 1..=3
		let mut m = with_log(5, 2, &[1, 1, 2]);
		let term = make_leader(&mut m);

		// Follower 1 rejected: it conflicts in term 1 starting at index 1.
		// We hold term 1 up to index 2, so back up to min(2, 1) = 1.
		let mut tick = Tick::empty();
		m.append_entries_callback(1, term, AppendEntriesResponse {
			term, success: false, conflict_term: 1, first_index: 1
		}, &mut tick);

		let reqs = m.replicate_requests().unwrap();
		let (_, req) = reqs.iter().find(|(id, _)| *id == 1).unwrap();
		assert_eq!(req.prev_log_index, 0);
		assert_eq!(req.entries.len(), 3);

		// Follower 2 rejected with a term we never had: take its hint directly
		let mut tick = Tick::empty();
		m.append_entries_callback(2, term, AppendEntriesResponse {
			term, success: false, conflict_term: 9, first_index: 2
		}, &mut tick);

		let reqs = m.replicate_requests().unwrap();
		let (_, req) = reqs.iter().find(|(id, _)| *id == 2).unwrap();
		assert_eq!(req.prev_log_index, 1);
	}

	#[test]
	fn leader_steps_down_on_higher_append_reply() {
		let mut m = fresh(5);
		let term = make_leader(&mut m);

		let mut tick = Tick::empty();
		m.append_entries_callback(1, term, AppendEntriesResponse {
			term: term + 2, success: false, conflict_term: 0, first_index: 0
		}, &mut tick);

		assert!(!m.is_leader());
		assert_eq!(m.meta().current_term, term + 2);
		assert!(tick.reset_timer);
		assert!(m.replicate_requests().is_none());
	}

	#[test]
	fn stale_append_reply_is_ignored() {
		let mut m = fresh(5);
		let term = make_leader(&mut m);

		let mut tick = Tick::empty();
		m.propose_command(b"a".to_vec(), &mut tick).unwrap();

		// A reply from a previous leadership of ours must not move anything
		let mut tick = Tick::empty();
		m.append_entries_callback(1, term - 1, AppendEntriesResponse {
			term: term - 1, success: true, conflict_term: 1, first_index: 1
		}, &mut tick);

		assert_eq!(m.commit_index(), 0);
	}

	#[test]
	fn propose_on_follower_returns_hint() {
		let mut m = fresh(5);

		let mut tick = Tick::empty();
		let err = m.propose_command(b"cmd".to_vec(), &mut tick).unwrap_err();
		assert_eq!(err, ProposeError::NotLeader { leader_hint: None });

		// After hearing from a leader the hint points at it
		let mut tick = Tick::empty();
		m.append_entries(&append_req(1, 0, 0, vec![], 0), &mut tick);

		let mut tick = Tick::empty();
		let err = m.propose_command(b"cmd".to_vec(), &mut tick).unwrap_err();
		assert_eq!(err, ProposeError::NotLeader { leader_hint: Some(1) });
	}

	#[test]
	fn single_node_elects_and_commits_alone() {
		let mut m = fresh(1);

		let mut tick = Tick::empty();
		let req = m.start_election(&mut tick);
		assert!(req.is_some());
		assert!(m.is_leader());
		assert!(tick.leader_elected);

		let mut tick = Tick::empty();
		let prop = m.propose_command(b"solo".to_vec(), &mut tick).unwrap();
		assert_eq!(prop.index, 1);
		assert!(tick.committed);
		assert_eq!(m.commit_index(), 1);

		assert!(m.replicate_requests().unwrap().is_empty());
	}

	#[test]
	fn persisted_state_survives_restart() {
		let mut m = fresh(5);

		let mut tick = Tick::empty();
		m.append_entries(&append_req(4, 0, 0, vec![entry(4, b"a"), entry(4, b"b")], 0), &mut tick);

		let saved = m.persisted();
		let restored = ConsensusModule::new(0, (0..5).collect(), Some(saved.clone()));

		assert_eq!(restored.meta(), &saved.meta);
		assert_eq!(restored.persisted(), saved);

		// Volatile state starts over
		assert_eq!(restored.commit_index(), 0);
		assert_eq!(restored.last_applied(), 0);
		assert!(!restored.is_leader());
	}

	#[test]
	fn take_applyable_is_incremental() {
		let mut m = fresh(5);

		let mut tick = Tick::empty();
		m.append_entries(&append_req(1, 0, 0,
			vec![entry(1, b"a"), entry(1, b"b"), entry(1, b"c")], 2), &mut tick);

		let (from, entries) = m.take_applyable();
		assert_eq!(from, 1);
		assert_eq!(entries.len(), 2);

		// Nothing new until the commit index moves again
		let (_, entries) = m.take_applyable();
		assert!(entries.is_empty());

		let mut tick = Tick::empty();
		m.append_entries(&append_req(1, 3, 1, vec![], 3), &mut tick);

		let (from, entries) = m.take_applyable();
		assert_eq!(from, 3);
		assert_eq!(entries, vec![entry(1, b"c")]);
	}
}
