use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use rand::RngCore;

use crate::consensus::{ConsensusModule, ProposeResult, Tick};
use crate::errors::*;
use crate::protos::*;
use crate::rpc::{marshal, unmarshal, Transport};
use crate::storage::Storage;
use crate::sync::{reset_channel, ResetHandle, ResetListener, ShutdownSignal, TimerEvent};

/// At some random time in this range of milliseconds, a follower that has not
/// heard from a valid leader will become a candidate
const ELECTION_TIMEOUT: (u64, u64) = (400, 800);

/// Time between replication rounds while we are the leader. Must stay well
/// under the minimum election timeout or healthy followers will start
/// elections anyway.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(40);

/// Tunables for a single peer, fixed at construction
#[derive(Clone)]
pub struct Config {
	/// Bounds in milliseconds of the randomized election timeout
	pub election_timeout: (u64, u64),

	pub heartbeat_interval: Duration
}

impl Default for Config {
	fn default() -> Self {
		Config {
			election_timeout: ELECTION_TIMEOUT,
			heartbeat_interval: HEARTBEAT_INTERVAL
		}
	}
}

impl Config {
	fn validate(&self) -> Result<()> {
		if self.election_timeout.0 >= self.election_timeout.1 {
			return Err("Election timeout range is empty".into());
		}

		if self.heartbeat_interval >= Duration::from_millis(self.election_timeout.0 / 2) {
			return Err("Heartbeat interval must be under half the minimum election timeout".into());
		}

		Ok(())
	}

	fn new_election_timeout(&self) -> Duration {
		let mut rng = rand::thread_rng();
		let (lo, hi) = self.election_timeout;
		let time = lo + ((rng.next_u32() as u64) * (hi - lo)) / (std::u32::MAX as u64);

		Duration::from_millis(time)
	}
}

struct ServerShared {
	id: ServerId,
	peers: Vec<ServerId>,
	config: Config,

	/// All protocol state lives behind this one lock
	inst: Mutex<ConsensusModule>,

	/// Wakes the apply pump whenever the commit index advances (and once on
	/// shutdown)
	commit_cond: Condvar,

	/// Asks the election activity to re-arm its timer
	reset: ResetHandle,

	shutdown: ShutdownSignal,

	transport: Arc<dyn Transport>,
	storage: Arc<dyn Storage>
}

impl ServerShared {
	/// Runs one locked operation against the consensus module and carries out
	/// the side effects it requested. Persistence happens before the lock is
	/// released so no response or request built from the new state can escape
	/// ahead of its facts being durable.
	fn run<R>(&self, f: impl FnOnce(&mut ConsensusModule, &mut Tick) -> R) -> Result<(R, Tick)> {
		let mut inst = self.inst.lock().unwrap();
		let mut tick = Tick::empty();

		let res = f(&mut inst, &mut tick);

		if tick.persist {
			let data = marshal(&inst.persisted())?;
			self.storage.save_state(&data)?;
		}

		if tick.committed {
			self.commit_cond.notify_all();
		}

		drop(inst);

		if tick.reset_timer {
			self.reset.signal();
		}

		Ok((res, tick))
	}

	/// Stops the peer. Pairing the flag write with the condition notification
	/// under the state lock is what keeps the apply pump from missing it.
	fn halt(&self) {
		{
			let _inst = self.inst.lock().unwrap();
			self.shutdown.set();
			self.commit_cond.notify_all();
		}

		self.reset.signal();
	}

	/// A failure to make required facts durable is not recoverable; the peer
	/// must stop rather than reply or keep going on unpersisted state
	fn fatal(&self, context: &str, e: &Error) {
		error!("server {}: {}: {}", self.id, context, e);
		self.halt();
	}
}

/// A single consensus peer: the locked protocol core plus the three long
/// running activities that drive it
pub struct Server {
	shared: Arc<ServerShared>
}

impl Server {
	/// Boots a peer: restores whatever state was persisted, then spawns the
	/// election and apply activities. The replication activity starts and
	/// stops with leadership.
	pub fn start(
		id: ServerId,
		peers: Vec<ServerId>,
		config: Config,
		transport: Arc<dyn Transport>,
		storage: Arc<dyn Storage>,
		apply_ch: Sender<ApplyEntry>
	) -> Result<Arc<Server>> {
		config.validate()?;

		let restored = match storage.read_state()? {
			Some(ref data) if !data.is_empty() => Some(unmarshal::<PersistentState>(data)?),
			_ => None
		};

		let inst = ConsensusModule::new(id, peers.clone(), restored);

		info!("server {}: starting at term {}", id, inst.meta().current_term);

		let (reset, listener) = reset_channel();

		let shared = Arc::new(ServerShared {
			id,
			peers,
			config,
			inst: Mutex::new(inst),
			commit_cond: Condvar::new(),
			reset,
			shutdown: ShutdownSignal::new(),
			transport,
			storage
		});

		{
			let shared = shared.clone();
			thread::spawn(move || Self::election_daemon(shared, listener));
		}

		{
			let shared = shared.clone();
			thread::spawn(move || Self::apply_daemon(shared, apply_ch));
		}

		Ok(Arc::new(Server { shared }))
	}

	pub fn id(&self) -> ServerId {
		self.shared.id
	}

	/// Snapshot of the current term and whether we currently believe we are
	/// the leader
	pub fn state(&self) -> (Term, bool) {
		let inst = self.shared.inst.lock().unwrap();
		(inst.meta().current_term, inst.is_leader())
	}

	/// Starts agreement on a new command
	///
	/// On the leader this returns the log position the command will occupy if
	/// it commits; there is no commit guarantee and the caller should watch
	/// the apply channel for the index. Elsewhere it returns a not-leader
	/// rejection with a redirect hint.
	pub fn propose(&self, data: Vec<u8>) -> Result<ProposeResult> {
		if self.shared.shutdown.is_set() {
			return Err(ErrorKind::Shutdown.into());
		}

		let (res, _) = self.shared.run(|inst, tick| inst.propose_command(data, tick))?;
		Ok(res)
	}

	/// Marks the peer dead: every activity exits promptly, new rpcs are
	/// rejected and the apply channel closes
	pub fn shutdown(&self) {
		self.shared.halt();
	}

	/// RequestVote rpc entry point
	pub fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
		if self.shared.shutdown.is_set() {
			return Err(ErrorKind::Shutdown.into());
		}

		let (resp, _) = self.shared.run(|inst, tick| inst.request_vote(&req, tick))?;
		Ok(resp)
	}

	/// AppendEntries rpc entry point
	pub fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
		if self.shared.shutdown.is_set() {
			return Err(ErrorKind::Shutdown.into());
		}

		let (resp, _) = self.shared.run(|inst, tick| inst.append_entries(&req, tick))?;
		Ok(resp)
	}

	/// Owns the election timer. Re-arms it with a fresh random timeout on
	/// every reset signal; a full timeout with no reset starts a vote round.
	fn election_daemon(shared: Arc<ServerShared>, listener: ResetListener) {
		loop {
			if shared.shutdown.is_set() {
				return;
			}

			match listener.wait(shared.config.new_election_timeout()) {
				TimerEvent::Reset => continue,
				TimerEvent::Closed => return,
				TimerEvent::Timeout => {}
			}

			if shared.shutdown.is_set() {
				return;
			}

			let round = match shared.run(|inst, tick| inst.start_election(tick)) {
				Ok((req, tick)) => {
					if tick.leader_elected {
						// Single-node clusters win right here
						let shared = shared.clone();
						thread::spawn(move || Self::heartbeat_daemon(shared));
					}

					req
				},
				Err(e) => {
					shared.fatal("failed to persist election state", &e);
					return;
				}
			};

			if let Some(req) = round {
				Self::canvass_votes(&shared, req);
			}

			// The loop re-arms the timer immediately: a candidate that cannot
			// assemble a quorum simply tries again at a higher term
		}
	}

	/// Broadcasts a vote solicitation and tallies replies as they come back
	fn canvass_votes(shared: &Arc<ServerShared>, req: RequestVoteRequest) {
		for peer in shared.peers.iter().filter(|p| **p != shared.id) {
			let shared = shared.clone();
			let peer = *peer;
			let req = req.clone();

			thread::spawn(move || {
				let resp = match shared.transport.request_vote(peer, &req) {
					Some(resp) => resp,
					// Unreachable; the next round will ask again
					None => return
				};

				if shared.shutdown.is_set() {
					return;
				}

				match shared.run(|inst, tick| {
					inst.request_vote_callback(peer, req.term, resp, tick)
				}) {
					Ok((_, tick)) => {
						if tick.leader_elected {
							let shared = shared.clone();
							thread::spawn(move || Self::heartbeat_daemon(shared));
						}
					},
					Err(e) => shared.fatal("failed to persist after vote reply", &e)
				}
			});
		}
	}

	/// Replication loop that exists only while this server is the leader:
	/// every interval it snapshots one append request per peer under the lock
	/// and fans the sends out without it
	fn heartbeat_daemon(shared: Arc<ServerShared>) {
		loop {
			if shared.shutdown.is_set() {
				return;
			}

			let requests = {
				let inst = shared.inst.lock().unwrap();
				match inst.replicate_requests() {
					Some(reqs) => reqs,
					// Leadership is over
					None => return
				}
			};

			// The leader must not let its own election timer fire
			shared.reset.signal();

			for (peer, req) in requests {
				let shared = shared.clone();

				thread::spawn(move || {
					let resp = match shared.transport.append_entries(peer, &req) {
						Some(resp) => resp,
						None => return
					};

					if shared.shutdown.is_set() {
						return;
					}

					if let Err(e) = shared.run(|inst, tick| {
						inst.append_entries_callback(peer, req.term, resp, tick)
					}) {
						shared.fatal("failed to persist after append reply", &e);
					}
				});
			}

			thread::sleep(shared.config.heartbeat_interval);
		}
	}

	/// The single ordered emitter of committed entries. Dropping apply_ch on
	/// exit is what closes the channel towards the client.
	fn apply_daemon(shared: Arc<ServerShared>, apply_ch: Sender<ApplyEntry>) {
		loop {
			let (from, entries) = {
				let mut inst = shared.inst.lock().unwrap();

				loop {
					if shared.shutdown.is_set() {
						return;
					}

					if inst.commit_index() > inst.last_applied() {
						break;
					}

					inst = shared.commit_cond.wait(inst).unwrap();
				}

				inst.take_applyable()
			};

			// Emission happens outside the lock: the client may backpressure
			// us for as long as it wants
			for (i, entry) in entries.into_iter().enumerate() {
				let record = ApplyEntry {
					valid: true,
					index: from + i as LogIndex,
					command: entry.command
				};

				if apply_ch.send(record).is_err() {
					// The client went away
					return;
				}
			}
		}
	}
}
