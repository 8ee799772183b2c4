use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

/// Creates the single-slot signal used to ask the election activity to re-arm
/// its timer. Signals sent while one is already pending collapse into a single
/// delivery, so senders never block.
pub fn reset_channel() -> (ResetHandle, ResetListener) {
	let (tx, rx) = sync_channel(1);
	(ResetHandle { tx }, ResetListener { rx })
}

#[derive(Clone)]
pub struct ResetHandle {
	tx: SyncSender<()>
}

impl ResetHandle {
	pub fn signal(&self) {
		match self.tx.try_send(()) {
			Ok(()) => {},
			// A reset is already pending; the two coalesce
			Err(TrySendError::Full(())) => {},
			// The election activity is gone, so there is no timer left to reset
			Err(TrySendError::Disconnected(())) => {}
		}
	}
}

pub struct ResetListener {
	rx: Receiver<()>
}

pub enum TimerEvent {
	/// A reset arrived before the timeout elapsed
	Reset,

	/// The full timeout elapsed with no reset
	Timeout,

	/// Every sender is gone
	Closed
}

impl ResetListener {
	pub fn wait(&self, timeout: Duration) -> TimerEvent {
		match self.rx.recv_timeout(timeout) {
			Ok(()) => TimerEvent::Reset,
			Err(RecvTimeoutError::Timeout) => TimerEvent::Timeout,
			Err(RecvTimeoutError::Disconnected) => TimerEvent::Closed
		}
	}
}

/// One-shot flag observed by every long running activity and rpc handler
#[derive(Clone)]
pub struct ShutdownSignal {
	flag: Arc<AtomicBool>
}

impl ShutdownSignal {
	pub fn new() -> Self {
		ShutdownSignal { flag: Arc::new(AtomicBool::new(false)) }
	}

	pub fn set(&self) {
		self.flag.store(true, Ordering::SeqCst);
	}

	pub fn is_set(&self) -> bool {
		self.flag.load(Ordering::SeqCst)
	}
}
