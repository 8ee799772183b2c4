use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errors::*;

/// Durable home for the facts that must survive a restart
///
/// save_state must not return before the bytes are actually durable; the
/// consensus module relies on that to order persistence before replies.
pub trait Storage: Send + Sync + 'static {
	fn save_state(&self, data: &[u8]) -> Result<()>;

	/// Whatever save_state last stored, or None for a fresh server
	fn read_state(&self) -> Result<Option<Vec<u8>>>;
}

/// Keeps the persisted bytes in memory
/// Durable only across a simulated restart, which is what the test harness
/// needs to model a crash without touching disk
pub struct MemoryStorage {
	data: Mutex<Option<Vec<u8>>>
}

impl MemoryStorage {
	pub fn new() -> MemoryStorage {
		MemoryStorage { data: Mutex::new(None) }
	}
}

impl Storage for MemoryStorage {
	fn save_state(&self, data: &[u8]) -> Result<()> {
		*self.data.lock().unwrap() = Some(data.to_vec());
		Ok(())
	}

	fn read_state(&self) -> Result<Option<Vec<u8>>> {
		Ok(self.data.lock().unwrap().clone())
	}
}

/// File backed storage that replaces the state file atomically on every save
/// by writing a sibling temp file, syncing it, and renaming it over the old one
pub struct FileStorage {
	path: PathBuf,
	tmp_path: PathBuf
}

impl FileStorage {
	pub fn open<P: AsRef<Path>>(path: P) -> Result<FileStorage> {
		let path = path.as_ref().to_owned();
		let mut tmp_path = path.clone().into_os_string();
		tmp_path.push(".tmp");

		Ok(FileStorage {
			path,
			tmp_path: PathBuf::from(tmp_path)
		})
	}
}

impl Storage for FileStorage {
	fn save_state(&self, data: &[u8]) -> Result<()> {
		let mut file = File::create(&self.tmp_path)?;
		file.write_all(data)?;
		file.sync_all()?;
		fs::rename(&self.tmp_path, &self.path)?;
		Ok(())
	}

	fn read_state(&self) -> Result<Option<Vec<u8>>> {
		match fs::read(&self.path) {
			Ok(data) => Ok(Some(data)),
			Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into())
		}
	}
}
