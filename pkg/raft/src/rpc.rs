use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::*;
use crate::protos::*;

/// Serializes a message or the persistent state into its compact binary form
pub fn marshal<T: Serialize>(obj: &T) -> Result<Vec<u8>> {
	let data = rmp_serde::to_vec(obj)?;
	Ok(data)
}

pub fn unmarshal<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
	let obj = rmp_serde::from_slice(data)?;
	Ok(obj)
}

/// Request/reply layer over an unreliable network
///
/// A call blocks until the remote handler replies or the network gives up on
/// delivery. None means the request or its reply was lost; the protocol never
/// retries a single send, the next heartbeat or election round covers it.
pub trait Transport: Send + Sync + 'static {
	fn request_vote(&self, to: ServerId, req: &RequestVoteRequest)
		-> Option<RequestVoteResponse>;

	fn append_entries(&self, to: ServerId, req: &AppendEntriesRequest)
		-> Option<AppendEntriesResponse>;
}
