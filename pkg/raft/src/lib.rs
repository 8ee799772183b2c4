#[macro_use] extern crate serde_derive;
#[macro_use] extern crate error_chain;
#[macro_use] extern crate log as log_facade;

extern crate rand;
extern crate rmp_serde;
extern crate serde;

pub mod errors {
	error_chain! {
		foreign_links {
			Io(::std::io::Error);
			Encode(::rmp_serde::encode::Error);
			Decode(::rmp_serde::decode::Error);
		}

		errors {
			Shutdown {
				description("server is shutting down")
				display("server is shutting down")
			}
		}
	}
}

mod sync;
pub mod protos;
pub mod rpc;
pub mod storage;
pub mod log;
mod state;
pub mod consensus;
pub mod server;
