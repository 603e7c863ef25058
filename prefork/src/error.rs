// Copyright (C) Parity Technologies (UK) Ltd.
// This file is part of Prefork.

// Prefork is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Prefork is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Prefork.  If not, see <http://www.gnu.org/licenses/>.

//! Error types shared across the crate.

use parity_scale_codec::{Decode, Encode};
use std::time::Duration;

/// Errors surfaced by the process-management primitives.
///
/// The variants deliberately carry owned strings rather than nested error
/// types so a recorded error can be cloned out of a worker slot and compared
/// in tests.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
	/// A bounded wait elapsed with no progress.
	#[error("timed out after {0:?} with no progress")]
	Timeout(Duration),

	/// A frame arrived that the protocol does not allow at this point.
	#[error("unknown signal frame: {0}")]
	UnknownSignal(String),

	/// A heartbeat was answered with something other than a heartbeat.
	#[error("unknown response frame: {0}")]
	UnknownResponse(String),

	/// The child marshalled an error over the pipe before exiting.
	#[error("child process raised: {0}")]
	ChildRaised(RemoteError),

	/// An alive PID is already recorded for this service.
	#[error("already started: pid {0} is alive")]
	AlreadyStarted(i32),

	/// Invalid construction or option value.
	#[error("invalid argument: {0}")]
	Argument(String),

	/// A required capability is missing.
	#[error("not implemented: {0}")]
	NotImplemented(&'static str),

	/// Frame bytes that do not decode, or a corrupt delimiter.
	#[error("protocol violation: {0}")]
	Protocol(String),

	/// Underlying OS or I/O failure.
	#[error("i/o error: {0}")]
	Io(String),
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Error::Io(err.to_string())
	}
}

impl From<nix::Error> for Error {
	fn from(errno: nix::Error) -> Self {
		Error::Io(std::io::Error::from_raw_os_error(errno as i32).to_string())
	}
}

/// An error that crosses the process boundary.
///
/// Children serialize failures into a fault frame before exiting; the parent
/// decodes them and records them on the owning worker. The kind survives the
/// trip so a supervisor can tell a liveness failure from user code failing.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, thiserror::Error)]
pub enum RemoteError {
	/// The peer saw no traffic within its configured timeout, in milliseconds.
	#[error("no traffic for {0}ms")]
	Timeout(u64),

	/// A frame arrived that the protocol does not allow.
	#[error("unknown signal frame: {0}")]
	UnknownSignal(String),

	/// User code failed.
	#[error("{0}")]
	Raised(String),
}

impl RemoteError {
	/// Flatten any error into a wire-transferable form, preserving the kind
	/// where one maps.
	pub fn from_error(err: &Error) -> Self {
		match err {
			Error::Timeout(d) => RemoteError::Timeout(d.as_millis() as u64),
			Error::UnknownSignal(s) => RemoteError::UnknownSignal(s.clone()),
			other => RemoteError::Raised(other.to_string()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn remote_error_round_trips_kind_and_message() {
		let cases = vec![
			RemoteError::Timeout(2500),
			RemoteError::UnknownSignal("HALT".to_owned()),
			RemoteError::Raised("execute failed: disk full".to_owned()),
		];
		for case in cases {
			let bytes = case.encode();
			let back = RemoteError::decode(&mut bytes.as_slice()).unwrap();
			assert_eq!(case, back);
			assert_eq!(case.to_string(), back.to_string());
		}
	}

	#[test]
	fn error_kinds_are_preserved_when_flattened() {
		let err = Error::Timeout(Duration::from_millis(1500));
		assert_eq!(RemoteError::from_error(&err), RemoteError::Timeout(1500));

		let err = Error::UnknownSignal("value".to_owned());
		assert_eq!(RemoteError::from_error(&err), RemoteError::UnknownSignal("value".to_owned()));

		let err = Error::Argument("bad mode".to_owned());
		assert_matches::assert_matches!(RemoteError::from_error(&err), RemoteError::Raised(_));
	}
}
