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

//! PID files for long-running services.
//!
//! The file carries one decimal PID in plain text. Its name is derived from
//! the program name (lowercased, spaces to underscores, `.pid` suffix) joined
//! with a configurable directory, and its mode defaults to `0640`.

use nix::{
	errno::Errno,
	sys::signal::{self, Signal},
	unistd::Pid,
};
use prefork::Error;
use std::{
	fs,
	io::Write,
	os::unix::fs::OpenOptionsExt,
	path::{Path, PathBuf},
};

const LOG_TARGET: &str = "prefork::pidfile";

/// A PID recorded on disk for the lifetime of a process.
pub struct PidFile {
	name: String,
	dir: PathBuf,
	mode: u32,
	pid: Option<i32>,
}

impl PidFile {
	/// A pid file for `name`, placed in the current directory with mode
	/// `0640` until configured otherwise.
	pub fn new(name: impl Into<String>) -> Self {
		PidFile { name: name.into(), dir: PathBuf::from("."), mode: 0o640, pid: None }
	}

	/// Directory the file lives in.
	pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.dir = dir.into();
		self
	}

	/// File creation mode.
	pub fn with_mode(mut self, mode: u32) -> Self {
		self.mode = mode;
		self
	}

	/// Full path of the pid file.
	pub fn path(&self) -> PathBuf {
		let stem = self.name.to_lowercase().replace(' ', "_");
		self.dir.join(format!("{}.pid", stem))
	}

	/// Record the current process.
	pub fn write(&mut self) -> Result<(), Error> {
		self.record(std::process::id() as i32)
	}

	/// Record an arbitrary PID, e.g. one learned from a detached daemon.
	pub fn record(&mut self, pid: i32) -> Result<(), Error> {
		let path = self.path();
		let mut file = fs::OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.mode(self.mode)
			.open(&path)?;
		writeln!(file, "{}", pid)?;
		tracing::debug!(target: LOG_TARGET, %pid, path = %path.display(), "wrote pid file");
		self.pid = Some(pid);
		Ok(())
	}

	/// The recorded PID, read from disk when this instance never wrote one.
	/// Unreadable or garbled content reads as `None`.
	pub fn pid(&self) -> Option<i32> {
		self.pid.or_else(|| read_pid(&self.path()))
	}

	/// Remove the file, but only while it still holds this process's PID.
	/// Another process's recording is left intact.
	pub fn delete(&mut self) -> Result<(), Error> {
		match read_pid(&self.path()) {
			Some(pid) if pid == std::process::id() as i32 => self.delete_force(),
			_ => Ok(()),
		}
	}

	/// Remove the file unconditionally.
	pub fn delete_force(&mut self) -> Result<(), Error> {
		match fs::remove_file(self.path()) {
			Ok(()) => {},
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
			Err(err) => return Err(err.into()),
		}
		self.pid = None;
		Ok(())
	}

	/// Whether the recorded process is reachable by signal 0. `None` when no
	/// PID is recorded at all.
	pub fn alive(&self) -> Option<bool> {
		self.pid().map(|pid| signal::kill(Pid::from_raw(pid), None).is_ok())
	}

	/// Deliver `sig` to the recorded process. Delivery to a process that is
	/// already gone is swallowed.
	pub fn kill(&self, sig: Signal) -> Result<(), Error> {
		let pid = match self.pid() {
			Some(pid) => pid,
			None => return Ok(()),
		};
		match signal::kill(Pid::from_raw(pid), sig) {
			Err(Errno::ESRCH) => {
				tracing::debug!(target: LOG_TARGET, %pid, "kill target is already gone");
				Ok(())
			},
			other => other.map_err(Error::from),
		}
	}
}

fn read_pid(path: &Path) -> Option<i32> {
	fs::read_to_string(path).ok()?.trim().parse().ok()
}
