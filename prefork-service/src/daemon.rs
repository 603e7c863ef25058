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

//! Detaching a service from the controlling terminal.
//!
//! A [`Daemon`] forks a detached grandchild through the piper's daemonize
//! primitive and then watches for evidence that the service actually came
//! up: either the detached process staying reachable by signal 0, or a log
//! file growing past its recorded offset, optionally with a phrase appearing
//! in the appended region. Failures the child marshals back through the pipe
//! are reconstructed and surface as startup errors; a startup that produces
//! no evidence within the timeout is ended with `SIGTERM`, then `SIGKILL`.

use crate::pidfile::PidFile;
use nix::sys::signal::Signal;
use prefork::{Error, Frame, Piper, Received, RemoteError};
use regex::Regex;
use std::{
	ffi::CString,
	fs,
	io::{Read, Seek, SeekFrom},
	path::PathBuf,
	process, thread,
	time::{Duration, Instant, SystemTime},
};

const LOG_TARGET: &str = "prefork::daemon";

/// Pause between the TERM and KILL steps of the startup-timeout escalation,
/// and between polls while shutting a daemon down.
const ESCALATION_GRACE: Duration = Duration::from_secs(1);

/// What the detached process should run.
pub enum Startup {
	/// Replace the detached process image with an external program, argv
	/// style. The first element is resolved against `PATH`.
	Program(Vec<String>),
	/// Run a routine in the detached process. The routine is expected to
	/// hold the process for its lifetime; returning ends the daemon.
	Routine(Box<dyn FnOnce() -> Result<(), Error> + Send>),
}

/// The phrase a log watcher scans for.
#[derive(Clone, Debug)]
pub enum LookFor {
	/// Substring match.
	Literal(String),
	/// Regular expression match.
	Pattern(Regex),
}

impl LookFor {
	/// Compile a pattern, rejecting invalid syntax as an argument error.
	pub fn pattern(pattern: &str) -> Result<Self, Error> {
		Regex::new(pattern)
			.map(LookFor::Pattern)
			.map_err(|err| Error::Argument(format!("invalid startup phrase pattern: {}", err)))
	}

	fn matches(&self, text: &str) -> bool {
		match self {
			LookFor::Literal(phrase) => text.contains(phrase),
			LookFor::Pattern(regex) => regex.is_match(text),
		}
	}
}

/// Watches one log file for growth past the offset recorded at construction,
/// optionally requiring a phrase in the appended region.
struct LogWatcher {
	path: PathBuf,
	look_for: Option<LookFor>,
	offset: u64,
	mtime: Option<SystemTime>,
	size: u64,
}

impl LogWatcher {
	fn new(path: PathBuf, look_for: Option<LookFor>) -> Self {
		let (mtime, size) = match fs::metadata(&path) {
			Ok(meta) => (meta.modified().ok(), meta.len()),
			Err(_) => (None, 0),
		};
		LogWatcher { path, look_for, offset: size, mtime, size }
	}

	fn updated(&mut self) -> Result<bool, Error> {
		let meta = match fs::metadata(&self.path) {
			Ok(meta) => meta,
			Err(_) => return Ok(false),
		};
		match &self.look_for {
			None => Ok(meta.modified().ok() != self.mtime || meta.len() != self.size),
			Some(look_for) => {
				if meta.len() <= self.offset {
					return Ok(false)
				}
				let mut file = fs::File::open(&self.path)?;
				file.seek(SeekFrom::Start(self.offset))?;
				let mut appended = String::new();
				file.read_to_string(&mut appended)?;
				self.offset = meta.len();
				Ok(look_for.matches(&appended))
			},
		}
	}
}

/// A detached service process and the evidence-based startup protocol
/// around it.
pub struct Daemon {
	name: String,
	pidfile: PidFile,
	logfile: Option<PathBuf>,
	look_for: Option<LookFor>,
	timeout: Duration,
	keep_cwd: bool,
	keep_stdio: bool,
	startup: Option<Startup>,
}

impl Daemon {
	/// A daemon named `name` that will run `startup` once detached.
	pub fn new(name: impl Into<String>, startup: Startup) -> Self {
		let name = name.into();
		let pidfile = PidFile::new(name.clone());
		Daemon {
			name,
			pidfile,
			logfile: None,
			look_for: None,
			timeout: Duration::from_secs(30),
			keep_cwd: false,
			keep_stdio: false,
			startup: Some(startup),
		}
	}

	/// Directory the pid file is placed in.
	pub fn pid_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.pidfile = PidFile::new(self.name.clone()).in_dir(dir);
		self
	}

	/// Watch this log file for startup evidence instead of polling the
	/// process for liveness.
	pub fn logfile(mut self, path: impl Into<PathBuf>) -> Self {
		self.logfile = Some(path.into());
		self
	}

	/// Require this phrase to appear in the log past the startup offset.
	pub fn look_for(mut self, look_for: LookFor) -> Self {
		self.look_for = Some(look_for);
		self
	}

	/// Give up on startup evidence after this long.
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	/// Skip the `chdir("/")` step of detaching.
	pub fn keep_cwd(mut self) -> Self {
		self.keep_cwd = true;
		self
	}

	/// Skip reopening stdio on `/dev/null`.
	pub fn keep_stdio(mut self) -> Self {
		self.keep_stdio = true;
		self
	}

	/// The daemon name.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// PID recorded for the detached process, if any.
	pub fn pid(&self) -> Option<i32> {
		self.pidfile.pid()
	}

	/// Detach and wait for startup evidence. Returns the detached PID.
	///
	/// This call returns only in the launching process; the detached side
	/// runs the startup command and leaves through it.
	pub fn startup(&mut self) -> Result<i32, Error> {
		if let (Some(pid), Some(true)) = (self.pidfile.pid(), self.pidfile.alive()) {
			return Err(Error::AlreadyStarted(pid))
		}
		let startup = self
			.startup
			.take()
			.ok_or_else(|| Error::Argument("startup command already consumed".to_owned()))?;

		let mut piper = Piper::daemonize(!self.keep_cwd, !self.keep_stdio)?;
		if piper.is_child() {
			run_detached(startup, piper)
		}

		let pid = match piper.pid() {
			Some(pid) => pid,
			None => return Err(Error::Timeout(self.timeout)),
		};
		tracing::info!(target: LOG_TARGET, name = %self.name, %pid, "detached daemon process");
		match self.await_evidence(&mut piper) {
			Ok(()) => {
				self.pidfile.record(pid.as_raw())?;
				Ok(pid.as_raw())
			},
			Err(err) => {
				escalate(&piper);
				Err(err)
			},
		}
	}

	/// End the detached process: `SIGTERM`, a bounded wait, then `SIGKILL`,
	/// and remove the pid file once it is gone.
	pub fn shutdown(&mut self) -> Result<(), Error> {
		let alive = self.pidfile.alive().unwrap_or(false);
		if !alive {
			return self.pidfile.delete_force()
		}
		tracing::info!(target: LOG_TARGET, name = %self.name, "shutting daemon down");
		self.pidfile.kill(Signal::SIGTERM)?;
		if !self.await_exit() {
			self.pidfile.kill(Signal::SIGKILL)?;
			self.await_exit();
		}
		self.pidfile.delete_force()
	}

	fn await_exit(&self) -> bool {
		let deadline = Instant::now() + ESCALATION_GRACE;
		while Instant::now() < deadline {
			if !self.pidfile.alive().unwrap_or(false) {
				return true
			}
			thread::sleep(Duration::from_millis(50));
		}
		!self.pidfile.alive().unwrap_or(false)
	}

	fn await_evidence(&mut self, piper: &mut Piper<i32>) -> Result<(), Error> {
		let deadline = Instant::now() + self.timeout;
		let mut watcher =
			self.logfile.clone().map(|path| LogWatcher::new(path, self.look_for.clone()));
		loop {
			// The piper's one-second suspend timeout paces the loop; a fault
			// marshalled by the child short-circuits it.
			match piper.receive()? {
				Received::Frame(Frame::Fault(remote)) => return Err(Error::ChildRaised(remote)),
				Received::Frame(_) | Received::None | Received::Interrupted => {},
			}
			let started = match watcher.as_mut() {
				Some(watcher) => watcher.updated()?,
				None => piper.pid().map(|pid| nix::sys::signal::kill(pid, None).is_ok()).unwrap_or(false),
			};
			if started {
				return Ok(())
			}
			if Instant::now() >= deadline {
				return Err(Error::Timeout(self.timeout))
			}
		}
	}
}

/// TERM, a grace, then KILL for a detached process that never produced
/// startup evidence.
fn escalate(piper: &Piper<i32>) {
	let _ = piper.signal(Signal::SIGTERM);
	thread::sleep(ESCALATION_GRACE);
	if let Some(pid) = piper.pid() {
		if nix::sys::signal::kill(pid, None).is_ok() {
			let _ = piper.signal(Signal::SIGKILL);
		}
	}
}

/// Runs in the detached grandchild. Failures are marshalled back through the
/// pipe so the launcher sees a cause rather than a silent timeout.
fn run_detached(startup: Startup, mut piper: Piper<i32>) -> ! {
	match startup {
		Startup::Program(argv) => {
			let cstrings: Result<Vec<CString>, _> =
				argv.iter().map(|arg| CString::new(arg.as_str())).collect();
			match cstrings {
				Ok(args) if !args.is_empty() => {
					// On success this never returns; the daemon is the
					// program from here on.
					let err = nix::unistd::execvp(&args[0], &args)
						.err()
						.map(|errno| errno.to_string())
						.unwrap_or_default();
					let _ = piper.send(&Frame::Fault(RemoteError::Raised(format!(
						"exec {:?}: {}",
						argv, err
					))));
				},
				_ => {
					let _ = piper.send(&Frame::Fault(RemoteError::Raised(
						"startup program argv is empty or not a valid C string".to_owned(),
					)));
				},
			}
			piper.close();
			process::exit(1);
		},
		Startup::Routine(routine) => {
			match routine() {
				Ok(()) => {
					piper.close();
					process::exit(0);
				},
				Err(err) => {
					let _ = piper.send(&Frame::Fault(RemoteError::Raised(err.to_string())));
					piper.close();
					process::exit(1);
				},
			}
		},
	}
}
