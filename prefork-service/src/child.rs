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

//! Running one external command with kill escalation.
//!
//! A [`Child`] spawns a command and bounds it with a wall-clock timeout. On
//! expiry it walks a signal sequence, `TERM`, `QUIT`, `KILL` unless
//! configured otherwise, pausing the suspend period between steps and
//! stopping as soon as the process is gone.

use nix::{
	errno::Errno,
	sys::signal::{self, Signal},
	unistd::Pid,
};
use prefork::Error;
use std::{
	process::{Command, ExitStatus, Stdio},
	thread,
	time::{Duration, Instant},
};

const LOG_TARGET: &str = "prefork::child";

/// Pause between polls of a running command.
const POLL_PAUSE: Duration = Duration::from_millis(100);

/// An external command under a timeout.
pub struct Child {
	argv: Vec<String>,
	timeout: Option<Duration>,
	signals: Vec<Signal>,
	suspend: Duration,
	capture: bool,
	running: Option<std::process::Child>,
}

impl Child {
	/// A command given argv style. The first element is the program.
	pub fn new(argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
		Child {
			argv: argv.into_iter().map(Into::into).collect(),
			timeout: None,
			signals: vec![Signal::SIGTERM, Signal::SIGQUIT, Signal::SIGKILL],
			suspend: Duration::from_secs(4),
			capture: true,
			running: None,
		}
	}

	/// Wall-clock bound on the command.
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	/// Replace the escalation sequence.
	pub fn signals(mut self, signals: Vec<Signal>) -> Self {
		self.signals = signals;
		self
	}

	/// Pause between escalation steps.
	pub fn suspend(mut self, suspend: Duration) -> Self {
		self.suspend = suspend;
		self
	}

	/// Inherit stdout and stderr instead of capturing them.
	pub fn inherit_output(mut self) -> Self {
		self.capture = false;
		self
	}

	/// PID of the running command.
	pub fn pid(&self) -> Option<i32> {
		self.running.as_ref().map(|child| child.id() as i32)
	}

	/// Spawn the command.
	pub fn start(&mut self) -> Result<(), Error> {
		if self.running.is_some() {
			return Ok(())
		}
		let program = self
			.argv
			.first()
			.ok_or_else(|| Error::Argument("command argv is empty".to_owned()))?;
		let mut command = Command::new(program);
		command.args(&self.argv[1..]).stdin(Stdio::null());
		if self.capture {
			command.stdout(Stdio::piped()).stderr(Stdio::piped());
		}
		let child = command.spawn()?;
		tracing::debug!(target: LOG_TARGET, pid = child.id(), program = %program, "spawned command");
		self.running = Some(child);
		Ok(())
	}

	/// Wait for the command, enforcing the timeout.
	///
	/// On expiry the escalation sequence runs, the process is collected, and
	/// the timeout surfaces as the error.
	pub fn wait(&mut self) -> Result<ExitStatus, Error> {
		let timeout = self.timeout;
		let deadline = timeout.map(|timeout| Instant::now() + timeout);
		loop {
			let child = match self.running.as_mut() {
				Some(child) => child,
				None => return Err(Error::Argument("command was never started".to_owned())),
			};
			if let Some(status) = child.try_wait()? {
				self.running = None;
				return Ok(status)
			}
			if let Some(deadline) = deadline {
				if Instant::now() >= deadline {
					let timeout = timeout.unwrap_or_default();
					tracing::warn!(
						target: LOG_TARGET,
						pid = ?self.pid(),
						"command exceeded its {:?} timeout, escalating",
						timeout,
					);
					self.stop();
					return Err(Error::Timeout(timeout))
				}
			}
			thread::sleep(POLL_PAUSE);
		}
	}

	/// Run the escalation sequence against the command. Returns once the
	/// process is collected, or after the sequence is exhausted. A no-op
	/// when nothing is running.
	pub fn stop(&mut self) {
		let pid = match self.running.as_ref() {
			Some(child) => Pid::from_raw(child.id() as i32),
			None => return,
		};
		let sequence = self.signals.clone();
		let suspend = self.suspend;
		for sig in sequence {
			match signal::kill(pid, sig) {
				// Already gone; nothing left to escalate against.
				Err(Errno::ESRCH) => break,
				Err(errno) => {
					tracing::warn!(target: LOG_TARGET, %pid, "kill failed: {}", errno);
					break
				},
				Ok(()) => {},
			}
			if self.reaped_within(suspend) {
				return
			}
		}
		// Collect a process that died without being observed above; one that
		// survived the whole sequence is left to the caller.
		if !self.reaped_within(POLL_PAUSE) {
			tracing::warn!(target: LOG_TARGET, %pid, "escalation exhausted, giving up");
		}
	}

	/// Captured stdout handle, once per run.
	pub fn take_stdout(&mut self) -> Option<std::process::ChildStdout> {
		self.running.as_mut().and_then(|child| child.stdout.take())
	}

	/// Captured stderr handle, once per run.
	pub fn take_stderr(&mut self) -> Option<std::process::ChildStderr> {
		self.running.as_mut().and_then(|child| child.stderr.take())
	}

	fn reaped_within(&mut self, grace: Duration) -> bool {
		let deadline = Instant::now() + grace;
		loop {
			let child = match self.running.as_mut() {
				Some(child) => child,
				None => return true,
			};
			if let Ok(Some(_)) = child.try_wait() {
				self.running = None;
				return true
			}
			if Instant::now() >= deadline {
				return false
			}
			thread::sleep(Duration::from_millis(50));
		}
	}
}
