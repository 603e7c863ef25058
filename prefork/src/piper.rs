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

//! A bidirectional, framed, timeout-aware channel across a fork boundary.
//!
//! Constructing a [`Piper`] forks the current process. Both sides get a value
//! of the same type; which pipe ends each side keeps is decided by the
//! [`Mode`]. All waiting is bounded by the suspend timeout, and a closed peer
//! surfaces as a sentinel rather than an error so supervision loops can treat
//! "nothing there" uniformly.

use crate::{
	error::Error,
	frame::{framed_recv_blocking, framed_send_blocking, Frame},
};
use nix::{
	errno::Errno,
	fcntl::OFlag,
	poll::{poll, PollFd, PollFlags},
	sys::{
		signal::{self, Signal},
		stat::Mode as FileMode,
		wait::waitpid,
	},
	unistd::{self, ForkResult, Pid},
};
use os_pipe::{PipeReader, PipeWriter};
use parity_scale_codec::{Decode, Encode};
use std::{
	io,
	marker::PhantomData,
	os::unix::io::AsRawFd,
	process,
	str::FromStr,
	time::Duration,
};

const LOG_TARGET: &str = "prefork::piper";

/// Timeout used by the daemonizing constructor while the grandchild reports
/// its PID.
const DAEMONIZE_TIMEOUT: Duration = Duration::from_secs(1);

/// Which directions stay open on each side of the fork.
///
/// | Mode        | Parent keeps | Child keeps  |
/// |-------------|--------------|--------------|
/// | `Read`      | read         | write        |
/// | `Write`     | write        | read         |
/// | `ReadWrite` | read + write | read + write |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
	/// Parent reads, child writes.
	Read,
	/// Parent writes, child reads.
	Write,
	/// Both directions on both sides.
	ReadWrite,
}

impl FromStr for Mode {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Error> {
		match s {
			"r" => Ok(Mode::Read),
			"w" => Ok(Mode::Write),
			"rw" | "wr" => Ok(Mode::ReadWrite),
			other => Err(Error::Argument(format!("unknown piper mode: {:?}", other))),
		}
	}
}

/// Outcome of one bounded receive.
#[derive(Debug, PartialEq, Eq)]
pub enum Received<T> {
	/// One complete frame.
	Frame(Frame<T>),
	/// Nothing arrived within the suspend timeout, or the peer end is closed.
	None,
	/// A signal interrupted the wait before anything arrived. Callers with
	/// signal flags should consult them and retry.
	Interrupted,
}

enum PollOutcome {
	Ready,
	TimedOut,
	Interrupted,
}

/// Bounded readiness wait on one descriptor.
fn wait_fd(fd: i32, events: PollFlags, timeout: Duration) -> io::Result<PollOutcome> {
	let mut fds = [PollFd::new(fd, events)];
	let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
	match poll(&mut fds, millis) {
		Ok(0) => Ok(PollOutcome::TimedOut),
		Ok(_) => {
			let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
			// A hung-up or errored descriptor is "ready": the following read
			// observes EOF and the following write observes EPIPE, both of
			// which map to the closed-peer sentinel.
			if revents.intersects(events | PollFlags::POLLHUP | PollFlags::POLLERR) {
				Ok(PollOutcome::Ready)
			} else {
				Ok(PollOutcome::TimedOut)
			}
		},
		Err(Errno::EINTR) => Ok(PollOutcome::Interrupted),
		Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
	}
}

/// Resolve a signal given by name (`"HUP"`, `"SIGHUP"`) or decimal number.
pub fn resolve_signal(given: &str) -> Result<Signal, Error> {
	if let Ok(number) = given.parse::<i32>() {
		return Signal::try_from(number)
			.map_err(|_| Error::Argument(format!("unknown signal number: {}", number)))
	}
	let name = if given.starts_with("SIG") { given.to_owned() } else { format!("SIG{}", given) };
	Signal::from_str(&name).map_err(|_| Error::Argument(format!("unknown signal: {:?}", given)))
}

/// The fork-boundary channel.
///
/// The type parameter is the application payload carried by
/// [`Frame::Value`]; control tags and faults are available for every `T`.
pub struct Piper<T> {
	reader: Option<PipeReader>,
	writer: Option<PipeWriter>,
	child: Option<Pid>,
	timeout: Duration,
	_payload: PhantomData<fn() -> T>,
}

impl<T: Encode + Decode> Piper<T> {
	/// Create the pipe pair and fork.
	///
	/// Returns in both processes. Each side closes the ends the mode does not
	/// grant it before returning.
	pub fn pair(mode: Mode, timeout: Duration) -> Result<Self, Error> {
		// Parent writes, child reads.
		let down = match mode {
			Mode::Write | Mode::ReadWrite => Some(os_pipe::pipe().map_err(Error::from)?),
			Mode::Read => None,
		};
		// Child writes, parent reads.
		let up = match mode {
			Mode::Read | Mode::ReadWrite => Some(os_pipe::pipe().map_err(Error::from)?),
			Mode::Write => None,
		};

		// SAFETY: the child only runs code the caller hands it; nothing here
		// touches state owned by other threads of the parent before the
		// caller regains control.
		match unsafe { unistd::fork() }.map_err(Error::from)? {
			ForkResult::Child => {
				// Drop the parent's ends so EOF propagates when it closes.
				let reader = down.map(|(r, w)| {
					drop(w);
					r
				});
				let writer = up.map(|(r, w)| {
					drop(r);
					w
				});
				Ok(Piper { reader, writer, child: None, timeout, _payload: PhantomData })
			},
			ForkResult::Parent { child } => {
				let writer = down.map(|(r, w)| {
					drop(r);
					w
				});
				let reader = up.map(|(r, w)| {
					drop(w);
					r
				});
				Ok(Piper { reader, writer, child: Some(child), timeout, _payload: PhantomData })
			},
		}
	}

	/// Whether this is the child side. The child never knows a PID.
	pub fn is_child(&self) -> bool {
		self.child.is_none()
	}

	/// Whether this is the parent side.
	pub fn is_parent(&self) -> bool {
		self.child.is_some()
	}

	/// PID of the forked child; `None` on the child side.
	pub fn pid(&self) -> Option<Pid> {
		self.child
	}

	/// The bound applied to every blocking operation on this channel.
	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	/// Replace the suspend timeout, e.g. to shorten the grace applied to a
	/// best-effort HALT during shutdown.
	pub fn set_timeout(&mut self, timeout: Duration) {
		self.timeout = timeout;
	}

	/// Serialize `frame` and deliver it as one record.
	///
	/// Returns the number of bytes written, or `None` when the write end is
	/// closed, the peer has gone away, or the pipe would not accept the
	/// record within the suspend timeout. A frame is never partially
	/// delivered: the record is assembled up front and handed over in a
	/// single write.
	pub fn send(&mut self, frame: &Frame<T>) -> Result<Option<usize>, Error> {
		let timeout = self.timeout;
		let writer = match self.writer.as_mut() {
			Some(writer) => writer,
			None => return Ok(None),
		};
		match wait_fd(writer.as_raw_fd(), PollFlags::POLLOUT, timeout)? {
			PollOutcome::Ready => {},
			PollOutcome::TimedOut | PollOutcome::Interrupted => return Ok(None),
		}
		match framed_send_blocking(writer, &frame.encode()) {
			Ok(written) => Ok(Some(written)),
			Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(None),
			Err(err) => Err(err.into()),
		}
	}

	/// Wait up to the suspend timeout for one complete frame.
	///
	/// Timeouts and a closed peer both come back as [`Received::None`];
	/// undecodable bytes are a [`Error::Protocol`] failure.
	pub fn receive(&mut self) -> Result<Received<T>, Error> {
		let timeout = self.timeout;
		let reader = match self.reader.as_mut() {
			Some(reader) => reader,
			None => return Ok(Received::None),
		};
		match wait_fd(reader.as_raw_fd(), PollFlags::POLLIN, timeout)? {
			PollOutcome::TimedOut => return Ok(Received::None),
			PollOutcome::Interrupted => return Ok(Received::Interrupted),
			PollOutcome::Ready => {},
		}
		match framed_recv_blocking(reader) {
			Ok(bytes) => {
				let frame = Frame::decode(&mut bytes.as_slice())
					.map_err(|err| Error::Protocol(format!("failed to decode frame: {}", err)))?;
				Ok(Received::Frame(frame))
			},
			Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(Received::None),
			Err(err) => Err(err.into()),
		}
	}

	/// Whether one receive would make progress without blocking past the
	/// suspend timeout.
	pub fn readable(&self) -> Result<bool, Error> {
		match &self.reader {
			Some(reader) =>
				Ok(matches!(wait_fd(reader.as_raw_fd(), PollFlags::POLLIN, self.timeout)?, PollOutcome::Ready)),
			None => Ok(false),
		}
	}

	/// Whether one send would make progress without blocking past the
	/// suspend timeout.
	pub fn writable(&self) -> Result<bool, Error> {
		match &self.writer {
			Some(writer) =>
				Ok(matches!(wait_fd(writer.as_raw_fd(), PollFlags::POLLOUT, self.timeout)?, PollOutcome::Ready)),
			None => Ok(false),
		}
	}

	/// Deliver `sig` to the child. A no-op on the child side; delivery to a
	/// process that is already gone is swallowed.
	pub fn signal(&self, sig: Signal) -> Result<(), Error> {
		let pid = match self.child {
			Some(pid) => pid,
			None => return Ok(()),
		};
		match signal::kill(pid, sig) {
			Err(Errno::ESRCH) => {
				tracing::debug!(target: LOG_TARGET, %pid, "signal target is already gone");
				Ok(())
			},
			other => other.map_err(Error::from),
		}
	}

	/// Close both ends. Idempotent.
	pub fn close(&mut self) {
		self.reader = None;
		self.writer = None;
	}

	/// Independent handle to the write end, used for out-of-band HALT during
	/// shutdown.
	pub(crate) fn clone_writer(&self) -> Option<PipeWriter> {
		self.writer.as_ref().and_then(|writer| writer.try_clone().ok())
	}
}

impl Piper<i32> {
	/// Fork a detached grandchild and return a channel to it.
	///
	/// Returns in two processes. On the parent side the channel's child PID
	/// is the PID of the detached grandchild, reported by the grandchild
	/// itself through the pipe. On the grandchild side the usual child-side
	/// channel comes back, after the process has become a session leader with
	/// a zero umask, optionally with `/` as its working directory and its
	/// standard streams reopened on `/dev/null`. The intermediate child of
	/// the first fork exits immediately, orphaning the grandchild to init.
	pub fn daemonize(chdir_root: bool, null_stdio: bool) -> Result<Self, Error> {
		let mut piper = Self::pair(Mode::ReadWrite, DAEMONIZE_TIMEOUT)?;
		if let Some(intermediate) = piper.child {
			// Collect the intermediate before it lingers as a zombie.
			let _ = waitpid(intermediate, None);
			return match piper.receive()? {
				Received::Frame(Frame::Value(pid)) => {
					piper.child = Some(Pid::from_raw(pid));
					Ok(piper)
				},
				Received::Frame(Frame::Fault(remote)) => Err(Error::ChildRaised(remote)),
				_ => Err(Error::Timeout(DAEMONIZE_TIMEOUT)),
			}
		}

		// First-fork child. Any failure from here on is marshalled back
		// through the pipe before exiting, so the parent sees a cause and
		// not just a missing PID.
		if let Err(errno) = unistd::setsid() {
			fail_daemonize(&mut piper, "setsid", errno);
		}
		// SAFETY: this process is the fresh child of the fork above and owns
		// no threads besides the current one.
		match unsafe { unistd::fork() } {
			Err(errno) => fail_daemonize(&mut piper, "fork", errno),
			// The intermediate leaves the grandchild to init.
			Ok(ForkResult::Parent { .. }) => process::exit(0),
			Ok(ForkResult::Child) => {},
		}
		nix::sys::stat::umask(FileMode::empty());
		if chdir_root {
			if let Err(errno) = unistd::chdir("/") {
				fail_daemonize(&mut piper, "chdir", errno);
			}
		}
		if null_stdio {
			if let Err(errno) = reopen_stdio_on_null() {
				fail_daemonize(&mut piper, "reopening stdio", errno);
			}
		}
		let _ = piper.send(&Frame::Value(process::id() as i32));
		Ok(piper)
	}
}

/// Marshal a daemonization failure to the waiting parent, then exit.
fn fail_daemonize(piper: &mut Piper<i32>, context: &str, errno: Errno) -> ! {
	let remote = crate::error::RemoteError::Raised(format!("{}: {}", context, errno));
	let _ = piper.send(&Frame::Fault(remote));
	piper.close();
	process::exit(1);
}

fn reopen_stdio_on_null() -> nix::Result<()> {
	let null = nix::fcntl::open("/dev/null", OFlag::O_RDWR, FileMode::empty())?;
	for stream in 0..=2 {
		unistd::dup2(null, stream)?;
	}
	if null > 2 {
		let _ = unistd::close(null);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use assert_matches::assert_matches;

	#[test]
	fn mode_parses_the_short_spellings() {
		assert_eq!("r".parse::<Mode>().unwrap(), Mode::Read);
		assert_eq!("w".parse::<Mode>().unwrap(), Mode::Write);
		assert_eq!("rw".parse::<Mode>().unwrap(), Mode::ReadWrite);
	}

	#[test]
	fn unknown_mode_names_the_offending_value() {
		let err = "rwx".parse::<Mode>().unwrap_err();
		assert_matches!(err, Error::Argument(msg) if msg.contains("rwx"));
	}

	#[test]
	fn signals_resolve_by_name_and_number() {
		assert_eq!(resolve_signal("HUP").unwrap(), Signal::SIGHUP);
		assert_eq!(resolve_signal("SIGTERM").unwrap(), Signal::SIGTERM);
		assert_eq!(resolve_signal("9").unwrap(), Signal::SIGKILL);
		assert_matches!(resolve_signal("NOSUCH"), Err(Error::Argument(_)));
	}
}
