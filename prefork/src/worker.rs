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

//! One supervised child process.
//!
//! A [`Worker`] forks a child that drives the user's [`Capabilities`] under a
//! heartbeat protocol, and hosts a supervisor loop in the parent that pumps
//! the heartbeats, enforces the timeout, records failures and replaces the
//! child in its slot when the child asks for it via `SIGHUP`.
//!
//! The wire protocol per generation, parent on the left:
//!
//! ```text
//! START      ->              announce readiness
//! HEARTBEAT  ->              drive one execute
//!            <- HEARTBEAT    the round trip completed in time
//!            <- START        replace me (child got SIGHUP)
//!            <- fault        child failed and is gone
//! HALT       ->              wind down
//! ```

use crate::{
	error::{Error, RemoteError},
	frame::{frame_label, framed_send_blocking, Frame, Tag},
	piper::{Mode, Piper, Received},
	pool::Harvest,
	runner::{Activity, Runner, Tick},
};
use nix::{
	errno::Errno,
	sys::{
		signal::{self, Signal},
		wait::{waitpid, WaitPidFlag, WaitStatus},
	},
	unistd::Pid,
};
use os_pipe::PipeWriter;
use parity_scale_codec::Encode;
use parking_lot::Mutex;
use std::{
	process,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread,
	time::Duration,
};

const LOG_TARGET: &str = "prefork::worker";

/// Grace applied to the best-effort HALT while a generation winds down.
const HALT_GRACE: Duration = Duration::from_millis(250);

/// Extra slack past the heartbeat timeout when joining the supervisor.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// The set of callables a child process runs.
///
/// `execute` is required and is driven once per heartbeat. The lifecycle
/// hooks default to no-ops. The set is cloned into every worker a pool
/// starts, before the fork, so state mutated by one worker's hooks stays
/// private to that worker's child process.
pub trait Capabilities: Clone + Send + 'static {
	/// One unit of work. A failure is marshalled to the parent and ends the
	/// child.
	fn execute(&mut self) -> Result<(), Error>;

	/// Runs once in the child before the first heartbeat. Failures are
	/// logged and swallowed.
	fn before_executing(&mut self) -> Result<(), Error> {
		Ok(())
	}

	/// Runs once in the child after the heartbeat loop ends on HALT.
	/// Failures are logged and swallowed.
	fn after_executing(&mut self) -> Result<(), Error> {
		Ok(())
	}

	/// Runs in the child after the SIGHUP replacement handshake, right
	/// before the process exits.
	fn hup(&mut self) -> Result<(), Error> {
		Ok(())
	}

	/// Runs in the child after SIGTERM, right before the process exits.
	fn term(&mut self) -> Result<(), Error> {
		Ok(())
	}
}

/// Adapter turning a bare closure into a [`Capabilities`] set whose only
/// member is `execute`.
#[derive(Clone)]
pub struct ExecuteFn<F>(pub(crate) F);

impl<F> Capabilities for ExecuteFn<F>
where
	F: FnMut() -> Result<(), Error> + Clone + Send + 'static,
{
	fn execute(&mut self) -> Result<(), Error> {
		(self.0)()
	}
}

struct Inner<C: Capabilities> {
	caps: Mutex<C>,
	timeout: Duration,
	stop: AtomicBool,
	error: Mutex<Option<Error>>,
	/// Parent-side channel of the current generation; taken by the
	/// supervisor for the duration of one pump so no lock is held across
	/// pipe I/O.
	piper: Mutex<Option<Piper<()>>>,
	/// Independent handle to the write end, for the out-of-band HALT in
	/// [`Worker::stop`].
	halt_tx: Mutex<Option<PipeWriter>>,
	child_pid: Mutex<Option<Pid>>,
	harvest: Harvest,
}

/// One child process plus its parent-side supervisor loop.
pub struct Worker<C: Capabilities> {
	inner: Arc<Inner<C>>,
	runner: Runner<Supervisor<C>>,
}

impl<C: Capabilities> Worker<C> {
	pub(crate) fn new(caps: C, timeout: Duration, harvest: Harvest) -> Self {
		let inner = Arc::new(Inner {
			caps: Mutex::new(caps),
			timeout,
			stop: AtomicBool::new(false),
			error: Mutex::new(None),
			piper: Mutex::new(None),
			halt_tx: Mutex::new(None),
			child_pid: Mutex::new(None),
			harvest,
		});
		let runner = Runner::new(Supervisor { inner: Arc::clone(&inner) });
		Worker { inner, runner }
	}

	/// Fork a child and start supervising it. A no-op while a supervisor is
	/// already running.
	///
	/// This call returns only in the parent; the forked child enters the
	/// capability driver and exits from there.
	pub fn start(&mut self) -> Result<(), Error> {
		if self.runner.running() {
			return Ok(())
		}
		self.inner.stop.store(false, Ordering::SeqCst);
		*self.inner.error.lock() = None;
		spawn_generation(&self.inner)?;
		self.runner.start()
	}

	/// Wind the worker down: flag the supervisor, order the child to halt,
	/// deliver SIGTERM and join the supervisor loop.
	///
	/// In-progress `execute` calls are not cancelled; the child leaves at
	/// its next suspension point.
	pub fn stop(&mut self, limit: Option<Duration>) {
		self.inner.stop.store(true, Ordering::SeqCst);
		if let Some(mut halt_tx) = self.inner.halt_tx.lock().take() {
			let halt = Frame::<()>::Control(Tag::Halt).encode();
			let _ = framed_send_blocking(&mut halt_tx, &halt);
		}
		if let Some(pid) = self.pid() {
			let _ = signal::kill(pid, Signal::SIGTERM);
		}
		let limit = limit.or(Some(self.inner.timeout + STOP_GRACE));
		self.runner.stop(limit);
	}

	/// PID of the most recent child generation.
	pub fn pid(&self) -> Option<Pid> {
		*self.inner.child_pid.lock()
	}

	/// Whether the child is reachable by signal 0.
	pub fn alive(&self) -> bool {
		match self.pid() {
			Some(pid) => signal::kill(pid, None).is_ok(),
			None => false,
		}
	}

	/// Forward `sig` to the child. Delivery to a process that is already
	/// gone is swallowed.
	pub fn signal(&self, sig: Signal) -> Result<(), Error> {
		let pid = match self.pid() {
			Some(pid) => pid,
			None => return Ok(()),
		};
		match signal::kill(pid, sig) {
			Err(Errno::ESRCH) => Ok(()),
			other => other.map_err(Error::from),
		}
	}

	/// Non-blocking reap of the child.
	pub fn wait(&self) -> Option<WaitStatus> {
		let pid = self.pid()?;
		waitpid(pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED)).ok()
	}

	/// The error recorded by the supervisor, if any.
	pub fn error(&self) -> Option<Error> {
		self.inner.error.lock().clone()
	}

	/// Whether `stop` has been requested.
	pub fn stop_requested(&self) -> bool {
		self.inner.stop.load(Ordering::SeqCst)
	}
}

/// Fork a fresh child generation and install its parent-side plumbing.
///
/// The capability set is cloned before the fork so the child works on data it
/// exclusively owns and never touches the parent's locks.
fn spawn_generation<C: Capabilities>(inner: &Arc<Inner<C>>) -> Result<(), Error> {
	let caps = inner.caps.lock().clone();
	let timeout = inner.timeout;
	let piper = Piper::<()>::pair(Mode::ReadWrite, timeout)?;
	if piper.is_child() {
		drive_child(caps, piper, timeout)
	}
	tracing::debug!(target: LOG_TARGET, pid = ?piper.pid(), "forked worker child");
	*inner.child_pid.lock() = piper.pid();
	*inner.halt_tx.lock() = piper.clone_writer();
	*inner.piper.lock() = Some(piper);
	Ok(())
}

fn record<C: Capabilities>(inner: &Inner<C>, err: Error) {
	let pid = *inner.child_pid.lock();
	tracing::error!(target: LOG_TARGET, ?pid, "worker failed: {}", err);
	let mut slot = inner.error.lock();
	// Keep the first failure; later ones are usually fallout.
	if slot.is_none() {
		*slot = Some(err);
	}
}

/// Terminate a child that broke the protocol: SIGTERM, a short grace for it
/// to leave on its own, then SIGKILL.
fn dispose(pid: Pid) {
	if signal::kill(pid, Signal::SIGTERM).is_err() {
		return
	}
	for _ in 0..12 {
		match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
			Ok(WaitStatus::StillAlive) => thread::sleep(Duration::from_millis(50)),
			// Reaped here or already gone; the harvest pass tolerates both.
			_ => return,
		}
	}
	let _ = signal::kill(pid, Signal::SIGKILL);
}

/// Parent-side supervisor. One `run` call pumps heartbeats for one child
/// generation and winds it down; a replacement request re-forks in place and
/// keeps the loop going.
struct Supervisor<C: Capabilities> {
	inner: Arc<Inner<C>>,
}

impl<C: Capabilities> Activity for Supervisor<C> {
	fn run(&self) -> Result<Tick, Error> {
		let inner = &self.inner;
		let mut piper = match inner.piper.lock().take() {
			Some(piper) => piper,
			None => return Ok(Tick::Stop),
		};
		let mut restart = false;

		// Announce readiness; the child blocks until it sees this.
		let announced = matches!(piper.send(&Frame::Control(Tag::Start)), Ok(Some(_)));
		if !announced && !inner.stop.load(Ordering::SeqCst) {
			record(&**inner, Error::Timeout(inner.timeout));
		}

		while announced && !inner.stop.load(Ordering::SeqCst) {
			match piper.send(&Frame::Control(Tag::Heartbeat)) {
				Ok(Some(_)) => {},
				Ok(None) => {
					if !inner.stop.load(Ordering::SeqCst) {
						record(&**inner, Error::Timeout(inner.timeout));
					}
					break
				},
				Err(err) => {
					record(&**inner, err);
					break
				},
			}
			match piper.receive() {
				Ok(Received::Frame(Frame::Control(Tag::Heartbeat))) => continue,
				Ok(Received::Frame(Frame::Control(Tag::Start))) => {
					restart = true;
					break
				},
				Ok(Received::Frame(Frame::Fault(remote))) => {
					record(&**inner, Error::ChildRaised(remote));
					break
				},
				Ok(Received::None) => {
					// The stop flag is consulted after every receive so a
					// shutdown racing a quiet child does not read as a
					// liveness failure.
					if !inner.stop.load(Ordering::SeqCst) {
						record(&**inner, Error::Timeout(inner.timeout));
					}
					break
				},
				Ok(Received::Interrupted) => continue,
				Ok(Received::Frame(frame)) => {
					record(&**inner, Error::UnknownResponse(frame_label(&frame).to_owned()));
					break
				},
				Err(err) => {
					record(&**inner, err);
					break
				},
			}
		}

		// Wind down this generation. The HALT doubles as the acknowledgement
		// a replacement-requesting child waits for before it exits.
		let pid = piper.pid();
		let failed = inner.error.lock().is_some();
		piper.set_timeout(HALT_GRACE);
		let _ = piper.send(&Frame::Control(Tag::Halt));
		piper.close();
		drop(inner.halt_tx.lock().take());
		if let Some(pid) = pid {
			if failed {
				dispose(pid);
			}
			inner.harvest.push(pid);
		}

		if restart && !failed && !inner.stop.load(Ordering::SeqCst) {
			tracing::info!(target: LOG_TARGET, old_pid = ?pid, "replacing worker child in place");
			match spawn_generation(inner) {
				Ok(()) => return Ok(Tick::Continue),
				Err(err) => record(&**inner, err),
			}
		}
		Ok(Tick::Stop)
	}
}

/// Exit the child after marshalling a failure to the parent.
fn bail(mut piper: Piper<()>, remote: RemoteError) -> ! {
	tracing::error!(target: LOG_TARGET, "worker child failed: {}", remote);
	let _ = piper.send(&Frame::Fault(remote));
	piper.close();
	process::exit(1);
}

/// Exit paths for the child's signal protocol.
fn term_exit<C: Capabilities>(caps: &mut C, mut piper: Piper<()>) -> ! {
	piper.close();
	if let Err(err) = caps.term() {
		tracing::error!(target: LOG_TARGET, "term hook failed: {}", err);
	}
	process::exit(0);
}

fn hup_exit<C: Capabilities>(caps: &mut C, mut piper: Piper<()>) -> ! {
	// Ask to be replaced, wait for one frame of acknowledgement, and leave.
	let _ = piper.send(&Frame::Control(Tag::Start));
	let _ = piper.receive();
	piper.close();
	if let Err(err) = caps.hup() {
		tracing::error!(target: LOG_TARGET, "hup hook failed: {}", err);
	}
	process::exit(0);
}

/// The child-side driver. Never returns; the process leaves through one of
/// the exit paths above or through [`bail`].
fn drive_child<C: Capabilities>(mut caps: C, mut piper: Piper<()>, timeout: Duration) -> ! {
	// The handlers only set flags; the driver acts on them at its suspension
	// points, where it is safe to run arbitrary code.
	let hup = Arc::new(AtomicBool::new(false));
	let term = Arc::new(AtomicBool::new(false));
	let _ = signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&hup));
	let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term));

	if let Err(err) = caps.before_executing() {
		tracing::error!(target: LOG_TARGET, "before_executing failed: {}", err);
	}

	// Block until the parent announces readiness.
	loop {
		if term.swap(false, Ordering::SeqCst) {
			term_exit(&mut caps, piper)
		}
		if hup.swap(false, Ordering::SeqCst) {
			hup_exit(&mut caps, piper)
		}
		match piper.receive() {
			Ok(Received::Frame(Frame::Control(Tag::Start))) => break,
			Ok(Received::None) | Ok(Received::Interrupted) => continue,
			Ok(Received::Frame(frame)) =>
				bail(piper, RemoteError::UnknownSignal(frame_label(&frame).to_owned())),
			Err(err) => bail(piper, RemoteError::Raised(err.to_string())),
		}
	}

	loop {
		if term.swap(false, Ordering::SeqCst) {
			term_exit(&mut caps, piper)
		}
		if hup.swap(false, Ordering::SeqCst) {
			hup_exit(&mut caps, piper)
		}
		match piper.receive() {
			Ok(Received::Frame(Frame::Control(Tag::Heartbeat))) => {
				if let Err(err) = caps.execute() {
					bail(piper, RemoteError::Raised(err.to_string()));
				}
				let _ = piper.send(&Frame::Control(Tag::Heartbeat));
			},
			Ok(Received::Frame(Frame::Control(Tag::Halt))) => break,
			Ok(Received::None) =>
				bail(piper, RemoteError::Timeout(timeout.as_millis() as u64)),
			Ok(Received::Interrupted) => continue,
			Ok(Received::Frame(frame)) =>
				bail(piper, RemoteError::UnknownSignal(frame_label(&frame).to_owned())),
			Err(err) => bail(piper, RemoteError::Raised(err.to_string())),
		}
	}

	if let Err(err) = caps.after_executing() {
		tracing::error!(target: LOG_TARGET, "after_executing failed: {}", err);
	}
	piper.close();
	// Leave without unwinding into state shared with the parent image.
	process::exit(0);
}
