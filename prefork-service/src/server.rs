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

//! A long-running single-process service.
//!
//! A [`Server`] hosts a user-supplied [`Service`] on an activity loop,
//! records a pid file for the process lifetime, and routes `HUP`, `INT`,
//! `TERM`, `USR1` and `USR2` to the service's same-named hooks. The signal
//! handlers themselves only set flags; dispatch happens on the loop thread at
//! the start of each iteration, so hooks run ordinary code. `INT` and `TERM`
//! default to a graceful shutdown.

use crate::pidfile::PidFile;
use parking_lot::{Condvar, Mutex};
use prefork::{
	runner::{Activity, Runner, RunnerOptions},
	Error, Tick,
};
use signal_hook::{consts, SigId};
use std::{
	path::PathBuf,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

const LOG_TARGET: &str = "prefork::server";

/// The callables a [`Server`] drives.
///
/// `run` is the iteration body. The signal hooks default to ignoring the
/// signal, except `int` and `term`, which default to requesting a graceful
/// shutdown by returning [`Tick::Stop`].
pub trait Service: Send + Sync + 'static {
	/// One iteration of service work.
	fn run(&self) -> Result<Tick, Error>;

	/// Called before the loop thread starts.
	fn before_starting(&self) {}

	/// Called once the loop thread exists.
	fn after_starting(&self) {}

	/// Called on the loop thread before the wind-down completes.
	fn before_stopping(&self) {}

	/// Called on the loop thread as the final step of the wind-down. Once
	/// this returns, a `startup(wait = true)` caller is released.
	fn after_stopping(&self) {}

	/// `SIGHUP` hook.
	fn hup(&self) {}

	/// `SIGUSR1` hook.
	fn usr1(&self) {}

	/// `SIGUSR2` hook.
	fn usr2(&self) {}

	/// `SIGINT` hook.
	fn int(&self) -> Tick {
		Tick::Stop
	}

	/// `SIGTERM` hook.
	fn term(&self) -> Tick {
		Tick::Stop
	}
}

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerOptions {
	/// Pause between service iterations.
	pub interval: Duration,
	/// Directory the pid file is placed in.
	pub pid_dir: PathBuf,
	/// Mode of the pid file.
	pub pid_mode: u32,
}

impl Default for ServerOptions {
	fn default() -> Self {
		ServerOptions {
			interval: Duration::from_secs(1),
			pid_dir: PathBuf::from("."),
			pid_mode: 0o640,
		}
	}
}

struct Flags {
	hup: Arc<AtomicBool>,
	int: Arc<AtomicBool>,
	term: Arc<AtomicBool>,
	usr1: Arc<AtomicBool>,
	usr2: Arc<AtomicBool>,
}

impl Flags {
	fn new() -> Self {
		Flags {
			hup: Arc::new(AtomicBool::new(false)),
			int: Arc::new(AtomicBool::new(false)),
			term: Arc::new(AtomicBool::new(false)),
			usr1: Arc::new(AtomicBool::new(false)),
			usr2: Arc::new(AtomicBool::new(false)),
		}
	}
}

struct Shared<S: Service> {
	service: Arc<S>,
	pidfile: Mutex<PidFile>,
	flags: Flags,
	shutdown_requested: AtomicBool,
	done: Mutex<bool>,
	done_cond: Condvar,
}

impl<S: Service> Shared<S> {
	/// The full wind-down, run on the loop thread just before it ends:
	/// user hooks around the pid file removal, then the completion signal.
	fn wind_down(&self) {
		self.service.before_stopping();
		if let Err(err) = self.pidfile.lock().delete() {
			tracing::warn!(target: LOG_TARGET, "failed to remove pid file: {}", err);
		}
		self.service.after_stopping();
		*self.done.lock() = true;
		self.done_cond.notify_all();
	}

	fn await_done(&self) {
		let mut done = self.done.lock();
		while !*done {
			self.done_cond.wait(&mut done);
		}
	}
}

struct ServerLoop<S: Service> {
	shared: Arc<Shared<S>>,
}

impl<S: Service> Activity for ServerLoop<S> {
	fn run(&self) -> Result<Tick, Error> {
		let shared = &self.shared;
		let flags = &shared.flags;

		if flags.term.swap(false, Ordering::SeqCst) && shared.service.term() == Tick::Stop {
			shared.wind_down();
			return Ok(Tick::Stop)
		}
		if flags.int.swap(false, Ordering::SeqCst) && shared.service.int() == Tick::Stop {
			shared.wind_down();
			return Ok(Tick::Stop)
		}
		if shared.shutdown_requested.swap(false, Ordering::SeqCst) {
			shared.wind_down();
			return Ok(Tick::Stop)
		}
		if flags.hup.swap(false, Ordering::SeqCst) {
			shared.service.hup();
		}
		if flags.usr1.swap(false, Ordering::SeqCst) {
			shared.service.usr1();
		}
		if flags.usr2.swap(false, Ordering::SeqCst) {
			shared.service.usr2();
		}

		match shared.service.run() {
			Ok(Tick::Continue) => Ok(Tick::Continue),
			Ok(Tick::Stop) => {
				shared.wind_down();
				Ok(Tick::Stop)
			},
			Err(err) => {
				// The loop terminates on an unhandled failure; complete the
				// wind-down so waiting callers are released before the error
				// is stored.
				shared.wind_down();
				Err(err)
			},
		}
	}

	fn before_starting(&self) {
		self.shared.service.before_starting();
	}

	fn after_starting(&self) {
		self.shared.service.after_starting();
	}
}

/// A single-process service host.
pub struct Server<S: Service> {
	name: String,
	shared: Arc<Shared<S>>,
	runner: Runner<ServerLoop<S>>,
	sig_ids: Vec<SigId>,
}

impl<S: Service> Server<S> {
	/// A server named `name`, hosting `service`.
	pub fn new(name: impl Into<String>, service: S, options: ServerOptions) -> Self {
		let name = name.into();
		let pidfile =
			PidFile::new(name.clone()).in_dir(options.pid_dir.clone()).with_mode(options.pid_mode);
		let shared = Arc::new(Shared {
			service: Arc::new(service),
			pidfile: Mutex::new(pidfile),
			flags: Flags::new(),
			shutdown_requested: AtomicBool::new(false),
			done: Mutex::new(false),
			done_cond: Condvar::new(),
		});
		let mut runner_options = RunnerOptions::default();
		runner_options.interval = options.interval;
		let runner =
			Runner::with_options(ServerLoop { shared: Arc::clone(&shared) }, runner_options);
		Server { name, shared, runner, sig_ids: Vec::new() }
	}

	/// The server name.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// The hosted service.
	pub fn service(&self) -> &Arc<S> {
		&self.shared.service
	}

	/// Whether the loop is currently running.
	pub fn running(&self) -> bool {
		self.runner.running()
	}

	/// Acquire the pid file, install the signal routing and start the loop.
	///
	/// With `wait` set, this call only returns after a shutdown has fully
	/// completed, including the service's `after_stopping`.
	pub fn startup(&mut self, wait: bool) -> Result<(), Error> {
		{
			let mut pidfile = self.shared.pidfile.lock();
			if let (Some(pid), Some(true)) = (pidfile.pid(), pidfile.alive()) {
				return Err(Error::AlreadyStarted(pid))
			}
			pidfile.write()?;
		}
		*self.shared.done.lock() = false;
		self.shared.shutdown_requested.store(false, Ordering::SeqCst);
		self.install_signal_routing()?;
		tracing::info!(target: LOG_TARGET, name = %self.name, "server starting");
		self.runner.start()?;
		if wait {
			self.shared.await_done();
			self.runner.join(None)?;
		}
		Ok(())
	}

	/// Request a graceful shutdown and wait for it to complete. Idempotent;
	/// callable from any thread.
	pub fn shutdown(&mut self) {
		if !self.runner.running() {
			self.remove_signal_routing();
			return
		}
		tracing::info!(target: LOG_TARGET, name = %self.name, "server shutting down");
		self.shared.shutdown_requested.store(true, Ordering::SeqCst);
		self.runner.wake();
		self.shared.await_done();
		let _ = self.runner.join(None);
		self.remove_signal_routing();
	}

	fn install_signal_routing(&mut self) -> Result<(), Error> {
		let flags = &self.shared.flags;
		let routes = [
			(consts::SIGHUP, &flags.hup),
			(consts::SIGINT, &flags.int),
			(consts::SIGTERM, &flags.term),
			(consts::SIGUSR1, &flags.usr1),
			(consts::SIGUSR2, &flags.usr2),
		];
		for (signal, flag) in routes {
			let id = signal_hook::flag::register(signal, Arc::clone(flag))?;
			self.sig_ids.push(id);
		}
		Ok(())
	}

	/// Handlers are process-global state; give them back so the next server
	/// (or test) starts from a clean slate.
	fn remove_signal_routing(&mut self) {
		for id in self.sig_ids.drain(..) {
			signal_hook::low_level::unregister(id);
		}
	}
}

impl<S: Service> Drop for Server<S> {
	fn drop(&mut self) {
		self.remove_signal_routing();
	}
}
