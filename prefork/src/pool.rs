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

//! A pool of heartbeat-supervised worker processes.
//!
//! The pool owns an ordered list of [`Worker`]s, clones one [`Capabilities`]
//! set into each, and offers the control surface: start a fixed count, stop
//! everything, reap exited children, and resize dynamically under optional
//! minimum and maximum bounds. Individual worker failures never surface as
//! pool errors; they are recorded per worker and visited through
//! [`Pool::errors`].

use crate::{
	error::Error,
	worker::{Capabilities, ExecuteFn, Worker},
};
use nix::{
	errno::Errno,
	sys::wait::waitpid,
	unistd::Pid,
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};

const LOG_TARGET: &str = "prefork::pool";

/// Heartbeat timeout applied when the caller does not configure one.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// PIDs of exited child generations awaiting a blocking `waitpid`.
///
/// Supervisors append from their own threads; [`Pool::reap`] drains with an
/// atomic swap and waits on the drained batch without holding the lock.
#[derive(Clone, Default)]
pub(crate) struct Harvest(Arc<Mutex<Vec<Pid>>>);

impl Harvest {
	pub(crate) fn push(&self, pid: Pid) {
		self.0.lock().push(pid);
	}

	fn drain(&self) -> Vec<Pid> {
		std::mem::take(&mut *self.0.lock())
	}

	fn len(&self) -> usize {
		self.0.lock().len()
	}
}

/// A prefork pool of supervised worker processes.
pub struct Pool<C: Capabilities> {
	caps: C,
	workers: Vec<Worker<C>>,
	timeout: Duration,
	min_workers: Option<usize>,
	max_workers: Option<usize>,
	harvest: Harvest,
}

impl<F> Pool<ExecuteFn<F>>
where
	F: FnMut() -> Result<(), Error> + Clone + Send + 'static,
{
	/// A pool whose capability set has a bare `execute` as its sole member.
	pub fn from_fn(execute: F) -> Self {
		Pool::new(ExecuteFn(execute))
	}
}

impl<C: Capabilities> Pool<C> {
	/// A pool that will install `caps` into every worker it starts.
	pub fn new(caps: C) -> Self {
		Pool {
			caps,
			workers: Vec::new(),
			timeout: DEFAULT_HEARTBEAT_TIMEOUT,
			min_workers: None,
			max_workers: None,
			harvest: Harvest::default(),
		}
	}

	/// Replace the heartbeat timeout enforced on every worker round trip.
	pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	/// Lower bound restored by [`Pool::ensure_worker_pool_size`].
	pub fn with_min_workers(mut self, min: usize) -> Self {
		self.min_workers = Some(min);
		self
	}

	/// Upper bound enforced by [`Pool::add_workers`].
	pub fn with_max_workers(mut self, max: usize) -> Self {
		self.max_workers = Some(max);
		self
	}

	/// Start `count` fresh workers.
	///
	/// Any previous worker list is discarded, so a running pool is expected
	/// to be stopped first.
	pub fn start(&mut self, count: usize) -> Result<(), Error> {
		self.workers.clear();
		tracing::info!(target: LOG_TARGET, count, "starting worker pool");
		for _ in 0..count {
			self.spawn_worker()?;
		}
		Ok(())
	}

	/// Stop every worker in order, then clear the zombies. Returns after all
	/// children have been awaited.
	pub fn stop(&mut self) {
		tracing::info!(target: LOG_TARGET, workers = self.workers.len(), "stopping worker pool");
		for worker in &mut self.workers {
			worker.stop(None);
		}
		self.reap();
	}

	/// Blocking-wait every harvested PID, clearing zombies. A no-op when the
	/// harvest list is empty.
	pub fn reap(&mut self) {
		for pid in self.harvest.drain() {
			match waitpid(pid, None) {
				Ok(status) => {
					tracing::debug!(target: LOG_TARGET, %pid, ?status, "reaped worker child");
				},
				// Already collected elsewhere, or never ours to begin with.
				Err(Errno::ECHILD) => {},
				Err(errno) => {
					tracing::warn!(target: LOG_TARGET, %pid, "waitpid failed: {}", errno);
				},
			}
		}
	}

	/// Append up to `count` workers, bounded by the maximum worker cap when
	/// one is set, and start them.
	pub fn add_workers(&mut self, count: usize) -> Result<(), Error> {
		let count = match self.max_workers {
			Some(max) => count.min(max.saturating_sub(self.workers.len())),
			None => count,
		};
		for _ in 0..count {
			self.spawn_worker()?;
		}
		Ok(())
	}

	/// Drop workers whose child is not alive.
	pub fn prune_workers(&mut self) {
		let before = self.workers.len();
		self.workers.retain(|worker| worker.alive());
		let pruned = before - self.workers.len();
		if pruned > 0 {
			tracing::debug!(target: LOG_TARGET, pruned, "pruned dead workers");
		}
	}

	/// Grow the pool back to the configured minimum of alive workers,
	/// subject to the maximum cap. A no-op without a configured minimum.
	pub fn ensure_worker_pool_size(&mut self) -> Result<(), Error> {
		let min = match self.min_workers {
			Some(min) => min,
			None => return Ok(()),
		};
		let alive = self.workers.iter().filter(|worker| worker.alive()).count();
		let deficit = min.saturating_sub(alive);
		if deficit > 0 {
			tracing::info!(target: LOG_TARGET, deficit, "restoring worker pool size");
			self.add_workers(deficit)?;
		}
		Ok(())
	}

	/// Visit every worker in slot order.
	pub fn each_worker(&self, mut f: impl FnMut(&Worker<C>)) {
		for worker in &self.workers {
			f(worker);
		}
	}

	/// Visit only the workers with a recorded error.
	pub fn errors(&self, mut f: impl FnMut(&Worker<C>)) {
		for worker in &self.workers {
			if worker.error().is_some() {
				f(worker);
			}
		}
	}

	/// The worker list in slot order.
	pub fn workers(&self) -> &[Worker<C>] {
		&self.workers
	}

	/// Number of workers in the list, dead or alive.
	pub fn len(&self) -> usize {
		self.workers.len()
	}

	/// Whether the worker list is empty.
	pub fn is_empty(&self) -> bool {
		self.workers.is_empty()
	}

	/// PIDs still awaiting a blocking wait.
	pub fn pending_harvest(&self) -> usize {
		self.harvest.len()
	}

	fn spawn_worker(&mut self) -> Result<(), Error> {
		let mut worker = Worker::new(self.caps.clone(), self.timeout, self.harvest.clone());
		worker.start()?;
		self.workers.push(worker);
		Ok(())
	}
}
