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

//! A cooperative run loop with lifecycle hooks.
//!
//! A [`Runner`] hosts the lifecycle (start, stop, join, wake) and drives an
//! [`Activity`] on a dedicated thread: wait the interval, call `run`, repeat.
//! The activity decides each tick whether the loop continues. Everything the
//! loop owns is interruptible, so `stop` never waits longer than one
//! iteration plus the configured interval.

use crate::error::Error;
use parking_lot::{Condvar, Mutex};
use std::{
	sync::Arc,
	thread,
	time::{Duration, Instant},
};

const LOG_TARGET: &str = "prefork::runner";

/// What the loop should do after one iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
	/// Wait the interval and run again.
	Continue,
	/// Leave the loop cleanly.
	Stop,
}

/// The object a [`Runner`] drives.
///
/// `run` is the required iteration body. The hooks default to no-ops and are
/// called exactly once per lifecycle transition: the starting pair around
/// thread creation, the stopping pair from [`Runner::stop`]. Hooks run on the
/// controlling thread and outside any loop-internal lock, so an activity is
/// free to take its own locks there.
pub trait Activity: Send + Sync + 'static {
	/// One iteration of the loop.
	fn run(&self) -> Result<Tick, Error>;

	/// Called before the activity thread is created.
	fn before_starting(&self) {}

	/// Called right after the activity thread is created. May execute
	/// concurrently with the first iteration; no ordering between the two is
	/// guaranteed.
	fn after_starting(&self) {}

	/// Called by `stop` before the loop is asked to wind down.
	fn before_stopping(&self) {}

	/// Called by `stop` once the loop has been joined.
	fn after_stopping(&self) {}
}

/// Loop configuration.
#[derive(Clone, Debug)]
pub struct RunnerOptions {
	/// Pause between iterations. Zero means run back to back.
	pub interval: Duration,
	/// Warn when an iteration overruns the interval.
	pub strict_interval: bool,
	/// Log iteration failures and keep looping instead of terminating.
	pub continue_on_error: bool,
	max_iterations: Option<u64>,
}

impl Default for RunnerOptions {
	fn default() -> Self {
		RunnerOptions {
			interval: Duration::ZERO,
			strict_interval: false,
			continue_on_error: false,
			max_iterations: None,
		}
	}
}

impl RunnerOptions {
	/// Bound the loop to at most `count` iterations. Zero is rejected.
	pub fn max_iterations(mut self, count: u64) -> Result<Self, Error> {
		if count == 0 {
			return Err(Error::Argument("max_iterations must be at least 1".to_owned()))
		}
		self.max_iterations = Some(count);
		Ok(self)
	}
}

#[derive(Default)]
struct LoopState {
	running: bool,
	finished: bool,
	iterations: u64,
	wakes: u64,
	failure: Option<Error>,
}

struct Shared {
	state: Mutex<LoopState>,
	cond: Condvar,
}

/// Hosts the lifecycle of one activity loop.
pub struct Runner<A: Activity> {
	activity: Arc<A>,
	options: RunnerOptions,
	shared: Arc<Shared>,
	handle: Option<thread::JoinHandle<()>>,
	/// `before_stopping` has been delivered and its matching
	/// `after_stopping` is still owed.
	stopping: bool,
}

impl<A: Activity> Runner<A> {
	/// A runner with default options.
	pub fn new(activity: A) -> Self {
		Self::with_options(activity, RunnerOptions::default())
	}

	/// A runner with explicit options.
	pub fn with_options(activity: A, options: RunnerOptions) -> Self {
		Runner {
			activity: Arc::new(activity),
			options,
			shared: Arc::new(Shared { state: Mutex::new(LoopState::default()), cond: Condvar::new() }),
			handle: None,
			stopping: false,
		}
	}

	/// The hosted activity.
	pub fn activity(&self) -> &Arc<A> {
		&self.activity
	}

	/// Whether the loop is currently marked running.
	pub fn running(&self) -> bool {
		self.shared.state.lock().running
	}

	/// Iterations completed since the last start.
	pub fn iterations(&self) -> u64 {
		self.shared.state.lock().iterations
	}

	/// Launch the activity thread. A no-op while the loop is running.
	pub fn start(&mut self) -> Result<(), Error> {
		{
			let mut state = self.shared.state.lock();
			// A loop that is still winding down counts as running; flipping
			// the flag back on here would leave two threads alive.
			if state.running || (self.handle.is_some() && !state.finished) {
				return Ok(())
			}
			state.running = true;
			state.finished = false;
			state.iterations = 0;
			state.failure = None;
		}
		self.stopping = false;
		// Collect a previous generation's thread before replacing the handle.
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}

		self.activity.before_starting();
		let activity = Arc::clone(&self.activity);
		let shared = Arc::clone(&self.shared);
		let options = self.options.clone();
		let spawned = thread::Builder::new()
			.name("activity-loop".to_owned())
			.spawn(move || activity_loop(activity, shared, options));
		match spawned {
			Ok(handle) => {
				self.handle = Some(handle);
				self.activity.after_starting();
				Ok(())
			},
			Err(err) => {
				let mut state = self.shared.state.lock();
				state.running = false;
				state.finished = true;
				Err(err.into())
			},
		}
	}

	/// Interrupt an interval wait without changing the running flag; the
	/// next iteration begins immediately.
	pub fn wake(&self) {
		self.shared.state.lock().wakes += 1;
		self.shared.cond.notify_all();
	}

	/// Ask the loop to wind down and wait up to `limit` for the thread to
	/// terminate. A no-op from the idle state: never started, already
	/// collected, or self-terminated.
	///
	/// The stopping hooks fire exactly once per transition: `before_stopping`
	/// when the wind-down is requested, `after_stopping` only once the
	/// thread has terminated and been joined. If `limit` expires first, a
	/// later `stop` retries the join and delivers the owed `after_stopping`
	/// without repeating `before_stopping`.
	pub fn stop(&mut self, limit: Option<Duration>) {
		if self.handle.is_none() {
			return
		}
		if !self.stopping {
			if self.shared.state.lock().finished {
				// The loop already ended on its own; there is nothing to
				// stop. Collect the thread quietly.
				if let Some(handle) = self.handle.take() {
					let _ = handle.join();
				}
				return
			}
			self.shared.state.lock().running = false;
			self.activity.before_stopping();
			self.stopping = true;
			self.shared.cond.notify_all();
		}
		if self.wait_finished(limit) {
			if let Some(handle) = self.handle.take() {
				let _ = handle.join();
			}
			self.stopping = false;
			self.activity.after_stopping();
		}
	}

	/// Block until the activity thread terminates or `limit` expires.
	/// Returns immediately if the thread never started. A failure stored by
	/// the loop is handed to the first joiner.
	pub fn join(&mut self, limit: Option<Duration>) -> Result<(), Error> {
		if self.handle.is_none() {
			return Ok(())
		}
		if self.wait_finished(limit) {
			if let Some(handle) = self.handle.take() {
				let _ = handle.join();
			}
			if let Some(failure) = self.shared.state.lock().failure.take() {
				return Err(failure)
			}
		}
		Ok(())
	}

	/// Block until the loop stops running, or until `iter_limit` further
	/// iterations have completed, whichever comes first.
	pub fn wait(&self, iter_limit: Option<u64>) {
		let mut state = self.shared.state.lock();
		let target = iter_limit.map(|n| state.iterations.saturating_add(n));
		while state.running {
			if let Some(target) = target {
				if state.iterations >= target {
					break
				}
			}
			self.shared.cond.wait(&mut state);
		}
	}

	fn wait_finished(&self, limit: Option<Duration>) -> bool {
		let deadline = limit.map(|limit| Instant::now() + limit);
		let mut state = self.shared.state.lock();
		while !state.finished {
			match deadline {
				Some(deadline) => {
					let now = Instant::now();
					if now >= deadline {
						return false
					}
					self.shared.cond.wait_for(&mut state, deadline - now);
				},
				None => self.shared.cond.wait(&mut state),
			}
		}
		true
	}
}

fn activity_loop<A: Activity>(activity: Arc<A>, shared: Arc<Shared>, options: RunnerOptions) {
	loop {
		// The interval wait comes first so `stop` and `wake` can interrupt a
		// sleeping loop before the next iteration begins.
		{
			let mut state = shared.state.lock();
			if options.interval > Duration::ZERO && state.running {
				let deadline = Instant::now() + options.interval;
				let woken_at = state.wakes;
				while state.running && state.wakes == woken_at {
					let now = Instant::now();
					if now >= deadline {
						break
					}
					if shared.cond.wait_for(&mut state, deadline - now).timed_out() {
						break
					}
				}
			}
			if !state.running {
				break
			}
		}

		let begun = Instant::now();
		match activity.run() {
			Ok(Tick::Continue) => {},
			Ok(Tick::Stop) => {
				note_iteration(&shared);
				break
			},
			Err(err) =>
				if options.continue_on_error {
					tracing::error!(target: LOG_TARGET, "iteration failed, continuing: {}", err);
				} else {
					tracing::error!(target: LOG_TARGET, "iteration failed, loop terminating: {}", err);
					let mut state = shared.state.lock();
					state.failure = Some(err);
					break
				},
		}

		let iterations = note_iteration(&shared);
		if let Some(max) = options.max_iterations {
			if iterations >= max {
				break
			}
		}
		if options.strict_interval &&
			options.interval > Duration::ZERO &&
			begun.elapsed() > options.interval
		{
			tracing::warn!(
				target: LOG_TARGET,
				"iteration ran for {:?}, past the strict interval of {:?}",
				begun.elapsed(),
				options.interval,
			);
		}
	}

	let mut state = shared.state.lock();
	state.running = false;
	state.finished = true;
	shared.cond.notify_all();
}

fn note_iteration(shared: &Shared) -> u64 {
	let mut state = shared.state.lock();
	state.iterations += 1;
	shared.cond.notify_all();
	state.iterations
}

#[cfg(test)]
mod tests {
	use super::*;
	use assert_matches::assert_matches;
	use parking_lot::Mutex;
	use std::sync::atomic::{AtomicU64, Ordering};

	struct Counting {
		ticks: AtomicU64,
		trace: Mutex<Vec<&'static str>>,
		fail_on: Option<u64>,
		pause: Duration,
	}

	impl Counting {
		fn new(fail_on: Option<u64>) -> Self {
			Counting {
				ticks: AtomicU64::new(0),
				trace: Mutex::new(Vec::new()),
				fail_on,
				pause: Duration::ZERO,
			}
		}

		fn slow(pause: Duration) -> Self {
			Counting { pause, ..Counting::new(None) }
		}
	}

	impl Activity for Counting {
		fn run(&self) -> Result<Tick, Error> {
			let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
			if self.pause > Duration::ZERO {
				thread::sleep(self.pause);
			}
			if Some(tick) == self.fail_on {
				return Err(Error::Argument("scripted failure".to_owned()))
			}
			Ok(Tick::Continue)
		}

		fn before_starting(&self) {
			self.trace.lock().push("before_starting");
		}

		fn after_starting(&self) {
			self.trace.lock().push("after_starting");
		}

		fn before_stopping(&self) {
			self.trace.lock().push("before_stopping");
		}

		fn after_stopping(&self) {
			self.trace.lock().push("after_stopping");
		}
	}

	#[test]
	fn max_iterations_bounds_the_loop() {
		let options = RunnerOptions::default().max_iterations(3).unwrap();
		let mut runner = Runner::with_options(Counting::new(None), options);
		runner.start().unwrap();
		runner.join(Some(Duration::from_secs(5))).unwrap();
		assert_eq!(runner.iterations(), 3);
		assert!(!runner.running());
	}

	#[test]
	fn zero_max_iterations_is_rejected() {
		assert_matches!(RunnerOptions::default().max_iterations(0), Err(Error::Argument(_)));
	}

	#[test]
	fn stop_interrupts_a_sleeping_loop() {
		let mut options = RunnerOptions::default();
		options.interval = Duration::from_secs(60);
		let mut runner = Runner::with_options(Counting::new(None), options);
		runner.start().unwrap();
		let begun = Instant::now();
		runner.stop(Some(Duration::from_secs(5)));
		assert!(begun.elapsed() < Duration::from_secs(2));
		assert!(!runner.running());
	}

	#[test]
	fn join_reraises_a_stored_failure() {
		let mut runner = Runner::new(Counting::new(Some(2)));
		runner.start().unwrap();
		let err = runner.join(Some(Duration::from_secs(5))).unwrap_err();
		assert_matches!(err, Error::Argument(msg) if msg.contains("scripted"));
		// The failure is handed over exactly once.
		runner.join(Some(Duration::from_secs(1))).unwrap();
	}

	#[test]
	fn continue_on_error_keeps_the_loop_alive() {
		let mut options = RunnerOptions::default();
		options.continue_on_error = true;
		let options = options.max_iterations(4).unwrap();
		let mut runner = Runner::with_options(Counting::new(Some(2)), options);
		runner.start().unwrap();
		runner.join(Some(Duration::from_secs(5))).unwrap();
		assert_eq!(runner.activity().ticks.load(Ordering::SeqCst), 4);
	}

	#[test]
	fn wait_observes_iteration_progress() {
		let mut options = RunnerOptions::default();
		options.interval = Duration::from_millis(5);
		let mut runner = Runner::with_options(Counting::new(None), options);
		runner.start().unwrap();
		runner.wait(Some(2));
		assert!(runner.iterations() >= 2);
		runner.stop(Some(Duration::from_secs(5)));
	}

	#[test]
	fn stop_after_self_termination_fires_no_stopping_hooks() {
		let options = RunnerOptions::default().max_iterations(1).unwrap();
		let mut runner = Runner::with_options(Counting::new(None), options);
		runner.start().unwrap();
		runner.wait(None);
		// The loop ended on its own, so this stop finds an idle runner.
		runner.stop(Some(Duration::from_secs(1)));
		let trace = runner.activity().trace.lock().clone();
		assert_eq!(trace, vec!["before_starting", "after_starting"]);
	}

	#[test]
	fn after_stopping_waits_for_the_loop_to_actually_end() {
		let mut runner = Runner::new(Counting::slow(Duration::from_millis(300)));
		runner.start().unwrap();
		// Make sure an iteration is in flight before asking for too short a
		// join.
		while runner.activity().ticks.load(Ordering::SeqCst) == 0 {
			thread::sleep(Duration::from_millis(5));
		}
		runner.stop(Some(Duration::from_millis(10)));
		let trace = runner.activity().trace.lock().clone();
		assert_eq!(trace.last(), Some(&"before_stopping"));

		// The retry joins the now-finished loop and owes no repeat of
		// before_stopping.
		runner.stop(Some(Duration::from_secs(5)));
		let trace = runner.activity().trace.lock().clone();
		assert_eq!(
			trace,
			vec!["before_starting", "after_starting", "before_stopping", "after_stopping"],
		);
	}

	#[test]
	fn join_with_an_expired_limit_leaves_the_loop_running() {
		let mut options = RunnerOptions::default();
		options.interval = Duration::from_millis(5);
		let mut runner = Runner::with_options(Counting::new(None), options);
		runner.start().unwrap();
		runner.join(Some(Duration::from_millis(50))).unwrap();
		assert!(runner.running());
		runner.stop(Some(Duration::from_secs(5)));
	}

	#[test]
	fn wake_cuts_an_interval_short() {
		let mut options = RunnerOptions::default();
		options.interval = Duration::from_secs(60);
		let mut runner = Runner::with_options(Counting::new(None), options);
		runner.start().unwrap();
		// Without a wake the first iteration would be a minute away.
		let begun = Instant::now();
		while runner.iterations() == 0 && begun.elapsed() < Duration::from_secs(5) {
			runner.wake();
			thread::sleep(Duration::from_millis(10));
		}
		assert!(runner.iterations() >= 1);
		runner.stop(Some(Duration::from_secs(5)));
	}

	#[test]
	fn start_is_idempotent_and_stop_from_idle_is_a_no_op() {
		let mut runner = Runner::new(Counting::new(None));
		// Stopping a loop that never ran does nothing, including hooks.
		runner.stop(Some(Duration::from_millis(100)));
		assert!(runner.activity().trace.lock().is_empty());

		runner.start().unwrap();
		runner.start().unwrap();
		runner.stop(Some(Duration::from_secs(5)));
		let trace = runner.activity().trace.lock().clone();
		assert_eq!(
			trace,
			vec!["before_starting", "after_starting", "before_stopping", "after_stopping"],
		);
	}
}
