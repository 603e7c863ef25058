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

//! End-to-end behavior of the prefork pool: fixed-size start and stop,
//! HUP-initiated replacement, sizing bounds, and timeout enforcement.

use assert_matches::assert_matches;
use prefork::{resolve_signal, Capabilities, Error, Pool};
use std::{
	collections::BTreeSet,
	fs,
	path::PathBuf,
	thread,
	time::{Duration, Instant},
};

/// Waits until `condition` holds, polling every 25ms, up to `limit`.
fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
	let deadline = Instant::now() + limit;
	while Instant::now() < deadline {
		if condition() {
			return true
		}
		thread::sleep(Duration::from_millis(25));
	}
	condition()
}

/// Each child advertises itself with a `<pid>.txt` marker file and removes
/// the marker on the way out, on the halt and the term path alike.
#[derive(Clone)]
struct TouchFile {
	dir: PathBuf,
	pause: Duration,
}

impl TouchFile {
	fn marker(&self) -> PathBuf {
		self.dir.join(format!("{}.txt", std::process::id()))
	}
}

impl Capabilities for TouchFile {
	fn before_executing(&mut self) -> Result<(), Error> {
		fs::create_dir_all(&self.dir)?;
		Ok(())
	}

	fn execute(&mut self) -> Result<(), Error> {
		fs::write(self.marker(), b"alive")?;
		thread::sleep(self.pause);
		Ok(())
	}

	fn after_executing(&mut self) -> Result<(), Error> {
		let _ = fs::remove_file(self.marker());
		Ok(())
	}

	fn term(&mut self) -> Result<(), Error> {
		let _ = fs::remove_file(self.marker());
		Ok(())
	}
}

fn marker_pids(dir: &PathBuf) -> BTreeSet<u32> {
	fs::read_dir(dir)
		.map(|entries| {
			entries
				.filter_map(|entry| entry.ok())
				.filter_map(|entry| {
					entry
						.path()
						.file_stem()
						.and_then(|stem| stem.to_str())
						.and_then(|stem| stem.parse::<u32>().ok())
				})
				.collect()
		})
		.unwrap_or_default()
}

#[test]
fn a_started_pool_runs_one_child_per_slot_and_stops_clean() {
	let dir = tempfile::tempdir().unwrap();
	let caps = TouchFile { dir: dir.path().to_owned(), pause: Duration::from_millis(50) };
	let mut pool = Pool::new(caps).with_heartbeat(Duration::from_secs(2));

	pool.start(4).unwrap();
	assert_eq!(pool.len(), 4);
	assert!(eventually(Duration::from_secs(3), || pool.workers().iter().all(|w| w.alive())));

	// Every slot advertises the PID the parent knows it by.
	let dir_path = dir.path().to_owned();
	assert!(eventually(Duration::from_secs(3), || marker_pids(&dir_path).len() == 4));
	let advertised = marker_pids(&dir_path);
	let known: BTreeSet<u32> =
		pool.workers().iter().filter_map(|w| w.pid()).map(|pid| pid.as_raw() as u32).collect();
	assert_eq!(advertised, known);

	pool.stop();
	assert!(pool.workers().iter().all(|w| !w.alive()));
	assert_eq!(pool.pending_harvest(), 0);
	assert!(eventually(Duration::from_secs(2), || marker_pids(&dir_path).is_empty()));
}

#[test]
fn a_pool_built_from_a_bare_execute_runs() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("beat.txt");
	let target = path.clone();
	let mut pool = Pool::from_fn(move || {
		fs::write(&target, b"beat")?;
		thread::sleep(Duration::from_millis(20));
		Ok(())
	})
	.with_heartbeat(Duration::from_secs(2));

	pool.start(1).unwrap();
	assert!(eventually(Duration::from_secs(3), || path.exists()));

	pool.each_worker(|worker| {
		assert!(worker.alive());
		assert!(!worker.stop_requested());
		// A healthy child has nothing to reap yet.
		let still_running = worker
			.wait()
			.map(|status| matches!(status, nix::sys::wait::WaitStatus::StillAlive))
			.unwrap_or(true);
		assert!(still_running);
	});

	pool.stop();
	assert!(pool.workers().iter().all(|w| !w.alive()));
}

#[test]
fn hup_replaces_a_child_in_its_slot() {
	let dir = tempfile::tempdir().unwrap();
	let caps = TouchFile { dir: dir.path().to_owned(), pause: Duration::from_millis(10) };
	let mut pool = Pool::new(caps).with_heartbeat(Duration::from_secs(2));

	pool.start(2).unwrap();
	let original = pool.workers()[1].pid().unwrap();

	pool.workers()[1].signal(resolve_signal("HUP").unwrap()).unwrap();

	assert!(eventually(Duration::from_secs(5), || {
		pool.workers()[1].pid().map(|pid| pid != original).unwrap_or(false)
	}));
	assert!(eventually(Duration::from_secs(5), || {
		nix::sys::signal::kill(original, None).is_err()
	}));

	// The slot count is unchanged and the replacement is being supervised.
	assert_eq!(pool.len(), 2);
	assert!(eventually(Duration::from_secs(3), || pool.workers()[1].alive()));
	assert!(pool.workers()[1].error().is_none());

	pool.reap();
	pool.stop();
}

#[test]
fn add_workers_respects_the_maximum_cap() {
	let dir = tempfile::tempdir().unwrap();
	let caps = TouchFile { dir: dir.path().to_owned(), pause: Duration::from_millis(10) };
	let mut pool =
		Pool::new(caps).with_heartbeat(Duration::from_secs(2)).with_max_workers(3);

	pool.start(2).unwrap();
	pool.add_workers(2).unwrap();
	assert_eq!(pool.len(), 3);

	// At the cap, further growth is a no-op.
	pool.add_workers(5).unwrap();
	assert_eq!(pool.len(), 3);

	pool.stop();
}

#[test]
fn ensure_pool_size_restores_the_minimum() {
	let dir = tempfile::tempdir().unwrap();
	let caps = TouchFile { dir: dir.path().to_owned(), pause: Duration::from_millis(10) };
	let mut pool =
		Pool::new(caps).with_heartbeat(Duration::from_secs(2)).with_min_workers(3);

	pool.start(1).unwrap();
	pool.ensure_worker_pool_size().unwrap();
	assert_eq!(pool.len(), 3);
	assert!(eventually(Duration::from_secs(3), || {
		pool.workers().iter().filter(|w| w.alive()).count() == 3
	}));

	pool.stop();
}

#[test]
fn a_stalled_execute_is_recorded_and_the_child_terminated() {
	let dir = tempfile::tempdir().unwrap();
	// The pause is far past the heartbeat timeout, so every round times out.
	let caps = TouchFile { dir: dir.path().to_owned(), pause: Duration::from_millis(1500) };
	let mut pool = Pool::new(caps).with_heartbeat(Duration::from_millis(300));

	pool.start(2).unwrap();

	assert!(eventually(Duration::from_secs(3), || {
		pool.workers().iter().all(|w| w.error().is_some())
	}));
	let mut failures = 0;
	pool.errors(|worker| {
		assert_matches!(worker.error(), Some(Error::Timeout(_)));
		failures += 1;
	});
	assert_eq!(failures, 2);

	assert!(eventually(Duration::from_secs(3), || pool.workers().iter().all(|w| !w.alive())));

	// Dead slots are dropped, and the minimum (unset here) demands nothing.
	pool.prune_workers();
	assert_eq!(pool.len(), 0);

	pool.stop();
	assert_eq!(pool.pending_harvest(), 0);
}
