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

//! Server lifecycle without signals; signal routing has its own test binary
//! because delivery is process-global.

use prefork::{Error, Tick};
use prefork_service::{Server, ServerOptions, Service};
use std::{
	path::PathBuf,
	sync::atomic::{AtomicBool, AtomicU64, Ordering},
	thread,
	time::{Duration, Instant},
};

fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
	let deadline = Instant::now() + limit;
	while Instant::now() < deadline {
		if condition() {
			return true
		}
		thread::sleep(Duration::from_millis(10));
	}
	condition()
}

#[derive(Default)]
struct Counting {
	runs: AtomicU64,
	stop_after: Option<u64>,
	stopped: AtomicBool,
}

impl Service for Counting {
	fn run(&self) -> Result<Tick, Error> {
		let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
		match self.stop_after {
			Some(limit) if runs >= limit => Ok(Tick::Stop),
			_ => Ok(Tick::Continue),
		}
	}

	fn after_stopping(&self) {
		self.stopped.store(true, Ordering::SeqCst);
	}
}

fn options(dir: PathBuf) -> ServerOptions {
	let mut options = ServerOptions::default();
	options.interval = Duration::from_millis(10);
	options.pid_dir = dir;
	options
}

#[test]
fn the_pid_file_spans_the_server_lifetime() {
	let dir = tempfile::tempdir().unwrap();
	let mut server =
		Server::new("Lifetime Test", Counting::default(), options(dir.path().to_owned()));
	let pid_path = dir.path().join("lifetime_test.pid");

	server.startup(false).unwrap();
	assert!(pid_path.exists());
	assert!(eventually(Duration::from_secs(3), || {
		server.service().runs.load(Ordering::SeqCst) > 0
	}));

	server.shutdown();
	assert!(!server.running());
	assert!(!pid_path.exists());
	assert!(server.service().stopped.load(Ordering::SeqCst));

	// A second shutdown has nothing left to do.
	server.shutdown();
}

#[test]
fn a_waiting_startup_returns_only_after_the_wind_down() {
	let dir = tempfile::tempdir().unwrap();
	let service = Counting { stop_after: Some(3), ..Counting::default() };
	let mut server = Server::new("Waiting Test", service, options(dir.path().to_owned()));

	server.startup(true).unwrap();

	// The service stopped itself; by the time startup returns the wind-down
	// has completed, hooks included.
	assert!(server.service().stopped.load(Ordering::SeqCst));
	assert_eq!(server.service().runs.load(Ordering::SeqCst), 3);
	assert!(!dir.path().join("waiting_test.pid").exists());
}

#[test]
fn startup_refuses_a_recorded_alive_pid() {
	let dir = tempfile::tempdir().unwrap();
	let mut first =
		Server::new("Contended", Counting::default(), options(dir.path().to_owned()));
	first.startup(false).unwrap();

	let mut second =
		Server::new("Contended", Counting::default(), options(dir.path().to_owned()));
	match second.startup(false) {
		Err(Error::AlreadyStarted(pid)) => assert_eq!(pid, std::process::id() as i32),
		other => panic!("expected AlreadyStarted, got {:?}", other),
	}

	first.shutdown();
}
