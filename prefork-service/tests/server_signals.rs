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

//! Signal routing is process-global, so everything signal-driven lives in
//! this one test to keep deliveries from crossing test boundaries.

use nix::{sys::signal::Signal, unistd::Pid};
use prefork::{Error, Tick};
use prefork_service::{Server, ServerOptions, Service};
use std::{
	sync::atomic::{AtomicBool, Ordering},
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
struct Hooked {
	hupped: AtomicBool,
	usr1ed: AtomicBool,
	stopped: AtomicBool,
}

impl Service for Hooked {
	fn run(&self) -> Result<Tick, Error> {
		Ok(Tick::Continue)
	}

	fn hup(&self) {
		self.hupped.store(true, Ordering::SeqCst);
	}

	fn usr1(&self) {
		self.usr1ed.store(true, Ordering::SeqCst);
	}

	fn after_stopping(&self) {
		self.stopped.store(true, Ordering::SeqCst);
	}
}

#[test]
fn signals_route_to_hooks_and_term_shuts_down() {
	let dir = tempfile::tempdir().unwrap();
	let mut options = ServerOptions::default();
	options.interval = Duration::from_millis(10);
	options.pid_dir = dir.path().to_owned();
	let mut server = Server::new("Signal Test", Hooked::default(), options);

	server.startup(false).unwrap();
	let own_pid = Pid::this();

	nix::sys::signal::kill(own_pid, Signal::SIGHUP).unwrap();
	assert!(eventually(Duration::from_secs(3), || {
		server.service().hupped.load(Ordering::SeqCst)
	}));

	nix::sys::signal::kill(own_pid, Signal::SIGUSR1).unwrap();
	assert!(eventually(Duration::from_secs(3), || {
		server.service().usr1ed.load(Ordering::SeqCst)
	}));

	// Neither user signal ended the loop.
	assert!(server.running());

	nix::sys::signal::kill(own_pid, Signal::SIGTERM).unwrap();
	assert!(eventually(Duration::from_secs(3), || !server.running()));
	assert!(server.service().stopped.load(Ordering::SeqCst));
	assert!(!dir.path().join("signal_test.pid").exists());
}
