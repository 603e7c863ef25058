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

//! Service-process collaborators built on the `prefork` core.
//!
//! - [`pidfile`]: one decimal PID on disk, owned for a process lifetime.
//! - [`server`]: a single-process service host on an activity loop, with
//!   signal routing and a pid file.
//! - [`daemon`]: detach-from-TTY mechanics plus evidence-based startup.
//! - [`child`]: one external command under a timeout with kill escalation.

#![warn(missing_docs)]

#[cfg(not(unix))]
compile_error!("prefork-service requires a POSIX platform");

pub mod child;
pub mod daemon;
pub mod pidfile;
pub mod server;

pub use child::Child;
pub use daemon::{Daemon, LookFor, Startup};
pub use pidfile::PidFile;
pub use server::{Server, ServerOptions, Service};
