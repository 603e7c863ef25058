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

//! Building blocks for long-running UNIX service processes.
//!
//! The crate is organised bottom up:
//!
//! - [`frame`]: the self-delimited records exchanged across a pipe, control
//!   tags and payloads alike.
//! - [`piper`]: a bidirectional, framed, timeout-aware channel across a fork
//!   boundary, plus the daemonization primitive built on it.
//! - [`runner`]: a cooperative run loop with lifecycle hooks, used by the
//!   per-worker supervisors here and by long-lived server objects elsewhere.
//! - [`worker`] and [`pool`]: the prefork worker pool. Each worker is one
//!   forked child driving a user-supplied capability set under a heartbeat
//!   protocol, supervised from the parent with timeout enforcement,
//!   HUP-initiated in-place replacement, and zombie reaping.
//!
//! Everything here assumes POSIX fork and signal semantics.

#![warn(missing_docs)]

#[cfg(not(unix))]
compile_error!("prefork requires a POSIX platform with fork(2) and signals");

pub mod error;
pub mod frame;
pub mod piper;
pub mod pool;
pub mod runner;
pub mod worker;

pub use error::{Error, RemoteError};
pub use frame::{Frame, Tag};
pub use piper::{resolve_signal, Mode, Piper, Received};
pub use pool::{Pool, DEFAULT_HEARTBEAT_TIMEOUT};
pub use runner::{Activity, Runner, RunnerOptions, Tick};
pub use worker::{Capabilities, ExecuteFn, Worker};

/// Whether this build can fork worker processes at all.
pub const FORK_AVAILABLE: bool = cfg!(unix);
