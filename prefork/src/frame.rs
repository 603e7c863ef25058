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

//! The frame layer of a [`Piper`](crate::piper::Piper).
//!
//! One frame on the wire is `u64-le length ‖ SCALE-encoded frame ‖ delimiter`.
//! Control frames encode with a leading NUL byte (variant index 0) followed by
//! the tag, so they can never collide with value frames (leading `0x01`) or
//! fault frames (leading `0x02`). The trailing delimiter is an integrity
//! check: a frame that does not end with it is treated as a protocol
//! violation rather than silently resynchronized.

use crate::error::RemoteError;
use parity_scale_codec::{Decode, Encode};
use std::io::{self, Read, Write};

/// Trailing delimiter appended to every frame, two network-order 16-bit words.
pub const FRAME_DELIMITER: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];

/// Upper bound on a single frame payload. A length prefix beyond this is
/// treated as stream corruption instead of being allocated.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One message on a piper: a control tag, an application value, or a
/// structured error marshalled by the peer.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum Frame<T> {
	/// Control tag of the supervision protocol.
	#[codec(index = 0)]
	Control(Tag),
	/// Opaque application payload.
	#[codec(index = 1)]
	Value(T),
	/// Structured error sent by the peer before it exited.
	#[codec(index = 2)]
	Fault(RemoteError),
}

/// The four control tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub enum Tag {
	/// Announces readiness (parent to child), or requests replacement
	/// (child to parent).
	Start,
	/// Orders the peer to wind down.
	Halt,
	/// Reserved tag for error signalling without a payload.
	Error,
	/// One leg of the liveness round trip.
	Heartbeat,
}

/// Short label for diagnostics and protocol-violation messages.
pub(crate) fn frame_label<T>(frame: &Frame<T>) -> &'static str {
	match frame {
		Frame::Control(Tag::Start) => "START",
		Frame::Control(Tag::Halt) => "HALT",
		Frame::Control(Tag::Error) => "ERROR",
		Frame::Control(Tag::Heartbeat) => "HEARTBEAT",
		Frame::Value(_) => "value",
		Frame::Fault(_) => "fault",
	}
}

/// Write one frame, length-prefixed and delimited, and flush.
///
/// The whole record is assembled first and handed to the kernel with a single
/// write call. Records that fit in `PIPE_BUF` are therefore delivered
/// atomically, which keeps an out-of-band HALT from interleaving with a
/// heartbeat in flight on the same descriptor.
pub(crate) fn framed_send_blocking(
	writer: &mut (impl Write + ?Sized),
	bytes: &[u8],
) -> io::Result<usize> {
	let mut record = Vec::with_capacity(8 + bytes.len() + FRAME_DELIMITER.len());
	record.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
	record.extend_from_slice(bytes);
	record.extend_from_slice(&FRAME_DELIMITER);
	writer.write_all(&record)?;
	writer.flush()?;
	Ok(record.len())
}

/// Read one length-prefixed frame and validate its delimiter.
pub(crate) fn framed_recv_blocking(reader: &mut (impl Read + ?Sized)) -> io::Result<Vec<u8>> {
	let mut len_buf = [0u8; 8];
	reader.read_exact(&mut len_buf)?;
	let len = u64::from_le_bytes(len_buf) as usize;
	if len > MAX_FRAME_LEN {
		return Err(io::Error::new(
			io::ErrorKind::InvalidData,
			format!("frame length {} exceeds the {} byte cap", len, MAX_FRAME_LEN),
		))
	}
	let mut bytes = vec![0u8; len];
	reader.read_exact(&mut bytes)?;
	let mut delimiter = [0u8; 4];
	reader.read_exact(&mut delimiter)?;
	if delimiter != FRAME_DELIMITER {
		return Err(io::Error::new(io::ErrorKind::InvalidData, "corrupt frame delimiter"))
	}
	Ok(bytes)
}

#[cfg(test)]
mod tests {
	use super::*;
	use assert_matches::assert_matches;

	// NOTE: the supervision protocol relies on control frames being
	// distinguishable from any payload encoding by their first byte alone.
	#[test]
	fn control_frames_carry_the_nul_sentinel() {
		for tag in [Tag::Start, Tag::Halt, Tag::Error, Tag::Heartbeat] {
			let encoded = Frame::<Vec<u8>>::Control(tag).encode();
			assert_eq!(encoded[0], 0x00);
		}
		let value = Frame::Value(vec![0u8; 4]).encode();
		assert_eq!(value[0], 0x01);
		let fault = Frame::<Vec<u8>>::Fault(RemoteError::Timeout(1)).encode();
		assert_eq!(fault[0], 0x02);
	}

	#[test]
	fn frames_survive_the_wire() {
		let frames = vec![
			Frame::Control(Tag::Heartbeat),
			Frame::Value("ten pin bowling".to_owned()),
			Frame::Fault(RemoteError::Raised("boom".to_owned())),
		];
		let mut wire = Vec::new();
		for frame in &frames {
			framed_send_blocking(&mut wire, &frame.encode()).unwrap();
		}
		let mut reader = wire.as_slice();
		for expected in &frames {
			let bytes = framed_recv_blocking(&mut reader).unwrap();
			let frame = Frame::<String>::decode(&mut bytes.as_slice()).unwrap();
			assert_eq!(&frame, expected);
		}
		// The stream is fully consumed.
		assert!(reader.is_empty());
	}

	#[test]
	fn corrupt_delimiter_is_rejected() {
		let mut wire = Vec::new();
		framed_send_blocking(&mut wire, &Frame::<()>::Control(Tag::Start).encode()).unwrap();
		let last = wire.len() - 1;
		wire[last] ^= 0xFF;
		let err = framed_recv_blocking(&mut wire.as_slice()).unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::InvalidData);
	}

	#[test]
	fn oversized_length_prefix_is_rejected() {
		let mut wire = Vec::new();
		wire.extend_from_slice(&(u64::MAX).to_le_bytes());
		let err = framed_recv_blocking(&mut wire.as_slice()).unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::InvalidData);
	}

	#[test]
	fn truncated_frames_read_as_eof() {
		let mut wire = Vec::new();
		framed_send_blocking(&mut wire, &Frame::Value(7u32).encode()).unwrap();
		wire.truncate(wire.len() - 6);
		let err = framed_recv_blocking(&mut wire.as_slice()).unwrap_err();
		assert_matches!(err.kind(), io::ErrorKind::UnexpectedEof);
	}
}
