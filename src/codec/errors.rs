//! Frame parsing and validation errors
//!
//! This module defines error types that can occur while decoding datagram
//! records or length-prefixed stream frames. All errors implement the
//! standard Error trait for proper error propagation and handling.

use std::fmt;
use std::fmt::Display;

/// Record decoding errors
///
/// Represents the failure modes of turning raw bytes back into typed
/// records: incomplete input, unknown type identifiers, frames that exceed
/// the read ceiling, and control payloads that are not valid JSON.
#[derive(Debug)]
pub enum FrameError {
    /// Buffer is too short to contain a complete record
    ///
    /// Occurs when:
    /// - A typed record is shorter than its fixed prefix
    /// - The inner length field promises more bytes than were received
    TooShort,

    /// Record layout is invalid
    ///
    /// Occurs when a bodyless record (RESET, KEEPALIVE) carries trailing
    /// bytes. This indicates corrupted data or a protocol mismatch.
    Invalid,

    /// The first byte is not a known record type
    ///
    /// On a datagram link the receiver answers this with a RESET to the
    /// sender and drops the record.
    UnknownType(u8),

    /// A stream frame length exceeds the MTU-derived ceiling
    ///
    /// The stream is unrecoverable at this point and must be closed.
    Oversize(usize),

    /// A CONTROL payload was not a valid JSON object with a `type` field
    BadMessage(serde_json::Error),
}

impl std::error::Error for FrameError {}

impl Display for FrameError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::TooShort => "record ended early".fmt(fmt),
            FrameError::Invalid => "invalid record".fmt(fmt),
            FrameError::UnknownType(t) => write!(fmt, "unknown record type {:#04x}", t),
            FrameError::Oversize(len) => write!(fmt, "frame of {} bytes exceeds ceiling", len),
            FrameError::BadMessage(e) => write!(fmt, "malformed control message: {}", e),
        }
    }
}
