// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A 9P2000 network filesystem client.
//!
//! This crate lets a host mount a remote file tree exported by a 9P2000 server
//! over TCP. A single background worker thread owns the socket's receive side:
//! it drains incoming frames, validates them, and completes request slots that
//! foreground callers poll. Every filesystem operation is split into
//! request/poll/collect:
//!
//! 1. `request_*` allocates a tag (and a fid where needed), serialises the
//!    T-message, sends it, and returns the tag.
//! 2. The caller polls [`Client::tag_response`] until the worker marks the
//!    slot complete. The core imposes no timeout; a caller that gives up
//!    invokes [`Client::clear_tag`] to abandon the request.
//! 3. The typed `*_result` accessor drains the slot and releases the tag.
//!
//! Failures are reported as per-operation sentinels (`None`, `false`, `-1`,
//! fid `0`), never as panics; server error strings go to the [`log`] sink.
//!
//! Authentication, flush/cancel and the 9P2000.u/.L extensions are not
//! supported: Tauth and Tflush are never sent, Rauth and Rflush are accepted
//! and discarded.

use thiserror::Error;

mod client;
mod config;
mod fcall;
mod fids;
mod message;
mod session;
mod tags;
mod transport;
mod worker;

#[cfg(test)]
mod tests;

pub use client::Client;
pub use config::Config;
pub use fcall::{DirEntry, FileKind, FileStat, OpenFlags, WalkKind};
pub use transport::{Connector, TcpConnector, Transport};

/// Error type for wire encoding and decoding
#[derive(Debug, Error)]
pub(crate) enum Error {
    /// The frame ended before the field being read
    #[error("truncated message")]
    Truncated,

    /// Appending the field would push the frame past the negotiated msize
    #[error("message would exceed the negotiated msize")]
    FrameTooLarge,

    /// A protocol string was not valid UTF-8
    #[error("invalid string data")]
    InvalidString,
}
