// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fixed-size 9P message framing
//!
//! The client owns two scratch areas sized [`MSG_BUF_SIZE`]: a send buffer
//! guarded by the session mutex and a receive buffer owned by the worker.
//! [`Message`] is the bounded append-writer used to build T-messages and
//! [`Reader`] is the bounds-checked cursor used to pick response frames apart.

use crate::fcall::{MsgType, HEADER_SIZE};
use crate::Error;

/// Size of the send and receive scratch buffers. Tversion asks the server for
/// this much; the negotiated `msize` may be smaller but never larger.
pub(crate) const MSG_BUF_SIZE: usize = 16384;

/// An outgoing message under construction.
///
/// The 7-byte header (`length: u32`, `type: u8`, `tag: u16`, all little
/// endian) is laid down by [`reset`](Message::reset); fixed fields and
/// variable-length strings are appended behind it. The length field is
/// patched when [`finish`](Message::finish) hands the frame out for sending.
pub(crate) struct Message {
    buf: Box<[u8; MSG_BUF_SIZE]>,
    len: usize,
}

impl Message {
    pub(crate) fn new() -> Self {
        Message {
            buf: Box::new([0u8; MSG_BUF_SIZE]),
            len: HEADER_SIZE,
        }
    }

    /// Start a fresh message of the given type and tag.
    pub(crate) fn reset(&mut self, typ: MsgType, tag: u16) {
        self.len = HEADER_SIZE;
        self.buf[4] = typ as u8;
        self.buf[5..7].copy_from_slice(&tag.to_le_bytes());
    }

    /// Current total length, header included.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// True if `extra` more bytes still fit under the negotiated msize.
    pub(crate) fn has_room(&self, extra: usize, msize: u32) -> bool {
        self.len + extra <= (msize as usize).min(MSG_BUF_SIZE)
    }

    fn put(&mut self, bytes: &[u8]) {
        // Fixed fields only: every fixed-layout message fits MIN_MSIZE, which
        // handle_version guarantees before any request is built.
        debug_assert!(self.len + bytes.len() <= MSG_BUF_SIZE);
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    pub(crate) fn put_u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    pub(crate) fn put_u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    pub(crate) fn put_u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }

    /// Append a length-prefixed protocol string, refusing to grow the frame
    /// past the negotiated msize. On failure the message is left untouched.
    pub(crate) fn put_str(&mut self, s: &str, msize: u32) -> Result<(), Error> {
        if s.len() > u16::MAX as usize || !self.has_room(2 + s.len(), msize) {
            return Err(Error::FrameTooLarge);
        }
        self.put(&(s.len() as u16).to_le_bytes());
        self.put(s.as_bytes());
        Ok(())
    }

    /// Append a raw data region (the payload of Twrite).
    pub(crate) fn put_bytes(&mut self, data: &[u8], msize: u32) -> Result<(), Error> {
        if !self.has_room(data.len(), msize) {
            return Err(Error::FrameTooLarge);
        }
        self.put(data);
        Ok(())
    }

    /// Patch the length field and return the wire frame.
    pub(crate) fn finish(&mut self) -> &[u8] {
        let len = self.len as u32;
        self.buf[0..4].copy_from_slice(&len.to_le_bytes());
        &self.buf[..self.len]
    }
}

/// Bounds-checked little-endian reader over a received frame.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.buf.len() < n {
            return Err(Error::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, Error> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, Error> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, Error> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub(crate) fn qid(&mut self) -> Result<crate::fcall::Qid, Error> {
        let typ = crate::fcall::QidType::from_bits_retain(self.u8()?);
        let version = self.u32()?;
        let path = self.u64()?;
        Ok(crate::fcall::Qid { typ, version, path })
    }

    /// Read a length-prefixed protocol string.
    pub(crate) fn str(&mut self) -> Result<&'a str, Error> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        core::str::from_utf8(bytes).map_err(|_| Error::InvalidString)
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        self.take(n)
    }
}
