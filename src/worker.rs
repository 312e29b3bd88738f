// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Background I/O worker
//!
//! One cooperative thread owns the socket's receive side: it reconnects with
//! a 100 ms backoff, drains frames with non-blocking recv (yielding 100 µs
//! when no data is pending), re-assembles them in the receive buffer, and
//! dispatches complete frames into the tag table under the session mutex.
//! The worker never blocks the caller side for longer than one frame's
//! dispatch.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::client::Shared;
use crate::fcall::{decode_stat, FileKind, FileStat, MsgType, QidType, WalkKind, HEADER_SIZE};
use crate::message::{Reader, MSG_BUF_SIZE};
use crate::session::{Session, State};
use crate::tags::Op;
use crate::transport::{Connector, Transport};

pub(crate) struct Worker {
    shared: Arc<Shared>,
    connector: Box<dyn Connector>,
    /// Our clone of the live transport; dropped on any socket error.
    transport: Option<Arc<dyn Transport>>,
    /// Receive scratch area, exclusively owned by this thread.
    rbuf: Box<[u8; MSG_BUF_SIZE]>,
    /// Bytes of `rbuf` holding received, not yet parsed data.
    filled: usize,
    /// Bytes of an oversized frame still to be thrown away.
    discard: usize,
}

impl Worker {
    pub(crate) fn new(shared: Arc<Shared>, connector: Box<dyn Connector>) -> Self {
        Worker {
            shared,
            connector,
            transport: None,
            rbuf: Box::new([0u8; MSG_BUF_SIZE]),
            filled: 0,
            discard: 0,
        }
    }

    pub(crate) fn run(mut self) {
        while self.shared.running.load(Ordering::Relaxed) {
            // The request path tears the session down on send errors; if it
            // did, drop our transport handle so the socket actually closes.
            if self.transport.is_some() && self.shared.lock().transport.is_none() {
                self.transport = None;
                self.filled = 0;
                self.discard = 0;
            }

            let Some(transport) = self.transport.clone() else {
                self.try_connect();
                continue;
            };

            match transport.recv(&mut self.rbuf[self.filled..]) {
                Ok(0) => {
                    // Zero means the peer closed the connection
                    info!("9P2000: closed connection");
                    self.drop_connection();
                }
                Ok(n) => {
                    self.filled += n;
                    self.parse();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_micros(100));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("9P2000: recv failed: {e}");
                    self.drop_connection();
                }
            }
        }
    }

    fn try_connect(&mut self) {
        match self.connector.connect() {
            Ok(transport) => {
                info!("9P2000: connected to {}", self.connector);
                self.filled = 0;
                self.discard = 0;
                self.shared.lock().establish(transport.clone());
                self.transport = Some(transport);
            }
            Err(_) => {
                // don't try and connect too fast
                thread::sleep(Duration::from_millis(100));
            }
        }
    }

    fn drop_connection(&mut self) {
        self.transport = None;
        self.filled = 0;
        self.discard = 0;
        self.shared.lock().disconnect();
    }

    /// Consume complete frames from the front of the receive buffer.
    fn parse(&mut self) {
        loop {
            if self.discard > 0 {
                let n = self.discard.min(self.filled);
                self.rbuf.copy_within(n..self.filled, 0);
                self.filled -= n;
                self.discard -= n;
                if self.discard > 0 {
                    // The rest of the oversized frame is still in flight
                    return;
                }
            }

            // Defer until a full header is buffered; re-entering on a shorter
            // residue would misread the length field.
            if self.filled < HEADER_SIZE {
                return;
            }

            let frame_len = u32::from_le_bytes([
                self.rbuf[0],
                self.rbuf[1],
                self.rbuf[2],
                self.rbuf[3],
            ]) as usize;
            if frame_len < HEADER_SIZE {
                // There is no way to resynchronise the stream after this.
                warn!("9P2000: unframeable length {frame_len}, dropping connection");
                self.drop_connection();
                return;
            }

            let torn_down = {
                let mut session = self.shared.lock();
                if frame_len > session.msize as usize {
                    // Drop the frame but keep the session.
                    session.flow_error("frame longer than negotiated msize");
                    self.discard = frame_len;
                    continue;
                }
                if self.filled < frame_len {
                    return;
                }
                dispatch(&mut session, &self.rbuf[..frame_len]);
                session.transport.is_none()
            };
            if torn_down {
                // Dispatch disconnected the session; the buffered remainder
                // belongs to the dead connection.
                self.drop_connection();
                return;
            }

            self.rbuf.copy_within(frame_len..self.filled, 0);
            self.filled -= frame_len;
        }
    }
}

/// Route one complete frame. Caller holds the session mutex.
pub(crate) fn dispatch(session: &mut Session, frame: &[u8]) {
    let Ok(typ) = MsgType::try_from(frame[4]) else {
        session.flow_error("unknown message type");
        return;
    };
    let tag = u16::from_le_bytes([frame[5], frame[6]]);

    match typ {
        MsgType::Rversion => {
            // Should only get a version response if we asked for one
            if session.state != State::Version {
                session.flow_error("Rversion outside the version handshake");
                return;
            }
            session.handle_version(frame);
        }

        MsgType::Rattach => {
            if session.state != State::Attach {
                session.flow_error("Rattach outside the attach handshake");
                return;
            }
            session.handle_attach(frame);
        }

        // Auth and flush are not supported; accept and discard.
        MsgType::Rauth | MsgType::Rflush => {}

        MsgType::Rclunk => {
            if !session.tags.in_flight(tag) {
                session.flow_error("Rclunk with no matching request");
                return;
            }
            let Some(Op::Clunk { fid }) = session.tags.op(tag) else {
                session.flow_error("Rclunk for a different request");
                return;
            };
            let fid = *fid;
            // The handle and the tag both go back to their pools; no caller
            // polls a clunk.
            if !session.fids.clear(fid) {
                session.flow_error("Rclunk for an inactive fid");
            }
            session.tags.clear(tag);
        }

        MsgType::Rerror
        | MsgType::Rwalk
        | MsgType::Ropen
        | MsgType::Rcreate
        | MsgType::Rread
        | MsgType::Rwrite
        | MsgType::Rremove
        | MsgType::Rstat
        | MsgType::Rwstat => handle_response(session, frame, typ, tag),

        // Not expecting to receive any requests
        MsgType::Tversion
        | MsgType::Tauth
        | MsgType::Tattach
        | MsgType::Tflush
        | MsgType::Twalk
        | MsgType::Topen
        | MsgType::Tcreate
        | MsgType::Tread
        | MsgType::Twrite
        | MsgType::Tclunk
        | MsgType::Tremove
        | MsgType::Tstat
        | MsgType::Twstat => {
            session.flow_error("request message from server");
        }
    }
}

/// Store an operation result into its tag slot and mark it collectable.
fn handle_response(session: &mut Session, frame: &[u8], typ: MsgType, tag: u16) {
    // Should be mounted before responses start turning up
    if session.state != State::Mounted {
        session.flow_error("response before mount");
        return;
    }
    if !session.tags.in_flight(tag) {
        session.flow_error("response with no matching request");
        return;
    }
    // Unexpected errors are allowed; everything else must match the request.
    let expected = session.tags.op(tag).map(Op::expected);
    if typ != MsgType::Rerror && expected != Some(typ) {
        session.flow_error("response type mismatch");
        return;
    }

    match typ {
        MsgType::Rerror => {
            if !handle_error(session, frame, tag) {
                // the slot was released inline (clunk); nothing to collect
                return;
            }
        }
        MsgType::Rwalk => handle_rwalk(session, frame, tag),
        MsgType::Ropen => {
            if let Some(Op::Open { ok }) = session.tags.op_mut(tag) {
                // A valid fixed-shape response means the open worked
                *ok = frame.len() == HEADER_SIZE + 17;
            }
        }
        MsgType::Rcreate => {
            if let Some(Op::Create { ok }) = session.tags.op_mut(tag) {
                *ok = frame.len() == HEADER_SIZE + 17;
            }
        }
        MsgType::Rread => handle_rread(session, frame, tag),
        MsgType::Rwrite => {
            let value = (frame.len() == HEADER_SIZE + 4)
                .then(|| Reader::new(&frame[HEADER_SIZE..]).u32().ok())
                .flatten();
            if let Some(Op::Write { count }) = session.tags.op_mut(tag) {
                if let Some(n) = value {
                    *count = n as i32;
                }
            }
        }
        MsgType::Rremove => handle_rremove(session, frame, tag),
        MsgType::Rstat => handle_rstat(session, frame, tag),
        MsgType::Rwstat => {
            if let Some(Op::Wstat { ok }) = session.tags.op_mut(tag) {
                *ok = frame.len() == HEADER_SIZE;
            }
        }
        _ => unreachable!("handle_response called for {typ:?}"),
    }

    // No longer pending; the caller may collect.
    session.tags.complete(tag);
}

/// Set the failure sentinel for the operation the server rejected.
///
/// Returns false when the slot was fully released inline and must not be
/// marked collectable.
fn handle_error(session: &mut Session, frame: &[u8], tag: u16) -> bool {
    // Surface the server's message to the log sink; it is not returned to
    // the caller.
    let mut r = Reader::new(&frame[HEADER_SIZE..]);
    if let Ok(len) = r.u16() {
        if let Ok(ename) = r.bytes(len as usize) {
            warn!("9P2000: error: {}", String::from_utf8_lossy(ename));
        }
    }

    enum Cleanup {
        None,
        /// The fid was never bound on the server; free the local slot only.
        DiscardFid(u32),
        /// The server released the handle despite the error.
        ReleaseFid(u32),
        /// A failed clunk: drop both the handle and the tag.
        ClunkDone(u32),
    }

    let mut cleanup = Cleanup::None;
    match session.tags.op_mut(tag) {
        Some(Op::Walk { new_fid, .. }) => {
            cleanup = Cleanup::DiscardFid(*new_fid);
            *new_fid = 0;
        }
        Some(Op::Clunk { fid }) => cleanup = Cleanup::ClunkDone(*fid),
        Some(Op::Open { ok }) | Some(Op::Create { ok }) | Some(Op::Wstat { ok }) => *ok = false,
        Some(Op::FileRead { count, .. })
        | Some(Op::DirRead { count, .. })
        | Some(Op::Write { count }) => *count = -1,
        Some(Op::Remove { fid, ok }) => {
            *ok = false;
            // Tremove clunks the fid even when the remove fails
            cleanup = Cleanup::ReleaseFid(*fid);
        }
        Some(Op::Stat { stat }) => *stat = None,
        None => return true,
    }

    match cleanup {
        Cleanup::None => {}
        Cleanup::DiscardFid(fid) => session.fids.discard(fid),
        Cleanup::ReleaseFid(fid) => {
            session.fids.clear(fid);
        }
        Cleanup::ClunkDone(fid) => {
            session.fids.clear(fid);
            session.tags.clear(tag);
            return false;
        }
    }
    true
}

enum WalkOutcome {
    /// All hops resolved and the kind matches; the new fid is live.
    Bound,
    /// The server stopped early, so the new fid was never bound.
    Unbound,
    /// The fid is bound but unusable (kind mismatch or a malformed frame).
    Mismatch,
}

fn walk_outcome(frame: &[u8], kind: WalkKind, nwname: u16) -> WalkOutcome {
    let mut r = Reader::new(&frame[HEADER_SIZE..]);
    let Ok(nwqid) = r.u16() else {
        return WalkOutcome::Mismatch;
    };
    // Every qid must actually be present in the frame
    if frame.len() != HEADER_SIZE + 2 + nwqid as usize * 13 {
        return WalkOutcome::Mismatch;
    }
    if nwqid < nwname {
        return WalkOutcome::Unbound;
    }
    if nwqid > nwname {
        return WalkOutcome::Mismatch;
    }
    if nwqid == 0 {
        // A zero-hop walk resolves to the root, which is a directory
        return if kind == WalkKind::Directory {
            WalkOutcome::Bound
        } else {
            WalkOutcome::Mismatch
        };
    }
    if kind == WalkKind::Any {
        return WalkOutcome::Bound;
    }
    // Only the final hop decides the kind
    let mut last = None;
    for _ in 0..nwqid {
        last = r.qid().ok();
    }
    let Some(qid) = last else {
        return WalkOutcome::Mismatch;
    };
    let is_dir = qid.typ.contains(QidType::DIR);
    let matches = match kind {
        WalkKind::Any => true,
        WalkKind::Directory => is_dir,
        WalkKind::File => !is_dir,
    };
    if matches {
        WalkOutcome::Bound
    } else {
        WalkOutcome::Mismatch
    }
}

fn handle_rwalk(session: &mut Session, frame: &[u8], tag: u16) {
    let Some(Op::Walk { new_fid, kind, nwname }) = session.tags.op(tag) else {
        return;
    };
    let (fid, kind, nwname) = (*new_fid, *kind, *nwname);

    match walk_outcome(frame, kind, nwname) {
        WalkOutcome::Bound => return,
        WalkOutcome::Unbound => session.fids.discard(fid),
        WalkOutcome::Mismatch => session.free_fid(fid),
    }
    if let Some(Op::Walk { new_fid, .. }) = session.tags.op_mut(tag) {
        *new_fid = 0;
    }
}

fn handle_rread(session: &mut Session, frame: &[u8], tag: u16) {
    let mut r = Reader::new(&frame[HEADER_SIZE..]);
    let Ok(rcount) = r.u32() else {
        session.flow_error("short Rread");
        return;
    };
    let payload = r.bytes(rcount as usize).ok();

    match session.tags.op_mut(tag) {
        Some(Op::FileRead {
            requested,
            data,
            count,
        }) => {
            // Not expecting to get more data than was asked for
            match payload {
                Some(bytes) if rcount <= *requested => {
                    data.extend_from_slice(bytes);
                    *count = rcount as i32;
                }
                _ => *count = -1,
            }
        }
        Some(Op::DirRead { entry, count }) => {
            // A directory read must carry at least one complete stat record;
            // anything else reads as end-of-directory.
            let Some(bytes) = payload else { return };
            let Ok(stat) = decode_stat(bytes) else { return };
            // Entries are plain files or directories, nothing exotic
            let kind = if stat.qid.typ == QidType::DIR {
                FileKind::Directory
            } else if stat.qid.typ == QidType::FILE {
                FileKind::Regular
            } else {
                return;
            };
            entry.name = stat.name.to_string();
            entry.kind = Some(kind);
            *count = stat.record_len as i32;
        }
        _ => {}
    }
}

fn handle_rremove(session: &mut Session, frame: &[u8], tag: u16) {
    let Some(Op::Remove { fid, ok }) = session.tags.op_mut(tag) else {
        return;
    };
    *ok = frame.len() == HEADER_SIZE;
    let fid = *fid;
    // The server drops the handle as a side effect of Tremove
    session.fids.clear(fid);
}

fn handle_rstat(session: &mut Session, frame: &[u8], tag: u16) {
    // Body is the outer stat byte count, then the record itself
    let parsed = frame
        .get(HEADER_SIZE + 2..)
        .and_then(|body| decode_stat(body).ok())
        .map(|stat| FileStat {
            size: stat.length,
            atime: stat.atime,
            mtime: stat.mtime,
            kind: FileKind::from(stat.qid.typ),
        });
    if let Some(Op::Stat { stat }) = session.tags.op_mut(tag) {
        *stat = parsed;
    }
}
