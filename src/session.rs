// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Session state machine
//!
//! A session walks Disconnected → Version → Attach → Mounted and falls back
//! to Disconnected on any socket error, resetting the tag and FID tables so
//! no stale handle survives a reconnect. Only `Mounted` accepts requests.
//!
//! Handshake validation failures are silently ignored rather than treated as
//! protocol errors: the server may still be streaming and the current frame
//! may be short. Retries are bounded only by the worker's reconnect loop.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::fcall::{
    MsgType, QidType, HEADER_SIZE, MIN_MSIZE, NOFID, NOTAG, PROTOCOL_VERSION,
};
use crate::fids::{FidTable, ROOT_FID};
use crate::message::{Message, Reader, MSG_BUF_SIZE};
use crate::tags::{Op, TagTable, ATTACH_TAG};
use crate::transport::Transport;

/// User name presented in Tattach. The attach name is always empty.
const UNAME: &str = "ArduPilot";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Disconnected,
    Version,
    Attach,
    Mounted,
}

/// Everything the session mutex guards: connection state, the negotiated
/// msize, the send scratch buffer, and both slot tables.
pub(crate) struct Session {
    pub state: State,
    pub msize: u32,
    pub transport: Option<Arc<dyn Transport>>,
    pub send: Message,
    pub tags: TagTable,
    pub fids: FidTable,
    pub flow_errors: u32,
}

impl Session {
    pub(crate) fn new() -> Self {
        Session {
            state: State::Disconnected,
            msize: MSG_BUF_SIZE as u32,
            transport: None,
            send: Message::new(),
            tags: TagTable::new(),
            fids: FidTable::new(),
            flow_errors: 0,
        }
    }

    /// Adopt a fresh connection and start the version handshake.
    pub(crate) fn establish(&mut self, transport: Arc<dyn Transport>) {
        self.tags.reset();
        self.fids.reset();
        self.transport = Some(transport);
        self.begin_version();
    }

    /// Tear the connection down and drop every in-flight request and handle.
    pub(crate) fn disconnect(&mut self) {
        self.transport = None;
        self.state = State::Disconnected;
        self.tags.reset();
        self.fids.reset();
    }

    /// Record a flow-of-control anomaly: a frame or call that violates the
    /// protocol state without endangering the session.
    pub(crate) fn flow_error(&mut self, context: &str) {
        self.flow_errors += 1;
        debug!("9P2000: flow of control error: {context}");
    }

    fn begin_version(&mut self) {
        self.state = State::Version;
        // Until Rversion lands, bound frames by the buffer itself.
        self.msize = MSG_BUF_SIZE as u32;

        self.send.reset(MsgType::Tversion, NOTAG);
        self.send.put_u32(MSG_BUF_SIZE as u32);
        if self.send.put_str(PROTOCOL_VERSION, self.msize).is_err() {
            self.flow_error("version string exceeds msize");
            return;
        }
        self.send_frame();
    }

    pub(crate) fn handle_version(&mut self, frame: &[u8]) {
        let tag = u16::from_le_bytes([frame[5], frame[6]]);
        if tag != NOTAG {
            return;
        }
        let mut r = Reader::new(&frame[HEADER_SIZE..]);
        let Ok(msize) = r.u32() else { return };
        // The server may only shrink the message size, and never below the
        // largest fixed-layout message this client emits.
        if msize as usize > MSG_BUF_SIZE || msize < MIN_MSIZE {
            return;
        }
        let Ok(version) = r.str() else { return };
        if version != PROTOCOL_VERSION {
            return;
        }

        self.msize = msize;
        self.begin_attach();
    }

    fn begin_attach(&mut self) {
        self.state = State::Attach;

        self.send.reset(MsgType::Tattach, ATTACH_TAG);
        self.send.put_u32(ROOT_FID);
        self.send.put_u32(NOFID);
        if self.send.put_str(UNAME, self.msize).is_err()
            || self.send.put_str("", self.msize).is_err()
        {
            // Negotiated a message length too small for this message!?
            self.flow_error("attach strings exceed msize");
            return;
        }
        self.send_frame();
    }

    pub(crate) fn handle_attach(&mut self, frame: &[u8]) {
        // Fixed length message, header and qid
        if frame.len() != HEADER_SIZE + 13 {
            return;
        }
        let tag = u16::from_le_bytes([frame[5], frame[6]]);
        if tag != ATTACH_TAG {
            return;
        }
        let Ok(qid) = Reader::new(&frame[HEADER_SIZE..]).qid() else {
            return;
        };
        // The attach point must be a directory
        if !qid.typ.contains(QidType::DIR) {
            return;
        }

        self.state = State::Mounted;
        info!("9P2000: mounted file system");
    }

    /// Send the frame sitting in the scratch buffer. A transport error tears
    /// the session down; the worker will reconnect.
    pub(crate) fn send_frame(&mut self) -> bool {
        let Some(transport) = self.transport.clone() else {
            return false;
        };
        let ok = {
            let frame = self.send.finish();
            send_all(transport.as_ref(), frame)
        };
        if !ok {
            warn!("9P2000: send failed, dropping connection");
            self.disconnect();
        }
        ok
    }

    /// Issue a Tclunk for `fid`, marking the slot clunked so a second release
    /// is a no-op. Shared by the public release path and the walk handler's
    /// mismatch cleanup.
    pub(crate) fn free_fid(&mut self, fid: u32) {
        if !self.fids.is_valid(fid) {
            self.flow_error("release of invalid fid");
            return;
        }
        if self.state != State::Mounted {
            return;
        }
        let Some(tag) = self.tags.allocate() else {
            // Nothing else can reclaim the handle; the slot stays occupied
            // until the next reconnect.
            warn!("9P2000: no free tag for clunk, fid {fid} leaked");
            return;
        };
        self.fids.mark_clunked(fid);
        self.send.reset(MsgType::Tclunk, tag);
        self.send.put_u32(fid);
        self.tags.submit(tag, Op::Clunk { fid });
        self.send_frame();
    }
}

/// Write the whole frame, yielding briefly when the non-blocking socket
/// refuses bytes.
fn send_all(transport: &dyn Transport, frame: &[u8]) -> bool {
    let mut sent = 0;
    while sent < frame.len() {
        match transport.send(&frame[sent..]) {
            Ok(0) => return false,
            Ok(n) => sent += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_micros(100));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(_) => return false,
        }
    }
    true
}
