// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Request API
//!
//! [`Client`] is the surface the filesystem layer drives. Every operation is
//! a `request_*`/`*_result` pair around a 16-bit tag: the request serialises
//! and sends the T-message on the calling thread, the worker completes the
//! tag, and the result accessor drains the slot. `None` from a request means
//! it never went out (not mounted, tag or fid pool exhausted, message would
//! not fit `msize`, or the send itself failed); the caller backs off.
//!
//! The core exposes a non-blocking completion query ([`Client::tag_response`])
//! and no timer: callers enforce their own deadlines and abandon with
//! [`Client::clear_tag`]. Abandoning does not cancel the operation on the
//! server; a fid walked and then abandoned must still be released.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::config::Config;
use crate::fcall::{
    path_components, DirEntry, FileStat, MsgType, OpenFlags, WalkKind, DMDIR, HEADER_SIZE,
    STAT_FIXED,
};
use crate::fids::ROOT_FID;
use crate::session::{Session, State};
use crate::tags::Op;
use crate::transport::{Connector, TcpConnector};
use crate::worker::Worker;

/// State shared between the request API and the worker thread.
pub(crate) struct Shared {
    session: Mutex<Session>,
    pub(crate) running: AtomicBool,
}

impl Shared {
    /// The session mutex guards the tag and FID tables, the send buffer, the
    /// connection state and `msize`. A poisoned lock is taken over rather
    /// than propagated; the session data stays consistent because every
    /// mutation completes before the guard drops.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A 9P2000 client session with its background I/O worker.
pub struct Client {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Client {
    /// Start the client. With `config.enabled` clear this creates no socket
    /// and no worker; the client simply never mounts.
    ///
    /// Aborts the process if the worker thread cannot be spawned.
    pub fn start(config: Config) -> Client {
        if !config.enabled {
            return Client {
                shared: Arc::new(Shared {
                    session: Mutex::new(Session::new()),
                    running: AtomicBool::new(false),
                }),
                worker: None,
            };
        }
        Self::with_connector(Box::new(TcpConnector::new(SocketAddrV4::new(
            config.ip,
            config.port,
        ))))
    }

    /// Start the client over a custom [`Connector`], for transports other
    /// than plain TCP.
    pub fn with_connector(connector: Box<dyn Connector>) -> Client {
        let shared = Arc::new(Shared {
            session: Mutex::new(Session::new()),
            running: AtomicBool::new(true),
        });
        let worker = Worker::new(shared.clone(), connector);
        let handle = thread::Builder::new()
            .name("9P2000".into())
            .spawn(move || worker.run())
            .expect("9P2000 worker thread");
        Client {
            shared,
            worker: Some(handle),
        }
    }

    /// True while connected with the remote tree attached.
    pub fn mounted(&self) -> bool {
        let session = self.shared.lock();
        session.state == State::Mounted && session.transport.is_some()
    }

    /// Count of flow-of-control anomalies seen on this session: unexpected
    /// frames, stale tags, operations on dead fids. Diagnostics only.
    pub fn flow_errors(&self) -> u32 {
        self.shared.lock().flow_errors
    }

    /// Largest data region a single read response can carry.
    /// Only meaningful while mounted, once `msize` is negotiated.
    pub fn max_read_len(&self) -> u32 {
        self.shared.lock().msize - (HEADER_SIZE as u32 + 4)
    }

    /// Largest data region a single write request can carry.
    /// Only meaningful while mounted, once `msize` is negotiated.
    pub fn max_write_len(&self) -> u32 {
        self.shared.lock().msize - (HEADER_SIZE as u32 + 4 + 8 + 4)
    }

    /// True if the worker has stored a response for this tag.
    pub fn tag_response(&self, tag: u16) -> bool {
        self.shared.lock().tags.response_ready(tag)
    }

    /// Abandon a request, typically on a caller-side timeout. The in-flight
    /// operation is not cancelled on the server; its eventual reply is
    /// dropped with a logged flow error.
    pub fn clear_tag(&self, tag: u16) {
        self.shared.lock().tags.clear(tag);
    }

    /// Resolve `path` relative to the root and bind the result to a fresh
    /// fid. The path is split on `/`; an empty path is a zero-hop walk to
    /// the root itself (which must be requested as a directory).
    pub fn request_walk(&self, path: &str, kind: WalkKind) -> Option<u16> {
        let mut session = self.shared.lock();
        if session.state != State::Mounted {
            return None;
        }
        let tag = session.tags.allocate()?;
        let Some(new_fid) = session.fids.allocate() else {
            session.tags.clear(tag);
            return None;
        };

        let names: Vec<&str> = path_components(path).collect();
        if names.len() > u16::MAX as usize {
            session.tags.clear(tag);
            session.fids.discard(new_fid);
            return None;
        }
        let msize = session.msize;
        session.send.reset(MsgType::Twalk, tag);
        session.send.put_u32(ROOT_FID);
        session.send.put_u32(new_fid);
        session.send.put_u16(names.len() as u16);
        for name in &names {
            if session.send.put_str(name, msize).is_err() {
                // This would be a huge path! Roll the whole request back.
                session.tags.clear(tag);
                session.fids.discard(new_fid);
                return None;
            }
        }

        session.tags.submit(
            tag,
            Op::Walk {
                new_fid,
                kind,
                nwname: names.len() as u16,
            },
        );
        if !session.send_frame() {
            return None;
        }
        Some(tag)
    }

    /// Collect a walk: the new fid, or 0 if the walk failed (in which case
    /// the fid has already been released).
    pub fn walk_result(&self, tag: u16) -> u32 {
        let mut session = self.shared.lock();
        if !session.tags.response_ready_for(tag, MsgType::Rwalk) {
            session.tags.clear(tag);
            return 0;
        }
        match session.tags.collect(tag) {
            Some(Op::Walk { new_fid, .. }) => new_fid,
            _ => 0,
        }
    }

    /// Open a walked fid. Only the access mode of `flags` is propagated;
    /// `O_TRUNC` is not (write-path callers truncate by create-and-write).
    pub fn request_open(&self, fid: u32, flags: OpenFlags) -> Option<u16> {
        let mut session = self.shared.lock();
        if session.state != State::Mounted {
            return None;
        }
        let tag = begin_fid_op(&mut session, fid, "open on invalid fid")?;

        session.send.reset(MsgType::Topen, tag);
        session.send.put_u32(fid);
        session.send.put_u8(flags.open_mode());

        session.tags.submit(tag, Op::Open { ok: false });
        if !session.send_frame() {
            return None;
        }
        Some(tag)
    }

    pub fn open_result(&self, tag: u16) -> bool {
        self.bool_result(tag, MsgType::Ropen)
    }

    /// Create `name` under the directory `fid` refers to. Permissions are
    /// fixed at rwx for everyone. On success the fid refers to the newly
    /// created object, per standard 9P semantics.
    pub fn request_create(&self, fid: u32, name: &str, is_dir: bool) -> Option<u16> {
        let mut session = self.shared.lock();
        if session.state != State::Mounted {
            return None;
        }
        let tag = begin_fid_op(&mut session, fid, "create on invalid fid")?;

        let msize = session.msize;
        session.send.reset(MsgType::Tcreate, tag);
        session.send.put_u32(fid);
        // perm and mode trail the variable-length name
        if session.send.put_str(name, msize).is_err() || !session.send.has_room(5, msize) {
            session.tags.clear(tag);
            return None;
        }
        let perm = 0o777 | if is_dir { DMDIR } else { 0 };
        session.send.put_u32(perm);
        session.send.put_u8(0);

        session.tags.submit(tag, Op::Create { ok: false });
        if !session.send_frame() {
            return None;
        }
        Some(tag)
    }

    pub fn create_result(&self, tag: u16) -> bool {
        self.bool_result(tag, MsgType::Rcreate)
    }

    /// Read `count` bytes at `offset`. The caller is responsible for keeping
    /// `count` within [`max_read_len`](Client::max_read_len); the wire
    /// request uses it exactly.
    pub fn request_file_read(&self, fid: u32, offset: u64, count: u32) -> Option<u16> {
        let mut session = self.shared.lock();
        if session.state != State::Mounted {
            return None;
        }
        let tag = begin_fid_op(&mut session, fid, "read on invalid fid")?;

        session.send.reset(MsgType::Tread, tag);
        session.send.put_u32(fid);
        session.send.put_u64(offset);
        session.send.put_u32(count);

        session.tags.submit(
            tag,
            Op::FileRead {
                requested: count,
                data: Vec::new(),
                count: -1,
            },
        );
        if !session.send_frame() {
            return None;
        }
        Some(tag)
    }

    /// Collect a file read into `buf`. Returns the byte count delivered by
    /// the server (0 at end of file), or -1 on failure. At most `buf.len()`
    /// bytes are copied.
    pub fn file_read_result(&self, tag: u16, buf: &mut [u8]) -> i32 {
        let mut session = self.shared.lock();
        if !session.tags.response_ready_for(tag, MsgType::Rread) {
            session.tags.clear(tag);
            return -1;
        }
        match session.tags.collect(tag) {
            Some(Op::FileRead { data, count, .. }) => {
                if count <= 0 {
                    return count;
                }
                let n = (count as usize).min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                n as i32
            }
            // A directory read collected through the file accessor
            _ => -1,
        }
    }

    /// Read the next directory entry at `offset`. The request asks for a
    /// full message worth of data because entry sizes are not known up
    /// front; only the first returned entry is consumed.
    pub fn request_dir_read(&self, fid: u32, offset: u64) -> Option<u16> {
        let mut session = self.shared.lock();
        if session.state != State::Mounted {
            return None;
        }
        let tag = begin_fid_op(&mut session, fid, "dir read on invalid fid")?;

        let count = session.msize - (HEADER_SIZE as u32 + 4);
        session.send.reset(MsgType::Tread, tag);
        session.send.put_u32(fid);
        session.send.put_u64(offset);
        session.send.put_u32(count);

        session.tags.submit(
            tag,
            Op::DirRead {
                entry: DirEntry::default(),
                count: 0,
            },
        );
        if !session.send_frame() {
            return None;
        }
        Some(tag)
    }

    /// Collect a directory read. Returns the encoded size of the entry (the
    /// amount to advance `offset` by), 0 at end of directory, or -1 on
    /// failure. The entry is stored into `entry` on success.
    pub fn dir_read_result(&self, tag: u16, entry: &mut DirEntry) -> i32 {
        let mut session = self.shared.lock();
        if !session.tags.response_ready_for(tag, MsgType::Rread) {
            session.tags.clear(tag);
            return -1;
        }
        match session.tags.collect(tag) {
            Some(Op::DirRead { entry: found, count }) => {
                if count > 0 {
                    *entry = found;
                }
                count
            }
            _ => -1,
        }
    }

    /// Write `data` at `offset`. The count is clamped to
    /// [`max_write_len`](Client::max_write_len); callers loop for larger
    /// writes.
    pub fn request_write(&self, fid: u32, offset: u64, data: &[u8]) -> Option<u16> {
        let mut session = self.shared.lock();
        if session.state != State::Mounted {
            return None;
        }
        let tag = begin_fid_op(&mut session, fid, "write on invalid fid")?;

        let msize = session.msize;
        let max = msize as usize - (HEADER_SIZE + 4 + 8 + 4);
        let count = data.len().min(max);

        session.send.reset(MsgType::Twrite, tag);
        session.send.put_u32(fid);
        session.send.put_u64(offset);
        session.send.put_u32(count as u32);
        if session.send.put_bytes(&data[..count], msize).is_err() {
            session.tags.clear(tag);
            return None;
        }

        session.tags.submit(tag, Op::Write { count: -1 });
        if !session.send_frame() {
            return None;
        }
        Some(tag)
    }

    /// Collect a write: bytes accepted by the server, or -1 on failure.
    pub fn write_result(&self, tag: u16) -> i32 {
        let mut session = self.shared.lock();
        if !session.tags.response_ready_for(tag, MsgType::Rwrite) {
            session.tags.clear(tag);
            return -1;
        }
        match session.tags.collect(tag) {
            Some(Op::Write { count }) => count,
            _ => -1,
        }
    }

    /// Remove the file or directory `fid` refers to. The server releases the
    /// handle as a side effect, success or not, so the fid is dead either
    /// way once the result is in.
    pub fn request_remove(&self, fid: u32) -> Option<u16> {
        let mut session = self.shared.lock();
        if session.state != State::Mounted {
            return None;
        }
        let tag = begin_fid_op(&mut session, fid, "remove on invalid fid")?;

        session.send.reset(MsgType::Tremove, tag);
        session.send.put_u32(fid);

        session.tags.submit(tag, Op::Remove { fid, ok: false });
        // No release may race the in-flight remove
        session.fids.mark_clunked(fid);
        if !session.send_frame() {
            return None;
        }
        Some(tag)
    }

    pub fn remove_result(&self, tag: u16) -> bool {
        self.bool_result(tag, MsgType::Rremove)
    }

    /// Fetch the metadata of the file `fid` refers to.
    pub fn request_stat(&self, fid: u32) -> Option<u16> {
        let mut session = self.shared.lock();
        if session.state != State::Mounted {
            return None;
        }
        let tag = begin_fid_op(&mut session, fid, "stat on invalid fid")?;

        session.send.reset(MsgType::Tstat, tag);
        session.send.put_u32(fid);

        session.tags.submit(tag, Op::Stat { stat: None });
        if !session.send_frame() {
            return None;
        }
        Some(tag)
    }

    pub fn stat_result(&self, tag: u16) -> Option<FileStat> {
        let mut session = self.shared.lock();
        if !session.tags.response_ready_for(tag, MsgType::Rstat) {
            session.tags.clear(tag);
            return None;
        }
        match session.tags.collect(tag) {
            Some(Op::Stat { stat }) => stat,
            _ => None,
        }
    }

    /// Rename the file `fid` refers to within its directory.
    pub fn request_rename(&self, fid: u32, new_name: &str) -> Option<u16> {
        self.request_wstat(fid, new_name, !0, "rename on invalid fid")
    }

    /// Set the modification timestamp of the file `fid` refers to.
    pub fn request_set_mtime(&self, fid: u32, mtime: u32) -> Option<u16> {
        self.request_wstat(fid, "", mtime, "set_mtime on invalid fid")
    }

    /// Collect a rename or set-mtime.
    pub fn stat_update_result(&self, tag: u16) -> bool {
        self.bool_result(tag, MsgType::Rwstat)
    }

    /// Release a fid back to the server. A second release of the same fid is
    /// a no-op. If no tag can be allocated for the clunk the handle is
    /// leaked until the next reconnect; there is no other recourse on a
    /// saturated table.
    pub fn release(&self, fid: u32) {
        self.shared.lock().free_fid(fid);
    }

    /// Twstat carrying a stat record whose numeric fields are all-ones
    /// ("don't change") except `mtime`, and whose strings are empty except
    /// possibly the name. Rename and set-mtime are both this message.
    fn request_wstat(
        &self,
        fid: u32,
        name: &str,
        mtime: u32,
        context: &'static str,
    ) -> Option<u16> {
        let mut session = self.shared.lock();
        if session.state != State::Mounted {
            return None;
        }
        let tag = begin_fid_op(&mut session, fid, context)?;

        // stat[n]: outer byte count, then the record, whose own size field
        // excludes itself.
        let inner = STAT_FIXED + (2 + name.len()) + 2 + 2 + 2;
        if inner > u16::MAX as usize {
            session.tags.clear(tag);
            return None;
        }
        let msize = session.msize;
        session.send.reset(MsgType::Twstat, tag);
        session.send.put_u32(fid);
        session.send.put_u16(inner as u16);
        session.send.put_u16((inner - 2) as u16);
        session.send.put_u16(!0); // type
        session.send.put_u32(!0); // dev
        session.send.put_u8(!0); // qid.type
        session.send.put_u32(!0); // qid.version
        session.send.put_u64(!0); // qid.path
        session.send.put_u32(!0); // mode
        session.send.put_u32(!0); // atime
        session.send.put_u32(mtime);
        session.send.put_u64(!0); // length
        if session.send.put_str(name, msize).is_err()
            || session.send.put_str("", msize).is_err() // uid
            || session.send.put_str("", msize).is_err() // gid
            || session.send.put_str("", msize).is_err() // muid
        {
            session.tags.clear(tag);
            return None;
        }

        session.tags.submit(tag, Op::Wstat { ok: false });
        if !session.send_frame() {
            return None;
        }
        Some(tag)
    }

    /// Shared collect path for the operations whose result is a bare
    /// success flag.
    fn bool_result(&self, tag: u16, typ: MsgType) -> bool {
        let mut session = self.shared.lock();
        if !session.tags.response_ready_for(tag, typ) {
            session.tags.clear(tag);
            return false;
        }
        match session.tags.collect(tag) {
            Some(Op::Open { ok })
            | Some(Op::Create { ok })
            | Some(Op::Remove { ok, .. })
            | Some(Op::Wstat { ok }) => ok,
            _ => false,
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Validate the fid and claim a tag; the common preamble of every per-file
/// request.
fn begin_fid_op(session: &mut Session, fid: u32, context: &'static str) -> Option<u16> {
    if !session.fids.is_valid(fid) {
        session.flow_error(context);
        return None;
    }
    session.tags.allocate()
}
