// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! 9P2000 protocol definitions
//!
//! Message-type numerics, special values, qid and stat record layouts for the
//! plain 9P2000 protocol. See <https://9p.io/sys/man/5/intro>.

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use crate::message::Reader;
use crate::Error;

/// Protocol version negotiated during Tversion/Rversion. Exact match required.
pub(crate) const PROTOCOL_VERSION: &str = "9P2000";

/// Special tag which `Tversion`/`Rversion` must use as `tag`
pub(crate) const NOTAG: u16 = !0;

/// Special value which `Tattach` with no auth must use as `afid`
pub(crate) const NOFID: u32 = !0;

/// Directory bit in the `perm` field of `Tcreate`
pub(crate) const DMDIR: u32 = 0x8000_0000;

/// Every message starts with `length: u32`, `type: u8`, `tag: u16`
pub(crate) const HEADER_SIZE: usize = 7;

/// Fixed portion of a stat record: its own size prefix, type, dev, qid, mode,
/// atime, mtime and length (2 + 2 + 4 + 13 + 4 + 4 + 4 + 8). The four strings
/// (name, uid, gid, muid) follow.
pub(crate) const STAT_FIXED: usize = 41;

/// Smallest acceptable negotiated msize.
///
/// Every fixed-layout message this client emits must fit; the largest is
/// Twstat with four empty strings (fid + nstat + stat + string lengths = 55)
/// plus the header.
pub(crate) const MIN_MSIZE: u32 = (HEADER_SIZE + 4 + 2 + STAT_FIXED + 4 * 2) as u32;

/// `mode` values for Topen
pub(crate) const OREAD: u8 = 0;
pub(crate) const OWRITE: u8 = 1;
pub(crate) const ORDWR: u8 = 2;

/// 9P2000 message types
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum MsgType {
    Tversion = 100,
    Rversion = 101,
    Tauth = 102,
    Rauth = 103,
    Tattach = 104,
    Rattach = 105,
    Rerror = 107,
    Tflush = 108,
    Rflush = 109,
    Twalk = 110,
    Rwalk = 111,
    Topen = 112,
    Ropen = 113,
    Tcreate = 114,
    Rcreate = 115,
    Tread = 116,
    Rread = 117,
    Twrite = 118,
    Rwrite = 119,
    Tclunk = 120,
    Rclunk = 121,
    Tremove = 122,
    Rremove = 123,
    Tstat = 124,
    Rstat = 125,
    Twstat = 126,
    Rwstat = 127,
}

bitflags! {
    /// Bits in `Qid.typ`. Only [`QidType::DIR`] is consumed by this client.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub(crate) struct QidType: u8 {
        /// Type bit for directories
        const DIR    = 0x80;
        /// Type bit for append only files
        const APPEND = 0x40;
        /// Type bit for exclusive use files
        const EXCL   = 0x20;
        /// Type bit for mounted channel
        const MOUNT  = 0x10;
        /// Type bit for authentication file
        const AUTH   = 0x08;
        /// Type bit for not-backed-up file
        const TMP    = 0x04;
        /// Plain file
        const FILE   = 0x00;
    }
}

bitflags! {
    /// POSIX-style open flags accepted by [`Client::request_open`](crate::Client::request_open).
    ///
    /// Only the access mode is propagated to the server. `TRUNC` is accepted
    /// and ignored: write-path callers truncate by create-and-write.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 1;
        const RDWR   = 2;
        const CREAT  = 0o100;
        const TRUNC  = 0o1000;
        const APPEND = 0o2000;
    }
}

impl OpenFlags {
    /// Map the access mode to the 9P open `mode` byte.
    pub(crate) fn open_mode(self) -> u8 {
        if self.contains(OpenFlags::RDWR) {
            ORDWR
        } else if self.contains(OpenFlags::WRONLY) {
            OWRITE
        } else {
            OREAD
        }
    }
}

/// What a walk is expected to resolve to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkKind {
    /// Accept whatever the path resolves to
    Any,
    /// The last path component must be a regular file
    File,
    /// The last path component must be a directory
    Directory,
}

/// File kind derived from a qid's type bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
}

impl From<QidType> for FileKind {
    fn from(typ: QidType) -> Self {
        if typ.contains(QidType::DIR) {
            FileKind::Directory
        } else {
            FileKind::Regular
        }
    }
}

/// Server-unique identity of a file
#[derive(Clone, Copy, Debug)]
pub(crate) struct Qid {
    pub typ: QidType,
    #[allow(dead_code)]
    pub version: u32,
    #[allow(dead_code)]
    pub path: u64,
}

/// One directory entry produced by a directory read.
#[derive(Clone, Debug, Default)]
pub struct DirEntry {
    pub name: String,
    pub kind: Option<FileKind>,
}

/// The subset of a stat record consumed by the client.
#[derive(Clone, Copy, Debug)]
pub struct FileStat {
    /// File length in bytes
    pub size: u64,
    /// Access timestamp, seconds
    pub atime: u32,
    /// Modification timestamp, seconds
    pub mtime: u32,
    pub kind: FileKind,
}

/// A decoded stat record, borrowing the name out of the frame.
pub(crate) struct StatRecord<'a> {
    /// Total encoded size including the leading size prefix; a directory read
    /// advances its offset by this much per entry.
    pub record_len: usize,
    pub qid: Qid,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: &'a str,
}

/// Decode the stat record at the front of `buf`.
///
/// Reads through the name; the trailing uid/gid/muid strings are not consumed.
pub(crate) fn decode_stat(buf: &[u8]) -> Result<StatRecord<'_>, Error> {
    let mut r = Reader::new(buf);
    let size = r.u16()?;
    let record_len = size as usize + 2;
    if buf.len() < record_len {
        return Err(Error::Truncated);
    }
    let _typ = r.u16()?;
    let _dev = r.u32()?;
    let qid = r.qid()?;
    let _mode = r.u32()?;
    let atime = r.u32()?;
    let mtime = r.u32()?;
    let length = r.u64()?;
    let name = r.str()?;
    Ok(StatRecord {
        record_len,
        qid,
        atime,
        mtime,
        length,
        name,
    })
}

/// Split a walk path into the names a Twalk carries.
///
/// Empty components are skipped, so an empty path is a zero-hop walk and
/// doubled slashes do not emit empty names.
pub(crate) fn path_components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}
