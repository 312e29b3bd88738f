// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Transport layer abstraction
//!
//! The session and the worker talk to the wire through these traits rather
//! than a concrete socket. The request path sends under the session mutex
//! while the worker drains the receive side, so both methods take `&self`.

use std::fmt;
use std::io::{self, Read as _, Write as _};
use std::net::{SocketAddrV4, TcpStream};
use std::sync::Arc;

/// A byte stream carrying 9P frames.
pub trait Transport: Send + Sync {
    /// Write bytes to the peer. Returns the number of bytes accepted.
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Read bytes from the peer with non-blocking semantics: `Ok(0)` means
    /// the peer closed the connection, `ErrorKind::WouldBlock` means no data
    /// is pending.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

impl Transport for TcpStream {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

/// Establishes transports for the worker's reconnect loop.
///
/// `Display` names the peer for connection log messages.
pub trait Connector: Send + fmt::Display {
    fn connect(&self) -> io::Result<Arc<dyn Transport>>;
}

/// Connects a [`TcpStream`] to a fixed IPv4 address and port.
pub struct TcpConnector {
    addr: SocketAddrV4,
}

impl TcpConnector {
    pub fn new(addr: SocketAddrV4) -> Self {
        TcpConnector { addr }
    }
}

impl fmt::Display for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> io::Result<Arc<dyn Transport>> {
        let stream = TcpStream::connect(self.addr)?;
        // Frames are small; don't let Nagle sit on them.
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(Arc::new(stream))
    }
}
