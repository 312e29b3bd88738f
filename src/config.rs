// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Client configuration
//!
//! Three options, mirroring the host's persistent parameters: an enable
//! switch, the server's IPv4 address, and the TCP port. Persistence itself
//! belongs to the host; this crate only consumes the values at startup.

use std::net::Ipv4Addr;

#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// When false, no socket is opened and no worker is started.
    pub enabled: bool,
    /// IPv4 address of the 9P server.
    pub ip: Ipv4Addr,
    /// TCP port of the 9P server.
    pub port: u16,
}

impl Config {
    /// An enabled configuration for the given server.
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Config {
            enabled: true,
            ip,
            port,
        }
    }
}

impl Default for Config {
    /// The subsystem ships disabled.
    fn default() -> Self {
        Config {
            enabled: false,
            ip: Ipv4Addr::UNSPECIFIED,
            port: 0,
        }
    }
}
