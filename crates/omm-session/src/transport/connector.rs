// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound connection factory.
//!
//! The channel keeps its connector so it can open a fresh stream when an
//! HTTP proxy drops the connection in the middle of authentication.

use std::io;
use std::net::ToSocketAddrs;

use super::byte_stream::BoxedByteStream;

/// Opens non-blocking byte streams to `host:port` addresses.
pub trait Connector: Send {
    /// Start connecting. The returned stream may still be connecting.
    fn connect(&mut self, addr: &str) -> io::Result<BoxedByteStream>;

    /// Independent connector for the next channel of a session.
    fn box_clone(&self) -> Box<dyn Connector>;
}

/// TCP connector built on `mio::net::TcpStream`.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self, addr: &str) -> io::Result<BoxedByteStream> {
        let mut last_err = None;
        for sock_addr in addr.to_socket_addrs()? {
            match mio::net::TcpStream::connect(sock_addr) {
                Ok(stream) => {
                    if self.nodelay {
                        // Not fatal: some platforms refuse before connect completes.
                        if let Err(e) = stream.set_nodelay(true) {
                            log::debug!("[CONNECT] set_nodelay on {} failed: {}", sock_addr, e);
                        }
                    }
                    log::debug!("[CONNECT] connecting to {} ({})", addr, sock_addr);
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    log::debug!("[CONNECT] {} failed: {}", sock_addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address resolved for {}", addr),
            )
        }))
    }

    fn box_clone(&self) -> Box<dyn Connector> {
        Box::new(self.clone())
    }
}

// ============================================================================
// Test connector
// ============================================================================
