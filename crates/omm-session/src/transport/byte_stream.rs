// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ByteStream trait over the physical connection.
//!
//! The channel only needs ordered bytes plus a handful of socket queries,
//! so plain TCP (std or mio) and the test mock all fit behind one trait.
//! Streams are expected to be non-blocking: `WouldBlock` is a normal
//! answer, not a failure.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

#[cfg(windows)]
use std::os::windows::io::AsRawSocket;

/// OS-level handle the caller registers for readiness.
///
/// Changes when the channel has to reconnect mid-handshake (proxy asked
/// to close the connection).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Descriptor(pub i64);

impl Descriptor {
    /// Placeholder for streams with no OS handle.
    pub const NONE: Descriptor = Descriptor(-1);
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Abstraction over byte-oriented streams.
pub trait ByteStream: Read + Write + Send {
    /// Shutdown the stream.
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;

    /// Get the local address of this stream.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Get the peer address of this stream.
    ///
    /// Returns `NotConnected` while a non-blocking connect is in flight.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Set TCP_NODELAY (disable Nagle's algorithm).
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;

    /// Take error from the socket.
    fn take_error(&self) -> io::Result<Option<io::Error>>;

    /// Handle for readiness registration.
    fn descriptor(&self) -> Descriptor;
}

/// Type alias for a boxed ByteStream.
pub type BoxedByteStream = Box<dyn ByteStream>;

/// Check whether a non-blocking connect has completed.
///
/// - `Ok(true)` - connected
/// - `Ok(false)` - still in progress
/// - `Err(e)` - the connect failed
pub fn connect_complete(stream: &dyn ByteStream) -> io::Result<bool> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e)
            if e.kind() == io::ErrorKind::NotConnected
                || e.kind() == io::ErrorKind::WouldBlock =>
        {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn raw_descriptor<T: AsRawFd>(s: &T) -> Descriptor {
    Descriptor(i64::from(s.as_raw_fd()))
}

#[cfg(windows)]
fn raw_descriptor<T: AsRawSocket>(s: &T) -> Descriptor {
    Descriptor(s.as_raw_socket() as i64)
}

// ============================================================================
// std TcpStream implementation (accepted provider connections)
// ============================================================================

impl ByteStream for TcpStream {
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, how)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, nodelay)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        TcpStream::take_error(self)
    }

    #[cfg(any(unix, windows))]
    fn descriptor(&self) -> Descriptor {
        raw_descriptor(self)
    }

    #[cfg(not(any(unix, windows)))]
    fn descriptor(&self) -> Descriptor {
        Descriptor::NONE
    }
}

// ============================================================================
// mio TcpStream implementation (outbound non-blocking connects)
// ============================================================================

impl ByteStream for mio::net::TcpStream {
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, how)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::peer_addr(self)
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        mio::net::TcpStream::set_nodelay(self, nodelay)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        mio::net::TcpStream::take_error(self)
    }

    #[cfg(any(unix, windows))]
    fn descriptor(&self) -> Descriptor {
        raw_descriptor(self)
    }

    #[cfg(not(any(unix, windows)))]
    fn descriptor(&self) -> Descriptor {
        Descriptor::NONE
    }
}

impl ByteStream for BoxedByteStream {
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        (**self).shutdown(how)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        (**self).peer_addr()
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        (**self).set_nodelay(nodelay)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        (**self).take_error()
    }

    fn descriptor(&self) -> Descriptor {
        (**self).descriptor()
    }
}

// ============================================================================
// Test mock stream
// ============================================================================


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::mock::MockStream;
    use super::*;

    #[test]
    fn test_mock_stream_basic() {
        let mut stream = MockStream::new();

        stream.write_all(b"hello").unwrap();
        assert_eq!(stream.get_written_data(), b"hello");

        let mut buf = [0u8; 10];
        let result = stream.read(&mut buf);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WouldBlock);

        stream.feed_read_data(b"world");
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn test_mock_pair_is_linked() {
        let (mut a, mut b) = MockStream::pair();

        a.write_all(b"from a").unwrap();
        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"from a");

        b.write_all(b"from b").unwrap();
        let n = a.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"from b");
    }

    #[test]
    fn test_mock_shutdown_reaches_peer() {
        let (mut a, mut b) = MockStream::pair();
        ByteStream::shutdown(&mut a, Shutdown::Both).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
        assert!(b.write(b"x").is_err());
    }

    #[test]
    fn test_mock_error_injection_is_one_shot() {
        let mut stream = MockStream::new();

        stream.inject_read_error(io::ErrorKind::ConnectionReset);
        let mut buf = [0u8; 10];
        assert_eq!(
            stream.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );

        stream.feed_read_data(b"ok");
        assert!(stream.read(&mut buf).is_ok());
    }

    #[test]
    fn test_mock_write_budget() {
        let mut stream = MockStream::new();
        stream.set_write_budget(Some(3));

        assert_eq!(stream.write(b"hello").unwrap(), 3);
        assert_eq!(
            stream.write(b"lo").unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_connect_complete() {
        let stream = MockStream::new();
        stream.set_connect_pending(true);
        assert!(!connect_complete(&stream).unwrap());

        stream.set_connect_pending(false);
        assert!(connect_complete(&stream).unwrap());
    }

    #[test]
    fn test_descriptor() {
        let stream = MockStream::new().with_descriptor(42);
        assert_eq!(stream.descriptor(), Descriptor(42));
        assert_eq!(Descriptor(42).to_string(), "fd:42");
    }
}
