// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing for OMM messages and handshake frames.
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | Payload           |
//! +----------------+-------------------+
//! ```
//!
//! A frame with length 0 carries no payload and is the channel's ping.

use std::collections::VecDeque;
use std::io::{self, Read};

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default maximum message size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Length-prefix frame codec.
///
/// Keeps partial read state so it can be driven from a non-blocking
/// stream that hands out bytes in arbitrary chunks.
#[derive(Debug)]
pub struct FrameCodec {
    state: ReadState,
    buffer: Vec<u8>,
    /// Bytes already taken off the stream that belong to the next frames.
    prefix: VecDeque<u8>,
    max_size: usize,
    frames_decoded: u64,
    bytes_decoded: u64,
    frames_rejected: u64,
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    ReadingLength { bytes_read: usize },
    ReadingBody {
        expected_len: usize,
        bytes_read: usize,
    },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::ReadingLength { bytes_read: 0 }
    }
}

/// Reader that drains `prefix` before touching the stream.
struct Prefixed<'a, R: Read + ?Sized> {
    prefix: &'a mut VecDeque<u8>,
    inner: &'a mut R,
}

impl<R: Read + ?Sized> Read for Prefixed<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.prefix.is_empty() {
            return self.prefix.read(buf);
        }
        self.inner.read(buf)
    }
}

impl FrameCodec {
    /// Create a new frame codec with the specified max message size.
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::default(),
            buffer: vec![0u8; FRAME_HEADER_SIZE],
            prefix: VecDeque::new(),
            max_size,
            frames_decoded: 0,
            bytes_decoded: 0,
            frames_rejected: 0,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Reset the codec state (e.g., after reconnecting the stream).
    pub fn reset(&mut self) {
        self.state = ReadState::default();
        self.buffer.resize(FRAME_HEADER_SIZE, 0);
        self.prefix.clear();
    }

    /// Push back bytes read past the end of a non-framed exchange.
    pub fn feed(&mut self, data: &[u8]) {
        self.prefix.extend(data);
    }

    /// Encode a message into a framed buffer.
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        Self::encode_into(payload, &mut frame);
        frame
    }

    /// Append `[length: u32 BE][payload]` to `buf`.
    pub fn encode_into(payload: &[u8], buf: &mut Vec<u8>) {
        let len = payload.len() as u32;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(payload);
    }

    /// The ping frame: a bare zero length.
    pub fn ping() -> Vec<u8> {
        Self::encode(&[])
    }

    /// Try to decode a complete frame.
    ///
    /// - `Ok(Some(data))` - a complete frame (empty for a ping)
    /// - `Ok(None)` - need more data (WouldBlock)
    /// - `Err(e)` - I/O error, EOF, or oversized frame
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<Vec<u8>>> {
        let mut prefix = std::mem::take(&mut self.prefix);
        let result = {
            let mut chained = Prefixed {
                prefix: &mut prefix,
                inner: reader,
            };
            self.decode_from(&mut chained)
        };
        self.prefix = prefix;
        result
    }

    fn decode_from<R: Read>(&mut self, reader: &mut R) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.state {
                ReadState::ReadingLength { bytes_read } => {
                    match reader.read(&mut self.buffer[bytes_read..FRAME_HEADER_SIZE]) {
                        Ok(0) => {
                            let msg = if bytes_read == 0 {
                                "connection closed"
                            } else {
                                "incomplete frame header"
                            };
                            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, msg));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < FRAME_HEADER_SIZE {
                                self.state = ReadState::ReadingLength { bytes_read: total };
                                continue;
                            }

                            let len = u32::from_be_bytes([
                                self.buffer[0],
                                self.buffer[1],
                                self.buffer[2],
                                self.buffer[3],
                            ]) as usize;

                            if len > self.max_size {
                                self.frames_rejected += 1;
                                self.state = ReadState::default();
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!(
                                        "frame too large: {} bytes (max {})",
                                        len, self.max_size
                                    ),
                                ));
                            }

                            if len == 0 {
                                self.frames_decoded += 1;
                                self.state = ReadState::default();
                                return Ok(Some(Vec::new()));
                            }

                            self.buffer.resize(len, 0);
                            self.state = ReadState::ReadingBody {
                                expected_len: len,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }

                ReadState::ReadingBody {
                    expected_len,
                    bytes_read,
                } => match reader.read(&mut self.buffer[bytes_read..expected_len]) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "incomplete frame body",
                        ));
                    }
                    Ok(n) => {
                        let total = bytes_read + n;
                        if total < expected_len {
                            self.state = ReadState::ReadingBody {
                                expected_len,
                                bytes_read: total,
                            };
                            continue;
                        }

                        let message = self.buffer[..expected_len].to_vec();
                        self.frames_decoded += 1;
                        self.bytes_decoded += expected_len as u64;

                        self.buffer.resize(FRAME_HEADER_SIZE, 0);
                        self.state = ReadState::default();

                        return Ok(Some(message));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                },
            }
        }
    }

    /// Check if the codec is in the middle of reading a frame.
    pub fn is_partial(&self) -> bool {
        match self.state {
            ReadState::ReadingLength { bytes_read } => bytes_read > 0,
            ReadState::ReadingBody { .. } => true,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::byte_stream::mock::MockStream;
    use std::io::Cursor;

    #[test]
    fn test_encode_simple() {
        let frame = FrameCodec::encode(b"hello");
        assert_eq!(&frame[..4], &5u32.to_be_bytes());
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn test_ping_is_empty_frame() {
        assert_eq!(FrameCodec::ping(), vec![0, 0, 0, 0]);

        let mut codec = FrameCodec::new(1024);
        let mut cursor = Cursor::new(FrameCodec::ping());
        assert_eq!(codec.decode(&mut cursor).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_decode_multiple() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = Vec::new();
        FrameCodec::encode_into(b"first", &mut buf);
        FrameCodec::encode_into(b"second", &mut buf);

        let mut cursor = Cursor::new(buf);
        assert_eq!(codec.decode(&mut cursor).unwrap(), Some(b"first".to_vec()));
        assert_eq!(codec.decode(&mut cursor).unwrap(), Some(b"second".to_vec()));
        assert_eq!(codec.frames_decoded(), 2);
        assert_eq!(codec.bytes_decoded(), 11);
    }

    #[test]
    fn test_decode_too_large() {
        let mut codec = FrameCodec::new(10);
        let frame = FrameCodec::encode(b"this message is too long for the limit");
        let mut cursor = Cursor::new(frame);

        let err = codec.decode(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(codec.frames_rejected(), 1);
    }

    #[test]
    fn test_decode_resumes_after_would_block() {
        let mut codec = FrameCodec::new(1024);
        let mut stream = MockStream::new();
        let frame = FrameCodec::encode(b"hello, world!");

        stream.feed_read_data(&frame[..6]);
        assert_eq!(codec.decode(&mut stream).unwrap(), None);
        assert!(codec.is_partial());

        stream.feed_read_data(&frame[6..]);
        assert_eq!(
            codec.decode(&mut stream).unwrap(),
            Some(b"hello, world!".to_vec())
        );
        assert!(!codec.is_partial());
    }

    #[test]
    fn test_fed_bytes_come_first() {
        let mut codec = FrameCodec::new(1024);
        let mut stream = MockStream::new();
        let frame = FrameCodec::encode(b"abc");

        codec.feed(&frame[..5]);
        stream.feed_read_data(&frame[5..]);

        assert_eq!(codec.decode(&mut stream).unwrap(), Some(b"abc".to_vec()));
    }

    #[test]
    fn test_eof_at_boundary() {
        let mut codec = FrameCodec::new(1024);
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let err = codec.decode(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_reset_drops_partial_state() {
        let mut codec = FrameCodec::new(1024);
        let mut stream = MockStream::new();
        stream.feed_read_data(&FrameCodec::encode(b"hello")[..4]);
        assert_eq!(codec.decode(&mut stream).unwrap(), None);
        assert!(codec.is_partial());

        codec.feed(b"junk");
        codec.reset();
        assert!(!codec.is_partial());
    }
}
