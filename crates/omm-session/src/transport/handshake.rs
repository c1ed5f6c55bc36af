// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection handshake frames and parameter negotiation.
//!
//! ```text
//! ConnectRequest : [0x01][major][minor][ping u16 BE][compression u8][max_fragment u32 BE]
//! ConnectAck     : [0x02][major][minor][ping u16 BE][compression u8][max_fragment u32 BE]
//! ConnectNak     : [0x03][reason utf-8]
//! ```
//!
//! Each frame travels inside one length-prefixed frame.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const KIND_REQUEST: u8 = 0x01;
const KIND_ACK: u8 = 0x02;
const KIND_NAK: u8 = 0x03;

const PARAMS_LEN: usize = 9;

/// Protocol version spoken on the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 14, minor: 1 };
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Payload compression negotiated at connect time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zlib,
    Lz4,
}

impl Compression {
    fn to_u8(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zlib => 1,
            Compression::Lz4 => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Compression::None),
            1 => Some(Compression::Zlib),
            2 => Some(Compression::Lz4),
            _ => None,
        }
    }
}

/// Parameters exchanged in ConnectRequest/ConnectAck.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectParams {
    pub version: ProtocolVersion,
    pub ping_timeout_secs: u16,
    pub compression: Compression,
    pub max_fragment_size: u32,
}

impl ConnectParams {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.ping_timeout_secs))
    }

    fn put(&self, buf: &mut Vec<u8>) {
        buf.push(self.version.major);
        buf.push(self.version.minor);
        buf.extend_from_slice(&self.ping_timeout_secs.to_be_bytes());
        buf.push(self.compression.to_u8());
        buf.extend_from_slice(&self.max_fragment_size.to_be_bytes());
    }

    fn parse(body: &[u8]) -> Result<Self, HandshakeError> {
        if body.len() < PARAMS_LEN {
            return Err(HandshakeError::Truncated(body.len()));
        }
        let compression =
            Compression::from_u8(body[4]).ok_or(HandshakeError::UnknownCompression(body[4]))?;
        Ok(Self {
            version: ProtocolVersion {
                major: body[0],
                minor: body[1],
            },
            ping_timeout_secs: u16::from_be_bytes([body[2], body[3]]),
            compression,
            max_fragment_size: u32::from_be_bytes([body[5], body[6], body[7], body[8]]),
        })
    }
}

/// Handshake decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("handshake frame truncated ({0} bytes)")]
    Truncated(usize),

    #[error("unknown handshake frame kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("unknown compression type {0}")]
    UnknownCompression(u8),

    #[error("unexpected handshake frame: {0}")]
    Unexpected(&'static str),
}

/// One handshake frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeFrame {
    Request(ConnectParams),
    Ack(ConnectParams),
    Nak(String),
}

impl HandshakeFrame {
    pub fn kind_name(&self) -> &'static str {
        match self {
            HandshakeFrame::Request(_) => "ConnectRequest",
            HandshakeFrame::Ack(_) => "ConnectAck",
            HandshakeFrame::Nak(_) => "ConnectNak",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + PARAMS_LEN);
        match self {
            HandshakeFrame::Request(p) => {
                buf.push(KIND_REQUEST);
                p.put(&mut buf);
            }
            HandshakeFrame::Ack(p) => {
                buf.push(KIND_ACK);
                p.put(&mut buf);
            }
            HandshakeFrame::Nak(reason) => {
                buf.push(KIND_NAK);
                buf.extend_from_slice(reason.as_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, HandshakeError> {
        let (&kind, body) = buf.split_first().ok_or(HandshakeError::Truncated(0))?;
        match kind {
            KIND_REQUEST => Ok(HandshakeFrame::Request(ConnectParams::parse(body)?)),
            KIND_ACK => Ok(HandshakeFrame::Ack(ConnectParams::parse(body)?)),
            KIND_NAK => Ok(HandshakeFrame::Nak(
                String::from_utf8_lossy(body).into_owned(),
            )),
            other => Err(HandshakeError::UnknownKind(other)),
        }
    }
}

/// Server-side negotiation of a client's ConnectRequest.
///
/// Major versions must match; every other parameter settles on the
/// smaller of the two sides. Compression is granted only when the server
/// offers the same algorithm. The error is the NAK reason.
pub fn negotiate(client: &ConnectParams, server: &ConnectParams) -> Result<ConnectParams, String> {
    if client.version.major != server.version.major {
        return Err(format!(
            "unsupported protocol version {} (server speaks {})",
            client.version, server.version
        ));
    }

    let compression = if client.compression == server.compression {
        client.compression
    } else {
        Compression::None
    };

    Ok(ConnectParams {
        version: ProtocolVersion {
            major: server.version.major,
            minor: client.version.minor.min(server.version.minor),
        },
        ping_timeout_secs: client.ping_timeout_secs.min(server.ping_timeout_secs),
        compression,
        max_fragment_size: client.max_fragment_size.min(server.max_fragment_size),
    })
}
