// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection transport.
//!
//! Layers, bottom-up:
//!
//! ```text
//! +-----------------------------------------------+
//! |  Channel      state machine, send queue,      |
//! |               proxy tunnel, handshake, pings  |
//! +-----------------------------------------------+
//! |  FrameCodec   [len: u32 BE][payload]          |
//! +-----------------------------------------------+
//! |  ByteStream   non-blocking socket (mio)       |
//! +-----------------------------------------------+
//! ```
//!
//! A zero-length frame is a ping. Handshake frames travel in ordinary
//! frames before the channel becomes Active.

pub mod byte_stream;
pub mod channel;
pub mod connector;
pub mod frame_codec;
pub mod handshake;

pub use byte_stream::{connect_complete, BoxedByteStream, ByteStream, Descriptor};
pub use channel::{
    Channel, ChannelCloser, ChannelError, ChannelId, ChannelInfo, ChannelOptions, ChannelState,
    ChannelStats, FlushResult, ReadOutcome, StepOutcome, WriteOutcome, CLOSE_FLUSH_ATTEMPTS,
};
pub use connector::{Connector, TcpConnector};
pub use frame_codec::{FrameCodec, DEFAULT_MAX_MESSAGE_SIZE, FRAME_HEADER_SIZE};
pub use handshake::{
    negotiate, Compression, ConnectParams, HandshakeError, HandshakeFrame, ProtocolVersion,
};
