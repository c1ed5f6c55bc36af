// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel: one physical connection driven through connect, optional
//! proxy tunnel, handshake and data transfer.
//!
//! # State Machine
//!
//! ```text
//!      +----------+
//!      | Inactive |
//!      +----+-----+
//!           | connect()
//!           v
//!      +----------+
//!      |Connecting|
//!      +----+-----+
//!           | socket connected (step)
//!           v
//!      +------------+   proxy CONNECT / auth rounds,
//!      |Initializing|<-- possibly on a new descriptor
//!      +----+-------+
//!           | ConnectAck (step)
//!           v
//!      +----------+
//!      |  Active  |
//!      +----------+
//!
//!   close(), I/O failure, NAK, ping timeout: any state --> Closed
//! ```
//!
//! A channel has exactly one driver. [`ChannelCloser`] is the only handle
//! that may be used from another thread; the driver notices the request
//! on its next call and tears the channel down.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::byte_stream::{connect_complete, BoxedByteStream, Descriptor};
use super::connector::Connector;
use super::frame_codec::{FrameCodec, DEFAULT_MAX_MESSAGE_SIZE, FRAME_HEADER_SIZE};
use super::handshake::{
    negotiate, Compression, ConnectParams, HandshakeError, HandshakeFrame, ProtocolVersion,
};
use crate::config::{ProxyConfig, SessionConfig};
use crate::proxy::{http, ProxyAuthError, ProxyAuthenticator, MAX_IGNORED_RESPONSES};

/// Flush attempts made by `close()` before the socket is released.
pub const CLOSE_FLUSH_ATTEMPTS: usize = 3;

// ============================================================================
// Identity and state
// ============================================================================

/// Handle naming a channel.
///
/// `index` is the logical session; `generation` changes on every
/// reconnect so stale references to a previous connection never match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId {
    pub index: u32,
    pub generation: u32,
}

impl ChannelId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Id for the next connection of the same logical session.
    pub fn next_generation(self) -> Self {
        Self {
            index: self.index,
            generation: self.generation.wrapping_add(1),
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}.{}", self.index, self.generation)
    }
}

/// Channel state machine states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChannelState {
    #[default]
    Inactive,
    Connecting,
    Initializing,
    Active,
    Closed,
}

impl ChannelState {
    pub fn is_active(&self) -> bool {
        matches!(self, ChannelState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Inactive => "Inactive",
            ChannelState::Connecting => "Connecting",
            ChannelState::Initializing => "Initializing",
            ChannelState::Active => "Active",
            ChannelState::Closed => "Closed",
        };
        write!(f, "{}", s)
    }
}

/// Parameters fixed by the handshake for the channel's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
    pub ping_timeout: Duration,
    pub max_fragment_size: u32,
    pub version: ProtocolVersion,
    pub compression: Compression,
}

// ============================================================================
// Errors and outcomes
// ============================================================================

/// Channel failures.
///
/// Everything except `TooLarge` and `InvalidState` closes the channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("handshake rejected by peer: {0}")]
    HandshakeRejected(String),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("proxy tunnel failed: {0}")]
    Proxy(#[from] ProxyAuthError),

    #[error("no traffic received within ping timeout ({0:?})")]
    PingTimeout(Duration),

    #[error("message of {len} bytes exceeds max fragment size {max}")]
    TooLarge { len: usize, max: u32 },

    #[error("operation not valid in state {0}")]
    InvalidState(ChannelState),

    #[error("channel is closed")]
    Closed,
}

impl ChannelError {
    /// The channel is gone after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ChannelError::TooLarge { .. } | ChannelError::InvalidState(_)
        )
    }
}

/// Result of one `step()`.
#[derive(Debug)]
pub enum StepOutcome {
    /// Handshake still running. `new_descriptor` is set when the channel
    /// switched sockets; readiness interest must move to it.
    InProgress { new_descriptor: Option<Descriptor> },
    Active(ChannelInfo),
    Failed(ChannelError),
}

/// Result of one `read()`.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Message(Vec<u8>),
    Ping,
    WouldBlock,
}

/// Result of one `write()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Success,
    /// Queued; call `flush()` when writable.
    WouldBlock,
}

/// Result of a flush operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushResult {
    /// All queued data was sent
    Complete,

    /// Some data remains in the queue (would block)
    WouldBlock,

    /// Queue is empty, nothing to flush
    Empty,
}

/// Statistics for a channel.
#[derive(Clone, Debug, Default)]
pub struct ChannelStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub pings_sent: u64,
    pub pings_received: u64,
    /// Partial socket writes (backpressure events)
    pub partial_sends: u64,
    /// Sockets reopened during proxy authentication
    pub proxy_reconnects: u64,
}

// ============================================================================
// Options
// ============================================================================

/// Everything a channel needs to connect.
#[derive(Clone, Debug)]
pub struct ChannelOptions {
    /// `host:port` of the provider
    pub target: String,
    pub proxy: Option<ProxyConfig>,
    /// Proposed (consumer) or offered (provider) handshake parameters
    pub params: ConnectParams,
    /// Frame size limit for the codec
    pub max_message_size: usize,
}

impl ChannelOptions {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            target: config.target(),
            proxy: config.proxy.clone(),
            params: config.connect_params(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Cross-thread close request for a channel.
#[derive(Clone, Debug)]
pub struct ChannelCloser {
    flag: Arc<AtomicBool>,
}

impl ChannelCloser {
    pub fn close(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

// ============================================================================
// Channel
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    ProxyConnecting,
    ProxyResponse,
    AwaitAck,
    AwaitRequest,
}

#[derive(Debug)]
struct ProxyTunnel {
    auth: ProxyAuthenticator,
    response: Vec<u8>,
    auth_header: Option<String>,
    ignored: u32,
}

/// A connection to a peer.
pub struct Channel {
    id: ChannelId,
    state: ChannelState,
    phase: Phase,
    options: ChannelOptions,
    stream: Option<BoxedByteStream>,
    connector: Option<Box<dyn Connector>>,
    codec: FrameCodec,
    send_queue: VecDeque<Vec<u8>>,
    pending_send: Option<(Vec<u8>, usize)>,
    proxy: Option<ProxyTunnel>,
    info: Option<ChannelInfo>,
    closer: Arc<AtomicBool>,
    last_recv: Instant,
    last_send: Instant,
    stats: ChannelStats,
}

impl Channel {
    /// Create an outbound channel in `Inactive` state.
    pub fn new(id: ChannelId, options: ChannelOptions, connector: Box<dyn Connector>) -> Self {
        let proxy = options.proxy.as_ref().map(|p| ProxyTunnel {
            auth: ProxyAuthenticator::new(p.credentials()),
            response: Vec::new(),
            auth_header: None,
            ignored: 0,
        });
        let mut channel = Self::base(id, options);
        channel.connector = Some(connector);
        channel.proxy = proxy;
        channel
    }

    /// Wrap an accepted stream; the channel waits for a ConnectRequest.
    pub fn accept(id: ChannelId, stream: BoxedByteStream, options: ChannelOptions) -> Self {
        let mut channel = Self::base(id, options);
        channel.attach(stream);
        channel.phase = Phase::AwaitRequest;
        channel.set_state(ChannelState::Initializing);
        channel
    }

    fn base(id: ChannelId, options: ChannelOptions) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: ChannelState::Inactive,
            phase: Phase::Idle,
            codec: FrameCodec::new(options.max_message_size),
            options,
            stream: None,
            connector: None,
            send_queue: VecDeque::new(),
            pending_send: None,
            proxy: None,
            info: None,
            closer: Arc::new(AtomicBool::new(false)),
            last_recv: now,
            last_send: now,
            stats: ChannelStats::default(),
        }
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Negotiated parameters, once Active.
    pub fn info(&self) -> Option<ChannelInfo> {
        self.info
    }

    /// Descriptor of the current socket, if any.
    pub fn descriptor(&self) -> Option<Descriptor> {
        self.stream.as_ref().map(|s| s.descriptor())
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Handle for closing this channel from another thread.
    pub fn closer(&self) -> ChannelCloser {
        ChannelCloser {
            flag: self.closer.clone(),
        }
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    fn set_state(&mut self, new_state: ChannelState) {
        if self.state != new_state {
            log::debug!("[CHANNEL] {} {} -> {}", self.id, self.state, new_state);
            self.state = new_state;
        }
    }

    fn attach(&mut self, stream: BoxedByteStream) {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[CHANNEL] {} set_nodelay failed: {}", self.id, e);
        }
        self.stream = Some(stream);
    }

    /// Release the socket and enter Closed. Safe to call repeatedly.
    fn teardown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    log::debug!("[CHANNEL] {} shutdown failed: {}", self.id, e);
                }
            }
        }
        self.send_queue.clear();
        self.pending_send = None;
        self.codec.reset();
        self.phase = Phase::Idle;
        self.closer.store(true, Ordering::Release);
        self.set_state(ChannelState::Closed);
    }

    fn fail(&mut self, err: ChannelError) -> StepOutcome {
        log::warn!("[CHANNEL] {} failed in {}: {}", self.id, self.state, err);
        self.teardown();
        StepOutcome::Failed(err)
    }

    /// Apply a pending cross-thread close; error if the channel is closed.
    fn observe_close(&mut self) -> Result<(), ChannelError> {
        if self.state != ChannelState::Closed && self.closer.load(Ordering::Acquire) {
            log::debug!("[CHANNEL] {} close requested", self.id);
            self.teardown();
        }
        if self.state == ChannelState::Closed {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    fn ensure_active(&mut self) -> Result<(), ChannelError> {
        self.observe_close()?;
        if self.state != ChannelState::Active {
            return Err(ChannelError::InvalidState(self.state));
        }
        Ok(())
    }

    fn connect_addr(&self) -> String {
        match &self.options.proxy {
            Some(proxy) => proxy.address(),
            None => self.options.target.clone(),
        }
    }

    // ========================================================================
    // Connect and handshake
    // ========================================================================

    /// Start connecting. On failure the channel stays `Inactive`.
    pub fn connect(&mut self) -> Result<(), ChannelError> {
        self.observe_close()?;
        if self.state != ChannelState::Inactive {
            return Err(ChannelError::InvalidState(self.state));
        }

        let addr = self.connect_addr();
        let result = match self.connector.as_mut() {
            Some(connector) => connector.connect(&addr),
            None => return Err(ChannelError::InvalidState(self.state)),
        };

        match result {
            Ok(stream) => {
                self.attach(stream);
                self.set_state(ChannelState::Connecting);
                Ok(())
            }
            Err(source) => {
                log::warn!("[CHANNEL] {} connect to {} failed: {}", self.id, addr, source);
                Err(ChannelError::Connect { addr, source })
            }
        }
    }

    /// Drive the connection forward. Call while the socket is ready.
    pub fn step(&mut self) -> StepOutcome {
        if let Err(e) = self.observe_close() {
            return StepOutcome::Failed(e);
        }

        match self.state {
            ChannelState::Inactive => StepOutcome::Failed(ChannelError::InvalidState(self.state)),
            ChannelState::Connecting => self.step_connecting(),
            ChannelState::Initializing => self.step_initializing(),
            ChannelState::Active => match self.info {
                Some(info) => StepOutcome::Active(info),
                None => StepOutcome::Failed(ChannelError::InvalidState(self.state)),
            },
            ChannelState::Closed => StepOutcome::Failed(ChannelError::Closed),
        }
    }

    fn socket_connected(&self) -> io::Result<bool> {
        match self.stream.as_deref() {
            Some(stream) => connect_complete(stream),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no socket")),
        }
    }

    fn step_connecting(&mut self) -> StepOutcome {
        match self.socket_connected() {
            Ok(false) => StepOutcome::InProgress {
                new_descriptor: None,
            },
            Err(source) => {
                let addr = self.connect_addr();
                self.fail(ChannelError::Connect { addr, source })
            }
            Ok(true) => {
                self.set_state(ChannelState::Initializing);
                if self.proxy.is_some() {
                    self.queue_proxy_connect();
                    self.phase = Phase::ProxyResponse;
                } else {
                    self.queue_connect_request();
                }
                self.step_initializing()
            }
        }
    }

    fn step_initializing(&mut self) -> StepOutcome {
        if let Err(e) = self.flush_inner() {
            return self.fail(e);
        }

        match self.phase {
            Phase::ProxyConnecting => match self.socket_connected() {
                Ok(true) => {
                    self.queue_proxy_connect();
                    self.phase = Phase::ProxyResponse;
                    self.step_initializing()
                }
                Ok(false) => StepOutcome::InProgress {
                    new_descriptor: None,
                },
                Err(source) => {
                    let addr = self.connect_addr();
                    self.fail(ChannelError::Connect { addr, source })
                }
            },
            Phase::ProxyResponse => self.step_proxy_response(),
            Phase::AwaitAck => self.step_await_ack(),
            Phase::AwaitRequest => self.step_await_request(),
            Phase::Idle => StepOutcome::Failed(ChannelError::InvalidState(self.state)),
        }
    }

    fn queue_connect_request(&mut self) {
        let frame = HandshakeFrame::Request(self.options.params).encode();
        self.send_queue.push_back(FrameCodec::encode(&frame));
        self.phase = Phase::AwaitAck;
    }

    fn queue_proxy_connect(&mut self) {
        let header = self.proxy.as_ref().and_then(|t| t.auth_header.as_deref());
        let request = http::connect_request(&self.options.target, header);
        log::debug!("[PROXY] {} CONNECT {}", self.id, self.options.target);
        self.send_queue.push_back(request.into_bytes());
    }

    fn step_proxy_response(&mut self) -> StepOutcome {
        let mut buf = [0u8; 1024];
        loop {
            let (Some(stream), Some(tunnel)) = (self.stream.as_mut(), self.proxy.as_mut()) else {
                return self.fail(ChannelError::InvalidState(self.state));
            };
            match stream.read(&mut buf) {
                Ok(0) => {
                    return self.fail(ChannelError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "proxy closed the connection",
                    )));
                }
                Ok(n) => tunnel.response.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.fail(ChannelError::Io(e)),
            }
        }

        loop {
            let Some(tunnel) = self.proxy.as_mut() else {
                return self.fail(ChannelError::InvalidState(self.state));
            };
            let Some(end) = http::find_header_end(&tunnel.response) else {
                return StepOutcome::InProgress {
                    new_descriptor: None,
                };
            };
            let raw: Vec<u8> = tunnel.response.drain(..end).collect();
            let text = String::from_utf8_lossy(&raw);

            match tunnel.auth.process_response(&text) {
                Err(ProxyAuthError::MissingStatusLine) => {
                    tunnel.ignored += 1;
                    log::debug!("[PROXY] {} ignoring response without status", self.id);
                    if tunnel.ignored > MAX_IGNORED_RESPONSES {
                        let err = ProxyAuthError::TooManyIgnoredResponses(tunnel.ignored);
                        return self.fail(ChannelError::Proxy(err));
                    }
                }
                Err(e) => return self.fail(ChannelError::Proxy(e)),
                Ok(resp) if resp.authenticated => {
                    let leftover = std::mem::take(&mut tunnel.response);
                    log::info!("[PROXY] {} tunnel to {} open", self.id, self.options.target);
                    self.codec.feed(&leftover);
                    self.queue_connect_request();
                    return self.step_initializing();
                }
                Ok(resp) => {
                    tunnel.auth_header = resp.authorization;
                    tunnel.response.clear();
                    if resp.connection_close {
                        return self.reconnect_proxy();
                    }
                    self.queue_proxy_connect();
                    if let Err(e) = self.flush_inner() {
                        return self.fail(e);
                    }
                    return StepOutcome::InProgress {
                        new_descriptor: None,
                    };
                }
            }
        }
    }

    /// The proxy is closing this socket: open a new one and carry the
    /// negotiated authorization over to it.
    fn reconnect_proxy(&mut self) -> StepOutcome {
        if let Some(mut old) = self.stream.take() {
            if let Err(e) = old.shutdown(Shutdown::Both) {
                log::debug!("[PROXY] {} shutdown of closing socket failed: {}", self.id, e);
            }
        }
        self.send_queue.clear();
        self.pending_send = None;
        self.codec.reset();

        let addr = self.connect_addr();
        let result = match self.connector.as_mut() {
            Some(connector) => connector.connect(&addr),
            None => return self.fail(ChannelError::InvalidState(self.state)),
        };

        match result {
            Ok(stream) => {
                let descriptor = stream.descriptor();
                self.attach(stream);
                self.phase = Phase::ProxyConnecting;
                self.stats.proxy_reconnects += 1;
                log::info!(
                    "[PROXY] {} proxy closed connection, reconnected on {}",
                    self.id,
                    descriptor
                );
                StepOutcome::InProgress {
                    new_descriptor: Some(descriptor),
                }
            }
            Err(source) => self.fail(ChannelError::Connect { addr, source }),
        }
    }

    fn step_await_ack(&mut self) -> StepOutcome {
        let frame = match self.decode_frame() {
            Ok(Some(frame)) if !frame.is_empty() => frame,
            Ok(_) => {
                return StepOutcome::InProgress {
                    new_descriptor: None,
                }
            }
            Err(e) => return self.fail(ChannelError::Io(e)),
        };

        match HandshakeFrame::decode(&frame) {
            Ok(HandshakeFrame::Ack(params)) => self.activate(params),
            Ok(HandshakeFrame::Nak(reason)) => self.fail(ChannelError::HandshakeRejected(reason)),
            Ok(other) => self.fail(ChannelError::Handshake(HandshakeError::Unexpected(
                other.kind_name(),
            ))),
            Err(e) => self.fail(ChannelError::Handshake(e)),
        }
    }

    fn step_await_request(&mut self) -> StepOutcome {
        let frame = match self.decode_frame() {
            Ok(Some(frame)) if !frame.is_empty() => frame,
            Ok(_) => {
                return StepOutcome::InProgress {
                    new_descriptor: None,
                }
            }
            Err(e) => return self.fail(ChannelError::Io(e)),
        };

        let client = match HandshakeFrame::decode(&frame) {
            Ok(HandshakeFrame::Request(params)) => params,
            Ok(other) => {
                return self.fail(ChannelError::Handshake(HandshakeError::Unexpected(
                    other.kind_name(),
                )))
            }
            Err(e) => return self.fail(ChannelError::Handshake(e)),
        };

        match negotiate(&client, &self.options.params) {
            Ok(agreed) => {
                let ack = HandshakeFrame::Ack(agreed).encode();
                self.send_queue.push_back(FrameCodec::encode(&ack));
                if let Err(e) = self.flush_inner() {
                    return self.fail(e);
                }
                self.activate(agreed)
            }
            Err(reason) => {
                let nak = HandshakeFrame::Nak(reason.clone()).encode();
                self.send_queue.push_back(FrameCodec::encode(&nak));
                if let Err(e) = self.flush_inner() {
                    log::debug!("[CHANNEL] {} nak not sent: {}", self.id, e);
                }
                self.fail(ChannelError::HandshakeRejected(reason))
            }
        }
    }

    fn activate(&mut self, params: ConnectParams) -> StepOutcome {
        let info = ChannelInfo {
            ping_timeout: params.ping_timeout(),
            max_fragment_size: params.max_fragment_size,
            version: params.version,
            compression: params.compression,
        };
        self.info = Some(info);
        self.phase = Phase::Idle;
        let now = Instant::now();
        self.last_recv = now;
        self.last_send = now;
        self.set_state(ChannelState::Active);
        log::info!(
            "[CHANNEL] {} active: version {}, ping timeout {:?}, max fragment {}",
            self.id,
            info.version,
            info.ping_timeout,
            info.max_fragment_size
        );
        StepOutcome::Active(info)
    }

    // ========================================================================
    // Data transfer
    // ========================================================================

    fn decode_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no socket"))?;
        let frame = self.codec.decode(&mut **stream)?;
        if let Some(data) = &frame {
            self.last_recv = Instant::now();
            self.stats.bytes_received += (FRAME_HEADER_SIZE + data.len()) as u64;
        }
        Ok(frame)
    }

    /// Read one message. I/O failure or EOF closes the channel.
    pub fn read(&mut self) -> Result<ReadOutcome, ChannelError> {
        self.ensure_active()?;

        match self.decode_frame() {
            Ok(Some(frame)) if frame.is_empty() => {
                self.stats.pings_received += 1;
                Ok(ReadOutcome::Ping)
            }
            Ok(Some(frame)) => {
                self.stats.messages_received += 1;
                Ok(ReadOutcome::Message(frame))
            }
            Ok(None) => Ok(ReadOutcome::WouldBlock),
            Err(e) => {
                log::warn!("[CHANNEL] {} read failed: {}", self.id, e);
                self.teardown();
                Err(ChannelError::Io(e))
            }
        }
    }

    /// Queue one message and try to send it.
    pub fn write(&mut self, payload: &[u8]) -> Result<WriteOutcome, ChannelError> {
        self.ensure_active()?;

        if let Some(info) = self.info {
            if payload.len() > info.max_fragment_size as usize {
                return Err(ChannelError::TooLarge {
                    len: payload.len(),
                    max: info.max_fragment_size,
                });
            }
        }

        self.send_queue.push_back(FrameCodec::encode(payload));
        self.stats.messages_sent += 1;

        match self.flush_inner() {
            Ok(FlushResult::WouldBlock) => Ok(WriteOutcome::WouldBlock),
            Ok(_) => Ok(WriteOutcome::Success),
            Err(e) => {
                self.teardown();
                Err(e)
            }
        }
    }

    /// Send queued data.
    pub fn flush(&mut self) -> Result<FlushResult, ChannelError> {
        self.observe_close()?;
        match self.flush_inner() {
            Ok(result) => Ok(result),
            Err(e) => {
                self.teardown();
                Err(e)
            }
        }
    }

    /// Bytes still waiting to be written.
    pub fn has_pending_writes(&self) -> bool {
        self.pending_send.is_some() || !self.send_queue.is_empty()
    }

    fn flush_inner(&mut self) -> Result<FlushResult, ChannelError> {
        if !self.has_pending_writes() {
            return Ok(FlushResult::Empty);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(FlushResult::Empty);
        };

        loop {
            if self.pending_send.is_none() {
                match self.send_queue.pop_front() {
                    Some(buf) => self.pending_send = Some((buf, 0)),
                    None => break,
                }
            }
            let Some((buf, offset)) = self.pending_send.as_mut() else {
                break;
            };

            match stream.write(&buf[*offset..]) {
                Ok(0) => {
                    return Err(ChannelError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed",
                    )));
                }
                Ok(n) => {
                    self.stats.bytes_sent += n as u64;
                    *offset += n;
                    if *offset >= buf.len() {
                        self.pending_send = None;
                        self.last_send = Instant::now();
                    } else {
                        self.stats.partial_sends += 1;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushResult::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChannelError::Io(e)),
            }
        }

        if let Err(e) = stream.flush() {
            log::debug!("[CHANNEL] {} flush failed: {}", self.id, e);
        }
        Ok(FlushResult::Complete)
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Ping bookkeeping for an Active channel.
    ///
    /// Sends a ping once half the ping timeout has passed without a write;
    /// fails the channel when nothing arrived for a whole ping timeout.
    pub fn check_ping(&mut self, now: Instant) -> Result<(), ChannelError> {
        self.ensure_active()?;
        let timeout = match self.info {
            Some(info) if !info.ping_timeout.is_zero() => info.ping_timeout,
            _ => return Ok(()),
        };

        if now.saturating_duration_since(self.last_recv) > timeout {
            log::warn!("[CHANNEL] {} ping timeout after {:?}", self.id, timeout);
            self.teardown();
            return Err(ChannelError::PingTimeout(timeout));
        }

        if now.saturating_duration_since(self.last_send) >= timeout / 2 && !self.ping_queued() {
            self.send_queue.push_back(FrameCodec::ping());
            self.stats.pings_sent += 1;
            if let Err(e) = self.flush_inner() {
                self.teardown();
                return Err(e);
            }
        }
        Ok(())
    }

    /// A ping is still waiting in the send queue.
    fn ping_queued(&self) -> bool {
        let ping = FrameCodec::ping();
        matches!(&self.pending_send, Some((buf, _)) if *buf == ping)
            || self.send_queue.iter().any(|buf| *buf == ping)
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Flush what can be flushed, release the socket, enter Closed.
    ///
    /// Idempotent. The channel is Closed afterwards even if an error is
    /// returned.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        if self.state == ChannelState::Closed {
            return Ok(());
        }

        let mut result = Ok(());
        if matches!(
            self.state,
            ChannelState::Initializing | ChannelState::Active
        ) {
            for _ in 0..CLOSE_FLUSH_ATTEMPTS {
                match self.flush_inner() {
                    Ok(FlushResult::WouldBlock) => continue,
                    Ok(_) => break,
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            if self.has_pending_writes() {
                log::debug!("[CHANNEL] {} closing with unsent data", self.id);
            }
        }

        self.teardown();
        result
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("target", &self.options.target)
            .field("send_queue_len", &self.send_queue.len())
            .field("messages_sent", &self.stats.messages_sent)
            .field("messages_received", &self.stats.messages_received)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
