// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OMM Session Layer
//!
//! Connection and stream management for OMM market-data consumers and
//! providers over a framed, non-blocking byte stream.
//!
//! # Features
//!
//! - **Channels**: connect/handshake state machine with pings, partial
//!   writes and a cross-thread close handle
//! - **HTTP Proxy Tunneling**: CONNECT with Basic authentication and
//!   reconnect on `Proxy-Connection: close`
//! - **Request Slots**: bounded login, directory and dictionary pools
//!   shared by every channel of a provider
//! - **Watchlist**: item stream ids, batches and replay after reconnect
//! - **RTT**: round-trip latency probes on login streams
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Instant;
//!
//! use omm_session::{
//!     ConsumerSession, DomainType, HeaderCodec, MsgFlags, SessionConfig, TcpConnector,
//! };
//!
//! let config = SessionConfig::default().with_target("provider.local", 14002);
//! let mut session = ConsumerSession::new(
//!     config,
//!     Box::new(TcpConnector::new()),
//!     Arc::new(HeaderCodec),
//! )?;
//! session.connect(Instant::now())?;
//! session.request_item(DomainType::MarketPrice, "IBM.N", MsgFlags::streaming())?;
//!
//! loop {
//!     session.poll(Instant::now())?;
//!     while let Some(event) = session.poll_event() {
//!         println!("{:?}", event);
//!     }
//! #   break;
//! }
//! # Ok::<(), omm_session::SessionError>(())
//! ```
//!
//! # Configuration File
//!
//! ```json
//! {
//!   "host": "provider.local",
//!   "port": 14002,
//!   "ping_timeout_secs": 60,
//!   "reconnect_min_delay_ms": 1000,
//!   "reconnect_max_delay_ms": 5000,
//!   "dictionary_names": ["RWFFld", "RWFEnum"],
//!   "proxy": { "host": "proxy.local", "port": 8080, "username": "user", "password": "pass" }
//! }
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod proxy;
pub mod reconnect;
pub mod registry;
pub mod rtt;
pub mod session;
pub mod transport;
pub mod watchlist;

pub use config::{ConfigError, ProxyConfig, SessionConfig};
pub use error::{Result, SessionError};
pub use message::{
    DataState, DomainType, HeaderCodec, Message, MessageCodec, MsgClass, MsgFlags, State,
    StatusCode, StreamState,
};
pub use proxy::{Credentials, ProxyAuthError, ProxyAuthenticator};
pub use reconnect::ReconnectPolicy;
pub use registry::{
    DictionaryRequest, DirectoryRequest, LoginRequest, RejectReason, RequestSlotRegistry, SlotId,
    SlotRequest,
};
pub use rtt::{RttMonitor, RttProbe};
pub use session::{
    ConsumerPhase, ConsumerSession, ItemReject, ProviderEvent, ProviderRegistries,
    ProviderSession, SessionEvent,
};
pub use transport::{
    ByteStream, Channel, ChannelCloser, ChannelError, ChannelId, ChannelOptions, ChannelState,
    Connector, TcpConnector,
};
pub use watchlist::{StreamWatchlist, WatchlistError};
