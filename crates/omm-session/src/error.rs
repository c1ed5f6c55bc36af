// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-level error type.

use thiserror::Error;

use crate::config::ConfigError;
use crate::message::CodecError;
use crate::transport::ChannelError;
use crate::watchlist::WatchlistError;

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("watchlist error: {0}")]
    Watchlist(#[from] WatchlistError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("session is not connected")]
    NotConnected,
}

impl SessionError {
    /// The underlying channel is gone.
    pub fn is_disconnect(&self) -> bool {
        match self {
            SessionError::Channel(e) => e.is_fatal(),
            SessionError::NotConnected => true,
            _ => false,
        }
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
