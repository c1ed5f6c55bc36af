// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session handlers on top of a channel.
//!
//! - [`ConsumerSession`]: connects, logs in, loads the directory and
//!   dictionaries, then opens items. Reconnects and replays the watchlist.
//! - [`ProviderSession`]: one per accepted channel. Validates requests
//!   against process-wide [`ProviderRegistries`].
//!
//! Administrative streams use fixed ids below the item stream floor.

pub mod consumer;
pub mod provider;

pub use consumer::{ConsumerPhase, ConsumerSession, SessionEvent};
pub use provider::{ItemReject, ProviderEvent, ProviderRegistries, ProviderSession};

/// Login stream opened by a consumer.
pub const LOGIN_STREAM_ID: i32 = 1;
/// Source directory stream opened by a consumer.
pub const DIRECTORY_STREAM_ID: i32 = 2;
/// First dictionary stream; one id per configured dictionary name.
pub const FIRST_DICTIONARY_STREAM_ID: i32 = 3;
