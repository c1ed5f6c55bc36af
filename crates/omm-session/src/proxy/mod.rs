// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP CONNECT tunneling with proxy authentication.
//!
//! The channel sends a CONNECT request, feeds every complete response to
//! a [`ProxyAuthenticator`] and repeats the request with the returned
//! authorization header until the proxy answers `200`.

pub mod auth;
pub mod http;

pub use auth::{
    AuthScheme, Credentials, ProxyAuthError, ProxyAuthResponse, ProxyAuthenticator, DOMAIN,
    PASSWORD, USERNAME,
};

/// Responses without a status line tolerated before the tunnel fails.
pub const MAX_IGNORED_RESPONSES: u32 = 10_000;
