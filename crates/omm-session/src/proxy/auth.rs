// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Proxy authentication schemes and the challenge/response negotiator.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

use super::http::HttpResponse;

/// Credential key for the user name.
pub const USERNAME: &str = "username";
/// Credential key for the password.
pub const PASSWORD: &str = "password";
/// Credential key for the (NT) domain.
pub const DOMAIN: &str = "domain";

/// Proxy authentication failures.
///
/// All of these end the current connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyAuthError {
    #[error("proxy response has no HTTP status line")]
    MissingStatusLine,

    #[error("unexpected proxy status code {0}")]
    UnexpectedStatus(u16),

    #[error("proxy returned {0} without an authentication challenge")]
    NoChallenge(u16),

    #[error("no supported authentication scheme in challenge: {0:?}")]
    UnsupportedScheme(Vec<String>),

    #[error("missing required credential '{0}' for {1} authentication")]
    MissingCredential(&'static str, &'static str),

    #[error("gave up after {0} responses without a status line")]
    TooManyIgnoredResponses(u32),
}

// ============================================================================
// Credentials
// ============================================================================

/// Key/value credentials handed to the authentication scheme.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    values: BTreeMap<String, String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Username/password pair.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new()
            .with(USERNAME, username)
            .with(PASSWORD, password)
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Non-empty value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

// Never print secrets.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

// ============================================================================
// Schemes
// ============================================================================

/// Supported authentication schemes.
///
/// Adding a scheme means a new variant plus an entry in
/// [`REGISTERED_SCHEMES`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthScheme {
    Basic,
}

/// Schemes the negotiator may pick, matched by challenge name.
pub const REGISTERED_SCHEMES: &[AuthScheme] = &[AuthScheme::Basic];

impl AuthScheme {
    /// Scheme name as it appears in challenge headers.
    pub fn name(self) -> &'static str {
        match self {
            AuthScheme::Basic => "Basic",
        }
    }

    /// Credential keys that must be present before a header is built.
    pub fn required_credentials(self) -> &'static [&'static str] {
        match self {
            AuthScheme::Basic => &[USERNAME, PASSWORD],
        }
    }

    /// Look up the scheme named by a challenge header value
    /// (`Basic realm="x"` selects Basic).
    pub fn from_challenge(challenge: &str) -> Option<Self> {
        let name = challenge.split_whitespace().next()?;
        REGISTERED_SCHEMES
            .iter()
            .copied()
            .find(|s| s.name().eq_ignore_ascii_case(name))
    }

    pub fn validate(self, credentials: &Credentials) -> Result<(), ProxyAuthError> {
        match self
            .required_credentials()
            .iter()
            .copied()
            .find(|key| credentials.get(key).is_none())
        {
            Some(key) => Err(ProxyAuthError::MissingCredential(key, self.name())),
            None => Ok(()),
        }
    }

    /// Authorization value (without header name) for these credentials.
    pub fn authorization(self, credentials: &Credentials) -> Result<String, ProxyAuthError> {
        self.validate(credentials)?;
        match self {
            AuthScheme::Basic => {
                let user = credentials.get(USERNAME).unwrap_or_default();
                let pass = credentials.get(PASSWORD).unwrap_or_default();
                Ok(format!(
                    "Basic {}",
                    STANDARD.encode(format!("{}:{}", user, pass))
                ))
            }
        }
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Authenticator
// ============================================================================

/// What the channel should do after a proxy response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyAuthResponse {
    pub status: u16,
    /// The tunnel is open.
    pub authenticated: bool,
    /// Header line to send with the next CONNECT (no CRLF).
    pub authorization: Option<String>,
    /// The proxy will close this connection; reconnect before retrying.
    pub connection_close: bool,
}

/// Negotiates a proxy tunnel from challenge responses.
#[derive(Debug)]
pub struct ProxyAuthenticator {
    credentials: Credentials,
    scheme: Option<AuthScheme>,
    authenticated: bool,
    challenges: u32,
}

impl ProxyAuthenticator {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            scheme: None,
            authenticated: false,
            challenges: 0,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Scheme picked from the last challenge.
    pub fn scheme(&self) -> Option<AuthScheme> {
        self.scheme
    }

    /// Number of challenges answered so far.
    pub fn challenges(&self) -> u32 {
        self.challenges
    }

    /// Process one complete proxy response (status line plus headers).
    pub fn process_response(&mut self, text: &str) -> Result<ProxyAuthResponse, ProxyAuthError> {
        let response = HttpResponse::parse(text);
        let status = response.status.ok_or(ProxyAuthError::MissingStatusLine)?;
        let connection_close = response.connection_close();

        match status {
            200 => {
                self.authenticated = true;
                log::debug!("[PROXY] tunnel established");
                Ok(ProxyAuthResponse {
                    status,
                    authenticated: true,
                    authorization: None,
                    connection_close,
                })
            }
            401 | 407 => {
                if self.authenticated {
                    log::info!("[PROXY] {} after success, re-authenticating", status);
                    self.authenticated = false;
                    self.scheme = None;
                }

                let (challenge_header, auth_header) = if status == 407 {
                    ("Proxy-Authenticate", "Proxy-Authorization")
                } else {
                    ("WWW-Authenticate", "Authorization")
                };

                let offered: Vec<String> = response
                    .header_values(challenge_header)
                    .map(str::to_string)
                    .collect();
                if offered.is_empty() {
                    return Err(ProxyAuthError::NoChallenge(status));
                }

                let scheme = offered
                    .iter()
                    .find_map(|c| AuthScheme::from_challenge(c))
                    .ok_or_else(|| ProxyAuthError::UnsupportedScheme(offered.clone()))?;

                let value = scheme.authorization(&self.credentials)?;
                self.scheme = Some(scheme);
                self.challenges += 1;
                log::debug!(
                    "[PROXY] answering {} challenge with {} (close={})",
                    status,
                    scheme,
                    connection_close
                );

                Ok(ProxyAuthResponse {
                    status,
                    authenticated: false,
                    authorization: Some(format!("{}: {}", auth_header, value)),
                    connection_close,
                })
            }
            other => Err(ProxyAuthError::UnexpectedStatus(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC_407: &str = "HTTP/1.1 407 Proxy Authentication Required\r\n\
                             Proxy-Authenticate: Basic realm=\"proxy\"\r\n\r\n";

    #[test]
    fn test_407_basic_produces_one_header() {
        let mut auth = ProxyAuthenticator::new(Credentials::basic("user", "pass"));
        let resp = auth.process_response(BASIC_407).unwrap();

        assert!(!resp.authenticated);
        assert_eq!(
            resp.authorization.as_deref(),
            Some("Proxy-Authorization: Basic dXNlcjpwYXNz")
        );
        assert_eq!(auth.scheme(), Some(AuthScheme::Basic));
        assert_eq!(auth.challenges(), 1);
    }

    #[test]
    fn test_401_uses_www_headers() {
        let mut auth = ProxyAuthenticator::new(Credentials::basic("a", "b"));
        let resp = auth
            .process_response("HTTP/1.0 401 Unauthorized\r\nWWW-Authenticate: basic\r\n\r\n")
            .unwrap();
        assert!(resp
            .authorization
            .unwrap()
            .starts_with("Authorization: Basic "));
    }

    #[test]
    fn test_missing_password_fails_before_header() {
        let mut auth = ProxyAuthenticator::new(Credentials::new().with(USERNAME, "user"));
        let err = auth.process_response(BASIC_407).unwrap_err();

        assert_eq!(err, ProxyAuthError::MissingCredential(PASSWORD, "Basic"));
        assert_eq!(auth.scheme(), None);
        assert_eq!(auth.challenges(), 0);
    }

    #[test]
    fn test_empty_credential_counts_as_missing() {
        let auth = AuthScheme::Basic.validate(&Credentials::basic("", "pass"));
        assert_eq!(
            auth,
            Err(ProxyAuthError::MissingCredential(USERNAME, "Basic"))
        );
    }

    #[test]
    fn test_second_407_forces_reauthentication() {
        let mut auth = ProxyAuthenticator::new(Credentials::basic("user", "pass"));
        auth.process_response(BASIC_407).unwrap();
        auth.process_response("HTTP/1.1 200 Connection established\r\n\r\n")
            .unwrap();
        assert!(auth.is_authenticated());

        let resp = auth.process_response(BASIC_407).unwrap();
        assert!(!auth.is_authenticated());
        assert!(resp.authorization.is_some());
        assert_eq!(auth.challenges(), 2);
    }

    #[test]
    fn test_unsupported_scheme() {
        let mut auth = ProxyAuthenticator::new(Credentials::basic("u", "p"));
        let err = auth
            .process_response(
                "HTTP/1.1 407 x\r\nProxy-Authenticate: NTLM\r\nProxy-Authenticate: Negotiate\r\n\r\n",
            )
            .unwrap_err();
        assert_eq!(
            err,
            ProxyAuthError::UnsupportedScheme(vec!["NTLM".into(), "Negotiate".into()])
        );
    }

    #[test]
    fn test_first_supported_scheme_wins() {
        let mut auth = ProxyAuthenticator::new(Credentials::basic("u", "p"));
        let resp = auth
            .process_response(
                "HTTP/1.1 407 x\r\nProxy-Authenticate: NTLM\r\nProxy-Authenticate: Basic\r\n\r\n",
            )
            .unwrap();
        assert!(resp.authorization.is_some());
    }

    #[test]
    fn test_other_status_is_failure() {
        let mut auth = ProxyAuthenticator::new(Credentials::basic("u", "p"));
        assert_eq!(
            auth.process_response("HTTP/1.1 403 Forbidden\r\n\r\n"),
            Err(ProxyAuthError::UnexpectedStatus(403))
        );
        assert_eq!(
            auth.process_response("\r\n\r\n"),
            Err(ProxyAuthError::MissingStatusLine)
        );
    }

    #[test]
    fn test_challenge_without_scheme_header() {
        let mut auth = ProxyAuthenticator::new(Credentials::basic("u", "p"));
        assert_eq!(
            auth.process_response("HTTP/1.1 407 x\r\n\r\n"),
            Err(ProxyAuthError::NoChallenge(407))
        );
    }

    #[test]
    fn test_close_hint_reported() {
        let mut auth = ProxyAuthenticator::new(Credentials::basic("u", "p"));
        let resp = auth
            .process_response(
                "HTTP/1.1 407 x\r\nProxy-Authenticate: Basic\r\nProxy-Connection: close\r\n\r\n",
            )
            .unwrap();
        assert!(resp.connection_close);
    }

    #[test]
    fn test_credentials_debug_hides_values() {
        let creds = Credentials::basic("user", "secret");
        let shown = format!("{:?}", creds);
        assert!(shown.contains("password"));
        assert!(!shown.contains("secret"));
    }
}
