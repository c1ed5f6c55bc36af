// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Login requests.

use std::fmt;

use super::slot::{RejectReason, SlotRequest};
use crate::message::{DataState, DomainType, Message, MsgClass, State, StatusCode, StreamState};

/// A login request bound to a slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginRequest {
    pub stream_id: i32,
    pub user_name: String,
    /// The consumer answers RTT probes.
    pub rtt_supported: bool,
}

impl LoginRequest {
    pub fn new(stream_id: i32, user_name: impl Into<String>) -> Self {
        Self {
            stream_id,
            user_name: user_name.into(),
            rtt_supported: false,
        }
    }

    pub fn with_rtt(mut self, supported: bool) -> Self {
        self.rtt_supported = supported;
        self
    }

    pub fn from_message(msg: &Message) -> Result<Self, LoginReject> {
        if msg.class != MsgClass::Request || msg.domain != DomainType::Login {
            return Err(LoginReject::DecodeFailed(format!(
                "expected login request, got {} on {}",
                msg.class, msg.domain
            )));
        }
        Ok(Self {
            stream_id: msg.stream_id,
            user_name: msg.name.clone().unwrap_or_default(),
            rtt_supported: msg.flags.rtt,
        })
    }

    /// Request message for this login.
    pub fn to_message(&self) -> Message {
        let mut msg = Message::request(self.stream_id, DomainType::Login, self.user_name.clone());
        msg.flags.rtt = self.rtt_supported;
        msg
    }
}

/// Why a login request was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoginReject {
    MaxRequestsReached,
    NoUserName,
    NameMismatch,
    DecodeFailed(String),
}

impl fmt::Display for LoginReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginReject::MaxRequestsReached => write!(f, "max request count reached"),
            LoginReject::NoUserName => write!(f, "request does not contain user name"),
            LoginReject::NameMismatch => {
                write!(f, "user name differs from the open login on this stream")
            }
            LoginReject::DecodeFailed(reason) => write!(f, "decode failed: {}", reason),
        }
    }
}

impl RejectReason for LoginReject {
    fn status(&self, stream_id: i32) -> State {
        let code = match self {
            LoginReject::MaxRequestsReached => StatusCode::TooManyItems,
            _ => StatusCode::UsageError,
        };
        State::new(
            StreamState::ClosedRecover,
            DataState::Suspect,
            code,
            format!("Login request rejected for stream id {} - {}", stream_id, self),
        )
    }

    fn is_capacity(&self) -> bool {
        matches!(self, LoginReject::MaxRequestsReached)
    }
}

impl SlotRequest for LoginRequest {
    type Reject = LoginReject;
    const KIND: &'static str = "login";

    fn stream_id(&self) -> i32 {
        self.stream_id
    }

    fn identity(&self) -> &str {
        &self.user_name
    }

    fn validate(&self) -> Result<(), LoginReject> {
        if self.user_name.is_empty() {
            return Err(LoginReject::NoUserName);
        }
        Ok(())
    }

    fn capacity_reject() -> LoginReject {
        LoginReject::MaxRequestsReached
    }

    fn mismatch_reject() -> LoginReject {
        LoginReject::NameMismatch
    }
}
