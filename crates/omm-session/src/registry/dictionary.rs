// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dictionary requests.

use std::fmt;
use std::sync::Arc;

use super::slot::{RejectReason, SlotRequest};
use crate::message::{DataState, DomainType, Message, MsgClass, State, StatusCode, StreamState};

/// Field dictionary name.
pub const FIELD_DICTIONARY_NAME: &str = "RWFFld";
/// Enumerated type dictionary name.
pub const ENUM_DICTIONARY_NAME: &str = "RWFEnum";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DictionaryRequest {
    pub stream_id: i32,
    pub name: String,
    /// Names this provider serves; checked by `validate`.
    known: Arc<[String]>,
}

impl DictionaryRequest {
    pub fn new(stream_id: i32, name: impl Into<String>, known: Arc<[String]>) -> Self {
        Self {
            stream_id,
            name: name.into(),
            known,
        }
    }

    pub fn from_message(msg: &Message, known: Arc<[String]>) -> Result<Self, DictionaryReject> {
        if msg.class != MsgClass::Request || msg.domain != DomainType::Dictionary {
            return Err(DictionaryReject::DecodeFailed(format!(
                "expected dictionary request, got {} on {}",
                msg.class, msg.domain
            )));
        }
        Ok(Self::new(
            msg.stream_id,
            msg.name.clone().unwrap_or_default(),
            known,
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DictionaryReject {
    UnknownDictionaryName,
    MaxRequestsReached,
    NameMismatch,
    DecodeFailed(String),
}

impl fmt::Display for DictionaryReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DictionaryReject::UnknownDictionaryName => write!(f, "dictionary name unknown"),
            DictionaryReject::MaxRequestsReached => write!(f, "max request count reached"),
            DictionaryReject::NameMismatch => {
                write!(f, "stream already in use with a different dictionary name")
            }
            DictionaryReject::DecodeFailed(reason) => write!(f, "decode failed: {}", reason),
        }
    }
}

impl RejectReason for DictionaryReject {
    fn status(&self, stream_id: i32) -> State {
        let (stream_state, code) = match self {
            DictionaryReject::UnknownDictionaryName => (StreamState::Closed, StatusCode::NotFound),
            DictionaryReject::MaxRequestsReached => {
                (StreamState::ClosedRecover, StatusCode::TooManyItems)
            }
            _ => (StreamState::Closed, StatusCode::UsageError),
        };
        State::new(
            stream_state,
            DataState::Suspect,
            code,
            format!("Dictionary request rejected for stream id {} - {}", stream_id, self),
        )
    }

    fn is_capacity(&self) -> bool {
        matches!(self, DictionaryReject::MaxRequestsReached)
    }
}

impl SlotRequest for DictionaryRequest {
    type Reject = DictionaryReject;
    const KIND: &'static str = "dictionary";

    fn stream_id(&self) -> i32 {
        self.stream_id
    }

    fn identity(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<(), DictionaryReject> {
        if !self.known.iter().any(|n| *n == self.name) {
            return Err(DictionaryReject::UnknownDictionaryName);
        }
        Ok(())
    }

    fn capacity_reject() -> DictionaryReject {
        DictionaryReject::MaxRequestsReached
    }

    fn mismatch_reject() -> DictionaryReject {
        DictionaryReject::NameMismatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RequestSlotRegistry;
    use crate::transport::ChannelId;

    fn known() -> Arc<[String]> {
        vec![FIELD_DICTIONARY_NAME.to_string(), ENUM_DICTIONARY_NAME.to_string()].into()
    }

    #[test]
    fn test_unknown_name() {
        let registry = RequestSlotRegistry::per_client(1, 2);
        let err = registry
            .acquire(ChannelId::new(1, 0), DictionaryRequest::new(3, "Other", known()))
            .unwrap_err();
        assert_eq!(err, DictionaryReject::UnknownDictionaryName);

        let state = err.status(3);
        assert_eq!(state.stream_state, StreamState::Closed);
        assert_eq!(state.code, StatusCode::NotFound);
        assert_eq!(
            state.text,
            "Dictionary request rejected for stream id 3 - dictionary name unknown"
        );
    }

    #[test]
    fn test_field_and_enum_per_client() {
        let registry = RequestSlotRegistry::per_client(1, 2);
        let ch = ChannelId::new(1, 0);
        registry
            .acquire(ch, DictionaryRequest::new(3, FIELD_DICTIONARY_NAME, known()))
            .unwrap();
        registry
            .acquire(ch, DictionaryRequest::new(4, ENUM_DICTIONARY_NAME, known()))
            .unwrap();

        let err = registry
            .acquire(ch, DictionaryRequest::new(5, FIELD_DICTIONARY_NAME, known()))
            .unwrap_err();
        assert!(err.is_capacity());
    }

    #[test]
    fn test_name_change_on_stream() {
        let registry = RequestSlotRegistry::per_client(1, 2);
        let ch = ChannelId::new(1, 0);
        registry
            .acquire(ch, DictionaryRequest::new(3, FIELD_DICTIONARY_NAME, known()))
            .unwrap();
        assert_eq!(
            registry.acquire(ch, DictionaryRequest::new(3, ENUM_DICTIONARY_NAME, known())),
            Err(DictionaryReject::NameMismatch)
        );
    }

    #[test]
    fn test_from_message() {
        let msg = Message::request(3, DomainType::Dictionary, ENUM_DICTIONARY_NAME);
        let req = DictionaryRequest::from_message(&msg, known()).unwrap();
        assert_eq!(req.name, ENUM_DICTIONARY_NAME);
        assert_eq!(req.stream_id, 3);
    }
}
