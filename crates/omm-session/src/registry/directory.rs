// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Source directory requests.

use std::fmt;

use super::slot::{RejectReason, SlotRequest};
use crate::message::{
    filter, DataState, DomainType, Message, MsgClass, State, StatusCode, StreamState,
};

/// Identity of directory requests, which carry no name.
const DIRECTORY_IDENTITY: &str = "";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryRequest {
    pub stream_id: i32,
    pub filter: u32,
    pub streaming: bool,
}

impl DirectoryRequest {
    pub fn new(stream_id: i32, filter: u32) -> Self {
        Self {
            stream_id,
            filter,
            streaming: true,
        }
    }

    pub fn from_message(msg: &Message) -> Result<Self, DirectoryReject> {
        if msg.class != MsgClass::Request || msg.domain != DomainType::Source {
            return Err(DirectoryReject::DecodeFailed(format!(
                "expected directory request, got {} on {}",
                msg.class, msg.domain
            )));
        }
        Ok(Self {
            stream_id: msg.stream_id,
            filter: msg.filter,
            streaming: msg.flags.streaming,
        })
    }

    pub fn to_message(&self) -> Message {
        let mut msg = Message::request(self.stream_id, DomainType::Source, "")
            .with_filter(self.filter);
        msg.name = None;
        msg.flags.streaming = self.streaming;
        msg
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DirectoryReject {
    MaxRequestsReached,
    IncorrectFilterFlags,
    NameMismatch,
    DecodeFailed(String),
}

impl fmt::Display for DirectoryReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryReject::MaxRequestsReached => write!(f, "max request count reached"),
            DirectoryReject::IncorrectFilterFlags => write!(
                f,
                "request must minimally have RDM_DIRECTORY_SERVICE_INFO_FILTER, \
                 RDM_DIRECTORY_SERVICE_STATE_FILTER, and RDM_DIRECTORY_SERVICE_GROUP_FILTER \
                 filter flags"
            ),
            DirectoryReject::NameMismatch => write!(f, "stream already in use with a different key"),
            DirectoryReject::DecodeFailed(reason) => write!(f, "decode failed: {}", reason),
        }
    }
}

impl RejectReason for DirectoryReject {
    fn status(&self, stream_id: i32) -> State {
        let code = match self {
            DirectoryReject::MaxRequestsReached => StatusCode::TooManyItems,
            _ => StatusCode::UsageError,
        };
        State::new(
            StreamState::ClosedRecover,
            DataState::Suspect,
            code,
            format!(
                "Source directory request rejected for stream id {} - {}",
                stream_id, self
            ),
        )
    }

    fn is_capacity(&self) -> bool {
        matches!(self, DirectoryReject::MaxRequestsReached)
    }
}

impl SlotRequest for DirectoryRequest {
    type Reject = DirectoryReject;
    const KIND: &'static str = "directory";

    fn stream_id(&self) -> i32 {
        self.stream_id
    }

    fn identity(&self) -> &str {
        DIRECTORY_IDENTITY
    }

    fn validate(&self) -> Result<(), DirectoryReject> {
        if self.filter & filter::DIRECTORY_MINIMUM != filter::DIRECTORY_MINIMUM {
            return Err(DirectoryReject::IncorrectFilterFlags);
        }
        Ok(())
    }

    fn capacity_reject() -> DirectoryReject {
        DirectoryReject::MaxRequestsReached
    }

    fn mismatch_reject() -> DirectoryReject {
        DirectoryReject::NameMismatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RequestSlotRegistry;
    use crate::transport::ChannelId;

    #[test]
    fn test_filter_flags_required() {
        let registry = RequestSlotRegistry::per_client(1, 1);
        let ch = ChannelId::new(1, 0);

        let err = registry
            .acquire(ch, DirectoryRequest::new(2, filter::INFO | filter::STATE))
            .unwrap_err();
        assert_eq!(err, DirectoryReject::IncorrectFilterFlags);
        assert!(err
            .status(2)
            .text
            .starts_with("Source directory request rejected for stream id 2 - request must"));

        let ok = registry
            .acquire(ch, DirectoryRequest::new(2, filter::DIRECTORY_MINIMUM | filter::LOAD))
            .unwrap();
        assert!(!ok.reissue);
    }

    #[test]
    fn test_message_round_trip() {
        let req = DirectoryRequest::new(2, filter::DIRECTORY_MINIMUM);
        let msg = req.to_message();
        assert_eq!(msg.domain, DomainType::Source);
        assert_eq!(msg.name, None);
        assert_eq!(DirectoryRequest::from_message(&msg).unwrap(), req);
    }

    #[test]
    fn test_reissue_with_new_filter() {
        let registry = RequestSlotRegistry::per_client(1, 1);
        let ch = ChannelId::new(1, 0);
        let first = registry
            .acquire(ch, DirectoryRequest::new(2, filter::DIRECTORY_MINIMUM))
            .unwrap();
        let again = registry
            .acquire(ch, DirectoryRequest::new(2, filter::DIRECTORY_MINIMUM | filter::DATA))
            .unwrap();
        assert!(again.reissue);
        assert_eq!(
            registry.get(first.slot).map(|r| r.filter),
            Some(filter::DIRECTORY_MINIMUM | filter::DATA)
        );
    }
}
