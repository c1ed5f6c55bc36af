// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request slot registries for administrative streams.
//!
//! One generic pool ([`RequestSlotRegistry`]) serves every request kind;
//! each kind supplies its own validation and reject reasons.

pub mod dictionary;
pub mod directory;
pub mod login;
pub mod slot;

pub use dictionary::{
    DictionaryReject, DictionaryRequest, ENUM_DICTIONARY_NAME, FIELD_DICTIONARY_NAME,
};
pub use directory::{DirectoryReject, DirectoryRequest};
pub use login::{LoginReject, LoginRequest};
pub use slot::{Acquired, RejectReason, RequestSlotRegistry, SlotId, SlotRequest};
