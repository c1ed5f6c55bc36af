// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream-id keyed item watchlist.
//!
//! Tracks every item stream a session has open so the requests can be
//! replayed with the same stream ids after a reconnect. Item ids are
//! assigned from a configurable floor; ids below it belong to the
//! administrative streams.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use thiserror::Error;

use crate::message::{DomainType, Message, MsgFlags};

/// Default first item stream id.
pub const DEFAULT_START_STREAM_ID: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchlistError {
    #[error("stream id {0} already in use")]
    DuplicateStreamId(i32),

    #[error("{domain} item '{name}' already open on stream {stream_id}")]
    DuplicateItem {
        domain: DomainType,
        name: String,
        stream_id: i32,
    },

    #[error("watchlist full ({0} items)")]
    Full(usize),

    #[error("stream id {0} is below the item stream floor")]
    InvalidStreamId(i32),

    #[error("batch request without item names")]
    EmptyBatch,
}

/// One open item stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchlistEntry<S> {
    pub stream_id: i32,
    pub domain: DomainType,
    pub name: String,
    pub flags: MsgFlags,
    /// Stream id of the batch request that opened this item.
    pub batch_id: Option<i32>,
    pub state: S,
}

/// Request to resend after a reconnect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayRequest {
    Single {
        stream_id: i32,
        domain: DomainType,
        name: String,
        flags: MsgFlags,
    },
    /// Items occupy `stream_id + 1 ..= stream_id + names.len()`.
    Batch {
        stream_id: i32,
        domain: DomainType,
        names: Vec<String>,
        flags: MsgFlags,
    },
}

impl ReplayRequest {
    pub fn to_message(&self) -> Message {
        match self {
            ReplayRequest::Single {
                stream_id,
                domain,
                name,
                flags,
            } => Message::request(*stream_id, *domain, name.clone()).with_flags(*flags),
            ReplayRequest::Batch {
                stream_id,
                domain,
                names,
                flags,
            } => Message::batch_request(*stream_id, *domain, names.clone()).with_flags(MsgFlags {
                batch: true,
                ..*flags
            }),
        }
    }

    /// Item stream ids covered by this request.
    pub fn stream_ids(&self) -> Vec<i32> {
        match self {
            ReplayRequest::Single { stream_id, .. } => vec![*stream_id],
            ReplayRequest::Batch {
                stream_id, names, ..
            } => (1..=names.len() as i32).map(|i| stream_id + i).collect(),
        }
    }
}

/// Item requested before the session could send it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingItem {
    pub domain: DomainType,
    pub names: Vec<String>,
    pub flags: MsgFlags,
}

/// Finite, restartable walk over the stream ids of one domain.
///
/// Works on a snapshot taken at creation, so concurrent changes never
/// make it loop or skip.
#[derive(Clone, Debug)]
pub struct DomainCursor {
    ids: Vec<i32>,
    pos: usize,
}

impl DomainCursor {
    pub fn restart(&mut self) {
        self.pos = 0;
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Iterator for DomainCursor {
    type Item = i32;

    fn next(&mut self) -> Option<i32> {
        let id = self.ids.get(self.pos).copied()?;
        self.pos += 1;
        Some(id)
    }
}

#[derive(Debug)]
struct Inner<S> {
    entries: BTreeMap<i32, WatchlistEntry<S>>,
    next_id: i32,
    pending: VecDeque<PendingItem>,
}

impl<S> Inner<S> {
    fn id_in_use(&self, id: i32) -> bool {
        self.entries.contains_key(&id) || self.entries.values().any(|e| e.batch_id == Some(id))
    }

    fn find(&self, domain: DomainType, name: &str) -> Option<i32> {
        self.entries
            .values()
            .find(|e| !e.flags.private_stream && e.domain == domain && e.name == name)
            .map(|e| e.stream_id)
    }

    fn check_duplicate(
        &self,
        domain: DomainType,
        name: &str,
        flags: MsgFlags,
    ) -> Result<(), WatchlistError> {
        if flags.private_stream {
            return Ok(());
        }
        match self.find(domain, name) {
            Some(stream_id) => Err(WatchlistError::DuplicateItem {
                domain,
                name: name.to_string(),
                stream_id,
            }),
            None => Ok(()),
        }
    }
}

/// Item streams of one session, keyed by stream id.
#[derive(Debug)]
pub struct StreamWatchlist<S = ()> {
    inner: Mutex<Inner<S>>,
    start_stream_id: i32,
    max_items: usize,
}

impl<S: Default + Clone> StreamWatchlist<S> {
    pub fn new(start_stream_id: i32) -> Self {
        let start_stream_id = start_stream_id.max(1);
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                next_id: start_stream_id,
                pending: VecDeque::new(),
            }),
            start_stream_id,
            max_items: 0,
        }
    }

    /// Limit the number of entries; 0 means unlimited.
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    pub fn start_stream_id(&self) -> i32 {
        self.start_stream_id
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    fn check_room(&self, inner: &Inner<S>, extra: usize) -> Result<(), WatchlistError> {
        if self.max_items > 0 && inner.entries.len() + extra > self.max_items {
            return Err(WatchlistError::Full(self.max_items));
        }
        Ok(())
    }

    /// Next free id at or above the floor.
    fn allocate(&self, inner: &mut Inner<S>) -> Result<i32, WatchlistError> {
        let span = (i32::MAX - self.start_stream_id) as i64 + 1;
        for _ in 0..span.min(inner.entries.len() as i64 * 2 + 2) {
            let id = inner.next_id;
            inner.next_id = if id == i32::MAX {
                self.start_stream_id
            } else {
                id + 1
            };
            if !inner.id_in_use(id) {
                return Ok(id);
            }
        }
        Err(WatchlistError::Full(inner.entries.len()))
    }

    /// Open an item on a newly assigned stream id.
    pub fn add(
        &self,
        domain: DomainType,
        name: impl Into<String>,
        flags: MsgFlags,
    ) -> Result<i32, WatchlistError> {
        let name = name.into();
        let mut inner = self.inner.lock();
        self.check_room(&inner, 1)?;
        inner.check_duplicate(domain, &name, flags)?;

        let stream_id = self.allocate(&mut inner)?;
        log::debug!("[WATCHLIST] {} '{}' on stream {}", domain, name, stream_id);
        inner.entries.insert(
            stream_id,
            WatchlistEntry {
                stream_id,
                domain,
                name,
                flags,
                batch_id: None,
                state: S::default(),
            },
        );
        Ok(stream_id)
    }

    /// Open an item on a stream id chosen by the peer.
    pub fn add_with_id(
        &self,
        stream_id: i32,
        domain: DomainType,
        name: impl Into<String>,
        flags: MsgFlags,
    ) -> Result<(), WatchlistError> {
        if stream_id < self.start_stream_id {
            return Err(WatchlistError::InvalidStreamId(stream_id));
        }
        let name = name.into();
        let mut inner = self.inner.lock();
        if inner.id_in_use(stream_id) {
            return Err(WatchlistError::DuplicateStreamId(stream_id));
        }
        self.check_room(&inner, 1)?;
        inner.check_duplicate(domain, &name, flags)?;

        inner.entries.insert(
            stream_id,
            WatchlistEntry {
                stream_id,
                domain,
                name,
                flags,
                batch_id: None,
                state: S::default(),
            },
        );
        Ok(())
    }

    /// Open several items with one batch request.
    ///
    /// Returns the batch stream id and the item ids, which follow it
    /// consecutively. Nothing is added if any item is refused.
    pub fn add_batch(
        &self,
        domain: DomainType,
        names: &[String],
        flags: MsgFlags,
    ) -> Result<(i32, Vec<i32>), WatchlistError> {
        if names.is_empty() {
            return Err(WatchlistError::EmptyBatch);
        }
        let mut inner = self.inner.lock();
        self.check_room(&inner, names.len())?;
        for (i, name) in names.iter().enumerate() {
            inner.check_duplicate(domain, name, flags)?;
            if !flags.private_stream && names[..i].contains(name) {
                return Err(WatchlistError::DuplicateItem {
                    domain,
                    name: name.clone(),
                    stream_id: -1,
                });
            }
        }

        // batch id and the item ids after it must all be free
        let count = names.len() as i32;
        let mut batch_id = None;
        for _ in 0..inner.entries.len() * 2 + 2 {
            let candidate = self.allocate(&mut inner)?;
            let fits = candidate.checked_add(count).is_some()
                && (1..=count).all(|i| !inner.id_in_use(candidate + i));
            if fits {
                batch_id = Some(candidate);
                break;
            }
        }
        let batch_id = batch_id.ok_or(WatchlistError::Full(inner.entries.len()))?;
        inner.next_id = batch_id.saturating_add(count).saturating_add(1);

        let mut ids = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let stream_id = batch_id + 1 + i as i32;
            inner.entries.insert(
                stream_id,
                WatchlistEntry {
                    stream_id,
                    domain,
                    name: name.clone(),
                    flags,
                    batch_id: Some(batch_id),
                    state: S::default(),
                },
            );
            ids.push(stream_id);
        }
        log::debug!(
            "[WATCHLIST] batch {} opened {} {} item(s)",
            batch_id,
            ids.len(),
            domain
        );
        Ok((batch_id, ids))
    }

    pub fn get(&self, stream_id: i32) -> Option<WatchlistEntry<S>> {
        self.inner.lock().entries.get(&stream_id).cloned()
    }

    pub fn contains(&self, stream_id: i32) -> bool {
        self.inner.lock().entries.contains_key(&stream_id)
    }

    /// Stream id of the open non-private stream for an item.
    pub fn find(&self, domain: DomainType, name: &str) -> Option<i32> {
        self.inner.lock().find(domain, name)
    }

    /// Mutate the state of one entry. Returns false if it is not open.
    pub fn update_state(&self, stream_id: i32, f: impl FnOnce(&mut S)) -> bool {
        match self.inner.lock().entries.get_mut(&stream_id) {
            Some(entry) => {
                f(&mut entry.state);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, stream_id: i32) -> Option<WatchlistEntry<S>> {
        let removed = self.inner.lock().entries.remove(&stream_id);
        if let Some(entry) = &removed {
            log::debug!("[WATCHLIST] removed '{}' (stream {})", entry.name, stream_id);
        }
        removed
    }

    /// Remove several entries atomically; returns how many existed.
    pub fn remove_all(&self, stream_ids: &[i32]) -> usize {
        let mut inner = self.inner.lock();
        stream_ids
            .iter()
            .filter(|&&id| inner.entries.remove(&id).is_some())
            .count()
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn stream_ids(&self) -> Vec<i32> {
        self.inner.lock().entries.keys().copied().collect()
    }

    pub fn iter_domain(&self, domain: DomainType) -> DomainCursor {
        let ids = self
            .inner
            .lock()
            .entries
            .values()
            .filter(|e| e.domain == domain)
            .map(|e| e.stream_id)
            .collect();
        DomainCursor { ids, pos: 0 }
    }

    /// Connection lost. Keeps entries when `recover` is set, drops them
    /// otherwise. Returns the number of entries kept.
    pub fn on_disconnect(&self, recover: bool) -> usize {
        let mut inner = self.inner.lock();
        if recover {
            for entry in inner.entries.values_mut() {
                entry.state = S::default();
            }
        } else {
            inner.entries.clear();
            inner.next_id = self.start_stream_id;
        }
        log::info!(
            "[WATCHLIST] disconnect: {} item(s) kept for recovery",
            inner.entries.len()
        );
        inner.entries.len()
    }

    /// Requests that reopen every entry on its original stream id.
    ///
    /// A batch is replayed as a batch only while its items still occupy
    /// consecutive ids after the batch id; otherwise its items go out
    /// singly.
    pub fn replay(&self) -> Vec<ReplayRequest> {
        let inner = self.inner.lock();
        let mut requests = Vec::new();
        let mut batches: BTreeMap<i32, Vec<&WatchlistEntry<S>>> = BTreeMap::new();

        for entry in inner.entries.values() {
            match entry.batch_id {
                Some(batch_id) => batches.entry(batch_id).or_default().push(entry),
                None => requests.push(single(entry)),
            }
        }

        for (batch_id, items) in batches {
            let contiguous = items
                .iter()
                .enumerate()
                .all(|(i, e)| e.stream_id == batch_id + 1 + i as i32);
            let same_flags = items.windows(2).all(|w| w[0].flags == w[1].flags);

            if contiguous && same_flags {
                requests.push(ReplayRequest::Batch {
                    stream_id: batch_id,
                    domain: items[0].domain,
                    names: items.iter().map(|e| e.name.clone()).collect(),
                    flags: items[0].flags,
                });
            } else {
                requests.extend(items.into_iter().map(single));
            }
        }

        requests.sort_by_key(|r| match r {
            ReplayRequest::Single { stream_id, .. } | ReplayRequest::Batch { stream_id, .. } => {
                *stream_id
            }
        });
        requests
    }

    /// Hold an item until the session can send requests.
    pub fn queue_pending(&self, item: PendingItem) {
        self.inner.lock().pending.push_back(item);
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Drain held items in the order they were queued.
    pub fn take_pending(&self) -> Vec<PendingItem> {
        self.inner.lock().pending.drain(..).collect()
    }
}

fn single<S>(entry: &WatchlistEntry<S>) -> ReplayRequest {
    ReplayRequest::Single {
        stream_id: entry.stream_id,
        domain: entry.domain,
        name: entry.name.clone(),
        flags: entry.flags,
    }
}
