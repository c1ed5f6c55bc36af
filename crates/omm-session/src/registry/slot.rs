// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-capacity request slot pool.
//!
//! Binds administrative requests to `(channel, stream id)` pairs. The pool
//! never grows; a full pool rejects with the kind's capacity reason.
//!
//! Slots refer to their channel by [`ChannelId`] only, so dropping a
//! channel never touches the pool. Cleanup goes through
//! [`RequestSlotRegistry::release_all`].

use std::fmt;

use parking_lot::Mutex;

use crate::message::State;
use crate::transport::ChannelId;

/// A reason a request was not bound to a slot.
pub trait RejectReason: fmt::Debug + fmt::Display + Clone + Send {
    /// Status sent back on the rejected stream.
    fn status(&self, stream_id: i32) -> State;

    /// Capacity exhaustion rather than a malformed request.
    fn is_capacity(&self) -> bool;
}

/// A request kind tracked by a [`RequestSlotRegistry`].
pub trait SlotRequest: fmt::Debug + Clone + Send {
    type Reject: RejectReason;

    /// Short name used in log lines.
    const KIND: &'static str;

    fn stream_id(&self) -> i32;

    /// Field that must stay stable across reissues on one stream.
    fn identity(&self) -> &str;

    /// Kind-specific checks run before any slot is touched.
    fn validate(&self) -> Result<(), Self::Reject>;

    fn capacity_reject() -> Self::Reject;

    fn mismatch_reject() -> Self::Reject;
}

/// Handle to a bound slot. Stale after the slot is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub index: usize,
    pub epoch: u32,
}

/// Successful acquire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Acquired {
    pub slot: SlotId,
    /// The stream was already bound with the same identity.
    pub reissue: bool,
}

#[derive(Debug)]
struct Binding<T> {
    channel: ChannelId,
    request: T,
}

#[derive(Debug)]
struct Slot<T> {
    epoch: u32,
    binding: Option<Binding<T>>,
}

impl<T> Slot<T> {
    fn bound_to(&self, channel: ChannelId, stream_id: i32) -> bool
    where
        T: SlotRequest,
    {
        self.binding
            .as_ref()
            .is_some_and(|b| b.channel == channel && b.request.stream_id() == stream_id)
    }

    fn owned_by(&self, channel: ChannelId) -> bool {
        self.binding.as_ref().is_some_and(|b| b.channel == channel)
    }

    fn clear(&mut self) -> Option<T> {
        let binding = self.binding.take()?;
        self.epoch = self.epoch.wrapping_add(1);
        Some(binding.request)
    }
}

/// Pool of request slots shared by every channel of a process.
#[derive(Debug)]
pub struct RequestSlotRegistry<T: SlotRequest> {
    slots: Mutex<Vec<Slot<T>>>,
    per_channel: Option<usize>,
}

impl<T: SlotRequest> RequestSlotRegistry<T> {
    /// Pool of `capacity` slots with no per-channel limit.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                epoch: 0,
                binding: None,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            per_channel: None,
        }
    }

    /// `max_clients * per_client` slots, at most `per_client` per channel.
    pub fn per_client(max_clients: usize, per_client: usize) -> Self {
        let mut registry = Self::new(max_clients * per_client);
        registry.per_channel = Some(per_client);
        registry
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn in_use(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| s.binding.is_some())
            .count()
    }

    pub fn in_use_by(&self, channel: ChannelId) -> usize {
        self.slots.lock().iter().filter(|s| s.owned_by(channel)).count()
    }

    /// Bind `request` to a slot for `channel`.
    pub fn acquire(&self, channel: ChannelId, request: T) -> Result<Acquired, T::Reject> {
        request.validate()?;

        let mut slots = self.slots.lock();
        let stream_id = request.stream_id();

        if let Some((index, slot)) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.bound_to(channel, stream_id))
        {
            let Some(binding) = slot.binding.as_mut() else {
                return Err(T::mismatch_reject());
            };
            if binding.request.identity() != request.identity() {
                log::info!(
                    "[REGISTRY] {} reissue on {}/{} changed '{}' to '{}'",
                    T::KIND,
                    channel,
                    stream_id,
                    binding.request.identity(),
                    request.identity()
                );
                return Err(T::mismatch_reject());
            }
            binding.request = request;
            return Ok(Acquired {
                slot: SlotId {
                    index,
                    epoch: slot.epoch,
                },
                reissue: true,
            });
        }

        if let Some(limit) = self.per_channel {
            if slots.iter().filter(|s| s.owned_by(channel)).count() >= limit {
                log::info!(
                    "[REGISTRY] {} limit of {} reached for {}",
                    T::KIND,
                    limit,
                    channel
                );
                return Err(T::capacity_reject());
            }
        }

        let Some((index, slot)) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.binding.is_none())
        else {
            log::info!("[REGISTRY] {} pool exhausted", T::KIND);
            return Err(T::capacity_reject());
        };

        slot.binding = Some(Binding { channel, request });
        log::debug!(
            "[REGISTRY] {} slot {} bound to {}/{}",
            T::KIND,
            index,
            channel,
            stream_id
        );
        Ok(Acquired {
            slot: SlotId {
                index,
                epoch: slot.epoch,
            },
            reissue: false,
        })
    }

    /// Free a slot. Stale handles are ignored.
    pub fn release(&self, id: SlotId) -> Option<T> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(id.index)?;
        if slot.epoch != id.epoch {
            return None;
        }
        slot.clear()
    }

    /// Free the slot bound to one stream of `channel`.
    pub fn release_stream(&self, channel: ChannelId, stream_id: i32) -> Option<T> {
        let mut slots = self.slots.lock();
        slots
            .iter_mut()
            .find(|s| s.bound_to(channel, stream_id))
            .and_then(Slot::clear)
    }

    /// Free every slot owned by `channel`; returns how many were freed.
    pub fn release_all(&self, channel: ChannelId) -> usize {
        let mut slots = self.slots.lock();
        let mut released = 0;
        for slot in slots.iter_mut().filter(|s| s.owned_by(channel)) {
            slot.clear();
            released += 1;
        }
        if released > 0 {
            log::debug!(
                "[REGISTRY] {} released {} slot(s) of {}",
                T::KIND,
                released,
                channel
            );
        }
        released
    }

    /// Request held by a live slot.
    pub fn get(&self, id: SlotId) -> Option<T> {
        let slots = self.slots.lock();
        let slot = slots.get(id.index)?;
        if slot.epoch != id.epoch {
            return None;
        }
        slot.binding.as_ref().map(|b| b.request.clone())
    }

    pub fn find(&self, channel: ChannelId, stream_id: i32) -> Option<(SlotId, T)> {
        let slots = self.slots.lock();
        slots.iter().enumerate().find_map(|(index, s)| {
            if !s.bound_to(channel, stream_id) {
                return None;
            }
            let b = s.binding.as_ref()?;
            Some((
                SlotId {
                    index,
                    epoch: s.epoch,
                },
                b.request.clone(),
            ))
        })
    }
}
