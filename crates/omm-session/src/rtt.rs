// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Round-trip latency probes on login streams.
//!
//! Push-only: each tick sends a probe stamped with the current tick count
//! to every registered channel whose interval has elapsed. A failed send
//! is retried on the next tick. Echoed probes come back through
//! [`RttMonitor::on_reply`].

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::transport::ChannelId;

/// Default interval between probes.
pub const DEFAULT_RTT_INTERVAL: Duration = Duration::from_secs(5);

/// Probe to send on a channel's login stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RttProbe {
    pub channel: ChannelId,
    pub stream_id: i32,
    /// Microseconds since the monitor was created.
    pub ticks: u64,
}

/// Per-channel probe state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RttState {
    pub login_stream_id: i32,
    pub last_send: Option<Instant>,
    pub has_round_trip_latency: bool,
    pub last_latency: Option<Duration>,
}

#[derive(Debug)]
pub struct RttMonitor {
    interval: Duration,
    epoch: Instant,
    channels: Mutex<BTreeMap<ChannelId, RttState>>,
}

impl Default for RttMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_RTT_INTERVAL)
    }
}

impl RttMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            epoch: Instant::now(),
            channels: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Tick count for `now`.
    pub fn ticks(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    /// Start probing `channel` after a login that negotiated RTT.
    pub fn register(&self, channel: ChannelId, login_stream_id: i32) {
        log::debug!(
            "[RTT] probing {} on login stream {}",
            channel,
            login_stream_id
        );
        self.channels.lock().insert(
            channel,
            RttState {
                login_stream_id,
                last_send: None,
                has_round_trip_latency: false,
                last_latency: None,
            },
        );
    }

    pub fn unregister(&self, channel: ChannelId) -> bool {
        self.channels.lock().remove(&channel).is_some()
    }

    pub fn state(&self, channel: ChannelId) -> Option<RttState> {
        self.channels.lock().get(&channel).copied()
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Send due probes through `send`; returns how many went out.
    pub fn drive<E>(&self, now: Instant, mut send: impl FnMut(RttProbe) -> Result<(), E>) -> usize
    where
        E: std::fmt::Display,
    {
        let ticks = self.ticks(now);
        let mut channels = self.channels.lock();
        let mut sent = 0;

        for (&channel, state) in channels.iter_mut() {
            let due = state
                .last_send
                .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
            if !due {
                continue;
            }

            let probe = RttProbe {
                channel,
                stream_id: state.login_stream_id,
                ticks,
            };
            match send(probe) {
                Ok(()) => {
                    state.last_send = Some(now);
                    sent += 1;
                }
                Err(e) => log::debug!("[RTT] probe on {} not sent: {}", channel, e),
            }
        }
        sent
    }

    /// Record an echoed probe. Returns the measured latency.
    pub fn on_reply(&self, channel: ChannelId, ticks: u64, now: Instant) -> Option<Duration> {
        let mut channels = self.channels.lock();
        let state = channels.get_mut(&channel)?;
        let latency = Duration::from_micros(self.ticks(now).checked_sub(ticks)?);
        state.has_round_trip_latency = true;
        state.last_latency = Some(latency);
        log::debug!("[RTT] {} round trip {:?}", channel, latency);
        Some(latency)
    }
}
