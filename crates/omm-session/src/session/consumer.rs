// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Consumer session: bootstrap, item streams and recovery.
//!
//! ```text
//! Disconnected -> Connecting -> LoginPending -> DirectoryPending
//!      ^                                              |
//!      |                                              v
//!      +---- channel lost ---- Ready <---- DictionaryPending
//! ```
//!
//! Items requested before `Ready` are held in the watchlist's pending
//! queue. At `Ready` the watchlist is replayed on the original stream ids,
//! then pending items are opened.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{DIRECTORY_STREAM_ID, FIRST_DICTIONARY_STREAM_ID, LOGIN_STREAM_ID};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::message::{filter, DomainType, Message, MessageCodec, MsgClass, MsgFlags, State};
use crate::reconnect::ReconnectPolicy;
use crate::registry::{DirectoryRequest, LoginRequest};
use crate::transport::{
    Channel, ChannelCloser, ChannelId, ChannelInfo, ChannelOptions, Connector, ReadOutcome,
    StepOutcome,
};
use crate::watchlist::{PendingItem, StreamWatchlist};

/// Bootstrap progress of a consumer session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerPhase {
    Disconnected,
    Connecting,
    LoginPending,
    DirectoryPending,
    DictionaryPending,
    Ready,
}

impl fmt::Display for ConsumerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsumerPhase::Disconnected => "Disconnected",
            ConsumerPhase::Connecting => "Connecting",
            ConsumerPhase::LoginPending => "LoginPending",
            ConsumerPhase::DirectoryPending => "DirectoryPending",
            ConsumerPhase::DictionaryPending => "DictionaryPending",
            ConsumerPhase::Ready => "Ready",
        };
        write!(f, "{}", s)
    }
}

/// Something the application should know about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    ChannelUp(ChannelInfo),
    LoginAccepted(State),
    /// The channel has been closed; no reconnect is scheduled.
    LoginRejected(State),
    DirectoryReceived,
    DictionaryReceived { name: String },
    DictionaryFailed { name: String, state: State },
    /// Bootstrap finished; `replayed` item streams were reopened.
    Ready { replayed: usize },
    /// Refresh, update or status on an open item stream.
    Item(Message),
    /// The provider closed an item stream; it left the watchlist.
    ItemClosed { stream_id: i32, state: State },
    Disconnected {
        reason: String,
        retry_in: Option<Duration>,
    },
}

/// Client side of one logical connection to a provider.
pub struct ConsumerSession {
    config: SessionConfig,
    options: ChannelOptions,
    codec: Arc<dyn MessageCodec>,
    connector: Box<dyn Connector>,
    channel: Option<Channel>,
    connects: u32,
    phase: ConsumerPhase,
    watchlist: StreamWatchlist<State>,
    reconnect: ReconnectPolicy,
    retry_at: Option<Instant>,
    /// Dictionary streams still waiting for a refresh.
    dictionaries: Vec<(i32, String)>,
    events: VecDeque<SessionEvent>,
}

impl ConsumerSession {
    pub fn new(
        config: SessionConfig,
        connector: Box<dyn Connector>,
        codec: Arc<dyn MessageCodec>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let options = ChannelOptions::from_config(&config);
        let reconnect = ReconnectPolicy::from_config(&config);
        let watchlist =
            StreamWatchlist::new(config.start_stream_id).with_max_items(config.max_items);

        Ok(Self {
            config,
            options,
            codec,
            connector,
            channel: None,
            connects: 0,
            phase: ConsumerPhase::Disconnected,
            watchlist,
            reconnect,
            retry_at: None,
            dictionaries: Vec::new(),
            events: VecDeque::new(),
        })
    }

    pub fn phase(&self) -> ConsumerPhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase == ConsumerPhase::Ready
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    /// Close handle for the current channel.
    pub fn closer(&self) -> Option<ChannelCloser> {
        self.channel.as_ref().map(Channel::closer)
    }

    pub fn watchlist(&self) -> &StreamWatchlist<State> {
        &self.watchlist
    }

    /// When the next reconnect attempt is due.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Open a new channel. On failure a retry is scheduled.
    pub fn connect(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.channel.is_some() {
            return Ok(());
        }

        let id = ChannelId::new(0, self.connects);
        self.connects = self.connects.wrapping_add(1);
        let mut channel = Channel::new(id, self.options.clone(), self.connector.box_clone());

        match channel.connect() {
            Ok(()) => {
                log::info!("[SESSION] {} connecting to {}", id, self.options.target);
                self.channel = Some(channel);
                self.phase = ConsumerPhase::Connecting;
                self.retry_at = None;
                Ok(())
            }
            Err(e) => {
                self.schedule_retry(e.to_string(), now);
                Err(e.into())
            }
        }
    }

    /// Drive the session: reconnect when due, advance the handshake, read
    /// and dispatch messages, keep the channel alive.
    ///
    /// A lost channel is reported as [`SessionEvent::Disconnected`], not
    /// as an error.
    pub fn poll(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.phase == ConsumerPhase::Disconnected {
            if self.retry_at.is_some_and(|at| now >= at) {
                if let Err(e) = self.connect(now) {
                    log::debug!("[SESSION] reconnect attempt failed: {}", e);
                }
            }
            return Ok(());
        }

        match self.drive(now) {
            Err(e) if e.is_disconnect() => {
                self.on_channel_down(e.to_string(), now);
                Ok(())
            }
            other => other,
        }
    }

    /// Close the login stream and the channel. No reconnect follows.
    pub fn close(&mut self) -> Result<(), SessionError> {
        let Some(mut channel) = self.channel.take() else {
            return Ok(());
        };
        if channel.is_active() && self.phase != ConsumerPhase::Connecting {
            let bytes = self
                .codec
                .encode(&Message::close(LOGIN_STREAM_ID, DomainType::Login))?;
            if let Err(e) = channel.write(&bytes) {
                log::debug!("[SESSION] login close not sent: {}", e);
            }
        }
        channel.close()?;
        self.phase = ConsumerPhase::Disconnected;
        self.retry_at = None;
        self.dictionaries.clear();
        self.watchlist
            .on_disconnect(!self.config.remove_items_on_disconnect);
        log::info!("[SESSION] closed");
        Ok(())
    }

    fn drive(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.phase == ConsumerPhase::Connecting {
            let outcome = match self.channel.as_mut() {
                Some(channel) => channel.step(),
                None => return Err(SessionError::NotConnected),
            };
            match outcome {
                StepOutcome::InProgress { new_descriptor } => {
                    if let Some(descriptor) = new_descriptor {
                        log::debug!("[SESSION] channel moved to {}", descriptor);
                    }
                    return Ok(());
                }
                StepOutcome::Active(info) => {
                    self.events.push_back(SessionEvent::ChannelUp(info));
                    self.phase = ConsumerPhase::LoginPending;
                    let login = LoginRequest::new(LOGIN_STREAM_ID, self.config.user_name.clone())
                        .with_rtt(self.config.rtt_enabled);
                    self.send(&login.to_message())?;
                }
                StepOutcome::Failed(e) => return Err(e.into()),
            }
        }

        loop {
            let outcome = match self.channel.as_mut() {
                Some(channel) => channel.read()?,
                None => return Ok(()),
            };
            match outcome {
                ReadOutcome::Message(bytes) => match self.codec.decode(&bytes) {
                    Ok(msg) => self.on_message(msg, now)?,
                    Err(e) => log::warn!("[SESSION] dropping undecodable message: {}", e),
                },
                ReadOutcome::Ping => {}
                ReadOutcome::WouldBlock => break,
            }
        }

        if let Some(channel) = self.channel.as_mut() {
            channel.check_ping(now)?;
            channel.flush()?;
        }
        Ok(())
    }

    fn send(&mut self, msg: &Message) -> Result<(), SessionError> {
        let bytes = self.codec.encode(msg)?;
        let channel = self.channel.as_mut().ok_or(SessionError::NotConnected)?;
        channel.write(&bytes)?;
        Ok(())
    }

    /// Run the disconnect path for fatal errors before handing them back.
    fn settle<T>(&mut self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if let Err(e) = &result {
            if e.is_disconnect() && self.channel.is_some() {
                self.on_channel_down(e.to_string(), Instant::now());
            }
        }
        result
    }

    fn on_channel_down(&mut self, reason: String, now: Instant) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close() {
                log::debug!("[SESSION] {} close after disconnect: {}", channel.id(), e);
            }
        }
        self.dictionaries.clear();
        let kept = self
            .watchlist
            .on_disconnect(!self.config.remove_items_on_disconnect);
        log::warn!(
            "[SESSION] channel lost in {}: {} ({} item(s) kept)",
            self.phase,
            reason,
            kept
        );
        self.schedule_retry(reason, now);
    }

    fn schedule_retry(&mut self, reason: String, now: Instant) {
        self.phase = ConsumerPhase::Disconnected;
        let retry_in = self.reconnect.next_delay();
        self.retry_at = retry_in.map(|delay| now + delay);
        match retry_in {
            Some(delay) => log::info!(
                "[SESSION] reconnect attempt {} in {:?}",
                self.reconnect.attempts(),
                delay
            ),
            None => log::warn!("[SESSION] reconnect attempts exhausted"),
        }
        self.events
            .push_back(SessionEvent::Disconnected { reason, retry_in });
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    fn on_message(&mut self, msg: Message, now: Instant) -> Result<(), SessionError> {
        match msg.domain {
            DomainType::Login => self.on_login(msg),
            DomainType::Source => self.on_directory(msg, now),
            DomainType::Dictionary => self.on_dictionary(msg),
            _ => {
                self.on_item(msg);
                Ok(())
            }
        }
    }

    fn on_login(&mut self, msg: Message) -> Result<(), SessionError> {
        if msg.rtt_ticks().is_some() {
            if self.config.rtt_enabled {
                // echo the probe unchanged
                self.send(&msg)?;
            }
            return Ok(());
        }

        let Some(state) = msg.state else {
            return Ok(());
        };

        if state.stream_state.is_closed() {
            log::warn!("[SESSION] login rejected: {}", state);
            if let Some(mut channel) = self.channel.take() {
                if let Err(e) = channel.close() {
                    log::debug!("[SESSION] {} close after login reject: {}", channel.id(), e);
                }
            }
            self.phase = ConsumerPhase::Disconnected;
            self.retry_at = None;
            self.dictionaries.clear();
            self.watchlist
                .on_disconnect(!self.config.remove_items_on_disconnect);
            self.events.push_back(SessionEvent::LoginRejected(state));
            return Ok(());
        }

        if msg.class == MsgClass::Refresh
            && self.phase == ConsumerPhase::LoginPending
            && state.is_open_ok()
        {
            log::info!("[SESSION] login accepted: {}", state.text);
            self.events.push_back(SessionEvent::LoginAccepted(state));
            self.phase = ConsumerPhase::DirectoryPending;
            let request = DirectoryRequest::new(DIRECTORY_STREAM_ID, filter::DIRECTORY_MINIMUM);
            self.send(&request.to_message())?;
        } else {
            log::debug!("[SESSION] login {}: {}", msg.class, state);
        }
        Ok(())
    }

    fn on_directory(&mut self, msg: Message, now: Instant) -> Result<(), SessionError> {
        let state = msg.state.unwrap_or_default();

        if state.stream_state.is_closed() {
            self.on_channel_down(format!("directory stream closed: {}", state), now);
            return Ok(());
        }

        if msg.class == MsgClass::Refresh && self.phase == ConsumerPhase::DirectoryPending {
            self.events.push_back(SessionEvent::DirectoryReceived);
            self.phase = ConsumerPhase::DictionaryPending;
            self.dictionaries = self
                .config
                .dictionary_names
                .iter()
                .enumerate()
                .map(|(i, name)| (FIRST_DICTIONARY_STREAM_ID + i as i32, name.clone()))
                .collect();

            if self.dictionaries.is_empty() {
                return self.become_ready();
            }
            for (stream_id, name) in self.dictionaries.clone() {
                self.send(&Message::request(stream_id, DomainType::Dictionary, name))?;
            }
        }
        Ok(())
    }

    fn on_dictionary(&mut self, msg: Message) -> Result<(), SessionError> {
        let Some(pos) = self
            .dictionaries
            .iter()
            .position(|(id, _)| *id == msg.stream_id)
        else {
            log::debug!("[SESSION] dictionary {} on stream {}", msg.class, msg.stream_id);
            return Ok(());
        };

        let state = msg.state.unwrap_or_default();
        if msg.class == MsgClass::Refresh {
            let (_, name) = self.dictionaries.remove(pos);
            log::debug!("[SESSION] dictionary {} received", name);
            self.events
                .push_back(SessionEvent::DictionaryReceived { name });
        } else if state.stream_state.is_closed() {
            let (_, name) = self.dictionaries.remove(pos);
            log::warn!("[SESSION] dictionary {} unavailable: {}", name, state);
            self.events
                .push_back(SessionEvent::DictionaryFailed { name, state });
        } else {
            return Ok(());
        }

        if self.dictionaries.is_empty() && self.phase == ConsumerPhase::DictionaryPending {
            self.become_ready()?;
        }
        Ok(())
    }

    fn on_item(&mut self, msg: Message) {
        let stream_id = msg.stream_id;
        if !self.watchlist.contains(stream_id) {
            log::debug!("[SESSION] {} on unknown stream {}", msg.class, stream_id);
            return;
        }

        if let Some(state) = &msg.state {
            let latest = state.clone();
            self.watchlist.update_state(stream_id, |s| *s = latest);

            if state.stream_state.is_closed() {
                self.watchlist.remove(stream_id);
                log::info!("[SESSION] item stream {} closed: {}", stream_id, state);
                self.events.push_back(SessionEvent::ItemClosed {
                    stream_id,
                    state: state.clone(),
                });
                return;
            }
        }
        self.events.push_back(SessionEvent::Item(msg));
    }

    fn become_ready(&mut self) -> Result<(), SessionError> {
        self.phase = ConsumerPhase::Ready;
        self.reconnect.reset();

        let mut replayed = 0;
        for request in self.watchlist.replay() {
            replayed += request.stream_ids().len();
            self.send(&request.to_message())?;
        }

        for item in self.watchlist.take_pending() {
            match self.open(item) {
                Err(SessionError::Watchlist(e)) => {
                    log::warn!("[SESSION] pending item not opened: {}", e)
                }
                other => {
                    other?;
                }
            }
        }

        log::info!("[SESSION] ready, {} item stream(s) replayed", replayed);
        self.events.push_back(SessionEvent::Ready { replayed });
        Ok(())
    }

    // ========================================================================
    // Items
    // ========================================================================

    /// Register the item(s) and send the request. Entries whose request
    /// never left are removed again, unless the channel went down and
    /// they wait for replay.
    fn open(&mut self, item: PendingItem) -> Result<Vec<i32>, SessionError> {
        let (ids, request) = if item.names.len() == 1 {
            let name = item.names[0].clone();
            let stream_id = self.watchlist.add(item.domain, name.clone(), item.flags)?;
            let request = Message::request(stream_id, item.domain, name).with_flags(item.flags);
            (vec![stream_id], request)
        } else {
            let (batch_id, ids) = self
                .watchlist
                .add_batch(item.domain, &item.names, item.flags)?;
            let flags = MsgFlags {
                batch: true,
                ..item.flags
            };
            let request =
                Message::batch_request(batch_id, item.domain, item.names).with_flags(flags);
            (ids, request)
        };

        if let Err(e) = self.send(&request) {
            if !e.is_disconnect() {
                let removed = self.watchlist.remove_all(&ids);
                log::warn!(
                    "[SESSION] request for stream {} not sent, {} entry(ies) dropped: {}",
                    request.stream_id,
                    removed,
                    e
                );
            }
            return Err(e);
        }
        Ok(ids)
    }

    /// Open an item stream. Returns its stream id, or `None` when the
    /// request is held until the session is ready.
    pub fn request_item(
        &mut self,
        domain: DomainType,
        name: impl Into<String>,
        flags: MsgFlags,
    ) -> Result<Option<i32>, SessionError> {
        let ids = self.request_batch(domain, vec![name.into()], flags)?;
        Ok(ids.and_then(|ids| ids.first().copied()))
    }

    /// Open several item streams; more than one name goes out as a batch.
    pub fn request_batch(
        &mut self,
        domain: DomainType,
        names: Vec<String>,
        flags: MsgFlags,
    ) -> Result<Option<Vec<i32>>, SessionError> {
        if names.is_empty() {
            return Ok(Some(Vec::new()));
        }
        let item = PendingItem {
            domain,
            names,
            flags,
        };
        if self.phase != ConsumerPhase::Ready {
            log::debug!("[SESSION] holding {} item(s) until ready", item.names.len());
            self.watchlist.queue_pending(item);
            return Ok(None);
        }
        let result = self.open(item);
        self.settle(result).map(Some)
    }

    /// Close an item stream. Returns false if it was not open.
    pub fn close_item(&mut self, stream_id: i32) -> Result<bool, SessionError> {
        let Some(entry) = self.watchlist.remove(stream_id) else {
            return Ok(false);
        };
        if self.phase == ConsumerPhase::Ready {
            let result = self.send(&Message::close(stream_id, entry.domain));
            self.settle(result)?;
        }
        Ok(true)
    }
}

impl fmt::Debug for ConsumerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSession")
            .field("phase", &self.phase)
            .field("target", &self.options.target)
            .field("channel", &self.channel.as_ref().map(Channel::id))
            .field("items", &self.watchlist.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DataState, HeaderCodec, StatusCode, StreamState};
    use crate::registry::{ENUM_DICTIONARY_NAME, FIELD_DICTIONARY_NAME};
    use crate::transport::byte_stream::mock::MockStream;
    use crate::transport::connector::mock::MockConnector;
    use crate::transport::{FrameCodec, HandshakeFrame, DEFAULT_MAX_MESSAGE_SIZE};
    use std::io::{self, Cursor};

    fn frame(msg: &Message) -> Vec<u8> {
        FrameCodec::encode(&HeaderCodec.encode(msg).unwrap())
    }

    fn ack() -> Vec<u8> {
        let params = SessionConfig::default().connect_params();
        FrameCodec::encode(&HandshakeFrame::Ack(params).encode())
    }

    /// Messages written since the last call. Handshake frames are too
    /// short to decode as messages and drop out.
    fn sent(stream: &MockStream) -> Vec<Message> {
        let data = stream.get_written_data();
        stream.clear_written_data();
        let mut codec = FrameCodec::new(DEFAULT_MAX_MESSAGE_SIZE);
        let mut cursor = Cursor::new(data);
        let mut out = Vec::new();
        while let Ok(Some(payload)) = codec.decode(&mut cursor) {
            if let Ok(msg) = HeaderCodec.decode(&payload) {
                out.push(msg);
            }
        }
        out
    }

    fn open_ok(stream_id: i32, domain: DomainType) -> Message {
        Message::refresh(stream_id, domain, State::open_ok("ok"))
    }

    fn session_with(config: SessionConfig, streams: &[MockStream]) -> ConsumerSession {
        let connector = MockConnector::new();
        for stream in streams {
            connector.push_stream(stream.clone());
        }
        ConsumerSession::new(config, Box::new(connector), Arc::new(HeaderCodec)).unwrap()
    }

    fn feed_bootstrap(stream: &MockStream) {
        stream.feed_read_data(&ack());
        for msg in [
            open_ok(LOGIN_STREAM_ID, DomainType::Login),
            open_ok(DIRECTORY_STREAM_ID, DomainType::Source),
            open_ok(3, DomainType::Dictionary),
            open_ok(4, DomainType::Dictionary),
        ] {
            stream.feed_read_data(&frame(&msg));
        }
    }

    fn ready(config: SessionConfig, streams: &[MockStream]) -> (ConsumerSession, Instant) {
        let mut session = session_with(config, streams);
        let now = Instant::now();
        session.connect(now).unwrap();
        feed_bootstrap(&streams[0]);
        session.poll(now).unwrap();
        assert_eq!(session.phase(), ConsumerPhase::Ready);
        (session, now)
    }

    #[test]
    fn test_bootstrap_sequence() {
        let stream = MockStream::new();
        let mut session = session_with(SessionConfig::default().with_user_name("user1"), &[stream.clone()]);
        let now = Instant::now();

        session.connect(now).unwrap();
        assert_eq!(session.phase(), ConsumerPhase::Connecting);

        stream.feed_read_data(&ack());
        session.poll(now).unwrap();
        assert_eq!(session.phase(), ConsumerPhase::LoginPending);
        let login = sent(&stream);
        assert_eq!(login.len(), 1);
        assert_eq!(login[0].domain, DomainType::Login);
        assert_eq!(login[0].stream_id, LOGIN_STREAM_ID);
        assert_eq!(login[0].name.as_deref(), Some("user1"));

        stream.feed_read_data(&frame(&open_ok(LOGIN_STREAM_ID, DomainType::Login)));
        session.poll(now).unwrap();
        assert_eq!(session.phase(), ConsumerPhase::DirectoryPending);
        let directory = sent(&stream);
        assert_eq!(directory[0].domain, DomainType::Source);
        assert_eq!(directory[0].filter, filter::DIRECTORY_MINIMUM);

        stream.feed_read_data(&frame(&open_ok(DIRECTORY_STREAM_ID, DomainType::Source)));
        session.poll(now).unwrap();
        assert_eq!(session.phase(), ConsumerPhase::DictionaryPending);
        let names: Vec<_> = sent(&stream).into_iter().filter_map(|m| m.name).collect();
        assert_eq!(names, vec![FIELD_DICTIONARY_NAME, ENUM_DICTIONARY_NAME]);

        stream.feed_read_data(&frame(&open_ok(3, DomainType::Dictionary)));
        stream.feed_read_data(&frame(&open_ok(4, DomainType::Dictionary)));
        session.poll(now).unwrap();
        assert!(session.is_ready());

        let events = session.drain_events();
        assert!(matches!(events[0], SessionEvent::ChannelUp(_)));
        assert!(matches!(events[1], SessionEvent::LoginAccepted(_)));
        assert_eq!(events[2], SessionEvent::DirectoryReceived);
        assert_eq!(events.last(), Some(&SessionEvent::Ready { replayed: 0 }));
    }

    #[test]
    fn test_items_held_until_ready() {
        let stream = MockStream::new();
        let mut session = session_with(SessionConfig::default(), &[stream.clone()]);
        let now = Instant::now();
        session.connect(now).unwrap();

        let held = session
            .request_item(DomainType::MarketPrice, "IBM.N", MsgFlags::streaming())
            .unwrap();
        assert_eq!(held, None);

        feed_bootstrap(&stream);
        session.poll(now).unwrap();
        assert!(session.is_ready());

        let requests: Vec<_> = sent(&stream)
            .into_iter()
            .filter(|m| m.domain == DomainType::MarketPrice)
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].stream_id, 5);
        assert_eq!(requests[0].name.as_deref(), Some("IBM.N"));
    }

    #[test]
    fn test_login_rejected_closes_channel() {
        let stream = MockStream::new();
        let mut session = session_with(SessionConfig::default(), &[stream.clone()]);
        let now = Instant::now();
        session.connect(now).unwrap();
        stream.feed_read_data(&ack());

        let state = State::new(
            StreamState::Closed,
            DataState::Suspect,
            StatusCode::NotAuthorized,
            "denied",
        );
        stream.feed_read_data(&frame(&Message::status(
            LOGIN_STREAM_ID,
            DomainType::Login,
            state.clone(),
        )));
        session.poll(now).unwrap();

        assert_eq!(session.phase(), ConsumerPhase::Disconnected);
        assert!(session.channel().is_none());
        assert_eq!(session.retry_at(), None);
        assert!(session
            .drain_events()
            .contains(&SessionEvent::LoginRejected(state)));
        assert!(!stream.is_connected());
    }

    #[test]
    fn test_item_close_removes_only_that_stream() {
        let stream = MockStream::new();
        let (mut session, now) = ready(SessionConfig::default(), &[stream.clone()]);
        let a = session
            .request_item(DomainType::MarketPrice, "A", MsgFlags::streaming())
            .unwrap()
            .unwrap();
        let b = session
            .request_item(DomainType::MarketPrice, "B", MsgFlags::streaming())
            .unwrap()
            .unwrap();
        session.drain_events();

        let closed = State::new(
            StreamState::Closed,
            DataState::Suspect,
            StatusCode::NotFound,
            "not found",
        );
        stream.feed_read_data(&frame(&Message::status(a, DomainType::MarketPrice, closed.clone())));
        stream.feed_read_data(&frame(&open_ok(b, DomainType::MarketPrice)));
        session.poll(now).unwrap();

        assert!(!session.watchlist().contains(a));
        assert!(session.watchlist().contains(b));
        assert!(session.is_ready());
        let events = session.drain_events();
        assert_eq!(
            events[0],
            SessionEvent::ItemClosed {
                stream_id: a,
                state: closed
            }
        );
        assert!(matches!(&events[1], SessionEvent::Item(m) if m.stream_id == b));
        assert!(session
            .watchlist()
            .get(b)
            .is_some_and(|e| e.state.is_open_ok()));
    }

    #[test]
    fn test_reconnect_replays_items() {
        let first = MockStream::new();
        let second = MockStream::new();
        let (mut session, now) = ready(SessionConfig::default(), &[first.clone(), second.clone()]);
        let a = session
            .request_item(DomainType::MarketPrice, "A", MsgFlags::streaming())
            .unwrap()
            .unwrap();
        let b = session
            .request_item(DomainType::MarketByOrder, "B", MsgFlags::streaming())
            .unwrap()
            .unwrap();
        session.drain_events();

        first.disconnect();
        session.poll(now).unwrap();
        assert_eq!(session.phase(), ConsumerPhase::Disconnected);
        assert_eq!(session.watchlist().len(), 2);
        let events = session.drain_events();
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::Disconnected { retry_in: Some(d), .. }] if *d == Duration::from_millis(1000)
        ));

        session.poll(now + Duration::from_millis(500)).unwrap();
        assert_eq!(session.phase(), ConsumerPhase::Disconnected);

        feed_bootstrap(&second);
        let later = now + Duration::from_millis(1000);
        session.poll(later).unwrap();
        assert_eq!(session.phase(), ConsumerPhase::Connecting);
        session.poll(later).unwrap();
        assert!(session.is_ready());

        let replayed: Vec<(i32, Option<String>)> = sent(&second)
            .into_iter()
            .filter(|m| !m.domain.is_administrative())
            .map(|m| (m.stream_id, m.name))
            .collect();
        assert_eq!(
            replayed,
            vec![(a, Some("A".to_string())), (b, Some("B".to_string()))]
        );
        assert!(session
            .drain_events()
            .contains(&SessionEvent::Ready { replayed: 2 }));
    }

    #[test]
    fn test_disconnect_without_recovery_drops_items() {
        let first = MockStream::new();
        let second = MockStream::new();
        let config = SessionConfig::default().with_remove_items_on_disconnect(true);
        let (mut session, now) = ready(config, &[first.clone(), second.clone()]);
        session
            .request_item(DomainType::MarketPrice, "A", MsgFlags::streaming())
            .unwrap();

        first.disconnect();
        session.poll(now).unwrap();
        assert!(session.watchlist().is_empty());

        feed_bootstrap(&second);
        let later = now + Duration::from_secs(1);
        session.poll(later).unwrap();
        session.poll(later).unwrap();
        assert!(session.is_ready());
        assert!(sent(&second)
            .iter()
            .all(|m| m.domain.is_administrative()));
    }

    #[test]
    fn test_connect_failure_schedules_retry() {
        let connector = MockConnector::new();
        connector.push_failure(io::ErrorKind::ConnectionRefused);
        let config = SessionConfig::default().with_reconnect(100, 400, 1);
        let mut session =
            ConsumerSession::new(config, Box::new(connector), Arc::new(HeaderCodec)).unwrap();
        let now = Instant::now();

        assert!(session.connect(now).is_err());
        assert_eq!(session.retry_at(), Some(now + Duration::from_millis(100)));

        // second failure exhausts the single allowed attempt
        session.poll(now + Duration::from_millis(100)).unwrap();
        assert_eq!(session.retry_at(), None);
        let events = session.drain_events();
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Disconnected { retry_in: None, .. })
        ));
    }

    #[test]
    fn test_rtt_probe_echoed() {
        let stream = MockStream::new();
        let (mut session, now) = ready(SessionConfig::default().with_rtt(true), &[stream.clone()]);
        sent(&stream);

        let probe = Message::rtt(LOGIN_STREAM_ID, 4242);
        stream.feed_read_data(&frame(&probe));
        session.poll(now).unwrap();

        assert_eq!(sent(&stream), vec![probe]);
    }

    #[test]
    fn test_close_item_sends_close() {
        let stream = MockStream::new();
        let (mut session, _) = ready(SessionConfig::default(), &[stream.clone()]);
        let id = session
            .request_item(DomainType::MarketPrice, "A", MsgFlags::streaming())
            .unwrap()
            .unwrap();
        sent(&stream);

        assert!(session.close_item(id).unwrap());
        assert!(!session.close_item(id).unwrap());
        let msgs = sent(&stream);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].class, MsgClass::Close);
        assert_eq!(msgs[0].stream_id, id);
    }

    #[test]
    fn test_batch_request() {
        let stream = MockStream::new();
        let (mut session, _) = ready(SessionConfig::default(), &[stream.clone()]);
        sent(&stream);

        let ids = session
            .request_batch(
                DomainType::MarketPrice,
                vec!["A".into(), "B".into()],
                MsgFlags::streaming(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(ids, vec![6, 7]);

        let msgs = sent(&stream);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].flags.batch);
        assert_eq!(msgs[0].stream_id, 5);
        assert_eq!(msgs[0].batch_names, vec!["A", "B"]);
    }

    #[test]
    fn test_unsent_request_leaves_no_entry() {
        let stream = MockStream::new();
        let (mut session, _) = ready(SessionConfig::default(), &[stream.clone()]);
        sent(&stream);

        // larger than the negotiated max fragment size
        let long = "X".repeat(20_000);
        let err = session
            .request_item(DomainType::MarketPrice, long.clone(), MsgFlags::streaming())
            .unwrap_err();
        assert!(!err.is_disconnect());
        assert!(session.watchlist().is_empty());
        assert!(sent(&stream).is_empty());
        assert_eq!(session.phase(), ConsumerPhase::Ready);

        let err = session
            .request_batch(
                DomainType::MarketPrice,
                vec![long.clone(), "B".into()],
                MsgFlags::streaming(),
            )
            .unwrap_err();
        assert!(!err.is_disconnect());
        assert!(session.watchlist().is_empty());

        // a shorter retry goes through on a fresh entry
        let id = session
            .request_item(DomainType::MarketPrice, "B", MsgFlags::streaming())
            .unwrap()
            .unwrap();
        assert_eq!(session.watchlist().len(), 1);
        let msgs = sent(&stream);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].stream_id, id);
    }

    #[test]
    fn test_user_close() {
        let stream = MockStream::new();
        let (mut session, _) = ready(SessionConfig::default(), &[stream.clone()]);
        sent(&stream);

        session.close().unwrap();
        assert_eq!(session.phase(), ConsumerPhase::Disconnected);
        assert_eq!(session.retry_at(), None);
        let msgs = sent(&stream);
        assert_eq!(msgs[0].class, MsgClass::Close);
        assert_eq!(msgs[0].domain, DomainType::Login);
    }
}
