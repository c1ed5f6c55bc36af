// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Provider session: one accepted channel over shared request registries.
//!
//! Login, directory and dictionary requests are bound to slots in the
//! process-wide [`ProviderRegistries`]. A refused request gets exactly one
//! Status message on its stream and the channel stays open. Item streams
//! are tracked per channel.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::message::{
    CodecError, DataState, DomainType, Message, MessageCodec, MsgClass, MsgFlags, State,
    StatusCode, StreamState,
};
use crate::registry::{
    DictionaryReject, DictionaryRequest, DirectoryReject, DirectoryRequest, LoginReject,
    LoginRequest, RejectReason, RequestSlotRegistry, SlotId, SlotRequest,
};
use crate::rtt::{RttMonitor, RttState};
use crate::transport::{Channel, ChannelId, ChannelInfo, ReadOutcome, StepOutcome};
use crate::watchlist::{StreamWatchlist, WatchlistError};

// ============================================================================
// Registries
// ============================================================================

/// Request registries shared by every channel of a provider process.
#[derive(Debug)]
pub struct ProviderRegistries {
    pub login: RequestSlotRegistry<LoginRequest>,
    pub directory: RequestSlotRegistry<DirectoryRequest>,
    pub dictionary: RequestSlotRegistry<DictionaryRequest>,
    dictionary_names: Arc<[String]>,
    rtt_enabled: bool,
    rtt_interval: Duration,
    max_items: usize,
}

impl ProviderRegistries {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            login: RequestSlotRegistry::per_client(
                config.max_clients,
                config.login_slots_per_client,
            ),
            directory: RequestSlotRegistry::per_client(
                config.max_clients,
                config.directory_slots_per_client,
            ),
            dictionary: RequestSlotRegistry::per_client(
                config.max_clients,
                config.dictionary_slots_per_client,
            ),
            dictionary_names: config.dictionary_names.clone().into(),
            rtt_enabled: config.rtt_enabled,
            rtt_interval: config.rtt_interval(),
            max_items: config.max_items,
        }
    }

    /// Dictionary names this provider serves.
    pub fn dictionary_names(&self) -> &[String] {
        &self.dictionary_names
    }

    /// Release every slot held by `channel`.
    pub fn release_all(&self, channel: ChannelId) -> usize {
        self.login.release_all(channel)
            + self.directory.release_all(channel)
            + self.dictionary.release_all(channel)
    }

    fn is_admin_stream(&self, channel: ChannelId, stream_id: i32) -> bool {
        self.login.find(channel, stream_id).is_some()
            || self.directory.find(channel, stream_id).is_some()
            || self.dictionary.find(channel, stream_id).is_some()
    }
}

// ============================================================================
// Item rejects
// ============================================================================

/// Why an item request was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemReject {
    ItemCountReached,
    ItemAlreadyOpened,
    StreamAlreadyInUse,
    ItemNotSupported,
    InvalidStreamId,
    LoginRequired,
}

impl fmt::Display for ItemReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemReject::ItemCountReached => "item count reached for this channel",
            ItemReject::ItemAlreadyOpened => {
                "item already open with exact same key on another stream"
            }
            ItemReject::StreamAlreadyInUse => "stream already in use with a different key",
            ItemReject::ItemNotSupported => "item not supported",
            ItemReject::InvalidStreamId => "invalid stream id",
            ItemReject::LoginRequired => "no login stream open on this channel",
        };
        write!(f, "{}", s)
    }
}

impl RejectReason for ItemReject {
    fn status(&self, stream_id: i32) -> State {
        let (stream_state, code) = match self {
            ItemReject::ItemCountReached => (StreamState::ClosedRecover, StatusCode::TooManyItems),
            ItemReject::ItemAlreadyOpened => (StreamState::Closed, StatusCode::AlreadyOpen),
            _ => (StreamState::Closed, StatusCode::UsageError),
        };
        State::new(
            stream_state,
            DataState::Suspect,
            code,
            format!("Item request rejected for stream id {}- {}", stream_id, self),
        )
    }

    fn is_capacity(&self) -> bool {
        matches!(self, ItemReject::ItemCountReached)
    }
}

impl From<WatchlistError> for ItemReject {
    fn from(e: WatchlistError) -> Self {
        match e {
            WatchlistError::Full(_) => ItemReject::ItemCountReached,
            WatchlistError::DuplicateItem { .. } => ItemReject::ItemAlreadyOpened,
            WatchlistError::DuplicateStreamId(_) => ItemReject::StreamAlreadyInUse,
            WatchlistError::InvalidStreamId(_) => ItemReject::InvalidStreamId,
            WatchlistError::EmptyBatch => ItemReject::ItemNotSupported,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Something the provider application should act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderEvent {
    ChannelUp(ChannelInfo),
    /// The login refresh has already been sent.
    LoginAccepted { stream_id: i32, user_name: String },
    /// Answer with a directory refresh.
    DirectoryRequested { stream_id: i32, filter: u32 },
    /// Answer with a dictionary refresh.
    DictionaryRequested { stream_id: i32, name: String },
    ItemOpened {
        stream_id: i32,
        domain: DomainType,
        name: String,
        reissue: bool,
    },
    ItemClosed { stream_id: i32 },
    /// A Status carrying `state` was sent in reply.
    Rejected {
        domain: DomainType,
        stream_id: i32,
        state: State,
    },
    RttLatency(Duration),
    Closed,
}

/// Server side of one accepted channel.
pub struct ProviderSession {
    channel: Channel,
    registries: Arc<ProviderRegistries>,
    codec: Arc<dyn MessageCodec>,
    rtt: RttMonitor,
    items: StreamWatchlist,
    login: Option<SlotId>,
    closed: bool,
    events: VecDeque<ProviderEvent>,
}

impl ProviderSession {
    /// `channel` is an accepted channel still waiting for its
    /// ConnectRequest.
    pub fn new(
        channel: Channel,
        registries: Arc<ProviderRegistries>,
        codec: Arc<dyn MessageCodec>,
    ) -> Self {
        let rtt = RttMonitor::new(registries.rtt_interval);
        let items = StreamWatchlist::new(1).with_max_items(registries.max_items);
        Self {
            channel,
            registries,
            codec,
            rtt,
            items,
            login: None,
            closed: false,
            events: VecDeque::new(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The login bound to this channel.
    pub fn login(&self) -> Option<LoginRequest> {
        self.login.and_then(|slot| self.registries.login.get(slot))
    }

    pub fn items(&self) -> &StreamWatchlist {
        &self.items
    }

    pub fn rtt_state(&self) -> Option<RttState> {
        self.rtt.state(self.channel.id())
    }

    pub fn poll_event(&mut self) -> Option<ProviderEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<ProviderEvent> {
        self.events.drain(..).collect()
    }

    /// Drive the channel: handshake, inbound requests, pings and RTT
    /// probes. A lost channel is reported as [`ProviderEvent::Closed`].
    pub fn poll(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        match self.drive(now) {
            Err(e) if e.is_disconnect() => {
                log::info!("[SESSION] {} provider channel lost: {}", self.channel.id(), e);
                self.on_channel_closed();
                Ok(())
            }
            other => other,
        }
    }

    /// Send a message on this channel (refreshes, updates, statuses).
    pub fn send(&mut self, msg: &Message) -> Result<(), SessionError> {
        let result = self.write(msg);
        if let Err(e) = &result {
            if e.is_disconnect() {
                self.on_channel_closed();
            }
        }
        result
    }

    /// Close an item stream with a final status.
    pub fn close_item(&mut self, stream_id: i32, state: State) -> Result<bool, SessionError> {
        let Some(entry) = self.items.remove(stream_id) else {
            return Ok(false);
        };
        self.send(&Message::status(stream_id, entry.domain, state))?;
        Ok(true)
    }

    /// Close the channel and release everything it held.
    pub fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        let result = self.channel.close();
        self.on_channel_closed();
        result.map_err(SessionError::from)
    }

    /// Release slots, stop probing and forget item streams. Idempotent.
    pub fn on_channel_closed(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let id = self.channel.id();
        if let Err(e) = self.channel.close() {
            log::debug!("[SESSION] {} close failed: {}", id, e);
        }
        let released = self.registries.release_all(id);
        self.rtt.unregister(id);
        self.items.clear();
        self.login = None;
        log::debug!("[SESSION] {} closed, {} slot(s) released", id, released);
        self.events.push_back(ProviderEvent::Closed);
    }

    fn write(&mut self, msg: &Message) -> Result<(), SessionError> {
        let bytes = self.codec.encode(msg)?;
        self.channel.write(&bytes)?;
        Ok(())
    }

    fn drive(&mut self, now: Instant) -> Result<(), SessionError> {
        if !self.channel.is_active() {
            match self.channel.step() {
                StepOutcome::InProgress { .. } => return Ok(()),
                StepOutcome::Active(info) => self.events.push_back(ProviderEvent::ChannelUp(info)),
                StepOutcome::Failed(e) => return Err(e.into()),
            }
        }

        loop {
            match self.channel.read()? {
                ReadOutcome::Message(bytes) => match self.codec.decode(&bytes) {
                    Ok(msg) => self.on_message(msg, now)?,
                    Err(e) => self.on_undecodable(e)?,
                },
                ReadOutcome::Ping => {}
                ReadOutcome::WouldBlock => break,
            }
        }

        self.channel.check_ping(now)?;

        if !self.rtt.is_empty() {
            let channel = &mut self.channel;
            let codec = &self.codec;
            self.rtt.drive(now, |probe| -> Result<(), SessionError> {
                let bytes = codec.encode(&Message::rtt(probe.stream_id, probe.ticks))?;
                channel.write(&bytes)?;
                Ok(())
            });
        }

        self.channel.flush()?;
        Ok(())
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    fn on_message(&mut self, msg: Message, now: Instant) -> Result<(), SessionError> {
        match (msg.domain, msg.class) {
            (DomainType::Login, MsgClass::Generic) => {
                if let Some(ticks) = msg.rtt_ticks() {
                    if let Some(latency) = self.rtt.on_reply(self.channel.id(), ticks, now) {
                        self.events.push_back(ProviderEvent::RttLatency(latency));
                    }
                }
                Ok(())
            }
            (DomainType::Login, MsgClass::Request) => self.on_login_request(&msg),
            (DomainType::Source, MsgClass::Request) => self.on_directory_request(&msg),
            (DomainType::Dictionary, MsgClass::Request) => self.on_dictionary_request(&msg),
            (DomainType::Login, MsgClass::Close) => {
                let id = self.channel.id();
                if self.registries.login.release_stream(id, msg.stream_id).is_some() {
                    log::debug!("[SESSION] {} login stream {} closed", id, msg.stream_id);
                    self.login = None;
                    self.rtt.unregister(id);
                }
                Ok(())
            }
            (DomainType::Source, MsgClass::Close) => {
                self.registries
                    .directory
                    .release_stream(self.channel.id(), msg.stream_id);
                Ok(())
            }
            (DomainType::Dictionary, MsgClass::Close) => {
                self.registries
                    .dictionary
                    .release_stream(self.channel.id(), msg.stream_id);
                Ok(())
            }
            (_, MsgClass::Request) => self.on_item_request(&msg),
            (_, MsgClass::Close) => {
                if self.items.remove(msg.stream_id).is_some() {
                    self.events.push_back(ProviderEvent::ItemClosed {
                        stream_id: msg.stream_id,
                    });
                }
                Ok(())
            }
            (domain, class) => {
                log::debug!(
                    "[SESSION] ignoring {} {} on stream {}",
                    domain,
                    class,
                    msg.stream_id
                );
                Ok(())
            }
        }
    }

    /// Admin requests whose header decoded still get their Status.
    fn on_undecodable(&mut self, err: CodecError) -> Result<(), SessionError> {
        let reason = err.to_string();
        match err.header() {
            Some((MsgClass::Request, DomainType::Login, stream_id)) => self.reject(
                DomainType::Login,
                stream_id,
                &LoginReject::DecodeFailed(reason),
            ),
            Some((MsgClass::Request, DomainType::Source, stream_id)) => self.reject(
                DomainType::Source,
                stream_id,
                &DirectoryReject::DecodeFailed(reason),
            ),
            Some((MsgClass::Request, DomainType::Dictionary, stream_id)) => self.reject(
                DomainType::Dictionary,
                stream_id,
                &DictionaryReject::DecodeFailed(reason),
            ),
            _ => {
                log::warn!(
                    "[SESSION] {} dropping undecodable message: {}",
                    self.channel.id(),
                    reason
                );
                Ok(())
            }
        }
    }

    /// Send the Status for a refused request.
    fn reject<R: RejectReason>(
        &mut self,
        domain: DomainType,
        stream_id: i32,
        reason: &R,
    ) -> Result<(), SessionError> {
        let state = reason.status(stream_id);
        if reason.is_capacity() {
            log::warn!("[SESSION] {} {}", self.channel.id(), state.text);
        } else {
            log::info!("[SESSION] {} {}", self.channel.id(), state.text);
        }
        self.write(&Message::status(stream_id, domain, state.clone()))?;
        self.events.push_back(ProviderEvent::Rejected {
            domain,
            stream_id,
            state,
        });
        Ok(())
    }

    fn acquire<T: SlotRequest>(
        &mut self,
        registry: impl Fn(&ProviderRegistries) -> &RequestSlotRegistry<T>,
        domain: DomainType,
        request: Result<T, T::Reject>,
        stream_id: i32,
    ) -> Result<Option<(SlotId, T)>, SessionError> {
        let request = match request {
            Ok(request) => request,
            Err(reason) => {
                self.reject(domain, stream_id, &reason)?;
                return Ok(None);
            }
        };
        let acquired = registry(&*self.registries).acquire(self.channel.id(), request.clone());
        match acquired {
            Ok(acquired) => Ok(Some((acquired.slot, request))),
            Err(reason) => {
                self.reject(domain, stream_id, &reason)?;
                Ok(None)
            }
        }
    }

    fn on_login_request(&mut self, msg: &Message) -> Result<(), SessionError> {
        let request = LoginRequest::from_message(msg);
        let Some((slot, login)) =
            self.acquire(|r| &r.login, DomainType::Login, request, msg.stream_id)?
        else {
            return Ok(());
        };
        self.login = Some(slot);

        let rtt = login.rtt_supported && self.registries.rtt_enabled;
        let mut refresh = Message::refresh(
            login.stream_id,
            DomainType::Login,
            State::open_ok("Login accepted by host"),
        )
        .with_name(login.user_name.clone());
        refresh.flags.rtt = rtt;
        self.write(&refresh)?;

        if rtt {
            self.rtt.register(self.channel.id(), login.stream_id);
        }
        log::info!(
            "[SESSION] {} login '{}' on stream {}",
            self.channel.id(),
            login.user_name,
            login.stream_id
        );
        self.events.push_back(ProviderEvent::LoginAccepted {
            stream_id: login.stream_id,
            user_name: login.user_name,
        });
        Ok(())
    }

    fn on_directory_request(&mut self, msg: &Message) -> Result<(), SessionError> {
        let request = DirectoryRequest::from_message(msg);
        if let Some((_, directory)) =
            self.acquire(|r| &r.directory, DomainType::Source, request, msg.stream_id)?
        {
            self.events.push_back(ProviderEvent::DirectoryRequested {
                stream_id: directory.stream_id,
                filter: directory.filter,
            });
        }
        Ok(())
    }

    fn on_dictionary_request(&mut self, msg: &Message) -> Result<(), SessionError> {
        let request = DictionaryRequest::from_message(msg, self.registries.dictionary_names.clone());
        if let Some((_, dictionary)) =
            self.acquire(|r| &r.dictionary, DomainType::Dictionary, request, msg.stream_id)?
        {
            self.events.push_back(ProviderEvent::DictionaryRequested {
                stream_id: dictionary.stream_id,
                name: dictionary.name,
            });
        }
        Ok(())
    }

    fn on_item_request(&mut self, msg: &Message) -> Result<(), SessionError> {
        if self.login.is_none() {
            return self.reject(msg.domain, msg.stream_id, &ItemReject::LoginRequired);
        }
        if msg.flags.batch && !msg.batch_names.is_empty() {
            return self.on_batch_request(msg);
        }

        let name = msg.name.clone().unwrap_or_default();
        match self.open_item(msg.stream_id, msg.domain, &name, msg.flags) {
            Ok(reissue) => {
                self.events.push_back(ProviderEvent::ItemOpened {
                    stream_id: msg.stream_id,
                    domain: msg.domain,
                    name,
                    reissue,
                });
                Ok(())
            }
            Err(reason) => self.reject(msg.domain, msg.stream_id, &reason),
        }
    }

    /// Items of a batch take the stream ids following the batch stream,
    /// which is closed once every item has been handled.
    fn on_batch_request(&mut self, msg: &Message) -> Result<(), SessionError> {
        let total = msg.batch_names.len();
        let flags = MsgFlags {
            batch: false,
            ..msg.flags
        };
        let mut opened = 0;

        for (i, name) in msg.batch_names.iter().enumerate() {
            let Some(stream_id) = msg.stream_id.checked_add(1 + i as i32) else {
                break;
            };
            match self.open_item(stream_id, msg.domain, name, flags) {
                Ok(reissue) => {
                    opened += 1;
                    self.events.push_back(ProviderEvent::ItemOpened {
                        stream_id,
                        domain: msg.domain,
                        name: name.clone(),
                        reissue,
                    });
                }
                Err(reason) => self.reject(msg.domain, stream_id, &reason)?,
            }
        }

        let state = State::new(
            StreamState::Closed,
            DataState::Ok,
            StatusCode::None,
            format!("Processed {} of {} item(s) from batch request", opened, total),
        );
        self.write(&Message::status(msg.stream_id, msg.domain, state))
    }

    /// Returns true when the stream was already open on the same item.
    fn open_item(
        &self,
        stream_id: i32,
        domain: DomainType,
        name: &str,
        flags: MsgFlags,
    ) -> Result<bool, ItemReject> {
        if name.is_empty() || matches!(domain, DomainType::Other(_)) {
            return Err(ItemReject::ItemNotSupported);
        }
        if self
            .registries
            .is_admin_stream(self.channel.id(), stream_id)
        {
            return Err(ItemReject::StreamAlreadyInUse);
        }
        if let Some(entry) = self.items.get(stream_id) {
            return if entry.domain == domain && entry.name == name {
                Ok(true)
            } else {
                Err(ItemReject::StreamAlreadyInUse)
            };
        }
        self.items.add_with_id(stream_id, domain, name, flags)?;
        Ok(false)
    }
}

impl fmt::Debug for ProviderSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSession")
            .field("channel", &self.channel.id())
            .field("state", &self.channel.state())
            .field("login", &self.login)
            .field("items", &self.items.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{filter, HeaderCodec};
    use crate::transport::byte_stream::mock::MockStream;
    use crate::transport::{ChannelOptions, FrameCodec, HandshakeFrame, DEFAULT_MAX_MESSAGE_SIZE};

    struct Peer {
        stream: MockStream,
        codec: FrameCodec,
    }

    impl Peer {
        fn send(&self, msg: &Message) {
            let mut stream = self.stream.clone();
            std::io::Write::write_all(
                &mut stream,
                &FrameCodec::encode(&HeaderCodec.encode(msg).unwrap()),
            )
            .unwrap();
        }

        /// Send `msg` with its last `cut` bytes missing.
        fn send_truncated(&self, msg: &Message, cut: usize) {
            let bytes = HeaderCodec.encode(msg).unwrap();
            let mut stream = self.stream.clone();
            std::io::Write::write_all(
                &mut stream,
                &FrameCodec::encode(&bytes[..bytes.len() - cut]),
            )
            .unwrap();
        }

        fn recv(&mut self) -> Vec<Message> {
            let mut out = Vec::new();
            let mut stream = self.stream.clone();
            while let Ok(Some(payload)) = self.codec.decode(&mut stream) {
                if let Ok(msg) = HeaderCodec.decode(&payload) {
                    out.push(msg);
                }
            }
            out
        }
    }

    fn setup(config: SessionConfig) -> (ProviderSession, Peer, Arc<ProviderRegistries>) {
        let registries = Arc::new(ProviderRegistries::from_config(&config));
        let (session, peer) = accept(&config, registries.clone(), 1);
        (session, peer, registries)
    }

    fn accept(
        config: &SessionConfig,
        registries: Arc<ProviderRegistries>,
        index: u32,
    ) -> (ProviderSession, Peer) {
        let (client, server) = MockStream::pair();
        let channel = Channel::accept(
            ChannelId::new(index, 0),
            Box::new(server),
            ChannelOptions::from_config(config),
        );
        let mut session = ProviderSession::new(channel, registries, Arc::new(HeaderCodec));

        let mut stream = client.clone();
        let request = HandshakeFrame::Request(config.connect_params()).encode();
        std::io::Write::write_all(&mut stream, &FrameCodec::encode(&request)).unwrap();
        session.poll(Instant::now()).unwrap();
        assert!(session.channel().is_active());

        let peer = Peer {
            stream: client,
            codec: FrameCodec::new(DEFAULT_MAX_MESSAGE_SIZE),
        };
        (session, peer)
    }

    fn login(session: &mut ProviderSession, peer: &mut Peer, user: &str) {
        peer.send(&LoginRequest::new(1, user).to_message());
        session.poll(Instant::now()).unwrap();
        peer.recv();
        session.drain_events();
    }

    #[test]
    fn test_login_accepted_sends_refresh() {
        let (mut session, mut peer, registries) = setup(SessionConfig::default());
        assert!(matches!(
            session.drain_events().as_slice(),
            [ProviderEvent::ChannelUp(_)]
        ));

        peer.send(&LoginRequest::new(1, "user1").to_message());
        session.poll(Instant::now()).unwrap();

        let replies = peer.recv();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].class, MsgClass::Refresh);
        assert!(replies[0].state.as_ref().is_some_and(State::is_open_ok));
        assert_eq!(
            session.drain_events(),
            vec![ProviderEvent::LoginAccepted {
                stream_id: 1,
                user_name: "user1".into()
            }]
        );
        assert_eq!(registries.login.in_use(), 1);
        assert_eq!(session.login().map(|l| l.user_name), Some("user1".into()));
    }

    #[test]
    fn test_login_mismatch_rejected_once() {
        let (mut session, mut peer, registries) = setup(SessionConfig::default());
        login(&mut session, &mut peer, "user1");

        peer.send(&LoginRequest::new(1, "user2").to_message());
        session.poll(Instant::now()).unwrap();

        let replies = peer.recv();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].class, MsgClass::Status);
        assert_eq!(
            replies[0].state,
            Some(LoginReject::NameMismatch.status(1))
        );
        assert!(session.channel().is_active());
        assert_eq!(registries.login.in_use(), 1);
        assert_eq!(session.login().map(|l| l.user_name), Some("user1".into()));
    }

    #[test]
    fn test_second_login_stream_refused() {
        let (mut session, mut peer, _) = setup(SessionConfig::default());
        login(&mut session, &mut peer, "user1");

        peer.send(&LoginRequest::new(9, "user1").to_message());
        session.poll(Instant::now()).unwrap();

        let events = session.drain_events();
        assert!(matches!(
            &events[..],
            [ProviderEvent::Rejected { stream_id: 9, state, .. }]
                if state.code == StatusCode::TooManyItems
        ));
    }

    #[test]
    fn test_unknown_dictionary_not_found() {
        let (mut session, mut peer, registries) = setup(SessionConfig::default());
        login(&mut session, &mut peer, "user1");

        peer.send(&Message::request(3, DomainType::Dictionary, "RWFFld"));
        peer.send(&Message::request(4, DomainType::Dictionary, "Bogus"));
        session.poll(Instant::now()).unwrap();

        let events = session.drain_events();
        assert_eq!(
            events[0],
            ProviderEvent::DictionaryRequested {
                stream_id: 3,
                name: "RWFFld".into()
            }
        );
        assert!(matches!(
            &events[1],
            ProviderEvent::Rejected { stream_id: 4, state, .. }
                if state.code == StatusCode::NotFound && state.stream_state == StreamState::Closed
        ));
        assert_eq!(registries.dictionary.in_use(), 1);
    }

    #[test]
    fn test_truncated_admin_requests_get_one_status() {
        let (mut session, mut peer, registries) = setup(SessionConfig::default());
        session.drain_events();

        peer.send_truncated(&LoginRequest::new(1, "user1").to_message(), 3);
        session.poll(Instant::now()).unwrap();
        let replies = peer.recv();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].class, MsgClass::Status);
        assert_eq!(replies[0].domain, DomainType::Login);
        let state = replies[0].state.clone().unwrap();
        assert_eq!(state.stream_state, StreamState::ClosedRecover);
        assert_eq!(state.code, StatusCode::UsageError);
        assert!(state
            .text
            .starts_with("Login request rejected for stream id 1 - decode failed"));
        assert_eq!(registries.login.in_use(), 0);

        login(&mut session, &mut peer, "user1");

        let directory = DirectoryRequest::new(2, filter::DIRECTORY_MINIMUM).to_message();
        peer.send_truncated(&directory, 3);
        peer.send_truncated(&Message::request(3, DomainType::Dictionary, "RWFFld"), 3);
        session.poll(Instant::now()).unwrap();

        let replies = peer.recv();
        assert_eq!(replies.len(), 2);
        assert_eq!(
            (replies[0].domain, replies[0].stream_id),
            (DomainType::Source, 2)
        );
        assert!(replies[0]
            .state
            .as_ref()
            .is_some_and(|s| s.text.contains("decode failed")));
        assert_eq!(
            (replies[1].domain, replies[1].stream_id),
            (DomainType::Dictionary, 3)
        );
        assert!(replies[1]
            .state
            .as_ref()
            .is_some_and(|s| s.code == StatusCode::UsageError
                && s.stream_state == StreamState::Closed));

        let rejected = session
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, ProviderEvent::Rejected { .. }))
            .count();
        assert_eq!(rejected, 2);
        assert_eq!(registries.directory.in_use(), 0);
        assert_eq!(registries.dictionary.in_use(), 0);
        assert!(session.channel().is_active());
    }

    #[test]
    fn test_item_before_login_is_usage_error() {
        let (mut session, mut peer, _) = setup(SessionConfig::default());
        session.drain_events();

        peer.send(&Message::request(5, DomainType::MarketPrice, "IBM.N"));
        session.poll(Instant::now()).unwrap();

        let replies = peer.recv();
        assert_eq!(replies.len(), 1);
        let state = replies[0].state.clone().unwrap();
        assert_eq!(state.code, StatusCode::UsageError);
        assert_eq!(state.stream_state, StreamState::Closed);
        assert!(session.items().is_empty());
    }

    #[test]
    fn test_item_streams() {
        let (mut session, mut peer, _) = setup(SessionConfig::default());
        login(&mut session, &mut peer, "user1");

        peer.send(&Message::request(5, DomainType::MarketPrice, "A"));
        peer.send(&Message::request(5, DomainType::MarketPrice, "A"));
        peer.send(&Message::request(5, DomainType::MarketPrice, "B"));
        peer.send(&Message::request(6, DomainType::MarketPrice, "A"));
        peer.send(&Message::request(1, DomainType::MarketPrice, "C"));
        session.poll(Instant::now()).unwrap();

        let codes: Vec<_> = session
            .drain_events()
            .into_iter()
            .map(|e| match e {
                ProviderEvent::ItemOpened { reissue, .. } => Ok(reissue),
                ProviderEvent::Rejected { state, .. } => Err(state.code),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            codes,
            vec![
                Ok(false),
                Ok(true),
                Err(StatusCode::UsageError),
                Err(StatusCode::AlreadyOpen),
                Err(StatusCode::UsageError),
            ]
        );
        assert_eq!(session.items().len(), 1);

        peer.send(&Message::close(5, DomainType::MarketPrice));
        session.poll(Instant::now()).unwrap();
        assert_eq!(
            session.drain_events(),
            vec![ProviderEvent::ItemClosed { stream_id: 5 }]
        );
        assert!(session.items().is_empty());
    }

    #[test]
    fn test_item_count_reached() {
        let config = SessionConfig {
            max_items: 1,
            ..SessionConfig::default()
        };
        let (mut session, mut peer, _) = setup(config);
        login(&mut session, &mut peer, "user1");

        peer.send(&Message::request(5, DomainType::MarketPrice, "A"));
        peer.send(&Message::request(6, DomainType::MarketPrice, "B"));
        session.poll(Instant::now()).unwrap();

        let replies = peer.recv();
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0].state,
            Some(ItemReject::ItemCountReached.status(6))
        );
        assert_eq!(
            replies[0].state.as_ref().map(|s| s.text.as_str()),
            Some("Item request rejected for stream id 6- item count reached for this channel")
        );
    }

    #[test]
    fn test_batch_request_expands() {
        let (mut session, mut peer, _) = setup(SessionConfig::default());
        login(&mut session, &mut peer, "user1");

        peer.send(&Message::batch_request(
            10,
            DomainType::MarketPrice,
            vec!["A".into(), "B".into()],
        ));
        session.poll(Instant::now()).unwrap();

        let opened: Vec<i32> = session
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                ProviderEvent::ItemOpened { stream_id, .. } => Some(stream_id),
                _ => None,
            })
            .collect();
        assert_eq!(opened, vec![11, 12]);

        let replies = peer.recv();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].stream_id, 10);
        assert!(replies[0]
            .state
            .as_ref()
            .is_some_and(|s| s.stream_state == StreamState::Closed));
    }

    #[test]
    fn test_disconnect_releases_slots() {
        let config = SessionConfig::default();
        let (mut session, mut peer, registries) = setup(config.clone());
        let (mut other, mut other_peer) = accept(&config, registries.clone(), 2);
        login(&mut session, &mut peer, "user1");
        login(&mut other, &mut other_peer, "user2");

        peer.send(&DirectoryRequest::new(2, filter::DIRECTORY_MINIMUM).to_message());
        session.poll(Instant::now()).unwrap();
        assert_eq!(registries.login.in_use(), 2);
        assert_eq!(registries.directory.in_use(), 1);

        peer.stream.disconnect();
        session.poll(Instant::now()).unwrap();

        assert!(session.is_closed());
        assert!(session.drain_events().contains(&ProviderEvent::Closed));
        assert_eq!(registries.login.in_use(), 1);
        assert_eq!(registries.directory.in_use(), 0);
        assert!(other.login().is_some());
    }

    #[test]
    fn test_rtt_probe_and_reply() {
        let config = SessionConfig::default().with_rtt(true);
        let (mut session, mut peer, _) = setup(config);

        peer.send(&LoginRequest::new(1, "user1").with_rtt(true).to_message());
        let start = Instant::now();
        session.poll(start).unwrap();

        let sent = peer.recv();
        assert!(sent[0].flags.rtt);
        let probe = sent
            .iter()
            .find_map(Message::rtt_ticks)
            .expect("probe sent on first drive");
        assert!(session.rtt_state().is_some());

        peer.send(&Message::rtt(1, probe));
        session.poll(start + Duration::from_millis(3)).unwrap();

        assert!(session
            .drain_events()
            .iter()
            .any(|e| matches!(e, ProviderEvent::RttLatency(_))));
        assert!(session
            .rtt_state()
            .is_some_and(|s| s.has_round_trip_latency));
    }
}
