// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OMM message header model and the codec contract.
//!
//! The session layer never looks inside payloads. It only needs the
//! message class, stream id, domain, item name and stream state, so
//! [`Message`] carries those as typed fields and keeps everything else
//! as opaque bytes.
//!
//! [`HeaderCodec`] is a small self-contained encoding of those header
//! fields. It lets the session layer be driven end to end without a full
//! RWF implementation; production deployments plug their own
//! [`MessageCodec`].
//!
//! # Header layout
//!
//! ```text
//! +-------+--------+-----------+-------+------------+-------+------+-------+---------+
//! | class | domain | stream_id | flags | filter     | state | name | batch | payload |
//! | u8    | u8     | i32 BE    | u8    | u32 BE     | opt   | opt  | list  | u32+var |
//! +-------+--------+-----------+-------+------------+-------+------+-------+---------+
//! ```

use std::fmt;

use thiserror::Error;

// ============================================================================
// Message class
// ============================================================================

/// Message class carried by every OMM message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MsgClass {
    Request,
    Refresh,
    Status,
    Update,
    Close,
    Generic,
}

impl MsgClass {
    pub fn to_u8(self) -> u8 {
        match self {
            MsgClass::Request => 1,
            MsgClass::Refresh => 2,
            MsgClass::Status => 3,
            MsgClass::Update => 4,
            MsgClass::Close => 5,
            MsgClass::Generic => 7,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MsgClass::Request),
            2 => Some(MsgClass::Refresh),
            3 => Some(MsgClass::Status),
            4 => Some(MsgClass::Update),
            5 => Some(MsgClass::Close),
            7 => Some(MsgClass::Generic),
            _ => None,
        }
    }
}

impl fmt::Display for MsgClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MsgClass::Request => "Request",
            MsgClass::Refresh => "Refresh",
            MsgClass::Status => "Status",
            MsgClass::Update => "Update",
            MsgClass::Close => "Close",
            MsgClass::Generic => "Generic",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Domain type
// ============================================================================

/// Domain model of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DomainType {
    Login,
    Source,
    Dictionary,
    MarketPrice,
    MarketByOrder,
    MarketByPrice,
    SymbolList,
    Other(u8),
}

impl DomainType {
    pub fn to_u8(self) -> u8 {
        match self {
            DomainType::Login => 1,
            DomainType::Source => 4,
            DomainType::Dictionary => 5,
            DomainType::MarketPrice => 6,
            DomainType::MarketByOrder => 7,
            DomainType::MarketByPrice => 8,
            DomainType::SymbolList => 10,
            DomainType::Other(v) => v,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => DomainType::Login,
            4 => DomainType::Source,
            5 => DomainType::Dictionary,
            6 => DomainType::MarketPrice,
            7 => DomainType::MarketByOrder,
            8 => DomainType::MarketByPrice,
            10 => DomainType::SymbolList,
            v => DomainType::Other(v),
        }
    }

    /// Administrative domains are handled by the bootstrap handlers, not
    /// the item watchlist.
    pub fn is_administrative(self) -> bool {
        matches!(
            self,
            DomainType::Login | DomainType::Source | DomainType::Dictionary
        )
    }
}

impl fmt::Display for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainType::Login => write!(f, "Login"),
            DomainType::Source => write!(f, "Source"),
            DomainType::Dictionary => write!(f, "Dictionary"),
            DomainType::MarketPrice => write!(f, "MarketPrice"),
            DomainType::MarketByOrder => write!(f, "MarketByOrder"),
            DomainType::MarketByPrice => write!(f, "MarketByPrice"),
            DomainType::SymbolList => write!(f, "SymbolList"),
            DomainType::Other(v) => write!(f, "Domain({})", v),
        }
    }
}

// ============================================================================
// Stream state
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StreamState {
    #[default]
    Unspecified,
    Open,
    NonStreaming,
    ClosedRecover,
    Closed,
    Redirected,
}

impl StreamState {
    /// The stream will deliver no further messages.
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            StreamState::Closed | StreamState::ClosedRecover | StreamState::Redirected
        )
    }

    fn to_u8(self) -> u8 {
        match self {
            StreamState::Unspecified => 0,
            StreamState::Open => 1,
            StreamState::NonStreaming => 2,
            StreamState::ClosedRecover => 3,
            StreamState::Closed => 4,
            StreamState::Redirected => 5,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StreamState::Unspecified),
            1 => Some(StreamState::Open),
            2 => Some(StreamState::NonStreaming),
            3 => Some(StreamState::ClosedRecover),
            4 => Some(StreamState::Closed),
            5 => Some(StreamState::Redirected),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DataState {
    #[default]
    NoChange,
    Ok,
    Suspect,
}

impl DataState {
    fn to_u8(self) -> u8 {
        match self {
            DataState::NoChange => 0,
            DataState::Ok => 1,
            DataState::Suspect => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DataState::NoChange),
            1 => Some(DataState::Ok),
            2 => Some(DataState::Suspect),
            _ => None,
        }
    }
}

/// Status codes used by the session layer when rejecting requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StatusCode {
    #[default]
    None,
    NotFound,
    NotAuthorized,
    InvalidArgument,
    UsageError,
    AlreadyOpen,
    TooManyItems,
    NotOpen,
}

impl StatusCode {
    fn to_u8(self) -> u8 {
        match self {
            StatusCode::None => 0,
            StatusCode::NotFound => 1,
            StatusCode::NotAuthorized => 3,
            StatusCode::InvalidArgument => 4,
            StatusCode::UsageError => 5,
            StatusCode::AlreadyOpen => 10,
            StatusCode::TooManyItems => 17,
            StatusCode::NotOpen => 21,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StatusCode::None),
            1 => Some(StatusCode::NotFound),
            3 => Some(StatusCode::NotAuthorized),
            4 => Some(StatusCode::InvalidArgument),
            5 => Some(StatusCode::UsageError),
            10 => Some(StatusCode::AlreadyOpen),
            17 => Some(StatusCode::TooManyItems),
            21 => Some(StatusCode::NotOpen),
            _ => None,
        }
    }
}

/// Stream and data state reported on refresh and status messages.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct State {
    pub stream_state: StreamState,
    pub data_state: DataState,
    pub code: StatusCode,
    pub text: String,
}

impl State {
    pub fn new(
        stream_state: StreamState,
        data_state: DataState,
        code: StatusCode,
        text: impl Into<String>,
    ) -> Self {
        Self {
            stream_state,
            data_state,
            code,
            text: text.into(),
        }
    }

    /// Open/Ok state.
    pub fn open_ok(text: impl Into<String>) -> Self {
        Self::new(StreamState::Open, DataState::Ok, StatusCode::None, text)
    }

    pub fn is_open_ok(&self) -> bool {
        self.stream_state == StreamState::Open && self.data_state == DataState::Ok
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?}/{:?} \"{}\"",
            self.stream_state, self.data_state, self.code, self.text
        )
    }
}

// ============================================================================
// Flags
// ============================================================================

/// Request flags relevant to the session layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MsgFlags {
    pub streaming: bool,
    pub private_stream: bool,
    pub batch: bool,
    /// Login only: the sender supports round-trip latency monitoring.
    pub rtt: bool,
}

impl MsgFlags {
    const STREAMING: u8 = 0x01;
    const PRIVATE_STREAM: u8 = 0x02;
    const BATCH: u8 = 0x04;
    const RTT: u8 = 0x08;

    pub fn streaming() -> Self {
        Self {
            streaming: true,
            ..Self::default()
        }
    }

    fn to_bits(self) -> u8 {
        let mut bits = 0;
        if self.streaming {
            bits |= Self::STREAMING;
        }
        if self.private_stream {
            bits |= Self::PRIVATE_STREAM;
        }
        if self.batch {
            bits |= Self::BATCH;
        }
        if self.rtt {
            bits |= Self::RTT;
        }
        bits
    }

    fn from_bits(bits: u8) -> Self {
        Self {
            streaming: bits & Self::STREAMING != 0,
            private_stream: bits & Self::PRIVATE_STREAM != 0,
            batch: bits & Self::BATCH != 0,
            rtt: bits & Self::RTT != 0,
        }
    }
}

/// Directory filter bits.
pub mod filter {
    pub const INFO: u32 = 0x01;
    pub const STATE: u32 = 0x02;
    pub const GROUP: u32 = 0x04;
    pub const LOAD: u32 = 0x08;
    pub const DATA: u32 = 0x10;
    pub const LINK: u32 = 0x20;

    /// Filter a directory request must at least carry.
    pub const DIRECTORY_MINIMUM: u32 = INFO | STATE | GROUP;
}

// ============================================================================
// Message
// ============================================================================

/// Header view of an OMM message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub class: MsgClass,
    pub stream_id: i32,
    pub domain: DomainType,
    pub name: Option<String>,
    /// Item names of a batch request; empty otherwise.
    pub batch_names: Vec<String>,
    pub filter: u32,
    pub flags: MsgFlags,
    pub state: Option<State>,
    pub payload: Vec<u8>,
}

impl Message {
    fn base(class: MsgClass, stream_id: i32, domain: DomainType) -> Self {
        Self {
            class,
            stream_id,
            domain,
            name: None,
            batch_names: Vec::new(),
            filter: 0,
            flags: MsgFlags::default(),
            state: None,
            payload: Vec::new(),
        }
    }

    /// Streaming request for a single item.
    pub fn request(stream_id: i32, domain: DomainType, name: impl Into<String>) -> Self {
        let mut msg = Self::base(MsgClass::Request, stream_id, domain);
        msg.name = Some(name.into());
        msg.flags = MsgFlags::streaming();
        msg
    }

    /// Batch request. The stream id is that of the batch itself; items get
    /// the following ids.
    pub fn batch_request(stream_id: i32, domain: DomainType, names: Vec<String>) -> Self {
        let mut msg = Self::base(MsgClass::Request, stream_id, domain);
        msg.batch_names = names;
        msg.flags = MsgFlags {
            streaming: true,
            batch: true,
            ..MsgFlags::default()
        };
        msg
    }

    pub fn refresh(stream_id: i32, domain: DomainType, state: State) -> Self {
        let mut msg = Self::base(MsgClass::Refresh, stream_id, domain);
        msg.state = Some(state);
        msg
    }

    pub fn status(stream_id: i32, domain: DomainType, state: State) -> Self {
        let mut msg = Self::base(MsgClass::Status, stream_id, domain);
        msg.state = Some(state);
        msg
    }

    pub fn close(stream_id: i32, domain: DomainType) -> Self {
        Self::base(MsgClass::Close, stream_id, domain)
    }

    /// RTT probe on the login stream, stamped with `ticks`.
    pub fn rtt(stream_id: i32, ticks: u64) -> Self {
        let mut msg = Self::base(MsgClass::Generic, stream_id, DomainType::Login);
        msg.flags.rtt = true;
        msg.payload = ticks.to_be_bytes().to_vec();
        msg
    }

    /// Ticks carried by an RTT probe, if this is one.
    pub fn rtt_ticks(&self) -> Option<u64> {
        if self.class != MsgClass::Generic || self.domain != DomainType::Login || !self.flags.rtt
        {
            return None;
        }
        let bytes: [u8; 8] = self.payload.get(..8)?.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_filter(mut self, filter: u32) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_flags(mut self, flags: MsgFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }
}

// ============================================================================
// Codec contract
// ============================================================================

/// Codec failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("buffer truncated at offset {0}")]
    Truncated(usize),

    #[error("unknown message class {0}")]
    UnknownClass(u8),

    #[error("invalid state field at offset {0}")]
    InvalidState(usize),

    #[error("string at offset {0} is not valid UTF-8")]
    InvalidUtf8(usize),

    #[error("field too long to encode: {0} bytes")]
    FieldTooLong(usize),

    /// The header decoded but the rest of the message did not.
    #[error("{class} on {domain} stream {stream_id}: {source}")]
    Body {
        class: MsgClass,
        domain: DomainType,
        stream_id: i32,
        source: Box<CodecError>,
    },
}

impl CodecError {
    /// Class, domain and stream id of a message whose body failed to
    /// decode.
    pub fn header(&self) -> Option<(MsgClass, DomainType, i32)> {
        match self {
            CodecError::Body {
                class,
                domain,
                stream_id,
                ..
            } => Some((*class, *domain, *stream_id)),
            _ => None,
        }
    }
}

/// Encode/decode contract between the session layer and a wire format.
pub trait MessageCodec: Send + Sync {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, buf: &[u8]) -> Result<Message, CodecError>;
}

/// Header-only codec, see module docs for the layout.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderCodec;

impl MessageCodec for HeaderCodec {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(32 + msg.payload.len());
        buf.push(msg.class.to_u8());
        buf.push(msg.domain.to_u8());
        buf.extend_from_slice(&msg.stream_id.to_be_bytes());
        buf.push(msg.flags.to_bits());
        buf.extend_from_slice(&msg.filter.to_be_bytes());

        match &msg.state {
            Some(state) => {
                buf.push(1);
                buf.push(state.stream_state.to_u8());
                buf.push(state.data_state.to_u8());
                buf.push(state.code.to_u8());
                put_str(&mut buf, &state.text)?;
            }
            None => buf.push(0),
        }

        match &msg.name {
            Some(name) => {
                buf.push(1);
                put_str(&mut buf, name)?;
            }
            None => buf.push(0),
        }

        let count = u16::try_from(msg.batch_names.len())
            .map_err(|_| CodecError::FieldTooLong(msg.batch_names.len()))?;
        buf.extend_from_slice(&count.to_be_bytes());
        for name in &msg.batch_names {
            put_str(&mut buf, name)?;
        }

        let len = u32::try_from(msg.payload.len())
            .map_err(|_| CodecError::FieldTooLong(msg.payload.len()))?;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&msg.payload);
        Ok(buf)
    }

    fn decode(&self, buf: &[u8]) -> Result<Message, CodecError> {
        let mut r = Reader { buf, pos: 0 };

        let class_byte = r.u8()?;
        let class = MsgClass::from_u8(class_byte).ok_or(CodecError::UnknownClass(class_byte))?;
        let domain = DomainType::from_u8(r.u8()?);
        let stream_id = r.u32()? as i32;
        let flags = MsgFlags::from_bits(r.u8()?);
        let filter = r.u32()?;

        let (state, name, batch_names, payload) =
            decode_body(&mut r).map_err(|e| CodecError::Body {
                class,
                domain,
                stream_id,
                source: Box::new(e),
            })?;

        Ok(Message {
            class,
            stream_id,
            domain,
            name,
            batch_names,
            filter,
            flags,
            state,
            payload,
        })
    }
}

type DecodedBody = (Option<State>, Option<String>, Vec<String>, Vec<u8>);

fn decode_body(r: &mut Reader<'_>) -> Result<DecodedBody, CodecError> {
    let state = if r.u8()? != 0 {
        let at = r.pos;
        let stream_state = StreamState::from_u8(r.u8()?).ok_or(CodecError::InvalidState(at))?;
        let data_state = DataState::from_u8(r.u8()?).ok_or(CodecError::InvalidState(at))?;
        let code = StatusCode::from_u8(r.u8()?).ok_or(CodecError::InvalidState(at))?;
        let text = r.string()?;
        Some(State {
            stream_state,
            data_state,
            code,
            text,
        })
    } else {
        None
    };

    let name = if r.u8()? != 0 { Some(r.string()?) } else { None };

    let count = r.u16()?;
    let mut batch_names = Vec::with_capacity(count as usize);
    for _ in 0..count {
        batch_names.push(r.string()?);
    }

    let len = r.u32()? as usize;
    let payload = r.bytes(len)?.to_vec();
    Ok((state, name, batch_names, payload))
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len()).map_err(|_| CodecError::FieldTooLong(s.len()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated(self.pos))?;
        let out = self
            .buf
            .get(self.pos..end)
            .ok_or(CodecError::Truncated(self.pos))?;
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        let at = self.pos;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8(at))
    }
}

// ============================================================================
// Tests
// ============================================================================
