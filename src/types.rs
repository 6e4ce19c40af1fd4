use num_derive::{FromPrimitive, ToPrimitive};
use std::num::NonZeroU32;

// Safety: value is a const, that can't be zero
pub const U31_MAX: NonZeroU32 = unsafe { NonZeroU32::new_unchecked(u32::MAX >> 1) };

/// Initial flow-control window for new streams and for the connection itself.
pub const DEFAULT_WINDOW: i32 = 65_535;

/// The 24 octets a client transmits before anything else on the connection.
pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub type StreamId = u32;
pub type NonZeroStreamId = NonZeroU32;

/// Header fields in transmission order. Order matters for pseudo-header
/// placement and for HPACK dynamic-table state.
pub type Headers = Vec<(String, String)>;

/// Which end of the connection we are. Decides stream-id parity and whether
/// the preface is sent or verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// First stream id this side may allocate.
    pub fn first_local_id(self) -> StreamId {
        match self {
            Self::Client => 1,
            Self::Server => 2,
        }
    }

    /// True if `id` could have been initiated by the peer.
    pub fn is_peer_initiated(self, id: StreamId) -> bool {
        match self {
            Self::Client => id % 2 == 0,
            Self::Server => id % 2 == 1,
        }
    }
}

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorType {
    /// Not an error; GOAWAY carries this on graceful shutdown.
    NoError = 0x0,
    /// Unspecific protocol violation.
    ProtocolError = 0x1,
    /// Unexpected internal failure.
    InternalError = 0x2,
    /// The peer violated the flow-control protocol.
    FlowControlError = 0x3,
    /// SETTINGS was not acknowledged in time.
    SettingsTimeout = 0x4,
    /// A frame arrived after the stream was half-closed.
    StreamClosed = 0x5,
    /// A frame had an invalid size.
    FrameSizeError = 0x6,
    /// The stream was refused before any application processing; safe to retry.
    RefusedStream = 0x7,
    /// The stream is no longer needed.
    Cancel = 0x8,
    /// The header compression context cannot be maintained.
    CompressionError = 0x9,
    /// A CONNECT tunnel was reset or abnormally closed.
    ConnectError = 0xa,
    /// The peer is generating excessive load.
    EnhanceYourCalm = 0xb,
    /// Transport properties do not meet minimum security requirements.
    InadequateSecurity = 0xc,
    /// HTTP/1.1 is required instead.
    Http11Required = 0xd,
}

impl ErrorType {
    /// Unknown codes on the wire are legal; they surface as INTERNAL_ERROR.
    pub fn from_wire(code: u32) -> Self {
        <Self as num_traits::FromPrimitive>::from_u32(code).unwrap_or(Self::InternalError)
    }
}

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    enum_map::Enum,
)]
#[repr(u16)]
#[non_exhaustive]
pub enum SettingsParameter {
    /// Maximum size in octets of the header compression table used to decode
    /// header blocks on the receiving side. Initial value 4,096.
    HeaderTableSize = 0x1,
    /// 0 disables server push; anything other than 0 or 1 is a PROTOCOL_ERROR.
    EnablePush = 0x2,
    /// Cap on simultaneously open streams the sender permits the receiver to
    /// create.
    MaxConcurrentStreams = 0x3,
    /// Initial stream-level flow-control window. Values above 2^31-1 are a
    /// FLOW_CONTROL_ERROR; a change retroactively adjusts every open stream.
    InitialWindowSize = 0x4,
    /// Largest frame payload the sender is willing to receive; must stay
    /// within 16,384..=16,777,215.
    MaxFrameSize = 0x5,
    /// Advisory cap on the uncompressed size of a header list.
    MaxHeaderListSize = 0x6,
}

#[derive(thiserror::Error, Debug)]
pub enum FrameDecodeError {
    #[error("payload is shorter than expected")]
    PayloadTooShort,
    #[error("payload length {0} is invalid for the frame type")]
    BadPayloadLength(usize),
    #[error("SETTINGS payload length {0} is not a multiple of 6")]
    BadSettingsLength(usize),
    #[error("SETTINGS ACK with a non-empty payload")]
    SettingsAckWithPayload,
    #[error("unexpected 0 stream ID")]
    ZeroStreamId,
    #[error("unexpected non-zero stream ID {0}")]
    UnexpectedStreamId(StreamId),
    #[error("unexpected 0 window increment")]
    ZeroWindowIncrement,
    #[error("pad length {pad} exceeds the {len} remaining payload bytes")]
    BadPadding { pad: usize, len: usize },
    #[error("frame of {len} bytes exceeds the advertised maximum of {max}")]
    Oversized { len: usize, max: usize },
}

impl FrameDecodeError {
    /// Wire code used when this failure is escalated to a connection error.
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::PayloadTooShort
            | Self::BadPayloadLength(_)
            | Self::BadSettingsLength(_)
            | Self::SettingsAckWithPayload
            | Self::Oversized { .. } => ErrorType::FrameSizeError,
            Self::ZeroStreamId
            | Self::UnexpectedStreamId(_)
            | Self::ZeroWindowIncrement
            | Self::BadPadding { .. } => ErrorType::ProtocolError,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CompressionError {
    #[error("truncated header block")]
    Truncated,
    #[error("invalid table index {0}")]
    InvalidIndex(usize),
    #[error("length prefix does not fit in a machine integer")]
    IntegerOverflow,
    #[error("huffman-coded string literal")]
    HuffmanNotSupported,
    #[error("dynamic table size update to {size} exceeds the signalled limit {limit}")]
    SizeUpdateTooLarge { size: usize, limit: usize },
}

/// Failure raised while dispatching a frame to a stream. Stream-scoped errors
/// reset that one stream; connection-scoped errors tear the connection down.
#[derive(Debug)]
pub enum StreamError {
    Stream(ErrorType),
    Connection(ErrorType, String),
}

/// Public error type. Wire-visible conditions carry their RFC 7540 code.
#[derive(thiserror::Error, Debug)]
pub enum H2Error {
    #[error("connection error {0:?}: {1}")]
    Connection(ErrorType, String),
    #[error("stream reset ({0:?})")]
    StreamReset(ErrorType),
    #[error("peer is shutting the connection down")]
    GoingAway,
    #[error("request timed out")]
    RequestTimeout,
    #[error("connection closed")]
    Closed,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame decode failed: {0}")]
    FrameDecode(#[from] FrameDecodeError),
    #[error("header block decode failed: {0}")]
    Compression(#[from] CompressionError),
}

impl From<StreamError> for H2Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Stream(code) => Self::StreamReset(code),
            StreamError::Connection(code, msg) => Self::Connection(code, msg),
        }
    }
}
