use bitflags::bitflags;

bitflags! {
    /// https://httpwg.org/specs/rfc7540.html#DATA
    #[repr(transparent)]
    pub struct DataFlags: u8 {
        /// Last frame this endpoint will send on the stream.
        const END_STREAM = 0x1;
        /// Pad Length field and trailing padding are present.
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#HEADERS
    #[repr(transparent)]
    pub struct HeadersFlags: u8 {
        /// Last header block on the stream. Takes effect once the block is
        /// complete, so CONTINUATION frames may still follow.
        const END_STREAM = 0x1;
        /// The frame carries an entire header block; no CONTINUATION follows.
        /// Without this flag the very next frame on the connection MUST be a
        /// CONTINUATION for the same stream.
        const END_HEADERS = 0x4;
        /// Pad Length field and trailing padding are present.
        const PADDED = 0x8;
        /// Exclusive flag, stream dependency, and weight are present.
        const PRIORITY = 0x20;
    }

    /// https://httpwg.org/specs/rfc7540.html#SETTINGS
    #[repr(transparent)]
    pub struct SettingsFlags: u8 {
        /// Acknowledges the peer's SETTINGS frame; the payload MUST be empty.
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#PUSH_PROMISE
    #[repr(transparent)]
    pub struct PushPromiseFlags: u8 {
        /// The frame carries an entire header block; no CONTINUATION follows.
        const END_HEADERS = 0x4;
        /// Pad Length field and trailing padding are present.
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#PING
    #[repr(transparent)]
    pub struct PingFlags: u8 {
        /// Marks a PING response. Responses are never themselves answered.
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#CONTINUATION
    #[repr(transparent)]
    pub struct ContinuationFlags: u8 {
        /// Ends the header block. Without it another CONTINUATION MUST follow.
        const END_HEADERS = 0x4;
    }
}

/// Per-type flags of one frame, for code that handles frames generically.
/// Frame types without defined flags use `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::From, derive_more::TryInto)]
pub enum Flags {
    Data(DataFlags),
    Headers(HeadersFlags),
    Settings(SettingsFlags),
    PushPromise(PushPromiseFlags),
    Ping(PingFlags),
    Continuation(ContinuationFlags),
    None,
}
