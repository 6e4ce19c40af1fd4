use crate::{flags::*, types::*};
use bytes::{BufMut, Bytes, BytesMut};
use log::trace;
use num_traits::{FromPrimitive, ToPrimitive};
use std::num::NonZeroU32;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_HEADER_LEN: usize = 9;

/// The fixed 9-byte prefix of every frame: 24-bit length, 8-bit type, 8-bit
/// flags, reserved bit, 31-bit stream id. All integers big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub ty: u8,
    pub flags: u8,
    pub stream_id: StreamId,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameDecodeError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(FrameDecodeError::PayloadTooShort);
        }
        Ok(Self {
            length: u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]),
            ty: bytes[3],
            flags: bytes[4],
            // the reserved bit is ignored on read
            stream_id: u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]])
                & U31_MAX.get(),
        })
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.length.to_be_bytes()[1..]);
        buf.put_u8(self.ty);
        buf.put_u8(self.flags);
        // the reserved bit is written as 0
        buf.put_u32(self.stream_id & U31_MAX.get());
    }
}

/// Exclusive flag, dependency, and weight of a PRIORITY frame or a HEADERS
/// priority prefix. Parsed and stored, nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: StreamId,
    pub weight: u8,
}

impl Priority {
    fn parse(bytes: &[u8]) -> Self {
        let raw = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Self {
            exclusive: raw & !U31_MAX.get() != 0,
            dependency: raw & U31_MAX.get(),
            weight: bytes[4],
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        let mut raw = self.dependency & U31_MAX.get();
        if self.exclusive {
            raw |= !U31_MAX.get();
        }
        buf.put_u32(raw);
        buf.put_u8(self.weight);
    }
}

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
///
/// One variant per frame type, payload fields already interpreted: padding is
/// stripped, multi-byte integers decoded, flags typed. Unknown types are
/// surfaced as [`Frame::Unknown`] so the connection can discard them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream: NonZeroStreamId,
        flags: DataFlags,
        data: Bytes,
    },
    Headers {
        stream: NonZeroStreamId,
        flags: HeadersFlags,
        priority: Option<Priority>,
        fragment: Bytes,
    },
    Priority {
        stream: NonZeroStreamId,
        priority: Priority,
    },
    ResetStream {
        stream: NonZeroStreamId,
        error: ErrorType,
    },
    Settings {
        flags: SettingsFlags,
        params: Vec<(SettingsParameter, u32)>,
    },
    PushPromise {
        stream: NonZeroStreamId,
        flags: PushPromiseFlags,
        promised: NonZeroStreamId,
        fragment: Bytes,
    },
    Ping {
        flags: PingFlags,
        data: [u8; 8],
    },
    GoAway {
        last_stream: StreamId,
        error: ErrorType,
        debug: Bytes,
    },
    WindowUpdate {
        /// 0 applies the increment to the connection window.
        stream: StreamId,
        increment: NonZeroU32,
    },
    Continuation {
        stream: NonZeroStreamId,
        flags: ContinuationFlags,
        fragment: Bytes,
    },
    Unknown {
        ty: u8,
        flags: u8,
        stream: StreamId,
        payload: Bytes,
    },
}

fn require_stream(id: StreamId) -> Result<NonZeroStreamId, FrameDecodeError> {
    NonZeroStreamId::new(id).ok_or(FrameDecodeError::ZeroStreamId)
}

fn require_connection(id: StreamId) -> Result<(), FrameDecodeError> {
    if id == 0 {
        Ok(())
    } else {
        Err(FrameDecodeError::UnexpectedStreamId(id))
    }
}

/// Removes the pad-length prefix and trailing padding. The padding bytes are
/// not data, but they do count against flow control at the call site.
fn strip_padding(mut payload: Bytes, padded: bool) -> Result<Bytes, FrameDecodeError> {
    if !padded {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(FrameDecodeError::PayloadTooShort);
    }
    let pad = payload.split_to(1)[0] as usize;
    if pad >= payload.len() + 1 {
        return Err(FrameDecodeError::BadPadding {
            pad,
            len: payload.len(),
        });
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

impl Frame {
    /// Interprets `payload` according to the parsed 9-byte `header`.
    pub fn parse(header: FrameHeader, payload: Bytes) -> Result<Self, FrameDecodeError> {
        if payload.len() != header.length as usize {
            return Err(FrameDecodeError::BadPayloadLength(payload.len()));
        }
        let Some(ty) = FrameType::from_u8(header.ty) else {
            trace!("unknown frame type {:#x}", header.ty);
            return Ok(Self::Unknown {
                ty: header.ty,
                flags: header.flags,
                stream: header.stream_id,
                payload,
            });
        };
        match ty {
            FrameType::Data => {
                let stream = require_stream(header.stream_id)?;
                let flags = DataFlags::from_bits_truncate(header.flags);
                let data = strip_padding(payload, flags.contains(DataFlags::PADDED))?;
                Ok(Self::Data {
                    stream,
                    flags,
                    data,
                })
            }
            FrameType::Headers => {
                let stream = require_stream(header.stream_id)?;
                let flags = HeadersFlags::from_bits_truncate(header.flags);
                let mut fragment =
                    strip_padding(payload, flags.contains(HeadersFlags::PADDED))?;
                let priority = if flags.contains(HeadersFlags::PRIORITY) {
                    if fragment.len() < 5 {
                        return Err(FrameDecodeError::PayloadTooShort);
                    }
                    Some(Priority::parse(&fragment.split_to(5)))
                } else {
                    None
                };
                Ok(Self::Headers {
                    stream,
                    flags,
                    priority,
                    fragment,
                })
            }
            FrameType::Priority => {
                let stream = require_stream(header.stream_id)?;
                if payload.len() != 5 {
                    return Err(FrameDecodeError::BadPayloadLength(payload.len()));
                }
                Ok(Self::Priority {
                    stream,
                    priority: Priority::parse(&payload),
                })
            }
            FrameType::ResetStream => {
                let stream = require_stream(header.stream_id)?;
                if payload.len() != 4 {
                    return Err(FrameDecodeError::BadPayloadLength(payload.len()));
                }
                let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Self::ResetStream {
                    stream,
                    error: ErrorType::from_wire(code),
                })
            }
            FrameType::Settings => {
                require_connection(header.stream_id)?;
                let flags = SettingsFlags::from_bits_truncate(header.flags);
                if flags.contains(SettingsFlags::ACK) && !payload.is_empty() {
                    return Err(FrameDecodeError::SettingsAckWithPayload);
                }
                if payload.len() % 6 != 0 {
                    return Err(FrameDecodeError::BadSettingsLength(payload.len()));
                }
                let mut params = Vec::with_capacity(payload.len() / 6);
                for chunk in payload.chunks(6) {
                    // unknown settings parameters are ignored on receipt
                    if let Some(param) =
                        SettingsParameter::from_u16(u16::from_be_bytes([chunk[0], chunk[1]]))
                    {
                        params.push((
                            param,
                            u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
                        ));
                    }
                }
                Ok(Self::Settings { flags, params })
            }
            FrameType::PushPromise => {
                let stream = require_stream(header.stream_id)?;
                let flags = PushPromiseFlags::from_bits_truncate(header.flags);
                let mut fragment =
                    strip_padding(payload, flags.contains(PushPromiseFlags::PADDED))?;
                if fragment.len() < 4 {
                    return Err(FrameDecodeError::PayloadTooShort);
                }
                let raw = fragment.split_to(4);
                let promised = require_stream(
                    u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) & U31_MAX.get(),
                )?;
                Ok(Self::PushPromise {
                    stream,
                    flags,
                    promised,
                    fragment,
                })
            }
            FrameType::Ping => {
                require_connection(header.stream_id)?;
                let data: [u8; 8] = payload
                    .as_ref()
                    .try_into()
                    .map_err(|_| FrameDecodeError::BadPayloadLength(payload.len()))?;
                Ok(Self::Ping {
                    flags: PingFlags::from_bits_truncate(header.flags),
                    data,
                })
            }
            FrameType::GoAway => {
                require_connection(header.stream_id)?;
                if payload.len() < 8 {
                    return Err(FrameDecodeError::BadPayloadLength(payload.len()));
                }
                let last_stream =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                        & U31_MAX.get();
                let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                Ok(Self::GoAway {
                    last_stream,
                    error: ErrorType::from_wire(code),
                    debug: payload.slice(8..),
                })
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(FrameDecodeError::BadPayloadLength(payload.len()));
                }
                let raw = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                    & U31_MAX.get();
                Ok(Self::WindowUpdate {
                    stream: header.stream_id,
                    increment: NonZeroU32::new(raw)
                        .ok_or(FrameDecodeError::ZeroWindowIncrement)?,
                })
            }
            FrameType::Continuation => Ok(Self::Continuation {
                stream: require_stream(header.stream_id)?,
                flags: ContinuationFlags::from_bits_truncate(header.flags),
                fragment: payload,
            }),
        }
    }

    /// Serializes header and payload contiguously. Padding is never emitted.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        let (ty, flags, stream_id) = match self {
            Self::Data {
                stream,
                flags,
                data,
            } => {
                payload.put_slice(data);
                (
                    FrameType::Data,
                    flags.bits() & !DataFlags::PADDED.bits(),
                    stream.get(),
                )
            }
            Self::Headers {
                stream,
                flags,
                priority,
                fragment,
            } => {
                let mut bits = flags.bits() & !HeadersFlags::PADDED.bits();
                if let Some(priority) = priority {
                    priority.encode_into(&mut payload);
                    bits |= HeadersFlags::PRIORITY.bits();
                } else {
                    bits &= !HeadersFlags::PRIORITY.bits();
                }
                payload.put_slice(fragment);
                (FrameType::Headers, bits, stream.get())
            }
            Self::Priority { stream, priority } => {
                priority.encode_into(&mut payload);
                (FrameType::Priority, 0, stream.get())
            }
            Self::ResetStream { stream, error } => {
                // unwrap: ErrorType is repr(u32)
                payload.put_u32(error.to_u32().unwrap());
                (FrameType::ResetStream, 0, stream.get())
            }
            Self::Settings { flags, params } => {
                for (param, value) in params {
                    // unwrap: SettingsParameter is repr(u16)
                    payload.put_u16(param.to_u16().unwrap());
                    payload.put_u32(*value);
                }
                (FrameType::Settings, flags.bits(), 0)
            }
            Self::PushPromise {
                stream,
                flags,
                promised,
                fragment,
            } => {
                payload.put_u32(promised.get() & U31_MAX.get());
                payload.put_slice(fragment);
                (
                    FrameType::PushPromise,
                    flags.bits() & !PushPromiseFlags::PADDED.bits(),
                    stream.get(),
                )
            }
            Self::Ping { flags, data } => {
                payload.put_slice(data);
                (FrameType::Ping, flags.bits(), 0)
            }
            Self::GoAway {
                last_stream,
                error,
                debug,
            } => {
                payload.put_u32(last_stream & U31_MAX.get());
                // unwrap: ErrorType is repr(u32)
                payload.put_u32(error.to_u32().unwrap());
                payload.put_slice(debug);
                (FrameType::GoAway, 0, 0)
            }
            Self::WindowUpdate { stream, increment } => {
                payload.put_u32(increment.get() & U31_MAX.get());
                (FrameType::WindowUpdate, 0, *stream)
            }
            Self::Continuation {
                stream,
                flags,
                fragment,
            } => {
                payload.put_slice(fragment);
                (FrameType::Continuation, flags.bits(), stream.get())
            }
            Self::Unknown {
                ty,
                flags,
                stream,
                payload: raw,
            } => {
                payload.put_slice(raw);
                let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
                FrameHeader {
                    length: payload.len() as u32,
                    ty: *ty,
                    flags: *flags,
                    stream_id: *stream,
                }
                .encode_into(&mut buf);
                buf.put_slice(&payload);
                return buf.freeze();
            }
        };
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        FrameHeader {
            length: payload.len() as u32,
            // unwrap: FrameType is repr(u8)
            ty: ty.to_u8().unwrap(),
            flags,
            stream_id,
        }
        .encode_into(&mut buf);
        buf.put_slice(&payload);
        buf.freeze()
    }

    /// Reads one frame, looping until the full 9-byte header and payload are
    /// in hand. Returns `Ok(None)` on EOF at a frame boundary; EOF anywhere
    /// else is a PROTOCOL_ERROR.
    pub async fn read_from(
        stream: &mut (impl AsyncRead + Unpin),
        max_frame_size: u32,
    ) -> Result<Option<(FrameHeader, Self)>, H2Error> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match stream.read(&mut header).await? {
            0 => return Ok(None),
            n => stream
                .read_exact(&mut header[n..])
                .await
                .map_err(eof_mid_frame)?,
        };
        let header = FrameHeader::parse(&header)?;
        if header.length > max_frame_size {
            return Err(FrameDecodeError::Oversized {
                len: header.length as usize,
                max: max_frame_size as usize,
            }
            .into());
        }
        let mut payload = vec![0u8; header.length as usize];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(eof_mid_frame)?;
        let frame = Self::parse(header, payload.into())?;
        trace!("recv {:?}", frame);
        Ok(Some((header, frame)))
    }

    pub async fn write_into(&self, stream: &mut (impl AsyncWrite + Unpin)) -> io::Result<()> {
        trace!("send {:?}", self);
        stream.write_all(&self.encode()).await
    }
}

fn eof_mid_frame(err: io::Error) -> H2Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        H2Error::Connection(
            ErrorType::ProtocolError,
            "transport closed in the middle of a frame".to_owned(),
        )
    } else {
        err.into()
    }
}

impl From<Vec<(SettingsParameter, u32)>> for Frame {
    fn from(params: Vec<(SettingsParameter, u32)>) -> Self {
        Self::Settings {
            flags: SettingsFlags::empty(),
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let bytes = frame.encode();
        let header = FrameHeader::parse(&bytes[..FRAME_HEADER_LEN]).unwrap();
        Frame::parse(header, bytes.slice(FRAME_HEADER_LEN..)).unwrap()
    }

    #[test]
    fn data_frame_with_end_stream() {
        // https://httpwg.org/specs/rfc7540.html#DATA
        let bytes = [
            0x00, 0x00, 0x05, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x68, 0x65, 0x6c, 0x6c, 0x6f,
        ];
        let header = FrameHeader::parse(&bytes[..9]).unwrap();
        assert_eq!(header.length, 5);
        assert_eq!(header.stream_id, 1);
        let frame = Frame::parse(header, Bytes::copy_from_slice(&bytes[9..])).unwrap();
        assert_eq!(
            frame,
            Frame::Data {
                stream: NonZeroU32::new(1).unwrap(),
                flags: DataFlags::END_STREAM,
                data: Bytes::from_static(b"hello"),
            }
        );
        assert_eq!(frame.encode().as_ref(), &bytes);
    }

    #[test]
    fn window_update_serialization() {
        let frame = Frame::WindowUpdate {
            stream: 1,
            increment: NonZeroU32::new(65_535).unwrap(),
        };
        assert_eq!(
            frame.encode().as_ref(),
            &[0x00, 0x00, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0xff, 0xff]
        );
    }

    #[test]
    fn window_update_zero_increment() {
        let header = FrameHeader {
            length: 4,
            ty: 0x8,
            flags: 0,
            stream_id: 1,
        };
        assert!(matches!(
            Frame::parse(header, Bytes::from_static(&[0, 0, 0, 0])),
            Err(FrameDecodeError::ZeroWindowIncrement)
        ));
    }

    #[test]
    fn settings_payload_order() {
        let frame: Frame = vec![
            (SettingsParameter::MaxConcurrentStreams, 100),
            (SettingsParameter::InitialWindowSize, 32_768),
        ]
        .into();
        let bytes = frame.encode();
        assert_eq!(
            &bytes[9..],
            &[0x00, 0x03, 0x00, 0x00, 0x00, 0x64, 0x00, 0x04, 0x00, 0x00, 0x80, 0x00]
        );
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn settings_length_not_multiple_of_six() {
        let header = FrameHeader {
            length: 5,
            ty: 0x4,
            flags: 0,
            stream_id: 0,
        };
        assert!(matches!(
            Frame::parse(header, Bytes::from_static(&[0; 5])),
            Err(FrameDecodeError::BadSettingsLength(5))
        ));
    }

    #[test]
    fn settings_ack_must_be_empty() {
        let header = FrameHeader {
            length: 6,
            ty: 0x4,
            flags: 0x1,
            stream_id: 0,
        };
        assert!(matches!(
            Frame::parse(header, Bytes::from_static(&[0; 6])),
            Err(FrameDecodeError::SettingsAckWithPayload)
        ));
    }

    #[test]
    fn padded_data_is_stripped() {
        // pad length 3, "hi", 3 pad octets
        let payload = Bytes::from_static(&[0x03, b'h', b'i', 0, 0, 0]);
        let header = FrameHeader {
            length: 6,
            ty: 0x0,
            flags: 0x8,
            stream_id: 1,
        };
        match Frame::parse(header, payload).unwrap() {
            Frame::Data { data, .. } => assert_eq!(data.as_ref(), b"hi"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn padding_may_cover_all_remaining_bytes() {
        let payload = Bytes::from_static(&[0x05, 0, 0, 0, 0, 0]);
        let header = FrameHeader {
            length: 6,
            ty: 0x0,
            flags: 0x8,
            stream_id: 1,
        };
        match Frame::parse(header, payload).unwrap() {
            Frame::Data { data, .. } => assert!(data.is_empty()),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn padding_exceeding_payload_is_rejected() {
        let payload = Bytes::from_static(&[0x06, 0, 0, 0, 0, 0]);
        let header = FrameHeader {
            length: 6,
            ty: 0x0,
            flags: 0x8,
            stream_id: 1,
        };
        assert!(matches!(
            Frame::parse(header, payload),
            Err(FrameDecodeError::BadPadding { pad: 6, len: 5 })
        ));
    }

    #[test]
    fn unknown_frame_type_is_surfaced() {
        let header = FrameHeader {
            length: 3,
            ty: 0x7f,
            flags: 0xaa,
            stream_id: 7,
        };
        match Frame::parse(header, Bytes::from_static(&[1, 2, 3])).unwrap() {
            Frame::Unknown { ty, stream, .. } => {
                assert_eq!(ty, 0x7f);
                assert_eq!(stream, 7);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn headers_priority_prefix() {
        let frame = Frame::Headers {
            stream: NonZeroU32::new(3).unwrap(),
            flags: HeadersFlags::END_HEADERS,
            priority: Some(Priority {
                exclusive: true,
                dependency: 1,
                weight: 200,
            }),
            fragment: Bytes::from_static(&[0x82]),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn reserved_bit_is_masked_on_read() {
        let bytes = [0x00, 0x00, 0x00, 0x04, 0x00, 0xff, 0xff, 0xff, 0xff];
        let header = FrameHeader::parse(&bytes).unwrap();
        assert_eq!(header.stream_id, U31_MAX.get());
    }

    #[test]
    fn goaway_roundtrip() {
        let frame = Frame::GoAway {
            last_stream: 5,
            error: ErrorType::EnhanceYourCalm,
            debug: Bytes::from_static(b"slow down"),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn ping_requires_eight_bytes() {
        let header = FrameHeader {
            length: 4,
            ty: 0x6,
            flags: 0,
            stream_id: 0,
        };
        assert!(matches!(
            Frame::parse(header, Bytes::from_static(&[0; 4])),
            Err(FrameDecodeError::BadPayloadLength(4))
        ));
    }

    #[test]
    fn short_header_is_rejected() {
        assert!(matches!(
            FrameHeader::parse(&[0; 8]),
            Err(FrameDecodeError::PayloadTooShort)
        ));
    }
}
