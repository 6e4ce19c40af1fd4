use crate::{flags::*, frame::Frame, frame::Priority, hpack, response::Response, types::*};
use bytes::BytesMut;
use derivative::Derivative;
use log::{debug, trace, warn};
use tokio::sync::oneshot;

/// https://httpwg.org/specs/rfc7540.html#StreamStates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Which frame opened the header block a CONTINUATION continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Continuing {
    Headers,
    PushPromise,
}

/// What the peer's header blocks on this stream describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Request,
    Response,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Stream {
    pub id: NonZeroStreamId,
    /// Completion hook for the request that owns this stream; signalled once
    /// on the terminal event. Absent on peer-initiated streams.
    #[derivative(Debug = "ignore")]
    pub completion: Option<oneshot::Sender<Result<Response, H2Error>>>,
    pub request_id: usize,
    pub state: StreamState,
    pub continuing: Option<Continuing>,
    /// Outbound flow-control window; DATA we send draws it down.
    pub send_window: i32,
    /// Inbound flow-control window; DATA we receive draws it down.
    pub recv_window: i32,
    kind: BlockKind,
    priority: Option<Priority>,
    headers_buffer: BytesMut,
    body_buffer: BytesMut,
    headers: Headers,
    trailers: Headers,
    /// Headers of a promised request carried by PUSH_PROMISE.
    promise: Headers,
    pub headers_complete: bool,
    /// END_STREAM seen on a HEADERS frame whose block is still being
    /// continued; takes effect when the block completes.
    pending_end_stream: bool,
    remote_ended: bool,
    delivered: bool,
}

impl Stream {
    #[must_use]
    pub fn new(id: NonZeroStreamId, kind: BlockKind, send_window: i32, recv_window: i32) -> Self {
        Self {
            id,
            completion: None,
            request_id: 0,
            state: StreamState::Idle,
            continuing: None,
            send_window,
            recv_window,
            kind,
            priority: None,
            headers_buffer: BytesMut::new(),
            body_buffer: BytesMut::new(),
            headers: Headers::new(),
            trailers: Headers::new(),
            promise: Headers::new(),
            headers_complete: false,
            pending_end_stream: false,
            remote_ended: false,
            delivered: false,
        }
    }

    /// https://httpwg.org/specs/rfc7540.html#StreamStates
    pub fn transition(&mut self, recv: bool, ty: FrameType, flags: Flags) -> Result<(), StreamError> {
        let send = !recv;
        let original_state = self.state;

        if ty == FrameType::ResetStream {
            if self.state == StreamState::Idle {
                return Err(StreamError::Connection(
                    ErrorType::ProtocolError,
                    "RST_STREAM on an idle stream".to_owned(),
                ));
            }
            self.state = StreamState::Closed;
        } else if !matches!(ty, FrameType::Priority | FrameType::WindowUpdate) {
            // CONTINUATION is logically part of the HEADERS that was already
            // admitted, so it bypasses the closed-state checks below.
            let continuation = ty == FrameType::Continuation;
            match self.state {
                StreamState::Closed if !continuation => {
                    return Err(StreamError::Stream(ErrorType::StreamClosed));
                }
                StreamState::HalfClosedRemote if recv && !continuation => {
                    return Err(StreamError::Stream(ErrorType::StreamClosed));
                }
                StreamState::HalfClosedLocal if send && !continuation => {
                    return Err(StreamError::Stream(ErrorType::StreamClosed));
                }
                StreamState::Idle if ty == FrameType::Data => {
                    return Err(StreamError::Connection(
                        ErrorType::ProtocolError,
                        "DATA on an idle stream".to_owned(),
                    ));
                }
                _ => {}
            }

            let h = match flags {
                Flags::Headers(flags) => flags.contains(HeadersFlags::END_HEADERS),
                Flags::Continuation(flags) => {
                    matches!(self.continuing, Some(Continuing::Headers))
                        && flags.contains(ContinuationFlags::END_HEADERS)
                }
                _ => false,
            };
            let pp = match flags {
                Flags::PushPromise(flags) => flags.contains(PushPromiseFlags::END_HEADERS),
                Flags::Continuation(flags) => {
                    matches!(self.continuing, Some(Continuing::PushPromise))
                        && flags.contains(ContinuationFlags::END_HEADERS)
                }
                _ => false,
            };
            let es = match flags {
                Flags::Data(flags) => flags.contains(DataFlags::END_STREAM),
                Flags::Headers(flags) => {
                    flags.contains(HeadersFlags::END_STREAM)
                        && flags.contains(HeadersFlags::END_HEADERS)
                }
                Flags::Continuation(flags) => {
                    flags.contains(ContinuationFlags::END_HEADERS) && self.pending_end_stream
                }
                _ => false,
            };

            if self.state == StreamState::Idle {
                if send && pp {
                    self.state = StreamState::ReservedLocal;
                } else if recv && pp {
                    self.state = StreamState::ReservedRemote;
                } else if h {
                    self.state = StreamState::Open;
                }
            }

            if self.state == StreamState::ReservedLocal && send && h {
                self.state = StreamState::HalfClosedRemote;
            }

            if self.state == StreamState::ReservedRemote && recv && h {
                self.state = StreamState::HalfClosedLocal;
            }

            if self.state == StreamState::Open && send && es {
                self.state = StreamState::HalfClosedLocal;
            }

            if self.state == StreamState::Open && recv && es {
                self.state = StreamState::HalfClosedRemote;
            }

            if self.state == StreamState::HalfClosedRemote && send && es {
                self.state = StreamState::Closed;
            }

            if self.state == StreamState::HalfClosedLocal && recv && es {
                self.state = StreamState::Closed;
            }
        }

        if self.state != original_state {
            trace!(
                "stream {} {:?} -> {:?}",
                self.id,
                original_state,
                self.state
            );
        }

        Ok(())
    }

    /// Dispatches one received frame into this stream. Returns true once the
    /// peer's message (final header block plus body) is complete and not yet
    /// taken.
    pub fn handle_frame(
        &mut self,
        frame: Frame,
        decoder: &mut hpack::Decoder,
    ) -> Result<bool, StreamError> {
        match frame {
            Frame::Data { flags, data, .. } => {
                self.transition(true, FrameType::Data, flags.into())?;
                self.body_buffer.extend_from_slice(&data);
                if flags.contains(DataFlags::END_STREAM) {
                    self.remote_ended = true;
                }
            }
            Frame::Headers {
                flags,
                priority,
                fragment,
                ..
            } => {
                self.transition(true, FrameType::Headers, flags.into())?;
                if priority.is_some() {
                    self.priority = priority;
                }
                self.headers_buffer.extend_from_slice(&fragment);
                if flags.contains(HeadersFlags::END_STREAM) {
                    self.pending_end_stream = true;
                }
                if flags.contains(HeadersFlags::END_HEADERS) {
                    self.finish_header_block(decoder, false)?;
                } else {
                    self.continuing = Some(Continuing::Headers);
                }
            }
            Frame::Continuation { flags, fragment, .. } => {
                self.transition(true, FrameType::Continuation, flags.into())?;
                self.headers_buffer.extend_from_slice(&fragment);
                if flags.contains(ContinuationFlags::END_HEADERS) {
                    let promise = self.continuing.take() == Some(Continuing::PushPromise);
                    self.finish_header_block(decoder, promise)?;
                }
            }
            Frame::PushPromise { flags, fragment, .. } => {
                self.transition(true, FrameType::PushPromise, flags.into())?;
                self.headers_buffer.extend_from_slice(&fragment);
                if flags.contains(PushPromiseFlags::END_HEADERS) {
                    self.finish_header_block(decoder, true)?;
                } else {
                    self.continuing = Some(Continuing::PushPromise);
                }
            }
            Frame::Priority { priority, .. } => {
                self.transition(true, FrameType::Priority, Flags::None)?;
                self.priority = Some(priority);
                trace!("stream {} priority is now {:?}", self.id, self.priority);
            }
            Frame::ResetStream { error, .. } => {
                self.transition(true, FrameType::ResetStream, Flags::None)?;
                warn!("stream {} reset by peer: {:?}", self.id, error);
                self.reject(H2Error::StreamReset(error));
            }
            Frame::WindowUpdate { increment, .. } => {
                self.transition(true, FrameType::WindowUpdate, Flags::None)?;
                self.send_window = self
                    .send_window
                    .checked_add(increment.get() as i32)
                    .ok_or(StreamError::Stream(ErrorType::FlowControlError))?;
            }
            Frame::Settings { .. }
            | Frame::Ping { .. }
            | Frame::GoAway { .. }
            | Frame::Unknown { .. } => {
                unreachable!("connection-level frame dispatched to a stream");
            }
        }
        Ok(self.message_done())
    }

    /// HPACK-decodes the accumulated block and files it as headers, trailers,
    /// or a push promise. Decode failures poison the shared decoder table and
    /// are therefore connection errors.
    fn finish_header_block(
        &mut self,
        decoder: &mut hpack::Decoder,
        promise: bool,
    ) -> Result<(), StreamError> {
        let fields = decoder.decode(&self.headers_buffer).map_err(|err| {
            StreamError::Connection(ErrorType::CompressionError, err.to_string())
        })?;
        self.headers_buffer.clear();

        let kind = if promise { BlockKind::Request } else { self.kind };
        validate_fields(&fields, kind, self.headers_complete && !promise)?;
        let decoded: Headers = fields
            .into_iter()
            .map(|(name, value)| {
                (
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect();

        if promise {
            self.promise = decoded;
            trace!("stream {} was promised for {:?}", self.id, self.promise);
            return Ok(());
        }

        if self.headers_complete {
            self.trailers = decoded;
        } else {
            if self.kind == BlockKind::Response && !self.pending_end_stream {
                if let Some((_, status)) = decoded.iter().find(|(name, _)| name == ":status") {
                    if status.starts_with('1') && status != "101" {
                        debug!("interim response {} on stream {}", status, self.id);
                        return Ok(());
                    }
                }
            }
            self.headers = decoded;
            self.headers_complete = true;
        }
        if self.pending_end_stream {
            self.pending_end_stream = false;
            self.remote_ended = true;
        }
        Ok(())
    }

    fn message_done(&self) -> bool {
        self.remote_ended && self.headers_complete && !self.delivered
    }

    /// Client side: hand the finished response to whoever awaits it.
    pub fn fulfill(&mut self) {
        self.delivered = true;
        let response = Response {
            request_id: self.request_id,
            headers: std::mem::take(&mut self.headers),
            body: self.body_buffer.split().freeze(),
            trailers: std::mem::take(&mut self.trailers),
        };
        trace!("{:#?}", response);
        if let Some(tx) = self.completion.take() {
            // the requester may have lost interest; that's not an error
            tx.send(Ok(response)).ok();
        }
    }

    /// Server side: take the finished request off the stream.
    pub fn take_message(&mut self) -> (Headers, bytes::Bytes, Headers) {
        self.delivered = true;
        (
            std::mem::take(&mut self.headers),
            self.body_buffer.split().freeze(),
            std::mem::take(&mut self.trailers),
        )
    }

    pub fn reject(&mut self, err: H2Error) {
        if let Some(tx) = self.completion.take() {
            tx.send(Err(err)).ok();
        }
    }
}


/// https://httpwg.org/specs/rfc7540.html#HttpSequence
fn validate_fields(
    fields: &[(bytes::Bytes, bytes::Bytes)],
    kind: BlockKind,
    trailer: bool,
) -> Result<(), StreamError> {
    let mut seen_regular = false;
    for (name, _) in fields {
        if name.starts_with(b":") {
            if trailer {
                warn!("pseudo-header in trailers");
                return Err(StreamError::Stream(ErrorType::ProtocolError));
            }
            if seen_regular {
                warn!("pseudo-header after a regular header field");
                return Err(StreamError::Stream(ErrorType::ProtocolError));
            }
            let known = match kind {
                BlockKind::Request => matches!(
                    name.as_ref(),
                    b":method" | b":scheme" | b":authority" | b":path"
                ),
                BlockKind::Response => name.as_ref() == b":status",
            };
            if !known {
                warn!("unknown pseudo-header {:?}", name);
                return Err(StreamError::Stream(ErrorType::ProtocolError));
            }
        } else {
            seen_regular = true;
            if name.iter().any(u8::is_ascii_uppercase) {
                warn!("uppercase header field name {:?}", name);
                return Err(StreamError::Stream(ErrorType::ProtocolError));
            }
        }
    }
    Ok(())
}
