use crate::{
    flags::*,
    frame::{Frame, FrameHeader},
    hpack,
    request::Request,
    response::Response,
    stream::StreamState,
    stream_coordinator::StreamCoordinator,
    types::*,
};
use bytes::{BufMut, Bytes, BytesMut};
use enum_map::{enum_map, EnumMap};
use log::{debug, error, trace, warn};
use std::{
    num::NonZeroU32,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, oneshot, Notify},
    time::{timeout, timeout_at, Duration, Instant},
};

/// How long we wait for the peer to acknowledge our SETTINGS.
const SETTINGS_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything we advertise in our initial SETTINGS frame, plus local timers.
#[derive(Debug, Clone)]
pub struct Config {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: 100,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            max_header_list_size: 8_192,
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl Config {
    fn advertised(&self) -> Vec<(SettingsParameter, u32)> {
        vec![
            (SettingsParameter::HeaderTableSize, self.header_table_size),
            (SettingsParameter::EnablePush, u32::from(self.enable_push)),
            (
                SettingsParameter::MaxConcurrentStreams,
                self.max_concurrent_streams,
            ),
            (
                SettingsParameter::InitialWindowSize,
                self.initial_window_size,
            ),
            (SettingsParameter::MaxFrameSize, self.max_frame_size),
            (
                SettingsParameter::MaxHeaderListSize,
                self.max_header_list_size,
            ),
        ]
    }
}

/// State shared between the api surface and the receive loop. Never held
/// across an await point.
struct ConnectionState {
    streams: StreamCoordinator,
    header_encoder: hpack::Encoder,
    header_decoder: hpack::Decoder,
    their_settings: EnumMap<SettingsParameter, u32>,
    send_window: i32,
    recv_window: i32,
    /// While a header block is being continued: the stream carrying the
    /// CONTINUATION frames and the stream whose block it is (these differ for
    /// PUSH_PROMISE). No other frame may arrive in between.
    continuing_on: Option<(NonZeroStreamId, NonZeroStreamId)>,
    settings_acked: bool,
    /// The peer's first SETTINGS frame has been applied; requests may flow.
    handshaken: bool,
    goaway_sent: bool,
    /// Last stream id from the peer's GOAWAY, once received.
    draining: Option<StreamId>,
    fatal: Option<(ErrorType, String)>,
    closed: bool,
}

impl ConnectionState {
    /// Gate for starting new work on the connection.
    fn check_live(&self) -> Result<(), H2Error> {
        self.check_open()?;
        if self.draining.is_some() || self.goaway_sent {
            return Err(H2Error::GoingAway);
        }
        Ok(())
    }

    /// Gate for continuing in-flight work; draining is fine here.
    fn check_open(&self) -> Result<(), H2Error> {
        if let Some((code, msg)) = &self.fatal {
            return Err(H2Error::Connection(*code, msg.clone()));
        }
        if self.closed {
            return Err(H2Error::Closed);
        }
        Ok(())
    }
}

struct Shared {
    config: Config,
    role: Role,
    state: Mutex<ConnectionState>,
    outbound: mpsc::Sender<Bytes>,
    /// Signalled when handshake or shutdown state changes.
    ready: Notify,
    /// Signalled when send windows grow or stream slots free up.
    window_changed: Notify,
    incoming_tx: mpsc::Sender<(Request, Responder)>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<(Request, Responder)>>,
}

/// One HTTP/2 connection over an exclusive duplex transport. Cheap to clone;
/// all clones share the same connection.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

fn default_their_settings() -> EnumMap<SettingsParameter, u32> {
    enum_map! {
        SettingsParameter::HeaderTableSize => 4096,
        SettingsParameter::EnablePush => 1,
        SettingsParameter::MaxConcurrentStreams => u32::MAX,
        SettingsParameter::InitialWindowSize => 65_535,
        SettingsParameter::MaxFrameSize => 16_384,
        SettingsParameter::MaxHeaderListSize => u32::MAX,
    }
}

/// https://httpwg.org/specs/rfc7540.html#ConnectionHeader
async fn send_preface(
    io: &mut (impl AsyncWrite + Unpin),
    preface_sent: &mut bool,
) -> Result<(), H2Error> {
    if *preface_sent {
        return Err(H2Error::Connection(
            ErrorType::InternalError,
            "connection preface already sent".to_owned(),
        ));
    }
    io.write_all(PREFACE).await?;
    *preface_sent = true;
    Ok(())
}

impl Connection {
    /// Client side: emit the preface and our SETTINGS, then start the frame
    /// loop. Returns before the peer's SETTINGS arrive; requests wait for the
    /// handshake to finish.
    pub async fn connect<T>(io: T, config: Config) -> Result<Self, H2Error>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::establish(io, config, Role::Client).await
    }

    /// Server side: verify the 24-octet preface bit-exactly, then emit our
    /// SETTINGS and start the frame loop.
    pub async fn accept<T>(io: T, config: Config) -> Result<Self, H2Error>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::establish(io, config, Role::Server).await
    }

    async fn establish<T>(mut io: T, config: Config, role: Role) -> Result<Self, H2Error>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        match role {
            Role::Client => {
                let mut preface_sent = false;
                send_preface(&mut io, &mut preface_sent).await?;
            }
            Role::Server => {
                let mut preface = [0u8; 24];
                io.read_exact(&mut preface).await?;
                if &preface != PREFACE {
                    return Err(H2Error::Connection(
                        ErrorType::ProtocolError,
                        "invalid connection preface".to_owned(),
                    ));
                }
            }
        }
        let settings: Frame = config.advertised().into();
        settings.write_into(&mut io).await?;

        let (read_half, write_half) = tokio::io::split(io);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(32);
        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        let shared = Arc::new(Shared {
            state: Mutex::new(ConnectionState {
                streams: StreamCoordinator::new(role),
                header_encoder: hpack::Encoder::default(),
                header_decoder: hpack::Decoder::with_size(config.header_table_size as usize),
                their_settings: default_their_settings(),
                send_window: DEFAULT_WINDOW,
                recv_window: DEFAULT_WINDOW,
                continuing_on: None,
                settings_acked: false,
                handshaken: false,
                goaway_sent: false,
                draining: None,
                fatal: None,
                closed: false,
            }),
            config,
            role,
            outbound: outbound_tx,
            ready: Notify::new(),
            window_changed: Notify::new(),
            incoming_tx,
            incoming: tokio::sync::Mutex::new(incoming_rx),
        });
        tokio::spawn(run_writer(write_half, outbound_rx));
        tokio::spawn(run_reader(shared.clone(), read_half));
        tokio::spawn(settings_watchdog(shared.clone()));
        Ok(Self { shared })
    }

    /// Issues one request and waits for the complete response, bounded by the
    /// configured request timeout. On timeout the stream is reset with CANCEL.
    pub async fn request(&self, request: Request) -> Result<Response, H2Error> {
        let deadline = Instant::now() + self.shared.config.request_timeout;
        let (id, rx) = match timeout_at(deadline, self.shared.open_stream(&request)).await {
            Ok(opened) => opened?,
            Err(_) => return Err(H2Error::RequestTimeout),
        };
        let outcome = timeout_at(deadline, async {
            self.shared.send_data(id, &request.body).await?;
            rx.await.unwrap_or(Err(H2Error::Closed))
        })
        .await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                self.shared.cancel(id, H2Error::RequestTimeout).await;
                Err(H2Error::RequestTimeout)
            }
        }
    }

    /// Server side: the next complete request from the peer, with the handle
    /// used to answer it. `None` once the connection is done.
    pub async fn accept_request(&self) -> Option<(Request, Responder)> {
        self.shared.incoming.lock().await.recv().await
    }

    /// Graceful shutdown: GOAWAY(NO_ERROR), let in-flight streams drain, stop
    /// accepting new work.
    pub async fn shutdown(&self) -> Result<(), H2Error> {
        let frame = {
            let mut state = self.shared.lock();
            if state.goaway_sent {
                return Ok(());
            }
            state.goaway_sent = true;
            Frame::GoAway {
                last_stream: state.streams.highest_remote(),
                error: ErrorType::NoError,
                debug: Bytes::new(),
            }
        };
        self.shared.ready.notify_waiters();
        self.shared.queue_frame(frame).await
    }
}

/// Answers one accepted request. Consumed by sending the response.
pub struct Responder {
    shared: Arc<Shared>,
    stream: NonZeroStreamId,
}

impl Responder {
    pub async fn send(self, response: Response) -> Result<(), H2Error> {
        let end_stream = response.body.is_empty();
        let group = {
            let mut state = self.shared.lock();
            state.check_open()?;
            let max_frame = state.their_settings[SettingsParameter::MaxFrameSize] as usize;
            let fragment = state.header_encoder.encode(
                response
                    .headers
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.as_str())),
            );
            let stream = state
                .streams
                .get_mut(self.stream)
                .ok_or(H2Error::StreamReset(ErrorType::Cancel))?;
            let mut flags = HeadersFlags::END_HEADERS;
            if end_stream {
                flags |= HeadersFlags::END_STREAM;
            }
            stream.transition(false, FrameType::Headers, Flags::Headers(flags))?;
            encode_header_group(self.stream, fragment, end_stream, max_frame)
        };
        self.shared.queue(group).await?;
        self.shared.send_data(self.stream, &response.body).await?;
        let mut state = self.shared.lock();
        let done = state
            .streams
            .get_mut(self.stream)
            .map_or(false, |stream| stream.state == StreamState::Closed);
        if done {
            state.streams.remove(self.stream);
        }
        Ok(())
    }
}

/// Splits one HPACK block into a HEADERS frame plus as many CONTINUATION
/// frames as the peer's MAX_FRAME_SIZE requires, encoded back to back so the
/// writer cannot interleave anything in between.
fn encode_header_group(
    stream: NonZeroStreamId,
    mut fragment: Bytes,
    end_stream: bool,
    max_frame: usize,
) -> Bytes {
    let mut out = BytesMut::new();
    let mut first = true;
    loop {
        let chunk = fragment.split_to(fragment.len().min(max_frame));
        let last = fragment.is_empty();
        if first {
            first = false;
            let mut flags = HeadersFlags::empty();
            if end_stream {
                flags |= HeadersFlags::END_STREAM;
            }
            if last {
                flags |= HeadersFlags::END_HEADERS;
            }
            out.put_slice(
                &Frame::Headers {
                    stream,
                    flags,
                    priority: None,
                    fragment: chunk,
                }
                .encode(),
            );
        } else {
            let flags = if last {
                ContinuationFlags::END_HEADERS
            } else {
                ContinuationFlags::empty()
            };
            out.put_slice(
                &Frame::Continuation {
                    stream,
                    flags,
                    fragment: chunk,
                }
                .encode(),
            );
        }
        if last {
            return out.freeze();
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().expect("connection state poisoned")
    }

    async fn queue(&self, bytes: Bytes) -> Result<(), H2Error> {
        self.outbound.send(bytes).await.map_err(|_| H2Error::Closed)
    }

    async fn queue_frame(&self, frame: Frame) -> Result<(), H2Error> {
        trace!("send {:?}", frame);
        self.queue(frame.encode()).await
    }

    /// Ends the connection: GOAWAY with `code`, every pending completion
    /// rejected, transport torn down when the writer drains.
    async fn fail(&self, code: ErrorType, msg: String) {
        if code == ErrorType::NoError {
            debug!("closing connection: {}", msg);
        } else {
            error!("connection error {:?}: {}", code, msg);
        }
        let goaway = {
            let mut state = self.lock();
            if state.closed {
                None
            } else {
                state.closed = true;
                let last_stream = state.streams.highest_remote();
                if code == ErrorType::NoError {
                    state.streams.reject_all(|| H2Error::Closed);
                } else {
                    state.fatal = Some((code, msg.clone()));
                    state
                        .streams
                        .reject_all(|| H2Error::Connection(code, msg.clone()));
                }
                if state.goaway_sent {
                    None
                } else {
                    state.goaway_sent = true;
                    Some(Frame::GoAway {
                        last_stream,
                        error: code,
                        debug: Bytes::from(msg.into_bytes()),
                    })
                }
            }
        };
        if let Some(frame) = goaway {
            self.queue_frame(frame).await.ok();
        }
        self.ready.notify_waiters();
        self.window_changed.notify_waiters();
    }

    /// Transport is already gone; just reject and mark closed.
    fn abort(&self, err: impl Fn() -> H2Error) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            state.streams.reject_all(&err);
        }
        drop(state);
        self.ready.notify_waiters();
        self.window_changed.notify_waiters();
    }

    /// Waits for the handshake and a free stream slot, then sends the
    /// request's HEADERS group and registers the completion hook.
    async fn open_stream(
        &self,
        request: &Request,
    ) -> Result<
        (
            NonZeroStreamId,
            oneshot::Receiver<Result<Response, H2Error>>,
        ),
        H2Error,
    > {
        let field_lines = request.field_lines()?;
        loop {
            let ready = self.ready.notified();
            let window = self.window_changed.notified();
            let opened = {
                let mut state = self.lock();
                state.check_live()?;
                let max_concurrent =
                    state.their_settings[SettingsParameter::MaxConcurrentStreams] as usize;
                if state.handshaken && state.streams.open_local_count() < max_concurrent {
                    let initial_send =
                        state.their_settings[SettingsParameter::InitialWindowSize] as i32;
                    let initial_recv = self.config.initial_window_size as i32;
                    let max_frame = state.their_settings[SettingsParameter::MaxFrameSize] as usize;
                    let fragment = state.header_encoder.encode(
                        field_lines
                            .iter()
                            .map(|(name, value)| (name.as_str(), value.as_str())),
                    );
                    let end_stream = request.body.is_empty();
                    let (tx, rx) = oneshot::channel();
                    let stream = state.streams.create_local(initial_send, initial_recv)?;
                    stream.request_id = request.id;
                    stream.completion = Some(tx);
                    let id = stream.id;
                    let mut flags = HeadersFlags::END_HEADERS;
                    if end_stream {
                        flags |= HeadersFlags::END_STREAM;
                    }
                    stream.transition(false, FrameType::Headers, Flags::Headers(flags))?;
                    Some((id, rx, encode_header_group(id, fragment, end_stream, max_frame)))
                } else {
                    None
                }
            };
            if let Some((id, rx, group)) = opened {
                self.queue(group).await?;
                return Ok((id, rx));
            }
            tokio::select! {
                _ = ready => {}
                _ = window => {}
            }
        }
    }

    /// Streams a body as DATA frames, suspending whenever the stream or
    /// connection send window is exhausted. Both windows are drawn down under
    /// the same lock that queues the frame.
    async fn send_data(&self, id: NonZeroStreamId, body: &Bytes) -> Result<(), H2Error> {
        if body.is_empty() {
            return Ok(());
        }
        let mut offset = 0;
        while offset < body.len() {
            let window = self.window_changed.notified();
            let chunk = {
                let mut state = self.lock();
                state.check_open()?;
                let max_frame = state.their_settings[SettingsParameter::MaxFrameSize] as usize;
                let ConnectionState {
                    streams,
                    send_window,
                    ..
                } = &mut *state;
                let Some(stream) = streams.get_mut(id) else {
                    // the exchange ended from the other side; the completion
                    // hook carries the outcome
                    return Ok(());
                };
                let allowance = stream.send_window.min(*send_window).max(0) as usize;
                let len = allowance.min(max_frame).min(body.len() - offset);
                if len == 0 {
                    None
                } else {
                    stream.send_window -= len as i32;
                    *send_window -= len as i32;
                    let last = offset + len == body.len();
                    let flags = if last {
                        DataFlags::END_STREAM
                    } else {
                        DataFlags::empty()
                    };
                    stream.transition(false, FrameType::Data, Flags::Data(flags))?;
                    Some((len, flags))
                }
            };
            match chunk {
                Some((len, flags)) => {
                    self.queue_frame(Frame::Data {
                        stream: id,
                        flags,
                        data: body.slice(offset..offset + len),
                    })
                    .await?;
                    offset += len;
                }
                None => window.await,
            }
        }
        Ok(())
    }

    /// Resets a stream we no longer care about and rejects its completion.
    async fn cancel(&self, id: NonZeroStreamId, err: H2Error) {
        let existed = {
            let mut state = self.lock();
            match state.streams.remove(id) {
                Some(mut stream) => {
                    stream.reject(err);
                    true
                }
                None => false,
            }
        };
        if existed {
            self.window_changed.notify_waiters();
            self.queue_frame(Frame::ResetStream {
                stream: id,
                error: ErrorType::Cancel,
            })
            .await
            .ok();
        }
    }

    /// Applies a peer SETTINGS frame. Returns whether send windows moved.
    fn apply_settings(
        &self,
        state: &mut ConnectionState,
        flags: SettingsFlags,
        params: Vec<(SettingsParameter, u32)>,
        outgoing: &mut Vec<Frame>,
    ) -> Result<bool, H2Error> {
        if flags.contains(SettingsFlags::ACK) {
            trace!("our SETTINGS were acknowledged");
            state.settings_acked = true;
            return Ok(false);
        }
        let mut windows_changed = false;
        for (param, value) in params {
            match param {
                SettingsParameter::HeaderTableSize => {
                    state.header_encoder.resize(value as usize);
                }
                SettingsParameter::EnablePush => {
                    if value > 1 {
                        return Err(H2Error::Connection(
                            ErrorType::ProtocolError,
                            format!("invalid ENABLE_PUSH value {}", value),
                        ));
                    }
                }
                SettingsParameter::InitialWindowSize => {
                    if value > U31_MAX.get() {
                        return Err(H2Error::Connection(
                            ErrorType::FlowControlError,
                            format!("INITIAL_WINDOW_SIZE {} above the maximum", value),
                        ));
                    }
                    let delta = i64::from(value)
                        - i64::from(state.their_settings[SettingsParameter::InitialWindowSize]);
                    state.streams.adjust_send_windows(delta as i32)?;
                    windows_changed = true;
                }
                SettingsParameter::MaxFrameSize => {
                    if !(16_384..=16_777_215).contains(&value) {
                        return Err(H2Error::Connection(
                            ErrorType::ProtocolError,
                            format!("invalid MAX_FRAME_SIZE {}", value),
                        ));
                    }
                }
                SettingsParameter::MaxConcurrentStreams
                | SettingsParameter::MaxHeaderListSize => {}
            }
            state.their_settings[param] = value;
        }
        outgoing.push(Frame::Settings {
            flags: SettingsFlags::ACK,
            params: Vec::new(),
        });
        if !state.handshaken {
            trace!("handshake complete");
            state.handshaken = true;
        }
        Ok(windows_changed)
    }
}

async fn run_writer<T>(mut io: WriteHalf<T>, mut rx: mpsc::Receiver<Bytes>)
where
    T: AsyncWrite + Send + 'static,
{
    while let Some(bytes) = rx.recv().await {
        if let Err(err) = io.write_all(&bytes).await {
            error!("transport write failed: {}", err);
            break;
        }
    }
    io.shutdown().await.ok();
}

async fn run_reader<T>(shared: Arc<Shared>, mut io: ReadHalf<T>)
where
    T: AsyncRead + Send + 'static,
{
    let idle = shared.config.idle_timeout;
    let max_frame_size = shared.config.max_frame_size;
    loop {
        let (header, frame) = match timeout(idle, Frame::read_from(&mut io, max_frame_size)).await
        {
            Err(_) => {
                shared
                    .fail(ErrorType::NoError, "connection idle timeout".to_owned())
                    .await;
                return;
            }
            Ok(Ok(Some(read))) => read,
            Ok(Ok(None)) => {
                // EOF at a frame boundary
                let active = !shared.lock().streams.is_empty();
                if active {
                    shared.abort(|| H2Error::Closed);
                    warn!("transport closed with streams in flight");
                } else {
                    shared.abort(|| H2Error::Closed);
                    debug!("transport closed cleanly");
                }
                return;
            }
            Ok(Err(err)) => {
                let (code, msg) = error_parts(&err);
                shared.fail(code, msg).await;
                return;
            }
        };
        if let Err(err) = handle_frame(&shared, header, frame).await {
            let (code, msg) = error_parts(&err);
            shared.fail(code, msg).await;
            return;
        }
    }
}

fn error_parts(err: &H2Error) -> (ErrorType, String) {
    match err {
        H2Error::Connection(code, msg) => (*code, msg.clone()),
        H2Error::FrameDecode(inner) => (inner.error_type(), inner.to_string()),
        H2Error::Compression(inner) => (ErrorType::CompressionError, inner.to_string()),
        other => (ErrorType::InternalError, other.to_string()),
    }
}

async fn settings_watchdog(shared: Arc<Shared>) {
    let acked = timeout(SETTINGS_ACK_TIMEOUT, async {
        loop {
            let notified = shared.ready.notified();
            if shared.lock().settings_acked {
                return;
            }
            notified.await;
        }
    })
    .await;
    if acked.is_err() && !shared.lock().closed {
        shared
            .fail(
                ErrorType::SettingsTimeout,
                "SETTINGS was never acknowledged".to_owned(),
            )
            .await;
    }
}

/// Classifies one received frame and applies it: stream-0 frames handled
/// here, the rest dispatched through the registry.
async fn handle_frame(
    shared: &Arc<Shared>,
    header: FrameHeader,
    frame: Frame,
) -> Result<(), H2Error> {
    let mut outgoing: Vec<Frame> = Vec::new();
    let mut finished: Vec<(NonZeroStreamId, Headers, Bytes)> = Vec::new();
    let mut notify_ready = false;
    let mut notify_window = false;
    {
        let mut state = shared.lock();
        if state.closed {
            return Ok(());
        }

        // HEADERS/CONTINUATION are atomic with respect to every other frame
        // on the connection
        let mut continuation_target = None;
        if let Some((carrier, target)) = state.continuing_on {
            match &frame {
                Frame::Continuation { stream, flags, .. } if *stream == carrier => {
                    continuation_target = Some(target);
                    if flags.contains(ContinuationFlags::END_HEADERS) {
                        state.continuing_on = None;
                    }
                }
                _ => {
                    return Err(H2Error::Connection(
                        ErrorType::ProtocolError,
                        format!("expected CONTINUATION for stream {}", carrier),
                    ));
                }
            }
        } else if matches!(frame, Frame::Continuation { .. }) {
            return Err(H2Error::Connection(
                ErrorType::ProtocolError,
                "CONTINUATION without a header block in progress".to_owned(),
            ));
        }
        match &frame {
            Frame::Headers { stream, flags, .. }
                if !flags.contains(HeadersFlags::END_HEADERS) =>
            {
                state.continuing_on = Some((*stream, *stream));
            }
            Frame::PushPromise {
                stream,
                promised,
                flags,
                ..
            } if !flags.contains(PushPromiseFlags::END_HEADERS) => {
                state.continuing_on = Some((*stream, *promised));
            }
            _ => {}
        }

        match frame {
            Frame::Settings { flags, params } => {
                notify_window = shared.apply_settings(&mut state, flags, params, &mut outgoing)?;
                notify_ready = true;
            }
            Frame::Ping { flags, data } => {
                if !flags.contains(PingFlags::ACK) {
                    outgoing.push(Frame::Ping {
                        flags: PingFlags::ACK,
                        data,
                    });
                }
            }
            Frame::GoAway {
                last_stream,
                error,
                debug: debug_data,
            } => {
                if error == ErrorType::NoError {
                    debug!("peer is going away after stream {}", last_stream);
                } else {
                    error!("peer went away: {:?}", error);
                }
                if !debug_data.is_empty() {
                    if let Ok(text) = std::str::from_utf8(&debug_data) {
                        debug!("goaway debug data: {}", text);
                    }
                }
                state.draining = Some(last_stream);
                state.streams.reject_beyond(last_stream);
                notify_ready = true;
                notify_window = true;
            }
            Frame::WindowUpdate {
                stream: 0,
                increment,
            } => {
                state.send_window = state
                    .send_window
                    .checked_add(increment.get() as i32)
                    .ok_or_else(|| {
                        H2Error::Connection(
                            ErrorType::FlowControlError,
                            "connection send window overflowed".to_owned(),
                        )
                    })?;
                notify_window = true;
            }
            Frame::Unknown { ty, .. } => trace!("discarding unknown frame type {:#x}", ty),
            frame => {
                notify_window |= on_stream_frame(
                    shared,
                    &mut state,
                    header,
                    frame,
                    continuation_target,
                    &mut outgoing,
                    &mut finished,
                )?;
            }
        }
    }
    for frame in outgoing {
        shared.queue_frame(frame).await?;
    }
    if notify_ready {
        shared.ready.notify_waiters();
    }
    if notify_window {
        shared.window_changed.notify_waiters();
    }
    for (id, headers, body) in finished {
        deliver_request(shared, id, headers, body).await;
    }
    Ok(())
}

/// Routes a stream-scoped frame: resolves or lazily creates the stream,
/// keeps flow-control accounting, and turns stream errors into RST_STREAM.
/// Returns whether send windows moved.
fn on_stream_frame(
    shared: &Arc<Shared>,
    state: &mut ConnectionState,
    header: FrameHeader,
    frame: Frame,
    continuation_target: Option<NonZeroStreamId>,
    outgoing: &mut Vec<Frame>,
    finished: &mut Vec<(NonZeroStreamId, Headers, Bytes)>,
) -> Result<bool, H2Error> {
    let id = match (&frame, continuation_target) {
        (Frame::Continuation { .. }, Some(target)) => target,
        (Frame::PushPromise { promised, .. }, _) => *promised,
        (
            Frame::Data { stream, .. }
            | Frame::Headers { stream, .. }
            | Frame::Priority { stream, .. }
            | Frame::ResetStream { stream, .. }
            | Frame::Continuation { stream, .. },
            _,
        ) => *stream,
        (Frame::WindowUpdate { stream, .. }, _) => match NonZeroStreamId::new(*stream) {
            Some(id) => id,
            None => unreachable!("connection-level WINDOW_UPDATE is handled by the caller"),
        },
        _ => unreachable!("connection-level frame"),
    };

    if let Frame::PushPromise { .. } = &frame {
        if shared.role == Role::Server {
            return Err(H2Error::Connection(
                ErrorType::ProtocolError,
                "PUSH_PROMISE from a client".to_owned(),
            ));
        }
        if !shared.config.enable_push {
            return Err(H2Error::Connection(
                ErrorType::ProtocolError,
                "PUSH_PROMISE while push is disabled".to_owned(),
            ));
        }
    }

    // connection-level flow control, replenished right away
    let flow = if matches!(frame, Frame::Data { .. }) {
        let flow = header.length as i32;
        state.recv_window -= flow;
        if state.recv_window < 0 {
            return Err(H2Error::Connection(
                ErrorType::FlowControlError,
                "connection flow-control window exceeded".to_owned(),
            ));
        }
        if let Some(increment) = NonZeroU32::new(flow as u32) {
            outgoing.push(Frame::WindowUpdate {
                stream: 0,
                increment,
            });
            state.recv_window += flow;
        }
        flow
    } else {
        0
    };

    let drain_refuse = state.goaway_sent || state.draining.is_some();
    let max_concurrent = shared.config.max_concurrent_streams as usize;
    let initial_send = state.their_settings[SettingsParameter::InitialWindowSize] as i32;
    let initial_recv = shared.config.initial_window_size as i32;
    let ConnectionState {
        streams,
        header_decoder,
        ..
    } = &mut *state;

    let mut refused = false;
    if streams.get_mut(id).is_none() {
        match &frame {
            Frame::Headers { .. } => {
                if streams.is_past(id) {
                    if streams.was_recently_closed(id) {
                        outgoing.push(Frame::ResetStream {
                            stream: id,
                            error: ErrorType::StreamClosed,
                        });
                        return Ok(false);
                    }
                    return Err(H2Error::Connection(
                        ErrorType::ProtocolError,
                        format!("HEADERS on closed stream {}", id),
                    ));
                }
                refused = drain_refuse || streams.open_remote_count() >= max_concurrent;
                streams.create_remote(id, false, initial_send, initial_recv)?;
            }
            Frame::PushPromise { .. } => {
                streams.create_remote(id, true, initial_send, initial_recv)?;
            }
            // PRIORITY is valid for streams in any state, idle included
            Frame::Priority { .. } => return Ok(false),
            Frame::WindowUpdate { .. } | Frame::ResetStream { .. } => {
                if streams.is_past(id) {
                    return Ok(false);
                }
                return Err(H2Error::Connection(
                    ErrorType::ProtocolError,
                    format!("frame for idle stream {}", id),
                ));
            }
            Frame::Data { .. } | Frame::Continuation { .. } => {
                if streams.was_recently_closed(id) {
                    if matches!(frame, Frame::Data { .. }) {
                        outgoing.push(Frame::ResetStream {
                            stream: id,
                            error: ErrorType::StreamClosed,
                        });
                    }
                    return Ok(false);
                }
                return Err(H2Error::Connection(
                    ErrorType::ProtocolError,
                    format!("frame for idle stream {}", id),
                ));
            }
            _ => unreachable!("connection-level frame"),
        }
    }
    let stream = streams.get_mut(id).expect("stream resolved above");

    if flow > 0 {
        stream.recv_window -= flow;
        if stream.recv_window < 0 {
            let error = ErrorType::FlowControlError;
            outgoing.push(Frame::ResetStream { stream: id, error });
            stream.reject(H2Error::StreamReset(error));
            streams.remove(id);
            return Ok(true);
        }
    }

    // removing a stream frees a concurrency slot, which is a window of its
    // own kind; wake senders for that too
    let was_window_update = matches!(frame, Frame::WindowUpdate { .. });
    match stream.handle_frame(frame, header_decoder) {
        Ok(done) => {
            let mut slot_freed = false;
            if let Some(increment) = NonZeroU32::new(flow as u32) {
                outgoing.push(Frame::WindowUpdate {
                    stream: id.get(),
                    increment,
                });
                stream.recv_window += flow;
            }
            if refused {
                outgoing.push(Frame::ResetStream {
                    stream: id,
                    error: ErrorType::RefusedStream,
                });
                stream.state = StreamState::Closed;
            }
            if done && !refused {
                match shared.role {
                    Role::Client => {
                        stream.fulfill();
                        streams.remove(id);
                        slot_freed = true;
                    }
                    Role::Server => {
                        let (headers, body, _trailers) = stream.take_message();
                        finished.push((id, headers, body));
                    }
                }
            } else if stream.state == StreamState::Closed && stream.continuing.is_none() {
                streams.remove(id);
                slot_freed = true;
            }
            Ok(was_window_update || slot_freed)
        }
        Err(StreamError::Stream(error)) => {
            outgoing.push(Frame::ResetStream { stream: id, error });
            stream.reject(H2Error::StreamReset(error));
            streams.remove(id);
            Ok(true)
        }
        Err(StreamError::Connection(code, msg)) => Err(H2Error::Connection(code, msg)),
    }
}

/// Finishes the ingress half of the adapter on a server: a complete HEADERS
/// plus DATA sequence becomes a request handed to the application.
async fn deliver_request(
    shared: &Arc<Shared>,
    id: NonZeroStreamId,
    headers: Headers,
    body: Bytes,
) {
    match Request::from_field_lines(headers, body) {
        Ok(request) => {
            let responder = Responder {
                shared: shared.clone(),
                stream: id,
            };
            if shared.incoming_tx.send((request, responder)).await.is_err() {
                debug!("request on stream {} dropped, nobody is accepting", id);
            }
        }
        Err(err) => {
            warn!("malformed request on stream {}: {}", id, err);
            shared.lock().streams.remove(id);
            shared
                .queue_frame(Frame::ResetStream {
                    stream: id,
                    error: ErrorType::ProtocolError,
                })
                .await
                .ok();
        }
    }
}
