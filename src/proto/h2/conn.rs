use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use http::StatusCode;
use tokio::io::{AsyncReadExt, ReadHalf};
use tracing::{debug, trace, warn};

use super::frame::{
    FrameHeader, FrameKind, Reason, DEFAULT_INITIAL_WINDOW_SIZE, FLAG_ACK, FLAG_END_HEADERS,
    FLAG_END_STREAM, FRAME_HEADER_LEN, MAX_MAX_FRAME_SIZE, MAX_WINDOW_SIZE,
    MIN_MAX_FRAME_SIZE, PREFACE, SETTINGS_ENABLE_CONNECT_PROTOCOL, SETTINGS_ENABLE_PUSH,
    SETTINGS_HEADER_TABLE_SIZE, SETTINGS_INITIAL_WINDOW_SIZE, SETTINGS_MAX_FRAME_SIZE,
};
use super::hpack::{self, HeaderBlock};
use super::streams::{Stream, StreamPhase};
use crate::body::{BodyReader, BodySink};
use crate::engine::{date, EngineShared};
use crate::headers::Headers;
use crate::proto::h1::parse::{split_uri, RequestHead};
use crate::proto::Conn;
use crate::request::{Request, ResponseSink};
use crate::service::Handler;
use crate::transport::{Peer, Transport};

/// Connection-wide HTTP/2 state shared by the frame loop and the
/// per-stream response sinks.
pub(crate) struct ConnState {
    conn: Rc<Conn>,
    streams: RefCell<HashMap<u32, Rc<Stream>>>,
    decoder: RefCell<hpack::Decoder>,
    encoder: hpack::Encoder,
    /// Connection-level send window, updated by the peer.
    send_window: Cell<i64>,
    /// Connection-level receive window we grant the peer.
    recv_window: Cell<i64>,
    /// Peer's SETTINGS_MAX_FRAME_SIZE; our DATA chunks respect it.
    peer_max_frame: Cell<u32>,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE for new and existing streams.
    peer_initial_window: Cell<i32>,
    /// Largest frame we accept, bounded by the parse buffer.
    max_frame_recv: u32,
    max_stream_id: Cell<u32>,
    /// Stream id owed a CONTINUATION, 0 when none.
    continuation: Cell<u32>,
    headers_buf: RefCell<Vec<u8>>,
}

impl ConnState {
    fn new(conn: Rc<Conn>, buffer_size: usize, header_table_size: u32) -> Rc<ConnState> {
        let max_frame_recv =
            ((buffer_size - FRAME_HEADER_LEN) as u32).min(MAX_MAX_FRAME_SIZE);
        Rc::new(ConnState {
            conn,
            streams: RefCell::new(HashMap::new()),
            decoder: RefCell::new(hpack::Decoder::new(header_table_size as usize)),
            encoder: hpack::Encoder::new(),
            send_window: Cell::new(i64::from(DEFAULT_INITIAL_WINDOW_SIZE)),
            recv_window: Cell::new(i64::from(DEFAULT_INITIAL_WINDOW_SIZE)),
            peer_max_frame: Cell::new(MIN_MAX_FRAME_SIZE),
            peer_initial_window: Cell::new(DEFAULT_INITIAL_WINDOW_SIZE),
            max_frame_recv,
            max_stream_id: Cell::new(0),
            continuation: Cell::new(0),
            headers_buf: RefCell::new(Vec::new()),
        })
    }

    async fn send_frame(
        &self,
        kind: FrameKind,
        flags: u8,
        stream_id: u32,
        payload: &[u8],
    ) -> crate::Result<()> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&FrameHeader::encode(kind, flags, stream_id, payload.len()));
        frame.extend_from_slice(payload);
        self.conn.write_all(&frame).await?;
        self.conn.flush().await
    }

    async fn send_settings(&self, entries: &[(u16, u32)]) -> crate::Result<()> {
        let mut payload = Vec::with_capacity(entries.len() * 6);
        for (id, value) in entries {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }
        self.send_frame(FrameKind::Settings, 0, 0, &payload).await
    }

    async fn send_settings_ack(&self) -> crate::Result<()> {
        self.send_frame(FrameKind::Settings, FLAG_ACK, 0, &[]).await
    }

    async fn send_rst(&self, stream_id: u32, reason: Reason) -> crate::Result<()> {
        self.send_frame(
            FrameKind::RstStream,
            0,
            stream_id,
            &reason.code().to_be_bytes(),
        )
        .await
    }

    async fn send_window_update(&self, stream_id: u32, increment: u32) -> crate::Result<()> {
        self.send_frame(
            FrameKind::WindowUpdate,
            0,
            stream_id,
            &increment.to_be_bytes(),
        )
        .await
    }

    /// Sends GOAWAY with the last known stream id and returns the error
    /// that tears the connection down.
    async fn goaway(&self, reason: Reason) -> crate::Error {
        debug!(?reason, "sending GOAWAY");
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&self.max_stream_id.get().to_be_bytes());
        payload[4..].copy_from_slice(&reason.code().to_be_bytes());
        let _ = self
            .send_frame(FrameKind::GoAway, 0, 0, &payload)
            .await;
        crate::Error::new_h2(reason)
    }

    fn stream(&self, id: u32) -> Option<Rc<Stream>> {
        self.streams.borrow().get(&id).cloned()
    }

    fn each_stream(&self) -> Vec<Rc<Stream>> {
        self.streams.borrow().values().cloned().collect()
    }

    /// Fails parked writers and releases stream state when the
    /// connection goes down.
    fn close_streams(&self) {
        self.conn.request_close();
        for stream in self.each_stream() {
            stream.phase.set(StreamPhase::Closed);
            stream.wake();
        }
    }
}

/// Serves a connection that begins with the HTTP/2 preface.
pub(crate) async fn serve<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    conn: &Rc<Conn>,
    mut reader: ReadHalf<Transport>,
    peer: Peer,
    secure: bool,
) -> crate::Result<()> {
    let config = &shared.config;
    let mut buf = vec![0u8; config.buffer_size];
    let mut buf_len = 0usize;

    // The 24-octet preface opens every connection.
    while buf_len < PREFACE.len() {
        match read_more(shared, conn, &mut reader, &mut buf, &mut buf_len).await? {
            ReadOutcome::Data => {}
            ReadOutcome::Eof | ReadOutcome::Close => return Ok(()),
        }
    }
    if &buf[..PREFACE.len()] != PREFACE {
        // GOAWAY MAY be omitted here; just drop the connection.
        debug!("invalid connection preface from {}", peer.addr);
        return Ok(());
    }
    compact(&mut buf, &mut buf_len, PREFACE.len());

    let state = ConnState::new(
        Rc::clone(conn),
        config.buffer_size,
        config.http2_header_table_size,
    );
    state
        .send_settings(&[
            (SETTINGS_ENABLE_CONNECT_PROTOCOL, 0),
            (SETTINGS_MAX_FRAME_SIZE, state.max_frame_recv),
            (SETTINGS_HEADER_TABLE_SIZE, config.http2_header_table_size),
        ])
        .await?;

    let result = frame_loop(shared, &state, &mut reader, &mut buf, &mut buf_len, &peer, secure)
        .await;
    state.close_streams();
    result
}

/// Continues a connection upgraded from HTTP/1.1 (h2c): the original
/// request becomes stream 1 in the half-closed state, then the regular
/// preface + frame flow takes over.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn serve_upgraded<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    conn: &Rc<Conn>,
    mut reader: ReadHalf<Transport>,
    mut buf: Vec<u8>,
    mut buf_len: usize,
    head: RequestHead,
    body: BodyReader,
    peer: Peer,
) -> crate::Result<()> {
    let config = &shared.config;
    let state = ConnState::new(
        Rc::clone(conn),
        config.buffer_size,
        config.http2_header_table_size,
    );
    state.max_stream_id.set(1);

    let stream = Rc::new(Stream::new(
        1,
        i64::from(DEFAULT_INITIAL_WINDOW_SIZE),
        i64::from(DEFAULT_INITIAL_WINDOW_SIZE),
    ));
    stream.phase.set(StreamPhase::HalfClosed);
    {
        let mut block = stream.head.borrow_mut();
        block.method = head.method.clone();
        block.path = rebuild_target(&head);
        block.scheme = "http".to_owned();
        block.authority = head.server_addr.clone().unwrap_or_default();
        block.headers = head.headers.clone();
        block.content_length = head.content_length;
    }
    state.streams.borrow_mut().insert(1, Rc::clone(&stream));

    state
        .send_settings(&[
            (SETTINGS_MAX_FRAME_SIZE, state.max_frame_recv),
            (SETTINGS_HEADER_TABLE_SIZE, config.http2_header_table_size),
        ])
        .await?;

    dispatch_stream(shared, &state, &stream, Some(body), &peer, false);

    // The client still opens with the preface after the 101.
    while buf_len < PREFACE.len() {
        match read_more(shared, conn, &mut reader, &mut buf, &mut buf_len).await? {
            ReadOutcome::Data => {}
            ReadOutcome::Eof | ReadOutcome::Close => {
                state.close_streams();
                return Ok(());
            }
        }
    }
    if &buf[..PREFACE.len()] != PREFACE {
        debug!("missing preface after h2c upgrade");
        state.close_streams();
        return Ok(());
    }
    compact(&mut buf, &mut buf_len, PREFACE.len());

    let result = frame_loop(shared, &state, &mut reader, &mut buf, &mut buf_len, &peer, false)
        .await;
    state.close_streams();
    result
}

fn rebuild_target(head: &RequestHead) -> String {
    let mut target = String::with_capacity(head.path.len() + head.query.len() + 2);
    target.push('/');
    target.push_str(&head.path);
    if !head.query.is_empty() {
        target.push('?');
        target.push_str(&String::from_utf8_lossy(&head.query));
    }
    target
}

async fn frame_loop<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    state: &Rc<ConnState>,
    reader: &mut ReadHalf<Transport>,
    buf: &mut Vec<u8>,
    buf_len: &mut usize,
    peer: &Peer,
    secure: bool,
) -> crate::Result<()> {
    loop {
        while *buf_len >= FRAME_HEADER_LEN {
            let header = FrameHeader::parse(
                buf[..FRAME_HEADER_LEN].try_into().expect("frame header"),
            );

            // Client-initiated stream ids are odd.
            if header.stream_id != 0 && header.stream_id % 2 == 0 {
                return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
            }
            if header.len > state.max_frame_recv {
                return Err(state.goaway(Reason::FRAME_SIZE_ERROR).await);
            }
            let frame_len = FRAME_HEADER_LEN + header.len as usize;
            if frame_len > *buf_len {
                break;
            }

            let mut kind = header.kind;
            if state.continuation.get() != 0 {
                if kind == FrameKind::Continuation
                    && header.stream_id == state.continuation.get()
                {
                    kind = FrameKind::Headers;
                } else {
                    return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
                }
            }

            let outcome = {
                let payload = &buf[FRAME_HEADER_LEN..frame_len];
                match kind {
                    FrameKind::Settings => handle_settings(state, &header, payload).await?,
                    FrameKind::Headers => {
                        handle_headers(shared, state, &header, payload, peer, secure).await?
                    }
                    FrameKind::Data => {
                        handle_data(shared, state, &header, payload, peer, secure).await?
                    }
                    FrameKind::Priority => handle_priority(state, &header, payload).await?,
                    FrameKind::RstStream => handle_rst(state, &header, payload).await?,
                    FrameKind::Ping => handle_ping(state, &header, payload).await?,
                    FrameKind::WindowUpdate => {
                        handle_window_update(state, &header, payload).await?
                    }
                    FrameKind::GoAway => {
                        trace!("peer sent GOAWAY");
                        Flow::Shutdown
                    }
                    FrameKind::PushPromise | FrameKind::Continuation => {
                        // Clients must not push; CONTINUATION is only
                        // valid while a header block is open.
                        return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
                    }
                    FrameKind::Unknown(other) => {
                        // Unknown frame types are ignored and discarded.
                        trace!(kind = other, "ignoring unknown frame");
                        Flow::Continue
                    }
                }
            };
            compact(buf, buf_len, frame_len);
            if outcome == Flow::Shutdown {
                return Ok(());
            }
        }

        if state.conn.is_closing() {
            return Ok(());
        }
        match read_more(shared, &state.conn, reader, buf, buf_len).await? {
            ReadOutcome::Data => {}
            ReadOutcome::Eof | ReadOutcome::Close => return Ok(()),
        }
    }
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Shutdown,
}

async fn handle_settings(
    state: &Rc<ConnState>,
    header: &FrameHeader,
    payload: &[u8],
) -> crate::Result<Flow> {
    if (header.is_ack() && header.len != 0) || header.len % 6 != 0 {
        return Err(state.goaway(Reason::FRAME_SIZE_ERROR).await);
    }
    if header.stream_id != 0 {
        return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
    }
    if header.is_ack() {
        return Ok(Flow::Continue);
    }

    for entry in payload.chunks_exact(6) {
        let id = u16::from_be_bytes([entry[0], entry[1]]);
        let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
        match id {
            SETTINGS_ENABLE_PUSH => {
                if value > 1 {
                    return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
                }
            }
            SETTINGS_INITIAL_WINDOW_SIZE => {
                if i64::from(value) > MAX_WINDOW_SIZE {
                    return Err(state.goaway(Reason::FLOW_CONTROL_ERROR).await);
                }
                // The delta applies to every live stream's send window
                // and may unblock parked writers.
                let delta = i64::from(value) - i64::from(state.peer_initial_window.get());
                state.peer_initial_window.set(value as i32);
                for stream in state.each_stream() {
                    stream.send_window.set(stream.send_window.get() + delta);
                    stream.wake();
                }
            }
            SETTINGS_MAX_FRAME_SIZE => {
                if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                    return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
                }
                state.peer_max_frame.set(value);
            }
            _ => {
                // Unknown identifiers are ignored.
            }
        }
    }
    state.send_settings_ack().await?;
    Ok(Flow::Continue)
}

async fn handle_headers<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    state: &Rc<ConnState>,
    header: &FrameHeader,
    payload: &[u8],
    peer: &Peer,
    secure: bool,
) -> crate::Result<Flow> {
    if header.stream_id == 0 {
        return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
    }

    let mut pos = 0usize;
    let mut pad = 0usize;
    if header.is_padded() {
        let Some(&pad_len) = payload.first() else {
            return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
        };
        if u32::from(pad_len) > header.len {
            return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
        }
        pad = pad_len as usize;
        pos += 1;
    }
    if header.has_priority() {
        if payload.len() < pos + 5 {
            return Err(state.goaway(Reason::FRAME_SIZE_ERROR).await);
        }
        let dep = u32::from_be_bytes([
            payload[pos] & 0x7f,
            payload[pos + 1],
            payload[pos + 2],
            payload[pos + 3],
        ]);
        if dep == header.stream_id {
            return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
        }
        pos += 5;
    }
    if payload.len() < pos + pad {
        return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
    }
    let fragment = &payload[pos..payload.len() - pad];

    let stream = match state.stream(header.stream_id) {
        Some(stream) => {
            let continuing = state.continuation.get() != 0;
            if !header.is_end_stream()
                && stream.phase.get() == StreamPhase::Open
                && !continuing
            {
                return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
            }
            if stream.phase.get() == StreamPhase::HalfClosed && !continuing {
                return Err(state.goaway(Reason::STREAM_CLOSED).await);
            }
            if stream.phase.get() == StreamPhase::Closed {
                return Err(state.goaway(Reason::STREAM_CLOSED).await);
            }
            stream
        }
        None => {
            // Stream ids must strictly increase within a connection.
            if state.max_stream_id.get() >= header.stream_id {
                return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
            }
            state.max_stream_id.set(header.stream_id);
            let stream = Rc::new(Stream::new(
                header.stream_id,
                i64::from(state.peer_initial_window.get()),
                i64::from(DEFAULT_INITIAL_WINDOW_SIZE),
            ));
            state
                .streams
                .borrow_mut()
                .insert(header.stream_id, Rc::clone(&stream));
            stream
        }
    };

    if stream.phase.get() == StreamPhase::Idle {
        stream.phase.set(StreamPhase::Open);
    }
    if header.is_end_stream() {
        stream.phase.set(StreamPhase::HalfClosed);
    }

    let block_bytes: Vec<u8>;
    if header.is_end_headers() {
        state.continuation.set(0);
        let mut buffered = state.headers_buf.borrow_mut();
        if buffered.is_empty() {
            block_bytes = fragment.to_vec();
        } else {
            buffered.extend_from_slice(fragment);
            block_bytes = std::mem::take(&mut *buffered);
        }
    } else {
        state.continuation.set(header.stream_id);
        state.headers_buf.borrow_mut().extend_from_slice(fragment);
        return Ok(Flow::Continue);
    }

    {
        let mut head = stream.head.borrow_mut();
        let mut decoder = state.decoder.borrow_mut();
        if let Err(reason) = decoder.decode(&block_bytes, &mut head) {
            return Err(state.goaway(reason).await);
        }
    }

    if stream.phase.get() == StreamPhase::HalfClosed {
        dispatch_stream(shared, state, &stream, None, peer, secure);
    }
    Ok(Flow::Continue)
}

async fn handle_data<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    state: &Rc<ConnState>,
    header: &FrameHeader,
    payload: &[u8],
    peer: &Peer,
    secure: bool,
) -> crate::Result<Flow> {
    if header.stream_id == 0 {
        return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
    }

    let mut data = payload;
    if header.is_padded() {
        let Some(&pad_len) = payload.first() else {
            return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
        };
        if u32::from(pad_len) >= header.len {
            return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
        }
        data = &payload[1..payload.len() - pad_len as usize];
    }

    let Some(stream) = state.stream(header.stream_id) else {
        return Err(state.goaway(Reason::STREAM_CLOSED).await);
    };
    match stream.phase.get() {
        StreamPhase::Idle => return Err(state.goaway(Reason::PROTOCOL_ERROR).await),
        StreamPhase::HalfClosed | StreamPhase::Closed => {
            return Err(state.goaway(Reason::STREAM_CLOSED).await)
        }
        StreamPhase::Open => {}
    }

    // Account the whole frame against both receive windows.
    state.recv_window.set(state.recv_window.get() - i64::from(header.len));
    stream
        .recv_window
        .set(stream.recv_window.get() - i64::from(header.len));
    if state.recv_window.get() < 0 || stream.recv_window.get() < 0 {
        return Err(state.goaway(Reason::FLOW_CONTROL_ERROR).await);
    }

    {
        let mut body = stream.body.borrow_mut();
        if body.is_none() {
            let content_length = stream.head.borrow().content_length;
            match BodySink::new(content_length, shared.config.post_buffering) {
                Ok(sink) => *body = Some(sink),
                Err(err) => {
                    warn!("failed to buffer request body: {}", err);
                    return Err(state.goaway(Reason::INTERNAL_ERROR).await);
                }
            }
        }
        if let Some(sink) = body.as_mut() {
            if let Err(err) = sink.write(data) {
                warn!("failed to buffer request body: {}", err);
                return Err(state.goaway(Reason::INTERNAL_ERROR).await);
            }
        }
    }

    stream
        .consumed
        .set(stream.consumed.get() + data.len() as i64);
    let declared = stream.head.borrow().content_length;
    if declared != -1
        && (stream.consumed.get() > declared
            || (header.is_end_stream() && stream.consumed.get() != declared))
    {
        return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
    }

    if header.is_end_stream() {
        stream.phase.set(StreamPhase::HalfClosed);
        dispatch_stream(shared, state, &stream, None, peer, secure);
    } else {
        // Top the peer's windows back up once half the grant is gone.
        let initial = i64::from(DEFAULT_INITIAL_WINDOW_SIZE);
        if state.recv_window.get() < initial / 2 {
            let increment = (initial - state.recv_window.get()) as u32;
            state.recv_window.set(initial);
            state.send_window_update(0, increment).await?;
        }
        if stream.recv_window.get() < initial / 2 {
            let increment = (initial - stream.recv_window.get()) as u32;
            stream.recv_window.set(initial);
            state.send_window_update(stream.id, increment).await?;
        }
    }
    Ok(Flow::Continue)
}

async fn handle_priority(
    state: &Rc<ConnState>,
    header: &FrameHeader,
    payload: &[u8],
) -> crate::Result<Flow> {
    if header.len != 5 {
        return Err(state.goaway(Reason::FRAME_SIZE_ERROR).await);
    }
    if header.stream_id == 0 {
        return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
    }
    let dep = u32::from_be_bytes([payload[0] & 0x7f, payload[1], payload[2], payload[3]]);
    if dep == header.stream_id {
        return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
    }
    // No scheduling decisions are made here.
    Ok(Flow::Continue)
}

async fn handle_rst(
    state: &Rc<ConnState>,
    header: &FrameHeader,
    payload: &[u8],
) -> crate::Result<Flow> {
    if header.stream_id == 0 {
        return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
    }
    if header.len != 4 {
        return Err(state.goaway(Reason::FRAME_SIZE_ERROR).await);
    }
    let Some(stream) = state.stream(header.stream_id) else {
        return Err(state.goaway(Reason::STREAM_CLOSED).await);
    };
    if stream.phase.get() == StreamPhase::Idle {
        return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
    }
    let code = u32::from_be_bytes(payload.try_into().expect("length checked"));
    trace!(stream = header.stream_id, code, "stream reset by peer");
    stream.phase.set(StreamPhase::Closed);
    stream.wake();
    Ok(Flow::Continue)
}

async fn handle_ping(
    state: &Rc<ConnState>,
    header: &FrameHeader,
    payload: &[u8],
) -> crate::Result<Flow> {
    if header.len != 8 {
        return Err(state.goaway(Reason::FRAME_SIZE_ERROR).await);
    }
    if header.stream_id != 0 {
        return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
    }
    if !header.is_ack() {
        state.send_frame(FrameKind::Ping, FLAG_ACK, 0, payload).await?;
    }
    Ok(Flow::Continue)
}

async fn handle_window_update(
    state: &Rc<ConnState>,
    header: &FrameHeader,
    payload: &[u8],
) -> crate::Result<Flow> {
    if header.len != 4 {
        return Err(state.goaway(Reason::FRAME_SIZE_ERROR).await);
    }
    let increment = u32::from_be_bytes(payload.try_into().expect("length checked"));
    if increment == 0 {
        return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
    }

    if header.stream_id != 0 {
        let Some(stream) = state.stream(header.stream_id) else {
            return Err(state.goaway(Reason::STREAM_CLOSED).await);
        };
        if stream.phase.get() == StreamPhase::Idle {
            return Err(state.goaway(Reason::PROTOCOL_ERROR).await);
        }
        let result = stream.send_window.get() + i64::from(increment);
        if result > MAX_WINDOW_SIZE {
            stream.phase.set(StreamPhase::Closed);
            stream.wake();
            state.send_rst(header.stream_id, Reason::FLOW_CONTROL_ERROR).await?;
            return Ok(Flow::Continue);
        }
        stream.send_window.set(result);
        stream.wake();
    } else {
        let result = state.send_window.get() + i64::from(increment);
        if result > MAX_WINDOW_SIZE {
            return Err(state.goaway(Reason::FLOW_CONTROL_ERROR).await);
        }
        state.send_window.set(result);
        // The connection window may unblock any stream's writer.
        for stream in state.each_stream() {
            stream.wake();
        }
    }
    Ok(Flow::Continue)
}

/// Hands a completed stream to the application.
fn dispatch_stream<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    state: &Rc<ConnState>,
    stream: &Rc<Stream>,
    upgraded_body: Option<BodyReader>,
    peer: &Peer,
    secure: bool,
) {
    state.conn.begin_request();
    let shared = Rc::clone(shared);
    let state = Rc::clone(state);
    let stream = Rc::clone(stream);
    let peer = peer.clone();
    tokio::task::spawn_local(async move {
        let head = std::mem::take(&mut *stream.head.borrow_mut());
        let body = match upgraded_body {
            Some(body) => Ok(body),
            None => match stream.body.borrow_mut().take() {
                Some(sink) => sink.finish(),
                None => Ok(BodyReader::Empty),
            },
        };
        let result = match body {
            Ok(body) => {
                let request = build_request(&shared, head, body, &peer, secure);
                let sink = ResponseSink::h2(H2Sink {
                    state: Rc::clone(&state),
                    stream: Rc::clone(&stream),
                    headers_sent: false,
                    finished: false,
                });
                shared.handler.process_request(request, sink).await
            }
            Err(err) => Err(crate::Error::new_body(err)),
        };
        state.conn.end_request();
        if let Err(err) = result {
            debug!(stream = stream.id, "handler failed: {}", err);
            if !stream.is_closed() {
                stream.phase.set(StreamPhase::Closed);
                let _ = state.send_rst(stream.id, Reason::INTERNAL_ERROR).await;
            }
        }
    });
}

fn build_request<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    head: HeaderBlock,
    body: BodyReader,
    peer: &Peer,
    secure: bool,
) -> Request {
    let (path, query) = split_uri(&head.path);
    Request {
        method: head.method,
        path,
        query,
        protocol: "HTTP/2".to_owned(),
        secure: secure || head.scheme == "https",
        server_addr: if head.authority.is_empty() {
            peer.server.clone()
        } else {
            head.authority
        },
        remote_addr: peer.addr,
        remote_port: peer.port,
        headers: head.headers,
        content_length: head.content_length,
        body,
        started: Instant::now(),
        worker: shared.worker,
    }
}

/// The per-stream response sink.
pub(crate) struct H2Sink {
    state: Rc<ConnState>,
    stream: Rc<Stream>,
    headers_sent: bool,
    finished: bool,
}

impl H2Sink {
    pub(crate) async fn write_headers(
        &mut self,
        status: StatusCode,
        headers: &Headers,
    ) -> crate::Result<()> {
        if self.headers_sent {
            return Err(crate::Error::new_user_headers_already_sent());
        }
        self.headers_sent = true;

        let mut block = Vec::with_capacity(128);
        self.state
            .encoder
            .encode_response(&mut block, status.as_u16(), headers);
        if !headers.contains("DATE") {
            let mut value = Vec::with_capacity(date::DATE_VALUE_LENGTH);
            date::extend(&mut value);
            self.state.encoder.encode_header(
                &mut block,
                "date",
                std::str::from_utf8(&value).expect("date cache is ASCII"),
            );
        }

        // A large block continues across CONTINUATION frames.
        let max = self.state.peer_max_frame.get() as usize;
        let mut chunks = block.chunks(max).peekable();
        let mut first = true;
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            let flags = if last { FLAG_END_HEADERS } else { 0 };
            let kind = if first {
                FrameKind::Headers
            } else {
                FrameKind::Continuation
            };
            self.state
                .send_frame(kind, flags, self.stream.id, chunk)
                .await?;
            first = false;
        }
        Ok(())
    }

    pub(crate) async fn write(&mut self, data: &[u8]) -> crate::Result<()> {
        if !self.headers_sent {
            return Err(crate::Error::new_user_headers_not_sent());
        }
        if self.finished {
            return Err(crate::Error::new_closed());
        }

        let mut remaining = data;
        while !remaining.is_empty() {
            if self.stream.is_closed() || self.state.conn.is_closing() {
                return Err(crate::Error::new_closed());
            }
            // Stream flow control is honored before connection flow
            // control, and chunks respect the peer's max frame size.
            let effective = self
                .stream
                .send_window
                .get()
                .min(self.state.send_window.get())
                .min(i64::from(self.state.peer_max_frame.get()));
            if effective <= 0 {
                self.stream.window_opened().await;
                continue;
            }
            let n = remaining.len().min(effective as usize);
            let (chunk, rest) = remaining.split_at(n);
            self.state
                .send_frame(FrameKind::Data, 0, self.stream.id, chunk)
                .await?;
            // Decrement by the bytes actually framed.
            self.stream
                .send_window
                .set(self.stream.send_window.get() - n as i64);
            self.state
                .send_window
                .set(self.state.send_window.get() - n as i64);
            remaining = rest;
        }
        Ok(())
    }

    pub(crate) async fn finish(&mut self) -> crate::Result<()> {
        if !self.headers_sent {
            return Err(crate::Error::new_user_headers_not_sent());
        }
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.state
            .send_frame(FrameKind::Data, FLAG_END_STREAM, self.stream.id, &[])
            .await?;
        self.stream.phase.set(StreamPhase::Closed);
        self.state.streams.borrow_mut().remove(&self.stream.id);
        Ok(())
    }
}

impl std::fmt::Debug for H2Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Sink")
            .field("stream", &self.stream.id)
            .field("headers_sent", &self.headers_sent)
            .finish()
    }
}

enum ReadOutcome {
    Data,
    Eof,
    Close,
}

async fn read_more<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    conn: &Rc<Conn>,
    reader: &mut ReadHalf<Transport>,
    buf: &mut [u8],
    buf_len: &mut usize,
) -> crate::Result<ReadOutcome> {
    tokio::select! {
        read = reader.read(&mut buf[*buf_len..]) => match read {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => {
                *buf_len += n;
                conn.last_io.set(shared.tick.get());
                Ok(ReadOutcome::Data)
            }
            Err(err) => Err(crate::Error::new_io(err)),
        },
        _ = conn.close.notified() => Ok(ReadOutcome::Close),
    }
}

fn compact(buf: &mut [u8], buf_len: &mut usize, consumed: usize) {
    debug_assert!(consumed <= *buf_len);
    buf.copy_within(consumed..*buf_len, 0);
    *buf_len -= consumed;
}
