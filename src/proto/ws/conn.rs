//! The WebSocket connection driver, entered after a successful
//! HTTP/1.1 upgrade.

use std::rc::Rc;

use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use super::frame::{self, OpCode};
use super::{WebSocket, WsOut};
use crate::engine::EngineShared;
use crate::proto::Conn;
use crate::service::Handler;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Head,
    Size,
    Mask,
    Payload,
}

struct WsState {
    phase: Phase,
    /// Bytes the current phase still needs.
    need: usize,
    fin: bool,
    opcode: OpCode,
    payload_size: u64,
    mask: [u8; 4],
    /// Current frame payload, unmasked incrementally.
    payload: Vec<u8>,
    /// Reassembled message across fragments.
    message: Vec<u8>,
    continue_opcode: Option<OpCode>,
    /// Prefix of `message` already delivered through frame callbacks.
    delivered: usize,
    /// Prefix of `message` known to be valid UTF-8.
    validated: usize,
}

impl WsState {
    fn new() -> WsState {
        WsState {
            phase: Phase::Head,
            need: 2,
            fin: false,
            opcode: OpCode::Continue,
            payload_size: 0,
            mask: [0; 4],
            payload: Vec::new(),
            message: Vec::new(),
            continue_opcode: None,
            delivered: 0,
            validated: 0,
        }
    }

    fn reset_message(&mut self) {
        self.message.clear();
        self.continue_opcode = None;
        self.delivered = 0;
        self.validated = 0;
    }
}

/// Drives an upgraded connection until close. `buf`/`buf_len` carry any
/// bytes that arrived behind the handshake request.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn serve<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    conn: &Rc<Conn>,
    mut reader: ReadHalf<Transport>,
    mut buf: Vec<u8>,
    mut buf_len: usize,
    ws: WebSocket,
    outbound: UnboundedReceiver<WsOut>,
) -> crate::Result<()> {
    // The connection stays in flight for its whole upgraded life so the
    // idle sweeper leaves it alone.
    conn.begin_request();
    let result = drive(shared, conn, &mut reader, &mut buf, &mut buf_len, &ws, outbound).await;
    conn.end_request();
    result
}

async fn drive<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    conn: &Rc<Conn>,
    reader: &mut ReadHalf<Transport>,
    buf: &mut Vec<u8>,
    buf_len: &mut usize,
    ws: &WebSocket,
    mut outbound: UnboundedReceiver<WsOut>,
) -> crate::Result<()> {
    // Application sends are queued; this task owns the socket write
    // order so control replies and data frames never interleave badly.
    let flusher = {
        let conn = Rc::clone(conn);
        tokio::task::spawn_local(async move {
            while let Some(out) = outbound.recv().await {
                match out {
                    WsOut::Frame(data) => {
                        if conn.write_all(&data).await.is_err() {
                            return;
                        }
                        let _ = conn.flush().await;
                    }
                    WsOut::Close(data) => {
                        let _ = conn.write_all(&data).await;
                        let _ = conn.flush().await;
                        conn.request_close();
                        return;
                    }
                }
            }
        })
    };

    let max_message = shared.config.websocket_max_size * 1024;
    let mut state = WsState::new();
    let handler = std::sync::Arc::clone(&shared.handler);

    let result = loop {
        // Consume whatever the buffer already holds.
        let mut offset = 0;
        while *buf_len - offset > 0 {
            let available = &mut buf[offset..*buf_len];
            match step(&mut state, available, max_message, ws, &*handler, conn).await {
                Ok(StepResult::Consumed(n)) => offset += n,
                Ok(StepResult::NeedMore) => break,
                Ok(StepResult::Closed) => {
                    // Remaining input is irrelevant on a closed
                    // connection.
                    offset = *buf_len;
                    break;
                }
                Err(err) => {
                    // Framing violation: close 1002 and drop the peer.
                    let reply = frame::close_frame(frame::CLOSE_CODE_PROTOCOL_ERROR, "");
                    let _ = conn.write_all(&reply).await;
                    conn.request_close();
                    flusher.abort();
                    return Err(err);
                }
            }
        }
        buf.copy_within(offset..*buf_len, 0);
        *buf_len -= offset;

        if conn.is_closing() {
            break Ok(());
        }

        tokio::select! {
            read = reader.read(&mut buf[*buf_len..]) => match read {
                Ok(0) => {
                    // Peer vanished without a Close frame.
                    handler.closed(frame::CLOSE_CODE_MISSING, "");
                    break Ok(());
                }
                Ok(n) => {
                    *buf_len += n;
                    conn.last_io.set(shared.tick.get());
                }
                Err(err) => break Err(crate::Error::new_io(err)),
            },
            _ = conn.close.notified() => break Ok(()),
        }
    };

    flusher.abort();
    result
}

enum StepResult {
    Consumed(usize),
    NeedMore,
    Closed,
}

/// Feeds available bytes to the state machine, returning how many were
/// consumed. Framing errors bubble up as `Err`.
async fn step<H: Handler>(
    state: &mut WsState,
    available: &mut [u8],
    max_message: usize,
    ws: &WebSocket,
    handler: &H,
    conn: &Rc<Conn>,
) -> crate::Result<StepResult> {
    match state.phase {
        Phase::Head => {
            if available.len() < 2 {
                return Ok(StepResult::NeedMore);
            }
            let head = frame::parse_head(
                available[0],
                available[1],
                state.continue_opcode.is_some(),
            )
            .map_err(|()| crate::Error::new_ws_protocol())?;

            state.fin = head.fin;
            state.opcode = head.opcode;
            if matches!(head.opcode, OpCode::Text | OpCode::Binary) {
                state.reset_message();
                if !head.fin {
                    state.continue_opcode = Some(head.opcode);
                }
            }
            match head.payload_len {
                126 => {
                    state.phase = Phase::Size;
                    state.need = 2;
                }
                127 => {
                    state.phase = Phase::Size;
                    state.need = 8;
                }
                n => {
                    state.payload_size = u64::from(n);
                    state.phase = Phase::Mask;
                    state.need = 4;
                }
            }
            Ok(StepResult::Consumed(2))
        }
        Phase::Size => {
            if available.len() < state.need {
                return Ok(StepResult::NeedMore);
            }
            let size = if state.need == 2 {
                u64::from(u16::from_be_bytes([available[0], available[1]]))
            } else {
                u64::from_be_bytes(available[..8].try_into().expect("need == 8"))
            };
            if size > max_message as u64 {
                warn!(size, max_message, "websocket payload too large");
                let reply = frame::close_frame(frame::CLOSE_CODE_TOO_MUCH_DATA, "");
                let _ = conn.write_all(&reply).await;
                let _ = conn.flush().await;
                conn.request_close();
                return Ok(StepResult::Closed);
            }
            let consumed = state.need;
            state.payload_size = size;
            state.phase = Phase::Mask;
            state.need = 4;
            Ok(StepResult::Consumed(consumed))
        }
        Phase::Mask => {
            if available.len() < 4 {
                return Ok(StepResult::NeedMore);
            }
            state.mask.copy_from_slice(&available[..4]);
            state.phase = Phase::Payload;
            state.need = state.payload_size as usize;
            state.payload.clear();
            state.payload.reserve(state.need);
            if state.need == 0 {
                // Zero-length payload: the frame completes immediately.
                let closed = finish_frame(state, ws, handler, conn).await?;
                state.phase = Phase::Head;
                state.need = 2;
                return Ok(if closed {
                    StepResult::Closed
                } else {
                    StepResult::Consumed(4)
                });
            }
            Ok(StepResult::Consumed(4))
        }
        Phase::Payload => {
            if available.is_empty() {
                return Ok(StepResult::NeedMore);
            }
            let take = available.len().min(state.need);
            let chunk = &mut available[..take];
            frame::unmask(chunk, state.mask, state.payload.len());
            state.payload.extend_from_slice(chunk);
            state.need -= take;
            if state.need > 0 {
                return Ok(StepResult::Consumed(take));
            }
            let closed = finish_frame(state, ws, handler, conn).await?;
            state.phase = Phase::Head;
            state.need = 2;
            Ok(if closed {
                StepResult::Closed
            } else {
                StepResult::Consumed(take)
            })
        }
    }
}

/// Handles one complete frame; returns true when the connection is done.
async fn finish_frame<H: Handler>(
    state: &mut WsState,
    ws: &WebSocket,
    handler: &H,
    conn: &Rc<Conn>,
) -> crate::Result<bool> {
    let opcode = match state.opcode {
        OpCode::Continue => state
            .continue_opcode
            .ok_or_else(crate::Error::new_ws_protocol)?,
        other => other,
    };

    match opcode {
        OpCode::Text => {
            state.message.extend_from_slice(&state.payload);
            let valid = validate_utf8_prefix(&state.message, state.validated)
                .ok_or_else(crate::Error::new_ws_protocol)?;
            state.validated = valid;
            if state.fin && valid != state.message.len() {
                // Truncated multi-byte sequence at end of message.
                return Err(crate::Error::new_ws_protocol());
            }
            if valid > state.delivered {
                let text = std::str::from_utf8(&state.message[state.delivered..valid])
                    .expect("validated prefix");
                handler.text_frame(ws, text, state.fin);
                state.delivered = valid;
            } else if state.delivered == valid {
                // Frame ended mid-codepoint; still announce the (empty)
                // fragment so FIN ordering stays observable.
                handler.text_frame(ws, "", state.fin);
            }
            if state.fin {
                let text =
                    std::str::from_utf8(&state.message).expect("validated message");
                handler.text_message(ws, text);
                state.reset_message();
            }
        }
        OpCode::Binary => {
            state.message.extend_from_slice(&state.payload);
            handler.binary_frame(ws, &state.payload, state.fin);
            if state.fin {
                handler.binary_message(ws, &state.message);
                state.reset_message();
            }
        }
        OpCode::Close => {
            let (code, reason) = parse_close_payload(&state.payload);
            handler.closed(code, &reason);
            let echo = frame::normalize_close_code(code, state.payload.is_empty());
            let reply = frame::close_frame(echo, &reason);
            let _ = conn.write_all(&reply).await;
            let _ = conn.flush().await;
            conn.request_close();
            return Ok(true);
        }
        OpCode::Ping => {
            // Pong echoes the ping payload and flushes right away.
            let payload = &state.payload[..state.payload.len().min(125)];
            ws.send_pong(payload)?;
            handler.ping(ws, payload);
        }
        OpCode::Pong => {
            handler.pong(ws, &state.payload);
        }
        OpCode::Continue => unreachable!("mapped to the continued opcode above"),
    }
    Ok(false)
}

/// Extracts the close code and UTF-8 reason from a Close payload.
fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() < 2 {
        return (frame::CLOSE_CODE_MISSING, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    match std::str::from_utf8(&payload[2..]) {
        Ok(reason) => (code, reason.to_owned()),
        Err(_) => {
            debug!("close reason is not valid UTF-8");
            (frame::CLOSE_CODE_PROTOCOL_ERROR, String::new())
        }
    }
}

/// Returns the length of the longest valid UTF-8 prefix, or `None` when
/// the bytes contain an outright invalid sequence (as opposed to a
/// truncated trailing codepoint).
fn validate_utf8_prefix(data: &[u8], already_valid: usize) -> Option<usize> {
    match std::str::from_utf8(&data[already_valid..]) {
        Ok(_) => Some(data.len()),
        Err(err) => {
            if err.error_len().is_some() {
                None
            } else {
                Some(already_valid + err.valid_up_to())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_prefix_handles_split_codepoints() {
        // "é" is 0xC3 0xA9; split across frames.
        assert_eq!(validate_utf8_prefix(b"ab\xc3", 0), Some(2));
        assert_eq!(validate_utf8_prefix(b"ab\xc3\xa9c", 2), Some(5));
        assert_eq!(validate_utf8_prefix(b"ab\xff", 0), None);
    }

    #[test]
    fn close_payload_parsing() {
        assert_eq!(parse_close_payload(&[]), (1005, String::new()));
        assert_eq!(parse_close_payload(&[0x03, 0xe8]), (1000, String::new()));
        assert_eq!(
            parse_close_payload(&[0x03, 0xe9, b'b', b'y', b'e']),
            (1001, "bye".to_owned())
        );
        assert_eq!(parse_close_payload(&[0x03, 0xe8, 0xff]), (1002, String::new()));
    }
}
