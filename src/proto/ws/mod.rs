//! WebSocket support: framing, the send handle, and the post-upgrade
//! connection driver.

pub(crate) mod conn;
pub(crate) mod frame;

pub(crate) use self::conn::serve;

use std::cell::Cell;
use std::rc::Rc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use self::frame::OpCode;

/// Outbound traffic queued by the application.
pub(crate) enum WsOut {
    Frame(Vec<u8>),
    /// A close frame; the connection is torn down after it flushes.
    Close(Vec<u8>),
}

/// Sends frames on an upgraded connection.
///
/// The handle queues frames on the connection's writer; sends never
/// block and fail once the connection is closed. Handles are cheap to
/// clone and are only usable on the worker thread that owns the
/// connection.
#[derive(Clone)]
pub struct WebSocket {
    inner: Rc<WsInner>,
}

struct WsInner {
    tx: UnboundedSender<WsOut>,
    closed: Cell<bool>,
}

impl WebSocket {
    pub(crate) fn channel() -> (WebSocket, UnboundedReceiver<WsOut>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            WebSocket {
                inner: Rc::new(WsInner {
                    tx,
                    closed: Cell::new(false),
                }),
            },
            rx,
        )
    }

    /// Sends a text message in a single frame.
    pub fn send_text(&self, message: &str) -> crate::Result<()> {
        self.send_data(OpCode::Text, message.as_bytes())
    }

    /// Sends a binary message in a single frame.
    pub fn send_binary(&self, message: &[u8]) -> crate::Result<()> {
        self.send_data(OpCode::Binary, message)
    }

    /// Sends a Ping; the payload is capped at 125 bytes.
    pub fn send_ping(&self, payload: &[u8]) -> crate::Result<()> {
        let payload = &payload[..payload.len().min(125)];
        self.send_data(OpCode::Ping, payload)
    }

    pub(crate) fn send_pong(&self, payload: &[u8]) -> crate::Result<()> {
        self.send_data(OpCode::Pong, payload)
    }

    /// Sends a Close frame; the connection closes once it flushes.
    pub fn close(&self, code: u16, reason: &str) -> crate::Result<()> {
        if self.inner.closed.replace(true) {
            return Err(crate::Error::new_closed());
        }
        self.inner
            .tx
            .send(WsOut::Close(frame::close_frame(code, reason)))
            .map_err(|_| crate::Error::new_closed())
    }

    fn send_data(&self, opcode: OpCode, payload: &[u8]) -> crate::Result<()> {
        if self.inner.closed.get() {
            return Err(crate::Error::new_closed());
        }
        let mut data = frame::server_frame_header(opcode, payload.len() as u64);
        data.extend_from_slice(payload);
        self.inner
            .tx
            .send(WsOut::Frame(data))
            .map_err(|_| crate::Error::new_closed())
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}
