//! The application collaborator.

use std::future::Future;

use crate::request::{Request, ResponseSink};
use crate::proto::ws::WebSocket;

/// The embedded application. One instance is shared by every worker
/// thread; request processing runs on the worker that owns the
/// connection.
///
/// Only [`process_request`](Self::process_request) is required. The
/// WebSocket callbacks fire on connections the handler upgraded via
/// [`ResponseSink::websocket_handshake`]; replies go through the
/// [`WebSocket`] handle.
pub trait Handler: Send + Sync + 'static {
    /// Handles one request. The handler must call
    /// `sink.write_headers(..)` exactly once before writing the body.
    fn process_request(
        &self,
        request: Request,
        sink: ResponseSink,
    ) -> impl Future<Output = crate::Result<()>>;

    /// Runs once in every worker after it is set up, before traffic.
    fn post_fork_init(&self, _worker: usize) {}

    /// Runs when a graceful shutdown begins.
    fn shutting_down(&self) {}

    /// One WebSocket text frame; `fin` marks the end of the message.
    fn text_frame(&self, _ws: &WebSocket, _data: &str, _fin: bool) {}

    /// One WebSocket binary frame; `fin` marks the end of the message.
    fn binary_frame(&self, _ws: &WebSocket, _data: &[u8], _fin: bool) {}

    /// A complete (possibly reassembled) WebSocket text message.
    fn text_message(&self, _ws: &WebSocket, _data: &str) {}

    /// A complete (possibly reassembled) WebSocket binary message.
    fn binary_message(&self, _ws: &WebSocket, _data: &[u8]) {}

    /// An inbound Ping; the engine already answered with a Pong.
    fn ping(&self, _ws: &WebSocket, _payload: &[u8]) {}

    /// An inbound Pong.
    fn pong(&self, _ws: &WebSocket, _payload: &[u8]) {}

    /// The peer closed the WebSocket (1005 when no code was sent).
    fn closed(&self, _code: u16, _reason: &str) {}
}
