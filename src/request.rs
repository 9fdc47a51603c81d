//! The uniform request record and the response contract.

use std::net::IpAddr;
use std::time::Instant;

use bytes::Bytes;
use http::StatusCode;

use crate::body::BodyReader;
use crate::headers::Headers;
use crate::proto::fcgi::FcgiSink;
use crate::proto::h1::H1Sink;
use crate::proto::h2::H2Sink;
use crate::proto::ws::WebSocket;

/// One parsed request, the same record no matter which wire protocol
/// carried it.
#[derive(Debug)]
pub struct Request {
    /// Request method verbatim (`GET`, `POST`, ...).
    pub method: String,
    /// Request path with leading slashes stripped; percent escapes are
    /// preserved as sent.
    pub path: String,
    /// Raw bytes after `?`, empty when there was no query.
    pub query: Bytes,
    /// Protocol version string (`HTTP/1.1`, `HTTP/2`).
    pub protocol: String,
    /// Whether the transport (or a trusted frontend) is TLS.
    pub secure: bool,
    /// The address the request was addressed to (`Host`, `:authority`
    /// or the CGI server name).
    pub server_addr: String,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub headers: Headers,
    /// Declared body length; `-1` when unknown.
    pub content_length: i64,
    /// The buffered request body, rewound to the start.
    pub body: BodyReader,
    /// When the first byte of this request was parsed.
    pub started: Instant,
    /// Index of the worker thread serving this request.
    pub worker: usize,
}

/// The write side of one request.
///
/// `write_headers` must be called exactly once before any `write`;
/// `finish` completes the response. The WebSocket verbs are valid only
/// after a successful [`websocket_handshake`](Self::websocket_handshake).
#[derive(Debug)]
pub struct ResponseSink {
    inner: SinkInner,
}

#[derive(Debug)]
enum SinkInner {
    H1(H1Sink),
    H2(H2Sink),
    Fcgi(FcgiSink),
}

impl ResponseSink {
    pub(crate) fn h1(sink: H1Sink) -> ResponseSink {
        ResponseSink {
            inner: SinkInner::H1(sink),
        }
    }

    pub(crate) fn h2(sink: H2Sink) -> ResponseSink {
        ResponseSink {
            inner: SinkInner::H2(sink),
        }
    }

    pub(crate) fn fcgi(sink: FcgiSink) -> ResponseSink {
        ResponseSink {
            inner: SinkInner::Fcgi(sink),
        }
    }

    /// Sends the response status and headers.
    pub async fn write_headers(
        &mut self,
        status: StatusCode,
        headers: Headers,
    ) -> crate::Result<()> {
        match &mut self.inner {
            SinkInner::H1(sink) => sink.write_headers(status, &headers).await,
            SinkInner::H2(sink) => sink.write_headers(status, &headers).await,
            SinkInner::Fcgi(sink) => sink.write_headers(status, &headers).await,
        }
    }

    /// Writes a chunk of the response body.
    pub async fn write(&mut self, data: &[u8]) -> crate::Result<()> {
        match &mut self.inner {
            SinkInner::H1(sink) => sink.write(data).await,
            SinkInner::H2(sink) => sink.write(data).await,
            SinkInner::Fcgi(sink) => sink.write(data).await,
        }
    }

    /// Completes the response.
    pub async fn finish(&mut self) -> crate::Result<()> {
        match &mut self.inner {
            SinkInner::H1(sink) => sink.finish().await,
            SinkInner::H2(sink) => sink.finish().await,
            SinkInner::Fcgi(sink) => sink.finish().await,
        }
    }

    /// Upgrades an HTTP/1.1 connection to WebSocket.
    ///
    /// Empty `key`, `origin` or `subprotocol` fall back to the request's
    /// `Sec-WebSocket-Key`, `Origin` and `Sec-WebSocket-Protocol`
    /// headers. The key must be present and at least 16 bytes long.
    /// On success the `101 Switching Protocols` response is written and
    /// the connection's protocol is swapped; the returned handle sends
    /// frames to the peer.
    pub async fn websocket_handshake(
        &mut self,
        key: &str,
        origin: &str,
        subprotocol: &str,
    ) -> crate::Result<WebSocket> {
        match &mut self.inner {
            SinkInner::H1(sink) => sink.websocket_handshake(key, origin, subprotocol).await,
            _ => Err(crate::Error::new_user_handshake_version()),
        }
    }

    /// The WebSocket handle, once the handshake has completed.
    pub fn websocket(&self) -> Option<WebSocket> {
        match &self.inner {
            SinkInner::H1(sink) => sink.websocket(),
            _ => None,
        }
    }

    /// Sends a WebSocket text message.
    pub fn send_text(&self, message: &str) -> crate::Result<()> {
        self.ws()?.send_text(message)
    }

    /// Sends a WebSocket binary message.
    pub fn send_binary(&self, message: &[u8]) -> crate::Result<()> {
        self.ws()?.send_binary(message)
    }

    /// Sends a WebSocket ping (payload capped at 125 bytes).
    pub fn send_ping(&self, payload: &[u8]) -> crate::Result<()> {
        self.ws()?.send_ping(payload)
    }

    /// Sends a WebSocket close frame and tears the connection down.
    pub fn close(&self, code: u16, reason: &str) -> crate::Result<()> {
        self.ws()?.close(code, reason)
    }

    fn ws(&self) -> crate::Result<WebSocket> {
        self.websocket().ok_or_else(crate::Error::new_user_not_upgraded)
    }
}
