use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use base64::Engine as _;
use http::StatusCode;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, trace, warn};

use super::encode;
use super::parse::{self, ConnPolicy, RequestHead};
use crate::body::{BodyReader, BodySink};
use crate::engine::EngineShared;
use crate::headers::Headers;
use crate::proto::ws::{WebSocket, WsOut};
use crate::proto::{h2, ws, Conn};
use crate::request::{Request, ResponseSink};
use crate::service::Handler;
use crate::transport::{Peer, Transport};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Response state for one HTTP/1.1 exchange, shared between the sink
/// handed to the handler and the connection driver.
pub(crate) struct Reply {
    is_http11: bool,
    fallback: ConnPolicy,
    connection: Cell<ConnPolicy>,
    headers_sent: Cell<bool>,
    finished: Cell<bool>,
    ws: RefCell<Option<WebSocket>>,
    ws_outbound: RefCell<Option<UnboundedReceiver<WsOut>>>,
    // Handshake fallbacks taken from the request head.
    ws_key: String,
    ws_origin: String,
    ws_protocol: String,
}

impl Reply {
    fn new(head: &RequestHead) -> Reply {
        Reply {
            is_http11: head.is_http11(),
            fallback: head.connection,
            connection: Cell::new(ConnPolicy::NotSet),
            headers_sent: Cell::new(false),
            finished: Cell::new(false),
            ws: RefCell::new(None),
            ws_outbound: RefCell::new(None),
            ws_key: head.headers.get("SEC_WEBSOCKET_KEY").unwrap_or("").to_owned(),
            ws_origin: head.headers.get("ORIGIN").unwrap_or("").to_owned(),
            ws_protocol: head
                .headers
                .get("SEC_WEBSOCKET_PROTOCOL")
                .unwrap_or("")
                .to_owned(),
        }
    }

    fn upgraded(&self) -> bool {
        self.ws.borrow().is_some()
    }
}

/// The HTTP/1.1 response sink.
pub(crate) struct H1Sink {
    conn: Rc<Conn>,
    reply: Rc<Reply>,
}

impl H1Sink {
    pub(crate) async fn write_headers(
        &mut self,
        status: StatusCode,
        headers: &Headers,
    ) -> crate::Result<()> {
        if self.reply.headers_sent.replace(true) {
            return Err(crate::Error::new_user_headers_already_sent());
        }
        let mut head = Vec::with_capacity(256);
        let policy = encode::encode_head(
            &mut head,
            status,
            headers,
            self.reply.fallback,
            self.reply.is_http11,
        );
        self.reply.connection.set(policy);
        self.conn.write_all(&head).await
    }

    pub(crate) async fn write(&mut self, data: &[u8]) -> crate::Result<()> {
        if !self.reply.headers_sent.get() {
            return Err(crate::Error::new_user_headers_not_sent());
        }
        if self.reply.finished.get() {
            return Err(crate::Error::new_closed());
        }
        self.conn.write_all(data).await
    }

    pub(crate) async fn finish(&mut self) -> crate::Result<()> {
        if !self.reply.headers_sent.get() {
            return Err(crate::Error::new_user_headers_not_sent());
        }
        self.reply.finished.set(true);
        self.conn.flush().await
    }

    pub(crate) fn websocket(&self) -> Option<WebSocket> {
        self.reply.ws.borrow().clone()
    }

    pub(crate) async fn websocket_handshake(
        &mut self,
        key: &str,
        origin: &str,
        subprotocol: &str,
    ) -> crate::Result<WebSocket> {
        if let Some(ws) = self.websocket() {
            return Ok(ws);
        }
        if self.reply.headers_sent.get() {
            return Err(crate::Error::new_user_headers_already_sent());
        }

        let key = if key.is_empty() {
            self.reply.ws_key.as_str()
        } else {
            key
        };
        let key = key.trim();
        if key.len() < 16 {
            warn!("refusing websocket handshake without a usable key");
            return Err(crate::Error::new_user_handshake_key());
        }

        let mut digest = Sha1::new();
        digest.update(key.as_bytes());
        digest.update(WEBSOCKET_GUID.as_bytes());
        let accept = base64::engine::general_purpose::STANDARD.encode(digest.finalize());

        let mut headers = Headers::new();
        headers.push_normalized("UPGRADE", "WebSocket");
        headers.push_normalized("CONNECTION", "Upgrade");
        let origin = if origin.is_empty() {
            self.reply.ws_origin.as_str()
        } else {
            origin
        };
        headers.push_normalized(
            "SEC_WEBSOCKET_ORIGIN",
            if origin.is_empty() { "*" } else { origin },
        );
        let subprotocol = if subprotocol.is_empty() {
            self.reply.ws_protocol.as_str()
        } else {
            subprotocol
        };
        if !subprotocol.is_empty() {
            headers.push_normalized("SEC_WEBSOCKET_PROTOCOL", subprotocol);
        }
        headers.push_normalized("SEC_WEBSOCKET_ACCEPT", accept);

        self.write_headers(StatusCode::SWITCHING_PROTOCOLS, &headers)
            .await?;
        self.conn.flush().await?;

        let (ws, outbound) = WebSocket::channel();
        *self.reply.ws.borrow_mut() = Some(ws.clone());
        *self.reply.ws_outbound.borrow_mut() = Some(outbound);
        Ok(ws)
    }
}

impl std::fmt::Debug for H1Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H1Sink")
            .field("headers_sent", &self.reply.headers_sent.get())
            .finish()
    }
}

/// Drives one HTTP/1.1 connection: parse, dispatch, repeat while
/// keep-alive holds; hand off on upgrade.
pub(crate) async fn serve<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    conn: &Rc<Conn>,
    mut reader: ReadHalf<Transport>,
    peer: Peer,
    secure: bool,
) -> crate::Result<()> {
    let buffer_size = shared.config.buffer_size;
    let mut buf = vec![0u8; buffer_size];
    let mut buf_len = 0usize;

    loop {
        if conn.is_closing() {
            return Ok(());
        }

        let parsed = parse::parse_head(&buf[..buf_len], shared.config.using_frontend_proxy)
            .map_err(crate::Error::from)?;
        let Some((head, consumed)) = parsed else {
            if buf_len == buffer_size {
                // The head does not fit the parse buffer.
                let _ = conn.write_all(&encode::uri_too_long()).await;
                return Err(crate::Error::new_uri_too_long());
            }
            match read_more(shared, conn, &mut reader, &mut buf, &mut buf_len).await? {
                ReadOutcome::Data => continue,
                ReadOutcome::Eof => {
                    return if buf_len > 0 {
                        Err(crate::Error::new_incomplete())
                    } else {
                        Ok(())
                    };
                }
                ReadOutcome::Close => return Ok(()),
            }
        };
        compact(&mut buf, &mut buf_len, consumed);
        let started = Instant::now();

        let body = if head.content_length > 0 {
            read_body(shared, conn, &mut reader, &mut buf, &mut buf_len, &head).await?
        } else {
            BodyReader::Empty
        };

        // Clear-text HTTP/2 upgrade adopts this request as stream 1.
        if shared.config.upgrade_h2c && head.wants_h2c() {
            conn.write_all(
                b"HTTP/1.1 101 Switching Protocols\r\n\
                  Connection: Upgrade\r\n\
                  Upgrade: h2c\r\n\r\n",
            )
            .await?;
            trace!("upgrading connection to h2c");
            return h2::serve_upgraded(shared, conn, reader, buf, buf_len, head, body, peer)
                .await;
        }

        let reply = Rc::new(Reply::new(&head));
        let request = build_request(shared, head, body, &peer, secure, started);

        conn.begin_request();
        let sink = ResponseSink::h1(H1Sink {
            conn: Rc::clone(conn),
            reply: Rc::clone(&reply),
        });
        let result = shared.handler.process_request(request, sink).await;
        conn.end_request();
        if let Err(err) = result {
            debug!("handler failed: {}", err);
            return Err(crate::Error::new_user_handler(err));
        }

        if reply.upgraded() {
            let ws = reply.ws.borrow().clone().expect("upgraded reply has a handle");
            let outbound = reply
                .ws_outbound
                .borrow_mut()
                .take()
                .expect("upgraded reply has an outbound queue");
            return ws::serve(shared, conn, reader, buf, buf_len, ws, outbound).await;
        }

        if reply.connection.get() == ConnPolicy::Close {
            return Ok(());
        }
        if shared.is_shutting_down() {
            return Ok(());
        }
        // Pipelined bytes, if any, are already at the front of the
        // buffer; loop back into the parser.
    }
}

fn build_request<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    head: RequestHead,
    body: BodyReader,
    peer: &Peer,
    secure: bool,
    started: Instant,
) -> Request {
    let mut remote_addr = peer.addr;
    let mut remote_port = peer.port;
    if let Some(forwarded) = &head.forwarded_for {
        // Configure the frontend to forward a single address.
        if let Ok(addr) = forwarded.parse() {
            remote_addr = addr;
            remote_port = 0;
        }
    }
    Request {
        method: head.method,
        path: head.path,
        query: head.query,
        protocol: head.protocol.to_owned(),
        secure: head.forwarded_https.unwrap_or(secure),
        server_addr: head.server_addr.unwrap_or_else(|| peer.server.clone()),
        remote_addr,
        remote_port,
        headers: head.headers,
        content_length: head.content_length,
        body,
        started,
        worker: shared.worker,
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

async fn read_body<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    conn: &Rc<Conn>,
    reader: &mut ReadHalf<Transport>,
    buf: &mut Vec<u8>,
    buf_len: &mut usize,
    head: &RequestHead,
) -> crate::Result<BodyReader> {
    let want = head.content_length as u64;
    let mut sink = BodySink::new(head.content_length, shared.config.post_buffering)
        .map_err(crate::Error::new_body)?;

    while sink.len() < want {
        if *buf_len == 0 {
            match read_more(shared, conn, reader, buf, buf_len).await? {
                ReadOutcome::Data => {}
                ReadOutcome::Eof | ReadOutcome::Close => {
                    return Err(crate::Error::new_incomplete())
                }
            }
        }
        let take = (*buf_len).min((want - sink.len()) as usize);
        sink.write(&buf[..take]).map_err(crate::Error::new_body)?;
        compact(buf, buf_len, take);
    }

    sink.finish().map_err(crate::Error::new_body)
}

/// Moves unconsumed bytes (pipelined requests) to the buffer front.
fn compact(buf: &mut [u8], buf_len: &mut usize, consumed: usize) {
    debug_assert!(consumed <= *buf_len);
    buf.copy_within(consumed..*buf_len, 0);
    *buf_len -= consumed;
}
