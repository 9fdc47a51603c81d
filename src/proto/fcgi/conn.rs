use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use bytes::Bytes;
use http::StatusCode;
use memchr::memchr;
use tokio::io::{AsyncReadExt, ReadHalf};
use tracing::{debug, trace, warn};

use super::record::{self, BeginRequest, Params, RecordHead};
use crate::body::{BodyReader, BodySink};
use crate::engine::{date, EngineShared};
use crate::headers::{camel_case_key, Headers};
use crate::proto::Conn;
use crate::request::{Request, ResponseSink};
use crate::service::Handler;
use crate::transport::{Peer, Transport};

/// Request state accumulated from BEGIN_REQUEST / PARAMS / STDIN.
struct PendingRequest {
    request_id: u16,
    keep_conn: bool,
    method: String,
    path: String,
    query: Bytes,
    protocol: String,
    secure: bool,
    server_addr: Option<String>,
    remote_addr: Option<std::net::IpAddr>,
    remote_port: u16,
    headers: Headers,
    content_length: i64,
    body: Option<BodySink>,
}

impl PendingRequest {
    fn new(request_id: u16, keep_conn: bool) -> PendingRequest {
        PendingRequest {
            request_id,
            keep_conn,
            method: String::new(),
            path: String::new(),
            query: Bytes::new(),
            protocol: String::new(),
            secure: false,
            server_addr: None,
            remote_addr: None,
            remote_port: 0,
            headers: Headers::new(),
            content_length: -1,
            body: None,
        }
    }

    /// Maps one CGI variable into the request record, mirroring how the
    /// HTTP parsers populate the same fields.
    fn absorb(&mut self, key: &[u8], value: &[u8]) {
        let value_str = || String::from_utf8_lossy(value).into_owned();
        if let Some(header) = key.strip_prefix(b"HTTP_") {
            let name = String::from_utf8_lossy(header).into_owned();
            if name == "HOST" && self.server_addr.is_none() {
                self.server_addr = Some(value_str());
            }
            self.headers.push_normalized(name, value_str());
            return;
        }
        match key {
            b"REQUEST_METHOD" => self.method = value_str(),
            b"REQUEST_URI" => {
                let uri = value;
                match memchr(b'?', uri) {
                    Some(pos) => {
                        self.path = String::from_utf8_lossy(&uri[..pos])
                            .trim_start_matches('/')
                            .to_owned();
                        self.query = Bytes::copy_from_slice(&uri[pos + 1..]);
                    }
                    None => {
                        self.path = String::from_utf8_lossy(uri)
                            .trim_start_matches('/')
                            .to_owned();
                        self.query = Bytes::new();
                    }
                }
            }
            b"SERVER_PROTOCOL" => self.protocol = value_str(),
            b"REMOTE_ADDR" => self.remote_addr = value_str().parse().ok(),
            b"REMOTE_PORT" => self.remote_port = value_str().parse().unwrap_or(0),
            b"CONTENT_TYPE" => {
                if !value.is_empty() {
                    self.headers.push_normalized("CONTENT_TYPE", value_str());
                }
            }
            b"CONTENT_LENGTH" => {
                self.content_length = value_str().parse().unwrap_or(-1);
            }
            b"REQUEST_SCHEME" => self.secure = value == b"https",
            _ => {}
        }
    }
}

/// Drives one FastCGI connection; requests arrive sequentially and the
/// connection closes after a response unless KEEP_CONN was set.
pub(crate) async fn serve<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    conn: &Rc<Conn>,
    mut reader: ReadHalf<Transport>,
    peer: Peer,
) -> crate::Result<()> {
    let buffer_size = shared.config.buffer_size;
    let mut buf = vec![0u8; buffer_size];
    let mut buf_len = 0usize;
    let mut pending: Option<PendingRequest> = None;

    loop {
        // Drain every complete record in the buffer.
        while buf_len >= record::HEADER_LEN {
            let head = RecordHead::parse(
                buf[..record::HEADER_LEN].try_into().expect("record header"),
            );
            if head.version != record::VERSION_1 {
                warn!(version = head.version, "unsupported fastcgi version");
                return Err(crate::Error::new_fcgi());
            }
            if head.total_len() > buf_len {
                if head.total_len() > buffer_size {
                    // A record larger than the parse buffer: stream its
                    // STDIN payload straight into the body.
                    if head.kind == record::STDIN {
                        handle_large_stdin(
                            shared, conn, &mut reader, &mut buf, &mut buf_len, head,
                            &mut pending,
                        )
                        .await?;
                        continue;
                    }
                    return Err(crate::Error::new_fcgi());
                }
                break;
            }

            let payload =
                &buf[record::HEADER_LEN..record::HEADER_LEN + head.content_len as usize];
            match head.kind {
                record::BEGIN_REQUEST => {
                    let Some(begin) = BeginRequest::parse(payload) else {
                        return Err(crate::Error::new_fcgi());
                    };
                    trace!(
                        request_id = head.request_id,
                        keep_conn = begin.keep_conn,
                        "begin request"
                    );
                    pending = Some(PendingRequest::new(head.request_id, begin.keep_conn));
                }
                record::PARAMS => {
                    if let Some(req) = pending.as_mut() {
                        for pair in Params::new(payload) {
                            let (key, value) =
                                pair.map_err(|()| crate::Error::new_fcgi())?;
                            req.absorb(key, value);
                        }
                    }
                }
                record::STDIN => {
                    if head.content_len == 0 {
                        // Empty STDIN terminates the request body.
                        compact(&mut buf, &mut buf_len, head.total_len());
                        if let Some(req) = pending.take() {
                            let keep = dispatch(shared, conn, req, &peer).await?;
                            if !keep || shared.is_shutting_down() {
                                return Ok(());
                            }
                        }
                        continue;
                    }
                    if let Some(req) = pending.as_mut() {
                        write_body(shared, req, payload)?;
                    }
                }
                record::ABORT_REQUEST => {
                    debug!(request_id = head.request_id, "request aborted by peer");
                    pending = None;
                }
                other => {
                    trace!(kind = other, "ignoring fastcgi record");
                }
            }
            compact(&mut buf, &mut buf_len, head.total_len());
        }

        if conn.is_closing() {
            return Ok(());
        }
        tokio::select! {
            read = reader.read(&mut buf[buf_len..]) => match read {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    buf_len += n;
                    conn.last_io.set(shared.tick.get());
                }
                Err(err) => return Err(crate::Error::new_io(err)),
            },
            _ = conn.close.notified() => return Ok(()),
        }
    }
}

/// STDIN payloads can exceed the record buffer; the bytes stream into
/// the body sink as they arrive, padding included and discarded.
async fn handle_large_stdin<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    conn: &Rc<Conn>,
    reader: &mut ReadHalf<Transport>,
    buf: &mut Vec<u8>,
    buf_len: &mut usize,
    head: RecordHead,
    pending: &mut Option<PendingRequest>,
) -> crate::Result<()> {
    compact(buf, buf_len, record::HEADER_LEN);
    let mut content = head.content_len as usize;
    let mut padding = head.padding as usize;

    while content + padding > 0 {
        if *buf_len == 0 {
            tokio::select! {
                read = reader.read(&mut buf[*buf_len..]) => match read {
                    Ok(0) => return Err(crate::Error::new_incomplete()),
                    Ok(n) => {
                        *buf_len += n;
                        conn.last_io.set(shared.tick.get());
                    }
                    Err(err) => return Err(crate::Error::new_io(err)),
                },
                _ = conn.close.notified() => return Err(crate::Error::new_closed()),
            }
        }
        let take = (*buf_len).min(content);
        if take > 0 {
            if let Some(req) = pending.as_mut() {
                write_body(shared, req, &buf[..take])?;
            }
            compact(buf, buf_len, take);
            content -= take;
        } else {
            let pad_take = (*buf_len).min(padding);
            compact(buf, buf_len, pad_take);
            padding -= pad_take;
        }
    }
    Ok(())
}

fn write_body<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    req: &mut PendingRequest,
    data: &[u8],
) -> crate::Result<()> {
    if req.body.is_none() {
        req.body = Some(
            BodySink::new(req.content_length, shared.config.post_buffering)
                .map_err(crate::Error::new_body)?,
        );
    }
    req.body
        .as_mut()
        .expect("body sink created above")
        .write(data)
        .map_err(crate::Error::new_body)
}

/// Runs the handler for one completed request; returns whether the
/// connection stays open.
async fn dispatch<H: Handler>(
    shared: &Rc<EngineShared<H>>,
    conn: &Rc<Conn>,
    req: PendingRequest,
    peer: &Peer,
) -> crate::Result<bool> {
    let keep_conn = req.keep_conn;
    let reply = Rc::new(Reply {
        request_id: req.request_id,
        headers_sent: Cell::new(false),
        finished: Cell::new(false),
    });

    let body = match req.body {
        Some(sink) => sink.finish().map_err(crate::Error::new_body)?,
        None => BodyReader::Empty,
    };
    let request = Request {
        method: req.method,
        path: req.path,
        query: req.query,
        protocol: req.protocol,
        secure: req.secure,
        server_addr: req.server_addr.unwrap_or_else(|| peer.server.clone()),
        remote_addr: req.remote_addr.unwrap_or(peer.addr),
        remote_port: req.remote_port,
        headers: req.headers,
        content_length: req.content_length,
        body,
        started: Instant::now(),
        worker: shared.worker,
    };

    conn.begin_request();
    let sink = ResponseSink::fcgi(FcgiSink {
        conn: Rc::clone(conn),
        reply: Rc::clone(&reply),
    });
    let result = shared.handler.process_request(request, sink).await;
    conn.end_request();
    if let Err(err) = result {
        debug!("handler failed: {}", err);
        return Err(crate::Error::new_user_handler(err));
    }
    Ok(keep_conn)
}

struct Reply {
    request_id: u16,
    headers_sent: Cell<bool>,
    finished: Cell<bool>,
}

/// The FastCGI response sink: STDOUT records then END_REQUEST.
pub(crate) struct FcgiSink {
    conn: Rc<Conn>,
    reply: Rc<Reply>,
}

impl FcgiSink {
    pub(crate) async fn write_headers(
        &mut self,
        status: StatusCode,
        headers: &Headers,
    ) -> crate::Result<()> {
        if self.reply.headers_sent.replace(true) {
            return Err(crate::Error::new_user_headers_already_sent());
        }
        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(b"Status: ");
        head.extend_from_slice(itoa::Buffer::new().format(status.as_u16()).as_bytes());
        let mut has_date = false;
        for (key, value) in headers {
            if !has_date && key == "DATE" {
                has_date = true;
            }
            head.extend_from_slice(b"\r\n");
            head.extend_from_slice(camel_case_key(key).as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
        }
        if !has_date {
            head.extend_from_slice(b"\r\nDate: ");
            date::extend(&mut head);
        }
        head.extend_from_slice(b"\r\n\r\n");
        self.write_stdout(&head).await
    }

    pub(crate) async fn write(&mut self, data: &[u8]) -> crate::Result<()> {
        if !self.reply.headers_sent.get() {
            return Err(crate::Error::new_user_headers_not_sent());
        }
        if self.reply.finished.get() {
            return Err(crate::Error::new_closed());
        }
        self.write_stdout(data).await
    }

    pub(crate) async fn finish(&mut self) -> crate::Result<()> {
        if !self.reply.headers_sent.get() {
            return Err(crate::Error::new_user_headers_not_sent());
        }
        if self.reply.finished.replace(true) {
            return Ok(());
        }
        self.conn
            .write_all(&record::end_request(self.reply.request_id))
            .await?;
        self.conn.flush().await
    }

    /// Chunks `data` into STDOUT records (capped just under the 64 KiB
    /// record limit so alignment stays exact), each padded to an 8-byte
    /// boundary.
    async fn write_stdout(&self, data: &[u8]) -> crate::Result<()> {
        for chunk in data.chunks(0xfff8) {
            let len = chunk.len() as u16;
            let padding = (record::align(len) - len) as u8;
            let mut out = Vec::with_capacity(
                record::HEADER_LEN + chunk.len() + padding as usize,
            );
            out.extend_from_slice(&RecordHead::encode(
                record::STDOUT,
                self.reply.request_id,
                len,
                padding,
            ));
            out.extend_from_slice(chunk);
            out.extend_from_slice(&[0u8; 8][..padding as usize]);
            self.conn.write_all(&out).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FcgiSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FcgiSink")
            .field("request_id", &self.reply.request_id)
            .field("headers_sent", &self.reply.headers_sent.get())
            .finish()
    }
}

fn compact(buf: &mut [u8], buf_len: &mut usize, consumed: usize) {
    debug_assert!(consumed <= *buf_len);
    buf.copy_within(consumed..*buf_len, 0);
    *buf_len -= consumed;
}
