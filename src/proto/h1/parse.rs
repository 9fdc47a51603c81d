//! HTTP/1.1 request head parsing.

use bytes::Bytes;
use tracing::trace;

use crate::error::Parse;
use crate::headers::{normalize_key, Headers};

const MAX_HEADERS: usize = 100;

/// Keep-alive intent for one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnPolicy {
    NotSet,
    Keep,
    Close,
    Upgrade,
}

/// A parsed request head plus everything the driver latches from it.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: String,
    /// Path with leading slashes stripped.
    pub(crate) path: String,
    pub(crate) query: Bytes,
    pub(crate) protocol: &'static str,
    pub(crate) headers: Headers,
    pub(crate) content_length: i64,
    pub(crate) connection: ConnPolicy,
    /// `Host`, or the first trusted `X-Forwarded-Host`.
    pub(crate) server_addr: Option<String>,
    /// First trusted `X-Forwarded-For` / `X-Real-IP` value.
    pub(crate) forwarded_for: Option<String>,
    /// First trusted `X-Forwarded-Proto` was `https`.
    pub(crate) forwarded_https: Option<bool>,
}

impl RequestHead {
    pub(crate) fn is_http11(&self) -> bool {
        self.protocol == "HTTP/1.1"
    }

    /// True when the head is a clear-text HTTP/2 upgrade request.
    pub(crate) fn wants_h2c(&self) -> bool {
        self.headers
            .get("UPGRADE")
            .is_some_and(|v| v.eq_ignore_ascii_case("h2c"))
            && self
                .headers
                .get("CONNECTION")
                .is_some_and(|v| v.eq_ignore_ascii_case("Upgrade, HTTP2-Settings"))
            && self
                .headers
                .get("HTTP2_SETTINGS")
                .is_some_and(|v| !v.is_empty())
    }
}

/// Attempts to parse a request head from the front of `buf`.
///
/// Returns the head and the number of bytes it occupied, or `None` when
/// more input is needed.
pub(crate) fn parse_head(
    buf: &[u8],
    using_frontend_proxy: bool,
) -> Result<Option<(RequestHead, usize)>, Parse> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let consumed = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let method = req.method.ok_or(Parse::Method)?.to_owned();
    let uri = req.path.ok_or(Parse::Uri)?;
    let protocol = match req.version.ok_or(Parse::Version)? {
        0 => "HTTP/1.0",
        1 => "HTTP/1.1",
        _ => return Err(Parse::Version),
    };
    let (path, query) = split_uri(uri);
    trace!(%method, %path, "parsed request head");

    let mut head = RequestHead {
        method,
        path,
        query,
        protocol,
        headers: Headers::with_capacity(req.headers.len()),
        content_length: -1,
        connection: ConnPolicy::NotSet,
        server_addr: None,
        forwarded_for: None,
        forwarded_https: None,
    };

    let mut saw_host = false;
    let mut saw_forwarded_host = false;
    for header in req.headers.iter() {
        let key = normalize_key(header.name);
        let value =
            std::str::from_utf8(header.value).map_err(|_| Parse::Header)?;

        match key.as_str() {
            "CONNECTION" if head.connection == ConnPolicy::NotSet => {
                head.connection = if value.eq_ignore_ascii_case("close") {
                    ConnPolicy::Close
                } else {
                    ConnPolicy::Keep
                };
            }
            "CONTENT_LENGTH" if head.content_length < 0 => {
                if let Ok(len) = value.trim().parse::<i64>() {
                    if len >= 0 {
                        head.content_length = len;
                    }
                }
            }
            "HOST" if !saw_host => {
                head.server_addr = Some(value.to_owned());
                saw_host = true;
            }
            "X_FORWARDED_FOR" | "X_REAL_IP"
                if using_frontend_proxy && head.forwarded_for.is_none() =>
            {
                head.forwarded_for = Some(value.to_owned());
            }
            "X_FORWARDED_HOST" if using_frontend_proxy && !saw_forwarded_host => {
                head.server_addr = Some(value.to_owned());
                saw_forwarded_host = true;
                // A later Host header must not override the proxy's.
                saw_host = true;
            }
            "X_FORWARDED_PROTO" if using_frontend_proxy && head.forwarded_https.is_none() =>
            {
                head.forwarded_https = Some(value == "https");
            }
            _ => {}
        }
        head.headers.push_normalized(key, value);
    }

    Ok(Some((head, consumed)))
}

/// Splits a request target into path (leading slashes stripped) and raw
/// query bytes.
pub(crate) fn split_uri(uri: &str) -> (String, Bytes) {
    match uri.split_once('?') {
        Some((path, query)) => (
            path.trim_start_matches('/').to_owned(),
            Bytes::copy_from_slice(query.as_bytes()),
        ),
        None => (uri.trim_start_matches('/').to_owned(), Bytes::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::camel_case_key;

    fn parse(buf: &[u8]) -> (RequestHead, usize) {
        parse_head(buf, false).unwrap().expect("complete head")
    }

    #[test]
    fn simple_get() {
        let (head, used) = parse(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(used, 32);
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "hello");
        assert!(head.query.is_empty());
        assert_eq!(head.protocol, "HTTP/1.1");
        assert_eq!(head.server_addr.as_deref(), Some("x"));
        assert_eq!(head.connection, ConnPolicy::NotSet);
        assert_eq!(head.content_length, -1);
    }

    #[test]
    fn query_is_raw_bytes() {
        let (head, _) = parse(b"GET /a/b?x=%201&y HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(head.path, "a/b");
        assert_eq!(&head.query[..], b"x=%201&y");
    }

    #[test]
    fn partial_head_asks_for_more() {
        assert!(parse_head(b"GET /hello HTT", false).unwrap().is_none());
        assert!(parse_head(b"GET / HTTP/1.1\r\nHost: x\r\n", false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn connection_close_latches_first_value() {
        let (head, _) =
            parse(b"GET / HTTP/1.1\r\nConnection: close\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(head.connection, ConnPolicy::Close);
    }

    #[test]
    fn content_length_is_parsed() {
        let (head, _) = parse(b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(head.content_length, 5);
    }

    #[test]
    fn forwarded_headers_ignored_without_trust() {
        let (head, _) = parse(
            b"GET / HTTP/1.1\r\nHost: real\r\nX-Forwarded-For: 10.0.0.9\r\n\
              X-Forwarded-Proto: https\r\n\r\n",
        );
        assert_eq!(head.forwarded_for, None);
        assert_eq!(head.forwarded_https, None);
        assert_eq!(head.server_addr.as_deref(), Some("real"));
    }

    #[test]
    fn forwarded_headers_absorbed_when_trusted() {
        let head = parse_head(
            b"GET / HTTP/1.1\r\nX-Forwarded-Host: front\r\nHost: real\r\n\
              X-Forwarded-For: 10.0.0.9\r\nX-Forwarded-For: 10.0.0.8\r\n\
              X-Forwarded-Proto: https\r\n\r\n",
            true,
        )
        .unwrap()
        .unwrap()
        .0;
        assert_eq!(head.forwarded_for.as_deref(), Some("10.0.0.9"));
        assert_eq!(head.forwarded_https, Some(true));
        // The proxy's host wins over the later Host header.
        assert_eq!(head.server_addr.as_deref(), Some("front"));
    }

    #[test]
    fn h2c_upgrade_detection() {
        let (head, _) = parse(
            b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: h2c\r\n\
              Connection: Upgrade, HTTP2-Settings\r\nHTTP2-Settings: AAMAAABk\r\n\r\n",
        );
        assert!(head.wants_h2c());

        let (head, _) = parse(
            b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: h2c\r\n\
              Connection: Upgrade, HTTP2-Settings\r\nHTTP2-Settings:\r\n\r\n",
        );
        assert!(!head.wants_h2c());
    }

    #[test]
    fn head_round_trips_through_serialization() {
        let raw = b"GET /p?q=1 HTTP/1.1\r\nHost: x\r\nAccept: text/html\r\nAccept: */*\r\n\r\n";
        let (head, _) = parse(raw);

        let mut out = Vec::new();
        out.extend_from_slice(head.method.as_bytes());
        out.extend_from_slice(b" /");
        out.extend_from_slice(head.path.as_bytes());
        out.extend_from_slice(b"?");
        out.extend_from_slice(&head.query);
        out.extend_from_slice(b" ");
        out.extend_from_slice(head.protocol.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (key, value) in &head.headers {
            out.extend_from_slice(camel_case_key(key).as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        assert_eq!(out, raw);
    }

    #[test]
    fn pipelined_heads_report_exact_length() {
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let (first, used) = parse(raw);
        assert_eq!(first.path, "a");
        let (second, used2) = parse(&raw[used..]);
        assert_eq!(second.path, "b");
        assert_eq!(used + used2, raw.len());
    }
}
