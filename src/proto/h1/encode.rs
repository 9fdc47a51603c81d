//! HTTP/1.1 response head serialization.

use http::StatusCode;

use crate::engine::date;
use crate::headers::{camel_case_key, Headers};

use super::parse::ConnPolicy;

/// Serializes a response head into `dst` and returns the connection
/// policy that ends up on the wire.
///
/// The handler's own `Connection` header wins; otherwise the fallback
/// derived from the request decides, defaulting to keep-alive for
/// HTTP/1.1. A `Date` header is appended from the engine cache when the
/// handler did not provide one.
pub(crate) fn encode_head(
    dst: &mut Vec<u8>,
    status: StatusCode,
    headers: &Headers,
    fallback: ConnPolicy,
    is_http11: bool,
) -> ConnPolicy {
    dst.extend_from_slice(b"HTTP/1.1 ");
    dst.extend_from_slice(status.as_str().as_bytes());
    dst.push(b' ');
    dst.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());

    let mut connection = ConnPolicy::NotSet;
    let mut has_date = false;
    for (key, value) in headers {
        if connection == ConnPolicy::NotSet && key == "CONNECTION" {
            connection = if value.eq_ignore_ascii_case("close") {
                ConnPolicy::Close
            } else if value.eq_ignore_ascii_case("upgrade") {
                ConnPolicy::Upgrade
            } else {
                ConnPolicy::Keep
            };
        } else if !has_date && key == "DATE" {
            has_date = true;
        }
        dst.extend_from_slice(b"\r\n");
        dst.extend_from_slice(camel_case_key(key).as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
    }

    if connection == ConnPolicy::NotSet {
        if fallback == ConnPolicy::Keep || (fallback != ConnPolicy::Close && is_http11) {
            connection = ConnPolicy::Keep;
            dst.extend_from_slice(b"\r\nConnection: keep-alive");
        } else {
            connection = ConnPolicy::Close;
            dst.extend_from_slice(b"\r\nConnection: close");
        }
    }

    if !has_date {
        dst.extend_from_slice(b"\r\nDate: ");
        date::extend(dst);
    }
    dst.extend_from_slice(b"\r\n\r\n");

    connection
}

/// The canned response for a head that overflowed the parse buffer.
pub(crate) fn uri_too_long() -> Vec<u8> {
    let mut dst = Vec::with_capacity(128);
    let mut headers = Headers::new();
    headers.push_normalized("CONTENT_LENGTH", "0");
    headers.push_normalized("CONNECTION", "close");
    encode_head(
        &mut dst,
        StatusCode::URI_TOO_LONG,
        &headers,
        ConnPolicy::Close,
        true,
    );
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_to_string(
        status: StatusCode,
        headers: &Headers,
        fallback: ConnPolicy,
    ) -> (String, ConnPolicy) {
        let mut dst = Vec::new();
        let policy = encode_head(&mut dst, status, headers, fallback, true);
        (String::from_utf8(dst).unwrap(), policy)
    }

    #[test]
    fn basic_head_layout() {
        let mut headers = Headers::new();
        headers.push("Content-Type", "text/plain");
        headers.push("Content-Length", "2");
        let (head, policy) = head_to_string(StatusCode::OK, &headers, ConnPolicy::NotSet);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("\r\nContent-Type: text/plain\r\n"));
        assert!(head.contains("\r\nContent-Length: 2\r\n"));
        assert!(head.contains("\r\nConnection: keep-alive\r\n"));
        assert!(head.contains("\r\nDate: "));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(policy, ConnPolicy::Keep);
    }

    #[test]
    fn request_close_wins_over_default() {
        let headers = Headers::new();
        let (head, policy) =
            head_to_string(StatusCode::OK, &headers, ConnPolicy::Close);
        assert!(head.contains("\r\nConnection: close\r\n"));
        assert_eq!(policy, ConnPolicy::Close);
    }

    #[test]
    fn handler_connection_header_wins() {
        let mut headers = Headers::new();
        headers.push("Connection", "close");
        let (head, policy) = head_to_string(StatusCode::OK, &headers, ConnPolicy::Keep);
        assert_eq!(head.matches("Connection:").count(), 1);
        assert_eq!(policy, ConnPolicy::Close);
    }

    #[test]
    fn upgrade_policy_is_detected() {
        let mut headers = Headers::new();
        headers.push("Connection", "Upgrade");
        let (_, policy) =
            head_to_string(StatusCode::SWITCHING_PROTOCOLS, &headers, ConnPolicy::Keep);
        assert_eq!(policy, ConnPolicy::Upgrade);
    }

    #[test]
    fn handler_date_is_not_duplicated() {
        let mut headers = Headers::new();
        headers.push("Date", "Tue, 01 Jan 2030 00:00:00 GMT");
        let (head, _) = head_to_string(StatusCode::OK, &headers, ConnPolicy::Keep);
        assert_eq!(head.matches("Date:").count(), 1);
    }
}
