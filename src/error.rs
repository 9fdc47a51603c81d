//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use crate::proto::h2::Reason;

/// Result type often returned from methods that can have manifold `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling connections and requests.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    User(User),
    /// A connection closed before a message could complete.
    IncompleteMessage,
    /// An HTTP/2 connection or stream level error.
    Http2(Reason),
    /// A WebSocket peer violated the framing rules.
    WebSocketProtocol,
    /// A FastCGI record could not be decoded.
    FastcgiRecord,
    /// The connection was torn down while a request was in flight.
    ChannelClosed,
    /// An `io::Error` while reading or writing a network stream.
    Io,
    /// Error creating a listener.
    Listen,
    /// Error accepting a connection.
    Accept,
    /// Invalid server configuration.
    Config,
    /// Error while buffering a request body.
    Body,
    /// Error calling shutdown() on a transport.
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Version,
    Uri,
    UriTooLong,
    Header,
    TooLarge,
    Internal,
}

#[derive(Debug)]
pub(crate) enum User {
    /// `write_headers` was called more than once for a request.
    HeadersAlreadySent,
    /// A body write happened before `write_headers`.
    HeadersNotSent,
    /// A WebSocket verb was used on a connection that was never upgraded.
    NotUpgraded,
    /// The WebSocket handshake was attempted without a usable key.
    HandshakeKey,
    /// The WebSocket handshake is only available on HTTP/1.1 connections.
    HandshakeVersion,
    /// Error from the application's request handler.
    Handler,
}

impl Error {
    /// Returns true if this was a request head parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if the request head exceeded the parse buffer.
    pub fn is_parse_too_large(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Parse(Parse::TooLarge) | Kind::Parse(Parse::UriTooLong)
        )
    }

    /// Returns true if this error was caused by user code.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns true if the connection is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ChannelClosed)
    }

    /// Returns true if the connection closed before a message completed.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if this is an HTTP/2 protocol error.
    pub fn is_http2(&self) -> bool {
        matches!(self.inner.kind, Kind::Http2(_))
    }

    /// Returns true if this is a listener setup error.
    pub fn is_listen(&self) -> bool {
        matches!(self.inner.kind, Kind::Listen)
    }

    /// Returns true if this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self.inner.kind, Kind::Config)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn h2_reason(&self) -> Reason {
        match self.inner.kind {
            Kind::Http2(reason) => reason,
            _ => Reason::INTERNAL_ERROR,
        }
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_uri_too_long() -> Error {
        Error::new(Kind::Parse(Parse::UriTooLong))
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_listen<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_accept<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    pub(crate) fn new_config(msg: &'static str) -> Error {
        Error::new(Kind::Config).with(msg)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::ChannelClosed)
    }

    pub(crate) fn new_body<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Body).with(cause)
    }

    pub(crate) fn new_h2(reason: Reason) -> Error {
        Error::new(Kind::Http2(reason))
    }

    pub(crate) fn new_ws_protocol() -> Error {
        Error::new(Kind::WebSocketProtocol)
    }

    pub(crate) fn new_fcgi() -> Error {
        Error::new(Kind::FastcgiRecord)
    }

    pub(crate) fn new_shutdown(cause: std::io::Error) -> Error {
        Error::new(Kind::Shutdown).with(cause)
    }

    pub(crate) fn new_user_headers_already_sent() -> Error {
        Error::new(Kind::User(User::HeadersAlreadySent))
    }

    pub(crate) fn new_user_headers_not_sent() -> Error {
        Error::new(Kind::User(User::HeadersNotSent))
    }

    pub(crate) fn new_user_not_upgraded() -> Error {
        Error::new(Kind::User(User::NotUpgraded))
    }

    pub(crate) fn new_user_handshake_key() -> Error {
        Error::new(Kind::User(User::HandshakeKey))
    }

    pub(crate) fn new_user_handshake_version() -> Error {
        Error::new(Kind::User(User::HandshakeVersion))
    }

    pub(crate) fn new_user_handler<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::User(User::Handler)).with(cause)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::UriTooLong) => "URI too long",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::Internal) => "internal parser error, please report",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::Http2(_) => "http2 protocol error",
            Kind::WebSocketProtocol => "websocket protocol violation",
            Kind::FastcgiRecord => "invalid fastcgi record",
            Kind::ChannelClosed => "connection closed",
            Kind::Io => "connection error",
            Kind::Listen => "error creating server listener",
            Kind::Accept => "error accepting connection",
            Kind::Config => "invalid server configuration",
            Kind::Body => "error buffering a request body",
            Kind::Shutdown => "error shutting down connection",
            Kind::User(User::HeadersAlreadySent) => "response headers were already sent",
            Kind::User(User::HeadersNotSent) => "response body written before headers",
            Kind::User(User::NotUpgraded) => "connection was not upgraded to websocket",
            Kind::User(User::HandshakeKey) => "missing or invalid websocket key",
            Kind::User(User::HandshakeVersion) => {
                "websocket upgrade requires an HTTP/1.1 connection"
            }
            Kind::User(User::Handler) => "error from the application handler",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("manifold::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Kind::Http2(reason) = self.inner.kind {
            return write!(f, "{}: {}", self.description(), reason);
        }
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<Parse> for Error {
    fn from(err: Parse) -> Error {
        Error::new(Kind::Parse(err))
    }
}

impl From<httparse::Error> for Parse {
    fn from(err: httparse::Error) -> Parse {
        match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Token => Parse::Header,
            httparse::Error::Status => Parse::Internal,
            httparse::Error::TooManyHeaders => Parse::TooLarge,
            httparse::Error::Version => Parse::Version,
        }
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}
