//! HTTP/2 (RFC 7540) with in-tree HPACK (RFC 7541).

pub(crate) mod conn;
pub(crate) mod frame;
pub(crate) mod hpack;
pub(crate) mod streams;

pub use self::frame::Reason;
pub(crate) use self::conn::{serve, serve_upgraded, H2Sink};
