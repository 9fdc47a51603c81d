//! HTTP/1.1: head parsing, response serialization, and the connection
//! driver (keep-alive, pipelining, h2c and WebSocket upgrades).

pub(crate) mod conn;
pub(crate) mod encode;
pub(crate) mod parse;

pub(crate) use self::conn::{serve, H1Sink};
