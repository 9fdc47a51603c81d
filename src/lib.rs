#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # manifold
//!
//! A multi-protocol application server: one listener set, a pool of
//! worker processes and threads, and four wire protocols — HTTP/1.1,
//! HTTP/2 (with in-tree HPACK), FastCGI/1 and WebSocket — feeding a
//! single embedded [`Handler`].
//!
//! Every worker thread owns a cooperative, single-threaded engine;
//! connections are parsed in place, requests are dispatched to the
//! handler, and responses stream back through a per-protocol
//! [`ResponseSink`]. The master process binds the listeners once,
//! supervises workers, and restarts the ones that crash.

pub use crate::body::BodyReader;
pub use crate::error::{Error, Result};
pub use crate::headers::Headers;
pub use crate::proto::ws::WebSocket;
pub use crate::request::{Request, ResponseSink};
pub use crate::server::{Server, ServerHandle};
pub use crate::service::Handler;

#[doc(no_inline)]
pub use http::StatusCode;

pub mod cli;
pub mod config;

mod body;
mod engine;
mod error;
mod headers;
mod lifecycle;
mod proto;
mod request;
mod server;
mod service;
mod transport;

/// Exit status a worker uses to decline being respawned.
pub use crate::lifecycle::fork::CHEAP_EXIT;
