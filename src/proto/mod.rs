//! The wire protocols and the per-connection state they share.

pub(crate) mod fcgi;
pub(crate) mod h1;
pub(crate) mod h2;
pub(crate) mod ws;

use std::cell::Cell;

use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{Mutex, Notify};

use crate::transport::Transport;

/// The wire protocol a listener starts its connections on.
///
/// Upgrades (h2c, WebSocket) swap the running driver mid-connection
/// while the transport stays; they never appear at the listener level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protocol {
    Http1,
    Http2,
    FastCgi,
}

/// State shared between a connection's read-side driver, its response
/// sinks and the engine's idle sweeper.
pub(crate) struct Conn {
    pub(crate) writer: Mutex<WriteHalf<Transport>>,
    in_flight: Cell<u32>,
    /// Engine tick of the last observed read; the idle sweeper compares
    /// it against the current tick.
    pub(crate) last_io: Cell<u64>,
    pub(crate) close: Notify,
    closing: Cell<bool>,
    in_flight_zero: Notify,
}

impl Conn {
    pub(crate) fn new(writer: WriteHalf<Transport>) -> Conn {
        Conn {
            writer: Mutex::new(writer),
            in_flight: Cell::new(0),
            last_io: Cell::new(0),
            close: Notify::new(),
            closing: Cell::new(false),
            in_flight_zero: Notify::new(),
        }
    }

    pub(crate) fn in_flight(&self) -> u32 {
        self.in_flight.get()
    }

    pub(crate) fn begin_request(&self) {
        self.in_flight.set(self.in_flight.get() + 1);
    }

    pub(crate) fn end_request(&self) {
        let n = self.in_flight.get();
        debug_assert!(n > 0);
        self.in_flight.set(n - 1);
        if n == 1 {
            self.in_flight_zero.notify_waiters();
        }
    }

    /// Resolves once every in-flight request on this connection has
    /// finished.
    pub(crate) async fn drained(&self) {
        while self.in_flight.get() > 0 {
            self.in_flight_zero.notified().await;
        }
    }

    /// Asks the connection to close; drivers observe this between reads.
    pub(crate) fn request_close(&self) {
        self.closing.set(true);
        self.close.notify_waiters();
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.get()
    }

    pub(crate) async fn write_all(&self, data: &[u8]) -> crate::Result<()> {
        if self.closing.get() {
            return Err(crate::Error::new_closed());
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await.map_err(crate::Error::new_io)
    }

    pub(crate) async fn flush(&self) -> crate::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.flush().await.map_err(crate::Error::new_io)
    }

    pub(crate) async fn shutdown(&self) -> crate::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(crate::Error::new_shutdown)
    }
}
