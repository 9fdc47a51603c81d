//! Per-stream state inside one HTTP/2 connection.

use std::cell::{Cell, RefCell};

use tokio::sync::Notify;

use super::hpack::HeaderBlock;
use crate::body::BodySink;

/// Stream lifecycle (RFC 7540 §5.1, server side, push disabled).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamPhase {
    Idle,
    Open,
    HalfClosed,
    Closed,
}

/// One logical request/response inside an HTTP/2 connection.
///
/// Writers that run out of send window park on `window_update`; the
/// frame loop wakes them when WINDOW_UPDATE or a SETTINGS delta arrives.
pub(crate) struct Stream {
    pub(crate) id: u32,
    pub(crate) phase: Cell<StreamPhase>,
    pub(crate) send_window: Cell<i64>,
    pub(crate) recv_window: Cell<i64>,
    window_update: Notify,
    pub(crate) head: RefCell<HeaderBlock>,
    pub(crate) body: RefCell<Option<BodySink>>,
    /// DATA bytes received, checked against the declared length.
    pub(crate) consumed: Cell<i64>,
}

impl Stream {
    pub(crate) fn new(id: u32, send_window: i64, recv_window: i64) -> Stream {
        Stream {
            id,
            phase: Cell::new(StreamPhase::Idle),
            send_window: Cell::new(send_window),
            recv_window: Cell::new(recv_window),
            window_update: Notify::new(),
            head: RefCell::new(HeaderBlock::new()),
            body: RefCell::new(None),
            consumed: Cell::new(0),
        }
    }

    /// Wakes a writer parked on this stream's window.
    pub(crate) fn wake(&self) {
        self.window_update.notify_waiters();
    }

    pub(crate) async fn window_opened(&self) {
        self.window_update.notified().await;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.phase.get() == StreamPhase::Closed
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("phase", &self.phase.get())
            .field("send_window", &self.send_window.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_progress() {
        let stream = Stream::new(1, 65_535, 65_535);
        assert_eq!(stream.phase.get(), StreamPhase::Idle);
        stream.phase.set(StreamPhase::Open);
        stream.phase.set(StreamPhase::HalfClosed);
        stream.phase.set(StreamPhase::Closed);
        assert!(stream.is_closed());
    }
}
