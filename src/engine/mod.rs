//! The per-worker engine.
//!
//! Each worker thread owns exactly one engine: a current-thread tokio
//! runtime driving a `LocalSet`. Connections live in a slab keyed by a
//! stable integer id; the idle sweeper and graceful shutdown walk the
//! slab and signal connections rather than touching their state
//! directly. Cross-thread input arrives over the engine's command
//! channel.

pub(crate) mod date;
pub(crate) mod timer;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use slab::Slab;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::proto::{self, Conn, Protocol};
use crate::server::listener::{apply_stream_options, BoundListener, StdStream};
use crate::service::Handler;
use crate::transport::Transport;

/// Cross-thread input for an engine.
pub(crate) enum Command {
    /// An accepted connection handed over by the balancer.
    Incoming(Incoming),
    /// Stop accepting and drain.
    Shutdown,
}

pub(crate) struct Incoming {
    pub(crate) stream: StdStream,
    pub(crate) protocol: Protocol,
    pub(crate) tls: Option<Arc<TlsAcceptor>>,
}

/// Sending half of an engine's command channel.
#[derive(Clone)]
pub(crate) struct EngineHandle {
    tx: UnboundedSender<Command>,
}

impl EngineHandle {
    pub(crate) fn dispatch(&self, incoming: Incoming) {
        if self.tx.send(Command::Incoming(incoming)).is_err() {
            warn!("engine is gone, dropping accepted connection");
        }
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

pub(crate) fn channel() -> (EngineHandle, UnboundedReceiver<Command>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EngineHandle { tx }, rx)
}

/// Engine state shared with connection drivers on the same thread.
pub(crate) struct EngineShared<H> {
    pub(crate) config: Arc<Config>,
    pub(crate) handler: Arc<H>,
    pub(crate) worker: usize,
    /// Monotonic sweep counter; connections record the tick of their
    /// last read.
    pub(crate) tick: Cell<u64>,
    conns: RefCell<Slab<Rc<Conn>>>,
    shutting_down: Cell<bool>,
    drained: Notify,
    stop_accepting: Notify,
}

impl<H: Handler> EngineShared<H> {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.get()
    }

    fn spawn_conn(self: &Rc<Self>, incoming: Incoming) {
        let shared = Rc::clone(self);
        tokio::task::spawn_local(async move {
            let (transport, protocol) = match setup_transport(&shared.config, incoming).await
            {
                Ok(pair) => pair,
                Err(err) => {
                    debug!("connection setup failed: {}", err);
                    return;
                }
            };

            let peer = transport.peer();
            let secure = transport.is_tls();
            let (reader, writer) = tokio::io::split(transport);
            let conn = Rc::new(Conn::new(writer));
            conn.last_io.set(shared.tick.get());
            let key = shared.conns.borrow_mut().insert(Rc::clone(&conn));
            trace!(key, ?protocol, "connection open");

            let result = match protocol {
                Protocol::Http1 => {
                    proto::h1::serve(&shared, &conn, reader, peer, secure).await
                }
                Protocol::Http2 => {
                    proto::h2::serve(&shared, &conn, reader, peer, secure).await
                }
                Protocol::FastCgi => {
                    proto::fcgi::serve(&shared, &conn, reader, peer).await
                }
            };
            if let Err(err) = result {
                if err.is_http2() {
                    debug!(reason = ?err.h2_reason(), "connection error: {}", err);
                } else {
                    debug!("connection error: {}", err);
                }
            }

            // Cancel whatever is still in flight, wait for it to
            // observe the failure, then release the slot.
            conn.request_close();
            conn.drained().await;
            let _ = conn.shutdown().await;
            shared.conns.borrow_mut().remove(key);
            trace!(key, "connection closed");
            if shared.shutting_down.get() && shared.conns.borrow().is_empty() {
                shared.drained.notify_waiters();
            }
        });
    }
}

async fn setup_transport(
    config: &Config,
    incoming: Incoming,
) -> crate::Result<(Transport, Protocol)> {
    match incoming.stream {
        StdStream::Tcp(stream) => {
            stream
                .set_nonblocking(true)
                .map_err(crate::Error::new_accept)?;
            apply_stream_options(&stream, config);
            let stream = tokio::net::TcpStream::from_std(stream)
                .map_err(crate::Error::new_accept)?;
            match incoming.tls {
                Some(acceptor) => {
                    let tls = acceptor
                        .accept(stream)
                        .await
                        .map_err(crate::Error::new_accept)?;
                    let transport = Transport::Tls(Box::new(tls));
                    // ALPN may promote the connection straight to h2.
                    let protocol = if transport.alpn_protocol() == Some(b"h2".as_ref()) {
                        Protocol::Http2
                    } else {
                        incoming.protocol
                    };
                    Ok((transport, protocol))
                }
                None => Ok((Transport::Tcp(stream), incoming.protocol)),
            }
        }
        StdStream::Unix(stream) => {
            stream
                .set_nonblocking(true)
                .map_err(crate::Error::new_accept)?;
            let stream = tokio::net::UnixStream::from_std(stream)
                .map_err(crate::Error::new_accept)?;
            Ok((Transport::Unix(stream), incoming.protocol))
        }
    }
}

/// Runs one engine until shutdown completes. Blocks the calling thread.
pub(crate) fn run<H: Handler>(
    config: Arc<Config>,
    handler: Arc<H>,
    worker: usize,
    rx: UnboundedReceiver<Command>,
    own_listeners: Vec<BoundListener>,
) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build worker runtime");
    let local = tokio::task::LocalSet::new();

    local.block_on(&rt, async move {
        let shared = Rc::new(EngineShared {
            config,
            handler,
            worker,
            tick: Cell::new(0),
            conns: RefCell::new(Slab::new()),
            shutting_down: Cell::new(false),
            drained: Notify::new(),
            stop_accepting: Notify::new(),
        });

        shared.handler.post_fork_init(worker);

        spawn_idle_sweeper(&shared);
        for listener in own_listeners {
            spawn_acceptor(&shared, listener);
        }

        let mut rx = rx;
        while let Some(command) = rx.recv().await {
            match command {
                Command::Incoming(incoming) => shared.spawn_conn(incoming),
                Command::Shutdown => break,
            }
        }

        // Graceful drain: stop intake, close idle connections now and
        // busy ones as soon as their last request finishes.
        shared.shutting_down.set(true);
        shared.stop_accepting.notify_waiters();
        shared.handler.shutting_down();
        let pending: Vec<Rc<Conn>> = shared
            .conns
            .borrow()
            .iter()
            .map(|(_, conn)| Rc::clone(conn))
            .collect();
        for conn in pending {
            tokio::task::spawn_local(async move {
                conn.drained().await;
                conn.request_close();
            });
        }
        while !shared.conns.borrow().is_empty() {
            shared.drained.notified().await;
        }
    });
}

fn spawn_idle_sweeper<H: Handler>(shared: &Rc<EngineShared<H>>) {
    let shared = Rc::clone(shared);
    let period = timer::round(
        Duration::from_secs(shared.config.socket_timeout.max(1)),
        timer::Precision::VeryCoarse,
    );
    tokio::task::spawn_local(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let tick = shared.tick.get() + 1;
            shared.tick.set(tick);
            for (key, conn) in shared.conns.borrow().iter() {
                if conn.in_flight() == 0 && conn.last_io.get() + 1 < tick {
                    trace!(key, "closing idle connection");
                    conn.request_close();
                }
            }
        }
    });
}

/// Per-engine accept loop used in reuse-port mode, where the kernel
/// balances connections and no user-space balancer exists.
fn spawn_acceptor<H: Handler>(shared: &Rc<EngineShared<H>>, listener: BoundListener) {
    let shared = Rc::clone(shared);
    tokio::task::spawn_local(async move {
        let protocol = listener.protocol;
        let tls = listener.tls.clone();
        let Ok(accepting) = listener.into_tokio() else {
            warn!("failed to register listener with the worker runtime");
            return;
        };
        loop {
            tokio::select! {
                accepted = accepting.accept() => match accepted {
                    Ok(stream) => shared.spawn_conn(Incoming {
                        stream,
                        protocol,
                        tls: tls.clone(),
                    }),
                    Err(err) => {
                        // Resource exhaustion is transient; sleep rather
                        // than spinning on the error.
                        warn!("accept error: {}", err);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                _ = shared.stop_accepting.notified() => return,
            }
        }
    });
}
