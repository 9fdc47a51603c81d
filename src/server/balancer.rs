//! The intra-process connection balancer.
//!
//! One accept thread per listening socket hands accepted sockets to the
//! worker engines round-robin over their command channels. In
//! reuse-port mode the TCP listeners bypass this entirely and each
//! engine accepts for itself.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::engine::{EngineHandle, Incoming};
use crate::server::listener::{BoundListener, StdListener, StdStream};

pub(crate) struct Balancer {
    engines: Vec<EngineHandle>,
    next: AtomicUsize,
}

impl Balancer {
    pub(crate) fn new(engines: Vec<EngineHandle>) -> Arc<Balancer> {
        Arc::new(Balancer {
            engines,
            next: AtomicUsize::new(0),
        })
    }

    /// Round-robin: the counter advances on every accepted connection.
    pub(crate) fn dispatch(&self, incoming: Incoming) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.engines.len();
        self.engines[index].dispatch(incoming);
    }

    pub(crate) fn shutdown_engines(&self) {
        for engine in &self.engines {
            engine.shutdown();
        }
    }
}

/// Spawns one accept thread per listener. Threads exit once `stop` is
/// set; the poll timeout bounds how long that takes.
pub(crate) fn spawn_accept_threads(
    listeners: Vec<BoundListener>,
    balancer: Arc<Balancer>,
    stop: Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    listeners
        .into_iter()
        .map(|listener| {
            let balancer = Arc::clone(&balancer);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name(format!("accept-{}", listener.name))
                .spawn(move || accept_loop(listener, balancer, stop))
                .expect("failed to spawn accept thread")
        })
        .collect()
}

fn accept_loop(listener: BoundListener, balancer: Arc<Balancer>, stop: Arc<AtomicBool>) {
    let protocol = listener.protocol;
    let tls = listener.tls;
    let fd = match &listener.inner {
        StdListener::Tcp(l) => l.as_raw_fd(),
        StdListener::Unix(l) => l.as_raw_fd(),
    };

    while !stop.load(Ordering::Relaxed) {
        if !poll_readable(fd, 250) {
            continue;
        }
        let accepted = match &listener.inner {
            StdListener::Tcp(l) => l.accept().map(|(s, _)| StdStream::Tcp(s)),
            StdListener::Unix(l) => l.accept().map(|(s, _)| StdStream::Unix(s)),
        };
        match accepted {
            Ok(stream) => balancer.dispatch(Incoming {
                stream,
                protocol,
                tls: tls.clone(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                warn!("accept error on {}: {}", listener.name, err);
                std::thread::sleep(std::time::Duration::from_secs(1));
            }
        }
    }
    debug!("accept thread for {} stopping", listener.name);
}

/// Waits for the fd to become readable, returning false on timeout.
fn poll_readable(fd: i32, timeout_ms: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    rc > 0 && pfd.revents & libc::POLLIN != 0
}
