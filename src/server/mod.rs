//! Ties configuration, listeners, workers and the lifecycle together.

pub(crate) mod balancer;
pub(crate) mod listener;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use crate::config::Config;
use crate::engine;
use crate::lifecycle::fork;
use crate::lifecycle::signal::{SignalPipe, SignalSender};
use crate::lifecycle::systemd;
use crate::server::balancer::Balancer;
use crate::server::listener::BoundListener;
use crate::service::Handler;

const WORKER_SIGNALS: &[i32] = &[libc::SIGINT, libc::SIGQUIT, libc::SIGTERM];

/// A configured server with its listeners bound.
///
/// Binding happens before any worker exists (and before privileges are
/// dropped), so configuration and bind errors surface from
/// [`Server::bind`] and map to a startup failure.
pub struct Server<H> {
    config: Arc<Config>,
    handler: Arc<H>,
    listeners: Vec<BoundListener>,
    stop_pipe: SignalPipe,
}

/// Asks a running in-process server to shut down gracefully.
#[derive(Clone, Copy, Debug)]
pub struct ServerHandle {
    sender: SignalSender,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.sender.send(libc::SIGQUIT);
    }
}

impl<H> std::fmt::Debug for Server<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<H: Handler> Server<H> {
    /// Validates the configuration and binds every listener.
    pub fn bind(config: Config, handler: H) -> crate::Result<Server<H>> {
        config.validate()?;
        let listeners = listener::bind_all(&config, config.reuse_port)?;
        let stop_pipe = SignalPipe::new().map_err(crate::Error::new_listen)?;
        Ok(Server {
            config: Arc::new(config),
            handler: Arc::new(handler),
            listeners,
            stop_pipe,
        })
    }

    /// Addresses of the bound TCP listeners, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.local_addr())
            .collect()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            sender: self.stop_pipe.sender(),
        }
    }

    /// Runs the server until shutdown. With a master (or more than one
    /// process) the current process supervises forked workers;
    /// otherwise the workers run right here.
    pub fn run(self) -> crate::Result<()> {
        let Server {
            config,
            handler,
            listeners,
            stop_pipe,
        } = self;

        if config.master || config.processes > 1 {
            let worker_count = config.processes.max(1);
            fork::run_master(&config, worker_count, |worker| {
                match run_worker(&config, &handler, &listeners, worker, None) {
                    Ok(()) => 0,
                    Err(err) => {
                        error!("worker {} failed: {}", worker, err);
                        1
                    }
                }
            })
        } else {
            fork::write_pidfile(config.pidfile.as_deref())?;
            fork::apply_umask(&config);
            fork::drop_privileges(&config)?;
            fork::write_pidfile(config.pidfile2.as_deref())?;
            run_worker(&config, &handler, &listeners, 0, Some(&stop_pipe))
        }
    }
}

/// One worker process: M engine threads plus the accept/balance side.
fn run_worker<H: Handler>(
    config: &Arc<Config>,
    handler: &Arc<H>,
    listeners: &[BoundListener],
    process_index: usize,
    pipe: Option<&SignalPipe>,
) -> crate::Result<()> {
    // Each process accepts on duplicated descriptors of the shared
    // listening sockets.
    let mut local: Vec<BoundListener> = listeners
        .iter()
        .map(|l| l.try_clone())
        .collect::<std::io::Result<_>>()
        .map_err(crate::Error::new_listen)?;
    if config.reuse_port {
        // TCP intake is kernel-balanced straight into the engines; only
        // local sockets still go through the balancer.
        local.retain(|listener| listener.is_unix());
    }

    let threads = config.threads.max(1);
    let mut engine_handles = Vec::with_capacity(threads);
    let mut engine_threads = Vec::with_capacity(threads);
    for thread_index in 0..threads {
        let (handle, rx) = engine::channel();
        engine_handles.push(handle);
        let own_listeners = if config.reuse_port {
            listener::bind_tcp_reuse(config)?
        } else {
            Vec::new()
        };
        let config = Arc::clone(config);
        let handler = Arc::clone(handler);
        let worker = process_index * threads + thread_index;
        engine_threads.push(
            std::thread::Builder::new()
                .name(format!("worker-{worker}"))
                .spawn(move || engine::run(config, handler, worker, rx, own_listeners))
                .expect("failed to spawn worker thread"),
        );
    }

    let balancer = Balancer::new(engine_handles);
    let stop = Arc::new(AtomicBool::new(false));
    let accept_threads =
        balancer::spawn_accept_threads(local, Arc::clone(&balancer), Arc::clone(&stop));

    let owned_pipe;
    let pipe = match pipe {
        Some(pipe) => pipe,
        None => {
            owned_pipe = SignalPipe::new().map_err(crate::Error::new_listen)?;
            &owned_pipe
        }
    };
    pipe.install(WORKER_SIGNALS)
        .map_err(crate::Error::new_listen)?;
    if !config.master && config.processes <= 1 {
        systemd::notify_ready();
    }

    let mut fast_exit = false;
    loop {
        match pipe.wait(1000).map_err(crate::Error::new_io)? {
            Some(signo) if signo == libc::SIGINT || signo == libc::SIGQUIT => {
                info!("worker shutting down gracefully");
                break;
            }
            Some(signo) if signo == libc::SIGTERM => {
                fast_exit = true;
                break;
            }
            _ => {}
        }
    }

    // The listeners close first; the engines then drain their
    // connections before the threads join.
    stop.store(true, Ordering::Relaxed);
    for thread in accept_threads {
        let _ = thread.join();
    }
    balancer.shutdown_engines();
    if fast_exit {
        return Ok(());
    }
    for thread in engine_threads {
        let _ = thread.join();
    }
    Ok(())
}

impl BoundListener {
    fn is_unix(&self) -> bool {
        matches!(self.inner, listener::StdListener::Unix(_))
    }
}
