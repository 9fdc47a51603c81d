//! Listener creation.
//!
//! All listening sockets are bound up front (before privilege drop and
//! before any worker exists) with socket2, so bind errors surface as a
//! startup failure instead of a half-running server.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::os::fd::FromRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::path::Path;
use std::sync::Arc;

use socket2::{Domain, Protocol as SockProtocol, SockRef, Socket, Type};
use tokio_rustls::rustls::ServerConfig as RustlsConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::config::{BindAddr, Config, TlsSocketSpec};
use crate::proto::Protocol;

/// An accepted stream on its way to a worker.
pub(crate) enum StdStream {
    Tcp(StdTcpStream),
    Unix(StdUnixStream),
}

pub(crate) enum StdListener {
    Tcp(StdTcpListener),
    Unix(StdUnixListener),
}

/// A bound listening socket plus what to speak on it.
pub(crate) struct BoundListener {
    pub(crate) inner: StdListener,
    pub(crate) protocol: Protocol,
    pub(crate) tls: Option<Arc<TlsAcceptor>>,
    pub(crate) name: String,
}

impl BoundListener {
    /// Duplicates the listening descriptor for another accept loop.
    pub(crate) fn try_clone(&self) -> io::Result<BoundListener> {
        let inner = match &self.inner {
            StdListener::Tcp(listener) => StdListener::Tcp(listener.try_clone()?),
            StdListener::Unix(listener) => StdListener::Unix(listener.try_clone()?),
        };
        Ok(BoundListener {
            inner,
            protocol: self.protocol,
            tls: self.tls.clone(),
            name: self.name.clone(),
        })
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            StdListener::Tcp(listener) => listener.local_addr().ok(),
            StdListener::Unix(_) => None,
        }
    }

    /// Registers the listener with the current tokio runtime.
    pub(crate) fn into_tokio(self) -> io::Result<TokioAcceptor> {
        match self.inner {
            StdListener::Tcp(listener) => Ok(TokioAcceptor::Tcp(
                tokio::net::TcpListener::from_std(listener)?,
            )),
            StdListener::Unix(listener) => Ok(TokioAcceptor::Unix(
                tokio::net::UnixListener::from_std(listener)?,
            )),
        }
    }
}

pub(crate) enum TokioAcceptor {
    Tcp(tokio::net::TcpListener),
    Unix(tokio::net::UnixListener),
}

impl TokioAcceptor {
    pub(crate) async fn accept(&self) -> io::Result<StdStream> {
        match self {
            TokioAcceptor::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(StdStream::Tcp(stream.into_std()?))
            }
            TokioAcceptor::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(StdStream::Unix(stream.into_std()?))
            }
        }
    }
}

/// Binds every configured listener. `reuse_port` selects per-worker
/// kernel balancing for the TCP sockets. Sockets passed by the init
/// system (`LISTEN_FDS`) are adopted positionally instead of bound.
pub(crate) fn bind_all(config: &Config, reuse_port: bool) -> crate::Result<Vec<BoundListener>> {
    let mut passed = crate::lifecycle::systemd::listen_fds().iter().copied();
    let mut listeners = Vec::new();

    for spec in &config.http_sockets {
        listeners.push(bind_spec(
            &spec.addr,
            Protocol::Http1,
            None,
            config,
            reuse_port,
            passed.next(),
        )?);
    }
    for spec in &config.https_sockets {
        let acceptor = tls_acceptor(spec, config.https_h2)?;
        listeners.push(bind_spec(
            &BindAddr::Tcp(spec.addr),
            Protocol::Http1,
            Some(acceptor),
            config,
            reuse_port,
            passed.next(),
        )?);
    }
    for spec in &config.http2_sockets {
        listeners.push(bind_spec(
            &spec.addr,
            Protocol::Http2,
            None,
            config,
            reuse_port,
            passed.next(),
        )?);
    }
    for spec in &config.fastcgi_sockets {
        listeners.push(bind_spec(
            &spec.addr,
            Protocol::FastCgi,
            None,
            config,
            reuse_port,
            passed.next(),
        )?);
    }

    Ok(listeners)
}

/// Fresh per-engine TCP listeners for reuse-port mode; Unix specs are
/// skipped (they keep going through the balancer).
pub(crate) fn bind_tcp_reuse(config: &Config) -> crate::Result<Vec<BoundListener>> {
    let mut listeners = Vec::new();
    let tcp_only = |addr: &BindAddr| matches!(addr, BindAddr::Tcp(_));

    for spec in config.http_sockets.iter().filter(|s| tcp_only(&s.addr)) {
        listeners.push(bind_spec(&spec.addr, Protocol::Http1, None, config, true, None)?);
    }
    for spec in &config.https_sockets {
        let acceptor = tls_acceptor(spec, config.https_h2)?;
        listeners.push(bind_spec(
            &BindAddr::Tcp(spec.addr),
            Protocol::Http1,
            Some(acceptor),
            config,
            true,
            None,
        )?);
    }
    for spec in config.http2_sockets.iter().filter(|s| tcp_only(&s.addr)) {
        listeners.push(bind_spec(&spec.addr, Protocol::Http2, None, config, true, None)?);
    }
    for spec in config.fastcgi_sockets.iter().filter(|s| tcp_only(&s.addr)) {
        listeners.push(bind_spec(&spec.addr, Protocol::FastCgi, None, config, true, None)?);
    }

    Ok(listeners)
}

fn bind_spec(
    addr: &BindAddr,
    protocol: Protocol,
    tls: Option<Arc<TlsAcceptor>>,
    config: &Config,
    reuse_port: bool,
    passed_fd: Option<std::os::fd::RawFd>,
) -> crate::Result<BoundListener> {
    match addr {
        BindAddr::Tcp(addr) => {
            let listener = match passed_fd {
                Some(fd) => {
                    let listener =
                        unsafe { <StdTcpListener as FromRawFd>::from_raw_fd(fd) };
                    listener
                        .set_nonblocking(true)
                        .map_err(crate::Error::new_listen)?;
                    listener
                }
                None => bind_tcp(*addr, config, reuse_port)?,
            };
            let name = listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| addr.to_string());
            debug!(%name, ?protocol, "listening");
            Ok(BoundListener {
                inner: StdListener::Tcp(listener),
                protocol,
                tls,
                name,
            })
        }
        BindAddr::Unix(path) => {
            let listener = match passed_fd {
                Some(fd) => {
                    let listener =
                        unsafe { <StdUnixListener as FromRawFd>::from_raw_fd(fd) };
                    listener
                        .set_nonblocking(true)
                        .map_err(crate::Error::new_listen)?;
                    listener
                }
                None => bind_unix(path, config)?,
            };
            debug!(name = %path.display(), ?protocol, "listening");
            Ok(BoundListener {
                inner: StdListener::Unix(listener),
                protocol,
                tls: None,
                name: path.display().to_string(),
            })
        }
    }
}

fn bind_tcp(
    addr: SocketAddr,
    config: &Config,
    reuse_port: bool,
) -> crate::Result<StdTcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))
        .map_err(crate::Error::new_listen)?;
    socket
        .set_reuse_address(true)
        .map_err(crate::Error::new_listen)?;
    if reuse_port {
        socket
            .set_reuse_port(true)
            .map_err(crate::Error::new_listen)?;
    }
    socket
        .bind(&addr.into())
        .map_err(crate::Error::new_listen)?;
    socket
        .listen(config.listen_backlog)
        .map_err(crate::Error::new_listen)?;
    socket
        .set_nonblocking(true)
        .map_err(crate::Error::new_listen)?;
    Ok(socket.into())
}

fn bind_unix(path: &Path, config: &Config) -> crate::Result<StdUnixListener> {
    // A stale socket file from a previous run would fail the bind.
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    let listener = StdUnixListener::bind(path).map_err(crate::Error::new_listen)?;
    listener
        .set_nonblocking(true)
        .map_err(crate::Error::new_listen)?;
    if let Some(owner) = config.chown_socket {
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| crate::Error::new_config("socket path contains NUL"))?;
        let rc = unsafe { libc::chown(c_path.as_ptr(), owner.uid, owner.gid) };
        if rc != 0 {
            return Err(crate::Error::new_listen(io::Error::last_os_error()));
        }
    }
    Ok(listener)
}

/// Per-connection socket options, applied as connections are accepted.
pub(crate) fn apply_stream_options(stream: &StdTcpStream, config: &Config) {
    let sock = SockRef::from(stream);
    if config.tcp_nodelay {
        if let Err(err) = sock.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {}", err);
        }
    }
    if config.so_keepalive {
        if let Err(err) = sock.set_keepalive(true) {
            warn!("failed to set SO_KEEPALIVE: {}", err);
        }
    }
    if let Some(size) = config.socket_sndbuf {
        if let Err(err) = sock.set_send_buffer_size(size) {
            warn!("failed to set SO_SNDBUF: {}", err);
        }
    }
    if let Some(size) = config.socket_rcvbuf {
        if let Err(err) = sock.set_recv_buffer_size(size) {
            warn!("failed to set SO_RCVBUF: {}", err);
        }
    }
}

fn tls_acceptor(spec: &TlsSocketSpec, https_h2: bool) -> crate::Result<Arc<TlsAcceptor>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(&spec.cert).map_err(crate::Error::new_listen)?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .map_err(crate::Error::new_listen)?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(&spec.key).map_err(crate::Error::new_listen)?,
    ))
    .map_err(crate::Error::new_listen)?
    .ok_or_else(|| crate::Error::new_config("no private key found in key file"))?;

    let mut tls_config = RustlsConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(crate::Error::new_listen)?;
    tls_config.alpn_protocols = if https_h2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };
    Ok(Arc::new(TlsAcceptor::from(Arc::new(tls_config))))
}
