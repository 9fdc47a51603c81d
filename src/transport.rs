//! The byte-stream transports a connection can ride on.
//!
//! Plain TCP, TLS-terminated TCP and local (Unix) sockets are one closed
//! set; everything above them sees a single `Transport` with a small
//! capability surface instead of a type per socket flavor.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::server::TlsStream;

pub(crate) enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Unix(UnixStream),
}

/// Peer identity as exposed to request records.
#[derive(Debug, Clone)]
pub(crate) struct Peer {
    pub(crate) addr: IpAddr,
    pub(crate) port: u16,
    pub(crate) server: String,
}

impl Transport {
    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// The ALPN protocol negotiated during the TLS handshake, if any.
    pub(crate) fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            Transport::Tls(tls) => tls.get_ref().1.alpn_protocol(),
            _ => None,
        }
    }

    pub(crate) fn peer(&self) -> Peer {
        match self {
            Transport::Tcp(stream) => peer_of(stream.peer_addr(), stream.local_addr()),
            Transport::Tls(tls) => {
                let stream = tls.get_ref().0;
                peer_of(stream.peer_addr(), stream.local_addr())
            }
            Transport::Unix(_) => Peer {
                addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 0,
                server: "localhost".to_owned(),
            },
        }
    }
}

fn peer_of(remote: io::Result<SocketAddr>, local: io::Result<SocketAddr>) -> Peer {
    let remote = remote.unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    Peer {
        addr: remote.ip(),
        port: remote.port(),
        server: local
            .map(|a| a.to_string())
            .unwrap_or_else(|_| String::new()),
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Transport::Tls(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Transport::Unix(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s).poll_flush(cx),
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Transport::Tcp(s) => s.is_write_vectored(),
            Transport::Tls(s) => s.is_write_vectored(),
            Transport::Unix(s) => s.is_write_vectored(),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp(_) => f.write_str("Transport::Tcp"),
            Transport::Tls(_) => f.write_str("Transport::Tls"),
            Transport::Unix(_) => f.write_str("Transport::Unix"),
        }
    }
}
