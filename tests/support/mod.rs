//! Shared scaffolding: spin a server up on an OS-assigned port and talk
//! raw bytes to it.
#![allow(dead_code)]

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use manifold::config::Config;
use manifold::{Handler, Server, ServerHandle};

pub struct TestServer {
    pub addr: SocketAddr,
    #[allow(dead_code)]
    pub handle: ServerHandle,
}

/// Binds the configured server and runs it on a background thread.
pub fn spawn<H: Handler>(config: Config, handler: H) -> TestServer {
    let _ = pretty_env_logger::try_init();
    let server = Server::bind(config, handler).expect("bind test server");
    let addr = *server.local_addrs().first().expect("one tcp listener");
    let handle = server.handle();
    std::thread::spawn(move || {
        let _ = server.run();
    });
    TestServer { addr, handle }
}

/// An HTTP/1.1 config on an ephemeral local port.
pub fn http_config() -> Config {
    let mut config = Config::default();
    config
        .apply("http-socket", "127.0.0.1:0")
        .expect("socket spec");
    config
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect to test server");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    stream
}

/// Reads until the peer closes or the timeout fires.
pub fn read_available(stream: &mut TcpStream, window: Duration) -> Vec<u8> {
    stream.set_read_timeout(Some(window)).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    out
}

/// Reads exactly `n` bytes.
pub fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    stream.read_exact(&mut out).expect("read_exact");
    out
}

/// Reads until the two-CRLF end of an HTTP/1.1 head, returning
/// everything read so far (possibly including body bytes).
pub fn read_until_head_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    while !out.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).expect("read head");
        assert!(n > 0, "connection closed before head completed");
        out.extend_from_slice(&buf[..n]);
    }
    out
}
