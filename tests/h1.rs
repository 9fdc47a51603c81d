//! HTTP/1.1 end-to-end behavior over real sockets.

mod support;

use std::io::{Read, Write};
use std::time::Duration;

use manifold::{Handler, Headers, Request, ResponseSink, StatusCode, WebSocket};

use support::{connect, http_config, read_available, read_exact, read_until_head_end, spawn};

/// Answers `/hello` with `hi`, echoes request bodies on `/echo`, and
/// upgrades `/ws` to a websocket that echoes messages back.
struct App;

impl App {
    fn new() -> App {
        App
    }
}

impl Handler for App {
    async fn process_request(
        &self,
        request: Request,
        mut sink: ResponseSink,
    ) -> manifold::Result<()> {
        match request.path.as_str() {
            "hello" => {
                let mut headers = Headers::new();
                headers.push("Content-Type", "text/plain");
                headers.push("Content-Length", "2");
                sink.write_headers(StatusCode::OK, headers).await?;
                sink.write(b"hi").await?;
            }
            "a" | "b" => {
                let body = request.path.to_ascii_uppercase();
                let mut headers = Headers::new();
                headers.push("Content-Length", body.len().to_string());
                sink.write_headers(StatusCode::OK, headers).await?;
                sink.write(body.as_bytes()).await?;
            }
            "echo" => {
                let body = request.body.into_bytes().expect("request body");
                let mut headers = Headers::new();
                headers.push("Content-Length", body.len().to_string());
                sink.write_headers(StatusCode::OK, headers).await?;
                sink.write(&body).await?;
            }
            "ws" => {
                sink.websocket_handshake("", "", "").await?;
                return Ok(());
            }
            _ => {
                let mut headers = Headers::new();
                headers.push("Content-Length", "0");
                sink.write_headers(StatusCode::NOT_FOUND, headers).await?;
            }
        }
        sink.finish().await
    }

    fn text_message(&self, ws: &WebSocket, data: &str) {
        let _ = ws.send_text(&format!("echo:{data}"));
    }
}

#[test]
fn keep_alive_get() {
    let server = spawn(http_config(), App::new());
    let mut stream = connect(server.addr);

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let head = read_until_head_end(&mut stream);
    let text = String::from_utf8_lossy(&head).into_owned();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("Content-Length: 2\r\n"));
    assert!(text.contains("Connection: keep-alive\r\n"));
    assert!(text.contains("Date: "));
    let head_end = text.find("\r\n\r\n").unwrap() + 4;
    let mut body = head[head_end..].to_vec();
    if body.len() < 2 {
        body.extend(read_exact(&mut stream, 2 - body.len()));
    }
    assert_eq!(body, b"hi");

    // The connection is still usable for a second request.
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let again = read_until_head_end(&mut stream);
    assert!(again.starts_with(b"HTTP/1.1 200 OK\r\n"));
}

#[test]
fn pipelined_requests_answered_in_order() {
    let server = spawn(http_config(), App::new());
    let mut stream = connect(server.addr);

    stream
        .write_all(
            b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .unwrap();
    let reply = read_available(&mut stream, Duration::from_millis(800));
    let text = String::from_utf8_lossy(&reply);
    let first = text.find("\r\n\r\nA").expect("first response body");
    let second = text.find("\r\n\r\nB").expect("second response body");
    assert!(first < second);
    assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
}

#[test]
fn connection_close_is_honored() {
    let server = spawn(http_config(), App::new());
    let mut stream = connect(server.addr);

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let reply = read_available(&mut stream, Duration::from_secs(2));
    let text = String::from_utf8_lossy(&reply);
    assert!(text.contains("Connection: close\r\n"));
    // read_available only returns early on EOF or timeout; EOF proves
    // the server closed.
    let mut probe = [0u8; 1];
    assert_eq!(stream.read(&mut probe).unwrap_or(0), 0);
}

#[test]
fn body_is_buffered_and_spooled() {
    let mut config = http_config();
    // Force the disk-spill path for anything over 8 bytes.
    config.post_buffering = 8;
    let server = spawn(config, App::new());
    let mut stream = connect(server.addr);

    let body = "0123456789abcdef";
    let request = format!(
        "POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).unwrap();
    let reply = read_available(&mut stream, Duration::from_millis(800));
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with(body));
}

#[test]
fn oversized_head_gets_414() {
    let server = spawn(http_config(), App::new());
    let mut stream = connect(server.addr);

    let long_uri = "x".repeat(8192);
    let request = format!("GET /{long_uri} HTTP/1.1\r\nHost: x\r\n\r\n");
    stream.write_all(request.as_bytes()).unwrap();
    let reply = read_available(&mut stream, Duration::from_secs(2));
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("HTTP/1.1 414 "), "got: {text}");
}

#[test]
fn idle_connection_is_closed() {
    let mut config = http_config();
    config.socket_timeout = 1;
    let server = spawn(config, App::new());
    let mut stream = connect(server.addr);

    // No bytes sent: the server must hang up on its own, emitting
    // nothing.
    stream
        .set_read_timeout(Some(Duration::from_secs(4)))
        .unwrap();
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {n} bytes from idle connection"),
        Err(err) => panic!("connection not closed within the timeout: {err}"),
    }
}

fn mask_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mask = [0x37, 0xfa, 0x21, 0x3d];
    assert!(payload.len() < 126);
    let mut frame = vec![0x80 | opcode, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    for (i, b) in payload.iter().enumerate() {
        frame.push(b ^ mask[i % 4]);
    }
    frame
}

#[test]
fn websocket_upgrade_and_echo() {
    let server = spawn(http_config(), App::new());
    let mut stream = connect(server.addr);

    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
              Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
    let head = read_until_head_end(&mut stream);
    let text = String::from_utf8_lossy(&head).to_ascii_lowercase();
    assert!(text.starts_with("http/1.1 101 "), "got: {text}");
    assert!(text.contains("sec-websocket-accept: s3pplmbitxaq9kygzzhzrbk+xoo="));

    // A masked text frame comes back echoed, unmasked, single frame.
    stream.write_all(&mask_frame(0x1, b"ping")).unwrap();
    let reply = read_exact(&mut stream, 2);
    assert_eq!(reply[0], 0x81);
    let len = reply[1] as usize;
    let payload = read_exact(&mut stream, len);
    assert_eq!(payload, b"echo:ping");

    // Close with a normal code; the server echoes 1000 and hangs up.
    stream.write_all(&mask_frame(0x8, &[0x03, 0xe8])).unwrap();
    let close = read_available(&mut stream, Duration::from_secs(2));
    assert!(close.len() >= 4);
    assert_eq!(close[0], 0x88);
    assert_eq!(&close[2..4], &[0x03, 0xe8]);
}

#[test]
fn unmasked_websocket_frame_closes_1002() {
    let server = spawn(http_config(), App::new());
    let mut stream = connect(server.addr);

    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
              Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
    read_until_head_end(&mut stream);

    // FIN+text with the mask bit clear.
    stream.write_all(&[0x81, 0x04, b'o', b'o', b'p', b's']).unwrap();
    let close = read_available(&mut stream, Duration::from_secs(2));
    assert!(close.len() >= 4, "expected a close frame, got {close:?}");
    assert_eq!(close[0], 0x88);
    assert_eq!(u16::from_be_bytes([close[2], close[3]]), 1002);
}
