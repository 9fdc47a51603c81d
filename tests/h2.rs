//! HTTP/2 end-to-end behavior: raw frames over real sockets.

mod support;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use manifold::{Handler, Headers, Request, ResponseSink, StatusCode};

use support::{connect, read_available, spawn};

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

fn h2_config() -> manifold::config::Config {
    let mut config = manifold::config::Config::default();
    config.apply("http2-socket", "127.0.0.1:0").unwrap();
    config.apply("buffer-size", "16393").unwrap();
    config
}

/// Records the headers of every request and answers with `hi` (or a
/// large body on `/big`).
struct App {
    seen: Arc<Mutex<Vec<Headers>>>,
}

impl App {
    fn new() -> App {
        App::recording(Arc::new(Mutex::new(Vec::new())))
    }

    fn recording(seen: Arc<Mutex<Vec<Headers>>>) -> App {
        App { seen }
    }
}

impl Handler for App {
    async fn process_request(
        &self,
        request: Request,
        mut sink: ResponseSink,
    ) -> manifold::Result<()> {
        self.seen.lock().unwrap().push(request.headers.clone());
        let body: Vec<u8> = if request.path == "big" {
            vec![b'x'; 200_000]
        } else {
            b"hi".to_vec()
        };
        let mut headers = Headers::new();
        headers.push("Content-Type", "text/plain");
        headers.push("Content-Length", body.len().to_string());
        sink.write_headers(StatusCode::OK, headers).await?;
        sink.write(&body).await?;
        sink.finish().await
    }
}

fn frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let id = stream_id.to_be_bytes();
    let mut out = vec![
        (len >> 16) as u8,
        (len >> 8) as u8,
        len as u8,
        kind,
        flags,
        id[0] & 0x7f,
        id[1],
        id[2],
        id[3],
    ];
    out.extend_from_slice(payload);
    out
}

/// `:method GET`, `:scheme https`, `:path /`, `:authority x`, plus any
/// extra pre-encoded header fields.
fn get_block(extra: &[u8]) -> Vec<u8> {
    let mut block = vec![0x82, 0x87, 0x84];
    block.push(0x01);
    block.push(1);
    block.push(b'x');
    block.extend_from_slice(extra);
    block
}

/// Path override variant of [`get_block`].
fn get_block_for_path(path: &str) -> Vec<u8> {
    let mut block = vec![0x82, 0x87];
    // :path as a literal without indexing, name index 4.
    block.push(0x04);
    block.push(path.len() as u8);
    block.extend_from_slice(path.as_bytes());
    block.push(0x01);
    block.push(1);
    block.push(b'x');
    block
}

struct FrameReader {
    stream: TcpStream,
    buf: Vec<u8>,
}

#[derive(Debug)]
struct RawFrame {
    kind: u8,
    flags: u8,
    stream_id: u32,
    payload: Vec<u8>,
}

impl FrameReader {
    fn new(stream: TcpStream) -> FrameReader {
        FrameReader {
            stream,
            buf: Vec::new(),
        }
    }

    fn next(&mut self) -> RawFrame {
        loop {
            if self.buf.len() >= 9 {
                let len = ((self.buf[0] as usize) << 16)
                    | ((self.buf[1] as usize) << 8)
                    | self.buf[2] as usize;
                if self.buf.len() >= 9 + len {
                    let payload = self.buf[9..9 + len].to_vec();
                    let raw = RawFrame {
                        kind: self.buf[3],
                        flags: self.buf[4],
                        stream_id: u32::from_be_bytes([
                            self.buf[5] & 0x7f,
                            self.buf[6],
                            self.buf[7],
                            self.buf[8],
                        ]),
                        payload,
                    };
                    self.buf.drain(..9 + len);
                    return raw;
                }
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).expect("read frame");
            assert!(n > 0, "connection closed while waiting for a frame");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Skips frames until one of `kind` arrives.
    fn expect(&mut self, kind: u8) -> RawFrame {
        loop {
            let frame = self.next();
            if frame.kind == kind {
                return frame;
            }
        }
    }
}

#[test]
fn preface_settings_and_get() {
    let server = spawn(h2_config(), App::new());
    let mut stream = connect(server.addr);

    stream.write_all(PREFACE).unwrap();
    stream.write_all(&frame(0x4, 0, 0, &[])).unwrap();
    stream
        .write_all(&frame(0x1, 0x4 | 0x1, 1, &get_block(&[])))
        .unwrap();

    let mut reader = FrameReader::new(stream.try_clone().unwrap());

    // Server settings advertise the frame and table limits.
    let settings = reader.expect(0x4);
    assert_eq!(settings.flags & 0x1, 0);
    assert_eq!(settings.stream_id, 0);
    assert_eq!(settings.payload.len() % 6, 0);
    let ids: Vec<u16> = settings
        .payload
        .chunks(6)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    assert!(ids.contains(&0x5), "MAX_FRAME_SIZE missing: {ids:?}");
    assert!(ids.contains(&0x1), "HEADER_TABLE_SIZE missing: {ids:?}");

    // Our empty SETTINGS gets acked.
    let ack = reader.expect(0x4);
    assert_eq!(ack.flags & 0x1, 0x1);

    // Response: HEADERS with :status 200, then DATA ending the stream.
    let headers = reader.expect(0x1);
    assert_eq!(headers.stream_id, 1);
    assert_eq!(headers.flags & 0x4, 0x4);
    assert_eq!(headers.payload[0], 0x88);

    let mut body = Vec::new();
    loop {
        let data = reader.expect(0x0);
        assert_eq!(data.stream_id, 1);
        body.extend_from_slice(&data.payload);
        if data.flags & 0x1 != 0 {
            break;
        }
    }
    assert_eq!(body, b"hi");
}

#[test]
fn hpack_dynamic_indexing_across_requests() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let server = spawn(h2_config(), App::recording(Arc::clone(&seen)));
    let mut stream = connect(server.addr);

    stream.write_all(PREFACE).unwrap();
    stream.write_all(&frame(0x4, 0, 0, &[])).unwrap();

    // First request: literal with incremental indexing, x-custom: abc.
    let mut extra = vec![0x40];
    extra.push(8);
    extra.extend_from_slice(b"x-custom");
    extra.push(3);
    extra.extend_from_slice(b"abc");
    stream
        .write_all(&frame(0x1, 0x4 | 0x1, 1, &get_block(&extra)))
        .unwrap();

    // Second request references dynamic index 62.
    stream
        .write_all(&frame(0x1, 0x4 | 0x1, 3, &get_block(&[0xbe])))
        .unwrap();

    let mut reader = FrameReader::new(stream.try_clone().unwrap());
    let mut ended = 0;
    while ended < 2 {
        let data = reader.expect(0x0);
        if data.flags & 0x1 != 0 {
            ended += 1;
        }
    }

    let snapshot = seen.lock().unwrap().clone();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].get("x-custom"), Some("abc"));
    assert_eq!(snapshot[1].get("x-custom"), Some("abc"));
}

#[test]
fn flow_control_blocks_until_window_update() {
    let server = spawn(h2_config(), App::new());
    let mut stream = connect(server.addr);

    stream.write_all(PREFACE).unwrap();
    stream.write_all(&frame(0x4, 0, 0, &[])).unwrap();
    stream
        .write_all(&frame(0x1, 0x4 | 0x1, 1, &get_block_for_path("/big")))
        .unwrap();

    // Drain until the server exhausts the 65535-byte windows and stalls.
    let mut received = 0usize;
    {
        let mut probe = stream.try_clone().unwrap();
        let bytes = read_available(&mut probe, Duration::from_millis(1500));
        for f in iterate_frames(&bytes) {
            if f.kind == 0x0 {
                received += f.payload.len();
            }
        }
    }
    assert!(received <= 65_535, "sent {received} bytes into a 65535 window");
    assert!(received > 0);

    // Open both windows; the rest of the body arrives.
    stream
        .write_all(&frame(0x8, 0, 0, &1_000_000u32.to_be_bytes()))
        .unwrap();
    stream
        .write_all(&frame(0x8, 0, 1, &1_000_000u32.to_be_bytes()))
        .unwrap();
    let mut rest_probe = stream.try_clone().unwrap();
    let rest = read_available(&mut rest_probe, Duration::from_secs(3));
    let mut total = received;
    let mut finished = false;
    for f in iterate_frames(&rest) {
        if f.kind == 0x0 {
            total += f.payload.len();
            if f.flags & 0x1 != 0 {
                finished = true;
            }
        }
    }
    assert!(finished, "stream did not finish after WINDOW_UPDATE");
    assert_eq!(total, 200_000);
}

/// Parses a byte capture into frames (ignoring a trailing partial one).
fn iterate_frames(mut bytes: &[u8]) -> Vec<RawFrame> {
    let mut frames = Vec::new();
    while bytes.len() >= 9 {
        let len =
            ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize;
        if bytes.len() < 9 + len {
            break;
        }
        frames.push(RawFrame {
            kind: bytes[3],
            flags: bytes[4],
            stream_id: u32::from_be_bytes([bytes[5] & 0x7f, bytes[6], bytes[7], bytes[8]]),
            payload: bytes[9..9 + len].to_vec(),
        });
        bytes = &bytes[9 + len..];
    }
    frames
}

#[test]
fn ping_is_echoed_with_ack() {
    let server = spawn(h2_config(), App::new());
    let mut stream = connect(server.addr);

    stream.write_all(PREFACE).unwrap();
    stream.write_all(&frame(0x4, 0, 0, &[])).unwrap();
    let payload = [1, 2, 3, 4, 5, 6, 7, 8];
    stream.write_all(&frame(0x6, 0, 0, &payload)).unwrap();

    let mut reader = FrameReader::new(stream);
    let pong = reader.expect(0x6);
    assert_eq!(pong.flags & 0x1, 0x1);
    assert_eq!(pong.payload, payload);
}

#[test]
fn even_stream_id_is_a_protocol_error() {
    let server = spawn(h2_config(), App::new());
    let mut stream = connect(server.addr);

    stream.write_all(PREFACE).unwrap();
    stream.write_all(&frame(0x4, 0, 0, &[])).unwrap();
    stream
        .write_all(&frame(0x1, 0x4 | 0x1, 2, &get_block(&[])))
        .unwrap();

    let mut reader = FrameReader::new(stream);
    let goaway = reader.expect(0x7);
    let error = u32::from_be_bytes(goaway.payload[4..8].try_into().unwrap());
    assert_eq!(error, 0x1);
}

#[test]
fn missing_preface_closes_the_connection() {
    let server = spawn(h2_config(), App::new());
    let mut stream = connect(server.addr);

    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let reply = read_available(&mut stream, Duration::from_secs(2));
    assert!(reply.is_empty(), "expected a silent close, got {reply:?}");
    let mut probe = [0u8; 1];
    assert_eq!(stream.read(&mut probe).unwrap_or(0), 0);
}

#[test]
fn h2c_upgrade_adopts_request_as_stream_one() {
    let mut config = support::http_config();
    config.apply("upgrade-h2c", "1").unwrap();
    config.apply("buffer-size", "16393").unwrap();
    let server = spawn(config, App::new());
    let mut stream = connect(server.addr);

    stream
        .write_all(
            b"GET /hello HTTP/1.1\r\nHost: x\r\nUpgrade: h2c\r\n\
              Connection: Upgrade, HTTP2-Settings\r\nHTTP2-Settings: AAMAAABk\r\n\r\n",
        )
        .unwrap();

    // 101, then the server's SETTINGS and the stream-1 response frames.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let text = String::from_utf8_lossy(&head);
    assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(text.contains("Upgrade: h2c\r\n"));

    stream.write_all(PREFACE).unwrap();
    stream.write_all(&frame(0x4, 0, 0, &[])).unwrap();

    let mut reader = FrameReader::new(stream);
    let headers = reader.expect(0x1);
    assert_eq!(headers.stream_id, 1);
    assert_eq!(headers.payload[0], 0x88);
    let mut body = Vec::new();
    loop {
        let data = reader.expect(0x0);
        body.extend_from_slice(&data.payload);
        if data.flags & 0x1 != 0 {
            break;
        }
    }
    assert_eq!(body, b"hi");
}
