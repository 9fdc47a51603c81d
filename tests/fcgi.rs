//! FastCGI end-to-end lifecycle over a real socket.

mod support;

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use manifold::{Handler, Headers, Request, ResponseSink, StatusCode};

use support::{connect, read_available, spawn};

const BEGIN_REQUEST: u8 = 1;
const END_REQUEST: u8 = 3;
const PARAMS: u8 = 4;
const STDIN: u8 = 5;
const STDOUT: u8 = 6;
const KEEP_CONN: u8 = 1;

fn fcgi_config() -> manifold::config::Config {
    let mut config = manifold::config::Config::default();
    config.apply("fastcgi-socket", "127.0.0.1:0").unwrap();
    config
}

#[derive(Clone)]
struct Seen {
    method: String,
    body: Vec<u8>,
    content_type: Option<String>,
}

struct App {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Handler for App {
    async fn process_request(
        &self,
        request: Request,
        mut sink: ResponseSink,
    ) -> manifold::Result<()> {
        let content_type = request.headers.get("CONTENT_TYPE").map(str::to_owned);
        let body = request.body.into_bytes().expect("request body");
        self.seen.lock().unwrap().push(Seen {
            method: request.method.clone(),
            body: body.clone(),
            content_type,
        });

        let mut headers = Headers::new();
        headers.push("Content-Type", "text/plain");
        headers.push("Content-Length", "2");
        sink.write_headers(StatusCode::OK, headers).await?;
        sink.write(b"ok").await?;
        sink.finish().await
    }
}

fn record(kind: u8, request_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![
        1,
        kind,
        (request_id >> 8) as u8,
        request_id as u8,
        (payload.len() >> 8) as u8,
        payload.len() as u8,
        0,
        0,
    ];
    out.extend_from_slice(payload);
    out
}

fn param(out: &mut Vec<u8>, key: &str, value: &str) {
    out.push(key.len() as u8);
    out.push(value.len() as u8);
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(value.as_bytes());
}

#[derive(Debug)]
struct Record {
    kind: u8,
    request_id: u16,
    payload: Vec<u8>,
}

fn parse_records(mut bytes: &[u8]) -> Vec<Record> {
    let mut records = Vec::new();
    while bytes.len() >= 8 {
        let content = ((bytes[4] as usize) << 8) | bytes[5] as usize;
        let padding = bytes[6] as usize;
        if bytes.len() < 8 + content + padding {
            break;
        }
        records.push(Record {
            kind: bytes[1],
            request_id: ((bytes[2] as u16) << 8) | bytes[3] as u16,
            payload: bytes[8..8 + content].to_vec(),
        });
        bytes = &bytes[8 + content + padding..];
    }
    records
}

#[test]
fn responder_lifecycle_with_keep_conn() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let server = spawn(
        fcgi_config(),
        App {
            seen: Arc::clone(&seen),
        },
    );
    let mut stream = connect(server.addr);

    // BEGIN_REQUEST: role RESPONDER, KEEP_CONN.
    stream
        .write_all(&record(BEGIN_REQUEST, 1, &[0, 1, KEEP_CONN, 0, 0, 0, 0, 0]))
        .unwrap();
    let mut params = Vec::new();
    param(&mut params, "REQUEST_METHOD", "POST");
    param(&mut params, "REQUEST_URI", "/submit");
    param(&mut params, "SERVER_PROTOCOL", "HTTP/1.1");
    param(&mut params, "CONTENT_LENGTH", "5");
    param(&mut params, "CONTENT_TYPE", "text/plain");
    param(&mut params, "REMOTE_ADDR", "127.0.0.1");
    param(&mut params, "REMOTE_PORT", "40000");
    stream.write_all(&record(PARAMS, 1, &params)).unwrap();
    stream.write_all(&record(PARAMS, 1, &[])).unwrap();
    stream.write_all(&record(STDIN, 1, b"hello")).unwrap();
    stream.write_all(&record(STDIN, 1, &[])).unwrap();

    let reply = read_available(&mut stream, Duration::from_secs(2));
    let records = parse_records(&reply);

    let stdout: Vec<u8> = records
        .iter()
        .filter(|r| r.kind == STDOUT)
        .flat_map(|r| r.payload.clone())
        .collect();
    let text = String::from_utf8_lossy(&stdout);
    assert!(text.starts_with("Status: 200\r\n"), "got: {text}");
    assert!(text.contains("Content-Type: text/plain\r\n"));
    assert!(text.contains("Date: "));
    assert!(text.ends_with("\r\n\r\nok"));

    let end = records
        .iter()
        .find(|r| r.kind == END_REQUEST)
        .expect("END_REQUEST record");
    assert_eq!(end.request_id, 1);
    assert_eq!(end.payload.len(), 8);
    // protocolStatus REQUEST_COMPLETE, appStatus 0.
    assert_eq!(end.payload[4], 0);
    assert_eq!(&end.payload[..4], &[0, 0, 0, 0]);

    let snapshot = seen.lock().unwrap().clone();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].method, "POST");
    assert_eq!(snapshot[0].body, b"hello");
    assert_eq!(snapshot[0].content_type.as_deref(), Some("text/plain"));

    // KEEP_CONN was set: the connection accepts a second request.
    stream
        .write_all(&record(BEGIN_REQUEST, 2, &[0, 1, KEEP_CONN, 0, 0, 0, 0, 0]))
        .unwrap();
    let mut params = Vec::new();
    param(&mut params, "REQUEST_METHOD", "GET");
    param(&mut params, "REQUEST_URI", "/again");
    param(&mut params, "SERVER_PROTOCOL", "HTTP/1.1");
    stream.write_all(&record(PARAMS, 2, &params)).unwrap();
    stream.write_all(&record(PARAMS, 2, &[])).unwrap();
    stream.write_all(&record(STDIN, 2, &[])).unwrap();

    let reply = read_available(&mut stream, Duration::from_secs(2));
    let records = parse_records(&reply);
    assert!(records.iter().any(|r| r.kind == END_REQUEST && r.request_id == 2));
}

#[test]
fn connection_closes_without_keep_conn() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let server = spawn(fcgi_config(), App { seen });
    let mut stream = connect(server.addr);

    stream
        .write_all(&record(BEGIN_REQUEST, 7, &[0, 1, 0, 0, 0, 0, 0, 0]))
        .unwrap();
    let mut params = Vec::new();
    param(&mut params, "REQUEST_METHOD", "GET");
    param(&mut params, "REQUEST_URI", "/");
    param(&mut params, "SERVER_PROTOCOL", "HTTP/1.1");
    stream.write_all(&record(PARAMS, 7, &params)).unwrap();
    stream.write_all(&record(PARAMS, 7, &[])).unwrap();
    stream.write_all(&record(STDIN, 7, &[])).unwrap();

    let reply = read_available(&mut stream, Duration::from_secs(2));
    let records = parse_records(&reply);
    assert!(records.iter().any(|r| r.kind == END_REQUEST));

    // The server hangs up once the response is out.
    let mut probe = [0u8; 1];
    assert_eq!(stream.read(&mut probe).unwrap_or(0), 0);
}
