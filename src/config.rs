//! Server configuration.
//!
//! Values arrive from the command line and from merged `--ini` /
//! `--json` files; later sources override earlier ones and the command
//! line wins over files.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Where a listener binds.
#[derive(Debug, Clone, PartialEq)]
pub enum BindAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

/// One `--http-socket` / `--http2-socket` / `--fastcgi-socket` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketSpec {
    pub addr: BindAddr,
}

/// One `--https-socket` entry: `addr:port,cert,key[,alg]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsSocketSpec {
    pub addr: SocketAddr,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub alg: Option<String>,
}

impl SocketSpec {
    /// Parses `[addr]:port`, `addr:port`, `:port` or `/path`.
    pub fn parse(spec: &str) -> crate::Result<SocketSpec> {
        Ok(SocketSpec {
            addr: parse_bind_addr(spec)?,
        })
    }
}

fn parse_bind_addr(spec: &str) -> crate::Result<BindAddr> {
    if spec.starts_with('/') || spec.starts_with("./") {
        return Ok(BindAddr::Unix(PathBuf::from(spec)));
    }
    let spec = if let Some(port) = spec.strip_prefix(':') {
        // A bare port listens on every interface.
        format!("0.0.0.0:{port}")
    } else {
        spec.to_owned()
    };
    spec.parse::<SocketAddr>()
        .map(BindAddr::Tcp)
        .map_err(|_| Error::new_config("failed to parse socket address"))
}

impl TlsSocketSpec {
    pub fn parse(spec: &str) -> crate::Result<TlsSocketSpec> {
        let mut parts = spec.split(',');
        let addr = parts
            .next()
            .ok_or_else(|| Error::new_config("empty https socket spec"))?;
        let BindAddr::Tcp(addr) = parse_bind_addr(addr)? else {
            return Err(Error::new_config("https sockets must be TCP"));
        };
        let cert = parts
            .next()
            .ok_or_else(|| Error::new_config("no SSL certificate specified"))?;
        let key = parts
            .next()
            .ok_or_else(|| Error::new_config("no SSL key specified"))?;
        Ok(TlsSocketSpec {
            addr,
            cert: PathBuf::from(cert),
            key: PathBuf::from(key),
            alg: parts.next().map(str::to_owned),
        })
    }
}

/// `uid:gid` for `--chown-socket`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerSpec {
    pub uid: u32,
    pub gid: u32,
}

impl OwnerSpec {
    pub fn parse(spec: &str) -> crate::Result<OwnerSpec> {
        let (uid, gid) = spec
            .split_once(':')
            .ok_or_else(|| Error::new_config("chown-socket expects uid:gid"))?;
        let parse = |s: &str| {
            s.parse::<u32>()
                .map_err(|_| Error::new_config("chown-socket expects numeric uid:gid"))
        };
        Ok(OwnerSpec {
            uid: parse(uid)?,
            gid: parse(gid)?,
        })
    }
}

/// The resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_sockets: Vec<SocketSpec>,
    pub https_sockets: Vec<TlsSocketSpec>,
    pub http2_sockets: Vec<SocketSpec>,
    pub fastcgi_sockets: Vec<SocketSpec>,

    pub upgrade_h2c: bool,
    pub https_h2: bool,

    /// Worker threads per process.
    pub threads: usize,
    /// Worker processes; 0 runs the workers in the current process.
    pub processes: usize,
    pub master: bool,
    pub lazy: bool,

    pub buffer_size: usize,
    pub post_buffering: u64,
    /// Idle connection timeout, in seconds.
    pub socket_timeout: u64,
    pub listen_backlog: i32,
    pub tcp_nodelay: bool,
    pub so_keepalive: bool,
    pub socket_sndbuf: Option<usize>,
    pub socket_rcvbuf: Option<usize>,
    pub reuse_port: bool,

    /// WebSocket message limit, in KiB.
    pub websocket_max_size: usize,

    pub using_frontend_proxy: bool,

    pub chown_socket: Option<OwnerSpec>,
    pub uid: Option<String>,
    pub gid: Option<String>,
    pub umask: Option<u32>,
    pub pidfile: Option<PathBuf>,
    pub pidfile2: Option<PathBuf>,

    pub auto_restart: bool,
    pub touch_reload: Vec<PathBuf>,

    /// HPACK dynamic table ceiling offered in SETTINGS.
    pub http2_header_table_size: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            http_sockets: Vec::new(),
            https_sockets: Vec::new(),
            http2_sockets: Vec::new(),
            fastcgi_sockets: Vec::new(),
            upgrade_h2c: false,
            https_h2: false,
            threads: 1,
            processes: 0,
            master: false,
            lazy: false,
            buffer_size: 4096,
            post_buffering: 4096,
            socket_timeout: 4,
            listen_backlog: 100,
            tcp_nodelay: false,
            so_keepalive: false,
            socket_sndbuf: None,
            socket_rcvbuf: None,
            reuse_port: false,
            websocket_max_size: 1024,
            using_frontend_proxy: false,
            chown_socket: None,
            uid: None,
            gid: None,
            umask: None,
            pidfile: None,
            pidfile2: None,
            auto_restart: false,
            touch_reload: Vec::new(),
            http2_header_table_size: 4096,
        }
    }
}

/// Smallest parse buffer able to hold an HTTP/2 frame header plus a
/// 2^14-octet frame.
pub(crate) const H2_MIN_BUFFER_SIZE: usize = 16_393;

impl Config {
    /// Validates cross-field constraints once all sources are merged.
    pub fn validate(&self) -> crate::Result<()> {
        if self.buffer_size < 4096 {
            return Err(Error::new_config("buffer-size must be at least 4096"));
        }
        let wants_h2 =
            !self.http2_sockets.is_empty() || self.upgrade_h2c || self.https_h2;
        if wants_h2 && self.buffer_size < H2_MIN_BUFFER_SIZE {
            return Err(Error::new_config(
                "HTTP/2 requires buffer-size of at least 16393",
            ));
        }
        if self.http_sockets.is_empty()
            && self.https_sockets.is_empty()
            && self.http2_sockets.is_empty()
            && self.fastcgi_sockets.is_empty()
        {
            return Err(Error::new_config("no sockets configured"));
        }
        Ok(())
    }

    /// Applies one `key = value` pair from a config file. Unknown keys
    /// are an error, mirroring the CLI.
    pub fn apply(&mut self, key: &str, value: &str) -> crate::Result<()> {
        let key = key.replace('-', "_");
        let bool_value = || matches!(value, "1" | "true" | "on" | "yes" | "");
        let int = |v: &str| {
            v.parse::<u64>()
                .map_err(|_| Error::new_config("expected an integer value"))
        };
        match key.as_str() {
            "http_socket" => self.http_sockets.push(SocketSpec::parse(value)?),
            "https_socket" => self.https_sockets.push(TlsSocketSpec::parse(value)?),
            "http2_socket" => self.http2_sockets.push(SocketSpec::parse(value)?),
            "fastcgi_socket" => self.fastcgi_sockets.push(SocketSpec::parse(value)?),
            "upgrade_h2c" => self.upgrade_h2c = bool_value(),
            "https_h2" => self.https_h2 = bool_value(),
            "threads" => self.threads = parse_count(value)?,
            "processes" => self.processes = parse_count(value)?,
            "master" => self.master = bool_value(),
            "lazy" => self.lazy = bool_value(),
            "buffer_size" => self.buffer_size = int(value)? as usize,
            "post_buffering" => self.post_buffering = int(value)?,
            "socket_timeout" => self.socket_timeout = int(value)?,
            "listen" => self.listen_backlog = int(value)? as i32,
            "tcp_nodelay" => self.tcp_nodelay = bool_value(),
            "so_keepalive" => self.so_keepalive = bool_value(),
            "socket_sndbuf" => self.socket_sndbuf = Some(int(value)? as usize),
            "socket_rcvbuf" => self.socket_rcvbuf = Some(int(value)? as usize),
            "reuse_port" => self.reuse_port = bool_value(),
            "websocket_max_size" => self.websocket_max_size = int(value)? as usize,
            "using_frontend_proxy" => self.using_frontend_proxy = bool_value(),
            "chown_socket" => self.chown_socket = Some(OwnerSpec::parse(value)?),
            "uid" => self.uid = Some(value.to_owned()),
            "gid" => self.gid = Some(value.to_owned()),
            "umask" => {
                self.umask = Some(
                    u32::from_str_radix(value, 8)
                        .map_err(|_| Error::new_config("umask must be octal"))?,
                )
            }
            "pidfile" => self.pidfile = Some(PathBuf::from(value)),
            "pidfile2" => self.pidfile2 = Some(PathBuf::from(value)),
            "auto_restart" => self.auto_restart = bool_value(),
            "touch_reload" => self.touch_reload.push(PathBuf::from(value)),
            "http2_header_table_size" => {
                self.http2_header_table_size = int(value)? as u32
            }
            _ => return Err(Error::new_config("unknown configuration key")),
        }
        Ok(())
    }

    /// Merges a `key = value` file. `[section]` lines are skipped so
    /// common INI layouts load unchanged.
    pub fn merge_ini(&mut self, text: &str) -> crate::Result<()> {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty()
                || line.starts_with('#')
                || line.starts_with(';')
                || (line.starts_with('[') && line.ends_with(']'))
            {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::new_config("expected key = value"))?;
            self.apply(key.trim(), value.trim())?;
        }
        Ok(())
    }

    /// Merges a JSON object; values may be strings, integers, booleans
    /// or arrays of those (for repeatable keys).
    pub fn merge_json(&mut self, text: &str) -> crate::Result<()> {
        #[derive(Deserialize)]
        struct Doc(serde_json::Map<String, serde_json::Value>);

        let Doc(map) = serde_json::from_str(text)
            .map_err(|e| Error::new_config("invalid JSON config").with(e))?;
        for (key, value) in map {
            match value {
                serde_json::Value::Array(items) => {
                    for item in items {
                        self.apply(&key, &json_scalar(&item)?)?;
                    }
                }
                other => self.apply(&key, &json_scalar(&other)?)?,
            }
        }
        Ok(())
    }
}

fn json_scalar(value: &serde_json::Value) -> crate::Result<String> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(if *b { "1" } else { "0" }.to_owned()),
        _ => Err(Error::new_config("unsupported JSON value")),
    }
}

/// `auto` resolves to the number of CPUs.
fn parse_count(value: &str) -> crate::Result<usize> {
    if value == "auto" {
        return Ok(std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1));
    }
    value
        .parse::<usize>()
        .map_err(|_| Error::new_config("expected an integer or 'auto'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_specs() {
        assert_eq!(
            SocketSpec::parse("127.0.0.1:8080").unwrap().addr,
            BindAddr::Tcp("127.0.0.1:8080".parse().unwrap())
        );
        assert_eq!(
            SocketSpec::parse(":3000").unwrap().addr,
            BindAddr::Tcp("0.0.0.0:3000".parse().unwrap())
        );
        assert_eq!(
            SocketSpec::parse("[::1]:3000").unwrap().addr,
            BindAddr::Tcp("[::1]:3000".parse().unwrap())
        );
    }

    #[test]
    fn parses_unix_specs() {
        assert_eq!(
            SocketSpec::parse("/run/app.sock").unwrap().addr,
            BindAddr::Unix(PathBuf::from("/run/app.sock"))
        );
    }

    #[test]
    fn parses_tls_specs() {
        let spec = TlsSocketSpec::parse(":8443,cert.pem,key.pem,rsa").unwrap();
        assert_eq!(spec.addr.port(), 8443);
        assert_eq!(spec.cert, PathBuf::from("cert.pem"));
        assert_eq!(spec.key, PathBuf::from("key.pem"));
        assert_eq!(spec.alg.as_deref(), Some("rsa"));
        assert!(TlsSocketSpec::parse(":8443,cert.pem").is_err());
    }

    #[test]
    fn ini_merge() {
        let mut cfg = Config::default();
        cfg.merge_ini(
            "[server]\n\
             # comment\n\
             http-socket = :8080\n\
             threads = 4\n\
             tcp-nodelay = true\n",
        )
        .unwrap();
        assert_eq!(cfg.http_sockets.len(), 1);
        assert_eq!(cfg.threads, 4);
        assert!(cfg.tcp_nodelay);
    }

    #[test]
    fn json_merge() {
        let mut cfg = Config::default();
        cfg.merge_json(
            r#"{"http-socket": [":8080", ":8081"], "buffer-size": 8192, "master": true}"#,
        )
        .unwrap();
        assert_eq!(cfg.http_sockets.len(), 2);
        assert_eq!(cfg.buffer_size, 8192);
        assert!(cfg.master);
    }

    #[test]
    fn unknown_keys_error() {
        let mut cfg = Config::default();
        assert!(cfg.apply("no-such-flag", "1").is_err());
    }

    #[test]
    fn h2_buffer_size_floor() {
        let mut cfg = Config::default();
        cfg.http2_sockets.push(SocketSpec::parse(":8090").unwrap());
        assert!(cfg.validate().is_err());
        cfg.buffer_size = H2_MIN_BUFFER_SIZE;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn umask_is_octal() {
        let mut cfg = Config::default();
        cfg.apply("umask", "027").unwrap();
        assert_eq!(cfg.umask, Some(0o27));
    }
}
