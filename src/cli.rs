//! The command-line surface.
//!
//! Flags map one-to-one onto [`Config`] keys; `--ini` and `--json`
//! files are merged first, then explicit flags override them.

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "manifold", version, about = "Multi-protocol application server")]
pub struct Cli {
    /// Bind an HTTP/1.1 listener (`[addr]:port` or `/path`); may repeat.
    #[arg(long = "http-socket", value_name = "ADDR")]
    pub http_socket: Vec<String>,

    /// Bind a TLS listener: `addr:port,cert,key[,alg]`; may repeat.
    #[arg(long = "https-socket", value_name = "ADDR,CERT,KEY")]
    pub https_socket: Vec<String>,

    /// Bind an HTTP/2 (prior-knowledge) listener; may repeat.
    #[arg(long = "http2-socket", value_name = "ADDR")]
    pub http2_socket: Vec<String>,

    /// Bind a FastCGI listener; may repeat.
    #[arg(long = "fastcgi-socket", value_name = "ADDR")]
    pub fastcgi_socket: Vec<String>,

    /// Allow clear-text HTTP/1.1 to HTTP/2 upgrades.
    #[arg(long = "upgrade-h2c")]
    pub upgrade_h2c: bool,

    /// Offer `h2` through ALPN on TLS listeners.
    #[arg(long = "https-h2")]
    pub https_h2: bool,

    /// Worker threads per process (or `auto`).
    #[arg(long, value_name = "N")]
    pub threads: Option<String>,

    /// Worker processes (or `auto`).
    #[arg(long, value_name = "N")]
    pub processes: Option<String>,

    /// Run a supervising master process.
    #[arg(long)]
    pub master: bool,

    /// Defer application setup to the workers.
    #[arg(long)]
    pub lazy: bool,

    /// Per-connection parse buffer in bytes (minimum 4096).
    #[arg(long = "buffer-size", value_name = "BYTES")]
    pub buffer_size: Option<u64>,

    /// Request bodies above this many bytes spill to disk.
    #[arg(long = "post-buffering", value_name = "BYTES")]
    pub post_buffering: Option<u64>,

    /// Close idle connections after this many seconds.
    #[arg(long = "socket-timeout", value_name = "SECONDS")]
    pub socket_timeout: Option<u64>,

    /// listen(2) backlog.
    #[arg(long = "listen", value_name = "N")]
    pub listen: Option<u64>,

    /// Set TCP_NODELAY on accepted connections.
    #[arg(long = "tcp-nodelay")]
    pub tcp_nodelay: bool,

    /// Set SO_KEEPALIVE on accepted connections.
    #[arg(long = "so-keepalive")]
    pub so_keepalive: bool,

    /// Socket send buffer size in bytes.
    #[arg(long = "socket-sndbuf", value_name = "BYTES")]
    pub socket_sndbuf: Option<u64>,

    /// Socket receive buffer size in bytes.
    #[arg(long = "socket-rcvbuf", value_name = "BYTES")]
    pub socket_rcvbuf: Option<u64>,

    /// WebSocket message limit in KiB.
    #[arg(long = "websocket-max-size", value_name = "KIB")]
    pub websocket_max_size: Option<u64>,

    /// Trust X-Forwarded-For/Host/Proto from a frontend proxy.
    #[arg(long = "using-frontend-proxy")]
    pub using_frontend_proxy: bool,

    /// chown local sockets to `uid:gid`.
    #[arg(long = "chown-socket", value_name = "UID:GID")]
    pub chown_socket: Option<String>,

    /// Drop privileges to this user (name or id).
    #[arg(long)]
    pub uid: Option<String>,

    /// Drop privileges to this group (name or id).
    #[arg(long)]
    pub gid: Option<String>,

    /// Set the process umask (octal).
    #[arg(long, value_name = "MASK")]
    pub umask: Option<String>,

    /// Write the pre-privilege-drop pid file.
    #[arg(long, value_name = "PATH")]
    pub pidfile: Option<PathBuf>,

    /// Write the post-privilege-drop pid file.
    #[arg(long, value_name = "PATH")]
    pub pidfile2: Option<PathBuf>,

    /// Merge a key=value config file; may repeat.
    #[arg(long, value_name = "PATH")]
    pub ini: Vec<PathBuf>,

    /// Merge a JSON config file; may repeat.
    #[arg(long, value_name = "PATH")]
    pub json: Vec<PathBuf>,

    /// Send SIGINT to the pid found in the given pidfile and exit.
    #[arg(long, value_name = "PIDFILE")]
    pub stop: Option<PathBuf>,

    /// Per-worker kernel accept balancing (SO_REUSEPORT).
    #[arg(long = "reuse-port")]
    pub reuse_port: bool,

    /// Restart workers when a watched file changes.
    #[arg(long = "auto-restart")]
    pub auto_restart: bool,

    /// Watch a path and restart workers when it changes; may repeat.
    #[arg(long = "touch-reload", value_name = "PATH")]
    pub touch_reload: Vec<PathBuf>,
}

impl Cli {
    /// The pidfile named by `--stop`, when present.
    pub fn stop_target(&self) -> Option<&Path> {
        self.stop.as_deref()
    }

    /// Resolves files and flags into a configuration; the command line
    /// wins over file values.
    pub fn into_config(self) -> crate::Result<Config> {
        let mut config = Config::default();

        for path in &self.ini {
            let text = std::fs::read_to_string(path)
                .map_err(|e| crate::Error::new_config("failed to read ini file").with(e))?;
            config.merge_ini(&text)?;
        }
        for path in &self.json {
            let text = std::fs::read_to_string(path)
                .map_err(|e| crate::Error::new_config("failed to read json file").with(e))?;
            config.merge_json(&text)?;
        }

        for value in &self.http_socket {
            config.apply("http-socket", value)?;
        }
        for value in &self.https_socket {
            config.apply("https-socket", value)?;
        }
        for value in &self.http2_socket {
            config.apply("http2-socket", value)?;
        }
        for value in &self.fastcgi_socket {
            config.apply("fastcgi-socket", value)?;
        }
        if self.upgrade_h2c {
            config.upgrade_h2c = true;
        }
        if self.https_h2 {
            config.https_h2 = true;
        }
        if let Some(value) = &self.threads {
            config.apply("threads", value)?;
        }
        if let Some(value) = &self.processes {
            config.apply("processes", value)?;
        }
        if self.master {
            config.master = true;
        }
        if self.lazy {
            config.lazy = true;
        }
        if let Some(value) = self.buffer_size {
            config.buffer_size = value as usize;
        }
        if let Some(value) = self.post_buffering {
            config.post_buffering = value;
        }
        if let Some(value) = self.socket_timeout {
            config.socket_timeout = value;
        }
        if let Some(value) = self.listen {
            config.listen_backlog = value as i32;
        }
        if self.tcp_nodelay {
            config.tcp_nodelay = true;
        }
        if self.so_keepalive {
            config.so_keepalive = true;
        }
        if let Some(value) = self.socket_sndbuf {
            config.socket_sndbuf = Some(value as usize);
        }
        if let Some(value) = self.socket_rcvbuf {
            config.socket_rcvbuf = Some(value as usize);
        }
        if let Some(value) = self.websocket_max_size {
            config.websocket_max_size = value as usize;
        }
        if self.using_frontend_proxy {
            config.using_frontend_proxy = true;
        }
        if let Some(value) = &self.chown_socket {
            config.apply("chown-socket", value)?;
        }
        if let Some(value) = &self.uid {
            config.uid = Some(value.clone());
        }
        if let Some(value) = &self.gid {
            config.gid = Some(value.clone());
        }
        if let Some(value) = &self.umask {
            config.apply("umask", value)?;
        }
        if let Some(value) = &self.pidfile {
            config.pidfile = Some(value.clone());
        }
        if let Some(value) = &self.pidfile2 {
            config.pidfile2 = Some(value.clone());
        }
        if self.reuse_port {
            config.reuse_port = true;
        }
        if self.auto_restart {
            config.auto_restart = true;
        }
        for path in &self.touch_reload {
            config.touch_reload.push(path.clone());
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_config() {
        let cli = Cli::parse_from([
            "manifold",
            "--http-socket",
            ":8080",
            "--http-socket",
            "/run/app.sock",
            "--threads",
            "2",
            "--master",
            "--buffer-size",
            "16393",
            "--upgrade-h2c",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.http_sockets.len(), 2);
        assert_eq!(config.threads, 2);
        assert!(config.master);
        assert_eq!(config.buffer_size, 16393);
        assert!(config.upgrade_h2c);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(Cli::try_parse_from(["manifold", "--no-such-flag"]).is_err());
    }

    #[test]
    fn cli_wins_over_files() {
        let dir = tempfile::tempdir().unwrap();
        let ini = dir.path().join("app.ini");
        std::fs::write(&ini, "threads = 8\nsocket-timeout = 60\n").unwrap();
        let cli = Cli::parse_from([
            "manifold",
            "--http-socket",
            ":8080",
            "--ini",
            ini.to_str().unwrap(),
            "--threads",
            "2",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.threads, 2);
        assert_eq!(config.socket_timeout, 60);
    }
}
