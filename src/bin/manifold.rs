//! The `manifold` server binary.
//!
//! Serves a trivial built-in application; real deployments embed the
//! `manifold` crate and provide their own [`Handler`].

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use manifold::cli::Cli;
use manifold::{Handler, Request, ResponseSink, Server, StatusCode};

struct DefaultApp;

impl Handler for DefaultApp {
    async fn process_request(
        &self,
        request: Request,
        mut sink: ResponseSink,
    ) -> manifold::Result<()> {
        let mut headers = manifold::Headers::new();
        headers.push("Content-Type", "text/plain");
        if request.path.is_empty() {
            let body = b"manifold is running\n";
            headers.push("Content-Length", body.len().to_string());
            sink.write_headers(StatusCode::OK, headers).await?;
            sink.write(body).await?;
        } else {
            headers.push("Content-Length", "0");
            sink.write_headers(StatusCode::NOT_FOUND, headers).await?;
        }
        sink.finish().await
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Some(pidfile) = cli.stop_target() {
        return stop(pidfile);
    }

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            return ExitCode::from(1);
        }
    };

    let server = match Server::bind(config, DefaultApp) {
        Ok(server) => server,
        Err(err) => {
            error!("{}", err);
            return ExitCode::from(1);
        }
    };
    for addr in server.local_addrs() {
        info!("listening on {}", addr);
    }

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::from(1)
        }
    }
}

/// `--stop`: signal the pid recorded in the given pidfile.
fn stop(pidfile: &std::path::Path) -> ExitCode {
    let pid = match std::fs::read_to_string(pidfile)
        .ok()
        .and_then(|text| text.trim().parse::<i32>().ok())
    {
        Some(pid) => pid,
        None => {
            error!("could not read a pid from {}", pidfile.display());
            return ExitCode::from(1);
        }
    };
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc != 0 {
        error!("failed to signal pid {}", pid);
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}
