mod routes;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

use crate::routes::{AppState, router};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

/// Stub HTTP endpoint a deployment ramdisk talks to during functional tests
#[derive(Parser)]
#[command(name = "rft-stub-server", version)]
struct Cli {
    /// Bind address (the test network gateway)
    address: IpAddr,
    /// Bind port
    port: u16,
    /// Directory served under /tenant_images/
    #[arg(long)]
    images_dir: PathBuf,
    /// Directory where callback markers are created
    #[arg(long)]
    workdir: PathBuf,
    /// Public key returned by the inject-ssh-keys deploy step
    #[arg(long)]
    authorized_key: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
enum ServerError {
    #[error("read authorized key {}: {source}", .path.display())]
    Key {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("serve: {0}")]
    Serve(std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), ServerError> {
    let ssh_key = match &cli.authorized_key {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .map(|key| key.trim_end().to_string())
                .map_err(|source| ServerError::Key {
                    path: path.clone(),
                    source,
                })?,
        ),
        None => None,
    };

    let addr = SocketAddr::new(cli.address, cli.port);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(
        %addr,
        images_dir = %cli.images_dir.display(),
        workdir = %cli.workdir.display(),
        ssh_key = ssh_key.is_some(),
        "stub server started"
    );

    let app = router(Arc::new(AppState {
        images_dir: cli.images_dir,
        workdir: cli.workdir,
        ssh_key,
    }));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServerError::Serve)?;

    info!("stub server has terminated");
    Ok(())
}

/// Resolves on SIGTERM or SIGINT.
async fn shutdown_signal() {
    let Ok(mut term) = signal(SignalKind::terminate()) else {
        // Without a TERM handler only Ctrl-C stops the server.
        let _ = tokio::signal::ctrl_c().await;
        return;
    };
    tokio::select! {
        _ = term.recv() => info!("SIGTERM received, terminating"),
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, terminating"),
    }
}
