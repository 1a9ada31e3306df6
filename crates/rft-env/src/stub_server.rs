use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use rft_host::{kill_process_group, terminate_process_group};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::{EnvError, Result};
use crate::poll::poll_until;

/// Launch parameters of the stub HTTP server.
#[derive(Debug, Clone)]
pub struct StubServerSpec {
    /// Program and leading arguments.
    pub command: Vec<String>,
    pub address: Ipv4Addr,
    pub port: u16,
    pub images_dir: PathBuf,
    pub workdir: PathBuf,
    pub authorized_key: Option<PathBuf>,
}

impl StubServerSpec {
    /// Arguments appended after `command`.
    fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.address.to_string(),
            self.port.to_string(),
            "--images-dir".to_string(),
            self.images_dir.display().to_string(),
            "--workdir".to_string(),
            self.workdir.display().to_string(),
        ];
        if let Some(key) = &self.authorized_key {
            args.push("--authorized-key".to_string());
            args.push(key.display().to_string());
        }
        args
    }
}

/// How [`StubServer::stop`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The server had exited on its own before stop was called.
    AlreadyExited,
    /// The server exited within the grace period after SIGTERM.
    Terminated,
    /// The server ignored SIGTERM and its process group was killed.
    Killed,
}

/// The stub server child process, in its own process group.
#[derive(Debug)]
pub struct StubServer {
    child: Child,
    address: Ipv4Addr,
    port: u16,
}

impl StubServer {
    pub async fn spawn(spec: &StubServerSpec) -> Result<Self> {
        let Some((program, leading)) = spec.command.split_first() else {
            return Err(EnvError::StubServer("empty command".to_string()));
        };
        let child = Command::new(program)
            .args(leading)
            .args(spec.args())
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EnvError::StubServer(format!("spawn {program}: {e}")))?;

        info!(
            pid = child.id(),
            address = %spec.address,
            port = spec.port,
            images_dir = %spec.images_dir.display(),
            "stub server started"
        );
        Ok(Self {
            child,
            address: spec.address,
            port: spec.port,
        })
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// SIGTERM the server, wait up to `grace` (checking once a second), then
    /// SIGKILL its process group. Never fails.
    pub async fn stop(mut self, grace: Duration) -> StopOutcome {
        if let Ok(Some(status)) = self.child.try_wait() {
            warn!(%status, "stub server had already exited");
            return StopOutcome::AlreadyExited;
        }

        info!(pid = self.child.id(), "stopping stub server");
        terminate_process_group(&self.child);
        let child = &mut self.child;
        let exited = poll_until(grace, || {
            std::future::ready(matches!(child.try_wait(), Ok(Some(_))))
        })
        .await;
        if exited {
            info!("stub server has stopped");
            return StopOutcome::Terminated;
        }

        warn!(grace_secs = grace.as_secs(), "stub server ignored SIGTERM, killing");
        kill_process_group(&self.child);
        if let Err(e) = self.child.wait().await {
            warn!(error = %e, "waiting for killed stub server failed");
        }
        StopOutcome::Killed
    }
}
