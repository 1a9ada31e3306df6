use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rft_driver::{ExecOutput, RemoteShell, ShellError, ShellResult, ShellSession, SshTarget};
use tracing::{debug, warn};

use crate::command::{CommandOutput, Privilege, exec, exec_ignore_errors, exec_output};

/// Maximum length of a Unix domain socket path (`sun_path` minus the NUL).
pub const MAX_SOCKET_PATH: usize = 107;

/// Exit status `ssh` uses for its own errors.
const SSH_ERROR_CODE: i32 = 255;

/// [`RemoteShell`] built on the OpenSSH client.
///
/// Each session is an OpenSSH control master; commands and transfers are
/// multiplexed over its socket so that authentication happens once.
pub struct OpenSshShell {
    control_dir: PathBuf,
    connect_timeout: Duration,
}

impl OpenSshShell {
    pub fn new(control_dir: PathBuf, connect_timeout: Duration) -> Self {
        Self {
            control_dir,
            connect_timeout,
        }
    }

    fn control_socket(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let short = id.get(..12).unwrap_or(&id);
        self.control_dir.join(format!("ssh-{short}.sock"))
    }
}

/// Options shared by every `ssh`/`scp` invocation for `target`.
///
/// Guests are freshly booted ramdisks with throwaway host keys, so host key
/// checking is disabled.
fn base_options(target: &SshTarget, control_path: &Path, connect_timeout: Duration) -> Vec<String> {
    vec![
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        "UserKnownHostsFile=/dev/null".into(),
        "-o".into(),
        "LogLevel=ERROR".into(),
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "-o".into(),
        format!("ControlPath={}", control_path.display()),
        "-i".into(),
        target.key_path.display().to_string(),
        "-l".into(),
        target.user.clone(),
    ]
}

fn master_args(target: &SshTarget, control_path: &Path, connect_timeout: Duration) -> Vec<String> {
    let mut args = vec!["-M".to_string(), "-N".to_string(), "-f".to_string()];
    args.extend(base_options(target, control_path, connect_timeout));
    args.push(target.host.to_string());
    args
}

fn exec_args(
    target: &SshTarget,
    control_path: &Path,
    connect_timeout: Duration,
    cmd: &str,
) -> Vec<String> {
    let mut args = base_options(target, control_path, connect_timeout);
    args.push(target.host.to_string());
    args.push("--".to_string());
    args.push(cmd.to_string());
    args
}

fn scp_args(
    target: &SshTarget,
    control_path: &Path,
    connect_timeout: Duration,
    src: &str,
    dst: &str,
) -> Vec<String> {
    // scp takes -l as a bandwidth limit; the login goes into the remote spec.
    let mut args: Vec<String> = base_options(target, control_path, connect_timeout)
        .into_iter()
        .take_while(|a| a != "-l")
        .collect();
    args.push(src.to_string());
    args.push(dst.to_string());
    args
}

fn remote_spec(target: &SshTarget, path: &str) -> String {
    format!("{}@{}:{path}", target.user, target.host)
}

fn as_strs(args: &[String]) -> Vec<&str> {
    args.iter().map(String::as_str).collect()
}

#[async_trait]
impl RemoteShell for OpenSshShell {
    async fn connect(&self, target: &SshTarget) -> ShellResult<Box<dyn ShellSession>> {
        let control_path = self.control_socket();
        let len = control_path.as_os_str().len();
        if len > MAX_SOCKET_PATH {
            return Err(ShellError::Unavailable(format!(
                "control socket path too long ({len} > {MAX_SOCKET_PATH}): {}",
                control_path.display()
            )));
        }
        tokio::fs::create_dir_all(&self.control_dir)
            .await
            .map_err(|e| ShellError::Unavailable(format!("{}: {e}", self.control_dir.display())))?;

        let args = master_args(target, &control_path, self.connect_timeout);
        exec("ssh", &as_strs(&args), Privilege::User)
            .await
            .map_err(|e| ShellError::Connect {
                host: target.host.to_string(),
                user: target.user.clone(),
                detail: e.detail,
            })?;
        debug!(host = %target.host, socket = %control_path.display(), "ssh session opened");

        Ok(Box::new(OpenSshSession {
            target: target.clone(),
            control_path,
            connect_timeout: self.connect_timeout,
        }))
    }
}

struct OpenSshSession {
    target: SshTarget,
    control_path: PathBuf,
    connect_timeout: Duration,
}

impl OpenSshSession {
    async fn scp(&self, src: &str, dst: &str) -> ShellResult<()> {
        let args = scp_args(&self.target, &self.control_path, self.connect_timeout, src, dst);
        exec("scp", &as_strs(&args), Privilege::User)
            .await
            .map_err(|e| ShellError::Transfer {
                src: src.to_string(),
                dst: dst.to_string(),
                detail: e.detail,
            })?;
        Ok(())
    }
}

#[async_trait]
impl ShellSession for OpenSshSession {
    async fn exec(&mut self, cmd: &str) -> ShellResult<ExecOutput> {
        let args = exec_args(&self.target, &self.control_path, self.connect_timeout, cmd);
        let output = exec_output("ssh", &as_strs(&args), Privilege::User)
            .await
            .map_err(|e| ShellError::Exec {
                command: cmd.to_string(),
                detail: e.detail,
            })?;
        remote_result(cmd, output)
    }

    async fn upload(&mut self, src: &Path, dst: &str) -> ShellResult<()> {
        let src = src.display().to_string();
        let dst = remote_spec(&self.target, dst);
        self.scp(&src, &dst).await
    }

    async fn download(&mut self, src: &str, dst: &Path) -> ShellResult<()> {
        let src = remote_spec(&self.target, src);
        let dst = dst.display().to_string();
        self.scp(&src, &dst).await
    }

    async fn close(self: Box<Self>) {
        let socket = self.control_path.display().to_string();
        let host = self.target.host.to_string();
        exec_ignore_errors("ssh", &["-S", &socket, "-O", "exit", &host], Privilege::User).await;
        if let Err(e) = tokio::fs::remove_file(&self.control_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(socket = %socket, error = %e, "failed to remove control socket");
        }
        debug!(host = %host, "ssh session closed");
    }
}

/// Map the local `ssh` result to the remote command's result.
///
/// `ssh` exits 255 for its own failures (lost connection, auth), so that code
/// is an error even when the remote command itself returned it.
fn remote_result(cmd: &str, output: CommandOutput) -> ShellResult<ExecOutput> {
    let exit_code = output.code.ok_or_else(|| ShellError::Exec {
        command: cmd.to_string(),
        detail: "ssh terminated by signal".to_string(),
    })?;
    if exit_code == SSH_ERROR_CODE {
        return Err(ShellError::Exec {
            command: cmd.to_string(),
            detail: output.stderr.trim().to_string(),
        });
    }
    Ok(ExecOutput {
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code,
    })
}
