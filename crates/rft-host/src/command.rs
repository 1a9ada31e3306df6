use tokio::process::Command;
use tracing::trace;

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// How a command should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Prefix with `sudo`.
    Sudo,
    /// Run as the current user.
    User,
}

/// Captured result of a command that ran to completion.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

/// Format a human-readable display string for a direct command invocation.
fn format_command_display(program: &str, args: &[&str], privilege: Privilege) -> String {
    let mut parts = Vec::with_capacity(args.len() + 2);
    if matches!(privilege, Privilege::Sudo) {
        parts.push("sudo");
    }
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

fn build_std_command(program: &str, args: &[&str], privilege: Privilege) -> std::process::Command {
    match privilege {
        Privilege::Sudo => {
            let mut cmd = std::process::Command::new("sudo");
            cmd.arg(program).args(args);
            cmd
        }
        Privilege::User => {
            let mut cmd = std::process::Command::new(program);
            cmd.args(args);
            cmd
        }
    }
}

fn build_command(program: &str, args: &[&str], privilege: Privilege) -> Command {
    Command::from(build_std_command(program, args, privilege))
}

/// Execute a command and capture its output regardless of the exit status.
///
/// Only a failure to spawn is an error.
pub async fn exec_output(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> Result<CommandOutput, CommandError> {
    let cmd_display = format_command_display(program, args, privilege);
    trace!(command = %cmd_display, "exec");

    let output = build_command(program, args, privilege)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| CommandError {
            command: cmd_display,
            detail: e.to_string(),
        })?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        code: output.status.code(),
    })
}

/// Execute a command.
///
/// Invokes the program binary directly with the given arguments.
/// Returns trimmed stdout on success.
pub async fn exec(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> Result<String, CommandError> {
    let output = exec_output(program, args, privilege).await?;

    if output.code == Some(0) {
        Ok(output.stdout.trim().to_string())
    } else {
        let detail = match output.stderr.trim() {
            "" => format!("exit status {:?}", output.code),
            stderr => stderr.to_string(),
        };
        Err(CommandError {
            command: format_command_display(program, args, privilege),
            detail,
        })
    }
}

/// Blocking variant of [`exec`] for synchronous callers such as template
/// functions. Same logging and error shape.
pub fn exec_blocking(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> Result<String, CommandError> {
    let cmd_display = format_command_display(program, args, privilege);
    trace!(command = %cmd_display, "exec (blocking)");

    let output = build_std_command(program, args, privilege)
        .stdin(std::process::Stdio::null())
        .output()
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = match stderr.trim() {
            "" => format!("exit status {:?}", output.status.code()),
            stderr => stderr.to_string(),
        };
        Err(CommandError {
            command: cmd_display,
            detail,
        })
    }
}

/// Execute a command, ignoring any errors.
pub async fn exec_ignore_errors(program: &str, args: &[&str], privilege: Privilege) {
    match exec_output(program, args, privilege).await {
        Ok(o) if o.code != Some(0) => {
            let cmd_display = format_command_display(program, args, privilege);
            trace!(command = %cmd_display, stderr = %o.stderr.trim(), "command failed (ignored)");
        }
        Err(e) => {
            trace!(command = %e.command, error = %e.detail, "command failed to spawn (ignored)");
        }
        _ => {}
    }
}
