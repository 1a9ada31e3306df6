use std::path::Path;

use async_trait::async_trait;

use crate::error::ShellResult;
use crate::types::{ExecOutput, SshTarget};

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Open a session to `target`. The caller must `close()` it.
    async fn connect(&self, target: &SshTarget) -> ShellResult<Box<dyn ShellSession>>;
}

#[async_trait]
pub trait ShellSession: Send {
    /// Run `cmd` remotely. A non-zero exit code is reported in the output,
    /// not as an error.
    ///
    /// Transports that reserve an exit code for their own failures may report
    /// that code as an error; OpenSSH does so for 255.
    async fn exec(&mut self, cmd: &str) -> ShellResult<ExecOutput>;
    async fn upload(&mut self, src: &Path, dst: &str) -> ShellResult<()>;
    async fn download(&mut self, src: &str, dst: &Path) -> ShellResult<()>;
    async fn close(self: Box<Self>);
}
