//! One guest domain under test and the command surface test bodies drive it with.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use rft_driver::{
    DomainHandle, ExecOutput, RemoteShell, ShellResult, ShellSession, SshTarget, VirtDriver,
};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::cleanup::CleanupReport;
use crate::error::{EnvError, Result};
use crate::ids;
use crate::lifecycle::{Lifecycle, kill_object};
use crate::paths::SuitePaths;
use crate::poll::poll_until;
use crate::template::TemplateRenderer;
use crate::xml;

const BANNER: &str = "########################################";

/// Where partitions are mounted by the partition file helpers.
const PARTITION_MOUNT: &str = "/mnt";

/// Login used for every remote shell session of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCredential {
    pub login: String,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDevice {
    Network,
    Disk,
}

/// What a node needs from the environment configuration.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Forced onto `os/type` when the template does not set one.
    pub machine_type: Option<String>,
    pub ssh: SshCredential,
}

pub struct GuestNode {
    name: String,
    mac: String,
    /// Set exactly while attached to a network.
    ip: Option<Ipv4Addr>,
    network: String,
    workdir: PathBuf,
    console_log: PathBuf,
    callback: PathBuf,
    ssh: SshCredential,
    boot_device: BootDevice,
    handle: Box<dyn DomainHandle>,
    driver: Arc<dyn VirtDriver>,
    shell: Arc<dyn RemoteShell>,
}

impl std::fmt::Debug for GuestNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestNode")
            .field("name", &self.name)
            .field("mac", &self.mac)
            .field("ip", &self.ip)
            .field("boot_device", &self.boot_device)
            .finish_non_exhaustive()
    }
}

impl GuestNode {
    /// Render `template` for a fresh name and MAC, and define the domain.
    ///
    /// The node workdir is created first so template functions can place
    /// disks under it.
    pub async fn create(
        driver: Arc<dyn VirtDriver>,
        shell: Arc<dyn RemoteShell>,
        renderer: &dyn TemplateRenderer,
        template: &str,
        network: &str,
        paths: &SuitePaths,
        settings: &NodeSettings,
    ) -> Result<Self> {
        let name = ids::generate_name("node");
        let mac = ids::random_mac();
        let workdir = paths.node_dir(&name);
        let console_log = paths.console_log(&name);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(EnvError::io("create", &workdir))?;

        let variables = template_variables(&name, &mac, network, &console_log);
        let defined = render_and_define(
            driver.as_ref(),
            renderer,
            template,
            &name,
            &variables,
            settings.machine_type.as_deref(),
        )
        .await;
        if let Err(e) = defined {
            remove_workdir(&name, &workdir).await;
            return Err(e);
        }

        let handle = match driver.lookup_domain(&name).await {
            Ok(handle) => handle,
            Err(e) => {
                discard_definition(driver.as_ref(), &name, &workdir).await;
                return Err(EnvError::driver("look up node", &name)(e));
            }
        };

        info!(node = %name, mac = %mac, network, "node defined");
        Ok(Self {
            callback: paths.callback(&name),
            name,
            mac,
            ip: None,
            network: network.to_string(),
            workdir,
            console_log,
            ssh: settings.ssh.clone(),
            boot_device: BootDevice::Network,
            handle,
            driver,
            shell,
        })
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.ip
    }

    /// Name of the network the node was defined against.
    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn console_log(&self) -> &Path {
        &self.console_log
    }

    pub fn callback_path(&self) -> &Path {
        &self.callback
    }

    pub fn boot_device(&self) -> BootDevice {
        self.boot_device
    }

    pub fn ssh(&self) -> &SshCredential {
        &self.ssh
    }

    /// Variables every node-scoped template is rendered with.
    pub fn template_variables(&self) -> serde_json::Value {
        template_variables(&self.name, &self.mac, &self.network, &self.console_log)
    }

    pub(crate) fn attach(&mut self, ip: Ipv4Addr) {
        self.ip = Some(ip);
    }

    pub(crate) fn detach(&mut self) {
        self.ip = None;
    }

    pub async fn reboot(&self) -> Result<()> {
        info!(node = %self.name, "rebooting node");
        self.handle
            .reboot()
            .await
            .map_err(EnvError::driver("reboot node", &self.name))
    }

    // -----------------------------------------------------------------------
    // Remote shell
    // -----------------------------------------------------------------------

    fn ssh_target(&self) -> Result<SshTarget> {
        let host = self.ip.ok_or_else(|| EnvError::NodeNotAttached {
            node: self.name.clone(),
        })?;
        Ok(SshTarget {
            host,
            user: self.ssh.login.clone(),
            key_path: self.ssh.key_path.clone(),
        })
    }

    /// Run `op` inside one remote shell session. The session is closed on
    /// every path, including when `op` fails.
    pub async fn with_session<T, F>(&self, operation: &'static str, op: F) -> Result<T>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut dyn ShellSession) -> BoxFuture<'s, ShellResult<T>> + Send,
    {
        let target = self.ssh_target()?;
        let mut session =
            self.shell
                .connect(&target)
                .await
                .map_err(|source| EnvError::Shell {
                    node: self.name.clone(),
                    operation,
                    source,
                })?;
        let result = op(session.as_mut()).await;
        session.close().await;
        result.map_err(|source| EnvError::Shell {
            node: self.name.clone(),
            operation,
            source,
        })
    }

    pub async fn put_file(&self, src: &Path, dst: &str) -> Result<()> {
        info!(node = %self.name, src = %src.display(), dst, "putting file");
        let src = src.to_path_buf();
        let dst = dst.to_string();
        self.with_session("upload", move |s| {
            Box::pin(async move { s.upload(&src, &dst).await })
        })
        .await
    }

    pub async fn get_file(&self, src: &str, dst: &Path) -> Result<()> {
        info!(node = %self.name, src, dst = %dst.display(), "getting file");
        let src = src.to_string();
        let dst = dst.to_path_buf();
        self.with_session("download", move |s| {
            Box::pin(async move { s.download(&src, &dst).await })
        })
        .await
    }

    /// Run `cmd` on the guest.
    ///
    /// A non-zero exit code is only an error when `check_exit_code` is set;
    /// otherwise it is returned in the output like any other. The exception
    /// is 255 over OpenSSH: it cannot be told apart from a failed connection
    /// and always surfaces as [`EnvError::Shell`].
    pub async fn run_command(&self, cmd: &str, check_exit_code: bool) -> Result<ExecOutput> {
        info!(node = %self.name, command = cmd, "running command");
        let output = self.exec(cmd).await?;

        if !output.stderr.trim().is_empty() {
            info!("{BANNER} cmd {cmd} stderr below {BANNER}");
            error!(node = %self.name, "{}", output.stderr.trim_end());
            info!("{BANNER} end cmd {cmd} stderr {BANNER}");
        }
        if check_exit_code && output.exit_code != 0 {
            return Err(EnvError::NonZeroExitCode {
                node: self.name.clone(),
                command: cmd.to_string(),
                code: output.exit_code,
            });
        }
        Ok(output)
    }

    async fn exec(&self, cmd: &str) -> Result<ExecOutput> {
        let cmd = cmd.to_string();
        self.with_session("exec", move |s| Box::pin(async move { s.exec(&cmd).await }))
            .await
    }

    /// Log a file from the guest between banner lines, e.g. the agent log
    /// after a failed deployment.
    pub async fn dump_remote_log(&self, path: &str) -> Result<String> {
        let output = self.run_command(&format!("cat {}", shell_quote(path)), false).await?;
        info!("{BANNER} {path} below {BANNER}");
        info!(node = %self.name, "{}", output.stdout.trim_end());
        info!("{BANNER} end {path} {BANNER}");
        Ok(output.stdout)
    }

    /// Contents of `file` on `partition` (mounted on the guest's `/mnt` for
    /// the duration of the read).
    pub async fn read_partition_file(&self, partition: &str, file: &str, fs_type: &str) -> Result<String> {
        let cmd = format!(
            "mount -t {fs_type} {partition} {PARTITION_MOUNT} && cat {}; umount {PARTITION_MOUNT}",
            shell_quote(&format!("{PARTITION_MOUNT}/{file}")),
        );
        Ok(self.run_command(&cmd, false).await?.stdout)
    }

    /// Replace `file` on `partition` with `contents` plus a trailing newline.
    pub async fn write_partition_file(
        &self,
        partition: &str,
        file: &str,
        contents: &str,
        fs_type: &str,
    ) -> Result<String> {
        let cmd = format!(
            "mount -t {fs_type} {partition} {PARTITION_MOUNT} && echo {} > {}; umount {PARTITION_MOUNT}",
            shell_quote(contents),
            shell_quote(&format!("{PARTITION_MOUNT}/{file}")),
        );
        Ok(self.run_command(&cmd, false).await?.stdout)
    }

    // -----------------------------------------------------------------------
    // Waits
    // -----------------------------------------------------------------------

    /// Wait until a trivial remote command succeeds.
    pub async fn wait_for_boot(&self, timeout: Duration) -> Result<()> {
        info!(node = %self.name, timeout_secs = timeout.as_secs(), "waiting for node to boot");
        let booted = poll_until(timeout, || async {
            match self.exec("ls").await {
                Ok(_) => true,
                Err(e) => {
                    debug!(node = %self.name, error = %e, "node not reachable yet");
                    false
                }
            }
        })
        .await;
        if !booted {
            return Err(EnvError::NodeBootTimeout {
                node: self.name.clone(),
                timeout,
            });
        }
        info!(node = %self.name, "node is up");
        Ok(())
    }

    /// Wait until the callback marker exists. Its contents are never read.
    pub async fn wait_for_callback(&self, timeout: Duration) -> Result<()> {
        info!(node = %self.name, timeout_secs = timeout.as_secs(), "waiting for callback");
        let received =
            poll_until(timeout, || std::future::ready(self.callback.exists())).await;
        if !received {
            return Err(EnvError::NodeCallbackTimeout {
                node: self.name.clone(),
                timeout,
            });
        }
        info!(node = %self.name, "callback received");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Boot device
    // -----------------------------------------------------------------------

    /// Switch the live definition to boot from the first disk, then power
    /// cycle the domain. Fails when the node already boots from disk.
    pub async fn reboot_to_disk(&mut self) -> Result<()> {
        let xml = self
            .handle
            .describe()
            .await
            .map_err(EnvError::driver("describe node", &self.name))?;
        let xml_error = |source| EnvError::Xml {
            resource: format!("node {}", self.name),
            source,
        };
        let current = xml::boot_device(&xml).map_err(xml_error)?;
        if self.boot_device == BootDevice::Disk || current.as_deref() == Some("hd") {
            return Err(EnvError::AlreadyBootedFromDisk {
                node: self.name.clone(),
            });
        }
        let updated = xml::set_boot_device(&xml, "hd").map_err(xml_error)?;

        self.driver
            .define_domain(&updated)
            .await
            .map_err(EnvError::driver("redefine node", &self.name))?;
        self.handle = self
            .driver
            .lookup_domain(&self.name)
            .await
            .map_err(EnvError::driver("look up node", &self.name))?;
        self.boot_device = BootDevice::Disk;

        self.stop().await?;
        self.start().await?;
        info!(node = %self.name, "boot device changed to disk, node is rebooting");
        Ok(())
    }
}

#[async_trait]
impl Lifecycle for GuestNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        info!(node = %self.name, "starting node");
        self.handle
            .start()
            .await
            .map_err(EnvError::driver("start node", &self.name))
    }

    async fn stop(&self) -> Result<()> {
        info!(node = %self.name, "stopping node");
        self.handle
            .destroy()
            .await
            .map_err(EnvError::driver("stop node", &self.name))
    }

    async fn kill(&self) -> CleanupReport {
        info!(node = %self.name, "killing node");
        kill_object(self.handle.as_ref()).await
    }
}

async fn render_and_define(
    driver: &dyn VirtDriver,
    renderer: &dyn TemplateRenderer,
    template: &str,
    name: &str,
    variables: &serde_json::Value,
    machine_type: Option<&str>,
) -> Result<()> {
    let mut xml = renderer.render(template, variables)?;
    if let Some(machine) = machine_type {
        xml = xml::ensure_machine_type(&xml, machine).map_err(|source| EnvError::Xml {
            resource: format!("node template {template}"),
            source,
        })?;
    }
    driver
        .define_domain(&xml)
        .await
        .map_err(EnvError::driver("define node", name))
}

/// Undefine a domain whose creation failed after it was defined. Failures are
/// logged, the original error is what the caller reports.
async fn discard_definition(driver: &dyn VirtDriver, name: &str, workdir: &Path) {
    warn!(node = name, "node creation failed, discarding definition");
    match driver.lookup_domain(name).await {
        Ok(handle) => {
            if let Err(e) = handle.undefine().await {
                warn!(node = name, error = %e, "undefine of partially created node failed");
            }
        }
        Err(e) => warn!(node = name, error = %e, "partially created node not found for undefine"),
    }
    remove_workdir(name, workdir).await;
}

async fn remove_workdir(name: &str, workdir: &Path) {
    match tokio::fs::remove_dir_all(workdir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(node = name, path = %workdir.display(), error = %e, "node workdir not removed"),
    }
}

fn template_variables(name: &str, mac: &str, network: &str, console_log: &Path) -> serde_json::Value {
    json!({
        "mac_addr": mac,
        "network_name": network,
        "node_name": name,
        "console_log": console_log.display().to_string(),
    })
}

/// Single-quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_plain_and_embedded_quotes() {
        assert_eq!(shell_quote("/var/log/bareon.log"), "'/var/log/bareon.log'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn variables_for_node_templates() {
        let vars = template_variables(
            "rft-node-1",
            "52:54:00:00:00:01",
            "rft-net-1",
            Path::new("/w/rft-node-1/console.log"),
        );
        assert_eq!(
            vars,
            json!({
                "mac_addr": "52:54:00:00:00:01",
                "network_name": "rft-net-1",
                "node_name": "rft-node-1",
                "console_log": "/w/rft-node-1/console.log",
            })
        );
    }
}
