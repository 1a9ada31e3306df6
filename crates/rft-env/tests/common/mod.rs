//! In-memory driver and shell fakes plus a temp-dir backed config.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rft_driver::{
    DhcpCommand, DhcpHost, DomainHandle, DriverError, DriverResult, ExecOutput, NetworkHandle,
    RemoteShell, ShellError, ShellResult, ShellSession, SshTarget, VirtDriver, VirtObject,
};
use rft_env::{EnvConfig, Environment, SuitePaths, TeraRenderer};
use tempfile::TempDir;

pub const NODE_TEMPLATE: &str = "node.xml";

const NODE_XML: &str = r#"<domain type="kvm">
  <name>{{ node_name }}</name>
  <memory unit="MiB">1024</memory>
  <os>
    <type arch="x86_64">hvm</type>
    <boot dev="network"/>
  </os>
  <devices>
    <interface type="network">
      <mac address="{{ mac_addr }}"/>
      <source network="{{ network_name }}"/>
    </interface>
    <serial type="file">
      <source path="{{ console_log }}"/>
    </serial>
  </devices>
</domain>
"#;

/// Text between the first `<name>` and `</name>`.
fn xml_name(xml: &str) -> Option<String> {
    let start = xml.find("<name>")? + "<name>".len();
    let end = start + xml.get(start..)?.find("</name>")?;
    xml.get(start..end).map(str::to_string)
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeNetwork {
    pub xml: String,
    pub active: bool,
    pub dhcp_hosts: Vec<DhcpHost>,
}

#[derive(Debug, Default)]
pub struct FakeDomain {
    pub xml: String,
    pub active: bool,
    pub starts: u32,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub networks: BTreeMap<String, FakeNetwork>,
    pub domains: BTreeMap<String, FakeDomain>,
    /// Descriptions of networks defined outside the suite.
    pub foreign_networks: Vec<String>,
    pub fail_destroy: bool,
    pub fail_network_start: bool,
    pub fail_network_destroy: bool,
    /// Number of upcoming domain lookups that fail.
    pub fail_domain_lookups: u32,
    /// When set, starting a domain creates `<root>/<name>/callback`.
    pub callback_root: Option<PathBuf>,
    pub domain_defines: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FakeDriver {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeDriver {
    pub fn with_foreign_networks(descriptions: &[&str]) -> Self {
        let driver = Self::default();
        driver.state().foreign_networks = descriptions.iter().map(|d| d.to_string()).collect();
        driver
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn network_names(&self) -> Vec<String> {
        self.state().networks.keys().cloned().collect()
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.state().domains.keys().cloned().collect()
    }

    pub fn dhcp_hosts(&self, network: &str) -> Vec<DhcpHost> {
        self.state()
            .networks
            .get(network)
            .map(|n| n.dhcp_hosts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VirtDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    async fn define_domain(&self, xml: &str) -> DriverResult<()> {
        let name = xml_name(xml).ok_or_else(|| DriverError::Define {
            kind: "domain",
            detail: "no <name>".into(),
        })?;
        let mut state = self.state();
        state.domain_defines += 1;
        state.domains.entry(name).or_default().xml = xml.to_string();
        Ok(())
    }

    async fn lookup_domain(&self, name: &str) -> DriverResult<Box<dyn DomainHandle>> {
        {
            let mut state = self.state();
            if state.fail_domain_lookups > 0 {
                state.fail_domain_lookups -= 1;
                return Err(DriverError::Operation {
                    name: name.into(),
                    operation: "lookup",
                    detail: "injected failure".into(),
                });
            }
        }
        if !self.state().domains.contains_key(name) {
            return Err(DriverError::NotFound {
                kind: "domain",
                name: name.into(),
                detail: "undefined".into(),
            });
        }
        Ok(Box::new(FakeDomainHandle {
            name: name.to_string(),
            state: self.state.clone(),
        }))
    }

    async fn define_network(&self, xml: &str) -> DriverResult<()> {
        let name = xml_name(xml).ok_or_else(|| DriverError::Define {
            kind: "network",
            detail: "no <name>".into(),
        })?;
        self.state().networks.entry(name).or_default().xml = xml.to_string();
        Ok(())
    }

    async fn lookup_network(&self, name: &str) -> DriverResult<Box<dyn NetworkHandle>> {
        if !self.state().networks.contains_key(name) {
            return Err(DriverError::NotFound {
                kind: "network",
                name: name.into(),
                detail: "undefined".into(),
            });
        }
        Ok(Box::new(FakeNetworkHandle {
            name: name.to_string(),
            state: self.state.clone(),
        }))
    }

    async fn list_network_descriptions(&self) -> DriverResult<Vec<String>> {
        let state = self.state();
        let mut all = state.foreign_networks.clone();
        all.extend(state.networks.values().map(|n| n.xml.clone()));
        Ok(all)
    }
}

pub struct FakeDomainHandle {
    name: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeDomainHandle {
    fn with<T>(&self, f: impl FnOnce(&mut FakeDomain, &FakeState) -> T) -> DriverResult<T> {
        let mut state = self.state.lock().unwrap();
        let mut domain = state.domains.remove(&self.name).ok_or_else(|| DriverError::NotFound {
            kind: "domain",
            name: self.name.clone(),
            detail: "undefined".into(),
        })?;
        let out = f(&mut domain, &state);
        state.domains.insert(self.name.clone(), domain);
        Ok(out)
    }
}

#[async_trait]
impl VirtObject for FakeDomainHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> DriverResult<()> {
        let name = self.name.clone();
        let marker = self.with(|d, state| {
            d.active = true;
            d.starts += 1;
            state.callback_root.as_ref().map(|root| root.join(&name).join("callback"))
        })?;
        if let Some(marker) = marker {
            std::fs::write(marker, b"")?;
        }
        Ok(())
    }

    async fn destroy(&self) -> DriverResult<()> {
        if self.state.lock().unwrap().fail_destroy {
            return Err(DriverError::Operation {
                name: self.name.clone(),
                operation: "destroy",
                detail: "injected failure".into(),
            });
        }
        self.with(|d, _| d.active = false)
    }

    async fn undefine(&self) -> DriverResult<()> {
        self.with(|_, _| ())?;
        self.state.lock().unwrap().domains.remove(&self.name);
        Ok(())
    }

    async fn describe(&self) -> DriverResult<String> {
        self.with(|d, _| d.xml.clone())
    }
}

#[async_trait]
impl DomainHandle for FakeDomainHandle {
    async fn reboot(&self) -> DriverResult<()> {
        self.with(|d, _| d.starts += 1)
    }
}

pub struct FakeNetworkHandle {
    name: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeNetworkHandle {
    fn with<T>(&self, f: impl FnOnce(&mut FakeNetwork) -> T) -> DriverResult<T> {
        let mut state = self.state.lock().unwrap();
        let network = state.networks.get_mut(&self.name).ok_or_else(|| DriverError::NotFound {
            kind: "network",
            name: self.name.clone(),
            detail: "undefined".into(),
        })?;
        Ok(f(network))
    }
}

#[async_trait]
impl VirtObject for FakeNetworkHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> DriverResult<()> {
        if self.state.lock().unwrap().fail_network_start {
            return Err(DriverError::Operation {
                name: self.name.clone(),
                operation: "start",
                detail: "injected failure".into(),
            });
        }
        self.with(|n| n.active = true)
    }

    async fn destroy(&self) -> DriverResult<()> {
        if self.state.lock().unwrap().fail_network_destroy {
            return Err(DriverError::Operation {
                name: self.name.clone(),
                operation: "destroy",
                detail: "injected failure".into(),
            });
        }
        self.with(|n| n.active = false)
    }

    async fn undefine(&self) -> DriverResult<()> {
        self.with(|_| ())?;
        self.state.lock().unwrap().networks.remove(&self.name);
        Ok(())
    }

    async fn describe(&self) -> DriverResult<String> {
        self.with(|n| n.xml.clone())
    }
}

#[async_trait]
impl NetworkHandle for FakeNetworkHandle {
    async fn update_dhcp_host(&self, command: DhcpCommand, host: &DhcpHost) -> DriverResult<()> {
        let name = self.name.clone();
        self.with(|n| match command {
            DhcpCommand::Add => {
                n.dhcp_hosts.push(host.clone());
                Ok(())
            }
            DhcpCommand::Delete => match n.dhcp_hosts.iter().position(|h| h == host) {
                Some(i) => {
                    n.dhcp_hosts.remove(i);
                    Ok(())
                }
                None => Err(DriverError::Operation {
                    name,
                    operation: "delete DHCP host",
                    detail: format!("no matching record {}", host.to_xml()),
                }),
            },
        })?
    }
}

// ---------------------------------------------------------------------------
// Shell
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ShellLog {
    pub opened: u32,
    pub closed: u32,
    pub commands: Vec<String>,
    pub uploads: Vec<(PathBuf, String)>,
    pub downloads: Vec<(String, PathBuf)>,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeShell {
    pub log: Arc<Mutex<ShellLog>>,
    responses: Arc<Mutex<HashMap<String, ExecOutput>>>,
}

impl FakeShell {
    pub fn respond(&self, cmd: &str, stdout: &str, stderr: &str, exit_code: i32) {
        self.responses.lock().unwrap().insert(
            cmd.to_string(),
            ExecOutput {
                stdout: stdout.into(),
                stderr: stderr.into(),
                exit_code,
            },
        );
    }

    pub fn log(&self) -> std::sync::MutexGuard<'_, ShellLog> {
        self.log.lock().unwrap()
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn connect(&self, target: &SshTarget) -> ShellResult<Box<dyn ShellSession>> {
        let mut log = self.log.lock().unwrap();
        log.opened += 1;
        log.targets.push(format!("{}@{}", target.user, target.host));
        Ok(Box::new(FakeSession {
            log: self.log.clone(),
            responses: self.responses.clone(),
        }))
    }
}

struct FakeSession {
    log: Arc<Mutex<ShellLog>>,
    responses: Arc<Mutex<HashMap<String, ExecOutput>>>,
}

#[async_trait]
impl ShellSession for FakeSession {
    async fn exec(&mut self, cmd: &str) -> ShellResult<ExecOutput> {
        self.log.lock().unwrap().commands.push(cmd.to_string());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(cmd)
            .cloned()
            .unwrap_or_default())
    }

    async fn upload(&mut self, src: &Path, dst: &str) -> ShellResult<()> {
        if !src.exists() {
            return Err(ShellError::Transfer {
                src: src.display().to_string(),
                dst: dst.into(),
                detail: "no such file".into(),
            });
        }
        self.log.lock().unwrap().uploads.push((src.to_path_buf(), dst.to_string()));
        Ok(())
    }

    async fn download(&mut self, src: &str, dst: &Path) -> ShellResult<()> {
        self.log.lock().unwrap().downloads.push((src.to_string(), dst.to_path_buf()));
        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.log.lock().unwrap().closed += 1;
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

pub struct Fixture {
    pub dir: TempDir,
    pub config: EnvConfig,
    pub driver: FakeDriver,
    pub shell: FakeShell,
}

impl Fixture {
    /// Host files an environment needs, laid out under a fresh temp dir.
    pub fn create() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let build = root.join("build");
        std::fs::create_dir_all(&build).unwrap();
        for file in ["vmlinuz", "initramfs", "fuel_key", "pxelinux.0"] {
            std::fs::write(build.join(file), file).unwrap();
        }

        let templates = root.join("templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(templates.join(NODE_TEMPLATE), NODE_XML).unwrap();
        std::fs::write(templates.join("agent.conf"), "[agent]\nnode = {{ node_name }}\n").unwrap();

        let rsync = root.join("rsync");
        std::fs::create_dir_all(&rsync).unwrap();
        let rsyncd = root.join("rsyncd.conf");
        std::fs::write(&rsyncd, format!("[ironic_rsync]\npath = {}\n", rsync.display())).unwrap();

        let images = root.join("images");
        std::fs::create_dir_all(&images).unwrap();

        let mut config = EnvConfig::default();
        config.workdir = root.join("work");
        config.sudo = false;
        config.images.image_build_dir = build.clone();
        config.images.tenant_images_dir = images;
        config.images.pxelinux = Some(build.join("pxelinux.0"));
        config.rsync.config_path = rsyncd;
        config.rsync.check_daemon = false;
        config.stub_server.command = vec!["sh".into(), "-c".into(), "exec sleep 30".into()];
        config.stub_server.stop_timeout_secs = 5;
        config.templates.dirs = vec![templates];

        let driver = FakeDriver::default();
        driver.state().callback_root = Some(config.workdir.clone());

        Self {
            dir,
            config,
            driver,
            shell: FakeShell::default(),
        }
    }

    pub fn paths(&self) -> SuitePaths {
        SuitePaths::new(self.config.workdir.clone())
    }

    pub fn renderer(&self) -> TeraRenderer {
        TeraRenderer::new(&self.config.templates.dirs, self.paths()).unwrap()
    }

    pub fn environment(&self) -> Environment {
        Environment::new(
            self.config.clone(),
            Arc::new(self.driver.clone()),
            Arc::new(self.shell.clone()),
            Arc::new(self.renderer()),
        )
        .unwrap()
    }
}
