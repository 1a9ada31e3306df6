//! Suite and test scoped setup and teardown of the whole environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rft_driver::{RemoteShell, VirtDriver};
use rft_host::{OpenSshShell, Privilege, VirshDriver, check_prerequisites};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::cleanup::CleanupReport;
use crate::config::EnvConfig;
use crate::error::{EnvError, Result};
use crate::images::{
    ImageEndpoint, ImageSelector, ImageSlot, ImageSource, ResolvedImage, inject_image_urls,
};
use crate::lifecycle::Lifecycle;
use crate::network::VirtualNetwork;
use crate::node::{GuestNode, NodeSettings, SshCredential};
use crate::paths::SuitePaths;
use crate::pxe::{PXELINUX_LOCATIONS, boot_files, find_pxelinux, populate_tftp_root, write_pxe_config};
use crate::rsync::check_rsync;
use crate::stub_server::{StubServer, StubServerSpec};
use crate::template::{PXE_TEMPLATE, TemplateRenderer, TeraRenderer};

/// Where the deploy configuration lands on the guest.
pub const REMOTE_PROVISION_PATH: &str = "/tmp/provision.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteState {
    Unstarted,
    Ready,
    TornDown,
}

impl fmt::Display for SuiteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unstarted => f.write_str("unstarted"),
            Self::Ready => f.write_str("ready"),
            Self::TornDown => f.write_str("torn down"),
        }
    }
}

/// A template rendered with the node variables into the node workdir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxDocument {
    pub template: String,
    pub file_name: String,
}

/// Everything one test needs to get a guest through its deployment boot.
#[derive(Debug, Clone)]
pub struct TestRequest {
    pub node_template: String,
    /// Deploy configuration handed to the agent; image URLs are filled in.
    pub deploy_config: Value,
    pub images: ImageSelector,
    /// `swift` or `rsync`.
    pub image_source: String,
    pub aux_documents: Vec<AuxDocument>,
}

impl TestRequest {
    /// A request deploying the stub image over HTTP.
    pub fn new(node_template: impl Into<String>, deploy_config: Value) -> Self {
        Self {
            node_template: node_template.into(),
            deploy_config,
            images: ImageSelector::Stub,
            image_source: ImageSource::Swift.to_string(),
            aux_documents: Vec::new(),
        }
    }
}

struct Suite {
    network: VirtualNetwork,
    stub_server: StubServer,
    /// Path of the rsync module; tenant images are mounted below it.
    rsync_dir: PathBuf,
    endpoint: ImageEndpoint,
}

struct TestScope {
    node: GuestNode,
}

/// The per-process test environment: one network and stub server per
/// suite, one guest per test.
pub struct Environment {
    config: EnvConfig,
    paths: SuitePaths,
    driver: Arc<dyn VirtDriver>,
    shell: Arc<dyn RemoteShell>,
    renderer: Arc<dyn TemplateRenderer>,
    state: SuiteState,
    suite: Option<Suite>,
    test: Option<TestScope>,
    image_slot: ImageSlot,
    setup_rollback: Option<CleanupReport>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("workdir", &self.paths.workdir())
            .field("state", &self.state)
            .field("node", &self.node())
            .finish_non_exhaustive()
    }
}

impl Environment {
    pub fn new(
        config: EnvConfig,
        driver: Arc<dyn VirtDriver>,
        shell: Arc<dyn RemoteShell>,
        renderer: Arc<dyn TemplateRenderer>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            paths: SuitePaths::new(config.workdir.clone()),
            image_slot: ImageSlot::new(config.host_privilege()),
            config,
            driver,
            shell,
            renderer,
            state: SuiteState::Unstarted,
            suite: None,
            test: None,
            setup_rollback: None,
        })
    }

    /// Build an environment on the host backends: `virsh`, OpenSSH and Tera.
    pub async fn connect(config: EnvConfig) -> Result<Self> {
        config.validate()?;
        let privilege = if config.sudo || config.libvirt.sudo {
            Privilege::Sudo
        } else {
            Privilege::User
        };
        check_prerequisites(privilege, true)
            .await
            .map_err(EnvError::Prerequisites)?;

        let driver = VirshDriver::connect(&config.libvirt.uri, config.libvirt_privilege())
            .await
            .map_err(EnvError::driver("connect to", &config.libvirt.uri))?;
        let paths = SuitePaths::new(config.workdir.clone());
        let shell = OpenSshShell::new(
            paths.ssh_control_dir(),
            Duration::from_secs(config.node.ssh_connect_timeout_secs),
        );
        let renderer = TeraRenderer::new(&config.templates.dirs, paths)?;
        Self::new(config, Arc::new(driver), Arc::new(shell), Arc::new(renderer))
    }

    pub fn state(&self) -> SuiteState {
        self.state
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn paths(&self) -> &SuitePaths {
        &self.paths
    }

    /// The current test's node.
    pub fn node(&self) -> Option<&GuestNode> {
        self.test.as_ref().map(|t| &t.node)
    }

    pub fn node_mut(&mut self) -> Option<&mut GuestNode> {
        self.test.as_mut().map(|t| &mut t.node)
    }

    /// Report of the rollback done by the last failed
    /// [`setup_suite`](Self::setup_suite), if any.
    pub fn setup_rollback(&self) -> Option<&CleanupReport> {
        self.setup_rollback.as_ref()
    }

    pub fn network(&self) -> Option<&VirtualNetwork> {
        self.suite.as_ref().map(|s| &s.network)
    }

    /// URL of the stub server's placeholder image.
    pub fn stub_image_url(&self) -> Result<String> {
        self.ready_suite("stub_image_url").map(|s| s.endpoint.stub_url())
    }

    fn ready_suite(&self, operation: &'static str) -> Result<&Suite> {
        match &self.suite {
            Some(suite) if self.state == SuiteState::Ready => Ok(suite),
            _ => Err(EnvError::InvalidState {
                operation,
                state: self.state.to_string(),
            }),
        }
    }

    fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            machine_type: self.config.node.machine_type.clone(),
            ssh: SshCredential {
                login: self.config.node.ssh_login.clone(),
                key_path: self.config.images.ssh_key_path(),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Suite scope
    // -----------------------------------------------------------------------

    /// Network, stub server, rsync check and PXE boot files.
    ///
    /// Whatever was brought up is torn down again when a later step fails.
    pub async fn setup_suite(&mut self) -> Result<()> {
        if self.state == SuiteState::Ready {
            return Err(EnvError::InvalidState {
                operation: "setup_suite",
                state: self.state.to_string(),
            });
        }
        self.setup_rollback = None;
        info!(workdir = %self.paths.workdir().display(), "setting up suite");
        tokio::fs::create_dir_all(self.paths.workdir())
            .await
            .map_err(EnvError::io("create", self.paths.workdir()))?;

        let network = VirtualNetwork::create(
            self.driver.as_ref(),
            self.renderer.as_ref(),
            &self.config.network,
            self.paths.tftp_root(),
        )
        .await?;
        if let Err(e) = network.start().await {
            self.abort_suite_setup(&e, network, None).await;
            return Err(e);
        }

        let spec = self.stub_server_spec(&network);
        let stub_server = match StubServer::spawn(&spec).await {
            Ok(server) => server,
            Err(e) => {
                self.abort_suite_setup(&e, network, None).await;
                return Err(e);
            }
        };

        let rsync_dir = match self.prepare_boot_sources().await {
            Ok(dir) => dir,
            Err(e) => {
                self.abort_suite_setup(&e, network, Some(stub_server)).await;
                return Err(e);
            }
        };

        let endpoint = ImageEndpoint::new(
            network.gateway(),
            self.config.stub_server.port,
            self.config.rsync.module.clone(),
        );
        info!(
            network = %network.name(),
            gateway = %network.gateway(),
            api_url = %endpoint.api_url(),
            "suite ready"
        );
        self.suite = Some(Suite {
            network,
            stub_server,
            rsync_dir,
            endpoint,
        });
        self.state = SuiteState::Ready;
        Ok(())
    }

    fn stub_server_spec(&self, network: &VirtualNetwork) -> StubServerSpec {
        let public_key = self.config.images.ssh_public_key_path();
        StubServerSpec {
            command: self.config.stub_server.command.clone(),
            address: network.gateway(),
            port: self.config.stub_server.port,
            images_dir: self.config.images.tenant_images_dir.clone(),
            workdir: self.paths.workdir().to_path_buf(),
            authorized_key: public_key.is_file().then_some(public_key),
        }
    }

    /// Check the rsync module and fill the TFTP root. Returns the module path.
    async fn prepare_boot_sources(&self) -> Result<PathBuf> {
        let rsync_dir = check_rsync(&self.config.rsync).await?;
        let pxelinux = find_pxelinux(self.config.images.pxelinux.as_deref(), PXELINUX_LOCATIONS)?;
        let files = boot_files(
            &pxelinux,
            &self.config.images.kernel_path(),
            &self.config.images.ramdisk_path(),
        );
        populate_tftp_root(&self.paths.tftp_root(), &files).await?;
        Ok(rsync_dir)
    }

    /// Undo a partial suite setup. The report is kept for
    /// [`setup_rollback`](Self::setup_rollback).
    async fn abort_suite_setup(
        &mut self,
        cause: &EnvError,
        network: VirtualNetwork,
        stub_server: Option<StubServer>,
    ) {
        warn!(network = %network.name(), error = %cause, "suite setup failed, rolling back");
        let mut report = CleanupReport::new("suite setup rollback");
        if let Some(server) = stub_server {
            let outcome = server.stop(self.config.stub_server.stop_timeout()).await;
            info!(?outcome, "stub server stopped");
        }
        report.merge(network.kill().await);
        if !report.is_clean() {
            error!(
                error = %cause,
                failed = report.failures().len(),
                "suite setup failed and its rollback left resources behind"
            );
        }
        self.setup_rollback = Some(report.finish());
    }

    /// Tear down an active test, then everything the suite created.
    /// Failures are collected in the report, never raised.
    pub async fn teardown_suite(&mut self) -> CleanupReport {
        let mut report = CleanupReport::new("suite");
        if self.test.is_some() {
            report.merge(self.teardown_test().await);
        }
        let Some(suite) = self.suite.take() else {
            info!(state = %self.state, "no suite to tear down");
            return report.finish();
        };
        info!(network = %suite.network.name(), "tearing down suite");

        let outcome = suite
            .stub_server
            .stop(self.config.stub_server.stop_timeout())
            .await;
        info!(?outcome, "stub server stopped");
        report.record("release image", self.image_slot.release().await);
        report.merge(suite.network.kill().await);
        report.record("delete workdir", remove_tree(self.paths.workdir()).await);

        self.state = SuiteState::TornDown;
        report.finish()
    }

    // -----------------------------------------------------------------------
    // Test scope
    // -----------------------------------------------------------------------

    /// Create a guest for `request`, PXE boot it into the ramdisk and wait
    /// for its callback, then upload the deploy configuration.
    ///
    /// On failure the node stays registered so
    /// [`teardown_test`](Self::teardown_test) can remove it.
    pub async fn setup_test(&mut self, request: TestRequest) -> Result<()> {
        self.ready_suite("setup_test")?;
        if let Some(node) = self.node() {
            return Err(EnvError::InvalidState {
                operation: "setup_test",
                state: format!("{} with active test on {}", self.state, node.name()),
            });
        }
        let source: ImageSource = request.image_source.parse()?;

        let settings = self.node_settings();
        let network = self.ready_suite("setup_test")?.network.name().to_string();
        let node = GuestNode::create(
            self.driver.clone(),
            self.shell.clone(),
            self.renderer.as_ref(),
            &request.node_template,
            &network,
            &self.paths,
            &settings,
        )
        .await?;
        info!(node = %node.name(), template = %request.node_template, %source, "setting up test");
        self.test = Some(TestScope { node });

        if let Err(e) = self.prepare_test(request, source).await {
            error!(error = %e, "test setup failed");
            return Err(e);
        }
        Ok(())
    }

    async fn prepare_test(&mut self, request: TestRequest, source: ImageSource) -> Result<()> {
        let state = self.state.to_string();
        let (Some(suite), Some(test)) = (self.suite.as_mut(), self.test.as_mut()) else {
            return Err(EnvError::InvalidState {
                operation: "setup_test",
                state,
            });
        };
        let node = &mut test.node;

        let variables = node.template_variables();
        for doc in &request.aux_documents {
            let contents = self.renderer.render(&doc.template, &variables)?;
            let path = node.workdir().join(&doc.file_name);
            tokio::fs::write(&path, contents)
                .await
                .map_err(EnvError::io("write", &path))?;
        }

        let pxe_config = self.renderer.render(
            PXE_TEMPLATE,
            &json!({
                "kernel": self.config.images.kernel,
                "ramdisk": self.config.images.ramdisk,
                "deployment_id": node.name(),
                "api_url": suite.endpoint.api_url(),
            }),
        )?;
        write_pxe_config(&self.paths.pxe_config(node.mac()), &pxe_config).await?;

        suite.network.add_node(node).await?;

        let resolved = resolve_images(
            &request.images,
            source,
            &suite.endpoint,
            &mut self.image_slot,
            &self.config.images.tenant_images_dir,
            &suite.rsync_dir,
        )
        .await?;
        let mut deploy_config = request.deploy_config;
        inject_image_urls(&mut deploy_config, &resolved)?;
        let provision = self.paths.provision_json(node.name());
        let body = serde_json::to_string(&deploy_config).map_err(|source| EnvError::Serialize {
            path: provision.clone(),
            source,
        })?;
        tokio::fs::write(&provision, body)
            .await
            .map_err(EnvError::io("write", &provision))?;

        node.start().await?;
        node.wait_for_callback(self.config.node.boot_timeout()).await?;
        node.put_file(&provision, REMOTE_PROVISION_PATH).await?;
        info!(node = %node.name(), ip = ?node.ip(), "test ready");
        Ok(())
    }

    /// Remove the current test's node and free the image slot.
    /// Failures are collected in the report, never raised.
    pub async fn teardown_test(&mut self) -> CleanupReport {
        let mut report = CleanupReport::new("test");
        let Some(TestScope { mut node }) = self.test.take() else {
            info!("no active test to tear down");
            return report;
        };
        info!(node = %node.name(), "tearing down test");

        if node.ip().is_some() {
            match self.suite.as_mut() {
                Some(suite) => {
                    report.record("remove from network", suite.network.remove_node(&mut node).await);
                }
                None => warn!(node = %node.name(), "node attached without a suite network"),
            }
        }
        report.merge(node.kill().await);
        report.record("delete workdir", remove_tree(node.workdir()).await);
        report.record(
            "delete PXE config",
            remove_file(&self.paths.pxe_config(node.mac())).await,
        );
        if self.image_slot.is_occupied() {
            report.record("release image", self.image_slot.release().await);
        }
        report.finish()
    }
}

/// Map the selected images to URLs the guest can pull from.
async fn resolve_images(
    images: &ImageSelector,
    source: ImageSource,
    endpoint: &ImageEndpoint,
    slot: &mut ImageSlot,
    tenant_images_dir: &Path,
    rsync_dir: &Path,
) -> Result<Vec<ResolvedImage>> {
    let names = match images {
        ImageSelector::Stub => {
            return Ok(vec![ResolvedImage {
                name: "fake".to_string(),
                url: endpoint.stub_url(),
            }]);
        }
        ImageSelector::Named(names) => names,
    };

    let mut resolved = Vec::with_capacity(names.len());
    for name in names {
        let url = match source {
            ImageSource::Swift => endpoint.swift_url(name),
            ImageSource::Rsync => {
                slot.mount(name, &tenant_images_dir.join(name), &rsync_dir.join(name))
                    .await?;
                endpoint.rsync_url(name)
            }
        };
        info!(image = %name, %url, "image resolved");
        resolved.push(ResolvedImage {
            name: name.clone(),
            url,
        });
    }
    Ok(resolved)
}

async fn remove_tree(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(EnvError::io("remove", path)(e)),
        _ => Ok(()),
    }
}

async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(EnvError::io("remove", path)(e)),
        _ => Ok(()),
    }
}
