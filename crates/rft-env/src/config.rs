use std::path::{Path, PathBuf};
use std::time::Duration;

use rft_host::Privilege;
use serde::{Deserialize, Serialize};

use crate::error::{EnvError, Result};

pub(crate) const DEFAULT_WORKDIR: &str = "/tmp/ramdisk-func-test";
pub(crate) const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";
pub(crate) const DEFAULT_NET_HEAD: &str = "192.168";
pub(crate) const DEFAULT_RANGE_START: u8 = 100;
pub(crate) const DEFAULT_RANGE_END: u8 = 254;
pub(crate) const DEFAULT_BOOT_TIMEOUT_SECS: u64 = 360;
pub(crate) const DEFAULT_HTTP_PORT: u16 = 8011;
pub(crate) const DEFAULT_STOP_TIMEOUT_SECS: u64 = 15;
pub(crate) const DEFAULT_RSYNC_MODULE: &str = "ironic_rsync";

/// Everything an [`Environment`](crate::Environment) needs, built once at
/// process start and handed down to the managers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Root of everything the suite writes: node dirs, TFTP root, SSH sockets.
    pub workdir: PathBuf,
    /// Run `mount`/`umount` through `sudo`.
    pub sudo: bool,
    pub libvirt: LibvirtConfig,
    pub network: NetworkConfig,
    pub node: NodeConfig,
    pub images: ImagesConfig,
    pub stub_server: StubServerConfig,
    pub rsync: RsyncConfig,
    pub templates: TemplatesConfig,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from(DEFAULT_WORKDIR),
            sudo: true,
            libvirt: LibvirtConfig::default(),
            network: NetworkConfig::default(),
            node: NodeConfig::default(),
            images: ImagesConfig::default(),
            stub_server: StubServerConfig::default(),
            rsync: RsyncConfig::default(),
            templates: TemplatesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibvirtConfig {
    pub uri: String,
    /// Run `virsh` through `sudo`.
    pub sudo: bool,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_LIBVIRT_URI.to_string(),
            sudo: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// First two octets of the private range to allocate from, e.g. `192.168`.
    pub head: String,
    /// Last octet of the first DHCP address.
    pub range_start: u8,
    /// Last octet of the last DHCP address (inclusive).
    pub range_end: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            head: DEFAULT_NET_HEAD.to_string(),
            range_start: DEFAULT_RANGE_START,
            range_end: DEFAULT_RANGE_END,
        }
    }
}

impl NetworkConfig {
    /// The two head octets, or a config error when `head` is not `A.B`.
    pub fn head_octets(&self) -> Result<[u8; 2]> {
        let mut parts = self.head.split('.');
        let parsed = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), None) => a.parse::<u8>().ok().zip(b.parse::<u8>().ok()),
            _ => None,
        };
        parsed
            .map(|(a, b)| [a, b])
            .ok_or_else(|| EnvError::Config(format!("network.head must be 'A.B', got '{}'", self.head)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Bound for the boot and callback waits.
    pub boot_timeout_secs: u64,
    /// Forced onto `os/type` when a node template does not set one.
    pub machine_type: Option<String>,
    pub ssh_login: String,
    pub ssh_connect_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            boot_timeout_secs: DEFAULT_BOOT_TIMEOUT_SECS,
            machine_type: None,
            ssh_login: "root".to_string(),
            ssh_connect_timeout_secs: 10,
        }
    }
}

impl NodeConfig {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    /// Where the ramdisk build left its kernel, ramdisk and SSH key.
    pub image_build_dir: PathBuf,
    /// Tenant images served over HTTP or mounted for rsync.
    pub tenant_images_dir: PathBuf,
    pub kernel: String,
    pub ramdisk: String,
    /// Private key file name inside `image_build_dir`; `<name>.pub` is the public half.
    pub ssh_key: String,
    /// Explicit PXE bootloader; searched in the usual syslinux locations when unset.
    pub pxelinux: Option<PathBuf>,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            image_build_dir: PathBuf::from("/tmp/rft_image_build"),
            tenant_images_dir: PathBuf::from("/tmp/rft_golden_images"),
            kernel: "vmlinuz".to_string(),
            ramdisk: "initramfs".to_string(),
            ssh_key: "fuel_key".to_string(),
            pxelinux: None,
        }
    }
}

impl ImagesConfig {
    pub fn kernel_path(&self) -> PathBuf {
        self.image_build_dir.join(&self.kernel)
    }

    pub fn ramdisk_path(&self) -> PathBuf {
        self.image_build_dir.join(&self.ramdisk)
    }

    pub fn ssh_key_path(&self) -> PathBuf {
        self.image_build_dir.join(&self.ssh_key)
    }

    pub fn ssh_public_key_path(&self) -> PathBuf {
        self.image_build_dir.join(format!("{}.pub", self.ssh_key))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StubServerConfig {
    /// Program and leading arguments; address, port and flags are appended.
    pub command: Vec<String>,
    pub port: u16,
    /// How long to wait after SIGTERM before killing the process group.
    pub stop_timeout_secs: u64,
}

impl Default for StubServerConfig {
    fn default() -> Self {
        Self {
            command: vec!["rft-stub-server".to_string()],
            port: DEFAULT_HTTP_PORT,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
        }
    }
}

impl StubServerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RsyncConfig {
    pub config_path: PathBuf,
    /// Module whose `path` receives the mounted tenant images.
    pub module: String,
    /// Require a running rsync daemon during suite setup.
    pub check_daemon: bool,
}

impl Default for RsyncConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/rsyncd.conf"),
            module: DEFAULT_RSYNC_MODULE.to_string(),
            check_daemon: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplatesConfig {
    /// Template directories, searched in order. Bundled templates come last.
    pub dirs: Vec<PathBuf>,
}

impl EnvConfig {
    /// Load and validate a config from a YAML file.
    ///
    /// Relative paths in the config are resolved against the config file's parent directory.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| EnvError::Config(format!("read {}: {e}", path.display())))?;
        let mut config: Self = serde_yaml_ng::from_str(&content)
            .map_err(|e| EnvError::Config(format!("parse {}: {e}", path.display())))?;
        if let Some(config_dir) = path.parent() {
            config.resolve_relative_paths(config_dir);
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject values the managers cannot work with.
    pub fn validate(&self) -> Result<()> {
        self.network.head_octets()?;
        let (start, end) = (self.network.range_start, self.network.range_end);
        if start < 2 || start > end || end > 254 {
            return Err(EnvError::Config(format!(
                "network DHCP range {start}..={end} must satisfy 2 <= start <= end <= 254"
            )));
        }
        if self.stub_server.port == 0 {
            return Err(EnvError::Config("stub_server.port must be non-zero".into()));
        }
        if self.stub_server.command.is_empty() {
            return Err(EnvError::Config("stub_server.command must not be empty".into()));
        }
        if self.node.boot_timeout_secs == 0 {
            return Err(EnvError::Config("node.boot_timeout_secs must be non-zero".into()));
        }
        if self.rsync.module.is_empty() {
            return Err(EnvError::Config("rsync.module must not be empty".into()));
        }
        Ok(())
    }

    /// Privilege for host commands that touch mounts.
    pub fn host_privilege(&self) -> Privilege {
        if self.sudo {
            Privilege::Sudo
        } else {
            Privilege::User
        }
    }

    pub fn libvirt_privilege(&self) -> Privilege {
        if self.libvirt.sudo {
            Privilege::Sudo
        } else {
            Privilege::User
        }
    }

    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.workdir);
        resolve(&mut self.images.image_build_dir);
        resolve(&mut self.images.tenant_images_dir);
        if let Some(p) = &mut self.images.pxelinux {
            resolve(p);
        }
        resolve(&mut self.rsync.config_path);
        for dir in &mut self.templates.dirs {
            resolve(dir);
        }
    }
}
