use std::path::{Path, PathBuf};

/// Everything the suite writes lives under one workdir:
///
/// ```text
/// <workdir>/tftp_root/pxelinux.cfg/01-<mac>
/// <workdir>/<node>/console.log
/// <workdir>/<node>/callback
/// <workdir>/<node>/provision.json
/// <workdir>/<node>/disks/<disk>.img
/// <workdir>/ssh/
/// ```
#[derive(Debug, Clone)]
pub struct SuitePaths {
    workdir: PathBuf,
}

impl SuitePaths {
    pub fn new(workdir: PathBuf) -> Self {
        Self { workdir }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn tftp_root(&self) -> PathBuf {
        self.workdir.join("tftp_root")
    }

    pub fn pxe_config_dir(&self) -> PathBuf {
        self.tftp_root().join("pxelinux.cfg")
    }

    /// PXE config for `mac`, in the `01-aa-bb-cc-dd-ee-ff` form pxelinux looks up.
    pub fn pxe_config(&self, mac: &str) -> PathBuf {
        self.pxe_config_dir().join(pxe_config_name(mac))
    }

    /// Control sockets of SSH sessions.
    pub fn ssh_control_dir(&self) -> PathBuf {
        self.workdir.join("ssh")
    }

    pub fn node_dir(&self, node: &str) -> PathBuf {
        self.workdir.join(node)
    }

    pub fn console_log(&self, node: &str) -> PathBuf {
        self.node_dir(node).join("console.log")
    }

    /// Marker created by the stub server when the guest reports success.
    pub fn callback(&self, node: &str) -> PathBuf {
        self.node_dir(node).join("callback")
    }

    pub fn provision_json(&self, node: &str) -> PathBuf {
        self.node_dir(node).join("provision.json")
    }

    pub fn disks_dir(&self, node: &str) -> PathBuf {
        self.node_dir(node).join("disks")
    }

    pub fn disk(&self, node: &str, disk: &str) -> PathBuf {
        self.disks_dir(node).join(format!("{disk}.img"))
    }
}

/// ARP type 1 (ethernet) prefix plus the MAC with dashes.
pub(crate) fn pxe_config_name(mac: &str) -> String {
    format!("01-{}", mac.replace(':', "-").to_lowercase())
}
