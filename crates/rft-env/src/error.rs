use std::path::{Path, PathBuf};
use std::time::Duration;

use rft_driver::{DriverError, ShellError};
use rft_host::CommandError;

use crate::xml::XmlError;

/// Coarse classification of an [`EnvError`], for callers that only care
/// about which class of failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ResourceExhaustion,
    Driver,
    Timeout,
    RemoteCommand,
    Configuration,
    State,
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("no free address space under {head}.0.0/16")]
    NoFreeAddressSpace { head: String },

    #[error("{operation} {resource} failed: {source}")]
    Driver {
        resource: String,
        operation: &'static str,
        #[source]
        source: DriverError,
    },

    #[error("host prerequisites not met: {0}")]
    Prerequisites(#[source] DriverError),

    #[error("{operation} on node {node} failed: {source}")]
    Shell {
        node: String,
        operation: &'static str,
        #[source]
        source: ShellError,
    },

    #[error("node {node} did not boot within {}s", .timeout.as_secs())]
    NodeBootTimeout { node: String, timeout: Duration },

    #[error("no callback from node {node} within {}s", .timeout.as_secs())]
    NodeCallbackTimeout { node: String, timeout: Duration },

    #[error("command '{command}' on node {node} exited with code {code}")]
    NonZeroExitCode {
        node: String,
        command: String,
        code: i32,
    },

    #[error("node {node} is not attached to a network")]
    NodeNotAttached { node: String },

    #[error("node {node} is already attached (ip {ip})")]
    NodeAlreadyAttached { node: String, ip: String },

    #[error("network {network} holds no reservation for node {node} ({mac})")]
    ReservationNotFound {
        network: String,
        node: String,
        mac: String,
    },

    #[error("node {node} already boots from disk")]
    AlreadyBootedFromDisk { node: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("template {name}: {detail}")]
    Template { name: String, detail: String },

    #[error("{resource}: {source}")]
    Xml {
        resource: String,
        #[source]
        source: XmlError,
    },

    #[error("unknown image source '{name}' (expected 'swift' or 'rsync')")]
    UnknownImageSource { name: String },

    #[error("image not found: {}", .path.display())]
    ImageNotFound { path: PathBuf },

    #[error("mounting image {image} failed: {detail}")]
    ImageMount { image: String, detail: String },

    #[error("image slot already holds {mounted}, cannot mount {requested}")]
    ImageSlotBusy { mounted: String, requested: String },

    #[error("mounted image not present at {}", .mount_point.display())]
    MountedImageNotPresent { mount_point: PathBuf },

    #[error("no rsync daemon is running")]
    RsyncNotRunning,

    #[error("rsyncd config not found at {}", .path.display())]
    RsyncConfigNotFound { path: PathBuf },

    #[error("rsyncd config {} has no usable [{section}] module", .path.display())]
    RsyncSectionNotFound { path: PathBuf, section: String },

    #[error("PXE bootloader (pxelinux.0) not found")]
    PxeLinuxNotFound,

    #[error("stub server: {0}")]
    StubServer(String),

    #[error("{operation} not allowed while suite is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("{operation} failed: {source}")]
    HostCommand {
        operation: &'static str,
        #[source]
        source: CommandError,
    },

    #[error("{operation} {}: {source}", .path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize {}: {source}", .path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl EnvError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoFreeAddressSpace { .. } => ErrorKind::ResourceExhaustion,
            Self::Driver { .. } | Self::Prerequisites(_) | Self::Shell { .. } => ErrorKind::Driver,
            Self::NodeBootTimeout { .. } | Self::NodeCallbackTimeout { .. } => ErrorKind::Timeout,
            Self::NonZeroExitCode { .. } => ErrorKind::RemoteCommand,
            Self::Config(_)
            | Self::Template { .. }
            | Self::Xml { .. }
            | Self::UnknownImageSource { .. }
            | Self::ImageNotFound { .. }
            | Self::ImageMount { .. }
            | Self::MountedImageNotPresent { .. }
            | Self::RsyncNotRunning
            | Self::RsyncConfigNotFound { .. }
            | Self::RsyncSectionNotFound { .. }
            | Self::PxeLinuxNotFound => ErrorKind::Configuration,
            Self::NodeNotAttached { .. }
            | Self::NodeAlreadyAttached { .. }
            | Self::ReservationNotFound { .. }
            | Self::AlreadyBootedFromDisk { .. }
            | Self::ImageSlotBusy { .. }
            | Self::InvalidState { .. } => ErrorKind::State,
            Self::StubServer(_)
            | Self::HostCommand { .. }
            | Self::Io { .. }
            | Self::Serialize { .. } => ErrorKind::Io,
        }
    }

    /// Adapter for `map_err` on filesystem calls.
    pub(crate) fn io(operation: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io {
            operation,
            path,
            source,
        }
    }

    /// Adapter for `map_err` on virtualization driver calls.
    pub(crate) fn driver(
        operation: &'static str,
        resource: &str,
    ) -> impl FnOnce(DriverError) -> Self {
        let resource = resource.to_string();
        move |source| Self::Driver {
            resource,
            operation,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EnvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_carry_node_and_seconds() {
        let err = EnvError::NodeCallbackTimeout {
            node: "rft-node-1a2b3c4d".into(),
            timeout: Duration::from_secs(360),
        };
        assert_eq!(err.to_string(), "no callback from node rft-node-1a2b3c4d within 360s");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn non_zero_exit_code_message() {
        let err = EnvError::NonZeroExitCode {
            node: "rft-node-1".into(),
            command: "false".into(),
            code: 1,
        };
        assert_eq!(err.to_string(), "command 'false' on node rft-node-1 exited with code 1");
        assert_eq!(err.kind(), ErrorKind::RemoteCommand);
    }

    #[test]
    fn driver_adapter_keeps_context() {
        let err = EnvError::driver("define network", "rft-net-1")(DriverError::Define {
            kind: "network",
            detail: "bad xml".into(),
        });
        assert_eq!(
            err.to_string(),
            "define network rft-net-1 failed: define network failed: bad xml"
        );
        assert_eq!(err.kind(), ErrorKind::Driver);
    }

    #[test]
    fn io_adapter_names_path() {
        let err = EnvError::io("create", Path::new("/tmp/x"))(std::io::Error::other("denied"));
        assert_eq!(err.to_string(), "create /tmp/x: denied");
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn kinds_of_configuration_errors() {
        assert_eq!(EnvError::PxeLinuxNotFound.kind(), ErrorKind::Configuration);
        assert_eq!(
            EnvError::UnknownImageSource { name: "ftp".into() }.kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            EnvError::NoFreeAddressSpace { head: "10.0".into() }.kind(),
            ErrorKind::ResourceExhaustion
        );
    }
}
