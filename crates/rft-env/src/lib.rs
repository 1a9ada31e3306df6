//! Disposable libvirt environment for functional tests of a deployment
//! ramdisk.
//!
//! A suite owns one isolated NAT network with DHCP and TFTP, a stub HTTP
//! server on its gateway and the PXE boot files. Each test gets one guest
//! that PXE boots the ramdisk, reports back through the stub server and is
//! then driven over SSH.

pub mod allocator;
pub mod config;
pub mod environment;
pub mod ids;
pub mod network;
pub mod node;

mod cleanup;
mod error;
mod images;
mod lifecycle;
mod paths;
mod poll;
mod pxe;
mod rsync;
mod stub_server;
mod template;
mod xml;

pub use cleanup::{CleanupFailure, CleanupReport};
pub use config::EnvConfig;
pub use environment::{AuxDocument, Environment, REMOTE_PROVISION_PATH, SuiteState, TestRequest};
pub use error::{EnvError, ErrorKind, Result};
pub use images::{
    ImageEndpoint, ImageSelector, ImageSlot, ImageSource, MountedImage, ResolvedImage,
    inject_image_urls,
};
pub use lifecycle::Lifecycle;
pub use network::VirtualNetwork;
pub use node::{BootDevice, GuestNode, NodeSettings, SshCredential};
pub use paths::SuitePaths;
pub use poll::POLL_INTERVAL;
pub use pxe::{PXELINUX_LOCATIONS, boot_files, find_pxelinux, populate_tftp_root, write_pxe_config};
pub use rsync::{RsyncdConf, check_rsync};
pub use stub_server::{StopOutcome, StubServer, StubServerSpec};
pub use template::{NETWORK_TEMPLATE, PXE_TEMPLATE, TemplateRenderer, TeraRenderer};
pub use xml::{XmlError, boot_device, ensure_machine_type, set_boot_device};
