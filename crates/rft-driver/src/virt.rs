use async_trait::async_trait;

use crate::error::DriverResult;
use crate::types::{DhcpCommand, DhcpHost};

/// Capabilities shared by every object the virtualization backend manages
/// (guest domains and virtual networks).
#[async_trait]
pub trait VirtObject: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> DriverResult<()>;
    /// Hard power-off of a running object. The definition is kept.
    async fn destroy(&self) -> DriverResult<()>;
    /// Remove the persistent definition.
    async fn undefine(&self) -> DriverResult<()>;
    /// Current XML description of the object.
    async fn describe(&self) -> DriverResult<String>;
}

#[async_trait]
pub trait DomainHandle: VirtObject {
    async fn reboot(&self) -> DriverResult<()>;
}

#[async_trait]
pub trait NetworkHandle: VirtObject {
    async fn update_dhcp_host(&self, command: DhcpCommand, host: &DhcpHost) -> DriverResult<()>;
}

#[async_trait]
pub trait VirtDriver: Send + Sync {
    /// Human-readable name for this driver implementation (e.g. "virsh").
    fn name(&self) -> &str;

    async fn define_domain(&self, xml: &str) -> DriverResult<()>;
    async fn lookup_domain(&self, name: &str) -> DriverResult<Box<dyn DomainHandle>>;

    async fn define_network(&self, xml: &str) -> DriverResult<()>;
    async fn lookup_network(&self, name: &str) -> DriverResult<Box<dyn NetworkHandle>>;

    /// XML descriptions of every network known to the backend, active or not.
    async fn list_network_descriptions(&self) -> DriverResult<Vec<String>>;
}
