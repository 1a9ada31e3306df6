use async_trait::async_trait;
use rft_driver::VirtObject;
use tracing::debug;

use crate::cleanup::CleanupReport;
use crate::error::Result;

/// Lifecycle shared by the suite network and guest nodes. Each implementor
/// owns its own driver handle.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()>;
    /// Hard stop; the definition stays.
    async fn stop(&self) -> Result<()>;
    /// Destroy and undefine, each attempted regardless of the other.
    async fn kill(&self) -> CleanupReport;
}

/// Best-effort destroy-then-undefine of a driver object.
pub(crate) async fn kill_object<O: VirtObject + ?Sized>(object: &O) -> CleanupReport {
    debug!(name = object.name(), "killing");
    let mut report = CleanupReport::new(object.name());
    report.record("destroy", object.destroy().await);
    report.record("undefine", object.undefine().await);
    report
}
