mod error;
mod shell;
mod types;
mod virt;

pub use error::{DriverError, DriverResult, ShellError, ShellResult};
pub use shell::{RemoteShell, ShellSession};
pub use types::{DhcpCommand, DhcpHost, ExecOutput, SshTarget};
pub use virt::{DomainHandle, NetworkHandle, VirtDriver, VirtObject};
