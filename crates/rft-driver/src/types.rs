use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// A DHCP host reservation: MAC-to-IP binding registered with a network.
///
/// The same value must be used for the add and the delete update, the
/// backend rejects a delete whose record differs from what was added.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DhcpHost {
    pub mac: String,
    pub name: String,
    pub ip: Ipv4Addr,
}

impl DhcpHost {
    /// The `<host/>` element understood by libvirt network updates.
    pub fn to_xml(&self) -> String {
        format!(
            r#"<host mac="{}" name="{}" ip="{}" />"#,
            self.mac, self.name, self.ip
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpCommand {
    /// Append the record to the reservation table.
    Add,
    /// Remove the matching record.
    Delete,
}

impl fmt::Display for DhcpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => f.write_str("add"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// Captured result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Where and as whom a remote shell session logs in.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: Ipv4Addr,
    pub user: String,
    pub key_path: PathBuf,
}
