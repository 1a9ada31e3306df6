use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use rft_driver::{
    DhcpCommand, DhcpHost, DomainHandle, DriverError, DriverResult, NetworkHandle, VirtDriver,
    VirtObject,
};
use tracing::{debug, info};

use crate::command::{CommandError, Privilege, exec};

/// Connection to a libvirt daemon driven through the `virsh` CLI.
struct Virsh {
    uri: String,
    privilege: Privilege,
}

impl Virsh {
    async fn run(&self, args: &[&str]) -> Result<String, CommandError> {
        let full = connection_args(&self.uri, args);
        exec("virsh", &full, self.privilege).await
    }

    async fn define_from_file(&self, subcommand: &str, xml: &str) -> DriverResult<()> {
        let mut file = tempfile::Builder::new()
            .prefix("rft-")
            .suffix(".xml")
            .tempfile()?;
        file.write_all(xml.as_bytes())?;
        file.flush()?;

        let path = file.path().to_string_lossy().into_owned();
        self.run(&[subcommand, &path]).await.map_err(|e| DriverError::Define {
            kind: if subcommand == "net-define" {
                "network"
            } else {
                "domain"
            },
            detail: e.detail,
        })?;
        Ok(())
    }
}

fn connection_args<'a>(uri: &'a str, args: &[&'a str]) -> Vec<&'a str> {
    let mut full = Vec::with_capacity(args.len() + 2);
    full.push("-c");
    full.push(uri);
    full.extend_from_slice(args);
    full
}

/// Arguments for a `net-update` of the DHCP host table.
///
/// Additions go to the end of the table. `--current` applies the change to
/// the live network if it is running and to the persistent definition otherwise.
fn dhcp_update_args(network: &str, command: DhcpCommand, host: &DhcpHost) -> Vec<String> {
    let verb = match command {
        DhcpCommand::Add => "add-last",
        DhcpCommand::Delete => "delete",
    };
    vec![
        "net-update".to_string(),
        network.to_string(),
        verb.to_string(),
        "ip-dhcp-host".to_string(),
        host.to_xml(),
        "--current".to_string(),
    ]
}

/// Split `virsh ... --name` output into names, skipping blank lines.
fn parse_name_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// [`VirtDriver`] backed by `virsh -c <uri>`.
pub struct VirshDriver {
    virsh: Arc<Virsh>,
}

impl VirshDriver {
    /// Open a connection to `uri` and verify the daemon answers.
    pub async fn connect(uri: &str, privilege: Privilege) -> DriverResult<Self> {
        if which::which("virsh").is_err() {
            return Err(DriverError::Unavailable(
                "required command not found: virsh".to_string(),
            ));
        }
        let virsh = Virsh {
            uri: uri.to_string(),
            privilege,
        };
        let canonical = virsh
            .run(&["uri"])
            .await
            .map_err(|e| DriverError::Unavailable(format!("{uri}: {}", e.detail)))?;
        info!(uri = %canonical, "connected to libvirt");

        Ok(Self {
            virsh: Arc::new(virsh),
        })
    }
}

#[async_trait]
impl VirtDriver for VirshDriver {
    fn name(&self) -> &str {
        "virsh"
    }

    async fn define_domain(&self, xml: &str) -> DriverResult<()> {
        self.virsh.define_from_file("define", xml).await
    }

    async fn lookup_domain(&self, name: &str) -> DriverResult<Box<dyn DomainHandle>> {
        self.virsh
            .run(&["dominfo", name])
            .await
            .map_err(|e| DriverError::NotFound {
                kind: "domain",
                name: name.to_string(),
                detail: e.detail,
            })?;
        Ok(Box::new(VirshDomain {
            virsh: Arc::clone(&self.virsh),
            name: name.to_string(),
        }))
    }

    async fn define_network(&self, xml: &str) -> DriverResult<()> {
        self.virsh.define_from_file("net-define", xml).await
    }

    async fn lookup_network(&self, name: &str) -> DriverResult<Box<dyn NetworkHandle>> {
        self.virsh
            .run(&["net-info", name])
            .await
            .map_err(|e| DriverError::NotFound {
                kind: "network",
                name: name.to_string(),
                detail: e.detail,
            })?;
        Ok(Box::new(VirshNetwork {
            virsh: Arc::clone(&self.virsh),
            name: name.to_string(),
        }))
    }

    async fn list_network_descriptions(&self) -> DriverResult<Vec<String>> {
        let names = self
            .virsh
            .run(&["net-list", "--all", "--name"])
            .await
            .map_err(|e| DriverError::List(e.detail))?;

        let mut descriptions = Vec::new();
        for name in parse_name_list(&names) {
            let xml = self
                .virsh
                .run(&["net-dumpxml", &name])
                .await
                .map_err(|e| DriverError::List(format!("{name}: {}", e.detail)))?;
            descriptions.push(xml);
        }
        debug!(count = descriptions.len(), "listed networks");
        Ok(descriptions)
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

async fn operation(
    virsh: &Virsh,
    name: &str,
    operation: &'static str,
    subcommand: &str,
) -> DriverResult<String> {
    virsh
        .run(&[subcommand, name])
        .await
        .map_err(|e| DriverError::Operation {
            name: name.to_string(),
            operation,
            detail: e.detail,
        })
}

pub(crate) struct VirshDomain {
    virsh: Arc<Virsh>,
    name: String,
}

#[async_trait]
impl VirtObject for VirshDomain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> DriverResult<()> {
        operation(&self.virsh, &self.name, "start", "start").await?;
        Ok(())
    }

    async fn destroy(&self) -> DriverResult<()> {
        operation(&self.virsh, &self.name, "destroy", "destroy").await?;
        Ok(())
    }

    async fn undefine(&self) -> DriverResult<()> {
        operation(&self.virsh, &self.name, "undefine", "undefine").await?;
        Ok(())
    }

    async fn describe(&self) -> DriverResult<String> {
        operation(&self.virsh, &self.name, "describe", "dumpxml").await
    }
}

#[async_trait]
impl DomainHandle for VirshDomain {
    async fn reboot(&self) -> DriverResult<()> {
        operation(&self.virsh, &self.name, "reboot", "reboot").await?;
        Ok(())
    }
}

pub(crate) struct VirshNetwork {
    virsh: Arc<Virsh>,
    name: String,
}

#[async_trait]
impl VirtObject for VirshNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> DriverResult<()> {
        operation(&self.virsh, &self.name, "start", "net-start").await?;
        Ok(())
    }

    async fn destroy(&self) -> DriverResult<()> {
        operation(&self.virsh, &self.name, "destroy", "net-destroy").await?;
        Ok(())
    }

    async fn undefine(&self) -> DriverResult<()> {
        operation(&self.virsh, &self.name, "undefine", "net-undefine").await?;
        Ok(())
    }

    async fn describe(&self) -> DriverResult<String> {
        operation(&self.virsh, &self.name, "describe", "net-dumpxml").await
    }
}

#[async_trait]
impl NetworkHandle for VirshNetwork {
    async fn update_dhcp_host(&self, command: DhcpCommand, host: &DhcpHost) -> DriverResult<()> {
        let args = dhcp_update_args(&self.name, command, host);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.virsh
            .run(&args)
            .await
            .map_err(|e| DriverError::Operation {
                name: self.name.clone(),
                operation: "dhcp update",
                detail: e.detail,
            })?;
        debug!(network = %self.name, %command, mac = %host.mac, ip = %host.ip, "dhcp host updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn host() -> DhcpHost {
        DhcpHost {
            mac: "52:54:00:aa:bb:cc".into(),
            name: "rft-node-0011aabb".into(),
            ip: Ipv4Addr::new(192, 168, 7, 150),
        }
    }

    #[test]
    fn connection_args_prefix_uri() {
        let args = connection_args("qemu:///system", &["net-list", "--all"]);
        assert_eq!(args, vec!["-c", "qemu:///system", "net-list", "--all"]);
    }

    #[test]
    fn dhcp_add_appends_last() {
        let args = dhcp_update_args("rft-net-1", DhcpCommand::Add, &host());
        assert_eq!(
            args,
            vec![
                "net-update",
                "rft-net-1",
                "add-last",
                "ip-dhcp-host",
                r#"<host mac="52:54:00:aa:bb:cc" name="rft-node-0011aabb" ip="192.168.7.150" />"#,
                "--current",
            ]
        );
    }

    #[test]
    fn dhcp_delete_uses_same_record() {
        let add = dhcp_update_args("n", DhcpCommand::Add, &host());
        let delete = dhcp_update_args("n", DhcpCommand::Delete, &host());
        assert_eq!(delete.get(2).map(String::as_str), Some("delete"));
        assert_eq!(add.get(4), delete.get(4));
    }

    #[test]
    fn parse_name_list_skips_blank_lines() {
        let names = parse_name_list("default\n rft-net-1 \n\n");
        assert_eq!(names, vec!["default", "rft-net-1"]);
    }

    #[test]
    fn parse_name_list_empty() {
        assert!(parse_name_list("\n").is_empty());
    }
}
