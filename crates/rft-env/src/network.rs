//! The suite's isolated libvirt network and its DHCP reservation table.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand::Rng;
use rft_driver::{DhcpCommand, DhcpHost, NetworkHandle, VirtDriver};
use serde_json::json;
use tracing::info;

use crate::allocator;
use crate::cleanup::CleanupReport;
use crate::config::NetworkConfig;
use crate::error::{EnvError, Result};
use crate::ids;
use crate::lifecycle::{Lifecycle, kill_object};
use crate::node::GuestNode;
use crate::template::{NETWORK_TEMPLATE, TemplateRenderer};

pub struct VirtualNetwork {
    name: String,
    bridge: String,
    /// First three octets; the gateway is `.1`.
    prefix: [u8; 3],
    range_start: u8,
    range_end: u8,
    tftp_root: PathBuf,
    /// Keyed by MAC. Values are exactly what was sent with the add update.
    reservations: HashMap<String, DhcpHost>,
    handle: Box<dyn NetworkHandle>,
}

impl std::fmt::Debug for VirtualNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualNetwork")
            .field("name", &self.name)
            .field("gateway", &self.gateway())
            .field("reservations", &self.reservations.len())
            .finish_non_exhaustive()
    }
}

impl VirtualNetwork {
    /// Allocate a free /24 under `config.head`, render the network
    /// definition and define it. The network is not started.
    pub async fn create(
        driver: &dyn VirtDriver,
        renderer: &dyn TemplateRenderer,
        config: &NetworkConfig,
        tftp_root: PathBuf,
    ) -> Result<Self> {
        let [h1, h2] = config.head_octets()?;
        let name = ids::generate_name("net");
        let bridge = ids::generate_name("br");
        let octet = allocator::allocate(driver, &config.head).await?;
        let prefix = [h1, h2, octet];

        tokio::fs::create_dir_all(&tftp_root)
            .await
            .map_err(EnvError::io("create", &tftp_root))?;

        let host = |last: u8| Ipv4Addr::new(h1, h2, octet, last).to_string();
        let xml = renderer.render(
            NETWORK_TEMPLATE,
            &json!({
                "name": name,
                "bridge": bridge,
                "address": host(1),
                "tftp_root": tftp_root.display().to_string(),
                "range_start": host(config.range_start),
                "range_end": host(config.range_end),
            }),
        )?;

        driver
            .define_network(&xml)
            .await
            .map_err(EnvError::driver("define network", &name))?;
        let handle = driver
            .lookup_network(&name)
            .await
            .map_err(EnvError::driver("look up network", &name))?;

        info!(network = %name, bridge = %bridge, gateway = %host(1), "network defined");
        Ok(Self {
            name,
            bridge,
            prefix,
            range_start: config.range_start,
            range_end: config.range_end,
            tftp_root,
            reservations: HashMap::new(),
            handle,
        })
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.address(1)
    }

    pub fn tftp_root(&self) -> &Path {
        &self.tftp_root
    }

    pub fn reservations(&self) -> &HashMap<String, DhcpHost> {
        &self.reservations
    }

    fn address(&self, last: u8) -> Ipv4Addr {
        let [a, b, c] = self.prefix;
        Ipv4Addr::new(a, b, c, last)
    }

    /// A random address from the DHCP range, both ends included.
    ///
    /// Nothing checks it against addresses already handed out, so two
    /// attached nodes can collide.
    pub fn random_ip(&self) -> Ipv4Addr {
        let last = rand::thread_rng().gen_range(self.range_start..=self.range_end);
        self.address(last)
    }

    /// Reserve a random address for `node`'s MAC and record it on the node.
    pub async fn add_node(&mut self, node: &mut GuestNode) -> Result<Ipv4Addr> {
        if let Some(ip) = node.ip() {
            return Err(EnvError::NodeAlreadyAttached {
                node: node.name().to_string(),
                ip: ip.to_string(),
            });
        }
        if let Some(existing) = self.reservations.get(node.mac()) {
            return Err(EnvError::NodeAlreadyAttached {
                node: existing.name.clone(),
                ip: existing.ip.to_string(),
            });
        }

        info!(node = %node.name(), network = %self.name, "adding node to network");
        let host = DhcpHost {
            mac: node.mac().to_string(),
            name: node.name().to_string(),
            ip: self.random_ip(),
        };
        self.handle
            .update_dhcp_host(DhcpCommand::Add, &host)
            .await
            .map_err(EnvError::driver("add DHCP host to", &self.name))?;

        let ip = host.ip;
        self.reservations.insert(host.mac.clone(), host);
        node.attach(ip);
        info!(node = %node.name(), ip = %ip, "node attached");
        Ok(ip)
    }

    /// Drop `node`'s reservation, sending the same record that was added.
    pub async fn remove_node(&mut self, node: &mut GuestNode) -> Result<()> {
        let Some(host) = self.reservations.get(node.mac()) else {
            return Err(EnvError::ReservationNotFound {
                network: self.name.clone(),
                node: node.name().to_string(),
                mac: node.mac().to_string(),
            });
        };

        info!(node = %node.name(), network = %self.name, "removing node from network");
        self.handle
            .update_dhcp_host(DhcpCommand::Delete, host)
            .await
            .map_err(EnvError::driver("delete DHCP host from", &self.name))?;

        self.reservations.remove(node.mac());
        node.detach();
        Ok(())
    }
}

#[async_trait]
impl Lifecycle for VirtualNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        info!(network = %self.name, "starting network");
        self.handle
            .start()
            .await
            .map_err(EnvError::driver("start network", &self.name))
    }

    async fn stop(&self) -> Result<()> {
        info!(network = %self.name, "stopping network");
        self.handle
            .destroy()
            .await
            .map_err(EnvError::driver("stop network", &self.name))
    }

    async fn kill(&self) -> CleanupReport {
        info!(network = %self.name, "killing network");
        kill_object(self.handle.as_ref()).await
    }
}
