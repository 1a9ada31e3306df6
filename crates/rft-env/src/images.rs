use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rft_host::{Privilege, exec, exec_ignore_errors};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::{EnvError, Result};

/// How the guest fetches tenant images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// HTTP download from the stub server.
    Swift,
    /// rsync from a loop-mounted copy of the image.
    Rsync,
}

impl FromStr for ImageSource {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "swift" => Ok(Self::Swift),
            "rsync" => Ok(Self::Rsync),
            other => Err(EnvError::UnknownImageSource {
                name: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Swift => f.write_str("swift"),
            Self::Rsync => f.write_str("rsync"),
        }
    }
}

/// Which images a test deploys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSelector {
    /// The stub server's placeholder image.
    Stub,
    /// Tenant images by file name, in deploy order.
    Named(Vec<String>),
}

/// An image name with the URL the guest pulls it from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub name: String,
    pub url: String,
}

/// Services on the network gateway that guests reach for images.
#[derive(Debug, Clone)]
pub struct ImageEndpoint {
    gateway: Ipv4Addr,
    port: u16,
    rsync_module: String,
}

impl ImageEndpoint {
    pub fn new(gateway: Ipv4Addr, port: u16, rsync_module: impl Into<String>) -> Self {
        Self {
            gateway,
            port,
            rsync_module: rsync_module.into(),
        }
    }

    /// Base URL of the stub server.
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.gateway, self.port)
    }

    pub fn stub_url(&self) -> String {
        format!("{}/fake", self.api_url())
    }

    pub fn swift_url(&self, image: &str) -> String {
        format!("{}/tenant_images/{image}", self.api_url())
    }

    pub fn rsync_url(&self, image: &str) -> String {
        format!("{}::{}/{image}/", self.gateway, self.rsync_module)
    }
}

// ---------------------------------------------------------------------------
// Mount slot
// ---------------------------------------------------------------------------

/// File that must exist inside a mounted tenant image.
const IMAGE_MARKER: &str = "etc/passwd";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedImage {
    pub image: String,
    pub mount_point: PathBuf,
}

/// The one read-only image mount the rsync source may hold at a time.
///
/// Tests that need two different mounted images at once are not supported.
#[derive(Debug)]
pub struct ImageSlot {
    mounted: Option<MountedImage>,
    privilege: Privilege,
}

impl ImageSlot {
    pub fn new(privilege: Privilege) -> Self {
        Self {
            mounted: None,
            privilege,
        }
    }

    pub fn mounted(&self) -> Option<&MountedImage> {
        self.mounted.as_ref()
    }

    pub fn is_occupied(&self) -> bool {
        self.mounted.is_some()
    }

    /// Loop-mount `image_path` read-only at `mount_point`.
    ///
    /// The slot is occupied as soon as the mount succeeds, so a failed
    /// content check is still undone by [`release`](Self::release).
    pub async fn mount(&mut self, image: &str, image_path: &Path, mount_point: &Path) -> Result<()> {
        if let Some(current) = &self.mounted {
            return Err(EnvError::ImageSlotBusy {
                mounted: current.image.clone(),
                requested: image.to_string(),
            });
        }
        if !image_path.is_file() {
            return Err(EnvError::ImageNotFound {
                path: image_path.to_path_buf(),
            });
        }
        tokio::fs::create_dir_all(mount_point)
            .await
            .map_err(EnvError::io("create", mount_point))?;

        let src = image_path.display().to_string();
        let dst = mount_point.display().to_string();
        if let Err(e) = exec("mount", &["-o", "loop,ro", &src, &dst], self.privilege).await {
            exec_ignore_errors("rmdir", &[&dst], Privilege::User).await;
            return Err(EnvError::ImageMount {
                image: image.to_string(),
                detail: e.to_string(),
            });
        }
        self.mounted = Some(MountedImage {
            image: image.to_string(),
            mount_point: mount_point.to_path_buf(),
        });

        if !mount_point.join(IMAGE_MARKER).exists() {
            return Err(EnvError::ImageMount {
                image: image.to_string(),
                detail: format!("{IMAGE_MARKER} missing under {dst}"),
            });
        }
        info!(image, mount_point = %dst, "image mounted");
        Ok(())
    }

    /// Unmount and remove the mount point. No-op when the slot is empty.
    ///
    /// The slot is emptied even when unmounting fails.
    pub async fn release(&mut self) -> Result<()> {
        let Some(mounted) = self.mounted.take() else {
            return Ok(());
        };
        if !mounted.mount_point.exists() {
            return Err(EnvError::MountedImageNotPresent {
                mount_point: mounted.mount_point,
            });
        }
        let dst = mounted.mount_point.display().to_string();
        exec("umount", &[&dst], self.privilege)
            .await
            .map_err(|source| EnvError::HostCommand {
                operation: "unmount image",
                source,
            })?;
        if let Err(e) = tokio::fs::remove_dir(&mounted.mount_point).await {
            warn!(mount_point = %dst, error = %e, "mount point not removed");
        }
        info!(image = %mounted.image, mount_point = %dst, "image released");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Deploy configuration
// ---------------------------------------------------------------------------

/// Write each resolved URL into `images[i].image_pull_url` of the deploy
/// configuration, appending `{name, image_pull_url}` entries where the
/// configuration lists fewer images.
pub fn inject_image_urls(deploy_config: &mut Value, resolved: &[ResolvedImage]) -> Result<()> {
    let config = deploy_config
        .as_object_mut()
        .ok_or_else(|| EnvError::Config("deploy configuration must be a JSON object".into()))?;
    let images = config
        .entry("images")
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| EnvError::Config("deploy configuration 'images' must be an array".into()))?;

    for (i, image) in resolved.iter().enumerate() {
        match images.get_mut(i) {
            Some(Value::Object(entry)) => {
                entry.insert("image_pull_url".into(), Value::String(image.url.clone()));
            }
            Some(_) => {
                return Err(EnvError::Config(format!(
                    "deploy configuration images[{i}] must be an object"
                )));
            }
            None => images.push(json!({
                "name": image.name,
                "image_pull_url": image.url,
            })),
        }
    }
    Ok(())
}
