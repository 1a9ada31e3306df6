use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{EnvError, Result};

/// Where distributions install the BIOS pxelinux bootloader.
pub const PXELINUX_LOCATIONS: &[&str] = &[
    "/usr/lib/PXELINUX/pxelinux.0",
    "/usr/share/syslinux/pxelinux.0",
    "/usr/lib/syslinux/pxelinux.0",
    "/usr/lib/syslinux/bios/pxelinux.0",
];

/// Syslinux 5+ loads this module from the TFTP root right after pxelinux.0.
const LDLINUX: &str = "ldlinux.c32";

/// The configured bootloader, or the first of `candidates` that exists.
pub fn find_pxelinux<P: AsRef<Path>>(configured: Option<&Path>, candidates: &[P]) -> Result<PathBuf> {
    if let Some(path) = configured {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(EnvError::PxeLinuxNotFound)
        };
    }
    candidates
        .iter()
        .map(AsRef::<Path>::as_ref)
        .find(|p| p.is_file())
        .map(Path::to_path_buf)
        .ok_or(EnvError::PxeLinuxNotFound)
}

/// Files copied into the TFTP root: bootloader (plus `ldlinux.c32` when it
/// sits next to it), kernel and ramdisk.
pub fn boot_files(pxelinux: &Path, kernel: &Path, ramdisk: &Path) -> Vec<PathBuf> {
    let mut files = vec![pxelinux.to_path_buf()];
    if let Some(ldlinux) = pxelinux.parent().map(|dir| dir.join(LDLINUX))
        && ldlinux.is_file()
    {
        files.push(ldlinux);
    }
    files.push(kernel.to_path_buf());
    files.push(ramdisk.to_path_buf());
    files
}

/// Copy `files` into `tftp_root` under their own file names.
pub async fn populate_tftp_root(tftp_root: &Path, files: &[PathBuf]) -> Result<()> {
    tokio::fs::create_dir_all(tftp_root)
        .await
        .map_err(EnvError::io("create", tftp_root))?;
    for src in files {
        let Some(file_name) = src.file_name() else {
            return Err(EnvError::Config(format!("not a file path: {}", src.display())));
        };
        let dst = tftp_root.join(file_name);
        tokio::fs::copy(src, &dst)
            .await
            .map_err(EnvError::io("copy boot file", src))?;
        debug!(src = %src.display(), dst = %dst.display(), "boot file copied");
    }
    info!(tftp_root = %tftp_root.display(), files = files.len(), "PXE boot files in place");
    Ok(())
}

/// Write a node's pxelinux config to `path`, creating `pxelinux.cfg/` as needed.
pub async fn write_pxe_config(path: &Path, contents: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(EnvError::io("create", dir))?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(EnvError::io("write", path))?;
    debug!(path = %path.display(), "PXE config written");
    Ok(())
}
