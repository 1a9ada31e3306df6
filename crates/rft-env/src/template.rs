use std::collections::HashMap;
use std::error::Error as _;
use std::path::{Path, PathBuf};

use rft_host::{Privilege, exec_blocking};
use tera::{Context, Tera, Value};
use tracing::{debug, info};

use crate::error::{EnvError, Result};
use crate::ids;
use crate::paths::SuitePaths;

/// Template of the suite network definition.
pub const NETWORK_TEMPLATE: &str = "network.xml";
/// Template of the per-node pxelinux configuration.
pub const PXE_TEMPLATE: &str = "pxe_config";

const BUNDLED: [(&str, &str); 2] = [
    (NETWORK_TEMPLATE, include_str!("../templates/network.xml")),
    (PXE_TEMPLATE, include_str!("../templates/pxe_config")),
];

/// Renders named templates with a JSON object of variables.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, name: &str, variables: &serde_json::Value) -> Result<String>;
}

/// [`TemplateRenderer`] backed by Tera.
///
/// Templates are looked up in the configured directories in order, then in
/// the bundled set. Output is never HTML-escaped since every template here
/// produces XML or plain config text.
pub struct TeraRenderer {
    tera: Tera,
}

impl TeraRenderer {
    pub fn new(dirs: &[PathBuf], paths: SuitePaths) -> Result<Self> {
        let mut tera = Tera::default();
        for dir in dirs {
            let loaded = load_dir(dir)?;
            // extend() keeps existing names, so earlier directories win.
            tera.extend(&loaded).map_err(|e| template_error(&dir.display().to_string(), &e))?;
        }
        let mut bundled = Tera::default();
        bundled
            .add_raw_templates(BUNDLED)
            .map_err(|e| template_error("bundled", &e))?;
        tera.extend(&bundled).map_err(|e| template_error("bundled", &e))?;
        tera.autoescape_on(vec![]);
        register_functions(&mut tera, paths);

        info!(
            dirs = dirs.len(),
            templates = tera.get_template_names().count(),
            "templates loaded"
        );
        Ok(Self { tera })
    }
}

impl TemplateRenderer for TeraRenderer {
    fn render(&self, name: &str, variables: &serde_json::Value) -> Result<String> {
        debug!(template = name, "rendering");
        let context = Context::from_value(variables.clone()).map_err(|e| template_error(name, &e))?;
        self.tera
            .render(name, &context)
            .map_err(|e| template_error(name, &e))
    }
}

fn load_dir(dir: &Path) -> Result<Tera> {
    if !dir.is_dir() {
        return Err(EnvError::Template {
            name: dir.display().to_string(),
            detail: "template directory not found".to_string(),
        });
    }
    let glob = format!("{}/**/*", dir.display());
    Tera::new(&glob).map_err(|e| template_error(&dir.display().to_string(), &e))
}

/// Tera hides the useful part of an error in its source chain.
fn template_error(name: &str, err: &tera::Error) -> EnvError {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        detail.push_str(": ");
        detail.push_str(&e.to_string());
        source = e.source();
    }
    EnvError::Template {
        name: name.to_string(),
        detail,
    }
}

// ---------------------------------------------------------------------------
// Template functions
// ---------------------------------------------------------------------------

fn register_functions(tera: &mut Tera, paths: SuitePaths) {
    let empty_paths = paths.clone();
    tera.register_function(
        "create_empty_disk",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let node = string_arg(args, "create_empty_disk", "node_name")?;
            let disk = string_arg(args, "create_empty_disk", "disk_name")?;
            let size = string_arg(args, "create_empty_disk", "size")?;
            create_empty_disk(&empty_paths, &node, &disk, &size)
                .map(path_value)
                .map_err(tera::Error::msg)
        },
    );
    tera.register_function(
        "create_disk_from_base",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let node = string_arg(args, "create_disk_from_base", "node_name")?;
            let disk = string_arg(args, "create_disk_from_base", "disk_name")?;
            let base = string_arg(args, "create_disk_from_base", "base_image_path")?;
            create_disk_from_base(&paths, &node, &disk, Path::new(&base))
                .map(path_value)
                .map_err(tera::Error::msg)
        },
    );
    tera.register_function("random_mac", |_: &HashMap<String, Value>| -> tera::Result<Value> {
        Ok(Value::String(ids::random_mac()))
    });
}

fn string_arg(args: &HashMap<String, Value>, function: &str, key: &str) -> tera::Result<String> {
    match args.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(tera::Error::msg(format!(
            "{function}: missing argument '{key}'"
        ))),
    }
}

fn path_value(path: PathBuf) -> Value {
    Value::String(path.display().to_string())
}

fn prepare_disk_path(paths: &SuitePaths, node: &str, disk: &str) -> std::result::Result<PathBuf, String> {
    let dir = paths.disks_dir(node);
    std::fs::create_dir_all(&dir).map_err(|e| format!("create {}: {e}", dir.display()))?;
    Ok(paths.disk(node, disk))
}

/// Sparse raw image of `size` (any size `qemu-img` accepts, e.g. `10G`).
fn create_empty_disk(
    paths: &SuitePaths,
    node: &str,
    disk: &str,
    size: &str,
) -> std::result::Result<PathBuf, String> {
    let path = prepare_disk_path(paths, node, disk)?;
    let target = path.display().to_string();
    exec_blocking("qemu-img", &["create", "-f", "raw", &target, size], Privilege::User)
        .map_err(|e| e.to_string())?;
    info!(node, disk, size, path = %path.display(), "empty disk created");
    Ok(path)
}

/// Private copy of a base image for one node.
fn create_disk_from_base(
    paths: &SuitePaths,
    node: &str,
    disk: &str,
    base: &Path,
) -> std::result::Result<PathBuf, String> {
    let path = prepare_disk_path(paths, node, disk)?;
    std::fs::copy(base, &path).map_err(|e| format!("copy {}: {e}", base.display()))?;
    info!(node, disk, base = %base.display(), "disk created from base");
    Ok(path)
}
