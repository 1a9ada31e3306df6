use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rft_host::{Privilege, exec_output};
use tracing::info;

use crate::config::RsyncConfig;
use crate::error::{EnvError, Result};

/// Parsed `rsyncd.conf`: module name to its `key = value` settings.
///
/// Settings before the first `[module]` header belong to the implicit
/// `global` section. Keys are lowercased, values trimmed.
#[derive(Debug, Default, PartialEq)]
pub struct RsyncdConf {
    sections: HashMap<String, HashMap<String, String>>,
}

impl RsyncdConf {
    pub fn parse(content: &str) -> Self {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current = "global".to_string();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = name.trim().to_string();
                sections.entry(current.clone()).or_default();
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                sections
                    .entry(current.clone())
                    .or_default()
                    .insert(key.trim().to_lowercase(), value.trim().to_string());
            }
        }
        Self { sections }
    }

    pub fn has_module(&self, module: &str) -> bool {
        self.sections.contains_key(module)
    }

    pub fn get(&self, module: &str, key: &str) -> Option<&str> {
        self.sections.get(module)?.get(key).map(String::as_str)
    }
}

/// Verify the rsync daemon serves `config.module` and return the module's path.
pub async fn check_rsync(config: &RsyncConfig) -> Result<PathBuf> {
    if config.check_daemon {
        let output = exec_output("pgrep", &["-x", "rsync"], Privilege::User)
            .await
            .map_err(|source| EnvError::HostCommand {
                operation: "look up rsync daemon",
                source,
            })?;
        if output.code != Some(0) {
            return Err(EnvError::RsyncNotRunning);
        }
    }
    let path = module_path(&config.config_path, &config.module).await?;
    info!(module = %config.module, path = %path.display(), "rsync module found");
    Ok(path)
}

async fn module_path(config_path: &Path, module: &str) -> Result<PathBuf> {
    let content = match tokio::fs::read_to_string(config_path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EnvError::RsyncConfigNotFound {
                path: config_path.to_path_buf(),
            });
        }
        Err(e) => return Err(EnvError::io("read", config_path)(e)),
    };
    let conf = RsyncdConf::parse(&content);
    if !conf.has_module(module) {
        return Err(EnvError::RsyncSectionNotFound {
            path: config_path.to_path_buf(),
            section: module.to_string(),
        });
    }
    conf.get(module, "path").map(PathBuf::from).ok_or_else(|| {
        EnvError::Config(format!(
            "rsync module [{module}] in {} has no path",
            config_path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONF: &str = "\
uid = nobody
gid = nogroup
# comment
use chroot = yes

[ironic_rsync]
  path = /srv/rsync
  Read Only = yes
; another comment
[other]
path=/srv/other
";

    #[test]
    fn parse_sections_and_global() {
        let conf = RsyncdConf::parse(CONF);
        assert_eq!(conf.get("global", "uid"), Some("nobody"));
        assert_eq!(conf.get("global", "use chroot"), Some("yes"));
        assert_eq!(conf.get("ironic_rsync", "path"), Some("/srv/rsync"));
        assert_eq!(conf.get("ironic_rsync", "read only"), Some("yes"));
        assert_eq!(conf.get("other", "path"), Some("/srv/other"));
        assert!(conf.has_module("other"));
        assert!(!conf.has_module("missing"));
    }

    #[test]
    fn empty_section_is_known() {
        let conf = RsyncdConf::parse("[empty]\n");
        assert!(conf.has_module("empty"));
        assert_eq!(conf.get("empty", "path"), None);
    }

    fn config(path: PathBuf) -> RsyncConfig {
        RsyncConfig {
            config_path: path,
            module: "ironic_rsync".into(),
            check_daemon: false,
        }
    }

    #[tokio::test]
    async fn module_path_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rsyncd.conf");
        tokio::fs::write(&path, CONF).await.unwrap();
        assert_eq!(check_rsync(&config(path)).await.unwrap(), PathBuf::from("/srv/rsync"));
    }

    #[tokio::test]
    async fn missing_config_file() {
        let err = check_rsync(&config(PathBuf::from("/nonexistent/rsyncd.conf")))
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::RsyncConfigNotFound { .. }));
    }

    #[tokio::test]
    async fn missing_module() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rsyncd.conf");
        tokio::fs::write(&path, "[other]\npath = /srv\n").await.unwrap();
        let err = check_rsync(&config(path)).await.unwrap_err();
        assert!(
            matches!(err, EnvError::RsyncSectionNotFound { ref section, .. } if section == "ironic_rsync")
        );
    }
}
