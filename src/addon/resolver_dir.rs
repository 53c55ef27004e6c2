//! Resolver-directory override
//!
//! Writes a `nameserver <ip>` file per top-level domain into a fresh
//! temporary directory and atomically swaps the OS resolver directory with
//! a symlink to it, preserving any original directory by rename. Cleanup
//! reverses all of it best-effort.

use crate::addon::tld;
use crate::addon::{Addon, AddonRegistration, SessionInfo};
use crate::config::AddonConfig;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const DEFAULT_RESOLVER_DIR: &str = "/etc/resolver";

pub struct ResolverDirAddon {
    nameservers: Vec<Ipv4Addr>,
    resolver_path: PathBuf,
    tlds_file: Option<PathBuf>,
    tlds_url: String,
    tlds: Vec<String>,
    tmp_dir: Option<PathBuf>,
    original_dir: Option<PathBuf>,
    linked: bool,
}

impl ResolverDirAddon {
    pub fn new(config: &AddonConfig) -> Self {
        ResolverDirAddon {
            nameservers: config.nameservers.clone(),
            resolver_path: config
                .resolver_dir
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RESOLVER_DIR)),
            tlds_file: config.tlds_file.clone().map(PathBuf::from),
            tlds_url: config
                .tlds_url
                .clone()
                .unwrap_or_else(|| tld::DEFAULT_TLDS_URL.to_string()),
            tlds: Vec::new(),
            tmp_dir: None,
            original_dir: None,
            linked: false,
        }
    }

    fn install(&mut self, nameservers: &[Ipv4Addr]) -> crate::Result<()> {
        let mut content = String::new();
        for nameserver in nameservers {
            content.push_str(&format!("nameserver {}\n", nameserver));
        }

        let tmp = std::env::temp_dir().join(format!("resolver-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&tmp)?;
        for tld in &self.tlds {
            fs::write(tmp.join(tld), &content)?;
        }
        self.tmp_dir = Some(tmp.clone());

        if self.resolver_path.is_dir() && !self.resolver_path.is_symlink() {
            let epoch = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let original = self
                .resolver_path
                .with_file_name(format!("{}_{}", self.dir_name(), epoch));
            fs::rename(&self.resolver_path, &original)?;
            self.original_dir = Some(original);
        }

        symlink_dir(&tmp, &self.resolver_path)?;
        self.linked = true;
        tracing::info!(
            "resolver directory {} now points at {} ({} TLDs)",
            self.resolver_path.display(),
            tmp.display(),
            self.tlds.len()
        );
        Ok(())
    }

    fn dir_name(&self) -> String {
        self.resolver_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "resolver".to_string())
    }
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> crate::Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn symlink_dir(_target: &Path, _link: &Path) -> crate::Result<()> {
    Err("resolver directory override is not supported on this platform".into())
}

impl Addon for ResolverDirAddon {
    fn name(&self) -> &str {
        "resolver_dir"
    }

    fn setup(&mut self, _reg: &mut AddonRegistration) -> crate::Result<()> {
        self.tlds = match &self.tlds_file {
            Some(path) => tld::load_tlds(path)?,
            None => tld::fetch_tlds(&self.tlds_url)?,
        };
        if self.tlds.is_empty() {
            return Err("TLD list is empty".into());
        }
        Ok(())
    }

    fn on_session_established(&mut self, info: &SessionInfo) -> crate::Result<()> {
        // with no explicit nameservers, resolve through the tunnel
        let nameservers = if self.nameservers.is_empty() {
            vec![info.server_ip]
        } else {
            self.nameservers.clone()
        };
        self.install(&nameservers)
    }

    fn cleanup(&mut self) {
        if self.linked {
            if let Err(e) = fs::remove_file(&self.resolver_path) {
                tracing::warn!(
                    "cannot unlink {}: {}",
                    self.resolver_path.display(),
                    e
                );
            }
            self.linked = false;
        }

        if let Some(tmp) = self.tmp_dir.take() {
            if let Err(e) = fs::remove_dir_all(&tmp) {
                tracing::warn!("cannot remove {}: {}", tmp.display(), e);
            }
        }

        if let Some(original) = self.original_dir.take() {
            if let Err(e) = fs::rename(&original, &self.resolver_path) {
                tracing::warn!(
                    "cannot restore {} from {}: {}",
                    self.resolver_path.display(),
                    original.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;

    fn addon_config(resolver_dir: &Path, tlds_file: &Path) -> AddonConfig {
        AddonConfig {
            class: "resolver_dir".to_string(),
            nameservers: vec!["10.48.0.1".parse().unwrap()],
            resolver_dir: Some(resolver_dir.to_string_lossy().into_owned()),
            tlds_file: Some(tlds_file.to_string_lossy().into_owned()),
            tlds_url: None,
            listen: None,
            remote: None,
        }
    }

    fn info() -> SessionInfo {
        SessionInfo {
            mode: Mode::Client,
            server_ip: "10.48.0.1".parse().unwrap(),
            client_ip: "10.48.0.2".parse().unwrap(),
        }
    }

    #[test]
    fn swaps_and_restores_the_resolver_directory() {
        let root = tempfile::tempdir().unwrap();
        let resolver = root.path().join("resolver");
        fs::create_dir(&resolver).unwrap();
        fs::write(resolver.join("marker"), "original").unwrap();

        let tlds_file = root.path().join("tlds.txt");
        fs::write(&tlds_file, "com\nnet\n").unwrap();

        let mut addon = ResolverDirAddon::new(&addon_config(&resolver, &tlds_file));
        let mut reg = AddonRegistration::default();
        addon.setup(&mut reg).unwrap();
        addon.on_session_established(&info()).unwrap();

        assert!(resolver.is_symlink());
        assert_eq!(
            fs::read_to_string(resolver.join("com")).unwrap(),
            "nameserver 10.48.0.1\n"
        );
        assert!(resolver.join("net").exists());

        addon.cleanup();
        assert!(!resolver.is_symlink());
        assert_eq!(
            fs::read_to_string(resolver.join("marker")).unwrap(),
            "original"
        );
    }

    #[test]
    fn works_without_a_preexisting_directory() {
        let root = tempfile::tempdir().unwrap();
        let resolver = root.path().join("resolver");

        let tlds_file = root.path().join("tlds.txt");
        fs::write(&tlds_file, "org\n").unwrap();

        let mut addon = ResolverDirAddon::new(&addon_config(&resolver, &tlds_file));
        let mut reg = AddonRegistration::default();
        addon.setup(&mut reg).unwrap();
        addon.on_session_established(&info()).unwrap();
        assert!(resolver.join("org").exists());

        addon.cleanup();
        assert!(!resolver.exists());
    }

    #[test]
    fn empty_tld_list_fails_setup() {
        let root = tempfile::tempdir().unwrap();
        let tlds_file = root.path().join("tlds.txt");
        fs::write(&tlds_file, "# nothing\n").unwrap();

        let mut addon =
            ResolverDirAddon::new(&addon_config(&root.path().join("resolver"), &tlds_file));
        let mut reg = AddonRegistration::default();
        assert!(addon.setup(&mut reg).is_err());
    }
}
