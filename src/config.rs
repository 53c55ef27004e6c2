use anyhow::{bail, Context};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::fmt::Display;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Client => write!(f, "client"),
            Mode::Server => write!(f, "server"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,

    pub link: LinkConfig,

    // overlay network to allocate from, server only (CIDR)
    pub network: Option<String>,

    // divert the host default route through the tunnel, client only
    #[serde(default = "default_set_default_gateway")]
    pub set_default_gateway: bool,

    #[serde(default)]
    pub rewriters: Vec<RewriterConfig>,

    #[serde(default)]
    pub addons: Vec<AddonConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_class")]
    pub class: String,

    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            class: default_device_class(),
            mtu: default_mtu(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    // transport: "udp" or "tcp"
    pub class: String,

    pub port: u16,

    // server address to connect to, client only
    pub host: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewriterConfig {
    pub class: String,

    // dns: nameserver queries are diverted to
    pub force_nameserver: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddonConfig {
    pub class: String,

    // resolver_dir: nameservers written into the per-TLD resolver files
    #[serde(default)]
    pub nameservers: Vec<Ipv4Addr>,

    // resolver_dir: directory to swap, defaults to /etc/resolver
    pub resolver_dir: Option<String>,

    // resolver_dir: local TLD list; fetched from tlds_url when absent
    pub tlds_file: Option<String>,
    pub tlds_url: Option<String>,

    // local_nameserver: bind address and upstream resolver
    pub listen: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

fn default_set_default_gateway() -> bool {
    true
}

fn default_device_class() -> String {
    "tun".to_string()
}

fn default_mtu() -> u16 {
    1500
}

pub fn load(path: &str, mode: Mode) -> anyhow::Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("cannot read config file {}", path))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("cannot parse config file {}", path))?;
    config.validate(mode)?;
    Ok(config)
}

impl Config {
    /// Validates everything that must be known before any resource is
    /// touched; all failures here abort startup.
    pub fn validate(&self, mode: Mode) -> anyhow::Result<()> {
        if self.device.class != "tun" {
            bail!("unknown device class: {}", self.device.class);
        }
        if self.link.class != "udp" && self.link.class != "tcp" {
            bail!("unknown link class: {}", self.link.class);
        }
        if self.link.port == 0 {
            bail!("link port must be non-zero");
        }
        if mode == Mode::Client && self.link.host.is_none() {
            bail!("client configuration requires link.host");
        }
        if mode == Mode::Server {
            self.overlay_network()
                .context("server configuration requires a valid CIDR network")?;
        }
        for rewriter in &self.rewriters {
            crate::rewrite::build_rewriter(rewriter)
                .map_err(|e| anyhow::anyhow!("{}", e))?;
        }
        for addon in &self.addons {
            crate::addon::check_class(&addon.class)
                .map_err(|e| anyhow::anyhow!("{}", e))?;
        }
        Ok(())
    }

    pub fn overlay_network(&self) -> anyhow::Result<Ipv4Net> {
        let network = match &self.network {
            Some(network) => network,
            None => bail!("no network configured"),
        };
        network
            .parse()
            .with_context(|| format!("invalid network {}", network))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_client_config() {
        let config: Config = toml::from_str(
            r#"
            [link]
            class = "udp"
            port = 8000
            host = "198.51.100.7"
            "#,
        )
        .unwrap();
        config.validate(Mode::Client).unwrap();
        assert!(config.set_default_gateway);
        assert_eq!(config.device.mtu, 1500);
    }

    #[test]
    fn server_requires_a_network() {
        let config: Config = toml::from_str(
            r#"
            [link]
            class = "udp"
            port = 8000
            "#,
        )
        .unwrap();
        assert!(config.validate(Mode::Server).is_err());

        let config: Config = toml::from_str(
            r#"
            network = "10.48.0.0/24"
            [link]
            class = "udp"
            port = 8000
            "#,
        )
        .unwrap();
        config.validate(Mode::Server).unwrap();
    }

    #[test]
    fn unknown_classes_fail_validation() {
        let config: Config = toml::from_str(
            r#"
            [link]
            class = "carrier-pigeon"
            port = 8000
            host = "example.org"
            "#,
        )
        .unwrap();
        assert!(config.validate(Mode::Client).is_err());

        let config: Config = toml::from_str(
            r#"
            [link]
            class = "udp"
            port = 8000
            host = "example.org"

            [[addons]]
            class = "no-such-addon"
            "#,
        )
        .unwrap();
        assert!(config.validate(Mode::Client).is_err());
    }

    #[test]
    fn zero_port_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [link]
            class = "tcp"
            port = 0
            host = "example.org"
            "#,
        )
        .unwrap();
        assert!(config.validate(Mode::Client).is_err());
    }
}
