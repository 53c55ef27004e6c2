//! Host routing table and interface manipulation
//!
//! Wraps the platform commands (`ip` on Linux, `route`/`ifconfig` on macOS)
//! and keeps track of every route added so that teardown can remove exactly
//! those and nothing else.

use crate::utils::{run_os_command, run_os_command_output};
use std::net::{IpAddr, Ipv4Addr};

/// One host route, in the shape the platform commands accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination in CIDR notation (host routes as /32)
    pub dest: String,
    /// Next-hop gateway address
    pub gateway: String,
    /// Interface to pin the route to, where the platform supports it
    pub device: Option<String>,
}

/// The three routes that divert the default route through the tunnel
/// without overwriting it: the peer's public address stays pinned to the
/// prior default gateway, and the two /1 routes cover the full address
/// space through the overlay.
pub fn diversion_routes(
    peer_public_ip: IpAddr,
    peer_overlay_ip: Ipv4Addr,
    tun_ifname: &str,
    prior_gateway: &str,
    prior_ifname: &str,
) -> Vec<Route> {
    vec![
        Route {
            dest: format!("{}/32", peer_public_ip),
            gateway: prior_gateway.to_string(),
            device: Some(prior_ifname.to_string()),
        },
        Route {
            dest: "0.0.0.0/1".to_string(),
            gateway: peer_overlay_ip.to_string(),
            device: Some(tun_ifname.to_string()),
        },
        Route {
            dest: "128.0.0.0/1".to_string(),
            gateway: peer_overlay_ip.to_string(),
            device: Some(tun_ifname.to_string()),
        },
    ]
}

/// Tracks the host-level state one session installs
pub struct HostNetwork {
    added: Vec<Route>,
}

impl HostNetwork {
    pub fn new() -> Self {
        HostNetwork { added: Vec::new() }
    }

    pub fn added_routes(&self) -> &[Route] {
        &self.added
    }

    /// Adds a route and records it for rollback; only successfully added
    /// routes are recorded, so restoration removes exactly what exists.
    pub fn add_route(&mut self, route: Route) -> crate::Result<()> {
        Self::modify_route(&route, "add")?;
        self.added.push(route);
        Ok(())
    }

    /// Removes every recorded route, continuing past individual failures
    pub fn restore_routes(&mut self) {
        for route in self.added.drain(..) {
            if let Err(e) = Self::modify_route(&route, "del") {
                tracing::warn!("failed to remove route {}: {}", route.dest, e);
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn modify_route(route: &Route, operation: &str) -> crate::Result<()> {
        let mut args = vec!["route", operation, route.dest.as_str(), "via", route.gateway.as_str()];
        if let Some(device) = &route.device {
            args.push("dev");
            args.push(device);
        }
        run_os_command("ip", &args)
    }

    #[cfg(target_os = "macos")]
    fn modify_route(route: &Route, operation: &str) -> crate::Result<()> {
        let operation = if operation == "del" { "delete" } else { operation };
        run_os_command(
            "route",
            &["-n", operation, "-net", route.dest.as_str(), route.gateway.as_str()],
        )
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn modify_route(_route: &Route, _operation: &str) -> crate::Result<()> {
        Err("route management is not supported on this platform".into())
    }

    /// Snapshot of the current default route as (gateway, interface)
    #[cfg(target_os = "linux")]
    pub fn default_route() -> crate::Result<(String, String)> {
        // "default via 192.168.1.1 dev eth0 proto dhcp ..."
        let out = run_os_command_output("ip", &["route", "show", "default"])?;
        let fields: Vec<&str> = out.split_whitespace().collect();
        let gateway = fields
            .iter()
            .position(|f| *f == "via")
            .and_then(|i| fields.get(i + 1));
        let ifname = fields
            .iter()
            .position(|f| *f == "dev")
            .and_then(|i| fields.get(i + 1));
        match (gateway, ifname) {
            (Some(gw), Some(dev)) => Ok((gw.to_string(), dev.to_string())),
            _ => Err(format!("cannot parse default route from: {}", out.trim()).into()),
        }
    }

    #[cfg(target_os = "macos")]
    pub fn default_route() -> crate::Result<(String, String)> {
        let out = run_os_command_output("route", &["-n", "get", "default"])?;
        let mut gateway = None;
        let mut ifname = None;
        for line in out.lines() {
            if let Some((key, value)) = line.split_once(':') {
                match key.trim() {
                    "gateway" => gateway = Some(value.trim().to_string()),
                    "interface" => ifname = Some(value.trim().to_string()),
                    _ => {}
                }
            }
        }
        match (gateway, ifname) {
            (Some(gw), Some(dev)) => Ok((gw, dev)),
            _ => Err("cannot parse default route".into()),
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    pub fn default_route() -> crate::Result<(String, String)> {
        Err("route management is not supported on this platform".into())
    }

    /// Brings the interface up as a point-to-point pair of overlay addresses
    #[cfg(target_os = "linux")]
    pub fn interface_up(
        &self,
        ifname: &str,
        my_ip: Ipv4Addr,
        peer_ip: Ipv4Addr,
    ) -> crate::Result<()> {
        run_os_command(
            "ip",
            &[
                "addr",
                "replace",
                &my_ip.to_string(),
                "peer",
                &peer_ip.to_string(),
                "dev",
                ifname,
            ],
        )?;
        run_os_command("ip", &["link", "set", "dev", ifname, "up"])
    }

    #[cfg(target_os = "macos")]
    pub fn interface_up(
        &self,
        ifname: &str,
        my_ip: Ipv4Addr,
        peer_ip: Ipv4Addr,
    ) -> crate::Result<()> {
        run_os_command(
            "ifconfig",
            &[
                ifname,
                &my_ip.to_string(),
                &peer_ip.to_string(),
                "netmask",
                "255.255.255.255",
                "up",
            ],
        )
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    pub fn interface_up(
        &self,
        _ifname: &str,
        _my_ip: Ipv4Addr,
        _peer_ip: Ipv4Addr,
    ) -> crate::Result<()> {
        Err("interface management is not supported on this platform".into())
    }

    #[cfg(target_os = "linux")]
    pub fn interface_down(&self, ifname: &str) -> crate::Result<()> {
        run_os_command("ip", &["link", "set", "dev", ifname, "down"])
    }

    #[cfg(target_os = "macos")]
    pub fn interface_down(&self, ifname: &str) -> crate::Result<()> {
        run_os_command("ifconfig", &[ifname, "down"])
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    pub fn interface_down(&self, _ifname: &str) -> crate::Result<()> {
        Err("interface management is not supported on this platform".into())
    }
}

impl Default for HostNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diversion_pins_peer_and_splits_default() {
        let routes = diversion_routes(
            "198.51.100.7".parse().unwrap(),
            "10.48.0.1".parse().unwrap(),
            "tun0",
            "192.168.1.1",
            "en0",
        );
        assert_eq!(
            routes,
            vec![
                Route {
                    dest: "198.51.100.7/32".to_string(),
                    gateway: "192.168.1.1".to_string(),
                    device: Some("en0".to_string()),
                },
                Route {
                    dest: "0.0.0.0/1".to_string(),
                    gateway: "10.48.0.1".to_string(),
                    device: Some("tun0".to_string()),
                },
                Route {
                    dest: "128.0.0.0/1".to_string(),
                    gateway: "10.48.0.1".to_string(),
                    device: Some("tun0".to_string()),
                },
            ]
        );
    }
}
