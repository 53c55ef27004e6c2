pub mod host;

use crate::config::DeviceConfig;
use crate::device::host::{diversion_routes, HostNetwork};
use crate::packet::{Packet, SourceTag};
use async_trait::async_trait;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tun::AbstractDevice;

const MAX_BUF_SIZE: usize = 2048;

/// Arguments of one network configuration, kept so that restoration runs
/// with exactly the values configuration ran with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkArgs {
    /// Public address of the peer, `0.0.0.0` in server mode
    pub peer_public_ip: IpAddr,
    /// Overlay address on the far end of the tunnel
    pub peer_overlay_ip: Ipv4Addr,
    /// Overlay address installed on this interface
    pub my_overlay_ip: Ipv4Addr,
    /// Divert the host default route through the tunnel
    pub add_default_routes: bool,
}

impl Display for NetworkArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} (peer {}, default routes: {})",
            self.my_overlay_ip, self.peer_overlay_ip, self.peer_public_ip, self.add_default_routes
        )
    }
}

/// A handle to a tun interface
///
/// Implementations own the kernel file descriptor and the host-level state
/// (interface address, added routes) of one session.
#[async_trait]
pub trait Device: Send {
    fn name(&self) -> String;

    /// Opens the device; must be called before any other operation
    async fn setup(&mut self) -> crate::Result<()>;

    /// Reads the next IP packet from the kernel
    async fn read_packet(&mut self) -> crate::Result<Packet>;

    /// Writes an IP packet back to the kernel
    async fn write_packet(&mut self, packet: &Packet) -> crate::Result<()>;

    /// Brings the interface up with the overlay addresses and optionally
    /// diverts the default route. Host configuration failures are logged
    /// and do not fail the session: partial configuration may still route
    /// some traffic.
    fn configure_network(&mut self, args: &NetworkArgs);

    /// Reverses `configure_network`: removes exactly the added routes and
    /// brings the interface down.
    fn restore_network(&mut self, args: &NetworkArgs);

    /// Closes the file descriptor
    async fn cleanup(&mut self);
}

#[async_trait]
pub trait DeviceManager: Send {
    async fn setup(&mut self) -> crate::Result<()>;
    async fn create(&mut self) -> crate::Result<Box<dyn Device>>;
    async fn cleanup(&mut self);
}

pub fn create_device_manager(config: &DeviceConfig) -> crate::Result<Box<dyn DeviceManager>> {
    match config.class.as_str() {
        "tun" => Ok(Box::new(TunDeviceManager::new(config.clone()))),
        other => Err(format!("unknown device class: {}", other).into()),
    }
}

/// Tun device backed by the platform tun driver
pub struct TunDevice {
    dev: Option<tun::AsyncDevice>,
    ifname: Option<String>,
    mtu: u16,
    host: HostNetwork,
    buf: Vec<u8>,
}

impl TunDevice {
    pub fn new(mtu: u16) -> Self {
        TunDevice {
            dev: None,
            ifname: None,
            mtu,
            host: HostNetwork::new(),
            buf: vec![0; MAX_BUF_SIZE],
        }
    }
}

#[async_trait]
impl Device for TunDevice {
    fn name(&self) -> String {
        self.ifname.clone().unwrap_or_else(|| "tun".to_string())
    }

    async fn setup(&mut self) -> crate::Result<()> {
        let mut config = tun::Configuration::default();
        config.mtu(self.mtu).up();

        #[cfg(target_os = "linux")]
        config.platform_config(|config| {
            config.ensure_root_privileges(true);
        });

        let dev = tun::create_as_async(&config)?;
        self.ifname = dev.tun_name().ok();
        self.dev = Some(dev);
        tracing::info!("opened tun device {}", self.name());
        Ok(())
    }

    async fn read_packet(&mut self) -> crate::Result<Packet> {
        let dev = self.dev.as_mut().ok_or("device not initialized")?;
        let amount = dev.read(&mut self.buf).await?;
        Ok(Packet::new(
            self.buf[..amount].to_vec(),
            SourceTag::Device(self.ifname.clone().unwrap_or_default()),
        ))
    }

    async fn write_packet(&mut self, packet: &Packet) -> crate::Result<()> {
        let dev = self.dev.as_mut().ok_or("device not initialized")?;
        dev.write_all(&packet.payload).await?;
        Ok(())
    }

    fn configure_network(&mut self, args: &NetworkArgs) {
        let ifname = self.name();
        if let Err(e) = self
            .host
            .interface_up(&ifname, args.my_overlay_ip, args.peer_overlay_ip)
        {
            tracing::warn!("failed to bring {} up: {}", ifname, e);
        }

        if args.add_default_routes {
            match HostNetwork::default_route() {
                Ok((gateway, prior_ifname)) => {
                    let routes = diversion_routes(
                        args.peer_public_ip,
                        args.peer_overlay_ip,
                        &ifname,
                        &gateway,
                        &prior_ifname,
                    );
                    for route in routes {
                        let dest = route.dest.clone();
                        if let Err(e) = self.host.add_route(route) {
                            tracing::warn!("failed to add route {}: {}", dest, e);
                        }
                    }
                }
                Err(e) => tracing::warn!("cannot snapshot default route: {}", e),
            }
        }
        tracing::info!("configured network: {}", args);
    }

    fn restore_network(&mut self, args: &NetworkArgs) {
        let ifname = self.name();
        self.host.restore_routes();
        if let Err(e) = self.host.interface_down(&ifname) {
            tracing::warn!("failed to bring {} down: {}", ifname, e);
        }
        tracing::info!("restored network: {}", args);
    }

    async fn cleanup(&mut self) {
        if self.dev.take().is_some() {
            tracing::info!("closing tun device {}", self.name());
        }
    }
}

pub struct TunDeviceManager {
    config: DeviceConfig,
}

impl TunDeviceManager {
    pub fn new(config: DeviceConfig) -> Self {
        TunDeviceManager { config }
    }
}

#[async_trait]
impl DeviceManager for TunDeviceManager {
    async fn setup(&mut self) -> crate::Result<()> {
        Ok(())
    }

    async fn create(&mut self) -> crate::Result<Box<dyn Device>> {
        Ok(Box::new(TunDevice::new(self.config.mtu)))
    }

    async fn cleanup(&mut self) {}
}
