//! The session engine
//!
//! A session binds one tun device to one transport link: it negotiates the
//! overlay addressing over the control channel, pumps packets in both
//! directions through the rewriter chain, and tears everything down in a
//! fixed order when the link closes. One task runs the whole session; every
//! event source is multiplexed into its select loop.

use crate::addon::{build_addon, Addon, AddonRegistration, SessionInfo};
use crate::addressing::SharedAddressPool;
use crate::codec::frame::{ControlMessage, IpReply, IP_CONFIRM, IP_REPLY, IP_REQUEST};
use crate::config::{Config, Mode};
use crate::device::{Device, NetworkArgs};
use crate::link::{CloseReason, Link, LinkEvent};
use crate::packet::Packet;
use crate::rewrite::{apply_chain, build_rewriter, Rewriter};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

const MAINTENANCE_SECONDS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Created,
    Handshaking,
    Negotiated,
    Established,
    Closed,
}

/// Where control messages of a given type go
#[derive(Debug, Clone, Copy)]
enum MessageRoute {
    IpRequest,
    IpReply,
    IpConfirm,
    Addon(usize),
}

enum Turn {
    Link(LinkEvent),
    Device(crate::Result<Packet>),
    Maintenance,
    Cancelled,
}

pub struct Session {
    mode: Mode,
    name: String,
    device: Box<dyn Device>,
    link: Box<dyn Link>,
    addons: Vec<Box<dyn Addon>>,
    rewriters: Vec<Box<dyn Rewriter>>,
    routes: HashMap<String, MessageRoute>,
    state: SessionState,
    set_default_gateway: bool,
    server_ip: Option<Ipv4Addr>,
    client_ip: Option<Ipv4Addr>,
    network_configured: Option<NetworkArgs>,
    ip_pool: Option<SharedAddressPool>,
    allocated: Option<(Ipv4Addr, Ipv4Addr)>,
    pending_close: Option<CloseReason>,
}

impl Session {
    /// Builds the session and runs every addon's `setup`
    ///
    /// Rewriters come first from configuration, in order, then from addon
    /// registrations in addon order. Addon failures are logged, never
    /// propagated; the addon stays in the list so its `cleanup` still runs.
    pub fn new(
        mode: Mode,
        name: String,
        device: Box<dyn Device>,
        link: Box<dyn Link>,
        config: &Config,
        ip_pool: Option<SharedAddressPool>,
    ) -> Self {
        let mut rewriters: Vec<Box<dyn Rewriter>> = Vec::new();
        for rewriter_config in &config.rewriters {
            match build_rewriter(rewriter_config) {
                Ok(rewriter) => rewriters.push(rewriter),
                Err(e) => tracing::error!("cannot build rewriter: {}", e),
            }
        }

        let mut routes = HashMap::new();
        match mode {
            Mode::Client => {
                routes.insert(IP_REPLY.to_string(), MessageRoute::IpReply);
            }
            Mode::Server => {
                routes.insert(IP_REQUEST.to_string(), MessageRoute::IpRequest);
                routes.insert(IP_CONFIRM.to_string(), MessageRoute::IpConfirm);
            }
        }

        let mut addons: Vec<Box<dyn Addon>> = Vec::new();
        for addon_config in &config.addons {
            let mut addon = match build_addon(addon_config) {
                Ok(addon) => addon,
                Err(e) => {
                    tracing::error!("cannot build addon: {}", e);
                    continue;
                }
            };
            let mut reg = AddonRegistration::default();
            if let Err(e) = addon.setup(&mut reg) {
                tracing::warn!("addon {} setup failed: {}", addon.name(), e);
            }
            for msg_type in reg.message_types {
                routes.insert(msg_type, MessageRoute::Addon(addons.len()));
            }
            rewriters.extend(reg.rewriters);
            addons.push(addon);
        }

        tracing::debug!("session {} created", name);
        Session {
            mode,
            name,
            device,
            link,
            addons,
            rewriters,
            routes,
            state: SessionState::Created,
            set_default_gateway: config.set_default_gateway,
            server_ip: None,
            client_ip: None,
            network_configured: None,
            ip_pool,
            allocated: None,
            pending_close: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drives the session to completion: handshake, negotiation, pumping,
    /// and finally teardown. Consumes the session; the supervisor observes
    /// completion through the task handle.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.state = SessionState::Handshaking;

        let reason = match self.device.setup().await {
            Err(e) => {
                tracing::error!("session {}: device setup failed: {}", self.name, e);
                CloseReason::DeviceFailed
            }
            Ok(()) => {
                tracing::info!("session {}: device {} initiated", self.name, self.device.name());
                if self.mode == Mode::Client {
                    if let Err(e) = self.link.send_message(&ControlMessage::ip_request()).await {
                        tracing::warn!("session {}: cannot send ip_request: {}", self.name, e);
                    }
                }
                self.pump(shutdown).await
            }
        };

        tracing::info!("session {} closing: {}", self.name, reason);
        self.teardown().await;
    }

    async fn pump(&mut self, shutdown: CancellationToken) -> CloseReason {
        let mut maintenance = interval(Duration::from_secs(MAINTENANCE_SECONDS));
        loop {
            if let Some(reason) = self.pending_close.take() {
                return reason;
            }

            let turn = tokio::select! {
                _ = shutdown.cancelled() => Turn::Cancelled,
                event = self.link.next_event() => Turn::Link(event),
                result = self.device.read_packet() => Turn::Device(result),
                _ = maintenance.tick() => Turn::Maintenance,
            };

            match turn {
                Turn::Cancelled => return CloseReason::ShutdownRequested,
                Turn::Link(LinkEvent::Closed(reason)) => return reason,
                Turn::Link(LinkEvent::Message(msg)) => self.handle_message(msg).await,
                Turn::Link(LinkEvent::Packet(packet)) => self.on_link_packet(packet).await,
                Turn::Device(Ok(packet)) => self.on_device_packet(packet).await,
                Turn::Device(Err(e)) => {
                    tracing::error!("session {}: device read failed: {}", self.name, e);
                    return CloseReason::DeviceFailed;
                }
                Turn::Maintenance => {
                    for rewriter in &mut self.rewriters {
                        rewriter.sweep();
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: ControlMessage) {
        let route = match self.routes.get(msg.msg_type()) {
            Some(route) => *route,
            None => {
                tracing::debug!("dropping message of unknown type {}", msg.msg_type());
                return;
            }
        };

        match route {
            MessageRoute::IpRequest => self.on_ip_request().await,
            MessageRoute::IpReply => self.on_ip_reply(&msg).await,
            MessageRoute::IpConfirm => self.on_ip_confirm(),
            MessageRoute::Addon(index) => {
                if let Some(addon) = self.addons.get_mut(index) {
                    addon.on_message(&msg);
                }
            }
        }
    }

    /// Server side: hand out two overlay addresses and offer them
    async fn on_ip_request(&mut self) {
        if self.state != SessionState::Handshaking {
            tracing::debug!("ignoring ip_request in state {:?}", self.state);
            return;
        }
        let pool = match &self.ip_pool {
            Some(pool) => pool,
            None => {
                tracing::error!("session {}: no address pool", self.name);
                self.pending_close = Some(CloseReason::ProtocolError(
                    "no address pool".to_string(),
                ));
                return;
            }
        };

        let (server_ip, client_ip, network) = {
            let mut pool = pool.lock().unwrap_or_else(|e| e.into_inner());
            match (pool.allocate(), pool.allocate()) {
                (Some(server_ip), Some(client_ip)) => {
                    (server_ip, client_ip, pool.network().to_string())
                }
                (first, second) => {
                    // put back whatever half we got
                    if let Some(addr) = first {
                        pool.release(addr);
                    }
                    if let Some(addr) = second {
                        pool.release(addr);
                    }
                    tracing::error!("session {}: address pool exhausted", self.name);
                    self.pending_close = Some(CloseReason::ProtocolError(
                        "address pool exhausted".to_string(),
                    ));
                    return;
                }
            }
        };

        self.allocated = Some((server_ip, client_ip));
        self.server_ip = Some(server_ip);
        self.client_ip = Some(client_ip);
        self.state = SessionState::Negotiated;

        let reply = IpReply {
            server_ip: server_ip.to_string(),
            client_ip: client_ip.to_string(),
            network,
        };
        if let Err(e) = self.link.send_message(&ControlMessage::ip_reply(&reply)).await {
            tracing::warn!("session {}: cannot send ip_reply: {}", self.name, e);
        }
    }

    /// Client side: adopt the offered addresses and confirm
    async fn on_ip_reply(&mut self, msg: &ControlMessage) {
        if self.state != SessionState::Handshaking {
            tracing::debug!("ignoring ip_reply in state {:?}", self.state);
            return;
        }
        let reply: IpReply = match msg.parse() {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("malformed ip_reply: {}", e);
                return;
            }
        };
        let (server_ip, client_ip) = match (reply.server_ip.parse(), reply.client_ip.parse()) {
            (Ok(server_ip), Ok(client_ip)) => (server_ip, client_ip),
            _ => {
                tracing::warn!(
                    "ip_reply carries unparseable addresses: {} / {}",
                    reply.server_ip,
                    reply.client_ip
                );
                return;
            }
        };

        self.server_ip = Some(server_ip);
        self.client_ip = Some(client_ip);
        self.state = SessionState::Negotiated;

        if let Err(e) = self.link.send_message(&ControlMessage::ip_confirm()).await {
            tracing::warn!("session {}: cannot send ip_confirm: {}", self.name, e);
        }
        self.establish();
    }

    fn on_ip_confirm(&mut self) {
        if self.state != SessionState::Negotiated {
            tracing::debug!("ignoring ip_confirm in state {:?}", self.state);
            return;
        }
        self.establish();
    }

    fn configuration_parameters(&self) -> Option<NetworkArgs> {
        let server_ip = self.server_ip?;
        let client_ip = self.client_ip?;
        Some(match self.mode {
            Mode::Client => NetworkArgs {
                peer_public_ip: self.link.peer_endpoint(),
                peer_overlay_ip: server_ip,
                my_overlay_ip: client_ip,
                add_default_routes: self.set_default_gateway,
            },
            Mode::Server => NetworkArgs {
                peer_public_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                peer_overlay_ip: client_ip,
                my_overlay_ip: server_ip,
                add_default_routes: false,
            },
        })
    }

    fn establish(&mut self) {
        let args = match self.configuration_parameters() {
            Some(args) => args,
            None => {
                tracing::error!("session {}: establishing without addresses", self.name);
                return;
            }
        };
        self.device.configure_network(&args);

        let info = SessionInfo {
            mode: self.mode,
            // both are present, configuration_parameters checked
            server_ip: self.server_ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
            client_ip: self.client_ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        for addon in &mut self.addons {
            if let Err(e) = addon.on_session_established(&info) {
                tracing::warn!("addon {} failed on establishment: {}", addon.name(), e);
            }
        }

        self.network_configured = Some(args);
        self.state = SessionState::Established;
        tracing::info!(
            "session {} established: server {} client {}",
            self.name,
            info.server_ip,
            info.client_ip
        );
    }

    async fn on_device_packet(&mut self, packet: Packet) {
        if self.state != SessionState::Established {
            tracing::debug!("dropping device packet before establishment");
            return;
        }
        let mut packet = packet;
        packet.payload = apply_chain(&mut self.rewriters, packet.payload);
        if let Err(e) = self.link.send_packet(packet).await {
            tracing::debug!("session {}: cannot send packet: {}", self.name, e);
        }
    }

    async fn on_link_packet(&mut self, packet: Packet) {
        if self.state != SessionState::Established {
            tracing::debug!("dropping link packet before establishment");
            return;
        }
        let mut packet = packet;
        packet.payload = apply_chain(&mut self.rewriters, packet.payload);
        if let Err(e) = self.device.write_packet(&packet).await {
            tracing::debug!("session {}: cannot write packet: {}", self.name, e);
        }
    }

    /// Teardown in fixed order; every step runs even if earlier ones fail
    async fn teardown(&mut self) {
        self.state = SessionState::Closed;

        for addon in &mut self.addons {
            addon.cleanup();
        }

        if let Some(args) = self.network_configured.take() {
            self.device.restore_network(&args);
        }

        if let (Some(pool), Some((server_ip, client_ip))) =
            (self.ip_pool.as_ref(), self.allocated.take())
        {
            let mut pool = pool.lock().unwrap_or_else(|e| e.into_inner());
            pool.release(server_ip);
            pool.release(client_ip);
        }

        self.link.shutdown().await;
        self.device.cleanup().await;
        tracing::debug!("session {} cleaned up", self.name);
    }
}
