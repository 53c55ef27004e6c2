pub mod tcp;
pub mod udp;

use crate::codec::frame::ControlMessage;
use crate::config::{LinkConfig, Mode};
use crate::link::tcp::{TcpLinkClientManager, TcpLinkServerManager};
use crate::link::udp::{UdpLinkClientManager, UdpLinkServerManager};
use crate::packet::Packet;
use async_trait::async_trait;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Deadline for the 4-byte magic exchange on either transport
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a link stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer asked us to abandon the link
    ResetReceived,
    /// No valid record arrived within the death threshold
    PeerSilent,
    /// The stream reached EOF or failed
    StreamClosed,
    /// The owning manager went away mid-session
    ManagerGone,
    /// The byte stream desynchronized or the peer broke framing
    ProtocolError(String),
    /// The application asked the session to stop
    ShutdownRequested,
    /// The tun device failed underneath the session
    DeviceFailed,
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::ResetReceived => write!(f, "reset received"),
            CloseReason::PeerSilent => write!(f, "peer silent"),
            CloseReason::StreamClosed => write!(f, "stream closed"),
            CloseReason::ManagerGone => write!(f, "link manager gone"),
            CloseReason::ProtocolError(e) => write!(f, "protocol error: {}", e),
            CloseReason::ShutdownRequested => write!(f, "shutdown requested"),
            CloseReason::DeviceFailed => write!(f, "device failed"),
        }
    }
}

/// What a link yields to its session
///
/// `Closed` is terminal: it is delivered once for every link that ever
/// completed setup, and the session stops polling after consuming it.
#[derive(Debug)]
pub enum LinkEvent {
    Packet(Packet),
    Message(ControlMessage),
    Closed(CloseReason),
}

/// One transport association with the peer
///
/// A link yields two byte streams semantically: framed IP packets and
/// framed JSON control messages; implementations multiplex them on one
/// wire. The datagram implementation also runs the liveness timers inside
/// `next_event`, so keepalives flow whenever the session is polling.
#[async_trait]
pub trait Link: Send {
    fn peer_addr(&self) -> SocketAddr;

    fn peer_endpoint(&self) -> IpAddr {
        self.peer_addr().ip()
    }

    /// Waits for the next packet, control message, or closure
    async fn next_event(&mut self) -> LinkEvent;

    async fn send_packet(&mut self, packet: Packet) -> crate::Result<()>;

    async fn send_message(&mut self, msg: &ControlMessage) -> crate::Result<()>;

    /// Releases the transport; datagram links send a final RESET
    async fn shutdown(&mut self);
}

/// Creates or accepts links for the application supervisor
#[async_trait]
pub trait LinkManager: Send {
    async fn setup(&mut self) -> crate::Result<()>;

    /// Attempts to produce one established link. `Ok(None)` means the
    /// attempt failed transiently (refused, handshake timeout, rejected);
    /// the supervisor backs off and retries.
    async fn create(&mut self) -> crate::Result<Option<Box<dyn Link>>>;

    async fn cleanup(&mut self);
}

pub fn create_link_manager(mode: Mode, config: &LinkConfig) -> crate::Result<Box<dyn LinkManager>> {
    match (config.class.as_str(), mode) {
        ("udp", Mode::Client) => Ok(Box::new(UdpLinkClientManager::new(
            config.host.clone().ok_or("link.host is required")?,
            config.port,
        ))),
        ("udp", Mode::Server) => Ok(Box::new(UdpLinkServerManager::new(config.port))),
        ("tcp", Mode::Client) => Ok(Box::new(TcpLinkClientManager::new(
            config.host.clone().ok_or("link.host is required")?,
            config.port,
        ))),
        ("tcp", Mode::Server) => Ok(Box::new(TcpLinkServerManager::new(config.port))),
        (other, _) => Err(format!("unknown link class: {}", other).into()),
    }
}
