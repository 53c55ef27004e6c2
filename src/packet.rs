use std::fmt::Display;
use std::net::SocketAddr;

/// Where a packet entered the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceTag {
    /// Read from a tun interface, tagged with its name
    Device(String),
    /// Received from a link, tagged with the peer address
    Link(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Transport routing attached to packets that crossed a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    pub peer: SocketAddr,
    pub direction: Direction,
}

/// A raw IP packet in flight between a device and a link
///
/// The payload may be replaced by the rewriter chain; source and routing
/// identify where it came from and are never modified.
#[derive(Debug, Clone)]
pub struct Packet {
    pub payload: Vec<u8>,
    pub source: SourceTag,
    pub routing: Option<Routing>,
}

impl Packet {
    pub fn new(payload: Vec<u8>, source: SourceTag) -> Self {
        Packet {
            payload,
            source,
            routing: None,
        }
    }

    pub fn with_routing(payload: Vec<u8>, source: SourceTag, routing: Routing) -> Self {
        Packet {
            payload,
            source,
            routing: Some(routing),
        }
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "packet of {} bytes", self.payload.len())?;
        match &self.source {
            SourceTag::Device(name) => write!(f, " from device {}", name),
            SourceTag::Link(peer) => write!(f, " from link {}", peer),
        }
    }
}
