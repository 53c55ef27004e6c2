pub mod local_nameserver;
pub mod resolver_dir;
pub mod tld;

use crate::addon::local_nameserver::LocalNameserverAddon;
use crate::addon::resolver_dir::ResolverDirAddon;
use crate::codec::frame::ControlMessage;
use crate::config::{AddonConfig, Mode};
use crate::rewrite::Rewriter;
use std::net::Ipv4Addr;

/// What an addon may hook into during its `setup`
#[derive(Default)]
pub struct AddonRegistration {
    pub message_types: Vec<String>,
    pub rewriters: Vec<Box<dyn Rewriter>>,
}

impl AddonRegistration {
    /// Routes control messages of this type to the addon's `on_message`
    pub fn register_message_type(&mut self, msg_type: &str) {
        self.message_types.push(msg_type.to_string());
    }

    /// Appends a rewriter to the session's chain
    pub fn register_rewriter(&mut self, rewriter: Box<dyn Rewriter>) {
        self.rewriters.push(rewriter);
    }
}

/// Negotiated facts handed to addons once the tunnel is up
#[derive(Debug, Clone, Copy)]
pub struct SessionInfo {
    pub mode: Mode,
    pub server_ip: Ipv4Addr,
    pub client_ip: Ipv4Addr,
}

/// A session lifecycle hook bundle
///
/// `setup` runs during session construction, before the link handshake;
/// `on_session_established` after the network is configured; `cleanup`
/// during teardown regardless of how far setup progressed. Failures in any
/// phase are caught and logged by the session and never abort it.
pub trait Addon: Send {
    fn name(&self) -> &str;

    fn setup(&mut self, reg: &mut AddonRegistration) -> crate::Result<()>;

    fn on_session_established(&mut self, info: &SessionInfo) -> crate::Result<()>;

    /// Called for control messages whose type the addon registered
    fn on_message(&mut self, _msg: &ControlMessage) {}

    fn cleanup(&mut self);
}

/// Verifies an addon class name without constructing anything
pub fn check_class(class: &str) -> crate::Result<()> {
    match class {
        "resolver_dir" | "local_nameserver" => Ok(()),
        other => Err(format!("unknown addon class: {}", other).into()),
    }
}

pub fn build_addon(config: &AddonConfig) -> crate::Result<Box<dyn Addon>> {
    match config.class.as_str() {
        "resolver_dir" => Ok(Box::new(ResolverDirAddon::new(config))),
        "local_nameserver" => Ok(Box::new(LocalNameserverAddon::new(config))),
        other => Err(format!("unknown addon class: {}", other).into()),
    }
}
