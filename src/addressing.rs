use ipnet::Ipv4Net;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

/// The pool as server sessions see it: created once by the application,
/// shared across sessions, uncontended on the single-threaded loop.
pub type SharedAddressPool = Arc<Mutex<AddressSpaceManager>>;

/// Server-side pool of overlay host addresses
///
/// Holds the overlay network and an ordered list of unassigned host
/// addresses. Created once at startup and shared across concurrent server
/// sessions; all access happens on the single event loop so operations are
/// plain pops and pushes.
pub struct AddressSpaceManager {
    network: Ipv4Net,
    free: VecDeque<Ipv4Addr>,
}

impl AddressSpaceManager {
    pub fn new(network: Ipv4Net) -> Self {
        AddressSpaceManager {
            network,
            free: network.hosts().collect(),
        }
    }

    /// Pops the next free host address, or `None` when the pool is empty
    pub fn allocate(&mut self) -> Option<Ipv4Addr> {
        self.free.pop_front()
    }

    /// Returns a previously allocated address to the pool
    pub fn release(&mut self, host: Ipv4Addr) {
        self.free.push_back(host);
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}
