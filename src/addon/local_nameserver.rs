//! Local DNS forwarder
//!
//! Binds a UDP socket on the loopback interface once the session is
//! established and relays DNS queries to an upstream resolver, routing
//! answers back to the asking application by transaction id. Pending
//! entries expire after 60 seconds.

use crate::addon::{Addon, AddonRegistration, SessionInfo};
use crate::config::AddonConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;

const DNS_BUF_SIZE: usize = 2048;
const DNS_HEADER: usize = 12;
const PENDING_TIMEOUT: Duration = Duration::from_secs(60);
const SWEEP_SECONDS: u64 = 5;

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 53))
}

fn default_remote() -> SocketAddr {
    SocketAddr::from(([8, 8, 8, 8], 53))
}

pub struct LocalNameserverAddon {
    listen: SocketAddr,
    remote: SocketAddr,
    bound: Option<SocketAddr>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl LocalNameserverAddon {
    pub fn new(config: &AddonConfig) -> Self {
        LocalNameserverAddon {
            listen: config.listen.unwrap_or_else(default_listen),
            remote: config.remote.unwrap_or_else(default_remote),
            bound: None,
            cancel: None,
            task: None,
        }
    }

    /// The address the forwarder actually bound, once running
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound
    }
}

impl Addon for LocalNameserverAddon {
    fn name(&self) -> &str {
        "local_nameserver"
    }

    fn setup(&mut self, _reg: &mut AddonRegistration) -> crate::Result<()> {
        Ok(())
    }

    fn on_session_established(&mut self, _info: &SessionInfo) -> crate::Result<()> {
        let socket = std::net::UdpSocket::bind(self.listen)
            .map_err(|e| format!("cannot bind {}: {}", self.listen, e))?;
        socket.set_nonblocking(true)?;
        self.bound = socket.local_addr().ok();

        let token = CancellationToken::new();
        let remote = self.remote;
        let child = token.child_token();
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = forward_loop(socket, remote, child).await {
                tracing::error!("local nameserver stopped: {}", e);
            }
        }));
        self.cancel = Some(token);
        tracing::info!(
            "local nameserver on {} forwarding to {}",
            self.bound.unwrap_or(self.listen),
            self.remote
        );
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.task = None;
    }
}

struct PendingClient {
    from: SocketAddr,
    time: Instant,
}

async fn forward_loop(
    socket: std::net::UdpSocket,
    remote: SocketAddr,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let socket = UdpSocket::from_std(socket)?;
    let mut pending: HashMap<u16, PendingClient> = HashMap::new();
    let mut sweep = interval(Duration::from_secs(SWEEP_SECONDS));
    let mut buf = [0u8; DNS_BUF_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = sweep.tick() => {
                pending.retain(|_, client| client.time.elapsed() <= PENDING_TIMEOUT);
            }
            result = socket.recv_from(&mut buf) => {
                let (amount, from) = result?;
                let data = &buf[..amount];
                let (dns_id, is_response) = match dns_header(data) {
                    Some(header) => header,
                    None => {
                        tracing::warn!("malformed DNS packet from {}", from);
                        continue;
                    }
                };

                if !is_response {
                    pending.insert(dns_id, PendingClient { from, time: Instant::now() });
                    if let Err(e) = socket.send_to(data, remote).await {
                        tracing::error!("cannot forward DNS query: {}", e);
                    } else {
                        tracing::debug!("forwarded DNS query from {}", from);
                    }
                } else {
                    match pending.remove(&dns_id) {
                        Some(client) => {
                            if let Err(e) = socket.send_to(data, client.from).await {
                                tracing::error!("cannot forward DNS answer: {}", e);
                            } else {
                                tracing::debug!("forwarded DNS answer to {}", client.from);
                            }
                        }
                        None => tracing::debug!("unknown DNS answer {:#06x}", dns_id),
                    }
                }
            }
        }
    }
}

fn dns_header(data: &[u8]) -> Option<(u16, bool)> {
    if data.len() < DNS_HEADER {
        return None;
    }
    let dns_id = u16::from_be_bytes([data[0], data[1]]);
    Some((dns_id, data[2] & 0x80 != 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;

    fn query(dns_id: u16) -> Vec<u8> {
        let mut data = vec![0u8; DNS_HEADER + 5];
        data[0..2].copy_from_slice(&dns_id.to_be_bytes());
        data
    }

    fn answer(dns_id: u16) -> Vec<u8> {
        let mut data = query(dns_id);
        data[2] = 0x80;
        data
    }

    #[tokio::test]
    async fn relays_queries_and_routes_answers_back() {
        // stand-in upstream resolver
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = upstream.local_addr().unwrap();

        let mut addon = LocalNameserverAddon::new(&AddonConfig {
            class: "local_nameserver".to_string(),
            nameservers: vec![],
            resolver_dir: None,
            tlds_file: None,
            tlds_url: None,
            listen: Some("127.0.0.1:0".parse().unwrap()),
            remote: Some(remote),
        });

        let info = SessionInfo {
            mode: Mode::Client,
            server_ip: "10.48.0.1".parse().unwrap(),
            client_ip: "10.48.0.2".parse().unwrap(),
        };
        addon.on_session_established(&info).unwrap();
        let listen = addon.bound_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&query(0x4242), listen).await.unwrap();

        // the forwarder relays the query upstream
        let mut buf = [0u8; DNS_BUF_SIZE];
        let (amount, forwarder) = upstream.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..amount], query(0x4242).as_slice());

        // the upstream answers and the answer lands back at the client
        upstream.send_to(&answer(0x4242), forwarder).await.unwrap();
        let (amount, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..amount], answer(0x4242).as_slice());

        addon.cleanup();
    }
}
