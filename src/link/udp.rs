//! Datagram transport
//!
//! Each datagram carries one typed record. A link is identified by the
//! 4-tuple after a magic-word exchange; the shared socket is owned by the
//! manager, which demultiplexes inbound datagrams to links by peer address
//! and drains a writer channel the links send through. Liveness runs
//! per-link: a keepalive every 30 s, and closure with an outbound RESET
//! after 90 s of silence.

use crate::codec::frame::{ControlMessage, FrameError, Record};
use crate::codec::parser::Parser;
use crate::link::{CloseReason, Link, LinkEvent, LinkManager, HANDSHAKE_TIMEOUT};
use crate::packet::{Direction, Packet, Routing, SourceTag};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};

const UDP_BUF_SIZE: usize = 2048;
const RESET_DATAGRAM: [u8; 1] = [0x00];
const KEEPALIVE_DATAGRAM: [u8; 1] = [0x03];
const KEEP_ALIVE_SECONDS: u64 = 30;
const CHECK_SECONDS: u64 = 30;
const CONNECTION_DEATH_SECONDS: u64 = 90;
const INBOUND_QUEUE: usize = 256;
const WRITER_QUEUE: usize = 256;
const ACCEPT_QUEUE: usize = 16;

/// Outbound datagrams, drained by the manager's socket task
type WriterTx = mpsc::Sender<(SocketAddr, Vec<u8>)>;

pub struct UdpLink {
    peer: SocketAddr,
    inbound: mpsc::Receiver<Vec<u8>>,
    writer: WriterTx,
    last_recorded: Instant,
    keepalive: Interval,
    check: Interval,
    closed: bool,
}

impl UdpLink {
    pub fn new(peer: SocketAddr, inbound: mpsc::Receiver<Vec<u8>>, writer: WriterTx) -> Self {
        let keepalive_period = Duration::from_secs(KEEP_ALIVE_SECONDS);
        let mut keepalive = interval_at(Instant::now() + keepalive_period, keepalive_period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let check_period = Duration::from_secs(CHECK_SECONDS);
        let mut check = interval_at(Instant::now() + check_period, check_period);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        UdpLink {
            peer,
            inbound,
            writer,
            last_recorded: Instant::now(),
            keepalive,
            check,
            closed: false,
        }
    }

    fn record_alive(&mut self) {
        self.last_recorded = Instant::now();
    }

    async fn write(&self, data: Vec<u8>) -> crate::Result<()> {
        self.writer
            .send((self.peer, data))
            .await
            .map_err(|_| "link manager gone".into())
    }

    async fn handle_datagram(&mut self, data: Vec<u8>) -> Option<LinkEvent> {
        match Parser::unmarshal(&data) {
            Ok(Record::Reset) => {
                tracing::info!("received reset from {}", self.peer);
                Some(LinkEvent::Closed(CloseReason::ResetReceived))
            }
            Ok(Record::KeepAlive) => {
                tracing::debug!("received keep-alive from {}", self.peer);
                self.record_alive();
                None
            }
            Ok(Record::Control(msg)) => {
                tracing::debug!("received message: {}", msg);
                self.record_alive();
                Some(LinkEvent::Message(msg))
            }
            Ok(Record::Packet(payload)) => {
                self.record_alive();
                let packet = Packet::with_routing(
                    payload,
                    SourceTag::Link(self.peer),
                    Routing {
                        peer: self.peer,
                        direction: Direction::Inbound,
                    },
                );
                tracing::debug!("received: {}", packet);
                Some(LinkEvent::Packet(packet))
            }
            Err(FrameError::UnknownType(t)) => {
                tracing::debug!("unknown record type {:#04x} from {}, sending reset", t, self.peer);
                if let Err(e) = self.write(RESET_DATAGRAM.to_vec()).await {
                    tracing::debug!("cannot send reset: {}", e);
                }
                None
            }
            Err(e) => {
                tracing::debug!("dropping malformed datagram from {}: {}", self.peer, e);
                None
            }
        }
    }
}

#[async_trait]
impl Link for UdpLink {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn next_event(&mut self) -> LinkEvent {
        if self.closed {
            return LinkEvent::Closed(CloseReason::ManagerGone);
        }

        loop {
            tokio::select! {
                maybe = self.inbound.recv() => match maybe {
                    Some(data) => {
                        if let Some(event) = self.handle_datagram(data).await {
                            if matches!(event, LinkEvent::Closed(_)) {
                                self.closed = true;
                            }
                            return event;
                        }
                    }
                    None => {
                        self.closed = true;
                        return LinkEvent::Closed(CloseReason::ManagerGone);
                    }
                },
                _ = self.keepalive.tick() => {
                    if let Err(e) = self.write(KEEPALIVE_DATAGRAM.to_vec()).await {
                        tracing::debug!("cannot send keep-alive: {}", e);
                    } else {
                        tracing::debug!("sent keep-alive to {}", self.peer);
                    }
                }
                _ = self.check.tick() => {
                    if self.last_recorded.elapsed()
                        > Duration::from_secs(CONNECTION_DEATH_SECONDS)
                    {
                        tracing::warn!("{} silent beyond threshold, closing", self.peer);
                        let _ = self.write(RESET_DATAGRAM.to_vec()).await;
                        self.closed = true;
                        return LinkEvent::Closed(CloseReason::PeerSilent);
                    }
                }
            }
        }
    }

    async fn send_packet(&mut self, packet: Packet) -> crate::Result<()> {
        let data = Parser::marshal(&Record::Packet(packet.payload))?;
        self.write(data).await?;
        tracing::debug!("sent packet to {}", self.peer);
        Ok(())
    }

    async fn send_message(&mut self, msg: &ControlMessage) -> crate::Result<()> {
        let data = Parser::marshal(&Record::Control(msg.clone()))?;
        self.write(data).await?;
        tracing::debug!("sent message: {}", msg);
        Ok(())
    }

    async fn shutdown(&mut self) {
        // parting reset so the peer does not wait out the death threshold
        let _ = self.write(RESET_DATAGRAM.to_vec()).await;
        self.inbound.close();
        self.closed = true;
    }
}

fn bind_udp_socket(addr: SocketAddr) -> crate::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Client-side manager: one socket, one link at a time
pub struct UdpLinkClientManager {
    host: String,
    port: u16,
    socket: Option<Arc<UdpSocket>>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpLinkClientManager {
    pub fn new(host: String, port: u16) -> Self {
        UdpLinkClientManager {
            host,
            port,
            socket: None,
            tasks: Vec::new(),
        }
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl LinkManager for UdpLinkClientManager {
    async fn setup(&mut self) -> crate::Result<()> {
        let socket = bind_udp_socket("0.0.0.0:0".parse()?)?;
        self.socket = Some(Arc::new(socket));
        Ok(())
    }

    async fn create(&mut self) -> crate::Result<Option<Box<dyn Link>>> {
        // drop the plumbing of any previous link before reusing the socket
        self.abort_tasks();
        let socket = self.socket.clone().ok_or("manager not set up")?;

        let server_addr = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| format!("cannot resolve {}", self.host))?;

        socket.send_to(&Parser::magic(), server_addr).await?;
        tracing::info!("sent magic word to {}", server_addr);

        let mut buf = [0u8; UDP_BUF_SIZE];
        let (amount, peer) = match timeout(HANDSHAKE_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::info!("handshake with {} timed out", server_addr);
                return Ok(None);
            }
        };

        let reply = &buf[..amount];
        if reply == RESET_DATAGRAM.as_slice() {
            tracing::info!("{} rejected the handshake", peer);
            return Ok(None);
        }
        if !Parser::is_magic(reply) {
            tracing::info!("received incorrect magic word from {}", peer);
            socket.send_to(&RESET_DATAGRAM, peer).await?;
            return Ok(None);
        }
        tracing::info!("received correct magic word from {}", peer);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (writer_tx, mut writer_rx) = mpsc::channel::<(SocketAddr, Vec<u8>)>(WRITER_QUEUE);

        let reader_socket = socket.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut buf = [0u8; UDP_BUF_SIZE];
            loop {
                let (amount, from) = match reader_socket.recv_from(&mut buf).await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::debug!("socket read failed: {}", e);
                        break;
                    }
                };
                if from != peer {
                    tracing::debug!("ignoring datagram from unrelated {}", from);
                    continue;
                }
                if inbound_tx.send(buf[..amount].to_vec()).await.is_err() {
                    break;
                }
            }
        }));

        let writer_socket = socket.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some((addr, data)) = writer_rx.recv().await {
                if let Err(e) = writer_socket.send_to(&data, addr).await {
                    tracing::debug!("socket write failed: {}", e);
                }
            }
        }));

        Ok(Some(Box::new(UdpLink::new(peer, inbound_rx, writer_tx))))
    }

    async fn cleanup(&mut self) {
        self.abort_tasks();
        self.socket = None;
    }
}

/// Server-side manager: one socket, links demultiplexed by peer address
pub struct UdpLinkServerManager {
    port: u16,
    accept_rx: Option<mpsc::Receiver<Box<dyn Link>>>,
    task: Option<JoinHandle<()>>,
}

impl UdpLinkServerManager {
    pub fn new(port: u16) -> Self {
        UdpLinkServerManager {
            port,
            accept_rx: None,
            task: None,
        }
    }
}

#[async_trait]
impl LinkManager for UdpLinkServerManager {
    async fn setup(&mut self) -> crate::Result<()> {
        let socket = Arc::new(bind_udp_socket(([0, 0, 0, 0], self.port).into())?);
        tracing::info!("listening for UDP packets on port {}", self.port);

        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE);
        self.accept_rx = Some(accept_rx);

        let (writer_tx, mut writer_rx) = mpsc::channel::<(SocketAddr, Vec<u8>)>(WRITER_QUEUE);

        self.task = Some(tokio::spawn(async move {
            let mut links: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
            let mut buf = [0u8; UDP_BUF_SIZE];
            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        let (amount, addr) = match result {
                            Ok(pair) => pair,
                            Err(e) => {
                                tracing::error!("socket read failed: {}", e);
                                break;
                            }
                        };
                        let data = &buf[..amount];

                        if let Some(tx) = links.get(&addr) {
                            match tx.try_send(data.to_vec()) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    tracing::debug!("inbound queue for {} full, dropping", addr);
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {
                                    links.remove(&addr);
                                }
                            }
                            continue;
                        }

                        // no link yet: only the handshake is meaningful
                        if data == RESET_DATAGRAM.as_slice() {
                            continue;
                        }
                        if !Parser::is_magic(data) {
                            tracing::debug!("magic word from {} does not match", addr);
                            let _ = socket.send_to(&RESET_DATAGRAM, addr).await;
                            continue;
                        }

                        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
                        let link = UdpLink::new(addr, inbound_rx, writer_tx.clone());
                        match accept_tx.try_send(Box::new(link) as Box<dyn Link>) {
                            Ok(()) => {
                                links.insert(addr, inbound_tx);
                                let _ = socket.send_to(&Parser::magic(), addr).await;
                                tracing::info!("new client from {}", addr);
                            }
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                tracing::warn!("accept queue full, rejecting {}", addr);
                                let _ = socket.send_to(&RESET_DATAGRAM, addr).await;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                    maybe = writer_rx.recv() => {
                        match maybe {
                            Some((addr, data)) => {
                                if let Err(e) = socket.send_to(&data, addr).await {
                                    tracing::debug!("socket write failed: {}", e);
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    async fn create(&mut self) -> crate::Result<Option<Box<dyn Link>>> {
        let accept_rx = self.accept_rx.as_mut().ok_or("manager not set up")?;
        Ok(accept_rx.recv().await)
    }

    async fn cleanup(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.accept_rx = None;
    }
}
