//! Stream transport
//!
//! Both ends send the 4-byte magic word immediately after the connection
//! opens and verify the peer's copy before anything else is delivered; a
//! mismatch or a 5-second absence closes the stream. After the preamble
//! the stream carries length-prefixed typed records, so the control channel
//! runs over this transport too. Liveness is stream close: no keepalives,
//! no RESET records.

use crate::codec::frame::{ControlMessage, Record, MAGIC_WORD};
use crate::codec::parser::{Parser, StreamDecoder};
use crate::link::{CloseReason, Link, LinkEvent, LinkManager, HANDSHAKE_TIMEOUT};
use crate::packet::{Direction, Packet, Routing, SourceTag};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

pub struct TcpLink {
    stream: TcpStream,
    peer: SocketAddr,
    decoder: StreamDecoder,
    closed: bool,
}

impl TcpLink {
    /// Runs the magic-word preamble on a fresh stream
    ///
    /// Sends our magic first, then waits up to 5 seconds for the peer's.
    /// Nothing is delivered upward until both directions verified.
    pub async fn establish(mut stream: TcpStream) -> crate::Result<TcpLink> {
        let peer = stream.peer_addr()?;
        stream.write_all(&Parser::magic()).await?;
        stream.flush().await?;
        tracing::debug!("sent magic word to {}", peer);

        let mut word = [0u8; 4];
        match timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut word)).await {
            Err(_) => Err(format!("no magic word from {} within deadline", peer).into()),
            Ok(Err(e)) => Err(format!("stream from {} failed during handshake: {}", peer, e).into()),
            Ok(Ok(_)) => {
                if Parser::is_magic(&word) {
                    tracing::debug!("received correct magic word: {:#010x}", MAGIC_WORD);
                    Ok(TcpLink {
                        stream,
                        peer,
                        decoder: StreamDecoder::new(),
                        closed: false,
                    })
                } else {
                    Err(format!(
                        "received wrong magic word from {}: {:#010x}",
                        peer,
                        u32::from_be_bytes(word)
                    )
                    .into())
                }
            }
        }
    }
}

#[async_trait]
impl Link for TcpLink {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn next_event(&mut self) -> LinkEvent {
        if self.closed {
            return LinkEvent::Closed(CloseReason::StreamClosed);
        }

        loop {
            match self.decoder.next_record() {
                Ok(Some(Record::Packet(payload))) => {
                    let packet = Packet::with_routing(
                        payload,
                        SourceTag::Link(self.peer),
                        Routing {
                            peer: self.peer,
                            direction: Direction::Inbound,
                        },
                    );
                    tracing::debug!("received: {}", packet);
                    return LinkEvent::Packet(packet);
                }
                Ok(Some(Record::Control(msg))) => {
                    tracing::debug!("received message: {}", msg);
                    return LinkEvent::Message(msg);
                }
                Ok(Some(Record::KeepAlive)) => continue,
                Ok(Some(Record::Reset)) => {
                    self.closed = true;
                    return LinkEvent::Closed(CloseReason::ResetReceived);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("stream from {} broke framing: {}", self.peer, e);
                    self.closed = true;
                    return LinkEvent::Closed(CloseReason::ProtocolError(e.to_string()));
                }
            }

            match self.stream.read_buf(self.decoder.buffer_mut()).await {
                Ok(0) => {
                    self.closed = true;
                    return LinkEvent::Closed(CloseReason::StreamClosed);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("stream from {} failed: {}", self.peer, e);
                    self.closed = true;
                    return LinkEvent::Closed(CloseReason::StreamClosed);
                }
            }
        }
    }

    async fn send_packet(&mut self, packet: Packet) -> crate::Result<()> {
        let data = Parser::marshal_stream(&Record::Packet(packet.payload))?;
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn send_message(&mut self, msg: &ControlMessage) -> crate::Result<()> {
        let data = Parser::marshal_stream(&Record::Control(msg.clone()))?;
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        tracing::debug!("sent message: {}", msg);
        Ok(())
    }

    async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
        self.closed = true;
    }
}

pub struct TcpLinkClientManager {
    host: String,
    port: u16,
}

impl TcpLinkClientManager {
    pub fn new(host: String, port: u16) -> Self {
        TcpLinkClientManager { host, port }
    }
}

#[async_trait]
impl LinkManager for TcpLinkClientManager {
    async fn setup(&mut self) -> crate::Result<()> {
        Ok(())
    }

    async fn create(&mut self) -> crate::Result<Option<Box<dyn Link>>> {
        let stream = match TcpStream::connect((self.host.as_str(), self.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::info!("cannot connect to {}:{}: {}", self.host, self.port, e);
                return Ok(None);
            }
        };
        tracing::info!("connected to {}:{}", self.host, self.port);

        match TcpLink::establish(stream).await {
            Ok(link) => Ok(Some(Box::new(link))),
            Err(e) => {
                tracing::info!("handshake failed: {}", e);
                Ok(None)
            }
        }
    }

    async fn cleanup(&mut self) {}
}

pub struct TcpLinkServerManager {
    port: u16,
    listener: Option<TcpListener>,
}

impl TcpLinkServerManager {
    pub fn new(port: u16) -> Self {
        TcpLinkServerManager {
            port,
            listener: None,
        }
    }
}

#[async_trait]
impl LinkManager for TcpLinkServerManager {
    async fn setup(&mut self) -> crate::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        tracing::info!("listening for TCP connections on port {}", self.port);
        self.listener = Some(listener);
        Ok(())
    }

    async fn create(&mut self) -> crate::Result<Option<Box<dyn Link>>> {
        let listener = self.listener.as_ref().ok_or("manager not set up")?;
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                return Ok(None);
            }
        };
        tracing::debug!("new stream from {}", addr);

        match TcpLink::establish(stream).await {
            Ok(link) => Ok(Some(Box::new(link))),
            Err(e) => {
                tracing::info!("handshake with {} failed: {}", addr, e);
                Ok(None)
            }
        }
    }

    async fn cleanup(&mut self) {
        self.listener = None;
    }
}
