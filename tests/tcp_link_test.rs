/// Integration tests for the stream link
///
/// Real localhost sockets; one side is usually a raw `TcpStream` acting as
/// a mock peer so that broken preambles and framing can be produced.
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tunlink::codec::frame::ControlMessage;
use tunlink::link::tcp::TcpLink;
use tunlink::link::{CloseReason, Link, LinkEvent};
use tunlink::packet::{Packet, SourceTag};

const MAGIC: [u8; 4] = [0x01, 0x30, 0x6a, 0x15];

async fn linked_pair() -> (TcpLink, TcpLink) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        TcpLink::establish(stream).await.unwrap()
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let client = TcpLink::establish(stream).await.unwrap();
    (client, server.await.unwrap())
}

#[tokio::test]
async fn records_round_trip_both_directions() {
    let (mut client, mut server) = linked_pair().await;

    let payload: Vec<u8> = (0..40).collect();
    client
        .send_packet(Packet::new(
            payload.clone(),
            SourceTag::Device("tun0".to_string()),
        ))
        .await
        .unwrap();
    match server.next_event().await {
        LinkEvent::Packet(packet) => assert_eq!(packet.payload, payload),
        other => panic!("unexpected event: {:?}", other),
    }

    // the control channel runs over the stream transport too
    server
        .send_message(&ControlMessage::ip_request())
        .await
        .unwrap();
    match client.next_event().await {
        LinkEvent::Message(msg) => assert_eq!(msg.msg_type(), "ip_request"),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn stream_close_is_reported() {
    let (mut client, mut server) = linked_pair().await;
    client.shutdown().await;
    drop(client);
    match server.next_event().await {
        LinkEvent::Closed(reason) => assert_eq!(reason, CloseReason::StreamClosed),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn absent_magic_word_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // accept and hold the stream without ever sending the magic word
    let (hold_tx, hold_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = hold_rx.await;
        drop(stream);
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let started = tokio::time::Instant::now();
    assert!(TcpLink::establish(stream).await.is_err());
    assert!(started.elapsed() >= Duration::from_secs(5));
    drop(hold_tx);
}

#[tokio::test]
async fn wrong_magic_word_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(&[0x91, 0x92, 0x93, 0x94]).await.unwrap();
        // drain the peer's magic so the write is not reset
        let mut word = [0u8; 4];
        let _ = stream.read_exact(&mut word).await;
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    assert!(TcpLink::establish(stream).await.is_err());
}

#[tokio::test]
async fn oversize_frame_breaks_the_link() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        TcpLink::establish(stream).await.unwrap()
    });

    // mock peer speaks the preamble, then claims a frame beyond the ceiling
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&MAGIC).await.unwrap();
    let mut word = [0u8; 4];
    stream.read_exact(&mut word).await.unwrap();
    assert_eq!(word, MAGIC);

    let mut server = server.await.unwrap();
    stream.write_all(&[0xff, 0xff]).await.unwrap();
    stream.flush().await.unwrap();

    match server.next_event().await {
        LinkEvent::Closed(CloseReason::ProtocolError(_)) => {}
        other => panic!("unexpected event: {:?}", other),
    }
}
