#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use comet::CometNode;
use comet::transport::{tcp, websocket};
use comet_common::message::PushPayload;
use comet_wire::{Request, decode_push};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

pub async fn start_tcp(node: &CometNode) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(tcp::serve(listener, node.clone()));
    addr
}

pub async fn start_websocket(node: &CometNode) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(websocket::serve(listener, node.clone()));
    addr
}

pub async fn start_admin(node: &CometNode) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(comet::rpc::serve(listener, node.clone()));
    format!("http://{addr}")
}

pub fn build_test_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(1))
        .no_proxy()
        .build()
        .expect("client")
}

pub fn subscribe_request(key: &str, heartbeat: u64, token: Option<&str>) -> Bytes {
    let mut args = vec![
        Bytes::from_static(b"sub"),
        Bytes::from(key.to_string()),
        Bytes::from(heartbeat.to_string()),
    ];
    if let Some(token) = token {
        args.push(Bytes::from(token.to_string()));
    }
    Request::new(args).encode()
}

pub async fn read_reply(stream: &mut TcpStream) -> Vec<u8> {
    let mut reply = vec![0u8; 4];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut reply))
        .await
        .expect("reply in time")
        .expect("read reply");
    reply
}

/// Read the next push frame, keeping leftovers in `buf`.
pub async fn read_push(stream: &mut TcpStream, buf: &mut BytesMut) -> PushPayload {
    loop {
        if let Some(frame) = decode_push(buf).expect("valid frame") {
            return PushPayload::decode(&frame).expect("payload");
        }
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read_buf(buf))
            .await
            .expect("push in time")
            .expect("read push");
        assert!(read > 0, "server closed before push arrived");
    }
}

/// Poll until the node reports `expected` attached connections.
pub async fn wait_for_connections(node: &CometNode, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while node.registry.connection_count() != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {expected} connections, have {}",
            node.registry.connection_count()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
