// TCP subscribe front end: one task per accepted socket.
use super::{Refusal, Subscription, subscribe};
use crate::node::CometNode;
use anyhow::Result;
use bytes::BytesMut;
use comet_wire::{
    AUTH_REPLY, CHANNEL_REPLY, Command, HEARTBEAT, HEARTBEAT_REPLY, NODE_REPLY, PARAM_REPLY,
    RequestDecoder, encode_push,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

const READ_BUFFER_BYTES: usize = 4096;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub async fn serve(listener: TcpListener, node: CometNode) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                // Usually fd exhaustion; keep serving existing clients.
                tracing::warn!(error = %err, "tcp accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        metrics::counter!("comet_tcp_accept_total").increment(1);
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(node, stream).await {
                tracing::debug!(peer = %peer, error = %err, "tcp connection ended with error");
            }
        });
    }
}

pub(crate) async fn handle_connection(node: CometNode, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let decoder = RequestDecoder::new(node.config.max_arg_bytes);
    let mut buf = BytesMut::with_capacity(READ_BUFFER_BYTES);
    // The client gets one default heartbeat interval to send its subscribe.
    let handshake_deadline =
        Instant::now() + Duration::from_secs(node.config.default_heartbeat_secs);

    let request = loop {
        match decoder.decode(&mut buf) {
            Ok(Some(request)) => break request,
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(error = %err, "malformed subscribe request");
                return refuse(&mut writer, PARAM_REPLY).await;
            }
        }
        match tokio::time::timeout_at(handshake_deadline, reader.read_buf(&mut buf)).await {
            Err(_) => {
                tracing::debug!("subscribe request timed out");
                return Ok(());
            }
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err.into()),
        }
    };
    let args = match Command::parse(&request) {
        Ok(Command::Subscribe(args)) => args,
        Err(err) => {
            tracing::debug!(error = %err, "invalid subscribe arguments");
            return refuse(&mut writer, PARAM_REPLY).await;
        }
    };
    let subscription = match subscribe(
        &node,
        &args.key,
        args.heartbeat_secs,
        args.token.as_deref(),
        0,
    )
    .await
    {
        Ok(subscription) => subscription,
        Err(refusal) => return refuse(&mut writer, refusal_reply(&refusal)).await,
    };
    // The reply consumed only the request; bytes after it are heartbeats.
    run_session(subscription, reader, writer, buf).await
}

fn refusal_reply(refusal: &Refusal) -> &'static [u8] {
    match refusal {
        Refusal::Param => PARAM_REPLY,
        Refusal::Auth(_) => AUTH_REPLY,
        Refusal::Channel(_) => CHANNEL_REPLY,
        Refusal::WrongNode => NODE_REPLY,
    }
}

async fn refuse(writer: &mut OwnedWriteHalf, reply: &[u8]) -> Result<()> {
    writer.write_all(reply).await?;
    let _ = writer.shutdown().await;
    Ok(())
}

async fn run_session(
    mut subscription: Subscription,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut buf: BytesMut,
) -> Result<()> {
    let idle = subscription.idle_timeout();
    let mut read_deadline = Instant::now() + idle;
    loop {
        for byte in buf.split().iter() {
            if *byte != HEARTBEAT {
                tracing::debug!(key = %subscription.key, byte = *byte, "unexpected client byte");
                return refuse(&mut writer, PARAM_REPLY).await;
            }
            writer.write_all(HEARTBEAT_REPLY).await?;
        }
        tokio::select! {
            payload = subscription.receiver.next() => {
                let Some(payload) = payload else {
                    tracing::debug!(key = %subscription.key, "connection closed by channel");
                    break;
                };
                writer.write_all(&encode_push(&payload)).await?;
            }
            read = reader.read_buf(&mut buf) => {
                if read? == 0 {
                    break;
                }
                read_deadline = Instant::now() + idle;
            }
            _ = tokio::time::sleep_until(read_deadline) => {
                tracing::debug!(key = %subscription.key, "heartbeat timeout");
                break;
            }
        }
    }
    drop(subscription);
    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CometConfig;
    use bytes::Bytes;
    use comet_common::message::PushPayload;
    use comet_common::{Message, MessageGroup};
    use comet_wire::{Request, decode_push};

    async fn start(node: CometNode) -> Result<std::net::SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(serve(listener, node));
        Ok(addr)
    }

    fn sub(key: &str, heartbeat: &str) -> Bytes {
        Request::new([
            Bytes::from_static(b"sub"),
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(heartbeat.as_bytes()),
        ])
        .encode()
    }

    async fn read_reply(stream: &mut TcpStream) -> Result<Vec<u8>> {
        let mut reply = vec![0u8; 4];
        stream.read_exact(&mut reply).await?;
        Ok(reply)
    }

    #[tokio::test]
    async fn malformed_request_gets_param_reply() -> Result<()> {
        let addr = start(CometNode::from_config(CometConfig::loopback())?).await?;
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(b"?oops\r\n").await?;
        assert_eq!(read_reply(&mut stream).await?, PARAM_REPLY);
        Ok(())
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged_and_pushes_arrive() -> Result<()> {
        let node = CometNode::from_config(CometConfig::loopback())?;
        let addr = start(node.clone()).await?;
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&sub("alice", "5")).await?;
        stream.write_all(b"h").await?;
        assert_eq!(read_reply(&mut stream).await?, HEARTBEAT_REPLY);

        let channel = node.registry.lookup("alice")?;
        let message = Message::new(3, Bytes::from_static(b"ping"), MessageGroup::Private, i64::MAX);
        channel.push_msg(message, "alice").await?;

        let mut buf = BytesMut::new();
        let frame = loop {
            if let Some(frame) = decode_push(&mut buf)? {
                break frame;
            }
            stream.read_buf(&mut buf).await?;
        };
        let payload = PushPayload::decode(&frame)?;
        assert_eq!(payload.mid, 3);
        assert_eq!(payload.msg, Bytes::from_static(b"ping"));
        Ok(())
    }

    #[tokio::test]
    async fn oversized_heartbeat_is_rejected() -> Result<()> {
        let addr = start(CometNode::from_config(CometConfig::loopback())?).await?;
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&sub("alice", "9999")).await?;
        assert_eq!(read_reply(&mut stream).await?, PARAM_REPLY);
        Ok(())
    }

    #[tokio::test]
    async fn session_ends_after_missed_heartbeats() -> Result<()> {
        let node = CometNode::from_config(CometConfig::loopback())?;
        let addr = start(node.clone()).await?;
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&sub("alice", "1")).await?;
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
        assert!(read.is_ok(), "server should close the idle connection");
        assert_eq!(node.registry.connection_count(), 0);
        Ok(())
    }
}
