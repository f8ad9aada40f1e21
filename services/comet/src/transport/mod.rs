// Client-facing subscribe transports and the attach path they share.
use crate::node::CometNode;
use comet_channel::{Channel, ChannelError, Connection, ConnectionReceiver};
use std::sync::Arc;
use std::time::Duration;

pub mod tcp;
pub mod websocket;

/// Why a subscribe was turned away before the session started.
#[derive(Debug)]
pub enum Refusal {
    /// Malformed request or heartbeat outside the allowed range.
    Param,
    /// Ticket missing, unknown or expired.
    Auth(Option<ChannelError>),
    /// Channel refused the connection (cap reached, closing, store error).
    Channel(ChannelError),
    /// Another node owns the key; the client should re-route.
    WrongNode,
}

/// A connection attached to its channel. Detaches itself on drop.
#[derive(Debug)]
pub struct Subscription {
    pub key: String,
    pub heartbeat: Duration,
    pub receiver: ConnectionReceiver,
    conn: Connection,
    channel: Arc<dyn Channel>,
}

impl Subscription {
    /// Read deadline slack: two missed heartbeats end the session.
    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat.saturating_mul(2)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.channel.remove_conn(self.conn.id(), &self.key);
        self.conn.close();
        metrics::gauge!("comet_connections").decrement(1.0);
        tracing::debug!(key = %self.key, conn = %self.conn.id(), "subscription ended");
    }
}

/// Validate, authenticate and attach a subscriber, then queue its backlog.
pub async fn subscribe(
    node: &CometNode,
    key: &str,
    heartbeat_secs: u64,
    token: Option<&str>,
    last_id: i64,
) -> Result<Subscription, Refusal> {
    if key.is_empty() {
        return Err(Refusal::Param);
    }
    let heartbeat = node
        .config
        .heartbeat(heartbeat_secs)
        .ok_or(Refusal::Param)?;
    if !node.owns(key) {
        tracing::debug!(key = %key, node = %node.node_id(), "subscribe for key owned elsewhere");
        return Err(Refusal::WrongNode);
    }
    let channel = node.registry.get_or_create(key);
    if node.config.token_auth {
        let ticket = token.ok_or(Refusal::Auth(None))?;
        if let Err(err) = channel.auth_token(ticket) {
            tracing::info!(key = %key, error = %err, "subscribe auth failed");
            return Err(Refusal::Auth(Some(err)));
        }
    }
    let (conn, receiver) = Connection::pair(node.config.connection_queue_depth());
    if let Err(err) = channel.add_conn(conn.clone(), last_id, key).await {
        tracing::info!(key = %key, error = %err, "subscribe rejected by channel");
        return Err(Refusal::Channel(err));
    }
    metrics::gauge!("comet_connections").increment(1.0);
    let subscription = Subscription {
        key: key.to_string(),
        heartbeat,
        receiver,
        conn,
        channel,
    };
    // Dropping the subscription on failure detaches the connection again.
    let sent = subscription
        .channel
        .send_offline_msg(&subscription.conn, last_id, key)
        .map_err(Refusal::Channel)?;
    tracing::debug!(
        key = %key,
        conn = %subscription.conn.id(),
        heartbeat_secs = heartbeat.as_secs(),
        offline = sent,
        "subscribed"
    );
    Ok(subscription)
}
