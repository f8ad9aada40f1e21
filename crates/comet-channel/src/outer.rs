// Channel variant backed by the upstream offline-message store.
use crate::conn::{ConnId, ConnTable, Connection};
use crate::token::TokenRegistry;
use crate::{Channel, ChannelConfig, ChannelError, Result, next_message_id};
use async_trait::async_trait;
use comet_common::{IdSource, Message, MessageGroup, now_nanos};
use comet_store::MessageStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug)]
struct OuterState {
    conns: ConnTable,
    tokens: Option<TokenRegistry>,
    closed: bool,
}

/// Persisted channel: private messages are saved upstream before delivery and
/// history is fetched from the store when a connection attaches.
///
/// Pushes and attaches are serialized by `push_lock`, held across the store
/// round-trip, so a connection's history and its live pushes never interleave.
/// Private ids come from the node's shared `IdSource`, the same one that
/// assigns public broadcast ids.
#[derive(Debug)]
pub struct OuterChannel {
    push_lock: tokio::sync::Mutex<()>,
    ids: IdSource,
    state: Mutex<OuterState>,
    store: Arc<dyn MessageStore>,
    deadline: AtomicI64,
    max_conns: usize,
}

impl OuterChannel {
    pub fn new(config: &ChannelConfig, store: Arc<dyn MessageStore>) -> Self {
        Self {
            push_lock: tokio::sync::Mutex::new(()),
            ids: config.ids.clone(),
            state: Mutex::new(OuterState {
                conns: ConnTable::default(),
                tokens: config.token_registry(),
                closed: false,
            }),
            store,
            deadline: AtomicI64::new(0),
            max_conns: config.max_conns,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.state.lock().closed {
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    fn check_capacity(&self, id: ConnId) -> Result<()> {
        let state = self.state.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        if !state.conns.contains(id) && state.conns.len() >= self.max_conns {
            return Err(ChannelError::MaxConn {
                max: self.max_conns,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for OuterChannel {
    async fn push_msg(&self, message: Message, key: &str) -> Result<i64> {
        if message.is_expired(now_nanos()) {
            return Err(ChannelError::MessageExpired);
        }
        let push = self.push_lock.lock().await;
        self.check_open()?;
        // Public broadcasts are live-only and keep the publisher's id.
        let message = match message.group {
            MessageGroup::Public => message,
            MessageGroup::Private => {
                let id = next_message_id(&self.ids)
                    .await
                    .map_err(ChannelError::Id)?;
                let message = message.with_id(id);
                if let Err(err) = self.store.save(key, &message).await {
                    tracing::warn!(key = %key, id = message.id, error = %err, "message save failed");
                    return Err(err.into());
                }
                message
            }
        };
        let payload = message.encode_push()?;
        let delivered = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ChannelError::Closed);
            }
            state.conns.fan_out(key, message.id, &payload)
        };
        drop(push);
        metrics::counter!("comet_push_total").increment(1);
        tracing::debug!(key = %key, id = message.id, delivered, "message pushed");
        Ok(message.id)
    }

    // History was delivered from the store when the connection attached.
    fn send_offline_msg(&self, _conn: &Connection, _since_id: i64, _key: &str) -> Result<usize> {
        Ok(0)
    }

    async fn add_conn(&self, conn: Connection, last_id: i64, key: &str) -> Result<()> {
        self.check_capacity(conn.id())?;
        let _push = self.push_lock.lock().await;
        let history = self.store.get(key, last_id).await?;
        let now = now_nanos();
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        state
            .conns
            .insert(conn.clone(), last_id, false, self.max_conns)?;
        let mut seen = last_id;
        let mut sent = 0u64;
        for message in history {
            if message.id <= seen || message.is_expired(now) {
                continue;
            }
            let written = message
                .encode_push()
                .map_err(ChannelError::from)
                .and_then(|payload| conn.write(payload).map_err(ChannelError::from));
            if let Err(err) = written {
                state.conns.remove(conn.id());
                return Err(err);
            }
            seen = message.id;
            sent += 1;
        }
        state.conns.advance(conn.id(), seen);
        let count = state.conns.len();
        drop(state);
        metrics::counter!("comet_offline_sent_total").increment(sent);
        tracing::debug!(
            key = %key,
            conn = %conn.id(),
            last_id,
            sent,
            conns = count,
            "connection attached"
        );
        Ok(())
    }

    fn remove_conn(&self, id: ConnId, key: &str) {
        if self.state.lock().conns.remove(id) {
            tracing::debug!(key = %key, conn = %id, "connection detached");
        }
    }

    fn add_token(&self, ticket: &str) -> Result<()> {
        match self.state.lock().tokens.as_mut() {
            Some(tokens) => tokens.add(ticket),
            None => Ok(()),
        }
    }

    fn auth_token(&self, ticket: &str) -> Result<()> {
        match self.state.lock().tokens.as_mut() {
            Some(tokens) => tokens.auth(ticket),
            None => Ok(()),
        }
    }

    fn set_deadline(&self, deadline: i64) {
        self.deadline.store(deadline, Ordering::Release);
    }

    fn deadline(&self) -> i64 {
        self.deadline.load(Ordering::Acquire)
    }

    fn conn_count(&self) -> usize {
        self.state.lock().conns.len()
    }

    fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        if let Some(tokens) = state.tokens.as_mut() {
            tokens.clear();
        }
        state.conns.close_all()
    }
}
