// Channel variant that retains recent messages in memory on this node.
use crate::conn::{ConnId, ConnTable, Connection};
use crate::token::TokenRegistry;
use crate::{Channel, ChannelConfig, ChannelError, Result};
use async_trait::async_trait;
use comet_common::{Message, now_nanos};
use comet_store::{MessageLog, StoreError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug)]
struct InnerState {
    conns: ConnTable,
    log: MessageLog,
    tokens: Option<TokenRegistry>,
    closed: bool,
}

/// In-memory channel: a bounded id-ordered log plus the attached connections.
///
/// Newly attached connections receive live pushes only after
/// [`Channel::send_offline_msg`] has replayed the retained backlog to them.
#[derive(Debug)]
pub struct InnerChannel {
    state: Mutex<InnerState>,
    deadline: AtomicI64,
    max_conns: usize,
    max_messages: usize,
}

impl InnerChannel {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            state: Mutex::new(InnerState {
                conns: ConnTable::default(),
                log: MessageLog::new(),
                tokens: config.token_registry(),
                closed: false,
            }),
            deadline: AtomicI64::new(0),
            max_conns: config.max_conns,
            max_messages: config.max_messages,
        }
    }

    /// Ids currently retained, ascending.
    pub fn retained_ids(&self) -> Vec<i64> {
        self.state
            .lock()
            .log
            .successors_after(i64::MIN)
            .map(|(id, _)| id)
            .collect()
    }
}

#[async_trait]
impl Channel for InnerChannel {
    async fn push_msg(&self, message: Message, key: &str) -> Result<i64> {
        if message.is_expired(now_nanos()) {
            return Err(ChannelError::MessageExpired);
        }
        let id = message.id;
        let payload = message.encode_push()?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        match state.log.insert_bounded(message, self.max_messages) {
            Ok(evicted) if !evicted.is_empty() => {
                tracing::debug!(key = %key, evicted = evicted.len(), "evicted oldest messages");
            }
            Ok(_) => {}
            Err(StoreError::Duplicate(id)) => return Err(ChannelError::DuplicateMessage(id)),
            Err(err) => return Err(err.into()),
        }
        let delivered = state.conns.fan_out(key, id, &payload);
        drop(state);
        metrics::counter!("comet_push_total").increment(1);
        tracing::debug!(key = %key, id, delivered, "message pushed");
        Ok(id)
    }

    fn send_offline_msg(&self, conn: &Connection, since_id: i64, key: &str) -> Result<usize> {
        let now = now_nanos();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(ChannelError::Closed);
        }
        let start = state
            .conns
            .last_id(conn.id())
            .map_or(since_id, |seen| seen.max(since_id));
        let mut expired = Vec::new();
        let mut sent = 0;
        let mut last = start;
        let mut outcome = Ok(());
        for (id, message) in state.log.successors_after(start) {
            if message.is_expired(now) {
                expired.push(id);
                continue;
            }
            let written = message
                .encode_push()
                .map_err(ChannelError::from)
                .and_then(|payload| conn.write(payload).map_err(ChannelError::from));
            if let Err(err) = written {
                outcome = Err(err);
                break;
            }
            sent += 1;
            last = id;
        }
        for id in expired {
            state.log.delete(id);
        }
        state.conns.advance(conn.id(), last);
        outcome?;
        state.conns.finish_replay(conn.id());
        drop(guard);
        metrics::counter!("comet_offline_sent_total").increment(sent as u64);
        tracing::debug!(key = %key, conn = %conn.id(), since_id, sent, "offline messages sent");
        Ok(sent)
    }

    async fn add_conn(&self, conn: Connection, last_id: i64, key: &str) -> Result<()> {
        let id = conn.id();
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        state.conns.insert(conn, last_id, true, self.max_conns)?;
        let count = state.conns.len();
        drop(state);
        tracing::debug!(key = %key, conn = %id, last_id, conns = count, "connection attached");
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
        state.log.clear();
        if let Some(tokens) = state.tokens.as_mut() {
            tokens.clear();
        }
        state.conns.close_all()
    }
}
