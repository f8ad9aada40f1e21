// Connection handles attached to channels.
// A channel never touches sockets: it hands encoded payloads to a bounded
// per-connection queue, and the transport task owning the socket drains it.
use crate::{ChannelError, Result};
use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    fn next() -> Self {
        Self(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    #[error("connection queue full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Channel-side handle to one live client connection.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnId,
    sender: mpsc::Sender<Bytes>,
    closer: CancellationToken,
}

/// Transport-side half: yields payloads to write and signals close requests.
#[derive(Debug)]
pub struct ConnectionReceiver {
    id: ConnId,
    receiver: mpsc::Receiver<Bytes>,
    closer: CancellationToken,
}

impl Connection {
    /// Create a handle pair with a queue of `depth` pending payloads.
    pub fn pair(depth: usize) -> (Connection, ConnectionReceiver) {
        let (sender, receiver) = mpsc::channel(depth.max(1));
        let closer = CancellationToken::new();
        let id = ConnId::next();
        (
            Connection {
                id,
                sender,
                closer: closer.clone(),
            },
            ConnectionReceiver {
                id,
                receiver,
                closer,
            },
        )
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Queue `payload` without waiting; a slow or gone client only fails itself.
    pub fn write(&self, payload: Bytes) -> Result<(), WriteError> {
        if self.closer.is_cancelled() {
            return Err(WriteError::Closed);
        }
        self.sender.try_send(payload).map_err(|err| match err {
            TrySendError::Full(_) => WriteError::Full,
            TrySendError::Closed(_) => WriteError::Closed,
        })
    }

    /// Ask the owning transport task to tear the connection down.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled() || self.sender.is_closed()
    }
}

impl ConnectionReceiver {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.receiver.try_recv().ok()
    }

    /// Next payload to write, or `None` once a close was requested.
    pub async fn next(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            _ = self.closer.cancelled() => None,
            payload = self.receiver.recv() => payload,
        }
    }

    /// Resolves once a channel or the transport requested close.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closer.cancelled()
    }

    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }
}

#[derive(Debug)]
pub(crate) struct ConnEntry {
    conn: Connection,
    // Highest message id written to this connection.
    last_id: i64,
    // Live pushes are held back until offline replay has caught the
    // connection up, so it never sees a newer id before an older one.
    awaiting_replay: bool,
}

/// Connections attached to one channel, keyed by handle id.
#[derive(Debug, Default)]
pub(crate) struct ConnTable {
    entries: HashMap<ConnId, ConnEntry, RandomState>,
}

impl ConnTable {
    pub(crate) fn insert(
        &mut self,
        conn: Connection,
        last_id: i64,
        awaiting_replay: bool,
        max_conns: usize,
    ) -> Result<()> {
        if !self.entries.contains_key(&conn.id()) && self.entries.len() >= max_conns {
            return Err(ChannelError::MaxConn { max: max_conns });
        }
        self.entries.insert(
            conn.id(),
            ConnEntry {
                conn,
                last_id,
                awaiting_replay,
            },
        );
        Ok(())
    }

    pub(crate) fn remove(&mut self, id: ConnId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub(crate) fn contains(&self, id: ConnId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn last_id(&self, id: ConnId) -> Option<i64> {
        self.entries.get(&id).map(|entry| entry.last_id)
    }

    pub(crate) fn advance(&mut self, id: ConnId, delivered: i64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.last_id = entry.last_id.max(delivered);
        }
    }

    pub(crate) fn finish_replay(&mut self, id: ConnId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.awaiting_replay = false;
        }
    }

    /// Write `payload` to every connection, skipping failures.
    ///
    /// Connections that already saw an id at or above `message_id` are skipped,
    /// as are connections still awaiting offline replay (the replay picks the
    /// message up from the log). Returns the number of successful writes.
    pub(crate) fn fan_out(&mut self, key: &str, message_id: i64, payload: &Bytes) -> usize {
        let mut delivered = 0;
        for entry in self.entries.values_mut() {
            if entry.awaiting_replay || message_id <= entry.last_id {
                continue;
            }
            match entry.conn.write(payload.clone()) {
                Ok(()) => {
                    entry.last_id = entry.last_id.max(message_id);
                    delivered += 1;
                }
                Err(err) => {
                    metrics::counter!("comet_push_skipped_total").increment(1);
                    tracing::warn!(
                        key = %key,
                        conn = %entry.conn.id(),
                        error = %err,
                        "push skipped connection"
                    );
                }
            }
        }
        delivered
    }

    /// Close and forget every connection.
    pub(crate) fn close_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            entry.conn.close();
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_reaches_receiver() {
        let (conn, mut rx) = Connection::pair(4);
        assert_eq!(conn.id(), rx.id());
        conn.write(Bytes::from_static(b"one")).expect("write");
        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"one")));
    }

    #[test]
    fn full_queue_fails_without_blocking() {
        let (conn, _rx) = Connection::pair(1);
        conn.write(Bytes::from_static(b"a")).expect("write");
        assert_eq!(conn.write(Bytes::from_static(b"b")), Err(WriteError::Full));
    }

    #[test]
    fn dropped_receiver_is_closed() {
        let (conn, rx) = Connection::pair(1);
        drop(rx);
        assert!(conn.is_closed());
        assert_eq!(conn.write(Bytes::from_static(b"a")), Err(WriteError::Closed));
    }

    #[tokio::test]
    async fn next_stops_at_close() {
        let (conn, mut rx) = Connection::pair(4);
        conn.write(Bytes::from_static(b"a")).expect("write");
        assert_eq!(rx.next().await, Some(Bytes::from_static(b"a")));
        conn.close();
        assert_eq!(rx.next().await, None);
    }

    #[tokio::test]
    async fn close_signals_transport() {
        let (conn, rx) = Connection::pair(1);
        conn.close();
        rx.closed().await;
        assert!(rx.is_closed());
        assert_eq!(conn.write(Bytes::from_static(b"a")), Err(WriteError::Closed));
    }

    #[test]
    fn table_enforces_connection_cap() {
        let mut table = ConnTable::default();
        let (a, _ra) = Connection::pair(1);
        let (b, _rb) = Connection::pair(1);
        table.insert(a.clone(), 0, false, 1).expect("first");
        assert!(matches!(
            table.insert(b, 0, false, 1),
            Err(ChannelError::MaxConn { max: 1 })
        ));
        // Re-registering an attached handle is not a new connection.
        table.insert(a, 5, false, 1).expect("refresh");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn fan_out_skips_failed_and_already_seen_connections() {
        let mut table = ConnTable::default();
        let (fresh, mut fresh_rx) = Connection::pair(4);
        let (seen, mut seen_rx) = Connection::pair(4);
        let (gone, gone_rx) = Connection::pair(4);
        drop(gone_rx);
        table.insert(fresh.clone(), 0, false, 8).expect("insert");
        table.insert(seen.clone(), 10, false, 8).expect("insert");
        table.insert(gone, 0, false, 8).expect("insert");

        let delivered = table.fan_out("k", 10, &Bytes::from_static(b"m"));
        assert_eq!(delivered, 1);
        assert_eq!(fresh_rx.try_recv(), Some(Bytes::from_static(b"m")));
        assert_eq!(seen_rx.try_recv(), None);
        assert_eq!(table.last_id(fresh.id()), Some(10));
    }

    #[test]
    fn fan_out_holds_back_connections_awaiting_replay() {
        let mut table = ConnTable::default();
        let (conn, mut rx) = Connection::pair(4);
        table.insert(conn.clone(), 0, true, 8).expect("insert");
        assert_eq!(table.fan_out("k", 1, &Bytes::from_static(b"a")), 0);
        assert_eq!(rx.try_recv(), None);

        table.finish_replay(conn.id());
        assert_eq!(table.fan_out("k", 2, &Bytes::from_static(b"b")), 1);
        assert_eq!(rx.try_recv(), Some(Bytes::from_static(b"b")));
    }

    #[test]
    fn close_all_cancels_connections() {
        let mut table = ConnTable::default();
        let (conn, rx) = Connection::pair(1);
        table.insert(conn, 0, false, 8).expect("insert");
        assert_eq!(table.close_all(), 1);
        assert!(rx.is_closed());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn ids_are_unique() {
        let (a, _) = Connection::pair(1);
        let (b, _) = Connection::pair(1);
        assert_ne!(a.id(), b.id());
    }
}
