// Ordered, id-keyed message log with oldest-first eviction.
use crate::{Result, StoreError};
use comet_common::Message;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Ordered message store keyed by message id.
///
/// Not internally synchronized; the owning channel serializes access.
///
/// ```
/// use bytes::Bytes;
/// use comet_common::{Message, MessageGroup};
/// use comet_store::MessageLog;
///
/// let mut log = MessageLog::new();
/// for id in 1..=3 {
///     let message = Message::new(id, Bytes::from_static(b"m"), MessageGroup::Private, i64::MAX);
///     log.insert(message).expect("insert");
/// }
/// let after: Vec<i64> = log.successors_after(1).map(|(id, _)| id).collect();
/// assert_eq!(after, vec![2, 3]);
/// ```
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: BTreeMap<i64, Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `message` under its own id; an existing id is an error.
    pub fn insert(&mut self, message: Message) -> Result<()> {
        let id = message.id;
        if self.entries.contains_key(&id) {
            return Err(StoreError::Duplicate(id));
        }
        self.entries.insert(id, message);
        Ok(())
    }

    /// Insert while holding at most `max` entries, evicting the lowest ids first.
    ///
    /// Returns the evicted messages. The new message is inserted even when it
    /// carries the lowest id, so it may be the next one evicted.
    pub fn insert_bounded(&mut self, message: Message, max: usize) -> Result<Vec<Message>> {
        if self.entries.contains_key(&message.id) {
            return Err(StoreError::Duplicate(message.id));
        }
        let mut evicted = Vec::new();
        while !self.entries.is_empty() && self.entries.len() >= max {
            if let Some((_, oldest)) = self.entries.pop_first() {
                evicted.push(oldest);
            }
        }
        if max > 0 {
            self.entries.insert(message.id, message);
        }
        Ok(evicted)
    }

    /// Ascending entries with id strictly greater than `id`.
    pub fn successors_after(&self, id: i64) -> impl Iterator<Item = (i64, &Message)> + '_ {
        self.entries
            .range((Bound::Excluded(id), Bound::Unbounded))
            .map(|(id, message)| (*id, message))
    }

    pub fn delete(&mut self, id: i64) -> Option<Message> {
        self.entries.remove(&id)
    }

    pub fn first(&self) -> Option<&Message> {
        self.entries.first_key_value().map(|(_, message)| message)
    }

    pub fn pop_first(&mut self) -> Option<Message> {
        self.entries.pop_first().map(|(_, message)| message)
    }

    pub fn last_id(&self) -> Option<i64> {
        self.entries.last_key_value().map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
