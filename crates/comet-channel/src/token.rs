// Per-channel auth tickets: bounded LRU with sliding TTL.
use crate::{ChannelError, Result};
use ahash::RandomState;
use hashbrown::HashMap;
use slab::Slab;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct TokenEntry {
    ticket: String,
    expire: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Bounded set of auth tickets ordered from least to most recently used.
///
/// Entries live in a slab-backed doubly linked list so eviction of the oldest
/// entry and move-to-back on auth are O(1).
#[derive(Debug)]
pub struct TokenRegistry {
    index: HashMap<String, usize, RandomState>,
    entries: Slab<TokenEntry>,
    // Least recently used end.
    head: Option<usize>,
    // Most recently used end.
    tail: Option<usize>,
    max_tokens: usize,
    ttl: Duration,
}

impl TokenRegistry {
    pub fn new(max_tokens: usize, ttl: Duration) -> Self {
        Self {
            index: HashMap::with_hasher(RandomState::new()),
            entries: Slab::new(),
            head: None,
            tail: None,
            max_tokens: max_tokens.max(1),
            ttl,
        }
    }

    pub fn add(&mut self, ticket: &str) -> Result<()> {
        self.add_at(ticket, Instant::now())
    }

    pub fn auth(&mut self, ticket: &str) -> Result<()> {
        self.auth_at(ticket, Instant::now())
    }

    pub fn add_at(&mut self, ticket: &str, now: Instant) -> Result<()> {
        self.purge_expired(now);
        if self.index.contains_key(ticket) {
            return Err(ChannelError::TokenExists);
        }
        while self.index.len() >= self.max_tokens {
            match self.head {
                Some(oldest) => self.remove_slot(oldest),
                None => break,
            }
        }
        let slot = self.entries.insert(TokenEntry {
            ticket: ticket.to_string(),
            expire: now + self.ttl,
            prev: None,
            next: None,
        });
        self.link_back(slot);
        self.index.insert(ticket.to_string(), slot);
        Ok(())
    }

    pub fn auth_at(&mut self, ticket: &str, now: Instant) -> Result<()> {
        let result = match self.index.get(ticket).copied() {
            None => Err(ChannelError::TokenNotFound),
            Some(slot) if self.entries[slot].expire <= now => {
                self.remove_slot(slot);
                Err(ChannelError::TokenExpired)
            }
            Some(slot) => {
                self.entries[slot].expire = now + self.ttl;
                self.unlink(slot);
                self.link_back(slot);
                Ok(())
            }
        };
        self.purge_expired(now);
        result
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.entries.clear();
        self.head = None;
        self.tail = None;
    }

    // Auth refreshes move entries to the back, so expiry is only ordered up to
    // the first live entry; stop there rather than scanning the whole list.
    fn purge_expired(&mut self, now: Instant) {
        while let Some(slot) = self.head {
            if self.entries[slot].expire > now {
                break;
            }
            self.remove_slot(slot);
        }
    }

    fn remove_slot(&mut self, slot: usize) {
        self.unlink(slot);
        let entry = self.entries.remove(slot);
        self.index.remove(&entry.ticket);
    }

    fn link_back(&mut self, slot: usize) {
        self.entries[slot].prev = self.tail;
        self.entries[slot].next = None;
        match self.tail {
            Some(tail) => self.entries[tail].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let entry = &self.entries[slot];
            (entry.prev, entry.next)
        };
        match prev {
            Some(prev) => self.entries[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.entries[next].prev = prev,
            None => self.tail = prev,
        }
        self.entries[slot].prev = None;
        self.entries[slot].next = None;
    }
}
