// Sharded key -> channel map, lazy expiry and ring-driven migration.
use crate::{Channel, ChannelConfig, ChannelError, ChannelKind, InnerChannel, OuterChannel, Result};
use ahash::RandomState;
use comet_common::deadline_after;
use comet_ring::Ketama;
use comet_store::MessageStore;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

type Bucket = HashMap<String, Arc<dyn Channel>, RandomState>;

/// Result of a successful migration.
#[derive(Debug)]
pub struct MigrateOutcome {
    /// Ring built from the new membership; callers swap it in for routing.
    pub ring: Ketama,
    /// Keys whose channels were closed because another node now owns them.
    pub closed: Vec<String>,
}

/// Owns every channel on this node, split over a power-of-two number of
/// independently locked buckets.
///
/// Bucket locks only guard map access. Channels are always closed after the
/// bucket lock is released.
pub struct ChannelRegistry {
    buckets: Box<[Mutex<Bucket>]>,
    mask: usize,
    hasher: RandomState,
    config: ChannelConfig,
    store: Option<Arc<dyn MessageStore>>,
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("buckets", &self.buckets.len())
            .field("kind", &self.config.kind)
            .finish_non_exhaustive()
    }
}

impl ChannelRegistry {
    /// `store` is required for [`ChannelKind::Outer`] and ignored otherwise.
    pub fn new(
        buckets: usize,
        config: ChannelConfig,
        store: Option<Arc<dyn MessageStore>>,
    ) -> Result<Self> {
        if buckets == 0 || !buckets.is_power_of_two() {
            return Err(ChannelError::Config(format!(
                "bucket count {buckets} is not a power of two"
            )));
        }
        if config.kind == ChannelKind::Outer && store.is_none() {
            return Err(ChannelError::Config(
                "outer channels need a message store".into(),
            ));
        }
        let hasher = RandomState::new();
        let mask = buckets - 1;
        let buckets = (0..buckets)
            .map(|_| Mutex::new(HashMap::with_hasher(hasher.clone())))
            .collect();
        Ok(Self {
            buckets,
            mask,
            hasher,
            config,
            store,
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn bucket(&self, key: &str) -> &Mutex<Bucket> {
        let index = (self.hasher.hash_one(key) as usize) & self.mask;
        &self.buckets[index]
    }

    fn build(&self) -> Arc<dyn Channel> {
        let channel: Arc<dyn Channel> = match (self.config.kind, &self.store) {
            (ChannelKind::Outer, Some(store)) => {
                Arc::new(OuterChannel::new(&self.config, store.clone()))
            }
            _ => Arc::new(InnerChannel::new(&self.config)),
        };
        channel.set_deadline(deadline_after(self.config.expire));
        channel
    }

    /// Existing channel for `key` with its deadline refreshed, or a new one.
    pub fn get_or_create(&self, key: &str) -> Arc<dyn Channel> {
        let mut bucket = self.bucket(key).lock();
        if let Some(channel) = bucket.get(key) {
            channel.set_deadline(deadline_after(self.config.expire));
            return channel.clone();
        }
        let channel = self.build();
        bucket.insert(key.to_string(), channel.clone());
        drop(bucket);
        tracing::debug!(key = %key, kind = %self.config.kind, "channel created");
        channel
    }

    /// Channel for `key`, refreshing its deadline.
    ///
    /// A channel found past its deadline is removed and closed by this call,
    /// which then reports [`ChannelError::Expired`]. Callers treat that like
    /// [`ChannelError::NotExist`].
    pub fn lookup(&self, key: &str) -> Result<Arc<dyn Channel>> {
        let mut bucket = self.bucket(key).lock();
        let Some(channel) = bucket.get(key) else {
            return Err(ChannelError::NotExist);
        };
        if !channel.timeout() {
            channel.set_deadline(deadline_after(self.config.expire));
            return Ok(channel.clone());
        }
        let expired = bucket.remove(key);
        drop(bucket);
        if let Some(channel) = expired {
            let closed = channel.close();
            metrics::counter!("comet_channels_expired_total").increment(1);
            tracing::info!(key = %key, closed_conns = closed, "channel expired");
        }
        Err(ChannelError::Expired)
    }

    /// Whether `key` has a registered channel. No deadline side effects.
    pub fn contains(&self, key: &str) -> bool {
        self.bucket(key).lock().contains_key(key)
    }

    /// Remove and close the channel for `key`.
    pub fn close(&self, key: &str) -> Result<()> {
        let removed = self.bucket(key).lock().remove(key);
        let channel = removed.ok_or(ChannelError::NotExist)?;
        let closed = channel.close();
        tracing::info!(key = %key, closed_conns = closed, "channel closed");
        Ok(())
    }

    /// Close every channel whose key `nodes` assigns to a node other than `local`.
    ///
    /// Refused without touching any channel when `local` is missing from
    /// `nodes`. Buckets are scanned one at a time and the collected channels
    /// are closed after all bucket locks are released.
    pub fn migrate(&self, local: &str, nodes: &[String], vnodes: usize) -> Result<MigrateOutcome> {
        if !nodes.iter().any(|node| node == local) {
            tracing::error!(node = %local, nodes = ?nodes, "migration refused, local node missing");
            return Err(ChannelError::MigrateRefused {
                node: local.to_string(),
            });
        }
        let ring = Ketama::new(nodes.iter().cloned(), vnodes);
        let mut moved = Vec::new();
        for bucket in self.buckets.iter() {
            let mut bucket = bucket.lock();
            let keys: Vec<String> = bucket
                .keys()
                .filter(|key| !ring.owns(local, key))
                .cloned()
                .collect();
            for key in keys {
                if let Some(channel) = bucket.remove(&key) {
                    moved.push((key, channel));
                }
            }
        }
        let mut closed = Vec::with_capacity(moved.len());
        for (key, channel) in moved {
            let conns = channel.close();
            tracing::info!(key = %key, closed_conns = conns, "channel migrated away");
            closed.push(key);
        }
        metrics::counter!("comet_channels_migrated_total").increment(closed.len() as u64);
        tracing::info!(
            node = %local,
            nodes = ring.nodes().len(),
            vnodes,
            closed = closed.len(),
            "migration complete"
        );
        Ok(MigrateOutcome { ring, closed })
    }

    /// Close every channel, returning how many were closed.
    pub fn close_all(&self) -> usize {
        let mut drained = Vec::new();
        for bucket in self.buckets.iter() {
            drained.extend(bucket.lock().drain().map(|(_, channel)| channel));
        }
        for channel in &drained {
            channel.close();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connections attached across all channels.
    pub fn connection_count(&self) -> usize {
        let channels: Vec<Arc<dyn Channel>> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.lock().values().cloned().collect::<Vec<_>>())
            .collect();
        channels.iter().map(|channel| channel.conn_count()).sum()
    }
}
