// Shared node state handed to the transports, the admin RPC and the
// membership watcher.
use crate::config::CometConfig;
use crate::message_client::HttpMessageStore;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use comet_channel::{ChannelError, ChannelKind, ChannelRegistry};
use comet_common::IdSource;
use comet_ring::Ketama;
use comet_store::MessageStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const MESSAGE_STORE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct CometNode {
    pub config: Arc<CometConfig>,
    pub registry: Arc<ChannelRegistry>,
    // Replaced wholesale on migration; readers never see a partial ring.
    ring: Arc<ArcSwap<Ketama>>,
    // Held across registry pruning and the ring swap.
    migrate_lock: Arc<Mutex<()>>,
    ids: IdSource,
}

impl CometNode {
    /// Build from config, connecting outer channels to the HTTP message store.
    pub fn from_config(config: CometConfig) -> Result<Self> {
        let store: Option<Arc<dyn MessageStore>> =
            match (&config.channel_kind, &config.message_store_url) {
                (ChannelKind::Outer, Some(url)) => Some(Arc::new(
                    HttpMessageStore::new(url, MESSAGE_STORE_TIMEOUT)
                        .context("build message store client")?,
                )),
                _ => None,
            };
        Self::with_store(config, store)
    }

    pub fn with_store(config: CometConfig, store: Option<Arc<dyn MessageStore>>) -> Result<Self> {
        let ids = IdSource::snowflake(config.worker_id).context("build id generator")?;
        let mut channel_config = config.channel_config();
        channel_config.ids = ids.clone();
        let registry = ChannelRegistry::new(config.channel_buckets, channel_config, store)
            .context("build channel registry")?;
        let ring = Ketama::new(config.nodes.iter().cloned(), config.vnodes);
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            ring: Arc::new(ArcSwap::from_pointee(ring)),
            migrate_lock: Arc::new(Mutex::new(())),
            ids,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Whether this node owns `key` under the current ring.
    pub fn owns(&self, key: &str) -> bool {
        self.ring.load().owns(&self.config.node_id, key)
    }

    pub fn ring(&self) -> Arc<Ketama> {
        self.ring.load_full()
    }

    /// Id for an admin push that did not bring one. Shares the sequence
    /// persisted channels assign private ids from.
    pub async fn next_message_id(&self) -> comet_common::Result<i64> {
        comet_channel::next_message_id(&self.ids).await
    }

    /// Close channels that `nodes` moves off this node, then route by the new ring.
    ///
    /// Concurrent calls are serialized so the installed ring is always the
    /// one the registry was last pruned against.
    pub fn migrate(&self, nodes: &[String], vnodes: usize) -> Result<Vec<String>, ChannelError> {
        let _migrating = self.migrate_lock.lock();
        let outcome = self.registry.migrate(&self.config.node_id, nodes, vnodes)?;
        self.ring.store(Arc::new(outcome.ring));
        Ok(outcome.closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use comet_channel::{Channel, Connection};
    use comet_common::message::PushPayload;
    use comet_common::{Message, MessageGroup};
    use comet_store::MemoryMessageStore;

    #[test]
    fn single_node_owns_everything() -> Result<()> {
        let node = CometNode::from_config(CometConfig::loopback())?;
        assert!(node.owns("alice"));
        assert!(node.owns(""));
        Ok(())
    }

    #[test]
    fn migrate_swaps_the_ring() -> Result<()> {
        let node = CometNode::from_config(CometConfig::loopback())?;
        let keys: Vec<String> = (0..64).map(|i| format!("k{i}")).collect();
        for key in &keys {
            node.registry.get_or_create(key);
        }
        let nodes = vec!["1".to_string(), "2".to_string()];
        let closed = node.migrate(&nodes, 255)?;
        assert_eq!(node.ring().nodes(), nodes.as_slice());
        for key in &closed {
            assert!(!node.owns(key));
            assert!(!node.registry.contains(key));
        }
        assert_eq!(node.registry.len() + closed.len(), keys.len());
        Ok(())
    }

    #[test]
    fn refused_migration_keeps_the_old_ring() -> Result<()> {
        let node = CometNode::from_config(CometConfig::loopback())?;
        let result = node.migrate(&["2".to_string()], 255);
        assert!(matches!(result, Err(ChannelError::MigrateRefused { .. })));
        assert_eq!(node.ring().nodes(), ["1".to_string()].as_slice());
        Ok(())
    }

    #[test]
    fn migrations_apply_in_order() -> Result<()> {
        let node = CometNode::from_config(CometConfig::loopback())?;
        let lists = [vec!["1", "2"], vec!["1", "3"], vec!["1", "2", "3"]];
        for list in &lists {
            let nodes: Vec<String> = list.iter().map(|n| n.to_string()).collect();
            node.migrate(&nodes, 255)?;
            assert_eq!(node.ring().nodes(), nodes.as_slice());
        }
        Ok(())
    }

    #[test]
    fn migration_waits_for_the_one_in_flight() -> Result<()> {
        let node = CometNode::from_config(CometConfig::loopback())?;
        for i in 0..64 {
            node.registry.get_or_create(&format!("k{i}"));
        }
        let held = node.migrate_lock.lock();
        let worker = {
            let node = node.clone();
            std::thread::spawn(move || node.migrate(&["1".to_string(), "2".to_string()], 255))
        };
        std::thread::sleep(Duration::from_millis(50));
        // Neither the registry nor the ring moved while the lock was held.
        assert!(!worker.is_finished());
        assert_eq!(node.registry.len(), 64);
        assert_eq!(node.ring().nodes(), ["1".to_string()].as_slice());
        drop(held);

        let closed = worker.join().expect("join")?;
        assert_eq!(node.ring().nodes().len(), 2);
        assert_eq!(node.registry.len() + closed.len(), 64);
        Ok(())
    }

    #[tokio::test]
    async fn message_ids_increase() -> Result<()> {
        let node = CometNode::from_config(CometConfig::loopback())?;
        let first = node.next_message_id().await?;
        assert!(node.next_message_id().await? > first);
        Ok(())
    }

    #[tokio::test]
    async fn admin_ids_order_with_outer_channel_ids() -> Result<()> {
        let mut config = CometConfig::loopback();
        config.channel_kind = ChannelKind::Outer;
        let node = CometNode::with_store(config, Some(Arc::new(MemoryMessageStore::new())))?;
        let channel = node.registry.get_or_create("alice");
        let (conn, mut rx) = Connection::pair(8);
        channel.add_conn(conn, 0, "alice").await?;

        let body = || Bytes::from_static(b"hi");
        let private = Message::new(0, body(), MessageGroup::Private, i64::MAX);
        let first = channel.push_msg(private, "alice").await?;
        let public_id = node.next_message_id().await?;
        let public = Message::new(public_id, body(), MessageGroup::Public, i64::MAX);
        assert_eq!(channel.push_msg(public, "alice").await?, public_id);
        assert!(public_id > first);

        let mut delivered = Vec::new();
        while let Some(payload) = rx.try_recv() {
            delivered.push(PushPayload::decode(&payload)?.mid);
        }
        assert_eq!(delivered, vec![first, public_id]);
        Ok(())
    }
}
