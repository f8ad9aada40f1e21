// Cluster membership: self-announcement and polling for member list changes.
// A changed list migrates channels off this node and swaps the routing ring.
use crate::node::CometNode;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Membership: Send + Sync {
    /// Announce `node_id` as a live member.
    async fn register(&self, node_id: &str) -> Result<()>;

    /// Current member ids in any order.
    async fn members(&self) -> Result<Vec<String>>;
}

/// Fixed member list, replaceable at runtime. Used when no coordination
/// endpoint is configured and in tests.
#[derive(Debug, Default)]
pub struct StaticMembership {
    members: Mutex<Vec<String>>,
}

impl StaticMembership {
    pub fn new(members: Vec<String>) -> Self {
        Self {
            members: Mutex::new(members),
        }
    }

    pub fn set(&self, members: Vec<String>) {
        *self.members.lock() = members;
    }
}

#[async_trait]
impl Membership for StaticMembership {
    async fn register(&self, node_id: &str) -> Result<()> {
        let mut members = self.members.lock();
        if !members.iter().any(|member| member == node_id) {
            members.push(node_id.to_string());
        }
        Ok(())
    }

    async fn members(&self) -> Result<Vec<String>> {
        Ok(self.members.lock().clone())
    }
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    items: Vec<String>,
}

/// Coordination endpoint speaking `PUT {url}/v1/nodes/{id}` and `GET {url}/v1/nodes`.
#[derive(Debug, Clone)]
pub struct HttpMembership {
    client: reqwest::Client,
    base: reqwest::Url,
}

impl HttpMembership {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = reqwest::Url::parse(base_url).context("parse membership url")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build membership client")?;
        Ok(Self { client, base })
    }

    fn nodes_url(&self, node_id: Option<&str>) -> Result<reqwest::Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("membership url cannot be a base"))?;
            segments.pop_if_empty().extend(["v1", "nodes"]);
            if let Some(node_id) = node_id {
                segments.push(node_id);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl Membership for HttpMembership {
    async fn register(&self, node_id: &str) -> Result<()> {
        self.client
            .put(self.nodes_url(Some(node_id))?)
            .send()
            .await
            .context("register node")?
            .error_for_status()
            .context("register node")?;
        Ok(())
    }

    async fn members(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.nodes_url(None)?)
            .send()
            .await
            .context("list members")?
            .error_for_status()
            .context("list members")?;
        let body: MembersResponse = response.json().await.context("decode members")?;
        Ok(body.items)
    }
}

/// One poll step. Returns the number of channels closed by a migration, or
/// `None` when the member list is empty or unchanged.
pub async fn sync_once(node: &CometNode, membership: &dyn Membership) -> Result<Option<usize>> {
    let mut members = membership.members().await?;
    members.sort();
    members.dedup();
    if members.is_empty() {
        return Ok(None);
    }
    let mut current = node.ring().nodes().to_vec();
    current.sort();
    if current == members {
        return Ok(None);
    }
    let closed = node.migrate(&members, node.config.vnodes)?;
    tracing::info!(nodes = ?members, closed = closed.len(), "membership changed");
    Ok(Some(closed.len()))
}

/// Register this node, then follow the member list every `interval` until
/// the task is aborted.
pub async fn watch_membership(
    node: CometNode,
    membership: Arc<dyn Membership>,
    interval: Duration,
) {
    let mut registered = false;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !registered {
            match membership.register(node.node_id()).await {
                Ok(()) => registered = true,
                Err(err) => {
                    tracing::warn!(node = %node.node_id(), error = %err, "membership register failed");
                    continue;
                }
            }
        }
        match sync_once(&node, membership.as_ref()).await {
            Ok(_) => {}
            Err(err) => {
                // A list without this node refuses migration; announce again
                // in case our registration was lost.
                tracing::warn!(error = %err, "membership sync failed");
                registered = false;
            }
        }
    }
}
