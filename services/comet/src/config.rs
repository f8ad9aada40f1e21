use anyhow::{Context, Result, bail};
use comet_channel::{ChannelConfig, ChannelKind, TokenSettings};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

// Comet node configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct CometConfig {
    // Identifier of this node on the hash ring.
    pub node_id: String,
    // TCP subscribe listener.
    pub tcp_bind: SocketAddr,
    // WebSocket subscribe listener.
    pub websocket_bind: SocketAddr,
    // Admin RPC listener used by the router tier.
    pub admin_bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    pub channel_kind: ChannelKind,
    // Registry bucket count, a power of two.
    pub channel_buckets: usize,
    // Idle lifetime of a channel.
    pub channel_expire_secs: u64,
    pub max_conns_per_key: usize,
    // Retained messages per key for inner channels.
    pub max_messages_per_key: usize,
    // Require a registered ticket on subscribe.
    pub token_auth: bool,
    pub max_tokens: usize,
    pub token_expire_secs: u64,
    // Heartbeat used when a client asks for 0.
    pub default_heartbeat_secs: u64,
    // Larger client heartbeats are rejected.
    pub max_heartbeat_secs: u64,
    // Pending pushes per connection before writes start failing.
    pub conn_queue_depth: usize,
    // Max bytes per TCP request argument.
    pub max_arg_bytes: usize,
    // Virtual nodes per member on the hash ring.
    pub vnodes: usize,
    // Snowflake worker id for admin-assigned message ids.
    pub worker_id: i64,
    // Upstream offline store, required for outer channels.
    pub message_store_url: Option<String>,
    // Optional coordination endpoint for membership polling.
    pub membership_url: Option<String>,
    pub membership_poll_ms: u64,
    // Initial cluster membership.
    pub nodes: Vec<String>,
}

const DEFAULT_NODE_ID: &str = "1";
const DEFAULT_CHANNEL_BUCKETS: usize = 16;
const DEFAULT_CHANNEL_EXPIRE_SECS: u64 = 3600;
const DEFAULT_MAX_CONNS: usize = 16;
const DEFAULT_MAX_MESSAGES: usize = 64;
const DEFAULT_MAX_TOKENS: usize = 16;
const DEFAULT_TOKEN_EXPIRE_SECS: u64 = 86_400;
const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_MAX_HEARTBEAT_SECS: u64 = 600;
const DEFAULT_CONN_QUEUE_DEPTH: usize = 64;
const DEFAULT_MEMBERSHIP_POLL_MS: u64 = 2000;

#[derive(Debug, Default, Deserialize)]
struct CometConfigOverride {
    node_id: Option<String>,
    tcp_bind: Option<String>,
    websocket_bind: Option<String>,
    admin_bind: Option<String>,
    metrics_bind: Option<String>,
    channel_kind: Option<String>,
    channel_buckets: Option<usize>,
    channel_expire_secs: Option<u64>,
    max_conns_per_key: Option<usize>,
    max_messages_per_key: Option<usize>,
    token_auth: Option<bool>,
    max_tokens: Option<usize>,
    token_expire_secs: Option<u64>,
    default_heartbeat_secs: Option<u64>,
    max_heartbeat_secs: Option<u64>,
    conn_queue_depth: Option<usize>,
    max_arg_bytes: Option<usize>,
    vnodes: Option<usize>,
    worker_id: Option<i64>,
    message_store_url: Option<String>,
    membership_url: Option<String>,
    membership_poll_ms: Option<u64>,
    nodes: Option<Vec<String>>,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_addr(key: &str, default: &str) -> Result<SocketAddr> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("parse {key}"))
}

fn split_nodes(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|node| !node.is_empty())
        .map(str::to_string)
        .collect()
}

impl CometConfig {
    pub fn from_env() -> Result<Self> {
        let node_id =
            std::env::var("COMET_NODE_ID").unwrap_or_else(|_| DEFAULT_NODE_ID.to_string());
        let tcp_bind = env_addr("COMET_TCP_BIND", "0.0.0.0:6969")?;
        let websocket_bind = env_addr("COMET_WS_BIND", "0.0.0.0:6968")?;
        let admin_bind = env_addr("COMET_ADMIN_BIND", "127.0.0.1:6970")?;
        let metrics_bind = env_addr("COMET_METRICS_BIND", "0.0.0.0:6971")?;
        // An unknown kind is a startup error, not a silent default.
        let channel_kind = match std::env::var("COMET_CHANNEL_KIND") {
            Ok(value) => value
                .parse::<ChannelKind>()
                .with_context(|| "parse COMET_CHANNEL_KIND")?,
            Err(_) => ChannelKind::Inner,
        };
        let nodes = std::env::var("COMET_NODES")
            .ok()
            .map(|value| split_nodes(&value))
            .filter(|nodes| !nodes.is_empty())
            .unwrap_or_else(|| vec![node_id.clone()]);
        Ok(Self {
            node_id,
            tcp_bind,
            websocket_bind,
            admin_bind,
            metrics_bind,
            channel_kind,
            channel_buckets: env_parse("COMET_CHANNEL_BUCKETS", DEFAULT_CHANNEL_BUCKETS),
            channel_expire_secs: env_parse(
                "COMET_CHANNEL_EXPIRE_SECS",
                DEFAULT_CHANNEL_EXPIRE_SECS,
            ),
            max_conns_per_key: env_parse("COMET_MAX_CONNS", DEFAULT_MAX_CONNS),
            max_messages_per_key: env_parse("COMET_MAX_MESSAGES", DEFAULT_MAX_MESSAGES),
            token_auth: env_flag("COMET_TOKEN_AUTH"),
            max_tokens: env_parse("COMET_MAX_TOKENS", DEFAULT_MAX_TOKENS),
            token_expire_secs: env_parse("COMET_TOKEN_EXPIRE_SECS", DEFAULT_TOKEN_EXPIRE_SECS),
            default_heartbeat_secs: env_parse("COMET_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS),
            max_heartbeat_secs: env_parse("COMET_MAX_HEARTBEAT_SECS", DEFAULT_MAX_HEARTBEAT_SECS),
            conn_queue_depth: env_parse("COMET_CONN_QUEUE_DEPTH", DEFAULT_CONN_QUEUE_DEPTH),
            max_arg_bytes: env_parse("COMET_MAX_ARG_BYTES", comet_wire::DEFAULT_MAX_ARG_BYTES),
            vnodes: env_parse("COMET_VNODES", comet_ring::DEFAULT_VNODES),
            worker_id: env_parse("COMET_WORKER_ID", 0),
            message_store_url: std::env::var("COMET_MESSAGE_URL").ok(),
            membership_url: std::env::var("COMET_MEMBERSHIP_URL").ok(),
            membership_poll_ms: env_parse("COMET_MEMBERSHIP_POLL_MS", DEFAULT_MEMBERSHIP_POLL_MS),
            nodes,
        })
    }

    /// Single-node config bound to loopback ephemeral ports with small limits.
    /// Used by local runs and the test suites.
    pub fn loopback() -> Self {
        let any_port = SocketAddr::from(([127, 0, 0, 1], 0));
        Self {
            node_id: DEFAULT_NODE_ID.to_string(),
            tcp_bind: any_port,
            websocket_bind: any_port,
            admin_bind: any_port,
            metrics_bind: any_port,
            channel_kind: ChannelKind::Inner,
            channel_buckets: 8,
            channel_expire_secs: 60,
            max_conns_per_key: 4,
            max_messages_per_key: 8,
            token_auth: false,
            max_tokens: 4,
            token_expire_secs: 60,
            default_heartbeat_secs: 5,
            max_heartbeat_secs: 60,
            conn_queue_depth: 16,
            max_arg_bytes: 1024,
            vnodes: comet_ring::DEFAULT_VNODES,
            worker_id: 1,
            message_store_url: None,
            membership_url: None,
            membership_poll_ms: 50,
            nodes: vec![DEFAULT_NODE_ID.to_string()],
        }
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("COMET_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read COMET_CONFIG: {path}"))?;
            let override_cfg: CometConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse comet config yaml")?;
            config.apply(override_cfg)?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, override_cfg: CometConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.node_id {
            self.node_id = value;
        }
        if let Some(value) = override_cfg.tcp_bind {
            self.tcp_bind = value.parse().with_context(|| "parse tcp_bind")?;
        }
        if let Some(value) = override_cfg.websocket_bind {
            self.websocket_bind = value.parse().with_context(|| "parse websocket_bind")?;
        }
        if let Some(value) = override_cfg.admin_bind {
            self.admin_bind = value.parse().with_context(|| "parse admin_bind")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.channel_kind {
            self.channel_kind = value.parse().with_context(|| "parse channel_kind")?;
        }
        if let Some(value) = override_cfg.channel_buckets {
            self.channel_buckets = value;
        }
        if let Some(value) = override_cfg.channel_expire_secs {
            self.channel_expire_secs = value;
        }
        if let Some(value) = override_cfg.max_conns_per_key {
            self.max_conns_per_key = value;
        }
        if let Some(value) = override_cfg.max_messages_per_key {
            self.max_messages_per_key = value;
        }
        if let Some(value) = override_cfg.token_auth {
            self.token_auth = value;
        }
        if let Some(value) = override_cfg.max_tokens {
            self.max_tokens = value;
        }
        if let Some(value) = override_cfg.token_expire_secs {
            self.token_expire_secs = value;
        }
        if let Some(value) = override_cfg.default_heartbeat_secs {
            self.default_heartbeat_secs = value;
        }
        if let Some(value) = override_cfg.max_heartbeat_secs {
            self.max_heartbeat_secs = value;
        }
        if let Some(value) = override_cfg.conn_queue_depth {
            self.conn_queue_depth = value;
        }
        if let Some(value) = override_cfg.max_arg_bytes {
            self.max_arg_bytes = value;
        }
        if let Some(value) = override_cfg.vnodes {
            self.vnodes = value;
        }
        if let Some(value) = override_cfg.worker_id {
            self.worker_id = value;
        }
        if let Some(value) = override_cfg.message_store_url {
            self.message_store_url = Some(value);
        }
        if let Some(value) = override_cfg.membership_url {
            self.membership_url = Some(value);
        }
        if let Some(value) = override_cfg.membership_poll_ms
            && value > 0
        {
            self.membership_poll_ms = value;
        }
        if let Some(value) = override_cfg.nodes
            && !value.is_empty()
        {
            self.nodes = value;
        }
        Ok(())
    }

    /// Reject settings the node cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            bail!("node_id must not be empty");
        }
        if self.channel_buckets == 0 || !self.channel_buckets.is_power_of_two() {
            bail!(
                "channel_buckets must be a power of two, got {}",
                self.channel_buckets
            );
        }
        for (name, value) in [
            ("max_conns_per_key", self.max_conns_per_key),
            ("max_messages_per_key", self.max_messages_per_key),
            ("max_tokens", self.max_tokens),
            ("conn_queue_depth", self.conn_queue_depth),
            ("max_arg_bytes", self.max_arg_bytes),
            ("vnodes", self.vnodes),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        if self.default_heartbeat_secs == 0 || self.default_heartbeat_secs > self.max_heartbeat_secs
        {
            bail!(
                "default_heartbeat_secs must be within 1..={}",
                self.max_heartbeat_secs
            );
        }
        if !(0..=comet_common::ids::MAX_WORKER_ID).contains(&self.worker_id) {
            bail!("worker_id {} out of range", self.worker_id);
        }
        if self.channel_kind == ChannelKind::Outer && self.message_store_url.is_none() {
            bail!("channel_kind outer requires COMET_MESSAGE_URL");
        }
        if !self.nodes.contains(&self.node_id) {
            bail!("node {} is missing from nodes {:?}", self.node_id, self.nodes);
        }
        Ok(())
    }

    /// Channel settings with a private id source; `CometNode` swaps in the
    /// node-wide one.
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            kind: self.channel_kind,
            max_conns: self.max_conns_per_key,
            max_messages: self.max_messages_per_key,
            tokens: self.token_auth.then(|| TokenSettings {
                max_tokens: self.max_tokens,
                ttl: Duration::from_secs(self.token_expire_secs),
            }),
            expire: Duration::from_secs(self.channel_expire_secs),
            ..ChannelConfig::default()
        }
    }

    /// Heartbeat for a client request; 0 selects the default. `None` when the
    /// request exceeds the configured maximum.
    pub fn heartbeat(&self, requested_secs: u64) -> Option<Duration> {
        match requested_secs {
            0 => Some(Duration::from_secs(self.default_heartbeat_secs)),
            secs if secs <= self.max_heartbeat_secs => Some(Duration::from_secs(secs)),
            _ => None,
        }
    }

    /// Queue depth per connection. Leaves room for a full offline replay on
    /// top of the configured live backlog.
    pub fn connection_queue_depth(&self) -> usize {
        self.conn_queue_depth
            .saturating_add(self.max_messages_per_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    const KEYS: &[&str] = &[
        "COMET_NODE_ID",
        "COMET_TCP_BIND",
        "COMET_CHANNEL_KIND",
        "COMET_CHANNEL_BUCKETS",
        "COMET_MESSAGE_URL",
        "COMET_NODES",
        "COMET_TOKEN_AUTH",
        "COMET_CONFIG",
    ];

    fn clear_env() -> Vec<EnvGuard> {
        KEYS.iter().map(|key| EnvGuard::unset(key)).collect()
    }

    #[test]
    #[serial]
    fn defaults_are_valid() -> Result<()> {
        let _env = clear_env();
        let config = CometConfig::from_env()?;
        assert_eq!(config.node_id, "1");
        assert_eq!(config.tcp_bind, "0.0.0.0:6969".parse::<SocketAddr>()?);
        assert_eq!(config.channel_kind, ChannelKind::Inner);
        assert_eq!(config.channel_buckets, 16);
        assert_eq!(config.nodes, vec!["1".to_string()]);
        assert!(!config.token_auth);
        config.validate()?;
        Ok(())
    }

    #[test]
    #[serial]
    fn env_overrides_defaults() -> Result<()> {
        let _env = clear_env();
        let _g1 = EnvGuard::set("COMET_NODE_ID", "a");
        let _g2 = EnvGuard::set("COMET_NODES", "b, a ,,c");
        let _g3 = EnvGuard::set("COMET_TOKEN_AUTH", "true");
        let _g4 = EnvGuard::set("COMET_CHANNEL_BUCKETS", "not-a-number");
        let config = CometConfig::from_env()?;
        assert_eq!(config.nodes, vec!["b", "a", "c"]);
        assert!(config.token_auth);
        // Unparsable numbers fall back to the default.
        assert_eq!(config.channel_buckets, 16);
        assert!(config.channel_config().tokens.is_some());
        Ok(())
    }

    #[test]
    #[serial]
    fn unknown_channel_kind_fails_startup() {
        let _env = clear_env();
        let _g = EnvGuard::set("COMET_CHANNEL_KIND", "redis");
        assert!(CometConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() -> Result<()> {
        let _env = clear_env();
        let path = std::env::temp_dir().join(format!("comet-config-{}.yaml", std::process::id()));
        fs::write(
            &path,
            "node_id: \"2\"\nnodes: [\"1\", \"2\"]\nchannel_buckets: 64\nmax_messages_per_key: 8\n",
        )?;
        let _g = EnvGuard::set("COMET_CONFIG", path.to_str().unwrap_or_default());
        let config = CometConfig::from_env_or_yaml()?;
        let _ = fs::remove_file(&path);
        assert_eq!(config.node_id, "2");
        assert_eq!(config.channel_buckets, 64);
        assert_eq!(config.channel_config().max_messages, 8);
        Ok(())
    }

    #[test]
    #[serial]
    fn validate_rejects_bad_settings() -> Result<()> {
        let _env = clear_env();
        let base = CometConfig::from_env()?;

        let mut config = base.clone();
        config.channel_buckets = 12;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.max_conns_per_key = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.channel_kind = ChannelKind::Outer;
        assert!(config.validate().is_err());
        config.message_store_url = Some("http://127.0.0.1:1".into());
        config.validate()?;

        let mut config = base;
        config.nodes = vec!["9".into()];
        assert!(config.validate().is_err());
        Ok(())
    }

    #[test]
    fn loopback_config_is_valid() -> Result<()> {
        let config = CometConfig::loopback();
        config.validate()?;
        assert_eq!(config.tcp_bind.port(), 0);
        assert!(config.tcp_bind.ip().is_loopback());
        assert_eq!(config.nodes, vec![config.node_id.clone()]);
        Ok(())
    }

    #[test]
    #[serial]
    fn heartbeat_defaults_and_caps() -> Result<()> {
        let _env = clear_env();
        let config = CometConfig::from_env()?;
        assert_eq!(config.heartbeat(0), Some(Duration::from_secs(30)));
        assert_eq!(config.heartbeat(5), Some(Duration::from_secs(5)));
        assert_eq!(config.heartbeat(601), None);
        Ok(())
    }
}
