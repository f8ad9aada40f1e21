// Per-subscriber channels, their sharded registry and cluster migration.
use async_trait::async_trait;
use comet_common::{IdSource, Message, now_nanos};
use comet_store::StoreError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod conn;
pub mod inner;
pub mod outer;
pub mod registry;
pub mod token;

pub use conn::{ConnId, Connection, ConnectionReceiver, WriteError};
pub use inner::InnerChannel;
pub use outer::OuterChannel;
pub use registry::{ChannelRegistry, MigrateOutcome};
pub use token::TokenRegistry;

pub type Result<T, E = ChannelError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    #[error("channel not found")]
    NotExist,
    #[error("channel expired")]
    Expired,
    #[error("channel closed")]
    Closed,
    #[error("message already expired")]
    MessageExpired,
    #[error("message id {0} already retained")]
    DuplicateMessage(i64),
    #[error("connection limit {max} reached")]
    MaxConn { max: usize },
    #[error("token already registered")]
    TokenExists,
    #[error("token not found")]
    TokenNotFound,
    #[error("token expired")]
    TokenExpired,
    #[error("connection write failed: {0}")]
    Write(#[from] WriteError),
    #[error("message store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] comet_common::Error),
    #[error("failed to assign message id: {0}")]
    Id(#[source] comet_common::Error),
    #[error("local node {node} is not in the new node list")]
    MigrateRefused { node: String },
    #[error("invalid channel config: {0}")]
    Config(String),
}

impl ChannelError {
    /// Errors a caller should handle like a missing channel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ChannelError::NotExist | ChannelError::Expired)
    }
}

/// Which channel variant the registry builds. Fixed for the node's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelKind {
    /// Messages retained in memory on this node.
    #[default]
    Inner,
    /// Messages persisted by the upstream offline store.
    Outer,
}

impl FromStr for ChannelKind {
    type Err = ChannelError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inner" => Ok(ChannelKind::Inner),
            "outer" => Ok(ChannelKind::Outer),
            other => Err(ChannelError::Config(format!("unknown channel kind {other:?}"))),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Inner => f.write_str("inner"),
            ChannelKind::Outer => f.write_str("outer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSettings {
    pub max_tokens: usize,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub max_conns: usize,
    pub max_messages: usize,
    /// `None` disables ticket auth; token calls then always succeed.
    pub tokens: Option<TokenSettings>,
    /// Idle lifetime; every registry access pushes the deadline this far out.
    pub expire: Duration,
    /// Mints ids for persisted messages. Share the node's source so admin
    /// ids and channel ids order against each other.
    pub ids: IdSource,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::Inner,
            max_conns: 16,
            max_messages: 64,
            tokens: None,
            expire: Duration::from_secs(3600),
            ids: IdSource::default(),
        }
    }
}

impl ChannelConfig {
    pub(crate) fn token_registry(&self) -> Option<TokenRegistry> {
        self.tokens
            .map(|settings| TokenRegistry::new(settings.max_tokens, settings.ttl))
    }
}

const ID_RETRIES: usize = 3;

/// Draw an id, sleeping out an exhausted millisecond.
pub async fn next_message_id(ids: &IdSource) -> comet_common::Result<i64> {
    let mut attempt = 0;
    loop {
        match ids.next_id() {
            Err(comet_common::Error::SequenceExhausted { .. }) if attempt < ID_RETRIES => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            result => return result,
        }
    }
}

/// Operations shared by both channel variants.
///
/// The registry and transport handlers only see this trait. The `key` on each
/// call is the subscriber key the channel is registered under and is used for
/// logging and for the upstream store.
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    /// Retain or persist `message`, then write it to every attached connection.
    ///
    /// Returns the id the message was delivered under. A failed connection
    /// write is logged and skipped, never returned.
    async fn push_msg(&self, message: Message, key: &str) -> Result<i64>;

    /// Replay retained messages newer than `since_id` to `conn`.
    ///
    /// Returns the number of messages written. A write failure aborts the
    /// replay and is returned so the caller can close the connection.
    fn send_offline_msg(&self, conn: &Connection, since_id: i64, key: &str) -> Result<usize>;

    /// Attach `conn`, remembering `last_id` as the newest id it has already seen.
    async fn add_conn(&self, conn: Connection, last_id: i64, key: &str) -> Result<()>;

    /// Detach a connection. Unknown ids are ignored.
    fn remove_conn(&self, id: ConnId, key: &str);

    fn add_token(&self, ticket: &str) -> Result<()>;

    fn auth_token(&self, ticket: &str) -> Result<()>;

    /// Absolute deadline in unix nanoseconds.
    fn set_deadline(&self, deadline: i64);

    fn deadline(&self) -> i64;

    fn timeout(&self) -> bool {
        self.deadline() <= now_nanos()
    }

    fn conn_count(&self) -> usize;

    /// Close every attached connection and release retained state.
    ///
    /// Returns how many connections were closed.
    fn close(&self) -> usize;
}
