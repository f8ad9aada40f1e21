// Message retention: the per-channel ordered log and the offline-store contract.
use async_trait::async_trait;
use comet_common::Message;
use std::fmt;

pub mod log;
pub mod memory;

pub use log::MessageLog;
pub use memory::MemoryMessageStore;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("message id {0} already stored")]
    Duplicate(i64),
    #[error("message store unavailable: {0}")]
    Unavailable(String),
    #[error("message store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid message store response: {0}")]
    Decode(String),
}

/// Upstream offline-message store consumed by the externally-persisted channel.
///
/// Failures are terminal for the calling operation; the store owns durability
/// and callers never retry locally.
#[async_trait]
pub trait MessageStore: Send + Sync + fmt::Debug {
    /// Persist `message` for `key`.
    async fn save(&self, key: &str, message: &Message) -> Result<()>;

    /// Unexpired messages for `key` with id greater than `since_id`, ascending.
    async fn get(&self, key: &str, since_id: i64) -> Result<Vec<Message>>;

    /// Drop every stored message for `key`.
    async fn delete(&self, key: &str) -> Result<()>;
}
