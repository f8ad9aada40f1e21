// Shared data types and small helpers used across crates.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod ids;
pub mod message;

pub use ids::{IdSource, Snowflake, TimeId};
pub use message::{Message, MessageGroup};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid worker id {0} (must be 0..=1023)")]
    InvalidWorkerId(i64),
    #[error("clock moved backwards: last {last_ms}ms, now {now_ms}ms")]
    ClockBackwards { last_ms: i64, now_ms: i64 },
    #[error("id sequence exhausted for millisecond {ms}")]
    SequenceExhausted { ms: i64 },
    #[error("failed to encode message")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message")]
    Decode(#[source] serde_json::Error),
}

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Wall-clock time as unix nanoseconds.
pub fn now_nanos() -> i64 {
    // A clock before the epoch only happens on broken hosts; treat it as zero.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or(0)
}

/// Wall-clock time as unix milliseconds.
pub fn now_millis() -> i64 {
    now_nanos() / 1_000_000
}

/// Absolute unix-nanos deadline `ttl` from now.
pub fn deadline_after(ttl: Duration) -> i64 {
    now_nanos().saturating_add(duration_nanos(ttl))
}

pub fn secs_to_nanos(secs: i64) -> i64 {
    secs.saturating_mul(NANOS_PER_SEC)
}

fn duration_nanos(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_nanos()).unwrap_or(i64::MAX)
}
