// Monotonic id generators.
// Both are `&mut self` and expect a single owner per call site. `IdSource`
// is the shared handle a node hands to everything that mints ids.
use crate::{Error, Result, now_millis, now_nanos};
use parking_lot::Mutex;
use std::sync::Arc;

// 2014-01-01T00:00:00Z in unix milliseconds.
const SNOWFLAKE_EPOCH_MS: i64 = 1_388_534_400_000;
const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
pub const MAX_WORKER_ID: i64 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const WORKER_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + WORKER_BITS;

/// Timestamp + worker + sequence id generator for externally visible message ids.
///
/// ```
/// use comet_common::Snowflake;
///
/// let mut ids = Snowflake::new(3).expect("worker");
/// let first = ids.next_id().expect("id");
/// let second = ids.next_id().expect("id");
/// assert!(second > first);
/// assert_eq!(Snowflake::worker_of(first), 3);
/// ```
#[derive(Debug)]
pub struct Snowflake {
    worker_id: i64,
    last_ms: i64,
    sequence: i64,
    clock: fn() -> i64,
}

impl Snowflake {
    pub fn new(worker_id: i64) -> Result<Self> {
        Self::with_clock(worker_id, now_millis)
    }

    /// Construct with a custom millisecond clock (tests drive time explicitly).
    pub fn with_clock(worker_id: i64, clock: fn() -> i64) -> Result<Self> {
        if !(0..=MAX_WORKER_ID).contains(&worker_id) {
            return Err(Error::InvalidWorkerId(worker_id));
        }
        Ok(Self {
            worker_id,
            last_ms: -1,
            sequence: 0,
            clock,
        })
    }

    /// Next id, or `SequenceExhausted` once 4096 ids were issued in the
    /// current millisecond. The caller decides whether to wait and retry.
    pub fn next_id(&mut self) -> Result<i64> {
        let now_ms = (self.clock)();
        if now_ms < self.last_ms {
            return Err(Error::ClockBackwards {
                last_ms: self.last_ms,
                now_ms,
            });
        }
        if now_ms == self.last_ms {
            if self.sequence == SEQUENCE_MASK {
                return Err(Error::SequenceExhausted { ms: now_ms });
            }
            self.sequence += 1;
        } else {
            self.sequence = 0;
        }
        self.last_ms = now_ms;
        Ok(((now_ms - SNOWFLAKE_EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.worker_id << WORKER_SHIFT)
            | self.sequence)
    }

    pub fn worker_of(id: i64) -> i64 {
        (id >> WORKER_SHIFT) & MAX_WORKER_ID
    }
}

/// Pure monotonic nanosecond-timestamp generator.
///
/// Returns the wall clock in nanoseconds, bumped by one whenever the clock has
/// not advanced past the previously issued id.
#[derive(Debug, Default)]
pub struct TimeId {
    last: i64,
}

impl TimeId {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> i64 {
        self.next_id_at(now_nanos())
    }

    pub fn next_id_at(&mut self, now: i64) -> i64 {
        let id = if now > self.last { now } else { self.last + 1 };
        self.last = id;
        id
    }

    pub fn last(&self) -> i64 {
        self.last
    }
}

#[derive(Debug)]
enum Generator {
    Snowflake(Snowflake),
    Time(TimeId),
}

/// Cloneable handle to one node-wide id generator.
///
/// Admin-assigned ids and ids minted by persisted channels must come from the
/// same source so they order against each other on a connection.
#[derive(Debug, Clone)]
pub struct IdSource {
    inner: Arc<Mutex<Generator>>,
}

impl IdSource {
    pub fn snowflake(worker_id: i64) -> Result<Self> {
        Ok(Snowflake::new(worker_id)?.into())
    }

    pub fn time() -> Self {
        Self::from_generator(Generator::Time(TimeId::new()))
    }

    fn from_generator(generator: Generator) -> Self {
        Self {
            inner: Arc::new(Mutex::new(generator)),
        }
    }

    pub fn next_id(&self) -> Result<i64> {
        match &mut *self.inner.lock() {
            Generator::Snowflake(ids) => ids.next_id(),
            Generator::Time(ids) => Ok(ids.next_id()),
        }
    }
}

impl From<Snowflake> for IdSource {
    fn from(ids: Snowflake) -> Self {
        Self::from_generator(Generator::Snowflake(ids))
    }
}

impl Default for IdSource {
    fn default() -> Self {
        Self::time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    static FROZEN_MS: AtomicI64 = AtomicI64::new(SNOWFLAKE_EPOCH_MS + 1_000);

    fn frozen_clock() -> i64 {
        FROZEN_MS.load(Ordering::SeqCst)
    }

    static MANUAL_MS: AtomicI64 = AtomicI64::new(SNOWFLAKE_EPOCH_MS + 5_000);

    fn manual_clock() -> i64 {
        MANUAL_MS.load(Ordering::SeqCst)
    }

    #[test]
    fn rejects_out_of_range_worker() {
        assert!(matches!(
            Snowflake::new(1024),
            Err(Error::InvalidWorkerId(1024))
        ));
        assert!(Snowflake::new(-1).is_err());
        assert!(Snowflake::new(1023).is_ok());
    }

    #[test]
    fn same_millisecond_increments_sequence() {
        let mut ids = Snowflake::with_clock(7, frozen_clock).expect("worker");
        let a = ids.next_id().expect("id");
        let b = ids.next_id().expect("id");
        assert_eq!(b, a + 1);
        assert_eq!(Snowflake::worker_of(a), 7);
        assert_eq!(a >> TIMESTAMP_SHIFT, 1_000);
    }

    #[test]
    fn exhausted_sequence_fails_until_the_clock_moves() {
        let mut ids = Snowflake::with_clock(1, manual_clock).expect("worker");
        let mut last = ids.next_id().expect("id");
        for _ in 0..SEQUENCE_MASK {
            let next = ids.next_id().expect("id");
            assert!(next > last);
            last = next;
        }
        let stalled = manual_clock();
        assert!(matches!(
            ids.next_id(),
            Err(Error::SequenceExhausted { ms }) if ms == stalled
        ));
        // The failed call must not disturb the generator state.
        assert!(ids.next_id().is_err());

        MANUAL_MS.fetch_add(1, Ordering::SeqCst);
        let next = ids.next_id().expect("id after the clock moved");
        assert!(next > last);
        assert_eq!(next & SEQUENCE_MASK, 0);
    }

    #[test]
    fn backwards_clock_is_an_error() {
        fn early() -> i64 {
            SNOWFLAKE_EPOCH_MS
        }
        let mut ids = Snowflake::with_clock(0, early).expect("worker");
        ids.last_ms = SNOWFLAKE_EPOCH_MS + 50;
        assert!(matches!(ids.next_id(), Err(Error::ClockBackwards { .. })));
    }

    #[test]
    fn time_id_bumps_when_clock_stalls() {
        let mut ids = TimeId::new();
        assert_eq!(ids.next_id_at(100), 100);
        assert_eq!(ids.next_id_at(100), 101);
        assert_eq!(ids.next_id_at(50), 102);
        assert_eq!(ids.next_id_at(500), 500);
        assert_eq!(ids.last(), 500);
    }

    #[test]
    fn time_id_tracks_wall_clock() {
        let mut ids = TimeId::new();
        let before = now_nanos();
        let id = ids.next_id();
        assert!(id >= before);
        assert!(ids.next_id() > id);
    }

    #[test]
    fn id_source_clones_share_one_sequence() {
        let ids = IdSource::snowflake(2).expect("worker");
        let other = ids.clone();
        let a = ids.next_id().expect("id");
        let b = other.next_id().expect("id");
        let c = ids.next_id().expect("id");
        assert!(a < b && b < c);
        assert_eq!(Snowflake::worker_of(b), 2);
        assert!(IdSource::snowflake(4096).is_err());
    }

    #[test]
    fn time_source_never_repeats() {
        let ids = IdSource::default();
        let first = ids.next_id().expect("id");
        assert!(ids.next_id().expect("id") > first);
    }
}
