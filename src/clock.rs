use crate::{
    sync::{Arc, AtomicU64, Ordering},
    types::Timestamp,
};

/// Monotonic source of evaluation timestamps.
///
/// Cloning shares the underlying counter, so forks of a network keep issuing
/// distinct, increasing stamps even when they run on different threads.
#[derive(Debug, Clone)]
pub struct EvalClock(Arc<AtomicU64>);

impl EvalClock {
    /// A fresh clock. The first stamp it issues is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0)))
    }

    /// Issue the next timestamp.
    pub fn tick(&self) -> Timestamp {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last issued timestamp, `0` if none.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for EvalClock {
    fn default() -> Self {
        Self::new()
    }
}
