use crate::credential::PoolSnapshot;

/// Receives the pool's state after every mutation so a restart resumes with
/// known validity instead of re-probing everything.
///
/// Implementations must not block: the pool calls `persist` while holding
/// its lock, so the expected shape is a channel hand-off to a writer task.
pub trait StateSink: Send + Sync {
    fn persist(&self, snapshot: PoolSnapshot);
}

/// Sink for pools that should not be persisted (tests, ephemeral setups).
#[derive(Debug, Default)]
pub struct NoopStateSink;

impl StateSink for NoopStateSink {
    fn persist(&self, _snapshot: PoolSnapshot) {}
}
