use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of the replication pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Starting up, tables not yet examined.
    Init,
    /// The snapshot worker pool is loading tables.
    Syncing,
    /// Streaming changes.
    Working,
    /// Shutdown signaled; fresh transactions are discarded.
    ShuttingDown,
}

impl LifecycleState {
    fn from_u8(value: u8) -> LifecycleState {
        match value {
            0 => LifecycleState::Init,
            1 => LifecycleState::Syncing,
            2 => LifecycleState::Working,
            _ => LifecycleState::ShuttingDown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LifecycleState::Init => 0,
            LifecycleState::Syncing => 1,
            LifecycleState::Working => 2,
            LifecycleState::ShuttingDown => 3,
        }
    }
}

/// Shared handle to the pipeline lifecycle state.
#[derive(Debug, Clone)]
pub struct Lifecycle(Arc<AtomicU8>);

impl Lifecycle {
    /// Creates a lifecycle handle in [`LifecycleState::Init`].
    pub fn new() -> Lifecycle {
        Lifecycle(Arc::new(AtomicU8::new(LifecycleState::Init.as_u8())))
    }

    /// Returns the current state.
    pub fn load(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Transitions to `state`.
    pub fn store(&self, state: LifecycleState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::new()
    }
}
