//! Runtime observability.
//!
//! A process-wide hook receives [`RuntimeEvent`]s from the control thread
//! and the batcher. Events are observational only; runtime behavior never
//! depends on whether a hook is installed.

#[cfg(feature = "telemetry")]
pub mod metrics;

use parking_lot::RwLock;
use std::sync::Arc;

/// Human-meaningful scheduler and batcher events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// The worker pool limit changed.
    PoolResized { workers: usize, limit: usize },
    WorkerSpawned { id: usize },
    WorkerRetired { id: usize },
    /// A group cancellation was processed; `immediate` is false when
    /// running members forced it onto the deferred list.
    GroupCancelled { group: u64, immediate: bool },
    /// The batcher's priming phase settled on a batch size.
    BatcherStabilized { size: usize },
    ShutdownComplete,
}

/// Event hook type. May be called with the scheduler lock held: a hook
/// must not block and must not call back into the runtime.
pub type EventHook = Arc<dyn Fn(&RuntimeEvent) + Send + Sync>;

static HOOK: RwLock<Option<EventHook>> = RwLock::new(None);

/// Install the process-wide event hook, replacing any previous one.
pub fn set_hook(hook: EventHook) {
    *HOOK.write() = Some(hook);
}

/// Remove the event hook.
pub fn clear_hook() {
    *HOOK.write() = None;
}

pub(crate) fn emit(event: RuntimeEvent) {
    if let Some(hook) = HOOK.read().as_ref() {
        hook(&event);
    }
}
