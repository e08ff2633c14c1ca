//! Task scheduling: cancellation groups, the dependency queue, and the
//! worker pool with its control thread.

pub mod group;
pub mod pool;
pub mod queue;

pub use group::Group;
pub use queue::{QueueStatus, TaskId};

pub(crate) use pool::{current_context, Scheduler};
pub(crate) use queue::Body;
