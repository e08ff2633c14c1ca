//! Synchronization cells.
//!
//! Two primitives carry all cross-thread state in the runtime: a
//! condition-variable-backed cell with a transactional update contract
//! ([`GuardedCell`]), and a write-once cell with a blocking read
//! ([`AssignCell`]) used for task results.

pub mod assign;
pub mod guarded;

pub use assign::AssignCell;
pub use guarded::GuardedCell;

pub(crate) use guarded::in_critical_section;
