//! Convenience re-exports.
//!
//! ```
//! use weft::prelude::*;
//! ```

pub use crate::compact::{Batch, Compactor, FoldDirection, Step};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{Error, Result};
pub use crate::future::{
    cancel_group, fork, fork_deps, fork_deps_in, fork_in, join_all, join_results, new_group,
    promise, promise_in, value, Future,
};
pub use crate::runtime::{init, init_with_config, shutdown};
pub use crate::scheduler::{Group, TaskId};
pub use crate::sync::{AssignCell, GuardedCell};
pub use crate::tree::{TreeBuilder, TreeItem};
