//! weft - value-oriented parallel execution substrate
//!
//! A future-value scheduler over a bounded elastic worker pool, an
//! adaptive batcher that sizes groups of small thunks to a target run
//! time, and a lazy-in-depth, parallel-in-breadth tree expander on top
//! of both. Callers submit pure closures; results become available
//! through write-once result cells; groups of tasks share a cancellation
//! fate.
//!
//! # Quick Start
//!
//! ```no_run
//! use weft::prelude::*;
//!
//! // Initialize the runtime
//! weft::init().unwrap();
//!
//! // Fork tasks and join their results
//! let futures: Vec<_> = (0..8).map(|i| weft::fork(move || i * i)).collect();
//! let squares = weft::join_all(&futures).unwrap();
//!
//! println!("{:?}", squares);
//! weft::shutdown();
//! ```
//!
//! # Features
//!
//! - **Futures & Promises**: `fork`/`join` with work stealing, external
//!   fulfillment, dependency-ordered execution
//! - **Cancellation Groups**: tree-shaped scopes; cancelling a group
//!   cancels every descendant
//! - **Adaptive Batching**: a [`compact::Compactor`] amortizes
//!   scheduling overhead over groups of short thunks
//! - **Parallel Trees**: [`tree::TreeBuilder`] expands node functions
//!   breadth-parallel and depth-lazy
//! - **Telemetry**: optional runtime event hook and batch metrics

// Lint configuration
#![warn(missing_docs, missing_debug_implementations)]
#![allow(dead_code)] // During development

pub mod compact;
pub mod config;
pub mod error;
pub mod future;
pub mod prelude;
pub mod runtime;
pub mod scheduler;
pub mod sync;
pub mod telemetry;
pub mod tree;
pub mod util;

// Re-export key types at crate root
pub use config::{Config, ConfigBuilder};
pub use error::{Error, Result};
pub use future::{
    cancel_group, fork, fork_deps, fork_deps_in, fork_in, join_all, join_results, new_group,
    promise, promise_in, value, Future,
};
pub use runtime::{
    init, init_thread_local, init_thread_local_with_config, init_with_config, shutdown, status,
};
pub use scheduler::{Group, QueueStatus, TaskId};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_join_roundtrip() {
        runtime::init_thread_local().unwrap();

        let f = fork(|| 2 + 2);
        assert_eq!(f.join().unwrap(), 4);

        shutdown();
    }

    #[test]
    fn test_join_all_many() {
        runtime::init_thread_local().unwrap();

        let futures: Vec<_> = (0i64..50).map(|i| fork(move || i * 2)).collect();
        let doubled = join_all(&futures).unwrap();
        assert_eq!(doubled.iter().sum::<i64>(), 2450);

        shutdown();
    }

    #[test]
    fn test_value_law() {
        assert_eq!(value(7).join().unwrap(), 7);
    }
}
