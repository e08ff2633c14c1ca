//! Runtime lifecycle.
//!
//! One global runtime backs the free-function API; a thread-local mode
//! exists so tests can run isolated runtimes side by side. `shutdown`
//! drains the scheduler to quiescence before returning.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::scheduler::{QueueStatus, Scheduler};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

pub struct Runtime {
    scheduler: Arc<Scheduler>,
    config: Config,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            scheduler: Scheduler::new(config.clone()),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Queue population counts (diagnostics).
    pub fn status(&self) -> QueueStatus {
        self.scheduler.status()
    }

    pub(crate) fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("status", &self.scheduler.status())
            .finish()
    }
}

// Global runtime for the simple API
static GLOBAL_RUNTIME: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

// Thread-local runtime for isolated tests
thread_local! {
    static THREAD_RUNTIME: std::cell::RefCell<Option<Arc<Runtime>>> =
        const { std::cell::RefCell::new(None) };
}

// Track which threads have thread-local runtimes
static THREAD_RUNTIME_MAP: OnceLock<Mutex<HashMap<ThreadId, bool>>> = OnceLock::new();

fn thread_runtime_map() -> &'static Mutex<HashMap<ThreadId, bool>> {
    THREAD_RUNTIME_MAP.get_or_init(|| Mutex::new(HashMap::new()))
}

fn uses_thread_runtime() -> bool {
    let thread_id = std::thread::current().id();
    thread_runtime_map()
        .lock()
        .get(&thread_id)
        .copied()
        .unwrap_or(false)
}

pub fn init() -> Result<()> {
    init_with_config(Config::default())
}

pub fn init_with_config(config: Config) -> Result<()> {
    if uses_thread_runtime() {
        let has_existing = THREAD_RUNTIME.with(|rt| rt.borrow().is_some());
        if has_existing {
            return Err(Error::AlreadyInitialized);
        }

        let rt = Runtime::new(config)?;
        THREAD_RUNTIME.with(|cell| {
            *cell.borrow_mut() = Some(Arc::new(rt));
        });
        Ok(())
    } else {
        let mut runtime = GLOBAL_RUNTIME.write();

        if runtime.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let rt = Runtime::new(config)?;
        *runtime = Some(Arc::new(rt));
        Ok(())
    }
}

/// Initialize the runtime in thread-local mode (for tests).
pub fn init_thread_local() -> Result<()> {
    init_thread_local_with_config(Config::default())
}

/// Initialize the runtime in thread-local mode with a config (for tests).
pub fn init_thread_local_with_config(config: Config) -> Result<()> {
    let thread_id = std::thread::current().id();
    thread_runtime_map().lock().insert(thread_id, true);

    let has_existing = THREAD_RUNTIME.with(|rt| rt.borrow().is_some());
    if has_existing {
        return Err(Error::AlreadyInitialized);
    }

    let rt = Runtime::new(config)?;
    THREAD_RUNTIME.with(|cell| {
        *cell.borrow_mut() = Some(Arc::new(rt));
    });
    Ok(())
}

pub(crate) fn try_current_runtime() -> Option<Arc<Runtime>> {
    if uses_thread_runtime() {
        THREAD_RUNTIME.with(|rt| rt.borrow().clone())
    } else {
        GLOBAL_RUNTIME.read().clone()
    }
}

pub(crate) fn current_runtime() -> Arc<Runtime> {
    try_current_runtime().expect("weft runtime not initialized - call weft::init() first")
}

/// Queue population counts of the current runtime (diagnostics).
pub fn status() -> QueueStatus {
    current_runtime().status()
}

/// Tear down the current runtime: drain the scheduler to quiescence
/// (every remaining task passive or finished, workers retired), resolve
/// abandoned promises as interrupted, and drop the runtime. A no-op when
/// nothing is initialized. Must not be called from inside a task.
pub fn shutdown() {
    if uses_thread_runtime() {
        let thread_id = std::thread::current().id();
        let rt = THREAD_RUNTIME.with(|cell| cell.borrow_mut().take());
        if let Some(rt) = rt {
            rt.scheduler().shutdown();
        }
        thread_runtime_map().lock().remove(&thread_id);
    } else {
        let rt = GLOBAL_RUNTIME.write().take();
        if let Some(rt) = rt {
            rt.scheduler().shutdown();
        }
    }
}
