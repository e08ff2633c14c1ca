//! Future values.
//!
//! A future is a handle on a task outcome: a task id, the cancellation
//! group the task belongs to, and a single-assignment result cell.
//! Futures are cheap to clone and may be joined from any thread; a
//! worker that joins an unfinished future steals work from the future's
//! dependency cone instead of going idle.

use crate::error::{Error, Result};
use crate::runtime;
use crate::scheduler::{current_context, Body, Group, Scheduler, TaskId};
use crate::sync::{in_critical_section, AssignCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

struct FutureInner<T> {
    /// `None` for immediate values, which never touch the queue.
    sched: Option<Arc<Scheduler>>,
    task: TaskId,
    group: Group,
    promised: bool,
    cell: Arc<AssignCell<Result<T>>>,
}

/// A handle on the eventual outcome of a task.
pub struct Future<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            inner: self.inner.clone(),
        }
    }
}

fn ambient_scheduler() -> Arc<Scheduler> {
    current_context()
        .map(|ctx| ctx.sched)
        .unwrap_or_else(|| runtime::current_runtime().scheduler())
}

fn ambient_group() -> Group {
    current_context()
        .map(|ctx| ctx.group)
        .unwrap_or_else(|| Group::new(None))
}

fn fork_core<T, F>(
    sched: Arc<Scheduler>,
    group: Group,
    deps: &[TaskId],
    priority: i32,
    f: F,
) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let cell = Arc::new(AssignCell::new("future"));
    let body: Body = {
        let cell = cell.clone();
        let group = group.clone();
        Box::new(move || {
            if !group.is_alive() {
                cell.assign(Err(Error::Interrupted));
                return;
            }
            match catch_unwind(AssertUnwindSafe(f)) {
                Ok(value) => {
                    cell.assign(Ok(value));
                }
                Err(payload) => {
                    let error = Error::from_panic(payload);
                    group.cancel(error.clone());
                    cell.assign(Err(error));
                }
            }
        })
    };
    let task = sched.submit(group.clone(), deps, priority, body);
    Future {
        inner: Arc::new(FutureInner {
            sched: Some(sched),
            task,
            group,
            promised: false,
            cell,
        }),
    }
}

/// Fork a task in the ambient group: the current task's group on a
/// worker thread, a fresh root group elsewhere.
pub fn fork<T, F>(f: F) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    fork_core(ambient_scheduler(), ambient_group(), &[], 0, f)
}

/// Fork a task into an explicit group.
pub fn fork_in<T, F>(group: &Group, f: F) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    fork_core(ambient_scheduler(), group.clone(), &[], 0, f)
}

/// Fork a task that runs only after `deps` have finished, at the given
/// priority (higher runs first; equal priorities are FIFO).
pub fn fork_deps<T, F>(deps: &[TaskId], priority: i32, f: F) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    fork_core(ambient_scheduler(), ambient_group(), deps, priority, f)
}

/// Fork a dependent task into an explicit group.
pub fn fork_deps_in<T, F>(group: &Group, deps: &[TaskId], priority: i32, f: F) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    fork_core(ambient_scheduler(), group.clone(), deps, priority, f)
}

/// An already-finished future. Never enters the queue.
pub fn value<T: Send + 'static>(v: T) -> Future<T> {
    let cell = Arc::new(AssignCell::new("value"));
    cell.assign(Ok(v));
    Future {
        inner: Arc::new(FutureInner {
            sched: None,
            task: TaskId::DUMMY,
            group: Group::new(None),
            promised: false,
            cell,
        }),
    }
}

/// A promise in the ambient group; fulfilled externally via
/// [`Future::fulfill`].
pub fn promise<T: Send + 'static>() -> Future<T> {
    promise_in(&ambient_group())
}

/// A promise in an explicit group.
pub fn promise_in<T: Send + 'static>(group: &Group) -> Future<T> {
    let sched = ambient_scheduler();
    let cell = Arc::new(AssignCell::new("promise"));
    let abort: Box<dyn Fn() + Send> = {
        let cell = cell.clone();
        Box::new(move || {
            cell.assign(Err(Error::Interrupted));
        })
    };
    let task = sched.submit_passive(group.clone(), abort);
    Future {
        inner: Arc::new(FutureInner {
            sched: Some(sched),
            task,
            group: group.clone(),
            promised: true,
            cell,
        }),
    }
}

/// Create a cancellation group, optionally under a parent.
pub fn new_group(parent: Option<&Group>) -> Group {
    Group::new(parent)
}

/// Cancel a group and everything below it. Idempotent.
pub fn cancel_group(group: &Group) {
    if let Some(ctx) = current_context() {
        ctx.sched.cancel_group(group, Error::Interrupted);
    } else if let Some(rt) = runtime::try_current_runtime() {
        rt.scheduler().cancel_group(group, Error::Interrupted);
    } else {
        group.cancel(Error::Interrupted);
    }
}

/// Join every future, collecting per-future outcomes. Never fails as a
/// whole.
pub fn join_results<T: Clone + Send + 'static>(futures: &[Future<T>]) -> Vec<Result<T>> {
    futures.iter().map(|f| f.join()).collect()
}

/// Join every future, failing with the first failure in list order.
pub fn join_all<T: Clone + Send + 'static>(futures: &[Future<T>]) -> Result<Vec<T>> {
    join_results(futures).into_iter().collect()
}

impl<T: Send + 'static> Future<T> {
    pub fn task_id(&self) -> TaskId {
        self.inner.task
    }

    pub fn group(&self) -> &Group {
        &self.inner.group
    }

    pub fn is_promise(&self) -> bool {
        self.inner.promised
    }

    /// A future is finished iff its result cell is assigned.
    pub fn is_finished(&self) -> bool {
        self.inner.cell.is_assigned()
    }

    /// The outcome, if finished, without blocking.
    pub fn peek(&self) -> Option<Result<T>>
    where
        T: Clone,
    {
        self.inner.cell.peek()
    }

    /// Block until the future is finished and return its outcome.
    ///
    /// On a worker thread this participates in work stealing: while the
    /// future is unfinished, ready tasks from its dependency cone are
    /// executed in place. A pure-interrupt outcome is flattened into the
    /// group's collected failures so the root cause surfaces.
    ///
    /// Calling `join` inside a [`crate::sync::GuardedCell`] critical
    /// section is fatal misuse.
    pub fn join(&self) -> Result<T>
    where
        T: Clone,
    {
        assert!(
            !in_critical_section(),
            "misuse: join inside a guarded section"
        );
        if let Some(result) = self.inner.cell.peek() {
            return self.flatten(result);
        }
        if let (Some(ctx), Some(sched)) = (current_context(), &self.inner.sched) {
            if Arc::ptr_eq(&ctx.sched, sched) {
                sched.join_wait(ctx.task, self.inner.task, &|| self.inner.cell.is_assigned());
            }
        }
        let result = self.inner.cell.wait();
        self.flatten(result)
    }

    fn flatten(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(Error::Interrupted) => {
                let mut causes = self.inner.group.collect_status();
                match causes.len() {
                    0 => Err(Error::Interrupted),
                    1 => Err(causes.remove(0)),
                    _ => Err(Error::Aggregate(causes)),
                }
            }
            other => other,
        }
    }

    /// Cancel this future's group (and thereby its siblings).
    pub fn cancel(&self) {
        match &self.inner.sched {
            Some(sched) => sched.cancel_group(&self.inner.group, Error::Interrupted),
            None => self.inner.group.cancel(Error::Interrupted),
        }
    }

    /// Fulfill a promise. Fulfilling a non-promise, or fulfilling the
    /// same promise twice, is fatal misuse. A fulfillment that loses a
    /// race against cancellation is quietly dropped.
    pub fn fulfill(&self, outcome: Result<T>) {
        assert!(self.inner.promised, "misuse: fulfill on a non-promise");
        let sched = self
            .inner
            .sched
            .as_ref()
            .expect("promises always carry a scheduler");

        if !self.inner.cell.assign(outcome) {
            if self.inner.group.is_cancelled() {
                return;
            }
            panic!("misuse: promise fulfilled twice");
        }
        sched.finish_external(self.inner.task);
    }

    /// Apply `f` to the outcome, producing a dependent future.
    ///
    /// Fast path: if this future's task has not started, `f` is appended
    /// to the same task as a continuation body and the returned future
    /// shares the task id, avoiding a scheduling round trip. Otherwise a
    /// dependent task is forked.
    pub fn map<U, F>(&self, f: F) -> Future<U>
    where
        T: Clone,
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let sched = match &self.inner.sched {
            Some(sched) => sched.clone(),
            None => {
                // Immediate value: nothing to schedule around.
                let result = self
                    .inner
                    .cell
                    .peek()
                    .expect("value futures are always assigned");
                let cell = Arc::new(AssignCell::new("map"));
                match result {
                    Ok(v) => match catch_unwind(AssertUnwindSafe(move || f(v))) {
                        Ok(u) => {
                            cell.assign(Ok(u));
                        }
                        Err(payload) => {
                            cell.assign(Err(Error::from_panic(payload)));
                        }
                    },
                    Err(e) => {
                        cell.assign(Err(e));
                    }
                }
                return Future {
                    inner: Arc::new(FutureInner {
                        sched: None,
                        task: TaskId::DUMMY,
                        group: self.inner.group.clone(),
                        promised: false,
                        cell,
                    }),
                };
            }
        };

        let cell = Arc::new(AssignCell::new("map"));
        let body: Body = {
            let source = self.inner.cell.clone();
            let group = self.inner.group.clone();
            let cell = cell.clone();
            Box::new(move || {
                let result = source
                    .peek()
                    .expect("source cell assigned before continuation runs");
                match result {
                    Ok(v) => {
                        if !group.is_alive() {
                            cell.assign(Err(Error::Interrupted));
                            return;
                        }
                        match catch_unwind(AssertUnwindSafe(move || f(v))) {
                            Ok(u) => {
                                cell.assign(Ok(u));
                            }
                            Err(payload) => {
                                let error = Error::from_panic(payload);
                                group.cancel(error.clone());
                                cell.assign(Err(error));
                            }
                        }
                    }
                    Err(e) => {
                        cell.assign(Err(e));
                    }
                }
            })
        };

        match sched.extend(self.inner.task, body) {
            None => Future {
                inner: Arc::new(FutureInner {
                    sched: Some(sched),
                    task: self.inner.task,
                    group: self.inner.group.clone(),
                    promised: false,
                    cell,
                }),
            },
            Some(body) => {
                // The source has started or finished; run the
                // continuation as a dependent task instead.
                let task = sched.submit(self.inner.group.clone(), &[self.inner.task], 0, body);
                Future {
                    inner: Arc::new(FutureInner {
                        sched: Some(sched),
                        task,
                        group: self.inner.group.clone(),
                        promised: false,
                        cell,
                    }),
                }
            }
        }
    }
}

impl<T: Send> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("task", &self.inner.task)
            .field("group", &self.inner.group.id())
            .field("promised", &self.inner.promised)
            .field("finished", &self.inner.cell.is_assigned())
            .finish()
    }
}
