//! Scheduler control thread and elastic worker pool.
//!
//! A single control thread owns pool sizing and deferred cancellations;
//! a bounded set of workers drains the task queue. All shared state sits
//! behind one mutex with three condvars: `work_available` (workers wait
//! for ready tasks), `work_finished` (joining workers wait for progress
//! on their dependency cone), and `scheduler_event` (the control thread's
//! tick, woken early by scheduling events).

use super::group::Group;
use super::queue::{AbortFn, Body, QueueStatus, TaskId, TaskQueue, Work};
use crate::config::Config;
use crate::error::Error;
use crate::telemetry::{self, RuntimeEvent};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

thread_local! {
    static TASK_CONTEXT: RefCell<Vec<TaskContext>> = const { RefCell::new(Vec::new()) };
}

/// Execution context of the task currently running on this thread.
/// Nested task execution (work stealing inside `join`) stacks contexts.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub sched: Arc<Scheduler>,
    pub task: TaskId,
    pub group: Group,
}

pub(crate) fn current_context() -> Option<TaskContext> {
    TASK_CONTEXT.with(|stack| stack.borrow().last().cloned())
}

struct ContextGuard;

impl ContextGuard {
    fn enter(context: TaskContext) -> Self {
        TASK_CONTEXT.with(|stack| stack.borrow_mut().push(context));
        ContextGuard
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        TASK_CONTEXT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

struct WorkerHandle {
    id: usize,
    thread: JoinHandle<()>,
}

struct PoolState {
    queue: TaskQueue,
    workers: Vec<WorkerHandle>,
    /// Workers above this count retire themselves.
    pool_limit: usize,
    /// Workers currently executing a task (not parked, not join-blocked).
    active: usize,
    /// Workers parked inside `join`; the pool may grow past the base
    /// target to compensate for them.
    blocked: usize,
    trend: i32,
    shutdown: bool,
    control: Option<JoinHandle<()>>,
    next_worker_id: usize,
    /// Groups whose cancellation could not complete because members were
    /// still running; retried every tick, keyed by group id.
    deferred_cancel: HashMap<u64, Group>,
}

pub(crate) struct Scheduler {
    state: Mutex<PoolState>,
    work_available: Condvar,
    work_finished: Condvar,
    scheduler_event: Condvar,
    pub(crate) config: Config,
}

impl Scheduler {
    pub fn new(config: Config) -> Arc<Self> {
        let scheduler = Arc::new(Scheduler {
            state: Mutex::new(PoolState {
                queue: TaskQueue::new(),
                workers: Vec::new(),
                pool_limit: config.worker_threads(),
                active: 0,
                blocked: 0,
                trend: 0,
                shutdown: false,
                control: None,
                next_worker_id: 0,
                deferred_cancel: HashMap::new(),
            }),
            work_available: Condvar::new(),
            work_finished: Condvar::new(),
            scheduler_event: Condvar::new(),
            config,
        });

        let control = {
            let scheduler = scheduler.clone();
            thread::Builder::new()
                .name(format!("{}-control", scheduler.config.thread_name_prefix))
                .spawn(move || control_loop(&scheduler))
                .expect("failed to spawn scheduler control thread")
        };
        scheduler.state.lock().control = Some(control);
        scheduler
    }

    /// Enqueue a task body. Submitting after shutdown is fatal misuse.
    pub fn submit(&self, group: Group, deps: &[TaskId], priority: i32, body: Body) -> TaskId {
        let mut state = self.state.lock();
        assert!(!state.shutdown, "misuse: task submitted after shutdown");

        let (id, ready) = state.queue.enqueue(group, deps, priority, body);
        if ready {
            self.work_available.notify_one();
            let unblocked = state.workers.len().saturating_sub(state.blocked);
            if unblocked == 0 {
                self.scheduler_event.notify_one();
            }
        }
        id
    }

    /// Enqueue a passive task (a promise).
    pub fn submit_passive(&self, group: Group, abort: AbortFn) -> TaskId {
        let mut state = self.state.lock();
        assert!(!state.shutdown, "misuse: promise created after shutdown");
        state.queue.enqueue_passive(group, abort)
    }

    /// Append a continuation to a not-yet-started task; hands the body
    /// back if the task already ran.
    pub fn extend(&self, id: TaskId, body: Body) -> Option<Body> {
        self.state.lock().queue.extend(id, body)
    }

    /// Remove an externally fulfilled task from the queue.
    pub fn finish_external(&self, id: TaskId) {
        let mut state = self.state.lock();
        let had_dependents = state.queue.finish(id);
        if had_dependents {
            self.work_finished.notify_all();
        }
        if state.queue.has_ready_hint() {
            // Dependents of the fulfilled task may have become ready.
            self.work_available.notify_all();
            self.scheduler_event.notify_one();
        }
        if state.shutdown {
            self.scheduler_event.notify_all();
        }
    }

    /// Cancel a group: mark it (and thereby its descendants), abort its
    /// passive members, and defer completion if members are running.
    pub fn cancel_group(&self, group: &Group, reason: Error) {
        group.cancel(reason);

        let mut state = self.state.lock();
        let immediate = state.queue.cancel(group);
        if !immediate {
            state.deferred_cancel.insert(group.id(), group.clone());
            self.scheduler_event.notify_one();
        }
        if self.config.trace_events {
            telemetry::emit(RuntimeEvent::GroupCancelled {
                group: group.id(),
                immediate,
            });
        }
        // Joining workers may be parked on members that just resolved,
        // and aborting passive members may have unblocked dependents.
        self.work_finished.notify_all();
        self.work_available.notify_all();
    }

    /// Work-stealing wait used by `join` on worker threads. Runs ready
    /// tasks from the target's dependency cone until `finished` reports
    /// the awaited cell assigned; parks on `work_finished` when the cone
    /// has nothing ready.
    pub fn join_wait(self: &Arc<Self>, waiter: TaskId, target: TaskId, finished: &dyn Fn() -> bool) {
        loop {
            if finished() {
                return;
            }
            let work = {
                let mut state = self.state.lock();
                if finished() {
                    return;
                }
                if !state.queue.contains(target) {
                    // Finish is imminent: the result is being assigned.
                    return;
                }
                state.queue.depend(waiter, &[target]);
                match state.queue.dequeue_towards(&[target]) {
                    Some(work) => Some(work),
                    None => {
                        state.blocked += 1;
                        state.active -= 1;
                        self.work_available.notify_one();
                        self.scheduler_event.notify_one();
                        self.work_finished.wait(&mut state);
                        state.blocked -= 1;
                        state.active += 1;
                        None
                    }
                }
            };
            if let Some(work) = work {
                self.run_task(work, false);
            }
        }
    }

    /// Execute a task's bodies under its context, then retire it from the
    /// queue and wake whoever the completion can unblock.
    fn run_task(self: &Arc<Self>, work: Work, top_level: bool) {
        let task = work.task;
        {
            let _context = ContextGuard::enter(TaskContext {
                sched: self.clone(),
                task,
                group: work.group.clone(),
            });
            for body in work.bodies {
                // Bodies capture their own outcome; an unwind here is an
                // internal invariant violation, not a user failure.
                if catch_unwind(AssertUnwindSafe(move || body())).is_err() {
                    eprintln!("weft: task body panicked unexpectedly: {:?}", task);
                }
            }
        }

        let mut state = self.state.lock();
        if top_level {
            state.active -= 1;
        }
        let had_dependents = state.queue.finish(task);
        if had_dependents {
            self.work_finished.notify_all();
        }
        if state.queue.has_ready_hint() {
            self.work_available.notify_all();
        } else if top_level {
            self.work_available.notify_one();
        }
        if state.shutdown {
            self.scheduler_event.notify_all();
        }
    }

    /// Request shutdown and block until the pool is quiescent: queue
    /// drained to passive-or-finished, workers retired, control thread
    /// exited. Leftover passive tasks are resolved as interrupted.
    /// Idempotent. Must not be called from inside a task.
    pub fn shutdown(&self) {
        let control = {
            let mut state = self.state.lock();
            state.shutdown = true;
            self.scheduler_event.notify_all();
            self.work_available.notify_all();
            state.control.take()
        };
        if let Some(handle) = control {
            let _ = handle.join();
        }
    }

    pub fn status(&self) -> QueueStatus {
        self.state.lock().queue.status()
    }

    pub fn worker_count(&self) -> usize {
        self.state.lock().workers.len()
    }
}

fn control_loop(sched: &Arc<Scheduler>) {
    let tick = sched.config.tick;
    let base = sched.config.worker_threads();
    let trend_threshold = sched.config.trend_threshold;
    let trace = sched.config.trace_events;

    let mut state = sched.state.lock();
    loop {
        // Reap workers that died without retiring (panicked bodies are
        // contained, so this is a liveness backstop, not a normal path).
        state.workers.retain(|worker| !worker.thread.is_finished());

        let demand = state.queue.ready_count();
        let unblocked = state.workers.len().saturating_sub(state.blocked);
        state.trend = if demand > unblocked {
            state.trend.saturating_add(1).min(1_000)
        } else {
            state.trend.saturating_sub(1).max(-1_000)
        };

        // Target limit: the base pool plus compensation for join-blocked
        // workers, capped at twice the base. Zero once shutdown has
        // drained the queue to passive-only.
        let draining = !state.queue.all_passive();
        let mut limit = if state.shutdown && !draining {
            0
        } else {
            (base + state.blocked).min(base * 2)
        };
        if !state.shutdown && state.trend <= -trend_threshold {
            limit = limit.min(demand.max(1));
            state.trend = 0;
        }
        if limit != state.pool_limit {
            state.pool_limit = limit;
            if trace {
                telemetry::emit(RuntimeEvent::PoolResized {
                    workers: state.workers.len(),
                    limit,
                });
            }
            if state.workers.len() > limit {
                // Parked workers must wake to notice the contraction.
                sched.work_available.notify_all();
            }
        }

        // Growth is immediate: unmet demand spawns up to the limit now.
        while {
            let unblocked = state.workers.len().saturating_sub(state.blocked);
            demand > unblocked && state.workers.len() < state.pool_limit
        } {
            spawn_worker(sched, &mut state);
        }

        // Liveness backstop: a missed wakeup costs at most one tick.
        if demand > 0 && !state.workers.is_empty() {
            sched.work_available.notify_all();
        }

        // Retry cancellations that were blocked on running members.
        if !state.deferred_cancel.is_empty() {
            let mut deferred = std::mem::take(&mut state.deferred_cancel);
            deferred.retain(|_, group| !state.queue.cancel(group));
            state.deferred_cancel = deferred;
            sched.work_finished.notify_all();
        }

        if state.shutdown && state.queue.all_passive() && state.workers.is_empty() {
            // Resolve abandoned promises so their waiters observe the
            // interrupt instead of hanging.
            let groups = state.queue.cancel_all();
            for group in &groups {
                group.cancel(Error::Interrupted);
            }
            for group in &groups {
                state.queue.cancel(group);
            }
            if trace {
                telemetry::emit(RuntimeEvent::ShutdownComplete);
            }
            sched.work_finished.notify_all();
            sched.work_available.notify_all();
            return;
        }

        let deadline = Instant::now() + tick;
        sched.scheduler_event.wait_until(&mut state, deadline);
    }
}

fn spawn_worker(sched: &Arc<Scheduler>, state: &mut PoolState) {
    let id = state.next_worker_id;
    state.next_worker_id += 1;

    let mut builder =
        thread::Builder::new().name(format!("{}-{}", sched.config.thread_name_prefix, id));
    if let Some(stack_size) = sched.config.stack_size {
        builder = builder.stack_size(stack_size);
    }

    let handle = {
        let sched = sched.clone();
        builder.spawn(move || worker_loop(sched, id))
    };
    match handle {
        Ok(thread) => {
            state.workers.push(WorkerHandle { id, thread });
            if sched.config.trace_events {
                telemetry::emit(RuntimeEvent::WorkerSpawned { id });
            }
        }
        Err(e) => eprintln!("weft: worker spawn failed: {}", e),
    }
}

fn worker_loop(sched: Arc<Scheduler>, id: usize) {
    let active_limit = sched.config.worker_threads();
    loop {
        let work = {
            let mut state = sched.state.lock();
            loop {
                if state.workers.len() > state.pool_limit {
                    state.workers.retain(|worker| worker.id != id);
                    if sched.config.trace_events {
                        telemetry::emit(RuntimeEvent::WorkerRetired { id });
                    }
                    sched.scheduler_event.notify_all();
                    return;
                }
                if state.active >= active_limit {
                    sched.work_available.wait(&mut state);
                    continue;
                }
                if let Some(work) = state.queue.dequeue() {
                    state.active += 1;
                    break work;
                }
                sched.work_available.wait(&mut state);
            }
        };
        sched.run_task(work, true);
    }
}
