//! Priority + dependency queue of pending work.
//!
//! Every non-finished task lives here, grouped by cancellation group.
//! Ready tasks sit in a max-heap ordered by priority then FIFO; entries
//! are validated lazily on pop, so stale keys (finished or no longer
//! ready) are simply skipped. Dependency edges are kept in both
//! directions: forward edges gate readiness, inverse edges let a joining
//! worker find work that actually advances what it is waiting for.

use super::group::Group;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Identity of already-resolved values; never enters the queue.
    pub const DUMMY: TaskId = TaskId(0);

    pub(crate) fn next() -> Self {
        TaskId(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_dummy(&self) -> bool {
        self.0 == 0
    }
}

/// One executable continuation of a task. Bodies never unwind: result
/// capture happens inside.
pub(crate) type Body = Box<dyn FnOnce() + Send + 'static>;

/// Resolution callback for a passive task whose group is cancelled.
pub(crate) type AbortFn = Box<dyn Fn() + Send + 'static>;

pub(crate) enum JobState {
    /// Waiting to run; ready once `deps` is empty.
    Queued { bodies: Vec<Body> },
    /// Handed to a worker.
    Running,
    /// A promise awaiting external fulfillment; no body, no deps.
    Passive { abort: AbortFn },
}

pub(crate) struct JobEntry {
    pub group: Group,
    pub priority: i32,
    pub state: JobState,
    /// Unfinished prerequisites of this task.
    pub deps: HashSet<TaskId>,
    /// Tasks whose `deps` contain this task.
    pub dependents: HashSet<TaskId>,
}

impl JobEntry {
    fn is_ready(&self) -> bool {
        matches!(self.state, JobState::Queued { .. }) && self.deps.is_empty()
    }
}

/// Heap key: highest priority first, then lowest id (FIFO).
#[derive(Debug, PartialEq, Eq)]
struct ReadyKey {
    priority: i32,
    id: TaskId,
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Work handed to a worker: the task, its group, and its bodies in
/// submission order.
pub(crate) struct Work {
    pub task: TaskId,
    pub group: Group,
    pub bodies: Vec<Body>,
}

/// Queue population counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatus {
    pub ready: usize,
    pub pending: usize,
    pub running: usize,
    pub passive: usize,
}

#[derive(Default)]
pub(crate) struct TaskQueue {
    jobs: HashMap<TaskId, JobEntry>,
    ready: BinaryHeap<ReadyKey>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task. Edges to already-finished dependencies are not
    /// recorded. Returns the id and whether the task is immediately
    /// ready (callers use that to wake a worker).
    pub fn enqueue(
        &mut self,
        group: Group,
        deps: &[TaskId],
        priority: i32,
        body: Body,
    ) -> (TaskId, bool) {
        let id = TaskId::next();

        let live_deps: HashSet<TaskId> = deps
            .iter()
            .copied()
            .filter(|dep| self.jobs.contains_key(dep))
            .collect();
        for dep in &live_deps {
            self.jobs
                .get_mut(dep)
                .expect("dependency filtered to live entries")
                .dependents
                .insert(id);
        }

        let ready_now = live_deps.is_empty();
        self.jobs.insert(
            id,
            JobEntry {
                group,
                priority,
                state: JobState::Queued { bodies: vec![body] },
                deps: live_deps,
                dependents: HashSet::new(),
            },
        );
        if ready_now {
            self.ready.push(ReadyKey { priority, id });
        }
        (id, ready_now)
    }

    /// Insert a passive task (a promise). It has no body and no deps;
    /// `abort` resolves its cell if the group is cancelled.
    pub fn enqueue_passive(&mut self, group: Group, abort: AbortFn) -> TaskId {
        let id = TaskId::next();
        self.jobs.insert(
            id,
            JobEntry {
                group,
                priority: 0,
                state: JobState::Passive { abort },
                deps: HashSet::new(),
                dependents: HashSet::new(),
            },
        );
        id
    }

    /// Append a continuation body to a queued, not-yet-running task.
    /// Returns the body back if the task has started, finished, or is
    /// passive; `None` on success.
    pub fn extend(&mut self, id: TaskId, body: Body) -> Option<Body> {
        match self.jobs.get_mut(&id) {
            Some(JobEntry {
                state: JobState::Queued { bodies },
                ..
            }) => {
                bodies.push(body);
                None
            }
            _ => Some(body),
        }
    }

    /// Pop the best ready task. Tasks of cancelled groups are still
    /// handed out: their bodies observe the dead group and resolve their
    /// cells without running user code, which keeps cell assignment in
    /// exactly one place.
    pub fn dequeue(&mut self) -> Option<Work> {
        while let Some(key) = self.ready.pop() {
            let valid = self
                .jobs
                .get(&key.id)
                .map_or(false, |entry| entry.is_ready() && entry.priority == key.priority);
            if valid {
                return Some(self.start(key.id));
            }
        }
        None
    }

    /// Pop a ready task that `targets` transitively depend on, preferring
    /// higher priority then FIFO among the candidates. Used by joining
    /// workers so the work they pick up advances their own wait.
    pub fn dequeue_towards(&mut self, targets: &[TaskId]) -> Option<Work> {
        let mut seen: HashSet<TaskId> = HashSet::new();
        let mut stack: Vec<TaskId> = targets.to_vec();
        let mut best: Option<(i32, TaskId)> = None;

        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(entry) = self.jobs.get(&id) {
                if entry.is_ready() {
                    let candidate = (entry.priority, id);
                    best = Some(match best {
                        None => candidate,
                        Some(current) => {
                            // higher priority wins, then lower id
                            if (candidate.0, std::cmp::Reverse(candidate.1))
                                > (current.0, std::cmp::Reverse(current.1))
                            {
                                candidate
                            } else {
                                current
                            }
                        }
                    });
                }
                stack.extend(entry.deps.iter().copied());
            }
        }

        best.map(|(_, id)| self.start(id))
    }

    fn start(&mut self, id: TaskId) -> Work {
        let entry = self.jobs.get_mut(&id).expect("started task is present");
        let state = std::mem::replace(&mut entry.state, JobState::Running);
        let bodies = match state {
            JobState::Queued { bodies } => bodies,
            _ => unreachable!("only queued tasks are started"),
        };
        Work {
            task: id,
            group: entry.group.clone(),
            bodies,
        }
    }

    /// Record that `id` (a running task, on behalf of a joining worker)
    /// now waits on `targets`. Edges to finished tasks are not created.
    pub fn depend(&mut self, id: TaskId, targets: &[TaskId]) {
        for target in targets {
            if *target == id || !self.jobs.contains_key(target) {
                continue;
            }
            if let Some(entry) = self.jobs.get_mut(&id) {
                entry.deps.insert(*target);
            } else {
                continue;
            }
            self.jobs
                .get_mut(target)
                .expect("target checked above")
                .dependents
                .insert(id);
        }
    }

    /// Remove a finished task and its edges; dependents whose last
    /// prerequisite this was become ready. Returns whether the task had
    /// dependents, i.e. whether anyone can be waiting on its completion.
    pub fn finish(&mut self, id: TaskId) -> bool {
        let entry = match self.jobs.remove(&id) {
            Some(entry) => entry,
            None => return false,
        };

        let had_dependents = !entry.dependents.is_empty();
        for dependent in entry.dependents {
            if let Some(dep_entry) = self.jobs.get_mut(&dependent) {
                dep_entry.deps.remove(&id);
                if dep_entry.is_ready() {
                    self.ready.push(ReadyKey {
                        priority: dep_entry.priority,
                        id: dependent,
                    });
                }
            }
        }
        // A joining worker's task may finish while still holding forward
        // edges; unhook its inverse entries.
        for prerequisite in entry.deps {
            if let Some(pre_entry) = self.jobs.get_mut(&prerequisite) {
                pre_entry.dependents.remove(&id);
            }
        }
        had_dependents
    }

    /// Process a cancellation for `group` and its descendants: passive
    /// members are aborted and removed. Queued members stay; their bodies
    /// resolve as interrupted when a worker drains them. Returns true
    /// when no member is still running (the cancellation is complete).
    pub fn cancel(&mut self, group: &Group) -> bool {
        let mut still_running = false;
        let mut aborted: Vec<TaskId> = Vec::new();

        for (id, entry) in self.jobs.iter() {
            if !entry.group.within(group) {
                continue;
            }
            match &entry.state {
                JobState::Running => still_running = true,
                JobState::Passive { abort } => {
                    abort();
                    aborted.push(*id);
                }
                JobState::Queued { .. } => {}
            }
        }

        for id in aborted {
            self.finish(id);
        }
        !still_running
    }

    /// Distinct alive groups with members still queued, for shutdown
    /// cleanup. Callers cancel each and then run [`cancel`](Self::cancel).
    pub fn cancel_all(&mut self) -> Vec<Group> {
        let mut groups: Vec<Group> = Vec::new();
        for entry in self.jobs.values() {
            if entry.group.is_alive() && !groups.iter().any(|g| g.same(&entry.group)) {
                groups.push(entry.group.clone());
            }
        }
        groups
    }

    pub fn status(&self) -> QueueStatus {
        let mut status = QueueStatus::default();
        for entry in self.jobs.values() {
            match entry.state {
                JobState::Queued { .. } if entry.deps.is_empty() => status.ready += 1,
                JobState::Queued { .. } => status.pending += 1,
                JobState::Running => status.running += 1,
                JobState::Passive { .. } => status.passive += 1,
            }
        }
        status
    }

    pub fn ready_count(&self) -> usize {
        self.jobs.values().filter(|entry| entry.is_ready()).count()
    }

    /// Cheap readiness signal for wakeup decisions. May report stale heap
    /// keys as ready; a spurious wakeup is harmless.
    pub fn has_ready_hint(&self) -> bool {
        !self.ready.is_empty()
    }

    /// True iff every remaining task is passive; with no running workers
    /// this is the quiescent state in which the scheduler may shut down.
    pub fn all_passive(&self) -> bool {
        self.jobs
            .values()
            .all(|entry| matches!(entry.state, JobState::Passive { .. }))
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.jobs.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
