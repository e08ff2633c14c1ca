//! Lazy-in-depth, parallel-in-breadth tree expansion.
//!
//! A node-expansion function maps a node state to a list of leaves and
//! child nodes. [`TreeBuilder::compute_tree`] turns it into an iterator
//! over the leaves: children of a node are expanded in parallel (batched
//! through a [`Compactor`] and forked through the scheduler), while depth
//! is revealed only as the consumer advances, so a bounded amount of the
//! tree beyond the current position is ever forced.

use crate::compact::{Compactor, FoldDirection, Step};
use crate::error::{Error, Result};
use crate::future::{cancel_group, fork, fork_in, Future};
use crate::scheduler::{current_context, Group};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// One entry in a node's expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeItem<S, L> {
    Leaf(L),
    Node(S),
}

type ExpandFn<S, L> = Arc<dyn Fn(S) -> Vec<TreeItem<S, L>> + Send + Sync>;

/// Items produced by one dispatched batch: the expansion of each of its
/// nodes, in batch order.
type BatchOut<S, L> = Vec<Vec<TreeItem<S, L>>>;

/// Traversal configuration. Immutable-by-replacement, like
/// [`Compactor`].
#[derive(Debug, Clone, Copy)]
pub struct TreeBuilder {
    ordered: bool,
    use_groups: bool,
    compactor: Compactor,
    node_limit: usize,
    estimator: Option<usize>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self {
            ordered: false,
            use_groups: true,
            compactor: Compactor::new_static(1),
            node_limit: 1,
            estimator: None,
        }
    }

    /// Emit leaves in depth-first order. Without this, leaves stream in
    /// completion order.
    pub fn set_order_matters(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Run subtree batches in the caller's group instead of a dedicated
    /// cancellation group.
    pub fn set_no_groups(mut self) -> Self {
        self.use_groups = false;
        self
    }

    /// Batching policy for dispatched subtree expansions.
    pub fn set_compactor(mut self, compactor: Compactor) -> Self {
        self.compactor = compactor;
        self
    }

    /// Node-recursion coarseness: compose the expansion function with
    /// itself up to `k` levels per dispatched work item, collapsing deep
    /// tight recursion into fewer, larger subtasks.
    pub fn set_node_limit(mut self, k: usize) -> Self {
        self.node_limit = k.max(1);
        self
    }

    /// Expected child count hint, forwarded to a dynamic compactor.
    pub fn set_estimator(mut self, n: usize) -> Self {
        self.estimator = Some(n);
        self
    }

    /// Expand `root` with `expand`, yielding leaves lazily.
    pub fn compute_tree<S, L, F>(&self, root: S, expand: F) -> TreeIter<S, L>
    where
        S: Clone + Send + 'static,
        L: Clone + Send + 'static,
        F: Fn(S) -> Vec<TreeItem<S, L>> + Send + Sync + 'static,
    {
        // Batches accumulate per-node expansions by position; the fold
        // must thread left regardless of the policy's direction.
        let mut compactor = self.compactor.set_fold_direction(FoldDirection::Left);
        if let Some(n) = self.estimator {
            compactor = compactor.set_estimated_number(n);
        }

        let group = if self.use_groups {
            Some(match current_context() {
                Some(ctx) => Group::new(Some(&ctx.group)),
                None => Group::new(None),
            })
        } else {
            None
        };

        let shared = Shared {
            expand: Arc::new(expand),
            compactor,
            coarseness: self.node_limit,
            group,
        };

        if self.ordered {
            let mut stack = VecDeque::new();
            stack.push_back(Frame::Node(root));
            TreeIter {
                inner: Inner::Ordered(OrderedIter {
                    stack,
                    shared,
                    done: false,
                }),
            }
        } else {
            let (tx, rx) = unbounded();
            let mut local = VecDeque::new();
            local.push_back(TreeItem::Node(root));
            TreeIter {
                inner: Inner::Unordered(UnorderedIter {
                    local,
                    tx,
                    rx,
                    outstanding: 0,
                    shared,
                    done: false,
                }),
            }
        }
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Shared<S, L> {
    expand: ExpandFn<S, L>,
    compactor: Compactor,
    coarseness: usize,
    group: Option<Group>,
}

impl<S, L> Shared<S, L> {
    fn cancel(&self) {
        if let Some(group) = &self.group {
            cancel_group(group);
        }
    }
}

/// Expand `state` through up to `coarseness` levels, emitting leaves and
/// unexpanded nodes in depth-first order. Explicit work items with a
/// remaining-depth counter; no call-stack recursion.
fn expand_level<S, L>(
    expand: &ExpandFn<S, L>,
    state: S,
    coarseness: usize,
) -> Vec<TreeItem<S, L>> {
    enum WorkItem<S, L> {
        Expand(S, usize),
        Emit(TreeItem<S, L>),
    }

    let mut out = Vec::new();
    let mut stack = vec![WorkItem::Expand(state, coarseness.max(1))];
    while let Some(item) = stack.pop() {
        match item {
            WorkItem::Emit(entry) => out.push(entry),
            WorkItem::Expand(state, remaining) => {
                for child in expand(state).into_iter().rev() {
                    match child {
                        TreeItem::Leaf(leaf) => stack.push(WorkItem::Emit(TreeItem::Leaf(leaf))),
                        TreeItem::Node(next) => {
                            if remaining > 1 {
                                stack.push(WorkItem::Expand(next, remaining - 1));
                            } else {
                                stack.push(WorkItem::Emit(TreeItem::Node(next)));
                            }
                        }
                    }
                }
            }
        }
    }
    out
}

/// Batch the node states through the compactor and fork one future per
/// batch. Returns `(future, index)` slots, one per node, in order.
fn dispatch_nodes<S, L>(
    shared: &Shared<S, L>,
    nodes: Vec<S>,
) -> Vec<(Future<BatchOut<S, L>>, usize)>
where
    S: Clone + Send + 'static,
    L: Clone + Send + 'static,
{
    let coarseness = shared.coarseness;
    let steps: Vec<Step<BatchOut<S, L>>> = nodes
        .into_iter()
        .map(|state| {
            let expand = shared.expand.clone();
            let step: Step<BatchOut<S, L>> = Box::new(move |mut acc| {
                acc.push(expand_level(&expand, state, coarseness));
                acc
            });
            step
        })
        .collect();

    let mut slots = Vec::new();
    for batch in shared.compactor.compact_list(steps, Vec::new) {
        let size = batch.size();
        let fut = match &shared.group {
            Some(group) => fork_in(group, move || batch.run()),
            None => fork(move || batch.run()),
        };
        for idx in 0..size {
            slots.push((fut.clone(), idx));
        }
    }
    slots
}

enum Frame<S, L> {
    Leaf(L),
    Node(S),
    Pending {
        fut: Future<BatchOut<S, L>>,
        idx: usize,
    },
}

struct OrderedIter<S, L> {
    stack: VecDeque<Frame<S, L>>,
    shared: Shared<S, L>,
    done: bool,
}

impl<S, L> OrderedIter<S, L>
where
    S: Clone + Send + 'static,
    L: Clone + Send + 'static,
{
    /// Replace node items with `Pending` slots (their subtrees go
    /// parallel) and splice everything at the front of the stack.
    fn splice(&mut self, items: Vec<TreeItem<S, L>>) {
        let nodes: Vec<S> = items
            .iter()
            .filter_map(|item| match item {
                TreeItem::Node(state) => Some(state.clone()),
                TreeItem::Leaf(_) => None,
            })
            .collect();
        let mut slots = dispatch_nodes(&self.shared, nodes).into_iter();

        let frames: Vec<Frame<S, L>> = items
            .into_iter()
            .map(|item| match item {
                TreeItem::Leaf(leaf) => Frame::Leaf(leaf),
                TreeItem::Node(_) => {
                    let (fut, idx) = slots.next().expect("one slot per dispatched node");
                    Frame::Pending { fut, idx }
                }
            })
            .collect();
        for frame in frames.into_iter().rev() {
            self.stack.push_front(frame);
        }
    }

    fn fail(&mut self, error: &Error) {
        let _ = error;
        self.shared.cancel();
        self.done = true;
    }

    fn next_leaf(&mut self) -> Option<Result<L>> {
        if self.done {
            return None;
        }
        loop {
            match self.stack.pop_front() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Frame::Leaf(leaf)) => return Some(Ok(leaf)),
                Some(Frame::Node(state)) => {
                    let expand = self.shared.expand.clone();
                    let coarseness = self.shared.coarseness;
                    match catch_unwind(AssertUnwindSafe(|| {
                        expand_level(&expand, state, coarseness)
                    })) {
                        Ok(items) => self.splice(items),
                        Err(payload) => {
                            let error = Error::from_panic(payload);
                            self.fail(&error);
                            return Some(Err(error));
                        }
                    }
                }
                Some(Frame::Pending { fut, idx }) => match fut.join() {
                    Ok(groups) => {
                        let items = groups
                            .get(idx)
                            .cloned()
                            .expect("batch output has one slot per node");
                        self.splice(items);
                    }
                    Err(error) => {
                        self.fail(&error);
                        return Some(Err(error));
                    }
                },
            }
        }
    }
}

struct UnorderedIter<S, L> {
    local: VecDeque<TreeItem<S, L>>,
    tx: Sender<Result<BatchOut<S, L>>>,
    rx: Receiver<Result<BatchOut<S, L>>>,
    outstanding: usize,
    shared: Shared<S, L>,
    done: bool,
}

impl<S, L> UnorderedIter<S, L>
where
    S: Clone + Send + 'static,
    L: Clone + Send + 'static,
{
    /// Fork the node batches; completions stream back over the channel
    /// in whatever order they finish.
    fn dispatch(&mut self, nodes: Vec<S>) {
        let coarseness = self.shared.coarseness;
        let steps: Vec<Step<BatchOut<S, L>>> = nodes
            .into_iter()
            .map(|state| {
                let expand = self.shared.expand.clone();
                let step: Step<BatchOut<S, L>> = Box::new(move |mut acc| {
                    acc.push(expand_level(&expand, state, coarseness));
                    acc
                });
                step
            })
            .collect();

        for batch in self.shared.compactor.compact_list(steps, Vec::new) {
            let tx = self.tx.clone();
            let group = self.shared.group.clone();
            let body = move || {
                match catch_unwind(AssertUnwindSafe(|| batch.run())) {
                    Ok(out) => {
                        let _ = tx.send(Ok(out));
                    }
                    Err(payload) => {
                        let error = Error::from_panic(payload);
                        if let Some(group) = &group {
                            group.cancel(error.clone());
                        }
                        let _ = tx.send(Err(error));
                    }
                }
            };
            let _completion: Future<()> = match &self.shared.group {
                Some(group) => fork_in(group, body),
                None => fork(body),
            };
            self.outstanding += 1;
        }
    }

    fn expand_local(&mut self, state: S) -> Option<Error> {
        let expand = self.shared.expand.clone();
        let coarseness = self.shared.coarseness;
        match catch_unwind(AssertUnwindSafe(|| expand_level(&expand, state, coarseness))) {
            Ok(items) => {
                let mut nodes = Vec::new();
                for item in items {
                    match item {
                        TreeItem::Leaf(leaf) => self.local.push_back(TreeItem::Leaf(leaf)),
                        TreeItem::Node(next) => nodes.push(next),
                    }
                }
                if !nodes.is_empty() {
                    self.dispatch(nodes);
                }
                None
            }
            Err(payload) => Some(Error::from_panic(payload)),
        }
    }

    fn next_leaf(&mut self) -> Option<Result<L>> {
        loop {
            if self.done {
                return None;
            }
            if let Some(item) = self.local.pop_front() {
                match item {
                    TreeItem::Leaf(leaf) => return Some(Ok(leaf)),
                    TreeItem::Node(state) => {
                        if let Some(error) = self.expand_local(state) {
                            self.shared.cancel();
                            self.done = true;
                            return Some(Err(error));
                        }
                        continue;
                    }
                }
            }
            if self.outstanding == 0 {
                self.done = true;
                return None;
            }
            match self.rx.recv_timeout(Duration::from_millis(10)) {
                Ok(Ok(groups)) => {
                    self.outstanding -= 1;
                    for items in groups {
                        self.local.extend(items);
                    }
                }
                Ok(Err(error)) => {
                    self.outstanding -= 1;
                    self.shared.cancel();
                    self.done = true;
                    return Some(Err(error));
                }
                Err(RecvTimeoutError::Timeout) => {
                    // An external cancellation suppresses batch bodies
                    // before they can send; surface it instead of
                    // spinning forever. Without a dedicated group the
                    // batches ran in the consumer's task group.
                    let cancelled = match &self.shared.group {
                        Some(group) => group.is_cancelled(),
                        None => current_context().map_or(false, |ctx| ctx.group.is_cancelled()),
                    };
                    if cancelled {
                        self.done = true;
                        return Some(Err(Error::Interrupted));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

enum Inner<S, L> {
    Ordered(OrderedIter<S, L>),
    Unordered(UnorderedIter<S, L>),
}

/// Lazy leaf sequence of a parallel tree expansion. Dropping it early
/// cancels the traversal group, abandoning in-flight subtrees.
pub struct TreeIter<S, L> {
    inner: Inner<S, L>,
}

impl<S, L> Iterator for TreeIter<S, L>
where
    S: Clone + Send + 'static,
    L: Clone + Send + 'static,
{
    type Item = Result<L>;

    fn next(&mut self) -> Option<Result<L>> {
        match &mut self.inner {
            Inner::Ordered(iter) => iter.next_leaf(),
            Inner::Unordered(iter) => iter.next_leaf(),
        }
    }
}

impl<S, L> std::fmt::Debug for TreeIter<S, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (mode, done) = match &self.inner {
            Inner::Ordered(iter) => ("ordered", iter.done),
            Inner::Unordered(iter) => ("unordered", iter.done),
        };
        f.debug_struct("TreeIter")
            .field("mode", &mode)
            .field("done", &done)
            .finish()
    }
}

impl<S, L> Drop for TreeIter<S, L> {
    fn drop(&mut self) {
        let (done, shared) = match &self.inner {
            Inner::Ordered(iter) => (iter.done, &iter.shared),
            Inner::Unordered(iter) => (iter.done, &iter.shared),
        };
        if !done {
            shared.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;

    /// Reference: sequential depth-first expansion.
    fn sequential<S: Clone, L>(
        root: S,
        expand: &dyn Fn(S) -> Vec<TreeItem<S, L>>,
    ) -> Vec<L> {
        let mut out = Vec::new();
        let mut stack = vec![TreeItem::Node(root)];
        while let Some(item) = stack.pop() {
            match item {
                TreeItem::Leaf(leaf) => out.push(leaf),
                TreeItem::Node(state) => {
                    for child in expand(state).into_iter().rev() {
                        stack.push(child);
                    }
                }
            }
        }
        out
    }

    /// Branching factor 3, `depth` levels, three leaves per node.
    fn ternary(depth: u32) -> impl Fn(u32) -> Vec<TreeItem<u32, u32>> + Clone {
        move |level: u32| {
            let mut children = vec![
                TreeItem::Leaf(level * 10),
                TreeItem::Leaf(level * 10 + 1),
                TreeItem::Leaf(level * 10 + 2),
            ];
            if level < depth {
                for _ in 0..3 {
                    children.push(TreeItem::Node(level + 1));
                }
            }
            children
        }
    }

    #[test]
    fn test_ordered_matches_sequential_reference() {
        runtime::init_thread_local().unwrap();

        let expand = ternary(4);
        let expected = sequential(0u32, &{
            let expand = expand.clone();
            move |s| expand(s)
        });

        let leaves: Vec<u32> = TreeBuilder::new()
            .set_order_matters(true)
            .set_compactor(Compactor::new_static(2))
            .compute_tree(0u32, expand)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(leaves, expected);
        runtime::shutdown();
    }

    #[test]
    fn test_unordered_matches_multiset() {
        runtime::init_thread_local().unwrap();

        let expand = ternary(3);
        let mut expected = sequential(0u32, &{
            let expand = expand.clone();
            move |s| expand(s)
        });

        let mut leaves: Vec<u32> = TreeBuilder::new()
            .compute_tree(0u32, expand)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        expected.sort_unstable();
        leaves.sort_unstable();
        assert_eq!(leaves, expected);
        runtime::shutdown();
    }

    #[test]
    fn test_empty_root() {
        runtime::init_thread_local().unwrap();

        let leaves: Vec<u32> = TreeBuilder::new()
            .set_order_matters(true)
            .compute_tree(0u32, |_: u32| Vec::<TreeItem<u32, u32>>::new())
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert!(leaves.is_empty());

        runtime::shutdown();
    }

    #[test]
    fn test_coarsening_preserves_order() {
        runtime::init_thread_local().unwrap();

        let expand = ternary(4);
        let fine: Vec<u32> = TreeBuilder::new()
            .set_order_matters(true)
            .compute_tree(0u32, expand.clone())
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let coarse: Vec<u32> = TreeBuilder::new()
            .set_order_matters(true)
            .set_node_limit(3)
            .compute_tree(0u32, expand)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(fine, coarse);
        runtime::shutdown();
    }

    #[test]
    fn test_failure_surfaces_and_stops() {
        runtime::init_thread_local().unwrap();

        let results: Vec<Result<u32>> = TreeBuilder::new()
            .set_order_matters(true)
            .compute_tree(0u32, |level: u32| {
                if level == 2 {
                    panic!("bad node");
                }
                vec![
                    TreeItem::Leaf(level),
                    TreeItem::Node(level + 1),
                ]
            })
            .collect();

        let failures = results.iter().filter(|r| r.is_err()).count();
        assert_eq!(failures, 1);
        assert!(matches!(
            results.last().unwrap(),
            Err(Error::Panic(ref m)) if m == "bad node"
        ));

        runtime::shutdown();
    }

    #[test]
    fn test_lazy_prefix_pull() {
        runtime::init_thread_local().unwrap();

        // Unbounded depth: only a lazy consumer terminates.
        let mut iter = TreeBuilder::new()
            .set_order_matters(true)
            .compute_tree(0u64, |n: u64| {
                vec![TreeItem::Leaf(n), TreeItem::Node(n + 1)]
            });

        let prefix: Vec<u64> = iter.by_ref().take(5).map(|r| r.unwrap()).collect();
        assert_eq!(prefix, vec![0, 1, 2, 3, 4]);
        drop(iter);

        runtime::shutdown();
    }
}
