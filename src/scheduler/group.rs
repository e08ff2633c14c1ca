//! Cancellation groups.
//!
//! A group is a node in a cancellation tree. Liveness is "self and every
//! ancestor alive", so cancelling a group makes all descendants observe
//! cancellation at the same instant, without touching them. Ownership is
//! shared: every live task holds its group, and a subtree is reclaimed
//! when the last holder drops it (children are tracked through weak
//! references).

use crate::error::Error;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static GROUP_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Cancellation status. `None` is alive; `Some(reasons)` is cancelled,
/// where an empty reason list means a pure interrupt and a non-empty one
/// collects the failures that caused the cancellation.
type Status = Option<Vec<Error>>;

struct GroupInner {
    id: u64,
    parent: Option<Group>,
    children: Mutex<Vec<Weak<GroupInner>>>,
    status: Mutex<Status>,
}

/// A cancellation scope. Cheap to clone; clones share identity.
#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

impl Group {
    /// Create a group, optionally as a child of `parent`. Groups are
    /// cancelled only explicitly; creating or dropping one never affects
    /// its parent or children.
    pub fn new(parent: Option<&Group>) -> Group {
        let group = Group {
            inner: Arc::new(GroupInner {
                id: GROUP_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                parent: parent.cloned(),
                children: Mutex::new(Vec::new()),
                status: Mutex::new(None),
            }),
        };
        if let Some(parent) = parent {
            parent
                .inner
                .children
                .lock()
                .push(Arc::downgrade(&group.inner));
        }
        group
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn parent(&self) -> Option<&Group> {
        self.inner.parent.as_ref()
    }

    /// True iff neither this group nor any ancestor has been cancelled.
    pub fn is_alive(&self) -> bool {
        let alive_here = { self.inner.status.lock().is_none() };
        alive_here
            && self
                .inner
                .parent
                .as_ref()
                .map_or(true, |parent| parent.is_alive())
    }

    pub fn is_cancelled(&self) -> bool {
        !self.is_alive()
    }

    /// Mark this group cancelled. Monotonic and idempotent: the first
    /// call transitions to cancelled; later calls only accumulate
    /// non-interrupt reasons.
    pub fn cancel(&self, reason: Error) {
        let mut status = self.inner.status.lock();
        match status.as_mut() {
            None => {
                let reasons = if reason.is_interrupt() {
                    Vec::new()
                } else {
                    vec![reason]
                };
                *status = Some(reasons);
            }
            Some(reasons) => {
                if !reason.is_interrupt() {
                    reasons.push(reason);
                }
            }
        }
    }

    /// The collected failure set: this group's reasons plus those of all
    /// live descendants, in insertion order. Pure interrupts contribute
    /// nothing. Dead child references are pruned on the way.
    pub fn collect_status(&self) -> Vec<Error> {
        let mut reasons = {
            let status = self.inner.status.lock();
            status.as_ref().cloned().unwrap_or_default()
        };

        let children: Vec<Group> = {
            let mut slots = self.inner.children.lock();
            slots.retain(|weak| weak.strong_count() > 0);
            slots
                .iter()
                .filter_map(|weak| weak.upgrade())
                .map(|inner| Group { inner })
                .collect()
        };

        for child in children {
            reasons.extend(child.collect_status());
        }
        reasons
    }

    /// True iff `ancestor` is this group or appears on its parent chain.
    pub fn within(&self, ancestor: &Group) -> bool {
        let mut current = Some(self);
        while let Some(group) = current {
            if group.inner.id == ancestor.inner.id {
                return true;
            }
            current = group.inner.parent.as_ref();
        }
        false
    }

    pub fn same(&self, other: &Group) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.inner.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_group_is_alive() {
        let g = Group::new(None);
        assert!(g.is_alive());
        assert!(!g.is_cancelled());
        assert!(g.collect_status().is_empty());
    }

    #[test]
    fn test_cancel_is_monotonic_and_idempotent() {
        let g = Group::new(None);
        g.cancel(Error::Interrupted);
        assert!(g.is_cancelled());
        assert!(g.collect_status().is_empty());

        g.cancel(Error::Interrupted);
        assert!(g.is_cancelled());
        assert!(g.collect_status().is_empty());
    }

    #[test]
    fn test_cancel_collects_failures() {
        let g = Group::new(None);
        g.cancel(Error::Panic("first".into()));
        g.cancel(Error::Panic("second".into()));

        let reasons = g.collect_status();
        assert_eq!(reasons.len(), 2);
        assert!(matches!(reasons[0], Error::Panic(ref m) if m == "first"));
        assert!(matches!(reasons[1], Error::Panic(ref m) if m == "second"));
    }

    #[test]
    fn test_descendants_observe_parent_cancellation() {
        let parent = Group::new(None);
        let child = Group::new(Some(&parent));
        let grandchild = Group::new(Some(&child));

        assert!(grandchild.is_alive());
        parent.cancel(Error::Interrupted);

        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn test_sibling_unaffected() {
        let parent = Group::new(None);
        let a = Group::new(Some(&parent));
        let b = Group::new(Some(&parent));

        a.cancel(Error::Interrupted);
        assert!(a.is_cancelled());
        assert!(b.is_alive());
        assert!(parent.is_alive());
    }

    #[test]
    fn test_status_unions_descendants() {
        let parent = Group::new(None);
        let child = Group::new(Some(&parent));
        child.cancel(Error::Panic("inner failure".into()));

        let reasons = parent.collect_status();
        assert_eq!(reasons.len(), 1);
        assert!(matches!(reasons[0], Error::Panic(ref m) if m == "inner failure"));
    }

    #[test]
    fn test_within() {
        let parent = Group::new(None);
        let child = Group::new(Some(&parent));
        let stranger = Group::new(None);

        assert!(child.within(&parent));
        assert!(child.within(&child));
        assert!(!parent.within(&child));
        assert!(!child.within(&stranger));
    }
}
