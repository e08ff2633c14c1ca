use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use weft::prelude::*;

fn inc_steps(n: usize) -> Vec<Step<i64>> {
    (0..n)
        .map(|_| -> Step<i64> { Box::new(|acc| acc + 1) })
        .collect()
}

#[test]
fn test_static_compaction_through_scheduler() {
    // 100 increments over identity 0, batches of 5: 20 groups, each
    // reducing to 5, total 100.
    weft::init_thread_local().unwrap();

    let compactor = Compactor::new_static(5);
    let futures: Vec<Future<i64>> = compactor
        .compact_list(inc_steps(100), || 0i64)
        .map(|batch| {
            assert_eq!(batch.size(), 5);
            weft::fork(move || batch.run())
        })
        .collect();

    assert_eq!(futures.len(), 20);
    let outputs = weft::join_all(&futures).unwrap();
    assert!(outputs.iter().all(|&v| v == 5));
    assert_eq!(outputs.iter().sum::<i64>(), 100);

    weft::shutdown();
}

#[test]
fn test_dynamic_compaction_with_priming() {
    weft::init_thread_local().unwrap();

    let compactor = Compactor::new_dynamic(Duration::from_millis(10)).prime(Some(15), false);
    let futures: Vec<Future<i64>> = compactor
        .compact_list(inc_steps(100), || 0i64)
        .map(|batch| {
            assert!(batch.size() >= 1);
            weft::fork(move || batch.run())
        })
        .collect();

    let total: i64 = weft::join_all(&futures).unwrap().into_iter().sum();
    assert_eq!(total, 100);

    weft::shutdown();
}

mod tree_scenarios {
    use super::*;
    use weft::tree::{TreeBuilder, TreeItem};

    /// Reference: sequential depth-first expansion.
    fn sequential(depth: u32) -> Vec<u64> {
        fn go(level: u32, depth: u32, out: &mut Vec<u64>) {
            for item in expand_node(level, depth) {
                match item {
                    TreeItem::Leaf(v) => out.push(v),
                    TreeItem::Node(next) => go(next, depth, out),
                }
            }
        }
        let mut out = Vec::new();
        go(0, depth, &mut out);
        out
    }

    /// Three leaves and, below `depth`, three children per node.
    fn expand_node(level: u32, depth: u32) -> Vec<TreeItem<u32, u64>> {
        let base = (level as u64) * 100;
        let mut children = vec![
            TreeItem::Leaf(base),
            TreeItem::Leaf(base + 1),
            TreeItem::Leaf(base + 2),
        ];
        if level < depth {
            for _ in 0..3 {
                children.push(TreeItem::Node(level + 1));
            }
        }
        children
    }

    #[test]
    fn test_ordered_tree_equals_reference() {
        weft::init_thread_local().unwrap();

        let depth = 6;
        let leaves: Vec<u64> = TreeBuilder::new()
            .set_order_matters(true)
            .set_compactor(Compactor::new_static(3))
            .compute_tree(0u32, move |level| expand_node(level, depth))
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(leaves, sequential(depth));
        weft::shutdown();
    }

    #[test]
    fn test_unordered_tree_same_multiset() {
        weft::init_thread_local().unwrap();

        let depth = 5;
        let mut leaves: Vec<u64> = TreeBuilder::new()
            .set_compactor(Compactor::new_dynamic(Duration::from_millis(1)))
            .compute_tree(0u32, move |level| expand_node(level, depth))
            .collect::<Result<Vec<_>>>()
            .unwrap();

        let mut expected = sequential(depth);
        leaves.sort_unstable();
        expected.sort_unstable();
        assert_eq!(leaves, expected);
        weft::shutdown();
    }
}

#[test]
fn test_group_cancellation_before_start() {
    weft::init_thread_local().unwrap();

    // A gate dependency keeps all 20 tasks unstarted until fulfillment,
    // making the cancel-before-any-completes race deterministic.
    let gate: Future<i32> = weft::promise();
    let group = weft::new_group(None);
    let started = Arc::new(AtomicUsize::new(0));

    let futures: Vec<Future<usize>> = (0..20)
        .map(|i| {
            let started = started.clone();
            weft::fork_deps_in(&group, &[gate.task_id()], 0, move || {
                started.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                i
            })
        })
        .collect();

    weft::cancel_group(&group);
    gate.fulfill(Ok(0));

    for result in weft::join_results(&futures) {
        assert!(matches!(result, Err(Error::Interrupted)));
    }
    assert_eq!(started.load(Ordering::SeqCst), 0);

    weft::shutdown();
}

#[test]
fn test_cancel_group_is_idempotent() {
    weft::init_thread_local().unwrap();

    let group = weft::new_group(None);
    let f = weft::fork_in(&group, || 1);
    let _ = f.join();

    weft::cancel_group(&group);
    weft::cancel_group(&group);
    assert!(group.is_cancelled());

    let late = weft::fork_in(&group, || 2);
    assert!(matches!(late.join(), Err(Error::Interrupted)));

    weft::shutdown();
}

#[test]
fn test_promise_external_fulfillment() {
    weft::init_thread_local().unwrap();

    let promise: Future<i32> = weft::promise();

    let fulfiller = {
        let promise = promise.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            promise.fulfill(Ok(42));
        })
    };

    assert_eq!(promise.join().unwrap(), 42);
    fulfiller.join().unwrap();

    // Second fulfillment is fatal misuse.
    let again = promise.clone();
    let panicked = catch_unwind(AssertUnwindSafe(|| again.fulfill(Ok(43)))).is_err();
    assert!(panicked);

    weft::shutdown();
}

#[test]
fn test_fast_path_map_shares_task() {
    weft::init_thread_local().unwrap();

    // Gate the source so no worker can dequeue it before map runs.
    let gate: Future<i32> = weft::promise();
    let f = weft::fork_deps(&[gate.task_id()], 0, || 21 * 2);
    let g = f.map(|x| x + 1);

    assert_eq!(g.task_id(), f.task_id());

    gate.fulfill(Ok(0));
    assert_eq!(g.join().unwrap(), 43);
    assert_eq!(f.join().unwrap(), 42);

    weft::shutdown();
}

#[test]
fn test_map_after_start_forks_dependent() {
    weft::init_thread_local().unwrap();

    let f = weft::fork(|| 10);
    assert_eq!(f.join().unwrap(), 10);

    // Source finished: the continuation gets its own task.
    let g = f.map(|x| x * 3);
    assert_ne!(g.task_id(), f.task_id());
    assert_eq!(g.join().unwrap(), 30);

    weft::shutdown();
}

#[test]
fn test_failure_cancels_siblings_and_surfaces_cause() {
    weft::init_thread_local().unwrap();

    let group = weft::new_group(None);
    let failing = weft::fork_in(&group, || -> i32 { panic!("root cause") });
    assert!(matches!(failing.join(), Err(Error::Panic(ref m)) if m == "root cause"));

    // A sibling forked after the failure resolves as the collected
    // cause, not a bare interrupt.
    let sibling = weft::fork_in(&group, || 5);
    assert!(matches!(sibling.join(), Err(Error::Panic(ref m)) if m == "root cause"));

    weft::shutdown();
}

#[test]
fn test_join_all_reports_first_failure_in_list_order() {
    weft::init_thread_local().unwrap();

    let isolated = weft::new_group(None);
    let ok = weft::fork(|| 1);
    let bad = weft::fork_in(&isolated, || -> i32 { panic!("first bad") });
    let _ = bad.join();
    let ok_late = weft::fork(|| 3);

    let futures = vec![ok, bad, ok_late];
    let err = weft::join_all(&futures).unwrap_err();
    assert!(matches!(err, Error::Panic(ref m) if m == "first bad"));

    weft::shutdown();
}

#[test]
fn test_join_inside_guarded_section_is_misuse() {
    let cell = GuardedCell::new("state", 0i32);
    let f = weft::value(1);

    let panicked = catch_unwind(AssertUnwindSafe(|| {
        cell.change(|_| {
            let _ = f.join();
        });
    }))
    .is_err();
    assert!(panicked);
}

#[test]
fn test_shutdown_drains_to_quiescence() {
    weft::init_thread_local().unwrap();

    let futures: Vec<Future<usize>> = (0..50)
        .map(|i| {
            weft::fork(move || {
                thread::sleep(Duration::from_millis(1));
                i
            })
        })
        .collect();

    weft::shutdown();

    // Everything submitted before shutdown ran to completion.
    assert!(futures.iter().all(|f| f.is_finished()));
    let total: usize = weft::join_all(&futures).unwrap().into_iter().sum();
    assert_eq!(total, (0..50).sum());
}

#[test]
fn test_shutdown_resolves_abandoned_promises() {
    weft::init_thread_local().unwrap();

    let orphan: Future<i32> = weft::promise();
    weft::shutdown();

    assert!(matches!(orphan.join(), Err(Error::Interrupted)));
}

#[test]
fn test_nested_fork_inherits_group() {
    weft::init_thread_local().unwrap();

    let group = weft::new_group(None);
    let outer = weft::fork_in(&group, || {
        let inner = weft::fork(|| 7);
        let inner_group = inner.group().clone();
        (inner.join().unwrap(), inner_group)
    });

    let (inner_value, inner_group) = outer.join().unwrap();
    assert_eq!(inner_value, 7);
    assert!(inner_group.within(&group));

    weft::shutdown();
}

#[test]
fn test_fork_deps_waits_for_dependencies() {
    weft::init_thread_local().unwrap();

    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let first = {
        let order = order.clone();
        weft::fork(move || {
            thread::sleep(Duration::from_millis(10));
            order.lock().push("first");
        })
    };
    let second = {
        let order = order.clone();
        weft::fork_deps(&[first.task_id()], 0, move || {
            order.lock().push("second");
        })
    };

    second.join().unwrap();
    assert_eq!(*order.lock(), vec!["first", "second"]);

    weft::shutdown();
}

#[test]
fn test_single_thread_degrades_to_sequential() {
    let config = Config::builder().num_threads(1).build().unwrap();
    weft::init_thread_local_with_config(config).unwrap();

    let futures: Vec<Future<i64>> = (0i64..20).map(|i| weft::fork(move || i + 1)).collect();
    let total: i64 = weft::join_all(&futures).unwrap().into_iter().sum();
    assert_eq!(total, 210);

    let compactor = Compactor::new_dynamic(Duration::from_millis(5));
    let batch_futures: Vec<Future<i64>> = compactor
        .compact_list(inc_steps(30), || 0i64)
        .map(|batch| weft::fork(move || batch.run()))
        .collect();
    let total: i64 = weft::join_all(&batch_futures).unwrap().into_iter().sum();
    assert_eq!(total, 30);

    weft::shutdown();
}
