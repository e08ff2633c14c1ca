//! Stress tests for the weft runtime.

use std::time::Duration;
use weft::prelude::*;
use weft::tree::{TreeBuilder, TreeItem};

#[test]
#[ignore] // Run with --ignored flag
fn stress_many_small_tasks() {
    weft::init_thread_local().unwrap();

    for _ in 0..20 {
        let futures: Vec<Future<i64>> = (0i64..1_000).map(|i| weft::fork(move || i)).collect();
        let total: i64 = weft::join_all(&futures).unwrap().into_iter().sum();
        assert_eq!(total, 499_500);
    }

    weft::shutdown();
}

#[test]
#[ignore]
fn stress_deep_ternary_tree() {
    weft::init_thread_local().unwrap();

    // Branching factor 3 at depth 10, three leaves per node.
    let depth = 10u32;
    let expand = move |level: u32| {
        let mut children = vec![
            TreeItem::Leaf(1u64),
            TreeItem::Leaf(1),
            TreeItem::Leaf(1),
        ];
        if level < depth {
            for _ in 0..3 {
                children.push(TreeItem::Node(level + 1));
            }
        }
        children
    };

    // 3 leaves per node over sum_{d=0..10} 3^d nodes.
    let nodes: u64 = (0..=depth).map(|d| 3u64.pow(d)).sum();
    let expected = nodes * 3;

    let count: u64 = TreeBuilder::new()
        .set_order_matters(true)
        .set_compactor(Compactor::new_dynamic(Duration::from_millis(2)))
        .set_node_limit(2)
        .compute_tree(0u32, expand)
        .map(|leaf| leaf.unwrap())
        .sum();
    assert_eq!(count, expected);

    weft::shutdown();
}

#[test]
#[ignore]
fn stress_deeply_nested_joins() {
    weft::init_thread_local().unwrap();

    fn nest(depth: u32) -> i64 {
        if depth == 0 {
            return 1;
        }
        let f = weft::fork(move || nest(depth - 1));
        f.join().unwrap() + 1
    }

    let f = weft::fork(|| nest(50));
    assert_eq!(f.join().unwrap(), 51);

    weft::shutdown();
}

#[test]
#[ignore]
fn stress_repeated_init_shutdown() {
    for _ in 0..10 {
        weft::init_thread_local().unwrap();
        let futures: Vec<Future<usize>> = (0..100).map(|i| weft::fork(move || i)).collect();
        assert_eq!(weft::join_all(&futures).unwrap().len(), 100);
        weft::shutdown();
    }
}

#[test]
#[ignore]
fn stress_cancellation_storm() {
    weft::init_thread_local().unwrap();

    for _ in 0..50 {
        let group = weft::new_group(None);
        let futures: Vec<Future<usize>> = (0..50)
            .map(|i| {
                weft::fork_in(&group, move || {
                    std::thread::sleep(Duration::from_micros(100));
                    i
                })
            })
            .collect();
        weft::cancel_group(&group);
        // Every future resolves, one way or the other.
        let results = weft::join_results(&futures);
        assert_eq!(results.len(), 50);
    }

    weft::shutdown();
}
