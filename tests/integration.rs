//! End-to-end scenarios exercised against every engine.
//!
//! The scenarios run at order 3, the smallest legal branching factor, so
//! even a handful of keys forces splits, borrows and merges.

use grove::{CoarseTree, FineTree, PalmTree, SeqTree, TreeIndex};

const SCENARIO_KEYS: [i64; 9] = [10, 20, 5, 6, 12, 30, 7, 17, 5];
const SCENARIO_SET: [i64; 8] = [5, 6, 7, 10, 12, 17, 20, 30];

fn build_scenario(tree: &dyn TreeIndex<i64>) {
    for key in SCENARIO_KEYS {
        tree.insert(key);
    }
}

// ===========================================================================
// Scenario S1: inserts with a duplicate yield a strictly ascending set
// ===========================================================================

#[test]
fn s1_fine_tree_insert_sequence() {
    let mut tree = FineTree::new(3);
    build_scenario(&tree);
    assert_eq!(tree.to_vec(), SCENARIO_SET.to_vec());
    assert_eq!(tree.len(), SCENARIO_SET.len());
    tree.check_invariants();
}

#[test]
fn s1_seq_tree_insert_sequence() {
    let mut tree = SeqTree::new(3);
    for key in SCENARIO_KEYS {
        tree.insert(key);
    }
    assert_eq!(tree.to_vec(), SCENARIO_SET.to_vec());
    tree.check_invariants();
}

#[test]
fn s1_coarse_tree_insert_sequence() {
    let tree = CoarseTree::new(3);
    build_scenario(&tree);
    assert_eq!(tree.to_vec(), SCENARIO_SET.to_vec());
}

#[test]
fn s1_palm_tree_insert_sequence() {
    let mut tree = PalmTree::new(3, 2);
    build_scenario(&tree);
    assert_eq!(tree.to_vec(), SCENARIO_SET.to_vec());
    tree.check_invariants();
}

// ===========================================================================
// Scenario S2: point lookups
// ===========================================================================

#[test]
fn s2_lookup_present_and_absent() {
    for tree in trees() {
        build_scenario(tree.as_ref());
        assert_eq!(tree.get(&12), Some(12));
        assert_eq!(tree.get(&99), None);
    }
}

// ===========================================================================
// Scenario S3: deletes shrink the tree
// ===========================================================================

#[test]
fn s3_fine_tree_deletes() {
    let mut tree = FineTree::new(3);
    build_scenario(&tree);
    for key in [10, 5, 20, 30] {
        assert!(tree.remove(&key), "key {key} should be removed");
        tree.check_invariants();
    }
    assert_eq!(tree.to_vec(), vec![6, 7, 12, 17]);
}

#[test]
fn s3_all_engines_delete() {
    for tree in trees() {
        build_scenario(tree.as_ref());
        for key in [10, 5, 20, 30] {
            assert!(tree.remove(&key), "key {key} should be removed");
        }
        for key in [6, 7, 12, 17] {
            assert_eq!(tree.get(&key), Some(key));
        }
        for key in [10, 5, 20, 30] {
            assert_eq!(tree.get(&key), None);
        }
        assert_eq!(tree.size(), 4);
    }
}

// ===========================================================================
// Scenario S4: the empty tree
// ===========================================================================

#[test]
fn s4_empty_tree() {
    for tree in trees() {
        assert_eq!(tree.get(&1), None);
        assert!(!tree.remove(&1));
        assert_eq!(tree.size(), 0);
    }
}

#[test]
fn s4_drain_then_reuse() {
    for tree in trees() {
        build_scenario(tree.as_ref());
        for key in SCENARIO_SET {
            assert!(tree.remove(&key));
        }
        assert_eq!(tree.size(), 0);
        assert_eq!(tree.get(&5), None);
        tree.insert(41);
        assert_eq!(tree.get(&41), Some(41));
        assert_eq!(tree.size(), 1);
    }
}

// ===========================================================================
// Cross-engine agreement on a longer workload
// ===========================================================================

#[test]
fn engines_agree_on_interleaved_workload() {
    let fine = FineTree::new(4);
    let coarse = CoarseTree::new(4);
    let palm: PalmTree<i64> = PalmTree::new(4, 3);
    let engines: [&dyn TreeIndex<i64>; 3] = [&fine, &coarse, &palm];

    for step in 0..400i64 {
        let key = (step * 37) % 101;
        for tree in engines {
            if step % 3 == 2 {
                tree.remove(&key);
            } else {
                tree.insert(key);
            }
        }
    }

    for key in 0..101 {
        let expected = coarse.get(&key);
        assert_eq!(fine.get(&key), expected, "fine disagrees on {key}");
        assert_eq!(TreeIndex::get(&palm, &key), expected, "palm disagrees on {key}");
    }
    assert_eq!(fine.size(), coarse.size());
    assert_eq!(palm.size(), coarse.size());
}

fn trees() -> Vec<Box<dyn TreeIndex<i64>>> {
    vec![
        Box::new(FineTree::new(3)),
        Box::new(CoarseTree::new(3)),
        Box::new(PalmTree::new(3, 2)),
        Box::new(FineTree::new(7)),
        Box::new(PalmTree::with_batch_size(5, 4, 16)),
    ]
}
