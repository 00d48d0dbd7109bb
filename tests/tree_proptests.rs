//! Property-based tests for the tree's structural invariants.
//!
//! Every generated workload must leave the tree balanced, within capacity,
//! with exact leaf counts after normalization, and serializable through a
//! byte-identical round trip.

#![allow(clippy::pedantic)]
#![allow(clippy::unwrap_used)]

mod common;

use proptest::prelude::*;

use ktree::node::Node;
use ktree::{Arena, KTree, Vector};

// ============================================================================
//  Strategies
// ============================================================================

/// A workload: dimensionality, branching factor, and a batch of vectors.
fn workload() -> impl Strategy<Value = (usize, usize, Vec<Vec<f32>>)> {
    (1usize..=5, 2usize..=6).prop_flat_map(|(dims, branching)| {
        prop::collection::vec(
            prop::collection::vec(-100.0f32..100.0, dims..=dims),
            1..=120,
        )
        .prop_map(move |points| (dims, branching, points))
    })
}

fn build_tree<'arena>(
    arena: &'arena Arena,
    dims: usize,
    branching: usize,
    points: &[Vec<f32>],
) -> KTree<'arena> {
    let tree = KTree::new(arena, branching, dims);
    for point in points {
        tree.insert(arena, &Vector::from_slice(point));
    }
    tree.normalize_counts();
    tree
}

/// Visit every node of a quiescent tree.
fn visit_nodes(tree: &KTree<'_>, visitor: &mut impl FnMut(&Node)) {
    fn walk(node: &Node, visitor: &mut impl FnMut(&Node)) {
        visitor(node);
        for which in 0..node.number_of_children() {
            if let Some(child) = node.child(which) {
                walk(child, visitor);
            }
        }
    }

    if let Some(root) = tree.root() {
        walk(root, visitor);
    }
}

// ============================================================================
//  Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Balance, capacity, and count invariants hold for any insert batch.
    #[test]
    fn structural_invariants_hold((dims, branching, points) in workload()) {
        common::init_tracing();

        let arena = Arena::new();
        let tree = build_tree(&arena, dims, branching, &points);

        let stats = tree.stats();
        prop_assert_eq!(stats.leaf_count, points.len());
        prop_assert_eq!(stats.min_leaf_depth, stats.max_leaf_depth);
        prop_assert_eq!(stats.max_leaf_count_drift, 0);
        prop_assert!(stats.min_fanout >= 1);
        prop_assert!(stats.max_fanout <= branching);
        prop_assert!(stats.max_centroid_error < 1e-3);
    }

    /// Serialize → deserialize → serialize is byte-identical.
    #[test]
    fn round_trip_is_byte_identical((dims, branching, points) in workload()) {
        common::init_tracing();

        let arena = Arena::new();
        let tree = build_tree(&arena, dims, branching, &points);
        let first = tree.serialize_to_string();

        let reload_arena = Arena::new();
        let reloaded = KTree::deserialize_str(&reload_arena, &first, branching).unwrap();

        prop_assert_eq!(reloaded.serialize_to_string(), first);
    }

    /// Two single-threaded builds over the same batch are identical.
    #[test]
    fn single_threaded_builds_are_deterministic((dims, branching, points) in workload()) {
        common::init_tracing();

        let first_arena = Arena::new();
        let first = build_tree(&first_arena, dims, branching, &points);

        let second_arena = Arena::new();
        let second = build_tree(&second_arena, dims, branching, &points);

        prop_assert_eq!(first.serialize_to_string(), second.serialize_to_string());
    }

    /// At every internal node of a quiescent tree, `closest_child` returns
    /// a child at minimal squared distance from the query.
    #[test]
    fn closest_child_is_sound(
        (dims, branching, points) in workload(),
        query_seed in prop::collection::vec(-100.0f32..100.0, 5),
    ) {
        common::init_tracing();

        let arena = Arena::new();
        let tree = build_tree(&arena, dims, branching, &points);
        let query = Vector::from_slice(&query_seed[..dims]);

        let mut failures = 0usize;
        visit_nodes(&tree, &mut |node| {
            if node.is_leaf() {
                return;
            }

            let best = node.closest_child(&query);
            let best_distance = query.distance_squared(node.child(best).unwrap().centroid());
            for which in 0..node.number_of_children() {
                let distance = query.distance_squared(node.child(which).unwrap().centroid());
                if distance < best_distance {
                    failures += 1;
                }
            }
        });

        prop_assert_eq!(failures, 0);
    }

    /// A node's centroid stays the leaf-weighted mean of its children, not
    /// the plain child mean.
    #[test]
    fn centroids_are_leaf_weighted((dims, branching, points) in workload()) {
        common::init_tracing();

        let arena = Arena::new();
        let tree = build_tree(&arena, dims, branching, &points);

        let mut failures = 0usize;
        visit_nodes(&tree, &mut |node| {
            if node.is_leaf() {
                return;
            }

            let mean = Vector::new(dims);
            let mut weight = 0usize;
            for which in 0..node.number_of_children() {
                let child = node.child(which).unwrap();
                mean.fused_multiply_add(child.centroid(), child.leaves_below() as f32);
                weight += child.leaves_below();
            }
            mean.div_in_place(weight as f32);

            if mean.distance_squared(node.centroid()).sqrt() >= 1e-3 {
                failures += 1;
            }
        });

        prop_assert_eq!(failures, 0);
    }
}
