//! The split engine: in-place 2-means over a full node's children.
//!
//! A node that has overflowed (all `max_children + 1` slots reserved) is
//! divided into two replacement nodes by Lloyd-style 2-means clustering over
//! the children's centroids, accelerated with the triangle-inequality bounds
//! from Elkan (ICML 2003): a per-child overestimate of the distance to its
//! assigned centroid and underestimate of the distance to the other centroid
//! let most reassignment checks skip the exact distance computation.
//!
//! If the clustering degenerates to a single cluster (identical vectors, or
//! centroids that moved under the clustering), the children are dealt out
//! alternately instead so neither replacement is empty.

use std::hint;
use std::mem as StdMem;

use crate::arena::Arena;
use crate::ordering::SLOT_ORD;
use crate::tracing_helpers::{debug_log, warn_log};
use crate::vector::Vector;

use super::Node;

/// Relative tolerance on the assigned-distance sum; the clustering loop
/// stops once an iteration improves the sum by less than this factor.
const CONVERGENCE: f32 = 1e-6;

/// Hard cap on clustering iterations, guaranteeing progress even under
/// float pathologies that defeat the tolerance test.
const MAX_ROUNDS: usize = 64;

impl Node {
    /// Split this full node into two replacements holding disjoint subsets
    /// of its children.
    ///
    /// The caller owns the overflow slot and holds the tree-wide split lock,
    /// so the child set is stable except for peers that have reserved a slot
    /// but not yet published into it; the entry spin waits those out. The
    /// publication window is the handful of instructions between a peer's
    /// `fetch_add` and its pointer store.
    ///
    /// The returned nodes are freshly allocated and unpublished; the caller
    /// recomputes their weighted means and links them into the tree.
    pub(crate) fn split(&self, arena: &Arena) -> (*mut Self, *mut Self) {
        let slots = self.slots();
        for which in 0..self.max_children {
            while slots[which].load(SLOT_ORD).is_null() {
                hint::spin_loop();
            }
        }

        let (left, right, formed_two_clusters) = self.split_clusters(arena, 0);

        if !formed_two_clusters {
            // Everything landed in one cluster: the children may be identical
            // vectors, or the centroids chased each other into a corner.
            // Deal the children out alternately so both replacements are
            // non-empty and the same size.
            debug_log!("degenerate split, dealing children alternately");
            self.deal_children_alternately(left, right);
        }

        (left, right)
    }

    /// 2-means over the full child array, seeded from `initial_member`.
    ///
    /// Returns the two replacement nodes and whether both clusters ended up
    /// non-empty.
    fn split_clusters(
        &self,
        arena: &Arena,
        initial_member: usize,
    ) -> (*mut Self, *mut Self, bool) {
        let slots = self.slots();
        let total = self.max_children + 1;
        let dims = self.centroid.dims();

        // The child set is stable for the duration of the split (see split).
        let children: Vec<*mut Self> = (0..total).map(|which| slots[which].load(SLOT_ORD)).collect();
        // SAFETY: every slot was published (spin-wait plus our own overflow
        // write); the nodes are arena-owned.
        let member = |which: usize| unsafe { &*children[which] };

        let left = Self::new_internal(arena, dims, self.max_children, None);
        let right = Self::new_internal(arena, dims, self.max_children, None);

        // Per-child state: current cluster, an overestimate of the distance
        // to the assigned centroid, an underestimate of the distance to the
        // other centroid. Everybody starts in cluster 0 with useless bounds.
        let mut assignment = vec![0usize; total];
        let mut upper = vec![f32::MAX; total];
        let mut lower = vec![0.0f32; total];

        let centroid = [Vector::new(dims), Vector::new(dims)];
        let new_centroid = [Vector::new(dims), Vector::new(dims)];
        let mut delta = [0.0f32; 2];
        let mut cluster_size = [0usize; 2];

        // Seed cluster 0 from the chosen member and cluster 1 from the
        // member nearest to it.
        centroid[0].assign(member(initial_member).centroid());

        let mut best_choice = usize::MAX;
        let mut smallest_distance = f32::MAX;
        for which in 0..total {
            if which == initial_member {
                continue;
            }

            let distance = centroid[0].distance_squared(member(which).centroid());
            if distance < smallest_distance {
                smallest_distance = distance;
                best_choice = which;
            }
        }
        centroid[1].assign(member(best_choice).centroid());

        // Iterate until the sum of assigned distances stops shrinking. Only
        // children that fail their bounds contribute to the sum; a pass where
        // every bound holds sums to zero and ends the loop.
        let mut old_sum_distance = f32::MAX;
        let mut new_sum_distance = f32::MAX / 2.0;
        let mut rounds = 0;

        while old_sum_distance > (1.0 + CONVERGENCE) * new_sum_distance && rounds < MAX_ROUNDS {
            rounds += 1;

            // Lemma 1 of Elkan: if d(x, c0) is under half the distance
            // between the centroids, c0 must be the closer one.
            let half_distance = {
                let half = centroid[0].distance_squared(&centroid[1]).sqrt() / 2.0;
                half * half
            };

            old_sum_distance = new_sum_distance;
            new_sum_distance = 0.0;
            cluster_size = [0, 0];

            for which in 0..total {
                let other = 1 - assignment[which];

                // Loosen the bounds by how far each centroid moved last round.
                upper[which] += delta[assignment[which]];
                lower[which] -= delta[other];

                if upper[which] < lower[which] || upper[which] < half_distance {
                    // The bounds prove the assigned centroid is still closer.
                    cluster_size[assignment[which]] += 1;
                    continue;
                }

                let point = member(which).centroid();
                upper[which] = centroid[assignment[which]].distance_squared(point);
                if upper[which] >= half_distance || upper[which] >= lower[which] {
                    lower[which] = centroid[other].distance_squared(point);
                }

                if upper[which] > lower[which] {
                    assignment[which] = other;
                    StdMem::swap(&mut upper[which], &mut lower[which]);
                } else if upper[which] == lower[which] {
                    // Exact tie: place in the smaller cluster so neither
                    // starves.
                    let smaller = if cluster_size[0] <= cluster_size[1] { 0 } else { 1 };
                    if assignment[which] != smaller {
                        assignment[which] = other;
                        StdMem::swap(&mut upper[which], &mut lower[which]);
                    }
                }

                cluster_size[assignment[which]] += 1;
                new_sum_distance += upper[which];
            }

            // An empty cluster never reclaims members: its centroid has no
            // mean to move to. The clustering has collapsed, so stop and let
            // the caller deal the children out instead.
            if cluster_size[0] == 0 || cluster_size[1] == 0 {
                break;
            }

            // Recompute each centroid as the plain mean of its members.
            for cluster in 0..2 {
                new_centroid[cluster].zero();
            }
            for which in 0..total {
                new_centroid[assignment[which]].add_in_place(member(which).centroid());
            }
            #[expect(clippy::cast_precision_loss, reason = "cluster sizes are tiny")]
            for cluster in 0..2 {
                new_centroid[cluster].div_in_place(cluster_size[cluster] as f32);
            }

            // Remember the movement for next round's bound updates.
            for cluster in 0..2 {
                delta[cluster] = new_centroid[cluster].distance_squared(&centroid[cluster]);
                centroid[cluster].assign(&new_centroid[cluster]);
            }
        }

        if rounds == MAX_ROUNDS && old_sum_distance > (1.0 + CONVERGENCE) * new_sum_distance {
            warn_log!(rounds, "clustering stopped at the iteration cap before converging");
        }

        // Deal the children out per the final assignment.
        for which in 0..total {
            let target = if assignment[which] == 0 { left } else { right };
            // SAFETY: left/right are unpublished and arena-owned.
            unsafe { &*target }.adopt_child(children[which]);
        }

        (left, right, cluster_size[0] != 0 && cluster_size[1] != 0)
    }

    /// Refill `left` and `right` with this node's children dealt alternately
    /// (even indices left, odd indices right).
    fn deal_children_alternately(&self, left: *mut Self, right: *mut Self) {
        let slots = self.slots();

        // SAFETY: left/right are unpublished, arena-owned replacements.
        let (left, right) = unsafe { (&*left, &*right) };
        left.children.store(0, SLOT_ORD);
        right.children.store(0, SLOT_ORD);

        for which in 0..=self.max_children {
            let child = slots[which].load(SLOT_ORD);
            if which % 2 == 0 {
                left.adopt_child(child);
            } else {
                right.adopt_child(child);
            }
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    /// Build a full node (max_children + 1 children) over the given points.
    fn full_node(arena: &Arena, points: &[&[f32]]) -> *mut Node {
        let max_children = points.len() - 1;
        let node = Node::new_internal(arena, points[0].len(), max_children, None);
        for point in points {
            let leaf = Node::new_leaf(arena, &Vector::from_slice(point), max_children);
            // SAFETY: node is unpublished and arena-owned.
            unsafe { &*node }.adopt_child(leaf);
        }
        node
    }

    /// Which side (0 = left, 1 = right) each original child landed on.
    fn partition_of(node: &Node, left: &Node, right: &Node) -> Vec<usize> {
        let mut sides = Vec::new();

        'child: for which in 0..=node.max_children() {
            let ptr = node.slots()[which].load(SLOT_ORD);
            for side in 0..left.number_of_children() {
                if std::ptr::eq(left.child(side).unwrap(), ptr.cast_const()) {
                    sides.push(0);
                    continue 'child;
                }
            }
            for side in 0..right.number_of_children() {
                if std::ptr::eq(right.child(side).unwrap(), ptr.cast_const()) {
                    sides.push(1);
                    continue 'child;
                }
            }
            panic!("child {which} lost by the split");
        }

        sides
    }

    /// Reference 2-means with the same seeding and tie-break but no pruning.
    fn naive_two_means(points: &[&[f32]]) -> Vec<usize> {
        let total = points.len();
        let dims = points[0].len();

        let dist = |a: &[f32], b: &[f32]| -> f32 {
            let mut sum = 0.0;
            for which in 0..dims {
                let diff = a[which] - b[which];
                sum += diff * diff;
            }
            sum
        };

        let mut centroids = [points[0].to_vec(), {
            let mut best = 1;
            let mut smallest = dist(points[0], points[1]);
            for which in 2..total {
                let d = dist(points[0], points[which]);
                if d < smallest {
                    smallest = d;
                    best = which;
                }
            }
            points[best].to_vec()
        }];

        let mut assignment = vec![0usize; total];
        for _ in 0..MAX_ROUNDS {
            let mut sizes = [0usize; 2];
            let mut changed = false;

            for which in 0..total {
                let d0 = dist(points[which], &centroids[0]);
                let d1 = dist(points[which], &centroids[1]);
                let target = if d0 < d1 {
                    0
                } else if d1 < d0 {
                    1
                } else if sizes[0] <= sizes[1] {
                    0
                } else {
                    1
                };

                if assignment[which] != target {
                    assignment[which] = target;
                    changed = true;
                }
                sizes[target] += 1;
            }

            for cluster in 0..2 {
                if sizes[cluster] == 0 {
                    continue;
                }
                let mut mean = vec![0.0f32; dims];
                for which in 0..total {
                    if assignment[which] == cluster {
                        for lane in 0..dims {
                            mean[lane] += points[which][lane];
                        }
                    }
                }
                for lane in &mut mean {
                    *lane /= sizes[cluster] as f32;
                }
                centroids[cluster] = mean;
            }

            if !changed {
                break;
            }
        }

        assignment
    }

    #[test]
    fn test_split_separates_two_blobs() {
        let arena = Arena::new();
        let points: [&[f32]; 5] = [
            &[0.0, 0.0],
            &[0.0, 1.0],
            &[10.0, 10.0],
            &[1.0, 0.0],
            &[10.0, 11.0],
        ];
        let node = full_node(&arena, &points);

        // SAFETY: arena-owned.
        let node = unsafe { &*node };
        let (left, right) = node.split(&arena);
        // SAFETY: split returns arena-owned nodes.
        let (left, right) = unsafe { (&*left, &*right) };

        let sides = partition_of(node, left, right);
        // The two far points must land together, apart from the three near ones.
        assert_eq!(sides[2], sides[4]);
        assert_eq!(sides[0], sides[1]);
        assert_eq!(sides[0], sides[3]);
        assert_ne!(sides[0], sides[2]);

        assert_eq!(left.number_of_children() + right.number_of_children(), 5);
    }

    #[test]
    fn test_split_preserves_every_child() {
        let arena = Arena::new();
        let points: [&[f32]; 6] = [
            &[3.0, 1.0],
            &[-2.0, 4.0],
            &[0.5, 0.5],
            &[7.0, -3.0],
            &[4.0, 4.0],
            &[-1.0, -1.0],
        ];
        let node = full_node(&arena, &points);

        // SAFETY: arena-owned.
        let node = unsafe { &*node };
        let (left, right) = node.split(&arena);
        // SAFETY: arena-owned.
        let (left, right) = unsafe { (&*left, &*right) };

        // partition_of panics if any child went missing.
        let sides = partition_of(node, left, right);
        assert_eq!(sides.len(), 6);
        assert!(left.number_of_children() >= 1);
        assert!(right.number_of_children() >= 1);
    }

    #[test]
    fn test_identical_children_split_evenly() {
        let arena = Arena::new();
        let points: [&[f32]; 5] = [&[2.0, 2.0]; 5];
        let node = full_node(&arena, &points);

        // SAFETY: arena-owned.
        let node = unsafe { &*node };
        let (left, right) = node.split(&arena);
        // SAFETY: arena-owned.
        let (left, right) = unsafe { (&*left, &*right) };

        let larger = left.number_of_children().max(right.number_of_children());
        let smaller = left.number_of_children().min(right.number_of_children());
        assert_eq!(larger + smaller, 5);
        assert!(larger - smaller <= 1, "identical children must split evenly");
    }

    #[test]
    fn test_dealing_alternately_is_even_and_complete() {
        let arena = Arena::new();
        let points: [&[f32]; 5] = [&[1.0], &[2.0], &[3.0], &[4.0], &[5.0]];
        let node = full_node(&arena, &points);

        // SAFETY: arena-owned.
        let node = unsafe { &*node };
        let left = Node::new_internal(&arena, 1, node.max_children(), None);
        let right = Node::new_internal(&arena, 1, node.max_children(), None);
        node.deal_children_alternately(left, right);

        // SAFETY: arena-owned.
        let (left, right) = unsafe { (&*left, &*right) };
        assert_eq!(left.number_of_children(), 3);
        assert_eq!(right.number_of_children(), 2);
        assert_eq!(left.child(0).unwrap().centroid().get(0), 1.0);
        assert_eq!(left.child(1).unwrap().centroid().get(0), 3.0);
        assert_eq!(right.child(0).unwrap().centroid().get(0), 2.0);
    }

    #[test]
    fn test_pruned_assignment_matches_naive_two_means() {
        let arena = Arena::new();
        let points: [&[f32]; 8] = [
            &[0.3, 0.1],
            &[10.2, 9.8],
            &[0.0, 0.4],
            &[9.9, 10.3],
            &[0.2, 0.2],
            &[10.0, 10.0],
            &[0.1, 0.3],
            &[10.1, 9.9],
        ];
        let node = full_node(&arena, &points);

        // SAFETY: arena-owned.
        let node = unsafe { &*node };
        let (left, right) = node.split(&arena);
        // SAFETY: arena-owned.
        let (left, right) = unsafe { (&*left, &*right) };

        let pruned = partition_of(node, left, right);
        let naive = naive_two_means(&points);

        // Agreement up to a swap of the cluster labels.
        let direct = pruned == naive;
        let swapped = pruned.iter().zip(&naive).all(|(&p, &n)| p == 1 - n);
        assert!(
            direct || swapped,
            "pruned {pruned:?} disagrees with naive {naive:?}"
        );
    }
}
