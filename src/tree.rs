//! The K-tree: a height-balanced tree of vectors where every internal node
//! carries the centroid of the leaves beneath it.
//!
//! This module provides the main [`KTree`] type: root management, the
//! insert retry loop, and the tree-wide split lock.
//!
//! # Concurrency Model
//!
//! Any number of threads may insert concurrently. A descent snapshots the
//! two-phase split counter on entry; the snapshot is both the optimistic
//! "my return path is still valid" witness and the expected value of the
//! 128-bit compare-exchange that acquires the split lock. At most one split
//! is in flight at a time; everything else proceeds lock-free through slot
//! reservation on the nodes themselves.
//!
//! Read-only traversal (serialization, statistics) is only valid on a
//! quiescent tree: before the first insert or after the last insert returns.

use std::marker::PhantomData;
use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, Ordering, fence};

use crate::arena::Arena;
use crate::node::{InsertResult, Node};
use crate::ordering::{CAS_FAILURE, LOCK_ORD, READ_ORD, WRITE_ORD};
use crate::split_count::{AtomicSplitCount, SplitCount};
use crate::tracing_helpers::{debug_log, trace_log};
use crate::vector::Vector;

mod serial;

pub use serial::ParseError;

// ============================================================================
//  DescentContext
// ============================================================================

/// Thread-local state for one insert attempt.
pub(crate) struct DescentContext {
    /// The split counter as observed when the descent entered the tree.
    /// Advanced in lock-step with the tree's counter while this thread holds
    /// the split lock, so the release store publishes a matched pair.
    pub(crate) snapshot: SplitCount,
}

// ============================================================================
//  KTree
// ============================================================================

/// A height-balanced tree-structured vector quantizer.
///
/// The `'arena` lifetime ties the tree to the [`Arena`]s its nodes live in:
/// every arena passed to [`KTree::insert`] must outlive the tree, which makes
/// the raw node pointers inside safe to follow for as long as the tree can
/// be reached.
///
/// # Example
///
/// ```
/// use ktree::{Arena, KTree, Vector};
///
/// let arena = Arena::new();
/// let tree = KTree::new(&arena, 4, 2);
///
/// tree.insert(&arena, &Vector::from_slice(&[0.0, 1.0]));
/// tree.insert(&arena, &Vector::from_slice(&[9.0, 9.0]));
/// tree.normalize_counts();
///
/// assert_eq!(tree.leaf_count(), 2);
/// ```
pub struct KTree<'arena> {
    /// The root node; null until the first insert.
    root: AtomicPtr<Node>,

    /// The two-phase `(begin, end)` split counter.
    split_count: AtomicSplitCount,

    /// Prototype node carrying the branching factor and the dimensionality
    /// stamp. Its centroid lanes are never meaningful data.
    parameters: *mut Node,

    _arena: PhantomData<&'arena Arena>,
}

// SAFETY: the only non-atomic field is the prototype pointer, which is
// written once at construction and read-only afterwards; everything it
// points at is arena-owned for at least 'arena.
unsafe impl Send for KTree<'_> {}
unsafe impl Sync for KTree<'_> {}

impl<'arena> KTree<'arena> {
    /// Create an empty tree.
    ///
    /// `branching_factor` is the maximum number of children an internal node
    /// holds before it must split; `dims` is the dimensionality of every
    /// vector this tree will hold.
    ///
    /// # Panics
    ///
    /// Panics if `branching_factor < 2` or `dims == 0`.
    #[must_use]
    pub fn new(arena: &'arena Arena, branching_factor: usize, dims: usize) -> Self {
        assert!(branching_factor >= 2, "branching factor must be at least 2");
        assert!(dims >= 1, "vectors must have at least one dimension");

        Self {
            root: AtomicPtr::new(StdPtr::null_mut()),
            split_count: AtomicSplitCount::new(),
            parameters: Node::new_prototype(arena, branching_factor, dims),
            _arena: PhantomData,
        }
    }

    fn prototype(&self) -> &Node {
        // SAFETY: parameters is set once at construction from a live arena.
        unsafe { &*self.parameters }
    }

    /// The tree's branching factor.
    #[inline]
    #[must_use]
    pub fn branching_factor(&self) -> usize {
        self.prototype().max_children()
    }

    /// The dimensionality of the vectors in this tree.
    #[inline]
    #[must_use]
    pub fn dims(&self) -> usize {
        self.prototype().centroid().dims()
    }

    /// A vector of the right dimensionality for this tree. Its lane values
    /// carry no meaning; it exists so collaborators can stamp new vectors.
    #[inline]
    #[must_use]
    pub fn example_vector(&self) -> &Vector {
        self.prototype().centroid()
    }

    /// Whether the tree has had no inserts.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.load(READ_ORD).is_null()
    }

    /// The root node, if any. Quiescent-tree traversal API.
    #[must_use]
    pub fn root(&self) -> Option<&Node> {
        let ptr = self.root.load(READ_ORD);
        if ptr.is_null() {
            return None;
        }

        // SAFETY: a published root is arena-owned and never freed while the
        // tree is reachable.
        Some(unsafe { &*ptr })
    }

    /// The number of leaves in the tree.
    ///
    /// Exact after [`KTree::normalize_counts`]; may drift while concurrent
    /// inserts are running.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.root().map_or(0, Node::leaves_below)
    }

    // ========================================================================
    //  Split lock
    // ========================================================================

    /// Try to take the tree-wide split lock.
    ///
    /// Fails if any split was in flight when this descent entered the tree
    /// (`begin != end` in the snapshot), or if any split has started since
    /// (the counter no longer matches the snapshot). Either way the caller's
    /// return path may already be invalid and the insert must retry.
    pub(crate) fn take_split_lock(&self, context: &mut DescentContext) -> bool {
        if !context.snapshot.is_quiescent() {
            // A split was running when we entered; our return path may be
            // restructured under us before we unwind.
            return false;
        }

        let mut claimed = context.snapshot;
        claimed.begin += 1;

        if self
            .split_count
            .compare_exchange(context.snapshot, claimed, LOCK_ORD, CAS_FAILURE)
            .is_err()
        {
            trace_log!("lost the split lock race");
            return false;
        }

        // Keep the local copy matched so the release store publishes a
        // consistent pair.
        context.snapshot = claimed;
        debug_log!("split lock acquired");
        true
    }

    /// Release the tree-wide split lock by bumping the `end` counter.
    ///
    /// A plain store is sufficient: only the holder ever moves `end` past
    /// its matched `begin`.
    pub(crate) fn release_split_lock(&self, context: &mut DescentContext) {
        context.snapshot.end += 1;
        self.split_count.store(context.snapshot, LOCK_ORD);
        debug_log!("split lock released");
    }

    // ========================================================================
    //  Insertion
    // ========================================================================

    /// Insert a copy of `data` into the tree, retrying internally until it
    /// lands.
    ///
    /// `arena` provides storage for any nodes this insert creates; it may be
    /// a different arena per calling thread, as long as each one outlives
    /// the tree.
    ///
    /// # Panics
    ///
    /// Panics if `data`'s dimensionality differs from the tree's.
    pub fn insert(&self, arena: &'arena Arena, data: &Vector) {
        assert_eq!(
            data.dims(),
            self.dims(),
            "vector dimensionality must match the tree"
        );

        loop {
            match self.attempt_insert(arena, data) {
                InsertResult::Success => return,

                InsertResult::Retry => {
                    trace_log!("insert retrying");
                }

                InsertResult::Split { .. } => {
                    unreachable!("root splits are absorbed inside attempt_insert")
                }
            }
        }
    }

    /// One pass of the insert protocol: snapshot the split counter, descend,
    /// and absorb a root split if one propagates all the way up.
    fn attempt_insert(&self, arena: &Arena, data: &Vector) -> InsertResult {
        let mut context = DescentContext {
            snapshot: self.split_count.load(LOCK_ORD),
        };

        let root = self.root.load(READ_ORD);
        if root.is_null() {
            // The very first insert: build a leaf and a one-child internal
            // root over it, under the split lock.
            if !self.take_split_lock(&mut context) {
                return InsertResult::Retry;
            }

            // Winning the lock against a quiescent snapshot means no split
            // (root creation included) completed since we looked, so the
            // root is still absent.
            let leaf = Node::new_leaf(arena, data, self.branching_factor());
            let new_root =
                Node::new_internal(arena, self.dims(), self.branching_factor(), Some(leaf));
            // SAFETY: new_root is ours alone until the store below.
            unsafe { &*new_root }.compute_mean();

            fence(Ordering::SeqCst);
            self.root.store(new_root, WRITE_ORD);
            self.release_split_lock(&mut context);

            debug_log!("created root");
            return InsertResult::Success;
        }

        // SAFETY: a published root is arena-owned and never freed.
        match unsafe { &*root }.add_to_node(self, &mut context, arena, data) {
            InsertResult::Split { left, right } => {
                // The root itself split: grow the tree one level. We still
                // hold the split lock, which serializes the root store.
                // SAFETY: split results are arena-owned; left/right are not
                // yet reachable by other threads.
                unsafe {
                    (*left).compute_mean();
                    (*right).compute_mean();
                }

                let new_root =
                    Node::new_internal(arena, self.dims(), self.branching_factor(), Some(left));
                // SAFETY: new_root is ours alone until the store below.
                let new_root_ref = unsafe { &*new_root };
                new_root_ref.adopt_child(right);
                new_root_ref.compute_mean();

                fence(Ordering::SeqCst);
                self.root.store(new_root, WRITE_ORD);
                self.release_split_lock(&mut context);

                debug_log!("root split, tree grew a level");
                InsertResult::Success
            }

            other => other,
        }
    }

    // ========================================================================
    //  Normalization
    // ========================================================================

    /// Rebuild every `leaves_below` count and every internal centroid.
    ///
    /// Concurrent insertion maintains both incrementally and without
    /// synchronization, which drifts; this single-threaded pass restores
    /// them exactly. Call it after the writers have joined and before
    /// serialization or evaluation.
    pub fn normalize_counts(&self) {
        if let Some(root) = self.root() {
            root.normalize_counts();
        }
    }

    // ========================================================================
    //  Diagnostics
    // ========================================================================

    /// Gather structural statistics by a full traversal.
    ///
    /// Quiescent trees only.
    #[must_use]
    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats {
            node_count: 0,
            leaf_count: 0,
            min_leaf_depth: usize::MAX,
            max_leaf_depth: 0,
            min_fanout: usize::MAX,
            max_fanout: 0,
            max_leaf_count_drift: 0,
            max_centroid_error: 0.0,
        };

        if let Some(root) = self.root() {
            collect_stats(root, 0, &mut stats);
        }

        if stats.leaf_count == 0 {
            stats.min_leaf_depth = 0;
        }
        if stats.min_fanout == usize::MAX {
            stats.min_fanout = 0;
        }

        stats
    }
}

impl std::fmt::Debug for KTree<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KTree")
            .field("branching_factor", &self.branching_factor())
            .field("dims", &self.dims())
            .field("is_empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  TreeStats
// ============================================================================

/// Structural statistics from a full tree traversal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeStats {
    /// Total nodes, leaves included.
    pub node_count: usize,

    /// Total leaves.
    pub leaf_count: usize,

    /// Shallowest leaf, in edges from the root.
    pub min_leaf_depth: usize,

    /// Deepest leaf, in edges from the root. Equal to `min_leaf_depth` in a
    /// balanced tree.
    pub max_leaf_depth: usize,

    /// Smallest internal-node fanout.
    pub min_fanout: usize,

    /// Largest internal-node fanout.
    pub max_fanout: usize,

    /// Largest difference between a node's stored `leaves_below` and the
    /// actual leaf count of its subtree. Zero after normalization.
    pub max_leaf_count_drift: usize,

    /// Largest distance between a stored internal centroid and the
    /// recomputed leaf-weighted mean of its children. Near zero after
    /// normalization.
    pub max_centroid_error: f32,
}

/// Walk a subtree accumulating statistics; returns the actual leaf count.
fn collect_stats(node: &Node, depth: usize, stats: &mut TreeStats) -> usize {
    stats.node_count += 1;

    if node.is_leaf() {
        stats.leaf_count += 1;
        stats.min_leaf_depth = stats.min_leaf_depth.min(depth);
        stats.max_leaf_depth = stats.max_leaf_depth.max(depth);
        return 1;
    }

    let fanout = node.number_of_children();
    stats.min_fanout = stats.min_fanout.min(fanout);
    stats.max_fanout = stats.max_fanout.max(fanout);

    let mut actual_leaves = 0;
    for which in 0..fanout {
        if let Some(child) = node.child(which) {
            actual_leaves += collect_stats(child, depth + 1, stats);
        }
    }

    stats.max_leaf_count_drift = stats
        .max_leaf_count_drift
        .max(actual_leaves.abs_diff(node.leaves_below()));

    // Compare the stored centroid with a freshly computed weighted mean.
    let mean = Vector::new(node.centroid().dims());
    let mut weight = 0usize;
    for which in 0..fanout {
        if let Some(child) = node.child(which) {
            #[expect(clippy::cast_precision_loss, reason = "leaf counts stay far below 2^24")]
            mean.fused_multiply_add(child.centroid(), child.leaves_below() as f32);
            weight += child.leaves_below();
        }
    }
    if weight > 0 {
        #[expect(clippy::cast_precision_loss, reason = "leaf counts stay far below 2^24")]
        mean.div_in_place(weight as f32);
        let error = mean.distance_squared(node.centroid()).sqrt();
        stats.max_centroid_error = stats.max_centroid_error.max(error);
    }

    actual_leaves
}

// ============================================================================
//  Tests
// ============================================================================
