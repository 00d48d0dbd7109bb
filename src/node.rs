//! Tree nodes: leaves and internal routing nodes.
//!
//! A [`Node`] is either a leaf (the inserted vector itself, no child array)
//! or an internal node (a fixed-capacity array of `max_children + 1` child
//! slots, the extra slot reserved for the overflow that triggers a split).
//! An internal node's centroid is the leaf-count-weighted mean of the leaves
//! beneath it.
//!
//! # Concurrency Model
//!
//! - Writers reserve a child slot with `children.fetch_add(1)` and publish
//!   the child pointer afterwards; readers clamp the count to `max_children`
//!   and treat a still-null slot as absent.
//! - The thread whose reservation lands exactly on `max_children` owns the
//!   overflow slot and must split. It first wins the per-node one-shot
//!   split latch, then the tree-wide split lock; losing either turns the
//!   insert into a retry.
//! - `leaves_below` and the centroid are updated without synchronization on
//!   the unwind path of a successful insert. The drift this accumulates is
//!   repaired by [`Node::normalize_counts`] once the writers have joined.
//!
//! Nodes are arena-allocated and never freed or reused while the tree is
//! live: a node replaced by a split stays readable by straggling descents.

use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering, fence};

use crate::arena::Arena;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, RELAXED, SLOT_ORD, WRITE_ORD};
use crate::tracing_helpers::{debug_log, trace_log};
use crate::tree::{DescentContext, KTree};
use crate::vector::Vector;

mod split;

// ============================================================================
//  Split latch
// ============================================================================

/// Split latch: nobody has claimed this node for splitting.
const STATE_UNSPLIT: u8 = 0;

/// Split latch: one thread owns the right to split this node.
const STATE_SPLITTING: u8 = 1;

// ============================================================================
//  InsertResult
// ============================================================================

/// Outcome of an insert attempt at or below a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertResult {
    /// The data was added at or below this node.
    Success,

    /// The insert lost a race (full node, lost latch, stale split counter);
    /// the whole descent must restart.
    Retry,

    /// This node split; the caller must replace it with `left` and adopt
    /// `right`. The tree-wide split lock is still held.
    Split {
        left: *mut Node,
        right: *mut Node,
    },
}

// ============================================================================
//  Node
// ============================================================================

/// A node (or leaf) in the tree.
pub struct Node {
    /// Branching factor of the tree, stamped at creation and immutable.
    max_children: usize,

    /// Number of reserved child slots. Transiently exceeds `max_children`
    /// while an overflow is pending; readers must clamp.
    children: AtomicUsize,

    /// Child slots, length `max_children + 1`. `None` for a leaf.
    /// Slots start null and are published with an atomic store.
    child: Option<Box<[AtomicPtr<Node>]>>,

    /// For a leaf, the inserted vector. For an internal node, the
    /// leaf-count-weighted mean of the leaves below.
    centroid: Vector,

    /// Leaves at or below this node; 1 for a leaf. Drifts under concurrent
    /// insertion and is rebuilt by `normalize_counts`.
    leaves_below: AtomicUsize,

    /// One-shot split latch.
    state: AtomicU8,
}

impl Node {
    // ========================================================================
    //  Construction
    // ========================================================================

    /// Allocate a leaf wrapping a copy of `data`.
    pub(crate) fn new_leaf(arena: &Arena, data: &Vector, max_children: usize) -> *mut Self {
        let ptr = arena.alloc(Box::new(Self {
            max_children,
            children: AtomicUsize::new(0),
            child: None,
            centroid: data.clone(),
            leaves_below: AtomicUsize::new(1),
            state: AtomicU8::new(STATE_UNSPLIT),
        }));

        // Construction must be fully visible before the pointer is published.
        fence(Ordering::SeqCst);
        ptr
    }

    /// Allocate an internal node with a zeroed centroid of `dims` lanes and
    /// an optional first child.
    pub(crate) fn new_internal(
        arena: &Arena,
        dims: usize,
        max_children: usize,
        first_child: Option<*mut Self>,
    ) -> *mut Self {
        let slots: Vec<AtomicPtr<Self>> = (0..=max_children)
            .map(|_| AtomicPtr::new(StdPtr::null_mut()))
            .collect();

        let (children, leaves) = if first_child.is_some() { (1, 1) } else { (0, 0) };
        if let Some(first) = first_child {
            slots[0].store(first, SLOT_ORD);
        }

        let ptr = arena.alloc(Box::new(Self {
            max_children,
            children: AtomicUsize::new(children),
            child: Some(slots.into_boxed_slice()),
            centroid: Vector::new(dims),
            leaves_below: AtomicUsize::new(leaves),
            state: AtomicU8::new(STATE_UNSPLIT),
        }));

        fence(Ordering::SeqCst);
        ptr
    }

    /// Allocate the parameters prototype: a childless node whose only job is
    /// to carry the branching factor and the dimensionality stamp. Its
    /// centroid lanes are never meaningful data.
    pub(crate) fn new_prototype(arena: &Arena, max_children: usize, dims: usize) -> *mut Self {
        arena.alloc(Box::new(Self {
            max_children,
            children: AtomicUsize::new(0),
            child: None,
            centroid: Vector::new(dims),
            leaves_below: AtomicUsize::new(0),
            state: AtomicU8::new(STATE_UNSPLIT),
        }))
    }

    // ========================================================================
    //  Accessors
    // ========================================================================

    /// Whether this node is a leaf (it has no child array).
    #[inline]
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        self.child.is_none()
    }

    /// The branching factor stamped on this node.
    #[inline]
    #[must_use]
    pub const fn max_children(&self) -> usize {
        self.max_children
    }

    /// The number of valid children, clamped to `max_children`.
    ///
    /// The raw counter can transiently exceed the capacity while a split is
    /// pending; every reader goes through this clamp.
    #[inline]
    #[must_use]
    pub fn number_of_children(&self) -> usize {
        self.children.load(SLOT_ORD).min(self.max_children)
    }

    /// The (possibly drifted) count of leaves at or below this node.
    #[inline]
    #[must_use]
    pub fn leaves_below(&self) -> usize {
        self.leaves_below.load(RELAXED)
    }

    pub(crate) fn set_leaves_below(&self, leaves: usize) {
        self.leaves_below.store(leaves, RELAXED);
    }

    /// This node's centroid.
    #[inline]
    #[must_use]
    pub const fn centroid(&self) -> &Vector {
        &self.centroid
    }

    /// The `i`-th child, or `None` for an unpublished slot.
    ///
    /// Quiescent-tree traversal API: indices past `number_of_children()`
    /// return `None`.
    #[must_use]
    pub fn child(&self, i: usize) -> Option<&Self> {
        if i >= self.number_of_children() {
            return None;
        }

        let ptr = self.slots()[i].load(SLOT_ORD);
        if ptr.is_null() {
            return None;
        }

        // SAFETY: published child pointers reference arena-owned nodes that
        // outlive every borrow of the tree.
        Some(unsafe { &*ptr })
    }

    /// The child slot array.
    ///
    /// # Panics
    ///
    /// Panics if called on a leaf. Callers branch on `is_leaf` first; a leaf
    /// reaching here is a structural bug, so fail loudly.
    fn slots(&self) -> &[AtomicPtr<Self>] {
        match &self.child {
            Some(slots) => slots,
            None => panic!("leaf nodes have no child array"),
        }
    }

    /// Append a child to a node no other thread can reach yet (split
    /// construction, root construction, deserialization).
    pub(crate) fn adopt_child(&self, child: *mut Self) {
        let slot = self.children.load(RELAXED);
        self.slots()[slot].store(child, SLOT_ORD);
        self.children.store(slot + 1, SLOT_ORD);
    }

    // ========================================================================
    //  Descent
    // ========================================================================

    /// The index of the child whose centroid is closest to `query` by
    /// squared Euclidean distance. Ties break to the lowest index.
    ///
    /// Robust to concurrent appends: the count is clamped and a reserved but
    /// not-yet-published (null) slot is treated as absent.
    #[must_use]
    pub fn closest_child(&self, query: &Vector) -> usize {
        let count = self.number_of_children();
        let slots = self.slots();

        let mut closest = 0;
        let mut min_distance = f32::MAX;

        for which in 0..count {
            let ptr = slots[which].load(SLOT_ORD);
            if ptr.is_null() {
                continue;
            }

            // SAFETY: non-null slots hold published, arena-owned nodes.
            let distance = query.distance_squared(unsafe { &*ptr }.centroid());
            if distance < min_distance {
                min_distance = distance;
                closest = which;
            }
        }

        closest
    }

    // ========================================================================
    //  Mean maintenance
    // ========================================================================

    /// Recompute this node's centroid as the leaf-count-weighted mean of its
    /// children, and its leaf count as their sum.
    ///
    /// The weighting matters: branches hold different numbers of leaves, and
    /// the centroid must be the middle of the leaves, not of the children.
    pub(crate) fn compute_mean(&self) {
        let count = self.number_of_children();
        let mut leaves = 0usize;

        self.centroid.zero();
        for which in 0..count {
            let ptr = self.slots()[which].load(SLOT_ORD);
            if ptr.is_null() {
                continue;
            }

            // SAFETY: as above; the slot is published.
            let child = unsafe { &*ptr };
            leaves += child.leaves_below();
            #[expect(clippy::cast_precision_loss, reason = "leaf counts stay far below 2^24")]
            self.centroid.fused_multiply_add(child.centroid(), child.leaves_below() as f32);
        }

        self.leaves_below.store(leaves, RELAXED);

        debug_assert!(leaves > 0, "compute_mean on an empty node");
        #[expect(clippy::cast_precision_loss, reason = "leaf counts stay far below 2^24")]
        self.centroid.div_in_place(leaves as f32);
    }

    /// Rebuild `leaves_below` and every internal centroid bottom-up.
    ///
    /// Single-threaded repair pass: concurrent insertion leaves both the
    /// counts and the incrementally-updated means slightly off. Must not run
    /// while writers are active.
    pub(crate) fn normalize_counts(&self) {
        if self.is_leaf() {
            self.leaves_below.store(1, RELAXED);
            return;
        }

        let count = self.number_of_children();
        for which in 0..count {
            let ptr = self.slots()[which].load(SLOT_ORD);
            if ptr.is_null() {
                continue;
            }

            // SAFETY: as above; the slot is published.
            unsafe { &*ptr }.normalize_counts();
        }

        self.compute_mean();
    }

    // ========================================================================
    //  Insertion
    // ========================================================================

    /// Add `data` as a new leaf under this node (whose children are leaves).
    ///
    /// The `fetch_add` hands every caller a distinct slot, which decides the
    /// outcome:
    ///
    /// 1. `slot < max_children`: the slot is ours, publish a new leaf there.
    /// 2. `slot > max_children`: another thread already owns the overflow
    ///    and will split; retry from the top.
    /// 3. `slot == max_children`: the overflow slot is ours. Win the
    ///    per-node latch, then the tree-wide split lock (in that order; the
    ///    latch is cheap and filters most contenders away from the 128-bit
    ///    CAS). Then fill the overflow slot and split.
    ///
    /// The node is never un-filled: once full, every later attempt lands in
    /// case 2 until the tree is restructured around it.
    pub(crate) fn add_to_leaf(
        &self,
        tree: &KTree<'_>,
        context: &mut DescentContext,
        arena: &Arena,
        data: &Vector,
    ) -> InsertResult {
        let slot = self.children.fetch_add(1, SLOT_ORD);

        if slot < self.max_children {
            let leaf = Self::new_leaf(arena, data, self.max_children);
            self.slots()[slot].store(leaf, SLOT_ORD);
            return InsertResult::Success;
        }

        if slot > self.max_children {
            trace_log!(slot, "leaf append lost to a pending split, retrying");
            return InsertResult::Retry;
        }

        // The overflow slot is ours; state an intention to split this node.
        if self
            .state
            .compare_exchange(STATE_UNSPLIT, STATE_SPLITTING, CAS_SUCCESS, CAS_FAILURE)
            .is_err()
        {
            return InsertResult::Retry;
        }

        if !tree.take_split_lock(context) {
            // Lost the tree-wide lock; hand the latch back and retry.
            self.state.store(STATE_UNSPLIT, WRITE_ORD);
            return InsertResult::Retry;
        }

        // The node has never split and we hold both locks; the overflow slot
        // has never been written, so it is ours.
        let leaf = Self::new_leaf(arena, data, self.max_children);
        self.slots()[self.max_children].store(leaf, SLOT_ORD);

        let (left, right) = self.split(arena);
        // SAFETY: split returns freshly allocated, unpublished nodes.
        unsafe {
            (*left).compute_mean();
            (*right).compute_mean();
        }

        debug_log!("leaf-parent node split");
        InsertResult::Split { left, right }
    }

    /// Add `data` to the tree at or below this node.
    ///
    /// If a recursive insert splits a child, this node replaces the split
    /// child with `left`, adopts `right` into a fresh slot, and either
    /// absorbs the growth (releasing the split lock) or overflows and splits
    /// itself in turn, keeping the lock for its own caller.
    ///
    /// On every non-retry outcome the centroid is nudged by the
    /// incremental-mean update `centroid += (data - centroid) / (n + 1)`
    /// instead of being recomputed; the accumulated rounding is repaired by
    /// the normalization pass.
    pub(crate) fn add_to_node(
        &self,
        tree: &KTree<'_>,
        context: &mut DescentContext,
        arena: &Arena,
        data: &Vector,
    ) -> InsertResult {
        let slots = self.slots();
        let first = slots[0].load(SLOT_ORD);
        debug_assert!(!first.is_null(), "published internal node with no first child");

        // SAFETY: child pointers are arena-owned and published.
        let children_are_leaves = unsafe { &*first }.is_leaf();

        let result = if children_are_leaves {
            self.add_to_leaf(tree, context, arena, data)
        } else {
            let best = self.closest_child(data);
            // SAFETY: closest_child only returns published slots.
            let outcome =
                unsafe { &*slots[best].load(SLOT_ORD) }.add_to_node(tree, context, arena, data);

            match outcome {
                InsertResult::Split { left, right } => {
                    // A split happened below and we hold the tree-wide lock:
                    // nobody else appends to an internal-parent node, so the
                    // replace-and-adopt below is exclusive.
                    slots[best].store(left, SLOT_ORD);

                    let end = self.children.load(SLOT_ORD);
                    slots[end].store(right, SLOT_ORD);
                    self.children.store(end + 1, SLOT_ORD);

                    if end + 1 > self.max_children {
                        // This node overflowed in turn; split it and pass the
                        // lock up the call stack.
                        let (left, right) = self.split(arena);
                        // SAFETY: freshly allocated, unpublished nodes.
                        unsafe {
                            (*left).compute_mean();
                            (*right).compute_mean();
                        }

                        debug_log!("split propagated upward");
                        InsertResult::Split { left, right }
                    } else {
                        tree.release_split_lock(context);
                        InsertResult::Success
                    }
                }

                other => other,
            }
        };

        if result != InsertResult::Retry {
            // Data landed somewhere below; fold it into the running mean.
            let leaves = self.leaves_below.load(RELAXED);
            #[expect(clippy::cast_precision_loss, reason = "leaf counts stay far below 2^24")]
            self.centroid.fused_subtract_divide(data, (leaves + 1) as f32);
            self.leaves_below.store(leaves + 1, RELAXED);
        }

        result
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("is_leaf", &self.is_leaf())
            .field("children", &self.number_of_children())
            .field("leaves_below", &self.leaves_below())
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  Tests
// ============================================================================
