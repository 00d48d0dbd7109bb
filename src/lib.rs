//! # K-tree
//!
//! A height-balanced, B-tree-shaped hierarchical vector quantizer with
//! bulk concurrent insertion.
//!
//! Every internal node stores the leaf-count-weighted centroid of the leaves
//! beneath it; every leaf holds a data vector. Point insertion descends the
//! tree choosing the closest child by squared Euclidean distance, appends at
//! a leaf-parent node, and resolves overflow with an in-place 2-means split
//! that propagates up the call stack.
//!
//! ## Design
//!
//! - Child slots are claimed with an atomic `fetch_add`; readers clamp the
//!   count and skip slots that are reserved but not yet published.
//! - A two-phase `(begin, end)` split counter behind a 128-bit CAS acts as
//!   an optimistic tree-wide split lock: at most one split is in flight, and
//!   any descent whose snapshot went stale retries.
//! - A per-node one-shot latch keeps two threads from splitting the same
//!   node without touching the expensive global counter.
//! - The 2-means split is accelerated with Elkan's triangle-inequality
//!   bounds and falls back to alternating assignment when it degenerates.
//! - Nodes live in append-only [`Arena`]s and are never freed or reused
//!   while the tree is live, so straggling readers stay safe.
//!
//! Leaf counts and centroids drift slightly under concurrent insertion;
//! [`KTree::normalize_counts`] repairs both once the writers have joined.
//!
//! ## Example
//!
//! ```
//! use ktree::{Arena, KTree, Vector};
//!
//! let arena = Arena::new();
//! let tree = KTree::new(&arena, 4, 2);
//!
//! for point in [[0.0, 0.0], [0.0, 1.0], [9.0, 9.0], [9.0, 10.0]] {
//!     tree.insert(&arena, &Vector::from_slice(&point));
//! }
//!
//! tree.normalize_counts();
//! assert_eq!(tree.leaf_count(), 4);
//! ```

pub mod arena;
pub mod node;
pub mod ordering;
pub mod reader;
pub mod split_count;
pub mod tree;
pub mod vector;

mod tracing_helpers;

pub use arena::Arena;
pub use tree::{KTree, ParseError, TreeStats};
pub use vector::Vector;
