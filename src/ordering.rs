//! Standard memory orderings for concurrent tree access.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for child-slot reservation (`children.fetch_add`) and for the
/// stores/loads of child pointers themselves.
///
/// Slot counts and slot pointers must be sequentially consistent with
/// respect to one another: a descent that was told a slot exists must never
/// dereference it before the publishing store is visible, and the splitter's
/// spin-wait relies on the same total order.
pub const SLOT_ORD: Ordering = Ordering::SeqCst;

/// Ordering for the tree-wide split counter (load, store, and CAS).
///
/// The `(begin, end)` counter is the total order on splits; every
/// transition must be globally visible in one order.
pub const LOCK_ORD: Ordering = Ordering::SeqCst;

/// Ordering for reading shared fields during descent.
/// Pairs with writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing shared fields.
/// Pairs with reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for CAS success (split latch, counter acquire).
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure.
/// Only need to see the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for values that tolerate drift (leaf counts, centroid lanes).
/// These are repaired by the normalization pass, not by synchronization.
pub const RELAXED: Ordering = Ordering::Relaxed;
