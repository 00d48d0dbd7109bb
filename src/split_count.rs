//! The two-phase split counter.
//!
//! [`SplitCount`] packs a `(begin, end)` pair of 64-bit counters into a
//! single `u128`. `begin` is bumped when a split starts, `end` when it
//! finishes, so `begin == end` means the tree is quiescent and
//! `begin > end` means a split is in flight.
//!
//! A descent snapshots the counter on entry. The snapshot does double duty:
//!
//! - it is an optimistic witness that no split completed while the thread
//!   was inside the tree (any split moves `begin`, making the snapshot
//!   stale), and
//! - it is the expected value of the 128-bit compare-exchange that acquires
//!   the tree-wide split lock.
//!
//! [`AtomicSplitCount`] wraps `portable-atomic`'s [`AtomicU128`] for
//! cross-platform double-width atomics. On x86-64 with CMPXCHG16B this is a
//! native lock-free operation.

use portable_atomic::AtomicU128;
use std::sync::atomic::Ordering;

// ============================================================================
//  SplitCount
// ============================================================================

/// A `(begin, end)` pair of split counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SplitCount {
    /// Number of splits ever started.
    pub begin: u64,

    /// Number of splits ever finished.
    pub end: u64,
}

impl SplitCount {
    /// The all-zero counter of a fresh tree.
    #[must_use]
    pub const fn new() -> Self {
        Self { begin: 0, end: 0 }
    }

    /// Whether no split is currently in flight.
    #[inline]
    #[must_use]
    pub const fn is_quiescent(&self) -> bool {
        self.begin == self.end
    }

    /// Pack into a `u128` (`begin` in the high 64 bits).
    #[inline]
    #[must_use]
    const fn pack(self) -> u128 {
        ((self.begin as u128) << 64) | (self.end as u128)
    }

    /// Unpack from a `u128`.
    #[inline]
    #[must_use]
    #[expect(clippy::cast_possible_truncation, reason = "intentional low-half extraction")]
    const fn unpack(value: u128) -> Self {
        Self {
            begin: (value >> 64) as u64,
            end: value as u64,
        }
    }
}

// ============================================================================
//  AtomicSplitCount
// ============================================================================

/// Atomic wrapper for [`SplitCount`].
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicSplitCount {
    inner: AtomicU128,
}

impl AtomicSplitCount {
    /// Create with both counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: AtomicU128::new(SplitCount::new().pack()),
        }
    }

    /// Load with ordering.
    #[inline]
    pub fn load(&self, order: Ordering) -> SplitCount {
        SplitCount::unpack(self.inner.load(order))
    }

    /// Store with ordering.
    #[inline]
    pub fn store(&self, value: SplitCount, order: Ordering) {
        self.inner.store(value.pack(), order);
    }

    /// Compare-and-exchange.
    ///
    /// # Errors
    ///
    /// Returns `Err` with the current value if the comparison failed
    /// (i.e., the current value did not match `expected`).
    #[inline]
    pub fn compare_exchange(
        &self,
        expected: SplitCount,
        new: SplitCount,
        success: Ordering,
        failure: Ordering,
    ) -> Result<SplitCount, SplitCount> {
        self.inner
            .compare_exchange(expected.pack(), new.pack(), success, failure)
            .map(SplitCount::unpack)
            .map_err(SplitCount::unpack)
    }
}

impl Default for AtomicSplitCount {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
//  Tests
// ============================================================================
