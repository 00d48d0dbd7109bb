//! Fixed-dimension float vectors and their arithmetic.
//!
//! [`Vector`] is the unit of data stored in the tree: a contiguous run of
//! `f32` lanes whose length is fixed per tree. Centroid vectors are updated
//! in place while other threads read them during descent, so every lane is a
//! [`AtomicF32`] accessed with relaxed ordering: racing writers lose updates
//! at lane granularity, and the normalization pass repairs the drift.
//!
//! All kernels are scalar loops with a fixed left-to-right reduction, so
//! identical inputs produce identical outputs within one program run. The
//! split engine's tie-breaking relies on this.

use std::fmt as StdFmt;

use portable_atomic::AtomicF32;

use crate::ordering::RELAXED;

/// A fixed-dimension vector of `f32` lanes.
///
/// # Concurrency
///
/// All operations take `&self`; mutation goes through relaxed atomic lane
/// stores. Two writers racing on the same centroid lose updates at lane
/// granularity rather than invoking undefined behavior. The tree's
/// normalization pass recomputes every centroid after the writers join.
pub struct Vector {
    /// Number of dimensions. Identical for every vector in one tree.
    dims: usize,

    /// The lanes themselves.
    lanes: Box<[AtomicF32]>,
}

impl Vector {
    /// Create a zeroed vector with the given dimensionality.
    #[must_use]
    pub fn new(dims: usize) -> Self {
        let lanes: Vec<AtomicF32> = (0..dims).map(|_| AtomicF32::new(0.0)).collect();

        Self {
            dims,
            lanes: lanes.into_boxed_slice(),
        }
    }

    /// Create a vector from a slice of values.
    #[must_use]
    pub fn from_slice(values: &[f32]) -> Self {
        let lanes: Vec<AtomicF32> = values.iter().map(|&v| AtomicF32::new(v)).collect();

        Self {
            dims: values.len(),
            lanes: lanes.into_boxed_slice(),
        }
    }

    /// The number of dimensions.
    #[inline]
    #[must_use]
    pub const fn dims(&self) -> usize {
        self.dims
    }

    /// Read one lane.
    #[inline]
    #[must_use]
    pub fn get(&self, lane: usize) -> f32 {
        self.lanes[lane].load(RELAXED)
    }

    /// Write one lane.
    #[inline]
    pub fn set(&self, lane: usize, value: f32) {
        self.lanes[lane].store(value, RELAXED);
    }

    /// Copy the lanes out into an owned `Vec`.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        self.lanes.iter().map(|lane| lane.load(RELAXED)).collect()
    }

    /// Set all lanes to zero.
    pub fn zero(&self) {
        for lane in &self.lanes {
            lane.store(0.0, RELAXED);
        }
    }

    /// Copy all lanes from `src`.
    pub fn assign(&self, src: &Self) {
        debug_assert_eq!(self.dims, src.dims, "dimensionality mismatch");

        for which in 0..self.dims {
            self.lanes[which].store(src.lanes[which].load(RELAXED), RELAXED);
        }
    }

    /// `self += other`, lane-wise.
    pub fn add_in_place(&self, other: &Self) {
        debug_assert_eq!(self.dims, other.dims, "dimensionality mismatch");

        for which in 0..self.dims {
            let sum = self.lanes[which].load(RELAXED) + other.lanes[which].load(RELAXED);
            self.lanes[which].store(sum, RELAXED);
        }
    }

    /// `self /= divisor`, lane-wise. `divisor` must be positive.
    pub fn div_in_place(&self, divisor: f32) {
        debug_assert!(divisor > 0.0, "divisor must be positive");

        for lane in &self.lanes {
            lane.store(lane.load(RELAXED) / divisor, RELAXED);
        }
    }

    /// `self += other * factor`, lane-wise.
    pub fn fused_multiply_add(&self, other: &Self, factor: f32) {
        debug_assert_eq!(self.dims, other.dims, "dimensionality mismatch");

        for which in 0..self.dims {
            let updated = other.lanes[which].load(RELAXED).mul_add(factor, self.lanes[which].load(RELAXED));
            self.lanes[which].store(updated, RELAXED);
        }
    }

    /// `self += (other - self) / divisor`, lane-wise.
    ///
    /// This is the incremental-mean update: with `divisor = n + 1`, folding a
    /// new point into a running mean of `n` points without recomputing the
    /// sum. `divisor` must be at least 1.
    pub fn fused_subtract_divide(&self, other: &Self, divisor: f32) {
        debug_assert_eq!(self.dims, other.dims, "dimensionality mismatch");
        debug_assert!(divisor >= 1.0, "divisor must be at least 1");

        for which in 0..self.dims {
            let me = self.lanes[which].load(RELAXED);
            self.lanes[which].store(me + (other.lanes[which].load(RELAXED) - me) / divisor, RELAXED);
        }
    }

    /// The squared Euclidean distance between `self` and `other`.
    ///
    /// Accumulation is strictly left-to-right, so the result is a pure
    /// function of the lane values: callers may compare results for exact
    /// equality to detect ties.
    #[must_use]
    pub fn distance_squared(&self, other: &Self) -> f32 {
        debug_assert_eq!(self.dims, other.dims, "dimensionality mismatch");

        let mut total: f32 = 0.0;
        for which in 0..self.dims {
            let diff = self.lanes[which].load(RELAXED) - other.lanes[which].load(RELAXED);
            total += diff * diff;
        }

        total
    }
}

impl Clone for Vector {
    fn clone(&self) -> Self {
        let copy = Self::new(self.dims);
        copy.assign(self);
        copy
    }
}

impl StdFmt::Debug for Vector {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Vector")
            .field("dims", &self.dims)
            .field("lanes", &self.to_vec())
            .finish()
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_on_creation() {
        let v = Vector::new(8);

        assert_eq!(v.dims(), 8);
        assert_eq!(v.to_vec(), vec![0.0; 8]);
    }

    #[test]
    fn test_distance_squared_matches_scalar_formula() {
        let a = Vector::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let b = Vector::from_slice(&[9.0, 8.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.0]);

        let mut expected: f32 = 0.0;
        for which in 0..8 {
            let diff = a.get(which) - b.get(which);
            expected += diff * diff;
        }

        assert_eq!(a.distance_squared(&b), expected);
        assert_eq!(b.distance_squared(&a), expected);
        assert_eq!(a.distance_squared(&a), 0.0);
    }

    #[test]
    fn test_add_and_divide() {
        let a = Vector::from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let b = Vector::from_slice(&[9.0, 8.0, 7.0, 6.0]);

        a.add_in_place(&b);
        assert_eq!(a.to_vec(), vec![10.0, 10.0, 10.0, 10.0]);

        a.div_in_place(5.0);
        assert_eq!(a.to_vec(), vec![2.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_fused_multiply_add() {
        let a = Vector::from_slice(&[2.0, 2.0]);

        let b = a.clone();
        a.fused_multiply_add(&b, 5.0);

        assert_eq!(a.to_vec(), vec![12.0, 12.0]);
    }

    #[test]
    fn test_fused_subtract_divide_is_incremental_mean() {
        // Mean of {1, 2, 3} built incrementally: start at 1, fold in 2 with
        // divisor 2, fold in 3 with divisor 3.
        let mean = Vector::from_slice(&[1.0]);

        mean.fused_subtract_divide(&Vector::from_slice(&[2.0]), 2.0);
        assert_eq!(mean.get(0), 1.5);

        mean.fused_subtract_divide(&Vector::from_slice(&[3.0]), 3.0);
        assert_eq!(mean.get(0), 2.0);
    }

    #[test]
    fn test_assign_and_zero() {
        let a = Vector::from_slice(&[3.5, -1.25, 0.0]);
        let b = Vector::new(3);

        b.assign(&a);
        assert_eq!(b.to_vec(), a.to_vec());

        b.zero();
        assert_eq!(b.to_vec(), vec![0.0; 3]);
    }

    #[test]
    fn test_clone_is_deep() {
        let a = Vector::from_slice(&[1.0, 2.0]);
        let b = a.clone();

        a.set(0, 99.0);

        assert_eq!(b.get(0), 1.0);
    }
}
