//! Mergeable cardinality estimation (HyperLogLog)
//!
//! Backs UNIQUE_X rules. A sketch with precision `p` keeps `2^p` one-byte
//! registers; the standard error is about `1.04 / sqrt(2^p)`, i.e. ~0.8% at
//! the default `p = 14`. Merging two sketches takes the register-wise
//! maximum, which is exactly the sketch of the union of both inputs, so
//! estimates stay within the same bound however buckets are rolled up.
//!
//! The estimate uses Ertl's improved raw estimator, which stays unbiased
//! from a handful of items up to very large cardinalities without
//! empirical bias tables.
//!
//! Items are hashed with BLAKE3 so register contents are stable across
//! processes and can be persisted with finalized buckets.

use serde::{Deserialize, Serialize};

use crate::error::MergeError;

/// Smallest supported precision
pub const MIN_PRECISION: u8 = 4;

/// Largest supported precision
pub const MAX_PRECISION: u8 = 18;

/// Default precision (16 384 registers, 16 KB)
pub const DEFAULT_PRECISION: u8 = 14;

/// HyperLogLog sketch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HyperLogLog {
    precision: u8,
    registers: Vec<u8>,
}

impl HyperLogLog {
    /// Create an empty sketch; precision is clamped to 4..=18
    pub fn new(precision: u8) -> Self {
        let p = precision.clamp(MIN_PRECISION, MAX_PRECISION);
        Self {
            precision: p,
            registers: vec![0u8; 1usize << p],
        }
    }

    /// Precision (log2 of the register count)
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Insert an item
    pub fn insert(&mut self, item: &str) {
        let digest = blake3::hash(item.as_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest.as_bytes()[..8]);
        self.insert_hash(u64::from_le_bytes(word));
    }

    /// Insert a pre-computed 64-bit hash
    pub fn insert_hash(&mut self, hash: u64) {
        let p = self.precision as u32;
        let idx = (hash & ((1u64 << p) - 1)) as usize;
        // The upper 64 - p bits; rank is the position of the first set bit,
        // or 64 - p + 1 when they are all zero.
        let w = hash >> p;
        let rank = (w.leading_zeros() - p + 1) as u8;
        if rank > self.registers[idx] {
            self.registers[idx] = rank;
        }
    }

    /// Fold `other` into this sketch (register-wise maximum)
    pub fn merge(&mut self, other: &HyperLogLog) -> Result<(), MergeError> {
        if self.precision != other.precision {
            return Err(MergeError::PrecisionMismatch {
                left: self.precision,
                right: other.precision,
            });
        }
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
        Ok(())
    }

    /// Whether nothing has been inserted
    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&r| r == 0)
    }

    /// Estimated number of distinct items
    pub fn estimate(&self) -> f64 {
        let m = self.registers.len() as f64;
        let q = 64 - self.precision as usize;

        let mut histogram = vec![0u32; q + 2];
        for &r in &self.registers {
            histogram[(r as usize).min(q + 1)] += 1;
        }
        if histogram[0] as f64 == m {
            return 0.0;
        }

        let mut z = m * tau(1.0 - histogram[q + 1] as f64 / m);
        for k in (1..=q).rev() {
            z = 0.5 * (z + histogram[k] as f64);
        }
        z += m * sigma(histogram[0] as f64 / m);

        let alpha_inf = 1.0 / (2.0 * std::f64::consts::LN_2);
        alpha_inf * m * m / z
    }

    /// Estimated number of distinct items, rounded
    pub fn count(&self) -> u64 {
        self.estimate().round() as u64
    }

    /// Register memory in bytes
    pub fn memory_bytes(&self) -> usize {
        self.registers.len()
    }
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self::new(DEFAULT_PRECISION)
    }
}

fn sigma(mut x: f64) -> f64 {
    if x == 1.0 {
        return f64::INFINITY;
    }
    let mut y = 1.0;
    let mut z = x;
    loop {
        x *= x;
        let previous = z;
        z += x * y;
        y += y;
        if z == previous {
            return z;
        }
    }
}

fn tau(mut x: f64) -> f64 {
    if x == 0.0 || x == 1.0 {
        return 0.0;
    }
    let mut y = 1.0;
    let mut z = 1.0 - x;
    loop {
        x = x.sqrt();
        let previous = z;
        y *= 0.5;
        z -= (1.0 - x).powi(2) * y;
        if z == previous {
            return z / 3.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relative_error(estimate: u64, actual: u64) -> f64 {
        (estimate as f64 - actual as f64).abs() / actual as f64
    }

    #[test]
    fn test_empty_sketch() {
        let hll = HyperLogLog::default();
        assert!(hll.is_empty());
        assert_eq!(hll.count(), 0);
    }

    #[test]
    fn test_small_cardinality_is_near_exact() {
        let mut hll = HyperLogLog::default();
        for i in 0..10 {
            hll.insert(&format!("user_{}", i));
        }
        assert!((9..=11).contains(&hll.count()));
    }

    #[test]
    fn test_duplicates_do_not_count() {
        let mut hll = HyperLogLog::default();
        for _ in 0..3 {
            for i in 0..500 {
                hll.insert(&format!("user_{}", i));
            }
        }
        assert!(relative_error(hll.count(), 500) < 0.02);
    }

    #[test]
    fn test_error_bound_in_thousands() {
        let mut hll = HyperLogLog::default();
        for i in 0..8_000 {
            hll.insert(&format!("value{}", i));
        }
        assert!(relative_error(hll.count(), 8_000) < 0.02);
    }

    #[test]
    fn test_merge_is_union() {
        let mut left = HyperLogLog::default();
        let mut right = HyperLogLog::default();
        for i in 0..3_000 {
            left.insert(&format!("item_{}", i));
        }
        // 1 000 overlapping items
        for i in 2_000..6_000 {
            right.insert(&format!("item_{}", i));
        }

        left.merge(&right).unwrap();
        assert!(relative_error(left.count(), 6_000) < 0.02);
    }

    #[test]
    fn test_merge_with_self_is_idempotent() {
        let mut hll = HyperLogLog::default();
        for i in 0..1_000 {
            hll.insert(&i.to_string());
        }
        let copy = hll.clone();
        hll.merge(&copy).unwrap();
        assert_eq!(hll, copy);
    }

    #[test]
    fn test_merge_rejects_precision_mismatch() {
        let mut a = HyperLogLog::new(10);
        let b = HyperLogLog::new(12);
        assert_eq!(
            a.merge(&b),
            Err(MergeError::PrecisionMismatch { left: 10, right: 12 })
        );
    }

    #[test]
    fn test_precision_is_clamped() {
        assert_eq!(HyperLogLog::new(1).precision(), MIN_PRECISION);
        assert_eq!(HyperLogLog::new(30).precision(), MAX_PRECISION);
        assert_eq!(HyperLogLog::new(10).memory_bytes(), 1024);
    }
}
