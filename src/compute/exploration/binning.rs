//! Parameter-space binning and the bin histogram.

use serde::{Deserialize, Serialize};

use crate::schema::{BinCoord, RunConfig};

/// Bin of `value` in `[lower, upper)` split into `n_bins` equal steps.
///
/// Values below `lower` land in bin 0. Values at or above `upper` land in
/// the last bin: the upper bin is open-ended and absorbs overflow. NaN maps
/// to bin 0.
pub fn bin_index(value: f64, lower: f64, upper: f64, n_bins: usize) -> usize {
    debug_assert!(n_bins > 0);
    let last = n_bins.saturating_sub(1);
    if value >= upper {
        return last;
    }
    let step = (upper - lower) / n_bins as f64;
    let index = ((value - lower) / step).floor();
    if index.is_nan() || index < 0.0 {
        0
    } else {
        (index as usize).min(last)
    }
}

/// Binning errors.
#[derive(Debug, thiserror::Error)]
pub enum BinningError {
    #[error("Expected {expected} property values, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("Bin coordinate {0:?} is outside the histogram")]
    OutOfRange(BinCoord),
}

/// Maps property vectors onto bin coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binner {
    ranges: Vec<(f64, f64)>,
    bins_per_dimension: usize,
}

impl Binner {
    pub fn new(ranges: Vec<(f64, f64)>, bins_per_dimension: usize) -> Self {
        Self {
            ranges,
            bins_per_dimension,
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(
            config.properties.iter().map(|p| (p.lower, p.upper)).collect(),
            config.bins_per_dimension,
        )
    }

    pub fn dimensions(&self) -> usize {
        self.ranges.len()
    }

    pub fn bins_per_dimension(&self) -> usize {
        self.bins_per_dimension
    }

    /// Number of histogram cells. Saturates; configurations are capped
    /// well below that by validation.
    pub fn total_bins(&self) -> usize {
        self.bins_per_dimension
            .saturating_pow(u32::try_from(self.ranges.len()).unwrap_or(u32::MAX))
    }

    /// Bin coordinate of a property vector, one index per dimension.
    pub fn classify(&self, values: &[f64]) -> Result<BinCoord, BinningError> {
        if values.len() != self.ranges.len() {
            return Err(BinningError::DimensionMismatch {
                expected: self.ranges.len(),
                got: values.len(),
            });
        }
        Ok(values
            .iter()
            .zip(&self.ranges)
            .map(|(&v, &(lo, hi))| bin_index(v, lo, hi, self.bins_per_dimension))
            .collect())
    }

    /// Row-major flat index of a coordinate.
    pub fn flat_index(&self, coord: &[usize]) -> Result<usize, BinningError> {
        if coord.len() != self.ranges.len() || coord.iter().any(|&c| c >= self.bins_per_dimension)
        {
            return Err(BinningError::OutOfRange(coord.to_vec()));
        }
        Ok(coord
            .iter()
            .fold(0, |acc, &c| acc * self.bins_per_dimension + c))
    }

    /// Inverse of [`Binner::flat_index`].
    pub fn coord(&self, mut flat: usize) -> BinCoord {
        let mut coord = vec![0; self.ranges.len()];
        for slot in coord.iter_mut().rev() {
            *slot = flat % self.bins_per_dimension;
            flat /= self.bins_per_dimension;
        }
        coord
    }
}

/// Dense count of classified candidates per bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinHistogram {
    counts: Vec<u64>,
}

impl BinHistogram {
    pub fn new(total_bins: usize) -> Self {
        Self {
            counts: vec![0; total_bins],
        }
    }

    pub fn add(&mut self, flat: usize) {
        self.counts[flat] += 1;
    }

    pub fn count(&self, flat: usize) -> u64 {
        self.counts.get(flat).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Sum over all cells.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Number of non-empty cells.
    pub fn explored(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }

    /// Fraction of non-empty cells.
    pub fn coverage(&self) -> f64 {
        if self.counts.is_empty() {
            return 0.0;
        }
        self.explored() as f64 / self.counts.len() as f64
    }
}

/// Candidate indices (positions in the run's candidate list) per bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinMembership {
    members: Vec<Vec<usize>>,
}

impl BinMembership {
    pub fn new(total_bins: usize) -> Self {
        Self {
            members: vec![Vec::new(); total_bins],
        }
    }

    pub fn push(&mut self, flat: usize, index: usize) {
        self.members[flat].push(index);
    }

    pub fn members(&self, flat: usize) -> &[usize] {
        self.members.get(flat).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate `(flat bin, members)` over all bins.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[usize])> {
        self.members.iter().enumerate().map(|(i, m)| (i, m.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bin_edges() {
        assert_eq!(bin_index(0.0, 0.0, 1.0, 10), 0);
        assert_eq!(bin_index(0.05, 0.0, 1.0, 10), 0);
        assert_eq!(bin_index(0.15, 0.0, 1.0, 10), 1);
        assert_eq!(bin_index(0.95, 0.0, 1.0, 10), 9);
    }

    #[test]
    fn test_overflow_absorbed_by_last_bin() {
        assert_eq!(bin_index(1.0, 0.0, 1.0, 10), 9);
        assert_eq!(bin_index(42.0, 0.0, 1.0, 10), 9);
        assert_eq!(bin_index(f64::INFINITY, 0.0, 1.0, 10), 9);
    }

    #[test]
    fn test_underflow_lands_in_first_bin() {
        assert_eq!(bin_index(-3.0, 0.0, 1.0, 10), 0);
        assert_eq!(bin_index(f64::NAN, 0.0, 1.0, 10), 0);
    }

    #[test]
    fn test_classify_multi_dimensional() {
        let binner = Binner::new(vec![(0.0, 1.0), (0.0, 350.0)], 4);
        assert_eq!(binner.classify(&[0.3, 200.0]).unwrap(), vec![1, 2]);
        assert!(matches!(
            binner.classify(&[0.3]),
            Err(BinningError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_flat_index_roundtrip() {
        let binner = Binner::new(vec![(0.0, 1.0); 3], 5);
        assert_eq!(binner.total_bins(), 125);
        let flat = binner.flat_index(&[2, 0, 4]).unwrap();
        assert_eq!(flat, 2 * 25 + 4);
        assert_eq!(binner.coord(flat), vec![2, 0, 4]);
        assert!(binner.flat_index(&[5, 0, 0]).is_err());
    }

    #[test]
    fn test_histogram_coverage() {
        let mut hist = BinHistogram::new(16);
        hist.add(3);
        hist.add(3);
        hist.add(7);
        assert_eq!(hist.total(), 3);
        assert_eq!(hist.explored(), 2);
        assert!((hist.coverage() - 2.0 / 16.0).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn prop_bin_in_range(
            value in -1.0e3f64..1.0e3,
            lower in -100.0f64..100.0,
            span in 0.001f64..500.0,
            n in 1usize..64,
        ) {
            let b = bin_index(value, lower, lower + span, n);
            prop_assert!(b < n);
        }

        #[test]
        fn prop_bounds_map_to_end_bins(
            lower in -100.0f64..100.0,
            span in 0.001f64..500.0,
            n in 1usize..64,
        ) {
            prop_assert_eq!(bin_index(lower, lower, lower + span, n), 0);
            prop_assert_eq!(bin_index(lower + span, lower, lower + span, n), n - 1);
        }

        #[test]
        fn prop_bin_is_monotonic(
            a in 0.0f64..1.0,
            b in 0.0f64..1.0,
            n in 1usize..64,
        ) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(bin_index(lo, 0.0, 1.0, n) <= bin_index(hi, 0.0, 1.0, n));
        }
    }
}
