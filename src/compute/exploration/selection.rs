//! Density-weighted parent selection.
//!
//! Every non-empty bin gets weight `total / count`, so rarely visited bins
//! are preferred while every populated bin keeps a non-zero chance. A bin
//! is drawn from the normalized weights, then a member of that bin is drawn
//! uniformly.
//!
//! When an eligibility filter is given (e.g. skip candidates that failed a
//! re-test), counts and weights are recomputed over the eligible members
//! only.

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;

use super::binning::{BinHistogram, BinMembership};

/// Selection failures. Both are precondition violations.
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("No eligible candidates to select a parent from")]
    NoEligibleCandidates,
    #[error("Histogram has {histogram} bins but membership has {membership}")]
    ShapeMismatch { histogram: usize, membership: usize },
}

/// Eligible members and their selection weight for one bin.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedBin {
    pub flat: usize,
    pub members: Vec<usize>,
    pub weight: f64,
}

/// Per-bin weights over the (optionally filtered) population. Empty bins
/// are left out.
pub fn weighted_bins(
    histogram: &BinHistogram,
    membership: &BinMembership,
    eligible: Option<&dyn Fn(usize) -> bool>,
) -> Result<Vec<WeightedBin>, SelectionError> {
    if histogram.len() != membership.len() {
        return Err(SelectionError::ShapeMismatch {
            histogram: histogram.len(),
            membership: membership.len(),
        });
    }

    let mut bins: Vec<WeightedBin> = membership
        .iter()
        .filter_map(|(flat, members)| {
            let members: Vec<usize> = match eligible {
                Some(keep) => members.iter().copied().filter(|&i| keep(i)).collect(),
                None => {
                    debug_assert_eq!(histogram.count(flat), members.len() as u64);
                    members.to_vec()
                }
            };
            (!members.is_empty()).then_some(WeightedBin {
                flat,
                members,
                weight: 0.0,
            })
        })
        .collect();

    let total: usize = bins.iter().map(|b| b.members.len()).sum();
    if total == 0 {
        return Err(SelectionError::NoEligibleCandidates);
    }

    let norm: f64 = bins
        .iter()
        .map(|b| total as f64 / b.members.len() as f64)
        .sum();
    for bin in &mut bins {
        bin.weight = total as f64 / bin.members.len() as f64 / norm;
    }
    Ok(bins)
}

/// Select one candidate index, biased toward rare bins.
pub fn select_parent<R: Rng + ?Sized>(
    histogram: &BinHistogram,
    membership: &BinMembership,
    eligible: Option<&dyn Fn(usize) -> bool>,
    rng: &mut R,
) -> Result<usize, SelectionError> {
    let bins = weighted_bins(histogram, membership, eligible)?;
    let dist = WeightedIndex::new(bins.iter().map(|b| b.weight))
        .map_err(|_| SelectionError::NoEligibleCandidates)?;
    let bin = &bins[dist.sample(rng)];
    bin.members
        .choose(rng)
        .copied()
        .ok_or(SelectionError::NoEligibleCandidates)
}
