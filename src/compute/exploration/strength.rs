//! Per-bin adaptive mutation strength.
//!
//! Each bin carries a strength that scales how far a child may move away
//! from its parent. After a generation is classified, every bin that
//! supplied parents is re-evaluated from where its children landed:
//!
//! - no child in the parent bin: halve;
//! - parent-bin child count below 1.1x the smallest sibling count: halve;
//! - parent-bin child count at least 3x the largest sibling count: x1.5;
//! - otherwise unchanged.
//!
//! Entries are versioned by generation. A lookup without an entry for the
//! requested generation inherits the closest earlier one, and falls back to
//! the configured initial strength that seeds generation 1.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::schema::BinCoord;

/// Below this share of the smallest sibling, the parent bin is not dominating.
pub const WIDEN_RATIO: f64 = 1.1;
/// At this multiple of the largest sibling, the parent bin dominates.
pub const DOMINANCE_RATIO: f64 = 3.0;
/// Multiplier applied when the parent bin dominates.
pub const GROWTH_FACTOR: f64 = 1.5;
/// Multiplier applied when the parent bin does not hold its children.
pub const SHRINK_FACTOR: f64 = 0.5;

/// What happened to a bin's strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Adjustment {
    /// No child stayed in the parent bin.
    LeftParentBin,
    /// The parent bin did not dominate its siblings.
    NotDominant,
    /// The parent bin dominated every sibling.
    Dominant,
    Unchanged,
}

impl Adjustment {
    pub fn factor(self) -> f64 {
        match self {
            Adjustment::LeftParentBin | Adjustment::NotDominant => SHRINK_FACTOR,
            Adjustment::Dominant => GROWTH_FACTOR,
            Adjustment::Unchanged => 1.0,
        }
    }
}

/// Classify a parent bin from the distinct bins its children landed in,
/// each mapped to its histogram population.
pub fn classify_children(
    parent_bin: &BinCoord,
    child_counts: &BTreeMap<BinCoord, u64>,
) -> Adjustment {
    let Some(&own) = child_counts.get(parent_bin) else {
        return Adjustment::LeftParentBin;
    };
    let siblings = child_counts
        .iter()
        .filter(|(bin, _)| *bin != parent_bin)
        .map(|(_, &count)| count);

    let min_sibling = siblings.clone().min();
    let max_sibling = siblings.max().unwrap_or(0);

    if let Some(min) = min_sibling
        && (own as f64) < WIDEN_RATIO * min as f64
    {
        Adjustment::NotDominant
    } else if own as f64 >= DOMINANCE_RATIO * max_sibling as f64 {
        Adjustment::Dominant
    } else {
        Adjustment::Unchanged
    }
}

/// One parent/child bin pair from a classified generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lineage {
    pub parent_bin: BinCoord,
    pub child_bin: BinCoord,
}

/// Generation-versioned strength per bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrengthTable {
    initial: f64,
    entries: BTreeMap<BinCoord, BTreeMap<u32, f64>>,
}

impl StrengthTable {
    /// Table where every bin starts from `initial` at generation 1.
    pub fn new(initial: f64) -> Self {
        Self {
            initial,
            entries: BTreeMap::new(),
        }
    }

    pub fn initial(&self) -> f64 {
        self.initial
    }

    /// Strength of `bin` at `generation`, inherited from the closest earlier
    /// entry when there is none for `generation` itself.
    pub fn strength(&self, generation: u32, bin: &BinCoord) -> f64 {
        self.entries
            .get(bin)
            .and_then(|history| history.range(..=generation).next_back())
            .map(|(_, &s)| s)
            .unwrap_or(self.initial)
    }

    /// Whether an explicit entry exists.
    pub fn contains(&self, generation: u32, bin: &BinCoord) -> bool {
        self.entries
            .get(bin)
            .is_some_and(|history| history.contains_key(&generation))
    }

    /// Record an entry. An existing entry for the same key wins.
    pub fn insert(&mut self, generation: u32, bin: BinCoord, strength: f64) -> f64 {
        *self
            .entries
            .entry(bin)
            .or_default()
            .entry(generation)
            .or_insert(strength)
    }

    /// All explicit entries as `(generation, bin, strength)`.
    pub fn entries(&self) -> impl Iterator<Item = (u32, &BinCoord, f64)> {
        self.entries
            .iter()
            .flat_map(|(bin, history)| history.iter().map(move |(&g, &s)| (g, bin, s)))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Strengths for `generation`, derived from the previous generation's
    /// lineages and the current bin populations given by `population`.
    /// Pure: the same inputs always give the same values, so concurrent
    /// writers of the same key agree.
    pub fn compute_updates(
        &self,
        generation: u32,
        lineages: &[Lineage],
        population: impl Fn(&BinCoord) -> u64,
    ) -> BTreeMap<BinCoord, (f64, Adjustment)> {
        let mut by_parent: BTreeMap<&BinCoord, BTreeMap<BinCoord, u64>> = BTreeMap::new();
        for l in lineages {
            by_parent
                .entry(&l.parent_bin)
                .or_default()
                .entry(l.child_bin.clone())
                .or_insert_with(|| population(&l.child_bin));
        }

        let prior_generation = generation.saturating_sub(1);
        by_parent
            .into_iter()
            .map(|(parent_bin, child_counts)| {
                let prior = self.strength(prior_generation, parent_bin);
                let adjustment = classify_children(parent_bin, &child_counts);
                (parent_bin.clone(), (prior * adjustment.factor(), adjustment))
            })
            .collect()
    }
}
