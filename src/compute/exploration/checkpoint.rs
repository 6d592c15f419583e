//! Checkpoint snapshot and restart files.
//!
//! A [`Snapshot`] holds everything the orchestrator needs to continue a run
//! without replaying the store: the candidate list in insertion order with
//! properties, bins and lineage, the bin histogram and membership lists, the
//! set of explored bins and the next generation to build.
//!
//! The working file `restart.json` is rewritten after every generation. At a
//! benchmark milestone (and at the end of a run) it is copied to
//! `restart_<generation>.json`, which is never overwritten afterwards.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::schema::{BinCoord, Candidate, Milestone, RetestStatus};

use super::binning::{BinHistogram, BinMembership, Binner, BinningError};
use super::strength::Lineage;

/// Name of the working checkpoint file.
pub const CHECKPOINT_FILE: &str = "restart.json";

/// Checkpoint errors.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Checkpoint {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("No restart*.json checkpoint found in {0}")]
    NotFound(PathBuf),
    #[error("Checkpoint is inconsistent: {0}")]
    Inconsistent(String),
    #[error(transparent)]
    Binning(#[from] BinningError),
}

/// Point-in-time state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub run_id: String,
    pub next_generation: u32,
    pub candidate_ids: Vec<u64>,
    pub properties: Vec<Vec<f64>>,
    pub bins: Vec<BinCoord>,
    pub generations: Vec<u32>,
    /// Parent position in the candidate list.
    pub parents: Vec<Option<usize>>,
    #[serde(default)]
    pub retest: Vec<RetestStatus>,
    pub histogram: BinHistogram,
    pub membership: BinMembership,
    pub explored_bins: BTreeSet<BinCoord>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    /// Base seed of the orchestrator's per-generation draws.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Snapshot {
    /// Empty snapshot ahead of the seed generation.
    pub fn new(run_id: impl Into<String>, total_bins: usize) -> Self {
        Self {
            run_id: run_id.into(),
            next_generation: 0,
            candidate_ids: Vec::new(),
            properties: Vec::new(),
            bins: Vec::new(),
            generations: Vec::new(),
            parents: Vec::new(),
            retest: Vec::new(),
            histogram: BinHistogram::new(total_bins),
            membership: BinMembership::new(total_bins),
            explored_bins: BTreeSet::new(),
            milestones: Vec::new(),
            seed: None,
        }
    }

    /// Rebuild from stored candidates (any order). Candidates whose parent
    /// is not among them keep no lineage.
    pub fn from_candidates(
        run_id: impl Into<String>,
        binner: &Binner,
        mut candidates: Vec<Candidate>,
        next_generation: u32,
    ) -> Result<Self, CheckpointError> {
        candidates.sort_by_key(|c| c.id);
        let mut snapshot = Self::new(run_id, binner.total_bins());
        snapshot.next_generation = next_generation;
        for candidate in &candidates {
            let flat = binner.flat_index(&candidate.bin)?;
            let parent = candidate.parent_id.and_then(|id| snapshot.position(id));
            snapshot.record(candidate, flat, parent);
        }
        Ok(snapshot)
    }

    pub fn len(&self) -> usize {
        self.candidate_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidate_ids.is_empty()
    }

    /// Position of a candidate id in the list.
    pub fn position(&self, id: u64) -> Option<usize> {
        self.candidate_ids.binary_search(&id).ok()
    }

    /// Highest recorded id, 0 when empty.
    pub fn last_id(&self) -> u64 {
        self.candidate_ids.last().copied().unwrap_or(0)
    }

    /// Append a classified candidate. Returns true when it opened a new bin.
    pub fn record(&mut self, candidate: &Candidate, flat: usize, parent: Option<usize>) -> bool {
        let index = self.candidate_ids.len();
        self.candidate_ids.push(candidate.id);
        self.properties.push(candidate.properties.clone());
        self.bins.push(candidate.bin.clone());
        self.generations.push(candidate.generation);
        self.parents.push(parent);
        self.retest.push(candidate.retest.status);
        self.histogram.add(flat);
        self.membership.push(flat, index);
        self.explored_bins.insert(candidate.bin.clone())
    }

    /// Parent/child bin pairs of the children born in `generation`.
    pub fn lineages(&self, generation: u32) -> Vec<Lineage> {
        self.generations
            .iter()
            .zip(&self.parents)
            .enumerate()
            .filter(|(_, (g, _))| **g == generation)
            .filter_map(|(i, (_, parent))| {
                parent.map(|p| Lineage {
                    parent_bin: self.bins[p].clone(),
                    child_bin: self.bins[i].clone(),
                })
            })
            .collect()
    }

    /// Rebuild the milestone list by replaying coverage generation by
    /// generation, for snapshots recovered without one.
    pub fn replay_milestones(&mut self, benchmarks: &[f64]) {
        let total = self.histogram.len();
        let mut milestones: Vec<Milestone> = Vec::new();
        let mut occupied = BTreeSet::new();
        let mut i = 0;
        while total > 0 && i < self.len() {
            let generation = self.generations[i];
            while i < self.len() && self.generations[i] == generation {
                occupied.insert(&self.bins[i]);
                i += 1;
            }
            let coverage = occupied.len() as f64 / total as f64;
            for &benchmark in benchmarks {
                if coverage >= benchmark && !milestones.iter().any(|m| m.benchmark == benchmark) {
                    milestones.push(Milestone {
                        benchmark,
                        generation,
                        coverage,
                    });
                }
            }
        }
        self.milestones = milestones;
    }

    /// Coverage of the histogram.
    pub fn coverage(&self) -> f64 {
        self.histogram.coverage()
    }

    /// Check that the parallel lists agree with each other and with the
    /// histogram.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        let n = self.candidate_ids.len();
        let lengths = [
            self.properties.len(),
            self.bins.len(),
            self.generations.len(),
            self.parents.len(),
        ];
        if lengths.iter().any(|&l| l != n) {
            return Err(CheckpointError::Inconsistent(format!(
                "{n} candidate ids but list lengths {lengths:?}"
            )));
        }
        if self.histogram.total() != n as u64 {
            return Err(CheckpointError::Inconsistent(format!(
                "histogram holds {} entries for {n} candidates",
                self.histogram.total()
            )));
        }
        if self.histogram.len() != self.membership.len() {
            return Err(CheckpointError::Inconsistent(
                "histogram and membership shapes differ".to_string(),
            ));
        }
        if self.candidate_ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CheckpointError::Inconsistent(
                "candidate ids are not strictly increasing".to_string(),
            ));
        }
        if let Some((i, p)) = self
            .parents
            .iter()
            .enumerate()
            .find_map(|(i, p)| p.filter(|&p| p >= i).map(|p| (i, p)))
        {
            return Err(CheckpointError::Inconsistent(format!(
                "candidate at {i} names parent position {p}"
            )));
        }

        let mut seen = vec![false; n];
        for (flat, members) in self.membership.iter() {
            if members.len() as u64 != self.histogram.count(flat) {
                return Err(CheckpointError::Inconsistent(format!(
                    "bin {flat} lists {} members but counts {}",
                    members.len(),
                    self.histogram.count(flat)
                )));
            }
            for &i in members {
                if i >= n || seen[i] {
                    return Err(CheckpointError::Inconsistent(format!(
                        "bin {flat} lists invalid or repeated member {i}"
                    )));
                }
                seen[i] = true;
                if self.bins[i] != self.bins[members[0]] {
                    return Err(CheckpointError::Inconsistent(format!(
                        "bin {flat} mixes coordinates {:?} and {:?}",
                        self.bins[members[0]], self.bins[i]
                    )));
                }
            }
        }

        let occupied: BTreeSet<&BinCoord> = self.bins.iter().collect();
        if occupied.len() != self.explored_bins.len()
            || !self.explored_bins.iter().all(|b| occupied.contains(b))
        {
            return Err(CheckpointError::Inconsistent(
                "explored bins differ from candidate bins".to_string(),
            ));
        }
        Ok(())
    }

    /// Write as JSON. The file is written beside the target and renamed so a
    /// crash never leaves a truncated checkpoint.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let io_err = |source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string(self).map_err(|source| CheckpointError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)
    }

    /// Load and validate.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let content = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut snapshot: Self =
            serde_json::from_str(&content).map_err(|source| CheckpointError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        if snapshot.retest.len() != snapshot.candidate_ids.len() {
            snapshot
                .retest
                .resize(snapshot.candidate_ids.len(), RetestStatus::Untested);
        }
        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// Path of the working checkpoint in `dir`.
pub fn checkpoint_path(dir: &Path) -> PathBuf {
    dir.join(CHECKPOINT_FILE)
}

/// Path of the kept milestone checkpoint for `generation`.
pub fn milestone_path(dir: &Path, generation: u32) -> PathBuf {
    dir.join(format!("restart_{generation}.json"))
}

/// Copy the working checkpoint to its milestone name.
pub fn keep_milestone(dir: &Path, generation: u32) -> Result<PathBuf, CheckpointError> {
    let from = checkpoint_path(dir);
    let to = milestone_path(dir, generation);
    fs::copy(&from, &to).map_err(|source| CheckpointError::Io {
        path: to.clone(),
        source,
    })?;
    Ok(to)
}

/// Newest `restart*.json` in `dir` by modification time.
pub fn find_latest(dir: &Path) -> Result<PathBuf, CheckpointError> {
    let entries = fs::read_dir(dir).map_err(|source| CheckpointError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| CheckpointError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("restart") && name.ends_with(".json") {
            let modified = entry.metadata().and_then(|m| m.modified()).ok();
            found.push((modified, path));
        }
    }

    if found.len() > 1 {
        warn!(
            "{} checkpoints in {}, using the most recent",
            found.len(),
            dir.display()
        );
    }
    found
        .into_iter()
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, path)| path)
        .ok_or_else(|| CheckpointError::NotFound(dir.to_path_buf()))
}
