//! Progress and result types reported by the exploration engine.

use serde::{Deserialize, Serialize};

/// Snapshot of run progress, emitted after every generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorationProgress {
    /// Generation just completed.
    pub generation: u32,
    /// Candidates classified so far.
    pub candidates: usize,
    /// Non-empty bins.
    pub bins_explored: usize,
    /// Total bins in the histogram.
    pub total_bins: usize,
    /// `bins_explored / total_bins`.
    pub coverage: f64,
    /// Bins first reached in this generation.
    pub new_bins: usize,
    /// Benchmark fractions crossed in this generation.
    pub benchmarks_reached: Vec<f64>,
}

/// A benchmark crossing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Milestone {
    pub benchmark: f64,
    pub generation: u32,
    pub coverage: f64,
}

/// Final result of an exploration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorationResult {
    /// Last completed generation.
    pub last_generation: u32,
    /// Candidates classified over the whole run.
    pub total_candidates: usize,
    pub bins_explored: usize,
    pub coverage: f64,
    /// Benchmarks crossed during this process' lifetime.
    pub milestones: Vec<Milestone>,
    /// Wall-clock time (in seconds).
    pub elapsed_seconds: f64,
    pub stop_reason: StopReason,
}

/// Reason the exploration stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    /// The final benchmark was reached.
    Converged,
    /// Reached maximum generations.
    MaxGenerations,
    /// User cancelled.
    Cancelled,
}
