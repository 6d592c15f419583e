//! Statistical re-test of candidates before they are trusted as parents.

use crate::schema::{Candidate, RetestConfig, RetestRecord, RetestStatus};

/// Re-test bookkeeping for one configuration.
#[derive(Debug, Clone)]
pub struct Retester {
    trials: u32,
    tolerance: f64,
}

impl Retester {
    pub fn new(config: &RetestConfig) -> Self {
        Self {
            trials: config.trials,
            tolerance: config.tolerance,
        }
    }

    pub fn trials(&self) -> u32 {
        self.trials
    }

    /// Trials still needed before a verdict.
    pub fn remaining(&self, record: &RetestRecord) -> u32 {
        match record.status {
            RetestStatus::Untested => self.trials.saturating_sub(record.count),
            RetestStatus::Passed | RetestStatus::Failed => 0,
        }
    }

    /// Add one trial's property values and re-evaluate.
    ///
    /// The status stays `Untested` until all trials are in; callers seeing
    /// that must come back later rather than treat it as failure.
    pub fn record_trial(&self, candidate: &mut Candidate, values: &[f64]) -> RetestStatus {
        let record = &mut candidate.retest;
        if record.status != RetestStatus::Untested {
            return record.status;
        }
        if record.sums.len() != values.len() {
            record.sums = vec![0.0; values.len()];
            record.count = 0;
        }
        for (sum, v) in record.sums.iter_mut().zip(values) {
            *sum += v;
        }
        record.count += 1;

        let status = self.verdict(&candidate.properties, &candidate.retest);
        candidate.retest.status = status;
        status
    }

    /// Verdict from the accumulators.
    pub fn verdict(&self, original: &[f64], record: &RetestRecord) -> RetestStatus {
        if record.count < self.trials || record.sums.len() != original.len() {
            return RetestStatus::Untested;
        }
        let n = record.count as f64;
        let within = original.iter().zip(&record.sums).all(|(&orig, &sum)| {
            let mean = sum / n;
            relative_deviation(mean, orig) < self.tolerance
        });
        if within {
            RetestStatus::Passed
        } else {
            RetestStatus::Failed
        }
    }
}

/// `|mean - original| / |original|`; infinite when the original is zero
/// and the mean differs, zero when both are zero.
pub fn relative_deviation(mean: f64, original: f64) -> f64 {
    let diff = (mean - original).abs();
    if original == 0.0 {
        if diff == 0.0 { 0.0 } else { f64::INFINITY }
    } else {
        diff / original.abs()
    }
}
