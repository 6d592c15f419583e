//! Generation orchestrator.
//!
//! Generation 0 seeds the histogram with random materials. Every later
//! generation first checks coverage against the benchmarks, then updates
//! mutation strengths from the previous generation's lineages, selects
//! parents (re-testing them when configured), and dispatches one child per
//! slot to the worker pool. The histogram, membership lists and strength
//! table are only touched here, after the whole generation is back.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, error, info, warn};
use rayon::prelude::*;
use uuid::Uuid;

use crate::compute::{SimulationError, Simulator, simulate_with_retry};
use crate::schema::{
    Candidate, ConfigError, ExplorationProgress, ExplorationResult, GeneratorType, Milestone,
    RetestRecord, RetestStatus, RunConfig, StopReason, Structure,
};
use crate::store::{MaterialStore, StoreError, StoreSession, StrengthKey};

use super::binning::{Binner, BinningError};
use super::checkpoint::{self, CheckpointError, Snapshot};
use super::generator::StructureRng;
use super::retest::Retester;
use super::selection::{SelectionError, select_parent};
use super::strength::StrengthTable;

/// Where a run starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStart {
    /// New run; the store must not hold candidates of this run yet.
    Fresh,
    /// Rebuild state from every stored candidate up to `generation` and
    /// continue with the next one.
    FromStore { generation: u32 },
    /// Load a checkpoint file.
    FromCheckpoint(CheckpointSource),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSource {
    Path(PathBuf),
    /// Newest `restart*.json` in the output directory.
    Latest,
}

/// Store and restart state disagree.
#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error("Store already holds {count} candidates for run '{run_id}'")]
    StoreNotEmpty { run_id: String, count: usize },
    #[error(
        "Store holds {found} candidates past the restart point; rerun with the override flag to delete them"
    )]
    ExcessCandidates { found: usize },
    #[error("Restart expects {expected} candidates but the store holds {found}")]
    MissingCandidates { expected: usize, found: usize },
    #[error("Checkpoint belongs to run '{found}', not '{expected}'")]
    RunMismatch { expected: String, found: String },
    #[error("Checkpoint has {found} bins, configuration has {expected}")]
    BinMismatch { expected: usize, found: usize },
}

/// Fatal run errors.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Parent selection failed: {0}")]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Binning(#[from] BinningError),
    #[error("Simulation failed: {0}")]
    Simulation(#[from] SimulationError),
    #[error(
        "Generation {generation} incomplete: {completed}/{expected} children finished ({source})"
    )]
    GenerationIncomplete {
        generation: u32,
        completed: usize,
        expected: usize,
        source: Box<RunError>,
    },
    #[error("Retest of candidate {id} could not run: {source}")]
    Retest { id: u64, source: SimulationError },
    #[error("Parent candidate {0} is missing from the store")]
    MissingParent(u64),
    #[error("Restart refused: {0}")]
    Restart(#[from] RestartError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Parent of one child slot.
#[derive(Debug, Clone)]
struct ParentPlan {
    position: usize,
    id: u64,
    structure: Structure,
    strength: f64,
}

/// One child slot of a generation.
#[derive(Debug, Clone)]
struct ChildPlan {
    id: u64,
    generation: u32,
    generation_index: usize,
    seed: u64,
    parent: Option<ParentPlan>,
}

/// Shared, read-only view handed to pool threads.
struct Worker<'a, S> {
    store: &'a S,
    simulator: &'a dyn Simulator,
    binner: &'a Binner,
    config: &'a RunConfig,
}

impl<S: MaterialStore> Worker<'_, S> {
    /// Generate, simulate, classify and persist one child.
    fn child(&self, plan: &ChildPlan) -> Result<Candidate, RunError> {
        let mut rng = StructureRng::new(plan.seed);
        let limits = &self.config.structure;
        let structure = match &plan.parent {
            Some(parent) => rng.mutate_structure(&parent.structure, parent.strength, limits),
            None => rng.random_structure(limits),
        };

        let uuid = Uuid::new_v4();
        let properties = simulate_with_retry(
            self.simulator,
            &self.config.retry,
            self.binner.dimensions(),
            uuid,
            &structure,
        )?;
        let bin = self.binner.classify(&properties)?;

        let candidate = Candidate {
            id: plan.id,
            uuid,
            run_id: self.config.run_id.clone(),
            parent_id: plan.parent.as_ref().map(|p| p.id),
            generation: plan.generation,
            generation_index: plan.generation_index,
            structure,
            properties,
            bin,
            retest: RetestRecord::default(),
        };
        let mut session = self.store.open_session()?;
        session.insert_candidate(&candidate)?;
        Ok(candidate)
    }

    /// Run the outstanding re-test trials of one candidate.
    fn retest(&self, retester: &Retester, mut candidate: Candidate) -> Result<Candidate, RunError> {
        for _ in 0..retester.remaining(&candidate.retest) {
            let values = simulate_with_retry(
                self.simulator,
                &self.config.retry,
                self.binner.dimensions(),
                candidate.uuid,
                &candidate.structure,
            )
            .map_err(|source| RunError::Retest {
                id: candidate.id,
                source,
            })?;
            retester.record_trial(&mut candidate, &values);
        }
        let mut session = self.store.open_session()?;
        session.update_candidate(&candidate)?;
        Ok(candidate)
    }
}

/// Drives an exploration run.
pub struct ExplorationEngine<S: MaterialStore> {
    config: RunConfig,
    binner: Binner,
    store: S,
    simulator: Arc<dyn Simulator>,
    seed: u64,
    rng: StructureRng,
    strengths: StrengthTable,
    retester: Option<Retester>,
    snapshot: Snapshot,
    pool: rayon::ThreadPool,
    cancelled: Arc<AtomicBool>,
    override_restart_errors: bool,
}

impl<S: MaterialStore> ExplorationEngine<S> {
    /// Create an engine. Fails on an invalid configuration.
    pub fn new(
        config: RunConfig,
        store: S,
        simulator: Arc<dyn Simulator>,
    ) -> Result<Self, RunError> {
        config.validate()?;
        let binner = Binner::from_config(&config);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_workers)
            .build()?;
        let seed = config.random_seed.unwrap_or_else(rand::random);
        let snapshot = Snapshot::new(config.run_id.clone(), binner.total_bins());

        Ok(Self {
            seed,
            rng: StructureRng::new(seed),
            strengths: StrengthTable::new(config.initial_mutation_strength),
            retester: config.retest.as_ref().map(Retester::new),
            snapshot,
            binner,
            store,
            simulator,
            pool,
            cancelled: Arc::new(AtomicBool::new(false)),
            override_restart_errors: false,
            config,
        })
    }

    /// Allow a restart to delete candidates stored past the restart point.
    pub fn with_override_restart_errors(mut self, enabled: bool) -> Self {
        self.override_restart_errors = enabled;
        self
    }

    /// Get cancellation handle. Checked between generations.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn strengths(&self) -> &StrengthTable {
        &self.strengths
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn worker(&self) -> Worker<'_, S> {
        Worker {
            store: &self.store,
            simulator: self.simulator.as_ref(),
            binner: &self.binner,
            config: &self.config,
        }
    }

    /// Load or initialize state and check it against the store.
    fn prepare(&mut self, start: RunStart) -> Result<(), RunError> {
        let run_id = self.config.run_id.clone();
        let mut session = self.store.open_session()?;

        match start {
            RunStart::Fresh => {
                let count = session.count_candidates(&run_id)?;
                if count > 0 {
                    return Err(RestartError::StoreNotEmpty { run_id, count }.into());
                }
                self.snapshot = Snapshot::new(run_id, self.binner.total_bins());
                self.snapshot.seed = Some(self.seed);
                self.snapshot
                    .save(&checkpoint::checkpoint_path(&self.config.output_dir))?;
                info!(
                    "Starting run '{}': {} bins, {} children per generation",
                    self.config.run_id,
                    self.binner.total_bins(),
                    self.config.children_per_generation
                );
                return Ok(());
            }
            RunStart::FromStore { generation } => {
                let candidates = session.candidates_through_generation(&run_id, generation)?;
                let expected = self.config.children_per_generation * (generation as usize + 1);
                if candidates.len() != expected {
                    return Err(RestartError::MissingCandidates {
                        expected,
                        found: candidates.len(),
                    }
                    .into());
                }
                self.snapshot =
                    Snapshot::from_candidates(run_id, &self.binner, candidates, generation + 1)?;
                self.snapshot.replay_milestones(&self.config.benchmarks);
                self.snapshot.seed = Some(self.seed);
                info!("Resuming from store after generation {generation}");
            }
            RunStart::FromCheckpoint(source) => {
                let path = match source {
                    CheckpointSource::Path(path) => path,
                    CheckpointSource::Latest => checkpoint::find_latest(&self.config.output_dir)?,
                };
                let snapshot = Snapshot::load(&path)?;
                if snapshot.run_id != run_id {
                    return Err(RestartError::RunMismatch {
                        expected: run_id,
                        found: snapshot.run_id,
                    }
                    .into());
                }
                if snapshot.histogram.len() != self.binner.total_bins() {
                    return Err(RestartError::BinMismatch {
                        expected: self.binner.total_bins(),
                        found: snapshot.histogram.len(),
                    }
                    .into());
                }
                info!(
                    "Resuming from checkpoint {} at generation {}",
                    path.display(),
                    snapshot.next_generation
                );
                self.snapshot = snapshot;
                match self.snapshot.seed {
                    Some(seed) => self.seed = seed,
                    None => self.snapshot.seed = Some(self.seed),
                }
            }
        }

        self.reconcile(&mut session)?;
        for (key, strength) in session.strengths(&self.config.run_id)? {
            self.strengths.insert(key.generation, key.bin, strength);
        }
        debug!("Loaded {} strength entries", self.strengths.len());
        Ok(())
    }

    /// Compare the store with the snapshot. Missing rows are fatal; rows
    /// past the snapshot are deleted only when overriding.
    fn reconcile(&self, session: &mut S::Session) -> Result<(), RunError> {
        let run_id = &self.config.run_id;
        let last_id = self.snapshot.last_id();
        let expected = self.snapshot.len();
        let total = session.count_candidates(run_id)?;
        let excess = session.count_candidates_after(run_id, last_id)?;
        let present = total - excess;

        if present != expected {
            return Err(RestartError::MissingCandidates {
                expected,
                found: present,
            }
            .into());
        }
        if excess > 0 {
            if !self.override_restart_errors {
                return Err(RestartError::ExcessCandidates { found: excess }.into());
            }
            let deleted = session.delete_candidates_after(run_id, last_id)?;
            session.flush()?;
            warn!("Deleted {deleted} candidates stored past candidate {last_id}");
        }
        Ok(())
    }

    /// Whether the final benchmark has been reached.
    fn converged(&self) -> bool {
        self.config
            .benchmarks
            .last()
            .is_some_and(|&last| self.snapshot.coverage() >= last)
    }

    /// Derive this generation's strengths from the previous generation and
    /// persist them. The stored value wins when a row already exists.
    fn update_strengths(&mut self, generation: u32) -> Result<(), RunError> {
        let lineages = self.snapshot.lineages(generation.saturating_sub(1));
        if lineages.is_empty() {
            return Ok(());
        }
        let (binner, histogram) = (&self.binner, &self.snapshot.histogram);
        let updates = self.strengths.compute_updates(generation, &lineages, |bin| {
            binner
                .flat_index(bin)
                .map(|flat| histogram.count(flat))
                .unwrap_or(0)
        });
        let mut session = self.store.open_session()?;
        for (bin, (strength, adjustment)) in updates {
            let key = StrengthKey {
                run_id: self.config.run_id.clone(),
                generation,
                bin: bin.clone(),
            };
            let stored = session.get_or_create_strength(&key, strength)?;
            debug!("Bin {bin:?}: {adjustment:?} -> strength {stored}");
            self.strengths.insert(generation, bin, stored);
        }
        session.flush()?;
        Ok(())
    }

    /// Pick one eligible parent per slot, re-testing untested picks when
    /// configured and replacing any that fail.
    fn select_parents(&mut self, generation: u32) -> Result<Vec<ParentPlan>, RunError> {
        let slots = self.config.children_per_generation;
        let limit = self.config.parent_generation_index_limit;
        let mut picks: Vec<usize> = Vec::with_capacity(slots);

        loop {
            let retest = &self.snapshot.retest;
            let eligible = |i: usize| {
                retest[i] != RetestStatus::Failed && limit.is_none_or(|l| i % slots < l)
            };
            while picks.len() < slots {
                picks.push(select_parent(
                    &self.snapshot.histogram,
                    &self.snapshot.membership,
                    Some(&eligible),
                    self.rng.rng(),
                )?);
            }

            let Some(retester) = self.retester.clone() else {
                break;
            };
            let failed = self.retest_parents(&picks, &retester)?;
            if failed.is_empty() {
                break;
            }
            picks.retain(|p| !failed.contains(p));
        }

        let mut session = self.store.open_session()?;
        let mut structures: BTreeMap<usize, Structure> = BTreeMap::new();
        let mut plans = Vec::with_capacity(slots);
        for position in picks {
            let id = self.snapshot.candidate_ids[position];
            let structure = match structures.get(&position) {
                Some(s) => s.clone(),
                None => {
                    let parent = session
                        .candidate(&self.config.run_id, id)?
                        .ok_or(RunError::MissingParent(id))?;
                    structures.insert(position, parent.structure.clone());
                    parent.structure
                }
            };
            let strength = self
                .strengths
                .strength(generation, &self.snapshot.bins[position]);
            plans.push(ParentPlan {
                position,
                id,
                structure,
                strength,
            });
        }
        Ok(plans)
    }

    /// Re-test the untested candidates among `picks`. Returns the positions
    /// that failed.
    fn retest_parents(
        &mut self,
        picks: &[usize],
        retester: &Retester,
    ) -> Result<BTreeSet<usize>, RunError> {
        let pending: BTreeSet<usize> = picks
            .iter()
            .copied()
            .filter(|&p| self.snapshot.retest[p] == RetestStatus::Untested)
            .collect();
        if pending.is_empty() {
            return Ok(BTreeSet::new());
        }

        let mut session = self.store.open_session()?;
        let mut candidates = Vec::with_capacity(pending.len());
        for &position in &pending {
            let id = self.snapshot.candidate_ids[position];
            let candidate = session
                .candidate(&self.config.run_id, id)?
                .ok_or(RunError::MissingParent(id))?;
            candidates.push((position, candidate));
        }

        let worker = self.worker();
        let results: Vec<Result<(usize, Candidate), RunError>> = self.pool.install(|| {
            candidates
                .into_par_iter()
                .map(|(position, candidate)| {
                    worker
                        .retest(retester, candidate)
                        .map(|candidate| (position, candidate))
                })
                .collect()
        });

        let mut failed = BTreeSet::new();
        for result in results {
            let (position, candidate) = result?;
            let status = candidate.retest.status;
            self.snapshot.retest[position] = status;
            match status {
                RetestStatus::Failed => {
                    warn!(
                        "Candidate {} failed retest, excluded as parent",
                        candidate.id
                    );
                    failed.insert(position);
                }
                RetestStatus::Passed => debug!("Candidate {} passed retest", candidate.id),
                RetestStatus::Untested => {}
            }
        }
        Ok(failed)
    }

    /// Build, dispatch and record one generation. Returns the number of
    /// bins first reached by it.
    fn run_generation(&mut self, generation: u32) -> Result<usize, RunError> {
        let slots = self.config.children_per_generation;
        self.rng = StructureRng::for_generation(self.seed, generation);
        let parents: Vec<Option<ParentPlan>> =
            if generation == 0 || self.config.generator == GeneratorType::Random {
                (0..slots).map(|_| None).collect()
            } else {
                self.update_strengths(generation)?;
                self.select_parents(generation)?
                    .into_iter()
                    .map(Some)
                    .collect()
            };

        let seeds: Vec<u64> = match (generation, self.config.initial_points_random_seed) {
            (0, Some(seed)) => {
                let mut rng = StructureRng::new(seed);
                (0..slots).map(|_| rng.next_seed()).collect()
            }
            _ => (0..slots).map(|_| self.rng.next_seed()).collect(),
        };

        let first_id = self.snapshot.last_id() + 1;
        let plans: Vec<ChildPlan> = parents
            .into_iter()
            .zip(seeds)
            .enumerate()
            .map(|(index, (parent, seed))| ChildPlan {
                id: first_id + index as u64,
                generation,
                generation_index: index,
                seed,
                parent,
            })
            .collect();

        let worker = self.worker();
        let results: Vec<Result<Candidate, RunError>> = self
            .pool
            .install(|| plans.par_iter().map(|plan| worker.child(plan)).collect());

        let expected = plans.len();
        let mut children = Vec::with_capacity(expected);
        let mut first_error = None;
        for result in results {
            match result {
                Ok(child) => children.push(child),
                Err(e) => {
                    error!("Generation {generation}: child failed: {e}");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(source) = first_error {
            return Err(RunError::GenerationIncomplete {
                generation,
                completed: children.len(),
                expected,
                source: Box::new(source),
            });
        }

        let mut new_bins = 0;
        for (child, plan) in children.iter().zip(&plans) {
            let flat = self.binner.flat_index(&child.bin)?;
            let parent = plan.parent.as_ref().map(|p| p.position);
            if self.snapshot.record(child, flat, parent) {
                new_bins += 1;
            }
        }
        self.snapshot.next_generation = generation + 1;
        Ok(new_bins)
    }

    /// Record milestones, flush the store and write the checkpoint.
    fn finish_generation(
        &mut self,
        generation: u32,
        new_bins: usize,
    ) -> Result<ExplorationProgress, RunError> {
        let coverage = self.snapshot.coverage();
        let mut reached = Vec::new();
        for &benchmark in &self.config.benchmarks {
            let known = self
                .snapshot
                .milestones
                .iter()
                .any(|m| m.benchmark == benchmark);
            if coverage >= benchmark && !known {
                info!(
                    "Benchmark {:.1}% reached at generation {generation}",
                    benchmark * 100.0
                );
                self.snapshot.milestones.push(Milestone {
                    benchmark,
                    generation,
                    coverage,
                });
                reached.push(benchmark);
            }
        }

        self.store.open_session()?.flush()?;
        let dir = &self.config.output_dir;
        self.snapshot.save(&checkpoint::checkpoint_path(dir))?;
        if !reached.is_empty() {
            let kept = checkpoint::keep_milestone(dir, generation)?;
            info!("Kept checkpoint {}", kept.display());
        }

        let progress = ExplorationProgress {
            generation,
            candidates: self.snapshot.len(),
            bins_explored: self.snapshot.histogram.explored(),
            total_bins: self.snapshot.histogram.len(),
            coverage,
            new_bins,
            benchmarks_reached: reached,
        };
        info!(
            "Generation {generation}: {} candidates, {}/{} bins explored ({:.2}%)",
            progress.candidates,
            progress.bins_explored,
            progress.total_bins,
            coverage * 100.0
        );
        Ok(progress)
    }

    fn explore<F>(&mut self, start: RunStart, callback: F) -> Result<ExplorationResult, RunError>
    where
        F: Fn(&ExplorationProgress),
    {
        let start_time = Instant::now();
        self.prepare(start)?;
        let known_milestones = self.snapshot.milestones.len();

        let stop_reason = loop {
            if self.cancelled.load(Ordering::Relaxed) {
                break StopReason::Cancelled;
            }
            let generation = self.snapshot.next_generation;
            if generation > 0 {
                if self.converged() {
                    break StopReason::Converged;
                }
                if generation > self.config.max_generations {
                    break StopReason::MaxGenerations;
                }
            }

            let new_bins = self.run_generation(generation)?;
            let progress = self.finish_generation(generation, new_bins)?;
            callback(&progress);
        };

        if let Some(last) = self.snapshot.next_generation.checked_sub(1) {
            let dir = &self.config.output_dir;
            if !checkpoint::milestone_path(dir, last).exists() {
                checkpoint::keep_milestone(dir, last)?;
            }
        }

        let result = ExplorationResult {
            last_generation: self.snapshot.next_generation.saturating_sub(1),
            total_candidates: self.snapshot.len(),
            bins_explored: self.snapshot.histogram.explored(),
            coverage: self.snapshot.coverage(),
            milestones: self.snapshot.milestones[known_milestones..].to_vec(),
            elapsed_seconds: start_time.elapsed().as_secs_f64(),
            stop_reason,
        };
        info!(
            "Run '{}' stopped ({:?}) after generation {}: {:.2}% coverage",
            self.config.run_id,
            result.stop_reason,
            result.last_generation,
            result.coverage * 100.0
        );
        Ok(result)
    }

    /// Run with progress callback.
    pub fn run_with_callback<F>(
        &mut self,
        start: RunStart,
        callback: F,
    ) -> Result<ExplorationResult, RunError>
    where
        F: Fn(&ExplorationProgress),
    {
        let result = self.explore(start, callback);
        if let Err(e) = &result {
            error!("Run '{}' aborted: {e}", self.config.run_id);
        }
        result
    }

    /// Run (blocking).
    pub fn run(&mut self, start: RunStart) -> Result<ExplorationResult, RunError> {
        self.run_with_callback(start, |_| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PropertyDimension, PropertySource};
    use crate::store::MemoryStore;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{TempDir, tempdir};

    fn config(dir: &TempDir) -> RunConfig {
        let dimension = |name: &str| PropertyDimension {
            name: name.to_string(),
            lower: 0.0,
            upper: 1.0,
            source: PropertySource::GeometricVoidFraction,
        };
        RunConfig {
            run_id: "test".to_string(),
            children_per_generation: 10,
            max_generations: 0,
            num_workers: 2,
            output_dir: dir.path().to_path_buf(),
            properties: vec![dimension("x"), dimension("y")],
            bins_per_dimension: 4,
            benchmarks: vec![0.9],
            random_seed: Some(3),
            ..Default::default()
        }
    }

    /// The n-th call lands in bin `(n % 4, n / 4)` of a 4x4 grid.
    fn counting_simulator() -> Arc<dyn Simulator> {
        let calls = AtomicUsize::new(0);
        Arc::new(move |_: Uuid, _: &Structure| {
            let n = calls.fetch_add(1, Ordering::SeqCst) % 16;
            Ok::<_, SimulationError>(vec![
                ((n % 4) as f64 + 0.5) / 4.0,
                ((n / 4) as f64 + 0.5) / 4.0,
            ])
        })
    }

    #[test]
    fn test_seed_generation_coverage() {
        let dir = tempdir().unwrap();
        let mut engine =
            ExplorationEngine::new(config(&dir), MemoryStore::new(), counting_simulator())
                .unwrap();
        let result = engine.run(RunStart::Fresh).unwrap();

        assert_eq!(result.total_candidates, 10);
        assert_eq!(result.bins_explored, 10);
        assert!((result.coverage - 0.625).abs() < 1e-12);
        assert_eq!(result.stop_reason, StopReason::MaxGenerations);
        assert_eq!(result.last_generation, 0);
        assert_eq!(engine.snapshot().histogram.total(), 10);
        assert!(checkpoint::checkpoint_path(dir.path()).exists());
        assert!(checkpoint::milestone_path(dir.path(), 0).exists());
    }

    #[test]
    fn test_children_link_to_parents() {
        let dir = tempdir().unwrap();
        let cfg = RunConfig {
            max_generations: 2,
            ..config(&dir)
        };
        let store = MemoryStore::new();
        let mut engine = ExplorationEngine::new(cfg, store.clone(), counting_simulator()).unwrap();
        let result = engine.run(RunStart::Fresh).unwrap();
        assert_eq!(result.total_candidates, 30);
        assert_eq!(result.last_generation, 2);

        let mut session = store.open_session().unwrap();
        let all = session.candidates_through_generation("test", 2).unwrap();
        assert_eq!(all.len(), 30);
        for c in &all {
            match c.generation {
                0 => assert!(c.parent_id.is_none()),
                g => {
                    let parent = session.candidate("test", c.parent_id.unwrap()).unwrap();
                    assert!(parent.unwrap().generation < g);
                }
            }
            assert_eq!(c.generation_index, ((c.id - 1) % 10) as usize);
        }
    }

    #[test]
    fn test_parents_respect_generation_index_limit() {
        let dir = tempdir().unwrap();
        let cfg = RunConfig {
            max_generations: 1,
            parent_generation_index_limit: Some(3),
            ..config(&dir)
        };
        let store = MemoryStore::new();
        let mut engine = ExplorationEngine::new(cfg, store.clone(), counting_simulator()).unwrap();
        engine.run(RunStart::Fresh).unwrap();

        let mut session = store.open_session().unwrap();
        let all = session.candidates_through_generation("test", 1).unwrap();
        let children: Vec<_> = all.iter().filter(|c| c.generation == 1).collect();
        assert_eq!(children.len(), 10);
        for child in children {
            let parent = session
                .candidate("test", child.parent_id.unwrap())
                .unwrap()
                .unwrap();
            assert!(parent.generation_index < 3, "{parent:?}");
        }
    }

    #[test]
    fn test_zero_generation_index_limit_fails_selection() {
        let dir = tempdir().unwrap();
        let cfg = RunConfig {
            max_generations: 1,
            parent_generation_index_limit: Some(0),
            ..config(&dir)
        };
        let mut engine =
            ExplorationEngine::new(cfg, MemoryStore::new(), counting_simulator()).unwrap();
        assert!(matches!(
            engine.run(RunStart::Fresh),
            Err(RunError::Selection(SelectionError::NoEligibleCandidates))
        ));
        assert_eq!(engine.snapshot().len(), 10);
    }

    #[test]
    fn test_converges_at_final_benchmark() {
        let dir = tempdir().unwrap();
        let cfg = RunConfig {
            max_generations: 50,
            benchmarks: vec![0.5, 1.0],
            ..config(&dir)
        };
        let progress = Mutex::new(Vec::new());
        let mut engine =
            ExplorationEngine::new(cfg, MemoryStore::new(), counting_simulator()).unwrap();
        let result = engine
            .run_with_callback(RunStart::Fresh, |p| {
                progress.lock().unwrap().push(p.clone());
            })
            .unwrap();

        assert_eq!(result.stop_reason, StopReason::Converged);
        assert_eq!(result.coverage, 1.0);
        // 16 bins are filled after 16 calls: during generation 1.
        assert_eq!(result.last_generation, 1);
        assert_eq!(result.milestones.len(), 2);
        let progress = progress.into_inner().unwrap();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].benchmarks_reached, vec![0.5]);
        assert_eq!(progress[1].benchmarks_reached, vec![1.0]);
        assert_eq!(progress[1].new_bins, 6);
    }

    #[test]
    fn test_failed_child_aborts_generation() {
        let dir = tempdir().unwrap();
        let calls = AtomicUsize::new(0);
        let simulator: Arc<dyn Simulator> = Arc::new(move |_: Uuid, _: &Structure| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SimulationError::Other("engine crashed".to_string()))
            } else {
                Ok(vec![0.1, 0.1])
            }
        });
        let cfg = RunConfig {
            retry: crate::schema::RetryPolicy { max_attempts: 1 },
            ..config(&dir)
        };
        let mut engine = ExplorationEngine::new(cfg, MemoryStore::new(), simulator).unwrap();
        let err = engine.run(RunStart::Fresh).unwrap_err();
        assert!(matches!(
            err,
            RunError::GenerationIncomplete {
                generation: 0,
                completed: 9,
                expected: 10,
                ..
            }
        ));
        assert_eq!(engine.snapshot().histogram.total(), 0);
    }

    #[test]
    fn test_fresh_run_refuses_populated_store() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let mut first =
            ExplorationEngine::new(config(&dir), store.clone(), counting_simulator()).unwrap();
        first.run(RunStart::Fresh).unwrap();

        let mut second = ExplorationEngine::new(config(&dir), store, counting_simulator()).unwrap();
        assert!(matches!(
            second.run(RunStart::Fresh),
            Err(RunError::Restart(RestartError::StoreNotEmpty { count: 10, .. }))
        ));
    }

    #[test]
    fn test_cancel_before_start() {
        let dir = tempdir().unwrap();
        let mut engine =
            ExplorationEngine::new(config(&dir), MemoryStore::new(), counting_simulator())
                .unwrap();
        engine.cancel_handle().store(true, Ordering::Relaxed);
        let result = engine.run(RunStart::Fresh).unwrap();
        assert_eq!(result.stop_reason, StopReason::Cancelled);
        assert_eq!(result.total_candidates, 0);
    }

    #[test]
    fn test_failed_retest_parent_is_replaced() {
        let dir = tempdir().unwrap();
        // The first structure simulated sits alone in bin (0, 0) and drifts
        // when simulated again; every other one sits in bin (3, 3) and
        // reproduces exactly.
        let calls = Mutex::new(BTreeMap::<Uuid, (usize, u32)>::new());
        let simulator: Arc<dyn Simulator> = Arc::new(move |uuid: Uuid, _: &Structure| {
            let mut calls = calls.lock().unwrap();
            let next = calls.len();
            let entry = calls.entry(uuid).or_insert((next, 0));
            entry.1 += 1;
            let values = match *entry {
                (0, 1) => vec![0.125, 0.125],
                (0, _) => vec![0.325, 0.125],
                _ => vec![0.875, 0.875],
            };
            Ok::<_, SimulationError>(values)
        });
        let cfg = RunConfig {
            max_generations: 1,
            retest: Some(crate::schema::RetestConfig {
                trials: 2,
                tolerance: 0.05,
            }),
            ..config(&dir)
        };
        let store = MemoryStore::new();
        let mut engine = ExplorationEngine::new(cfg, store.clone(), simulator).unwrap();
        engine.run(RunStart::Fresh).unwrap();

        let mut session = store.open_session().unwrap();
        let all = session.candidates_through_generation("test", 1).unwrap();
        let drifting = all
            .iter()
            .find(|c| c.generation == 0 && c.bin == vec![0, 0])
            .unwrap();
        // Picked with probability 0.9 per slot, so it was re-tested.
        assert_eq!(drifting.retest.status, RetestStatus::Failed);
        assert_eq!(
            engine.snapshot().retest[engine.snapshot().position(drifting.id).unwrap()],
            RetestStatus::Failed
        );

        let children: Vec<_> = all.iter().filter(|c| c.generation == 1).collect();
        assert_eq!(children.len(), 10);
        for child in children {
            let parent_id = child.parent_id.unwrap();
            assert_ne!(parent_id, drifting.id);
            let parent = session.candidate("test", parent_id).unwrap().unwrap();
            assert_eq!(parent.retest.status, RetestStatus::Passed);
            assert_eq!(parent.retest.count, 2);
        }
    }
}
