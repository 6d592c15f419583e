//! End-to-end exploration runs against the in-memory store.

use std::sync::Arc;

use matscreen::compute::SimulationError;
use matscreen::compute::exploration::{
    BinMembership, CheckpointError, CheckpointSource, ExplorationEngine, RestartError, RunError,
    RunStart, Snapshot, checkpoint_path, milestone_path,
};
use matscreen::schema::{
    Candidate, PropertyDimension, PropertySource, RunConfig, StopReason, Structure,
    StructureLimits,
};
use matscreen::store::{MaterialStore, MemoryStore, StoreSession};
use tempfile::{TempDir, tempdir};
use uuid::Uuid;

fn config(dir: &TempDir, max_generations: u32) -> RunConfig {
    let dimension = |name: &str| PropertyDimension {
        name: name.to_string(),
        lower: 0.0,
        upper: 1.0,
        source: PropertySource::GeometricVoidFraction,
    };
    RunConfig {
        run_id: "it".to_string(),
        children_per_generation: 10,
        max_generations,
        num_workers: 4,
        output_dir: dir.path().to_path_buf(),
        properties: vec![dimension("a"), dimension("b")],
        bins_per_dimension: 10,
        benchmarks: vec![0.05, 0.99],
        structure: StructureLimits {
            lattice_constant_limits: (10.0, 20.0),
            ..StructureLimits::default()
        },
        random_seed: Some(17),
        ..Default::default()
    }
}

/// Properties are the scaled lattice constants `a` and `b`.
fn lattice_simulator() -> Arc<dyn matscreen::compute::Simulator> {
    Arc::new(|_: Uuid, s: &Structure| {
        Ok::<_, SimulationError>(vec![(s.a - 10.0) / 10.0, (s.b - 10.0) / 10.0])
    })
}

fn engine(
    dir: &TempDir,
    store: MemoryStore,
    max_generations: u32,
) -> ExplorationEngine<MemoryStore> {
    ExplorationEngine::new(config(dir, max_generations), store, lattice_simulator()).unwrap()
}

#[test]
fn test_full_run_records_every_generation() {
    let dir = tempdir().unwrap();
    let store = MemoryStore::new();
    let result = engine(&dir, store.clone(), 3).run(RunStart::Fresh).unwrap();

    assert_eq!(result.stop_reason, StopReason::MaxGenerations);
    assert_eq!(result.last_generation, 3);
    assert_eq!(result.total_candidates, 40);
    assert!(result.bins_explored >= 1);
    assert_eq!(result.milestones[0].benchmark, 0.05);
    assert_eq!(result.milestones[0].generation, 0);

    let mut session = store.open_session().unwrap();
    assert_eq!(session.count_candidates("it").unwrap(), 40);
    let ids: Vec<u64> = session
        .candidates_through_generation("it", 3)
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids, (1..=40).collect::<Vec<_>>());

    let snapshot = Snapshot::load(&checkpoint_path(dir.path())).unwrap();
    assert_eq!(snapshot.next_generation, 4);
    assert_eq!(snapshot.histogram.total(), 40);
}

#[test]
fn test_strengths_are_persisted_per_generation() {
    let dir = tempdir().unwrap();
    let store = MemoryStore::new();
    engine(&dir, store.clone(), 2).run(RunStart::Fresh).unwrap();

    let mut session = store.open_session().unwrap();
    let rows = session.strengths("it").unwrap();
    assert!(!rows.is_empty());
    for (key, strength) in rows {
        assert_eq!(key.generation, 2);
        assert!([0.1, 0.2, 0.2 * 1.5].contains(&strength), "{strength}");
    }
}

#[test]
fn test_resume_from_checkpoint_continues_ids() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("store.json");

    let store = MemoryStore::open(&store_path).unwrap();
    engine(&dir, store, 1).run(RunStart::Fresh).unwrap();

    let store = MemoryStore::open(&store_path).unwrap();
    let mut resumed = engine(&dir, store.clone(), 3);
    let result = resumed
        .run(RunStart::FromCheckpoint(CheckpointSource::Latest))
        .unwrap();
    assert_eq!(result.last_generation, 3);
    assert_eq!(result.total_candidates, 40);

    let mut session = store.open_session().unwrap();
    let last = session.candidates_through_generation("it", 3).unwrap();
    assert_eq!(last.len(), 40);
    assert!(last.iter().filter(|c| c.generation >= 2).all(|c| c.id > 20));
}

#[test]
fn test_resume_from_store_requires_override_for_excess_rows() {
    let dir = tempdir().unwrap();
    let store = MemoryStore::new();
    engine(&dir, store.clone(), 2).run(RunStart::Fresh).unwrap();

    let start = RunStart::FromStore { generation: 1 };
    let err = engine(&dir, store.clone(), 2).run(start.clone()).unwrap_err();
    assert!(matches!(
        err,
        RunError::Restart(RestartError::ExcessCandidates { found: 10 })
    ));

    let result = engine(&dir, store.clone(), 2)
        .with_override_restart_errors(true)
        .run(start)
        .unwrap();
    assert_eq!(result.last_generation, 2);
    assert_eq!(result.total_candidates, 30);
    assert_eq!(
        store.open_session().unwrap().count_candidates("it").unwrap(),
        30
    );
}

#[test]
fn test_missing_rows_are_always_fatal() {
    let dir = tempdir().unwrap();
    let store = MemoryStore::new();
    engine(&dir, store.clone(), 2).run(RunStart::Fresh).unwrap();

    let err = engine(&dir, store.clone(), 9)
        .with_override_restart_errors(true)
        .run(RunStart::FromStore { generation: 5 })
        .unwrap_err();
    assert!(matches!(
        err,
        RunError::Restart(RestartError::MissingCandidates {
            expected: 60,
            found: 30
        })
    ));

    store
        .open_session()
        .unwrap()
        .delete_candidates_after("it", 25)
        .unwrap();
    let err = engine(&dir, store, 9)
        .with_override_restart_errors(true)
        .run(RunStart::FromCheckpoint(CheckpointSource::Path(
            checkpoint_path(dir.path()),
        )))
        .unwrap_err();
    assert!(matches!(
        err,
        RunError::Restart(RestartError::MissingCandidates {
            expected: 30,
            found: 25
        })
    ));
}

/// Everything about a candidate that a seeded run determines.
type Lineage = (u64, Option<u64>, u32, Vec<usize>, Vec<f64>);

fn lineage(store: &MemoryStore, through: u32) -> Vec<Lineage> {
    let mut session = store.open_session().unwrap();
    session
        .candidates_through_generation("it", through)
        .unwrap()
        .into_iter()
        .map(|c: Candidate| (c.id, c.parent_id, c.generation, c.bin, c.properties))
        .collect()
}

#[test]
fn test_resumed_runs_match_uninterrupted_run() {
    let straight_dir = tempdir().unwrap();
    let straight = MemoryStore::new();
    engine(&straight_dir, straight.clone(), 3)
        .run(RunStart::Fresh)
        .unwrap();

    let checkpoint_dir = tempdir().unwrap();
    let from_checkpoint = MemoryStore::new();
    engine(&checkpoint_dir, from_checkpoint.clone(), 1)
        .run(RunStart::Fresh)
        .unwrap();
    engine(&checkpoint_dir, from_checkpoint.clone(), 3)
        .run(RunStart::FromCheckpoint(CheckpointSource::Latest))
        .unwrap();

    let store_dir = tempdir().unwrap();
    let from_store = MemoryStore::new();
    engine(&store_dir, from_store.clone(), 1)
        .run(RunStart::Fresh)
        .unwrap();
    engine(&store_dir, from_store.clone(), 3)
        .run(RunStart::FromStore { generation: 1 })
        .unwrap();

    let expected = lineage(&straight, 3);
    assert_eq!(expected.len(), 40);
    assert_eq!(lineage(&from_checkpoint, 3), expected);
    assert_eq!(lineage(&from_store, 3), expected);
}

#[test]
fn test_resume_from_store_keeps_reached_milestones() {
    let dir = tempdir().unwrap();
    let store = MemoryStore::new();
    let first = engine(&dir, store.clone(), 1).run(RunStart::Fresh).unwrap();
    assert_eq!(first.milestones.len(), 1);
    let kept = std::fs::read(milestone_path(dir.path(), 0)).unwrap();

    let mut resumed = engine(&dir, store, 3);
    let result = resumed
        .run_with_callback(RunStart::FromStore { generation: 1 }, |progress| {
            assert!(progress.benchmarks_reached.is_empty());
        })
        .unwrap();

    assert!(result.milestones.is_empty());
    assert_eq!(resumed.snapshot().milestones, first.milestones);
    assert!(!milestone_path(dir.path(), 2).exists());
    assert!(milestone_path(dir.path(), 3).exists());
    assert_eq!(std::fs::read(milestone_path(dir.path(), 0)).unwrap(), kept);
}

#[test]
fn test_corrupt_checkpoint_membership_is_rejected() {
    let dir = tempdir().unwrap();
    let store = MemoryStore::new();
    engine(&dir, store.clone(), 1).run(RunStart::Fresh).unwrap();

    let path = checkpoint_path(dir.path());
    let mut snapshot = Snapshot::load(&path).unwrap();
    let mut membership = BinMembership::new(snapshot.membership.len());
    let mut replaced = false;
    for (flat, members) in snapshot.membership.iter() {
        for &i in members {
            let member = if replaced { i } else { 99 };
            replaced = true;
            membership.push(flat, member);
        }
    }
    snapshot.membership = membership;
    snapshot.save(&path).unwrap();

    let err = engine(&dir, store, 3)
        .run(RunStart::FromCheckpoint(CheckpointSource::Path(path)))
        .unwrap_err();
    assert!(matches!(
        err,
        RunError::Checkpoint(CheckpointError::Inconsistent(_))
    ));
}
