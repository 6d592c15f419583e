//! Store module - Persistence of candidates and mutation strengths.
//!
//! The exploration engine talks to persistence through [`MaterialStore`].
//! Every worker opens its own [`StoreSession`]; sessions are never shared
//! across threads.

mod memory;

pub use memory::*;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::schema::{BinCoord, Candidate};

/// Key of one mutation-strength row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StrengthKey {
    pub run_id: String,
    pub generation: u32,
    pub bin: BinCoord,
}

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Store file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Store file version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },
    #[error("Candidate {id} already exists in run '{run_id}'")]
    Duplicate { run_id: String, id: u64 },
    #[error("Candidate {id} not found in run '{run_id}'")]
    NotFound { run_id: String, id: u64 },
    #[error("Store lock poisoned")]
    Poisoned,
}

/// Source of independent store sessions.
pub trait MaterialStore: Send + Sync {
    type Session: StoreSession;

    /// Open a new session. Each worker holds its own.
    fn open_session(&self) -> Result<Self::Session, StoreError>;
}

/// Query/update/create operations on one session.
pub trait StoreSession: Send {
    /// Create a candidate record. Ids are unique per run.
    fn insert_candidate(&mut self, candidate: &Candidate) -> Result<(), StoreError>;

    fn candidate(&mut self, run_id: &str, id: u64) -> Result<Option<Candidate>, StoreError>;

    /// Replace an existing candidate record.
    fn update_candidate(&mut self, candidate: &Candidate) -> Result<(), StoreError>;

    fn count_candidates(&mut self, run_id: &str) -> Result<usize, StoreError>;

    /// Every candidate with `generation <= through`, ordered by id.
    fn candidates_through_generation(
        &mut self,
        run_id: &str,
        through: u32,
    ) -> Result<Vec<Candidate>, StoreError>;

    /// Number of candidates with an id above `id`.
    fn count_candidates_after(&mut self, run_id: &str, id: u64) -> Result<usize, StoreError>;

    /// Delete candidates with an id above `id`; returns how many went.
    fn delete_candidates_after(&mut self, run_id: &str, id: u64) -> Result<usize, StoreError>;

    /// Return the stored strength for `key`, creating it with `strength`
    /// when absent. An existing row is never overwritten.
    fn get_or_create_strength(
        &mut self,
        key: &StrengthKey,
        strength: f64,
    ) -> Result<f64, StoreError>;

    /// All strength rows of a run.
    fn strengths(&mut self, run_id: &str) -> Result<Vec<(StrengthKey, f64)>, StoreError>;

    /// Make prior writes durable.
    fn flush(&mut self) -> Result<(), StoreError>;
}
