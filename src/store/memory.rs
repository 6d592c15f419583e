//! In-memory store with optional JSON file persistence.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::schema::Candidate;

use super::{MaterialStore, StoreError, StoreSession, StrengthKey};

/// Persisted file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    pub version: u32,
    pub candidates: Vec<Candidate>,
    pub strengths: Vec<StrengthRow>,
}

impl StoreData {
    /// Current data format version.
    pub const CURRENT_VERSION: u32 = 1;
}

/// One persisted strength row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrengthRow {
    pub key: StrengthKey,
    pub strength: f64,
}

#[derive(Debug, Default)]
struct Tables {
    candidates: BTreeMap<(String, u64), Candidate>,
    strengths: BTreeMap<StrengthKey, f64>,
}

impl Tables {
    fn from_data(data: StoreData) -> Self {
        Self {
            candidates: data
                .candidates
                .into_iter()
                .map(|c| ((c.run_id.clone(), c.id), c))
                .collect(),
            strengths: data
                .strengths
                .into_iter()
                .map(|row| (row.key, row.strength))
                .collect(),
        }
    }

    fn to_data(&self) -> StoreData {
        StoreData {
            version: StoreData::CURRENT_VERSION,
            candidates: self.candidates.values().cloned().collect(),
            strengths: self
                .strengths
                .iter()
                .map(|(key, &strength)| StrengthRow {
                    key: key.clone(),
                    strength,
                })
                .collect(),
        }
    }

    fn run(&self, run_id: &str) -> impl Iterator<Item = &Candidate> {
        let run_id = run_id.to_string();
        self.candidates
            .range((run_id.clone(), 0)..=(run_id, u64::MAX))
            .map(|(_, c)| c)
    }
}

/// Candidates and strengths shared between sessions behind a mutex.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Volatile store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by a JSON file, loaded now if it exists and written on
    /// every [`StoreSession::flush`].
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tables = if path.exists() {
            Tables::from_data(load_data(&path)?)
        } else {
            Tables::default()
        };
        Ok(Self {
            tables: Arc::new(Mutex::new(tables)),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl MaterialStore for MemoryStore {
    type Session = MemorySession;

    fn open_session(&self) -> Result<MemorySession, StoreError> {
        Ok(MemorySession {
            tables: Arc::clone(&self.tables),
            path: self.path.clone(),
        })
    }
}

/// Session on a [`MemoryStore`].
#[derive(Debug)]
pub struct MemorySession {
    tables: Arc<Mutex<Tables>>,
    path: Option<PathBuf>,
}

impl MemorySession {
    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl StoreSession for MemorySession {
    fn insert_candidate(&mut self, candidate: &Candidate) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        let key = (candidate.run_id.clone(), candidate.id);
        if tables.candidates.contains_key(&key) {
            return Err(StoreError::Duplicate {
                run_id: candidate.run_id.clone(),
                id: candidate.id,
            });
        }
        tables.candidates.insert(key, candidate.clone());
        Ok(())
    }

    fn candidate(&mut self, run_id: &str, id: u64) -> Result<Option<Candidate>, StoreError> {
        let tables = self.lock()?;
        Ok(tables.candidates.get(&(run_id.to_string(), id)).cloned())
    }

    fn update_candidate(&mut self, candidate: &Candidate) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        match tables
            .candidates
            .get_mut(&(candidate.run_id.clone(), candidate.id))
        {
            Some(stored) => {
                *stored = candidate.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                run_id: candidate.run_id.clone(),
                id: candidate.id,
            }),
        }
    }

    fn count_candidates(&mut self, run_id: &str) -> Result<usize, StoreError> {
        Ok(self.lock()?.run(run_id).count())
    }

    fn candidates_through_generation(
        &mut self,
        run_id: &str,
        through: u32,
    ) -> Result<Vec<Candidate>, StoreError> {
        Ok(self
            .lock()?
            .run(run_id)
            .filter(|c| c.generation <= through)
            .cloned()
            .collect())
    }

    fn count_candidates_after(&mut self, run_id: &str, id: u64) -> Result<usize, StoreError> {
        Ok(self.lock()?.run(run_id).filter(|c| c.id > id).count())
    }

    fn delete_candidates_after(&mut self, run_id: &str, id: u64) -> Result<usize, StoreError> {
        let mut tables = self.lock()?;
        let before = tables.candidates.len();
        tables
            .candidates
            .retain(|(run, cid), _| run != run_id || *cid <= id);
        Ok(before - tables.candidates.len())
    }

    fn get_or_create_strength(
        &mut self,
        key: &StrengthKey,
        strength: f64,
    ) -> Result<f64, StoreError> {
        let mut tables = self.lock()?;
        Ok(*tables.strengths.entry(key.clone()).or_insert(strength))
    }

    fn strengths(&mut self, run_id: &str) -> Result<Vec<(StrengthKey, f64)>, StoreError> {
        Ok(self
            .lock()?
            .strengths
            .iter()
            .filter(|(key, _)| key.run_id == run_id)
            .map(|(key, &s)| (key.clone(), s))
            .collect())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = self.lock()?.to_data();
        save_data(path, &data)?;
        debug!(
            "Flushed {} candidates to {}",
            data.candidates.len(),
            path.display()
        );
        Ok(())
    }
}

fn load_data(path: &Path) -> Result<StoreData, StoreError> {
    let content = fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let data: StoreData = serde_json::from_str(&content).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    if data.version != StoreData::CURRENT_VERSION {
        return Err(StoreError::Version {
            found: data.version,
            expected: StoreData::CURRENT_VERSION,
        });
    }
    Ok(data)
}

fn save_data(path: &Path, data: &StoreData) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = serde_json::to_string(data).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}
