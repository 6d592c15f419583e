//! Property simulation collaborators.
//!
//! A [`Simulator`] turns a generated structure into its property vector.
//! [`StructureSimulator`] is the production implementation: it drives the
//! external engine as a subprocess for report-sourced properties and uses
//! the voxel estimator for geometric void fraction.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, warn};
use uuid::Uuid;

use crate::schema::{PropertySource, ReportField, RetryPolicy, RunConfig, Structure};

use super::report::{self, ReportError};
use super::void_fraction::{VoidFractionError, VoidFractionEstimator};

/// Simulation failures. All of them are transient from the engine's
/// point of view and may be retried.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("Scratch directory {path}: {source}")]
    Scratch {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to launch engine {command:?}: {source}")]
    Launch {
        command: String,
        source: std::io::Error,
    },
    #[error("Engine exited with {status}")]
    EngineFailed { status: String },
    #[error("Report parse failed: {0}")]
    Report(#[from] ReportError),
    #[error("Void fraction failed: {0}")]
    VoidFraction(#[from] VoidFractionError),
    #[error("Structure serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Simulator returned {got} properties, expected {expected}")]
    PropertyCount { expected: usize, got: usize },
    #[error("{0}")]
    Other(String),
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<SimulationError>,
    },
}

/// Produces the tracked property vector of a structure.
pub trait Simulator: Send + Sync {
    fn simulate(&self, uuid: Uuid, structure: &Structure) -> Result<Vec<f64>, SimulationError>;
}

impl<F> Simulator for F
where
    F: Fn(Uuid, &Structure) -> Result<Vec<f64>, SimulationError> + Send + Sync,
{
    fn simulate(&self, uuid: Uuid, structure: &Structure) -> Result<Vec<f64>, SimulationError> {
        self(uuid, structure)
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds or `max_attempts` is used up.
    pub fn run<T, F>(&self, label: &str, mut op: F) -> Result<T, SimulationError>
    where
        F: FnMut(u32) -> Result<T, SimulationError>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    warn!("{label}: attempt {attempt}/{attempts} failed: {e}");
                    attempt += 1;
                }
                Err(e) => {
                    return Err(SimulationError::RetriesExhausted {
                        attempts,
                        last: Box::new(e),
                    });
                }
            }
        }
    }
}

/// Simulate with the retry policy and check the property count.
pub fn simulate_with_retry(
    simulator: &dyn Simulator,
    policy: &RetryPolicy,
    expected: usize,
    uuid: Uuid,
    structure: &Structure,
) -> Result<Vec<f64>, SimulationError> {
    policy.run(&format!("simulate {uuid}"), |_| {
        let values = simulator.simulate(uuid, structure)?;
        if values.len() != expected {
            return Err(SimulationError::PropertyCount {
                expected,
                got: values.len(),
            });
        }
        Ok(values)
    })
}

/// Simulator backed by the external engine and the voxel estimator.
#[derive(Debug, Clone)]
pub struct StructureSimulator {
    sources: Vec<PropertySource>,
    command: Vec<String>,
    scratch_dir: PathBuf,
    keep_scratch: bool,
    estimator: VoidFractionEstimator,
}

impl StructureSimulator {
    /// Build from a run configuration.
    pub fn from_config(config: &RunConfig) -> Result<Self, SimulationError> {
        Ok(Self {
            sources: config.properties.iter().map(|p| p.source.clone()).collect(),
            command: config.simulation.command.clone(),
            scratch_dir: config.simulation.scratch_dir.clone(),
            keep_scratch: config.simulation.keep_scratch,
            estimator: VoidFractionEstimator::new(config.simulation.points_per_unit)?,
        })
    }

    fn report_fields(&self) -> Vec<&ReportField> {
        self.sources
            .iter()
            .filter_map(|s| match s {
                PropertySource::Report(field) => Some(field),
                PropertySource::GeometricVoidFraction => None,
            })
            .collect()
    }

    /// Run the engine in a fresh scratch directory and parse its report.
    fn run_engine(
        &self,
        uuid: Uuid,
        structure: &Structure,
        fields: &[&ReportField],
    ) -> Result<Vec<f64>, SimulationError> {
        let dir = self
            .scratch_dir
            .join(format!("output_{}_{}", uuid, Uuid::new_v4()));
        fs::create_dir_all(&dir).map_err(|source| SimulationError::Scratch {
            path: dir.clone(),
            source,
        })?;
        debug!("Scratch directory: {}", dir.display());

        let result = self.run_in(&dir, structure, fields);

        if !self.keep_scratch
            && let Err(e) = fs::remove_dir_all(&dir)
        {
            warn!("Could not remove scratch directory {}: {e}", dir.display());
        }
        result
    }

    fn run_in(
        &self,
        dir: &Path,
        structure: &Structure,
        fields: &[&ReportField],
    ) -> Result<Vec<f64>, SimulationError> {
        let structure_path = dir.join("structure.json");
        fs::write(&structure_path, serde_json::to_string_pretty(structure)?).map_err(
            |source| SimulationError::Scratch {
                path: structure_path.clone(),
                source,
            },
        )?;

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| SimulationError::Other("No engine command configured".to_string()))?;

        let status = Command::new(program)
            .args(args)
            .current_dir(dir)
            .status()
            .map_err(|source| SimulationError::Launch {
                command: program.clone(),
                source,
            })?;
        if !status.success() {
            return Err(SimulationError::EngineFailed {
                status: status.to_string(),
            });
        }

        let report_path = report::find_report(dir)?;
        Ok(report::parse_report(&report_path, fields)?)
    }
}

impl Simulator for StructureSimulator {
    fn simulate(&self, uuid: Uuid, structure: &Structure) -> Result<Vec<f64>, SimulationError> {
        let fields = self.report_fields();
        let reported = if fields.is_empty() {
            Vec::new()
        } else {
            self.run_engine(uuid, structure, &fields)?
        };

        let mut reported = reported.into_iter();
        let mut geometric = None;
        let mut values = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let value = match source {
                PropertySource::Report(_) => reported.next().ok_or_else(|| {
                    SimulationError::Other("Report returned too few values".to_string())
                })?,
                PropertySource::GeometricVoidFraction => match geometric {
                    Some(v) => v,
                    None => {
                        let v = self.estimator.estimate_structure(structure)?;
                        geometric = Some(v);
                        v
                    }
                },
            };
            values.push(value);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AtomSite, AtomType, PropertyDimension};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tiny_structure() -> Structure {
        Structure {
            a: 4.0,
            b: 4.0,
            c: 4.0,
            atom_types: vec![AtomType {
                epsilon: 1.0,
                sigma: 1.0,
            }],
            atom_sites: vec![AtomSite {
                atom_type: 0,
                x: 0.5,
                y: 0.5,
                z: 0.5,
                q: 0.0,
            }],
            number_density: 1.0 / 64.0,
        }
    }

    #[test]
    fn test_retry_recovers_from_transient_failure() {
        let calls = AtomicU32::new(0);
        let sim = |_: Uuid, _: &Structure| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SimulationError::Other("flaky".to_string()))
            } else {
                Ok(vec![0.5])
            }
        };
        let policy = RetryPolicy { max_attempts: 3 };
        let values =
            simulate_with_retry(&sim, &policy, 1, Uuid::new_v4(), &tiny_structure()).unwrap();
        assert_eq!(values, vec![0.5]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_is_bounded() {
        let calls = AtomicU32::new(0);
        let sim = |_: Uuid, _: &Structure| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<Vec<f64>, _>(SimulationError::Other("down".to_string()))
        };
        let policy = RetryPolicy { max_attempts: 4 };
        let err =
            simulate_with_retry(&sim, &policy, 1, Uuid::new_v4(), &tiny_structure()).unwrap_err();
        assert!(matches!(
            err,
            SimulationError::RetriesExhausted { attempts: 4, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_property_count_mismatch_is_an_error() {
        let sim = |_: Uuid, _: &Structure| Ok::<_, SimulationError>(vec![0.1, 0.2]);
        let policy = RetryPolicy { max_attempts: 1 };
        let err =
            simulate_with_retry(&sim, &policy, 1, Uuid::new_v4(), &tiny_structure()).unwrap_err();
        match err {
            SimulationError::RetriesExhausted { last, .. } => {
                assert!(matches!(*last, SimulationError::PropertyCount { .. }))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_geometric_only_simulator() {
        let config = RunConfig {
            properties: vec![PropertyDimension {
                name: "void_fraction".to_string(),
                lower: 0.0,
                upper: 1.0,
                source: PropertySource::GeometricVoidFraction,
            }],
            ..Default::default()
        };
        let sim = StructureSimulator::from_config(&config).unwrap();
        let values = sim.simulate(Uuid::new_v4(), &tiny_structure()).unwrap();
        assert_eq!(values.len(), 1);
        let expected = 1.0 - 4.0 / 3.0 * std::f64::consts::PI / 64.0;
        assert!((values[0] - expected).abs() < 0.01 * expected);
    }
}
