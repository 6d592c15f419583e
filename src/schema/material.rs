//! Candidate material records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discrete bin coordinate, one index per tracked property.
pub type BinCoord = Vec<usize>;

/// Lennard-Jones parameters of one atom type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomType {
    /// Well depth.
    pub epsilon: f64,
    /// Diameter; also used as the probe-exclusion radius.
    pub sigma: f64,
}

/// One atom site in fractional coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomSite {
    /// Index into [`Structure::atom_types`].
    pub atom_type: usize,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Partial charge.
    pub q: f64,
}

/// Orthorhombic pseudo-material unit cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    /// Lattice constants.
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub atom_types: Vec<AtomType>,
    pub atom_sites: Vec<AtomSite>,
    /// Atoms per unit volume the structure was generated with.
    pub number_density: f64,
}

impl Structure {
    /// Unit cell volume.
    pub fn volume(&self) -> f64 {
        self.a * self.b * self.c
    }

    /// Sum of partial charges.
    pub fn net_charge(&self) -> f64 {
        self.atom_sites.iter().map(|s| s.q).sum()
    }
}

/// Outcome of the statistical re-test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RetestStatus {
    /// Not yet tested, or trials still outstanding.
    #[default]
    Untested,
    Passed,
    Failed,
}

/// Running re-test accumulators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RetestRecord {
    pub status: RetestStatus,
    /// Number of completed trials.
    pub count: u32,
    /// Per-property sums of trial results.
    pub sums: Vec<f64>,
}

/// A generated, simulated and classified material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Sequential id, starting at 1.
    pub id: u64,
    /// Globally unique token.
    pub uuid: Uuid,
    /// Run this candidate belongs to.
    pub run_id: String,
    /// Parent id; `None` for seed candidates.
    pub parent_id: Option<u64>,
    /// Generation the candidate was produced in.
    pub generation: u32,
    /// Position within its generation.
    pub generation_index: usize,
    /// The simulated structure.
    pub structure: Structure,
    /// Simulated property values, in dimension order.
    pub properties: Vec<f64>,
    /// Bin coordinate of `properties`.
    pub bin: BinCoord,
    /// Re-test state.
    #[serde(default)]
    pub retest: RetestRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_and_charge() {
        let structure = Structure {
            a: 10.0,
            b: 20.0,
            c: 30.0,
            atom_types: vec![AtomType {
                epsilon: 1.0,
                sigma: 2.5,
            }],
            atom_sites: vec![
                AtomSite {
                    atom_type: 0,
                    x: 0.5,
                    y: 0.25,
                    z: 0.1,
                    q: 0.3,
                },
                AtomSite {
                    atom_type: 0,
                    x: 0.1,
                    y: 0.2,
                    z: 0.3,
                    q: -0.3,
                },
            ],
            number_density: 0.0,
        };
        assert!((structure.volume() - 6000.0).abs() < 1e-9);
        assert!(structure.net_charge().abs() < 1e-12);
    }
}
