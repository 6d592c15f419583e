//! Geometric void fraction by voxelization of a periodic unit cell.
//!
//! The cell is discretized into `a·res × b·res × c·res` voxels. Every atom
//! fills the voxels whose centers lie strictly inside its exclusion sphere,
//! honoring periodic wrap-around. The void fraction is the share of voxels
//! left empty.

use crate::schema::Structure;

/// Default sampling resolution (points per unit length).
pub const DEFAULT_POINTS_PER_UNIT: f64 = 10.0;

/// An atom center with its probe-exclusion radius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExclusionSphere {
    /// Cartesian center, assumed relative to the cell origin.
    pub center: [f64; 3],
    pub radius: f64,
}

impl ExclusionSphere {
    pub fn new(x: f64, y: f64, z: f64, radius: f64) -> Self {
        Self {
            center: [x, y, z],
            radius,
        }
    }

    /// Spheres of a structure: fractional positions scaled by the lattice,
    /// radius taken from the atom type's sigma.
    pub fn from_structure(structure: &Structure) -> Vec<Self> {
        structure
            .atom_sites
            .iter()
            .filter_map(|site| {
                structure.atom_types.get(site.atom_type).map(|t| {
                    Self::new(
                        site.x * structure.a,
                        site.y * structure.b,
                        site.z * structure.c,
                        t.sigma,
                    )
                })
            })
            .collect()
    }
}

/// Errors from the voxel estimator.
#[derive(Debug, thiserror::Error)]
pub enum VoidFractionError {
    #[error("Cell edge lengths must be positive and finite, got {0:?}")]
    InvalidCell([f64; 3]),
    #[error("Resolution must be positive and finite, got {0}")]
    InvalidResolution(f64),
}

/// Voxel-based void fraction estimator.
#[derive(Debug, Clone, Copy)]
pub struct VoidFractionEstimator {
    points_per_unit: f64,
}

impl Default for VoidFractionEstimator {
    fn default() -> Self {
        Self {
            points_per_unit: DEFAULT_POINTS_PER_UNIT,
        }
    }
}

/// One axis of the voxel grid.
#[derive(Debug, Clone, Copy)]
struct Axis {
    length: f64,
    cells: usize,
    step: f64,
}

impl Axis {
    fn new(length: f64, points_per_unit: f64) -> Self {
        let cells = ((length * points_per_unit).round() as usize).max(1);
        Self {
            length,
            cells,
            step: length / cells as f64,
        }
    }

    /// Voxel indices touched by a sphere along this axis, paired with the
    /// squared center displacement. The window never spans more than one
    /// period; when the sphere is wider than the cell every index is visited
    /// once using the minimum-image displacement.
    fn window(&self, center: f64, radius: f64, out: &mut Vec<(usize, f64)>) {
        out.clear();
        let n = self.cells as i64;
        let reach = (radius / self.step).ceil();
        // Compared in f64: huge or infinite radii saturate the integer cast.
        if 2.0 * reach + 1.0 >= n as f64 {
            for i in 0..self.cells {
                let mut d = (i as f64 + 0.5) * self.step - center;
                d -= self.length * (d / self.length).round();
                out.push((i, d * d));
            }
        } else {
            let reach = reach as i64;
            let origin = (center / self.step).floor() as i64;
            for k in (origin - reach)..=(origin + reach) {
                let d = (k as f64 + 0.5) * self.step - center;
                out.push((k.rem_euclid(n) as usize, d * d));
            }
        }
    }
}

impl VoidFractionEstimator {
    /// Create an estimator with the given resolution.
    pub fn new(points_per_unit: f64) -> Result<Self, VoidFractionError> {
        if !(points_per_unit.is_finite() && points_per_unit > 0.0) {
            return Err(VoidFractionError::InvalidResolution(points_per_unit));
        }
        Ok(Self { points_per_unit })
    }

    /// Resolution in points per unit length.
    pub fn points_per_unit(&self) -> f64 {
        self.points_per_unit
    }

    /// Fraction of the cell `(a, b, c)` not covered by any sphere.
    pub fn estimate(
        &self,
        spheres: &[ExclusionSphere],
        cell: [f64; 3],
    ) -> Result<f64, VoidFractionError> {
        if cell.iter().any(|l| !(l.is_finite() && *l > 0.0)) {
            return Err(VoidFractionError::InvalidCell(cell));
        }

        let axes = cell.map(|l| Axis::new(l, self.points_per_unit));
        let [nx, ny, nz] = axes.map(|a| a.cells);
        let total = nx * ny * nz;
        let mut filled = vec![false; total];

        let mut xs = Vec::new();
        let mut ys = Vec::new();
        let mut zs = Vec::new();

        for sphere in spheres {
            if !(sphere.radius > 0.0) {
                continue;
            }
            let r2 = sphere.radius * sphere.radius;
            axes[0].window(sphere.center[0], sphere.radius, &mut xs);
            axes[1].window(sphere.center[1], sphere.radius, &mut ys);
            axes[2].window(sphere.center[2], sphere.radius, &mut zs);

            for &(ix, dx2) in &xs {
                if dx2 >= r2 {
                    continue;
                }
                for &(iy, dy2) in &ys {
                    let dxy2 = dx2 + dy2;
                    if dxy2 >= r2 {
                        continue;
                    }
                    let row = (ix * ny + iy) * nz;
                    for &(iz, dz2) in &zs {
                        if dxy2 + dz2 < r2 {
                            filled[row + iz] = true;
                        }
                    }
                }
            }
        }

        let count = filled.iter().filter(|&&f| f).count();
        Ok(1.0 - count as f64 / total as f64)
    }

    /// Void fraction of a structure's unit cell.
    pub fn estimate_structure(&self, structure: &Structure) -> Result<f64, VoidFractionError> {
        self.estimate(
            &ExclusionSphere::from_structure(structure),
            [structure.a, structure.b, structure.c],
        )
    }
}
