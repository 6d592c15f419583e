//! matscreen - Adaptive exploration of pseudo-material structure-property space.
//!
//! Candidate materials are generated, simulated and binned over a grid of
//! tracked properties. Parents are drawn with a bias toward rarely visited
//! bins and mutated with a per-bin strength that adapts to where their
//! children land, so the search keeps pushing into unexplored regions until
//! the coverage benchmarks are met.
//!
//! # Architecture
//!
//! - `schema`: Configuration and record types
//! - `compute`: Void-fraction kernel, simulation collaborators and the
//!   exploration loop (`compute::exploration`)
//! - `store`: Candidate and mutation-strength persistence
//!
//! # Example
//!
//! ```rust,no_run
//! use matscreen::compute::VoidFractionEstimator;
//! use matscreen::compute::ExclusionSphere;
//!
//! let estimator = VoidFractionEstimator::default();
//! let atoms = vec![ExclusionSphere::new(5.0, 5.0, 5.0, 2.0)];
//! let void_fraction = estimator.estimate(&atoms, [10.0, 10.0, 10.0]).unwrap();
//! println!("Void fraction: {void_fraction:.3}");
//! ```

pub mod compute;
pub mod schema;
pub mod store;

// Re-export commonly used types
pub use compute::exploration::{ExplorationEngine, RunError, RunStart};
pub use schema::{Candidate, RunConfig, Structure};
pub use store::{MaterialStore, MemoryStore};
