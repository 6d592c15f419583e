//! Adaptive exploration of the structure-property space.
//!
//! # Overview
//!
//! - **Binning** (`binning`): property vectors to bin coordinates, histogram
//!   and per-bin membership
//! - **Selection** (`selection`): density-weighted parent choice favouring
//!   rare bins
//! - **Strength** (`strength`): per-bin adaptive mutation strength
//! - **Retest** (`retest`): statistical re-confirmation of parents
//! - **Generator** (`generator`): random and mutated pseudo-materials
//! - **Checkpoint** (`checkpoint`): snapshot and restart files
//! - **Engine** (`engine`): the generation loop
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use matscreen::compute::StructureSimulator;
//! use matscreen::compute::exploration::{ExplorationEngine, RunStart};
//! use matscreen::schema::RunConfig;
//! use matscreen::store::MemoryStore;
//!
//! let config = RunConfig::default();
//! let simulator = StructureSimulator::from_config(&config).unwrap();
//! let mut engine = ExplorationEngine::new(config, MemoryStore::new(), Arc::new(simulator)).unwrap();
//! let result = engine
//!     .run_with_callback(RunStart::Fresh, |progress| {
//!         println!("Generation {}: {:.1}% explored",
//!             progress.generation, progress.coverage * 100.0);
//!     })
//!     .unwrap();
//! println!("Stopped: {:?}", result.stop_reason);
//! ```

mod binning;
mod checkpoint;
mod engine;
mod generator;
mod retest;
mod selection;
mod strength;

pub use binning::{BinHistogram, BinMembership, Binner, BinningError, bin_index};
pub use checkpoint::{
    CHECKPOINT_FILE, CheckpointError, Snapshot, checkpoint_path, find_latest, keep_milestone,
    milestone_path,
};
pub use engine::{CheckpointSource, ExplorationEngine, RestartError, RunError, RunStart};
pub use generator::{StructureRng, periodic_step};
pub use retest::{Retester, relative_deviation};
pub use selection::{SelectionError, WeightedBin, select_parent, weighted_bins};
pub use strength::{
    Adjustment, DOMINANCE_RATIO, GROWTH_FACTOR, Lineage, SHRINK_FACTOR, StrengthTable,
    WIDEN_RATIO, classify_children,
};
