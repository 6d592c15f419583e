//! Schema module - Configuration and record types for exploration runs.

mod config;
mod exploration;
mod material;

pub use config::*;
pub use exploration::*;
pub use material::*;
