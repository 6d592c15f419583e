//! Compute module - Numerical kernels, simulation and the exploration loop.

mod report;
mod simulation;
mod void_fraction;

pub mod exploration;

pub use report::*;
pub use simulation::*;
pub use void_fraction::*;
