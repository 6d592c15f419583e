//! Configuration types for an exploration run.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Identifier stamped on every candidate and mutation-strength row.
    #[serde(default = "default_run_id")]
    pub run_id: String,
    /// Number of candidates produced per generation.
    pub children_per_generation: usize,
    /// Hard upper bound on generations (seed generation excluded).
    pub max_generations: u32,
    /// Parallel simulation workers (0 = one per core).
    #[serde(default)]
    pub num_workers: usize,
    /// Directory for checkpoints and scratch output.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Tracked property dimensions, in bin-coordinate order.
    pub properties: Vec<PropertyDimension>,
    /// Number of bins along every property dimension.
    pub bins_per_dimension: usize,
    /// Increasing coverage fractions; the run stops after the last one.
    pub benchmarks: Vec<f64>,
    /// How children are produced after the seed generation.
    #[serde(default)]
    pub generator: GeneratorType,
    /// Strength every bin starts from in generation 1.
    #[serde(default = "default_initial_strength")]
    pub initial_mutation_strength: f64,
    /// Limits for generated pseudo-materials.
    #[serde(default)]
    pub structure: StructureLimits,
    /// Statistical re-test of parents before use.
    #[serde(default)]
    pub retest: Option<RetestConfig>,
    /// Only candidates with a within-generation index below this are eligible parents.
    #[serde(default)]
    pub parent_generation_index_limit: Option<usize>,
    /// Retry policy for simulation calls.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// External simulation settings.
    #[serde(default)]
    pub simulation: SimulationSettings,
    /// Seed for the whole run (random when absent).
    #[serde(default)]
    pub random_seed: Option<u64>,
    /// Seed applied to the seed generation only.
    #[serde(default)]
    pub initial_points_random_seed: Option<u64>,
}

fn default_run_id() -> String {
    "run".to_string()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_initial_strength() -> f64 {
    0.2
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: default_run_id(),
            children_per_generation: 100,
            max_generations: 500,
            num_workers: 0,
            output_dir: default_output_dir(),
            properties: vec![
                PropertyDimension {
                    name: "void_fraction".to_string(),
                    lower: 0.0,
                    upper: 1.0,
                    source: PropertySource::GeometricVoidFraction,
                },
                PropertyDimension {
                    name: "methane_loading".to_string(),
                    lower: 0.0,
                    upper: 350.0,
                    source: PropertySource::Report(ReportField {
                        marker: "absolute [cm^3 (STP)/c".to_string(),
                        token: 6,
                        occurrence: 0,
                    }),
                },
            ],
            bins_per_dimension: 40,
            benchmarks: vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6],
            generator: GeneratorType::default(),
            initial_mutation_strength: default_initial_strength(),
            structure: StructureLimits::default(),
            retest: None,
            parent_generation_index_limit: None,
            retry: RetryPolicy::default(),
            simulation: SimulationSettings::default(),
            random_seed: None,
            initial_points_random_seed: None,
        }
    }
}

/// One tracked property dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyDimension {
    /// Property name (for logs and reports).
    pub name: String,
    /// Lower edge of bin 0.
    pub lower: f64,
    /// Upper edge; values at or above land in the last bin.
    pub upper: f64,
    /// Where the simulator obtains the value.
    pub source: PropertySource,
}

/// Source of a property value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PropertySource {
    /// Parsed from the external engine's report.
    Report(ReportField),
    /// Computed from the structure with the voxel estimator.
    GeometricVoidFraction,
}

/// Location of a value inside a fixed-format text report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportField {
    /// Substring identifying the line.
    pub marker: String,
    /// Whitespace-separated token index holding the value.
    pub token: usize,
    /// Which matching line to use (0 = first).
    #[serde(default)]
    pub occurrence: usize,
}

/// Child generation strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum GeneratorType {
    /// Every child is a fresh random material.
    Random,
    /// Children are mutated copies of selected parents.
    #[default]
    Mutate,
}

/// Bounds for pseudo-material generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureLimits {
    /// Number of distinct atom types.
    pub number_of_atom_types: usize,
    /// Lattice constant bounds.
    pub lattice_constant_limits: (f64, f64),
    /// Atoms per unit volume bounds.
    pub number_density_limits: (f64, f64),
    /// Lennard-Jones epsilon bounds.
    pub epsilon_limits: (f64, f64),
    /// Lennard-Jones sigma bounds.
    pub sigma_limits: (f64, f64),
    /// Maximum absolute partial charge.
    pub charge_limit: f64,
}

impl Default for StructureLimits {
    fn default() -> Self {
        Self {
            number_of_atom_types: 4,
            lattice_constant_limits: (13.0, 27.0),
            number_density_limits: (0.000_013, 0.015),
            epsilon_limits: (1.258, 513.264),
            sigma_limits: (1.052, 6.549),
            charge_limit: 0.0,
        }
    }
}

/// Statistical re-test settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetestConfig {
    /// Re-simulations per candidate.
    pub trials: u32,
    /// Maximum relative deviation of the mean from the recorded value.
    pub tolerance: f64,
}

impl Default for RetestConfig {
    fn default() -> Self {
        Self {
            trials: 3,
            tolerance: 0.05,
        }
    }
}

/// Bounded retry for simulation calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

/// External simulation engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Command line of the engine; required when any property is report-sourced.
    #[serde(default)]
    pub command: Vec<String>,
    /// Parent directory for per-candidate scratch directories.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Keep scratch directories after parsing.
    #[serde(default)]
    pub keep_scratch: bool,
    /// Voxel resolution (points per unit length) for geometric void fraction.
    #[serde(default = "default_points_per_unit")]
    pub points_per_unit: f64,
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("scratch")
}
fn default_points_per_unit() -> f64 {
    10.0
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            scratch_dir: default_scratch_dir(),
            keep_scratch: false,
            points_per_unit: default_points_per_unit(),
        }
    }
}

/// Upper bound on the dense histogram size.
pub const MAX_TOTAL_BINS: usize = 1 << 22;

impl RunConfig {
    /// Total number of bins in the histogram, `None` on overflow.
    pub fn total_bins(&self) -> Option<usize> {
        u32::try_from(self.properties.len())
            .ok()
            .and_then(|dims| self.bins_per_dimension.checked_pow(dims))
    }

    /// Whether any property is read from an engine report.
    pub fn needs_engine(&self) -> bool {
        self.properties
            .iter()
            .any(|p| matches!(p.source, PropertySource::Report(_)))
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.children_per_generation == 0 {
            return Err(ConfigError::NoChildren);
        }
        if self.properties.is_empty() {
            return Err(ConfigError::NoProperties);
        }
        if self.bins_per_dimension == 0 {
            return Err(ConfigError::NoBins);
        }
        match self.total_bins() {
            Some(total) if total <= MAX_TOTAL_BINS => {}
            _ => {
                return Err(ConfigError::TooManyBins {
                    bins_per_dimension: self.bins_per_dimension,
                    dimensions: self.properties.len(),
                });
            }
        }
        for p in &self.properties {
            if !(p.lower < p.upper) {
                return Err(ConfigError::InvalidRange {
                    name: p.name.clone(),
                    lower: p.lower,
                    upper: p.upper,
                });
            }
        }
        if self.benchmarks.is_empty() {
            return Err(ConfigError::NoBenchmarks);
        }
        if self.benchmarks.windows(2).any(|w| w[0] >= w[1])
            || self.benchmarks.iter().any(|b| !(*b > 0.0 && *b <= 1.0))
        {
            return Err(ConfigError::InvalidBenchmarks);
        }
        if !(self.initial_mutation_strength > 0.0) {
            return Err(ConfigError::InvalidStrength(self.initial_mutation_strength));
        }
        if let Some(retest) = &self.retest
            && (retest.trials == 0 || !(retest.tolerance > 0.0))
        {
            return Err(ConfigError::InvalidRetest);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidRetry);
        }
        if self.needs_engine() && self.simulation.command.is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        if !(self.simulation.points_per_unit > 0.0) {
            return Err(ConfigError::InvalidResolution);
        }
        self.structure.validate()
    }
}

impl StructureLimits {
    /// Validate generation bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.number_of_atom_types == 0 {
            return Err(ConfigError::NoAtomTypes);
        }
        let check = |bounds: (f64, f64), name: &str| {
            if bounds.0 > bounds.1 || bounds.0 < 0.0 {
                Err(ConfigError::InvalidBounds(format!(
                    "{} min ({}) > max ({})",
                    name, bounds.0, bounds.1
                )))
            } else {
                Ok(())
            }
        };
        check(self.lattice_constant_limits, "lattice_constant")?;
        check(self.number_density_limits, "number_density")?;
        check(self.epsilon_limits, "epsilon")?;
        check(self.sigma_limits, "sigma")?;
        if self.lattice_constant_limits.0 <= 0.0 {
            return Err(ConfigError::InvalidBounds(
                "lattice_constant must be positive".to_string(),
            ));
        }
        if self.charge_limit < 0.0 {
            return Err(ConfigError::InvalidBounds(
                "charge_limit must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("children_per_generation must be non-zero")]
    NoChildren,
    #[error("At least one property dimension is required")]
    NoProperties,
    #[error("bins_per_dimension must be non-zero")]
    NoBins,
    #[error(
        "{bins_per_dimension} bins over {dimensions} dimensions exceeds {max} histogram cells",
        max = MAX_TOTAL_BINS
    )]
    TooManyBins {
        bins_per_dimension: usize,
        dimensions: usize,
    },
    #[error("Property {name} has an empty range [{lower}, {upper})")]
    InvalidRange { name: String, lower: f64, upper: f64 },
    #[error("At least one benchmark is required")]
    NoBenchmarks,
    #[error("Benchmarks must be strictly increasing fractions in (0, 1]")]
    InvalidBenchmarks,
    #[error("Initial mutation strength must be positive, got {0}")]
    InvalidStrength(f64),
    #[error("Retest needs at least one trial and a positive tolerance")]
    InvalidRetest,
    #[error("Retry policy needs at least one attempt")]
    InvalidRetry,
    #[error("A simulation command is required for report-sourced properties")]
    MissingCommand,
    #[error("Voxel resolution must be positive")]
    InvalidResolution,
    #[error("At least one atom type is required")]
    NoAtomTypes,
    #[error("Invalid parameter bounds: {0}")]
    InvalidBounds(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometric_config() -> RunConfig {
        RunConfig {
            properties: vec![PropertyDimension {
                name: "void_fraction".to_string(),
                lower: 0.0,
                upper: 1.0,
                source: PropertySource::GeometricVoidFraction,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_needs_command() {
        let config = RunConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingCommand)));
    }

    #[test]
    fn test_geometric_config_valid() {
        assert!(geometric_config().validate().is_ok());
    }

    #[test]
    fn test_total_bins() {
        let config = RunConfig {
            bins_per_dimension: 4,
            ..RunConfig::default()
        };
        assert_eq!(config.total_bins(), Some(16));
    }

    #[test]
    fn test_rejects_oversized_histogram() {
        let overflowing = RunConfig {
            bins_per_dimension: usize::MAX,
            ..RunConfig::default()
        };
        assert_eq!(overflowing.total_bins(), None);
        assert!(matches!(
            overflowing.validate(),
            Err(ConfigError::TooManyBins { .. })
        ));

        let mut huge = geometric_config();
        huge.bins_per_dimension = 100;
        huge.properties = vec![huge.properties[0].clone(); 4];
        assert!(matches!(
            huge.validate(),
            Err(ConfigError::TooManyBins { .. })
        ));
        huge.properties.truncate(3);
        assert!(huge.validate().is_ok());
    }

    #[test]
    fn test_rejects_unsorted_benchmarks() {
        let config = RunConfig {
            benchmarks: vec![0.5, 0.2],
            ..geometric_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBenchmarks)
        ));
    }

    #[test]
    fn test_rejects_empty_range() {
        let mut config = geometric_config();
        config.properties[0].upper = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_serialization_defaults() {
        let json = r#"{
            "children_per_generation": 10,
            "max_generations": 5,
            "properties": [
                {"name": "vf", "lower": 0.0, "upper": 1.0,
                 "source": {"type": "GeometricVoidFraction"}}
            ],
            "bins_per_dimension": 4,
            "benchmarks": [0.5, 1.0]
        }"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.run_id, "run");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.generator, GeneratorType::Mutate);
        assert!(config.validate().is_ok());
    }
}
