/// Pipeline configuration
///
/// One immutable structure holding every threshold, seed and neighbour count.
/// It is loaded once (defaults, optionally overlaid by a JSON file), validated,
/// and then passed by reference into each stage.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub const DEFAULT_POLLUTANTS: [&str; 6] = ["pm2.5", "pm10", "nox", "so2", "co", "o3"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pollutants: Vec<String>,
    pub min_pollutant_columns: usize,
    /// Worker threads for the rayon pool; `None` uses every core.
    pub threads: Option<usize>,
    pub gaps: GapConfig,
    pub spatial: SpatialConfig,
    pub calibration: CalibrationConfig,
    pub imputation: ImputationConfig,
    pub coverage: CoverageConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            pollutants: DEFAULT_POLLUTANTS.iter().map(|p| p.to_string()).collect(),
            min_pollutant_columns: 5,
            threads: None,
            gaps: GapConfig::default(),
            spatial: SpatialConfig::default(),
            calibration: CalibrationConfig::default(),
            imputation: ImputationConfig::default(),
            coverage: CoverageConfig::default(),
        }
    }
}

/// Gap length thresholds in hours (inclusive upper bounds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    pub short_max_hours: usize,
    pub medium_max_hours: usize,
}

impl Default for GapConfig {
    fn default() -> Self {
        GapConfig {
            short_max_hours: 6,
            medium_max_hours: 72,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Planar distance on raw lon/lat degrees.
    Euclidean,
    /// Great-circle distance in metres.
    Haversine,
}

/// Shared by calibration and the long-gap fill so both use the same kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    pub metric: DistanceMetric,
    pub neighbors: usize,
    /// Distances below this are clamped before weighting.
    pub distance_epsilon: f64,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        SpatialConfig {
            metric: DistanceMetric::Euclidean,
            neighbors: 5,
            distance_epsilon: 1e-3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub p_min: f64,
    pub p_max: f64,
    pub p_step: f64,
    pub history_days: i64,
    pub max_timestamps: usize,
    pub seed: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            p_min: 0.20,
            p_max: 2.00,
            p_step: 0.01,
            history_days: 30,
            max_timestamps: 200,
            seed: 42,
        }
    }
}

impl CalibrationConfig {
    /// Candidate exponents in ascending order. Built from integer steps so the
    /// grid does not accumulate floating-point drift.
    pub fn candidate_grid(&self) -> Vec<f64> {
        let steps = ((self.p_max - self.p_min) / self.p_step + 1e-9).floor() as usize;
        (0..=steps)
            .map(|i| {
                let p = self.p_min + i as f64 * self.p_step;
                (p * 1e6).round() / 1e6
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImputationConfig {
    /// Lower clamp applied to every calibrated exponent before use.
    pub exponent_floor: f64,
    /// Exponent used for pollutants missing from the calibration table.
    pub default_exponent: f64,
    /// Samples of context taken on each side of a medium gap.
    pub smoothing_margin: usize,
    pub observation_variance: f64,
    pub process_variance: f64,
    pub initial_variance: f64,
}

impl Default for ImputationConfig {
    fn default() -> Self {
        ImputationConfig {
            exponent_floor: 0.2,
            default_exponent: 1.0,
            smoothing_margin: 10,
            observation_variance: 1.0,
            process_variance: 0.01,
            initial_variance: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageMode {
    /// Each pollutant is its own target: partitions are (station, year, pollutant).
    PerPollutant,
    /// One pollutant's coverage decides retention of the whole station-year.
    Target(String),
    /// All pollutants pooled per station-year.
    Pooled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    pub min_coverage: f64,
    pub mode: CoverageMode,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        CoverageConfig {
            min_coverage: 0.80,
            mode: CoverageMode::PerPollutant,
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; absent fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(PipelineError::InvalidConfig(msg.to_string()));

        if self.pollutants.is_empty() {
            return invalid("pollutant list is empty");
        }
        if self.min_pollutant_columns > self.pollutants.len() {
            return invalid("min_pollutant_columns exceeds the number of configured pollutants");
        }
        if self.gaps.short_max_hours == 0 {
            return invalid("gaps.short_max_hours must be at least 1");
        }
        if self.gaps.short_max_hours > self.gaps.medium_max_hours {
            return invalid("gaps.short_max_hours must not exceed gaps.medium_max_hours");
        }
        if self.spatial.neighbors == 0 {
            return invalid("spatial.neighbors must be at least 1");
        }
        if !(self.spatial.distance_epsilon > 0.0) {
            return invalid("spatial.distance_epsilon must be positive");
        }
        let cal = &self.calibration;
        if !(cal.p_step > 0.0) || !(cal.p_min > 0.0) || cal.p_max < cal.p_min {
            return invalid("calibration grid needs 0 < p_min <= p_max and p_step > 0");
        }
        if cal.history_days <= 0 {
            return invalid("calibration.history_days must be positive");
        }
        if cal.max_timestamps == 0 {
            return invalid("calibration.max_timestamps must be at least 1");
        }
        let imp = &self.imputation;
        if !(imp.observation_variance > 0.0) || !(imp.process_variance >= 0.0) || !(imp.initial_variance > 0.0) {
            return invalid("smoother variances must be positive (process variance may be zero)");
        }
        if !(0.0..=1.0).contains(&self.coverage.min_coverage) {
            return invalid("coverage.min_coverage must lie in [0, 1]");
        }
        if let Some(0) = self.threads {
            return invalid("threads must be at least 1");
        }
        Ok(())
    }

    /// Configured worker count, falling back to the number of logical cores.
    pub fn worker_threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grid_spans_point_two_to_two() {
        let grid = CalibrationConfig::default().candidate_grid();
        assert_eq!(grid.len(), 181);
        assert_eq!(grid[0], 0.2);
        assert_eq!(grid[1], 0.21);
        assert_eq!(*grid.last().unwrap(), 2.0);
    }

    #[test]
    fn test_defaults_validate() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{ "calibration": { "seed": 7 }, "coverage": { "mode": "pooled" } }"#).unwrap();
        assert_eq!(config.calibration.seed, 7);
        assert_eq!(config.calibration.max_timestamps, 200);
        assert_eq!(config.coverage.mode, CoverageMode::Pooled);
        assert_eq!(config.gaps.medium_max_hours, 72);
    }

    #[test]
    fn test_target_mode_from_json() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{ "coverage": { "mode": { "target": "pm2.5" } } }"#).unwrap();
        assert_eq!(config.coverage.mode, CoverageMode::Target("pm2.5".to_string()));
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut config = PipelineConfig::default();
        config.gaps.short_max_hours = 80;
        assert!(matches!(config.validate(), Err(PipelineError::InvalidConfig(_))));
    }
}
