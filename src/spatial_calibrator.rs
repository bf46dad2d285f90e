/// IDW Exponent Calibrator
///
/// Grid-searches the inverse-distance exponent per pollutant, scoring each
/// candidate by leave-one-out RMSE over cross-sectional snapshots drawn from
/// the most recent window of history.

use std::fs::File;
use std::path::Path;
use std::time::Instant;

use chrono::Duration;
use csv::{Reader, Writer};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{ImputationConfig, PipelineConfig};
use crate::cross_section::CrossSection;
use crate::error::Result;
use crate::idw_interpolator::{IdwKernel, Neighbor};
use crate::observation_table::{require_column, ObservationTable};
use crate::station_registry::StationRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedParameter {
    pub pollutant: String,
    pub best_p: f64,
    pub rmse: f64,
}

/// One held-out station at one timestamp: its actual value and its k nearest
/// neighbours. Distances do not depend on `p`, so folds are built once and
/// re-weighted for every candidate.
#[derive(Debug, Clone)]
struct LooFold {
    actual: f64,
    neighbors: Vec<Neighbor>,
}

#[derive(Debug, Clone)]
pub struct PollutantCalibration {
    pub parameter: CalibratedParameter,
    pub timestamps_sampled: usize,
    pub timestamps_used: usize,
    pub folds: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CalibrationTable {
    pub parameters: Vec<CalibratedParameter>,
}

impl CalibrationTable {
    pub fn get(&self, pollutant: &str) -> Option<&CalibratedParameter> {
        self.parameters.iter().find(|p| p.pollutant == pollutant)
    }

    /// Exponent to use downstream: calibrated, or the configured default when
    /// the pollutant is absent or could not be scored. Clamped to the floor.
    pub fn exponent_for(&self, pollutant: &str, config: &ImputationConfig) -> f64 {
        self.get(pollutant)
            .filter(|p| p.rmse.is_finite() && p.best_p.is_finite())
            .map(|p| p.best_p)
            .unwrap_or(config.default_exponent)
            .max(config.exponent_floor)
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = Writer::from_path(path)?;
        for param in &self.parameters {
            wtr.serialize(param)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn load_csv(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut rdr = Reader::from_reader(file);
        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
        for column in ["pollutant", "best_p", "rmse"] {
            require_column(&headers, column, "calibrated parameter")?;
        }
        let mut parameters = Vec::new();
        for result in rdr.deserialize::<CalibratedParameter>() {
            parameters.push(result?);
        }
        Ok(CalibrationTable { parameters })
    }

    pub fn print_summary(&self) {
        println!("\n🎯 IDW EXPONENT CALIBRATION");
        println!("===========================");
        for param in &self.parameters {
            println!("  {:8} p = {:.2}   RMSE = {:.4}", param.pollutant, param.best_p, param.rmse);
        }
    }
}

/// Calibrate every pollutant of `table`. Pollutants run one after another;
/// the candidate grid inside each is evaluated in parallel.
pub fn calibrate(
    table: &ObservationTable,
    registry: &StationRegistry,
    config: &PipelineConfig,
) -> CalibrationTable {
    let start_time = Instant::now();
    let parameters = (0..table.pollutants.len())
        .map(|p_idx| {
            let result = calibrate_pollutant(table, p_idx, registry, config);
            debug!(
                "{}: {} of {} sampled timestamps usable, {} folds",
                result.parameter.pollutant,
                result.timestamps_used,
                result.timestamps_sampled,
                result.folds
            );
            result.parameter
        })
        .collect();
    info!("calibration finished in {:.1}s", start_time.elapsed().as_secs_f64());
    CalibrationTable { parameters }
}

pub fn calibrate_pollutant(
    table: &ObservationTable,
    pollutant_idx: usize,
    registry: &StationRegistry,
    config: &PipelineConfig,
) -> PollutantCalibration {
    let pollutant = &table.pollutants[pollutant_idx];
    let cal = &config.calibration;
    let kernel = IdwKernel::from_config(&config.spatial);
    let grid = cal.candidate_grid();

    let window_start = table
        .datetime_range()
        .map(|(_, end)| end - Duration::days(cal.history_days));
    let snapshot = CrossSection::build(table, pollutant_idx, registry, window_start);

    let mut times = snapshot.timestamps();
    if times.len() > cal.max_timestamps {
        // Offset the seed per pollutant so each gets its own, reproducible draw.
        let mut rng = StdRng::seed_from_u64(cal.seed.wrapping_add(pollutant_idx as u64));
        let mut picked = rand::seq::index::sample(&mut rng, times.len(), cal.max_timestamps).into_vec();
        picked.sort_unstable();
        times = picked.into_iter().map(|i| times[i]).collect();
    }

    let mut folds = Vec::new();
    let mut timestamps_used = 0;
    for t in &times {
        let readings = snapshot.at(*t);
        if readings.len() < kernel.neighbors + 1 {
            continue;
        }
        timestamps_used += 1;
        for (i, target) in readings.iter().enumerate() {
            let others = readings
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, e)| (e.position, e.value));
            folds.push(LooFold {
                actual: target.value,
                neighbors: kernel.nearest(target.position, others),
            });
        }
    }
    let rmses: Vec<f64> = grid
        .par_iter()
        .map(|&p| leave_one_out_rmse(&kernel, &folds, p))
        .collect();

    let (best_idx, best_rmse) = arg_min(&rmses);
    let parameter = CalibratedParameter {
        pollutant: pollutant.clone(),
        best_p: grid[best_idx],
        rmse: best_rmse,
    };
    info!("{}: best p = {:.2} (RMSE {:.4})", pollutant, parameter.best_p, parameter.rmse);

    PollutantCalibration {
        parameter,
        timestamps_sampled: times.len(),
        timestamps_used,
        folds: folds.len(),
    }
}

/// RMSE of leave-one-out predictions; infinite when nothing could be predicted.
fn leave_one_out_rmse(kernel: &IdwKernel, folds: &[LooFold], p: f64) -> f64 {
    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for fold in folds {
        if let Some(prediction) = kernel.predict(&fold.neighbors, p) {
            let residual = prediction - fold.actual;
            sum_sq += residual * residual;
            count += 1;
        }
    }
    if count == 0 {
        f64::INFINITY
    } else {
        (sum_sq / count as f64).sqrt()
    }
}

/// First minimum in candidate order; an all-infinite slice yields index 0.
fn arg_min(values: &[f64]) -> (usize, f64) {
    let mut best = (0, values.first().copied().unwrap_or(f64::INFINITY));
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v < best.1 {
            best = (i, v);
        }
    }
    best
}
