/// Stage runners
///
/// Each stage reads its inputs from disk and writes its artifacts, so the
/// stages can be run one at a time; `run_all` chains them in memory.
///
///  observations ─► gap_classifier ─► hybrid_imputer ─► coverage_filter
///        │                                 ▲
///        └────────► spatial_calibrator ────┘

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{info, warn};

use crate::config::PipelineConfig;
use crate::coverage_filter::{filter_coverage, CoverageResult};
use crate::error::Result;
use crate::gap_classifier::{classify_gaps, ClassificationResult, GapRegistry};
use crate::hybrid_imputer::{impute, ImputationResult};
use crate::observation_table::{read_long_csv, write_long_csv, ObservationTable};
use crate::schema_validator::{check_prediction_locations, validate_station_count, MissingnessReport};
use crate::spatial_calibrator::{calibrate, CalibrationTable};
use crate::station_registry::StationRegistry;

#[derive(Debug, Clone)]
pub struct InputPaths {
    pub observations: PathBuf,
    pub stations: PathBuf,
    pub locations: Option<PathBuf>,
}

/// File names of every artifact inside the output folder.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub dir: PathBuf,
}

impl ArtifactPaths {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(ArtifactPaths { dir: dir.to_path_buf() })
    }

    pub fn trimmed(&self) -> PathBuf {
        self.dir.join("observations_trimmed.csv")
    }

    pub fn gap_summary(&self) -> PathBuf {
        self.dir.join("gap_summary.csv")
    }

    pub fn parameters(&self) -> PathBuf {
        self.dir.join("idw_p_values.csv")
    }

    pub fn imputed(&self) -> PathBuf {
        self.dir.join("observations_imputed.csv")
    }

    pub fn provenance(&self) -> PathBuf {
        self.dir.join("fill_provenance.csv")
    }

    pub fn final_table(&self) -> PathBuf {
        self.dir.join("observations_final.csv")
    }

    pub fn coverage_report(&self) -> PathBuf {
        self.dir.join("coverage_report.csv")
    }
}

/// Load both input tables and apply every fatal schema check.
pub fn load_validated(inputs: &InputPaths, config: &PipelineConfig) -> Result<(ObservationTable, StationRegistry)> {
    let table = ObservationTable::load_wide_csv(&inputs.observations, config)?;
    let registry = StationRegistry::load_csv(&inputs.stations)?;
    validate_station_count(&table, &registry)?;
    info!(
        "loaded {} stations, {} hourly rows, pollutants: {}",
        table.stations.len(),
        table.row_count(),
        table.pollutants.join(", ")
    );
    Ok((table, registry))
}

pub fn run_validate(inputs: &InputPaths, config: &PipelineConfig) -> Result<()> {
    let (table, _) = load_validated(inputs, config)?;
    MissingnessReport::from_table(&table, 5).print();
    if let Some(locations) = &inputs.locations {
        let rows = check_prediction_locations(locations)?;
        println!("  Prediction locations: {} rows", rows);
    }
    println!("\n✅ Validation complete. No data modified.");
    Ok(())
}

pub fn run_gap_stage(observations: &Path, out: &ArtifactPaths, config: &PipelineConfig) -> Result<ClassificationResult> {
    let table = ObservationTable::load_wide_csv(observations, config)?;
    let result = classify_gaps(table, &config.gaps);
    write_gap_artifacts(&result, out)?;
    result.print_summary();
    Ok(result)
}

pub fn run_calibration_stage(inputs: &InputPaths, out: &ArtifactPaths, config: &PipelineConfig) -> Result<CalibrationTable> {
    let (table, registry) = load_validated(inputs, config)?;
    let calibration = calibrate(&table, &registry, config);
    calibration.write_csv(&out.parameters())?;
    calibration.print_summary();
    Ok(calibration)
}

/// Imputation from the artifacts of the gap and calibration stages.
pub fn run_imputation_stage(
    trimmed: &Path,
    gaps: &Path,
    stations: &Path,
    parameters: &Path,
    out: &ArtifactPaths,
    config: &PipelineConfig,
) -> Result<ImputationResult> {
    let table = ObservationTable::load_wide_csv(trimmed, config)?;
    let gap_registry = GapRegistry::load_csv(gaps, &table)?;
    let registry = StationRegistry::load_csv(stations)?;
    let calibration = CalibrationTable::load_csv(parameters)?;
    impute_and_write(&table, &gap_registry, &registry, &calibration, out, config)
}

pub fn run_coverage_stage(imputed: &Path, out: &ArtifactPaths, config: &PipelineConfig) -> Result<CoverageResult> {
    let rows = read_long_csv(imputed)?;
    coverage_and_write(rows, out, config)
}

/// Whole chain in memory, writing every artifact along the way.
pub fn run_all(inputs: &InputPaths, out: &ArtifactPaths, config: &PipelineConfig) -> Result<CoverageResult> {
    let start_time = Instant::now();
    let (table, registry) = load_validated(inputs, config)?;
    MissingnessReport::from_table(&table, 5).print();

    let calibration = calibrate(&table, &registry, config);
    calibration.write_csv(&out.parameters())?;
    calibration.print_summary();

    let classified = classify_gaps(table, &config.gaps);
    write_gap_artifacts(&classified, out)?;
    classified.print_summary();

    let imputed = impute_and_write(
        &classified.trimmed,
        &classified.registry,
        &registry,
        &calibration,
        out,
        config,
    )?;
    let coverage = coverage_and_write(imputed.table.to_long_rows(), out, config)?;

    println!("\n⏱️  Pipeline finished in {:.1}s", start_time.elapsed().as_secs_f64());
    println!("📁 Artifacts written to: {}", out.dir.display());
    Ok(coverage)
}

fn write_gap_artifacts(result: &ClassificationResult, out: &ArtifactPaths) -> Result<()> {
    result.trimmed.write_wide_csv(&out.trimmed())?;
    result.registry.write_csv(&out.gap_summary())?;
    Ok(())
}

fn impute_and_write(
    trimmed: &ObservationTable,
    gaps: &GapRegistry,
    registry: &StationRegistry,
    calibration: &CalibrationTable,
    out: &ArtifactPaths,
    config: &PipelineConfig,
) -> Result<ImputationResult> {
    for series in &trimmed.stations {
        if registry.get(&series.station_id).is_none() {
            warn!("station {} has no coordinates; its long gaps cannot be filled", series.station_id);
        }
    }
    let result = impute(trimmed, gaps, registry, calibration, config);
    write_long_csv(&result.table.to_long_rows(), &out.imputed())?;
    result.write_provenance_csv(&out.provenance())?;
    result.stats.print();
    Ok(result)
}

fn coverage_and_write(
    rows: Vec<crate::observation_table::LongRow>,
    out: &ArtifactPaths,
    config: &PipelineConfig,
) -> Result<CoverageResult> {
    let result = filter_coverage(rows, &config.coverage);
    write_long_csv(&result.rows, &out.final_table())?;
    result.write_records_csv(&out.coverage_report())?;
    result.print_summary(config.coverage.min_coverage);
    Ok(result)
}
