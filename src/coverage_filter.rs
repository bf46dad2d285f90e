/// Coverage filter
///
/// Post-imputation quality gate: partitions the long table by station and
/// calendar year, computes the fraction of non-missing target values, and
/// keeps only partitions at or above the threshold. Rows are filtered, never
/// changed, and their order is preserved.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::Datelike;
use csv::Writer;
use log::info;
use serde::Serialize;

use crate::config::{CoverageConfig, CoverageMode};
use crate::error::Result;
use crate::observation_table::LongRow;

/// (station, year, pollutant); the pollutant is `None` when the whole
/// station-year is one partition.
type PartitionKey = (String, i32, Option<String>);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageRecord {
    pub station_id: String,
    pub year: i32,
    pub pollutant: String,
    pub valid: usize,
    pub total: usize,
    pub coverage: f64,
    pub retained: bool,
}

#[derive(Debug, Clone)]
pub struct CoverageResult {
    pub rows: Vec<LongRow>,
    pub records: Vec<CoverageRecord>,
    pub rows_before: usize,
}

impl CoverageResult {
    pub fn stations_retained(&self) -> usize {
        self.rows.iter().map(|r| r.station_id.as_str()).collect::<BTreeSet<_>>().len()
    }

    pub fn missing_percent(&self) -> f64 {
        if self.rows.is_empty() {
            return 0.0;
        }
        let missing = self.rows.iter().filter(|r| r.value.is_none()).count();
        missing as f64 / self.rows.len() as f64 * 100.0
    }

    pub fn write_records_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = Writer::from_path(path)?;
        for record in &self.records {
            wtr.serialize(record)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn print_summary(&self, threshold: f64) {
        let kept = self.records.iter().filter(|r| r.retained).count();
        println!("\n✂️  COVERAGE FILTER");
        println!("==================");
        println!(
            "  Keeping {} of {} partitions with ≥ {:.0}% coverage",
            kept,
            self.records.len(),
            threshold * 100.0
        );
        println!("  Rows:     {} → {}", self.rows_before, self.rows.len());
        println!("  Stations: {}", self.stations_retained());
        println!("  Remaining missing: {:.2}%", self.missing_percent());
    }
}

fn partition_label(key: &PartitionKey, mode: &CoverageMode) -> String {
    match (&key.2, mode) {
        (Some(pollutant), _) => pollutant.clone(),
        (None, CoverageMode::Target(target)) => target.clone(),
        (None, _) => "all".to_string(),
    }
}

/// Key a row is counted under; `None` when the row does not contribute to any
/// coverage figure (non-target pollutants in target mode).
fn counting_key(row: &LongRow, mode: &CoverageMode) -> Option<PartitionKey> {
    let year = row.datetime.year();
    match mode {
        CoverageMode::PerPollutant => Some((row.station_id.clone(), year, Some(row.pollutant.clone()))),
        CoverageMode::Target(target) => {
            (row.pollutant == *target).then(|| (row.station_id.clone(), year, None))
        }
        CoverageMode::Pooled => Some((row.station_id.clone(), year, None)),
    }
}

/// Key that decides whether a row survives.
fn retention_key(row: &LongRow, mode: &CoverageMode) -> PartitionKey {
    let year = row.datetime.year();
    match mode {
        CoverageMode::PerPollutant => (row.station_id.clone(), year, Some(row.pollutant.clone())),
        CoverageMode::Target(_) | CoverageMode::Pooled => (row.station_id.clone(), year, None),
    }
}

pub fn filter_coverage(rows: Vec<LongRow>, config: &CoverageConfig) -> CoverageResult {
    let mode = &config.mode;
    let mut counts: BTreeMap<PartitionKey, (usize, usize)> = BTreeMap::new();
    for row in &rows {
        if let Some(key) = counting_key(row, mode) {
            let entry = counts.entry(key).or_insert((0, 0));
            if row.value.is_some() {
                entry.0 += 1;
            }
            entry.1 += 1;
        }
    }

    let mut retained: BTreeSet<PartitionKey> = BTreeSet::new();
    let records: Vec<CoverageRecord> = counts
        .into_iter()
        .map(|(key, (valid, total))| {
            let coverage = valid as f64 / total as f64;
            let keep = coverage >= config.min_coverage;
            let record = CoverageRecord {
                station_id: key.0.clone(),
                year: key.1,
                pollutant: partition_label(&key, mode),
                valid,
                total,
                coverage,
                retained: keep,
            };
            if keep {
                retained.insert(key);
            }
            record
        })
        .collect();

    let rows_before = rows.len();
    let rows: Vec<LongRow> = rows
        .into_iter()
        .filter(|row| retained.contains(&retention_key(row, mode)))
        .collect();

    info!(
        "coverage filter kept {} of {} partitions ({} -> {} rows)",
        retained.len(),
        records.len(),
        rows_before,
        rows.len()
    );

    CoverageResult {
        rows,
        records,
        rows_before,
    }
}
