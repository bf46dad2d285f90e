/// Gap classification
///
/// Finds each station's structural start (first hour at which any pollutant
/// has a value), drops everything before it, and run-length encodes the
/// remaining missing stretches of every (station, pollutant) series into
/// classified gap records. No values are filled here.

use std::collections::BTreeMap;
use std::ops::Range;
use std::fs::File;
use std::path::Path;

use chrono::NaiveDateTime;
use csv::{Reader, Writer};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::GapConfig;
use crate::error::Result;
use crate::observation_table::{datetime_format, require_column, ObservationTable, StationSeries};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapType {
    Short,
    Medium,
    Long,
}

impl GapType {
    pub fn classify(length_hours: usize, config: &GapConfig) -> Self {
        if length_hours <= config.short_max_hours {
            GapType::Short
        } else if length_hours <= config.medium_max_hours {
            GapType::Medium
        } else {
            GapType::Long
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GapType::Short => "short",
            GapType::Medium => "medium",
            GapType::Long => "long",
        }
    }
}

/// One maximal run of missing hours. `start_time`/`end_time` are the first
/// and last missing hours; `indices` is the half-open grid range.
#[derive(Debug, Clone, PartialEq)]
pub struct Gap {
    pub station_id: String,
    pub pollutant: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub gap_hours: usize,
    pub gap_type: GapType,
    pub indices: Range<usize>,
}

/// Registry row as written to `gap_summary.csv`.
#[derive(Debug, Serialize)]
struct GapRow<'a> {
    station_id: &'a str,
    pollutant: &'a str,
    #[serde(with = "datetime_format")]
    start_time: NaiveDateTime,
    #[serde(with = "datetime_format")]
    end_time: NaiveDateTime,
    gap_hours: usize,
    gap_type: GapType,
}

/// Registry row as read back from `gap_summary.csv`.
#[derive(Debug, Deserialize)]
struct GapRecord {
    station_id: String,
    pollutant: String,
    #[serde(with = "datetime_format")]
    start_time: NaiveDateTime,
    #[serde(with = "datetime_format")]
    end_time: NaiveDateTime,
    gap_hours: usize,
    gap_type: GapType,
}

/// Maximal runs of `None` as half-open index ranges.
pub fn find_missing_runs(values: &[Option<f64>]) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut i = 0;
    while i < values.len() {
        if values[i].is_none() {
            let start = i;
            while i < values.len() && values[i].is_none() {
                i += 1;
            }
            runs.push(start..i);
        } else {
            i += 1;
        }
    }
    runs
}

/// Ordered by station, then pollutant (table order), then start.
#[derive(Debug, Clone, Default)]
pub struct GapRegistry {
    gaps: Vec<Gap>,
}

impl GapRegistry {
    pub fn from_gaps(gaps: Vec<Gap>) -> Self {
        GapRegistry { gaps }
    }

    pub fn len(&self) -> usize {
        self.gaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gaps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gap> {
        self.gaps.iter()
    }

    /// Gaps grouped per (station, pollutant) work unit.
    pub fn by_unit(&self) -> BTreeMap<(&str, &str), Vec<&Gap>> {
        let mut units: BTreeMap<(&str, &str), Vec<&Gap>> = BTreeMap::new();
        for gap in self.iter() {
            units
                .entry((gap.station_id.as_str(), gap.pollutant.as_str()))
                .or_default()
                .push(gap);
        }
        units
    }

    pub fn type_counts(&self) -> BTreeMap<GapType, usize> {
        let mut counts = BTreeMap::new();
        for gap in self.iter() {
            *counts.entry(gap.gap_type).or_insert(0) += 1;
        }
        counts
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = Writer::from_path(path)?;
        for gap in &self.gaps {
            wtr.serialize(GapRow {
                station_id: &gap.station_id,
                pollutant: &gap.pollutant,
                start_time: gap.start_time,
                end_time: gap.end_time,
                gap_hours: gap.gap_hours,
                gap_type: gap.gap_type,
            })?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Read a registry written by [`GapRegistry::write_csv`] and re-anchor every
    /// gap on the grid of `table`. Rows that name an unknown station or
    /// pollutant, or that fall off the station's grid, are skipped.
    pub fn load_csv(path: &Path, table: &ObservationTable) -> Result<Self> {
        let file = File::open(path)?;
        let mut rdr = Reader::from_reader(file);
        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
        for column in ["station_id", "pollutant", "start_time", "end_time", "gap_hours", "gap_type"] {
            require_column(&headers, column, "gap registry")?;
        }

        let mut gaps = Vec::new();
        let mut skipped = 0usize;
        for result in rdr.deserialize::<GapRecord>() {
            let record = result?;
            let series = table.stations.iter().find(|s| s.station_id == record.station_id);
            let indices = series
                .filter(|_| table.pollutants.contains(&record.pollutant))
                .and_then(|s| grid_range(s, &record));
            match indices {
                Some(indices) => gaps.push(Gap {
                    station_id: record.station_id,
                    pollutant: record.pollutant,
                    start_time: record.start_time,
                    end_time: record.end_time,
                    gap_hours: record.gap_hours,
                    gap_type: record.gap_type,
                    indices,
                }),
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!("{} gap registry rows do not match the observation table; skipped", skipped);
        }
        Ok(GapRegistry { gaps })
    }
}

/// Half-open grid range of a registry row, if it lies on the series grid.
fn grid_range(series: &StationSeries, record: &GapRecord) -> Option<Range<usize>> {
    let first = *series.timestamps.first()?;
    let offset = usize::try_from((record.start_time - first).num_hours()).ok()?;
    let range = offset..offset + record.gap_hours;
    let on_grid = record.gap_hours > 0
        && series.timestamps.get(range.start) == Some(&record.start_time)
        && series.timestamps.get(range.end - 1) == Some(&record.end_time);
    on_grid.then_some(range)
}

#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub trimmed: ObservationTable,
    pub registry: GapRegistry,
    /// Stations with no valid observation for any pollutant.
    pub dropped_stations: Vec<String>,
    pub rows_before: usize,
    pub rows_after: usize,
}

impl ClassificationResult {
    pub fn print_summary(&self) {
        println!("\n🔍 GAP ANALYSIS");
        println!("===============");
        println!("  Rows before trimming: {}", self.rows_before);
        println!("  Rows after trimming:  {}", self.rows_after);
        if !self.dropped_stations.is_empty() {
            println!("  Dropped empty stations: {}", self.dropped_stations.join(", "));
        }
        if self.registry.is_empty() {
            println!("  No gaps after trimming");
            return;
        }
        println!("  Gap type distribution ({} gaps):", self.registry.len());
        for (gap_type, count) in self.registry.type_counts() {
            println!("    {:7} {}", gap_type.as_str(), count);
        }
    }
}

/// Trim structural missingness and register every remaining gap.
pub fn classify_gaps(table: ObservationTable, config: &GapConfig) -> ClassificationResult {
    let rows_before = table.row_count();
    let pollutants = table.pollutants;

    let per_station: Vec<std::result::Result<(StationSeries, Vec<Gap>), String>> = table
        .stations
        .into_par_iter()
        .map(|series| trim_and_scan(series, &pollutants, config))
        .collect();

    let mut stations = Vec::new();
    let mut gaps = Vec::new();
    let mut dropped_stations = Vec::new();

    for outcome in per_station {
        match outcome {
            Ok((series, station_gaps)) => {
                stations.push(series);
                gaps.extend(station_gaps);
            }
            Err(station_id) => {
                warn!("station {} has no valid observations; dropped", station_id);
                dropped_stations.push(station_id);
            }
        }
    }

    let trimmed = ObservationTable { pollutants, stations };
    let rows_after = trimmed.row_count();
    info!(
        "gap classification: {} -> {} rows, {} gaps registered",
        rows_before,
        rows_after,
        gaps.len()
    );

    ClassificationResult {
        trimmed,
        registry: GapRegistry::from_gaps(gaps),
        dropped_stations,
        rows_before,
        rows_after,
    }
}

fn trim_and_scan(
    mut series: StationSeries,
    pollutants: &[String],
    config: &GapConfig,
) -> std::result::Result<(StationSeries, Vec<Gap>), String> {
    let Some(start) = series.first_observed_index() else {
        return Err(series.station_id);
    };
    series.truncate_front(start);

    let mut gaps = Vec::new();
    for (p_idx, pollutant) in pollutants.iter().enumerate() {
        for run in find_missing_runs(&series.columns[p_idx]) {
            let gap_hours = run.len();
            gaps.push(Gap {
                station_id: series.station_id.clone(),
                pollutant: pollutant.clone(),
                start_time: series.timestamps[run.start],
                end_time: series.timestamps[run.end - 1],
                gap_hours,
                gap_type: GapType::classify(gap_hours, config),
                indices: run,
            });
        }
    }
    Ok((series, gaps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation_table::RawObservation;
    use chrono::{Duration, NaiveDate};

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 3, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn table_from(columns: &[(&str, Vec<Vec<Option<f64>>>)]) -> ObservationTable {
        let mut rows = Vec::new();
        for (station, per_hour) in columns {
            for (h, values) in per_hour.iter().enumerate() {
                rows.push(RawObservation {
                    station_id: station.to_string(),
                    datetime: t0() + Duration::hours(h as i64),
                    values: values.clone(),
                });
            }
        }
        ObservationTable::from_observations(vec!["pm10".into(), "o3".into()], rows)
    }

    #[test]
    fn test_thresholds() {
        let config = GapConfig::default();
        assert_eq!(GapType::classify(1, &config), GapType::Short);
        assert_eq!(GapType::classify(6, &config), GapType::Short);
        assert_eq!(GapType::classify(7, &config), GapType::Medium);
        assert_eq!(GapType::classify(72, &config), GapType::Medium);
        assert_eq!(GapType::classify(73, &config), GapType::Long);
    }

    #[test]
    fn test_missing_runs_are_maximal() {
        let values = vec![None, Some(1.0), None, None, Some(2.0), None];
        assert_eq!(find_missing_runs(&values), vec![0..1, 2..4, 5..6]);
        assert!(find_missing_runs(&[Some(1.0)]).is_empty());
    }

    #[test]
    fn test_structural_start_uses_any_pollutant() {
        let table = table_from(&[(
            "A",
            vec![
                vec![None, None],
                vec![None, Some(3.0)],
                vec![Some(1.0), Some(4.0)],
                vec![None, Some(5.0)],
                vec![Some(2.0), Some(6.0)],
            ],
        )]);
        let result = classify_gaps(table, &GapConfig::default());
        let series = &result.trimmed.stations[0];
        assert_eq!(series.timestamps[0], t0() + Duration::hours(1));
        assert_eq!(result.rows_after, 4);

        // pm10 has a leading gap (hour 1) and an interior gap (hour 3); o3 has none.
        let gaps: Vec<_> = result.registry.iter().collect();
        assert_eq!(gaps.len(), 2);
        assert!(gaps.iter().all(|g| g.pollutant == "pm10"));
        assert_eq!(gaps[1].indices, 2..3);
        assert_eq!(gaps[1].start_time, t0() + Duration::hours(3));
    }

    #[test]
    fn test_empty_station_is_dropped() {
        let table = table_from(&[
            ("A", vec![vec![Some(1.0), Some(1.0)]]),
            ("Z", vec![vec![None, None], vec![None, None]]),
        ]);
        let result = classify_gaps(table, &GapConfig::default());
        assert_eq!(result.dropped_stations, vec!["Z".to_string()]);
        assert!(result.trimmed.stations.iter().all(|s| s.station_id != "Z"));
        assert_eq!(result.rows_after, 1);
    }

    #[test]
    fn test_rerun_on_complete_trimmed_series_is_empty() {
        let table = table_from(&[(
            "A",
            vec![vec![None, None], vec![Some(1.0), Some(2.0)], vec![Some(3.0), Some(4.0)]],
        )]);
        let first = classify_gaps(table, &GapConfig::default());
        assert!(first.registry.is_empty());

        let second = classify_gaps(first.trimmed.clone(), &GapConfig::default());
        assert!(second.registry.is_empty());
        assert_eq!(second.trimmed, first.trimmed);
    }

    #[test]
    fn test_gaps_never_overlap_per_unit() {
        let mut hours = vec![vec![Some(1.0), Some(1.0)]];
        hours.extend((0..80).map(|_| vec![None, Some(1.0)]));
        hours.push(vec![Some(2.0), None]);
        hours.extend((0..10).map(|_| vec![None, None]));
        hours.push(vec![Some(3.0), Some(3.0)]);
        let result = classify_gaps(table_from(&[("A", hours)]), &GapConfig::default());

        for gaps in result.registry.by_unit().values() {
            for pair in gaps.windows(2) {
                assert!(pair[0].indices.end < pair[1].indices.start);
            }
        }
        let counts = result.registry.type_counts();
        assert_eq!(counts.get(&GapType::Long), Some(&1));
        assert_eq!(counts.get(&GapType::Medium), Some(&2));
    }

    #[test]
    fn test_registry_csv_reloads_onto_the_grid() {
        let hourly = |pm10: &[Option<f64>]| pm10.iter().map(|v| vec![*v, Some(1.0)]).collect::<Vec<_>>();
        let table = table_from(&[
            ("A", hourly(&[Some(1.0), None, None, Some(2.0), None, Some(3.0)])),
            ("B", hourly(&[Some(1.0), Some(1.0), None, Some(1.0)])),
        ]);
        let result = classify_gaps(table, &GapConfig::default());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gap_summary.csv");
        result.registry.write_csv(&path).unwrap();

        let loaded = GapRegistry::load_csv(&path, &result.trimmed).unwrap();
        assert_eq!(loaded.iter().collect::<Vec<_>>(), result.registry.iter().collect::<Vec<_>>());

        // Against a table without station B, its row is dropped.
        let mut only_a = result.trimmed.clone();
        only_a.stations.retain(|s| s.station_id == "A");
        let loaded = GapRegistry::load_csv(&path, &only_a).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|g| g.station_id == "A"));
    }

    #[test]
    fn test_registry_csv_columns() {
        let table = table_from(&[("A", vec![vec![Some(1.0), Some(1.0)], vec![None, Some(1.0)], vec![Some(1.0), Some(1.0)]])]);
        let result = classify_gaps(table, &GapConfig::default());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaps.csv");
        result.registry.write_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("station_id,pollutant,start_time,end_time,gap_hours,gap_type"));
        assert_eq!(lines.next(), Some("A,pm10,2023-03-01 01:00:00,2023-03-01 01:00:00,1,short"));
    }
}
