/// Input validation and missingness reporting.
///
/// Schema problems are fatal and raised before any computation; the
/// missingness report only reads the table.

use std::fs::File;
use std::path::Path;

use chrono::NaiveDateTime;
use csv::Reader;
use log::info;

use crate::error::{PipelineError, Result};
use crate::observation_table::{require_column, ObservationTable};
use crate::station_registry::StationRegistry;

/// Every station in the observations must have a details row and vice versa
/// (by count).
pub fn validate_station_count(table: &ObservationTable, registry: &StationRegistry) -> Result<()> {
    let observations = table.stations.len();
    if observations != registry.len() {
        return Err(PipelineError::StationCountMismatch {
            observations,
            details: registry.len(),
        });
    }
    Ok(())
}

/// The prediction-location table is consumed downstream; here it is only
/// checked for coordinate columns. Returns its row count.
pub fn check_prediction_locations(path: &Path) -> Result<usize> {
    let file = File::open(path)?;
    let mut rdr = Reader::from_reader(file);
    let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
    require_column(&headers, "lon", "prediction location")?;
    require_column(&headers, "lat", "prediction location")?;

    let mut rows = 0;
    for result in rdr.records() {
        result?;
        rows += 1;
    }
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct MissingnessReport {
    pub rows: usize,
    pub stations: usize,
    pub datetime_range: Option<(NaiveDateTime, NaiveDateTime)>,
    /// (pollutant, percent missing), in table order.
    pub per_pollutant: Vec<(String, f64)>,
    /// (station, missing cells across all pollutants), worst first.
    pub worst_stations: Vec<(String, usize)>,
}

impl MissingnessReport {
    pub fn from_table(table: &ObservationTable, top_n: usize) -> Self {
        let rows = table.row_count();

        let per_pollutant = table
            .pollutants
            .iter()
            .enumerate()
            .map(|(p_idx, name)| {
                let missing: usize = table
                    .stations
                    .iter()
                    .map(|s| s.columns[p_idx].iter().filter(|v| v.is_none()).count())
                    .sum();
                let pct = if rows > 0 { missing as f64 / rows as f64 * 100.0 } else { 0.0 };
                (name.clone(), pct)
            })
            .collect();

        let mut worst_stations: Vec<(String, usize)> = table
            .stations
            .iter()
            .map(|s| {
                let missing = s.columns.iter().flatten().filter(|v| v.is_none()).count();
                (s.station_id.clone(), missing)
            })
            .collect();
        worst_stations.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        worst_stations.truncate(top_n);

        MissingnessReport {
            rows,
            stations: table.stations.len(),
            datetime_range: table.datetime_range(),
            per_pollutant,
            worst_stations,
        }
    }

    pub fn print(&self) {
        println!("\n📋 INPUT MISSINGNESS");
        println!("====================");
        println!("  Rows (hourly grid): {}", self.rows);
        println!("  Stations:           {}", self.stations);
        if let Some((start, end)) = self.datetime_range {
            println!("  Datetime range:     {} → {}", start, end);
        }
        println!("\n  Missing by pollutant:");
        for (pollutant, pct) in &self.per_pollutant {
            println!("    {:8} {:6.2}%", pollutant, pct);
        }
        println!("\n  Stations with most missing cells:");
        for (station, missing) in &self.worst_stations {
            println!("    {:12} {}", station, missing);
        }
        info!("missingness report covers {} rows over {} stations", self.rows, self.stations);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation_table::RawObservation;
    use crate::station_registry::Station;
    use approx::assert_relative_eq;
    use std::io::Write;

    fn table() -> ObservationTable {
        let t0 = chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let rows = vec![
            RawObservation { station_id: "A".into(), datetime: t0, values: vec![Some(1.0), None] },
            RawObservation {
                station_id: "A".into(),
                datetime: t0 + chrono::Duration::hours(1),
                values: vec![None, None],
            },
            RawObservation { station_id: "B".into(), datetime: t0, values: vec![Some(1.0), Some(2.0)] },
        ];
        ObservationTable::from_observations(vec!["pm10".into(), "o3".into()], rows)
    }

    #[test]
    fn test_station_count_mismatch_is_fatal() {
        let registry = StationRegistry::from_stations(vec![Station {
            station_id: "A".into(),
            lon: 0.0,
            lat: 0.0,
        }]);
        let err = validate_station_count(&table(), &registry).unwrap_err();
        assert!(matches!(err, PipelineError::StationCountMismatch { observations: 2, details: 1 }));
    }

    #[test]
    fn test_missingness_percentages() {
        let report = MissingnessReport::from_table(&table(), 5);
        assert_eq!(report.rows, 3);
        assert_relative_eq!(report.per_pollutant[0].1, 100.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(report.per_pollutant[1].1, 200.0 / 3.0, epsilon = 1e-9);
        assert_eq!(report.worst_stations[0], ("A".to_string(), 3));
    }

    #[test]
    fn test_prediction_locations_need_coordinates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locs.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "lon,lat").unwrap();
        writeln!(f, "77.1,28.5").unwrap();
        writeln!(f, "77.2,28.6").unwrap();
        drop(f);
        assert_eq!(check_prediction_locations(&path).unwrap(), 2);
    }
}
