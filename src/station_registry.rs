/// Station reference data (`station_id, lon, lat` plus ignored metadata).

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use csv::Reader;

use crate::error::{PipelineError, Result};
use crate::observation_table::require_column;

#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub station_id: String,
    pub lon: f64,
    pub lat: f64,
}

#[derive(Debug, Clone, Default)]
pub struct StationRegistry {
    stations: BTreeMap<String, Station>,
}

impl StationRegistry {
    pub fn from_stations(stations: impl IntoIterator<Item = Station>) -> Self {
        StationRegistry {
            stations: stations
                .into_iter()
                .map(|s| (s.station_id.clone(), s))
                .collect(),
        }
    }

    pub fn load_csv(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut rdr = Reader::from_reader(file);
        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();

        let id_idx = require_column(&headers, "station_id", "station details")?;
        let lon_idx = require_column(&headers, "lon", "station details")?;
        let lat_idx = require_column(&headers, "lat", "station details")?;

        let mut stations = Vec::new();
        for (row_no, result) in rdr.records().enumerate() {
            let record = result?;
            let parse = |idx: usize, column: &str| -> Result<f64> {
                let raw = record.get(idx).unwrap_or("").trim();
                raw.parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| PipelineError::InvalidValue {
                        row: row_no,
                        column: column.to_string(),
                        value: raw.to_string(),
                    })
            };
            stations.push(Station {
                station_id: record.get(id_idx).unwrap_or("").trim().to_string(),
                lon: parse(lon_idx, "lon")?,
                lat: parse(lat_idx, "lat")?,
            });
        }

        Ok(Self::from_stations(stations))
    }

    pub fn get(&self, station_id: &str) -> Option<&Station> {
        self.stations.get(station_id)
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_ignores_metadata_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("details.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "station_id,name,lon,lat").unwrap();
        writeln!(f, "S1,Anand Vihar,77.31,28.65").unwrap();
        writeln!(f, "S2,ITO,77.24,28.62").unwrap();
        drop(f);

        let registry = StationRegistry::load_csv(&path).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("S2").unwrap().lon, 77.24);
    }

    #[test]
    fn test_load_requires_coordinates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("details.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "station_id,lon").unwrap();
        writeln!(f, "S1,77.31").unwrap();
        drop(f);

        let err = StationRegistry::load_csv(&path).unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumn { ref column, .. } if column == "lat"));
    }
}
