/// Observation table: per-station hourly series for every pollutant.
///
/// Wide CSV input (`station_id, datetime, <pollutants>`) is parsed into one
/// [`StationSeries`] per station. Each series is put on a contiguous,
/// strictly increasing hourly grid: duplicate hours keep the last row and
/// absent hours are inserted as all-missing rows.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use chrono::{Duration, NaiveDateTime, Timelike};
use csv::{Reader, Writer};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const ACCEPTED_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

const MISSING_TOKENS: [&str; 6] = ["", "NA", "NaN", "nan", "null", "None"];

pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    ACCEPTED_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

pub fn format_datetime(dt: &NaiveDateTime) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

/// Parse one cell; missing tokens and non-finite numbers become `None`.
pub fn parse_value(raw: &str, row: usize, column: &str) -> Result<Option<f64>> {
    let raw = raw.trim();
    if MISSING_TOKENS.contains(&raw) {
        return Ok(None);
    }
    let value: f64 = raw.parse().map_err(|_| PipelineError::InvalidValue {
        row,
        column: column.to_string(),
        value: raw.to_string(),
    })?;
    Ok(value.is_finite().then_some(value))
}

/// serde adapter writing timestamps as `YYYY-MM-DD HH:MM:SS`.
pub mod datetime_format {
    use chrono::NaiveDateTime;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_datetime(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_datetime(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp '{raw}'")))
    }
}

/// One row of the long-format tables (imputed and coverage-filtered).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongRow {
    pub station_id: String,
    #[serde(with = "datetime_format")]
    pub datetime: NaiveDateTime,
    pub pollutant: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StationSeries {
    pub station_id: String,
    pub timestamps: Vec<NaiveDateTime>,
    /// One column per pollutant, index-aligned with `timestamps`.
    pub columns: Vec<Vec<Option<f64>>>,
}

impl StationSeries {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// First grid index at which any pollutant has a value.
    pub fn first_observed_index(&self) -> Option<usize> {
        (0..self.len()).find(|&i| self.columns.iter().any(|col| col[i].is_some()))
    }

    /// Drop every row before `index`.
    pub fn truncate_front(&mut self, index: usize) {
        self.timestamps.drain(..index);
        for col in &mut self.columns {
            col.drain(..index);
        }
    }
}

/// A parsed input row before grid regularisation.
#[derive(Debug, Clone)]
pub struct RawObservation {
    pub station_id: String,
    pub datetime: NaiveDateTime,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationTable {
    pub pollutants: Vec<String>,
    /// Sorted by station id.
    pub stations: Vec<StationSeries>,
}

impl ObservationTable {
    /// Group raw rows by station and regularise each onto an hourly grid.
    pub fn from_observations(pollutants: Vec<String>, rows: Vec<RawObservation>) -> Self {
        let width = pollutants.len();
        let mut grouped: BTreeMap<String, BTreeMap<NaiveDateTime, Vec<Option<f64>>>> = BTreeMap::new();
        let mut duplicates = 0usize;
        let mut off_grid = 0usize;

        for row in rows {
            let hour = floor_to_hour(row.datetime);
            if hour != row.datetime {
                off_grid += 1;
            }
            let mut values = row.values;
            values.resize(width, None);
            if grouped.entry(row.station_id).or_default().insert(hour, values).is_some() {
                duplicates += 1;
            }
        }

        if duplicates > 0 {
            warn!("{} duplicate (station, hour) rows; kept the last occurrence", duplicates);
        }
        if off_grid > 0 {
            warn!("{} timestamps were not on the hour and were floored", off_grid);
        }

        let stations = grouped
            .into_iter()
            .map(|(station_id, by_time)| regularise(station_id, by_time, width))
            .collect();

        ObservationTable { pollutants, stations }
    }

    /// Load the wide observation CSV. Pollutant columns are the configured
    /// pollutants present in the header, in configured order.
    pub fn load_wide_csv(path: &Path, config: &PipelineConfig) -> Result<Self> {
        let file = File::open(path)?;
        let mut rdr = Reader::from_reader(file);
        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();

        let station_idx = require_column(&headers, "station_id", "observation")?;
        let datetime_idx = require_column(&headers, "datetime", "observation")?;

        let pollutant_cols: Vec<(String, usize)> = config
            .pollutants
            .iter()
            .filter_map(|p| headers.iter().position(|h| h == p).map(|idx| (p.clone(), idx)))
            .collect();

        if pollutant_cols.len() < config.min_pollutant_columns {
            return Err(PipelineError::TooFewPollutants {
                found: pollutant_cols.len(),
                required: config.min_pollutant_columns,
            });
        }

        let mut rows = Vec::new();
        for (row_no, result) in rdr.records().enumerate() {
            let record = result?;
            let station_id = record.get(station_idx).unwrap_or("").trim().to_string();
            let raw_dt = record.get(datetime_idx).unwrap_or("");
            let datetime = parse_datetime(raw_dt).ok_or_else(|| PipelineError::InvalidTimestamp {
                row: row_no,
                value: raw_dt.to_string(),
            })?;
            let values = pollutant_cols
                .iter()
                .map(|(name, idx)| parse_value(record.get(*idx).unwrap_or(""), row_no, name))
                .collect::<Result<Vec<_>>>()?;
            rows.push(RawObservation {
                station_id,
                datetime,
                values,
            });
        }

        debug!("read {} observation rows from {}", rows.len(), path.display());
        let pollutants = pollutant_cols.into_iter().map(|(name, _)| name).collect();
        Ok(Self::from_observations(pollutants, rows))
    }

    /// Write in the same wide layout the loader accepts.
    pub fn write_wide_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = Writer::from_path(path)?;
        let mut header = vec!["station_id".to_string(), "datetime".to_string()];
        header.extend(self.pollutants.iter().cloned());
        wtr.write_record(&header)?;

        for series in &self.stations {
            for (i, ts) in series.timestamps.iter().enumerate() {
                let mut row = vec![series.station_id.clone(), format_datetime(ts)];
                row.extend(
                    series
                        .columns
                        .iter()
                        .map(|col| col[i].map(|v| v.to_string()).unwrap_or_default()),
                );
                wtr.write_record(&row)?;
            }
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.stations.iter().map(StationSeries::len).sum()
    }

    pub fn datetime_range(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let first = self.stations.iter().filter_map(|s| s.timestamps.first()).min()?;
        let last = self.stations.iter().filter_map(|s| s.timestamps.last()).max()?;
        Some((*first, *last))
    }

    /// Flatten into long rows ordered by station, pollutant, then time.
    pub fn to_long_rows(&self) -> Vec<LongRow> {
        let mut rows = Vec::with_capacity(self.row_count() * self.pollutants.len());
        for series in &self.stations {
            for (p_idx, pollutant) in self.pollutants.iter().enumerate() {
                for (ts, value) in series.timestamps.iter().zip(&series.columns[p_idx]) {
                    rows.push(LongRow {
                        station_id: series.station_id.clone(),
                        datetime: *ts,
                        pollutant: pollutant.clone(),
                        value: *value,
                    });
                }
            }
        }
        rows
    }
}

pub fn require_column(headers: &[String], column: &str, table: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| PipelineError::MissingColumn {
            table: table.to_string(),
            column: column.to_string(),
        })
}

pub fn write_long_csv(rows: &[LongRow], path: &Path) -> Result<()> {
    let mut wtr = Writer::from_path(path)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn read_long_csv(path: &Path) -> Result<Vec<LongRow>> {
    let mut rdr = Reader::from_path(path)?;
    let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
    for column in ["station_id", "datetime", "pollutant", "value"] {
        require_column(&headers, column, "long observation")?;
    }
    let mut rows = Vec::new();
    for result in rdr.deserialize::<LongRow>() {
        rows.push(result?);
    }
    Ok(rows)
}

fn floor_to_hour(dt: NaiveDateTime) -> NaiveDateTime {
    dt.date()
        .and_hms_opt(dt.hour(), 0, 0)
        .unwrap_or(dt)
}

fn regularise(
    station_id: String,
    by_time: BTreeMap<NaiveDateTime, Vec<Option<f64>>>,
    width: usize,
) -> StationSeries {
    let mut timestamps = Vec::with_capacity(by_time.len());
    let mut columns = vec![Vec::with_capacity(by_time.len()); width];
    let mut expected: Option<NaiveDateTime> = None;

    for (ts, values) in by_time {
        if let Some(mut next) = expected {
            while next < ts {
                timestamps.push(next);
                for col in &mut columns {
                    col.push(None);
                }
                next += Duration::hours(1);
            }
        }
        timestamps.push(ts);
        for (col, value) in columns.iter_mut().zip(values) {
            col.push(value);
        }
        expected = Some(ts + Duration::hours(1));
    }

    StationSeries {
        station_id,
        timestamps,
        columns,
    }
}
