/// Hybrid gap imputation
///
/// Fills each registered gap with the strategy of its class:
///   * short  - linear interpolation between the bounding observations
///   * medium - local-level smoothing over a window around the gap
///   * long   - inverse-distance weighting over other stations at the same hour
///
/// Every (station, pollutant) series is an independent work unit that owns
/// its output column. The long-gap strategy reads a per-pollutant
/// cross-section built once from the unfilled values, so fills never feed
/// other fills. Each gap point ends as an explicit [`FillOutcome`].

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::path::Path;

use chrono::NaiveDateTime;
use csv::Writer;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::cross_section::CrossSection;
use crate::error::Result;
use crate::gap_classifier::{Gap, GapRegistry, GapType};
use crate::idw_interpolator::IdwKernel;
use crate::local_level_smoother::LocalLevelSmoother;
use crate::observation_table::{datetime_format, ObservationTable, StationSeries};
use crate::spatial_calibrator::CalibrationTable;
use crate::station_registry::StationRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMethod {
    Linear,
    StateSpace,
    Idw,
}

impl FillMethod {
    pub fn for_gap(gap_type: GapType) -> Self {
        match gap_type {
            GapType::Short => FillMethod::Linear,
            GapType::Medium => FillMethod::StateSpace,
            GapType::Long => FillMethod::Idw,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FillMethod::Linear => "linear",
            FillMethod::StateSpace => "state_space",
            FillMethod::Idw => "idw",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SkipReason {
    /// The gap precedes the pollutant's first observation.
    BeforeFirstValid,
    /// A short gap lacks an observation on one side.
    MissingBound,
    /// The smoothing window holds no observation.
    NoObservationsInWindow,
    InsufficientNeighbors { found: usize, required: usize },
    MissingCoordinates,
    DegenerateWeights,
}

impl SkipReason {
    /// Reason without its payload, for aggregate counts.
    pub fn kind(&self) -> &'static str {
        match self {
            SkipReason::BeforeFirstValid => "before_first_valid",
            SkipReason::MissingBound => "missing_bound",
            SkipReason::NoObservationsInWindow => "no_observations_in_window",
            SkipReason::InsufficientNeighbors { .. } => "insufficient_neighbors",
            SkipReason::MissingCoordinates => "missing_coordinates",
            SkipReason::DegenerateWeights => "degenerate_weights",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InsufficientNeighbors { found, required } => {
                write!(f, "insufficient_neighbors ({found} of {required})")
            }
            other => write!(f, "{}", other.kind()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillOutcome {
    Filled(f64),
    Skipped(SkipReason),
}

/// Outcome of one gap point, in grid coordinates of its work unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointRecord {
    pub index: usize,
    pub gap_type: GapType,
    pub method: FillMethod,
    pub outcome: FillOutcome,
}

#[derive(Debug, Clone)]
struct ImputedUnit {
    station_idx: usize,
    pollutant_idx: usize,
    values: Vec<Option<f64>>,
    records: Vec<PointRecord>,
}

/// Provenance row as written to `fill_provenance.csv`.
#[derive(Debug, Clone, Serialize)]
pub struct ProvenanceRow {
    pub station_id: String,
    #[serde(with = "datetime_format")]
    pub datetime: NaiveDateTime,
    pub pollutant: String,
    pub gap_type: GapType,
    pub method: FillMethod,
    pub outcome: &'static str,
    pub value: Option<f64>,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct ImputationStats {
    pub filled: BTreeMap<FillMethod, usize>,
    pub skipped: BTreeMap<&'static str, usize>,
    pub cells: usize,
    pub missing_after: usize,
    /// (station, percent missing), worst first.
    pub worst_stations: Vec<(String, f64)>,
}

impl ImputationStats {
    pub fn missing_percent(&self) -> f64 {
        if self.cells == 0 {
            0.0
        } else {
            self.missing_after as f64 / self.cells as f64 * 100.0
        }
    }

    pub fn print(&self) {
        println!("\n🧩 HYBRID IMPUTATION");
        println!("====================");
        for (method, count) in &self.filled {
            println!("  Filled by {:12} {}", method.as_str(), count);
        }
        for (reason, count) in &self.skipped {
            println!("  Left missing ({}): {}", reason, count);
        }
        println!("  Overall missing after imputation: {:.2}%", self.missing_percent());
        println!("  Stations with most remaining gaps:");
        for (station, pct) in &self.worst_stations {
            println!("    {:12} {:6.2}%", station, pct);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImputationResult {
    pub table: ObservationTable,
    pub provenance: Vec<ProvenanceRow>,
    pub stats: ImputationStats,
}

impl ImputationResult {
    pub fn write_provenance_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = Writer::from_path(path)?;
        for row in &self.provenance {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Shared, read-only state for every work unit of one pollutant.
struct PollutantContext {
    exponent: f64,
    snapshot: CrossSection,
}

/// Fill every gap of `registry` in a copy of `trimmed`.
pub fn impute(
    trimmed: &ObservationTable,
    registry: &GapRegistry,
    stations: &StationRegistry,
    calibration: &CalibrationTable,
    config: &PipelineConfig,
) -> ImputationResult {
    let kernel = IdwKernel::from_config(&config.spatial);
    let smoother = LocalLevelSmoother::from_config(&config.imputation);

    let contexts: Vec<PollutantContext> = trimmed
        .pollutants
        .par_iter()
        .enumerate()
        .map(|(p_idx, pollutant)| PollutantContext {
            exponent: calibration.exponent_for(pollutant, &config.imputation),
            snapshot: CrossSection::build(trimmed, p_idx, stations, None),
        })
        .collect();

    let by_unit = registry.by_unit();
    let mut units: Vec<(usize, usize, Vec<&Gap>)> = Vec::new();
    for (s_idx, series) in trimmed.stations.iter().enumerate() {
        for (p_idx, pollutant) in trimmed.pollutants.iter().enumerate() {
            if let Some(gaps) = by_unit.get(&(series.station_id.as_str(), pollutant.as_str())) {
                units.push((s_idx, p_idx, gaps.clone()));
            }
        }
    }
    info!("imputing {} gaps across {} series", registry.len(), units.len());

    let filled: Vec<ImputedUnit> = units
        .into_par_iter()
        .map(|(s_idx, p_idx, gaps)| {
            let series = &trimmed.stations[s_idx];
            let position = stations.get(&series.station_id).map(|s| (s.lon, s.lat));
            let unit = UnitFiller {
                series,
                station_idx: s_idx,
                pollutant_idx: p_idx,
                position,
                context: &contexts[p_idx],
                kernel: &kernel,
                smoother: &smoother,
                margin: config.imputation.smoothing_margin,
            };
            unit.fill(&gaps)
        })
        .collect();

    assemble(trimmed, filled)
}

struct UnitFiller<'a> {
    series: &'a StationSeries,
    station_idx: usize,
    pollutant_idx: usize,
    position: Option<(f64, f64)>,
    context: &'a PollutantContext,
    kernel: &'a IdwKernel,
    smoother: &'a LocalLevelSmoother,
    margin: usize,
}

impl UnitFiller<'_> {
    fn fill(&self, gaps: &[&Gap]) -> ImputedUnit {
        let original = &self.series.columns[self.pollutant_idx];
        let mut values = original.clone();
        let mut records = Vec::new();
        let first_valid = original.iter().position(Option::is_some);

        for gap in gaps {
            let range = gap.indices.clone();
            if range.end > original.len() || original[range.clone()].iter().any(Option::is_some) {
                warn!(
                    "{}/{}: gap {}..{} does not match the series; ignored",
                    gap.station_id, gap.pollutant, range.start, range.end
                );
                continue;
            }

            let method = FillMethod::for_gap(gap.gap_type);
            let outcomes = if first_valid.map_or(true, |first| range.start < first) {
                vec![FillOutcome::Skipped(SkipReason::BeforeFirstValid); range.len()]
            } else {
                match gap.gap_type {
                    GapType::Short => fill_linear(original, range.clone()),
                    GapType::Medium => self.fill_state_space(original, range.clone()),
                    GapType::Long => self.fill_spatial(range.clone()),
                }
            };

            for (index, outcome) in range.zip(outcomes) {
                if let FillOutcome::Filled(value) = outcome {
                    if values[index].is_none() {
                        values[index] = Some(value);
                    }
                }
                records.push(PointRecord {
                    index,
                    gap_type: gap.gap_type,
                    method,
                    outcome,
                });
            }
        }

        ImputedUnit {
            station_idx: self.station_idx,
            pollutant_idx: self.pollutant_idx,
            values,
            records,
        }
    }

    /// Window is `[start - margin, end + margin)` clamped to the series; only
    /// the gap's own indices are copied out of the smoothed window.
    fn fill_state_space(&self, original: &[Option<f64>], range: Range<usize>) -> Vec<FillOutcome> {
        let window_start = range.start.saturating_sub(self.margin);
        let window_end = (range.end + self.margin).min(original.len());

        match self.smoother.smooth(&original[window_start..window_end]) {
            Some(smoothed) => range
                .map(|i| FillOutcome::Filled(smoothed[i - window_start]))
                .collect(),
            None => vec![FillOutcome::Skipped(SkipReason::NoObservationsInWindow); range.len()],
        }
    }

    fn fill_spatial(&self, range: Range<usize>) -> Vec<FillOutcome> {
        let Some(target) = self.position else {
            return vec![FillOutcome::Skipped(SkipReason::MissingCoordinates); range.len()];
        };
        let required = self.kernel.neighbors;

        range
            .map(|i| {
                let t = self.series.timestamps[i];
                let others: Vec<_> = self
                    .context
                    .snapshot
                    .at(t)
                    .iter()
                    .filter(|e| e.station != self.station_idx)
                    .map(|e| (e.position, e.value))
                    .collect();

                if others.len() < required {
                    debug!("{} @ {}: {} neighbours", self.series.station_id, t, others.len());
                    return FillOutcome::Skipped(SkipReason::InsufficientNeighbors {
                        found: others.len(),
                        required,
                    });
                }
                let nearest = self.kernel.nearest(target, others);
                match self.kernel.predict(&nearest, self.context.exponent) {
                    Some(value) => FillOutcome::Filled(value),
                    None => FillOutcome::Skipped(SkipReason::DegenerateWeights),
                }
            })
            .collect()
    }
}

/// Straight line between the observations at `start - 1` and `end`.
fn fill_linear(original: &[Option<f64>], range: Range<usize>) -> Vec<FillOutcome> {
    let before = range
        .start
        .checked_sub(1)
        .and_then(|i| original[i].map(|v| (i, v)));
    let after = original.get(range.end).copied().flatten().map(|v| (range.end, v));

    let (Some((lo, a)), Some((hi, b))) = (before, after) else {
        return vec![FillOutcome::Skipped(SkipReason::MissingBound); range.len()];
    };
    let span = (hi - lo) as f64;
    range
        .map(|i| FillOutcome::Filled(a + (b - a) * (i - lo) as f64 / span))
        .collect()
}

fn assemble(trimmed: &ObservationTable, units: Vec<ImputedUnit>) -> ImputationResult {
    let mut table = trimmed.clone();
    let mut provenance = Vec::new();
    let mut stats = ImputationStats::default();

    for unit in units {
        let series = &trimmed.stations[unit.station_idx];
        let pollutant = &trimmed.pollutants[unit.pollutant_idx];
        for record in &unit.records {
            let (outcome, value, detail) = match record.outcome {
                FillOutcome::Filled(v) => {
                    *stats.filled.entry(record.method).or_insert(0) += 1;
                    ("filled", Some(v), String::new())
                }
                FillOutcome::Skipped(reason) => {
                    *stats.skipped.entry(reason.kind()).or_insert(0) += 1;
                    ("skipped", None, reason.to_string())
                }
            };
            provenance.push(ProvenanceRow {
                station_id: series.station_id.clone(),
                datetime: series.timestamps[record.index],
                pollutant: pollutant.clone(),
                gap_type: record.gap_type,
                method: record.method,
                outcome,
                value,
                detail,
            });
        }
        table.stations[unit.station_idx].columns[unit.pollutant_idx] = unit.values;
    }

    let mut worst: Vec<(String, f64)> = Vec::new();
    for series in &table.stations {
        let cells = series.len() * series.columns.len();
        let missing = series.columns.iter().flatten().filter(|v| v.is_none()).count();
        stats.cells += cells;
        stats.missing_after += missing;
        let pct = if cells > 0 { missing as f64 / cells as f64 * 100.0 } else { 0.0 };
        worst.push((series.station_id.clone(), pct));
    }
    worst.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    worst.truncate(5);
    stats.worst_stations = worst;

    info!(
        "imputation: {} points filled, {} left missing",
        stats.filled.values().sum::<usize>(),
        stats.skipped.values().sum::<usize>()
    );
    ImputationResult {
        table,
        provenance,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::gap_classifier::classify_gaps;
    use crate::observation_table::RawObservation;
    use crate::spatial_calibrator::CalibratedParameter;
    use crate::station_registry::Station;
    use approx::assert_relative_eq;
    use chrono::{Duration, NaiveDate};

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2022, 6, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    /// Build a single-pollutant table: one vector of hourly values per station.
    fn table(series: &[(&str, Vec<Option<f64>>)]) -> ObservationTable {
        let mut rows = Vec::new();
        for (station, values) in series {
            for (h, v) in values.iter().enumerate() {
                rows.push(RawObservation {
                    station_id: station.to_string(),
                    datetime: t0() + Duration::hours(h as i64),
                    values: vec![*v],
                });
            }
        }
        ObservationTable::from_observations(vec!["pm10".into()], rows)
    }

    fn run(
        raw: ObservationTable,
        stations: &StationRegistry,
        calibration: &CalibrationTable,
    ) -> ImputationResult {
        let config = PipelineConfig::default();
        let classified = classify_gaps(raw, &config.gaps);
        impute(&classified.trimmed, &classified.registry, stations, calibration, &config)
    }

    fn outcome_at<'a>(result: &'a ImputationResult, station: &str, hour: i64) -> &'a ProvenanceRow {
        result
            .provenance
            .iter()
            .find(|r| r.station_id == station && r.datetime == t0() + Duration::hours(hour))
            .unwrap()
    }

    #[test]
    fn test_short_gap_linear_scenario() {
        let mut values = vec![Some(40.0); 16];
        values[9] = Some(50.0);
        for v in &mut values[10..15] {
            *v = None;
        }
        values[15] = Some(80.0);
        let result = run(table(&[("A", values)]), &StationRegistry::default(), &CalibrationTable::default());

        let filled = &result.table.stations[0].columns[0];
        assert_relative_eq!(filled[12].unwrap(), 65.0, epsilon = 1e-12);
        for v in &filled[10..15] {
            let v = v.unwrap();
            assert!((50.0..=80.0).contains(&v));
        }
        assert_eq!(result.stats.filled.get(&FillMethod::Linear), Some(&5));
    }

    #[test]
    fn test_short_gap_at_tail_stays_missing() {
        let values = vec![Some(1.0), Some(2.0), None, None];
        let result = run(table(&[("A", values)]), &StationRegistry::default(), &CalibrationTable::default());
        assert_eq!(result.table.stations[0].columns[0][2..], [None, None]);
        assert_eq!(outcome_at(&result, "A", 3).detail, "missing_bound");
        assert_eq!(result.stats.skipped.get("missing_bound"), Some(&2));
    }

    #[test]
    fn test_leading_pollutant_gap_is_not_touched() {
        let mut rows = Vec::new();
        for h in 0..12 {
            rows.push(RawObservation {
                station_id: "A".into(),
                datetime: t0() + Duration::hours(h),
                values: vec![(h >= 8).then_some(3.0), Some(1.0)],
            });
        }
        let raw = ObservationTable::from_observations(vec!["pm10".into(), "o3".into()], rows);
        let result = run(raw, &StationRegistry::default(), &CalibrationTable::default());

        assert!(result.table.stations[0].columns[0][..8].iter().all(Option::is_none));
        assert_eq!(outcome_at(&result, "A", 0).detail, "before_first_valid");
        assert_eq!(outcome_at(&result, "A", 0).method, FillMethod::StateSpace);
    }

    #[test]
    fn test_medium_gap_uses_smoother_inside_gap_only() {
        let mut values: Vec<Option<f64>> = (0..40).map(|h| Some(10.0 + (h % 3) as f64)).collect();
        for v in &mut values[15..25] {
            *v = None;
        }
        let raw = table(&[("A", values.clone())]);
        let result = run(raw, &StationRegistry::default(), &CalibrationTable::default());

        let filled = &result.table.stations[0].columns[0];
        for (i, (before, after)) in values.iter().zip(filled).enumerate() {
            if before.is_some() {
                assert_eq!(before, after, "valid observation at {i} changed");
            } else {
                let v = after.unwrap();
                assert!((10.0..=12.0).contains(&v));
            }
        }
        assert_eq!(result.stats.filled.get(&FillMethod::StateSpace), Some(&10));
    }

    #[test]
    fn test_medium_window_spans_ten_hours_each_side() {
        // Gap 30..40 in a flat series; the smoothing window is [20, 50).
        let fill_with_spike_at = |spike: usize| {
            let mut values = vec![Some(10.0); 60];
            for v in &mut values[30..40] {
                *v = None;
            }
            values[spike] = Some(1000.0);
            let result = run(table(&[("A", values)]), &StationRegistry::default(), &CalibrationTable::default());
            result.table.stations[0].columns[0][35].unwrap()
        };

        assert_eq!(fill_with_spike_at(19), 10.0);
        assert!(fill_with_spike_at(20) > 11.0);
        assert!(fill_with_spike_at(49) > 11.0);
        assert_eq!(fill_with_spike_at(50), 10.0);
    }

    fn ring(n: usize) -> StationRegistry {
        StationRegistry::from_stations((0..n).map(|i| Station {
            station_id: format!("S{i}"),
            lon: i as f64,
            lat: 0.0,
        }))
    }

    #[test]
    fn test_long_gap_idw_scenario() {
        // Target S0 at x = 0; S1..S5 at distances 1..5 report 10..50.
        let hours = 80;
        let mut series = Vec::new();
        let mut target = vec![Some(1.0)];
        target.extend(vec![None; hours - 2]);
        target.push(Some(1.0));
        series.push(("S0", target));
        let names = ["S1", "S2", "S3", "S4", "S5"];
        for (i, name) in names.iter().enumerate() {
            series.push((*name, vec![Some((i as f64 + 1.0) * 10.0); hours]));
        }
        let calibration = CalibrationTable {
            parameters: vec![CalibratedParameter { pollutant: "pm10".into(), best_p: 1.0, rmse: 0.0 }],
        };
        let result = run(table(&series), &ring(6), &calibration);

        let filled = &result.table.stations[0].columns[0];
        for v in &filled[1..hours - 1] {
            assert_relative_eq!(v.unwrap(), 3000.0 / 137.0, epsilon = 1e-9);
        }
        assert_eq!(result.stats.filled.get(&FillMethod::Idw), Some(&(hours - 2)));
    }

    #[test]
    fn test_long_gap_with_too_few_neighbors_is_skipped_per_point() {
        let hours = 80;
        let mut target = vec![Some(1.0)];
        target.extend(vec![None; hours - 2]);
        target.push(Some(1.0));
        let mut series = vec![("S0", target)];
        // Four neighbours always, a fifth only during the first ten hours.
        for name in ["S1", "S2", "S3", "S4"] {
            series.push((name, vec![Some(5.0); hours]));
        }
        let fifth: Vec<Option<f64>> = (0..hours).map(|h| (h < 10).then_some(5.0)).collect();
        series.push(("S5", fifth));

        let result = run(table(&series), &ring(6), &CalibrationTable::default());
        let filled = &result.table.stations[0].columns[0];
        assert!(filled[1..10].iter().all(Option::is_some));
        assert!(filled[10..hours - 1].iter().all(Option::is_none));
        assert_eq!(
            outcome_at(&result, "S0", 20).detail,
            "insufficient_neighbors (4 of 5)"
        );
    }

    #[test]
    fn test_long_gap_without_coordinates() {
        let mut target = vec![Some(1.0)];
        target.extend(vec![None; 80]);
        target.push(Some(1.0));
        let result = run(table(&[("X", target)]), &StationRegistry::default(), &CalibrationTable::default());
        assert_eq!(result.stats.skipped.get("missing_coordinates"), Some(&80));
    }

    #[test]
    fn test_every_filled_point_has_one_provenance_row() {
        let mut values = vec![Some(2.0); 30];
        for i in [3, 4, 10, 11, 12, 13, 14, 15, 16, 17] {
            values[i] = None;
        }
        let result = run(table(&[("A", values)]), &StationRegistry::default(), &CalibrationTable::default());
        let mut seen = std::collections::HashSet::new();
        for row in &result.provenance {
            assert!(seen.insert(row.datetime), "point recorded twice");
        }
        assert_eq!(result.provenance.len(), 10);
    }
}
