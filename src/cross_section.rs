/// Read-only, timestamp-indexed snapshots of every station's valid value for
/// one pollutant. Built once per pollutant and shared by all readers; stations
/// without coordinates never appear.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use log::debug;

use crate::observation_table::ObservationTable;
use crate::station_registry::StationRegistry;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotEntry {
    /// Index into `ObservationTable::stations`.
    pub station: usize,
    pub position: (f64, f64),
    pub value: f64,
}

#[derive(Debug, Clone, Default)]
pub struct CrossSection {
    by_time: BTreeMap<NaiveDateTime, Vec<SnapshotEntry>>,
}

impl CrossSection {
    /// Snapshot column `pollutant_idx`, keeping only hours at or after `since`.
    pub fn build(
        table: &ObservationTable,
        pollutant_idx: usize,
        registry: &StationRegistry,
        since: Option<NaiveDateTime>,
    ) -> Self {
        let mut by_time: BTreeMap<NaiveDateTime, Vec<SnapshotEntry>> = BTreeMap::new();
        let mut unplaced = 0;

        for (station_idx, series) in table.stations.iter().enumerate() {
            let Some(station) = registry.get(&series.station_id) else {
                unplaced += 1;
                continue;
            };
            let position = (station.lon, station.lat);
            for (ts, value) in series.timestamps.iter().zip(&series.columns[pollutant_idx]) {
                if since.map_or(false, |s| *ts < s) {
                    continue;
                }
                if let Some(value) = value {
                    by_time.entry(*ts).or_default().push(SnapshotEntry {
                        station: station_idx,
                        position,
                        value: *value,
                    });
                }
            }
        }

        if unplaced > 0 {
            debug!(
                "{}: {} stations without coordinates left out of the cross-section",
                table.pollutants[pollutant_idx], unplaced
            );
        }
        CrossSection { by_time }
    }

    /// Valid readings at `t`, ordered by station index.
    pub fn at(&self, t: NaiveDateTime) -> &[SnapshotEntry] {
        self.by_time.get(&t).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct timestamps with at least one reading, ascending.
    pub fn timestamps(&self) -> Vec<NaiveDateTime> {
        self.by_time.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation_table::RawObservation;
    use crate::station_registry::Station;
    use chrono::{Duration, NaiveDate};

    #[test]
    fn test_snapshot_skips_missing_values_and_unplaced_stations() {
        let t0 = NaiveDate::from_ymd_opt(2023, 5, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let rows = vec![
            RawObservation { station_id: "A".into(), datetime: t0, values: vec![Some(1.0)] },
            RawObservation { station_id: "B".into(), datetime: t0, values: vec![None] },
            RawObservation { station_id: "C".into(), datetime: t0, values: vec![Some(3.0)] },
            RawObservation { station_id: "A".into(), datetime: t0 + Duration::hours(1), values: vec![Some(2.0)] },
        ];
        let table = ObservationTable::from_observations(vec!["pm10".into()], rows);
        let registry = StationRegistry::from_stations(vec![
            Station { station_id: "A".into(), lon: 1.0, lat: 1.0 },
            Station { station_id: "B".into(), lon: 2.0, lat: 2.0 },
        ]);

        let snapshot = CrossSection::build(&table, 0, &registry, None);
        assert_eq!(snapshot.at(t0).len(), 1);
        assert_eq!(snapshot.at(t0)[0].value, 1.0);
        assert_eq!(snapshot.timestamps().len(), 2);

        let recent = CrossSection::build(&table, 0, &registry, Some(t0 + Duration::hours(1)));
        assert!(recent.at(t0).is_empty());
        assert_eq!(recent.timestamps(), vec![t0 + Duration::hours(1)]);
    }
}
