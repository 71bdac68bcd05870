use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::{SensorKey, SensorType, TrixelId};

/// One published anonymized aggregate. Immutable once created; retention is
/// independent of raw-data retention.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub trixel: TrixelId,
    pub sensor_type: SensorType,
    pub time: DateTime<Utc>,
    pub value: f64,
    pub quality: f64,
    pub contributors: u32,
}

#[derive(Default)]
pub struct ObservationStore {
    entries: DashMap<SensorKey, Vec<Observation>>,
}

impl ObservationStore {
    pub fn new() -> ObservationStore {
        ObservationStore::default()
    }

    pub fn publish(&self, observation: Observation) {
        let key = SensorKey::new(observation.trixel, observation.sensor_type);
        self.entries.entry(key).or_default().push(observation);
    }

    pub fn latest(&self, trixel: TrixelId, sensor_type: SensorType) -> Option<Observation> {
        self.entries
            .get(&SensorKey::new(trixel, sensor_type))
            .and_then(|history| history.last().cloned())
    }

    /// Newest observation per requested sensor type for one trixel. Types
    /// default to all; entries older than `max_age` relative to `now` are
    /// omitted.
    pub fn trixel_overview(
        &self,
        trixel: TrixelId,
        types: Option<&[SensorType]>,
        max_age: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Vec<Observation> {
        let wanted: Vec<SensorType> = match types {
            Some(types) => types.to_vec(),
            None => SensorType::ALL.to_vec(),
        };
        let mut out = Vec::new();
        for sensor_type in wanted {
            if let Some(obs) = self.latest(trixel, sensor_type) {
                let fresh = match max_age {
                    Some(age) => obs.time >= now - age,
                    None => true,
                };
                if fresh {
                    out.push(obs);
                }
            }
        }
        out
    }

    /// Up to `limit` observations for one key, newest first.
    pub fn history(
        &self,
        trixel: TrixelId,
        sensor_type: SensorType,
        limit: usize,
    ) -> Vec<Observation> {
        self.entries
            .get(&SensorKey::new(trixel, sensor_type))
            .map(|history| history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn total_published(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().len()).sum()
    }
}
