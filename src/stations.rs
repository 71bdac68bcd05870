use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;

use crate::types::{SensorType, StationId, TrixelId};

/// Registered contributor. Only the blake3 digest of the access token is
/// kept; the raw token is handed out once at registration.
#[derive(Clone, Debug)]
pub struct MeasurementStation {
    pub id: StationId,
    pub trixel: TrixelId,
    pub sensor_types: Vec<SensorType>,
    pub registered_at: DateTime<Utc>,
    token_digest: blake3::Hash,
}

impl MeasurementStation {
    pub fn reports(&self, sensor_type: SensorType) -> bool {
        self.sensor_types.contains(&sensor_type)
    }
}

#[derive(Default)]
pub struct StationRegistry {
    stations: DashMap<StationId, MeasurementStation>,
}

impl StationRegistry {
    pub fn new() -> StationRegistry {
        StationRegistry::default()
    }

    /// Create a station and hand back its one-time access token.
    pub fn register(
        &self,
        trixel: TrixelId,
        sensor_types: Vec<SensorType>,
    ) -> (StationId, String) {
        let mut rng = rand::thread_rng();
        let id = StationId(format!("ms-{:032x}", rng.gen::<u128>()));
        let token = format!("{:032x}{:032x}", rng.gen::<u128>(), rng.gen::<u128>());
        let station = MeasurementStation {
            id: id.clone(),
            trixel,
            sensor_types,
            registered_at: Utc::now(),
            token_digest: blake3::hash(token.as_bytes()),
        };
        self.stations.insert(id.clone(), station);
        (id, token)
    }

    pub fn get(&self, id: &StationId) -> Option<MeasurementStation> {
        self.stations.get(id).map(|entry| entry.clone())
    }

    /// Constant-time digest comparison via blake3's hash equality.
    pub fn verify(&self, id: &StationId, token: &str) -> bool {
        match self.stations.get(id) {
            Some(station) => station.token_digest == blake3::hash(token.as_bytes()),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}
