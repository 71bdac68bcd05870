//! Node assembly. Wires the store, engine, delegation manager, station
//! registry and purger together, owns the ingestion validation chain and
//! exposes the status surface the operator sees.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::error;

use crate::config::Config;
use crate::delegation::{DelegationManager, NodeIdentity, RegistrationStatus, SyncSettings};
use crate::engine::{GatePolicy, PrivacyEngine};
use crate::error::IngestError;
use crate::lookup::LookupClient;
use crate::observation::ObservationStore;
use crate::privatizer;
use crate::purger::RetentionPurger;
use crate::stations::StationRegistry;
use crate::stats::StatsSnapshot;
use crate::store::{KeyStatus, TrixelStore};
use crate::types::{RawMeasurement, SensorType, StationId, TrixelId};

pub struct TmsNode {
    config: Config,
    store: Arc<TrixelStore>,
    observations: Arc<ObservationStore>,
    stations: Arc<StationRegistry>,
    engine: Arc<PrivacyEngine>,
    manager: Arc<DelegationManager>,
    purger: Arc<RetentionPurger>,
}

/// Snapshot for the status surface. Counters and per-key phases, never
/// buffered raw readings and never credentials.
#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub host: String,
    pub strategy: &'static str,
    pub registration: RegistrationStatus,
    pub delegated_trixels: Vec<TrixelId>,
    pub stations: usize,
    pub observations_published: usize,
    pub keys: Vec<KeyStatus>,
    pub stats: StatsSnapshot,
}

impl TmsNode {
    pub fn new(config: Config, client: Arc<dyn LookupClient>) -> TmsNode {
        let store = Arc::new(TrixelStore::new());
        let observations = Arc::new(ObservationStore::new());
        let stations = Arc::new(StationRegistry::new());

        let strategy = privatizer::build(config.privatizer.privatizer, &config.privatizer.params());
        let policy = GatePolicy {
            min_contributors: config.privatizer.min_contributors,
            quality_threshold: config.privatizer.quality_threshold,
            max_reading_age: config.privatizer.max_reading_age(),
        };
        let engine = Arc::new(PrivacyEngine::new(
            policy,
            strategy,
            store.clone(),
            observations.clone(),
        ));

        let identity = match (config.node.id, config.node.api_token.clone()) {
            (Some(id), Some(token)) => Some(NodeIdentity { id, token }),
            _ => None,
        };
        let manager = Arc::new(DelegationManager::new(
            client,
            store.clone(),
            SyncSettings {
                host: config.node.host.clone(),
                sync_interval: config.lookup.sync_interval(),
                backoff_initial: Duration::from_millis(config.lookup.register_backoff_ms),
                backoff_cap: Duration::from_millis(config.lookup.register_backoff_cap_ms),
                max_register_attempts: config.lookup.max_register_attempts,
                identity,
            },
        ));

        let purger = Arc::new(RetentionPurger::new(
            store.clone(),
            engine.clone(),
            config.retention.keep_interval(),
            config.retention.purge_interval(),
        ));

        TmsNode {
            config,
            store,
            observations,
            stations,
            engine,
            manager,
            purger,
        }
    }

    pub fn store(&self) -> &TrixelStore {
        &self.store
    }

    pub fn observations(&self) -> &ObservationStore {
        &self.observations
    }

    pub fn stations(&self) -> &StationRegistry {
        &self.stations
    }

    pub fn engine(&self) -> &PrivacyEngine {
        &self.engine
    }

    pub fn manager(&self) -> &DelegationManager {
        &self.manager
    }

    /// Register a measurement station for a delegated trixel and hand back
    /// its one-time access token.
    pub fn register_station(
        &self,
        trixel: TrixelId,
        sensor_types: Vec<SensorType>,
    ) -> Result<(StationId, String), IngestError> {
        if !self.manager.is_active() {
            return Err(IngestError::NodeInactive);
        }
        if sensor_types.is_empty() {
            return Err(IngestError::InvalidInput(
                "a station must report at least one sensor type".into(),
            ));
        }
        if !self.store.is_covered(trixel) {
            return Err(IngestError::NotDelegated(trixel));
        }
        Ok(self.stations.register(trixel, sensor_types))
    }

    /// Validate and buffer one measurement. `trixel` is where the station
    /// wants the reading counted; it may be the station's own trixel or any
    /// ancestor of it, so stations can coarsen their location.
    pub fn ingest(
        &self,
        station: &StationId,
        token: &str,
        trixel: TrixelId,
        sensor_type: SensorType,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        let result = self.check_and_buffer(station, token, trixel, sensor_type, value, timestamp);
        self.engine.note_ingest(&result);
        result
    }

    fn check_and_buffer(
        &self,
        station: &StationId,
        token: &str,
        trixel: TrixelId,
        sensor_type: SensorType,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        if !self.manager.is_active() {
            return Err(IngestError::NodeInactive);
        }
        // A bad credential reads the same as an unknown station.
        let record = self
            .stations
            .get(station)
            .filter(|_| self.stations.verify(station, token))
            .ok_or_else(|| IngestError::UnknownStation(station.clone()))?;
        if !record.reports(sensor_type) {
            return Err(IngestError::InvalidSensorType {
                station: station.clone(),
                sensor_type,
            });
        }
        if !trixel.contains(record.trixel) {
            return Err(IngestError::InvalidInput(format!(
                "trixel {trixel} does not contain the station's trixel {}",
                record.trixel
            )));
        }
        if trixel.level() > self.config.engine.max_trixel_level {
            return Err(IngestError::InvalidInput(format!(
                "trixel level {} exceeds the maximum {}",
                trixel.level(),
                self.config.engine.max_trixel_level
            )));
        }
        if !value.is_finite() {
            return Err(IngestError::InvalidInput("non-finite value".into()));
        }
        self.store.append(RawMeasurement {
            station: station.clone(),
            trixel,
            sensor_type,
            value,
            timestamp,
        })
    }

    pub fn status(&self) -> NodeStatus {
        let mut delegated: Vec<TrixelId> = self.store.delegation().roots().collect();
        delegated.sort();
        NodeStatus {
            host: self.config.node.host.clone(),
            strategy: self.engine.strategy_name(),
            registration: self.manager.status(),
            delegated_trixels: delegated,
            stations: self.stations.len(),
            observations_published: self.observations.total_published(),
            keys: self.store.key_statuses(),
            stats: self.engine.stats_snapshot(),
        }
    }

    /// Start the periodic tasks: delegation sync, evaluation ticks and the
    /// retention purge. The handles run until aborted.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let manager = self.manager.clone();
        let sync = tokio::spawn(async move {
            if let Err(err) = manager.run().await {
                error!(error = %err, "delegation manager stopped");
            }
        });

        let engine = self.engine.clone();
        let frequency = self.config.engine.update_frequency();
        let evaluate = tokio::spawn(async move {
            let mut ticker = interval(frequency);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the interval's immediate first fire; there is nothing
            // buffered yet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                engine.run_cycle(Utc::now());
            }
        });

        let purger = self.purger.clone();
        let purge = tokio::spawn(async move {
            purger.run().await;
        });

        vec![sync, evaluate, purge]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{DelegationSync, Registration, ScriptedLookupClient};
    use crate::store::TrixelDelegation;

    fn config() -> Config {
        let mut config = Config::sample();
        config.privatizer.min_contributors = 2;
        config
    }

    fn trixel() -> TrixelId {
        TrixelId::from_raw(9).unwrap()
    }

    async fn active_node() -> (TmsNode, Arc<ScriptedLookupClient>) {
        let client = Arc::new(ScriptedLookupClient::new());
        client.push_registration(Ok(Registration {
            id: 3,
            token: "t".into(),
            active: true,
        }));
        client.push_sync(Ok(DelegationSync {
            active: true,
            delegations: vec![TrixelDelegation {
                trixel: trixel(),
                exclude: false,
            }],
        }));
        let node = TmsNode::new(config(), client.clone());
        node.manager().sync_once().await.unwrap();
        (node, client)
    }

    #[tokio::test]
    async fn inactive_node_rejects_traffic() {
        let node = TmsNode::new(config(), Arc::new(ScriptedLookupClient::new()));
        let err = node
            .register_station(trixel(), vec![SensorType::AmbientTemperature])
            .unwrap_err();
        assert_eq!(err, IngestError::NodeInactive);

        let err = node
            .ingest(
                &StationId("nope".into()),
                "token",
                trixel(),
                SensorType::AmbientTemperature,
                20.0,
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err, IngestError::NodeInactive);
        assert_eq!(node.engine().stats_snapshot().ingest.rejected_inactive, 1);
    }

    #[tokio::test]
    async fn ingest_walks_the_validation_chain() {
        let (node, _client) = active_node().await;
        let child = trixel().children()[1];
        let (station, token) = node
            .register_station(child, vec![SensorType::AmbientTemperature])
            .unwrap();
        let now = Utc::now();

        let unknown = StationId("ms-unknown".into());
        assert_eq!(
            node.ingest(&unknown, &token, child, SensorType::AmbientTemperature, 20.0, now),
            Err(IngestError::UnknownStation(unknown))
        );
        assert_eq!(
            node.ingest(&station, "wrong", child, SensorType::AmbientTemperature, 20.0, now),
            Err(IngestError::UnknownStation(station.clone()))
        );
        assert_eq!(
            node.ingest(&station, &token, child, SensorType::RelativeHumidity, 20.0, now),
            Err(IngestError::InvalidSensorType {
                station: station.clone(),
                sensor_type: SensorType::RelativeHumidity,
            })
        );
        // A sibling trixel does not contain the station's trixel.
        let sibling = trixel().children()[2];
        assert!(matches!(
            node.ingest(&station, &token, sibling, SensorType::AmbientTemperature, 20.0, now),
            Err(IngestError::InvalidInput(_))
        ));
        assert!(matches!(
            node.ingest(&station, &token, child, SensorType::AmbientTemperature, f64::NAN, now),
            Err(IngestError::InvalidInput(_))
        ));

        // The station's own trixel and any ancestor are both fine.
        node.ingest(&station, &token, child, SensorType::AmbientTemperature, 20.0, now)
            .unwrap();
        node.ingest(&station, &token, trixel(), SensorType::AmbientTemperature, 20.5, now)
            .unwrap();
        assert_eq!(node.store().key_count(), 2);
        assert_eq!(node.engine().stats_snapshot().ingest.accepted, 2);
    }

    #[tokio::test]
    async fn station_registration_requires_coverage() {
        let (node, _client) = active_node().await;
        let outside = TrixelId::from_raw(10).unwrap();
        assert_eq!(
            node.register_station(outside, vec![SensorType::AmbientTemperature])
                .unwrap_err(),
            IngestError::NotDelegated(outside)
        );
        assert!(matches!(
            node.register_station(trixel(), vec![]),
            Err(IngestError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn readings_flow_to_a_published_observation() {
        let (node, _client) = active_node().await;
        let (a, token_a) = node
            .register_station(trixel(), vec![SensorType::AmbientTemperature])
            .unwrap();
        let (b, token_b) = node
            .register_station(trixel(), vec![SensorType::AmbientTemperature])
            .unwrap();
        let now = Utc::now();
        node.ingest(&a, &token_a, trixel(), SensorType::AmbientTemperature, 20.0, now)
            .unwrap();
        node.ingest(&b, &token_b, trixel(), SensorType::AmbientTemperature, 21.0, now)
            .unwrap();

        node.engine().run_cycle(now);
        let observation = node
            .observations()
            .latest(trixel(), SensorType::AmbientTemperature)
            .unwrap();
        assert!((observation.value - 20.5).abs() < 1e-12);
        assert_eq!(observation.contributors, 2);

        let status = node.status();
        assert_eq!(status.delegated_trixels, vec![trixel()]);
        assert_eq!(status.stations, 2);
        assert_eq!(status.observations_published, 1);
        assert_eq!(status.stats.gate.published, 1);
        assert_eq!(status.keys.len(), 1);
    }
}
