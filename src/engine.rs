//! Evaluation passes. On every tick the engine folds each key's buffered
//! window through the configured privatizer, applies the privacy gate and
//! publishes or suppresses the result. A strategy failure suppresses that
//! key's cycle and leaves its estimator state untouched; it never aborts the
//! pass or affects other keys.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::IngestError;
use crate::observation::{Observation, ObservationStore};
use crate::privatizer::{Privatizer, WindowMode};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::store::{CycleOutcome, EvalOutcome, SuppressReason, TrixelStore};
use crate::types::{Estimate, RawMeasurement, SensorKey};

/// Privacy gate thresholds plus the reading-age cutoff. Fixed at startup.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GatePolicy {
    /// Minimum distinct stations folded into an estimate before it may be
    /// published.
    pub min_contributors: u32,
    pub quality_threshold: f64,
    /// Readings older than this at evaluation time are ignored.
    pub max_reading_age: Duration,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            min_contributors: 3,
            quality_threshold: 0.0,
            max_reading_age: Duration::seconds(300),
        }
    }
}

/// What one tick did. `skipped` is set when the previous pass was still
/// running and this tick was dropped whole.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CycleReport {
    pub skipped: bool,
    pub evaluated: usize,
    pub published: usize,
    pub suppressed: usize,
}

pub struct PrivacyEngine {
    policy: GatePolicy,
    strategy: Arc<dyn Privatizer>,
    store: Arc<TrixelStore>,
    observations: Arc<ObservationStore>,
    stats: Mutex<EngineStats>,
    cycle_guard: Mutex<()>,
}

impl PrivacyEngine {
    pub fn new(
        policy: GatePolicy,
        strategy: Arc<dyn Privatizer>,
        store: Arc<TrixelStore>,
        observations: Arc<ObservationStore>,
    ) -> PrivacyEngine {
        PrivacyEngine {
            policy,
            strategy,
            store,
            observations,
            stats: Mutex::new(EngineStats::default()),
            cycle_guard: Mutex::new(()),
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn note_ingest(&self, result: &Result<(), IngestError>) {
        self.stats.lock().ingest.note(result);
    }

    pub fn note_purged(&self, removed: usize) {
        self.stats.lock().purged_readings += removed as u64;
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.lock().snapshot()
    }

    /// Run one evaluation pass over every active key. Ticks never overlap:
    /// if the previous pass is still running this one is skipped whole.
    pub fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let Some(_pass) = self.cycle_guard.try_lock() else {
            warn!("previous evaluation pass still running, skipping tick");
            self.stats.lock().ticks_skipped += 1;
            return CycleReport {
                skipped: true,
                ..CycleReport::default()
            };
        };

        let started = Instant::now();
        let mut report = CycleReport::default();
        for key in self.store.keys() {
            let Some(outcome) = self.evaluate_key(key, now) else {
                continue;
            };
            report.evaluated += 1;
            match outcome {
                EvalOutcome::Published { .. } => report.published += 1,
                EvalOutcome::Suppressed { .. } => report.suppressed += 1,
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.ticks += 1;
            stats
                .cycle_duration_ms
                .record(started.elapsed().as_millis() as u64);
        }
        debug!(
            evaluated = report.evaluated,
            published = report.published,
            suppressed = report.suppressed,
            "evaluation pass done"
        );
        report
    }

    /// Evaluate one key under its cell lock. Returns `None` when there was
    /// nothing to evaluate (cell gone, or the filtered window was empty) or
    /// when coverage was lost while the window folded.
    fn evaluate_key(&self, key: SensorKey, now: DateTime<Utc>) -> Option<EvalOutcome> {
        let cell = self.store.existing_cell(key)?;
        let mut cell = cell.lock();

        let window = match self.strategy.window_mode() {
            WindowMode::Drain => cell.drain_pending(),
            WindowMode::Snapshot => cell.snapshot_pending(),
        };
        let cutoff = now - self.policy.max_reading_age;
        let window: Vec<RawMeasurement> = window
            .into_iter()
            .filter(|r| r.timestamp >= cutoff)
            .collect();
        if window.is_empty() {
            return None;
        }

        // A fault must leave the pre-cycle state in place, so the state is
        // only committed on a sane result.
        let prior = cell.estimator.take();
        let outcome = match self.strategy.update(prior.clone(), &window) {
            Ok(output) if estimate_is_finite(output.estimate.as_ref()) => {
                cell.estimator = output.state;
                match self.gate(key, output.estimate, now) {
                    Some(outcome) => outcome,
                    None => {
                        // Coverage was revoked while the window folded; the
                        // cell is already detached, drop the result.
                        debug!(key = %key, "coverage lost mid-cycle, discarding result");
                        return None;
                    }
                }
            }
            Ok(output) => {
                warn!(
                    key = %key,
                    strategy = self.strategy.name(),
                    estimate = ?output.estimate,
                    "non-finite estimate, suppressing"
                );
                cell.estimator = prior;
                self.stats.lock().gate.faults += 1;
                EvalOutcome::Suppressed {
                    reason: SuppressReason::StrategyFault,
                }
            }
            Err(err) => {
                warn!(
                    key = %key,
                    strategy = self.strategy.name(),
                    error = %err,
                    "strategy failed, suppressing"
                );
                cell.estimator = prior;
                self.stats.lock().gate.faults += 1;
                EvalOutcome::Suppressed {
                    reason: SuppressReason::StrategyFault,
                }
            }
        };

        cell.last_outcome = Some(CycleOutcome { at: now, outcome });
        Some(outcome)
    }

    /// Apply the privacy gate and publish on pass. Returns `None` only when
    /// the trixel is no longer covered.
    fn gate(
        &self,
        key: SensorKey,
        estimate: Option<Estimate>,
        now: DateTime<Utc>,
    ) -> Option<EvalOutcome> {
        let Some(est) = estimate else {
            self.stats.lock().gate.suppressed_no_estimate += 1;
            return Some(EvalOutcome::Suppressed {
                reason: SuppressReason::NoEstimate,
            });
        };
        if est.contributors < self.policy.min_contributors {
            self.stats.lock().gate.suppressed_contributors += 1;
            return Some(EvalOutcome::Suppressed {
                reason: SuppressReason::BelowContributorMinimum,
            });
        }
        if est.quality < self.policy.quality_threshold {
            self.stats.lock().gate.suppressed_quality += 1;
            return Some(EvalOutcome::Suppressed {
                reason: SuppressReason::BelowQualityThreshold,
            });
        }

        // Re-checked at the last moment so a sync that revoked this trixel
        // during the fold cannot leak an estimate for it.
        if !self.store.is_covered(key.trixel) {
            return None;
        }

        self.observations.publish(Observation {
            trixel: key.trixel,
            sensor_type: key.sensor_type,
            time: now,
            value: est.value,
            quality: est.quality,
            contributors: est.contributors,
        });
        self.stats.lock().gate.published += 1;
        debug!(
            key = %key,
            value = est.value,
            quality = est.quality,
            contributors = est.contributors,
            "published"
        );
        Some(EvalOutcome::Published {
            value: est.value,
            quality: est.quality,
            contributors: est.contributors,
        })
    }
}

fn estimate_is_finite(estimate: Option<&Estimate>) -> bool {
    estimate.map_or(true, |est| est.value.is_finite() && est.quality.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StrategyError;
    use crate::privatizer::{
        self, distinct_stations, EstimatorState, KalmanState, PrivatizerKind, PrivatizerOutput,
        PrivatizerParams,
    };
    use crate::store::{DelegationSet, TrixelDelegation};
    use crate::types::{SensorType, StationId, TrixelId};

    fn trixel() -> TrixelId {
        TrixelId::from_raw(9).unwrap()
    }

    fn key() -> SensorKey {
        SensorKey::new(trixel(), SensorType::AmbientTemperature)
    }

    fn reading(station: &str, value: f64, now: DateTime<Utc>, age_s: i64) -> RawMeasurement {
        RawMeasurement {
            station: StationId(station.into()),
            trixel: trixel(),
            sensor_type: SensorType::AmbientTemperature,
            value,
            timestamp: now - Duration::seconds(age_s),
        }
    }

    fn policy(min_contributors: u32, quality_threshold: f64) -> GatePolicy {
        GatePolicy {
            min_contributors,
            quality_threshold,
            max_reading_age: Duration::seconds(300),
        }
    }

    fn rig(
        strategy: Arc<dyn Privatizer>,
        policy: GatePolicy,
    ) -> (PrivacyEngine, Arc<TrixelStore>, Arc<ObservationStore>) {
        let store = Arc::new(TrixelStore::new());
        store.apply_delegation(DelegationSet::from_grants([TrixelDelegation {
            trixel: trixel(),
            exclude: false,
        }]));
        let observations = Arc::new(ObservationStore::new());
        let engine = PrivacyEngine::new(policy, strategy, store.clone(), observations.clone());
        (engine, store, observations)
    }

    /// Fails whenever the window carries a value above 1000; passes the rest
    /// through as a fixed estimate so gate behavior stays predictable.
    struct FailOnPoison;

    impl Privatizer for FailOnPoison {
        fn name(&self) -> &'static str {
            "fail_on_poison"
        }

        fn window_mode(&self) -> WindowMode {
            WindowMode::Drain
        }

        fn update(
            &self,
            state: Option<EstimatorState>,
            window: &[RawMeasurement],
        ) -> Result<PrivatizerOutput, StrategyError> {
            if window.iter().any(|r| r.value > 1_000.0) {
                return Err(StrategyError::Failed {
                    strategy: "fail_on_poison",
                    reason: "poison value".into(),
                });
            }
            Ok(PrivatizerOutput {
                state,
                estimate: Some(Estimate {
                    value: 1.0,
                    quality: 1.0,
                    contributors: distinct_stations(window),
                }),
            })
        }
    }

    #[test]
    fn publishes_when_the_gate_passes() {
        let strategy = privatizer::build(PrivatizerKind::NaiveAverage, &PrivatizerParams::default());
        let (engine, store, observations) = rig(strategy, policy(3, 0.0));
        let now = Utc::now();
        for (station, value) in [("a", 20.0), ("b", 21.0), ("c", 20.5)] {
            store.append(reading(station, value, now, 10)).unwrap();
        }

        let report = engine.run_cycle(now);
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.published, 1);

        let obs = observations
            .latest(trixel(), SensorType::AmbientTemperature)
            .unwrap();
        assert!((obs.value - 20.5).abs() < 1e-12, "value {}", obs.value);
        assert_eq!(obs.contributors, 3);
        assert_eq!(obs.time, now);
        assert_eq!(engine.stats_snapshot().gate.published, 1);
    }

    #[test]
    fn too_few_contributors_suppress() {
        let strategy = privatizer::build(PrivatizerKind::NaiveAverage, &PrivatizerParams::default());
        let (engine, store, observations) = rig(strategy, policy(3, 0.0));
        let now = Utc::now();
        store.append(reading("a", 20.0, now, 10)).unwrap();
        store.append(reading("b", 21.0, now, 10)).unwrap();

        let report = engine.run_cycle(now);
        assert_eq!(report.suppressed, 1);
        assert_eq!(observations.total_published(), 0);

        let outcome = store.cell(key()).lock().last_outcome.unwrap();
        assert_eq!(
            outcome.outcome,
            EvalOutcome::Suppressed {
                reason: SuppressReason::BelowContributorMinimum
            }
        );
        assert_eq!(engine.stats_snapshot().gate.suppressed_contributors, 1);
    }

    #[test]
    fn low_quality_suppresses() {
        let strategy = privatizer::build(PrivatizerKind::NaiveAverage, &PrivatizerParams::default());
        // Sample variance of {0, 100, 50} is 2500, quality 4e-4.
        let (engine, store, observations) = rig(strategy, policy(3, 1.0));
        let now = Utc::now();
        for (station, value) in [("a", 0.0), ("b", 100.0), ("c", 50.0)] {
            store.append(reading(station, value, now, 10)).unwrap();
        }

        engine.run_cycle(now);
        assert_eq!(observations.total_published(), 0);
        let outcome = store.cell(key()).lock().last_outcome.unwrap();
        assert_eq!(
            outcome.outcome,
            EvalOutcome::Suppressed {
                reason: SuppressReason::BelowQualityThreshold
            }
        );
    }

    #[test]
    fn stale_readings_are_dropped_from_the_window() {
        let strategy = privatizer::build(PrivatizerKind::NaiveAverage, &PrivatizerParams::default());
        let (engine, store, _observations) = rig(strategy, policy(3, 0.0));
        let now = Utc::now();
        store.append(reading("a", 20.0, now, 10)).unwrap();
        store.append(reading("b", 21.0, now, 10)).unwrap();
        store.append(reading("c", 20.5, now, 400)).unwrap(); // past max age

        engine.run_cycle(now);
        let cell = store.cell(key());
        let cell = cell.lock();
        assert_eq!(
            cell.last_outcome.unwrap().outcome,
            EvalOutcome::Suppressed {
                reason: SuppressReason::BelowContributorMinimum
            }
        );
        // Drained either way; the stale reading stays only for the purger.
        assert_eq!(cell.pending_len(), 0);
        assert_eq!(cell.retained_len(), 3);
    }

    #[test]
    fn fault_suppresses_one_key_and_spares_the_rest() {
        let (engine, store, observations) = rig(Arc::new(FailOnPoison), policy(1, 0.0));
        let other = TrixelId::from_raw(10).unwrap();
        store.apply_delegation(DelegationSet::from_grants([
            TrixelDelegation {
                trixel: trixel(),
                exclude: false,
            },
            TrixelDelegation {
                trixel: other,
                exclude: false,
            },
        ]));
        let now = Utc::now();
        store.append(reading("a", 5_000.0, now, 0)).unwrap();
        store
            .append(RawMeasurement {
                trixel: other,
                ..reading("b", 20.0, now, 0)
            })
            .unwrap();

        let report = engine.run_cycle(now);
        assert_eq!(report.evaluated, 2);
        assert_eq!(report.published, 1);
        assert_eq!(report.suppressed, 1);
        assert_eq!(engine.stats_snapshot().gate.faults, 1);
        assert!(observations
            .latest(other, SensorType::AmbientTemperature)
            .is_some());
        assert_eq!(
            store.cell(key()).lock().last_outcome.unwrap().outcome,
            EvalOutcome::Suppressed {
                reason: SuppressReason::StrategyFault
            }
        );
    }

    #[test]
    fn fault_preserves_the_estimator_state() {
        let (engine, store, _observations) = rig(Arc::new(FailOnPoison), policy(1, 0.0));
        let now = Utc::now();
        let seeded = EstimatorState::Kalman(KalmanState::default());
        store.cell(key()).lock().estimator = Some(seeded.clone());
        store.append(reading("a", 5_000.0, now, 0)).unwrap();

        engine.run_cycle(now);
        assert_eq!(store.cell(key()).lock().estimator, Some(seeded));
    }

    #[test]
    fn empty_window_means_no_evaluation() {
        let strategy = privatizer::build(PrivatizerKind::Average, &PrivatizerParams::default());
        let (engine, store, _observations) = rig(strategy, policy(1, 0.0));
        let seeded = EstimatorState::Kalman(KalmanState::default());
        store.cell(key()).lock().estimator = Some(seeded.clone());

        let report = engine.run_cycle(Utc::now());
        assert_eq!(report.evaluated, 0);
        let cell = store.cell(key());
        let cell = cell.lock();
        assert_eq!(cell.estimator, Some(seeded));
        assert!(cell.last_outcome.is_none());
    }

    #[test]
    fn revoked_keys_are_not_evaluated() {
        let strategy = privatizer::build(PrivatizerKind::NaiveAverage, &PrivatizerParams::default());
        let (engine, store, observations) = rig(strategy, policy(1, 0.0));
        let now = Utc::now();
        store.append(reading("a", 20.0, now, 0)).unwrap();
        store.apply_delegation(DelegationSet::default());

        let report = engine.run_cycle(now);
        assert_eq!(report.evaluated, 0);
        assert_eq!(observations.total_published(), 0);
    }

    #[test]
    fn overlapping_tick_is_skipped_whole() {
        let strategy = privatizer::build(PrivatizerKind::NaiveAverage, &PrivatizerParams::default());
        let (engine, store, _observations) = rig(strategy, policy(1, 0.0));
        let now = Utc::now();
        store.append(reading("a", 20.0, now, 0)).unwrap();

        let running = engine.cycle_guard.lock();
        let report = engine.run_cycle(now);
        assert!(report.skipped);
        assert_eq!(report.evaluated, 0);
        drop(running);

        let report = engine.run_cycle(now);
        assert!(!report.skipped);
        assert_eq!(report.published, 1);
        let stats = engine.stats_snapshot();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.ticks_skipped, 1);
    }
}
