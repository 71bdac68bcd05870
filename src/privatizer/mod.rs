//! Pluggable estimation strategies ("privatizers").
//!
//! A privatizer turns one evaluation window of raw readings into an
//! anonymized estimate plus a quality signal. Naive variants recompute from
//! the drained window every cycle and carry no state; incremental variants
//! fold only the new readings into a persisted [`EstimatorState`].
//!
//! The quality convention is shared across the whole family: inverse sample
//! variance, 0 below two folded samples, clamped to [`QUALITY_CEILING`] when
//! the variance collapses to zero.

mod average;
mod blank;
mod kalman;
mod latest;
mod naive_average;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StrategyError;
use crate::types::{Estimate, RawMeasurement, StationId};

pub use average::{Average, SmoothingAverage, SmoothingState};
pub use blank::Blank;
pub use kalman::{Kalman, KalmanState, NaiveKalman, INITIAL_MEAN, INITIAL_VARIANCE};
pub use latest::Latest;
pub use naive_average::{NaiveAverage, NaiveSmoothingAverage};

pub use average::RunningMeanState;

/// Quality reported when the variance collapses to zero with enough samples.
/// Keeps quality finite and serializable.
pub const QUALITY_CEILING: f64 = 1e12;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivatizerKind {
    Blank,
    Latest,
    NaiveAverage,
    Average,
    NaiveSmoothingAverage,
    SmoothingAverage,
    NaiveKalman,
    Kalman,
}

impl PrivatizerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PrivatizerKind::Blank => "blank",
            PrivatizerKind::Latest => "latest",
            PrivatizerKind::NaiveAverage => "naive_average",
            PrivatizerKind::Average => "average",
            PrivatizerKind::NaiveSmoothingAverage => "naive_smoothing_average",
            PrivatizerKind::SmoothingAverage => "smoothing_average",
            PrivatizerKind::NaiveKalman => "naive_kalman",
            PrivatizerKind::Kalman => "kalman",
        }
    }
}

/// Numeric knobs shared by the strategy family. One instance per deployment,
/// fixed at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct PrivatizerParams {
    pub smoothing_alpha: f64,
    pub process_noise: f64,
    pub measurement_noise: f64,
    pub spike_threshold: Option<f64>,
    pub spike_smoothing: f64,
}

impl Default for PrivatizerParams {
    fn default() -> Self {
        Self {
            smoothing_alpha: 0.5,
            process_noise: 0.01,
            measurement_noise: 1.0,
            spike_threshold: None,
            spike_smoothing: 0.1,
        }
    }
}

/// How a strategy consumes the buffered window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowMode {
    /// Take the pending window and clear it; each reading is seen once.
    Drain,
    /// Look at the pending window without clearing it.
    Snapshot,
}

/// Persisted accumulator for the incremental variants, keyed per
/// (trixel, sensor type) by the evaluator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EstimatorState {
    RunningMean(RunningMeanState),
    Smoothing(SmoothingState),
    Kalman(KalmanState),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PrivatizerOutput {
    pub state: Option<EstimatorState>,
    pub estimate: Option<Estimate>,
}

impl PrivatizerOutput {
    pub fn empty(state: Option<EstimatorState>) -> PrivatizerOutput {
        PrivatizerOutput {
            state,
            estimate: None,
        }
    }
}

pub trait Privatizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn window_mode(&self) -> WindowMode;

    /// Fold one evaluation window. `state` is whatever this strategy returned
    /// last cycle (absent on the first cycle and for naive variants).
    fn update(
        &self,
        state: Option<EstimatorState>,
        window: &[RawMeasurement],
    ) -> Result<PrivatizerOutput, StrategyError>;
}

/// Build the configured strategy instance.
pub fn build(kind: PrivatizerKind, params: &PrivatizerParams) -> Arc<dyn Privatizer> {
    match kind {
        PrivatizerKind::Blank => Arc::new(Blank),
        PrivatizerKind::Latest => Arc::new(Latest),
        PrivatizerKind::NaiveAverage => Arc::new(NaiveAverage),
        PrivatizerKind::Average => Arc::new(Average::new(params)),
        PrivatizerKind::NaiveSmoothingAverage => {
            Arc::new(NaiveSmoothingAverage::new(params.smoothing_alpha))
        }
        PrivatizerKind::SmoothingAverage => Arc::new(SmoothingAverage::new(params)),
        PrivatizerKind::NaiveKalman => Arc::new(NaiveKalman::new(params)),
        PrivatizerKind::Kalman => Arc::new(Kalman::new(params)),
    }
}

/// Inverse sample variance, with the sparse-data convention applied.
pub fn inverse_variance_quality(samples: u64, variance: f64) -> f64 {
    if samples < 2 {
        0.0
    } else if variance <= 0.0 {
        QUALITY_CEILING
    } else {
        (1.0 / variance).min(QUALITY_CEILING)
    }
}

/// Window readings in timestamp order. Stable, so arrival order breaks ties.
pub(crate) fn ordered(window: &[RawMeasurement]) -> Vec<&RawMeasurement> {
    let mut refs: Vec<&RawMeasurement> = window.iter().collect();
    refs.sort_by_key(|r| r.timestamp);
    refs
}

pub(crate) fn distinct_stations<'a, I>(readings: I) -> u32
where
    I: IntoIterator<Item = &'a RawMeasurement>,
{
    let mut seen: Vec<&StationId> = Vec::new();
    for reading in readings {
        if !seen.contains(&&reading.station) {
            seen.push(&reading.station);
        }
    }
    seen.len() as u32
}

/// Per-station impulse-noise rejection used by the incremental variants.
/// Each station's value EMA is tracked; a reading deviating from its
/// station's EMA by more than the threshold is excluded from the estimate,
/// while the EMA itself still absorbs it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SpikeFilter {
    threshold: Option<f64>,
    smoothing: f64,
}

impl SpikeFilter {
    pub(crate) fn from_params(params: &PrivatizerParams) -> SpikeFilter {
        SpikeFilter {
            threshold: params.spike_threshold,
            smoothing: params.spike_smoothing,
        }
    }

    /// Returns whether the reading may contribute to the estimate.
    pub(crate) fn admit(
        &self,
        ema: &mut HashMap<StationId, f64>,
        station: &StationId,
        value: f64,
    ) -> bool {
        let Some(threshold) = self.threshold else {
            return true;
        };
        match ema.get_mut(station) {
            None => {
                ema.insert(station.clone(), value);
                true
            }
            Some(entry) => {
                let outlier = (value - *entry).abs() > threshold;
                *entry = *entry * (1.0 - self.smoothing) + self.smoothing * value;
                !outlier
            }
        }
    }
}
