//! Scalar Kalman estimators. The state is a (mean, variance) pair; predict
//! inflates the variance by the process noise Q, update applies the standard
//! gain `K = P / (P + R)` per reading. [`Kalman`] persists the state across
//! cycles and predicts once per cycle; [`NaiveKalman`] starts from the reset
//! constants every cycle and predicts before every update.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::StrategyError;
use crate::privatizer::{
    distinct_stations, ordered, EstimatorState, Privatizer, PrivatizerOutput, PrivatizerParams,
    SpikeFilter, WindowMode, QUALITY_CEILING,
};
use crate::types::{Estimate, RawMeasurement, StationId};

pub const INITIAL_MEAN: f64 = 0.0;
pub const INITIAL_VARIANCE: f64 = 1000.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KalmanState {
    pub mean: f64,
    pub variance: f64,
    #[serde(default)]
    pub station_ema: HashMap<StationId, f64>,
}

impl Default for KalmanState {
    fn default() -> Self {
        Self {
            mean: INITIAL_MEAN,
            variance: INITIAL_VARIANCE,
            station_ema: HashMap::new(),
        }
    }
}

impl KalmanState {
    pub(super) fn predict(&mut self, q: f64) {
        self.variance += q;
    }

    pub(super) fn update(&mut self, r: f64, value: f64) {
        let gain = self.variance / (self.variance + r);
        self.mean += gain * (value - self.mean);
        self.variance *= 1.0 - gain;
    }

    fn quality(&self) -> f64 {
        if self.variance <= 0.0 {
            QUALITY_CEILING
        } else {
            (1.0 / self.variance).min(QUALITY_CEILING)
        }
    }
}

/// Re-initialized each cycle and run once over the drained window.
pub struct NaiveKalman {
    process_noise: f64,
    measurement_noise: f64,
}

impl NaiveKalman {
    pub fn new(params: &PrivatizerParams) -> NaiveKalman {
        NaiveKalman {
            process_noise: params.process_noise,
            measurement_noise: params.measurement_noise,
        }
    }
}

impl Privatizer for NaiveKalman {
    fn name(&self) -> &'static str {
        "naive_kalman"
    }

    fn window_mode(&self) -> WindowMode {
        WindowMode::Drain
    }

    fn update(
        &self,
        _state: Option<EstimatorState>,
        window: &[RawMeasurement],
    ) -> Result<PrivatizerOutput, StrategyError> {
        if window.is_empty() {
            return Ok(PrivatizerOutput::empty(None));
        }
        let mut st = KalmanState::default();
        for reading in ordered(window) {
            st.predict(self.process_noise);
            st.update(self.measurement_noise, reading.value);
        }
        Ok(PrivatizerOutput {
            state: None,
            estimate: Some(Estimate {
                value: st.mean,
                quality: st.quality(),
                contributors: distinct_stations(window),
            }),
        })
    }
}

/// Persistent scalar Kalman filter.
pub struct Kalman {
    process_noise: f64,
    measurement_noise: f64,
    filter: SpikeFilter,
}

impl Kalman {
    pub fn new(params: &PrivatizerParams) -> Kalman {
        Kalman {
            process_noise: params.process_noise,
            measurement_noise: params.measurement_noise,
            filter: SpikeFilter::from_params(params),
        }
    }
}

impl Privatizer for Kalman {
    fn name(&self) -> &'static str {
        "kalman"
    }

    fn window_mode(&self) -> WindowMode {
        WindowMode::Drain
    }

    fn update(
        &self,
        state: Option<EstimatorState>,
        window: &[RawMeasurement],
    ) -> Result<PrivatizerOutput, StrategyError> {
        let mut st = match state {
            Some(EstimatorState::Kalman(st)) => st,
            _ => KalmanState::default(),
        };

        let mut admitted: Vec<&RawMeasurement> = Vec::new();
        for reading in ordered(window) {
            if self
                .filter
                .admit(&mut st.station_ema, &reading.station, reading.value)
            {
                admitted.push(reading);
            }
        }
        if admitted.is_empty() {
            // No effective readings this cycle: the variance is not inflated.
            return Ok(PrivatizerOutput::empty(Some(EstimatorState::Kalman(st))));
        }

        st.predict(self.process_noise);
        for reading in &admitted {
            st.update(self.measurement_noise, reading.value);
        }

        let estimate = Estimate {
            value: st.mean,
            quality: st.quality(),
            contributors: distinct_stations(admitted.iter().copied()),
        };
        Ok(PrivatizerOutput {
            state: Some(EstimatorState::Kalman(st)),
            estimate: Some(estimate),
        })
    }
}
