use crate::error::StrategyError;
use crate::privatizer::{
    distinct_stations, ordered, EstimatorState, Privatizer, PrivatizerOutput, RunningMeanState,
    SmoothingState, WindowMode,
};
use crate::types::{Estimate, RawMeasurement};

/// Arithmetic mean of the drained window, recomputed from scratch every
/// cycle. Quality is the inverse sample variance of the window.
pub struct NaiveAverage;

impl Privatizer for NaiveAverage {
    fn name(&self) -> &'static str {
        "naive_average"
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
        let mut acc = RunningMeanState::default();
        for reading in window {
            acc.push(reading.value);
        }
        Ok(PrivatizerOutput {
            state: None,
            estimate: Some(Estimate {
                value: acc.mean,
                quality: crate::privatizer::inverse_variance_quality(
                    acc.count,
                    acc.sample_variance(),
                ),
                contributors: distinct_stations(window),
            }),
        })
    }
}

/// Exponentially-weighted mean of the drained window only: the window is
/// folded in timestamp order through the same recurrence the incremental
/// smoothing variant uses, starting fresh each cycle.
pub struct NaiveSmoothingAverage {
    alpha: f64,
}

impl NaiveSmoothingAverage {
    pub fn new(alpha: f64) -> NaiveSmoothingAverage {
        NaiveSmoothingAverage { alpha }
    }
}

impl Privatizer for NaiveSmoothingAverage {
    fn name(&self) -> &'static str {
        "naive_smoothing_average"
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
        let mut acc = SmoothingState::default();
        for reading in ordered(window) {
            acc.push(self.alpha, reading.value);
        }
        Ok(PrivatizerOutput {
            state: None,
            estimate: Some(Estimate {
                value: acc.mean,
                quality: crate::privatizer::inverse_variance_quality(acc.count, acc.variance),
                contributors: distinct_stations(window),
            }),
        })
    }
}
