//! Running-mean estimators. [`Average`] keeps a Welford accumulator over all
//! history; [`SmoothingAverage`] keeps an exponentially-weighted mean and
//! variance. Both fold only the new readings each cycle and share their
//! recurrences with the naive variants so that a naive recompute over the
//! same full history lands on the same numbers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::StrategyError;
use crate::privatizer::{
    inverse_variance_quality, ordered, EstimatorState, Privatizer, PrivatizerOutput,
    PrivatizerParams, SpikeFilter, WindowMode,
};
use crate::types::{Estimate, RawMeasurement, StationId};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMeanState {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
    #[serde(default)]
    pub station_ema: HashMap<StationId, f64>,
}

impl RunningMeanState {
    pub(super) fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn sample_variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    fn quality(&self) -> f64 {
        inverse_variance_quality(self.count, self.sample_variance())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SmoothingState {
    pub count: u64,
    pub mean: f64,
    pub variance: f64,
    #[serde(default)]
    pub station_ema: HashMap<StationId, f64>,
}

impl SmoothingState {
    /// West's exponentially-weighted mean/variance recurrence.
    pub(super) fn push(&mut self, alpha: f64, value: f64) {
        if self.count == 0 {
            self.mean = value;
            self.variance = 0.0;
        } else {
            let diff = value - self.mean;
            let incr = alpha * diff;
            self.mean += incr;
            self.variance = (1.0 - alpha) * (self.variance + diff * incr);
        }
        self.count += 1;
    }

    fn quality(&self) -> f64 {
        inverse_variance_quality(self.count, self.variance)
    }
}

/// Incremental running mean over all history.
pub struct Average {
    filter: SpikeFilter,
}

impl Average {
    pub fn new(params: &PrivatizerParams) -> Average {
        Average {
            filter: SpikeFilter::from_params(params),
        }
    }
}

impl Privatizer for Average {
    fn name(&self) -> &'static str {
        "average"
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
            Some(EstimatorState::RunningMean(st)) => st,
            _ => RunningMeanState::default(),
        };

        let mut folded_stations: Vec<&StationId> = Vec::new();
        for reading in ordered(window) {
            if self
                .filter
                .admit(&mut st.station_ema, &reading.station, reading.value)
            {
                st.push(reading.value);
                if !folded_stations.contains(&&reading.station) {
                    folded_stations.push(&reading.station);
                }
            }
        }

        let estimate = (!folded_stations.is_empty()).then(|| Estimate {
            value: st.mean,
            quality: st.quality(),
            contributors: folded_stations.len() as u32,
        });
        Ok(PrivatizerOutput {
            state: Some(EstimatorState::RunningMean(st)),
            estimate,
        })
    }
}

/// Incremental exponentially-weighted moving average.
pub struct SmoothingAverage {
    alpha: f64,
    filter: SpikeFilter,
}

impl SmoothingAverage {
    pub fn new(params: &PrivatizerParams) -> SmoothingAverage {
        SmoothingAverage {
            alpha: params.smoothing_alpha,
            filter: SpikeFilter::from_params(params),
        }
    }
}

impl Privatizer for SmoothingAverage {
    fn name(&self) -> &'static str {
        "smoothing_average"
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
            Some(EstimatorState::Smoothing(st)) => st,
            _ => SmoothingState::default(),
        };

        let mut folded_stations: Vec<&StationId> = Vec::new();
        for reading in ordered(window) {
            if self
                .filter
                .admit(&mut st.station_ema, &reading.station, reading.value)
            {
                st.push(self.alpha, reading.value);
                if !folded_stations.contains(&&reading.station) {
                    folded_stations.push(&reading.station);
                }
            }
        }

        let estimate = (!folded_stations.is_empty()).then(|| Estimate {
            value: st.mean,
            quality: st.quality(),
            contributors: folded_stations.len() as u32,
        });
        Ok(PrivatizerOutput {
            state: Some(EstimatorState::Smoothing(st)),
            estimate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privatizer::testutil::reading;
    use crate::privatizer::QUALITY_CEILING;
    use pretty_assertions::assert_eq;

    fn params() -> PrivatizerParams {
        PrivatizerParams::default()
    }

    #[test]
    fn welford_on_known_window() {
        let window = vec![
            reading("a", 20.0, 0),
            reading("b", 21.0, 1),
            reading("c", 20.5, 2),
        ];
        let out = Average::new(&params()).update(None, &window).unwrap();
        let estimate = out.estimate.unwrap();
        assert!((estimate.value - 20.5).abs() < 1e-12);
        assert!((estimate.quality - 4.0).abs() < 1e-9); // sample variance 0.25
        assert_eq!(estimate.contributors, 3);
    }

    #[test]
    fn single_sample_has_zero_quality() {
        let out = Average::new(&params())
            .update(None, &[reading("a", 20.0, 0)])
            .unwrap();
        assert_eq!(out.estimate.unwrap().quality, 0.0);
    }

    #[test]
    fn identical_samples_clamp_to_ceiling() {
        let window = vec![reading("a", 5.0, 0), reading("b", 5.0, 1)];
        let out = Average::new(&params()).update(None, &window).unwrap();
        assert_eq!(out.estimate.unwrap().quality, QUALITY_CEILING);
    }

    #[test]
    fn split_cycles_match_single_pass() {
        let strategy = Average::new(&params());
        let all = vec![
            reading("a", 10.0, 0),
            reading("b", 11.0, 1),
            reading("a", 12.0, 2),
            reading("c", 9.5, 3),
        ];

        let single = strategy.update(None, &all).unwrap();

        let first = strategy.update(None, &all[..2]).unwrap();
        let second = strategy.update(first.state, &all[2..]).unwrap();

        let lhs = single.estimate.unwrap();
        let rhs = second.estimate.unwrap();
        assert_eq!(lhs.value, rhs.value);
        assert_eq!(lhs.quality, rhs.quality);
        assert_eq!(single.state, second.state);
    }

    #[test]
    fn spike_is_excluded_but_still_feeds_the_ema() {
        let mut p = params();
        p.spike_threshold = Some(3.0);
        p.spike_smoothing = 0.5;
        let strategy = Average::new(&p);

        let calm = strategy
            .update(
                None,
                &[reading("a", 10.0, 0), reading("a", 11.0, 1)],
            )
            .unwrap();
        let spiked = strategy
            .update(calm.state.clone(), &[reading("a", 40.0, 2)])
            .unwrap();

        // The spike produced no new estimate and did not move the mean.
        assert_eq!(spiked.estimate, None);
        match (&calm.state, &spiked.state) {
            (
                Some(EstimatorState::RunningMean(before)),
                Some(EstimatorState::RunningMean(after)),
            ) => {
                assert_eq!(before.count, after.count);
                assert_eq!(before.mean, after.mean);
                // The EMA absorbed the spike anyway.
                assert!(after.station_ema[&StationId("a".into())] > before.station_ema[&StationId("a".into())]);
            }
            other => panic!("unexpected states: {other:?}"),
        }
    }

    #[test]
    fn smoothing_recurrence_hand_check() {
        let strategy = SmoothingAverage::new(&params()); // alpha 0.5
        let window = vec![reading("a", 10.0, 0), reading("b", 20.0, 1)];
        let out = strategy.update(None, &window).unwrap();
        let estimate = out.estimate.unwrap();
        assert!((estimate.value - 15.0).abs() < 1e-12);
        assert!((estimate.quality - 1.0 / 25.0).abs() < 1e-12);
    }

    #[test]
    fn smoothing_split_cycles_match_single_pass() {
        let strategy = SmoothingAverage::new(&params());
        let all = vec![
            reading("a", 10.0, 0),
            reading("b", 10.0, 1),
            reading("c", 20.0, 2),
        ];

        let single = strategy.update(None, &all).unwrap();
        let first = strategy.update(None, &all[..1]).unwrap();
        let second = strategy.update(first.state, &all[1..]).unwrap();

        let lhs = single.estimate.unwrap();
        let rhs = second.estimate.unwrap();
        assert_eq!(lhs.value, rhs.value);
        assert_eq!(lhs.quality, rhs.quality);
        assert_eq!(single.state, second.state);
    }
}
