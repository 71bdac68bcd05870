use crate::error::StrategyError;
use crate::privatizer::{EstimatorState, Privatizer, PrivatizerOutput, WindowMode};
use crate::types::RawMeasurement;

/// Never emits an estimate. Used to disable publication for a deployment
/// while still accepting and retiring raw readings.
pub struct Blank;

impl Privatizer for Blank {
    fn name(&self) -> &'static str {
        "blank"
    }

    fn window_mode(&self) -> WindowMode {
        WindowMode::Snapshot
    }

    fn update(
        &self,
        state: Option<EstimatorState>,
        _window: &[RawMeasurement],
    ) -> Result<PrivatizerOutput, StrategyError> {
        Ok(PrivatizerOutput::empty(state))
    }
}
