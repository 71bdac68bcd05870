use crate::error::StrategyError;
use crate::privatizer::{
    distinct_stations, ordered, EstimatorState, Privatizer, PrivatizerOutput, WindowMode,
};
use crate::types::{Estimate, RawMeasurement};

/// Publishes the most recent reading's value verbatim. Quality is 1 whenever
/// at least one reading is in the window. Carries no state; the window is
/// snapshotted, so a quiet cycle keeps re-publishing the last known value
/// until the purger ages it out.
pub struct Latest;

impl Privatizer for Latest {
    fn name(&self) -> &'static str {
        "latest"
    }

    fn window_mode(&self) -> WindowMode {
        WindowMode::Snapshot
    }

    fn update(
        &self,
        state: Option<EstimatorState>,
        window: &[RawMeasurement],
    ) -> Result<PrivatizerOutput, StrategyError> {
        let refs = ordered(window);
        let Some(newest) = refs.last() else {
            return Ok(PrivatizerOutput::empty(state));
        };
        Ok(PrivatizerOutput {
            state,
            estimate: Some(Estimate {
                value: newest.value,
                quality: 1.0,
                contributors: distinct_stations(window),
            }),
        })
    }
}
