use hdrhistogram::Histogram;
use serde::Serialize;

use crate::error::IngestError;

#[derive(Clone, Debug, Default, Serialize)]
pub struct GateCounters {
    pub published: u64,
    pub suppressed_no_estimate: u64,
    pub suppressed_contributors: u64,
    pub suppressed_quality: u64,
    pub faults: u64,
}

impl GateCounters {
    pub fn suppressed_total(&self) -> u64 {
        self.suppressed_no_estimate
            + self.suppressed_contributors
            + self.suppressed_quality
            + self.faults
    }

    pub fn publish_rate(&self) -> f64 {
        let denom = self.published + self.suppressed_total();
        if denom == 0 {
            return 0.0;
        }
        (self.published as f64) / (denom as f64)
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct IngestCounters {
    pub accepted: u64,
    pub rejected_not_delegated: u64,
    pub rejected_unknown_station: u64,
    pub rejected_invalid: u64,
    pub rejected_inactive: u64,
}

impl IngestCounters {
    pub fn rejected_total(&self) -> u64 {
        self.rejected_not_delegated
            + self.rejected_unknown_station
            + self.rejected_invalid
            + self.rejected_inactive
    }

    pub fn note(&mut self, result: &Result<(), IngestError>) {
        match result {
            Ok(()) => self.accepted += 1,
            Err(IngestError::NotDelegated(_)) => self.rejected_not_delegated += 1,
            Err(IngestError::UnknownStation(_)) => self.rejected_unknown_station += 1,
            Err(IngestError::InvalidSensorType { .. }) | Err(IngestError::InvalidInput(_)) => {
                self.rejected_invalid += 1
            }
            Err(IngestError::NodeInactive) => self.rejected_inactive += 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Histo {
    inner: Histogram<u64>,
}

impl Default for Histo {
    fn default() -> Self {
        Self {
            inner: Histogram::new(3).expect("histo"),
        }
    }
}

impl Histo {
    pub fn record(&mut self, v: u64) {
        let _ = self.inner.record(v.max(1));
    }

    pub fn p50(&self) -> u64 {
        self.inner.value_at_quantile(0.50)
    }

    pub fn p95(&self) -> u64 {
        self.inner.value_at_quantile(0.95)
    }

    pub fn p99(&self) -> u64 {
        self.inner.value_at_quantile(0.99)
    }

    pub fn max(&self) -> u64 {
        self.inner.max()
    }

    pub fn count(&self) -> u64 {
        self.inner.len()
    }

    pub fn summary(&self) -> HistoSummary {
        HistoSummary {
            p50: self.p50(),
            p95: self.p95(),
            p99: self.p99(),
            max: self.max(),
            count: self.count(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct HistoSummary {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub max: u64,
    pub count: u64,
}

#[derive(Clone, Debug, Default)]
pub struct EngineStats {
    pub gate: GateCounters,
    pub ingest: IngestCounters,
    pub ticks: u64,
    pub ticks_skipped: u64,
    pub purged_readings: u64,
    /// Wall time of one full evaluation pass, milliseconds.
    pub cycle_duration_ms: Histo,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            gate: self.gate.clone(),
            ingest: self.ingest.clone(),
            ticks: self.ticks,
            ticks_skipped: self.ticks_skipped,
            purged_readings: self.purged_readings,
            cycle_duration_ms: self.cycle_duration_ms.summary(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub gate: GateCounters,
    pub ingest: IngestCounters,
    pub ticks: u64,
    pub ticks_skipped: u64,
    pub purged_readings: u64,
    pub cycle_duration_ms: HistoSummary,
}
