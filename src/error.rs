use thiserror::Error;

use crate::types::{SensorType, StationId, TrixelId};

/// Rejections surfaced to the ingestion layer. No state is mutated when
/// any of these is returned.
#[derive(Debug, Error, PartialEq)]
pub enum IngestError {
    #[error("trixel {0} is not delegated to this node")]
    NotDelegated(TrixelId),
    #[error("unknown measurement station {0}")]
    UnknownStation(StationId),
    #[error("station {station} does not report {sensor_type}")]
    InvalidSensorType {
        station: StationId,
        sensor_type: SensorType,
    },
    #[error("invalid measurement: {0}")]
    InvalidInput(String),
    #[error("node is deactivated by the lookup service")]
    NodeInactive,
}

/// Estimation failure for one cycle. Caught by the evaluator, never
/// propagated past it.
#[derive(Debug, Error, PartialEq)]
pub enum StrategyError {
    #[error("{strategy} produced a non-finite {quantity}")]
    NonFinite {
        strategy: &'static str,
        quantity: &'static str,
    },
    #[error("{strategy}: {reason}")]
    Failed {
        strategy: &'static str,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup service rejected this node's credential")]
    AuthRejected,
    #[error("lookup service returned status {0}")]
    Status(u16),
    #[error("lookup service transport failure")]
    Transport(#[from] reqwest::Error),
    #[error("invalid lookup endpoint")]
    Endpoint(#[from] url::ParseError),
    #[error("lookup response missing {0}")]
    MalformedResponse(&'static str),
    #[error("registration abandoned after {attempts} attempts")]
    RegistrationFailed { attempts: u32 },
}
