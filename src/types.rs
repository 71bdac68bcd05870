use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// HTM trixel index. Valid ids have an even bit length of at least 4;
/// the level is encoded by the bit length (two bits per subdivision).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrixelId(u64);

impl TrixelId {
    pub fn from_raw(raw: u64) -> Option<TrixelId> {
        let bits = 64 - raw.leading_zeros();
        if bits >= 4 && bits % 2 == 0 {
            Some(TrixelId(raw))
        } else {
            None
        }
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn level(self) -> u8 {
        let bits = 64 - self.0.leading_zeros();
        ((bits - 4) / 2) as u8
    }

    pub fn parent(self) -> Option<TrixelId> {
        if self.level() == 0 {
            None
        } else {
            Some(TrixelId(self.0 >> 2))
        }
    }

    /// Children in subdivision order (one level deeper).
    pub fn children(self) -> [TrixelId; 4] {
        [
            TrixelId(self.0 << 2),
            TrixelId((self.0 << 2) | 1),
            TrixelId((self.0 << 2) | 2),
            TrixelId((self.0 << 2) | 3),
        ]
    }

    /// Whether this trixel is `other` or one of its ancestors.
    pub fn contains(self, other: TrixelId) -> bool {
        let mut current = Some(other);
        while let Some(t) = current {
            if t == self {
                return true;
            }
            current = t.parent();
        }
        false
    }
}

impl fmt::Display for TrixelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StationId(pub String);

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    AmbientTemperature,
    RelativeHumidity,
}

impl SensorType {
    pub const ALL: [SensorType; 2] = [SensorType::AmbientTemperature, SensorType::RelativeHumidity];

    pub fn as_str(self) -> &'static str {
        match self {
            SensorType::AmbientTemperature => "ambient_temperature",
            SensorType::RelativeHumidity => "relative_humidity",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ambient_temperature" => Ok(SensorType::AmbientTemperature),
            "relative_humidity" => Ok(SensorType::RelativeHumidity),
            other => Err(format!("unknown sensor type: {other}")),
        }
    }
}

/// Partitioning key for buffers, estimator state and observations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SensorKey {
    pub trixel: TrixelId,
    pub sensor_type: SensorType,
}

impl SensorKey {
    pub fn new(trixel: TrixelId, sensor_type: SensorType) -> SensorKey {
        SensorKey { trixel, sensor_type }
    }
}

impl fmt::Display for SensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.trixel, self.sensor_type)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawMeasurement {
    pub station: StationId,
    pub trixel: TrixelId,
    pub sensor_type: SensorType,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Strategy output before the privacy gate is applied.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub value: f64,
    pub quality: f64,
    /// Distinct stations whose readings were folded into this estimate.
    pub contributors: u32,
}
