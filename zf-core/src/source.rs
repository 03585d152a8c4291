//! Temperature source contract and sensor aggregation

use serde::{Deserialize, Serialize};
use zf_error::{Result, ZonefanError};

/// Anything that can return the current reading of sensor `index` in °C.
///
/// One source serves one zone. Readings are requested in index order every
/// time the zone samples, and a single failing read fails the whole sample.
#[cfg_attr(test, mockall::automock)]
pub trait TemperatureSource {
    /// Number of sensors behind this source
    fn sensor_count(&self) -> usize;

    /// Read sensor `index` (0-based)
    fn read(&mut self, index: usize) -> Result<f64>;
}

/// How several sensor readings collapse into one zone temperature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Min,
    #[default]
    Avg,
    Max,
}

impl Aggregation {
    /// Collapse readings into a single value. Returns `None` for an empty slice.
    pub fn apply(&self, readings: &[f64]) -> Option<f64> {
        if readings.is_empty() {
            return None;
        }
        let value = match self {
            Aggregation::Min => readings.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregation::Max => readings.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Avg => readings.iter().sum::<f64>() / readings.len() as f64,
        };
        Some(value)
    }
}

impl std::fmt::Display for Aggregation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Aggregation::Min => write!(f, "minimum"),
            Aggregation::Avg => write!(f, "average"),
            Aggregation::Max => write!(f, "maximum"),
        }
    }
}

/// Reject readings that would poison the curve (NaN, infinities)
pub fn checked_reading(source_name: &str, index: usize, value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ZonefanError::temperature_read(
            source_name,
            format!("sensor {} returned a non-finite value ({})", index, value),
        ))
    }
}

/// Constant reading, used by fixed-level zones
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedSource {
    value: f64,
}

impl FixedSource {
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

impl TemperatureSource for FixedSource {
    fn sensor_count(&self) -> usize {
        1
    }

    fn read(&mut self, _index: usize) -> Result<f64> {
        Ok(self.value)
    }
}
