//! Discretized temperature-to-level curve
//!
//! The curve is a straight line between (`min_temp`, `min_level`) and
//! (`max_temp`, `max_level`) cut into `steps` equal plateaus. Below the range the
//! level is `min_level`, above it `max_level`.
//!
//! Both rounding operations use round-half-to-even, so for
//! `30..50°C -> 35..100%` in 5 steps a temperature of 32°C (gain 0.5) stays on
//! the first plateau and 36°C (gain 1.5) moves to the third.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use zf_error::{Result, ZonefanError};

use crate::constants::level;
use crate::source::Aggregation;

/// User-facing curve parameters as they appear in the configuration file.
///
/// Signed and floating types are kept on purpose so that out-of-range values
/// reach [`CurveConfig::new`] and get rejected instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CurveParams {
    pub temp_calc: Aggregation,
    pub steps: i64,
    pub sensitivity: f64,
    /// Polling interval in seconds
    pub polling: f64,
    pub min_temp: f64,
    pub max_temp: f64,
    pub min_level: i64,
    pub max_level: i64,
}

impl Default for CurveParams {
    fn default() -> Self {
        Self {
            temp_calc: Aggregation::Avg,
            steps: 6,
            sensitivity: 3.0,
            polling: 2.0,
            min_temp: 30.0,
            max_temp: 60.0,
            min_level: 35,
            max_level: 100,
        }
    }
}

/// Validated, immutable curve of one zone
#[derive(Debug, Clone, PartialEq)]
pub struct CurveConfig {
    sensor_count: usize,
    aggregation: Aggregation,
    steps: u32,
    sensitivity: f64,
    polling: Duration,
    min_temp: f64,
    max_temp: f64,
    min_level: u8,
    max_level: u8,
}

impl CurveConfig {
    /// Validate `params` for a zone with `sensor_count` sensors.
    ///
    /// Nothing is clamped: every out-of-range value is an error.
    pub fn new(sensor_count: usize, params: &CurveParams) -> Result<Self> {
        if sensor_count == 0 {
            return Err(ZonefanError::invalid_config("sensor_count", "at least one sensor is required"));
        }
        if params.steps < 1 || params.steps > u32::MAX as i64 {
            return Err(ZonefanError::invalid_config(
                "steps",
                format!("must be at least 1 (got {})", params.steps),
            ));
        }
        if !(params.sensitivity.is_finite() && params.sensitivity > 0.0) {
            return Err(ZonefanError::invalid_config(
                "sensitivity",
                format!("must be greater than 0 (got {})", params.sensitivity),
            ));
        }
        let polling = Duration::try_from_secs_f64(params.polling).map_err(|_| {
            ZonefanError::invalid_config(
                "polling",
                format!("must be 0 or more seconds (got {})", params.polling),
            )
        })?;
        if !(params.min_temp.is_finite() && params.max_temp.is_finite()) {
            return Err(ZonefanError::invalid_config("min_temp/max_temp", "must be finite numbers"));
        }
        if params.max_temp < params.min_temp {
            return Err(ZonefanError::invalid_config(
                "max_temp",
                format!("{} is below min_temp {}", params.max_temp, params.min_temp),
            ));
        }
        let level_range = level::MIN as i64..=level::MAX as i64;
        if !level_range.contains(&params.min_level) || !level_range.contains(&params.max_level) {
            return Err(ZonefanError::invalid_config(
                "min_level/max_level",
                format!("must be within 0..=100 (got {}..{})", params.min_level, params.max_level),
            ));
        }
        if params.max_level < params.min_level {
            return Err(ZonefanError::invalid_config(
                "max_level",
                format!("{} is below min_level {}", params.max_level, params.min_level),
            ));
        }

        Ok(Self {
            sensor_count,
            aggregation: params.temp_calc,
            steps: params.steps as u32,
            sensitivity: params.sensitivity,
            polling,
            min_temp: params.min_temp,
            max_temp: params.max_temp,
            min_level: params.min_level as u8,
            max_level: params.max_level as u8,
        })
    }

    /// A curve that maps every temperature to `level`
    pub fn constant(level: u8, polling: Duration) -> Result<Self> {
        let params = CurveParams {
            temp_calc: Aggregation::Avg,
            steps: 1,
            sensitivity: 1.0,
            polling: polling.as_secs_f64(),
            min_temp: 0.0,
            max_temp: 0.0,
            min_level: level as i64,
            max_level: level as i64,
        };
        Self::new(1, &params)
    }

    /// Map a temperature to a fan level
    pub fn level_for(&self, temp: f64) -> u8 {
        if temp <= self.min_temp {
            return self.min_level;
        }
        if temp >= self.max_temp {
            return self.max_level;
        }

        let steps = self.steps as f64;
        let temp_step = (self.max_temp - self.min_temp) / steps;
        let level_step = (self.max_level - self.min_level) as f64 / steps;
        let gain = ((temp - self.min_temp) / temp_step).round_ties_even();
        let level = (gain * level_step).round_ties_even() + self.min_level as f64;

        level.clamp(self.min_level as f64, self.max_level as f64) as u8
    }

    pub fn sensor_count(&self) -> usize {
        self.sensor_count
    }

    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn sensitivity(&self) -> f64 {
        self.sensitivity
    }

    pub fn polling(&self) -> Duration {
        self.polling
    }

    pub fn min_temp(&self) -> f64 {
        self.min_temp
    }

    pub fn max_temp(&self) -> f64 {
        self.max_temp
    }

    pub fn min_level(&self) -> u8 {
        self.min_level
    }

    pub fn max_level(&self) -> u8 {
        self.max_level
    }
}
