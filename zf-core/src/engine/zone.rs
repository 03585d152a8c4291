//! Zone control loop
//!
//! One [`ZoneLoop`] runs per monitored zone. It is the same engine for CPU,
//! storage, GPU and fixed zones; what differs is the [`TemperatureSource`] it
//! samples and the optional [`PreSample`] hook (the standby guard on storage
//! zones). The loop decides a level and reports it. Whether that level goes to
//! the BMC directly or into shared-zone arbitration is up to the caller.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zf_error::{Result, ZonefanError};

use super::curve::CurveConfig;
use crate::source::{checked_reading, TemperatureSource};

/// Kind of monitored zone, selected once at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    Cpu,
    Storage,
    Gpu,
    Fixed,
}

impl ZoneKind {
    /// Whether a temperature read failure must stop the daemon.
    ///
    /// CPU and storage sources are plain files or local tools; if they cannot be
    /// read at all the configuration is wrong. GPU tools fail transiently.
    pub fn read_errors_fatal(&self) -> bool {
        matches!(self, ZoneKind::Cpu | ZoneKind::Storage)
    }
}

impl fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneKind::Cpu => write!(f, "CPU"),
            ZoneKind::Storage => write!(f, "HD"),
            ZoneKind::Gpu => write!(f, "GPU"),
            ZoneKind::Fixed => write!(f, "CONST"),
        }
    }
}

/// Level decided by one poll
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelChange {
    pub level: u8,
    pub temperature: f64,
}

/// Hook run right before the temperature is sampled
pub trait PreSample {
    fn before_sample(&mut self) -> Result<()>;
}

/// Mutable state owned by a single loop
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ZoneRuntimeState {
    /// `None` until the first successful poll, so the first poll always fires
    pub last_poll: Option<Instant>,
    /// Last temperature that crossed the sensitivity gate
    pub last_temperature: Option<f64>,
    pub last_level: Option<u8>,
}

pub struct ZoneLoop {
    name: String,
    curve: CurveConfig,
    source: Box<dyn TemperatureSource>,
    pre_sample: Option<Box<dyn PreSample>>,
    state: ZoneRuntimeState,
}

impl ZoneLoop {
    /// Create a loop; the source must expose as many sensors as the curve expects.
    pub fn new(
        name: impl Into<String>,
        curve: CurveConfig,
        source: Box<dyn TemperatureSource>,
    ) -> Result<Self> {
        let name = name.into();
        if source.sensor_count() != curve.sensor_count() {
            return Err(ZonefanError::invalid_config(
                format!("{} sensors", name),
                format!(
                    "curve expects {} sensor(s) but the source provides {}",
                    curve.sensor_count(),
                    source.sensor_count()
                ),
            ));
        }
        Ok(Self {
            name,
            curve,
            source,
            pre_sample: None,
            state: ZoneRuntimeState::default(),
        })
    }

    /// Attach a hook that runs before every sample
    pub fn with_pre_sample(mut self, hook: Box<dyn PreSample>) -> Self {
        self.pre_sample = Some(hook);
        self
    }

    /// Run one control step at time `now`.
    ///
    /// Returns `Ok(None)` when the polling interval has not elapsed, when the
    /// temperature moved less than the sensitivity since the last accepted
    /// reading, or when the resulting level equals the current one. A source
    /// or hook failure leaves the state untouched.
    pub fn poll(&mut self, now: Instant) -> Result<Option<LevelChange>> {
        if let Some(last) = self.state.last_poll {
            if now.saturating_duration_since(last) < self.curve.polling() {
                return Ok(None);
            }
        }

        if let Some(hook) = self.pre_sample.as_mut() {
            hook.before_sample()?;
        }
        let temperature = self.sample()?;
        self.state.last_poll = Some(now);

        if let Some(last) = self.state.last_temperature {
            if (temperature - last).abs() < self.curve.sensitivity() {
                return Ok(None);
            }
        }
        self.state.last_temperature = Some(temperature);

        let level = self.curve.level_for(temperature);
        debug!("{}: {:.1}C -> {}%", self.name, temperature, level);
        if self.state.last_level == Some(level) {
            return Ok(None);
        }

        self.state.last_level = Some(level);
        info!("{}: new fan level > {}%/{:.1}C", self.name, level, temperature);
        Ok(Some(LevelChange { level, temperature }))
    }

    /// Read all sensors and aggregate them into one temperature
    pub fn sample(&mut self) -> Result<f64> {
        let count = self.curve.sensor_count();
        if count == 1 {
            let value = self.source.read(0)?;
            return checked_reading(&self.name, 0, value);
        }

        let mut readings = Vec::with_capacity(count);
        for index in 0..count {
            let value = self.source.read(index)?;
            readings.push(checked_reading(&self.name, index, value)?);
        }
        self.curve
            .aggregation()
            .apply(&readings)
            .ok_or_else(|| ZonefanError::temperature_read(&self.name, "no sensor readings"))
    }

    /// Forget the last level and temperature so the next poll re-applies.
    ///
    /// Used when sending the level to the BMC failed.
    pub fn forget_level(&mut self) {
        self.state.last_level = None;
        self.state.last_temperature = None;
    }

    /// True once the last accepted temperature reached the curve's `min_temp`
    pub fn is_above_threshold(&self) -> bool {
        self.state
            .last_temperature
            .map(|t| t >= self.curve.min_temp())
            .unwrap_or(false)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn curve(&self) -> &CurveConfig {
        &self.curve
    }

    pub fn state(&self) -> &ZoneRuntimeState {
        &self.state
    }

    pub fn last_level(&self) -> Option<u8> {
        self.state.last_level
    }

    pub fn last_temperature(&self) -> Option<f64> {
        self.state.last_temperature
    }
}

impl fmt::Debug for ZoneLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoneLoop")
            .field("name", &self.name)
            .field("curve", &self.curve)
            .field("state", &self.state)
            .field("pre_sample", &self.pre_sample.is_some())
            .finish()
    }
}
