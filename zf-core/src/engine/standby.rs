//! Standby guard for storage arrays
//!
//! Disks of an array are spun down as a group. Once `standby_hd_limit` disks
//! have gone to standby on their own, the guard sends the remaining ones to
//! standby too. When any disk wakes up the array is considered active again;
//! that transition only updates the state, nothing is forced.
//!
//! The guard runs as the [`PreSample`] hook of the storage zone, so the power
//! states are refreshed right before the disk temperatures are read.

use std::fmt;
use std::time::Instant;

use tracing::{info, warn};
use zf_error::{Result, ZonefanError};

use super::zone::PreSample;

/// Power-state probe and control of the devices in one array
#[cfg_attr(test, mockall::automock)]
pub trait DevicePower {
    fn device_count(&self) -> usize;

    /// Human readable name of device `index`, used in errors
    fn device_name(&self, index: usize) -> String;

    /// Whether device `index` is currently in standby
    fn is_standby(&mut self, index: usize) -> Result<bool>;

    /// Send device `index` to standby
    fn force_standby(&mut self, index: usize) -> Result<()>;
}

/// Array-level state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayState {
    Active,
    Standby,
}

impl fmt::Display for ArrayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayState::Active => write!(f, "ACTIVE"),
            ArrayState::Standby => write!(f, "STANDBY"),
        }
    }
}

/// State change performed by one check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayTransition {
    pub from: ArrayState,
    pub to: ArrayState,
    /// Devices that had to be forced into standby
    pub forced: usize,
}

#[derive(Debug, Clone)]
pub struct StandbyState {
    /// Index-aligned with the device list
    pub per_device: Vec<bool>,
    /// True only once every device is confirmed in standby
    pub array_standby: bool,
    pub since: Instant,
}

impl StandbyState {
    fn new(device_count: usize) -> Self {
        Self {
            per_device: vec![false; device_count],
            array_standby: false,
            since: Instant::now(),
        }
    }

    pub fn standby_count(&self) -> usize {
        self.per_device.iter().filter(|s| **s).count()
    }

    /// One character per device: `S` standby, `A` active
    pub fn bitmap(&self) -> String {
        self.per_device
            .iter()
            .map(|s| if *s { 'S' } else { 'A' })
            .collect()
    }

    pub fn array_state(&self) -> ArrayState {
        if self.array_standby {
            ArrayState::Standby
        } else {
            ArrayState::Active
        }
    }
}

pub struct StandbyGuard<P: DevicePower> {
    power: P,
    standby_hd_limit: usize,
    enabled: bool,
    state: StandbyState,
}

impl<P: DevicePower> StandbyGuard<P> {
    /// Build a guard. A single-device array cannot be grouped, so the guard
    /// is built disabled in that case.
    pub fn new(power: P, standby_hd_limit: usize) -> Result<Self> {
        let device_count = power.device_count();
        if device_count == 0 {
            return Err(ZonefanError::invalid_config("devices", "standby guard needs at least one device"));
        }
        if standby_hd_limit > device_count {
            return Err(ZonefanError::invalid_config(
                "standby_hd_limit",
                format!("{} exceeds the number of devices ({})", standby_hd_limit, device_count),
            ));
        }

        let enabled = device_count > 1;
        if !enabled {
            warn!("Standby guard: disabled, only one device in the array");
        }

        Ok(Self {
            power,
            standby_hd_limit,
            enabled,
            state: StandbyState::new(device_count),
        })
    }

    /// Refresh device power states and apply at most one array transition.
    pub fn check(&mut self) -> Result<Option<ArrayTransition>> {
        if !self.enabled {
            return Ok(None);
        }

        for index in 0..self.state.per_device.len() {
            self.state.per_device[index] = self.power.is_standby(index)?;
        }
        let device_count = self.state.per_device.len();
        let standby_count = self.state.standby_count();

        if !self.state.array_standby && standby_count >= self.standby_hd_limit {
            let forced = self.force_remaining()?;
            self.state.array_standby = true;
            Ok(Some(self.stamp(ArrayState::Active, ArrayState::Standby, forced)))
        } else if self.state.array_standby && standby_count < device_count {
            self.state.array_standby = false;
            Ok(Some(self.stamp(ArrayState::Standby, ArrayState::Active, 0)))
        } else {
            Ok(None)
        }
    }

    fn force_remaining(&mut self) -> Result<usize> {
        let mut forced = 0;
        for index in 0..self.state.per_device.len() {
            if self.state.per_device[index] {
                continue;
            }
            self.power.force_standby(index).map_err(|e| ZonefanError::StandbyForce {
                device: self.power.device_name(index),
                reason: e.to_string(),
            })?;
            self.state.per_device[index] = true;
            forced += 1;
        }
        Ok(forced)
    }

    fn stamp(&mut self, from: ArrayState, to: ArrayState, forced: usize) -> ArrayTransition {
        let now = Instant::now();
        let hours = now.saturating_duration_since(self.state.since).as_secs_f64() / 3600.0;
        self.state.since = now;
        info!(
            "Standby guard: Status change {} > {} (after {:.1} hours, {})",
            from,
            to,
            hours,
            self.state.bitmap()
        );
        ArrayTransition { from, to, forced }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> &StandbyState {
        &self.state
    }

    pub fn standby_hd_limit(&self) -> usize {
        self.standby_hd_limit
    }
}

impl<P: DevicePower> PreSample for StandbyGuard<P> {
    fn before_sample(&mut self) -> Result<()> {
        self.check().map(|_| ())
    }
}
