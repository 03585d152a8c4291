/*
 * This file is part of Zonefan.
 *
 * Copyright (C) 2025 Zonefan contributors
 *
 * Zonefan is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Zonefan is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Zonefan. If not, see <https://www.gnu.org/licenses/>.
 */

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zf_core::constants::{ipmi, paths, tools};
use zf_core::{CurveConfig, CurveParams, GatewayOptions, ZoneKind};
use zf_error::{Result, ZonefanError};

fn default_true() -> bool { true }
fn default_ipmitool() -> String { tools::IPMITOOL.to_string() }
fn default_smartctl() -> String { tools::SMARTCTL.to_string() }
fn default_hdparm() -> String { tools::HDPARM.to_string() }
fn default_nvidia_smi() -> String { tools::NVIDIA_SMI.to_string() }
fn default_fan_mode_delay() -> f64 { ipmi::DEFAULT_FAN_MODE_DELAY.as_secs_f64() }
fn default_fan_level_delay() -> f64 { ipmi::DEFAULT_FAN_LEVEL_DELAY.as_secs_f64() }
fn default_init_timeout() -> f64 { ipmi::INIT_TIMEOUT.as_secs_f64() }
fn default_init_step() -> f64 { ipmi::INIT_STEP.as_secs_f64() }
fn default_standby_hd_limit() -> usize { 1 }
fn default_fixed_polling() -> f64 { 30.0 }

pub fn config_path() -> PathBuf {
    PathBuf::from(paths::CONFIG_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IpmiSection {
    #[serde(default = "default_ipmitool")]
    pub command: String,
    #[serde(default = "default_fan_mode_delay")]
    pub fan_mode_delay: f64,
    #[serde(default = "default_fan_level_delay")]
    pub fan_level_delay: f64,
    /// Whitespace separated ipmitool arguments for a remote BMC
    #[serde(default)]
    pub remote_parameters: String,
    #[serde(default)]
    pub sudo: bool,
    /// Protocol profile name; absent or "auto" detects it from the BMC
    #[serde(default)]
    pub platform_name: Option<String>,
    #[serde(default = "default_init_timeout")]
    pub init_timeout: f64,
    #[serde(default = "default_init_step")]
    pub init_step: f64,
}

impl Default for IpmiSection {
    fn default() -> Self {
        Self {
            command: default_ipmitool(),
            fan_mode_delay: default_fan_mode_delay(),
            fan_level_delay: default_fan_level_delay(),
            remote_parameters: String::new(),
            sudo: false,
            platform_name: None,
            init_timeout: default_init_timeout(),
            init_step: default_init_step(),
        }
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ZonefanError::invalid_config(field, format!("must be 0 or more seconds (got {})", value)))
}

impl IpmiSection {
    pub fn gateway_options(&self) -> Result<GatewayOptions> {
        Ok(GatewayOptions {
            command: self.command.clone(),
            remote_parameters: self.remote_parameters.split_whitespace().map(str::to_string).collect(),
            sudo: self.sudo,
            fan_mode_delay: seconds("ipmi.fan_mode_delay", self.fan_mode_delay)?,
            fan_level_delay: seconds("ipmi.fan_level_delay", self.fan_level_delay)?,
            init_timeout: seconds("ipmi.init_timeout", self.init_timeout)?,
            init_step: seconds("ipmi.init_step", self.init_step)?,
        })
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskTempSource {
    #[default]
    Hwmon,
    Smartctl,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CpuZoneConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub ipmi_zones: Vec<u8>,
    #[serde(default)]
    pub curve: CurveParams,
    /// Explicit hwmon input files; discovered when absent
    #[serde(default)]
    pub hwmon_paths: Option<Vec<PathBuf>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StorageZoneConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub ipmi_zones: Vec<u8>,
    #[serde(default)]
    pub curve: CurveParams,
    pub devices: Vec<String>,
    #[serde(default)]
    pub temp_source: DiskTempSource,
    #[serde(default = "default_smartctl")]
    pub smartctl_path: String,
    #[serde(default = "default_hdparm")]
    pub hdparm_path: String,
    #[serde(default)]
    pub standby_guard_enabled: bool,
    #[serde(default = "default_standby_hd_limit")]
    pub standby_hd_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GpuZoneConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub ipmi_zones: Vec<u8>,
    #[serde(default)]
    pub curve: CurveParams,
    pub gpu_ids: Vec<u32>,
    #[serde(default = "default_nvidia_smi")]
    pub nvidia_smi_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FixedZoneConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub ipmi_zones: Vec<u8>,
    pub level: u8,
    /// Seconds between re-checks
    #[serde(default = "default_fixed_polling")]
    pub polling: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ZoneConfig {
    Cpu(CpuZoneConfig),
    Storage(StorageZoneConfig),
    Gpu(GpuZoneConfig),
    Fixed(FixedZoneConfig),
}

impl ZoneConfig {
    pub fn kind(&self) -> ZoneKind {
        match self {
            ZoneConfig::Cpu(_) => ZoneKind::Cpu,
            ZoneConfig::Storage(_) => ZoneKind::Storage,
            ZoneConfig::Gpu(_) => ZoneKind::Gpu,
            ZoneConfig::Fixed(_) => ZoneKind::Fixed,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ZoneConfig::Cpu(z) => &z.name,
            ZoneConfig::Storage(z) => &z.name,
            ZoneConfig::Gpu(z) => &z.name,
            ZoneConfig::Fixed(z) => &z.name,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            ZoneConfig::Cpu(z) => z.enabled,
            ZoneConfig::Storage(z) => z.enabled,
            ZoneConfig::Gpu(z) => z.enabled,
            ZoneConfig::Fixed(z) => z.enabled,
        }
    }

    pub fn ipmi_zones(&self) -> &[u8] {
        match self {
            ZoneConfig::Cpu(z) => &z.ipmi_zones,
            ZoneConfig::Storage(z) => &z.ipmi_zones,
            ZoneConfig::Gpu(z) => &z.ipmi_zones,
            ZoneConfig::Fixed(z) => &z.ipmi_zones,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub ipmi: IpmiSection,
    pub zones: Vec<ZoneConfig>,
}

impl Config {
    pub fn enabled_zones(&self) -> impl Iterator<Item = &ZoneConfig> {
        self.zones.iter().filter(|z| z.enabled())
    }
}

fn validate_zone(zone: &ZoneConfig) -> Result<()> {
    let field = |f: &str| format!("{}.{}", zone.name(), f);

    if zone.name().trim().is_empty() {
        return Err(ZonefanError::invalid_config("name", "zone names must not be empty"));
    }
    if zone.ipmi_zones().is_empty() {
        return Err(ZonefanError::invalid_config(field("ipmi_zones"), "at least one IPMI zone is required"));
    }

    match zone {
        ZoneConfig::Cpu(z) => {
            let sensors = z.hwmon_paths.as_ref().map_or(1, |p| p.len());
            if sensors == 0 {
                return Err(ZonefanError::invalid_config(field("hwmon_paths"), "must not be empty"));
            }
            CurveConfig::new(sensors, &z.curve)?;
        }
        ZoneConfig::Storage(z) => {
            if z.devices.is_empty() {
                return Err(ZonefanError::invalid_config(field("devices"), "at least one device is required"));
            }
            if z.standby_hd_limit > z.devices.len() {
                return Err(ZonefanError::invalid_config(
                    field("standby_hd_limit"),
                    format!("{} exceeds the number of devices ({})", z.standby_hd_limit, z.devices.len()),
                ));
            }
            CurveConfig::new(z.devices.len(), &z.curve)?;
        }
        ZoneConfig::Gpu(z) => {
            if z.gpu_ids.is_empty() {
                return Err(ZonefanError::invalid_config(field("gpu_ids"), "at least one GPU is required"));
            }
            CurveConfig::new(z.gpu_ids.len(), &z.curve)?;
        }
        ZoneConfig::Fixed(z) => {
            CurveConfig::constant(z.level, seconds(&field("polling"), z.polling)?)?;
        }
    }
    Ok(())
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    seconds("ipmi.fan_mode_delay", cfg.ipmi.fan_mode_delay)?;
    seconds("ipmi.fan_level_delay", cfg.ipmi.fan_level_delay)?;
    seconds("ipmi.init_timeout", cfg.ipmi.init_timeout)?;
    seconds("ipmi.init_step", cfg.ipmi.init_step)?;

    if cfg.enabled_zones().next().is_none() {
        return Err(ZonefanError::config("no enabled zone in configuration"));
    }

    let mut names = HashSet::new();
    for zone in &cfg.zones {
        if !names.insert(zone.name()) {
            return Err(ZonefanError::invalid_config("name", format!("duplicate zone name '{}'", zone.name())));
        }
        if zone.enabled() {
            validate_zone(zone)?;
        }
    }
    Ok(())
}

/// Parse and validate a configuration document
pub fn parse_config(data: &str) -> Result<Config> {
    let cfg: Config = serde_json::from_str(data)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path).map_err(|source| ZonefanError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&data)
}
