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

//! External tools: process execution, smartctl, hdparm and nvidia-smi

use std::fs;
use std::io;
use std::process::Command;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, trace};
use zf_core::{checked_reading, display_command, CommandOutput, CommandRunner, DevicePower, TemperatureSource};
use zf_error::{Result, ZonefanError};

lazy_static! {
    static ref SCSI_TEMP: Option<Regex> = Regex::new(r"(?m)^Current Drive Temperature:\s+(\d+)").ok();
    static ref NVME_TEMP: Option<Regex> = Regex::new(r"(?m)^Temperature:\s+(\d+)\s+Celsius").ok();
    static ref ATA_TEMP: Option<Regex> =
        Regex::new(r"(?m)^\s*194\s+\S+\s+0x[0-9a-fA-F]+(?:\s+\S+){6}\s+(\d+)").ok();
    static ref ATA_AIRFLOW_TEMP: Option<Regex> =
        Regex::new(r"(?m)^\s*190\s+\S+\s+0x[0-9a-fA-F]+(?:\s+\S+){6}\s+(\d+)").ok();
}

/// smartctl exit status bits that mean the command itself failed
const SMARTCTL_FATAL_BITS: i32 = 0b11;

/// Runs programs with `std::process::Command`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        trace!("exec: {}", display_command(program, args));
        let output = Command::new(program).args(args).output().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ZonefanError::CommandNotFound { program: program.to_string() },
            _ => ZonefanError::Io(e),
        })?;
        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Board name from DMI, used for the startup banner
pub fn read_board_name() -> String {
    let read_trim = |p: &str| -> Option<String> {
        fs::read_to_string(p)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let vendor = read_trim("/sys/devices/virtual/dmi/id/board_vendor");
    let name = read_trim("/sys/devices/virtual/dmi/id/board_name");
    match (vendor, name) {
        (Some(v), Some(n)) => format!("{} {}", v, n),
        (Some(v), None) => v,
        (None, Some(n)) => n,
        (None, None) => "unknown board".to_string(),
    }
}

fn capture(re: &Option<Regex>, output: &str, group: usize) -> Option<f64> {
    re.as_ref()?
        .captures(output)?
        .get(group)?
        .as_str()
        .parse()
        .ok()
}

/// Extract the drive temperature from `smartctl -A` output.
///
/// SCSI/SAS drives report "Current Drive Temperature", ATA drives the raw
/// value of attribute 194 (190 only when 194 is missing), NVMe drives a
/// "Temperature:" line.
pub fn parse_smartctl_temperature(output: &str) -> Option<f64> {
    capture(&SCSI_TEMP, output, 1)
        .or_else(|| capture(&ATA_TEMP, output, 1))
        .or_else(|| capture(&ATA_AIRFLOW_TEMP, output, 1))
        .or_else(|| capture(&NVME_TEMP, output, 1))
}

/// `smartctl -n standby` output of a disk that was left asleep
fn reports_standby(stdout: &str) -> bool {
    stdout.contains("STANDBY") || stdout.contains("SLEEP")
}

/// Disk temperatures read with smartctl.
///
/// Sleeping disks are not woken up: they report their last reading, or the
/// standby reading when none was taken yet.
pub struct SmartctlSource<R: CommandRunner> {
    name: String,
    runner: R,
    smartctl: String,
    devices: Vec<String>,
    last: Vec<Option<f64>>,
    standby_reading: Option<f64>,
}

impl<R: CommandRunner> SmartctlSource<R> {
    pub fn new(name: impl Into<String>, runner: R, smartctl: impl Into<String>, devices: Vec<String>) -> Self {
        Self {
            name: name.into(),
            runner,
            smartctl: smartctl.into(),
            last: vec![None; devices.len()],
            devices,
            standby_reading: None,
        }
    }

    /// Temperature assumed for a sleeping disk that was never read
    pub fn with_standby_reading(mut self, temperature: f64) -> Self {
        self.standby_reading = Some(temperature);
        self
    }

    fn asleep(&self, index: usize, device: &str) -> Result<f64> {
        let value = self.last[index].or(self.standby_reading).ok_or_else(|| {
            ZonefanError::temperature_read(&self.name, format!("{} is in standby and was never read", device))
        })?;
        debug!("{}: in standby, using {:.1}C", device, value);
        Ok(value)
    }
}

impl<R: CommandRunner> TemperatureSource for SmartctlSource<R> {
    fn sensor_count(&self) -> usize {
        self.devices.len()
    }

    fn read(&mut self, index: usize) -> Result<f64> {
        let device = self
            .devices
            .get(index)
            .ok_or_else(|| ZonefanError::temperature_read(&self.name, format!("no device {}", index)))?;
        let args = ["-n", "standby", "-A", device.as_str()].map(String::from);
        let output = self.runner.run(&self.smartctl, &args)?;
        if reports_standby(&output.stdout) {
            return self.asleep(index, device);
        }
        if output.exit_code.map_or(true, |c| c & SMARTCTL_FATAL_BITS != 0) {
            return Err(ZonefanError::temperature_read(
                &self.name,
                format!("smartctl failed on {} ({:?}): {}", device, output.exit_code, output.stderr.trim()),
            ));
        }
        let value = parse_smartctl_temperature(&output.stdout).ok_or_else(|| {
            ZonefanError::temperature_read(&self.name, format!("no temperature in smartctl output for {}", device))
        })?;
        let value = checked_reading(&self.name, index, value)?;
        self.last[index] = Some(value);
        Ok(value)
    }
}

/// GPU temperatures read with nvidia-smi
pub struct NvidiaSource<R: CommandRunner> {
    name: String,
    runner: R,
    nvidia_smi: String,
    gpu_ids: Vec<u32>,
}

impl<R: CommandRunner> NvidiaSource<R> {
    pub fn new(name: impl Into<String>, runner: R, nvidia_smi: impl Into<String>, gpu_ids: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            runner,
            nvidia_smi: nvidia_smi.into(),
            gpu_ids,
        }
    }
}

impl<R: CommandRunner> TemperatureSource for NvidiaSource<R> {
    fn sensor_count(&self) -> usize {
        self.gpu_ids.len()
    }

    fn read(&mut self, index: usize) -> Result<f64> {
        let id = self
            .gpu_ids
            .get(index)
            .ok_or_else(|| ZonefanError::temperature_read(&self.name, format!("no GPU {}", index)))?;
        let args = vec![
            "--query-gpu=temperature.gpu".to_string(),
            "--format=csv,noheader,nounits".to_string(),
            "-i".to_string(),
            id.to_string(),
        ];
        let output = self.runner.run(&self.nvidia_smi, &args)?;
        if !output.success() {
            return Err(ZonefanError::temperature_read(
                &self.name,
                format!("nvidia-smi failed for GPU {}: {}", id, output.stderr.trim()),
            ));
        }
        let value = output
            .stdout
            .lines()
            .next()
            .and_then(|l| l.trim().parse::<f64>().ok())
            .ok_or_else(|| {
                ZonefanError::temperature_read(&self.name, format!("unexpected nvidia-smi output: {:?}", output.stdout))
            })?;
        checked_reading(&self.name, index, value)
    }
}

/// Disk power states probed with smartctl and forced with hdparm
pub struct SmartctlPower<R: CommandRunner> {
    runner: R,
    smartctl: String,
    hdparm: String,
    devices: Vec<String>,
}

impl<R: CommandRunner> SmartctlPower<R> {
    pub fn new(runner: R, smartctl: impl Into<String>, hdparm: impl Into<String>, devices: Vec<String>) -> Self {
        Self {
            runner,
            smartctl: smartctl.into(),
            hdparm: hdparm.into(),
            devices,
        }
    }

    fn device(&self, index: usize) -> Result<&str> {
        self.devices
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| ZonefanError::generic(format!("no device {}", index)))
    }
}

impl<R: CommandRunner> DevicePower for SmartctlPower<R> {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device_name(&self, index: usize) -> String {
        self.devices.get(index).cloned().unwrap_or_else(|| format!("device {}", index))
    }

    // smartctl exits non-zero when `-n standby` skips a sleeping disk, so only
    // the output is inspected
    fn is_standby(&mut self, index: usize) -> Result<bool> {
        let device = self.device(index)?.to_string();
        let args = vec!["-i".to_string(), "-n".to_string(), "standby".to_string(), device.clone()];
        let output = self.runner.run(&self.smartctl, &args)?;
        let standby = reports_standby(&output.stdout);
        debug!("{}: {}", device, if standby { "standby" } else { "active" });
        Ok(standby)
    }

    fn force_standby(&mut self, index: usize) -> Result<()> {
        let device = self.device(index)?.to_string();
        let args = vec!["-y".to_string(), device.clone()];
        let output = self.runner.run(&self.hdparm, &args)?;
        if output.success() {
            Ok(())
        } else {
            Err(ZonefanError::StandbyForce {
                device,
                reason: output.stderr.trim().to_string(),
            })
        }
    }
}
