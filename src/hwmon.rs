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

//! hwmon temperature files
//!
//! Resolves CPU package sensors and `drivetemp` disk sensors to `tempN_input`
//! files and reads them as a [`TemperatureSource`].

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use zf_core::constants::temperature::MILLIDEGREE_DIVISOR;
use zf_core::{checked_reading, TemperatureSource};
use zf_error::{Result, ZonefanError};

#[derive(Error, Debug)]
pub enum HwmonError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("No sensor found: {0}")]
    NotFound(String),
}

impl From<HwmonError> for ZonefanError {
    fn from(e: HwmonError) -> Self {
        match e {
            HwmonError::Io(io) => ZonefanError::Io(io),
            other => ZonefanError::config(other.to_string()),
        }
    }
}

pub fn read_trimmed<P: AsRef<Path>>(p: P) -> io::Result<String> {
    let mut s = String::new();
    fs::File::open(p)?.read_to_string(&mut s)?;
    Ok(s.trim().to_string())
}

pub fn extract_index(fname: &str, prefix: &str, suffix: &str) -> Option<usize> {
    if fname.starts_with(prefix) && fname.ends_with(suffix) && fname.len() > prefix.len() + suffix.len() {
        let mid = &fname[prefix.len()..fname.len() - suffix.len()];
        mid.parse().ok()
    } else {
        None
    }
}

/// Read a millidegree file and convert to °C
pub fn read_millidegrees<P: AsRef<Path>>(path: P) -> std::result::Result<f64, HwmonError> {
    let raw = read_trimmed(path.as_ref())?;
    let value = raw
        .parse::<i64>()
        .map_err(|_| HwmonError::Parse(format!("{}: '{}'", path.as_ref().display(), raw)))?;
    Ok(value as f64 / MILLIDEGREE_DIVISOR)
}

/// hwmon directories under `root`, sorted by name for a stable order
fn hwmon_dirs(root: &Path) -> std::result::Result<Vec<PathBuf>, HwmonError> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// `(index, label)` of every labelled temperature input in `dir`
fn temp_labels(dir: &Path) -> Vec<(usize, String)> {
    let Ok(entries) = fs::read_dir(dir) else { return Vec::new() };
    let mut labels: Vec<(usize, String)> = entries
        .flatten()
        .filter_map(|file| {
            let fname = file.file_name();
            let idx = extract_index(&fname.to_string_lossy(), "temp", "_label")?;
            let label = read_trimmed(file.path()).ok()?;
            Some((idx, label))
        })
        .collect();
    labels.sort();
    labels
}

/// Find the package temperature input of every CPU.
///
/// Intel `coretemp` chips expose one "Package id N" label per socket; AMD
/// `k10temp` chips expose `Tctl` (or only `temp1`).
pub fn discover_cpu_sensors(root: &Path) -> std::result::Result<Vec<PathBuf>, HwmonError> {
    let mut packages: Vec<(usize, PathBuf)> = Vec::new();

    for dir in hwmon_dirs(root)? {
        let chip = read_trimmed(dir.join("name")).unwrap_or_default();
        match chip.as_str() {
            "coretemp" => {
                for (idx, label) in temp_labels(&dir) {
                    if let Some(id) = label.strip_prefix("Package id ") {
                        let id = id.trim().parse().unwrap_or(packages.len());
                        packages.push((id, dir.join(format!("temp{}_input", idx))));
                    }
                }
            }
            "k10temp" => {
                let idx = temp_labels(&dir)
                    .into_iter()
                    .find(|(_, label)| label == "Tctl")
                    .map(|(idx, _)| idx)
                    .unwrap_or(1);
                packages.push((packages.len(), dir.join(format!("temp{}_input", idx))));
            }
            _ => {}
        }
    }

    if packages.is_empty() {
        return Err(HwmonError::NotFound(format!(
            "no coretemp or k10temp package sensor under {}",
            root.display()
        )));
    }
    packages.sort_by_key(|(id, _)| *id);
    let paths: Vec<PathBuf> = packages.into_iter().map(|(_, p)| p).collect();
    debug!("CPU sensors: {:?}", paths);
    Ok(paths)
}

/// Temperature input of a disk handled by the `drivetemp` driver
pub fn drivetemp_input(block_root: &Path, device: &str) -> std::result::Result<PathBuf, HwmonError> {
    let name = Path::new(device)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| HwmonError::NotFound(format!("invalid device name '{}'", device)))?;
    let hwmon_root = block_root.join(&name).join("device").join("hwmon");

    hwmon_dirs(&hwmon_root)
        .map_err(|_| HwmonError::NotFound(format!("{} has no hwmon entry (is drivetemp loaded?)", device)))?
        .into_iter()
        .map(|dir| dir.join("temp1_input"))
        .find(|p| p.exists())
        .ok_or_else(|| HwmonError::NotFound(format!("{} has no temp1_input", device)))
}

/// Temperature source over a fixed list of hwmon input files
#[derive(Debug, Clone)]
pub struct HwmonSource {
    name: String,
    paths: Vec<PathBuf>,
}

impl HwmonSource {
    pub fn new(name: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        Self { name: name.into(), paths }
    }

    /// Source over all CPU package sensors found under `root`
    pub fn cpu(name: impl Into<String>, root: &Path) -> Result<Self> {
        Ok(Self::new(name, discover_cpu_sensors(root)?))
    }

    /// Source over the drivetemp sensors of `devices`, in device order
    pub fn drives(name: impl Into<String>, block_root: &Path, devices: &[String]) -> Result<Self> {
        let paths = devices
            .iter()
            .map(|d| drivetemp_input(block_root, d))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self::new(name, paths))
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl TemperatureSource for HwmonSource {
    fn sensor_count(&self) -> usize {
        self.paths.len()
    }

    fn read(&mut self, index: usize) -> Result<f64> {
        let path = self
            .paths
            .get(index)
            .ok_or_else(|| ZonefanError::temperature_read(&self.name, format!("no sensor {}", index)))?;
        let value = read_millidegrees(path).map_err(|e| ZonefanError::temperature_read(&self.name, e.to_string()))?;
        checked_reading(&self.name, index, value)
    }
}
