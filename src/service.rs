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

//! Service loop
//!
//! Every cycle polls all zones in configuration order, sends exclusive IPMI
//! zones directly and hands shared ones to the arbiter once all zones have
//! polled. Shutdown is only honoured between cycles.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use zf_core::constants::{paths, timing};
use zf_core::{
    CommandRunner, ControllerGateway, CurveConfig, DemandTable, FixedSource, SharedZoneArbiter,
    StandbyGuard, TemperatureSource, ZoneDemand, ZoneKind, ZoneLoop,
};
use zf_error::{Result, ZonefanError};

use crate::config::{Config, DiskTempSource, ZoneConfig};
use crate::hwmon::HwmonSource;
use crate::system::{NvidiaSource, SmartctlPower, SmartctlSource};

/// Filesystem roots used for sensor discovery
#[derive(Debug, Clone)]
pub struct SysfsRoots {
    pub hwmon: PathBuf,
    pub block: PathBuf,
}

impl Default for SysfsRoots {
    fn default() -> Self {
        Self {
            hwmon: PathBuf::from(paths::HWMON_BASE),
            block: PathBuf::from(paths::BLOCK_BASE),
        }
    }
}

/// One zone loop plus the physical zones it drives
#[derive(Debug)]
pub struct ManagedZone {
    pub kind: ZoneKind,
    pub zone: ZoneLoop,
    pub ipmi_zones: Vec<u8>,
}

impl ManagedZone {
    pub fn new(kind: ZoneKind, zone: ZoneLoop, ipmi_zones: Vec<u8>) -> Self {
        Self { kind, zone, ipmi_zones }
    }
}

/// Build the loop of one configured zone
pub fn build_zone<R>(cfg: &ZoneConfig, runner: &R, roots: &SysfsRoots) -> Result<ManagedZone>
where
    R: CommandRunner + Clone + 'static,
{
    let name = cfg.name().to_string();
    let zone = match cfg {
        ZoneConfig::Cpu(z) => {
            let source = match &z.hwmon_paths {
                Some(paths) => HwmonSource::new(&name, paths.clone()),
                None => HwmonSource::cpu(&name, &roots.hwmon)?,
            };
            curve_loop(&name, &z.curve, Box::new(source))?
        }
        ZoneConfig::Storage(z) => {
            let source: Box<dyn TemperatureSource> = match z.temp_source {
                DiskTempSource::Hwmon => Box::new(HwmonSource::drives(&name, &roots.block, &z.devices)?),
                DiskTempSource::Smartctl => Box::new(
                    SmartctlSource::new(&name, runner.clone(), &z.smartctl_path, z.devices.clone())
                        .with_standby_reading(z.curve.min_temp),
                ),
            };
            let zone = curve_loop(&name, &z.curve, source)?;
            if z.standby_guard_enabled {
                let power = SmartctlPower::new(runner.clone(), &z.smartctl_path, &z.hdparm_path, z.devices.clone());
                let guard = StandbyGuard::new(power, z.standby_hd_limit)?;
                info!("{}: standby guard enabled (limit {})", name, z.standby_hd_limit);
                zone.with_pre_sample(Box::new(guard))
            } else {
                zone
            }
        }
        ZoneConfig::Gpu(z) => {
            let source = NvidiaSource::new(&name, runner.clone(), &z.nvidia_smi_path, z.gpu_ids.clone());
            curve_loop(&name, &z.curve, Box::new(source))?
        }
        ZoneConfig::Fixed(z) => {
            let polling = Duration::try_from_secs_f64(z.polling)
                .map_err(|_| ZonefanError::invalid_config(format!("{}.polling", name), "must be 0 or more seconds"))?;
            let curve = CurveConfig::constant(z.level, polling)?;
            ZoneLoop::new(&name, curve, Box::new(FixedSource::new(0.0)))?
        }
    };

    info!("{} ({}): {:?} -> IPMI zone(s) {:?}", name, cfg.kind(), zone.curve(), cfg.ipmi_zones());
    Ok(ManagedZone::new(cfg.kind(), zone, cfg.ipmi_zones().to_vec()))
}

fn curve_loop(name: &str, params: &zf_core::CurveParams, source: Box<dyn TemperatureSource>) -> Result<ZoneLoop> {
    let curve = CurveConfig::new(source.sensor_count(), params)?;
    ZoneLoop::new(name, curve, source)
}

/// Build every enabled zone in configuration order
pub fn build_zones<R>(cfg: &Config, runner: &R, roots: &SysfsRoots) -> Result<Vec<ManagedZone>>
where
    R: CommandRunner + Clone + 'static,
{
    cfg.enabled_zones().map(|z| build_zone(z, runner, roots)).collect()
}

pub struct Scheduler<'a, R: CommandRunner> {
    gateway: &'a ControllerGateway<R>,
    zones: Vec<ManagedZone>,
    shared: BTreeSet<u8>,
    arbiter: SharedZoneArbiter,
    /// Shared zones whose last arbitration failed
    pending: BTreeSet<u8>,
}

impl<'a, R: CommandRunner> Scheduler<'a, R> {
    pub fn new(gateway: &'a ControllerGateway<R>, zones: Vec<ManagedZone>) -> Self {
        let mut users: BTreeMap<u8, usize> = BTreeMap::new();
        for managed in &zones {
            for id in managed.ipmi_zones.iter().collect::<BTreeSet<_>>() {
                *users.entry(*id).or_default() += 1;
            }
        }
        let shared: BTreeSet<u8> = users.into_iter().filter(|(_, n)| *n > 1).map(|(id, _)| id).collect();
        if !shared.is_empty() {
            info!("Shared IPMI zones: {:?}", shared);
        }

        Self {
            gateway,
            zones,
            shared,
            arbiter: SharedZoneArbiter::new(),
            pending: BTreeSet::new(),
        }
    }

    /// Run one cycle at time `now`
    pub fn run_cycle(&mut self, now: Instant) -> Result<()> {
        let mut changed_shared = std::mem::take(&mut self.pending);
        // Zones whose exclusive dispatch failed; their level memory is reset
        // once their shared demands are recorded
        let mut failed: Vec<usize> = Vec::new();

        for (index, managed) in self.zones.iter_mut().enumerate() {
            let change = match managed.zone.poll(now) {
                Ok(Some(change)) => change,
                Ok(None) => continue,
                Err(e) if e.is_fatal() || managed.kind.read_errors_fatal() => {
                    error!("{}: {}", managed.zone.name(), e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("{}: {} (skipped)", managed.zone.name(), e);
                    continue;
                }
            };

            let (shared, exclusive): (Vec<u8>, Vec<u8>) =
                managed.ipmi_zones.iter().partition(|id| self.shared.contains(*id));
            changed_shared.extend(shared);

            if !exclusive.is_empty() {
                if let Err(e) = self.gateway.set_level_many(&exclusive, change.level) {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    warn!("{}: could not apply {}%: {}", managed.zone.name(), change.level, e);
                    failed.push(index);
                }
            }
        }

        let table = self.demand_table(&changed_shared);
        for index in failed {
            self.zones[index].zone.forget_level();
        }
        if table.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.arbiter.resolve(table, self.gateway) {
            if e.is_fatal() {
                return Err(e);
            }
            warn!("Shared zones: {}", e);
            self.pending = changed_shared;
        }
        Ok(())
    }

    /// Demands of every contributor to the given shared zones
    fn demand_table(&self, zones: &BTreeSet<u8>) -> DemandTable {
        let mut table = DemandTable::new();
        for id in zones {
            for managed in self.zones.iter().filter(|m| m.ipmi_zones.contains(id)) {
                if let (Some(level), Some(temperature)) = (managed.zone.last_level(), managed.zone.last_temperature()) {
                    table.record(
                        *id,
                        ZoneDemand {
                            controller_name: managed.zone.name().to_string(),
                            desired_level: level,
                            desired_temperature: temperature,
                            is_above_threshold: managed.zone.is_above_threshold(),
                        },
                    );
                }
            }
        }
        table
    }

    /// Half the shortest polling interval, never below the cycle floor
    pub fn sleep_interval(&self) -> Duration {
        self.zones
            .iter()
            .map(|m| m.zone.curve().polling() / 2)
            .min()
            .unwrap_or(timing::MIN_CYCLE_SLEEP)
            .max(timing::MIN_CYCLE_SLEEP)
    }

    /// Cycle until `shutdown` is set
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let interval = self.sleep_interval();
        info!("Service loop started ({} zone(s), cycle {:?})", self.zones.len(), interval);
        while !shutdown.load(Ordering::SeqCst) {
            self.run_cycle(Instant::now())?;
            thread::sleep(interval);
        }
        info!("Service loop stopped");
        Ok(())
    }

    /// Every physical zone driven by this scheduler
    pub fn ipmi_zones(&self) -> Vec<u8> {
        all_ipmi_zones(&self.zones)
    }

    pub fn shared_zones(&self) -> &BTreeSet<u8> {
        &self.shared
    }

    pub fn zones(&self) -> &[ManagedZone] {
        &self.zones
    }

    pub fn arbiter(&self) -> &SharedZoneArbiter {
        &self.arbiter
    }
}

/// Sorted, deduplicated physical zone ids of `zones`
pub fn all_ipmi_zones(zones: &[ManagedZone]) -> Vec<u8> {
    zones
        .iter()
        .flat_map(|m| m.ipmi_zones.iter().copied())
        .collect::<BTreeSet<u8>>()
        .into_iter()
        .collect()
}

/// Drives the listed zones to full speed when dropped, so fans never stay
/// at a low level after the service stops or fails
pub struct FullSpeedGuard<'a, R: CommandRunner> {
    gateway: &'a ControllerGateway<R>,
    zones: Vec<u8>,
}

impl<'a, R: CommandRunner> FullSpeedGuard<'a, R> {
    pub fn new(gateway: &'a ControllerGateway<R>, zones: Vec<u8>) -> Self {
        Self { gateway, zones }
    }
}

impl<R: CommandRunner> Drop for FullSpeedGuard<'_, R> {
    fn drop(&mut self) {
        if self.zones.is_empty() {
            return;
        }
        match self.gateway.force_full_speed(&self.zones) {
            Ok(()) => info!("Fans of IPMI zone(s) {:?} set to full speed", self.zones),
            Err(e) => error!("Could not restore full speed on {:?}: {}", self.zones, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_utils::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use zf_core::{CommandOutput, CurveParams, GatewayOptions, ProtocolProfile};

    /// Records set-level calls as (zone, level); fails zones listed in `fail`
    #[derive(Clone, Default)]
    struct Bmc {
        calls: Rc<RefCell<Vec<(u8, u8)>>>,
        fail: Rc<RefCell<Vec<u8>>>,
    }

    impl CommandRunner for Bmc {
        fn run(&self, _program: &str, args: &[String]) -> Result<CommandOutput> {
            // raw 0x30 0x70 0x66 0x01 <zone> <level>
            let zone: u8 = args[5].parse().unwrap();
            let level: u8 = args[6].parse().unwrap();
            if self.fail.borrow().contains(&zone) {
                return Ok(CommandOutput::failed(1, "Unable to send RAW command"));
            }
            self.calls.borrow_mut().push((zone, level));
            Ok(CommandOutput::ok(""))
        }
    }

    /// Temperature shared with the test body
    struct Dial(Rc<RefCell<f64>>);

    impl TemperatureSource for Dial {
        fn sensor_count(&self) -> usize {
            1
        }
        fn read(&mut self, _index: usize) -> Result<f64> {
            Ok(*self.0.borrow())
        }
    }

    struct Broken;

    impl TemperatureSource for Broken {
        fn sensor_count(&self) -> usize {
            1
        }
        fn read(&mut self, _index: usize) -> Result<f64> {
            Err(ZonefanError::temperature_read("broken", "tool failed"))
        }
    }

    fn gateway(bmc: &Bmc) -> ControllerGateway<Bmc> {
        let options = GatewayOptions {
            fan_mode_delay: Duration::ZERO,
            fan_level_delay: Duration::ZERO,
            ..Default::default()
        };
        ControllerGateway::new(bmc.clone(), options, ProtocolProfile::Generic)
    }

    fn params(polling: f64) -> CurveParams {
        CurveParams {
            steps: 5,
            sensitivity: 1.0,
            polling,
            min_temp: 30.0,
            max_temp: 50.0,
            min_level: 35,
            max_level: 100,
            ..Default::default()
        }
    }

    fn dial_zone(kind: ZoneKind, name: &str, temp: &Rc<RefCell<f64>>, ipmi: &[u8]) -> ManagedZone {
        let curve = CurveConfig::new(1, &params(1.0)).unwrap();
        let zone = ZoneLoop::new(name, curve, Box::new(Dial(temp.clone()))).unwrap();
        ManagedZone::new(kind, zone, ipmi.to_vec())
    }

    #[test]
    fn test_exclusive_and_shared_dispatch() {
        let bmc = Bmc::default();
        let gw = gateway(&bmc);
        let cpu = Rc::new(RefCell::new(41.0));
        let hd = Rc::new(RefCell::new(25.0));
        let zones = vec![
            dial_zone(ZoneKind::Cpu, "CPU zone", &cpu, &[0, 1]),
            dial_zone(ZoneKind::Storage, "HD zone", &hd, &[1]),
        ];
        let mut scheduler = Scheduler::new(&gw, zones);
        assert_eq!(scheduler.shared_zones().iter().copied().collect::<Vec<_>>(), vec![1]);

        let start = Instant::now();
        scheduler.run_cycle(start).unwrap();
        // CPU is above its threshold, the disks are not: CPU wins zone 1
        assert_eq!(*bmc.calls.borrow(), vec![(0, 74), (1, 74)]);
        assert_eq!(scheduler.arbiter().applied_level(1), Some(74));
    }

    #[test]
    fn test_stable_hot_zone_still_counts() {
        let bmc = Bmc::default();
        let gw = gateway(&bmc);
        let cpu = Rc::new(RefCell::new(49.0));
        let hd = Rc::new(RefCell::new(25.0));
        let zones = vec![
            dial_zone(ZoneKind::Cpu, "CPU zone", &cpu, &[1]),
            dial_zone(ZoneKind::Storage, "HD zone", &hd, &[1]),
        ];
        let mut scheduler = Scheduler::new(&gw, zones);
        let start = Instant::now();
        scheduler.run_cycle(start).unwrap();
        assert_eq!(*bmc.calls.borrow(), vec![(1, 100)]);

        // Disks warm up while the CPU stays hot and unchanged
        *hd.borrow_mut() = 36.0;
        scheduler.run_cycle(start + Duration::from_secs(1)).unwrap();
        assert_eq!(*bmc.calls.borrow(), vec![(1, 100)]);
    }

    #[test]
    fn test_all_idle_takes_minimum() {
        let bmc = Bmc::default();
        let gw = gateway(&bmc);
        let a = Rc::new(RefCell::new(20.0));
        let b = Rc::new(RefCell::new(25.0));
        let zones = vec![
            dial_zone(ZoneKind::Cpu, "A", &a, &[0]),
            dial_zone(ZoneKind::Gpu, "B", &b, &[0]),
        ];
        let mut scheduler = Scheduler::new(&gw, zones);
        scheduler.run_cycle(Instant::now()).unwrap();
        assert_eq!(*bmc.calls.borrow(), vec![(0, 35)]);
    }

    #[test]
    fn test_failed_exclusive_dispatch_is_retried() {
        let bmc = Bmc::default();
        bmc.fail.borrow_mut().push(0);
        let gw = gateway(&bmc);
        let cpu = Rc::new(RefCell::new(41.0));
        let mut scheduler = Scheduler::new(&gw, vec![dial_zone(ZoneKind::Cpu, "CPU zone", &cpu, &[0])]);
        let start = Instant::now();
        scheduler.run_cycle(start).unwrap();
        assert!(bmc.calls.borrow().is_empty());
        assert_eq!(scheduler.zones()[0].zone.last_level(), None);

        bmc.fail.borrow_mut().clear();
        scheduler.run_cycle(start + Duration::from_secs(1)).unwrap();
        assert_eq!(*bmc.calls.borrow(), vec![(0, 74)]);
    }

    #[test]
    fn test_failed_exclusive_dispatch_keeps_shared_demand() {
        let bmc = Bmc::default();
        bmc.fail.borrow_mut().push(0);
        let gw = gateway(&bmc);
        let cpu = Rc::new(RefCell::new(49.0));
        let hd = Rc::new(RefCell::new(25.0));
        let zones = vec![
            dial_zone(ZoneKind::Cpu, "CPU zone", &cpu, &[0, 1]),
            dial_zone(ZoneKind::Storage, "HD zone", &hd, &[1]),
        ];
        let mut scheduler = Scheduler::new(&gw, zones);
        let start = Instant::now();
        scheduler.run_cycle(start).unwrap();
        // Zone 0 failed, the hot CPU still wins the shared zone
        assert_eq!(*bmc.calls.borrow(), vec![(1, 100)]);
        assert_eq!(scheduler.zones()[0].zone.last_level(), None);

        bmc.fail.borrow_mut().clear();
        scheduler.run_cycle(start + Duration::from_secs(1)).unwrap();
        assert_eq!(*bmc.calls.borrow(), vec![(1, 100), (0, 100)]);
    }

    #[test]
    fn test_failed_shared_dispatch_is_retried() {
        let bmc = Bmc::default();
        bmc.fail.borrow_mut().push(1);
        let gw = gateway(&bmc);
        let cpu = Rc::new(RefCell::new(41.0));
        let hd = Rc::new(RefCell::new(41.0));
        let zones = vec![
            dial_zone(ZoneKind::Cpu, "CPU zone", &cpu, &[1]),
            dial_zone(ZoneKind::Storage, "HD zone", &hd, &[1]),
        ];
        let mut scheduler = Scheduler::new(&gw, zones);
        let start = Instant::now();
        scheduler.run_cycle(start).unwrap();
        assert!(bmc.calls.borrow().is_empty());

        // Nothing changed in the zones, the pending shared zone is retried
        bmc.fail.borrow_mut().clear();
        scheduler.run_cycle(start + Duration::from_millis(100)).unwrap();
        assert_eq!(*bmc.calls.borrow(), vec![(1, 74)]);
    }

    #[test]
    fn test_read_error_policy() {
        let bmc = Bmc::default();
        let gw = gateway(&bmc);
        let curve = || CurveConfig::new(1, &params(1.0)).unwrap();

        let gpu = ZoneLoop::new("GPU zone", curve(), Box::new(Broken)).unwrap();
        let mut scheduler = Scheduler::new(&gw, vec![ManagedZone::new(ZoneKind::Gpu, gpu, vec![2])]);
        assert!(scheduler.run_cycle(Instant::now()).is_ok());

        let cpu = ZoneLoop::new("CPU zone", curve(), Box::new(Broken)).unwrap();
        let mut scheduler = Scheduler::new(&gw, vec![ManagedZone::new(ZoneKind::Cpu, cpu, vec![0])]);
        assert!(scheduler.run_cycle(Instant::now()).is_err());
    }

    #[test]
    fn test_sleep_interval() {
        let bmc = Bmc::default();
        let gw = gateway(&bmc);
        let t = Rc::new(RefCell::new(30.0));
        let slow = dial_zone(ZoneKind::Cpu, "A", &t, &[0]);
        let fast_curve = CurveConfig::new(1, &params(0.1)).unwrap();
        let fast = ManagedZone::new(ZoneKind::Gpu, ZoneLoop::new("B", fast_curve, Box::new(Dial(t.clone()))).unwrap(), vec![1]);

        let scheduler = Scheduler::new(&gw, vec![slow]);
        assert_eq!(scheduler.sleep_interval(), Duration::from_millis(500));
        let scheduler = Scheduler::new(&gw, vec![fast]);
        assert_eq!(scheduler.sleep_interval(), timing::MIN_CYCLE_SLEEP);
    }

    #[test]
    fn test_run_stops_on_shutdown_flag() {
        let bmc = Bmc::default();
        let gw = gateway(&bmc);
        let t = Rc::new(RefCell::new(30.0));
        let mut scheduler = Scheduler::new(&gw, vec![dial_zone(ZoneKind::Cpu, "A", &t, &[0])]);
        let shutdown = AtomicBool::new(true);
        scheduler.run(&shutdown).unwrap();
        assert!(bmc.calls.borrow().is_empty());
    }

    #[test]
    fn test_build_zones_from_config() {
        let hwmon = tempfile::TempDir::new().unwrap();
        let block = tempfile::TempDir::new().unwrap();
        create_mock_hwmon_chip(hwmon.path(), "hwmon0", "coretemp", &[(1, "Package id 0", 45000)]);
        create_mock_drivetemp(block.path(), "sda", 33000);
        create_mock_drivetemp(block.path(), "sdb", 35000);
        let roots = SysfsRoots { hwmon: hwmon.path().to_path_buf(), block: block.path().to_path_buf() };

        let cfg = crate::config::parse_config(&create_mock_config_json()).unwrap();
        let runner = Rc::new(MockRunner::new());
        let zones = build_zones(&cfg, &runner, &roots).unwrap();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].kind, ZoneKind::Cpu);
        assert_eq!(zones[1].kind, ZoneKind::Storage);
        assert_eq!(zones[1].zone.curve().sensor_count(), 2);
        assert_eq!(all_ipmi_zones(&zones), vec![0, 1]);
    }

    #[test]
    fn test_fixed_zone_applies_constant_level() {
        let bmc = Bmc::default();
        let gw = gateway(&bmc);
        let cfg: ZoneConfig = serde_json::from_str(
            r#"{ "kind": "fixed", "name": "Chassis", "ipmi_zones": [2], "level": 40 }"#,
        )
        .unwrap();
        let zone = build_zone(&cfg, &Rc::new(MockRunner::new()), &SysfsRoots::default()).unwrap();
        let mut scheduler = Scheduler::new(&gw, vec![zone]);
        scheduler.run_cycle(Instant::now()).unwrap();
        assert_eq!(*bmc.calls.borrow(), vec![(2, 40)]);
    }

    #[test]
    fn test_full_speed_guard_on_drop() {
        let bmc = Bmc::default();
        let gw = gateway(&bmc);
        let t = Rc::new(RefCell::new(20.0));
        let zones = vec![dial_zone(ZoneKind::Cpu, "A", &t, &[0, 1])];
        {
            let _guard = FullSpeedGuard::new(&gw, all_ipmi_zones(&zones));
            let mut scheduler = Scheduler::new(&gw, zones);
            scheduler.run_cycle(Instant::now()).unwrap();
        }
        assert_eq!(*bmc.calls.borrow(), vec![(0, 35), (1, 35), (0, 100), (1, 100)]);
    }
}
