//! Controller gateway
//!
//! Executes protocol commands through a [`CommandRunner`], adds the sudo and
//! remote-target prefixes, classifies failures and owns the settle delays that
//! follow every mutation.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};
use zf_error::{Result, ZonefanError};

use super::profile::{FanMode, ProtocolProfile, RawCommand};
use super::sdr::{parse_sensor_table, SensorReading};
use crate::command::{display_command, CommandRunner};
use crate::constants::{ipmi, level, tools};
use crate::engine::FanLevelControl;

/// stderr fragments that identify a failed privilege elevation
const ELEVATION_SIGNATURES: &[&str] = &[
    "sudo:",
    "password is required",
    "not in the sudoers",
    "a terminal is required",
];

/// FRU fields holding the board name, in lookup order
const PRODUCT_FIELDS: &[&str] = &["Board Product", "Product Name"];

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOptions {
    /// Path of the ipmitool executable
    pub command: String,
    /// Extra arguments for a remote BMC (`-I lanplus -H ...`)
    pub remote_parameters: Vec<String>,
    /// Prefix every call with `sudo`
    pub sudo: bool,
    pub fan_mode_delay: Duration,
    pub fan_level_delay: Duration,
    pub init_timeout: Duration,
    pub init_step: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            command: tools::IPMITOOL.to_string(),
            remote_parameters: Vec::new(),
            sudo: false,
            fan_mode_delay: ipmi::DEFAULT_FAN_MODE_DELAY,
            fan_level_delay: ipmi::DEFAULT_FAN_LEVEL_DELAY,
            init_timeout: ipmi::INIT_TIMEOUT,
            init_step: ipmi::INIT_STEP,
        }
    }
}

pub struct ControllerGateway<R: CommandRunner> {
    runner: R,
    options: GatewayOptions,
    profile: ProtocolProfile,
}

fn settle(delay: Duration) {
    if !delay.is_zero() {
        thread::sleep(delay);
    }
}

fn is_elevation_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    ELEVATION_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Value of the first matching `Field : value` line of `ipmitool fru print`
fn parse_product_name(output: &str) -> Option<String> {
    PRODUCT_FIELDS.iter().find_map(|field| {
        output.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            let value = value.trim();
            (key.trim() == *field && !value.is_empty()).then(|| value.to_string())
        })
    })
}

impl<R: CommandRunner> ControllerGateway<R> {
    /// Gateway with a fixed profile and no readiness check
    pub fn new(runner: R, options: GatewayOptions, profile: ProtocolProfile) -> Self {
        Self { runner, options, profile }
    }

    /// Wait for the BMC, then select the protocol profile.
    ///
    /// `platform_name` of `None` or `"auto"` means detect from the FRU data.
    pub fn connect(runner: R, options: GatewayOptions, platform_name: Option<&str>) -> Result<Self> {
        let mut gateway = Self::new(runner, options, ProtocolProfile::Generic);
        gateway.wait_until_ready()?;

        gateway.profile = match platform_name {
            Some(name) if !name.trim().eq_ignore_ascii_case("auto") => ProtocolProfile::by_name(name),
            _ => match gateway.product_name() {
                Ok(Some(product)) => {
                    let profile = ProtocolProfile::detect(&product);
                    info!("IPMI: detected product '{}'", product);
                    profile
                }
                Ok(None) => {
                    warn!("IPMI: BMC did not report a product name, using generic profile");
                    ProtocolProfile::Generic
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("IPMI: product detection failed ({}), using generic profile", e);
                    ProtocolProfile::Generic
                }
            },
        };
        info!("IPMI: using {} protocol profile", gateway.profile);
        Ok(gateway)
    }

    /// Run one ipmitool command and return its stdout
    pub fn exec(&self, args: &[String]) -> Result<String> {
        let mut full_args = Vec::with_capacity(args.len() + self.options.remote_parameters.len() + 1);
        let program = if self.options.sudo {
            full_args.push(self.options.command.clone());
            tools::SUDO
        } else {
            self.options.command.as_str()
        };
        full_args.extend(self.options.remote_parameters.iter().cloned());
        full_args.extend(args.iter().cloned());

        let output = self.runner.run(program, &full_args)?;
        if output.success() {
            trace_output(program, &full_args, &output.stdout);
            return Ok(output.stdout);
        }

        let command = display_command(program, &full_args);
        let stderr = output.stderr.trim().to_string();
        if self.options.sudo && is_elevation_failure(&stderr) {
            Err(ZonefanError::Elevation { command, stderr })
        } else {
            Err(ZonefanError::ProtocolExecution {
                command,
                exit_code: output.exit_code,
                stderr,
            })
        }
    }

    /// Probe the BMC until it answers or the init window is used up.
    ///
    /// Only protocol execution failures are retried. Waited time is the sum of
    /// the steps taken, not wall-clock time.
    pub fn wait_until_ready(&self) -> Result<()> {
        let step = self.options.init_step;
        let mut waited = Duration::ZERO;
        loop {
            match self.exec(&self.profile.get_mode()) {
                Ok(_) => {
                    if !waited.is_zero() {
                        info!("IPMI: BMC ready after {} seconds", waited.as_secs());
                    }
                    return Ok(());
                }
                Err(e @ ZonefanError::ProtocolExecution { .. })
                    if !step.is_zero() && waited + step <= self.options.init_timeout =>
                {
                    warn!("IPMI: BMC not ready ({}), retrying in {:?}", e, step);
                    thread::sleep(step);
                    waited += step;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn response<T>(&self, args: &[String], output: &str, value: Option<T>) -> Result<T> {
        value.ok_or_else(|| ZonefanError::ResponseParse {
            command: display_command(&self.options.command, args),
            output: output.trim().to_string(),
        })
    }

    pub fn get_fan_mode(&self) -> Result<FanMode> {
        let args = self.profile.get_mode();
        let output = self.exec(&args)?;
        self.response(&args, &output, self.profile.decode_mode(&output))
    }

    pub fn set_fan_mode(&self, mode: FanMode) -> Result<()> {
        let args = self.profile.set_mode(mode)?;
        self.exec(&args)?;
        settle(self.options.fan_mode_delay);
        info!("IPMI: fan mode set to {}", mode);
        Ok(())
    }

    /// Current level of one zone in percent
    pub fn get_level(&self, zone: u8) -> Result<u8> {
        let args = self.profile.get_level(zone)?;
        let output = self.exec(&args)?;
        self.response(&args, &output, self.profile.decode_level(&output))
    }

    pub fn set_level(&self, zone: u8, level: u8) -> Result<()> {
        self.set_level_many(&[zone], level)
    }

    /// Apply one level to several zones, then settle once.
    ///
    /// All commands are encoded before the first one is sent, so an invalid
    /// zone id rejects the whole batch.
    pub fn set_level_many(&self, zones: &[u8], level: u8) -> Result<()> {
        if zones.is_empty() {
            return Ok(());
        }
        let commands = zones
            .iter()
            .map(|zone| self.profile.set_level(*zone, level))
            .collect::<Result<Vec<RawCommand>>>()?;
        for (sent, args) in commands.iter().enumerate() {
            if let Err(e) = self.exec(args) {
                // Earlier zones of the batch already changed
                if sent > 0 {
                    settle(self.options.fan_level_delay);
                }
                return Err(e);
            }
        }
        debug!("IPMI: zones {:?} set to {}%", zones, level);
        settle(self.options.fan_level_delay);
        Ok(())
    }

    /// Switch the BMC to manual (FULL) mode unless it already is.
    ///
    /// Returns whether a mode change was sent.
    pub fn set_manual_mode(&self) -> Result<bool> {
        let current = self.get_fan_mode()?;
        if current == FanMode::Full {
            debug!("IPMI: fan mode already {}", current);
            return Ok(false);
        }
        for args in self.profile.manual_mode()? {
            self.exec(&args)?;
        }
        settle(self.options.fan_mode_delay);
        info!("IPMI: fan mode {} > {}", current, FanMode::Full);
        Ok(true)
    }

    /// Drive every listed zone to full speed
    pub fn force_full_speed(&self, zones: &[u8]) -> Result<()> {
        self.set_level_many(zones, level::FULL_SPEED)
    }

    /// Read the BMC sensor table, skipping rows that do not parse
    pub fn read_sensor_table(&self) -> Result<Vec<SensorReading>> {
        let output = self.exec(&["sdr".to_string()])?;
        Ok(parse_sensor_table(&output))
    }

    /// Board name from the FRU inventory, if the BMC reports one
    pub fn product_name(&self) -> Result<Option<String>> {
        let args = ["fru", "print", "0"].map(String::from);
        let output = self.exec(&args)?;
        Ok(parse_product_name(&output))
    }

    pub fn profile(&self) -> ProtocolProfile {
        self.profile
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }
}

fn trace_output(program: &str, args: &[String], stdout: &str) {
    tracing::trace!("{} -> {:?}", display_command(program, args), stdout.trim());
}

impl<R: CommandRunner> FanLevelControl for ControllerGateway<R> {
    fn set_level(&self, zone: u8, level: u8) -> Result<()> {
        ControllerGateway::set_level(self, zone, level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, MockCommandRunner};
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::time::Instant;

    fn args(cmd: &[&str]) -> Vec<String> {
        cmd.iter().map(|s| s.to_string()).collect()
    }

    fn fast_options() -> GatewayOptions {
        GatewayOptions {
            command: "ipmitool".to_string(),
            fan_mode_delay: Duration::ZERO,
            fan_level_delay: Duration::ZERO,
            init_timeout: Duration::from_millis(3),
            init_step: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_set_level_wire_bytes() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .with(eq("ipmitool"), eq(args(&["raw", "0x30", "0x70", "0x66", "0x01", "1", "60"])))
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("")));
        let gw = ControllerGateway::new(runner, fast_options(), ProtocolProfile::Generic);
        gw.set_level(1, 60).unwrap();
    }

    #[test]
    fn test_sudo_and_remote_prefix() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .with(
                eq("sudo"),
                eq(args(&["ipmitool", "-I", "lanplus", "-H", "bmc", "raw", "0x30", "0x45", "0x00"])),
            )
            .returning(|_, _| Ok(CommandOutput::ok(" 01")));
        let options = GatewayOptions {
            sudo: true,
            remote_parameters: args(&["-I", "lanplus", "-H", "bmc"]),
            ..fast_options()
        };
        let gw = ControllerGateway::new(runner, options, ProtocolProfile::Generic);
        assert_eq!(gw.get_fan_mode().unwrap(), FanMode::Full);
    }

    #[test]
    fn test_failure_classification() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _| Ok(CommandOutput::failed(1, "sudo: a password is required")));
        let options = GatewayOptions { sudo: true, ..fast_options() };
        let gw = ControllerGateway::new(runner, options, ProtocolProfile::Generic);
        assert!(matches!(gw.get_level(0), Err(ZonefanError::Elevation { .. })));

        // Without sudo the same text is an ordinary command failure
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _| Ok(CommandOutput::failed(1, "sudo: a password is required")));
        let gw = ControllerGateway::new(runner, fast_options(), ProtocolProfile::Generic);
        assert!(matches!(gw.get_level(0), Err(ZonefanError::ProtocolExecution { .. })));

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _| Ok(CommandOutput::failed(1, "Unable to send RAW command")));
        let gw = ControllerGateway::new(runner, fast_options(), ProtocolProfile::Generic);
        match gw.get_level(0) {
            Err(ZonefanError::ProtocolExecution { exit_code, stderr, .. }) => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(stderr, "Unable to send RAW command");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_missing_executable_is_not_retried() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|p, _| {
            Err(ZonefanError::CommandNotFound { program: p.to_string() })
        });
        let result = ControllerGateway::connect(runner, fast_options(), Some("generic"));
        assert!(matches!(result, Err(ZonefanError::CommandNotFound { .. })));
    }

    #[test]
    fn test_readiness_retry_then_success() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        runner
            .expect_run()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(CommandOutput::failed(1, "BMC busy")));
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(CommandOutput::ok(" 00")));
        let gw = ControllerGateway::connect(runner, fast_options(), Some("X10QBi")).unwrap();
        assert_eq!(gw.profile(), ProtocolProfile::X10Qbi);
    }

    #[test]
    fn test_readiness_window_exhausted() {
        let mut runner = MockCommandRunner::new();
        // initial probe plus three 1 ms steps inside a 3 ms window
        runner
            .expect_run()
            .times(4)
            .returning(|_, _| Ok(CommandOutput::failed(1, "BMC busy")));
        let result = ControllerGateway::connect(runner, fast_options(), None);
        assert!(matches!(result, Err(ZonefanError::ProtocolExecution { .. })));
    }

    #[test]
    fn test_auto_detects_profile_from_fru() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .with(eq("ipmitool"), eq(args(&["raw", "0x30", "0x45", "0x00"])))
            .returning(|_, _| Ok(CommandOutput::ok(" 01")));
        runner
            .expect_run()
            .with(eq("ipmitool"), eq(args(&["fru", "print", "0"])))
            .returning(|_, _| {
                Ok(CommandOutput::ok(
                    " Chassis Type          : Other\n Board Mfg             : Supermicro\n Board Product         : X10QBi\n",
                ))
            });
        let gw = ControllerGateway::connect(runner, fast_options(), Some("auto")).unwrap();
        assert_eq!(gw.profile(), ProtocolProfile::X10Qbi);
    }

    #[test]
    fn test_failed_detection_falls_back_to_generic() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .with(eq("ipmitool"), eq(args(&["raw", "0x30", "0x45", "0x00"])))
            .returning(|_, _| Ok(CommandOutput::ok(" 01")));
        runner
            .expect_run()
            .with(eq("ipmitool"), eq(args(&["fru", "print", "0"])))
            .returning(|_, _| Ok(CommandOutput::failed(1, "FRU not present")));
        let gw = ControllerGateway::connect(runner, fast_options(), None).unwrap();
        assert_eq!(gw.profile(), ProtocolProfile::Generic);
    }

    #[test]
    fn test_manual_mode_skipped_when_full() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|_, _| Ok(CommandOutput::ok(" 01")));
        let gw = ControllerGateway::new(runner, fast_options(), ProtocolProfile::Generic);
        assert!(!gw.set_manual_mode().unwrap());
    }

    #[test]
    fn test_manual_mode_switches_to_full() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .with(eq("ipmitool"), eq(args(&["raw", "0x30", "0x45", "0x00"])))
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok(" 02")));
        runner
            .expect_run()
            .with(eq("ipmitool"), eq(args(&["raw", "0x30", "0x45", "0x01", "1"])))
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("")));
        let gw = ControllerGateway::new(runner, fast_options(), ProtocolProfile::Generic);
        assert!(gw.set_manual_mode().unwrap());
    }

    #[test]
    fn test_set_level_many_validates_before_sending() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();
        let gw = ControllerGateway::new(runner, fast_options(), ProtocolProfile::X10Qbi);
        assert!(gw.set_level_many(&[0, 1, 7], 50).is_err());
    }

    #[test]
    fn test_force_full_speed_x10qbi() {
        let mut runner = MockCommandRunner::new();
        for controller in ["0x10", "0x11"] {
            runner
                .expect_run()
                .with(eq("ipmitool"), eq(args(&["raw", "0x30", "0x91", "0x5c", "0x03", controller, "255"])))
                .times(1)
                .returning(|_, _| Ok(CommandOutput::ok("")));
        }
        let gw = ControllerGateway::new(runner, fast_options(), ProtocolProfile::X10Qbi);
        gw.force_full_speed(&[0, 1]).unwrap();
    }

    const SETTLE: Duration = Duration::from_millis(30);

    fn settling_options() -> GatewayOptions {
        GatewayOptions {
            fan_mode_delay: SETTLE,
            fan_level_delay: SETTLE,
            ..fast_options()
        }
    }

    #[test]
    fn test_mutations_wait_for_settle_delay() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(2).returning(|_, _| Ok(CommandOutput::ok("")));
        let gw = ControllerGateway::new(runner, settling_options(), ProtocolProfile::Generic);

        let start = Instant::now();
        gw.set_level(0, 50).unwrap();
        assert!(start.elapsed() >= SETTLE);

        let start = Instant::now();
        gw.set_fan_mode(FanMode::Full).unwrap();
        assert!(start.elapsed() >= SETTLE);
    }

    #[test]
    fn test_partial_batch_failure_still_settles() {
        let mut runner = MockCommandRunner::new();
        let mut seq = Sequence::new();
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(CommandOutput::ok("")));
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(CommandOutput::failed(1, "Unable to send RAW command")));
        let gw = ControllerGateway::new(runner, settling_options(), ProtocolProfile::Generic);

        let start = Instant::now();
        assert!(gw.set_level_many(&[0, 1], 70).is_err());
        assert!(start.elapsed() >= SETTLE);
    }

    #[test]
    fn test_failed_first_command_does_not_settle() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .times(1)
            .returning(|_, _| Ok(CommandOutput::failed(1, "Unable to send RAW command")));
        let options = GatewayOptions { fan_level_delay: Duration::from_secs(5), ..fast_options() };
        let gw = ControllerGateway::new(runner, options, ProtocolProfile::Generic);

        let start = Instant::now();
        assert!(gw.set_level_many(&[0, 1], 70).is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_unparsable_answer() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _| Ok(CommandOutput::ok("not hex")));
        let gw = ControllerGateway::new(runner, fast_options(), ProtocolProfile::Generic);
        assert!(matches!(gw.get_level(0), Err(ZonefanError::ResponseParse { .. })));
    }

    #[test]
    fn test_product_name_field_order() {
        let fru = " Product Name          : SYS-6029P\n Board Product         : X11DPH-T\n";
        assert_eq!(parse_product_name(fru).as_deref(), Some("X11DPH-T"));
        assert_eq!(parse_product_name(" Product Name : SYS-1\n").as_deref(), Some("SYS-1"));
        assert_eq!(parse_product_name("nothing here"), None);
    }
}
