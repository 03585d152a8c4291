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

//! Zonefan daemon (zonefand)

use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tracing::{error, info, warn};

use zf_core::{CommandRunner, ControllerGateway};
use zonefan::cli::{self, Command, Options};
use zonefan::config::load_config;
use zonefan::logger::{init_logging, resolve_level, LOG_ENV};
use zonefan::service::{all_ipmi_zones, build_zones, FullSpeedGuard, Scheduler, SysfsRoots};
use zonefan::system::{read_board_name, SystemRunner};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Set by the signal handler, checked between cycles
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn print_help() {
    eprintln!("zonefand {} - BMC fan control daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    zonefand [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH       Configuration file (default /etc/zonefan/config.json)");
    eprintln!("    -l, --log-level LEVEL   Log filter (trace, debug, info, warn, error)");
    eprintln!("    -o, --output OUTPUT     Log output: journal or stdout");
    eprintln!("        --sensors           Print the BMC sensor table and exit");
    eprintln!("    -v, --version           Print version");
    eprintln!("    -h, --help              Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    {}             Log filter when --log-level is not given", LOG_ENV);
}

fn print_version() {
    println!("zonefand {}", VERSION);
}

/// Root is needed for ipmitool, smartctl and hdparm unless sudo is configured
fn verify_privileges(sudo: bool) -> Result<(), &'static str> {
    // SAFETY: geteuid only returns the effective user id
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        return Ok(());
    }
    if sudo {
        warn!("Running as uid {}, commands are elevated with sudo", euid);
        return Ok(());
    }
    Err("zonefand must run as root (or with ipmi.sudo enabled)")
}

fn print_sensors<R: CommandRunner>(gateway: &ControllerGateway<R>) -> anyhow::Result<()> {
    for reading in gateway.read_sensor_table()? {
        println!(
            "{:<24} {:>10.2} {:<16} {}",
            reading.name,
            reading.value,
            reading.unit.as_deref().unwrap_or("-"),
            reading.status
        );
    }
    Ok(())
}

fn run(opts: Options) -> anyhow::Result<()> {
    let cfg = load_config(&opts.config).with_context(|| format!("loading {}", opts.config.display()))?;
    info!("STARTUP: Configuration {} ({} enabled zone(s))", opts.config.display(), cfg.enabled_zones().count());

    if let Err(e) = verify_privileges(cfg.ipmi.sudo) {
        error!("{}", e);
        process::exit(1);
    }

    if let Err(e) = ctrlc::set_handler(|| {
        info!("SIGNAL: Received SIGINT/SIGTERM - stopping after this cycle");
        SHUTDOWN.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    info!("STARTUP: Board {}", read_board_name());
    let gateway = ControllerGateway::connect(SystemRunner, cfg.ipmi.gateway_options()?, cfg.ipmi.platform_name.as_deref())
        .context("connecting to the BMC")?;

    if opts.sensors {
        return print_sensors(&gateway);
    }

    let zones = build_zones(&cfg, &SystemRunner, &SysfsRoots::default())?;
    let _full_speed = FullSpeedGuard::new(&gateway, all_ipmi_zones(&zones));
    gateway.set_manual_mode()?;

    let mut scheduler = Scheduler::new(&gateway, zones);
    scheduler.run(&SHUTDOWN)?;
    info!("SHUTDOWN: zonefand stopped");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let command = match cli::parse_args(env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            process::exit(1);
        }
    };
    let opts = match command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            print_version();
            return Ok(());
        }
        Command::Run(opts) => opts,
    };

    let level = resolve_level(opts.log_level.as_deref(), env::var(LOG_ENV).ok());
    let output = init_logging(&level, opts.output);
    info!("STARTUP: zonefand {} starting", VERSION);
    info!("STARTUP: Logging to {} (filter {})", output, level);

    if let Err(e) = run(opts) {
        error!("{:#}", e);
        process::exit(1);
    }
    Ok(())
}
