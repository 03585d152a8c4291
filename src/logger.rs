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

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use zf_core::constants::paths;

/// Environment variable holding the default log filter
pub const LOG_ENV: &str = "ZONEFAN_LOG";

const DEFAULT_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Journal,
}

impl FromStr for LogOutput {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" => Ok(LogOutput::Stdout),
            "journal" | "journald" => Ok(LogOutput::Journal),
            other => Err(format!("unknown log output '{}' (expected stdout or journal)", other)),
        }
    }
}

impl fmt::Display for LogOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogOutput::Stdout => write!(f, "stdout"),
            LogOutput::Journal => write!(f, "systemd journal"),
        }
    }
}

/// Filter from the command line, else `ZONEFAN_LOG`, else `info`
pub fn resolve_level(cli: Option<&str>, env: Option<String>) -> String {
    cli.map(str::to_string)
        .or(env)
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LEVEL.to_string())
}

/// Install the global subscriber and return the output actually used.
///
/// The journal is only used when requested and its socket exists; any
/// failure falls back to stdout.
pub fn init_logging(level: &str, requested: LogOutput) -> LogOutput {
    if requested == LogOutput::Journal && Path::new(paths::JOURNAL_SOCKET).exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(EnvFilter::new(level))
                    .init();
                return LogOutput::Journal;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(EnvFilter::new(level))
        .init();
    LogOutput::Stdout
}
