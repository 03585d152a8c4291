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

use std::path::PathBuf;

use crate::config::config_path;
use crate::logger::LogOutput;

#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub config: PathBuf,
    pub log_level: Option<String>,
    pub output: LogOutput,
    /// Print the BMC sensor table and exit
    pub sensors: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: config_path(),
            log_level: None,
            output: LogOutput::Journal,
            sensors: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run(Options),
    Help,
    Version,
}

/// Parse arguments (without the program name)
pub fn parse_args<I>(args: I) -> Result<Command, String>
where
    I: IntoIterator<Item = String>,
{
    let mut opts = Options::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| args.next().ok_or_else(|| format!("{} requires an argument", flag));
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-v" | "--version" => return Ok(Command::Version),
            "-c" | "--config" => opts.config = PathBuf::from(value(&arg)?),
            "-l" | "--log-level" => opts.log_level = Some(value(&arg)?),
            "-o" | "--output" => opts.output = value(&arg)?.parse()?,
            "--sensors" => opts.sensors = true,
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    Ok(Command::Run(opts))
}
