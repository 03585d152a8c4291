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

//! Zonefan - BMC fan control daemon
//!
//! This library wires the `zf-core` engine to the host: configuration,
//! hwmon and tool-backed temperature sources, the service loop and logging.

pub mod cli;
pub mod config;
pub mod hwmon;
pub mod logger;
pub mod service;
pub mod system;

#[cfg(test)]
pub mod test_utils;
