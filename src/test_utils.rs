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

#[cfg(test)]
pub mod test_utils {
    use std::fs;
    use std::path::Path;

    use mockall::mock;
    use zf_core::{CommandOutput, CommandRunner};
    use zf_error::Result;

    mock! {
        pub Runner {}

        impl CommandRunner for Runner {
            fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
        }
    }

    /// Owned argument list from string literals
    pub fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// Creates `<root>/<dir_name>` as a hwmon chip with the given
    /// `(index, label, millidegrees)` inputs; empty labels are not written
    pub fn create_mock_hwmon_chip(root: &Path, dir_name: &str, chip_name: &str, temps: &[(usize, &str, i64)]) {
        let dir = root.join(dir_name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("name"), format!("{}\n", chip_name)).unwrap();
        for (idx, label, milli) in temps {
            fs::write(dir.join(format!("temp{}_input", idx)), format!("{}\n", milli)).unwrap();
            if !label.is_empty() {
                fs::write(dir.join(format!("temp{}_label", idx)), format!("{}\n", label)).unwrap();
            }
        }
    }

    /// Creates `<block_root>/<device>/device/hwmon/hwmon0/temp1_input`
    pub fn create_mock_drivetemp(block_root: &Path, device: &str, milli: i64) {
        let dir = block_root.join(device).join("device").join("hwmon").join("hwmon0");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("name"), "drivetemp\n").unwrap();
        fs::write(dir.join("temp1_input"), format!("{}\n", milli)).unwrap();
    }

    /// A small but complete configuration: one CPU zone, one storage zone
    /// sharing IPMI zone 1, and a fixed zone
    pub fn create_mock_config_json() -> String {
        r#"{
            "ipmi": { "command": "ipmitool", "fan_mode_delay": 0, "fan_level_delay": 0 },
            "zones": [
                {
                    "kind": "cpu",
                    "name": "CPU zone",
                    "ipmi_zones": [0, 1],
                    "curve": { "steps": 5, "sensitivity": 1, "polling": 1,
                               "min_temp": 30, "max_temp": 50, "min_level": 35, "max_level": 100 }
                },
                {
                    "kind": "storage",
                    "name": "HD zone",
                    "ipmi_zones": [1],
                    "devices": ["/dev/sda", "/dev/sdb"],
                    "standby_guard_enabled": true,
                    "standby_hd_limit": 1
                },
                {
                    "kind": "fixed",
                    "name": "Chassis",
                    "enabled": false,
                    "ipmi_zones": [2],
                    "level": 40
                }
            ]
        }"#
        .to_string()
    }
}
