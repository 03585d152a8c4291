//! Constants and configuration values for Zonefan
//!
//! Centralizes protocol timings, level limits and default paths.
//! Never use magic numbers in other files - add them here first.

use std::time::Duration;

/// System paths
pub mod paths {
    /// Base path for hwmon devices
    pub const HWMON_BASE: &str = "/sys/class/hwmon";

    /// Base path for block devices
    pub const BLOCK_BASE: &str = "/sys/block";

    /// Configuration directory
    pub const CONFIG_DIR: &str = "/etc/zonefan";

    /// Default configuration file
    pub const CONFIG_FILE: &str = "/etc/zonefan/config.json";

    /// systemd journal socket, present when journald is running
    pub const JOURNAL_SOCKET: &str = "/run/systemd/journal/socket";
}

/// External tool defaults
pub mod tools {
    pub const IPMITOOL: &str = "/usr/bin/ipmitool";
    pub const SMARTCTL: &str = "/usr/sbin/smartctl";
    pub const HDPARM: &str = "/usr/sbin/hdparm";
    pub const NVIDIA_SMI: &str = "/usr/bin/nvidia-smi";
    pub const SUDO: &str = "sudo";
}

/// BMC protocol timing
pub mod ipmi {
    use super::Duration;

    /// Time the BMC needs to apply a new fan mode
    pub const DEFAULT_FAN_MODE_DELAY: Duration = Duration::from_secs(10);

    /// Time fans need to settle on a new level
    pub const DEFAULT_FAN_LEVEL_DELAY: Duration = Duration::from_secs(2);

    /// How long to wait for the BMC to answer after boot
    pub const INIT_TIMEOUT: Duration = Duration::from_secs(120);

    /// Pause between two readiness probes
    pub const INIT_STEP: Duration = Duration::from_secs(5);
}

/// Fan level limits (percent)
pub mod level {
    pub const MIN: u8 = 0;
    pub const MAX: u8 = 100;

    /// Level forced when the daemon stops or loses control
    pub const FULL_SPEED: u8 = 100;

    /// Native duty scale used by boards that do not take percents
    pub const NATIVE_MAX: u16 = 255;
}

/// Temperature conversions
pub mod temperature {
    /// hwmon reports milli-degrees Celsius
    pub const MILLIDEGREE_DIVISOR: f64 = 1000.0;
}

/// Scheduler timing
pub mod timing {
    use super::Duration;

    /// Lower bound for the scheduler sleep between cycles
    pub const MIN_CYCLE_SLEEP: Duration = Duration::from_millis(100);
}
