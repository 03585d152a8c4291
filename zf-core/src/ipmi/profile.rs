//! Protocol profiles
//!
//! A profile turns abstract operations (get/set fan mode, get/set zone level)
//! into `ipmitool` argument lists for one motherboard family, and decodes the
//! answers. Profiles are stateless and looked up once at startup from a static
//! name table; unknown names fall back to the generic profile.
//!
//! Wire formats:
//!
//! | Operation | Generic | X10QBi |
//! |-----------|---------|--------|
//! | get mode  | `raw 0x30 0x45 0x00` | same |
//! | set mode  | `raw 0x30 0x45 0x01 <mode>` | same |
//! | get level | `raw 0x30 0x70 0x66 0x00 <zone>` | `raw 0x30 0x90 0x5c 0x03 <0x10+zone>` |
//! | set level | `raw 0x30 0x70 0x66 0x01 <zone> <level>` | `raw 0x30 0x91 0x5c 0x03 <0x10+zone> <level*255/100>` |

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use tracing::warn;
use zf_error::{Result, ZonefanError};

use crate::constants::level;

/// BMC fan modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FanMode {
    Standard,
    Full,
    Optimal,
    Pue,
    HeavyIo,
}

impl FanMode {
    pub const ALL: [FanMode; 5] = [
        FanMode::Standard,
        FanMode::Full,
        FanMode::Optimal,
        FanMode::Pue,
        FanMode::HeavyIo,
    ];

    pub fn as_raw(&self) -> u8 {
        match self {
            FanMode::Standard => 0,
            FanMode::Full => 1,
            FanMode::Optimal => 2,
            FanMode::Pue => 3,
            FanMode::HeavyIo => 4,
        }
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_raw() == raw)
    }
}

impl fmt::Display for FanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FanMode::Standard => "STANDARD",
            FanMode::Full => "FULL",
            FanMode::Optimal => "OPTIMAL",
            FanMode::Pue => "PUE",
            FanMode::HeavyIo => "HEAVY IO",
        };
        write!(f, "{}", name)
    }
}

/// Argument list passed to `ipmitool` after the connection options
pub type RawCommand = Vec<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolProfile {
    /// Standard X9/X10/X11/X12/X13 boards
    Generic,
    /// X10QBi: four fan controllers, native 0-255 duty scale
    X10Qbi,
}

/// Name table used for explicit selection and product-string detection
const REGISTRY: &[(&str, ProtocolProfile)] = &[
    ("generic", ProtocolProfile::Generic),
    ("X10QBi", ProtocolProfile::X10Qbi),
];

/// First X10QBi fan controller address
const X10QBI_CONTROLLER_BASE: u8 = 0x10;

const GENERIC_MODES: &[FanMode] = &FanMode::ALL;
const X10QBI_MODES: &[FanMode] = &[FanMode::Standard, FanMode::Full, FanMode::Optimal, FanMode::HeavyIo];

fn raw(bytes: &[&str]) -> RawCommand {
    let mut cmd = vec!["raw".to_string()];
    cmd.extend(bytes.iter().map(|b| b.to_string()));
    cmd
}

/// Parse the first hexadecimal byte of an `ipmitool raw` answer (" 32" -> 0x32)
pub fn parse_hex_byte(output: &str) -> Option<u8> {
    let token = output.split_whitespace().next()?;
    let digits = token.strip_prefix("0x").unwrap_or(token);
    u8::from_str_radix(digits, 16).ok()
}

impl ProtocolProfile {
    /// Exact (case-insensitive) lookup in the name table
    pub fn lookup(name: &str) -> Option<Self> {
        REGISTRY
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name.trim()))
            .map(|(_, p)| *p)
    }

    /// Lookup with fallback to the generic profile
    pub fn by_name(name: &str) -> Self {
        Self::lookup(name).unwrap_or_else(|| {
            warn!("IPMI: unknown platform '{}', using generic profile", name);
            ProtocolProfile::Generic
        })
    }

    /// Pick a profile from a product string reported by the BMC
    pub fn detect(product: &str) -> Self {
        REGISTRY
            .iter()
            .filter(|(_, p)| *p != ProtocolProfile::Generic)
            .find(|(n, _)| product.to_ascii_lowercase().contains(&n.to_ascii_lowercase()))
            .map(|(_, p)| *p)
            .unwrap_or(ProtocolProfile::Generic)
    }

    pub fn name(&self) -> &'static str {
        REGISTRY
            .iter()
            .find(|(_, p)| p == self)
            .map(|(n, _)| *n)
            .unwrap_or("generic")
    }

    pub fn zone_range(&self) -> RangeInclusive<u8> {
        match self {
            ProtocolProfile::Generic => 0..=100,
            ProtocolProfile::X10Qbi => 0..=3,
        }
    }

    pub fn fan_modes(&self) -> &'static [FanMode] {
        match self {
            ProtocolProfile::Generic => GENERIC_MODES,
            ProtocolProfile::X10Qbi => X10QBI_MODES,
        }
    }

    fn check_zone(&self, zone: u8) -> Result<()> {
        if self.zone_range().contains(&zone) {
            Ok(())
        } else {
            Err(ZonefanError::invalid_config(
                "zone",
                format!("{} is outside {:?} for the {} profile", zone, self.zone_range(), self.name()),
            ))
        }
    }

    fn check_level(level: u8) -> Result<()> {
        if (level::MIN..=level::MAX).contains(&level) {
            Ok(())
        } else {
            Err(ZonefanError::invalid_config("level", format!("{} is outside 0..=100", level)))
        }
    }

    /// Percent level converted to the board's native duty value
    pub fn native_level(&self, level: u8) -> u16 {
        match self {
            ProtocolProfile::Generic => level as u16,
            ProtocolProfile::X10Qbi => level as u16 * level::NATIVE_MAX / level::MAX as u16,
        }
    }

    pub fn get_mode(&self) -> RawCommand {
        raw(&["0x30", "0x45", "0x00"])
    }

    pub fn set_mode(&self, mode: FanMode) -> Result<RawCommand> {
        if !self.fan_modes().contains(&mode) {
            return Err(ZonefanError::invalid_config(
                "fan_mode",
                format!("{} is not supported by the {} profile", mode, self.name()),
            ));
        }
        Ok(raw(&["0x30", "0x45", "0x01", &mode.as_raw().to_string()]))
    }

    pub fn get_level(&self, zone: u8) -> Result<RawCommand> {
        self.check_zone(zone)?;
        Ok(match self {
            ProtocolProfile::Generic => raw(&["0x30", "0x70", "0x66", "0x00", &zone.to_string()]),
            ProtocolProfile::X10Qbi => {
                let controller = format!("0x{:02x}", X10QBI_CONTROLLER_BASE + zone);
                raw(&["0x30", "0x90", "0x5c", "0x03", &controller])
            }
        })
    }

    pub fn set_level(&self, zone: u8, level: u8) -> Result<RawCommand> {
        self.check_zone(zone)?;
        Self::check_level(level)?;
        let value = self.native_level(level).to_string();
        Ok(match self {
            ProtocolProfile::Generic => raw(&["0x30", "0x70", "0x66", "0x01", &zone.to_string(), &value]),
            ProtocolProfile::X10Qbi => {
                let controller = format!("0x{:02x}", X10QBI_CONTROLLER_BASE + zone);
                raw(&["0x30", "0x91", "0x5c", "0x03", &controller, &value])
            }
        })
    }

    /// Commands that switch the BMC from its own curves to raw level control
    pub fn manual_mode(&self) -> Result<Vec<RawCommand>> {
        Ok(vec![self.set_mode(FanMode::Full)?])
    }

    pub fn decode_mode(&self, output: &str) -> Option<FanMode> {
        parse_hex_byte(output).and_then(FanMode::from_raw)
    }

    /// Decode a get-level answer back to percent
    pub fn decode_level(&self, output: &str) -> Option<u8> {
        let native = parse_hex_byte(output)? as u16;
        match self {
            ProtocolProfile::Generic => (native <= level::MAX as u16).then_some(native as u8),
            ProtocolProfile::X10Qbi => {
                Some(((native * level::MAX as u16 + level::NATIVE_MAX / 2) / level::NATIVE_MAX) as u8)
            }
        }
    }
}

impl fmt::Display for ProtocolProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &[&str]) -> RawCommand {
        cmd.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_generic_wire_format() {
        let p = ProtocolProfile::Generic;
        assert_eq!(p.get_mode(), args(&["raw", "0x30", "0x45", "0x00"]));
        assert_eq!(p.set_mode(FanMode::Full).unwrap(), args(&["raw", "0x30", "0x45", "0x01", "1"]));
        assert_eq!(p.get_level(1).unwrap(), args(&["raw", "0x30", "0x70", "0x66", "0x00", "1"]));
        assert_eq!(
            p.set_level(0, 45).unwrap(),
            args(&["raw", "0x30", "0x70", "0x66", "0x01", "0", "45"])
        );
    }

    #[test]
    fn test_x10qbi_rescales_levels() {
        let p = ProtocolProfile::X10Qbi;
        assert_eq!(p.native_level(50), 127);
        assert_eq!(p.native_level(100), 255);
        assert_eq!(p.native_level(0), 0);
        assert_eq!(
            p.set_level(2, 50).unwrap(),
            args(&["raw", "0x30", "0x91", "0x5c", "0x03", "0x12", "127"])
        );
        assert_eq!(p.set_level(3, 100).unwrap().last().map(String::as_str), Some("255"));
    }

    #[test]
    fn test_zone_ranges() {
        assert!(ProtocolProfile::Generic.set_level(100, 50).is_ok());
        assert!(ProtocolProfile::Generic.set_level(101, 50).is_err());
        assert!(ProtocolProfile::X10Qbi.set_level(3, 50).is_ok());
        assert!(ProtocolProfile::X10Qbi.set_level(4, 50).is_err());
        assert!(ProtocolProfile::X10Qbi.get_level(4).is_err());
    }

    #[test]
    fn test_level_range() {
        assert!(ProtocolProfile::Generic.set_level(0, 101).is_err());
    }

    #[test]
    fn test_mode_sets() {
        assert!(ProtocolProfile::Generic.set_mode(FanMode::Pue).is_ok());
        assert!(ProtocolProfile::X10Qbi.set_mode(FanMode::Pue).is_err());
        assert!(ProtocolProfile::X10Qbi.set_mode(FanMode::HeavyIo).is_ok());
    }

    #[test]
    fn test_decode_answers() {
        let p = ProtocolProfile::Generic;
        assert_eq!(p.decode_mode(" 01\n"), Some(FanMode::Full));
        assert_eq!(p.decode_mode(" 07"), None);
        assert_eq!(p.decode_level(" 32"), Some(50));
        assert_eq!(p.decode_level(" ff"), None);
        assert_eq!(p.decode_level("garbage"), None);
        assert_eq!(ProtocolProfile::X10Qbi.decode_level(" 7f"), Some(50));
        assert_eq!(ProtocolProfile::X10Qbi.decode_level(" ff"), Some(100));
    }

    #[test]
    fn test_registry_lookup_and_fallback() {
        assert_eq!(ProtocolProfile::lookup("x10qbi"), Some(ProtocolProfile::X10Qbi));
        assert_eq!(ProtocolProfile::lookup("X11SCH"), None);
        assert_eq!(ProtocolProfile::by_name("X11SCH"), ProtocolProfile::Generic);
        assert_eq!(ProtocolProfile::X10Qbi.name(), "X10QBi");
    }

    #[test]
    fn test_detect_from_product_string() {
        assert_eq!(ProtocolProfile::detect("X10QBi"), ProtocolProfile::X10Qbi);
        assert_eq!(ProtocolProfile::detect("Supermicro X10QBI Rev 1.01"), ProtocolProfile::X10Qbi);
        assert_eq!(ProtocolProfile::detect("X11SCH-F"), ProtocolProfile::Generic);
        assert_eq!(ProtocolProfile::detect(""), ProtocolProfile::Generic);
    }

    #[test]
    fn test_manual_mode_is_full() {
        let cmds = ProtocolProfile::Generic.manual_mode().unwrap();
        assert_eq!(cmds, vec![args(&["raw", "0x30", "0x45", "0x01", "1"])]);
    }

    #[test]
    fn test_fan_mode_raw_roundtrip() {
        for mode in FanMode::ALL {
            assert_eq!(FanMode::from_raw(mode.as_raw()), Some(mode));
        }
        assert_eq!(FanMode::from_raw(9), None);
    }
}
