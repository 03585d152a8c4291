//! Zonefan Core Library
//!
//! Control and arbitration engine of the Zonefan BMC fan daemon.
//!
//! # Features
//!
//! - **Curves**: discretized temperature-to-level mapping with hysteresis
//! - **Zone Loops**: one polling loop per CPU, storage, GPU or fixed zone
//! - **Standby Guard**: spins a storage array down as a group
//! - **Arbitration**: several zones sharing one physical fan zone
//! - **Protocol**: per-board IPMI encodings and a retrying controller gateway
//!
//! # Module Structure
//!
//! - `engine/` - Curve, zone loop, standby guard, shared-zone arbiter
//! - `ipmi/` - Protocol profiles, controller gateway, sensor table parsing
//!
//! # Example
//!
//! ```
//! use zf_core::{CurveConfig, CurveParams};
//!
//! let curve = CurveConfig::new(1, &CurveParams::default()).unwrap();
//! assert_eq!(curve.level_for(25.0), 35);
//! ```

// Grouped modules
pub mod engine;
pub mod ipmi;

// Standalone modules
pub mod command;
pub mod constants;
pub mod source;

pub use command::{display_command, CommandOutput, CommandRunner};
pub use engine::{
    select_demand, ArrayState, ArrayTransition, CurveConfig, CurveParams, DemandTable,
    DevicePower, FanLevelControl, LevelChange, PreSample, SharedZoneArbiter, StandbyGuard,
    StandbyState, ZoneDemand, ZoneKind, ZoneLoop, ZoneRuntimeState,
};
pub use ipmi::{
    parse_sensor_table, ControllerGateway, FanMode, GatewayOptions, ProtocolProfile,
    SensorReading,
};
pub use source::{checked_reading, Aggregation, FixedSource, TemperatureSource};

pub use zf_error::{Result, ZonefanError};
