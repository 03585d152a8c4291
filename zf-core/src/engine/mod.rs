//! Fan control engine modules
//!
//! Contains the curve, the per-zone control loop, the storage standby guard
//! and the shared-zone arbiter.

mod arbiter;
mod curve;
mod standby;
mod zone;

pub use arbiter::{select_demand, DemandTable, FanLevelControl, SharedZoneArbiter, ZoneDemand};
pub use curve::{CurveConfig, CurveParams};
pub use standby::{ArrayState, ArrayTransition, DevicePower, StandbyGuard, StandbyState};
pub use zone::{LevelChange, PreSample, ZoneKind, ZoneLoop, ZoneRuntimeState};
