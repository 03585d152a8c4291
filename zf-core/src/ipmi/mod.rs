//! BMC protocol layer: profiles, gateway and sensor table

mod gateway;
mod profile;
mod sdr;

pub use gateway::{ControllerGateway, GatewayOptions};
pub use profile::{parse_hex_byte, FanMode, ProtocolProfile, RawCommand};
pub use sdr::{parse_sensor_table, SensorReading};
