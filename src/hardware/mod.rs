//! Hardware abstraction.
//!
//! - `capabilities`: the async traits the protocols and the engine drive
//! - `mock`: simulated bench used by tests and the `simulated` drivers
//! - `registry`: configuration `type` string to driver constructor table

pub mod capabilities;
pub mod mock;
pub mod registry;

pub use capabilities::{
    Attenuator, BeamPath, BeamPathObject, Laser, PositionValue, Positions, PowerMeter,
};
pub use registry::{DeviceRegistry, Instruments};
