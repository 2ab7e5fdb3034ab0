//! Simulated ventilator hardware.
//!
//! A lung model sits behind simulated valves, blower and sensors so the
//! breathing core can be run end to end without a machine attached.

pub mod error;
pub mod lung;
pub mod sim;

pub use error::HwError;
pub use lung::LungParams;
pub use sim::{
    SensorTransfer, SimulatedBattery, SimulatedBlower, SimulatedFlowSensor, SimulatedIndicators,
    SimulatedLung, SimulatedPressureSensor, SimulatedValve,
};
/// Simulated time only moves when the breathing loop sleeps.
pub use vent_traits::ManualClock as SimulatedClock;
