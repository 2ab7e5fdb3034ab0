//! Hardware seams between the breathing-control core and the machine.
//!
//! Every device the core talks to is reached through one of these traits.
//! Errors cross the boundary as `Box<dyn Error + Send + Sync>` and are mapped
//! to typed errors by the core.

pub mod clock;

pub use clock::{Clock, ManualClock, MonotonicClock};

/// Airway pressure sensor returning raw ADC counts.
pub trait PressureSensor {
    fn read_raw(
        &mut self,
        timeout: std::time::Duration,
    ) -> Result<u32, Box<dyn std::error::Error + Send + Sync>>;
}

/// Mass flow meter. Flows are in mL/min, volume in mL.
pub trait FlowSensor {
    fn read_inspiratory_flow(&mut self) -> Result<i32, Box<dyn std::error::Error + Send + Sync>>;
    fn read_expiratory_flow(&mut self) -> Result<i32, Box<dyn std::error::Error + Send + Sync>>;
    /// Volume integrated on the inspiratory branch since the last `reset_volume`.
    fn delivered_volume(&mut self) -> Result<i32, Box<dyn std::error::Error + Send + Sync>>;
    fn reset_volume(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Pinch valve driven by an aperture in valve degrees (0 = fully open, 125 = closed).
pub trait ValveActuator {
    fn apply_aperture(
        &mut self,
        aperture: u16,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Turbine blower.
pub trait BlowerActuator {
    fn run_speed(&mut self, speed: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn stop(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Battery voltage divider and mains presence input.
pub trait BatterySensor {
    fn read_raw(&mut self) -> Result<u16, Box<dyn std::error::Error + Send + Sync>>;
    fn mains_connected(&mut self) -> Result<bool, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Led {
    Red,
    Yellow,
    Green,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tone {
    High,
    Medium,
    Low,
    Silent,
}

/// Front panel LEDs and buzzer.
pub trait Indicators {
    fn set_led(&mut self, led: Led, on: bool)
    -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn buzzer(&mut self, tone: Tone) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}
