use thiserror::Error;

/// Why the runtime forced the safety position and gave up.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SafetyReason {
    #[error("pressure sensor lost")]
    PressureSensorLost,
    #[error("battery deep discharge")]
    BatteryDeepDischarge,
    #[error("actuator fault")]
    ActuatorFault,
}

#[derive(Debug, Error, Clone)]
pub enum VentError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("timeout waiting for sensor")]
    Timeout,
    #[error("invalid state: {0}")]
    State(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("calibration error: {0}")]
    Calibration(String),
    #[error("safety stop: {0}")]
    SafetyStop(SafetyReason),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing pressure sensor")]
    MissingPressureSensor,
    #[error("missing valves")]
    MissingValves,
    #[error("missing blower")]
    MissingBlower,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
