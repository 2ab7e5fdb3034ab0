use thiserror::Error;

/// Errors raised by the simulated devices, boxed through the `vent_traits` seams.
#[derive(Debug, Error)]
pub enum HwError {
    /// A valve or the blower refused a command.
    #[error("actuator fault: {0}")]
    Actuator(String),
    /// No reading within the requested timeout.
    #[error("sensor timeout")]
    Timeout,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
