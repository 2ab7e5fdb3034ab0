//! Live sensor values and per-cycle measures shared by the breath controller
//! and the mode controllers.

use crate::params::{DEFAULT_CYCLES_PER_MINUTE_COMMAND, DEFAULT_PERIOD_US, PRESSURE_SAMPLES};
use crate::ring::RingBuffer;

#[derive(Debug, Clone)]
pub struct Measures {
    /// Last pressure reading (mmH2O).
    pub pressure: i16,
    /// Pressure the current phase is regulated to: plateau on inhale, PEEP on exhale.
    pub pressure_command: i16,
    pub peak_pressure: i16,
    /// Lowest pressure seen after the last peak of the inspiration.
    pub rebounce_peak_pressure: i16,
    /// `None` when the plateau could not be told apart from the PEEP.
    pub plateau_pressure: Option<i16>,
    pub peep: i16,
    /// `None` until read this cycle, or when the delivered volume is out of range.
    pub tidal_volume_ml: Option<u16>,
    pub cycles_per_minute: u16,
    pub expiratory_volume_ml: i32,
    /// mL/min.
    pub inspiratory_flow: i32,
    /// mL/min.
    pub expiratory_flow: i32,
    /// Volume delivered since the start of the cycle (mL).
    pub delivered_volume_ml: i32,
    /// Time since the previous tick (µs).
    pub dt_us: u32,
    /// Most recent pressure samples.
    pub last_pressures: RingBuffer<i16, PRESSURE_SAMPLES>,
}

impl Default for Measures {
    fn default() -> Self {
        Self {
            pressure: 0,
            pressure_command: 0,
            peak_pressure: 0,
            rebounce_peak_pressure: 0,
            plateau_pressure: None,
            peep: 0,
            tidal_volume_ml: None,
            cycles_per_minute: DEFAULT_CYCLES_PER_MINUTE_COMMAND,
            expiratory_volume_ml: 0,
            inspiratory_flow: 0,
            expiratory_flow: 0,
            delivered_volume_ml: 0,
            dt_us: DEFAULT_PERIOD_US,
            last_pressures: RingBuffer::filled(0),
        }
    }
}

impl Measures {
    /// Highest of the recent pressure samples.
    pub fn recent_max_pressure(&self) -> i16 {
        self.last_pressures.max()
    }
}
