//! Configuration types for the breathing-control core.
//!
//! These are the runtime configuration structs used by `BreathController` and
//! `Ventilator`. They are separate from the TOML-deserialized config in
//! `vent_config`.

use crate::params::{
    ALARM_THRESHOLD_DIFFERENCE_PERCENT, ALARM_THRESHOLD_DIFFERENCE_PRESSURE,
    ALARM_THRESHOLD_MAX_PRESSURE, ALARM_THRESHOLD_MIN_PRESSURE, DEFAULT_PERIOD_US,
    DEFAULT_SNOOZE_MS,
};

/// Control loop timing.
#[derive(Debug, Clone)]
pub struct ControllerCfg {
    /// Control period in microseconds. Must divide one second.
    pub period_us: u32,
}

impl Default for ControllerCfg {
    fn default() -> Self {
        Self {
            period_us: DEFAULT_PERIOD_US,
        }
    }
}

/// Pressure alarm thresholds and snooze duration.
#[derive(Debug, Clone)]
pub struct AlarmCfg {
    /// How long a snooze silences the buzzer (ms).
    pub snooze_ms: u64,
    /// Absolute ceiling (mmH2O). Above it both valves vent immediately.
    pub max_pressure_mmh2o: i16,
    /// Mean cycle pressure at or below which the patient counts as unplugged.
    pub min_mean_pressure_mmh2o: i16,
    /// Allowed plateau deviation, in percent of the command.
    pub plateau_tolerance_percent: i16,
    /// Allowed PEEP deviation (mmH2O).
    pub peep_tolerance_mmh2o: i16,
}

impl Default for AlarmCfg {
    fn default() -> Self {
        Self {
            snooze_ms: u64::from(DEFAULT_SNOOZE_MS),
            max_pressure_mmh2o: ALARM_THRESHOLD_MAX_PRESSURE,
            min_mean_pressure_mmh2o: ALARM_THRESHOLD_MIN_PRESSURE,
            plateau_tolerance_percent: ALARM_THRESHOLD_DIFFERENCE_PERCENT,
            peep_tolerance_mmh2o: ALARM_THRESHOLD_DIFFERENCE_PRESSURE,
        }
    }
}

/// Hardware seam behaviour.
#[derive(Debug, Clone)]
pub struct HardwareCfg {
    /// Read inspiratory/expiratory flow and delivered volume each tick.
    pub has_flow_sensor: bool,
    /// Battery samples are taken every this many ticks.
    pub battery_sample_every_ticks: u32,
    /// Passed to sensor reads that can block.
    pub sensor_read_timeout_ms: u64,
}

impl Default for HardwareCfg {
    fn default() -> Self {
        Self {
            has_flow_sensor: true,
            battery_sample_every_ticks: 1,
            sensor_read_timeout_ms: 150,
        }
    }
}
