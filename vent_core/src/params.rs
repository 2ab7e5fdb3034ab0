//! Machine constants: command bounds, defaults, actuator ranges and alarm thresholds.
//!
//! Pressures are in mmH2O, flows in mL/min, durations in ms.

// ── Control loop ────────────────────────────────────────────────────────────

/// Default control period (10 ms).
pub const DEFAULT_PERIOD_US: u32 = 10_000;

// ── Command bounds and defaults ─────────────────────────────────────────────

pub const MIN_PEAK_PRESSURE: i16 = 100;
pub const MAX_PEAK_PRESSURE: i16 = 700;
pub const MIN_PLATEAU_PRESSURE: i16 = 100;
pub const MAX_PLATEAU_PRESSURE: i16 = 400;
pub const MIN_PEEP_PRESSURE: i16 = 50;
pub const MAX_PEEP_PRESSURE: i16 = 300;
pub const MIN_TRIGGER_OFFSET: i16 = 0;
pub const MAX_TRIGGER_OFFSET: i16 = 100;
pub const MIN_EXPIRATORY_TERM: u16 = 10;
pub const MAX_EXPIRATORY_TERM: u16 = 60;
pub const MIN_CYCLES_PER_MINUTE: u16 = 5;
pub const MAX_CYCLES_PER_MINUTE: u16 = 35;

pub const MIN_TIDAL_VOLUME_ML: u16 = 50;
pub const MAX_TIDAL_VOLUME_ML: u16 = 2000;
pub const MIN_PLATEAU_DURATION_MS: u16 = 0;
pub const MAX_PLATEAU_DURATION_MS: u16 = 1000;
pub const MIN_TI_MIN_MS: u16 = 200;
pub const MAX_TI_MIN_MS: u16 = 3000;
pub const MIN_EXPIRATORY_TRIGGER_FLOW_PERCENT: u16 = 10;
pub const MAX_EXPIRATORY_TRIGGER_FLOW_PERCENT: u16 = 90;
pub const MIN_TARGET_INSPIRATORY_FLOW_LPM: u16 = 5;
pub const MAX_TARGET_INSPIRATORY_FLOW_LPM: u16 = 80;

pub const DEFAULT_PEEP_COMMAND: i16 = 100;
pub const DEFAULT_PLATEAU_COMMAND: i16 = 200;
pub const DEFAULT_PEAK_PRESSURE_COMMAND: i16 = 200;
pub const DEFAULT_EXPIRATORY_TERM_COMMAND: u16 = 20;
pub const DEFAULT_TRIGGER_OFFSET: i16 = 20;
pub const DEFAULT_CYCLES_PER_MINUTE_COMMAND: u16 = 20;
pub const DEFAULT_TRIGGER_ENABLED: bool = false;
pub const DEFAULT_TIDAL_VOLUME_ML: u16 = 400;
pub const DEFAULT_PLATEAU_DURATION_MS: u16 = 200;
pub const DEFAULT_TI_MIN_MS: u16 = 400;
pub const DEFAULT_EXPIRATORY_TRIGGER_FLOW_PERCENT: u16 = 30;
pub const DEFAULT_TARGET_INSPIRATORY_FLOW_LPM: u16 = 30;

// ── Actuators ───────────────────────────────────────────────────────────────

/// Pinch valve fully open.
pub const VALVE_OPEN_STATE: u16 = 0;
/// Pinch valve fully closed.
pub const VALVE_CLOSED_STATE: u16 = 125;
/// PWM pulse width (µs) at the open position.
pub const VALVE_PWM_OPEN_US: u16 = 640;
/// PWM pulse width (µs) at the closed position.
pub const VALVE_PWM_CLOSED_US: u16 = 900;

pub const MIN_BLOWER_SPEED: u16 = 300;
pub const MAX_BLOWER_SPEED: u16 = 1800;
pub const DEFAULT_BLOWER_SPEED: u16 = 900;

/// Marker a flow meter returns when a read failed.
pub const MASS_FLOW_ERROR_VALUE: i32 = 999_999;

// ── Measurements ────────────────────────────────────────────────────────────

/// Pressure samples kept for PEEP detection and assist triggering.
pub const PRESSURE_SAMPLES: usize = 10;
/// Breath periods averaged for the measured respiratory rate.
pub const BREATH_PERIODS: usize = 3;
/// Trailing part of inspiration averaged into the plateau measure.
pub const PLATEAU_WINDOW_MS: u32 = 200;
/// Delay after the end of inspiration before reading the tidal volume.
pub const TIDAL_VOLUME_READ_DELAY_MS: u32 = 100;
/// Pressure below which no patient circuit is assumed to be plugged.
pub const PATIENT_PLUGGED_MIN_PEAK: i16 = 100;
/// A plateau closer than this to the PEEP is reported as unknown.
pub const PLATEAU_PEEP_MIN_DELTA: i16 = 10;

// ── Alarm thresholds ────────────────────────────────────────────────────────

/// Mean cycle pressure at or below which the patient is considered unplugged.
pub const ALARM_THRESHOLD_MIN_PRESSURE: i16 = 20;
/// Absolute pressure ceiling; above it the machine vents immediately.
pub const ALARM_THRESHOLD_MAX_PRESSURE: i16 = 800;
/// Plateau tolerance in percent of the command.
pub const ALARM_THRESHOLD_DIFFERENCE_PERCENT: i16 = 20;
/// PEEP tolerance in mmH2O.
pub const ALARM_THRESHOLD_DIFFERENCE_PRESSURE: i16 = 20;
/// Default snooze duration.
pub const DEFAULT_SNOOZE_MS: u32 = 120_000;

pub const DEFAULT_INSPIRATORY_MINUTE_VOLUME_LOW_ML: u32 = 3_000;
pub const DEFAULT_INSPIRATORY_MINUTE_VOLUME_HIGH_ML: u32 = 20_000;
pub const DEFAULT_EXPIRATORY_MINUTE_VOLUME_LOW_ML: u32 = 3_000;
pub const DEFAULT_EXPIRATORY_MINUTE_VOLUME_HIGH_ML: u32 = 20_000;
pub const DEFAULT_RESPIRATORY_RATE_LOW: u16 = 5;
pub const DEFAULT_RESPIRATORY_RATE_HIGH: u16 = 40;
pub const DEFAULT_LEAK_MAX_ML: u32 = 4_000;
pub const DEFAULT_TIDAL_VOLUME_LOW_ML: u16 = 200;
pub const DEFAULT_TIDAL_VOLUME_HIGH_ML: u16 = 1_000;
