//! `From` implementations bridging `vent_config` types to `vent_core` types.

use crate::commands::{AlarmBounds, Commands, VentilationMode};
use crate::config::{AlarmCfg, ControllerCfg, HardwareCfg};
use crate::pressure::PressureCalibration;

// ── VentilationMode ──────────────────────────────────────────────────────────

impl From<vent_config::Mode> for VentilationMode {
    fn from(m: vent_config::Mode) -> Self {
        match m {
            vent_config::Mode::PcCmv => Self::PcCmv,
            vent_config::Mode::PcAc => Self::PcAc,
            vent_config::Mode::PcBipap => Self::PcBipap,
            vent_config::Mode::PcVsai => Self::PcVsai,
            vent_config::Mode::VcCmv => Self::VcCmv,
            vent_config::Mode::VcAc => Self::VcAc,
            vent_config::Mode::VcPrvc => Self::VcPrvc,
        }
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

/// Initial settings, clamped like operator input.
impl From<&vent_config::Config> for Commands {
    fn from(c: &vent_config::Config) -> Self {
        let v = &c.ventilation;
        let a = &c.alarms;
        Self {
            peak_pressure: v.peak_mmh2o,
            plateau_pressure: v.plateau_mmh2o,
            peep: v.peep_mmh2o,
            cycles_per_minute: v.cycles_per_minute,
            expiratory_term: v.expiratory_term,
            trigger_enabled: v.trigger_enabled,
            trigger_offset: v.trigger_offset_mmh2o,
            tidal_volume_ml: v.tidal_volume_ml,
            plateau_duration_ms: v.plateau_duration_ms,
            ti_min_ms: v.ti_min_ms,
            expiratory_trigger_flow_percent: v.expiratory_trigger_flow_percent,
            target_inspiratory_flow_lpm: v.target_inspiratory_flow_lpm,
            mode: v.mode.into(),
            alarm_bounds: AlarmBounds {
                inspiratory_minute_volume_low: a.inspiratory_minute_volume_low,
                inspiratory_minute_volume_high: a.inspiratory_minute_volume_high,
                expiratory_minute_volume_low: a.expiratory_minute_volume_low,
                expiratory_minute_volume_high: a.expiratory_minute_volume_high,
                respiratory_rate_low: a.respiratory_rate_low,
                respiratory_rate_high: a.respiratory_rate_high,
                leak_max: a.leak_max,
                tidal_volume_low: a.tidal_volume_low,
                tidal_volume_high: a.tidal_volume_high,
            },
        }
        .clamped()
    }
}

// ── ControllerCfg ────────────────────────────────────────────────────────────

impl From<&vent_config::Controller> for ControllerCfg {
    fn from(c: &vent_config::Controller) -> Self {
        Self {
            period_us: c.period_us,
        }
    }
}

// ── AlarmCfg ─────────────────────────────────────────────────────────────────

impl From<&vent_config::Alarms> for AlarmCfg {
    fn from(c: &vent_config::Alarms) -> Self {
        Self {
            snooze_ms: c.snooze_ms,
            max_pressure_mmh2o: c.max_pressure_mmh2o,
            min_mean_pressure_mmh2o: c.min_mean_pressure_mmh2o,
            plateau_tolerance_percent: c.plateau_tolerance_percent,
            peep_tolerance_mmh2o: c.peep_tolerance_mmh2o,
        }
    }
}

// ── HardwareCfg ──────────────────────────────────────────────────────────────

impl From<&vent_config::Hardware> for HardwareCfg {
    fn from(c: &vent_config::Hardware) -> Self {
        Self {
            has_flow_sensor: c.has_flow_sensor,
            battery_sample_every_ticks: c.battery_sample_every_ticks.max(1),
            sensor_read_timeout_ms: c.sensor_read_timeout_ms,
        }
    }
}

// ── PressureCalibration ──────────────────────────────────────────────────────

impl From<&vent_config::PressureCalibration> for PressureCalibration {
    fn from(c: &vent_config::PressureCalibration) -> Self {
        Self {
            gain_num: c.gain_num,
            gain_den: c.gain_den,
            offset_mmh2o: c.offset_mmh2o,
        }
    }
}
