//! Ventilation-mode controllers.
//!
//! Each mode decides, tick by tick, how the two valves and the blower move
//! during inspiration and expiration. The breath controller owns one instance
//! of every mode in a [`ModeTable`] and calls into the active one through
//! [`ModeController`]; switching only happens at a cycle boundary.
//!
//! Modes never fail. They read the shared state through a [`ModeContext`] and
//! only write actuator commands, the trigger flag and, for the flow-cycled and
//! volume modes, the inspiration length.

use crate::blower::Blower;
use crate::commands::{Commands, VentilationMode};
use crate::cycle::Cycle;
use crate::measures::Measures;
use crate::params::PATIENT_PLUGGED_MIN_PEAK;
use crate::util::period_ms;
use crate::valve::Valve;

mod bipap;
mod pressure_cmv;
mod prvc;
mod volume_cmv;
mod vsai;

pub use bipap::Bipap;
pub use pressure_cmv::PressureCmv;
pub use prvc::Prvc;
pub use volume_cmv::{VolumeCmv, orifice_section};
pub use vsai::Vsai;

/// Everything a mode may look at or move during one call.
pub struct ModeContext<'a> {
    pub commands: &'a Commands,
    pub cycle: &'a mut Cycle,
    pub measures: &'a Measures,
    pub inspiratory_valve: &'a mut Valve,
    pub expiratory_valve: &'a mut Valve,
    pub blower: &'a mut Blower,
    pub period_us: u32,
}

impl ModeContext<'_> {
    pub fn pressure(&self) -> i32 {
        i32::from(self.measures.pressure)
    }

    pub fn pressure_command(&self) -> i32 {
        i32::from(self.measures.pressure_command)
    }

    pub fn tick(&self) -> u32 {
        self.cycle.tick
    }

    pub fn ticks_per_inhalation(&self) -> u32 {
        self.cycle.ticks_per_inhalation
    }

    pub fn dt_us(&self) -> u32 {
        self.measures.dt_us
    }

    pub fn period_ms(&self) -> u32 {
        period_ms(self.period_us)
    }

    /// Whole ticks in `ms`; may be zero.
    pub fn ticks_in(&self, ms: u32) -> u32 {
        ms / self.period_ms()
    }

    /// Plateau minus PEEP commands, the error both PIDs restart from.
    pub fn pressure_span(&self) -> i32 {
        i32::from(self.commands.plateau_pressure) - i32::from(self.commands.peep)
    }

    pub fn raise_trigger(&mut self) {
        if !self.cycle.triggered {
            tracing::debug!(cycle = self.cycle.number, tick = self.cycle.tick, "inspiratory trigger");
        }
        self.cycle.triggered = true;
    }

    /// Assist-control trigger, armed `delay_ms` after the end of inspiration:
    /// pressure dropped by the trigger offset below the recent maximum with a
    /// patient plugged, or fell below minus the offset.
    pub(crate) fn assist_triggered(&self, delay_ms: u32) -> bool {
        if self.tick() <= self.ticks_per_inhalation() + self.ticks_in(delay_ms) {
            return false;
        }
        let offset = i32::from(self.commands.trigger_offset);
        let pressure = self.pressure();
        let recent_max = i32::from(self.measures.recent_max_pressure());
        (pressure < recent_max - offset && self.measures.peak_pressure > PATIENT_PLUGGED_MIN_PEAK)
            || pressure < -offset
    }
}

/// Operations every mode implements.
pub trait BreathingStrategy {
    /// Run once when the mode becomes active.
    fn setup(&mut self, _ctx: &mut ModeContext<'_>) {}
    fn init_cycle(&mut self, ctx: &mut ModeContext<'_>);
    fn inhale(&mut self, ctx: &mut ModeContext<'_>);
    fn exhale(&mut self, ctx: &mut ModeContext<'_>);
    fn end_cycle(&mut self, _ctx: &mut ModeContext<'_>) {}
    /// Alarm codes active while this mode runs.
    fn enabled_alarms(&self) -> &'static [u8];
}

/// Enum dispatch over the concrete modes.
#[derive(Debug, Clone)]
pub enum ModeController {
    PcCmv(PressureCmv),
    PcAc(PressureCmv),
    PcBipap(Bipap),
    PcVsai(Vsai),
    VcCmv(VolumeCmv),
    VcAc(VolumeCmv),
    VcPrvc(Prvc),
}

macro_rules! dispatch {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            ModeController::PcCmv($inner) | ModeController::PcAc($inner) => $body,
            ModeController::PcBipap($inner) => $body,
            ModeController::PcVsai($inner) => $body,
            ModeController::VcCmv($inner) | ModeController::VcAc($inner) => $body,
            ModeController::VcPrvc($inner) => $body,
        }
    };
}

impl ModeController {
    pub fn new(
        mode: VentilationMode,
        inspiratory_valve: &Valve,
        expiratory_valve: &Valve,
        period_us: u32,
    ) -> Self {
        let (insp, exp) = (inspiratory_valve, expiratory_valve);
        match mode {
            VentilationMode::PcCmv => Self::PcCmv(PressureCmv::new(false, insp, exp, period_us)),
            VentilationMode::PcAc => Self::PcAc(PressureCmv::new(true, insp, exp, period_us)),
            VentilationMode::PcBipap => Self::PcBipap(Bipap::new(insp, exp, period_us)),
            VentilationMode::PcVsai => Self::PcVsai(Vsai::new(insp, exp, period_us)),
            VentilationMode::VcCmv => Self::VcCmv(VolumeCmv::new(false, exp, period_us)),
            VentilationMode::VcAc => Self::VcAc(VolumeCmv::new(true, exp, period_us)),
            VentilationMode::VcPrvc => Self::VcPrvc(Prvc::new(exp, period_us)),
        }
    }

    pub fn mode(&self) -> VentilationMode {
        match self {
            Self::PcCmv(_) => VentilationMode::PcCmv,
            Self::PcAc(_) => VentilationMode::PcAc,
            Self::PcBipap(_) => VentilationMode::PcBipap,
            Self::PcVsai(_) => VentilationMode::PcVsai,
            Self::VcCmv(_) => VentilationMode::VcCmv,
            Self::VcAc(_) => VentilationMode::VcAc,
            Self::VcPrvc(_) => VentilationMode::VcPrvc,
        }
    }
}

impl BreathingStrategy for ModeController {
    fn setup(&mut self, ctx: &mut ModeContext<'_>) {
        dispatch!(self, m => m.setup(ctx))
    }

    fn init_cycle(&mut self, ctx: &mut ModeContext<'_>) {
        dispatch!(self, m => m.init_cycle(ctx))
    }

    fn inhale(&mut self, ctx: &mut ModeContext<'_>) {
        dispatch!(self, m => m.inhale(ctx))
    }

    fn exhale(&mut self, ctx: &mut ModeContext<'_>) {
        dispatch!(self, m => m.exhale(ctx))
    }

    fn end_cycle(&mut self, ctx: &mut ModeContext<'_>) {
        dispatch!(self, m => m.end_cycle(ctx))
    }

    fn enabled_alarms(&self) -> &'static [u8] {
        dispatch!(self, m => m.enabled_alarms())
    }
}

/// One controller per mode, indexed by [`VentilationMode::index`].
#[derive(Debug, Clone)]
pub struct ModeTable {
    controllers: [ModeController; 7],
}

impl ModeTable {
    pub fn new(inspiratory_valve: &Valve, expiratory_valve: &Valve, period_us: u32) -> Self {
        Self {
            controllers: VentilationMode::ALL
                .map(|mode| ModeController::new(mode, inspiratory_valve, expiratory_valve, period_us)),
        }
    }

    pub fn get(&self, mode: VentilationMode) -> &ModeController {
        &self.controllers[mode.index()]
    }

    pub fn get_mut(&mut self, mode: VentilationMode) -> &mut ModeController {
        &mut self.controllers[mode.index()]
    }
}

/// Enabled alarm lists.
pub mod alarm_sets {
    use crate::alarm::codes::*;

    /// Pressure-controlled modes without assist.
    pub const PRESSURE_CONTROLLED: &[u8] = &[
        PLATEAU_NOT_REACHED,
        PATIENT_UNPLUGGED,
        PEEP_NOT_REACHED,
        BATTERY_LOW,
        BATTERY_VERY_LOW,
        PLATEAU_NOT_REACHED_MEDIUM,
        PEEP_NOT_REACHED_MEDIUM,
        MAINS_DISCONNECTED,
        PRESSURE_TOO_HIGH,
        PATIENT_UNPLUGGED_MEDIUM,
    ];

    /// Pressure-controlled modes with patient-triggered breaths.
    pub const PRESSURE_ASSISTED: &[u8] = &[
        PLATEAU_NOT_REACHED,
        PATIENT_UNPLUGGED,
        PEEP_NOT_REACHED,
        INSPIRATORY_MINUTE_VOLUME_LOW,
        INSPIRATORY_MINUTE_VOLUME_HIGH,
        EXPIRATORY_MINUTE_VOLUME_LOW,
        EXPIRATORY_MINUTE_VOLUME_HIGH,
        RESPIRATORY_RATE_LOW,
        RESPIRATORY_RATE_HIGH,
        BATTERY_LOW,
        BATTERY_VERY_LOW,
        PLATEAU_NOT_REACHED_MEDIUM,
        PEEP_NOT_REACHED_MEDIUM,
        MAINS_DISCONNECTED,
        PRESSURE_TOO_HIGH,
        PATIENT_UNPLUGGED_MEDIUM,
        TIDAL_VOLUME_LOW,
        TIDAL_VOLUME_HIGH,
    ];

    /// Volume-controlled modes without assist.
    pub const VOLUME_CONTROLLED: &[u8] = &[
        PATIENT_UNPLUGGED,
        PEEP_NOT_REACHED,
        EXPIRATORY_MINUTE_VOLUME_HIGH,
        LEAK_HIGH,
        BATTERY_LOW,
        BATTERY_VERY_LOW,
        PEEP_NOT_REACHED_MEDIUM,
        MAINS_DISCONNECTED,
        PRESSURE_TOO_HIGH,
        PATIENT_UNPLUGGED_MEDIUM,
    ];

    pub const VOLUME_ASSISTED: &[u8] = &[
        PATIENT_UNPLUGGED,
        PEEP_NOT_REACHED,
        INSPIRATORY_MINUTE_VOLUME_LOW,
        INSPIRATORY_MINUTE_VOLUME_HIGH,
        EXPIRATORY_MINUTE_VOLUME_LOW,
        EXPIRATORY_MINUTE_VOLUME_HIGH,
        RESPIRATORY_RATE_LOW,
        RESPIRATORY_RATE_HIGH,
        LEAK_HIGH,
        BATTERY_LOW,
        BATTERY_VERY_LOW,
        PEEP_NOT_REACHED_MEDIUM,
        MAINS_DISCONNECTED,
        PRESSURE_TOO_HIGH,
        PATIENT_UNPLUGGED_MEDIUM,
    ];
}

/// Blower increment for the slope-regulated pressure modes (BIPAP, VSAI).
///
/// Overshoot and rebounce around the plateau take precedence; otherwise the
/// inspiratory slope (mmH2O/s) is steered toward about 600.
pub(crate) fn slope_blower_increment(
    peak: i16,
    rebounce_peak: i16,
    plateau_command: i16,
    slope: i32,
) -> i32 {
    if peak <= 20 {
        return 0;
    }
    let peak_delta = i32::from(peak) - i32::from(plateau_command);
    let rebounce_delta = i32::from(rebounce_peak) - i32::from(plateau_command);
    let rebounce = |peak_limit: i32, rebounce_limit: i32| {
        peak_delta > peak_limit || (rebounce_delta < -rebounce_limit && peak_delta >= 0)
    };
    let very_high = rebounce(60, 60);
    let high = rebounce(40, 40);
    let low = rebounce(20, 15);
    let very_low = rebounce(10, 10);

    if very_high {
        -100
    } else if high {
        -10
    } else if slope > 650 {
        if slope > 1000 || (low && slope > 800) || peak_delta > 25 {
            -100
        } else {
            0
        }
    } else if slope > 550 {
        0
    } else if slope > 450 && !very_low {
        25
    } else if slope > 350 && !very_low {
        50
    } else if slope > 250 && !very_low {
        75
    } else if !low {
        100
    } else {
        0
    }
}
