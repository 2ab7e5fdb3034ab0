//! Operator commands: the double-buffered command set and the setting messages
//! that reach it from other threads.

use crate::params::*;

/// Ventilation modes, in the order of the controller table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VentilationMode {
    #[default]
    PcCmv,
    PcAc,
    PcBipap,
    PcVsai,
    VcCmv,
    VcAc,
    VcPrvc,
}

impl VentilationMode {
    pub const ALL: [Self; 7] = [
        Self::PcCmv,
        Self::PcAc,
        Self::PcBipap,
        Self::PcVsai,
        Self::VcCmv,
        Self::VcAc,
        Self::VcPrvc,
    ];

    /// Slot in the mode controller table.
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PcCmv => "pc_cmv",
            Self::PcAc => "pc_ac",
            Self::PcBipap => "pc_bipap",
            Self::PcVsai => "pc_vsai",
            Self::VcCmv => "vc_cmv",
            Self::VcAc => "vc_ac",
            Self::VcPrvc => "vc_prvc",
        }
    }

    pub fn is_volume_controlled(self) -> bool {
        matches!(self, Self::VcCmv | Self::VcAc | Self::VcPrvc)
    }
}

impl std::fmt::Display for VentilationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VentilationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown ventilation mode '{s}'"))
    }
}

/// Volume and rate alarm bounds. Minute volumes and leak in mL/min, tidal
/// volumes in mL, rates in cycles per minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmBounds {
    pub inspiratory_minute_volume_low: u32,
    pub inspiratory_minute_volume_high: u32,
    pub expiratory_minute_volume_low: u32,
    pub expiratory_minute_volume_high: u32,
    pub respiratory_rate_low: u16,
    pub respiratory_rate_high: u16,
    pub leak_max: u32,
    pub tidal_volume_low: u16,
    pub tidal_volume_high: u16,
}

impl Default for AlarmBounds {
    fn default() -> Self {
        Self {
            inspiratory_minute_volume_low: DEFAULT_INSPIRATORY_MINUTE_VOLUME_LOW_ML,
            inspiratory_minute_volume_high: DEFAULT_INSPIRATORY_MINUTE_VOLUME_HIGH_ML,
            expiratory_minute_volume_low: DEFAULT_EXPIRATORY_MINUTE_VOLUME_LOW_ML,
            expiratory_minute_volume_high: DEFAULT_EXPIRATORY_MINUTE_VOLUME_HIGH_ML,
            respiratory_rate_low: DEFAULT_RESPIRATORY_RATE_LOW,
            respiratory_rate_high: DEFAULT_RESPIRATORY_RATE_HIGH,
            leak_max: DEFAULT_LEAK_MAX_ML,
            tidal_volume_low: DEFAULT_TIDAL_VOLUME_LOW_ML,
            tidal_volume_high: DEFAULT_TIDAL_VOLUME_HIGH_ML,
        }
    }
}

/// Upper limit accepted for minute volume and leak bounds (mL/min).
pub const MAX_MINUTE_VOLUME_BOUND: u32 = 60_000;
/// Upper limit accepted for tidal volume bounds (mL).
pub const MAX_TIDAL_VOLUME_BOUND: u16 = 3_000;
/// Upper limit accepted for respiratory rate bounds.
pub const MAX_RESPIRATORY_RATE_BOUND: u16 = 80;

/// Every operator setting. Pressures in mmH2O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commands {
    pub peak_pressure: i16,
    pub plateau_pressure: i16,
    pub peep: i16,
    pub cycles_per_minute: u16,
    /// Expiratory part of the I:E ratio, in tenths (20 = 1:2).
    pub expiratory_term: u16,
    pub trigger_enabled: bool,
    pub trigger_offset: i16,
    pub tidal_volume_ml: u16,
    pub plateau_duration_ms: u16,
    pub ti_min_ms: u16,
    pub expiratory_trigger_flow_percent: u16,
    pub target_inspiratory_flow_lpm: u16,
    pub mode: VentilationMode,
    pub alarm_bounds: AlarmBounds,
}

impl Default for Commands {
    fn default() -> Self {
        Self {
            peak_pressure: DEFAULT_PEAK_PRESSURE_COMMAND,
            plateau_pressure: DEFAULT_PLATEAU_COMMAND,
            peep: DEFAULT_PEEP_COMMAND,
            cycles_per_minute: DEFAULT_CYCLES_PER_MINUTE_COMMAND,
            expiratory_term: DEFAULT_EXPIRATORY_TERM_COMMAND,
            trigger_enabled: DEFAULT_TRIGGER_ENABLED,
            trigger_offset: DEFAULT_TRIGGER_OFFSET,
            tidal_volume_ml: DEFAULT_TIDAL_VOLUME_ML,
            plateau_duration_ms: DEFAULT_PLATEAU_DURATION_MS,
            ti_min_ms: DEFAULT_TI_MIN_MS,
            expiratory_trigger_flow_percent: DEFAULT_EXPIRATORY_TRIGGER_FLOW_PERCENT,
            target_inspiratory_flow_lpm: DEFAULT_TARGET_INSPIRATORY_FLOW_LPM,
            mode: VentilationMode::default(),
            alarm_bounds: AlarmBounds::default(),
        }
    }
}

impl Commands {
    /// Target inspiratory flow in mL/min.
    pub fn target_inspiratory_flow_ml_min(&self) -> i32 {
        i32::from(self.target_inspiratory_flow_lpm) * 1000
    }

    /// Every setting clamped to its accepted range, as the setters would.
    #[must_use]
    pub fn clamped(self) -> Self {
        let b = self.alarm_bounds;
        let order = |low: u32, high: u32, max: u32| {
            let (low, high) = (low.min(max), high.min(max));
            (low.min(high), low.max(high))
        };
        let (imv_low, imv_high) = order(
            b.inspiratory_minute_volume_low,
            b.inspiratory_minute_volume_high,
            MAX_MINUTE_VOLUME_BOUND,
        );
        let (emv_low, emv_high) = order(
            b.expiratory_minute_volume_low,
            b.expiratory_minute_volume_high,
            MAX_MINUTE_VOLUME_BOUND,
        );
        let rate_max = u32::from(MAX_RESPIRATORY_RATE_BOUND);
        let rate_low = u32::from(b.respiratory_rate_low).min(rate_max);
        let rate_high = u32::from(b.respiratory_rate_high).min(rate_max);
        let tidal_low = b.tidal_volume_low.min(MAX_TIDAL_VOLUME_BOUND);
        let tidal_high = b.tidal_volume_high.min(MAX_TIDAL_VOLUME_BOUND);

        Self {
            peak_pressure: self.peak_pressure.clamp(MIN_PEAK_PRESSURE, MAX_PEAK_PRESSURE),
            plateau_pressure: self
                .plateau_pressure
                .clamp(MIN_PLATEAU_PRESSURE, MAX_PLATEAU_PRESSURE),
            peep: self.peep.clamp(MIN_PEEP_PRESSURE, MAX_PEEP_PRESSURE),
            cycles_per_minute: self
                .cycles_per_minute
                .clamp(MIN_CYCLES_PER_MINUTE, MAX_CYCLES_PER_MINUTE),
            expiratory_term: self
                .expiratory_term
                .clamp(MIN_EXPIRATORY_TERM, MAX_EXPIRATORY_TERM),
            trigger_enabled: self.trigger_enabled,
            trigger_offset: self.trigger_offset.clamp(MIN_TRIGGER_OFFSET, MAX_TRIGGER_OFFSET),
            tidal_volume_ml: self
                .tidal_volume_ml
                .clamp(MIN_TIDAL_VOLUME_ML, MAX_TIDAL_VOLUME_ML),
            plateau_duration_ms: self
                .plateau_duration_ms
                .clamp(MIN_PLATEAU_DURATION_MS, MAX_PLATEAU_DURATION_MS),
            ti_min_ms: self.ti_min_ms.clamp(MIN_TI_MIN_MS, MAX_TI_MIN_MS),
            expiratory_trigger_flow_percent: self.expiratory_trigger_flow_percent.clamp(
                MIN_EXPIRATORY_TRIGGER_FLOW_PERCENT,
                MAX_EXPIRATORY_TRIGGER_FLOW_PERCENT,
            ),
            target_inspiratory_flow_lpm: self.target_inspiratory_flow_lpm.clamp(
                MIN_TARGET_INSPIRATORY_FLOW_LPM,
                MAX_TARGET_INSPIRATORY_FLOW_LPM,
            ),
            mode: self.mode,
            alarm_bounds: AlarmBounds {
                inspiratory_minute_volume_low: imv_low,
                inspiratory_minute_volume_high: imv_high,
                expiratory_minute_volume_low: emv_low,
                expiratory_minute_volume_high: emv_high,
                // Bounded by a u16 limit above.
                respiratory_rate_low: u16::try_from(rate_low.min(rate_high))
                    .unwrap_or(MAX_RESPIRATORY_RATE_BOUND),
                respiratory_rate_high: u16::try_from(rate_low.max(rate_high))
                    .unwrap_or(MAX_RESPIRATORY_RATE_BOUND),
                leak_max: b.leak_max.min(MAX_MINUTE_VOLUME_BOUND),
                tidal_volume_low: tidal_low.min(tidal_high),
                tidal_volume_high: tidal_low.max(tidal_high),
            },
        }
    }
}

/// Current commands drive the running cycle; next commands collect operator
/// changes and only become current at the start of a cycle.
#[derive(Debug, Clone, Default)]
pub struct CommandSet {
    current: Commands,
    next: Commands,
}

impl CommandSet {
    pub fn new(initial: Commands) -> Self {
        Self {
            current: initial,
            next: initial,
        }
    }

    pub fn current(&self) -> &Commands {
        &self.current
    }

    pub fn next(&self) -> &Commands {
        &self.next
    }

    pub(crate) fn next_mut(&mut self) -> &mut Commands {
        &mut self.next
    }

    /// Promote next to current. Only called at a cycle boundary.
    pub fn commit(&mut self) {
        self.current = self.next;
    }
}

/// Identifier carried by a control acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SettingId {
    PeakPressure = 1,
    PlateauPressure = 2,
    Peep = 3,
    CyclesPerMinute = 4,
    ExpiratoryTerm = 5,
    TriggerEnabled = 6,
    TriggerOffset = 7,
    Respiration = 8,
    AlarmSnooze = 9,
    VentilationMode = 10,
    TidalVolume = 11,
    PlateauDuration = 12,
    TiMin = 13,
    ExpiratoryTriggerFlow = 14,
    TargetInspiratoryFlow = 15,
    InspiratoryMinuteVolumeBounds = 16,
    ExpiratoryMinuteVolumeBounds = 17,
    RespiratoryRateBounds = 18,
    LeakMax = 19,
    TidalVolumeBounds = 20,
}

/// Setting change sent to the tick thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingCommand {
    Start,
    Stop,
    Snooze,
    Unsnooze,
    CyclesIncrease,
    CyclesDecrease,
    SetCycles(u16),
    PeepIncrease,
    PeepDecrease,
    SetPeep(i16),
    PlateauIncrease,
    PlateauDecrease,
    SetPlateau(i16),
    PeakIncrease,
    PeakDecrease,
    SetPeak(i16),
    SetExpiratoryTerm(u16),
    /// Only 0 and 1 are accepted.
    SetTriggerEnabled(u16),
    SetTriggerOffset(i16),
    SetTidalVolume(u16),
    SetPlateauDuration(u16),
    SetTiMin(u16),
    SetExpiratoryTriggerFlow(u16),
    SetTargetInspiratoryFlow(u16),
    SetMode(VentilationMode),
    SetInspiratoryMinuteVolumeBounds { low: u32, high: u32 },
    SetExpiratoryMinuteVolumeBounds { low: u32, high: u32 },
    SetRespiratoryRateBounds { low: u16, high: u16 },
    SetLeakMax(u32),
    SetTidalVolumeBounds { low: u16, high: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_its_name() {
        for mode in VentilationMode::ALL {
            assert_eq!(mode.as_str().parse::<VentilationMode>(), Ok(mode));
        }
        assert!("pc_xyz".parse::<VentilationMode>().is_err());
    }

    #[test]
    fn table_indices_are_dense() {
        for (i, mode) in VentilationMode::ALL.into_iter().enumerate() {
            assert_eq!(mode.index(), i);
        }
    }

    #[test]
    fn clamped_applies_setter_bounds() {
        let c = Commands {
            peep: 5,
            cycles_per_minute: 99,
            alarm_bounds: AlarmBounds {
                tidal_volume_low: 900,
                tidal_volume_high: 300,
                ..AlarmBounds::default()
            },
            ..Commands::default()
        }
        .clamped();
        assert_eq!(c.peep, MIN_PEEP_PRESSURE);
        assert_eq!(c.cycles_per_minute, MAX_CYCLES_PER_MINUTE);
        assert_eq!(c.alarm_bounds.tidal_volume_low, 300);
        assert_eq!(c.alarm_bounds.tidal_volume_high, 900);
        assert_eq!(Commands::default().clamped(), Commands::default());
    }

    #[test]
    fn commit_copies_next_into_current() {
        let mut set = CommandSet::default();
        set.next_mut().peep = 80;
        assert_eq!(set.current().peep, DEFAULT_PEEP_COMMAND);
        set.commit();
        assert_eq!(set.current().peep, 80);
    }
}
