//! Volume-controlled ventilation, with or without assist (VC-CMV, VC-AC).
//!
//! The inspiratory valve is opened to the orifice section that lets the
//! target flow through for the pressure drop between blower and patient.
//! Once the tidal volume is almost delivered the valve closes for the
//! plateau.

use super::{BreathingStrategy, ModeContext, alarm_sets};
use crate::fixed_point::{isqrt_i64, saturate_i32};
use crate::params::MAX_BLOWER_SPEED;
use crate::pid::{FastMode, PidController};
use crate::valve::{VALVE_FULL_SECTION, Valve};

const ASSIST_TRIGGER_DELAY_MS: u32 = 700;
/// Inspiration is stretched by this many ticks to leave room for the plateau.
const INSPIRATION_EXTENSION_TICKS: u32 = 50;
/// Time the inspiratory valve needs to close.
pub const VALVE_RESPONSE_TIME_MS: i32 = 20;
/// Air density, in hundredths of kg/m³.
const RHO: i64 = 120;

/// Orifice section (hundredths of mm²) passing `target_flow` mL/min across
/// the blower-to-patient pressure drop. Zero when no flow is asked for or the
/// drop is reversed.
pub fn orifice_section(blower_pressure: i32, patient_pressure: i32, target_flow: i32) -> i32 {
    if target_flow == 0 {
        return 0;
    }
    let a1 = i64::from(VALVE_FULL_SECTION);
    let drop = i64::from(blower_pressure) - i64::from(patient_pressure);
    let numerator = 100 * 2 * (a1 * a1 / 10_000) * (98 * drop / 10);
    let per_second = i64::from(target_flow) / 60;
    let divider = RHO * per_second * per_second / 100;
    let ratio = if divider == 0 { 0 } else { numerator / divider };
    let root = if ratio + 100 < 0 {
        0
    } else {
        isqrt_i64(ratio + 100)
    };
    if root == 0 {
        0
    } else {
        saturate_i32(a1 * 10 / root)
    }
}

#[derive(Debug, Clone)]
pub struct VolumeCmv {
    assist: bool,
    expiratory_pid: PidController,
    /// mL/min.
    target_flow: i32,
    during_plateau: bool,
    max_inspiratory_flow: i32,
}

impl VolumeCmv {
    pub fn new(assist: bool, expiratory: &Valve, period_us: u32) -> Self {
        Self {
            assist,
            expiratory_pid: PidController::expiratory(expiratory, FastMode::FullyOpen, period_us),
            target_flow: 0,
            during_plateau: false,
            max_inspiratory_flow: 0,
        }
    }

    pub fn target_flow(&self) -> i32 {
        self.target_flow
    }

    pub fn is_during_plateau(&self) -> bool {
        self.during_plateau
    }

    pub fn max_inspiratory_flow(&self) -> i32 {
        self.max_inspiratory_flow
    }
}

impl BreathingStrategy for VolumeCmv {
    fn init_cycle(&mut self, ctx: &mut ModeContext<'_>) {
        self.max_inspiratory_flow = 0;
        let span = ctx.pressure_span();
        self.expiratory_pid.reset(-span, -span);

        // Flow spreading the tidal volume over the inspiration minus the plateau.
        let inspiration_ms = i64::from(ctx.ticks_per_inhalation()) * i64::from(ctx.period_ms())
            - i64::from(ctx.commands.plateau_duration_ms);
        self.target_flow = if inspiration_ms <= 0 {
            0
        } else {
            saturate_i32(60_000 * i64::from(ctx.commands.tidal_volume_ml) / inspiration_ms)
        };

        ctx.blower.run_speed_with_ramp_up(MAX_BLOWER_SPEED);
        ctx.cycle.ticks_per_inhalation += INSPIRATION_EXTENSION_TICKS;
        self.during_plateau = false;
    }

    fn inhale(&mut self, ctx: &mut ModeContext<'_>) {
        ctx.expiratory_valve.close();

        let period_ms = i64::from(ctx.period_ms());
        let plateau_ms = i64::from(ctx.commands.plateau_duration_ms);
        let remaining_ms = (i64::from(ctx.ticks_per_inhalation()) - i64::from(ctx.tick()))
            * period_ms
            - plateau_ms;
        if remaining_ms > i64::from(VALVE_RESPONSE_TIME_MS) {
            self.target_flow = ctx.commands.target_inspiratory_flow_ml_min();
        }

        let flow = ctx.measures.inspiratory_flow;
        let plateau_ticks = ctx.ticks_in(u32::from(ctx.commands.plateau_duration_ms));
        let safety_volume = flow * VALVE_RESPONSE_TIME_MS / 60_000;
        if !self.during_plateau
            && ctx.measures.delivered_volume_ml
                > i32::from(ctx.commands.tidal_volume_ml) - safety_volume
        {
            ctx.cycle.ticks_per_inhalation = ctx.tick() + plateau_ticks;
            self.during_plateau = true;
            tracing::debug!(
                tick = ctx.tick(),
                volume = ctx.measures.delivered_volume_ml,
                "tidal volume reached, plateau"
            );
        }

        if ctx.tick() < ctx.ticks_per_inhalation().saturating_sub(plateau_ticks) {
            let blower_pressure = ctx.blower.blower_pressure(flow);
            let section = orifice_section(blower_pressure, ctx.pressure(), self.target_flow);
            ctx.inspiratory_valve.open_section(section);
        } else {
            ctx.inspiratory_valve.close();
        }

        self.max_inspiratory_flow = self.max_inspiratory_flow.max(flow);
    }

    fn exhale(&mut self, ctx: &mut ModeContext<'_>) {
        let aperture =
            self.expiratory_pid
                .compute_aperture(ctx.pressure_command(), ctx.pressure(), ctx.dt_us());
        ctx.expiratory_valve.open_linear(i32::from(aperture));
        ctx.inspiratory_valve.close();

        if self.assist && ctx.assist_triggered(ASSIST_TRIGGER_DELAY_MS) {
            ctx.raise_trigger();
        }
    }

    fn enabled_alarms(&self) -> &'static [u8] {
        if self.assist {
            alarm_sets::VOLUME_ASSISTED
        } else {
            alarm_sets::VOLUME_CONTROLLED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blower::Blower;
    use crate::commands::Commands;
    use crate::cycle::Cycle;
    use crate::measures::Measures;
    use rstest::rstest;

    #[rstest]
    #[case(500, 200, 30_000, 705)]
    #[case(500, 200, 0, 0)]
    #[case(100, 300, 30_000, 0)] // reversed drop
    #[case(500, 500, 30_000, 3318)] // no drop: fully open
    fn orifice_cases(#[case] blower: i32, #[case] patient: i32, #[case] flow: i32, #[case] expected: i32) {
        assert_eq!(orifice_section(blower, patient, flow), expected);
    }

    struct Rig {
        commands: Commands,
        cycle: Cycle,
        measures: Measures,
        insp: Valve,
        exp: Valve,
        blower: Blower,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                commands: Commands::default(),
                cycle: Cycle {
                    ticks_per_cycle: 300,
                    ticks_per_inhalation: 100,
                    ..Cycle::default()
                },
                measures: Measures::default(),
                insp: Valve::pinch(),
                exp: Valve::pinch(),
                blower: Blower::new(),
            }
        }

        fn ctx(&mut self) -> ModeContext<'_> {
            ModeContext {
                commands: &self.commands,
                cycle: &mut self.cycle,
                measures: &self.measures,
                inspiratory_valve: &mut self.insp,
                expiratory_valve: &mut self.exp,
                blower: &mut self.blower,
                period_us: 10_000,
            }
        }
    }

    #[test]
    fn init_cycle_sets_flow_ramp_and_extends_inspiration() {
        let mut rig = Rig::new();
        let valve = Valve::pinch();
        let mut mode = VolumeCmv::new(false, &valve, 10_000);
        mode.init_cycle(&mut rig.ctx());
        // 60000 * 400 / (1000 - 200)
        assert_eq!(mode.target_flow(), 30_000);
        assert_eq!(rig.blower.target_speed(), MAX_BLOWER_SPEED);
        assert_eq!(rig.cycle.ticks_per_inhalation, 150);
    }

    #[test]
    fn inspiration_without_time_for_the_plateau_asks_no_flow() {
        let mut rig = Rig::new();
        rig.cycle.ticks_per_inhalation = 20;
        let valve = Valve::pinch();
        let mut mode = VolumeCmv::new(false, &valve, 10_000);
        mode.init_cycle(&mut rig.ctx());
        assert_eq!(mode.target_flow(), 0);
    }

    #[test]
    fn delivered_volume_moves_inspiration_end_to_plateau() {
        let mut rig = Rig::new();
        let valve = Valve::pinch();
        let mut mode = VolumeCmv::new(false, &valve, 10_000);
        mode.init_cycle(&mut rig.ctx());
        rig.blower.execute(1_000_000);

        rig.cycle.tick = 10;
        rig.measures.inspiratory_flow = 30_000;
        rig.measures.pressure = 50;
        rig.measures.delivered_volume_ml = 100;
        mode.inhale(&mut rig.ctx());
        assert!(!mode.is_during_plateau());
        assert!(rig.insp.command() < 125, "valve opened toward target flow");
        assert_eq!(rig.exp.command(), 125);

        // 30 L/min over the 20 ms valve response is 10 mL of margin.
        rig.cycle.tick = 60;
        rig.measures.delivered_volume_ml = 391;
        mode.inhale(&mut rig.ctx());
        assert!(mode.is_during_plateau());
        assert_eq!(rig.cycle.ticks_per_inhalation, 80);
        assert_eq!(rig.insp.command(), 125);
    }

    #[test]
    fn assisted_variant_triggers_after_delay() {
        let mut rig = Rig::new();
        let valve = Valve::pinch();
        let mut mode = VolumeCmv::new(true, &valve, 10_000);
        rig.measures.pressure_command = 100;
        rig.measures.pressure = -30;
        rig.cycle.tick = 171;
        mode.exhale(&mut rig.ctx());
        assert!(rig.cycle.triggered);
        assert_eq!(mode.enabled_alarms(), alarm_sets::VOLUME_ASSISTED);
    }
}
