//! Pressure-controlled ventilation, with or without assist (PC-CMV, PC-AC).

use super::{BreathingStrategy, ModeContext, alarm_sets};
use crate::params::PATIENT_PLUGGED_MIN_PEAK;
use crate::pid::{FastMode, PidController};
use crate::util::ms_to_ticks;
use crate::valve::Valve;

/// Assist trigger arming delay after the end of inspiration.
const ASSIST_TRIGGER_DELAY_MS: u32 = 700;
/// Margin under the plateau command at which the plateau counts as reached.
const PLATEAU_REACHED_MARGIN: i32 = 5;
/// Half of the expected pressure ramp.
const HALF_RAMP_MS: u32 = 120;

#[derive(Debug, Clone)]
pub struct PressureCmv {
    assist: bool,
    inspiratory_pid: PidController,
    expiratory_pid: PidController,
    plateau_reached: bool,
    plateau_start_tick: u32,
    blower_increment: i32,
    period_us: u32,
}

impl PressureCmv {
    pub fn new(assist: bool, inspiratory: &Valve, expiratory: &Valve, period_us: u32) -> Self {
        Self {
            assist,
            inspiratory_pid: PidController::inspiratory(inspiratory, period_us),
            expiratory_pid: PidController::expiratory(expiratory, FastMode::Ramp, period_us),
            plateau_reached: false,
            plateau_start_tick: 0,
            blower_increment: 0,
            period_us,
        }
    }

    pub fn is_assisted(&self) -> bool {
        self.assist
    }

    /// Tick at which the plateau was first reached this cycle, or the
    /// inspiration length when it was not.
    pub fn plateau_start_tick(&self) -> u32 {
        self.plateau_start_tick
    }

    /// Increment applied to the blower at the next cycle start.
    pub fn blower_increment(&self) -> i32 {
        self.blower_increment
    }

    /// Blower correction from how early in the inspiration the plateau was
    /// reached. Too early or overshooting slows the blower down, too late
    /// speeds it up.
    fn compute_blower_increment(&self, ctx: &ModeContext<'_>) -> i32 {
        let peak = ctx.measures.peak_pressure;
        if peak <= 20 {
            return 0;
        }
        let peak_delta = i32::from(peak) - i32::from(ctx.commands.plateau_pressure);
        let ti = u64::from(ctx.ticks_per_inhalation());
        let start = u64::from(self.plateau_start_tick);
        let half_ramp = u64::from(ms_to_ticks(HALF_RAMP_MS, self.period_us));
        let percent = |p: u64| ti * p / 100;

        if start < percent(30) {
            if start < half_ramp || (peak_delta > 15 && start < percent(20)) || peak_delta > 25 {
                -100
            } else {
                0
            }
        } else if start < percent(40) {
            0
        } else if start < percent(50) {
            25
        } else if start < percent(60) {
            50
        } else {
            100
        }
    }
}

impl BreathingStrategy for PressureCmv {
    fn init_cycle(&mut self, ctx: &mut ModeContext<'_>) {
        self.plateau_reached = false;
        self.plateau_start_tick = ctx.ticks_per_inhalation();

        let span = ctx.pressure_span();
        self.inspiratory_pid.reset(span, 0);
        self.expiratory_pid.reset(-span, -span);

        let base = ctx.blower.speed();
        ctx.blower.run_speed_with_increment(base, self.blower_increment);
        self.blower_increment = 0;
    }

    fn inhale(&mut self, ctx: &mut ModeContext<'_>) {
        let aperture =
            self.inspiratory_pid
                .compute_aperture(ctx.pressure_command(), ctx.pressure(), ctx.dt_us());
        ctx.inspiratory_valve.open_to(i32::from(aperture));
        ctx.expiratory_valve.close();

        let plateau = i32::from(ctx.commands.plateau_pressure);
        if !self.plateau_reached && ctx.pressure() > plateau - PLATEAU_REACHED_MARGIN {
            self.plateau_start_tick = ctx.tick();
            self.plateau_reached = true;
        }
    }

    fn exhale(&mut self, ctx: &mut ModeContext<'_>) {
        ctx.inspiratory_valve.close();
        let aperture =
            self.expiratory_pid
                .compute_aperture(ctx.pressure_command(), ctx.pressure(), ctx.dt_us());
        ctx.expiratory_valve.open_to(i32::from(aperture));

        let offset = i32::from(ctx.commands.trigger_offset);
        if ctx.commands.trigger_enabled
            && ctx.cycle.peep_detected
            && ctx.pressure() < ctx.pressure_command() - offset
            && ctx.measures.peak_pressure > PATIENT_PLUGGED_MIN_PEAK
        {
            ctx.raise_trigger();
        }

        if self.assist && ctx.assist_triggered(ASSIST_TRIGGER_DELAY_MS) {
            ctx.raise_trigger();
        }
    }

    fn end_cycle(&mut self, ctx: &mut ModeContext<'_>) {
        self.blower_increment = self.compute_blower_increment(ctx);
        tracing::debug!(
            plateau_start = self.plateau_start_tick,
            increment = self.blower_increment,
            "blower increment"
        );
    }

    fn enabled_alarms(&self) -> &'static [u8] {
        if self.assist {
            alarm_sets::PRESSURE_ASSISTED
        } else {
            alarm_sets::PRESSURE_CONTROLLED
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

    fn controller(assist: bool) -> PressureCmv {
        let valve = Valve::pinch();
        PressureCmv::new(assist, &valve, &valve, 10_000)
    }

    #[test]
    fn init_cycle_starts_a_stopped_blower_at_default_speed() {
        let mut rig = Rig::new();
        let mut mode = controller(false);
        mode.init_cycle(&mut rig.ctx());
        assert_eq!(rig.blower.speed(), crate::params::DEFAULT_BLOWER_SPEED);
        assert_eq!(mode.plateau_start_tick(), 100);
    }

    #[test]
    fn inhale_closes_expiratory_and_records_plateau_start() {
        let mut rig = Rig::new();
        let mut mode = controller(false);
        mode.init_cycle(&mut rig.ctx());
        rig.measures.pressure_command = 200;
        rig.measures.pressure = 196;
        rig.cycle.tick = 42;
        mode.inhale(&mut rig.ctx());
        assert_eq!(rig.exp.command(), 125);
        assert_eq!(mode.plateau_start_tick(), 42);

        // Only the first crossing counts.
        rig.cycle.tick = 50;
        mode.inhale(&mut rig.ctx());
        assert_eq!(mode.plateau_start_tick(), 42);
    }

    #[test]
    fn pressure_trigger_needs_enable_and_detected_peep() {
        let mut rig = Rig::new();
        let mut mode = controller(false);
        mode.init_cycle(&mut rig.ctx());
        rig.measures.pressure_command = 100;
        rig.measures.pressure = 70;
        rig.measures.peak_pressure = 200;
        rig.cycle.tick = 150;
        mode.exhale(&mut rig.ctx());
        assert!(!rig.cycle.triggered);

        rig.commands.trigger_enabled = true;
        rig.cycle.peep_detected = true;
        mode.exhale(&mut rig.ctx());
        assert!(rig.cycle.triggered);
    }

    #[test]
    fn assist_trigger_waits_for_arming_delay() {
        let mut rig = Rig::new();
        let mut mode = controller(true);
        mode.init_cycle(&mut rig.ctx());
        rig.measures.pressure_command = 100;
        rig.measures.peak_pressure = 200;
        rig.measures.last_pressures.fill(100);
        rig.measures.pressure = 70;

        rig.cycle.tick = 170; // Ti + 70 ticks, not yet armed
        mode.exhale(&mut rig.ctx());
        assert!(!rig.cycle.triggered);

        rig.cycle.tick = 171;
        mode.exhale(&mut rig.ctx());
        assert!(rig.cycle.triggered);
    }

    #[rstest]
    #[case(5, 200, -100)] // faster than the half ramp
    #[case(25, 200, 0)]
    #[case(25, 230, -100)] // overshoot
    #[case(15, 216, -100)]
    #[case(35, 200, 0)]
    #[case(45, 200, 25)]
    #[case(55, 200, 50)]
    #[case(80, 200, 100)]
    #[case(80, 15, 0)] // patient unplugged
    fn blower_increment_bands(#[case] start: u32, #[case] peak: i16, #[case] expected: i32) {
        let mut rig = Rig::new();
        let mut mode = controller(false);
        mode.plateau_start_tick = start;
        rig.measures.peak_pressure = peak;
        mode.end_cycle(&mut rig.ctx());
        assert_eq!(mode.blower_increment(), expected);
    }

    #[test]
    fn increment_is_applied_once_at_next_cycle() {
        let mut rig = Rig::new();
        let mut mode = controller(false);
        mode.init_cycle(&mut rig.ctx());
        mode.plateau_start_tick = 80;
        rig.measures.peak_pressure = 200;
        mode.end_cycle(&mut rig.ctx());
        mode.init_cycle(&mut rig.ctx());
        assert_eq!(rig.blower.speed(), 1000);
        assert_eq!(mode.blower_increment(), 0);
    }
}
