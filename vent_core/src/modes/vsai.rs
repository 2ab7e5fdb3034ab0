//! Pressure support with spontaneous breathing (PC-VSAI).
//!
//! Inspiration is flow-cycled: it ends as soon as the inspiratory flow falls
//! under a share of its peak, once the minimum inspiration time has passed.

use super::bipap::track_inspiratory_slope;
use super::{BreathingStrategy, ModeContext, alarm_sets, slope_blower_increment};
use crate::params::DEFAULT_BLOWER_SPEED;
use crate::pid::{FastMode, PidController};
use crate::valve::Valve;

/// Assist trigger arming delay after the end of inspiration.
const ASSIST_TRIGGER_DELAY_MS: u32 = 500;

#[derive(Debug, Clone)]
pub struct Vsai {
    inspiratory_pid: PidController,
    expiratory_pid: PidController,
    plateau_reached: bool,
    blower_speed: u16,
    blower_increment: i32,
    inspiratory_slope: i32,
    max_inspiratory_flow: i32,
}

impl Vsai {
    pub fn new(inspiratory: &Valve, expiratory: &Valve, period_us: u32) -> Self {
        Self {
            inspiratory_pid: PidController::inspiratory(inspiratory, period_us),
            expiratory_pid: PidController::expiratory(expiratory, FastMode::FullyOpen, period_us),
            plateau_reached: false,
            blower_speed: DEFAULT_BLOWER_SPEED,
            blower_increment: 0,
            inspiratory_slope: 0,
            max_inspiratory_flow: 0,
        }
    }

    pub fn max_inspiratory_flow(&self) -> i32 {
        self.max_inspiratory_flow
    }

    pub fn inspiratory_slope(&self) -> i32 {
        self.inspiratory_slope
    }

    pub fn blower_speed(&self) -> u16 {
        self.blower_speed
    }

    /// End inspiration at the current tick when the flow has decayed enough.
    fn cycle_on_flow(&mut self, ctx: &mut ModeContext<'_>) {
        let flow = ctx.measures.inspiratory_flow;
        let ti_min = ctx.ticks_in(u32::from(ctx.commands.ti_min_ms));
        let threshold = i64::from(ctx.commands.expiratory_trigger_flow_percent)
            * i64::from(self.max_inspiratory_flow)
            / 100;

        if flow > self.max_inspiratory_flow {
            self.max_inspiratory_flow = flow;
        } else if i64::from(flow) < threshold && ctx.tick() > ti_min {
            if ctx.cycle.ticks_per_inhalation != ctx.tick() {
                tracing::debug!(
                    tick = ctx.tick(),
                    flow,
                    max_flow = self.max_inspiratory_flow,
                    "flow-cycled end of inspiration"
                );
            }
            ctx.cycle.ticks_per_inhalation = ctx.tick();
        }
    }
}

impl BreathingStrategy for Vsai {
    fn setup(&mut self, _ctx: &mut ModeContext<'_>) {
        self.blower_speed = DEFAULT_BLOWER_SPEED;
    }

    fn init_cycle(&mut self, ctx: &mut ModeContext<'_>) {
        self.plateau_reached = false;
        self.max_inspiratory_flow = 0;
        self.inspiratory_slope = 0;

        let span = ctx.pressure_span();
        self.inspiratory_pid.reset_keeping_aperture(span, 0);
        self.expiratory_pid.reset(-span, -span);

        ctx.blower.run_speed_with_increment(self.blower_speed, self.blower_increment);
        self.blower_speed = ctx.blower.speed();
        self.blower_increment = 0;
    }

    fn inhale(&mut self, ctx: &mut ModeContext<'_>) {
        let aperture =
            self.inspiratory_pid
                .compute_aperture(ctx.pressure_command(), ctx.pressure(), ctx.dt_us());
        ctx.inspiratory_valve.open_linear(i32::from(aperture));
        ctx.expiratory_valve.close();

        track_inspiratory_slope(ctx, &mut self.plateau_reached, &mut self.inspiratory_slope);
        self.cycle_on_flow(ctx);
    }

    fn exhale(&mut self, ctx: &mut ModeContext<'_>) {
        let aperture =
            self.expiratory_pid
                .compute_aperture(ctx.pressure_command(), ctx.pressure(), ctx.dt_us());
        ctx.expiratory_valve.open_linear(i32::from(aperture));
        ctx.inspiratory_valve.close();

        if ctx.assist_triggered(ASSIST_TRIGGER_DELAY_MS) {
            ctx.raise_trigger();
        }
    }

    fn end_cycle(&mut self, ctx: &mut ModeContext<'_>) {
        self.blower_increment = slope_blower_increment(
            ctx.measures.peak_pressure,
            ctx.measures.rebounce_peak_pressure,
            ctx.commands.plateau_pressure,
            self.inspiratory_slope,
        );
    }

    fn enabled_alarms(&self) -> &'static [u8] {
        alarm_sets::PRESSURE_ASSISTED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blower::Blower;
    use crate::commands::Commands;
    use crate::cycle::Cycle;
    use crate::measures::Measures;

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

    fn vsai() -> Vsai {
        let valve = Valve::pinch();
        Vsai::new(&valve, &valve, 10_000)
    }

    #[test]
    fn flow_decay_after_ti_min_shortens_inspiration() {
        let mut rig = Rig::new();
        let mut mode = vsai();
        mode.init_cycle(&mut rig.ctx());
        rig.measures.pressure_command = 200;
        rig.measures.pressure = 150;

        // Ti min is 400 ms = 40 ticks; exp trigger at 30 % of peak flow.
        rig.cycle.tick = 10;
        rig.measures.inspiratory_flow = 60_000;
        mode.inhale(&mut rig.ctx());
        assert_eq!(mode.max_inspiratory_flow(), 60_000);

        rig.cycle.tick = 30;
        rig.measures.inspiratory_flow = 10_000;
        mode.inhale(&mut rig.ctx());
        assert_eq!(rig.cycle.ticks_per_inhalation, 100, "too early to cycle");

        rig.cycle.tick = 45;
        rig.measures.inspiratory_flow = 18_000;
        mode.inhale(&mut rig.ctx());
        assert_eq!(rig.cycle.ticks_per_inhalation, 100, "flow not low enough");

        rig.measures.inspiratory_flow = 17_999;
        mode.inhale(&mut rig.ctx());
        assert_eq!(rig.cycle.ticks_per_inhalation, 45);
    }

    #[test]
    fn setup_restores_default_blower_base() {
        let mut rig = Rig::new();
        let mut mode = vsai();
        mode.blower_speed = 1500;
        mode.setup(&mut rig.ctx());
        mode.init_cycle(&mut rig.ctx());
        assert_eq!(rig.blower.speed(), DEFAULT_BLOWER_SPEED);
    }

    #[test]
    fn assist_trigger_arms_after_half_a_second() {
        let mut rig = Rig::new();
        let mut mode = vsai();
        mode.init_cycle(&mut rig.ctx());
        rig.measures.pressure_command = 100;
        rig.measures.pressure = -25;
        rig.cycle.tick = 150;
        mode.exhale(&mut rig.ctx());
        assert!(!rig.cycle.triggered);
        rig.cycle.tick = 151;
        mode.exhale(&mut rig.ctx());
        assert!(rig.cycle.triggered);
    }
}
