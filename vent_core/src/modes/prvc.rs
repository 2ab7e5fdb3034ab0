//! Pressure-regulated volume control (VC-PRVC).
//!
//! The inspiratory valve opens fully for the first third of the inspiration;
//! the delivered volume is then regulated cycle to cycle through the blower
//! speed.

use super::{BreathingStrategy, ModeContext, alarm_sets};
use crate::params::DEFAULT_BLOWER_SPEED;
use crate::pid::{FastMode, PidController};
use crate::valve::Valve;

/// Volume the blower regulation aims for (mL).
const TARGET_TIDAL_VOLUME_ML: i32 = 300;
/// Under-delivery tolerated before speeding up (mL).
const UNDER_DELIVERY_MARGIN_ML: i32 = 30;
const BLOWER_STEP: i32 = 40;
/// Share of the inspiration (percent) the inspiratory valve stays open.
const OPEN_SHARE_PERCENT: u64 = 33;

#[derive(Debug, Clone)]
pub struct Prvc {
    expiratory_pid: PidController,
    blower_speed: u16,
    blower_increment: i32,
    max_inspiratory_flow: i32,
}

impl Prvc {
    pub fn new(expiratory: &Valve, period_us: u32) -> Self {
        Self {
            expiratory_pid: PidController::expiratory(expiratory, FastMode::FullyOpen, period_us),
            blower_speed: DEFAULT_BLOWER_SPEED,
            blower_increment: 0,
            max_inspiratory_flow: 0,
        }
    }

    pub fn blower_increment(&self) -> i32 {
        self.blower_increment
    }

    pub fn blower_speed(&self) -> u16 {
        self.blower_speed
    }

    pub fn max_inspiratory_flow(&self) -> i32 {
        self.max_inspiratory_flow
    }
}

impl BreathingStrategy for Prvc {
    fn init_cycle(&mut self, ctx: &mut ModeContext<'_>) {
        self.max_inspiratory_flow = 0;
        let span = ctx.pressure_span();
        self.expiratory_pid.reset(-span, -span);

        ctx.blower.run_speed_with_increment(self.blower_speed, self.blower_increment);
        self.blower_speed = ctx.blower.speed();
        self.blower_increment = 0;
    }

    fn inhale(&mut self, ctx: &mut ModeContext<'_>) {
        ctx.expiratory_valve.close();
        let open_until = u64::from(ctx.ticks_per_inhalation()) * OPEN_SHARE_PERCENT;
        if u64::from(ctx.tick()) * 100 < open_until {
            ctx.inspiratory_valve.open();
        } else {
            ctx.inspiratory_valve.close();
        }
        self.max_inspiratory_flow = self.max_inspiratory_flow.max(ctx.measures.inspiratory_flow);
    }

    fn exhale(&mut self, ctx: &mut ModeContext<'_>) {
        let aperture =
            self.expiratory_pid
                .compute_aperture(ctx.pressure_command(), ctx.pressure(), ctx.dt_us());
        ctx.expiratory_valve.open_linear(i32::from(aperture));
        ctx.inspiratory_valve.close();
    }

    fn end_cycle(&mut self, ctx: &mut ModeContext<'_>) {
        // An unread tidal volume counts as nothing delivered.
        let measured = i32::from(ctx.measures.tidal_volume_ml.unwrap_or(0));
        let shortfall = TARGET_TIDAL_VOLUME_ML - measured;
        self.blower_increment = if shortfall > UNDER_DELIVERY_MARGIN_ML {
            BLOWER_STEP
        } else if shortfall < 0 {
            -BLOWER_STEP
        } else {
            0
        };
        tracing::debug!(measured, increment = self.blower_increment, "blower increment");
    }

    fn enabled_alarms(&self) -> &'static [u8] {
        alarm_sets::VOLUME_CONTROLLED
    }
}
