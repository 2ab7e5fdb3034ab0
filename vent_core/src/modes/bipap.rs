//! Bi-level pressure ventilation (PC-BIPAP).
//!
//! The inspiratory valve stays partly open during expiration and the blower
//! drops to a lower speed, so a patient effort shows up as inspiratory flow.
//! That flow is what triggers the next breath.

use super::{BreathingStrategy, ModeContext, alarm_sets, slope_blower_increment};
use crate::params::{DEFAULT_BLOWER_SPEED, VALVE_CLOSED_STATE};
use crate::pid::{FastMode, PidController};
use crate::ring::RingBuffer;
use crate::valve::Valve;

pub(crate) const FLOW_SAMPLES: usize = 20;
/// Trigger window opens this long after the end of inspiration.
const TRIGGER_WINDOW_MS: u32 = 1400;
/// Blower speed drop during expiration.
const EXHALE_BLOWER_DROP: u16 = 400;
/// Inspiratory valve never opens wider than this during expiration.
const EXHALE_INSPIRATORY_FLOOR: i32 = 70;
/// Inspiratory flow above which a breath is triggered, before the offset term (mL/min).
const FLOW_TRIGGER_BASE: i32 = 28_000;
/// Margin under the plateau command at which the slope is measured.
const SLOPE_MARGIN: i32 = 20;

#[derive(Debug, Clone)]
pub struct Bipap {
    inspiratory_pid: PidController,
    expiratory_pid: PidController,
    plateau_reached: bool,
    trigger_window: u32,
    inspiratory_flows: RingBuffer<i32, FLOW_SAMPLES>,
    blower_speed: u16,
    blower_increment: i32,
    inspiratory_slope: i32,
}

impl Bipap {
    pub fn new(inspiratory: &Valve, expiratory: &Valve, period_us: u32) -> Self {
        Self {
            inspiratory_pid: PidController::inspiratory(inspiratory, period_us),
            expiratory_pid: PidController::expiratory(expiratory, FastMode::FullyOpen, period_us),
            plateau_reached: false,
            trigger_window: 0,
            inspiratory_flows: RingBuffer::filled(0),
            blower_speed: DEFAULT_BLOWER_SPEED,
            blower_increment: 0,
            inspiratory_slope: 0,
        }
    }

    /// Pressure rise rate measured this cycle (mmH2O/s).
    pub fn inspiratory_slope(&self) -> i32 {
        self.inspiratory_slope
    }

    pub fn blower_speed(&self) -> u16 {
        self.blower_speed
    }

    pub fn blower_increment(&self) -> i32 {
        self.blower_increment
    }

    pub fn trigger_window(&self) -> u32 {
        self.trigger_window
    }
}

/// Record the slope the first time pressure gets near the plateau.
pub(crate) fn track_inspiratory_slope(ctx: &ModeContext<'_>, reached: &mut bool, slope: &mut i32) {
    let plateau = i32::from(ctx.commands.plateau_pressure);
    if !*reached && ctx.pressure() > plateau - SLOPE_MARGIN {
        let elapsed = i32::try_from(ctx.tick().max(1)).unwrap_or(i32::MAX);
        *slope = (ctx.pressure() - i32::from(ctx.measures.peep)) * 100 / elapsed;
        *reached = true;
    }
}

impl BreathingStrategy for Bipap {
    fn init_cycle(&mut self, ctx: &mut ModeContext<'_>) {
        self.plateau_reached = false;
        self.trigger_window = ctx.ticks_per_inhalation() + ctx.ticks_in(TRIGGER_WINDOW_MS);
        self.inspiratory_slope = 0;

        let span = ctx.pressure_span();
        // The inspiratory ramp resumes from where expiration left the valve.
        self.inspiratory_pid.reset_keeping_aperture(span, 0);
        self.expiratory_pid.reset(-span, -span);
        self.inspiratory_flows.fill(0);

        ctx.blower.run_speed_with_increment(self.blower_speed, self.blower_increment);
        self.blower_speed = ctx.blower.speed();
        self.blower_increment = 0;
    }

    fn inhale(&mut self, ctx: &mut ModeContext<'_>) {
        let aperture =
            self.inspiratory_pid
                .compute_aperture(ctx.pressure_command(), ctx.pressure(), ctx.dt_us());
        ctx.inspiratory_valve.open_to(i32::from(aperture));
        ctx.expiratory_valve.close();

        track_inspiratory_slope(ctx, &mut self.plateau_reached, &mut self.inspiratory_slope);
    }

    fn exhale(&mut self, ctx: &mut ModeContext<'_>) {
        ctx.blower.run_speed(self.blower_speed.saturating_sub(EXHALE_BLOWER_DROP));

        let aperture =
            self.expiratory_pid
                .compute_aperture(ctx.pressure_command(), ctx.pressure(), ctx.dt_us());
        ctx.expiratory_valve.open_to(i32::from(aperture));

        let since_inhale = ctx.tick().saturating_sub(ctx.ticks_per_inhalation());
        let held = (i32::from(VALVE_CLOSED_STATE) - i32::try_from(since_inhale / 2).unwrap_or(i32::MAX))
            .max(EXHALE_INSPIRATORY_FLOOR);
        ctx.inspiratory_valve.open_to(held);
        self.inspiratory_pid
            .set_last_aperture(u16::try_from(held).unwrap_or(VALVE_CLOSED_STATE));

        let flow = ctx.measures.inspiratory_flow;
        if ctx.tick() < self.trigger_window {
            self.inspiratory_flows.push(flow);
        } else if ctx.commands.trigger_enabled {
            let threshold = FLOW_TRIGGER_BASE + 100 * i32::from(ctx.commands.trigger_offset);
            if flow > threshold {
                tracing::trace!(
                    flow,
                    baseline = self.inspiratory_flows.sum() / FLOW_SAMPLES as i64,
                    "flow trigger"
                );
                ctx.raise_trigger();
            }
        }
    }

    fn end_cycle(&mut self, ctx: &mut ModeContext<'_>) {
        self.blower_increment = slope_blower_increment(
            ctx.measures.peak_pressure,
            ctx.measures.rebounce_peak_pressure,
            ctx.commands.plateau_pressure,
            self.inspiratory_slope,
        );
        tracing::debug!(
            slope = self.inspiratory_slope,
            increment = self.blower_increment,
            "blower increment"
        );
    }

    fn enabled_alarms(&self) -> &'static [u8] {
        alarm_sets::PRESSURE_CONTROLLED
    }
}
