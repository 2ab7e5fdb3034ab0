//! Pressure-tracking PID driving one valve.
//!
//! Each controller runs in two regimes:
//! - **fast mode** (open loop): while the pressure is far from target the valve
//!   ramps toward fully open, or jumps there, ignoring the PID terms;
//! - **PID mode**: once the error crosses the exit threshold the integral is
//!   back-computed from the current aperture so the output stays continuous.
//!
//! Gains are windowed on the sign of the error. The integral only advances
//! when the resulting aperture is strictly inside the valve range.

use crate::fixed_point::{clamp_to_u16, saturate_i32};
use crate::ring::RingBuffer;
use crate::valve::Valve;

/// Errors averaged into the smoothed error.
pub const PID_ERROR_SAMPLES: usize = 10;
pub const PID_INTEGRAL_MAX: i64 = 1000;
pub const PID_INTEGRAL_MIN: i64 = -1000;

const KP: i64 = 2500;
const KD: i64 = 0;
/// Added to the PEEP target on the expiratory side.
const PEEP_SAFETY_OFFSET: i64 = 0;
const INSPIRATORY_FAST_EXIT_ERROR: i64 = 20;
const EXPIRATORY_FAST_EXIT_ERROR: i64 = -30;

/// Which valve the controller drives; selects gains, error sign and output mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidDirection {
    /// Inspiratory valve, tracks the plateau pressure.
    Inspiratory,
    /// Expiratory valve, tracks the PEEP.
    Expiratory,
}

/// Open-loop behaviour while in fast mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastMode {
    /// Linear ramp toward fully open, about 250 ms end to end.
    Ramp,
    /// Fully open at once.
    FullyOpen,
}

#[derive(Debug, Clone)]
pub struct PidController {
    direction: PidDirection,
    fast: FastMode,
    errors: RingBuffer<i32, PID_ERROR_SAMPLES>,
    integral: i64,
    last_error: i64,
    last_aperture: i64,
    fast_mode: bool,
    min: i64,
    max: i64,
    period_us: u32,
}

impl PidController {
    pub fn new(direction: PidDirection, fast: FastMode, valve: &Valve, period_us: u32) -> Self {
        Self {
            direction,
            fast,
            errors: RingBuffer::filled(0),
            integral: 0,
            last_error: 0,
            last_aperture: i64::from(valve.max_aperture()),
            fast_mode: true,
            min: i64::from(valve.min_aperture()),
            max: i64::from(valve.max_aperture()),
            period_us,
        }
    }

    pub fn inspiratory(valve: &Valve, period_us: u32) -> Self {
        Self::new(PidDirection::Inspiratory, FastMode::Ramp, valve, period_us)
    }

    pub fn expiratory(valve: &Valve, fast: FastMode, period_us: u32) -> Self {
        Self::new(PidDirection::Expiratory, fast, valve, period_us)
    }

    /// Per-cycle re-initialisation: back to fast mode from a closed valve.
    pub fn reset(&mut self, last_error: i32, ring_fill: i32) {
        self.last_aperture = self.max;
        self.reset_keeping_aperture(last_error, ring_fill);
    }

    /// Like `reset` but the ramp resumes from the last aperture.
    pub fn reset_keeping_aperture(&mut self, last_error: i32, ring_fill: i32) {
        self.integral = 0;
        self.last_error = i64::from(last_error);
        self.errors.fill(ring_fill);
        self.fast_mode = true;
    }

    /// Override the aperture the next ramp step starts from.
    pub fn set_last_aperture(&mut self, aperture: u16) {
        self.last_aperture = i64::from(aperture);
    }

    pub fn integral(&self) -> i32 {
        saturate_i32(self.integral)
    }

    pub fn is_fast_mode(&self) -> bool {
        self.fast_mode
    }

    pub fn last_aperture(&self) -> u16 {
        clamp_to_u16(self.last_aperture, 0, u16::MAX)
    }

    /// Aperture step per tick of the fast-mode ramp.
    pub fn ramp_increment(&self) -> u16 {
        clamp_to_u16(5 * i64::from(self.period_us) / 10_000, 0, u16::MAX)
    }

    /// One control step. `dt_us == 0` contributes no derivative and no integral.
    pub fn compute_aperture(&mut self, target: i32, measured: i32, dt_us: u32) -> u16 {
        let (target, measured, dt) = (i64::from(target), i64::from(measured), i64::from(dt_us));
        let error = match self.direction {
            PidDirection::Inspiratory => target - measured,
            PidDirection::Expiratory => target + PEEP_SAFETY_OFFSET - measured,
        };

        self.errors.push(saturate_i32(error));
        let smooth_error = self.errors.mean();

        let ki = self.integral_gain(error, target);
        let exit_fast_mode = match self.direction {
            PidDirection::Inspiratory => error < INSPIRATORY_FAST_EXIT_ERROR,
            PidDirection::Expiratory => error > EXPIRATORY_FAST_EXIT_ERROR,
        };
        if exit_fast_mode {
            if self.fast_mode {
                self.integral = self.seed_integral(error);
            }
            self.fast_mode = false;
        }

        let mut trial_integral = 0;
        let aperture = if self.fast_mode {
            self.fast_mode_aperture()
        } else {
            let derivative = if dt == 0 {
                0
            } else {
                match self.direction {
                    PidDirection::Inspiratory => 1_000_000 * (self.last_error - smooth_error) / dt,
                    PidDirection::Expiratory => 1_000_000 * (smooth_error - self.last_error) / dt,
                }
            };
            trial_integral = (self.integral + ki * error * dt / 1_000_000)
                .clamp(PID_INTEGRAL_MIN, PID_INTEGRAL_MAX);
            let command = KP * error / 1000 + trial_integral + KD * derivative / 1000;
            let span = match self.direction {
                PidDirection::Inspiratory => self.min - self.max,
                PidDirection::Expiratory => self.max - self.min,
            };
            (self.max + span * command / 1000).clamp(self.min, self.max)
        };

        // Anti-windup: only commit the integral away from the stops.
        if aperture != self.min && aperture != self.max {
            self.integral = trial_integral;
        }

        self.last_aperture = aperture;
        self.last_error = smooth_error;
        tracing::trace!(
            direction = ?self.direction,
            error,
            aperture,
            integral = self.integral,
            fast = self.fast_mode,
            "pid step"
        );
        clamp_to_u16(aperture, 0, u16::MAX)
    }

    fn integral_gain(&self, error: i64, target: i64) -> i64 {
        match self.direction {
            PidDirection::Inspiratory => {
                if error < 0 {
                    200
                } else {
                    50
                }
            }
            PidDirection::Expiratory => {
                // The target is the PEEP on this side; high PEEP needs a lower gain.
                if error < 0 {
                    50
                } else if target > 100 {
                    120
                } else {
                    -130 * target / 50 + 380
                }
            }
        }
    }

    /// Integral that reproduces `last_aperture` once the proportional term is added.
    fn seed_integral(&self, error: i64) -> i64 {
        let proportional = KP * error / 1000;
        if self.max == self.min {
            return -proportional;
        }
        let span = match self.direction {
            PidDirection::Inspiratory => self.min - self.max,
            PidDirection::Expiratory => self.max - self.min,
        };
        1000 * (self.last_aperture - self.max) / span - proportional
    }

    fn fast_mode_aperture(&self) -> i64 {
        match self.fast {
            FastMode::FullyOpen => 0i64.clamp(self.min, self.max),
            FastMode::Ramp => {
                let increment = 5 * i64::from(self.period_us) / 10_000;
                if self.last_aperture >= increment {
                    (self.last_aperture - increment).clamp(self.min, self.max)
                } else {
                    0
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insp() -> PidController {
        PidController::inspiratory(&Valve::pinch(), 10_000)
    }

    #[test]
    fn fast_mode_ramps_five_degrees_per_ten_ms() {
        let mut pid = insp();
        pid.reset(150, 0);
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(pid.compute_aperture(200, 50, 10_000));
        }
        assert_eq!(seen, vec![120, 115, 110, 105]);
        assert!(pid.is_fast_mode());
        assert_eq!(pid.ramp_increment(), 5);
    }

    #[test]
    fn ramp_reaches_fully_open_in_twenty_five_ticks() {
        let mut pid = insp();
        pid.reset(150, 0);
        let mut last = 125;
        for _ in 0..25 {
            last = pid.compute_aperture(400, 0, 10_000);
        }
        assert_eq!(last, 0);
        assert_eq!(pid.compute_aperture(400, 0, 10_000), 0);
    }

    #[test]
    fn exits_fast_mode_close_to_target_without_a_jump() {
        let mut pid = insp();
        pid.reset(150, 0);
        for _ in 0..5 {
            pid.compute_aperture(200, 50, 10_000);
        }
        let before = pid.last_aperture();
        let after = pid.compute_aperture(200, 190, 10_000);
        assert!(!pid.is_fast_mode());
        assert!(before.abs_diff(after) <= pid.ramp_increment());
    }

    #[test]
    fn expiratory_fully_open_fast_mode() {
        let mut pid = PidController::expiratory(&Valve::pinch(), FastMode::FullyOpen, 10_000);
        pid.reset(-150, -150);
        assert_eq!(pid.compute_aperture(50, 200, 10_000), 0);
        assert!(pid.is_fast_mode());
    }

    #[test]
    fn expiratory_closes_when_pressure_drops_below_peep() {
        let mut pid = PidController::expiratory(&Valve::pinch(), FastMode::Ramp, 10_000);
        pid.reset(-150, -150);
        let mut aperture = 0;
        for _ in 0..30 {
            aperture = pid.compute_aperture(100, 40, 10_000);
        }
        assert_eq!(aperture, 125);
    }

    #[test]
    fn zero_dt_contributes_nothing_to_the_integral() {
        let mut pid = insp();
        pid.reset(0, 0);
        pid.compute_aperture(200, 195, 10_000);
        let integral = pid.integral();
        pid.compute_aperture(200, 195, 0);
        assert_eq!(pid.integral(), integral);
    }

    #[test]
    fn reset_keeping_aperture_resumes_ramp() {
        let mut pid = insp();
        pid.set_last_aperture(70);
        pid.reset_keeping_aperture(100, 0);
        assert_eq!(pid.compute_aperture(300, 0, 10_000), 65);
    }
}
