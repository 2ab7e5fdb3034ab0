//! Blower speed model with an optional acceleration-limited ramp.

use crate::params::{DEFAULT_BLOWER_SPEED, MAX_BLOWER_SPEED, MIN_BLOWER_SPEED};

/// Static pressure ceiling of the blower at full speed (mmH2O).
pub const BLOWER_MAX_PRESSURE: i32 = 703;

#[derive(Debug, Clone)]
pub struct Blower {
    speed: u16,
    target_speed: u16,
    stopped: bool,
    ramp_carry_us: u32,
}

impl Default for Blower {
    fn default() -> Self {
        Self::new()
    }
}

impl Blower {
    pub const fn new() -> Self {
        Self {
            speed: 0,
            target_speed: 0,
            stopped: true,
            ramp_carry_us: 0,
        }
    }

    fn in_range(speed: u16) -> bool {
        (MIN_BLOWER_SPEED..=MAX_BLOWER_SPEED).contains(&speed)
    }

    /// Apply `speed` immediately. Values outside [300, 1800] are ignored.
    /// A direct command cancels any pending ramp. Returns `true` when the
    /// applied speed changed.
    pub fn run_speed(&mut self, speed: u16) -> bool {
        if !Self::in_range(speed) {
            tracing::trace!(speed, "blower speed out of range, ignored");
            return false;
        }
        self.target_speed = 0;
        self.apply(speed)
    }

    fn apply(&mut self, speed: u16) -> bool {
        if self.stopped || self.speed != speed {
            self.speed = speed;
            self.stopped = false;
            return true;
        }
        false
    }

    /// Apply a signed per-cycle increment on top of `base`, never going below
    /// the minimum speed. A stopped blower starts from the default speed.
    pub fn run_speed_with_increment(&mut self, base: u16, increment: i32) -> bool {
        let base = if base == 0 { DEFAULT_BLOWER_SPEED } else { base };
        let magnitude = u16::try_from(increment.unsigned_abs()).unwrap_or(u16::MAX);
        let next = if increment >= 0 {
            base.saturating_add(magnitude)
        } else if magnitude < base {
            base - magnitude
        } else {
            MIN_BLOWER_SPEED
        };
        self.run_speed(next)
    }

    /// Set a ramp target reached at one speed unit per millisecond through
    /// `execute`. Values outside [300, 1800] are ignored.
    pub fn run_speed_with_ramp_up(&mut self, target: u16) {
        if Self::in_range(target) && target != self.target_speed {
            self.target_speed = target;
            self.speed = self.speed.max(MIN_BLOWER_SPEED);
            self.ramp_carry_us = 0;
        }
    }

    /// Advance the ramp by `elapsed_us`. Ramps up gradually, steps down at
    /// once. No-op when no ramp target is pending. Returns `true` when the
    /// applied speed changed.
    pub fn execute(&mut self, elapsed_us: u32) -> bool {
        if self.target_speed == 0 {
            return false;
        }
        let next = if self.target_speed > self.speed {
            let total = self.ramp_carry_us.saturating_add(elapsed_us);
            let step = u16::try_from(total / 1000).unwrap_or(u16::MAX);
            self.ramp_carry_us = total % 1000;
            self.speed.saturating_add(step).min(self.target_speed)
        } else {
            self.target_speed
        };
        self.apply(next)
    }

    /// Zero speed and any ramp target.
    pub fn stop(&mut self) {
        self.speed = 0;
        self.target_speed = 0;
        self.stopped = true;
        self.ramp_carry_us = 0;
    }

    pub fn speed(&self) -> u16 {
        self.speed
    }

    pub fn target_speed(&self) -> u16 {
        self.target_speed
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Static pressure the blower delivers at `flow` mL/min, from the bench
    /// characterization curve. Clamped to [0, 703] mmH2O.
    pub fn blower_pressure(&self, flow: i32) -> i32 {
        let flow = i64::from(flow);
        let hundreds = flow / 100;
        let p = i64::from(BLOWER_MAX_PRESSURE) * i64::from(self.speed) / i64::from(MAX_BLOWER_SPEED)
            - 281 * flow / 100_000
            - 832 * hundreds * hundreds / 1_000_000;
        // Clamped to [0, 703] so the narrowing cannot fail.
        i32::try_from(p.clamp(0, i64::from(BLOWER_MAX_PRESSURE))).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn starts_stopped_and_rejects_out_of_range() {
        let mut b = Blower::new();
        assert!(b.is_stopped());
        assert!(!b.run_speed(0));
        assert!(!b.run_speed(1801));
        assert!(b.is_stopped());
        assert!(b.run_speed(300));
        assert!(!b.is_stopped());
        assert!(!b.run_speed(300));
    }

    #[rstest]
    #[case(900, 100, 1000)]
    #[case(900, -100, 800)]
    #[case(350, -400, MIN_BLOWER_SPEED)]
    #[case(0, 0, DEFAULT_BLOWER_SPEED)]
    #[case(1750, 100, 1750)]
    fn increment_rules(#[case] base: u16, #[case] inc: i32, #[case] expected: u16) {
        let mut b = Blower::new();
        b.run_speed(1750);
        b.run_speed_with_increment(base, inc);
        assert_eq!(b.speed(), expected);
    }

    #[test]
    fn ramp_up_is_one_unit_per_ms_with_carry() {
        let mut b = Blower::new();
        b.run_speed_with_ramp_up(1800);
        assert_eq!(b.speed(), MIN_BLOWER_SPEED);
        b.execute(10_000);
        assert_eq!(b.speed(), 310);
        b.execute(500);
        b.execute(500);
        assert_eq!(b.speed(), 311);
        b.execute(10_000_000);
        assert_eq!(b.speed(), 1800);
    }

    #[test]
    fn ramp_steps_down_immediately() {
        let mut b = Blower::new();
        b.run_speed(1500);
        b.run_speed_with_ramp_up(600);
        assert!(b.execute(10_000));
        assert_eq!(b.speed(), 600);
    }

    #[test]
    fn direct_command_cancels_ramp() {
        let mut b = Blower::new();
        b.run_speed_with_ramp_up(1800);
        b.run_speed(500);
        assert_eq!(b.target_speed(), 0);
        assert!(!b.execute(100_000));
        assert_eq!(b.speed(), 500);
    }

    #[test]
    fn stop_clears_everything() {
        let mut b = Blower::new();
        b.run_speed_with_ramp_up(1200);
        b.execute(50_000);
        b.stop();
        assert_eq!((b.speed(), b.target_speed(), b.is_stopped()), (0, 0, true));
    }

    #[rstest]
    #[case(1800, 0, 703)]
    #[case(900, 0, 351)]
    #[case(1800, 60_000, 703 - 168 - 299)]
    #[case(0, 100_000, 0)]
    fn pressure_curve(#[case] speed: u16, #[case] flow: i32, #[case] expected: i32) {
        let mut b = Blower::new();
        b.run_speed(speed);
        assert_eq!(b.blower_pressure(flow), expected);
    }
}
