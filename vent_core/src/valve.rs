//! Pinch valve model: stage an aperture command, commit it at the end of a tick.
//!
//! Apertures are in valve degrees. For the pinch valves fitted to the machine
//! 0 is fully open and 125 fully closed, so "open" and "close" are named
//! angles and not necessarily the min/max bounds.

use crate::fixed_point::{clamp_to_u16, map_range, saturate_u16};
use crate::params::{VALVE_CLOSED_STATE, VALVE_OPEN_STATE, VALVE_PWM_CLOSED_US, VALVE_PWM_OPEN_US};

/// Full orifice section of the inspiratory valve, in hundredths of mm².
pub const VALVE_FULL_SECTION: i32 = 3318;

#[derive(Debug, Clone)]
pub struct Valve {
    open_angle: u16,
    close_angle: u16,
    min: u16,
    max: u16,
    command: i32,
    position: Option<u16>,
}

impl Valve {
    pub fn new(open_angle: u16, close_angle: u16) -> Self {
        Self {
            open_angle,
            close_angle,
            min: open_angle.min(close_angle),
            max: open_angle.max(close_angle),
            command: i32::from(close_angle),
            position: None,
        }
    }

    /// Valve with the standard pinch geometry (open 0, closed 125).
    pub fn pinch() -> Self {
        Self::new(VALVE_OPEN_STATE, VALVE_CLOSED_STATE)
    }

    pub fn open(&mut self) {
        self.command = i32::from(self.open_angle);
    }

    pub fn close(&mut self) {
        self.command = i32::from(self.close_angle);
    }

    /// Stage a raw aperture. Out-of-range values are clamped on `execute`.
    pub fn open_to(&mut self, command: i32) {
        self.command = command;
    }

    /// Stage an aperture through the valve's linearization polynomial.
    ///
    /// The pinch response is strongly non-linear; the polynomial maps a
    /// linear 0..=125 command onto about 37..=101 degrees.
    pub fn open_linear(&mut self, command: i32) -> u16 {
        let value = (i64::from(command) * 70 / 125 + 30) * 10;
        let cubic = ((44 * value * value) / 1000) * value / 10_000;
        let raw = (76 * value / 10 - 985 * value * value / 100_000 + cubic - 1140) / 10;
        let staged = clamp_to_u16(raw, self.min, self.max);
        self.command = i32::from(staged);
        staged
    }

    /// Stage the aperture giving an orifice `section` (hundredths of mm²).
    /// Zero closes the valve, the full section opens it completely.
    pub fn open_section(&mut self, section: i32) {
        let section = i64::from(section.clamp(0, VALVE_FULL_SECTION));
        let aperture = map_range(
            section,
            0,
            i64::from(VALVE_FULL_SECTION),
            i64::from(self.close_angle),
            i64::from(self.open_angle),
        );
        self.command = i32::from(saturate_u16(aperture));
    }

    /// Clamp the staged command and commit it. Returns `true` when the applied
    /// position changed and must be pushed to the actuator.
    pub fn execute(&mut self) -> bool {
        let clamped = clamp_to_u16(i64::from(self.command), self.min, self.max);
        self.command = i32::from(clamped);
        if self.position == Some(clamped) {
            return false;
        }
        self.position = Some(clamped);
        true
    }

    pub fn min_aperture(&self) -> u16 {
        self.min
    }

    pub fn max_aperture(&self) -> u16 {
        self.max
    }

    pub fn command(&self) -> i32 {
        self.command
    }

    /// Last committed aperture, `None` before the first `execute`.
    pub fn position(&self) -> Option<u16> {
        self.position
    }
}

/// PWM pulse width in µs for a valve angle.
pub fn angle_to_micros(angle: u16) -> u16 {
    saturate_u16(map_range(
        i64::from(angle),
        i64::from(VALVE_OPEN_STATE),
        i64::from(VALVE_CLOSED_STATE),
        i64::from(VALVE_PWM_OPEN_US),
        i64::from(VALVE_PWM_CLOSED_US),
    ))
}
