//! Single-compartment lung behind a blower, two pinch valves and a leak.
//!
//! The model integrates in 1 ms sub-steps up to the time of the clock it was
//! built with, so it follows a `ManualClock` driven by the runner as well as
//! the wall clock. Pressures are mmH2O, flows mL/s internally.

use std::time::{Duration, Instant};

use vent_traits::Clock;

const MMH2O_PER_CMH2O: f64 = 10.197;
const SUBSTEP_US: u64 = 1_000;

/// Valve angle at which the pinched tube starts to open.
const PINCH_CLOSED_DEG: f64 = 101.0;
/// Valve angle past which the tube is fully round.
const PINCH_OPEN_DEG: f64 = 37.0;
/// Conductance of a fully open valve branch (mL/s per mmH2O).
const VALVE_FULL_CONDUCTANCE: f64 = 3.0;

const BLOWER_MAX_PRESSURE: f64 = 703.0;
const BLOWER_MAX_SPEED: f64 = 1800.0;

/// Length of one spontaneous inspiratory effort.
const EFFORT_DURATION_S: f64 = 0.3;

/// Physical parameters of the simulated patient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LungParams {
    pub compliance_ml_per_cmh2o: f64,
    pub resistance_cmh2o_per_lps: f64,
    /// Leak flow per cmH2O of lung pressure (mL/min).
    pub leak_ml_min_per_cmh2o: f64,
    /// A spontaneous effort every this many seconds; 0 disables efforts.
    pub effort_every_s: f64,
    pub effort_depth_cmh2o: f64,
}

impl Default for LungParams {
    /// Stiff, resistive test lung.
    fn default() -> Self {
        Self {
            compliance_ml_per_cmh2o: 20.0,
            resistance_cmh2o_per_lps: 20.0,
            leak_ml_min_per_cmh2o: 0.0,
            effort_every_s: 0.0,
            effort_depth_cmh2o: 4.0,
        }
    }
}

/// Static blower pressure at `speed` and `flow_ml_min`, from the bench curve.
pub fn blower_pressure(speed: u16, flow_ml_min: f64) -> f64 {
    let hundreds = flow_ml_min / 100.0;
    let p = BLOWER_MAX_PRESSURE * f64::from(speed) / BLOWER_MAX_SPEED
        - 281.0 * flow_ml_min / 100_000.0
        - 832.0 * hundreds * hundreds / 1_000_000.0;
    p.clamp(0.0, BLOWER_MAX_PRESSURE)
}

/// Conductance of a pinch valve branch at `aperture` degrees.
pub fn valve_conductance(aperture: u16) -> f64 {
    let open = (PINCH_CLOSED_DEG - f64::from(aperture)) / (PINCH_CLOSED_DEG - PINCH_OPEN_DEG);
    VALVE_FULL_CONDUCTANCE * open.clamp(0.0, 1.0)
}

/// Integrated state of the lung and of the actuators acting on it.
pub struct Lung {
    params: LungParams,
    clock: Box<dyn Clock>,
    epoch: Instant,
    compliance: f64,
    resistance: f64,
    elapsed_us: u64,
    volume_ml: f64,
    inspiratory_flow: f64,
    expiratory_flow: f64,
    airway_pressure: f64,
    delivered_ml: f64,
    inspiratory_aperture: u16,
    expiratory_aperture: u16,
    blower_speed: u16,
}

impl Lung {
    pub fn new(params: LungParams, clock: impl Clock + 'static) -> Self {
        let epoch = clock.now();
        Self {
            params,
            clock: Box::new(clock),
            epoch,
            compliance: params.compliance_ml_per_cmh2o.max(0.1) / MMH2O_PER_CMH2O,
            resistance: params.resistance_cmh2o_per_lps.max(0.0) * MMH2O_PER_CMH2O / 1000.0,
            elapsed_us: 0,
            volume_ml: 0.0,
            inspiratory_flow: 0.0,
            expiratory_flow: 0.0,
            airway_pressure: 0.0,
            delivered_ml: 0.0,
            // Unpowered pinch valves rest open.
            inspiratory_aperture: 0,
            expiratory_aperture: 0,
            blower_speed: 0,
        }
    }

    pub fn params(&self) -> LungParams {
        self.params
    }

    /// Time covered by the integration so far.
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.elapsed_us)
    }

    /// Integrate up to the clock's current time.
    pub fn sync(&mut self) {
        let now_us = self.clock.us_since(self.epoch);
        while self.elapsed_us < now_us {
            let step_us = (now_us - self.elapsed_us).min(SUBSTEP_US);
            self.integrate(step_us);
            self.elapsed_us += step_us;
        }
    }

    /// Muscle pressure of a spontaneous effort at `t_s` (mmH2O).
    fn effort_pressure(&self, t_s: f64) -> f64 {
        let every = self.params.effort_every_s;
        if every <= 0.0 || t_s < every {
            return 0.0;
        }
        let phase = t_s % every;
        if phase >= EFFORT_DURATION_S {
            return 0.0;
        }
        let depth = self.params.effort_depth_cmh2o * MMH2O_PER_CMH2O;
        depth * (std::f64::consts::PI * phase / EFFORT_DURATION_S).sin()
    }

    #[allow(clippy::cast_precision_loss)]
    fn integrate(&mut self, step_us: u64) {
        let dt = step_us as f64 / 1_000_000.0;
        let t_s = self.elapsed_us as f64 / 1_000_000.0;
        let lung_pressure = self.volume_ml / self.compliance - self.effort_pressure(t_s);

        let blower = if self.blower_speed == 0 {
            0.0
        } else {
            blower_pressure(self.blower_speed, self.inspiratory_flow * 60.0)
        };
        let gi = valve_conductance(self.inspiratory_aperture);
        let ge = valve_conductance(self.expiratory_aperture);

        let inflow = if gi > 0.0 && blower > lung_pressure {
            (blower - lung_pressure) / (1.0 / gi + self.resistance)
        } else {
            0.0
        };
        let outflow = if ge > 0.0 && lung_pressure > 0.0 {
            lung_pressure / (1.0 / ge + self.resistance)
        } else {
            0.0
        };
        let leak = if lung_pressure > 0.0 {
            self.params.leak_ml_min_per_cmh2o * lung_pressure / MMH2O_PER_CMH2O / 60.0
        } else {
            0.0
        };

        self.inspiratory_flow = inflow;
        self.expiratory_flow = outflow;
        self.volume_ml = (self.volume_ml + (inflow - outflow - leak) * dt).max(0.0);
        self.delivered_ml += inflow * dt;
        self.airway_pressure = lung_pressure + self.resistance * (inflow - outflow);
    }

    /// Pressure at the patient connector (mmH2O).
    pub fn airway_pressure(&self) -> f64 {
        self.airway_pressure
    }

    /// Volume above the relaxed lung (mL).
    pub fn volume_ml(&self) -> f64 {
        self.volume_ml
    }

    pub fn inspiratory_flow_ml_min(&self) -> f64 {
        self.inspiratory_flow * 60.0
    }

    pub fn expiratory_flow_ml_min(&self) -> f64 {
        self.expiratory_flow * 60.0
    }

    /// Volume that entered through the inspiratory branch since the last reset (mL).
    pub fn delivered_ml(&self) -> f64 {
        self.delivered_ml
    }

    pub fn reset_delivered(&mut self) {
        self.delivered_ml = 0.0;
    }

    pub fn set_inspiratory_aperture(&mut self, aperture: u16) {
        self.inspiratory_aperture = aperture;
    }

    pub fn set_expiratory_aperture(&mut self, aperture: u16) {
        self.expiratory_aperture = aperture;
    }

    pub fn set_blower_speed(&mut self, speed: u16) {
        self.blower_speed = speed;
    }

    pub fn inspiratory_aperture(&self) -> u16 {
        self.inspiratory_aperture
    }

    pub fn expiratory_aperture(&self) -> u16 {
        self.expiratory_aperture
    }

    pub fn blower_speed(&self) -> u16 {
        self.blower_speed
    }
}
