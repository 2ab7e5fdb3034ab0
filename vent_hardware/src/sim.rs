//! Simulated devices sharing one [`Lung`].
//!
//! Every handle keeps an `Rc` to the same lung, so the pressure sensor sees
//! what the valves and the blower did. Reading the pressure sensor advances
//! the lung to the clock's current time.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use vent_traits::{
    BatterySensor, BlowerActuator, Clock, FlowSensor, Indicators, Led, PressureSensor, Tone,
    ValveActuator,
};

use crate::error::HwError;
use crate::lung::{Lung, LungParams};

type SeamResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const VALVE_MAX_DEG: u16 = 125;
const BLOWER_MIN_SPEED: u16 = 300;
const BLOWER_MAX_SPEED: u16 = 1800;

/// Transfer of the simulated pressure sensor: `raw = (mmh2o + offset) * den / num`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorTransfer {
    pub gain_num: i32,
    pub gain_den: i32,
    pub offset_mmh2o: i32,
}

impl Default for SensorTransfer {
    fn default() -> Self {
        Self {
            gain_num: 2238,
            gain_den: 10_000,
            offset_mmh2o: 45,
        }
    }
}

/// Handle on the simulated patient and the factory for its devices.
#[derive(Clone)]
pub struct SimulatedLung {
    lung: Rc<RefCell<Lung>>,
}

impl SimulatedLung {
    pub fn new(params: LungParams, clock: impl Clock + 'static) -> Self {
        tracing::debug!(?params, "simulated lung");
        Self {
            lung: Rc::new(RefCell::new(Lung::new(params, clock))),
        }
    }

    pub fn pressure_sensor(&self) -> SimulatedPressureSensor {
        SimulatedPressureSensor {
            lung: Rc::clone(&self.lung),
            transfer: SensorTransfer::default(),
            zero_drift_mmh2o: 0.0,
            fail_after: None,
        }
    }

    pub fn flow_sensor(&self) -> SimulatedFlowSensor {
        SimulatedFlowSensor {
            lung: Rc::clone(&self.lung),
        }
    }

    pub fn inspiratory_valve(&self) -> SimulatedValve {
        SimulatedValve::new(Rc::clone(&self.lung), ValveSide::Inspiratory)
    }

    pub fn expiratory_valve(&self) -> SimulatedValve {
        SimulatedValve::new(Rc::clone(&self.lung), ValveSide::Expiratory)
    }

    pub fn blower(&self) -> SimulatedBlower {
        SimulatedBlower {
            lung: Rc::clone(&self.lung),
        }
    }

    /// Airway pressure as of the last sensor read (mmH2O).
    pub fn airway_pressure(&self) -> f64 {
        self.lung.borrow().airway_pressure()
    }

    pub fn volume_ml(&self) -> f64 {
        self.lung.borrow().volume_ml()
    }

    pub fn blower_speed(&self) -> u16 {
        self.lung.borrow().blower_speed()
    }

    /// Current (inspiratory, expiratory) valve apertures.
    pub fn apertures(&self) -> (u16, u16) {
        let lung = self.lung.borrow();
        (lung.inspiratory_aperture(), lung.expiratory_aperture())
    }

    pub fn elapsed(&self) -> Duration {
        self.lung.borrow().elapsed()
    }
}

pub struct SimulatedPressureSensor {
    lung: Rc<RefCell<Lung>>,
    transfer: SensorTransfer,
    zero_drift_mmh2o: f64,
    fail_after: Option<Duration>,
}

impl SimulatedPressureSensor {
    pub fn with_transfer(mut self, transfer: SensorTransfer) -> Self {
        self.transfer = transfer;
        self
    }

    /// Reading offset the sensor shows at ambient pressure.
    pub fn with_zero_drift(mut self, mmh2o: f64) -> Self {
        self.zero_drift_mmh2o = mmh2o;
        self
    }

    /// Stop answering once the lung has been simulated for `after`.
    pub fn fail_after(mut self, after: Duration) -> Self {
        self.fail_after = Some(after);
        self
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn to_raw(&self, mmh2o: f64) -> u32 {
        let t = self.transfer;
        let num = f64::from(t.gain_num.max(1));
        let raw = (mmh2o + self.zero_drift_mmh2o + f64::from(t.offset_mmh2o)) * f64::from(t.gain_den)
            / num;
        // Round up so the core's truncating transfer reads the pressure back.
        raw.ceil().clamp(0.0, f64::from(u32::MAX)) as u32
    }
}

impl PressureSensor for SimulatedPressureSensor {
    fn read_raw(&mut self, _timeout: Duration) -> SeamResult<u32> {
        let pressure = {
            let mut lung = self.lung.borrow_mut();
            lung.sync();
            if self.fail_after.is_some_and(|after| lung.elapsed() >= after) {
                return Err(Box::new(HwError::Timeout));
            }
            lung.airway_pressure()
        };
        Ok(self.to_raw(pressure))
    }
}

pub struct SimulatedFlowSensor {
    lung: Rc<RefCell<Lung>>,
}

#[allow(clippy::cast_possible_truncation)]
fn ml(value: f64) -> i32 {
    value.round().clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
}

impl FlowSensor for SimulatedFlowSensor {
    fn read_inspiratory_flow(&mut self) -> SeamResult<i32> {
        Ok(ml(self.lung.borrow().inspiratory_flow_ml_min()))
    }

    fn read_expiratory_flow(&mut self) -> SeamResult<i32> {
        Ok(ml(self.lung.borrow().expiratory_flow_ml_min()))
    }

    fn delivered_volume(&mut self) -> SeamResult<i32> {
        Ok(ml(self.lung.borrow().delivered_ml()))
    }

    fn reset_volume(&mut self) -> SeamResult<()> {
        self.lung.borrow_mut().reset_delivered();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValveSide {
    Inspiratory,
    Expiratory,
}

pub struct SimulatedValve {
    lung: Rc<RefCell<Lung>>,
    side: ValveSide,
    fail_after: Option<Duration>,
}

impl SimulatedValve {
    fn new(lung: Rc<RefCell<Lung>>, side: ValveSide) -> Self {
        Self {
            lung,
            side,
            fail_after: None,
        }
    }

    /// Refuse every command once the lung has been simulated for `after`.
    pub fn fail_after(mut self, after: Duration) -> Self {
        self.fail_after = Some(after);
        self
    }
}

impl ValveActuator for SimulatedValve {
    fn apply_aperture(&mut self, aperture: u16) -> SeamResult<()> {
        let mut lung = self.lung.borrow_mut();
        if self.fail_after.is_some_and(|after| lung.elapsed() >= after) {
            return Err(Box::new(HwError::Actuator(format!(
                "{:?} valve not responding",
                self.side
            ))));
        }
        if aperture > VALVE_MAX_DEG {
            return Err(Box::new(HwError::Actuator(format!(
                "aperture {aperture} beyond {VALVE_MAX_DEG} degrees"
            ))));
        }
        match self.side {
            ValveSide::Inspiratory => lung.set_inspiratory_aperture(aperture),
            ValveSide::Expiratory => lung.set_expiratory_aperture(aperture),
        }
        Ok(())
    }
}

pub struct SimulatedBlower {
    lung: Rc<RefCell<Lung>>,
}

impl BlowerActuator for SimulatedBlower {
    fn run_speed(&mut self, speed: u16) -> SeamResult<()> {
        if !(BLOWER_MIN_SPEED..=BLOWER_MAX_SPEED).contains(&speed) {
            return Err(Box::new(HwError::Actuator(format!(
                "blower speed {speed} out of range"
            ))));
        }
        self.lung.borrow_mut().set_blower_speed(speed);
        Ok(())
    }

    fn stop(&mut self) -> SeamResult<()> {
        self.lung.borrow_mut().set_blower_speed(0);
        Ok(())
    }
}

/// Battery with a settable divider reading and mains flag.
#[derive(Clone)]
pub struct SimulatedBattery {
    raw: Rc<Cell<u16>>,
    mains: Rc<Cell<bool>>,
}

impl SimulatedBattery {
    pub fn new(raw: u16, mains_connected: bool) -> Self {
        Self {
            raw: Rc::new(Cell::new(raw)),
            mains: Rc::new(Cell::new(mains_connected)),
        }
    }

    pub fn set_raw(&self, raw: u16) {
        self.raw.set(raw);
    }

    pub fn set_mains_connected(&self, connected: bool) {
        self.mains.set(connected);
    }
}

impl BatterySensor for SimulatedBattery {
    fn read_raw(&mut self) -> SeamResult<u16> {
        Ok(self.raw.get())
    }

    fn mains_connected(&mut self) -> SeamResult<bool> {
        Ok(self.mains.get())
    }
}

/// Front panel that logs changes instead of lighting anything.
#[derive(Clone)]
pub struct SimulatedIndicators {
    leds: Rc<Cell<[bool; 3]>>,
    tone: Rc<Cell<Tone>>,
}

impl Default for SimulatedIndicators {
    fn default() -> Self {
        Self {
            leds: Rc::new(Cell::new([false; 3])),
            tone: Rc::new(Cell::new(Tone::Silent)),
        }
    }
}

impl SimulatedIndicators {
    pub fn led(&self, led: Led) -> bool {
        self.leds.get()[led_index(led)]
    }

    pub fn tone(&self) -> Tone {
        self.tone.get()
    }
}

fn led_index(led: Led) -> usize {
    match led {
        Led::Red => 0,
        Led::Yellow => 1,
        Led::Green => 2,
    }
}

impl Indicators for SimulatedIndicators {
    fn set_led(&mut self, led: Led, on: bool) -> SeamResult<()> {
        let mut leds = self.leds.get();
        if leds[led_index(led)] != on {
            tracing::debug!(?led, on, "led (simulated)");
        }
        leds[led_index(led)] = on;
        self.leds.set(leds);
        Ok(())
    }

    fn buzzer(&mut self, tone: Tone) -> SeamResult<()> {
        if self.tone.get() != tone {
            tracing::debug!(?tone, "buzzer (simulated)");
        }
        self.tone.set(tone);
        Ok(())
    }
}
