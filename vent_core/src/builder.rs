//! Type-state builder for `Ventilator`.
//!
//! The builder enforces at compile time that a pressure sensor, both valves
//! and the blower are provided before `build()` is available. `try_build()` is
//! always available for dynamic checks.

use std::marker::PhantomData;

use vent_traits::{
    BatterySensor, BlowerActuator, FlowSensor, Indicators, PressureSensor, ValveActuator,
};

use crate::commands::Commands;
use crate::config::{AlarmCfg, ControllerCfg, HardwareCfg};
use crate::controller::BreathController;
use crate::error::{BuildError, Result};
use crate::events::{EventSink, NullSink};
use crate::pressure::{PressureCalibration, PressureLinearizer};
use crate::state_machine::CycleStateMachine;
use crate::util::MICROS_PER_SEC;
use crate::ventilator::{Applied, Ventilator};

// ── Type-state markers ───────────────────────────────────────────────────────

pub struct Missing;
pub struct Set;

type Valves = (Box<dyn ValveActuator>, Box<dyn ValveActuator>);

/// Builder for `Ventilator`. All fields are validated on `build()`.
pub struct VentilatorBuilder<P, V, B> {
    pressure_sensor: Option<Box<dyn PressureSensor>>,
    valves: Option<Valves>,
    blower: Option<Box<dyn BlowerActuator>>,
    flow_sensor: Option<Box<dyn FlowSensor>>,
    battery: Option<Box<dyn BatterySensor>>,
    indicators: Option<Box<dyn Indicators>>,
    sink: Option<Box<dyn EventSink + Send>>,
    commands: Option<Commands>,
    controller: Option<ControllerCfg>,
    alarms: Option<AlarmCfg>,
    hardware: Option<HardwareCfg>,
    calibration: Option<PressureCalibration>,
    pressure_offset: Option<i16>,
    _p: PhantomData<P>,
    _v: PhantomData<V>,
    _b: PhantomData<B>,
}

impl Default for VentilatorBuilder<Missing, Missing, Missing> {
    fn default() -> Self {
        Self {
            pressure_sensor: None,
            valves: None,
            blower: None,
            flow_sensor: None,
            battery: None,
            indicators: None,
            sink: None,
            commands: None,
            controller: None,
            alarms: None,
            hardware: None,
            calibration: None,
            pressure_offset: None,
            _p: PhantomData,
            _v: PhantomData,
            _b: PhantomData,
        }
    }
}

/// Everything `validate_and_build` needs, with the required parts present.
struct Parts {
    pressure_sensor: Box<dyn PressureSensor>,
    valves: Valves,
    blower: Box<dyn BlowerActuator>,
    flow_sensor: Option<Box<dyn FlowSensor>>,
    battery: Option<Box<dyn BatterySensor>>,
    indicators: Option<Box<dyn Indicators>>,
    sink: Box<dyn EventSink + Send>,
    commands: Commands,
    controller: ControllerCfg,
    alarms: AlarmCfg,
    hardware: HardwareCfg,
    calibration: PressureCalibration,
    pressure_offset: i16,
}

/// Validate configuration and construct the runtime.
fn validate_and_build(parts: Parts) -> Result<Ventilator> {
    // ── Validation ───────────────────────────────────────────────────────────
    let period_us = parts.controller.period_us;
    if period_us < 1000 {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "period_us must be >= 1000",
        )));
    }
    if MICROS_PER_SEC % period_us != 0 {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "period_us must divide one second",
        )));
    }
    if parts.alarms.max_pressure_mmh2o <= 0 {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "max pressure must be > 0",
        )));
    }
    if parts.alarms.min_mean_pressure_mmh2o >= parts.alarms.max_pressure_mmh2o {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "min mean pressure must be below max pressure",
        )));
    }
    if !(0..=100).contains(&parts.alarms.plateau_tolerance_percent) {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "plateau tolerance must be within 0..=100 percent",
        )));
    }
    if parts.hardware.sensor_read_timeout_ms == 0 {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "sensor_read_timeout_ms must be >= 1",
        )));
    }
    if parts.hardware.battery_sample_every_ticks == 0 {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "battery_sample_every_ticks must be >= 1",
        )));
    }
    if parts.calibration.gain_den <= 0 || parts.calibration.gain_num == 0 {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "pressure calibration gain must be non-zero with a positive denominator",
        )));
    }

    let mut linearizer = PressureLinearizer::new(parts.calibration);
    linearizer.set_zero_offset(parts.pressure_offset);
    let controller = BreathController::new(
        &parts.controller,
        &parts.alarms,
        parts.commands.clamped(),
        parts.sink,
    );
    let (inspiratory_valve, expiratory_valve) = parts.valves;

    Ok(Ventilator {
        pressure_sensor: parts.pressure_sensor,
        flow_sensor: parts.flow_sensor,
        battery: parts.battery,
        inspiratory_valve,
        expiratory_valve,
        blower: parts.blower,
        indicators: parts.indicators,
        controller,
        machine: CycleStateMachine::new(),
        linearizer,
        hardware: parts.hardware,
        applied: Applied::default(),
        periods: 0,
        last_step_ms: None,
        flow_faulted: false,
    })
}

impl<P, V, B> VentilatorBuilder<P, V, B> {
    /// Fallible build available in any type-state; returns detailed error for missing pieces.
    pub fn try_build(self) -> Result<Ventilator> {
        let pressure_sensor = self
            .pressure_sensor
            .ok_or_else(|| eyre::Report::new(BuildError::MissingPressureSensor))?;
        let valves = self
            .valves
            .ok_or_else(|| eyre::Report::new(BuildError::MissingValves))?;
        let blower = self
            .blower
            .ok_or_else(|| eyre::Report::new(BuildError::MissingBlower))?;

        validate_and_build(Parts {
            pressure_sensor,
            valves,
            blower,
            flow_sensor: self.flow_sensor,
            battery: self.battery,
            indicators: self.indicators,
            sink: self.sink.unwrap_or_else(|| Box::new(NullSink)),
            commands: self.commands.unwrap_or_default(),
            controller: self.controller.unwrap_or_default(),
            alarms: self.alarms.unwrap_or_default(),
            hardware: self.hardware.unwrap_or_default(),
            calibration: self.calibration.unwrap_or_default(),
            pressure_offset: self.pressure_offset.unwrap_or(0),
        })
    }

    /// Change the type-state markers, keeping every field.
    fn retag<P2, V2, B2>(self) -> VentilatorBuilder<P2, V2, B2> {
        VentilatorBuilder {
            pressure_sensor: self.pressure_sensor,
            valves: self.valves,
            blower: self.blower,
            flow_sensor: self.flow_sensor,
            battery: self.battery,
            indicators: self.indicators,
            sink: self.sink,
            commands: self.commands,
            controller: self.controller,
            alarms: self.alarms,
            hardware: self.hardware,
            calibration: self.calibration,
            pressure_offset: self.pressure_offset,
            _p: PhantomData,
            _v: PhantomData,
            _b: PhantomData,
        }
    }
}

/// Chainable setters that do not affect type-state.
impl<P, V, B> VentilatorBuilder<P, V, B> {
    pub fn with_flow_sensor(mut self, flow: impl FlowSensor + 'static) -> Self {
        self.flow_sensor = Some(Box::new(flow));
        self
    }
    pub fn with_battery(mut self, battery: impl BatterySensor + 'static) -> Self {
        self.battery = Some(Box::new(battery));
        self
    }
    pub fn with_indicators(mut self, indicators: impl Indicators + 'static) -> Self {
        self.indicators = Some(Box::new(indicators));
        self
    }
    pub fn with_event_sink(mut self, sink: impl EventSink + Send + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }
    /// Initial commands; clamped to the setter ranges on build.
    pub fn with_commands(mut self, commands: Commands) -> Self {
        self.commands = Some(commands);
        self
    }
    pub fn with_controller(mut self, controller: ControllerCfg) -> Self {
        self.controller = Some(controller);
        self
    }
    pub fn with_alarms(mut self, alarms: AlarmCfg) -> Self {
        self.alarms = Some(alarms);
        self
    }
    pub fn with_hardware(mut self, hardware: HardwareCfg) -> Self {
        self.hardware = Some(hardware);
        self
    }
    pub fn with_calibration(mut self, calibration: PressureCalibration) -> Self {
        self.calibration = Some(calibration);
        self
    }
    /// Zero offset measured earlier, in mmH2O.
    pub fn with_pressure_offset(mut self, offset: i16) -> Self {
        self.pressure_offset = Some(offset);
        self
    }
    /// Take commands, timing, alarm thresholds, hardware options and the
    /// persisted calibration (if any) from a loaded configuration.
    pub fn with_config(mut self, cfg: &vent_config::Config) -> Self {
        self.commands = Some(Commands::from(cfg));
        self.controller = Some(ControllerCfg::from(&cfg.controller));
        self.alarms = Some(AlarmCfg::from(&cfg.alarms));
        self.hardware = Some(HardwareCfg::from(&cfg.hardware));
        if let Some(c) = &cfg.calibration {
            self.calibration = Some(PressureCalibration::from(c));
        }
        self
    }
}

// Setters that advance type-state
impl<V, B> VentilatorBuilder<Missing, V, B> {
    pub fn with_pressure_sensor(
        mut self,
        sensor: impl PressureSensor + 'static,
    ) -> VentilatorBuilder<Set, V, B> {
        self.pressure_sensor = Some(Box::new(sensor));
        self.retag()
    }
}

impl<P, B> VentilatorBuilder<P, Missing, B> {
    pub fn with_valves(
        mut self,
        inspiratory: impl ValveActuator + 'static,
        expiratory: impl ValveActuator + 'static,
    ) -> VentilatorBuilder<P, Set, B> {
        self.valves = Some((Box::new(inspiratory), Box::new(expiratory)));
        self.retag()
    }
}

impl<P, V> VentilatorBuilder<P, V, Missing> {
    pub fn with_blower(
        mut self,
        blower: impl BlowerActuator + 'static,
    ) -> VentilatorBuilder<P, V, Set> {
        self.blower = Some(Box::new(blower));
        self.retag()
    }
}

impl VentilatorBuilder<Set, Set, Set> {
    /// Validate and build the Ventilator. Only available when the pressure
    /// sensor, both valves and the blower are set.
    pub fn build(self) -> Result<Ventilator> {
        self.try_build()
    }
}
