//! Ventilator runtime: the breathing core wired to the hardware seams.
//!
//! One [`Ventilator::step`] is one control period: read the sensors, run the
//! cycle state machine, then push whatever changed to the actuators and the
//! indicators. Errors only come from the seams; a lost pressure sensor or a
//! failing actuator drives the safety position before being returned.

use std::time::Duration;

use eyre::WrapErr;
use vent_traits::{
    BatterySensor, BlowerActuator, FlowSensor, Indicators, Led, PressureSensor, ValveActuator,
};

use crate::alarm_controller::AlarmEffects;
use crate::builder::{Missing, VentilatorBuilder};
use crate::commands::SettingCommand;
use crate::config::HardwareCfg;
use crate::controller::BreathController;
use crate::error::{Result, SafetyReason, VentError};
use crate::hw_error::map_hw_error;
use crate::pressure::PressureLinearizer;
use crate::state_machine::{BatterySample, CycleStateMachine};
use crate::status::TickStatus;

/// An offset at or above this means a patient is plugged or the sensor drifted.
pub const MAX_PRESSURE_OFFSET_MMH2O: i16 = 40;
/// Samples spanning at least this much are not ambient air.
const MAX_OFFSET_SPREAD_MMH2O: i16 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlowerState {
    Stopped,
    Running(u16),
}

/// Last values successfully written to each output.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Applied {
    inspiratory: Option<u16>,
    expiratory: Option<u16>,
    blower: Option<BlowerState>,
    leds: Option<[bool; 3]>,
}

/// One reading of every sensor, taken outside the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorProbe {
    pub pressure_raw: u32,
    pub pressure_mmh2o: i16,
    /// (inspiratory mL/min, expiratory mL/min, delivered mL)
    pub flow: Option<(i32, i32, i32)>,
    /// (raw counts, mains connected)
    pub battery: Option<(u16, bool)>,
}

pub struct Ventilator {
    pub(crate) pressure_sensor: Box<dyn PressureSensor>,
    pub(crate) flow_sensor: Option<Box<dyn FlowSensor>>,
    pub(crate) battery: Option<Box<dyn BatterySensor>>,
    pub(crate) inspiratory_valve: Box<dyn ValveActuator>,
    pub(crate) expiratory_valve: Box<dyn ValveActuator>,
    pub(crate) blower: Box<dyn BlowerActuator>,
    pub(crate) indicators: Option<Box<dyn Indicators>>,
    pub(crate) controller: BreathController,
    pub(crate) machine: CycleStateMachine,
    pub(crate) linearizer: PressureLinearizer,
    pub(crate) hardware: HardwareCfg,
    pub(crate) applied: Applied,
    pub(crate) periods: u64,
    pub(crate) last_step_ms: Option<u64>,
    pub(crate) flow_faulted: bool,
}

impl std::fmt::Debug for Ventilator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ventilator")
            .field("state", &self.machine.state())
            .field("running", &self.machine.activation().is_running())
            .field("periods", &self.periods)
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

impl Ventilator {
    /// Start building a Ventilator.
    pub fn builder() -> VentilatorBuilder<Missing, Missing, Missing> {
        VentilatorBuilder::default()
    }

    /// One control period at `now_ms`.
    pub fn step(&mut self, now_ms: u64) -> Result<TickStatus> {
        let dt_us = self.last_step_ms.map_or(self.controller.period_us(), |prev| {
            u32::try_from(now_ms.saturating_sub(prev).saturating_mul(1000)).unwrap_or(u32::MAX)
        });
        self.last_step_ms = Some(now_ms);

        let timeout = Duration::from_millis(self.hardware.sensor_read_timeout_ms);
        let raw = match self.pressure_sensor.read_raw(timeout) {
            Ok(raw) => raw,
            Err(e) => {
                let cause = map_hw_error(&*e);
                tracing::error!(error = %cause, "pressure sensor lost, reaching safety position");
                self.enter_safety(now_ms);
                return Err(eyre::Report::new(cause)
                    .wrap_err(VentError::SafetyStop(SafetyReason::PressureSensorLost)));
            }
        };
        let pressure = self.linearizer.read(raw);
        self.controller.update_pressure(pressure);
        self.controller.update_dt(dt_us);
        self.read_flow();
        let battery = self.sample_battery();

        let outcome = self.machine.on_tick(&mut self.controller, now_ms, battery);
        self.periods += 1;

        if self.controller.take_volume_reset() {
            if let Some(flow) = self.flow_sensor.as_mut() {
                if let Err(e) = flow.reset_volume() {
                    tracing::warn!(error = %e, "flow volume reset failed");
                }
            }
        }

        if let Err(e) = self.push_actuators() {
            tracing::error!(error = %e, "actuator fault, reaching safety position");
            self.enter_safety(now_ms);
            return Err(e.wrap_err(VentError::SafetyStop(SafetyReason::ActuatorFault)));
        }
        self.push_indicators(&outcome.effects);

        match outcome.safety {
            Some(reason) => Err(eyre::Report::new(VentError::SafetyStop(reason))),
            None => Ok(outcome.status),
        }
    }

    /// Route an operator setting. Start and stop go to the state machine,
    /// everything else to the next command buffer.
    pub fn apply(&mut self, command: SettingCommand, now_ms: u64) {
        match command {
            SettingCommand::Start => {
                self.start();
            }
            SettingCommand::Stop => self.stop(),
            other => self.controller.apply_setting(other, now_ms),
        }
    }

    /// Request breathing. Returns false when refused.
    pub fn start(&mut self) -> bool {
        self.machine.start(&mut self.controller)
    }

    /// Request a stop at the next period.
    pub fn stop(&mut self) {
        self.machine.stop(&mut self.controller);
    }

    /// Stop breathing now and hold the safety position on the actuators.
    pub fn shutdown(&mut self, now_ms: u64) -> Result<()> {
        self.machine.stop(&mut self.controller);
        self.controller.stop(now_ms);
        self.push_actuators()
            .wrap_err("reaching safety position on shutdown")
    }

    /// Measure the pressure offset with the patient circuit open to air and
    /// subtract it from every later reading.
    pub fn calibrate_pressure_offset(&mut self, samples: u32) -> Result<i16> {
        let timeout = Duration::from_millis(self.hardware.sensor_read_timeout_ms);
        let samples = samples.max(1);
        let (mut min, mut max, mut sum) = (i16::MAX, i16::MIN, 0i64);
        for i in 0..samples {
            let raw = self
                .pressure_sensor
                .read_raw(timeout)
                .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
                .wrap_err("reading pressure sensor for offset")?;
            if i == 0 {
                self.linearizer.prime(raw);
            }
            let p = self.linearizer.convert(raw);
            min = min.min(p);
            max = max.max(p);
            sum += i64::from(p);
        }
        let spread = max.saturating_sub(min);
        if spread >= MAX_OFFSET_SPREAD_MMH2O {
            return Err(eyre::Report::new(VentError::Calibration(format!(
                "pressure offset unstable (max-min {spread} mmH2O), unplug the patient"
            ))));
        }
        let offset = crate::fixed_point::saturate_i16(crate::fixed_point::saturate_i32(
            sum / i64::from(samples),
        ));
        if offset >= MAX_PRESSURE_OFFSET_MMH2O {
            return Err(eyre::Report::new(VentError::Calibration(format!(
                "pressure offset {offset} mmH2O is above {MAX_PRESSURE_OFFSET_MMH2O}"
            ))));
        }
        self.linearizer.set_zero_offset(offset);
        tracing::info!(offset, samples, "pressure offset measured");
        Ok(offset)
    }

    /// Read every sensor once.
    pub fn probe(&mut self) -> Result<SensorProbe> {
        let timeout = Duration::from_millis(self.hardware.sensor_read_timeout_ms);
        let pressure_raw = self
            .pressure_sensor
            .read_raw(timeout)
            .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
            .wrap_err("reading pressure sensor")?;
        let mut linearizer = self.linearizer.clone();
        linearizer.prime(pressure_raw);
        let pressure_mmh2o = linearizer.read(pressure_raw);

        let flow = match self.flow_sensor.as_mut() {
            Some(flow) => {
                let read = (|| -> std::result::Result<_, Box<dyn std::error::Error + Send + Sync>> {
                    Ok((
                        flow.read_inspiratory_flow()?,
                        flow.read_expiratory_flow()?,
                        flow.delivered_volume()?,
                    ))
                })();
                Some(
                    read.map_err(|e| eyre::Report::new(map_hw_error(&*e)))
                        .wrap_err("reading flow sensor")?,
                )
            }
            None => None,
        };

        let battery = match self.battery.as_mut() {
            Some(b) => {
                let raw = b
                    .read_raw()
                    .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
                    .wrap_err("reading battery")?;
                let mains = b
                    .mains_connected()
                    .map_err(|e| eyre::Report::new(map_hw_error(&*e)))
                    .wrap_err("reading mains input")?;
                Some((raw, mains))
            }
            None => None,
        };

        Ok(SensorProbe {
            pressure_raw,
            pressure_mmh2o,
            flow,
            battery,
        })
    }

    fn enter_safety(&mut self, now_ms: u64) {
        self.machine.stop(&mut self.controller);
        self.controller.stop(now_ms);
        if let Err(e) = self.push_actuators() {
            tracing::warn!(error = %e, "safety position not fully applied");
        }
    }

    fn read_flow(&mut self) {
        if !self.hardware.has_flow_sensor {
            return;
        }
        let Some(flow) = self.flow_sensor.as_mut() else {
            return;
        };
        let inspiratory = flow.read_inspiratory_flow();
        let expiratory = flow.read_expiratory_flow();
        let volume = flow.delivered_volume();

        let mut fault = None;
        match inspiratory {
            Ok(v) => self.controller.update_inspiratory_flow(v),
            Err(e) => fault = Some(e),
        }
        match expiratory {
            Ok(v) => self.controller.update_expiratory_flow(v),
            Err(e) => fault = fault.or(Some(e)),
        }
        match volume {
            Ok(v) => self.controller.update_delivered_volume(v),
            Err(e) => fault = fault.or(Some(e)),
        }

        match fault {
            Some(e) => {
                if !self.flow_faulted {
                    tracing::warn!(error = %e, "flow sensor read failed, keeping last values");
                }
                self.flow_faulted = true;
            }
            None => self.flow_faulted = false,
        }
    }

    /// Read the battery once and fill the averaging window with it, so the
    /// power alarms and the start check see the real level from the first
    /// period on.
    pub fn prime_battery(&mut self) -> Option<u16> {
        let sample = self.read_battery()?;
        self.machine.prime_battery(&mut self.controller, sample);
        tracing::debug!(raw = sample.raw, mains = sample.mains_connected, "battery primed");
        Some(sample.raw)
    }

    fn sample_battery(&mut self) -> Option<BatterySample> {
        let every = u64::from(self.hardware.battery_sample_every_ticks.max(1));
        if self.periods % every != 0 {
            return None;
        }
        self.read_battery()
    }

    fn read_battery(&mut self) -> Option<BatterySample> {
        let battery = self.battery.as_mut()?;
        let raw = match battery.read_raw() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "battery read failed");
                return None;
            }
        };
        let mains_connected = match battery.mains_connected() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "mains input read failed");
                return None;
            }
        };
        Some(BatterySample {
            raw,
            mains_connected,
        })
    }

    /// Write changed valve positions and blower state. Every output is
    /// attempted; the first failure is returned.
    fn push_actuators(&mut self) -> Result<()> {
        let inspiratory = drive_valve(
            self.inspiratory_valve.as_mut(),
            &mut self.applied.inspiratory,
            self.controller.inspiratory_valve().position(),
        )
        .wrap_err("driving inspiratory valve");
        let expiratory = drive_valve(
            self.expiratory_valve.as_mut(),
            &mut self.applied.expiratory,
            self.controller.expiratory_valve().position(),
        )
        .wrap_err("driving expiratory valve");
        let wanted = if self.controller.blower().is_stopped() {
            BlowerState::Stopped
        } else {
            BlowerState::Running(self.controller.blower().speed())
        };
        let blower = drive_blower(self.blower.as_mut(), &mut self.applied.blower, wanted)
            .wrap_err("driving blower");
        inspiratory.and(expiratory).and(blower)
    }

    fn push_indicators(&mut self, effects: &AlarmEffects) {
        let Some(indicators) = self.indicators.as_mut() else {
            return;
        };
        if let Some(tone) = effects.buzzer {
            if let Err(e) = indicators.buzzer(tone) {
                tracing::warn!(error = %e, ?tone, "buzzer write failed");
            }
        }
        let leds = [effects.red, effects.yellow, effects.green];
        if self.applied.leds != Some(leds) {
            for (led, on) in [Led::Red, Led::Yellow, Led::Green].into_iter().zip(leds) {
                if let Err(e) = indicators.set_led(led, on) {
                    tracing::warn!(error = %e, ?led, "led write failed");
                }
            }
            self.applied.leds = Some(leds);
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn controller(&self) -> &BreathController {
        &self.controller
    }

    pub fn state_machine(&self) -> &CycleStateMachine {
        &self.machine
    }

    pub fn linearizer(&self) -> &PressureLinearizer {
        &self.linearizer
    }

    pub fn hardware(&self) -> &HardwareCfg {
        &self.hardware
    }

    pub fn period_us(&self) -> u32 {
        self.controller.period_us()
    }

    pub fn is_running(&self) -> bool {
        self.machine.activation().is_running()
    }

    /// Control periods run so far.
    pub fn periods(&self) -> u64 {
        self.periods
    }
}

fn drive_valve(
    valve: &mut dyn ValveActuator,
    applied: &mut Option<u16>,
    wanted: Option<u16>,
) -> Result<()> {
    let Some(aperture) = wanted else {
        return Ok(());
    };
    if *applied == Some(aperture) {
        return Ok(());
    }
    valve
        .apply_aperture(aperture)
        .map_err(|e| eyre::Report::new(map_hw_error(&*e)))?;
    *applied = Some(aperture);
    Ok(())
}

fn drive_blower(
    blower: &mut dyn BlowerActuator,
    applied: &mut Option<BlowerState>,
    wanted: BlowerState,
) -> Result<()> {
    if *applied == Some(wanted) {
        return Ok(());
    }
    match wanted {
        BlowerState::Stopped => blower.stop(),
        BlowerState::Running(speed) => blower.run_speed(speed),
    }
    .map_err(|e| eyre::Report::new(map_hw_error(&*e)))?;
    *applied = Some(wanted);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{
        BlowerCall, FixedBattery, FixedFlowSensor, FixedPressureSensor, RecordingSink, SpyBlower,
        SpyIndicators, SpyValve,
    };
    use crate::params::VALVE_OPEN_STATE;
    use crate::pressure::PressureCalibration;

    struct Rig {
        vent: Ventilator,
        sensor: FixedPressureSensor,
        insp: SpyValve,
        exp: SpyValve,
        blower: SpyBlower,
        flow: FixedFlowSensor,
        battery: FixedBattery,
        indicators: SpyIndicators,
        sink: RecordingSink,
    }

    fn rig() -> Rig {
        let raw = PressureLinearizer::new(PressureCalibration::default()).raw_for(0);
        let sensor = FixedPressureSensor::new(raw);
        let (insp, exp, blower) = (SpyValve::default(), SpyValve::default(), SpyBlower::default());
        let flow = FixedFlowSensor::default();
        let battery = FixedBattery::new(931, true);
        let indicators = SpyIndicators::default();
        let sink = RecordingSink::default();
        let vent = Ventilator::builder()
            .with_pressure_sensor(sensor.clone())
            .with_valves(insp.clone(), exp.clone())
            .with_blower(blower.clone())
            .with_flow_sensor(flow.clone())
            .with_battery(battery.clone())
            .with_indicators(indicators.clone())
            .with_event_sink(sink.clone())
            .build()
            .expect("build");
        Rig {
            vent,
            sensor,
            insp,
            exp,
            blower,
            flow,
            battery,
            indicators,
            sink,
        }
    }

    #[test]
    fn first_step_holds_safety_position() {
        let mut r = rig();
        assert_eq!(r.vent.step(0).expect("step"), TickStatus::Stopped);
        assert_eq!(r.insp.last(), Some(VALVE_OPEN_STATE));
        assert_eq!(r.exp.last(), Some(VALVE_OPEN_STATE));
        assert_eq!(r.blower.last(), Some(BlowerCall::Stop));
    }

    #[test]
    fn unchanged_outputs_are_not_rewritten() {
        let mut r = rig();
        for now in 0..20 {
            r.vent.step(now * 10).expect("step");
        }
        assert_eq!(r.insp.applied().len(), 1);
        assert_eq!(r.blower.calls().len(), 1);
    }

    #[test]
    fn start_runs_blower_and_resets_flow_volume_each_cycle() {
        let mut r = rig();
        r.vent.step(0).expect("step");
        assert!(r.vent.start());
        for period in 1..=301 {
            r.vent.step(period * 10).expect("step");
        }
        assert!(matches!(r.blower.last(), Some(BlowerCall::Run(_))));
        assert_eq!(r.flow.resets(), 2);
        assert_eq!(r.sink.machine_states().len(), 1);
    }

    #[test]
    fn pressure_sensor_loss_is_a_safety_stop() {
        let mut r = rig();
        r.vent.step(0).expect("step");
        r.vent.start();
        for period in 1..50 {
            r.vent.step(period * 10).expect("step");
        }
        r.sensor.fail();
        let err = r.vent.step(500).expect_err("sensor lost");
        assert!(matches!(
            err.downcast_ref::<VentError>(),
            Some(VentError::SafetyStop(SafetyReason::PressureSensorLost))
        ));
        assert!(!r.vent.is_running());
        assert_eq!(r.insp.last(), Some(VALVE_OPEN_STATE));
        assert_eq!(r.exp.last(), Some(VALVE_OPEN_STATE));
        assert_eq!(r.blower.last(), Some(BlowerCall::Stop));
    }

    #[test]
    fn valve_fault_is_an_actuator_safety_stop() {
        let mut r = rig();
        r.vent.step(0).expect("step");
        r.vent.start();
        r.insp.fail();
        let mut result = Ok(TickStatus::Stopped);
        for period in 1..400 {
            result = r.vent.step(period * 10);
            if result.is_err() {
                break;
            }
        }
        let err = result.expect_err("valve fault");
        assert!(matches!(
            err.downcast_ref::<VentError>(),
            Some(VentError::SafetyStop(SafetyReason::ActuatorFault))
        ));
        assert_eq!(r.blower.last(), Some(BlowerCall::Stop));
    }

    #[test]
    fn deep_discharge_reports_battery_safety_stop() {
        let mut r = rig();
        r.vent.step(0).expect("step");
        r.vent.start();
        r.battery.set(600, false);
        let mut reason = None;
        for period in 1..40 {
            if let Err(e) = r.vent.step(period * 10) {
                reason = e.downcast_ref::<VentError>().cloned();
                break;
            }
        }
        assert!(matches!(
            reason,
            Some(VentError::SafetyStop(SafetyReason::BatteryDeepDischarge))
        ));
        assert_eq!(r.blower.last(), Some(BlowerCall::Stop));
    }

    #[test]
    fn mains_loss_lights_yellow_and_beeps_low() {
        let mut r = rig();
        r.vent.step(0).expect("step");
        r.battery.set(900, false);
        for period in 1..30 {
            r.vent.step(period * 10).expect("step");
        }
        assert!(r.indicators.led(Led::Yellow));
        assert!(r.indicators.tones().contains(&vent_traits::Tone::Low));
    }

    #[test]
    fn settings_are_routed_to_next_commands() {
        let mut r = rig();
        r.vent.apply(SettingCommand::SetPeep(80), 0);
        r.vent.apply(SettingCommand::Start, 0);
        assert_eq!(r.vent.controller().next_commands().peep, 80);
        assert!(r.vent.is_running());
        r.vent.apply(SettingCommand::Stop, 0);
        assert!(!r.vent.is_running());
    }

    #[test]
    fn pressure_offset_is_measured_and_removed() {
        let mut r = rig();
        let lin = PressureLinearizer::new(PressureCalibration::default());
        r.sensor.set_raw(lin.raw_for(12));
        assert_eq!(r.vent.calibrate_pressure_offset(20).expect("offset"), 12);
        assert_eq!(r.vent.linearizer().zero_offset(), 12);
    }

    #[test]
    fn large_pressure_offset_is_rejected() {
        let mut r = rig();
        let lin = PressureLinearizer::new(PressureCalibration::default());
        r.sensor.set_raw(lin.raw_for(60));
        let err = r.vent.calibrate_pressure_offset(20).expect_err("too large");
        assert!(matches!(
            err.downcast_ref::<VentError>(),
            Some(VentError::Calibration(_))
        ));
    }

    #[test]
    fn probe_reads_every_sensor() {
        let mut r = rig();
        r.flow.set(1000, 2000, 300);
        let probe = r.vent.probe().expect("probe");
        assert_eq!(probe.pressure_mmh2o, 0);
        assert_eq!(probe.flow, Some((1000, 2000, 300)));
        assert_eq!(probe.battery, Some((931, true)));
    }
}
