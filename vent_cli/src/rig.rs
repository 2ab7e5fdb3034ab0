//! Assembles the simulated machine described by the `[simulation]` section.

use std::time::Duration;

use vent_config::{Config, PressureCalibration};
use vent_core::Ventilator;
use vent_hardware::{
    LungParams, SensorTransfer, SimulatedBattery, SimulatedIndicators, SimulatedLung,
};
use vent_traits::Clock;

use crate::telemetry::TelemetrySink;

pub fn lung_params(sim: &vent_config::Simulation) -> LungParams {
    LungParams {
        compliance_ml_per_cmh2o: f64::from(sim.compliance_ml_per_cmh2o),
        resistance_cmh2o_per_lps: f64::from(sim.resistance_cmh2o_per_lps),
        leak_ml_min_per_cmh2o: f64::from(sim.leak_ml_min_per_cmh2o),
        effort_every_s: f64::from(sim.effort_every_s),
        effort_depth_cmh2o: f64::from(sim.effort_depth_cmh2o),
    }
}

/// The simulated sensor obeys whichever calibration the core will use, so
/// readings come back in true mmH2O.
fn sensor_transfer(calibration: Option<&PressureCalibration>) -> SensorTransfer {
    calibration.map_or_else(SensorTransfer::default, |c| SensorTransfer {
        gain_num: c.gain_num,
        gain_den: c.gain_den,
        offset_mmh2o: c.offset_mmh2o,
    })
}

/// Build the ventilator on a fresh simulated patient driven by `clock`.
///
/// A persisted `[calibration]` wins over `csv_calibration`.
pub fn build(
    cfg: &Config,
    csv_calibration: Option<PressureCalibration>,
    clock: impl Clock + 'static,
    sink: Option<TelemetrySink>,
) -> eyre::Result<(Ventilator, SimulatedLung)> {
    let sim = &cfg.simulation;
    let calibration = cfg.calibration.or(csv_calibration);
    let lung = SimulatedLung::new(lung_params(sim), clock);

    let mut pressure = lung
        .pressure_sensor()
        .with_transfer(sensor_transfer(calibration.as_ref()));
    let mut inspiratory = lung.inspiratory_valve();
    let mut expiratory = lung.expiratory_valve();
    if let Some(ms) = sim.pressure_fault_after_ms {
        tracing::warn!(after_ms = ms, "pressure sensor fault injected");
        pressure = pressure.fail_after(Duration::from_millis(ms));
    }
    if let Some(ms) = sim.valve_fault_after_ms {
        tracing::warn!(after_ms = ms, "valve fault injected");
        inspiratory = inspiratory.fail_after(Duration::from_millis(ms));
        expiratory = expiratory.fail_after(Duration::from_millis(ms));
    }

    let mut builder = Ventilator::builder()
        .with_pressure_sensor(pressure)
        .with_valves(inspiratory, expiratory)
        .with_blower(lung.blower())
        .with_battery(SimulatedBattery::new(sim.battery_raw, sim.mains_connected))
        .with_indicators(SimulatedIndicators::default())
        .with_config(cfg);
    if cfg.hardware.has_flow_sensor {
        builder = builder.with_flow_sensor(lung.flow_sensor());
    }
    if let Some(c) = calibration.filter(|_| cfg.calibration.is_none()) {
        builder = builder.with_calibration((&c).into());
    }
    if let Some(sink) = sink {
        builder = builder.with_event_sink(sink);
    }
    let vent = builder.build()?;
    Ok((vent, lung))
}
