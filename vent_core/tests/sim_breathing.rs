//! Closed-loop runs against the simulated lung.

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use vent_core::alarm::codes;
use vent_core::mocks::RecordingSink;
use vent_core::{
    AlarmPriority, Commands, RunParams, SafetyReason, VentError, VentilationMode, Ventilator, run,
};
use vent_hardware::{LungParams, SimulatedBattery, SimulatedClock, SimulatedLung};

fn commands() -> Commands {
    Commands {
        peep: 50,
        plateau_pressure: 200,
        cycles_per_minute: 20,
        expiratory_term: 20,
        mode: VentilationMode::PcCmv,
        ..Commands::default()
    }
}

fn ventilator(lung: &SimulatedLung, commands: Commands, sink: RecordingSink) -> Ventilator {
    Ventilator::builder()
        .with_pressure_sensor(lung.pressure_sensor())
        .with_valves(lung.inspiratory_valve(), lung.expiratory_valve())
        .with_blower(lung.blower())
        .with_flow_sensor(lung.flow_sensor())
        .with_battery(SimulatedBattery::new(931, true))
        .with_event_sink(sink)
        .with_commands(commands)
        .build()
        .expect("build")
}

fn cycles(n: u32) -> RunParams {
    RunParams {
        max_cycles: Some(n),
        start_breathing: true,
        ..RunParams::default()
    }
}

#[test]
fn pressure_control_reaches_plateau_and_peep() {
    let clock = SimulatedClock::new();
    let lung = SimulatedLung::new(LungParams::default(), clock.clone());
    let sink = RecordingSink::default();
    let mut vent = ventilator(&lung, commands(), sink.clone());

    let summary =
        run(&mut vent, &clock, &cycles(8), None, &AtomicBool::new(false)).expect("run");

    assert_eq!(summary.cycles, 8);
    assert_eq!(summary.triggered_breaths, 0);
    assert_eq!(summary.cycles_per_minute, 20);
    let plateau = summary.plateau_pressure.expect("plateau measured");
    assert!((160..=240).contains(&plateau), "plateau {plateau}");
    assert!((30..=70).contains(&summary.peep), "peep {}", summary.peep);
    assert!(summary.peak_pressure >= plateau);
    assert!(summary.tidal_volume_ml.is_some_and(|v| v > 0));

    let alarms = vent.controller().alarms();
    for code in alarms.triggered_alarms().as_slice() {
        let priority = alarms.alarm(*code).map(|a| a.priority());
        assert_ne!(priority, Some(AlarmPriority::High), "alarm {code} still triggered");
    }
    assert!(!sink.data().is_empty());
}

#[test]
fn stopped_run_leaves_the_lung_deflating() {
    let clock = SimulatedClock::new();
    let lung = SimulatedLung::new(LungParams::default(), clock.clone());
    let mut vent = ventilator(&lung, commands(), RecordingSink::default());

    run(&mut vent, &clock, &cycles(2), None, &AtomicBool::new(false)).expect("run");

    assert_eq!(lung.blower_speed(), 0);
    assert_eq!(lung.apertures(), (0, 0));
}

#[test]
fn spontaneous_effort_triggers_a_breath() {
    let clock = SimulatedClock::new();
    let params = LungParams {
        effort_every_s: 2.5,
        ..LungParams::default()
    };
    let lung = SimulatedLung::new(params, clock.clone());
    let commands = Commands {
        trigger_enabled: true,
        trigger_offset: 20,
        ..commands()
    };
    let mut vent = ventilator(&lung, commands, RecordingSink::default());

    let summary =
        run(&mut vent, &clock, &cycles(8), None, &AtomicBool::new(false)).expect("run");

    assert!(summary.triggered_breaths >= 1, "{summary:?}");
    assert!(summary.cycles >= 8);
}

#[test]
fn lost_pressure_sensor_stops_in_safety_position() {
    let clock = SimulatedClock::new();
    let lung = SimulatedLung::new(LungParams::default(), clock.clone());
    let mut vent = Ventilator::builder()
        .with_pressure_sensor(lung.pressure_sensor().fail_after(Duration::from_millis(4500)))
        .with_valves(lung.inspiratory_valve(), lung.expiratory_valve())
        .with_blower(lung.blower())
        .with_commands(commands())
        .build()
        .expect("build");

    let err = run(&mut vent, &clock, &cycles(8), None, &AtomicBool::new(false))
        .expect_err("sensor fault");

    assert!(matches!(
        err.downcast_ref::<VentError>(),
        Some(VentError::SafetyStop(SafetyReason::PressureSensorLost))
    ));
    assert!(!vent.is_running());
    assert_eq!(lung.blower_speed(), 0);
    assert_eq!(lung.apertures(), (0, 0));
    assert!(lung.elapsed() >= Duration::from_millis(4500));
}

#[test]
fn failing_valve_is_an_actuator_safety_stop() {
    let clock = SimulatedClock::new();
    let lung = SimulatedLung::new(LungParams::default(), clock.clone());
    let after = Duration::from_millis(1200);
    let mut vent = Ventilator::builder()
        .with_pressure_sensor(lung.pressure_sensor())
        .with_valves(
            lung.inspiratory_valve().fail_after(after),
            lung.expiratory_valve().fail_after(after),
        )
        .with_blower(lung.blower())
        .with_commands(commands())
        .build()
        .expect("build");

    let err = run(&mut vent, &clock, &cycles(8), None, &AtomicBool::new(false))
        .expect_err("valve fault");

    assert!(matches!(
        err.downcast_ref::<VentError>(),
        Some(VentError::SafetyStop(SafetyReason::ActuatorFault))
    ));
    assert!(format!("{err:?}").contains("valve not responding"));
    assert_eq!(lung.blower_speed(), 0);
}

#[test]
fn running_on_battery_raises_the_mains_alarm() {
    let clock = SimulatedClock::new();
    let lung = SimulatedLung::new(LungParams::default(), clock.clone());
    let sink = RecordingSink::default();
    let mut vent = Ventilator::builder()
        .with_pressure_sensor(lung.pressure_sensor())
        .with_valves(lung.inspiratory_valve(), lung.expiratory_valve())
        .with_blower(lung.blower())
        .with_battery(SimulatedBattery::new(880, false))
        .with_event_sink(sink.clone())
        .with_commands(commands())
        .build()
        .expect("build");

    let summary =
        run(&mut vent, &clock, &cycles(1), None, &AtomicBool::new(false)).expect("run");

    assert!(summary.alarms_raised.contains(&codes::MAINS_DISCONNECTED));
    assert!(!summary.alarms_raised.contains(&codes::BATTERY_LOW));
    assert!(sink.raised_codes().contains(&codes::MAINS_DISCONNECTED));
}
