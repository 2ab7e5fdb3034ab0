use std::time::Duration;

use rstest::rstest;
use vent_hardware::{LungParams, SensorTransfer, SimulatedClock, SimulatedLung};
use vent_traits::{BlowerActuator, Clock, FlowSensor, PressureSensor, ValveActuator};

fn mmh2o(raw: u32) -> i64 {
    let t = SensorTransfer::default();
    i64::from(raw) * i64::from(t.gain_num) / i64::from(t.gain_den) - i64::from(t.offset_mmh2o)
}

#[rstest]
#[case(20.0, 20.0)]
#[case(50.0, 10.0)]
#[case(10.0, 5.0)]
fn sealed_lung_settles_at_blower_pressure(#[case] compliance: f64, #[case] resistance: f64) {
    let clock = SimulatedClock::new();
    let params = LungParams {
        compliance_ml_per_cmh2o: compliance,
        resistance_cmh2o_per_lps: resistance,
        ..LungParams::default()
    };
    let lung = SimulatedLung::new(params, clock.clone());
    let mut sensor = lung.pressure_sensor();
    let mut exp = lung.expiratory_valve();
    let mut blower = lung.blower();

    exp.apply_aperture(125).unwrap();
    blower.run_speed(900).unwrap();
    let mut last = mmh2o(sensor.read_raw(Duration::from_millis(10)).unwrap());
    for _ in 0..30 {
        clock.sleep(Duration::from_millis(500));
        let p = mmh2o(sensor.read_raw(Duration::from_millis(10)).unwrap());
        assert!(p + 1 >= last, "pressure fell from {last} to {p}");
        last = p;
    }
    let target = vent_hardware::lung::blower_pressure(900, 0.0);
    assert!((last as f64 - target).abs() < 5.0, "{last} vs {target}");
}

#[test]
fn delivered_volume_matches_compliance() {
    let clock = SimulatedClock::new();
    let lung = SimulatedLung::new(LungParams::default(), clock.clone());
    let mut flow = lung.flow_sensor();
    let mut exp = lung.expiratory_valve();
    let mut blower = lung.blower();

    exp.apply_aperture(125).unwrap();
    blower.run_speed(900).unwrap();
    clock.sleep(Duration::from_secs(10));
    // the pressure sensor is what advances the model
    lung.pressure_sensor().read_raw(Duration::from_millis(10)).unwrap();

    // 20 mL/cmH2O at about 351 mmH2O
    let expected = 20.0 * lung.airway_pressure() / 10.197;
    let delivered = f64::from(flow.delivered_volume().unwrap());
    assert!((delivered - expected).abs() < 5.0, "{delivered} vs {expected}");
    assert!(flow.read_inspiratory_flow().unwrap() < 100);
}
