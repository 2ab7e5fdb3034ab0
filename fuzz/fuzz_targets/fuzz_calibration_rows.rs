#![no_main]
use libfuzzer_sys::fuzz_target;
use vent_config::{CalibrationRow, PressureCalibration};

fuzz_target!(|points: Vec<(i64, f32)>| {
    let rows: Vec<CalibrationRow> = points
        .into_iter()
        .map(|(raw, mmh2o)| CalibrationRow { raw, mmh2o })
        .collect();
    if let Ok(cal) = PressureCalibration::from_rows(&rows) {
        assert_ne!(cal.gain_num, 0);
        assert_eq!(cal.gain_den, vent_config::GAIN_DENOMINATOR);
    }
});
