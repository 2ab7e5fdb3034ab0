use std::fs::File;
use std::io::Write;

use rstest::rstest;
use tempfile::tempdir;
use vent_config::{CalibrationRow, GAIN_DENOMINATOR, PressureCalibration, load_calibration_csv};

fn row(raw: i64, mmh2o: f32) -> CalibrationRow {
    CalibrationRow { raw, mmh2o }
}

#[rstest]
fn two_points_fit_exactly() {
    // mmh2o = 0.25 * raw - 50
    let c = PressureCalibration::from_rows(&[row(200, 0.0), row(1000, 200.0)]).unwrap();
    assert_eq!(c.gain_den, GAIN_DENOMINATOR);
    assert_eq!(c.gain_num, 2500);
    assert_eq!(c.offset_mmh2o, 50);
}

#[rstest]
fn ols_over_noisy_points() {
    let rows = [
        row(200, 1.0),
        row(400, 49.0),
        row(600, 101.0),
        row(800, 149.0),
        row(1000, 200.0),
    ];
    let c = PressureCalibration::from_rows(&rows).unwrap();
    assert!((c.gain_num - 2495).abs() <= 10, "gain {}", c.gain_num);
    assert!((c.offset_mmh2o - 49).abs() <= 2, "offset {}", c.offset_mmh2o);
}

#[rstest]
fn decreasing_raw_is_accepted() {
    let c = PressureCalibration::from_rows(&[row(1000, 0.0), row(200, 200.0)]).unwrap();
    assert_eq!(c.gain_num, -2500);
}

#[rstest]
#[case(&[row(100, 0.0)], "at least two rows")]
#[case(&[row(100, 0.0), row(100, 10.0)], "duplicate raw")]
#[case(&[row(100, 0.0), row(200, 100.0), row(150, 70.0)], "monotonic")]
#[case(&[row(100, 5.0), row(200, 5.0)], "zero slope")]
fn rejects_bad_rows(#[case] rows: &[CalibrationRow], #[case] message: &str) {
    let err = PressureCalibration::from_rows(rows).expect_err("should fail");
    assert!(format!("{err}").contains(message), "unexpected: {err}");
}

#[test]
fn loads_csv_with_expected_headers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cal.csv");
    let mut f = File::create(&path).unwrap();
    writeln!(f, "raw,mmh2o").unwrap();
    writeln!(f, "200,0").unwrap();
    writeln!(f, "600,100").unwrap();
    writeln!(f, "1000,200").unwrap();
    drop(f);

    let c = load_calibration_csv(&path).unwrap();
    assert_eq!(c.gain_num, 2500);
    assert_eq!(c.offset_mmh2o, 50);
}

#[test]
fn rejects_wrong_headers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cal.csv");
    std::fs::write(&path, "raw,mbar\n200,0\n1000,200\n").unwrap();
    let err = load_calibration_csv(&path).expect_err("wrong headers");
    assert!(format!("{err}").contains("headers 'raw,mmh2o'"));
}

#[test]
fn reports_bad_row_number() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cal.csv");
    std::fs::write(&path, "raw,mmh2o\n200,0\nabc,100\n").unwrap();
    let err = load_calibration_csv(&path).expect_err("bad row");
    assert!(format!("{err}").contains("invalid CSV row 3"));
}
