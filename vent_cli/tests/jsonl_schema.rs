use assert_cmd::prelude::*;
use rstest::rstest;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::tempdir;
use vent_core::crc::crc32;

fn write_valid_config(dir: &tempfile::TempDir, extra: &str) -> PathBuf {
    let toml = format!(
        r#"
[ventilation]
mode = "pc_cmv"
peep_mmh2o = 50
plateau_mmh2o = 200
cycles_per_minute = 20

[controller]
period_us = 10000

[hardware]
sensor_read_timeout_ms = 100
{extra}
"#
    );
    let path = dir.path().join("cfg.toml");
    fs::write(&path, toml).unwrap();
    path
}

fn stdout_line(out: &[u8], key: &str) -> Value {
    let stdout = String::from_utf8_lossy(out);
    let line = stdout
        .lines()
        .find(|l| l.contains(key))
        .unwrap_or("")
        .to_string();
    assert!(
        !line.is_empty(),
        "no JSONL line with {key} found; stdout was: {stdout}"
    );
    serde_json::from_str(&line).expect("valid JSON")
}

/// Validate the summary line of a completed run.
#[rstest]
fn jsonl_success_schema() {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(&dir, "");

    let mut cmd = Command::cargo_bin("vent").unwrap();
    cmd.arg("--json")
        .arg("--log-level")
        .arg("error")
        .arg("--config")
        .arg(&cfg)
        .args(["run", "--cycles", "3"]);

    let out = cmd.assert().success().get_output().stdout.clone();
    let v = stdout_line(&out, "\"outcome\"");

    assert_eq!(v["outcome"], "complete");
    assert_eq!(v["mode"], "pc_cmv");
    assert_eq!(v["cycles"].as_u64(), Some(3));
    for key in ["ticks", "elapsed_ms", "overruns", "triggered_breaths"] {
        assert!(v[key].as_u64().is_some(), "{key} should be a number");
    }
    assert!(v["peak_mmh2o"].as_i64().is_some());

    // Plateau and tidal volume are number or null
    for key in ["plateau_mmh2o", "tidal_volume_ml"] {
        let ok = match v.get(key) {
            Some(Value::Null) => true,
            Some(Value::Number(n)) => n.as_i64().is_some(),
            _ => false,
        };
        assert!(ok, "{key} should be number or null");
    }
    assert!(v["alarms_raised"].is_array());
}

/// A lost pressure sensor reports its reason and the timeout in use.
#[rstest]
fn jsonl_safety_stop_schema() {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(&dir, "[simulation]\npressure_fault_after_ms = 2500\n");

    let mut cmd = Command::cargo_bin("vent").unwrap();
    cmd.arg("--json")
        .arg("--log-level")
        .arg("error")
        .arg("--config")
        .arg(&cfg)
        .args(["run", "--cycles", "5"]);

    let out = cmd.assert().code(2).get_output().stdout.clone();
    let v = stdout_line(&out, "\"reason\"");

    assert_eq!(v["reason"], "PressureSensorLost");
    assert_eq!(v["details"]["sensor_read_timeout_ms"].as_u64(), Some(100));
    assert_eq!(v["details"]["mode"], "pc_cmv");
    assert!(v["message"].as_str().is_some_and(|m| !m.is_empty()));
}

/// Every telemetry line carries a CRC over the rest of the frame.
#[rstest]
fn telemetry_frames_carry_valid_crc() {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(&dir, "");
    let telemetry = dir.path().join("telemetry.jsonl");

    Command::cargo_bin("vent")
        .unwrap()
        .arg("--log-level")
        .arg("error")
        .arg("--config")
        .arg(&cfg)
        .args(["run", "--cycles", "2", "--peep", "60", "--telemetry"])
        .arg(&telemetry)
        .args(["--telemetry-every", "50"])
        .assert()
        .success();

    let text = fs::read_to_string(&telemetry).expect("telemetry file");
    let frames: Vec<Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect();
    assert!(!frames.is_empty());

    for frame in &frames {
        let mut body = frame.as_object().expect("object").clone();
        let crc = body
            .remove("crc")
            .and_then(|c| c.as_str().map(str::to_string))
            .expect("crc field");
        let expected = format!("{:08x}", crc32(Value::Object(body).to_string().as_bytes()));
        assert_eq!(crc, expected, "bad crc on {frame}");
    }

    let kinds: Vec<&str> = frames.iter().filter_map(|f| f["kind"].as_str()).collect();
    assert!(kinds.contains(&"cycle"));
    assert!(kinds.contains(&"data"));
    let ack = frames
        .iter()
        .find(|f| f["kind"] == "ack" && f["setting"] == "Peep")
        .expect("peep ack");
    assert_eq!(ack["value"].as_u64(), Some(60));
    assert!(
        frames
            .iter()
            .filter(|f| f["kind"] == "data")
            .all(|f| f["tick"].as_u64().is_some_and(|t| t % 50 == 0))
    );
}
