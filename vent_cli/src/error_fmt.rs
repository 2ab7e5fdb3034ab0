//! Human-readable error descriptions, exit codes and JSON error formatting.

use crate::cli::LAST_RUN;
use vent_core::error::{BuildError, SafetyReason, VentError};

pub const EXIT_GENERIC: i32 = 1;
pub const EXIT_PRESSURE_SENSOR: i32 = 2;
pub const EXIT_BATTERY: i32 = 3;
pub const EXIT_ACTUATOR: i32 = 4;
pub const EXIT_CONFIG: i32 = 5;

pub fn safety_reason_name(r: SafetyReason) -> &'static str {
    match r {
        SafetyReason::PressureSensorLost => "PressureSensorLost",
        SafetyReason::BatteryDeepDischarge => "BatteryDeepDischarge",
        SafetyReason::ActuatorFault => "ActuatorFault",
    }
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingPressureSensor => {
                "What happened: No pressure sensor was provided to the ventilator.\nLikely causes: The sensor failed to initialize or was not wired into the builder.\nHow to fix: Pass the sensor via with_pressure_sensor(...).".to_string()
            }
            BuildError::MissingValves => {
                "What happened: The pinch valves were not provided to the ventilator.\nLikely causes: A valve driver failed to initialize.\nHow to fix: Pass both valves via with_valves(...).".to_string()
            }
            BuildError::MissingBlower => {
                "What happened: No blower was provided to the ventilator.\nLikely causes: The blower driver failed to initialize.\nHow to fix: Pass the blower via with_blower(...).".to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun."
            ),
        };
    }

    if let Some(ve) = err.downcast_ref::<VentError>() {
        return match ve {
            VentError::SafetyStop(SafetyReason::PressureSensorLost) => {
                "What happened: The pressure sensor was lost during ventilation; the machine stopped with both valves open and the blower off.\nLikely causes: Sensor unplugged, broken wiring, or a read timeout set too low.\nHow to fix: Check the sensor and its cable, and consider raising hardware.sensor_read_timeout_ms.".to_string()
            }
            VentError::SafetyStop(SafetyReason::BatteryDeepDischarge) => {
                "What happened: The battery reached deep discharge; the machine stopped in the safety position.\nLikely causes: Mains disconnected for too long.\nHow to fix: Reconnect mains power and let the battery charge before restarting.".to_string()
            }
            VentError::SafetyStop(SafetyReason::ActuatorFault) => {
                let cause = err.root_cause();
                format!(
                    "What happened: An actuator stopped responding; the machine stopped in the safety position.\nLikely causes: {cause}.\nHow to fix: Check the valve motors and the blower driver, then restart."
                )
            }
            VentError::Timeout => {
                "What happened: The pressure sensor did not answer in time.\nLikely causes: Sensor not powered or wired, or hardware.sensor_read_timeout_ms too low.\nHow to fix: Verify the sensor, then raise the timeout in the config if needed.".to_string()
            }
            VentError::Calibration(msg) => format!(
                "What happened: Pressure offset calibration failed ({msg}).\nLikely causes: A patient is connected or the circuit is pressurized during start-up.\nHow to fix: Disconnect the patient so the sensor sees ambient air, then restart."
            ),
            VentError::Config(msg) if msg.to_ascii_lowercase().contains("calibration csv must have headers") => {
                "Invalid headers in calibration CSV. Expected 'raw,mmh2o'.".to_string()
            }
            VentError::Config(msg) => format!(
                "What happened: Configuration is invalid ({msg}).\nLikely causes: A missing [ventilation] section, or inconsistent values.\nHow to fix: Edit the TOML config and try again."
            ),
            VentError::State(msg) => format!(
                "What happened: The ventilator refused the request ({msg}).\nLikely causes: See the message.\nHow to fix: Re-run with --log-level=debug for details."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    // Generic fallback
    let msg = err.to_string();
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes; anything not listed is 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if err.downcast_ref::<BuildError>().is_some() {
        return EXIT_CONFIG;
    }
    match err.downcast_ref::<VentError>() {
        Some(VentError::SafetyStop(SafetyReason::PressureSensorLost) | VentError::Timeout) => {
            EXIT_PRESSURE_SENSOR
        }
        Some(VentError::SafetyStop(SafetyReason::BatteryDeepDischarge)) => EXIT_BATTERY,
        Some(VentError::SafetyStop(SafetyReason::ActuatorFault)) => EXIT_ACTUATOR,
        Some(VentError::Config(_) | VentError::Calibration(_)) => EXIT_CONFIG,
        _ => EXIT_GENERIC,
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let msg = humanize(err);
    if let Some(VentError::SafetyStop(reason)) = err.downcast_ref::<VentError>() {
        let details = LAST_RUN.get().map(|run| match reason {
            SafetyReason::PressureSensorLost => json!({
                "mode": run.mode.as_str(),
                "sensor_read_timeout_ms": run.sensor_read_timeout_ms,
            }),
            _ => json!({ "mode": run.mode.as_str(), "period_us": run.period_us }),
        });
        let obj = match details {
            Some(d) => json!({ "reason": safety_reason_name(*reason), "details": d, "message": msg }),
            None => json!({ "reason": safety_reason_name(*reason), "message": msg }),
        };
        return obj.to_string();
    }

    json!({ "reason": "Error", "code": exit_code_for_error(err), "message": msg }).to_string()
}
