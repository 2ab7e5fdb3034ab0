//! JSON-lines telemetry sink.
//!
//! Every line is one JSON object with a `kind` and a `crc` field. The CRC-32
//! covers the compact serialization of the object without its `crc` key
//! (keys sorted), so a reader can check each frame on its own.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde_json::{Value, json};
use vent_core::crc::crc32;
use vent_core::{
    AlarmTrap, Commands, DataSnapshot, EventSink, MachineStateSnapshot, SettingId,
    StoppedSnapshot,
};

pub struct TelemetrySink {
    out: BufWriter<File>,
    data_every: u32,
    stopped_seen: u32,
    failed: bool,
}

impl TelemetrySink {
    pub fn create(path: &Path, data_every: u32) -> eyre::Result<Self> {
        let file = File::create(path)
            .map_err(|e| eyre::eyre!("create telemetry file {path:?}: {e}"))?;
        Ok(Self {
            out: BufWriter::new(file),
            data_every: data_every.max(1),
            stopped_seen: 0,
            failed: false,
        })
    }

    fn emit(&mut self, frame: Value) {
        if self.failed {
            return;
        }
        let line = seal(frame).to_string();
        if let Err(e) = writeln!(self.out, "{line}") {
            // Telemetry must never stop the breathing loop.
            tracing::warn!(error = %e, "telemetry write failed; disabling telemetry");
            self.failed = true;
        }
    }

    fn flush(&mut self) {
        if !self.failed
            && let Err(e) = self.out.flush()
        {
            tracing::warn!(error = %e, "telemetry flush failed; disabling telemetry");
            self.failed = true;
        }
    }
}

/// Add the `crc` field to `frame`.
pub fn seal(mut frame: Value) -> Value {
    let crc = crc32(frame.to_string().as_bytes());
    if let Value::Object(map) = &mut frame {
        map.insert("crc".into(), json!(format!("{crc:08x}")));
    }
    frame
}

fn settings(c: &Commands) -> Value {
    json!({
        "mode": c.mode.as_str(),
        "peak_mmh2o": c.peak_pressure,
        "plateau_mmh2o": c.plateau_pressure,
        "peep_mmh2o": c.peep,
        "cycles_per_minute": c.cycles_per_minute,
        "expiratory_term": c.expiratory_term,
        "trigger_enabled": c.trigger_enabled,
        "trigger_offset_mmh2o": c.trigger_offset,
        "tidal_volume_ml": c.tidal_volume_ml,
    })
}

impl EventSink for TelemetrySink {
    fn alarm_trap(&mut self, trap: &AlarmTrap) {
        self.emit(json!({
            "kind": "alarm",
            "code": trap.code,
            "priority": trap.priority.to_string(),
            "triggered": trap.triggered,
            "cycle": trap.cycle,
            "tick": trap.tick,
            "phase": trap.phase.to_string(),
            "pressure_mmh2o": trap.pressure,
            "expected": trap.expected,
            "measured": trap.measured,
            "cycles_since_trigger": trap.cycles_since_trigger,
        }));
    }

    fn data_snapshot(&mut self, s: &DataSnapshot) {
        if s.tick % self.data_every != 0 {
            return;
        }
        self.emit(json!({
            "kind": "data",
            "tick": s.tick,
            "phase": s.phase.to_string(),
            "pressure_mmh2o": s.pressure,
            "inspiratory_valve": s.inspiratory_valve,
            "expiratory_valve": s.expiratory_valve,
            "blower_speed": s.blower_speed,
            "battery_decivolts": s.battery_decivolts,
            "inspiratory_flow_ml_min": s.inspiratory_flow,
            "expiratory_flow_ml_min": s.expiratory_flow,
        }));
    }

    fn machine_state(&mut self, s: &MachineStateSnapshot) {
        self.emit(json!({
            "kind": "cycle",
            "cycle": s.cycle,
            "peak_mmh2o": s.peak_pressure,
            "plateau_mmh2o": s.plateau_pressure,
            "peep_mmh2o": s.peep,
            "cycles_per_minute": s.cycles_per_minute,
            "tidal_volume_ml": s.tidal_volume_ml,
            "expiratory_volume_ml": s.expiratory_volume_ml,
            "alarms": s.triggered_alarms.as_slice(),
            "snoozed": s.snoozed,
            "next": settings(&s.next),
        }));
        self.flush();
    }

    fn stopped(&mut self, s: &StoppedSnapshot) {
        let seen = self.stopped_seen;
        self.stopped_seen = seen.wrapping_add(1);
        if seen % self.data_every != 0 {
            return;
        }
        self.emit(json!({
            "kind": "stopped",
            "snoozed": s.snoozed,
            "next": settings(&s.next),
        }));
    }

    fn control_ack(&mut self, setting: SettingId, value: u32) {
        self.emit(json!({
            "kind": "ack",
            "setting": format!("{setting:?}"),
            "id": setting as u8,
            "value": value,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vent_core::CyclePhase;

    /// Whether `frame` carries a `crc` matching its other fields.
    fn verify(frame: &Value) -> bool {
        let Value::Object(map) = frame else {
            return false;
        };
        let Some(expected) = map.get("crc").and_then(Value::as_str) else {
            return false;
        };
        let mut body = map.clone();
        body.remove("crc");
        format!("{:08x}", crc32(Value::Object(body).to_string().as_bytes())) == expected
    }

    fn lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .expect("read")
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect()
    }

    fn snapshot(tick: u32) -> DataSnapshot {
        DataSnapshot {
            tick,
            pressure: 120,
            phase: CyclePhase::Inhalation,
            inspiratory_valve: 40,
            expiratory_valve: 125,
            blower_speed: 900,
            battery_decivolts: 271,
            inspiratory_flow: 30_000,
            expiratory_flow: 0,
        }
    }

    #[test]
    fn sealed_frame_verifies_and_detects_tampering() {
        let frame = seal(json!({"kind": "data", "tick": 3, "pressure_mmh2o": 120}));
        assert!(verify(&frame));
        let mut tampered = frame.clone();
        tampered["pressure_mmh2o"] = json!(121);
        assert!(!verify(&tampered));
        assert!(!verify(&json!({"kind": "data"})));
    }

    #[test]
    fn data_snapshots_are_decimated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.jsonl");
        {
            let mut sink = TelemetrySink::create(&path, 10).expect("create");
            for tick in 0..25 {
                sink.data_snapshot(&snapshot(tick));
            }
            sink.control_ack(SettingId::Peep, 80);
        }
        let frames = lines(&path);
        let ticks: Vec<_> = frames
            .iter()
            .filter(|f| f["kind"] == "data")
            .map(|f| f["tick"].as_u64().expect("tick"))
            .collect();
        assert_eq!(ticks, vec![0, 10, 20]);
        let ack = frames.last().expect("ack");
        assert_eq!(ack["setting"], "Peep");
        assert_eq!(ack["id"], 3);
        assert!(frames.iter().all(verify));
    }
}
