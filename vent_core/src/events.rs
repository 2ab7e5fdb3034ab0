//! Outbound notifications: alarm traps, telemetry snapshots, control acks.
//!
//! The core never formats or frames these; an `EventSink` decides what to do
//! with them (log, serialize, forward to a UI). All hooks default to no-ops.

use crate::alarm::AlarmPriority;
use crate::commands::{Commands, SettingId};
use crate::cycle::CyclePhase;

/// Upper bound on the alarm catalog size.
pub const MAX_ALARMS: usize = 24;

/// Alarm raised or cleared, with the core data at the time of the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmTrap {
    pub tick: u32,
    pub pressure: i16,
    pub phase: CyclePhase,
    pub cycle: u32,
    pub code: u8,
    pub priority: AlarmPriority,
    pub triggered: bool,
    pub expected: i32,
    pub measured: i32,
    pub cycles_since_trigger: u32,
}

/// Per-tick telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSnapshot {
    pub tick: u32,
    /// Never negative.
    pub pressure: i16,
    pub phase: CyclePhase,
    pub inspiratory_valve: u16,
    pub expiratory_valve: u16,
    pub blower_speed: u16,
    /// Battery voltage in tenths of a volt.
    pub battery_decivolts: u16,
    pub inspiratory_flow: i32,
    pub expiratory_flow: i32,
}

/// Sorted codes of the currently triggered alarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggeredAlarms {
    codes: [u8; MAX_ALARMS],
    len: usize,
}

impl Default for TriggeredAlarms {
    fn default() -> Self {
        Self {
            codes: [0; MAX_ALARMS],
            len: 0,
        }
    }
}

impl TriggeredAlarms {
    pub(crate) fn from_unsorted(codes: impl IntoIterator<Item = u8>) -> Self {
        let mut out = Self::default();
        for code in codes {
            if code != 0 && out.len < MAX_ALARMS && !out.as_slice().contains(&code) {
                out.codes[out.len] = code;
                out.len += 1;
            }
        }
        out.codes[..out.len].sort_unstable();
        out
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.codes[..self.len]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, code: u8) -> bool {
        self.as_slice().contains(&code)
    }
}

/// End-of-cycle summary. Carries the *next* commands, which become current
/// at the following cycle start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineStateSnapshot {
    pub cycle: u32,
    pub next: Commands,
    pub peak_pressure: i16,
    pub plateau_pressure: Option<i16>,
    pub peep: i16,
    pub triggered_alarms: TriggeredAlarms,
    pub tidal_volume_ml: Option<u16>,
    pub cycles_per_minute: u16,
    pub expiratory_volume_ml: i32,
    pub snoozed: bool,
}

/// Sent while the machine is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoppedSnapshot {
    pub next: Commands,
    pub snoozed: bool,
}

pub trait EventSink {
    fn alarm_trap(&mut self, _trap: &AlarmTrap) {}
    fn data_snapshot(&mut self, _snapshot: &DataSnapshot) {}
    fn machine_state(&mut self, _snapshot: &MachineStateSnapshot) {}
    fn stopped(&mut self, _snapshot: &StoppedSnapshot) {}
    fn control_ack(&mut self, _setting: SettingId, _value: u32) {}
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggered_list_is_sorted_deduplicated_and_zero_free() {
        let t = TriggeredAlarms::from_unsorted([31, 0, 12, 17, 12, 11]);
        assert_eq!(t.as_slice(), &[11, 12, 17, 31]);
        assert!(t.contains(17));
        assert!(!TriggeredAlarms::default().contains(0));
    }
}
