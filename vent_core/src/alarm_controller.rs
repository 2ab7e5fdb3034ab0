//! Alarm catalog, detection transactions and sound/light policy.

use crate::alarm::{Alarm, AlarmPriority, codes};
use crate::commands::SettingId;
use crate::cycle::CyclePhase;
use crate::events::{AlarmTrap, EventSink, TriggeredAlarms};
use crate::params::DEFAULT_SNOOZE_MS;
use crate::util::ticks_per_second;
use vent_traits::Tone;

/// Number of alarms in the catalog.
pub const ALARM_COUNT: usize = 19;

/// Catalog: priority, code and detection threshold in distinct cycles.
const CATALOG: [Alarm; ALARM_COUNT] = [
    Alarm::new(AlarmPriority::High, codes::PATIENT_UNPLUGGED, 3),
    Alarm::new(AlarmPriority::High, codes::PLATEAU_NOT_REACHED, 3),
    Alarm::new(AlarmPriority::High, codes::BATTERY_VERY_LOW, 1),
    Alarm::new(AlarmPriority::High, codes::PEEP_NOT_REACHED, 3),
    Alarm::new(AlarmPriority::High, codes::INSPIRATORY_MINUTE_VOLUME_LOW, 3),
    Alarm::new(AlarmPriority::High, codes::INSPIRATORY_MINUTE_VOLUME_HIGH, 3),
    Alarm::new(AlarmPriority::High, codes::EXPIRATORY_MINUTE_VOLUME_LOW, 3),
    Alarm::new(AlarmPriority::High, codes::EXPIRATORY_MINUTE_VOLUME_HIGH, 3),
    Alarm::new(AlarmPriority::High, codes::RESPIRATORY_RATE_LOW, 3),
    Alarm::new(AlarmPriority::High, codes::RESPIRATORY_RATE_HIGH, 3),
    Alarm::new(AlarmPriority::High, codes::LEAK_HIGH, 3),
    Alarm::new(AlarmPriority::High, codes::PRESSURE_TOO_HIGH, 1),
    Alarm::new(AlarmPriority::Medium, codes::BATTERY_LOW, 1),
    Alarm::new(AlarmPriority::Medium, codes::PLATEAU_NOT_REACHED_MEDIUM, 2),
    Alarm::new(AlarmPriority::Medium, codes::PEEP_NOT_REACHED_MEDIUM, 2),
    Alarm::new(AlarmPriority::Medium, codes::PATIENT_UNPLUGGED_MEDIUM, 2),
    Alarm::new(AlarmPriority::Low, codes::MAINS_DISCONNECTED, 1),
    Alarm::new(AlarmPriority::High, codes::TIDAL_VOLUME_LOW, 3),
    Alarm::new(AlarmPriority::High, codes::TIDAL_VOLUME_HIGH, 3),
];

/// Latest tick data attached to alarm traps.
#[derive(Debug, Clone, Copy, Default)]
struct CoreData {
    tick: u32,
    pressure: i16,
    phase: CyclePhase,
    cycle: u32,
}

/// What the indicators should show after one `run_alarm_effects` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmEffects {
    pub highest_priority: AlarmPriority,
    /// Buzzer command to issue now, if any.
    pub buzzer: Option<Tone>,
    pub red: bool,
    pub yellow: bool,
    pub green: bool,
}

#[derive(Debug, Clone)]
pub struct AlarmController {
    alarms: [Alarm; ALARM_COUNT],
    snoozed: [bool; ALARM_COUNT],
    unsnoozed: bool,
    snooze_started_ms: Option<u64>,
    snooze_ms: u64,
    highest_priority: AlarmPriority,
    pending_tone: Option<Tone>,
    red: bool,
    yellow: bool,
    core: CoreData,
    period_us: u32,
}

impl Default for AlarmController {
    fn default() -> Self {
        Self::new(u64::from(DEFAULT_SNOOZE_MS), crate::params::DEFAULT_PERIOD_US)
    }
}

impl AlarmController {
    pub fn new(snooze_ms: u64, period_us: u32) -> Self {
        Self {
            alarms: CATALOG,
            snoozed: [false; ALARM_COUNT],
            unsnoozed: true,
            snooze_started_ms: None,
            snooze_ms,
            highest_priority: AlarmPriority::None,
            pending_tone: None,
            red: false,
            yellow: false,
            core: CoreData::default(),
            period_us,
        }
    }

    pub fn alarm(&self, code: u8) -> Option<&Alarm> {
        self.alarms.iter().find(|a| a.code() == code)
    }

    pub fn is_triggered(&self, code: u8) -> bool {
        self.alarm(code).is_some_and(Alarm::is_triggered)
    }

    pub fn is_snoozed(&self) -> bool {
        !self.unsnoozed
    }

    /// Currently triggered alarm codes, ascending.
    pub fn triggered_alarms(&self) -> TriggeredAlarms {
        TriggeredAlarms::from_unsorted(
            self.alarms
                .iter()
                .filter(|a| a.is_triggered())
                .map(Alarm::code),
        )
    }

    pub fn update_core_data(&mut self, tick: u32, pressure: i16, phase: CyclePhase, cycle: u32) {
        self.core = CoreData {
            tick,
            pressure,
            phase,
            cycle,
        };
    }

    /// Disable every alarm, then enable exactly the given codes.
    pub fn update_enabled_alarms(&mut self, enabled: &[u8]) {
        for alarm in &mut self.alarms {
            alarm.disable();
        }
        for code in enabled {
            if let Some(alarm) = self.alarms.iter_mut().find(|a| a.code() == *code) {
                alarm.enable();
            }
        }
    }

    /// Count a detection of an enabled alarm. Emits a trap on the raising edge.
    pub fn detected_alarm(
        &mut self,
        code: u8,
        cycle: u32,
        expected: i32,
        measured: i32,
        sink: &mut dyn EventSink,
    ) {
        let core = self.core;
        let Some(alarm) = self
            .alarms
            .iter_mut()
            .find(|a| a.is_enabled() && a.code() == code)
        else {
            return;
        };
        let was_triggered = alarm.is_triggered();
        alarm.detected(cycle);
        if alarm.is_triggered() && !was_triggered {
            tracing::info!(code, priority = %alarm.priority(), cycle, expected, measured, "alarm raised");
            sink.alarm_trap(&AlarmTrap {
                tick: core.tick,
                pressure: core.pressure,
                phase: core.phase,
                cycle: core.cycle,
                code,
                priority: alarm.priority(),
                triggered: true,
                expected,
                measured,
                cycles_since_trigger: alarm.cycles_since_trigger(),
            });
        }
    }

    /// Reset an alarm, enabled or not. Emits a trap on the clearing edge.
    pub fn not_detected_alarm(&mut self, code: u8, sink: &mut dyn EventSink) {
        let core = self.core;
        let Some(alarm) = self.alarms.iter_mut().find(|a| a.code() == code) else {
            return;
        };
        let was_triggered = alarm.is_triggered();
        alarm.not_detected();
        if was_triggered {
            tracing::info!(code, priority = %alarm.priority(), "alarm cleared");
            sink.alarm_trap(&AlarmTrap {
                tick: core.tick,
                pressure: core.pressure,
                phase: core.phase,
                cycle: core.cycle,
                code,
                priority: alarm.priority(),
                triggered: false,
                expected: 0,
                measured: 0,
                cycles_since_trigger: alarm.cycles_since_trigger(),
            });
        }
    }

    /// Silence the buzzer for the snooze window. Alarms already triggered are
    /// covered; any other alarm that triggers later ends the snooze.
    pub fn snooze(&mut self, now_ms: u64, sink: &mut dyn EventSink) {
        if self.unsnoozed {
            self.unsnoozed = false;
            self.snooze_started_ms = Some(now_ms);
            for (flag, alarm) in self.snoozed.iter_mut().zip(&self.alarms) {
                *flag = alarm.is_triggered();
            }
            self.pending_tone = Some(Tone::Silent);
            tracing::info!("alarms snoozed");
        }
        sink.control_ack(SettingId::AlarmSnooze, u32::from(!self.unsnoozed));
    }

    pub fn unsnooze(&mut self, sink: &mut dyn EventSink) {
        self.snooze_started_ms = None;
        self.snoozed = [false; ALARM_COUNT];
        if !self.unsnoozed {
            tracing::info!("alarm snooze ended");
        }
        self.unsnoozed = true;
        sink.control_ack(SettingId::AlarmSnooze, 0);
    }

    /// Evaluate the sound and light policy for this tick.
    pub fn run_alarm_effects(
        &mut self,
        tick: u32,
        now_ms: u64,
        sink: &mut dyn EventSink,
    ) -> AlarmEffects {
        let mut highest = AlarmPriority::None;
        let mut just_unsnoozed = false;

        for i in 0..ALARM_COUNT {
            if self.alarms[i].is_triggered() {
                highest = highest.max(self.alarms[i].priority());
                if !self.unsnoozed && !self.snoozed[i] {
                    self.unsnooze(sink);
                    just_unsnoozed = true;
                }
            } else {
                self.snoozed[i] = false;
            }
        }

        let expired = self
            .snooze_started_ms
            .is_some_and(|started| now_ms.saturating_sub(started) >= self.snooze_ms);
        if !self.unsnoozed && expired {
            self.unsnooze(sink);
        }

        let mut buzzer = self.pending_tone.take();
        let announce = (self.highest_priority != highest || just_unsnoozed) && self.unsnoozed;

        let blink_period = ticks_per_second(self.period_us);
        let phase = tick % blink_period;
        let blink_on = phase == blink_period / 2;
        let blink_off = phase == 0;

        match highest {
            AlarmPriority::High => {
                if announce {
                    buzzer = Some(Tone::High);
                }
                if blink_on {
                    self.red = true;
                } else if blink_off {
                    self.red = false;
                }
                self.yellow = false;
            }
            AlarmPriority::Medium => {
                if announce {
                    buzzer = Some(Tone::Medium);
                }
                self.red = false;
                if blink_on {
                    self.yellow = true;
                } else if blink_off {
                    self.yellow = false;
                }
            }
            AlarmPriority::Low => {
                if announce {
                    buzzer = Some(Tone::Low);
                }
                self.red = false;
                self.yellow = true;
            }
            AlarmPriority::None => {
                if self.highest_priority != AlarmPriority::None {
                    buzzer = Some(Tone::Silent);
                }
                self.red = false;
                self.yellow = false;
            }
        }

        self.highest_priority = highest;
        AlarmEffects {
            highest_priority: highest,
            buzzer,
            red: self.red,
            yellow: self.yellow,
            green: !self.unsnoozed,
        }
    }
}
