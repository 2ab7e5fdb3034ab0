//! Alarm definition with per-cycle debouncing.

/// Alarm priority, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum AlarmPriority {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for AlarmPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

/// Alarm codes as shown to the operator. The comment names the safety
/// requirement each one implements.
pub mod codes {
    /// RCM-SW-2: mean pressure too low, from the 3rd cycle.
    pub const PATIENT_UNPLUGGED: u8 = 11;
    /// RCM-SW-1: plateau pressure off by more than 20%, from the 3rd cycle.
    pub const PLATEAU_NOT_REACHED: u8 = 12;
    /// RCM-SW-12: battery voltage very low.
    pub const BATTERY_VERY_LOW: u8 = 13;
    /// RCM-SW-3: PEEP off by more than 20 mmH2O, from the 3rd cycle.
    pub const PEEP_NOT_REACHED: u8 = 14;
    /// RCM-SW-18: pressure above the absolute ceiling.
    pub const PRESSURE_TOO_HIGH: u8 = 17;
    /// RCM-SW-11: battery voltage low.
    pub const BATTERY_LOW: u8 = 21;
    /// RCM-SW-14: plateau pressure off, from the 2nd cycle.
    pub const PLATEAU_NOT_REACHED_MEDIUM: u8 = 22;
    /// RCM-SW-15: PEEP off, from the 2nd cycle.
    pub const PEEP_NOT_REACHED_MEDIUM: u8 = 23;
    /// RCM-SW-19: mean pressure too low, from the 2nd cycle.
    pub const PATIENT_UNPLUGGED_MEDIUM: u8 = 24;
    /// RCM-SW-16: running on battery.
    pub const MAINS_DISCONNECTED: u8 = 31;
    /// RCM-SW-4
    pub const INSPIRATORY_MINUTE_VOLUME_LOW: u8 = 40;
    /// RCM-SW-5
    pub const INSPIRATORY_MINUTE_VOLUME_HIGH: u8 = 41;
    /// RCM-SW-6
    pub const EXPIRATORY_MINUTE_VOLUME_LOW: u8 = 42;
    /// RCM-SW-7
    pub const EXPIRATORY_MINUTE_VOLUME_HIGH: u8 = 43;
    /// RCM-SW-8
    pub const RESPIRATORY_RATE_LOW: u8 = 44;
    /// RCM-SW-9
    pub const RESPIRATORY_RATE_HIGH: u8 = 45;
    /// RCM-SW-10
    pub const LEAK_HIGH: u8 = 46;
    /// RCM-SW-20
    pub const TIDAL_VOLUME_LOW: u8 = 47;
    /// RCM-SW-21
    pub const TIDAL_VOLUME_HIGH: u8 = 48;
}

#[derive(Debug, Clone)]
pub struct Alarm {
    priority: AlarmPriority,
    code: u8,
    threshold: u8,
    detections: u8,
    last_cycle: Option<u32>,
    cycles_since_trigger: u32,
    enabled: bool,
}

impl Alarm {
    pub const fn new(priority: AlarmPriority, code: u8, threshold: u8) -> Self {
        Self {
            priority,
            code,
            threshold,
            detections: 0,
            last_cycle: None,
            cycles_since_trigger: 0,
            enabled: true,
        }
    }

    pub fn priority(&self) -> AlarmPriority {
        self.priority
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn detections(&self) -> u8 {
        self.detections
    }

    pub fn cycles_since_trigger(&self) -> u32 {
        self.cycles_since_trigger
    }

    pub fn is_triggered(&self) -> bool {
        self.enabled && self.detections >= self.threshold
    }

    /// Count a detection for `cycle`. Repeated calls within one cycle count once.
    pub fn detected(&mut self, cycle: u32) {
        if self.last_cycle == Some(cycle) {
            return;
        }
        self.last_cycle = Some(cycle);
        self.detections = self.detections.saturating_add(1);
        if self.detections > self.threshold {
            self.detections = self.threshold;
            self.cycles_since_trigger = self.cycles_since_trigger.saturating_add(1);
        }
    }

    pub fn not_detected(&mut self) {
        self.last_cycle = None;
        self.detections = 0;
        self.cycles_since_trigger = 0;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn triggers_after_threshold_distinct_cycles() {
        let mut a = Alarm::new(AlarmPriority::High, codes::PLATEAU_NOT_REACHED, 3);
        a.detected(1);
        a.detected(2);
        assert!(!a.is_triggered());
        a.detected(3);
        assert!(a.is_triggered());
        a.detected(4);
        assert_eq!(a.detections(), 3);
        assert_eq!(a.cycles_since_trigger(), 1);
    }

    #[test]
    fn first_detection_at_cycle_zero_counts() {
        let mut a = Alarm::new(AlarmPriority::Low, codes::MAINS_DISCONNECTED, 1);
        a.detected(0);
        assert!(a.is_triggered());
    }

    #[test]
    fn disabled_alarm_never_reports_triggered() {
        let mut a = Alarm::new(AlarmPriority::High, codes::PRESSURE_TOO_HIGH, 1);
        a.detected(7);
        a.disable();
        assert!(!a.is_triggered());
        a.enable();
        assert!(a.is_triggered());
    }

    #[test]
    fn not_detected_resets_counters() {
        let mut a = Alarm::new(AlarmPriority::Medium, codes::BATTERY_LOW, 1);
        a.detected(1);
        a.detected(2);
        a.not_detected();
        assert_eq!((a.detections(), a.cycles_since_trigger()), (0, 0));
        a.detected(2);
        assert!(a.is_triggered());
    }

    proptest! {
        #[test]
        fn same_cycle_counts_once(cycle in any::<u32>(), n in 1usize..50) {
            let mut a = Alarm::new(AlarmPriority::High, codes::PEEP_NOT_REACHED, 3);
            for _ in 0..n {
                a.detected(cycle);
            }
            prop_assert_eq!(a.detections(), 1);
        }
    }
}
