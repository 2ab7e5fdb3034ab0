//! Battery voltage monitoring and the power alarms.
//!
//! Voltages are kept as raw ADC counts averaged over 20 samples. Each alarm has
//! a hysteresis band: it is detected below `threshold - 3` and cleared above
//! `threshold`; in between it keeps its state.

use crate::alarm::codes;
use crate::alarm_controller::AlarmController;
use crate::events::EventSink;
use crate::ring::RingBuffer;

pub const BATTERY_SAMPLES: usize = 20;
/// Raw level with mains power and a charged battery.
pub const RAW_VOLTAGE_MAINS: u16 = 931;
pub const RAW_VOLTAGE_ON_BATTERY_HIGH: u16 = 911;
pub const RAW_VOLTAGE_HYSTERESIS: u16 = 3;
pub const RAW_VOLTAGE_ON_BATTERY: u16 = 830;
pub const RAW_VOLTAGE_ON_BATTERY_LOW: u16 = 809;
/// Below this level a breathing session must not be started.
pub const RAW_VOLTAGE_NOT_STARTING: u16 = 742;
/// Below this level the machine stops.
pub const RAW_VOLTAGE_STOP: u16 = 675;
/// Volts per raw count.
pub const RAW_BATTERY_MULTIPLIER: f32 = 0.029_828_125;

/// (alarm code, raw threshold) in evaluation order.
const POWER_ALARMS: [(u8, u16); 3] = [
    (codes::MAINS_DISCONNECTED, RAW_VOLTAGE_ON_BATTERY_HIGH),
    (codes::BATTERY_LOW, RAW_VOLTAGE_ON_BATTERY),
    (codes::BATTERY_VERY_LOW, RAW_VOLTAGE_ON_BATTERY_LOW),
];

#[derive(Debug, Clone)]
pub struct BatteryMonitor {
    samples: RingBuffer<u16, BATTERY_SAMPLES>,
    running_on_battery: bool,
    mains_connected: bool,
}

impl Default for BatteryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl BatteryMonitor {
    pub fn new() -> Self {
        Self {
            samples: RingBuffer::filled(RAW_VOLTAGE_MAINS),
            running_on_battery: false,
            mains_connected: true,
        }
    }

    pub fn push_sample(&mut self, raw: u16) {
        self.samples.push(raw);
    }

    /// Fill the whole window with one reading.
    pub fn prime(&mut self, raw: u16) {
        self.samples.fill(raw);
    }

    /// Mean raw level over the window.
    pub fn mean_raw(&self) -> u16 {
        // Mean of u16 samples always fits.
        u16::try_from(self.samples.mean()).unwrap_or(u16::MAX)
    }

    /// Re-evaluate the power alarms against the current mean.
    pub fn update_state(
        &mut self,
        mains_connected: bool,
        cycle: u32,
        alarms: &mut AlarmController,
        sink: &mut dyn EventSink,
    ) {
        self.mains_connected = mains_connected;
        let mean = self.mean_raw();
        for (code, threshold) in POWER_ALARMS {
            let detect_below = threshold - RAW_VOLTAGE_HYSTERESIS;
            let state = if !mains_connected && mean < detect_below {
                alarms.detected_alarm(code, cycle, i32::from(detect_below), i32::from(mean), sink);
                Some(true)
            } else if mains_connected || mean > threshold {
                alarms.not_detected_alarm(code, sink);
                Some(false)
            } else {
                None
            };
            if code != codes::MAINS_DISCONNECTED {
                continue;
            }
            if let Some(on_battery) = state {
                if on_battery != self.running_on_battery {
                    tracing::info!(on_battery, raw = mean, "power source changed");
                }
                self.running_on_battery = on_battery;
            }
        }
    }

    /// One monitoring step: record a sample, then re-evaluate the alarms.
    pub fn battery_loop(
        &mut self,
        raw: u16,
        mains_connected: bool,
        cycle: u32,
        alarms: &mut AlarmController,
        sink: &mut dyn EventSink,
    ) {
        self.push_sample(raw);
        self.update_state(mains_connected, cycle, alarms, sink);
    }

    pub fn level_volts(&self) -> f32 {
        f32::from(self.mean_raw()) * RAW_BATTERY_MULTIPLIER
    }

    /// Battery voltage in tenths of a volt.
    pub fn level_decivolts(&self) -> u16 {
        // 0.29828125 == 1909 / 6400
        u16::try_from(u32::from(self.mean_raw()) * 1909 / 6400).unwrap_or(u16::MAX)
    }

    pub fn is_very_low(&self) -> bool {
        self.mean_raw() < RAW_VOLTAGE_NOT_STARTING
    }

    pub fn is_deep_discharged(&self) -> bool {
        self.mean_raw() < RAW_VOLTAGE_STOP
    }

    pub fn is_mains_connected(&self) -> bool {
        !self.running_on_battery
    }
}
