//! Test and helper mocks for vent_core.
//!
//! Every mock keeps its state behind an `Arc<Mutex<_>>` so a clone handed to
//! the ventilator can be inspected from the test afterwards.

use std::error::Error;
use std::sync::{Arc, Mutex, MutexGuard};

use vent_traits::{Led, Tone};

use crate::commands::SettingId;
use crate::events::{AlarmTrap, DataSnapshot, EventSink, MachineStateSnapshot, StoppedSnapshot};

type SeamResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Recorded {
    traps: Vec<AlarmTrap>,
    data: Vec<DataSnapshot>,
    machine_states: Vec<MachineStateSnapshot>,
    stopped: usize,
    acks: Vec<(SettingId, u32)>,
}

/// Event sink that records everything it receives.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingSink {
    pub fn traps(&self) -> Vec<AlarmTrap> {
        lock(&self.inner).traps.clone()
    }

    pub fn data(&self) -> Vec<DataSnapshot> {
        lock(&self.inner).data.clone()
    }

    pub fn machine_states(&self) -> Vec<MachineStateSnapshot> {
        lock(&self.inner).machine_states.clone()
    }

    pub fn stopped_count(&self) -> usize {
        lock(&self.inner).stopped
    }

    pub fn acks(&self) -> Vec<(SettingId, u32)> {
        lock(&self.inner).acks.clone()
    }

    /// Codes raised at least once.
    pub fn raised_codes(&self) -> Vec<u8> {
        let mut codes: Vec<u8> = lock(&self.inner)
            .traps
            .iter()
            .filter(|t| t.triggered)
            .map(|t| t.code)
            .collect();
        codes.sort_unstable();
        codes.dedup();
        codes
    }
}

impl EventSink for RecordingSink {
    fn alarm_trap(&mut self, trap: &AlarmTrap) {
        lock(&self.inner).traps.push(*trap);
    }

    fn data_snapshot(&mut self, snapshot: &DataSnapshot) {
        lock(&self.inner).data.push(*snapshot);
    }

    fn machine_state(&mut self, snapshot: &MachineStateSnapshot) {
        lock(&self.inner).machine_states.push(*snapshot);
    }

    fn stopped(&mut self, _snapshot: &StoppedSnapshot) {
        lock(&self.inner).stopped += 1;
    }

    fn control_ack(&mut self, setting: SettingId, value: u32) {
        lock(&self.inner).acks.push((setting, value));
    }
}

/// Pressure sensor returning a fixed raw count, or failing once told to.
#[derive(Debug, Default, Clone)]
pub struct FixedPressureSensor {
    state: Arc<Mutex<(u32, bool)>>,
}

impl FixedPressureSensor {
    pub fn new(raw: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new((raw, false))),
        }
    }

    pub fn set_raw(&self, raw: u32) {
        lock(&self.state).0 = raw;
    }

    pub fn fail(&self) {
        lock(&self.state).1 = true;
    }
}

impl vent_traits::PressureSensor for FixedPressureSensor {
    fn read_raw(&mut self, _timeout: std::time::Duration) -> SeamResult<u32> {
        let (raw, failing) = *lock(&self.state);
        if failing {
            return Err(Box::new(std::io::Error::other("pressure sensor timeout")));
        }
        Ok(raw)
    }
}

/// Valve recording every aperture it is asked for.
#[derive(Debug, Default, Clone)]
pub struct SpyValve {
    applied: Arc<Mutex<Vec<u16>>>,
    failing: Arc<Mutex<bool>>,
}

impl SpyValve {
    pub fn applied(&self) -> Vec<u16> {
        lock(&self.applied).clone()
    }

    pub fn last(&self) -> Option<u16> {
        lock(&self.applied).last().copied()
    }

    pub fn fail(&self) {
        *lock(&self.failing) = true;
    }
}

impl vent_traits::ValveActuator for SpyValve {
    fn apply_aperture(&mut self, aperture: u16) -> SeamResult<()> {
        if *lock(&self.failing) {
            return Err(Box::new(std::io::Error::other("valve driver not responding")));
        }
        lock(&self.applied).push(aperture);
        Ok(())
    }
}

/// Blower command as seen by [`SpyBlower`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlowerCall {
    Run(u16),
    Stop,
}

#[derive(Debug, Default, Clone)]
pub struct SpyBlower {
    calls: Arc<Mutex<Vec<BlowerCall>>>,
}

impl SpyBlower {
    pub fn calls(&self) -> Vec<BlowerCall> {
        lock(&self.calls).clone()
    }

    pub fn last(&self) -> Option<BlowerCall> {
        lock(&self.calls).last().copied()
    }
}

impl vent_traits::BlowerActuator for SpyBlower {
    fn run_speed(&mut self, speed: u16) -> SeamResult<()> {
        lock(&self.calls).push(BlowerCall::Run(speed));
        Ok(())
    }

    fn stop(&mut self) -> SeamResult<()> {
        lock(&self.calls).push(BlowerCall::Stop);
        Ok(())
    }
}

/// Flow sensor with settable readings that counts volume resets.
#[derive(Debug, Default, Clone)]
pub struct FixedFlowSensor {
    state: Arc<Mutex<FlowState>>,
}

#[derive(Debug, Default)]
struct FlowState {
    inspiratory: i32,
    expiratory: i32,
    volume: i32,
    resets: usize,
}

impl FixedFlowSensor {
    pub fn set(&self, inspiratory: i32, expiratory: i32, volume: i32) {
        let mut s = lock(&self.state);
        s.inspiratory = inspiratory;
        s.expiratory = expiratory;
        s.volume = volume;
    }

    pub fn resets(&self) -> usize {
        lock(&self.state).resets
    }
}

impl vent_traits::FlowSensor for FixedFlowSensor {
    fn read_inspiratory_flow(&mut self) -> SeamResult<i32> {
        Ok(lock(&self.state).inspiratory)
    }

    fn read_expiratory_flow(&mut self) -> SeamResult<i32> {
        Ok(lock(&self.state).expiratory)
    }

    fn delivered_volume(&mut self) -> SeamResult<i32> {
        Ok(lock(&self.state).volume)
    }

    fn reset_volume(&mut self) -> SeamResult<()> {
        let mut s = lock(&self.state);
        s.volume = 0;
        s.resets += 1;
        Ok(())
    }
}

/// Battery input with a settable raw level and mains flag.
#[derive(Debug, Clone)]
pub struct FixedBattery {
    state: Arc<Mutex<(u16, bool)>>,
}

impl FixedBattery {
    pub fn new(raw: u16, mains_connected: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new((raw, mains_connected))),
        }
    }

    pub fn set(&self, raw: u16, mains_connected: bool) {
        *lock(&self.state) = (raw, mains_connected);
    }
}

impl vent_traits::BatterySensor for FixedBattery {
    fn read_raw(&mut self) -> SeamResult<u16> {
        Ok(lock(&self.state).0)
    }

    fn mains_connected(&mut self) -> SeamResult<bool> {
        Ok(lock(&self.state).1)
    }
}

/// Indicators keeping the latest LED states and buzzer tone.
#[derive(Debug, Default, Clone)]
pub struct SpyIndicators {
    state: Arc<Mutex<IndicatorState>>,
}

#[derive(Debug, Default)]
struct IndicatorState {
    red: bool,
    yellow: bool,
    green: bool,
    tones: Vec<Tone>,
}

impl SpyIndicators {
    pub fn led(&self, led: Led) -> bool {
        let s = lock(&self.state);
        match led {
            Led::Red => s.red,
            Led::Yellow => s.yellow,
            Led::Green => s.green,
        }
    }

    pub fn tones(&self) -> Vec<Tone> {
        lock(&self.state).tones.clone()
    }
}

impl vent_traits::Indicators for SpyIndicators {
    fn set_led(&mut self, led: Led, on: bool) -> SeamResult<()> {
        let mut s = lock(&self.state);
        match led {
            Led::Red => s.red = on,
            Led::Yellow => s.yellow = on,
            Led::Green => s.green = on,
        }
        Ok(())
    }

    fn buzzer(&mut self, tone: Tone) -> SeamResult<()> {
        lock(&self.state).tones.push(tone);
        Ok(())
    }
}
