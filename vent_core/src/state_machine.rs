//! Cycle state machine driving the breath controller one period at a time.
//!
//! Every running period is exactly one `compute` call: cycle boundaries are
//! handled inside the period that needs them, so a cycle lasts
//! `ticks_per_cycle` periods unless a patient trigger cuts it short.

use crate::alarm_controller::AlarmEffects;
use crate::battery::BatteryMonitor;
use crate::controller::BreathController;
use crate::error::SafetyReason;
use crate::status::TickStatus;

/// While stopped, the stop routine is repeated every this many periods.
const STOP_REFRESH_PERIODS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleState {
    #[default]
    Setup,
    Stopped,
    InitCycle,
    Breath,
    TriggerRaised,
    EndCycle,
}

/// Operator start/stop requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct Activation {
    running: bool,
}

impl Activation {
    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

/// One battery reading taken this period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatterySample {
    pub raw: u16,
    pub mains_connected: bool,
}

/// Result of one period.
#[derive(Debug, Clone, Copy)]
pub struct StepOutcome {
    pub status: TickStatus,
    pub effects: AlarmEffects,
    /// Set when this period forced a stop for safety.
    pub safety: Option<SafetyReason>,
}

#[derive(Debug, Default)]
pub struct CycleStateMachine {
    state: CycleState,
    tick: u32,
    stopped_periods: u32,
    periods: u32,
    activation: Activation,
    battery: BatteryMonitor,
}

impl CycleStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn activation(&self) -> &Activation {
        &self.activation
    }

    pub fn battery(&self) -> &BatteryMonitor {
        &self.battery
    }

    /// Fill the battery window from a reading taken before the first period.
    pub fn prime_battery(&mut self, controller: &mut BreathController, sample: BatterySample) {
        self.battery.prime(sample.raw);
        controller.battery_loop(&mut self.battery, sample.raw, sample.mains_connected);
    }

    /// Request breathing. Refused while the battery is too low to start on.
    pub fn start(&mut self, controller: &mut BreathController) -> bool {
        let accepted = self.battery.is_mains_connected() || !self.battery.is_very_low();
        if accepted {
            self.activation.start();
        } else {
            tracing::warn!(raw = self.battery.mean_raw(), "battery too low to start");
        }
        controller.ack_respiration(self.activation.is_running());
        accepted
    }

    pub fn stop(&mut self, controller: &mut BreathController) {
        self.activation.stop();
        controller.ack_respiration(false);
    }

    /// Run one control period at `now_ms`.
    pub fn on_tick(
        &mut self,
        controller: &mut BreathController,
        now_ms: u64,
        battery: Option<BatterySample>,
    ) -> StepOutcome {
        let mut safety = None;
        if let Some(sample) = battery {
            controller.battery_loop(&mut self.battery, sample.raw, sample.mains_connected);
            if !sample.mains_connected
                && self.battery.is_deep_discharged()
                && self.activation.is_running()
            {
                tracing::error!(raw = self.battery.mean_raw(), "battery deep discharge, stopping");
                self.activation.stop();
                safety = Some(SafetyReason::BatteryDeepDischarge);
            }
        }

        let status = self.advance(controller, now_ms);
        let effects = controller.run_alarm_effects(self.periods, now_ms);
        self.periods = self.periods.wrapping_add(1);
        StepOutcome {
            status,
            effects,
            safety,
        }
    }

    fn enter_stopped(&mut self, controller: &mut BreathController, now_ms: u64) {
        if self.state != CycleState::Setup {
            tracing::info!(cycle = controller.cycle_number(), "breathing stopped");
        }
        self.state = CycleState::Stopped;
        self.stopped_periods = 0;
        controller.stop(now_ms);
    }

    fn advance(&mut self, controller: &mut BreathController, now_ms: u64) -> TickStatus {
        loop {
            match self.state {
                CycleState::Setup => {
                    controller.setup();
                    self.enter_stopped(controller, now_ms);
                    return TickStatus::Stopped;
                }
                CycleState::Stopped => {
                    if self.activation.is_running() {
                        tracing::info!(mode = %controller.next_commands().mode, "breathing started");
                        self.state = CycleState::InitCycle;
                        continue;
                    }
                    self.stopped_periods += 1;
                    if self.stopped_periods % STOP_REFRESH_PERIODS == 0 {
                        controller.stop(now_ms);
                    }
                    return TickStatus::Stopped;
                }
                CycleState::InitCycle => {
                    self.tick = 0;
                    controller.init_respiratory_cycle();
                    self.state = CycleState::Breath;
                }
                CycleState::Breath => {
                    if !self.activation.is_running() {
                        self.enter_stopped(controller, now_ms);
                        return TickStatus::Stopped;
                    }
                    if self.tick >= controller.ticks_per_cycle() {
                        self.state = CycleState::EndCycle;
                        continue;
                    }
                    controller.compute(self.tick);
                    let tick = self.tick;
                    self.tick += 1;
                    let cycle = controller.cycle_number();
                    if controller.triggered() {
                        tracing::debug!(cycle, tick, "patient trigger");
                        self.state = CycleState::TriggerRaised;
                        return TickStatus::Triggered { cycle };
                    }
                    if self.tick >= controller.ticks_per_cycle() {
                        self.state = CycleState::EndCycle;
                        continue;
                    }
                    return TickStatus::Breathing {
                        cycle,
                        phase: controller.phase(),
                        tick,
                    };
                }
                CycleState::TriggerRaised => {
                    // A triggered breath has no end-of-cycle evaluation.
                    if self.activation.is_running() {
                        self.state = CycleState::InitCycle;
                    } else {
                        self.enter_stopped(controller, now_ms);
                        return TickStatus::Stopped;
                    }
                }
                CycleState::EndCycle => {
                    controller.end_respiratory_cycle(now_ms);
                    let cycle = controller.cycle_number();
                    if self.activation.is_running() {
                        self.state = CycleState::InitCycle;
                    } else {
                        self.enter_stopped(controller, now_ms);
                    }
                    return TickStatus::CycleEnded { cycle };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> (CycleStateMachine, BreathController) {
        let mut sm = CycleStateMachine::new();
        let mut c = BreathController::default();
        assert_eq!(sm.on_tick(&mut c, 0, None).status, TickStatus::Stopped);
        assert!(sm.start(&mut c));
        (sm, c)
    }

    #[test]
    fn setup_then_stopped_until_started() {
        let mut sm = CycleStateMachine::new();
        let mut c = BreathController::default();
        for now in 0..5 {
            assert_eq!(sm.on_tick(&mut c, now * 10, None).status, TickStatus::Stopped);
        }
        assert_eq!(sm.state(), CycleState::Stopped);
        assert!(c.blower().is_stopped());
    }

    #[test]
    fn full_cycle_takes_ticks_per_cycle_periods() {
        let (mut sm, mut c) = started();
        let mut now = 0;
        let mut ended = None;
        for period in 0..300u32 {
            now += 10;
            let out = sm.on_tick(&mut c, now, None);
            if let TickStatus::CycleEnded { cycle } = out.status {
                ended = Some((period, cycle));
                break;
            }
        }
        assert_eq!(ended, Some((299, 1)));
        assert_eq!(sm.state(), CycleState::InitCycle);
    }

    #[test]
    fn stop_mid_breath_reaches_safety_position() {
        let (mut sm, mut c) = started();
        for now in 1..20 {
            sm.on_tick(&mut c, now * 10, None);
        }
        sm.stop(&mut c);
        assert_eq!(sm.on_tick(&mut c, 200, None).status, TickStatus::Stopped);
        assert_eq!(c.inspiratory_valve().position(), Some(crate::params::VALVE_OPEN_STATE));
        assert_eq!(c.expiratory_valve().position(), Some(crate::params::VALVE_OPEN_STATE));
        assert!(c.blower().is_stopped());
    }

    #[test]
    fn deep_discharge_on_battery_forces_stop() {
        let (mut sm, mut c) = started();
        sm.on_tick(&mut c, 10, None);
        let sample = BatterySample {
            raw: 600,
            mains_connected: false,
        };
        let mut safety = None;
        for now in 2..30 {
            let out = sm.on_tick(&mut c, now * 10, Some(sample));
            safety = safety.or(out.safety);
        }
        assert_eq!(safety, Some(SafetyReason::BatteryDeepDischarge));
        assert!(!sm.activation().is_running());
        assert_eq!(sm.state(), CycleState::Stopped);
    }

    #[test]
    fn primed_low_battery_refuses_start_immediately() {
        let mut sm = CycleStateMachine::new();
        let mut c = BreathController::default();
        sm.prime_battery(
            &mut c,
            BatterySample {
                raw: 700,
                mains_connected: false,
            },
        );
        assert_eq!(sm.battery().mean_raw(), 700);
        assert!(!sm.start(&mut c));
    }

    #[test]
    fn very_low_battery_refuses_start() {
        let mut sm = CycleStateMachine::new();
        let mut c = BreathController::default();
        let sample = BatterySample {
            raw: 720,
            mains_connected: false,
        };
        for now in 0..25 {
            sm.on_tick(&mut c, now * 10, Some(sample));
        }
        assert!(!sm.start(&mut c));
        assert!(!sm.activation().is_running());
    }
}
