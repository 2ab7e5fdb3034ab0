//! Breath-cycle controller.
//!
//! Owns the double-buffered commands, the live measures, both valves and the
//! blower, the table of mode controllers and the alarm controller. One call to
//! [`BreathController::compute`] is one control period of the running cycle.
//!
//! Cycle lifecycle:
//! 1. `init_respiratory_cycle` commits the next commands, switches mode if
//!    asked, and recomputes the cycle timing.
//! 2. `compute(tick)` for each tick, until the cycle ends or a breath is
//!    triggered.
//! 3. `end_respiratory_cycle` derives the cycle measures and evaluates the
//!    cycle alarms. A triggered breath skips this step.

use crate::alarm::codes;
use crate::alarm_controller::{AlarmController, AlarmEffects};
use crate::battery::BatteryMonitor;
use crate::blower::Blower;
use crate::commands::{
    AlarmBounds, CommandSet, Commands, MAX_MINUTE_VOLUME_BOUND, MAX_RESPIRATORY_RATE_BOUND,
    MAX_TIDAL_VOLUME_BOUND, SettingCommand, SettingId, VentilationMode,
};
use crate::config::{AlarmCfg, ControllerCfg};
use crate::cycle::{Cycle, CyclePhase};
use crate::events::{DataSnapshot, EventSink, MachineStateSnapshot, NullSink, StoppedSnapshot};
use crate::fixed_point::{saturate_i16, saturate_i32, saturate_u16};
use crate::measures::Measures;
use crate::modes::{BreathingStrategy, ModeContext, ModeController, ModeTable};
use crate::params::*;
use crate::ring::RingBuffer;
use crate::util::{MICROS_PER_SEC, period_ms};
use crate::valve::Valve;

/// Fixed-width telemetry value standing for an unknown pressure.
pub const UNKNOWN_PRESSURE: i16 = i16::MIN;
/// Delivered volumes above this are reported as unknown.
const MAX_READABLE_VOLUME_ML: i32 = 0xFFFE;
/// PEEP counts as detected when the recent samples span less than this.
const PEEP_STABLE_SPAN: i16 = 5;
/// ...and sit this close to the PEEP command.
const PEEP_DETECTION_WINDOW: i32 = 30;

/// Alarms only meaningful while breathing; cleared on stop.
const BREATHING_ALARMS: [u8; 7] = [
    codes::PLATEAU_NOT_REACHED,
    codes::PATIENT_UNPLUGGED,
    codes::PEEP_NOT_REACHED,
    codes::PLATEAU_NOT_REACHED_MEDIUM,
    codes::PEEP_NOT_REACHED_MEDIUM,
    codes::PRESSURE_TOO_HIGH,
    codes::PATIENT_UNPLUGGED_MEDIUM,
];

const VOLUME_ALARMS: [u8; 7] = [
    codes::INSPIRATORY_MINUTE_VOLUME_LOW,
    codes::INSPIRATORY_MINUTE_VOLUME_HIGH,
    codes::EXPIRATORY_MINUTE_VOLUME_LOW,
    codes::EXPIRATORY_MINUTE_VOLUME_HIGH,
    codes::LEAK_HIGH,
    codes::TIDAL_VOLUME_LOW,
    codes::TIDAL_VOLUME_HIGH,
];

pub struct BreathController {
    period_us: u32,
    thresholds: AlarmCfg,
    commands: CommandSet,
    active_mode: VentilationMode,
    modes: ModeTable,
    cycle: Cycle,
    measures: Measures,
    inspiratory_valve: Valve,
    expiratory_valve: Valve,
    blower: Blower,
    alarms: AlarmController,
    sink: Box<dyn EventSink + Send>,
    pressure_sum: i64,
    pressure_count: u32,
    plateau_sum: i64,
    plateau_count: u32,
    tidal_volume_read: bool,
    volume_reset_pending: bool,
    expiratory_volume_ul: i64,
    breath_periods: RingBuffer<u32, BREATH_PERIODS>,
    last_end_of_cycle_ms: u64,
    inspiration_ms: u32,
    battery_decivolts: u16,
}

impl std::fmt::Debug for BreathController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreathController")
            .field("mode", &self.active_mode)
            .field("cycle", &self.cycle)
            .field("measures", &self.measures)
            .finish_non_exhaustive()
    }
}

impl Default for BreathController {
    fn default() -> Self {
        Self::new(
            &ControllerCfg::default(),
            &AlarmCfg::default(),
            Commands::default(),
            Box::new(NullSink),
        )
    }
}

impl BreathController {
    pub fn new(
        controller: &ControllerCfg,
        alarms: &AlarmCfg,
        initial: Commands,
        sink: Box<dyn EventSink + Send>,
    ) -> Self {
        let period_us = controller.period_us.max(1);
        let inspiratory_valve = Valve::pinch();
        let expiratory_valve = Valve::pinch();
        let modes = ModeTable::new(&inspiratory_valve, &expiratory_valve, period_us);
        let mut alarm_controller = AlarmController::new(alarms.snooze_ms, period_us);
        alarm_controller.update_enabled_alarms(modes.get(initial.mode).enabled_alarms());
        let breath_period_ms = 60_000 / u32::from(initial.cycles_per_minute.max(1));

        let mut this = Self {
            period_us,
            thresholds: alarms.clone(),
            commands: CommandSet::new(initial),
            active_mode: initial.mode,
            modes,
            cycle: Cycle::default(),
            measures: Measures {
                cycles_per_minute: initial.cycles_per_minute,
                dt_us: period_us,
                ..Measures::default()
            },
            inspiratory_valve,
            expiratory_valve,
            blower: Blower::new(),
            alarms: alarm_controller,
            sink,
            pressure_sum: 0,
            pressure_count: 0,
            plateau_sum: 0,
            plateau_count: 0,
            tidal_volume_read: false,
            volume_reset_pending: false,
            expiratory_volume_ul: 0,
            breath_periods: RingBuffer::filled(breath_period_ms),
            last_end_of_cycle_ms: 0,
            inspiration_ms: 0,
            battery_decivolts: 0,
        };
        this.compute_tick_parameters();
        this
    }

    /// Run `f` on the active mode with a context borrowing the rest of the
    /// controller.
    fn with_mode(&mut self, f: impl FnOnce(&mut ModeController, &mut ModeContext<'_>)) {
        let mut ctx = ModeContext {
            commands: self.commands.current(),
            cycle: &mut self.cycle,
            measures: &self.measures,
            inspiratory_valve: &mut self.inspiratory_valve,
            expiratory_valve: &mut self.expiratory_valve,
            blower: &mut self.blower,
            period_us: self.period_us,
        };
        f(self.modes.get_mut(self.active_mode), &mut ctx);
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Put the machine in the safety position and prepare the active mode.
    pub fn setup(&mut self) {
        tracing::info!(mode = %self.active_mode, period_us = self.period_us, "controller setup");
        self.reach_safety_position();
        self.with_mode(|mode, ctx| mode.setup(ctx));
    }

    pub fn init_respiratory_cycle(&mut self) {
        self.cycle.number += 1;
        self.cycle.tick = 0;
        self.cycle.triggered = false;
        self.cycle.peep_detected = false;
        self.measures.plateau_pressure = None;
        self.measures.peak_pressure = 0;
        self.measures.rebounce_peak_pressure = 0;
        self.measures.expiratory_volume_ml = 0;
        self.expiratory_volume_ul = 0;
        self.tidal_volume_read = false;
        self.measures.delivered_volume_ml = 0;
        self.volume_reset_pending = true;

        self.commands.commit();

        let next_mode = self.commands.current().mode;
        if next_mode != self.active_mode {
            tracing::info!(from = %self.active_mode, to = %next_mode, "ventilation mode change");
            self.active_mode = next_mode;
            self.with_mode(|mode, ctx| mode.setup(ctx));
            self.alarms
                .update_enabled_alarms(self.modes.get(next_mode).enabled_alarms());
        }

        self.compute_tick_parameters();
        self.measures.last_pressures.fill(0);
        self.pressure_sum = 0;
        self.pressure_count = 0;
        self.plateau_sum = 0;
        self.plateau_count = 0;
        self.update_phase();

        self.with_mode(|mode, ctx| mode.init_cycle(ctx));
        tracing::debug!(
            cycle = self.cycle.number,
            mode = %self.active_mode,
            ticks_per_cycle = self.cycle.ticks_per_cycle,
            ticks_per_inhalation = self.cycle.ticks_per_inhalation,
            "cycle start"
        );
    }

    /// One control period of the running cycle.
    pub fn compute(&mut self, tick: u32) {
        self.cycle.tick = tick;
        self.update_phase();

        let pressure = self.measures.pressure;
        self.pressure_sum += i64::from(pressure);
        self.pressure_count += 1;

        match self.cycle.phase {
            CyclePhase::Inhalation => self.inhale(),
            CyclePhase::Exhalation => self.exhale(),
        }

        self.alarms
            .update_core_data(tick, pressure, self.cycle.phase, self.cycle.number);
        self.sink.data_snapshot(&DataSnapshot {
            tick,
            pressure: pressure.max(0),
            phase: self.cycle.phase,
            inspiratory_valve: self.inspiratory_valve.position().unwrap_or(VALVE_CLOSED_STATE),
            expiratory_valve: self.expiratory_valve.position().unwrap_or(VALVE_CLOSED_STATE),
            blower_speed: self.blower.speed(),
            battery_decivolts: self.battery_decivolts,
            inspiratory_flow: self.measures.inspiratory_flow,
            expiratory_flow: self.measures.expiratory_flow,
        });

        self.execute_commands();

        // Read once the inspiratory valve had time to close.
        let read_at = self.cycle.ticks_per_inhalation
            + TIDAL_VOLUME_READ_DELAY_MS / period_ms(self.period_us);
        if tick > read_at && !self.tidal_volume_read {
            self.tidal_volume_read = true;
            let volume = self.measures.delivered_volume_ml;
            self.measures.tidal_volume_ml = if (0..=MAX_READABLE_VOLUME_ML).contains(&volume) {
                u16::try_from(volume).ok()
            } else {
                None
            };
        }
    }

    fn inhale(&mut self) {
        self.with_mode(|mode, ctx| mode.inhale(ctx));

        let pressure = self.measures.pressure;
        if pressure > self.measures.peak_pressure {
            self.measures.peak_pressure = pressure.max(0);
            self.measures.rebounce_peak_pressure = pressure;
        } else if pressure < self.measures.rebounce_peak_pressure {
            self.measures.rebounce_peak_pressure = pressure;
        }

        let window = PLATEAU_WINDOW_MS / period_ms(self.period_us);
        if self.cycle.tick > self.cycle.ticks_per_inhalation.saturating_sub(window) {
            self.plateau_sum += i64::from(pressure);
            self.plateau_count += 1;
        }
    }

    fn exhale(&mut self) {
        self.with_mode(|mode, ctx| mode.exhale(ctx));

        let recent = &self.measures.last_pressures;
        let span = recent.max().saturating_sub(recent.min());
        let pressure = self.measures.pressure;
        let peep_command = i32::from(self.commands.current().peep);
        if span < PEEP_STABLE_SPAN && (i32::from(pressure) - peep_command).abs() < PEEP_DETECTION_WINDOW
        {
            if !self.cycle.peep_detected {
                tracing::trace!(tick = self.cycle.tick, pressure, "peep detected");
            }
            self.cycle.peep_detected = true;
            self.measures.peep = saturate_i16(saturate_i32(recent.mean())).max(0);
        }
        if !self.cycle.peep_detected {
            self.measures.peep = pressure.max(0);
        }

        // flow (mL/min) * dt (µs) / 60e6 -> mL, accumulated in µL
        self.expiratory_volume_ul +=
            i64::from(self.measures.expiratory_flow) * i64::from(self.measures.dt_us) / 60_000;
        self.measures.expiratory_volume_ml = saturate_i32(self.expiratory_volume_ul / 1000);
    }

    /// Finish the cycle at `now_ms`: rate, plateau, cycle alarms and the
    /// machine-state snapshot.
    pub fn end_respiratory_cycle(&mut self, now_ms: u64) {
        let period = u32::try_from(now_ms.saturating_sub(self.last_end_of_cycle_ms)).unwrap_or(u32::MAX);
        self.breath_periods.push(period);
        let sum = self.breath_periods.sum().max(1);
        let periods = i64::try_from(BREATH_PERIODS).unwrap_or(i64::MAX);
        self.measures.cycles_per_minute = saturate_u16((periods * 60_000 + sum - 1) / sum);
        self.last_end_of_cycle_ms = now_ms;

        self.measures.plateau_pressure = if self.plateau_count == 0 {
            None
        } else {
            let mean = (self.plateau_sum / i64::from(self.plateau_count)).max(0);
            let plateau = saturate_i16(saturate_i32(mean));
            let delta = (i32::from(plateau) - i32::from(self.measures.peep)).abs();
            (delta >= i32::from(PLATEAU_PEEP_MIN_DELTA)).then_some(plateau)
        };

        self.check_cycle_alarms();

        let snapshot = MachineStateSnapshot {
            cycle: self.cycle.number,
            next: *self.commands.next(),
            peak_pressure: self.measures.peak_pressure,
            plateau_pressure: self.measures.plateau_pressure,
            peep: self.measures.peep,
            triggered_alarms: self.alarms.triggered_alarms(),
            tidal_volume_ml: self.measures.tidal_volume_ml,
            cycles_per_minute: self.measures.cycles_per_minute,
            expiratory_volume_ml: self.measures.expiratory_volume_ml,
            snoozed: self.alarms.is_snoozed(),
        };
        self.sink.machine_state(&snapshot);
        tracing::debug!(
            cycle = snapshot.cycle,
            peak = snapshot.peak_pressure,
            plateau = ?snapshot.plateau_pressure,
            peep = snapshot.peep,
            cpm = snapshot.cycles_per_minute,
            "cycle end"
        );

        self.with_mode(|mode, ctx| mode.end_cycle(ctx));
    }

    fn check_alarm(&mut self, code: u8, detected: bool, expected: i64, measured: i64) {
        if detected {
            self.alarms.detected_alarm(
                code,
                self.cycle.number,
                saturate_i32(expected),
                saturate_i32(measured),
                self.sink.as_mut(),
            );
        } else {
            self.alarms.not_detected_alarm(code, self.sink.as_mut());
        }
    }

    fn check_cycle_alarms(&mut self) {
        let commands = *self.commands.current();
        let thresholds = self.thresholds.clone();

        let plateau_command = i64::from(commands.plateau_pressure);
        let tolerance = i64::from(thresholds.plateau_tolerance_percent);
        let plateau_min = plateau_command * (100 - tolerance) / 100;
        let plateau_max = plateau_command * (100 + tolerance) / 100;
        let plateau = self.measures.plateau_pressure.map(i64::from);
        let plateau_missed = plateau.is_none_or(|p| p < plateau_min || p > plateau_max);
        let plateau_measured = plateau.unwrap_or_else(|| i64::from(self.measures.pressure));
        for code in [codes::PLATEAU_NOT_REACHED, codes::PLATEAU_NOT_REACHED_MEDIUM] {
            self.check_alarm(code, plateau_missed, plateau_command, plateau_measured);
        }

        let mean = self.pressure_sum / i64::from(self.pressure_count.max(1));
        let min_mean = i64::from(thresholds.min_mean_pressure_mmh2o);
        for code in [codes::PATIENT_UNPLUGGED, codes::PATIENT_UNPLUGGED_MEDIUM] {
            self.check_alarm(code, mean <= min_mean, min_mean, mean);
        }

        let peep_command = i64::from(commands.peep);
        let peep = i64::from(self.measures.peep);
        let peep_tolerance = i64::from(thresholds.peep_tolerance_mmh2o);
        let peep_missed = peep < peep_command - peep_tolerance || peep > peep_command + peep_tolerance;
        for code in [codes::PEEP_NOT_REACHED, codes::PEEP_NOT_REACHED_MEDIUM] {
            self.check_alarm(code, peep_missed, peep_command, peep);
        }

        self.check_volume_alarms(&commands.alarm_bounds);
    }

    fn check_volume_alarms(&mut self, bounds: &AlarmBounds) {
        let rate = i64::from(self.measures.cycles_per_minute);
        let (rate_low, rate_high) = (
            i64::from(bounds.respiratory_rate_low),
            i64::from(bounds.respiratory_rate_high),
        );
        self.check_alarm(codes::RESPIRATORY_RATE_LOW, rate < rate_low, rate_low, rate);
        self.check_alarm(codes::RESPIRATORY_RATE_HIGH, rate > rate_high, rate_high, rate);

        // Without a tidal volume reading there is no flow sensor to judge by.
        let Some(tidal) = self.measures.tidal_volume_ml.map(i64::from) else {
            for code in VOLUME_ALARMS {
                self.alarms.not_detected_alarm(code, self.sink.as_mut());
            }
            return;
        };
        let expiratory = i64::from(self.measures.expiratory_volume_ml);

        let inspiratory_minute = tidal * rate;
        let (low, high) = (
            i64::from(bounds.inspiratory_minute_volume_low),
            i64::from(bounds.inspiratory_minute_volume_high),
        );
        self.check_alarm(codes::INSPIRATORY_MINUTE_VOLUME_LOW, inspiratory_minute < low, low, inspiratory_minute);
        self.check_alarm(codes::INSPIRATORY_MINUTE_VOLUME_HIGH, inspiratory_minute > high, high, inspiratory_minute);

        let expiratory_minute = expiratory * rate;
        let (low, high) = (
            i64::from(bounds.expiratory_minute_volume_low),
            i64::from(bounds.expiratory_minute_volume_high),
        );
        self.check_alarm(codes::EXPIRATORY_MINUTE_VOLUME_LOW, expiratory_minute < low, low, expiratory_minute);
        self.check_alarm(codes::EXPIRATORY_MINUTE_VOLUME_HIGH, expiratory_minute > high, high, expiratory_minute);

        let leak = (tidal - expiratory).max(0) * rate;
        let leak_max = i64::from(bounds.leak_max);
        self.check_alarm(codes::LEAK_HIGH, leak > leak_max, leak_max, leak);

        let (low, high) = (i64::from(bounds.tidal_volume_low), i64::from(bounds.tidal_volume_high));
        self.check_alarm(codes::TIDAL_VOLUME_LOW, tidal < low, low, tidal);
        self.check_alarm(codes::TIDAL_VOLUME_HIGH, tidal > high, high, tidal);
    }

    /// Vent on overpressure, then commit both valves and advance the blower ramp.
    fn execute_commands(&mut self) {
        let pressure = self.measures.pressure;
        let max_pressure = self.thresholds.max_pressure_mmh2o;
        if pressure > max_pressure {
            self.inspiratory_valve.close();
            self.expiratory_valve.open();
            if !self.alarms.is_triggered(codes::PRESSURE_TOO_HIGH) {
                tracing::warn!(pressure, max_pressure, "overpressure, venting");
            }
            self.alarms.detected_alarm(
                codes::PRESSURE_TOO_HIGH,
                self.cycle.number,
                i32::from(max_pressure),
                i32::from(pressure),
                self.sink.as_mut(),
            );
        } else {
            self.alarms
                .not_detected_alarm(codes::PRESSURE_TOO_HIGH, self.sink.as_mut());
        }
        self.inspiratory_valve.execute();
        self.expiratory_valve.execute();
        self.blower.execute(self.measures.dt_us);
    }

    pub fn update_phase(&mut self) {
        let commands = self.commands.current();
        if self.cycle.tick < self.cycle.ticks_per_inhalation {
            self.cycle.phase = CyclePhase::Inhalation;
            self.measures.pressure_command = commands.plateau_pressure;
        } else {
            self.cycle.phase = CyclePhase::Exhalation;
            self.measures.pressure_command = commands.peep;
        }
    }

    /// Open both valves and commit.
    pub fn reach_safety_position(&mut self) {
        self.inspiratory_valve.open();
        self.expiratory_valve.open();
        self.execute_commands();
    }

    pub fn stop(&mut self, now_ms: u64) {
        self.blower.stop();
        self.sink.stopped(&StoppedSnapshot {
            next: *self.commands.next(),
            snoozed: self.alarms.is_snoozed(),
        });
        self.reach_safety_position();
        self.last_end_of_cycle_ms = now_ms;
        for code in BREATHING_ALARMS {
            self.alarms.not_detected_alarm(code, self.sink.as_mut());
        }
    }

    /// Inspiration and cycle length from the current rate and I:E ratio.
    pub fn compute_tick_parameters(&mut self) {
        let commands = self.commands.current();
        let cpm = u32::from(commands.cycles_per_minute.max(1));
        let expiratory_term = u32::from(commands.expiratory_term);
        // 1000 * 10 / (10 + E) * 60 / cpm, in ms
        self.inspiration_ms = ((10_000 / (10 + expiratory_term)) * 60) / cpm;
        self.cycle.ticks_per_cycle = 60 * (MICROS_PER_SEC / self.period_us) / cpm;
        self.cycle.ticks_per_inhalation =
            u32::try_from(u64::from(self.inspiration_ms) * u64::from(MICROS_PER_SEC) / u64::from(self.period_us) / 1000)
                .unwrap_or(u32::MAX);
    }

    // ── Sensor inputs ───────────────────────────────────────────────────────

    pub fn update_pressure(&mut self, pressure: i16) {
        self.measures.pressure = pressure;
        self.measures.last_pressures.push(pressure);
    }

    pub fn update_inspiratory_flow(&mut self, flow: i32) {
        if flow != MASS_FLOW_ERROR_VALUE {
            self.measures.inspiratory_flow = flow;
        }
    }

    pub fn update_expiratory_flow(&mut self, flow: i32) {
        if flow != MASS_FLOW_ERROR_VALUE {
            self.measures.expiratory_flow = flow;
        }
    }

    pub fn update_delivered_volume(&mut self, volume_ml: i32) {
        if volume_ml != MASS_FLOW_ERROR_VALUE {
            self.measures.delivered_volume_ml = volume_ml;
        }
    }

    /// True once per cycle start: the flow sensor's volume integrator
    /// should be zeroed.
    pub fn take_volume_reset(&mut self) -> bool {
        std::mem::take(&mut self.volume_reset_pending)
    }

    pub fn update_dt(&mut self, dt_us: u32) {
        self.measures.dt_us = dt_us;
    }

    /// Battery level shown in data snapshots.
    pub fn update_battery_level(&mut self, decivolts: u16) {
        self.battery_decivolts = decivolts;
    }

    // ── Alarms ──────────────────────────────────────────────────────────────

    pub fn run_alarm_effects(&mut self, tick: u32, now_ms: u64) -> AlarmEffects {
        self.alarms.run_alarm_effects(tick, now_ms, self.sink.as_mut())
    }

    /// Feed one battery sample and re-evaluate the power alarms.
    pub fn battery_loop(&mut self, battery: &mut BatteryMonitor, raw: u16, mains_connected: bool) {
        battery.battery_loop(raw, mains_connected, self.cycle.number, &mut self.alarms, self.sink.as_mut());
        self.battery_decivolts = battery.level_decivolts();
    }

    pub fn snooze(&mut self, now_ms: u64) {
        self.alarms.snooze(now_ms, self.sink.as_mut());
    }

    pub fn unsnooze(&mut self) {
        self.alarms.unsnooze(self.sink.as_mut());
    }

    /// Acknowledge a start/stop request.
    pub fn ack_respiration(&mut self, running: bool) {
        self.sink.control_ack(SettingId::Respiration, u32::from(running));
    }

    // ── Setters (write next commands) ──────────────────────────────────────

    fn ack(&mut self, setting: SettingId, value: i64) {
        let value = u32::try_from(value.max(0)).unwrap_or(u32::MAX);
        tracing::debug!(setting = ?setting, value, "setting acknowledged");
        self.sink.control_ack(setting, value);
    }

    fn next_mut(&mut self) -> &mut Commands {
        self.commands.next_mut()
    }

    pub fn on_cycle_increase(&mut self) {
        let next = self.next_mut();
        next.cycles_per_minute = (next.cycles_per_minute + 1).min(MAX_CYCLES_PER_MINUTE);
        let v = next.cycles_per_minute;
        self.ack(SettingId::CyclesPerMinute, i64::from(v));
    }

    pub fn on_cycle_decrease(&mut self) {
        let next = self.next_mut();
        next.cycles_per_minute = next
            .cycles_per_minute
            .saturating_sub(1)
            .max(MIN_CYCLES_PER_MINUTE);
        let v = next.cycles_per_minute;
        self.ack(SettingId::CyclesPerMinute, i64::from(v));
    }

    pub fn on_cycle_set(&mut self, cpm: u16) {
        let v = cpm.clamp(MIN_CYCLES_PER_MINUTE, MAX_CYCLES_PER_MINUTE);
        self.next_mut().cycles_per_minute = v;
        self.ack(SettingId::CyclesPerMinute, i64::from(v));
    }

    pub fn on_peep_increase(&mut self) {
        let next = self.next_mut();
        if next.peep + 10 < next.plateau_pressure {
            next.peep += 10;
        }
        next.peep = next.peep.min(MAX_PEEP_PRESSURE);
        let v = next.peep;
        self.ack(SettingId::Peep, i64::from(v));
    }

    pub fn on_peep_decrease(&mut self) {
        let next = self.next_mut();
        if next.peep >= 10 {
            next.peep -= 10;
        }
        next.peep = next.peep.max(MIN_PEEP_PRESSURE);
        let v = next.peep;
        self.ack(SettingId::Peep, i64::from(v));
    }

    pub fn on_peep_set(&mut self, peep: i16) {
        let v = peep.clamp(MIN_PEEP_PRESSURE, MAX_PEEP_PRESSURE);
        self.next_mut().peep = v;
        self.ack(SettingId::Peep, i64::from(v));
    }

    pub fn on_plateau_increase(&mut self) {
        let next = self.next_mut();
        next.plateau_pressure = (next.plateau_pressure + 10).min(MAX_PLATEAU_PRESSURE);
        if next.plateau_pressure > next.peak_pressure {
            next.peak_pressure = next.plateau_pressure;
        }
        let v = next.plateau_pressure;
        self.ack(SettingId::PlateauPressure, i64::from(v));
    }

    pub fn on_plateau_decrease(&mut self) {
        let next = self.next_mut();
        if next.plateau_pressure - 10 > next.peep {
            next.plateau_pressure -= 10;
        }
        next.plateau_pressure = next.plateau_pressure.max(MIN_PLATEAU_PRESSURE);
        let v = next.plateau_pressure;
        self.ack(SettingId::PlateauPressure, i64::from(v));
    }

    pub fn on_plateau_set(&mut self, plateau: i16) {
        let v = plateau.clamp(MIN_PLATEAU_PRESSURE, MAX_PLATEAU_PRESSURE);
        self.next_mut().plateau_pressure = v;
        self.ack(SettingId::PlateauPressure, i64::from(v));
    }

    pub fn on_peak_increase(&mut self) {
        let next = self.next_mut();
        next.peak_pressure = (next.peak_pressure + 10).min(MAX_PEAK_PRESSURE);
        let v = next.peak_pressure;
        self.ack(SettingId::PeakPressure, i64::from(v));
    }

    pub fn on_peak_decrease(&mut self) {
        let next = self.next_mut();
        next.peak_pressure = (next.peak_pressure - 10).max(MIN_PEAK_PRESSURE);
        let v = next.peak_pressure;
        self.ack(SettingId::PeakPressure, i64::from(v));
    }

    pub fn on_peak_set(&mut self, peak: i16) {
        let v = peak.clamp(MIN_PEAK_PRESSURE, MAX_PEAK_PRESSURE);
        self.next_mut().peak_pressure = v;
        self.ack(SettingId::PeakPressure, i64::from(v));
    }

    pub fn on_expiratory_term_set(&mut self, term: u16) {
        let v = term.clamp(MIN_EXPIRATORY_TERM, MAX_EXPIRATORY_TERM);
        self.next_mut().expiratory_term = v;
        self.ack(SettingId::ExpiratoryTerm, i64::from(v));
    }

    /// Only 0 and 1 are accepted; anything else leaves the setting unchanged.
    pub fn on_trigger_mode_enabled_set(&mut self, enabled: u16) {
        match enabled {
            0 => self.next_mut().trigger_enabled = false,
            1 => self.next_mut().trigger_enabled = true,
            other => tracing::warn!(value = other, "invalid trigger enable value ignored"),
        }
        let v = self.commands.next().trigger_enabled;
        self.ack(SettingId::TriggerEnabled, i64::from(v));
    }

    pub fn on_trigger_offset_set(&mut self, offset: i16) {
        let v = offset.clamp(MIN_TRIGGER_OFFSET, MAX_TRIGGER_OFFSET);
        self.next_mut().trigger_offset = v;
        self.ack(SettingId::TriggerOffset, i64::from(v));
    }

    pub fn on_tidal_volume_set(&mut self, volume_ml: u16) {
        let v = volume_ml.clamp(MIN_TIDAL_VOLUME_ML, MAX_TIDAL_VOLUME_ML);
        self.next_mut().tidal_volume_ml = v;
        self.ack(SettingId::TidalVolume, i64::from(v));
    }

    pub fn on_plateau_duration_set(&mut self, duration_ms: u16) {
        let v = duration_ms.clamp(MIN_PLATEAU_DURATION_MS, MAX_PLATEAU_DURATION_MS);
        self.next_mut().plateau_duration_ms = v;
        self.ack(SettingId::PlateauDuration, i64::from(v));
    }

    pub fn on_ti_min_set(&mut self, ti_min_ms: u16) {
        let v = ti_min_ms.clamp(MIN_TI_MIN_MS, MAX_TI_MIN_MS);
        self.next_mut().ti_min_ms = v;
        self.ack(SettingId::TiMin, i64::from(v));
    }

    pub fn on_expiratory_trigger_flow_set(&mut self, percent: u16) {
        let v = percent.clamp(
            MIN_EXPIRATORY_TRIGGER_FLOW_PERCENT,
            MAX_EXPIRATORY_TRIGGER_FLOW_PERCENT,
        );
        self.next_mut().expiratory_trigger_flow_percent = v;
        self.ack(SettingId::ExpiratoryTriggerFlow, i64::from(v));
    }

    pub fn on_target_inspiratory_flow_set(&mut self, lpm: u16) {
        let v = lpm.clamp(MIN_TARGET_INSPIRATORY_FLOW_LPM, MAX_TARGET_INSPIRATORY_FLOW_LPM);
        self.next_mut().target_inspiratory_flow_lpm = v;
        self.ack(SettingId::TargetInspiratoryFlow, i64::from(v));
    }

    pub fn on_ventilation_mode_set(&mut self, mode: VentilationMode) {
        self.next_mut().mode = mode;
        self.ack(SettingId::VentilationMode, i64::try_from(mode.index()).unwrap_or(0));
    }

    /// Bounds are clamped to their range and reordered so that low ≤ high.
    pub fn on_inspiratory_minute_volume_bounds_set(&mut self, low: u32, high: u32) {
        let (low, high) = ordered_bounds(low, high, MAX_MINUTE_VOLUME_BOUND);
        let bounds = &mut self.next_mut().alarm_bounds;
        bounds.inspiratory_minute_volume_low = low;
        bounds.inspiratory_minute_volume_high = high;
        self.ack(SettingId::InspiratoryMinuteVolumeBounds, i64::from(high));
    }

    pub fn on_expiratory_minute_volume_bounds_set(&mut self, low: u32, high: u32) {
        let (low, high) = ordered_bounds(low, high, MAX_MINUTE_VOLUME_BOUND);
        let bounds = &mut self.next_mut().alarm_bounds;
        bounds.expiratory_minute_volume_low = low;
        bounds.expiratory_minute_volume_high = high;
        self.ack(SettingId::ExpiratoryMinuteVolumeBounds, i64::from(high));
    }

    pub fn on_respiratory_rate_bounds_set(&mut self, low: u16, high: u16) {
        let (low, high) = ordered_bounds(
            u32::from(low),
            u32::from(high),
            u32::from(MAX_RESPIRATORY_RATE_BOUND),
        );
        let bounds = &mut self.next_mut().alarm_bounds;
        // Both bounded by a u16 limit above.
        bounds.respiratory_rate_low = u16::try_from(low).unwrap_or(MAX_RESPIRATORY_RATE_BOUND);
        bounds.respiratory_rate_high = u16::try_from(high).unwrap_or(MAX_RESPIRATORY_RATE_BOUND);
        self.ack(SettingId::RespiratoryRateBounds, i64::from(high));
    }

    pub fn on_leak_max_set(&mut self, leak_ml_min: u32) {
        let v = leak_ml_min.min(MAX_MINUTE_VOLUME_BOUND);
        self.next_mut().alarm_bounds.leak_max = v;
        self.ack(SettingId::LeakMax, i64::from(v));
    }

    pub fn on_tidal_volume_bounds_set(&mut self, low: u16, high: u16) {
        let (low, high) = ordered_bounds(
            u32::from(low),
            u32::from(high),
            u32::from(MAX_TIDAL_VOLUME_BOUND),
        );
        let bounds = &mut self.next_mut().alarm_bounds;
        bounds.tidal_volume_low = u16::try_from(low).unwrap_or(MAX_TIDAL_VOLUME_BOUND);
        bounds.tidal_volume_high = u16::try_from(high).unwrap_or(MAX_TIDAL_VOLUME_BOUND);
        self.ack(SettingId::TidalVolumeBounds, i64::from(high));
    }

    /// Route a setting message. Start and stop are handled by the state
    /// machine and ignored here.
    pub fn apply_setting(&mut self, command: SettingCommand, now_ms: u64) {
        match command {
            SettingCommand::Start | SettingCommand::Stop => {}
            SettingCommand::Snooze => self.snooze(now_ms),
            SettingCommand::Unsnooze => self.unsnooze(),
            SettingCommand::CyclesIncrease => self.on_cycle_increase(),
            SettingCommand::CyclesDecrease => self.on_cycle_decrease(),
            SettingCommand::SetCycles(v) => self.on_cycle_set(v),
            SettingCommand::PeepIncrease => self.on_peep_increase(),
            SettingCommand::PeepDecrease => self.on_peep_decrease(),
            SettingCommand::SetPeep(v) => self.on_peep_set(v),
            SettingCommand::PlateauIncrease => self.on_plateau_increase(),
            SettingCommand::PlateauDecrease => self.on_plateau_decrease(),
            SettingCommand::SetPlateau(v) => self.on_plateau_set(v),
            SettingCommand::PeakIncrease => self.on_peak_increase(),
            SettingCommand::PeakDecrease => self.on_peak_decrease(),
            SettingCommand::SetPeak(v) => self.on_peak_set(v),
            SettingCommand::SetExpiratoryTerm(v) => self.on_expiratory_term_set(v),
            SettingCommand::SetTriggerEnabled(v) => self.on_trigger_mode_enabled_set(v),
            SettingCommand::SetTriggerOffset(v) => self.on_trigger_offset_set(v),
            SettingCommand::SetTidalVolume(v) => self.on_tidal_volume_set(v),
            SettingCommand::SetPlateauDuration(v) => self.on_plateau_duration_set(v),
            SettingCommand::SetTiMin(v) => self.on_ti_min_set(v),
            SettingCommand::SetExpiratoryTriggerFlow(v) => self.on_expiratory_trigger_flow_set(v),
            SettingCommand::SetTargetInspiratoryFlow(v) => self.on_target_inspiratory_flow_set(v),
            SettingCommand::SetMode(m) => self.on_ventilation_mode_set(m),
            SettingCommand::SetInspiratoryMinuteVolumeBounds { low, high } => {
                self.on_inspiratory_minute_volume_bounds_set(low, high);
            }
            SettingCommand::SetExpiratoryMinuteVolumeBounds { low, high } => {
                self.on_expiratory_minute_volume_bounds_set(low, high);
            }
            SettingCommand::SetRespiratoryRateBounds { low, high } => {
                self.on_respiratory_rate_bounds_set(low, high);
            }
            SettingCommand::SetLeakMax(v) => self.on_leak_max_set(v),
            SettingCommand::SetTidalVolumeBounds { low, high } => {
                self.on_tidal_volume_bounds_set(low, high);
            }
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn period_us(&self) -> u32 {
        self.period_us
    }

    pub fn commands(&self) -> &Commands {
        self.commands.current()
    }

    pub fn next_commands(&self) -> &Commands {
        self.commands.next()
    }

    pub fn active_mode(&self) -> VentilationMode {
        self.active_mode
    }

    pub fn cycle(&self) -> &Cycle {
        &self.cycle
    }

    pub fn cycle_number(&self) -> u32 {
        self.cycle.number
    }

    pub fn tick(&self) -> u32 {
        self.cycle.tick
    }

    pub fn phase(&self) -> CyclePhase {
        self.cycle.phase
    }

    pub fn ticks_per_cycle(&self) -> u32 {
        self.cycle.ticks_per_cycle
    }

    pub fn ticks_per_inhalation(&self) -> u32 {
        self.cycle.ticks_per_inhalation
    }

    /// Inspiration length from the last tick-parameter computation (ms).
    pub fn inspiration_ms(&self) -> u32 {
        self.inspiration_ms
    }

    pub fn triggered(&self) -> bool {
        self.cycle.triggered
    }

    pub fn is_peep_detected(&self) -> bool {
        self.cycle.peep_detected
    }

    pub fn measures(&self) -> &Measures {
        &self.measures
    }

    pub fn pressure(&self) -> i16 {
        self.measures.pressure
    }

    pub fn pressure_command(&self) -> i16 {
        self.measures.pressure_command
    }

    pub fn peak_pressure(&self) -> i16 {
        self.measures.peak_pressure
    }

    pub fn rebounce_peak_pressure(&self) -> i16 {
        self.measures.rebounce_peak_pressure
    }

    pub fn plateau_pressure(&self) -> Option<i16> {
        self.measures.plateau_pressure
    }

    /// Plateau in the fixed-width telemetry form.
    pub fn plateau_pressure_or_unknown(&self) -> i16 {
        self.measures.plateau_pressure.unwrap_or(UNKNOWN_PRESSURE)
    }

    pub fn peep(&self) -> i16 {
        self.measures.peep
    }

    pub fn tidal_volume(&self) -> Option<u16> {
        self.measures.tidal_volume_ml
    }

    pub fn cycles_per_minute(&self) -> u16 {
        self.measures.cycles_per_minute
    }

    pub fn expiratory_volume(&self) -> i32 {
        self.measures.expiratory_volume_ml
    }

    pub fn inspiratory_valve(&self) -> &Valve {
        &self.inspiratory_valve
    }

    pub fn expiratory_valve(&self) -> &Valve {
        &self.expiratory_valve
    }

    pub fn blower(&self) -> &Blower {
        &self.blower
    }

    pub fn alarms(&self) -> &AlarmController {
        &self.alarms
    }
}

/// Clamp both bounds to `max` and put them in order.
fn ordered_bounds(low: u32, high: u32, max: u32) -> (u32, u32) {
    let (low, high) = (low.min(max), high.min(max));
    (low.min(high), low.max(high))
}
