#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Breathing-control core (hardware-agnostic).
//!
//! This crate holds the real-time control of a pinch-valve and blower
//! ventilator. All hardware interactions go through the `vent_traits` seams.
//!
//! ## Architecture
//!
//! - **Actuator models**: pinch valves and the blower ramp (`valve`, `blower`)
//! - **PID**: anti-windup PID with a fast mode, driving a valve aperture (`pid`)
//! - **Modes**: one controller per ventilation mode (`modes`)
//! - **Cycle control**: double-buffered commands, per-tick compute, cycle
//!   measures and cycle alarms (`controller`)
//! - **Alarms**: debounced catalog, snooze, buzzer and LED policy (`alarm_controller`)
//! - **State machine**: setup, stop, breathe, trigger and end of cycle (`state_machine`)
//! - **Runtime**: sensors in, actuators out, safety stops (`ventilator`, `runner`)
//!
//! ## Units
//!
//! Pressures are integer mmH2O, flows mL/min, volumes mL. Valve apertures are
//! valve degrees where 0 is fully open and 125 fully closed.

pub mod alarm;
pub mod alarm_controller;
pub mod battery;
pub mod blower;
pub mod builder;
pub mod commands;
pub mod config;
pub mod controller;
pub mod conversions;
pub mod crc;
pub mod cycle;
pub mod error;
pub mod events;
pub mod fixed_point;
pub mod hw_error;
pub mod measures;
pub mod mocks;
pub mod modes;
pub mod params;
pub mod pid;
pub mod pressure;
pub mod ring;
pub mod runner;
pub mod state_machine;
pub mod status;
pub mod util;
pub mod valve;
pub mod ventilator;

pub use alarm::AlarmPriority;
pub use builder::{Missing, Set, VentilatorBuilder};
pub use commands::{Commands, SettingCommand, SettingId, VentilationMode};
pub use config::{AlarmCfg, ControllerCfg, HardwareCfg};
pub use controller::BreathController;
pub use cycle::CyclePhase;
pub use error::{BuildError, Result, SafetyReason, VentError};
pub use events::{
    AlarmTrap, DataSnapshot, EventSink, MachineStateSnapshot, NullSink, StoppedSnapshot,
};
pub use pressure::{PressureCalibration, PressureLinearizer};
pub use runner::{RunParams, RunSummary, run};
pub use state_machine::CycleStateMachine;
pub use status::TickStatus;
pub use ventilator::{SensorProbe, Ventilator};
