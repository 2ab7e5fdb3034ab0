//! The `run`, `self-check` and `health` commands.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use vent_config::{Config, PressureCalibration};
use vent_core::{RunParams, RunSummary, SettingCommand, Ventilator, VentilationMode};
use vent_hardware::SimulatedClock;
use vent_traits::{Clock, MonotonicClock};

use crate::cli::{LAST_RUN, RunContext, SettingArgs};
use crate::interactive;
use crate::rig;
use crate::rt::{RtRequest, setup_rt_once};
use crate::telemetry::TelemetrySink;

/// Breaths run on the simulated clock when no limit is given.
const DEFAULT_SIM_CYCLES: u32 = 10;
/// Samples averaged for the start-up pressure offset.
const OFFSET_SAMPLES: u32 = 20;

#[derive(Debug)]
pub struct RunOptions {
    pub cycles: Option<u32>,
    pub duration_ms: Option<u64>,
    pub settings: SettingArgs,
    pub realtime: bool,
    pub interactive: bool,
    pub telemetry: Option<PathBuf>,
    pub telemetry_every: u32,
    pub rt: Option<RtRequest>,
    pub stats: bool,
}

impl SettingArgs {
    /// Command-line settings as the messages an operator would send.
    pub fn commands(&self) -> Vec<SettingCommand> {
        let mut out = Vec::new();
        if let Some(mode) = self.mode {
            out.push(SettingCommand::SetMode(mode));
        }
        if let Some(v) = self.peep {
            out.push(SettingCommand::SetPeep(v));
        }
        if let Some(v) = self.plateau {
            out.push(SettingCommand::SetPlateau(v));
        }
        if let Some(v) = self.cpm {
            out.push(SettingCommand::SetCycles(v));
        }
        if let Some(v) = self.expiratory_term {
            out.push(SettingCommand::SetExpiratoryTerm(v));
        }
        if self.trigger {
            out.push(SettingCommand::SetTriggerEnabled(1));
        }
        if let Some(v) = self.trigger_offset {
            out.push(SettingCommand::SetTriggerOffset(v));
        }
        out
    }
}

fn measure_offset(vent: &mut Ventilator) -> eyre::Result<i16> {
    let offset = vent.calibrate_pressure_offset(OFFSET_SAMPLES)?;
    tracing::info!(offset_mmh2o = offset, "pressure sensor zeroed");
    Ok(offset)
}

/// Build the simulated machine, zero the pressure sensor and breathe.
pub fn run_ventilation(
    cfg: &Config,
    calibration: Option<PressureCalibration>,
    opts: &RunOptions,
    shutdown: &Arc<AtomicBool>,
) -> eyre::Result<RunSummary> {
    if let Some(req) = opts.rt {
        setup_rt_once(req);
    }
    let sink = opts
        .telemetry
        .as_deref()
        .map(|path| TelemetrySink::create(path, opts.telemetry_every))
        .transpose()?;

    let params = RunParams {
        max_cycles: match (opts.cycles, opts.duration_ms, opts.realtime) {
            (None, None, false) => Some(DEFAULT_SIM_CYCLES),
            (cycles, _, _) => cycles,
        },
        max_duration_ms: opts.duration_ms,
        start_breathing: true,
    };

    let (tx, rx) = crossbeam_channel::unbounded();
    for command in opts.settings.commands() {
        // Queued before the first period, so the first breath already uses them.
        tx.send(command)?;
    }
    if opts.interactive {
        interactive::spawn_reader(tx.clone())?;
    }

    let _ = LAST_RUN.set(RunContext {
        mode: opts
            .settings
            .mode
            .unwrap_or_else(|| vent_core::Commands::from(cfg).mode),
        period_us: cfg.controller.period_us,
        sensor_read_timeout_ms: cfg.hardware.sensor_read_timeout_ms,
    });

    if opts.realtime {
        breathe(cfg, calibration, MonotonicClock::new(), sink, &params, &rx, shutdown)
    } else {
        breathe(cfg, calibration, SimulatedClock::new(), sink, &params, &rx, shutdown)
    }
}

fn breathe<C: Clock + Clone + 'static>(
    cfg: &Config,
    calibration: Option<PressureCalibration>,
    clock: C,
    sink: Option<TelemetrySink>,
    params: &RunParams,
    settings: &crossbeam_channel::Receiver<SettingCommand>,
    shutdown: &Arc<AtomicBool>,
) -> eyre::Result<RunSummary> {
    let (mut vent, _lung) = rig::build(cfg, calibration, clock.clone(), sink)?;
    measure_offset(&mut vent)?;
    vent_core::run(&mut vent, &clock, params, Some(settings), shutdown)
}

/// Print loop timing stats to stderr.
pub fn print_stats(summary: &RunSummary, period_us: u32) {
    let expected_ms = summary.ticks * u64::from(period_us) / 1000;
    eprintln!("\n--- Breathing Stats ---");
    eprintln!("Periods: {}", summary.ticks);
    eprintln!("Period (us): {period_us}");
    eprintln!("Elapsed / scheduled (ms): {} / {expected_ms}", summary.elapsed_ms);
    eprintln!("Overruns (> period): {}", summary.overruns);
    eprintln!("Breaths: {} ({} triggered)", summary.cycles, summary.triggered_breaths);
    eprintln!("-----------------------\n");
}

pub fn summary_json(summary: &RunSummary, mode: VentilationMode) -> serde_json::Value {
    serde_json::json!({
        "outcome": "complete",
        "mode": mode.as_str(),
        "cycles": summary.cycles,
        "triggered_breaths": summary.triggered_breaths,
        "ticks": summary.ticks,
        "overruns": summary.overruns,
        "elapsed_ms": summary.elapsed_ms,
        "peak_mmh2o": summary.peak_pressure,
        "plateau_mmh2o": summary.plateau_pressure,
        "peep_mmh2o": summary.peep,
        "cycles_per_minute": summary.cycles_per_minute,
        "tidal_volume_ml": summary.tidal_volume_ml,
        "alarms_raised": summary.alarms_raised,
    })
}

pub fn summary_text(summary: &RunSummary, mode: VentilationMode) -> String {
    let plateau = summary
        .plateau_pressure
        .map_or_else(|| "unknown".to_string(), |p| format!("{p} mmH2O"));
    let tidal = summary
        .tidal_volume_ml
        .map_or_else(|| "unknown".to_string(), |v| format!("{v} mL"));
    format!(
        "Ventilation complete: {} breaths in {mode} ({} triggered) over {} ms\n\
         peak {} mmH2O, plateau {plateau}, PEEP {} mmH2O, {} cpm, tidal volume {tidal}\n\
         alarms raised: {:?}",
        summary.cycles,
        summary.triggered_breaths,
        summary.elapsed_ms,
        summary.peak_pressure,
        summary.peep,
        summary.cycles_per_minute,
        summary.alarms_raised,
    )
}

/// Read every sensor once after zeroing the pressure sensor.
pub fn self_check(
    cfg: &Config,
    calibration: Option<PressureCalibration>,
) -> eyre::Result<serde_json::Value> {
    let (mut vent, _lung) = rig::build(cfg, calibration, SimulatedClock::new(), None)?;
    let offset = measure_offset(&mut vent)?;
    let probe = vent.probe()?;
    let cal = vent.linearizer().calibration();
    Ok(serde_json::json!({
        "self_check": "ok",
        "pressure_raw": probe.pressure_raw,
        "pressure_mmh2o": probe.pressure_mmh2o,
        "pressure_offset_mmh2o": offset,
        "calibration": {
            "gain_num": cal.gain_num,
            "gain_den": cal.gain_den,
            "offset_mmh2o": cal.offset_mmh2o,
        },
        "flow": probe.flow.map(|(insp, exp, delivered)| serde_json::json!({
            "inspiratory_ml_min": insp,
            "expiratory_ml_min": exp,
            "delivered_ml": delivered,
        })),
        "battery": probe.battery.map(|(raw, mains)| serde_json::json!({
            "raw": raw,
            "mains_connected": mains,
        })),
    }))
}

/// Configuration summary for `health`; the config is already validated.
pub fn health(cfg: &Config) -> serde_json::Value {
    let commands = vent_core::Commands::from(cfg);
    serde_json::json!({
        "status": "ok",
        "mode": commands.mode.as_str(),
        "period_us": cfg.controller.period_us,
        "peep_mmh2o": commands.peep,
        "plateau_mmh2o": commands.plateau_pressure,
        "cycles_per_minute": commands.cycles_per_minute,
        "flow_sensor": cfg.hardware.has_flow_sensor,
        "calibration": if cfg.calibration.is_some() { "persisted" } else { "default" },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        vent_config::load_toml("[ventilation]\nmode = \"pc_cmv\"\npeep_mmh2o = 50\n").expect("config")
    }

    fn options() -> RunOptions {
        RunOptions {
            cycles: Some(3),
            duration_ms: None,
            settings: SettingArgs::default(),
            realtime: false,
            interactive: false,
            telemetry: None,
            telemetry_every: 10,
            rt: None,
            stats: false,
        }
    }

    #[test]
    fn cli_settings_map_to_operator_commands() {
        let args = SettingArgs {
            mode: Some(VentilationMode::PcAc),
            peep: Some(60),
            trigger: true,
            ..SettingArgs::default()
        };
        assert_eq!(
            args.commands(),
            vec![
                SettingCommand::SetMode(VentilationMode::PcAc),
                SettingCommand::SetPeep(60),
                SettingCommand::SetTriggerEnabled(1),
            ]
        );
        assert!(SettingArgs::default().commands().is_empty());
    }

    #[test]
    fn simulated_run_completes_the_requested_breaths() {
        let summary = run_ventilation(&config(), None, &options(), &Arc::new(AtomicBool::new(false)))
            .expect("run");
        assert_eq!(summary.cycles, 3);
        assert!(summary.plateau_pressure.is_some());
        let text = summary_text(&summary, VentilationMode::PcCmv);
        assert!(text.starts_with("Ventilation complete: 3 breaths in pc_cmv"));
    }

    #[test]
    fn overrides_reach_the_first_breath() {
        let opts = RunOptions {
            cycles: Some(1),
            settings: SettingArgs {
                cpm: Some(30),
                ..SettingArgs::default()
            },
            ..options()
        };
        let summary =
            run_ventilation(&config(), None, &opts, &Arc::new(AtomicBool::new(false))).expect("run");
        // setup period, then 200 periods of 10 ms; the run ends before the last sleep
        assert_eq!(summary.ticks, 201);
        assert_eq!(summary.elapsed_ms, 2000);
    }

    #[test]
    fn health_reports_clamped_settings() {
        let cfg = vent_config::load_toml("[ventilation]\ncycles_per_minute = 99\n").expect("config");
        let h = health(&cfg);
        assert_eq!(h["status"], "ok");
        assert_eq!(h["cycles_per_minute"], 35);
    }
}
