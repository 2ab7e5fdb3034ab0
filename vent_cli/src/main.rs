#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! `vent`: runs the breathing core against the simulated machine.

mod cli;
mod error_fmt;
mod interactive;
mod logging;
mod rig;
mod rt;
mod run;
mod telemetry;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use vent_config::{Config, PressureCalibration};
use vent_core::VentError;

use crate::cli::{Cli, Commands, JSON_MODE, LAST_RUN};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};
use crate::rt::RtRequest;
use crate::run::RunOptions;

fn config_error(e: impl std::fmt::Display) -> eyre::Report {
    eyre::Report::new(VentError::Config(e.to_string()))
}

fn load_config(path: &Path) -> eyre::Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| config_error(format!("read config {}: {e}", path.display())))?;
    let cfg: Config = toml::from_str(&text)
        .map_err(|e| config_error(format!("parse config {}: {e}", path.display())))?;
    cfg.validate().map_err(|e| config_error(format!("{e:#}")))?;
    Ok(cfg)
}

fn load_calibration(path: Option<&Path>) -> eyre::Result<Option<PressureCalibration>> {
    path.map(|p| vent_config::load_calibration_csv(p).map_err(|e| config_error(format!("{e:#}"))))
        .transpose()
}

fn print_line(json: bool, value: &serde_json::Value, text: impl FnOnce() -> String) {
    if json {
        println!("{value}");
    } else {
        println!("{}", text());
    }
}

fn execute(cli: Cli, cfg: &Config, shutdown: &Arc<AtomicBool>) -> eyre::Result<()> {
    let calibration = load_calibration(cli.calibration.as_deref())?;
    match cli.cmd {
        Commands::Run {
            cycles,
            duration_ms,
            settings,
            realtime,
            interactive,
            telemetry,
            telemetry_every,
            rt,
            rt_prio,
            rt_lock,
            rt_cpu,
            stats,
        } => {
            let opts = RunOptions {
                cycles,
                duration_ms,
                settings,
                realtime,
                interactive,
                telemetry,
                telemetry_every,
                rt: rt.then(|| RtRequest::new(rt_prio, rt_lock, rt_cpu)),
                stats,
            };
            let summary = run::run_ventilation(cfg, calibration, &opts, shutdown)?;
            if opts.stats {
                run::print_stats(&summary, cfg.controller.period_us);
            }
            let mode = LAST_RUN
                .get()
                .map_or_else(|| vent_core::Commands::from(cfg).mode, |r| r.mode);
            print_line(cli.json, &run::summary_json(&summary, mode), || {
                run::summary_text(&summary, mode)
            });
        }
        Commands::SelfCheck => {
            let report = run::self_check(cfg, calibration)?;
            print_line(cli.json, &report, || {
                format!(
                    "Self-check ok: pressure raw {} = {} mmH2O (offset {} mmH2O), flow {}, battery {}",
                    report["pressure_raw"],
                    report["pressure_mmh2o"],
                    report["pressure_offset_mmh2o"],
                    report["flow"],
                    report["battery"],
                )
            });
        }
        Commands::Health => {
            let report = run::health(cfg);
            print_line(cli.json, &report, || {
                format!(
                    "ok: {} at {} cpm, period {} us",
                    report["mode"].as_str().unwrap_or_default(),
                    report["cycles_per_minute"],
                    report["period_us"],
                )
            });
        }
    }
    Ok(())
}

fn report_error(err: &eyre::Report) {
    if JSON_MODE.get().copied().unwrap_or(false) {
        println!("{}", format_error_json(err));
    } else {
        eprintln!("{}", humanize(err));
    }
}

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    if !cli.json {
        // Only the panic hook matters here; errors go through humanize().
        let _ = color_eyre::install();
    }

    let cfg = match load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            report_error(&e);
            std::process::exit(exit_code_for_error(&e));
        }
    };

    let level = cli
        .log_level
        .clone()
        .or_else(|| cfg.logging.level.clone())
        .unwrap_or_else(|| "info".to_string());
    let guard = match logging::init(&level, cli.json, &cfg.logging) {
        Ok(guard) => guard,
        Err(e) => {
            let e = config_error(format!("{e:#}"));
            report_error(&e);
            std::process::exit(exit_code_for_error(&e));
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&shutdown);
        if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
            tracing::warn!(error = %e, "Ctrl-C handler not installed");
        }
    }

    let code = match execute(cli, &cfg, &shutdown) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            report_error(&e);
            exit_code_for_error(&e)
        }
    };
    // Flush the file layer before exiting.
    drop(guard);
    std::process::exit(code);
}
