//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;
use vent_core::VentilationMode;

/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();
/// Settings of the current run, reported with safety stops in JSON mode.
pub static LAST_RUN: OnceLock<RunContext> = OnceLock::new();

#[derive(Copy, Clone, Debug)]
pub struct RunContext {
    pub mode: VentilationMode,
    pub period_us: u32,
    pub sensor_read_timeout_ms: u64,
}

#[derive(Parser, Debug)]
#[command(name = "vent", version, about = "Ventilator breathing control")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/vent_config.toml")]
    pub config: PathBuf,

    /// Optional pressure calibration CSV (strict header raw,mmh2o)
    #[arg(long, value_name = "FILE")]
    pub calibration: Option<PathBuf>,

    /// Log and report as JSON lines
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); overrides [logging] level
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// Memory locking mode for real-time operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum RtLock {
    /// Do not lock memory
    None,
    /// Lock currently resident pages
    Current,
    /// Lock current and future pages
    All,
}

impl RtLock {
    #[inline]
    pub fn os_default() -> Self {
        if cfg!(target_os = "linux") {
            RtLock::Current
        } else {
            RtLock::None
        }
    }
}

/// Settings given on the command line, applied over the config before the
/// first breath.
#[derive(clap::Args, Debug, Default, Clone)]
pub struct SettingArgs {
    /// Ventilation mode (pc_cmv, pc_ac, pc_bipap, pc_vsai, vc_cmv, vc_ac, vc_prvc)
    #[arg(long, value_name = "MODE")]
    pub mode: Option<VentilationMode>,
    /// PEEP command (mmH2O)
    #[arg(long, value_name = "MMH2O")]
    pub peep: Option<i16>,
    /// Plateau pressure command (mmH2O)
    #[arg(long, value_name = "MMH2O")]
    pub plateau: Option<i16>,
    /// Breaths per minute
    #[arg(long, value_name = "CPM")]
    pub cpm: Option<u16>,
    /// Expiratory term of the I:E ratio in tenths (20 = 1:2)
    #[arg(long = "expiratory-term", value_name = "TENTHS")]
    pub expiratory_term: Option<u16>,
    /// Enable inspiratory triggering on patient effort
    #[arg(long, action = ArgAction::SetTrue)]
    pub trigger: bool,
    /// Trigger offset below PEEP (mmH2O)
    #[arg(long = "trigger-offset", value_name = "MMH2O")]
    pub trigger_offset: Option<i16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ventilate the simulated patient
    Run {
        /// Stop after this many breaths (default 10 on the simulated clock)
        #[arg(long, value_name = "N")]
        cycles: Option<u32>,
        /// Stop after this much time (ms)
        #[arg(long = "duration-ms", value_name = "MS")]
        duration_ms: Option<u64>,
        #[command(flatten)]
        settings: SettingArgs,
        /// Pace the loop to the wall clock instead of simulated time
        #[arg(long, action = ArgAction::SetTrue)]
        realtime: bool,
        /// Read settings from stdin while breathing (e.g. `peep 80`, `stop`)
        #[arg(long, action = ArgAction::SetTrue)]
        interactive: bool,
        /// Write JSON-lines telemetry, each line carrying a CRC-32
        #[arg(long, value_name = "FILE")]
        telemetry: Option<PathBuf>,
        /// Keep one data snapshot out of this many periods
        #[arg(long = "telemetry-every", value_name = "N", default_value_t = 10)]
        telemetry_every: u32,
        /// Enable real-time mode (SCHED_FIFO, affinity, mlockall)
        #[arg(
            long,
            action = ArgAction::SetTrue,
            long_help = "Enable real-time mode on supported OSes.\n\nLinux: Attempts SCHED_FIFO priority, pins to one CPU, and locks the process address space into RAM. Needs CAP_SYS_NICE / CAP_IPC_LOCK (or root) and a sufficient memlock ulimit.\n\nmacOS: Only mlockall is applied."
        )]
        rt: bool,
        /// Real-time priority for SCHED_FIFO on Linux (1..=max); ignored on macOS
        #[arg(long = "rt-prio", value_name = "PRIO")]
        rt_prio: Option<i32>,
        /// Memory locking mode for --rt: none, current, or all
        #[arg(long = "rt-lock", value_enum, value_name = "MODE")]
        rt_lock: Option<RtLock>,
        /// CPU index to pin the process to (Linux only, default 0)
        #[arg(long = "rt-cpu", value_name = "CPU")]
        rt_cpu: Option<usize>,
        /// Print loop timing stats to stderr
        #[arg(long, action = ArgAction::SetTrue)]
        stats: bool,
    },
    /// Read every sensor once and measure the pressure offset
    SelfCheck,
    /// Validate the configuration and report readiness
    Health,
}
