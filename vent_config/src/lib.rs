#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and pressure calibration parsing for the ventilator.
//!
//! - `Config` and its sections are deserialized from TOML and validated.
//! - Ventilation settings are not range-checked here: the core clamps them
//!   exactly like operator input. Validation only rejects values the runtime
//!   cannot work with.
//! - The calibration CSV loader enforces headers and fits a linear transfer
//!   from raw sensor counts to mmH2O.
use serde::Deserialize;

/// Calibration CSV schema.
///
/// Expected headers:
/// raw,mmh2o
///
/// Example:
/// raw,mmh2o
/// 201,0
/// 1095,200
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CalibrationRow {
    pub raw: i64,
    pub mmh2o: f32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    PcCmv,
    PcAc,
    PcBipap,
    PcVsai,
    VcCmv,
    VcAc,
    VcPrvc,
}

/// Initial operator settings. Pressures in mmH2O.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Ventilation {
    pub mode: Mode,
    pub peep_mmh2o: i16,
    pub plateau_mmh2o: i16,
    pub peak_mmh2o: i16,
    pub cycles_per_minute: u16,
    /// Expiratory part of the I:E ratio in tenths (20 = 1:2).
    pub expiratory_term: u16,
    pub trigger_enabled: bool,
    pub trigger_offset_mmh2o: i16,
    pub tidal_volume_ml: u16,
    pub plateau_duration_ms: u16,
    pub ti_min_ms: u16,
    pub expiratory_trigger_flow_percent: u16,
    pub target_inspiratory_flow_lpm: u16,
}

impl Default for Ventilation {
    fn default() -> Self {
        Self {
            mode: Mode::PcCmv,
            peep_mmh2o: 100,
            plateau_mmh2o: 200,
            peak_mmh2o: 200,
            cycles_per_minute: 20,
            expiratory_term: 20,
            trigger_enabled: false,
            trigger_offset_mmh2o: 20,
            tidal_volume_ml: 400,
            plateau_duration_ms: 200,
            ti_min_ms: 400,
            expiratory_trigger_flow_percent: 30,
            target_inspiratory_flow_lpm: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Alarms {
    /// Snooze window (ms).
    pub snooze_ms: u64,
    /// Above this pressure both valves vent immediately.
    pub max_pressure_mmh2o: i16,
    /// Mean cycle pressure at or below which the patient counts as unplugged.
    pub min_mean_pressure_mmh2o: i16,
    pub plateau_tolerance_percent: i16,
    pub peep_tolerance_mmh2o: i16,
    /// Minute volumes and leak in mL/min.
    pub inspiratory_minute_volume_low: u32,
    pub inspiratory_minute_volume_high: u32,
    pub expiratory_minute_volume_low: u32,
    pub expiratory_minute_volume_high: u32,
    pub respiratory_rate_low: u16,
    pub respiratory_rate_high: u16,
    pub leak_max: u32,
    pub tidal_volume_low: u16,
    pub tidal_volume_high: u16,
}

impl Default for Alarms {
    fn default() -> Self {
        Self {
            snooze_ms: 120_000,
            max_pressure_mmh2o: 800,
            min_mean_pressure_mmh2o: 20,
            plateau_tolerance_percent: 20,
            peep_tolerance_mmh2o: 20,
            inspiratory_minute_volume_low: 3_000,
            inspiratory_minute_volume_high: 20_000,
            expiratory_minute_volume_low: 3_000,
            expiratory_minute_volume_high: 20_000,
            respiratory_rate_low: 5,
            respiratory_rate_high: 40,
            leak_max: 4_000,
            tidal_volume_low: 200,
            tidal_volume_high: 1_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Controller {
    /// Control period in µs; must divide one second.
    pub period_us: u32,
}

impl Default for Controller {
    fn default() -> Self {
        Self { period_us: 10_000 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Hardware {
    /// Read inspiratory/expiratory flow and delivered volume each period.
    pub has_flow_sensor: bool,
    /// Max time to wait for a sensor reading before failing.
    pub sensor_read_timeout_ms: u64,
    /// Battery sampled every this many periods.
    pub battery_sample_every_ticks: u32,
}

impl Default for Hardware {
    fn default() -> Self {
        Self {
            has_flow_sensor: true,
            sensor_read_timeout_ms: 150,
            battery_sample_every_ticks: 1,
        }
    }
}

/// Simulated patient and power supply used by `vent_hardware`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Simulation {
    /// Lung compliance (mL per cmH2O).
    pub compliance_ml_per_cmh2o: f32,
    /// Airway resistance (cmH2O per L/s).
    pub resistance_cmh2o_per_lps: f32,
    /// Leak flow per cmH2O of airway pressure (mL/min).
    pub leak_ml_min_per_cmh2o: f32,
    /// A spontaneous inspiratory effort every this many seconds (0 = never).
    pub effort_every_s: f32,
    /// Depth of a spontaneous effort (cmH2O).
    pub effort_depth_cmh2o: f32,
    /// Raw battery divider reading.
    pub battery_raw: u16,
    pub mains_connected: bool,
    /// Pressure sensor stops answering after this long (fault injection).
    pub pressure_fault_after_ms: Option<u64>,
    /// Both valves stop answering after this long (fault injection).
    pub valve_fault_after_ms: Option<u64>,
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            compliance_ml_per_cmh2o: 20.0,
            resistance_cmh2o_per_lps: 20.0,
            leak_ml_min_per_cmh2o: 0.0,
            effort_every_s: 0.0,
            effort_depth_cmh2o: 4.0,
            battery_raw: 931,
            mains_connected: true,
            pressure_fault_after_ms: None,
            valve_fault_after_ms: None,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub ventilation: Ventilation,
    #[serde(default)]
    pub alarms: Alarms,
    #[serde(default)]
    pub controller: Controller,
    #[serde(default)]
    pub hardware: Hardware,
    #[serde(default)]
    pub simulation: Simulation,
    #[serde(default)]
    pub logging: Logging,
    /// Optional persisted calibration; preferred at runtime over CSV when present.
    #[serde(default)]
    pub calibration: Option<PressureCalibration>,
}

/// `mmh2o = raw * gain_num / gain_den - offset_mmh2o`
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct PressureCalibration {
    pub gain_num: i32,
    pub gain_den: i32,
    #[serde(default)]
    pub offset_mmh2o: i32,
}

/// Denominator used for fitted gains.
pub const GAIN_DENOMINATOR: i32 = 10_000;

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

impl PressureCalibration {
    /// Ordinary least squares over all rows: `mmh2o = a * raw + b`.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn from_rows(rows: &[CalibrationRow]) -> eyre::Result<Self> {
        if rows.len() < 2 {
            eyre::bail!("calibration requires at least two rows, got {}", rows.len());
        }

        let mut dir: i8 = 0;
        for (i, pair) in rows.windows(2).enumerate() {
            let d = pair[1].raw - pair[0].raw;
            if d == 0 {
                eyre::bail!(
                    "calibration rows have duplicate raw values at index {} and {}",
                    i,
                    i + 1
                );
            }
            let step_dir = if d > 0 { 1 } else { -1 };
            if dir == 0 {
                dir = step_dir;
            } else if dir != step_dir {
                eyre::bail!(
                    "calibration raw values must be monotonic (strictly increasing or strictly decreasing)"
                );
            }
        }

        let n = rows.len() as f64;
        let mean_x = rows.iter().map(|r| r.raw as f64).sum::<f64>() / n;
        let mean_y = rows.iter().map(|r| f64::from(r.mmh2o)).sum::<f64>() / n;
        let (mut sxx, mut sxy) = (0.0f64, 0.0f64);
        for r in rows {
            let x = r.raw as f64 - mean_x;
            let y = f64::from(r.mmh2o) - mean_y;
            sxx += x * x;
            sxy += x * y;
        }
        if !sxx.is_finite() || sxx == 0.0 {
            eyre::bail!("calibration cannot determine slope (degenerate X variance)");
        }
        let a = sxy / sxx;
        let b = mean_y - a * mean_x;
        if !a.is_finite() || !b.is_finite() {
            eyre::bail!("calibration produced a non-finite fit");
        }

        let gain = (a * f64::from(GAIN_DENOMINATOR)).round();
        if gain == 0.0 {
            eyre::bail!("calibration produced zero slope (invalid gain)");
        }
        if gain.abs() > f64::from(i32::MAX) || b.abs() > f64::from(i32::MAX) {
            eyre::bail!("calibration fit out of range");
        }

        Ok(Self {
            gain_num: gain as i32,
            gain_den: GAIN_DENOMINATOR,
            offset_mmh2o: (-b).round() as i32,
        })
    }
}

impl TryFrom<&[CalibrationRow]> for PressureCalibration {
    type Error = eyre::Report;
    fn try_from(rows: &[CalibrationRow]) -> Result<Self, Self::Error> {
        Self::from_rows(rows)
    }
}

pub fn load_calibration_csv(path: &std::path::Path) -> eyre::Result<PressureCalibration> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open calibration CSV {:?}: {}", path, e))?;

    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let expected = ["raw", "mmh2o"];
    let actual: Vec<String> = headers.iter().map(|s| s.trim().to_string()).collect();
    if actual != expected {
        eyre::bail!(
            "calibration CSV must have headers 'raw,mmh2o', got: {}",
            actual.join(",")
        );
    }

    let mut rows = Vec::new();
    for (idx, rec) in rdr.deserialize::<CalibrationRow>().enumerate() {
        match rec {
            Ok(row) => rows.push(row),
            Err(e) => {
                eyre::bail!("invalid CSV row {}: {}", idx + 2, e);
            }
        }
    }

    PressureCalibration::from_rows(&rows)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Controller
        let period = self.controller.period_us;
        if period == 0 {
            eyre::bail!("controller.period_us must be > 0");
        }
        if 1_000_000 % period != 0 {
            eyre::bail!("controller.period_us must divide one second (got {period})");
        }
        if period < 1_000 {
            eyre::bail!("controller.period_us must be >= 1000");
        }

        // Alarms
        let a = &self.alarms;
        if a.max_pressure_mmh2o <= 0 {
            eyre::bail!("alarms.max_pressure_mmh2o must be > 0");
        }
        if a.min_mean_pressure_mmh2o >= a.max_pressure_mmh2o {
            eyre::bail!("alarms.min_mean_pressure_mmh2o must be below alarms.max_pressure_mmh2o");
        }
        if !(0..=100).contains(&a.plateau_tolerance_percent) {
            eyre::bail!("alarms.plateau_tolerance_percent must be in [0, 100]");
        }
        if a.peep_tolerance_mmh2o < 0 {
            eyre::bail!("alarms.peep_tolerance_mmh2o must be >= 0");
        }
        let pairs = [
            (
                "inspiratory_minute_volume",
                a.inspiratory_minute_volume_low,
                a.inspiratory_minute_volume_high,
            ),
            (
                "expiratory_minute_volume",
                a.expiratory_minute_volume_low,
                a.expiratory_minute_volume_high,
            ),
            (
                "respiratory_rate",
                u32::from(a.respiratory_rate_low),
                u32::from(a.respiratory_rate_high),
            ),
            (
                "tidal_volume",
                u32::from(a.tidal_volume_low),
                u32::from(a.tidal_volume_high),
            ),
        ];
        for (name, low, high) in pairs {
            if low > high {
                eyre::bail!("alarms.{name}_low must be <= alarms.{name}_high");
            }
        }

        // Hardware
        if self.hardware.sensor_read_timeout_ms == 0 {
            eyre::bail!("hardware.sensor_read_timeout_ms must be >= 1");
        }
        if self.hardware.battery_sample_every_ticks == 0 {
            eyre::bail!("hardware.battery_sample_every_ticks must be >= 1");
        }

        // Simulation
        let s = &self.simulation;
        if !(s.compliance_ml_per_cmh2o.is_finite() && s.compliance_ml_per_cmh2o > 0.0) {
            eyre::bail!("simulation.compliance_ml_per_cmh2o must be > 0");
        }
        if !(s.resistance_cmh2o_per_lps.is_finite() && s.resistance_cmh2o_per_lps > 0.0) {
            eyre::bail!("simulation.resistance_cmh2o_per_lps must be > 0");
        }
        if !(s.leak_ml_min_per_cmh2o.is_finite() && s.leak_ml_min_per_cmh2o >= 0.0) {
            eyre::bail!("simulation.leak_ml_min_per_cmh2o must be >= 0");
        }
        if !(s.effort_every_s.is_finite() && s.effort_every_s >= 0.0) {
            eyre::bail!("simulation.effort_every_s must be >= 0");
        }
        if !s.effort_depth_cmh2o.is_finite() {
            eyre::bail!("simulation.effort_depth_cmh2o must be finite");
        }

        // Calibration
        if let Some(cal) = &self.calibration {
            if cal.gain_den <= 0 {
                eyre::bail!("calibration.gain_den must be > 0");
            }
            if cal.gain_num == 0 {
                eyre::bail!("calibration.gain_num must be non-zero");
            }
        }

        // Logging
        if let Some(rotation) = self.logging.rotation.as_deref()
            && !matches!(rotation, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never|daily|hourly (got '{rotation}')");
        }

        Ok(())
    }
}
