//! Operator console: settings typed on stdin, sent to the tick thread.

use std::io::BufRead;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use vent_core::{SettingCommand, VentilationMode};

/// Parse one console line. Blank lines and `#` comments yield `None`.
///
/// `<name> +` / `<name> -` step a setting by its increment where the core
/// has one; otherwise `<name> <value>` sets it.
pub fn parse_setting(line: &str) -> Result<Option<SettingCommand>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut words = line.split_whitespace();
    let name = words.next().unwrap_or_default().to_ascii_lowercase();
    let arg = words.next();
    if let Some(extra) = words.next() {
        return Err(format!("unexpected '{extra}' after '{name}'"));
    }

    use SettingCommand as S;
    let command = match (name.as_str(), arg) {
        ("start", None) => S::Start,
        ("stop", None) => S::Stop,
        ("snooze", None) => S::Snooze,
        ("unsnooze", None) => S::Unsnooze,
        ("peep", Some("+")) => S::PeepIncrease,
        ("peep", Some("-")) => S::PeepDecrease,
        ("peep", Some(v)) => S::SetPeep(number(&name, v)?),
        ("plateau", Some("+")) => S::PlateauIncrease,
        ("plateau", Some("-")) => S::PlateauDecrease,
        ("plateau", Some(v)) => S::SetPlateau(number(&name, v)?),
        ("peak", Some("+")) => S::PeakIncrease,
        ("peak", Some("-")) => S::PeakDecrease,
        ("peak", Some(v)) => S::SetPeak(number(&name, v)?),
        ("cpm", Some("+")) => S::CyclesIncrease,
        ("cpm", Some("-")) => S::CyclesDecrease,
        ("cpm", Some(v)) => S::SetCycles(number(&name, v)?),
        ("et" | "expiratory-term", Some(v)) => S::SetExpiratoryTerm(number(&name, v)?),
        ("trigger", Some("on")) => S::SetTriggerEnabled(1),
        ("trigger", Some("off")) => S::SetTriggerEnabled(0),
        ("trigger-offset", Some(v)) => S::SetTriggerOffset(number(&name, v)?),
        ("tidal", Some(v)) => S::SetTidalVolume(number(&name, v)?),
        ("plateau-duration", Some(v)) => S::SetPlateauDuration(number(&name, v)?),
        ("ti-min", Some(v)) => S::SetTiMin(number(&name, v)?),
        ("exp-trigger-flow", Some(v)) => S::SetExpiratoryTriggerFlow(number(&name, v)?),
        ("target-flow", Some(v)) => S::SetTargetInspiratoryFlow(number(&name, v)?),
        ("leak-max", Some(v)) => S::SetLeakMax(number(&name, v)?),
        ("mode", Some(v)) => S::SetMode(v.parse::<VentilationMode>()?),
        (other, _) => return Err(format!("unknown setting '{other}'")),
    };
    Ok(Some(command))
}

fn number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("'{value}' is not a valid value for {name}"))
}

/// Read stdin on a background thread until EOF or until the tick thread has
/// dropped its receiver.
pub fn spawn_reader(tx: Sender<SettingCommand>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("vent-console".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(error = %e, "console read failed");
                        break;
                    }
                };
                match parse_setting(&line) {
                    Ok(Some(command)) => {
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(line = %line, error = %e, "ignored console line"),
                }
            }
            tracing::debug!("console closed");
        })
}
