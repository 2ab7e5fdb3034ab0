use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::Receiver;
use vent_traits::clock::Clock;

use crate::commands::SettingCommand;
use crate::error::{Result, VentError};
use crate::status::TickStatus;
use crate::ventilator::Ventilator;

/// When a run ends.
#[derive(Debug, Clone, Default)]
pub struct RunParams {
    /// Stop after this many completed breaths (ended or triggered).
    pub max_cycles: Option<u32>,
    /// Stop once this much clock time has elapsed.
    pub max_duration_ms: Option<u64>,
    /// Request breathing before the first period.
    pub start_breathing: bool,
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u32,
    pub ticks: u64,
    pub triggered_breaths: u32,
    /// Periods whose work finished after the next deadline.
    pub overruns: u64,
    pub elapsed_ms: u64,
    pub peak_pressure: i16,
    pub plateau_pressure: Option<i16>,
    pub peep: i16,
    pub cycles_per_minute: u16,
    pub tidal_volume_ml: Option<u16>,
    /// Every alarm code seen triggered during the run, sorted.
    pub alarms_raised: Vec<u8>,
}

impl RunSummary {
    fn record_measures(&mut self, vent: &Ventilator) {
        let c = vent.controller();
        self.peak_pressure = c.peak_pressure();
        self.plateau_pressure = c.plateau_pressure();
        self.peep = c.peep();
        self.cycles_per_minute = c.cycles_per_minute();
        self.tidal_volume_ml = c.tidal_volume();
    }
}

/// Run the ventilator one period at a time, paced by `clock`, until the
/// run limits are reached, `shutdown` is set, or a step fails.
///
/// Pending settings are drained at the start of every period, on this
/// thread. The machine is always left in the safety position.
pub fn run(
    vent: &mut Ventilator,
    clock: &dyn Clock,
    params: &RunParams,
    settings: Option<&Receiver<SettingCommand>>,
    shutdown: &AtomicBool,
) -> Result<RunSummary> {
    let epoch = clock.now();
    let period_us = u64::from(vent.period_us());
    let mut summary = RunSummary::default();
    let mut raised = BTreeSet::new();
    let mut deadline_us = 0u64;

    tracing::info!(
        period_us,
        mode = %vent.controller().next_commands().mode,
        max_cycles = ?params.max_cycles,
        "run start"
    );

    vent.prime_battery();
    if params.start_breathing && !vent.start() {
        return Err(eyre::Report::new(VentError::State(
            "battery too low to start breathing".into(),
        )));
    }

    let outcome = loop {
        if shutdown.load(Ordering::Relaxed) {
            tracing::info!("shutdown requested");
            break Ok(());
        }
        let now_ms = clock.ms_since(epoch);
        if params.max_duration_ms.is_some_and(|max| now_ms >= max) {
            break Ok(());
        }
        if let Some(rx) = settings {
            for command in rx.try_iter() {
                tracing::debug!(?command, "setting received");
                vent.apply(command, now_ms);
            }
        }

        let status = match vent.step(now_ms) {
            Ok(status) => status,
            Err(e) => break Err(e),
        };
        summary.ticks += 1;
        raised.extend(vent.controller().alarms().triggered_alarms().as_slice());

        match status {
            TickStatus::CycleEnded { .. } => {
                summary.cycles += 1;
                summary.record_measures(vent);
            }
            TickStatus::Triggered { .. } => {
                summary.cycles += 1;
                summary.triggered_breaths += 1;
            }
            TickStatus::Stopped | TickStatus::Breathing { .. } => {}
        }
        if params.max_cycles.is_some_and(|max| summary.cycles >= max) {
            break Ok(());
        }

        deadline_us += period_us;
        let after_us = clock.us_since(epoch);
        if after_us > deadline_us {
            summary.overruns += 1;
            tracing::debug!(late_us = after_us - deadline_us, "period overrun");
            deadline_us = after_us;
        } else {
            clock.sleep(Duration::from_micros(deadline_us - after_us));
        }
    };

    summary.elapsed_ms = clock.ms_since(epoch);
    summary.alarms_raised = raised.into_iter().collect();
    let safe = vent.shutdown(summary.elapsed_ms);

    match (outcome, safe) {
        (Err(e), safe) => {
            if let Err(se) = safe {
                tracing::warn!(error = %se, "safety position not fully applied");
            }
            tracing::error!(error = %e, ticks = summary.ticks, "run aborted");
            Err(e)
        }
        (Ok(()), Err(se)) => Err(se),
        (Ok(()), Ok(())) => {
            tracing::info!(
                cycles = summary.cycles,
                ticks = summary.ticks,
                overruns = summary.overruns,
                "run complete"
            );
            Ok(summary)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{BlowerCall, FixedPressureSensor, SpyBlower, SpyValve};
    use crate::params::VALVE_OPEN_STATE;
    use crate::pressure::{PressureCalibration, PressureLinearizer};
    use vent_traits::clock::ManualClock;

    fn ventilator() -> (Ventilator, SpyValve, SpyBlower) {
        let raw = PressureLinearizer::new(PressureCalibration::default()).raw_for(0);
        let (insp, blower) = (SpyValve::default(), SpyBlower::default());
        let vent = Ventilator::builder()
            .with_pressure_sensor(FixedPressureSensor::new(raw))
            .with_valves(insp.clone(), SpyValve::default())
            .with_blower(blower.clone())
            .build()
            .expect("build");
        (vent, insp, blower)
    }

    #[test]
    fn runs_requested_cycles_on_a_manual_clock() {
        let (mut vent, insp, blower) = ventilator();
        let clock = ManualClock::new();
        let params = RunParams {
            max_cycles: Some(2),
            start_breathing: true,
            ..RunParams::default()
        };
        let summary = run(&mut vent, &clock, &params, None, &AtomicBool::new(false)).expect("run");
        assert_eq!(summary.cycles, 2);
        // one setup period, then 300 periods per breath
        assert_eq!(summary.ticks, 601);
        assert_eq!(summary.overruns, 0);
        assert_eq!(summary.elapsed_ms, 6000);
        assert_eq!(insp.last(), Some(VALVE_OPEN_STATE));
        assert_eq!(blower.last(), Some(BlowerCall::Stop));
    }

    #[test]
    fn settings_are_drained_on_the_tick_thread() {
        let (mut vent, _, _) = ventilator();
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(SettingCommand::SetPeep(80)).expect("send");
        let params = RunParams {
            max_cycles: Some(2),
            start_breathing: true,
            ..RunParams::default()
        };
        run(&mut vent, &ManualClock::new(), &params, Some(&rx), &AtomicBool::new(false))
            .expect("run");
        assert_eq!(vent.controller().commands().peep, 80);
    }

    #[test]
    fn shutdown_flag_stops_before_the_first_period() {
        let (mut vent, insp, _) = ventilator();
        let summary = run(
            &mut vent,
            &ManualClock::new(),
            &RunParams::default(),
            None,
            &AtomicBool::new(true),
        )
        .expect("run");
        assert_eq!(summary.ticks, 0);
        assert_eq!(insp.last(), Some(VALVE_OPEN_STATE));
    }

    #[test]
    fn duration_limit_ends_the_run() {
        let (mut vent, _, _) = ventilator();
        let params = RunParams {
            max_duration_ms: Some(500),
            ..RunParams::default()
        };
        let summary =
            run(&mut vent, &ManualClock::new(), &params, None, &AtomicBool::new(false)).expect("run");
        assert_eq!(summary.ticks, 50);
        assert_eq!(summary.cycles, 0);
    }
}
