//! Outcome of one control period of the ventilator runtime.

use crate::cycle::CyclePhase;

/// Public status of a single `Ventilator::step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    /// Not breathing; valves held open.
    Stopped,
    /// Mid-cycle.
    Breathing { cycle: u32, phase: CyclePhase, tick: u32 },
    /// The period completed cycle `cycle`; its measures are final.
    CycleEnded { cycle: u32 },
    /// Patient effort cut cycle `cycle` short; the next breath starts now.
    Triggered { cycle: u32 },
}

impl TickStatus {
    pub fn is_breathing(&self) -> bool {
        !matches!(self, Self::Stopped)
    }
}
