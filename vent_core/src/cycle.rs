//! Respiratory cycle bookkeeping owned by the breath controller.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CyclePhase {
    #[default]
    Inhalation,
    Exhalation,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Inhalation => "inhalation",
            Self::Exhalation => "exhalation",
        })
    }
}

/// One breath. Created by `init_respiratory_cycle`, advanced by `compute`,
/// read back by `end_respiratory_cycle`.
#[derive(Debug, Clone, Default)]
pub struct Cycle {
    /// Monotonic cycle counter.
    pub number: u32,
    pub phase: CyclePhase,
    /// Ticks elapsed since the cycle started.
    pub tick: u32,
    pub ticks_per_cycle: u32,
    /// Inspiration length. Flow-cycled and volume modes may move it mid-cycle.
    pub ticks_per_inhalation: u32,
    /// Patient effort detected; the next inspiration starts early.
    pub triggered: bool,
    pub peep_detected: bool,
}

impl Cycle {
    pub fn is_inhaling(&self) -> bool {
        self.phase == CyclePhase::Inhalation
    }
}
