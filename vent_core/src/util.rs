//! Common time/period helpers for vent_core.

/// Number of microseconds in one second.
pub const MICROS_PER_SEC: u32 = 1_000_000;
/// Number of microseconds in one millisecond.
pub const MICROS_PER_MILLI: u32 = 1_000;

/// Control period in milliseconds, never below 1.
#[inline]
pub fn period_ms(period_us: u32) -> u32 {
    (period_us / MICROS_PER_MILLI).max(1)
}

/// Number of whole control periods covering `ms`, never below 1.
///
/// Delays in the breathing logic are expressed in milliseconds and converted
/// once per use so that a different control period keeps the same wall-clock
/// behaviour.
#[inline]
pub fn ms_to_ticks(ms: u32, period_us: u32) -> u32 {
    (ms / period_ms(period_us)).max(1)
}

/// Ticks per second at the given control period.
#[inline]
pub fn ticks_per_second(period_us: u32) -> u32 {
    (MICROS_PER_SEC / period_us.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_ms_period_conversions() {
        assert_eq!(period_ms(10_000), 10);
        assert_eq!(ms_to_ticks(200, 10_000), 20);
        assert_eq!(ms_to_ticks(700, 10_000), 70);
        assert_eq!(ticks_per_second(10_000), 100);
    }

    #[test]
    fn sub_millisecond_period_is_floored_to_one_ms() {
        assert_eq!(period_ms(500), 1);
        assert_eq!(ms_to_ticks(5, 500), 5);
    }

    #[test]
    fn short_delays_are_at_least_one_tick() {
        assert_eq!(ms_to_ticks(0, 10_000), 1);
        assert_eq!(ms_to_ticks(3, 10_000), 1);
    }
}
