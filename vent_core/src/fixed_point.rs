//! Integer arithmetic helpers for the control laws.
//!
//! Pressures, flows and apertures are integers end to end. Intermediate
//! products are computed in `i64` and saturated back into the narrow types.

/// Saturate an `i64` into the `i32` range.
#[inline]
pub fn saturate_i32(v: i64) -> i32 {
    i32::try_from(v).unwrap_or(if v < 0 { i32::MIN } else { i32::MAX })
}

/// Saturate an `i32` into the `i16` range.
#[inline]
pub fn saturate_i16(v: i32) -> i16 {
    i16::try_from(v).unwrap_or(if v < 0 { i16::MIN } else { i16::MAX })
}

/// Saturate an `i64` into the `u16` range.
#[inline]
pub fn saturate_u16(v: i64) -> u16 {
    u16::try_from(v).unwrap_or(if v < 0 { 0 } else { u16::MAX })
}

/// Clamp `v` into `[lo, hi]` and narrow it to `u16`. Bounds are given as `u16`
/// so the result always fits.
#[inline]
pub fn clamp_to_u16(v: i64, lo: u16, hi: u16) -> u16 {
    saturate_u16(v.clamp(i64::from(lo), i64::from(hi)))
}

/// Floor of the square root of a non-negative integer. Negative input yields 0.
pub fn isqrt_i64(v: i64) -> i64 {
    if v <= 0 {
        return 0;
    }
    // Newton iteration from a power-of-two upper bound.
    let bits = 64 - v.leading_zeros();
    let mut x: i64 = 1 << bits.div_ceil(2);
    loop {
        let y = (x + v / x) / 2;
        if y >= x {
            return x;
        }
        x = y;
    }
}

/// Linear re-mapping with integer truncation, `in_min != in_max`.
#[inline]
pub fn map_range(v: i64, in_min: i64, in_max: i64, out_min: i64, out_max: i64) -> i64 {
    if in_max == in_min {
        return out_min;
    }
    (v - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 1)]
    #[case(3, 1)]
    #[case(4, 2)]
    #[case(99, 9)]
    #[case(100, 10)]
    #[case(-5, 0)]
    #[case(1 << 62, 1 << 31)]
    fn isqrt_examples(#[case] v: i64, #[case] expected: i64) {
        assert_eq!(isqrt_i64(v), expected);
    }

    #[test]
    fn saturation_at_bounds() {
        assert_eq!(saturate_i16(40_000), i16::MAX);
        assert_eq!(saturate_i16(-40_000), i16::MIN);
        assert_eq!(saturate_u16(-1), 0);
        assert_eq!(saturate_u16(70_000), u16::MAX);
        assert_eq!(saturate_i32(i64::MAX), i32::MAX);
    }

    #[test]
    fn map_range_matches_pwm_table() {
        assert_eq!(map_range(0, 0, 125, 640, 900), 640);
        assert_eq!(map_range(125, 0, 125, 640, 900), 900);
        assert_eq!(map_range(5, 3, 3, 7, 9), 7);
    }

    proptest! {
        #[test]
        fn isqrt_is_floor_root(v in 0i64..(1i64 << 50)) {
            let r = isqrt_i64(v);
            prop_assert!(r * r <= v);
            prop_assert!((r + 1) * (r + 1) > v);
        }
    }
}
