//! Raw pressure sensor counts to mmH2O.

/// Linear transfer from filtered raw counts to mmH2O:
/// `mmh2o = raw * gain_num / gain_den - offset_mmh2o`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureCalibration {
    pub gain_num: i32,
    pub gain_den: i32,
    pub offset_mmh2o: i32,
}

impl Default for PressureCalibration {
    /// Datasheet transfer of the fitted sensor behind its divider and 12-bit ADC.
    fn default() -> Self {
        Self {
            gain_num: 2238,
            gain_den: 10_000,
            offset_mmh2o: 45,
        }
    }
}

const FILTER_DIVIDER: i32 = 5;

/// First-order low-pass filter followed by the calibration transfer.
#[derive(Debug, Clone, Default)]
pub struct PressureLinearizer {
    calibration: PressureCalibration,
    filtered_raw: i32,
    zero_offset: i16,
}

impl PressureLinearizer {
    pub fn new(calibration: PressureCalibration) -> Self {
        Self {
            calibration,
            filtered_raw: 0,
            zero_offset: 0,
        }
    }

    pub fn calibration(&self) -> PressureCalibration {
        self.calibration
    }

    /// Filter one raw sample and return the pressure in mmH2O.
    pub fn convert(&mut self, raw: u32) -> i16 {
        let raw = i32::try_from(raw).unwrap_or(i32::MAX);
        let mut delta = raw.saturating_sub(self.filtered_raw);
        // Round away from zero so a constant input is reached exactly.
        let rounding = FILTER_DIVIDER - 1;
        delta = delta.saturating_add(if delta > 0 { rounding } else { -rounding });
        self.filtered_raw = self.filtered_raw.saturating_add(delta / FILTER_DIVIDER);

        let den = i64::from(self.calibration.gain_den.max(1));
        let scaled = i64::from(self.filtered_raw) * i64::from(self.calibration.gain_num) / den
            - i64::from(self.calibration.offset_mmh2o);
        crate::fixed_point::saturate_i16(crate::fixed_point::saturate_i32(scaled))
    }

    /// Convert, remove the zero offset and floor at 0. This is the value the
    /// controller sees.
    pub fn read(&mut self, raw: u32) -> i16 {
        self.convert(raw).saturating_sub(self.zero_offset).max(0)
    }

    /// Offset measured with the circuit open to ambient air.
    pub fn set_zero_offset(&mut self, offset: i16) {
        self.zero_offset = offset;
    }

    pub fn zero_offset(&self) -> i16 {
        self.zero_offset
    }

    /// Start the filter at `raw` instead of ramping up from zero.
    pub fn prime(&mut self, raw: u32) {
        self.filtered_raw = i32::try_from(raw).unwrap_or(i32::MAX);
    }

    /// Restart the filter from zero.
    pub fn reset(&mut self) {
        self.filtered_raw = 0;
    }

    /// Raw counts that read back as `mmh2o` once the filter has settled.
    pub fn raw_for(&self, mmh2o: i32) -> u32 {
        let c = self.calibration;
        let num = i64::from(c.gain_num.max(1));
        let raw = (i64::from(mmh2o) + i64::from(c.offset_mmh2o)) * i64::from(c.gain_den) / num;
        // Round up so the forward truncation lands on the requested value.
        let raw = if (raw * num / i64::from(c.gain_den.max(1))) < i64::from(mmh2o + c.offset_mmh2o)
        {
            raw + 1
        } else {
            raw
        };
        u32::try_from(raw.max(0)).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn constant_input_converges_exactly() {
        let mut p = PressureLinearizer::default();
        let mut last = 0;
        for _ in 0..200 {
            last = p.convert(1000);
        }
        assert_eq!(last, (1000 * 2238 / 10_000 - 45) as i16);
    }

    #[test]
    fn filter_moves_a_fifth_of_the_gap_rounded_away_from_zero() {
        let mut p = PressureLinearizer::default();
        p.convert(1000);
        // 0 + (1000 + 4) / 5
        assert_eq!(p.filtered_raw, 200);
        p.convert(0);
        // 200 + (-200 - 4) / 5
        assert_eq!(p.filtered_raw, 160);
    }

    #[test]
    fn read_floors_at_zero_and_removes_zero_offset() {
        let mut p = PressureLinearizer::default();
        assert_eq!(p.read(0), 0);
        p.set_zero_offset(5);
        for _ in 0..200 {
            p.read(1000);
        }
        assert_eq!(p.read(1000), 223 - 45 - 5);
    }

    #[test]
    fn reset_restarts_filter() {
        let mut p = PressureLinearizer::default();
        for _ in 0..50 {
            p.convert(2000);
        }
        p.reset();
        assert_eq!(p.filtered_raw, 0);
    }

    #[test]
    fn primed_filter_reads_settled_value_immediately() {
        let mut p = PressureLinearizer::default();
        p.prime(1000);
        assert_eq!(p.convert(1000), (1000 * 2238 / 10_000 - 45) as i16);
    }

    proptest! {
        #[test]
        fn inverse_reads_back(mmh2o in 0i32..700) {
            let mut p = PressureLinearizer::default();
            let raw = p.raw_for(mmh2o);
            let mut got = 0;
            for _ in 0..200 {
                got = p.convert(raw);
            }
            prop_assert_eq!(i32::from(got), mmh2o);
        }
    }
}
