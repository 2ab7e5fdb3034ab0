//! Fixed-capacity circular buffer used for every windowed mean in the core.

/// Circular buffer of `N` samples. Always full: it starts filled with a value
/// and each push overwrites the oldest sample.
#[derive(Debug, Clone)]
pub struct RingBuffer<T, const N: usize> {
    values: [T; N],
    index: usize,
}

impl<T: Copy, const N: usize> RingBuffer<T, N> {
    /// Buffer with every slot set to `value`.
    pub fn filled(value: T) -> Self {
        const { assert!(N > 0, "ring buffer needs at least one slot") };
        Self {
            values: [value; N],
            index: 0,
        }
    }

    /// Overwrite every slot and rewind the write index.
    pub fn fill(&mut self, value: T) {
        self.values = [value; N];
        self.index = 0;
    }

    pub fn push(&mut self, value: T) {
        self.values[self.index] = value;
        self.index = (self.index + 1) % N;
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T: Copy + Default, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::filled(T::default())
    }
}

impl<T, const N: usize> RingBuffer<T, N>
where
    T: Copy + Ord + Into<i64>,
{
    pub fn sum(&self) -> i64 {
        self.values.iter().map(|&v| v.into()).sum()
    }

    /// Arithmetic mean truncated toward zero.
    pub fn mean(&self) -> i64 {
        // N fits easily: buffers hold a few dozen samples at most.
        self.sum() / N as i64
    }

    pub fn min(&self) -> T {
        self.values.iter().copied().fold(self.values[0], T::min)
    }

    pub fn max(&self) -> T {
        self.values.iter().copied().fold(self.values[0], T::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn push_wraps_and_overwrites_oldest() {
        let mut r: RingBuffer<i32, 3> = RingBuffer::filled(0);
        for v in [1, 2, 3, 4] {
            r.push(v);
        }
        assert_eq!(r.as_slice(), &[4, 2, 3]);
        assert_eq!(r.sum(), 9);
        assert_eq!(r.min(), 2);
        assert_eq!(r.max(), 4);
    }

    #[test]
    fn mean_truncates_toward_zero() {
        let mut r: RingBuffer<i32, 4> = RingBuffer::filled(0);
        r.push(-3);
        assert_eq!(r.mean(), 0);
        r.fill(-7);
        r.push(-6);
        assert_eq!(r.mean(), -6);
    }

    #[test]
    fn fill_rewinds_index() {
        let mut r: RingBuffer<i16, 2> = RingBuffer::default();
        r.push(5);
        r.fill(1);
        r.push(9);
        assert_eq!(r.as_slice(), &[9, 1]);
    }

    proptest! {
        #[test]
        fn mean_lies_between_min_and_max(values in proptest::collection::vec(-1000i32..1000, 1..40)) {
            let mut r: RingBuffer<i32, 10> = RingBuffer::filled(values[0]);
            for v in &values {
                r.push(*v);
            }
            let mean = r.mean();
            prop_assert!(i64::from(r.min()) <= mean && mean <= i64::from(r.max()));
        }
    }
}
