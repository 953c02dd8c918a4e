/// Fixed-size ring of the last N binary request outcomes for one breaker key.
///
/// Tracks outcomes in insertion order only; there is no notion of wall time.
/// `push` overwrites the slot at the write index and advances modulo N, so
/// both memory and per-outcome cost stay constant on the hot path. The
/// failure count is maintained incrementally rather than recounted on query.
#[derive(Debug)]
pub struct RollingWindow {
    slots: Vec<bool>,
    write_index: usize,
    filled: bool,
    failures: usize,
}

impl RollingWindow {
    /// Create a window of `size` slots. Panics if `size` is 0; callers
    /// validate configuration before construction.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "window size must be greater than 0");
        Self {
            slots: vec![false; size],
            write_index: 0,
            filled: false,
            failures: 0,
        }
    }

    /// Record one outcome, evicting the oldest once the ring has wrapped.
    pub fn push(&mut self, failure: bool) {
        if self.filled && self.slots[self.write_index] {
            self.failures -= 1;
        }
        self.slots[self.write_index] = failure;
        if failure {
            self.failures += 1;
        }
        self.write_index = (self.write_index + 1) % self.slots.len();
        if self.write_index == 0 {
            self.filled = true;
        }
    }

    /// Number of outcomes currently held, up to the window size.
    pub fn count(&self) -> usize {
        if self.filled {
            self.slots.len()
        } else {
            self.write_index
        }
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Fraction of held outcomes that were failures; 0.0 when empty.
    pub fn failure_rate(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.failures as f64 / count as f64
    }

    pub fn reset(&mut self) {
        self.slots.fill(false);
        self.write_index = 0;
        self.filled = false;
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_has_zero_rate() {
        let w = RollingWindow::new(5);
        assert_eq!(w.count(), 0);
        assert_eq!(w.failures(), 0);
        assert_eq!(w.failure_rate(), 0.0);
    }

    #[test]
    fn counts_before_wrapping() {
        let mut w = RollingWindow::new(4);
        w.push(true);
        w.push(false);
        w.push(true);
        assert_eq!(w.count(), 3);
        assert_eq!(w.failures(), 2);
        assert_eq!(w.failure_rate(), 0.5);
    }

    #[test]
    fn wrapping_evicts_oldest() {
        let mut w = RollingWindow::new(3);
        w.push(true);
        w.push(true);
        w.push(true);
        assert_eq!(w.failures(), 3);

        // Overwrites the first failure with a success.
        w.push(false);
        assert_eq!(w.count(), 3);
        assert_eq!(w.failures(), 2);

        w.push(false);
        w.push(false);
        assert_eq!(w.failures(), 0);
        assert_eq!(w.failure_rate(), 0.0);
    }

    #[test]
    fn failures_match_last_n_pushes() {
        // Window arithmetic invariant: failures equals the sum over the
        // last min(N, len) pushed outcomes, for an arbitrary sequence.
        let outcomes = [
            true, false, false, true, true, false, true, false, false, false, true, true,
        ];
        let n = 5;
        let mut w = RollingWindow::new(n);
        for (i, &o) in outcomes.iter().enumerate() {
            w.push(o);
            let tail_start = (i + 1).saturating_sub(n);
            let expected = outcomes[tail_start..=i].iter().filter(|&&f| f).count();
            assert_eq!(w.failures(), expected, "after push {i}");
            assert!((0.0..=1.0).contains(&w.failure_rate()));
        }
    }

    #[test]
    fn reset_clears_ring_and_filled_flag() {
        let mut w = RollingWindow::new(2);
        w.push(true);
        w.push(true);
        assert_eq!(w.count(), 2);

        w.reset();
        assert_eq!(w.count(), 0);
        assert_eq!(w.failures(), 0);
        assert_eq!(w.failure_rate(), 0.0);

        w.push(false);
        assert_eq!(w.count(), 1);
    }

    #[test]
    fn size_one_window() {
        let mut w = RollingWindow::new(1);
        w.push(true);
        assert_eq!(w.count(), 1);
        assert_eq!(w.failure_rate(), 1.0);
        w.push(false);
        assert_eq!(w.count(), 1);
        assert_eq!(w.failure_rate(), 0.0);
    }
}
