//! Fixed-size trailing window with O(1) push/evict and an incremental sum

/// Ring buffer of the last `capacity` samples, zero-filled at creation
///
/// Starts full of zeros so the mean is always `sum / capacity`; a signal has to
/// persist for a whole window before the average reaches its level.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    buf: Vec<f64>,
    head: usize,
    sum: f64,
    pushes: u64,
}

/// Recompute the sum from scratch this often to shed float drift
const RESUM_INTERVAL: u64 = 4096;

impl RollingWindow {
    /// Create a window of `capacity` samples (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self { buf: vec![0.0; capacity.max(1)], head: 0, sum: 0.0, pushes: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Push a sample, evicting the oldest. Non-finite input is stored as 0.
    pub fn push(&mut self, value: f64) {
        let value = if value.is_finite() { value } else { 0.0 };
        let evicted = std::mem::replace(&mut self.buf[self.head], value);
        self.head = (self.head + 1) % self.buf.len();
        self.sum += value - evicted;
        self.pushes += 1;
        if self.pushes % RESUM_INTERVAL == 0 {
            self.sum = self.buf.iter().sum();
        }
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> f64 {
        self.sum / self.buf.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_counts_zero_prefill() {
        let mut window = RollingWindow::new(5);
        window.push(0.3);
        assert!((window.mean() - 0.06).abs() < 1e-12);
        for _ in 0..4 {
            window.push(0.3);
        }
        assert!((window.mean() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_evicts_oldest() {
        let mut window = RollingWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            window.push(v);
        }
        assert!((window.sum() - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_stored_as_zero() {
        let mut window = RollingWindow::new(2);
        window.push(f64::NAN);
        window.push(f64::INFINITY);
        assert_eq!(window.sum(), 0.0);
        assert!(window.mean().is_finite());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut window = RollingWindow::new(0);
        assert_eq!(window.capacity(), 1);
        window.push(2.0);
        assert_eq!(window.mean(), 2.0);
    }

    #[test]
    fn test_sum_stays_consistent_over_long_runs() {
        let mut window = RollingWindow::new(7);
        for i in 0..10_000 {
            window.push((i % 13) as f64 * 0.1);
        }
        let exact: f64 = window.buf.iter().sum();
        assert!((window.sum() - exact).abs() < 1e-9);
    }
}
