//! Cube clock to host clock mapping.
//!
//! The cube reports a free-running millisecond counter that drifts against the
//! host clock. A least-squares line over the most recent observations maps
//! cube time onto host time.

use std::collections::VecDeque;

pub const DEFAULT_HISTORY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearFit {
    /// Uncalibrated pass-through.
    pub const IDENTITY: Self = Self {
        slope: 1.0,
        intercept: 0.0,
    };

    pub fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Ordinary least squares over `(cube_time, host_time)` points.
pub fn linear_fit(points: impl IntoIterator<Item = (f64, f64)>) -> LinearFit {
    let mut n = 0.0;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for (x, y) in points {
        n += 1.0;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }

    if n < 2.0 {
        return LinearFit::IDENTITY;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < 1e-10 {
        return LinearFit::IDENTITY;
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n;
    LinearFit { slope, intercept }
}

#[derive(Debug, Clone)]
pub struct ClockSync {
    history: VecDeque<(f64, f64)>,
    capacity: usize,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl ClockSync {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn observe(&mut self, cube_time: f64, host_time: f64) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back((cube_time, host_time));
    }

    /// Fits a line over the retained history.
    pub fn fit(&self) -> LinearFit {
        linear_fit(self.history.iter().copied())
    }

    pub fn predict(&self, cube_time: f64) -> f64 {
        self.fit().predict(cube_time)
    }

    pub fn is_calibrated(&self) -> bool {
        self.history.len() >= 2
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncalibrated_is_identity() {
        let mut sync = ClockSync::default();
        assert_eq!(sync.fit(), LinearFit::IDENTITY);
        sync.observe(10.0, 1000.0);
        assert_eq!(sync.fit(), LinearFit::IDENTITY);
        assert_eq!(sync.predict(42.0), 42.0);
        assert!(!sync.is_calibrated());
    }

    #[test]
    fn test_fit_recovers_exact_line() {
        let mut sync = ClockSync::default();
        for x in 0..10 {
            let x = x as f64 * 37.0;
            sync.observe(x, 2.0 * x + 5.0);
        }
        let fit = sync.fit();
        assert!((fit.slope - 2.0).abs() < 1e-9);
        assert!((fit.intercept - 5.0).abs() < 1e-6);
        assert!((sync.predict(1000.0) - 2005.0).abs() < 1e-6);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut sync = ClockSync::new(5);
        // Early points lie on a different line and must age out.
        for x in 0..5 {
            sync.observe(x as f64, 100.0 * x as f64);
        }
        for x in 5..10 {
            sync.observe(x as f64, x as f64 + 1.0);
        }
        assert_eq!(sync.len(), 5);
        let fit = sync.fit();
        assert!((fit.slope - 1.0).abs() < 1e-9);
        assert!((fit.intercept - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_points_fall_back_to_identity() {
        let fit = linear_fit([(3.0, 10.0), (3.0, 20.0)]);
        assert_eq!(fit, LinearFit::IDENTITY);
    }
}
