//! Fixed-size rolling windows with O(1) running moments.
//!
//! Sums are kept over values shifted by a reference point near the data,
//! which keeps `Σx² - (Σx)²/n` from cancelling catastrophically at price
//! levels like 60000. The sums are rebuilt from the stored values every
//! `capacity` pushes with a fresh shift, so drift from repeated add/subtract
//! stays bounded.

use std::collections::VecDeque;

/// Sample moments of a two-series window (divisor `n - 1`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairMoments {
    pub n: usize,
    pub mean_a: f64,
    pub mean_b: f64,
    pub var_a: f64,
    pub var_b: f64,
    pub cov_ab: f64,
}

/// Rolling window of aligned `(a, b)` observations.
#[derive(Debug, Clone)]
pub struct RollingPairWindow {
    capacity: usize,
    points: VecDeque<(f64, f64)>,
    shift_a: f64,
    shift_b: f64,
    sum_a: f64,
    sum_b: f64,
    sum_aa: f64,
    sum_bb: f64,
    sum_ab: f64,
    /// Pushes since the sums were last rebuilt.
    since_resync: usize,
}

impl RollingPairWindow {
    /// Create a window holding at most `capacity` points.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            points: VecDeque::with_capacity(capacity + 1),
            shift_a: 0.0,
            shift_b: 0.0,
            sum_a: 0.0,
            sum_b: 0.0,
            sum_aa: 0.0,
            sum_bb: 0.0,
            sum_ab: 0.0,
            since_resync: 0,
        }
    }

    /// Append a point, evicting and returning the oldest when full.
    pub fn push(&mut self, a: f64, b: f64) -> Option<(f64, f64)> {
        if self.points.is_empty() {
            self.shift_a = a;
            self.shift_b = b;
        }

        let evicted = if self.points.len() == self.capacity {
            self.points.pop_front()
        } else {
            None
        };
        if let Some((old_a, old_b)) = evicted {
            let (da, db) = (old_a - self.shift_a, old_b - self.shift_b);
            self.sum_a -= da;
            self.sum_b -= db;
            self.sum_aa -= da * da;
            self.sum_bb -= db * db;
            self.sum_ab -= da * db;
        }

        self.points.push_back((a, b));
        let (da, db) = (a - self.shift_a, b - self.shift_b);
        self.sum_a += da;
        self.sum_b += db;
        self.sum_aa += da * da;
        self.sum_bb += db * db;
        self.sum_ab += da * db;

        self.since_resync += 1;
        if self.since_resync >= self.capacity {
            self.resync();
        }
        evicted
    }

    /// Rebuild the sums exactly around the current mean.
    fn resync(&mut self) {
        let n = self.points.len() as f64;
        if n == 0.0 {
            return;
        }
        self.shift_a = self.points.iter().map(|p| p.0).sum::<f64>() / n;
        self.shift_b = self.points.iter().map(|p| p.1).sum::<f64>() / n;
        self.sum_a = 0.0;
        self.sum_b = 0.0;
        self.sum_aa = 0.0;
        self.sum_bb = 0.0;
        self.sum_ab = 0.0;
        for &(a, b) in &self.points {
            let (da, db) = (a - self.shift_a, b - self.shift_b);
            self.sum_a += da;
            self.sum_b += db;
            self.sum_aa += da * da;
            self.sum_bb += db * db;
            self.sum_ab += da * db;
        }
        self.since_resync = 0;
    }

    /// Sample moments, `None` with fewer than two points.
    pub fn moments(&self) -> Option<PairMoments> {
        let n = self.points.len();
        if n < 2 {
            return None;
        }
        let nf = n as f64;
        let denom = nf - 1.0;
        Some(PairMoments {
            n,
            mean_a: self.shift_a + self.sum_a / nf,
            mean_b: self.shift_b + self.sum_b / nf,
            var_a: ((self.sum_aa - self.sum_a * self.sum_a / nf) / denom).max(0.0),
            var_b: ((self.sum_bb - self.sum_b * self.sum_b / nf) / denom).max(0.0),
            cov_ab: (self.sum_ab - self.sum_a * self.sum_b / nf) / denom,
        })
    }

    /// Most recent point.
    pub fn latest(&self) -> Option<(f64, f64)> {
        self.points.back().copied()
    }

    /// Points oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &(f64, f64)> + '_ {
        self.points.iter()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check if the window is full.
    pub fn is_full(&self) -> bool {
        self.points.len() == self.capacity
    }
}

/// Rolling mean and sample variance of a single series.
#[derive(Debug, Clone)]
pub struct RollingStats {
    capacity: usize,
    values: VecDeque<f64>,
    shift: f64,
    sum: f64,
    sum_sq: f64,
    since_resync: usize,
}

impl RollingStats {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity + 1),
            shift: 0.0,
            sum: 0.0,
            sum_sq: 0.0,
            since_resync: 0,
        }
    }

    /// Add a value, evicting the oldest when full.
    pub fn push(&mut self, value: f64) -> Option<f64> {
        if self.values.is_empty() {
            self.shift = value;
        }
        let evicted = if self.values.len() == self.capacity {
            self.values.pop_front()
        } else {
            None
        };
        if let Some(old) = evicted {
            let d = old - self.shift;
            self.sum -= d;
            self.sum_sq -= d * d;
        }

        self.values.push_back(value);
        let d = value - self.shift;
        self.sum += d;
        self.sum_sq += d * d;

        self.since_resync += 1;
        if self.since_resync >= self.capacity {
            let n = self.values.len() as f64;
            self.shift = self.values.iter().sum::<f64>() / n;
            self.sum = self.values.iter().map(|v| v - self.shift).sum();
            self.sum_sq = self.values.iter().map(|v| (v - self.shift).powi(2)).sum();
            self.since_resync = 0;
        }
        evicted
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.shift + self.sum / self.values.len() as f64)
    }

    /// Sample variance, `None` with fewer than two values.
    pub fn variance(&self) -> Option<f64> {
        let n = self.values.len();
        if n < 2 {
            return None;
        }
        let nf = n as f64;
        Some(((self.sum_sq - self.sum * self.sum / nf) / (nf - 1.0)).max(0.0))
    }

    /// Values oldest first.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.capacity);
    }
}
