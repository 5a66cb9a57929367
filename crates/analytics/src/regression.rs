//! Closed-form statistics from window moments.

use crate::window::PairMoments;

/// OLS fit of `a = intercept + slope * b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OlsFit {
    pub slope: f64,
    pub intercept: f64,
}

/// Whether `variance` is negligible next to `scale`.
///
/// `scale` is a squared magnitude of the data (e.g. `mean²`), so constant
/// prices at any level count as zero variance despite rounding.
#[inline]
pub fn is_negligible(variance: f64, scale: f64, epsilon: f64) -> bool {
    !variance.is_finite() || variance <= epsilon * scale.abs().max(1.0)
}

/// OLS slope and intercept, `None` when the regressor is constant.
pub fn ols_fit(m: &PairMoments, epsilon: f64) -> Option<OlsFit> {
    if is_negligible(m.var_b, m.mean_b * m.mean_b, epsilon) {
        return None;
    }
    let slope = m.cov_ab / m.var_b;
    let intercept = m.mean_a - slope * m.mean_b;
    (slope.is_finite() && intercept.is_finite()).then_some(OlsFit { slope, intercept })
}

/// Pearson correlation, `None` when either series is constant.
pub fn correlation(m: &PairMoments, epsilon: f64) -> Option<f64> {
    if is_negligible(m.var_a, m.mean_a * m.mean_a, epsilon)
        || is_negligible(m.var_b, m.mean_b * m.mean_b, epsilon)
    {
        return None;
    }
    let r = m.cov_ab / (m.var_a.sqrt() * m.var_b.sqrt());
    r.is_finite().then(|| r.clamp(-1.0, 1.0))
}

/// Mean and sample variance of `a - beta * b` over the window.
pub fn spread_moments(m: &PairMoments, beta: f64) -> (f64, f64) {
    let mean = m.mean_a - beta * m.mean_b;
    let var = m.var_a + beta * beta * m.var_b - 2.0 * beta * m.cov_ab;
    (mean, var.max(0.0))
}

/// Theil-Sen slope of `a` on `b`: the median of all pairwise slopes.
///
/// Pairs whose `b` values coincide are skipped. `None` when no pair has
/// distinct `b` values. O(n²) in the number of points.
pub fn theil_sen_slope<'a>(points: impl IntoIterator<Item = &'a (f64, f64)>) -> Option<f64> {
    let points: Vec<(f64, f64)> = points.into_iter().copied().collect();
    let mut slopes = Vec::with_capacity(points.len() * points.len().saturating_sub(1) / 2);
    for (i, &(a_i, b_i)) in points.iter().enumerate() {
        for &(a_j, b_j) in &points[i + 1..] {
            let db = b_j - b_i;
            if db != 0.0 {
                let slope = (a_j - a_i) / db;
                if slope.is_finite() {
                    slopes.push(slope);
                }
            }
        }
    }
    if slopes.is_empty() {
        return None;
    }
    slopes.sort_unstable_by(f64::total_cmp);
    let mid = slopes.len() / 2;
    let median = if slopes.len() % 2 == 0 {
        (slopes[mid - 1] + slopes[mid]) / 2.0
    } else {
        slopes[mid]
    };
    Some(median)
}

/// Pearson correlation of two equally long slices.
pub fn pearson(a: &[f64], b: &[f64], epsilon: f64) -> Option<f64> {
    let n = a.len();
    if n < 2 || n != b.len() {
        return None;
    }
    let nf = n as f64;
    let mean_a = a.iter().sum::<f64>() / nf;
    let mean_b = b.iter().sum::<f64>() / nf;
    let (mut saa, mut sbb, mut sab) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        saa += dx * dx;
        sbb += dy * dy;
        sab += dx * dy;
    }
    let m = PairMoments {
        n,
        mean_a,
        mean_b,
        var_a: saa / (nf - 1.0),
        var_b: sbb / (nf - 1.0),
        cov_ab: sab / (nf - 1.0),
    };
    correlation(&m, epsilon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::RollingPairWindow;
    use approx::assert_relative_eq;

    fn moments(points: &[(f64, f64)]) -> PairMoments {
        let mut w = RollingPairWindow::new(points.len());
        for &(a, b) in points {
            w.push(a, b);
        }
        w.moments().unwrap()
    }

    #[test]
    fn test_exact_linear_relation() {
        let points: Vec<_> = (0..20).map(|i| (5.0 + 2.5 * i as f64, i as f64)).collect();
        let m = moments(&points);
        let fit = ols_fit(&m, 1e-12).unwrap();
        assert_relative_eq!(fit.slope, 2.5, epsilon = 1e-10);
        assert_relative_eq!(fit.intercept, 5.0, epsilon = 1e-9);
        assert_relative_eq!(correlation(&m, 1e-12).unwrap(), 1.0, epsilon = 1e-12);

        let (mean, var) = spread_moments(&m, fit.slope);
        assert_relative_eq!(mean, 5.0, epsilon = 1e-9);
        assert!(var < 1e-9);
    }

    #[test]
    fn test_negative_correlation() {
        let points: Vec<_> = (0..10).map(|i| (100.0 - i as f64, 50.0 + i as f64)).collect();
        let r = correlation(&moments(&points), 1e-12).unwrap();
        assert_relative_eq!(r, -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_regressor_undefined() {
        let points: Vec<_> = (0..10).map(|i| (i as f64, 3_000.0)).collect();
        let m = moments(&points);
        assert!(ols_fit(&m, 1e-12).is_none());
        assert!(correlation(&m, 1e-12).is_none());
    }

    #[test]
    fn test_theil_sen_ignores_outlier() {
        let mut points: Vec<_> = (0..10).map(|i| (2.0 * i as f64 + 1.0, i as f64)).collect();
        points[9].0 = 1_000.0;
        assert_eq!(theil_sen_slope(&points), Some(2.0));
        // OLS is dragged far off by the same point.
        assert!(ols_fit(&moments(&points), 1e-12).unwrap().slope > 20.0);
    }

    #[test]
    fn test_theil_sen_median_and_degenerate() {
        // slopes 1, 2, 1.5, 3, 2; the pair with equal b is skipped
        let points = [(0.0, 0.0), (1.0, 1.0), (4.0, 2.0), (3.0, 2.0)];
        assert_eq!(theil_sen_slope(&points), Some(2.0));

        // six slopes, median of the middle two: (2 + 7/3) / 2
        let points = [(0.0, 0.0), (1.0, 1.0), (3.0, 2.0), (7.0, 3.0)];
        assert_relative_eq!(theil_sen_slope(&points).unwrap(), 13.0 / 6.0, epsilon = 1e-12);

        let flat = [(1.0, 5.0), (2.0, 5.0), (3.0, 5.0)];
        assert_eq!(theil_sen_slope(&flat), None);
        assert_eq!(theil_sen_slope(&[(1.0, 1.0)]), None);
    }

    #[test]
    fn test_pearson_slices() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [2.0, 4.0, 6.0, 8.0];
        assert_relative_eq!(pearson(&a, &b, 1e-12).unwrap(), 1.0, epsilon = 1e-12);
        assert!(pearson(&a, &b[..3], 1e-12).is_none());
        assert!(pearson(&a, &[5.0; 4], 1e-12).is_none());
    }
}
