//! Mathy related things
//!
//! Angles plus the small amount of statistics the calibration needs:
//! means and ordinary least squares straight line fits.

use derive_more::{Display, From};

/// RA differences above this are taken to straddle the 0/360 seam.
const RA_SEAM_THRESHOLD: f64 = 355.0;

/// The base angle type used in the crate
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, From)]
pub struct Degree(f64);
impl Default for Degree {
    fn default() -> Self {
        Self(0.0)
    }
}
impl Degree {
    pub fn new(deg: f64) -> Self {
        Self(deg)
    }
    pub fn degrees(&self) -> f64 {
        self.0
    }

    /// Absolute difference between two right ascensions.
    ///
    /// Values that land on either side of the 0/360 seam (raw difference
    /// above 355°) are folded back, so 359.97 and 0.02 are 0.05 apart.
    pub fn ra_difference(&self, other: Degree) -> f64 {
        let diff = (self.0 - other.0).abs();
        if diff > RA_SEAM_THRESHOLD {
            (360.0 - diff).abs()
        } else {
            diff
        }
    }
}

/// Result of fitting `y = slope * x + intercept`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    /// Pearson correlation coefficient, NaN when `y` has no variance
    pub r_value: f64,
    /// Standard error of the slope, NaN with fewer than 3 points
    pub std_err: f64,
}

impl LinearFit {
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Ordinary least squares fit of `y` against `x`.
///
/// Returns `None` when the slices differ in length, hold fewer than two
/// points, or `x` has no spread (the slope is undefined).
pub fn linear_regression(x: &[f64], y: &[f64]) -> Option<LinearFit> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }

    let n = x.len() as f64;
    let mean_x = mean(x)?;
    let mean_y = mean(y)?;

    let mut sxx = 0.0;
    let mut syy = 0.0;
    let mut sxy = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }

    if sxx < 1e-12 {
        return None;
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    let r_value = if syy < 1e-12 {
        f64::NAN
    } else {
        sxy / (sxx * syy).sqrt()
    };

    let std_err = if x.len() > 2 {
        let residual: f64 = x
            .iter()
            .zip(y)
            .map(|(xi, yi)| (yi - (slope * xi + intercept)).powi(2))
            .sum();
        (residual / (n - 2.0) / sxx).sqrt()
    } else {
        f64::NAN
    };

    Some(LinearFit {
        slope,
        intercept,
        r_value,
        std_err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ra_difference_across_seam() {
        let a = Degree::new(359.97);
        let b = Degree::new(0.02);
        assert_relative_eq!(a.ra_difference(b), 0.05, epsilon = 1e-9);
        assert_relative_eq!(b.ra_difference(a), 0.05, epsilon = 1e-9);
    }

    #[test]
    fn test_ra_difference_plain() {
        let a = Degree::new(120.5);
        let b = Degree::new(120.25);
        assert_relative_eq!(a.ra_difference(b), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_linear_regression_exact_line() {
        let x = [1.0, 1.5, 2.0, 2.5];
        let y: Vec<f64> = x.iter().map(|v| 0.3 * v + 1.2).collect();
        let fit = linear_regression(&x, &y).unwrap();
        assert_relative_eq!(fit.slope, 0.3, epsilon = 1e-12);
        assert_relative_eq!(fit.intercept, 1.2, epsilon = 1e-12);
        assert_relative_eq!(fit.r_value, 1.0, epsilon = 1e-12);
        assert_relative_eq!(fit.std_err, 0.0, epsilon = 1e-9);
        assert_relative_eq!(fit.eval(3.0), 2.1, epsilon = 1e-12);
    }

    #[test]
    fn test_linear_regression_noisy() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [2.1, 3.9, 6.2, 7.8, 10.1];
        let fit = linear_regression(&x, &y).unwrap();
        assert_relative_eq!(fit.slope, 1.99, epsilon = 1e-9);
        assert_relative_eq!(fit.intercept, 0.05, epsilon = 1e-9);
        assert!(fit.r_value > 0.99);
    }

    #[test]
    fn test_linear_regression_degenerate() {
        assert!(linear_regression(&[1.0], &[2.0]).is_none());
        assert!(linear_regression(&[1.0, 1.0, 1.0], &[2.0, 3.0, 4.0]).is_none());
        assert!(linear_regression(&[1.0, 2.0], &[2.0]).is_none());
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), None);
        assert_relative_eq!(mean(&[1.0, 2.0, 6.0]).unwrap(), 3.0);
    }
}
