//! Least-squares fitting and the significance math the scale verdict needs.
//!
//! Implements ordinary least squares with R-squared and a two-sided p-value
//! for the slope via the Student's t distribution, evaluated through the
//! regularized incomplete beta function. No external stats dependency; the
//! continued-fraction evaluation is the standard Lentz form.

use anyhow::{Result, bail};
use serde::Serialize;

/// An ordinary-least-squares fit of `y = intercept + slope * x`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LinearFit {
    /// Fitted slope.
    pub slope: f64,
    /// Fitted intercept.
    pub intercept: f64,
    /// Coefficient of determination, in `[0, 1]`.
    pub r_squared: f64,
    /// Two-sided p-value for the null hypothesis of zero slope.
    pub slope_p_value: f64,
}

/// Fits a line through the points.
///
/// # Errors
///
/// Returns an error with fewer than three points or with no variance in `x`;
/// the slope test needs at least one residual degree of freedom.
pub fn fit_line(points: &[(f64, f64)]) -> Result<LinearFit> {
    let n = points.len();
    if n < 3 {
        bail!("need at least 3 points to fit and test a slope, got {n}");
    }
    #[allow(clippy::cast_precision_loss)]
    let nf = n as f64;

    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / nf;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / nf;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    for (x, y) in points {
        let dx = x - mean_x;
        let dy = y - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }
    if sxx <= 0.0 {
        bail!("x values are all identical, slope is undefined");
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let ss_res = (syy - slope * sxy).max(0.0);
    let r_squared = if syy > 0.0 { 1.0 - ss_res / syy } else { 1.0 };

    let df = nf - 2.0;
    let se_slope = (ss_res / df / sxx).sqrt();
    let slope_p_value = if se_slope > 0.0 {
        let t = slope / se_slope;
        student_t_two_sided_p(t, df)
    } else if slope == 0.0 {
        1.0
    } else {
        // Exact fit with nonzero slope: infinitely significant.
        0.0
    };

    Ok(LinearFit {
        slope,
        intercept,
        r_squared,
        slope_p_value,
    })
}

/// Two-sided tail probability of a Student's t statistic with `df` degrees
/// of freedom: `P(|T| >= |t|) = I_x(df/2, 1/2)` with `x = df / (df + t^2)`.
fn student_t_two_sided_p(t: f64, df: f64) -> f64 {
    let x = df / (df + t * t);
    regularized_incomplete_beta(df / 2.0, 0.5, x).clamp(0.0, 1.0)
}

/// The regularized incomplete beta function `I_x(a, b)`.
fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b)
        + a * x.ln()
        + b * (1.0 - x).ln();
    let front = ln_front.exp();
    // Use the continued fraction in its rapidly-converging region.
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

/// Lentz evaluation of the incomplete-beta continued fraction.
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 200;
    const EPS: f64 = 1e-14;
    const TINY: f64 = 1e-30;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < TINY {
        d = TINY;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITER {
        #[allow(clippy::cast_precision_loss)]
        let mf = m as f64;
        let m2 = 2.0 * mf;

        let numerator = mf * (b - mf) * x / ((qam + m2) * (a + m2));
        d = 1.0 + numerator * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + numerator / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        h *= d * c;

        let numerator = -(a + mf) * (qab + mf) * x / ((a + m2) * (qap + m2));
        d = 1.0 + numerator * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + numerator / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Lanczos approximation of `ln(Gamma(x))` for `x > 0`.
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 9] = [
        0.999_999_999_999_809_93,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_13,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    const G: f64 = 7.0;

    let x = x - 1.0;
    let mut sum = COEFFS[0];
    for (i, coeff) in COEFFS.iter().enumerate().skip(1) {
        #[allow(clippy::cast_precision_loss)]
        let if64 = i as f64;
        sum += coeff / (x + if64);
    }
    let t = x + G + 0.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + sum.ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_line_fits_perfectly() {
        let points: Vec<_> = (0..6).map(|i| (f64::from(i), 2.0 * f64::from(i) + 1.0)).collect();
        let fit = fit_line(&points).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-12);
        assert!((fit.intercept - 1.0).abs() < 1e-12);
        assert!((fit.r_squared - 1.0).abs() < 1e-12);
        assert!(fit.slope_p_value < 1e-10);
    }

    #[test]
    fn noisy_line_keeps_high_r_squared() {
        // Alternating small residuals around y = 3x + 5.
        let points: Vec<_> = (0..10)
            .map(|i| {
                let x = f64::from(i);
                let noise = if i % 2 == 0 { 0.2 } else { -0.2 };
                (x, 3.0 * x + 5.0 + noise)
            })
            .collect();
        let fit = fit_line(&points).unwrap();
        assert!((fit.slope - 3.0).abs() < 0.05);
        assert!(fit.r_squared > 0.99);
        assert!(fit.slope_p_value < 0.001);
    }

    #[test]
    fn flat_data_has_insignificant_slope() {
        let points: Vec<_> = (0..8)
            .map(|i| {
                let x = f64::from(i);
                let noise = if i % 2 == 0 { 1.0 } else { -1.0 };
                (x, 10.0 + noise)
            })
            .collect();
        let fit = fit_line(&points).unwrap();
        assert!(fit.slope.abs() < 0.2);
        assert!(fit.slope_p_value > 0.3);
    }

    #[test]
    fn t_distribution_matches_table_values() {
        // Critical values from standard t tables.
        let p = student_t_two_sided_p(2.228, 10.0);
        assert!((p - 0.05).abs() < 0.001, "t=2.228 df=10 gave p={p}");
        let p = student_t_two_sided_p(1.96, 1000.0);
        assert!((p - 0.05).abs() < 0.005, "t=1.96 df=1000 gave p={p}");
        let p = student_t_two_sided_p(0.0, 5.0);
        assert!((p - 1.0).abs() < 1e-9);
    }

    #[test]
    fn incomplete_beta_boundary_cases() {
        assert!(regularized_incomplete_beta(2.0, 3.0, 0.0).abs() < 1e-12);
        assert!((regularized_incomplete_beta(2.0, 3.0, 1.0) - 1.0).abs() < 1e-12);
        // I_x(1, 1) is the identity.
        assert!((regularized_incomplete_beta(1.0, 1.0, 0.37) - 0.37).abs() < 1e-9);
    }

    #[test]
    fn degenerate_inputs_are_rejected() {
        assert!(fit_line(&[(0.0, 1.0), (1.0, 2.0)]).is_err());
        assert!(fit_line(&[(1.0, 1.0), (1.0, 2.0), (1.0, 3.0)]).is_err());
    }
}
