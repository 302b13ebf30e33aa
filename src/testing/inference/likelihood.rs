//! Tests on maximum likelihood estimates: Wald, likelihood ratio and the
//! two-coefficient z-test used for fast pairwise comparisons.
//!
//! All functions work on one entry per gene and return one p-value per gene.

use crate::error::DeError;
use crate::testing::inference::normal_sf;
use log::warn;
use nalgebra::{DMatrix, DVector};
use statrs::distribution::{ChiSquared, ContinuousCDF};

fn check_lengths(what: &str, expected: usize, actual: usize) -> anyhow::Result<()> {
    if expected != actual {
        return Err(DeError::dimension(what, expected, actual).into());
    }
    Ok(())
}

/// Upper tail of the chi-squared distribution; NaN for invalid input.
pub fn chi_squared_sf(statistic: f64, df: f64) -> f64 {
    if !statistic.is_finite() || !(df > 0.0) {
        return f64::NAN;
    }
    match ChiSquared::new(df) {
        Ok(dist) => dist.sf(statistic.max(0.0)),
        Err(_) => f64::NAN,
    }
}

/// Two-sided p-value of a standard normal statistic.
pub fn two_sided_normal_p_value(z: f64) -> f64 {
    if z.is_nan() {
        return f64::NAN;
    }
    (2.0 * normal_sf(z.abs())).min(1.0)
}

/// Likelihood ratio test between nested models.
///
/// The deviance `2 * (ll_full - ll_reduced)` is compared against a chi-squared
/// distribution with `df_full - df_reduced` degrees of freedom. Negative deviances
/// arise only from numerical noise in the fits; they are clamped to zero.
pub fn likelihood_ratio_test(
    ll_full: &[f64],
    ll_reduced: &[f64],
    df_full: usize,
    df_reduced: usize,
) -> anyhow::Result<Vec<f64>> {
    check_lengths("reduced log-likelihoods", ll_full.len(), ll_reduced.len())?;
    if df_full <= df_reduced {
        return Err(DeError::InvalidParameter(format!(
            "full model must have more parameters than the reduced one ({} <= {})",
            df_full, df_reduced
        ))
        .into());
    }
    let delta_df = (df_full - df_reduced) as f64;

    let mut n_negative = 0usize;
    let p_values = ll_full
        .iter()
        .zip(ll_reduced)
        .map(|(&full, &reduced)| {
            let deviance = 2.0 * (full - reduced);
            if deviance < 0.0 {
                n_negative += 1;
                return chi_squared_sf(0.0, delta_df);
            }
            chi_squared_sf(deviance, delta_df)
        })
        .collect();

    if n_negative > 0 {
        warn!(
            "likelihood ratio test: {} of {} statistics were negative and clamped to zero",
            n_negative,
            ll_full.len()
        );
    }
    Ok(p_values)
}

/// Wald test of single coefficients against `theta0`.
///
/// A zero standard deviation gives p = 1 when the estimate equals `theta0` and
/// p = 0 otherwise.
pub fn wald_test(theta_mle: &[f64], theta_sd: &[f64], theta0: f64) -> anyhow::Result<Vec<f64>> {
    check_lengths("coefficient standard deviations", theta_mle.len(), theta_sd.len())?;
    Ok(theta_mle
        .iter()
        .zip(theta_sd)
        .map(|(&mle, &sd)| wald_p_value(mle - theta0, sd))
        .collect())
}

fn wald_p_value(diff: f64, sd: f64) -> f64 {
    if diff.is_nan() || sd.is_nan() {
        return f64::NAN;
    }
    if sd == 0.0 {
        return if diff == 0.0 { 1.0 } else { 0.0 };
    }
    two_sided_normal_p_value(diff / sd)
}

/// Multi-parameter Wald statistic `(theta - theta0)' Sigma^-1 (theta - theta0)`
/// for one gene. NaN estimates and singular or non-finite covariances yield NaN.
pub fn wald_chisq_statistic(theta_mle: &[f64], theta_covar: &DMatrix<f64>, theta0: f64) -> anyhow::Result<f64> {
    let k = theta_mle.len();
    if theta_covar.nrows() != k || theta_covar.ncols() != k {
        return Err(DeError::dimension("covariance rows", k, theta_covar.nrows()).into());
    }
    if k == 0 {
        return Err(DeError::InvalidParameter("no coefficients to test".into()).into());
    }
    if theta_mle.iter().any(|t| t.is_nan()) || theta_covar.iter().any(|c| !c.is_finite()) {
        return Ok(f64::NAN);
    }
    let diff = DVector::from_iterator(k, theta_mle.iter().map(|t| t - theta0));
    Ok(match theta_covar.clone().cholesky() {
        Some(chol) => diff.dot(&chol.solve(&diff)),
        None => f64::NAN,
    })
}

/// Multi-parameter Wald test for one gene.
///
/// The statistic from [`wald_chisq_statistic`] follows a chi-squared distribution
/// with as many degrees of freedom as tested coefficients. A singular covariance
/// yields NaN.
pub fn wald_test_chisq(theta_mle: &[f64], theta_covar: &DMatrix<f64>, theta0: f64) -> anyhow::Result<f64> {
    let statistic = wald_chisq_statistic(theta_mle, theta_covar, theta0)?;
    Ok(chi_squared_sf(statistic, theta_mle.len() as f64))
}

/// z-test for the difference of two independently estimated coefficients.
pub fn two_coef_z_test(
    theta_mle0: &[f64],
    theta_mle1: &[f64],
    theta_sd0: &[f64],
    theta_sd1: &[f64],
) -> anyhow::Result<Vec<f64>> {
    let n = theta_mle0.len();
    check_lengths("second coefficient estimates", n, theta_mle1.len())?;
    check_lengths("first coefficient standard deviations", n, theta_sd0.len())?;
    check_lengths("second coefficient standard deviations", n, theta_sd1.len())?;
    Ok((0..n)
        .map(|i| {
            let sd = (theta_sd0[i] * theta_sd0[i] + theta_sd1[i] * theta_sd1[i]).sqrt();
            wald_p_value(theta_mle0[i] - theta_mle1[i], sd)
        })
        .collect())
}
