//! Parametric statistical tests for single-cell data analysis.
//!
//! This module implements t-tests optimized for sparse single-cell expression
//! matrices. Per-gene sums and sums of squares are accumulated over the non-zero
//! entries only, and the test is computed from those moments.

use crate::data::ExpressionMatrix;
use crate::testing::{Alternative, TTestType, TestResult};
use rayon::prelude::*;
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Perform t-tests on all genes comparing two groups of cells.
///
/// # Arguments
///
/// * `matrix` - Expression matrix (cells × genes)
/// * `group1_indices` - Cells of the first group
/// * `group2_indices` - Cells of the second group
/// * `test_type` - Type of t-test to perform (Student's or Welch's)
///
/// # Returns
///
/// Vector of `TestResult` objects, one per gene, containing t-statistics and p-values.
/// The statistic is oriented as group 2 minus group 1.
pub fn t_test_matrix_groups(
    matrix: &ExpressionMatrix,
    group1_indices: &[usize],
    group2_indices: &[usize],
    test_type: TTestType,
) -> anyhow::Result<Vec<TestResult<f64>>> {
    if group1_indices.is_empty() || group2_indices.is_empty() {
        return Err(anyhow::anyhow!("Group indices cannot be empty"));
    }
    let n_cells = matrix.n_cells();
    if let Some(&bad) = group1_indices
        .iter()
        .chain(group2_indices)
        .find(|&&c| c >= n_cells)
    {
        return Err(anyhow::anyhow!(
            "Cell index {} out of bounds for {} cells",
            bad,
            n_cells
        ));
    }

    let mut mask1 = vec![false; n_cells];
    let mut mask2 = vec![false; n_cells];
    for &c in group1_indices {
        mask1[c] = true;
    }
    for &c in group2_indices {
        mask2[c] = true;
    }
    let n1 = group1_indices.len() as f64;
    let n2 = group2_indices.len() as f64;

    let results = (0..matrix.n_genes())
        .into_par_iter()
        .map(|gene| {
            let (sum1, sum_sq1) = matrix.gene_sums_masked(gene, &mask1);
            let (sum2, sum_sq2) = matrix.gene_sums_masked(gene, &mask2);
            fast_t_test_from_sums(sum2, sum_sq2, n2, sum1, sum_sq1, n1, test_type)
        })
        .collect();

    Ok(results)
}

/// Perform a t-test comparing two samples.
///
/// This function performs either Student's t-test (assuming equal variances) or
/// Welch's t-test (allowing unequal variances) on two samples. The statistic is
/// positive when `x` has the larger mean.
pub fn t_test(x: &[f64], y: &[f64], test_type: TTestType) -> TestResult<f64> {
    let (sum_x, sum_sq_x) = sums(x);
    let (sum_y, sum_sq_y) = sums(y);
    fast_t_test_from_sums(
        sum_x,
        sum_sq_x,
        x.len() as f64,
        sum_y,
        sum_sq_y,
        y.len() as f64,
        test_type,
    )
}

/// Welch's t-test on raw values of two groups; the statistic is `mean(x1) - mean(x0)` scaled.
pub fn t_test_raw(x0: &[f64], x1: &[f64]) -> TestResult<f64> {
    t_test(x1, x0, TTestType::Welch)
}

/// Welch's t-test from group moments.
///
/// `mu0`, `var0`, `n0` describe the reference group; the statistic is oriented as
/// group 1 minus group 0. Variances are unbiased sample variances.
pub fn t_test_moments(mu0: f64, mu1: f64, var0: f64, var1: f64, n0: f64, n1: f64) -> TestResult<f64> {
    if n0 < 2.0 || n1 < 2.0 {
        return TestResult::new(0.0, 1.0);
    }
    let term0 = var0.max(0.0) / n0;
    let term1 = var1.max(0.0) / n1;
    let combined_var = term0 + term1;
    let diff = mu1 - mu0;

    if combined_var <= 0.0 {
        return degenerate_result(diff);
    }

    let std_err = combined_var.sqrt();
    let t = diff / std_err;
    // Welch-Satterthwaite equation for degrees of freedom
    let df = combined_var * combined_var
        / (term0 * term0 / (n0 - 1.0) + term1 * term1 / (n1 - 1.0));

    TestResult::new(t, t_test_p_value(t, df))
        .with_degrees_of_freedom(df)
        .with_standard_error(std_err)
        .with_effect_size(diff)
}

/// Perform a t-test using precomputed summary statistics.
///
/// Computes the test directly from sum and sum-of-squares, avoiding the need to store
/// or iterate through the original data. Useful for sparse matrices where these
/// statistics are accumulated during one pass over the non-zero entries.
///
/// # Arguments
///
/// * `sum1`, `sum_sq1`, `n1` - Sum, sum of squares, and count for group 1
/// * `sum2`, `sum_sq2`, `n2` - Sum, sum of squares, and count for group 2
/// * `test_type` - Type of t-test to perform (Student's or Welch's)
pub fn fast_t_test_from_sums(
    sum1: f64,
    sum_sq1: f64,
    n1: f64,
    sum2: f64,
    sum_sq2: f64,
    n2: f64,
    test_type: TTestType,
) -> TestResult<f64> {
    // Early exit for insufficient sample sizes
    if n1 < 2.0 || n2 < 2.0 {
        return TestResult::new(0.0, 1.0);
    }

    let mean1 = sum1 / n1;
    let mean2 = sum2 / n2;

    // Computational formula; cancellation can leave tiny negative values
    let var1 = ((sum_sq1 - sum1 * sum1 / n1) / (n1 - 1.0)).max(0.0);
    let var2 = ((sum_sq2 - sum2 * sum2 / n2) / (n2 - 1.0)).max(0.0);

    match test_type {
        TTestType::Welch => t_test_moments(mean2, mean1, var2, var1, n2, n1),
        TTestType::Student => {
            let mean_diff = mean1 - mean2;
            let pooled_var = ((n1 - 1.0) * var1 + (n2 - 1.0) * var2) / (n1 + n2 - 2.0);
            if pooled_var <= 0.0 {
                return degenerate_result(mean_diff);
            }
            let std_err = (pooled_var * (1.0 / n1 + 1.0 / n2)).sqrt();
            let t = mean_diff / std_err;
            let df = n1 + n2 - 2.0;
            TestResult::new(t, t_test_p_value(t, df))
                .with_degrees_of_freedom(df)
                .with_standard_error(std_err)
                .with_effect_size(mean_diff)
        }
    }
}

/// Zero variance in both groups: identical means carry no evidence, distinct means
/// are perfectly separated.
fn degenerate_result(diff: f64) -> TestResult<f64> {
    if diff == 0.0 {
        TestResult::new(0.0, 1.0)
    } else {
        TestResult::new(diff.signum() * f64::INFINITY, 0.0).with_effect_size(diff)
    }
}

fn sums(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((0.0, 0.0), |(s, sq), &v| (s + v, sq + v * v))
}

/// Two-sided p-value of a t statistic.
pub(crate) fn t_test_p_value(t_stat: f64, df: f64) -> f64 {
    if t_stat.is_nan() || !(df > 0.0) {
        return 1.0;
    }
    if t_stat.is_infinite() {
        return 0.0;
    }
    match StudentsT::new(0.0, 1.0, df) {
        Ok(t_dist) => (2.0 * t_dist.sf(t_stat.abs())).min(1.0),
        Err(_) => 1.0,
    }
}

/// One-sided p-value of a finished t-test.
pub(crate) fn one_sided_p_value(result: &TestResult<f64>, alternative: Alternative) -> f64 {
    let t = result.statistic;
    let upper = match result.degrees_of_freedom {
        Some(df) => match StudentsT::new(0.0, 1.0, df) {
            Ok(t_dist) => t_dist.sf(t),
            Err(_) => return 1.0,
        },
        None if t == f64::INFINITY => 0.0,
        None if t == f64::NEG_INFINITY => 1.0,
        // equal constant groups or too few cells
        None if t == 0.0 => 0.5,
        None => return result.p_value,
    };
    match alternative {
        Alternative::Greater => upper,
        Alternative::Less => 1.0 - upper,
        Alternative::TwoSided => result.p_value,
    }
}
