use crate::data::ExpressionMatrix;
use crate::testing::{Alternative, TestResult};
use rayon::prelude::*;
use crate::testing::inference::{normal_cdf, normal_sf};
use std::cmp::Ordering;

/// Rank-sum test of every gene between two groups of cells.
///
/// Zeros are real observations in an expression matrix, so each gene's values are
/// densified over the cells of both groups before ranking.
pub fn mann_whitney_matrix_groups(
    matrix: &ExpressionMatrix,
    group1_indices: &[usize],
    group2_indices: &[usize],
    alternative: Alternative,
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

    let results: Vec<_> = (0..matrix.n_genes())
        .into_par_iter()
        .map(|gene| {
            let dense = matrix.gene_values(gene);
            let group1_values: Vec<f64> = group1_indices.iter().map(|&c| dense[c]).collect();
            let group2_values: Vec<f64> = group2_indices.iter().map(|&c| dense[c]).collect();
            mann_whitney(&group1_values, &group2_values, alternative)
        })
        .collect();

    Ok(results)
}

/// Two-sided rank-sum test of `x1` against the reference sample `x0`.
pub fn wilcoxon(x0: &[f64], x1: &[f64]) -> TestResult<f64> {
    mann_whitney(x1, x0, Alternative::TwoSided)
}

/// Mann-Whitney U test with average ranks for ties, tie-corrected variance and a
/// continuity correction on the normal approximation.
///
/// The statistic is the U of `x`. `Alternative::Greater` tests whether `x` tends to be
/// larger than `y`.
pub fn mann_whitney(x: &[f64], y: &[f64], alternative: Alternative) -> TestResult<f64> {
    let nx = x.len();
    let ny = y.len();

    if nx == 0 || ny == 0 {
        return TestResult::new(f64::NAN, 1.0); // Insufficient data
    }

    // Combine samples and assign group labels (0 for x, 1 for y)
    let mut combined: Vec<(f64, usize)> = Vec::with_capacity(nx + ny);
    combined.extend(x.iter().map(|&v| (v, 0)));
    combined.extend(y.iter().map(|&v| (v, 1)));
    combined.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    // Average ranks over ties, accumulating the tie correction term
    let n = nx + ny;
    let mut rank_sum_x = 0.0;
    let mut tie_term = 0.0;
    let mut i = 0;
    while i < n {
        let val = combined[i].0;
        let mut j = i + 1;
        while j < n && combined[j].0 == val {
            j += 1;
        }
        let rank = (i + j - 1) as f64 / 2.0 + 1.0;
        let in_x = combined[i..j].iter().filter(|(_, g)| *g == 0).count();
        rank_sum_x += rank * in_x as f64;
        let t = (j - i) as f64;
        tie_term += t * t * t - t;
        i = j;
    }

    let nx_f = nx as f64;
    let ny_f = ny as f64;
    let n_f = n as f64;
    let u_x = rank_sum_x - nx_f * (nx_f + 1.0) / 2.0;
    let mean_u = nx_f * ny_f / 2.0;
    let var_u = if n > 1 {
        nx_f * ny_f / 12.0 * ((n_f + 1.0) - tie_term / (n_f * (n_f - 1.0)))
    } else {
        0.0
    };

    if var_u <= 0.0 {
        // Every value tied: no ordering information
        return TestResult::new(u_x, 1.0)
            .with_effect_size(0.0)
            .with_metadata("z_score", 0.0)
            .with_metadata("mean_u", mean_u)
            .with_metadata("var_u", 0.0);
    }

    let sd_u = var_u.sqrt();
    let (z, p_value) = match alternative {
        Alternative::TwoSided => {
            let z = (((u_x - mean_u).abs() - 0.5).max(0.0)) / sd_u;
            (z * (u_x - mean_u).signum(), (2.0 * normal_sf(z)).min(1.0))
        }
        Alternative::Less => {
            let z = (u_x - mean_u + 0.5) / sd_u;
            (z, normal_cdf(z))
        }
        Alternative::Greater => {
            let z = (u_x - mean_u - 0.5) / sd_u;
            (z, normal_sf(z))
        }
    };

    let effect_size = z / n_f.sqrt();

    TestResult::new(u_x, p_value)
        .with_effect_size(effect_size)
        .with_standard_error(sd_u)
        .with_metadata("z_score", z)
        .with_metadata("mean_u", mean_u)
        .with_metadata("var_u", var_u)
        .with_metadata("nx", nx_f)
        .with_metadata("ny", ny_f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn matches_reference_without_ties() {
        // scipy.stats.mannwhitneyu([1, 2, 3, 4, 5], [6, 7, 8, 9, 10], alternative="two-sided",
        // method="asymptotic")
        let r = mann_whitney(
            &[1.0, 2.0, 3.0, 4.0, 5.0],
            &[6.0, 7.0, 8.0, 9.0, 10.0],
            Alternative::TwoSided,
        );
        assert_eq!(r.statistic, 0.0);
        assert_relative_eq!(r.p_value, 0.0121858, epsilon = 1e-6);
        assert!(r.metadata["z_score"] < 0.0);
    }

    #[test]
    fn tie_correction_shrinks_variance() {
        let x = [0.0, 0.0, 0.0, 1.0, 2.0];
        let y = [0.0, 0.0, 3.0, 4.0, 5.0];
        let r = mann_whitney(&x, &y, Alternative::TwoSided);
        // five tied zeros share rank 3; untied variance would be 25 * 11 / 12
        assert!(r.metadata["var_u"] < 25.0 * 11.0 / 12.0);
        assert_eq!(r.statistic, 7.0);
        assert_relative_eq!(r.metadata["var_u"], 25.0 / 12.0 * (11.0 - 120.0 / 90.0), epsilon = 1e-12);
    }

    #[test]
    fn one_sided_alternatives() {
        let x = [5.0, 6.0, 7.0, 8.0];
        let y = [1.0, 2.0, 3.0, 4.0];
        let greater = mann_whitney(&x, &y, Alternative::Greater);
        let less = mann_whitney(&x, &y, Alternative::Less);
        assert!(greater.p_value < 0.05);
        assert!(less.p_value > 0.95);
    }

    #[test]
    fn degenerate_inputs() {
        let r = mann_whitney(&[], &[1.0], Alternative::TwoSided);
        assert!(r.statistic.is_nan());
        assert_eq!(r.p_value, 1.0);

        let tied = mann_whitney(&[0.0, 0.0], &[0.0, 0.0, 0.0], Alternative::TwoSided);
        assert_eq!(tied.p_value, 1.0);
    }

    #[test]
    fn wilcoxon_orients_against_reference() {
        let r = wilcoxon(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]);
        assert_eq!(r.statistic, 9.0);
        assert!(r.metadata["z_score"] > 0.0);
    }

    #[test]
    fn matrix_groups_include_zeros() {
        let rows = vec![
            vec![0.0, 1.0],
            vec![0.0, 1.0],
            vec![0.0, 1.0],
            vec![3.0, 1.0],
            vec![4.0, 1.0],
            vec![5.0, 1.0],
        ];
        let matrix = ExpressionMatrix::from_rows(&rows).unwrap();
        let results =
            mann_whitney_matrix_groups(&matrix, &[0, 1, 2], &[3, 4, 5], Alternative::TwoSided).unwrap();
        assert_eq!(results[0].statistic, 0.0);
        assert!(results[0].p_value < 0.1);
        assert_eq!(results[1].p_value, 1.0);
        assert!(mann_whitney_matrix_groups(&matrix, &[0], &[], Alternative::TwoSided).is_err());
    }
}
