use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Multiple testing correction methods to control for false positives
/// when performing many statistical tests simultaneously.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMethod {
    Bonferroni,
    #[serde(alias = "fdr_bh", alias = "bh")]
    BenjaminiHochberg,
    #[serde(alias = "fdr_by", alias = "by")]
    BenjaminiYekutieli,
    #[serde(alias = "holm")]
    HolmBonferroni,
    Hochberg,
    Storey { lambda: f64 },
}

impl CorrectionMethod {
    pub fn name(&self) -> &'static str {
        match self {
            CorrectionMethod::Bonferroni => "bonferroni",
            CorrectionMethod::BenjaminiHochberg => "fdr_bh",
            CorrectionMethod::BenjaminiYekutieli => "fdr_by",
            CorrectionMethod::HolmBonferroni => "holm",
            CorrectionMethod::Hochberg => "hochberg",
            CorrectionMethod::Storey { .. } => "storey",
        }
    }

    /// Apply the method to a complete family of valid p-values.
    pub fn apply(&self, p_values: &[f64]) -> Result<Vec<f64>> {
        match *self {
            CorrectionMethod::Bonferroni => bonferroni_correction(p_values),
            CorrectionMethod::BenjaminiHochberg => benjamini_hochberg_correction(p_values),
            CorrectionMethod::BenjaminiYekutieli => benjamini_yekutieli_correction(p_values),
            CorrectionMethod::HolmBonferroni => holm_bonferroni_correction(p_values),
            CorrectionMethod::Hochberg => hochberg_correction(p_values),
            CorrectionMethod::Storey { lambda } => storey_qvalues(p_values, lambda),
        }
    }
}

/// Correct p-values, leaving NaN entries untouched.
///
/// NaN p-values come from genes that could not be tested (for example fits with a
/// singular information matrix). They are excluded from the family and stay NaN in
/// the output. A family made only of NaN values is returned as is.
pub fn correct(p_values: &[f64], method: CorrectionMethod) -> Result<Vec<f64>> {
    if p_values.is_empty() {
        return Err(anyhow!("Empty p-value array"));
    }

    let valid: Vec<usize> = p_values
        .iter()
        .enumerate()
        .filter_map(|(i, p)| if p.is_nan() { None } else { Some(i) })
        .collect();

    let mut adjusted = vec![f64::NAN; p_values.len()];
    if valid.is_empty() {
        return Ok(adjusted);
    }

    let family: Vec<f64> = valid.iter().map(|&i| p_values[i]).collect();
    let family_adjusted = method.apply(&family)?;
    for (&i, q) in valid.iter().zip(family_adjusted) {
        adjusted[i] = q;
    }
    Ok(adjusted)
}

fn validate(p_values: &[f64]) -> Result<()> {
    if p_values.is_empty() {
        return Err(anyhow!("Empty p-value array"));
    }
    for (i, &p) in p_values.iter().enumerate() {
        if !(0.0..=1.0).contains(&p) {
            return Err(anyhow!("Invalid p-value at index {}: {}", i, p));
        }
    }
    Ok(())
}

fn ascending_order(p_values: &[f64]) -> Vec<(usize, f64)> {
    let mut indexed: Vec<(usize, f64)> =
        p_values.iter().enumerate().map(|(i, &p)| (i, p)).collect();
    indexed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
    indexed
}

/// Apply Bonferroni correction to p-values
///
/// Bonferroni correction is a simple but conservative method that multiplies
/// each p-value by the number of tests.
///
/// # Example
/// ```
/// use single_diffexp::testing::correction::bonferroni_correction;
/// let p_values = vec![0.01, 0.03, 0.05];
/// let adjusted = bonferroni_correction(&p_values).unwrap();
/// assert!((adjusted[0] - 0.03).abs() < 1e-12);
/// ```
pub fn bonferroni_correction(p_values: &[f64]) -> Result<Vec<f64>> {
    validate(p_values)?;
    let n = p_values.len();

    // Multiply each p-value by n, capping at 1.0
    let adjusted = p_values.iter().map(|&p| (p * n as f64).min(1.0)).collect();

    Ok(adjusted)
}

/// Apply Benjamini-Hochberg (BH) procedure for controlling false discovery rate
///
/// The BH procedure controls the false discovery rate (FDR), which is the expected
/// proportion of false positives among all rejected null hypotheses.
///
/// # Example
/// ```
/// use single_diffexp::testing::correction::benjamini_hochberg_correction;
/// let p_values = vec![0.01, 0.03, 0.05];
/// let adjusted = benjamini_hochberg_correction(&p_values).unwrap();
/// assert!(adjusted.iter().all(|&q| (q - 0.05).abs() < 1e-12 || q < 0.05));
/// ```
pub fn benjamini_hochberg_correction(p_values: &[f64]) -> Result<Vec<f64>> {
    validate(p_values)?;
    step_up(p_values, 1.0)
}

/// Apply Benjamini-Yekutieli (BY) procedure for controlling false discovery rate under dependence
///
/// The BY procedure is a more conservative variant of the BH procedure that is valid
/// under arbitrary dependence structures among the tests.
pub fn benjamini_yekutieli_correction(p_values: &[f64]) -> Result<Vec<f64>> {
    validate(p_values)?;
    let n = p_values.len();
    let c_n: f64 = (1..=n).map(|i| 1.0 / i as f64).sum();
    step_up(p_values, c_n)
}

/// Shared BH/BY step-up: `q_(i) = min_{j >= i} min(1, c * p_(j) * n / j)`.
fn step_up(p_values: &[f64], c: f64) -> Result<Vec<f64>> {
    let n = p_values.len();
    let indexed_p_values = ascending_order(p_values);

    let mut adjusted_p_values = vec![0.0; n];
    let mut current_min: f64 = 1.0;

    // Process from largest to smallest p-value
    for i in (0..n).rev() {
        let (orig_idx, p_val) = indexed_p_values[i];
        let rank = i + 1;

        let adjustment = (p_val * c * n as f64 / rank as f64).min(1.0);
        current_min = adjustment.min(current_min);
        adjusted_p_values[orig_idx] = current_min;
    }

    Ok(adjusted_p_values)
}

/// Apply Holm-Bonferroni (step-down) method for controlling family-wise error rate
///
/// The Holm procedure is a step-down method that controls the family-wise error rate (FWER)
/// and is uniformly more powerful than the standard Bonferroni correction.
pub fn holm_bonferroni_correction(p_values: &[f64]) -> Result<Vec<f64>> {
    validate(p_values)?;
    let n = p_values.len();
    let indexed_p_values = ascending_order(p_values);

    let mut adjusted_p_values = vec![0.0; n];
    let mut running_max: f64 = 0.0;

    for (i, &(idx, p_val)) in indexed_p_values.iter().enumerate() {
        let adjusted_p = (p_val * (n - i) as f64).min(1.0);
        // Step-down adjusted values must not decrease with rank
        running_max = running_max.max(adjusted_p);
        adjusted_p_values[idx] = running_max;
    }

    Ok(adjusted_p_values)
}

/// Apply Hochberg's step-up method for controlling family-wise error rate
///
/// Hochberg's procedure is a step-up method that controls the family-wise error rate (FWER)
/// and is more powerful than Holm's procedure when all tests are independent.
pub fn hochberg_correction(p_values: &[f64]) -> Result<Vec<f64>> {
    validate(p_values)?;
    let n = p_values.len();

    // Descending order: position i carries multiplier i + 1
    let mut indexed_p_values = ascending_order(p_values);
    indexed_p_values.reverse();

    let mut adjusted_p_values = vec![0.0; n];
    let mut current_min: f64 = 1.0;

    for (i, &(idx, p_val)) in indexed_p_values.iter().enumerate() {
        let hochberg_value = (p_val * (i + 1) as f64).min(1.0);
        current_min = current_min.min(hochberg_value);
        adjusted_p_values[idx] = current_min;
    }

    Ok(adjusted_p_values)
}

/// Apply Storey's q-value method for controlling false discovery rate
///
/// Storey's q-value method estimates the proportion of true null hypotheses (π0)
/// and uses this to obtain more powerful FDR control than the BH procedure.
///
/// # Arguments
/// * `p_values` - A slice of p-values to adjust
/// * `lambda` - Tuning parameter for π0 estimation (between 0 and 1, typically 0.5)
pub fn storey_qvalues(p_values: &[f64], lambda: f64) -> Result<Vec<f64>> {
    validate(p_values)?;
    let n = p_values.len();

    if !(0.0..1.0).contains(&lambda) {
        return Err(anyhow!("Lambda must be between 0 and 1, got {}", lambda));
    }

    // Estimate pi0 (proportion of true null hypotheses); the +1 keeps it above zero
    // when no p-value exceeds lambda
    let w = p_values.iter().filter(|&&p| p > lambda).count() as f64;
    let pi0 = ((w + 1.0) / (n as f64 * (1.0 - lambda))).min(1.0);

    let bh_adjusted = benjamini_hochberg_correction(p_values)?;
    let q_values = bh_adjusted.iter().map(|&p| (p * pi0).min(1.0)).collect();

    Ok(q_values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn assert_vec_relative_eq(a: &[f64], b: &[f64], epsilon: f64) {
        assert_eq!(a.len(), b.len(), "Vectors have different lengths");
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            if (x - y).abs() > epsilon {
                panic!("Vectors differ at index {}: {} != {}", i, x, y);
            }
        }
    }

    #[test]
    fn test_bonferroni() {
        let p_values = vec![0.01, 0.02, 0.03, 0.1, 0.2];
        let expected = vec![0.05, 0.1, 0.15, 0.5, 1.0];
        let adjusted = bonferroni_correction(&p_values).unwrap();
        assert_vec_relative_eq(&adjusted, &expected, 1e-10);
    }

    #[test]
    fn test_benjamini_hochberg_empty_input() {
        let result = benjamini_hochberg_correction(&[]);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().to_string(), "Empty p-value array");
    }

    #[test]
    fn test_benjamini_hochberg_invalid_pvalues() {
        let result = benjamini_hochberg_correction(&[0.01, -0.5, 0.03]);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Invalid p-value at index 1")
        );

        let result = benjamini_hochberg_correction(&[0.01, 1.5, 0.03]);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Invalid p-value at index 1")
        );
    }

    #[test]
    fn test_benjamini_hochberg_ordered_pvalues() {
        let p_values = vec![0.01, 0.02, 0.03, 0.04, 0.05];
        let adjusted = benjamini_hochberg_correction(&p_values).unwrap();
        for a in adjusted {
            assert_relative_eq!(a, 0.05, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_benjamini_hochberg_unordered_pvalues() {
        let p_values = vec![0.05, 0.01, 0.1, 0.04, 0.02];
        let expected = vec![0.0625, 0.05, 0.1, 0.0625, 0.05];
        let adjusted = benjamini_hochberg_correction(&p_values).unwrap();
        assert_vec_relative_eq(&adjusted, &expected, 1e-10);
    }

    #[test]
    fn test_benjamini_hochberg_real_example() {
        let pvalues = vec![0.1, 0.2, 0.3, 0.4, 0.1];
        let expected = [0.25, 0.3333333333333333, 0.375, 0.4, 0.25];
        let adjusted = benjamini_hochberg_correction(&pvalues).unwrap();
        assert_vec_relative_eq(&adjusted, &expected, 1e-10);
    }

    #[test]
    fn test_benjamini_yekutieli_is_more_conservative() {
        let p_values = vec![0.001, 0.01, 0.02, 0.2];
        let bh = benjamini_hochberg_correction(&p_values).unwrap();
        let by = benjamini_yekutieli_correction(&p_values).unwrap();
        for (b, y) in bh.iter().zip(by.iter()) {
            assert!(y >= b);
        }
        // c(4) = 1 + 1/2 + 1/3 + 1/4
        assert_relative_eq!(by[0], (0.001_f64 * 4.0 * 25.0 / 12.0).min(1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_holm_bonferroni() {
        let p_values = vec![0.01, 0.02, 0.03];
        let expected = vec![0.03, 0.04, 0.04];
        let adjusted = holm_bonferroni_correction(&p_values).unwrap();
        assert_vec_relative_eq(&adjusted, &expected, 1e-10);
    }

    #[test]
    fn test_hochberg() {
        let p_values = vec![0.01, 0.04, 0.03, 0.05];
        // descending: 0.05*1, 0.04*2, 0.03*3, 0.01*4 with running minimum
        let expected = vec![0.04, 0.05, 0.05, 0.05];
        let adjusted = hochberg_correction(&p_values).unwrap();
        assert_vec_relative_eq(&adjusted, &expected, 1e-10);
    }

    #[test]
    fn test_storey_qvalues() {
        let p_values = vec![0.01, 0.02, 0.03, 0.6, 0.7];
        let qvalues = storey_qvalues(&p_values, 0.5).unwrap();
        for &q in &qvalues {
            assert!((0.0..=1.0).contains(&q));
        }
        assert!(qvalues[0] <= qvalues[2]);
        assert!(qvalues[3] <= qvalues[4]);
    }

    #[test]
    fn test_storey_without_p_values_above_lambda() {
        // pi0 = 1 / (3 * 0.5), applied to BH values [0.03, 0.3, 0.4]
        let qvalues = correct(&[0.01, 0.2, 0.4], CorrectionMethod::Storey { lambda: 0.5 }).unwrap();
        assert_vec_relative_eq(&qvalues, &[0.02, 0.2, 0.4 * 2.0 / 3.0], 1e-12);
        assert!(qvalues.iter().all(|&q| q > 0.0));
        assert!(qvalues[2] > 0.05);
    }

    #[test]
    fn test_storey_pi0_is_capped_at_one() {
        let p_values = vec![0.8, 0.9, 0.95, 0.7];
        let qvalues = storey_qvalues(&p_values, 0.5).unwrap();
        let bh = benjamini_hochberg_correction(&p_values).unwrap();
        assert_vec_relative_eq(&qvalues, &bh, 1e-12);
    }

    #[test]
    fn test_correct_skips_nan() {
        let p_values = vec![0.01, f64::NAN, 0.04, 0.03];
        let adjusted = correct(&p_values, CorrectionMethod::Bonferroni).unwrap();
        assert_relative_eq!(adjusted[0], 0.03, epsilon = 1e-12);
        assert!(adjusted[1].is_nan());
        assert_relative_eq!(adjusted[2], 0.12, epsilon = 1e-12);
        assert_relative_eq!(adjusted[3], 0.09, epsilon = 1e-12);

        let all_nan = correct(&[f64::NAN, f64::NAN], CorrectionMethod::BenjaminiHochberg).unwrap();
        assert!(all_nan.iter().all(|q| q.is_nan()));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(bonferroni_correction(&[]).is_err());
        assert!(benjamini_hochberg_correction(&[]).is_err());
        assert!(holm_bonferroni_correction(&[]).is_err());
        assert!(correct(&[], CorrectionMethod::Hochberg).is_err());

        assert!(storey_qvalues(&[0.5], -0.1).is_err());
        assert!(storey_qvalues(&[0.5], 1.0).is_err());

        let invalid_p = vec![-0.1, 0.5, 1.1];
        assert!(bonferroni_correction(&invalid_p).is_err());
        assert!(benjamini_hochberg_correction(&invalid_p).is_err());
        assert!(hochberg_correction(&invalid_p).is_err());
    }
}
