use crate::error::DeError;
use crate::testing::{Alternative, TestResult};
use statrs::distribution::{Binomial, ChiSquared, ContinuousCDF, Discrete, Hypergeometric};

/// Performs a chi-square test for independence on a 2x2 contingency table
pub fn chi_square_test(a: f64, b: f64, c: f64, d: f64) -> TestResult<f64> {
    let total = a + b + c + d;
    if total <= 0.0 {
        return TestResult::new(0.0, 1.0);
    }

    let row1 = a + b;
    let row2 = c + d;
    let col1 = a + c;
    let col2 = b + d;

    let observed = [a, b, c, d];
    let expected = [
        row1 * col1 / total,
        row1 * col2 / total,
        row2 * col1 / total,
        row2 * col2 / total,
    ];
    if expected.iter().any(|&e| e <= 0.0) {
        // An empty margin carries no information about association
        return TestResult::new(0.0, 1.0);
    }

    let chi_square = chi_square_statistic(&observed, &expected);
    TestResult::new(chi_square, chi_square_p_value(chi_square, 1.0)).with_degrees_of_freedom(1.0)
}

/// Performs a chi-square test for goodness of fit
pub fn chi_square_goodness_of_fit(observed: &[f64], expected: &[f64]) -> anyhow::Result<TestResult<f64>> {
    if observed.len() != expected.len() {
        return Err(DeError::dimension("expected frequencies", observed.len(), expected.len()).into());
    }
    if observed.len() < 2 {
        return Err(DeError::InvalidParameter("goodness of fit needs at least two categories".into()).into());
    }

    let chi_square = chi_square_statistic(observed, expected);
    let df = (observed.len() - 1) as f64;
    Ok(TestResult::new(chi_square, chi_square_p_value(chi_square, df)).with_degrees_of_freedom(df))
}

fn chi_square_statistic(observed: &[f64], expected: &[f64]) -> f64 {
    observed
        .iter()
        .zip(expected)
        .filter(|(_, e)| **e > 0.0)
        .map(|(&o, &e)| (o - e) * (o - e) / e)
        .sum()
}

fn chi_square_p_value(chi_square: f64, df: f64) -> f64 {
    match ChiSquared::new(df) {
        Ok(chi_dist) => chi_dist.sf(chi_square),
        Err(_) => 1.0,
    }
}

/// Performs an exact binomial test of `successes` out of `trials`.
///
/// The two-sided p-value sums the probabilities of all outcomes that are at most as
/// likely as the observed one.
pub fn binomial_test(
    successes: u64,
    trials: u64,
    probability: f64,
    alternative: Alternative,
) -> anyhow::Result<TestResult<f64>> {
    if successes > trials {
        return Err(DeError::InvalidParameter(format!(
            "successes ({}) exceed trials ({})",
            successes, trials
        ))
        .into());
    }
    let dist = Binomial::new(probability, trials)
        .map_err(|e| DeError::InvalidParameter(format!("binomial distribution: {}", e)))?;

    let observed_pmf = dist.pmf(successes);
    let p_value = match alternative {
        Alternative::TwoSided => {
            let cutoff = observed_pmf * (1.0 + 1e-7);
            (0..=trials)
                .map(|i| dist.pmf(i))
                .filter(|&pmf| pmf <= cutoff)
                .sum::<f64>()
        }
        Alternative::Less => (0..=successes).map(|i| dist.pmf(i)).sum::<f64>(),
        Alternative::Greater => (successes..=trials).map(|i| dist.pmf(i)).sum::<f64>(),
    };

    Ok(TestResult::new(successes as f64, p_value.min(1.0)))
}

/// Over-representation test: `P(X >= intersections)` for X hypergeometric.
///
/// `background` genes contain `references` members of a reference set; `enquiry` genes
/// are drawn (e.g. the significant genes) and `intersections` of them fall in the set.
pub fn hypergeom_test(
    intersections: u64,
    enquiry: u64,
    references: u64,
    background: u64,
) -> anyhow::Result<f64> {
    if enquiry > background || references > background {
        return Err(DeError::InvalidParameter(format!(
            "enquiry ({}) and reference ({}) sizes must not exceed the background ({})",
            enquiry, references, background
        ))
        .into());
    }
    if intersections > enquiry.min(references) {
        return Err(DeError::InvalidParameter(format!(
            "intersection size {} exceeds enquiry ({}) or reference ({}) size",
            intersections, enquiry, references
        ))
        .into());
    }
    if intersections == 0 {
        return Ok(1.0);
    }

    let dist = Hypergeometric::new(background, references, enquiry)
        .map_err(|e| DeError::InvalidParameter(format!("hypergeometric distribution: {}", e)))?;
    let upper = references.min(enquiry);
    // Summing the upper tail directly keeps small p-values accurate
    let p = (intersections..=upper).map(|k| dist.ln_pmf(k).exp()).sum::<f64>();
    Ok(p.min(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn chi_square_two_by_two() {
        let r = chi_square_test(10.0, 20.0, 30.0, 40.0);
        assert_relative_eq!(r.statistic, 0.7936508, epsilon = 1e-6);
        assert_relative_eq!(r.p_value, 0.3729985, epsilon = 1e-6);
        assert_eq!(chi_square_test(0.0, 0.0, 0.0, 0.0).p_value, 1.0);
        assert_eq!(chi_square_test(5.0, 5.0, 0.0, 0.0).p_value, 1.0);
    }

    #[test]
    fn goodness_of_fit() {
        let r = chi_square_goodness_of_fit(&[10.0, 10.0], &[10.0, 10.0]).unwrap();
        assert_eq!(r.statistic, 0.0);
        assert_relative_eq!(r.p_value, 1.0, epsilon = 1e-12);
        assert!(chi_square_goodness_of_fit(&[1.0], &[1.0]).is_err());
        assert!(chi_square_goodness_of_fit(&[1.0, 2.0], &[1.0]).is_err());
    }

    #[test]
    fn binomial_reference_values() {
        let two_sided = binomial_test(9, 10, 0.5, Alternative::TwoSided).unwrap();
        assert_relative_eq!(two_sided.p_value, 22.0 / 1024.0, epsilon = 1e-12);
        let greater = binomial_test(9, 10, 0.5, Alternative::Greater).unwrap();
        assert_relative_eq!(greater.p_value, 11.0 / 1024.0, epsilon = 1e-12);
        let less = binomial_test(9, 10, 0.5, Alternative::Less).unwrap();
        assert_relative_eq!(less.p_value, 1023.0 / 1024.0, epsilon = 1e-12);
        assert!(binomial_test(11, 10, 0.5, Alternative::TwoSided).is_err());
    }

    #[test]
    fn hypergeometric_upper_tail() {
        // (C(5,3) C(15,1) + C(5,4) C(15,0)) / C(20,4) = 155 / 4845
        let p = hypergeom_test(3, 4, 5, 20).unwrap();
        assert_relative_eq!(p, 155.0 / 4845.0, epsilon = 1e-10);
        assert_eq!(hypergeom_test(0, 4, 5, 20).unwrap(), 1.0);
        // whole reference set drawn
        let all = hypergeom_test(5, 20, 5, 20).unwrap();
        assert_relative_eq!(all, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn hypergeometric_rejects_impossible_counts() {
        assert!(hypergeom_test(6, 10, 5, 20).is_err());
        assert!(hypergeom_test(1, 30, 5, 20).is_err());
    }
}
