//! Statistical primitives: per-gene hypothesis tests, multiple testing correction
//! and effect sizes.

use single_utilities::traits::FloatOps;
use std::collections::HashMap;

pub mod correction;
pub mod effect;
pub mod inference;

pub use inference::likelihood::{likelihood_ratio_test, two_coef_z_test, wald_chisq_statistic, wald_test, wald_test_chisq};
pub use inference::discrete::hypergeom_test;
pub use inference::nonparametric::{mann_whitney, wilcoxon};
pub use inference::parametric::{t_test_moments, t_test_raw};

/// Test used by [`inference::MatrixStatTests::differential_expression`].
#[derive(Debug, Clone, Copy)]
pub enum TestMethod {
    TTest(TTestType),
    MannWhitney,
    /// Wald test on a negative binomial group model.
    Wald,
    /// Likelihood ratio test of the group model against an intercept-only model.
    LikelihoodRatio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TTestType {
    Student, // Equal variance
    Welch,   // Unequal variance
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alternative {
    TwoSided,
    Less,
    Greater,
}

/// Outcome of one hypothesis test.
#[derive(Debug, Clone)]
pub struct TestResult<T> {
    pub statistic: T,
    pub p_value: T,
    pub degrees_of_freedom: Option<T>,
    /// Difference of group means, or the test's own effect measure.
    pub effect_size: Option<T>,
    pub standard_error: Option<T>,
    /// Intermediate quantities, e.g. `z_score` of the rank-sum test.
    pub metadata: HashMap<String, T>,
}

impl<T> TestResult<T>
where
    T: FloatOps,
{
    pub fn new(statistic: T, p_value: T) -> Self {
        TestResult {
            statistic,
            p_value,
            degrees_of_freedom: None,
            effect_size: None,
            standard_error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_effect_size(mut self, effect_size: T) -> Self {
        self.effect_size = Some(effect_size);
        self
    }

    pub fn with_degrees_of_freedom(mut self, df: T) -> Self {
        self.degrees_of_freedom = Some(df);
        self
    }

    pub fn with_standard_error(mut self, se: T) -> Self {
        self.standard_error = Some(se);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: T) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn is_significant(&self, alpha: T) -> bool {
        self.p_value < alpha
    }
}

/// Per-gene results of one test applied to a whole matrix.
#[derive(Debug, Clone)]
pub struct MultipleTestResults<T> {
    pub statistics: Vec<T>,
    pub p_values: Vec<T>,
    /// P-values after multiple testing correction.
    pub adjusted_p_values: Option<Vec<T>>,
    /// Log fold changes for differential expression results.
    pub effect_sizes: Option<Vec<T>>,
    /// Run information such as `test_type`.
    pub global_metadata: HashMap<String, String>,
}

impl<T> MultipleTestResults<T>
where
    T: FloatOps,
{
    pub fn new(statistics: Vec<T>, p_values: Vec<T>) -> Self {
        MultipleTestResults {
            statistics,
            p_values,
            adjusted_p_values: None,
            effect_sizes: None,
            global_metadata: HashMap::new(),
        }
    }

    pub fn with_adjusted_p_values(mut self, adjusted_p_values: Vec<T>) -> Self {
        self.adjusted_p_values = Some(adjusted_p_values);
        self
    }

    pub fn with_effect_sizes(mut self, effect_sizes: Vec<T>) -> Self {
        self.effect_sizes = Some(effect_sizes);
        self
    }

    pub fn with_global_metadata(mut self, key: &str, value: &str) -> Self {
        self.global_metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// P-values used for ranking: adjusted when present, raw otherwise.
    fn ranking_p_values(&self) -> &[T] {
        self.adjusted_p_values.as_deref().unwrap_or(&self.p_values)
    }

    /// Features with a (preferably adjusted) p-value below `alpha`.
    pub fn significant_indices(&self, alpha: T) -> Vec<usize> {
        self.ranking_p_values()
            .iter()
            .enumerate()
            .filter_map(|(i, &p)| if p < alpha { Some(i) } else { None })
            .collect()
    }

    pub fn num_significant(&self, alpha: T) -> usize {
        self.significant_indices(alpha).len()
    }

    /// The `n` features with the smallest p-values; NaN sorts last.
    pub fn top_features(&self, n: usize) -> Vec<usize> {
        let p_values = self.ranking_p_values();
        let mut indices: Vec<usize> = (0..p_values.len()).collect();
        indices.sort_by(|&a, &b| {
            let (pa, pb) = (p_values[a], p_values[b]);
            match (num_traits::Float::is_nan(pa), num_traits::Float::is_nan(pb)) {
                (true, false) => std::cmp::Ordering::Greater,
                (false, true) => std::cmp::Ordering::Less,
                _ => pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal),
            }
        });
        indices.truncate(n);
        indices
    }
}
