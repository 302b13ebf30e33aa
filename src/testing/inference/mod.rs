use crate::data::{ExpressionMatrix, Grouping};
use crate::de::{self, TwoSampleTest};
use crate::config::TestConfig;
use crate::testing::{correction, Alternative, MultipleTestResults, TTestType, TestMethod, TestResult};
use nalgebra_sparse::CsrMatrix;
use ndarray::Array2;
use single_utilities::traits::FloatOpsTS;
use statrs::function::erf::erfc;
use std::f64::consts::SQRT_2;

pub mod discrete;

pub mod likelihood;

pub mod parametric;

pub mod nonparametric;

/// Upper tail of the standard normal distribution.
pub(crate) fn normal_sf(z: f64) -> f64 {
    0.5 * erfc(z / SQRT_2)
}

/// Standard normal distribution function.
pub(crate) fn normal_cdf(z: f64) -> f64 {
    0.5 * erfc(-z / SQRT_2)
}

/// Matrix-level convenience tests for cells × genes matrices.
///
/// Rows are cells and columns are genes. Group indices refer to rows.
pub trait MatrixStatTests<T>
where
    T: FloatOpsTS,
{
    /// Per-gene t-tests; the statistic is oriented as group 2 minus group 1, so
    /// `Alternative::Greater` asks whether group 2 is higher.
    fn t_test(
        &self,
        group1_indices: &[usize],
        group2_indices: &[usize],
        test_type: TTestType,
        alternative: Alternative,
    ) -> anyhow::Result<Vec<TestResult<f64>>>;

    fn mann_whitney_test(
        &self,
        group1_indices: &[usize],
        group2_indices: &[usize],
        alternative: Alternative,
    ) -> anyhow::Result<Vec<TestResult<f64>>>;

    /// Two-group differential expression with Benjamini-Hochberg adjusted p-values.
    ///
    /// `group_ids` assigns every cell to a group; exactly two distinct ids are required.
    /// The group with the smaller id is the reference.
    fn differential_expression(
        &self,
        group_ids: &[usize],
        test_method: TestMethod,
    ) -> anyhow::Result<MultipleTestResults<f64>>;
}

fn adjust_alternative(results: Vec<TestResult<f64>>, alternative: Alternative) -> Vec<TestResult<f64>> {
    match alternative {
        Alternative::TwoSided => results,
        _ => results
            .into_iter()
            .map(|mut r| {
                r.p_value = parametric::one_sided_p_value(&r, alternative);
                r
            })
            .collect(),
    }
}

fn matrix_t_test(
    data: &ExpressionMatrix,
    group1_indices: &[usize],
    group2_indices: &[usize],
    test_type: TTestType,
    alternative: Alternative,
) -> anyhow::Result<Vec<TestResult<f64>>> {
    let results = parametric::t_test_matrix_groups(data, group1_indices, group2_indices, test_type)?;
    Ok(adjust_alternative(results, alternative))
}

fn matrix_differential_expression(
    data: &ExpressionMatrix,
    group_ids: &[usize],
    test_method: TestMethod,
) -> anyhow::Result<MultipleTestResults<f64>> {
    let labels: Vec<String> = group_ids.iter().map(|g| format!("{:020}", g)).collect();
    let grouping = Grouping::from_labels(&labels)?;
    grouping.require_cells(data.n_cells())?;
    grouping.require_groups(2)?;
    let reference = grouping.cells_of(0);
    let other = grouping.cells_of(1);

    match test_method {
        TestMethod::TTest(test_type) => {
            let results = matrix_t_test(data, &reference, &other, test_type, Alternative::TwoSided)?;
            let statistics: Vec<f64> = results.iter().map(|r| r.statistic).collect();
            let p_values: Vec<f64> = results.iter().map(|r| r.p_value).collect();
            let adjusted_p_values = correction::correct(&p_values, correction::CorrectionMethod::BenjaminiHochberg)?;
            let effect_sizes = (0..data.n_genes())
                .map(|g| crate::testing::effect::group_log_fold_change(data, g, &reference, &other, 1e-8))
                .collect::<anyhow::Result<Vec<_>>>()?;

            Ok(MultipleTestResults::new(statistics, p_values)
                .with_adjusted_p_values(adjusted_p_values)
                .with_effect_sizes(effect_sizes)
                .with_global_metadata("test_type", "t_test"))
        }

        TestMethod::MannWhitney => {
            let results = nonparametric::mann_whitney_matrix_groups(data, &other, &reference, Alternative::TwoSided)?;
            let statistics: Vec<f64> = results.iter().map(|r| r.statistic).collect();
            let p_values: Vec<f64> = results.iter().map(|r| r.p_value).collect();
            let adjusted_p_values = correction::correct(&p_values, correction::CorrectionMethod::BenjaminiHochberg)?;

            Ok(MultipleTestResults::new(statistics, p_values)
                .with_adjusted_p_values(adjusted_p_values)
                .with_global_metadata("test_type", "mann_whitney"))
        }

        TestMethod::Wald | TestMethod::LikelihoodRatio => {
            let test = if matches!(test_method, TestMethod::Wald) {
                TwoSampleTest::Wald
            } else {
                TwoSampleTest::Lrt
            };
            let result = de::two_sample(data, &grouping, test, &TestConfig::default())?;
            let statistics = result
                .statistics()
                .map(|s| s.to_vec())
                .unwrap_or_else(|| vec![f64::NAN; data.n_genes()]);

            Ok(MultipleTestResults::new(statistics, result.pval().to_vec())
                .with_adjusted_p_values(result.qval().to_vec())
                .with_effect_sizes(result.log_fold_change(None))
                .with_global_metadata("test_type", result.test_name()))
        }
    }
}

impl<T> MatrixStatTests<T> for CsrMatrix<T>
where
    T: FloatOpsTS,
{
    fn t_test(
        &self,
        group1_indices: &[usize],
        group2_indices: &[usize],
        test_type: TTestType,
        alternative: Alternative,
    ) -> anyhow::Result<Vec<TestResult<f64>>> {
        let data = ExpressionMatrix::from_csr(self)?;
        matrix_t_test(&data, group1_indices, group2_indices, test_type, alternative)
    }

    fn mann_whitney_test(
        &self,
        group1_indices: &[usize],
        group2_indices: &[usize],
        alternative: Alternative,
    ) -> anyhow::Result<Vec<TestResult<f64>>> {
        let data = ExpressionMatrix::from_csr(self)?;
        nonparametric::mann_whitney_matrix_groups(&data, group1_indices, group2_indices, alternative)
    }

    fn differential_expression(
        &self,
        group_ids: &[usize],
        test_method: TestMethod,
    ) -> anyhow::Result<MultipleTestResults<f64>> {
        let data = ExpressionMatrix::from_csr(self)?;
        matrix_differential_expression(&data, group_ids, test_method)
    }
}

impl<T> MatrixStatTests<T> for Array2<T>
where
    T: FloatOpsTS,
{
    fn t_test(
        &self,
        group1_indices: &[usize],
        group2_indices: &[usize],
        test_type: TTestType,
        alternative: Alternative,
    ) -> anyhow::Result<Vec<TestResult<f64>>> {
        let data = ExpressionMatrix::from_dense(self)?;
        matrix_t_test(&data, group1_indices, group2_indices, test_type, alternative)
    }

    fn mann_whitney_test(
        &self,
        group1_indices: &[usize],
        group2_indices: &[usize],
        alternative: Alternative,
    ) -> anyhow::Result<Vec<TestResult<f64>>> {
        let data = ExpressionMatrix::from_dense(self)?;
        nonparametric::mann_whitney_matrix_groups(&data, group1_indices, group2_indices, alternative)
    }

    fn differential_expression(
        &self,
        group_ids: &[usize],
        test_method: TestMethod,
    ) -> anyhow::Result<MultipleTestResults<f64>> {
        let data = ExpressionMatrix::from_dense(self)?;
        matrix_differential_expression(&data, group_ids, test_method)
    }
}
