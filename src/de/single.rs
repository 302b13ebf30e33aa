use crate::config::TestConfig;
use crate::data::{ExpressionMatrix, Grouping, SampleDescription};
use crate::de::DifferentialExpressionTest;
use crate::error::DeError;
use crate::model::{DesignMatrix, GlmFits, ModelEstimator, NbGlmEstimator};
use crate::testing::effect::log_fold_change_of_means;
use crate::testing::inference::likelihood::{chi_squared_sf, likelihood_ratio_test, wald_chisq_statistic, wald_test};
use crate::testing::inference::nonparametric::mann_whitney_matrix_groups;
use crate::testing::inference::parametric::t_test_matrix_groups;
use crate::testing::{Alternative, TTestType};
use log::info;
use rayon::prelude::*;

/// Coefficients tested by a Wald test.
#[derive(Debug, Clone, PartialEq)]
pub enum WaldTarget {
    /// Every coefficient of one formula term, e.g. all levels of a factor.
    Factor(String),
    /// Coefficients by name, e.g. `cond[T.b]`.
    Coefficients(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct WaldSpec<'a> {
    pub sample_description: &'a SampleDescription,
    pub formula_loc: String,
    pub target: WaldTarget,
    pub size_factors: Option<Vec<f64>>,
}

impl<'a> WaldSpec<'a> {
    /// Test all coefficients of `factor`.
    pub fn factor(sample_description: &'a SampleDescription, formula_loc: &str, factor: &str) -> Self {
        WaldSpec {
            sample_description,
            formula_loc: formula_loc.to_string(),
            target: WaldTarget::Factor(factor.to_string()),
            size_factors: None,
        }
    }

    /// Test the named coefficients jointly.
    pub fn coefficients(sample_description: &'a SampleDescription, formula_loc: &str, coefs: &[&str]) -> Self {
        WaldSpec {
            sample_description,
            formula_loc: formula_loc.to_string(),
            target: WaldTarget::Coefficients(coefs.iter().map(|c| c.to_string()).collect()),
            size_factors: None,
        }
    }

    pub fn with_size_factors(mut self, size_factors: Vec<f64>) -> Self {
        self.size_factors = Some(size_factors);
        self
    }
}

#[derive(Debug, Clone)]
pub struct LrtSpec<'a> {
    pub sample_description: &'a SampleDescription,
    pub full_formula_loc: String,
    pub reduced_formula_loc: String,
    pub size_factors: Option<Vec<f64>>,
}

impl<'a> LrtSpec<'a> {
    pub fn new(sample_description: &'a SampleDescription, full_formula_loc: &str, reduced_formula_loc: &str) -> Self {
        LrtSpec {
            sample_description,
            full_formula_loc: full_formula_loc.to_string(),
            reduced_formula_loc: reduced_formula_loc.to_string(),
            size_factors: None,
        }
    }

    pub fn with_size_factors(mut self, size_factors: Vec<f64>) -> Self {
        self.size_factors = Some(size_factors);
        self
    }
}

/// Test used to compare two groups of cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoSampleTest {
    Wald,
    Lrt,
    TTest,
    Rank,
}

impl TwoSampleTest {
    pub fn name(&self) -> &'static str {
        match self {
            TwoSampleTest::Wald => "wald",
            TwoSampleTest::Lrt => "lrt",
            TwoSampleTest::TTest => "t_test",
            TwoSampleTest::Rank => "rank_test",
        }
    }
}

/// Column holding the group labels in generated sample descriptions.
const GROUPING_COLUMN: &str = "grouping";

fn check_description(data: &ExpressionMatrix, description: &SampleDescription) -> anyhow::Result<()> {
    if description.n_cells() != data.n_cells() {
        return Err(DeError::dimension("sample description rows", data.n_cells(), description.n_cells()).into());
    }
    Ok(())
}

fn default_estimator(config: &TestConfig) -> NbGlmEstimator {
    NbGlmEstimator::new(config.fit.clone())
}

/// Wald test of one or more coefficients of a negative binomial location model.
pub fn wald(data: &ExpressionMatrix, spec: &WaldSpec, config: &TestConfig) -> anyhow::Result<DifferentialExpressionTest> {
    wald_with(data, spec, config, &default_estimator(config))
}

/// [`wald`] with a custom model-fitting engine.
pub fn wald_with(
    data: &ExpressionMatrix,
    spec: &WaldSpec,
    config: &TestConfig,
    estimator: &dyn ModelEstimator,
) -> anyhow::Result<DifferentialExpressionTest> {
    config.install(|| wald_inner(data, spec, config, estimator))
}

pub(crate) fn wald_inner(
    data: &ExpressionMatrix,
    spec: &WaldSpec,
    config: &TestConfig,
    estimator: &dyn ModelEstimator,
) -> anyhow::Result<DifferentialExpressionTest> {
    check_description(data, spec.sample_description)?;
    let design = DesignMatrix::from_formula_str(spec.sample_description, &spec.formula_loc)?;
    let indices = match &spec.target {
        WaldTarget::Factor(factor) => design.term_indices(factor)?,
        WaldTarget::Coefficients(names) => {
            let names: Vec<&str> = names.iter().map(|n| n.as_str()).collect();
            design.coefficient_indices(&names)?
        }
    };
    if indices.is_empty() {
        return Err(DeError::InvalidParameter(format!("no coefficients selected for testing in {:?}", spec.target)).into());
    }

    info!(
        "wald: {} genes, {} cells, formula '{}', testing {:?} with {}",
        data.n_genes(),
        data.n_cells(),
        spec.formula_loc,
        indices.iter().map(|&i| design.coefficient_names()[i].as_str()).collect::<Vec<_>>(),
        estimator.name()
    );

    let fits = estimator.fit(data, &design, spec.size_factors.as_deref())?;
    let result = wald_from_fits(data, &fits, &indices, config)?;
    info!("wald: finished, {} genes significant at q < 0.05", result.significant_genes(0.05).len());
    Ok(result)
}

/// Turn fitted models into Wald test results for the coefficients in `indices`.
fn wald_from_fits(
    data: &ExpressionMatrix,
    fits: &GlmFits,
    indices: &[usize],
    config: &TestConfig,
) -> anyhow::Result<DifferentialExpressionTest> {
    struct GeneWald {
        p_value: f64,
        statistic: f64,
        mle: f64,
        sd: f64,
    }

    let per_gene: Vec<GeneWald> = fits
        .fits
        .par_iter()
        .map(|fit| -> anyhow::Result<GeneWald> {
            // Reported coefficient: the tested one with the largest effect
            let lead = indices
                .iter()
                .copied()
                .max_by(|&a, &b| {
                    fit.coefficients[a]
                        .abs()
                        .partial_cmp(&fit.coefficients[b].abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(indices[0]);
            let mle = fit.coefficients[lead];
            let sd = fit.std_error(lead);
            if !fit.fitted {
                return Ok(GeneWald { p_value: f64::NAN, statistic: f64::NAN, mle, sd });
            }

            if indices.len() == 1 {
                let p_value = wald_test(&[mle], &[sd], 0.0)?[0];
                Ok(GeneWald { p_value, statistic: mle / sd, mle, sd })
            } else {
                let theta: Vec<f64> = indices.iter().map(|&i| fit.coefficients[i]).collect();
                let covar = fit.sub_covariance(indices);
                let statistic = wald_chisq_statistic(&theta, &covar, 0.0)?;
                let p_value = chi_squared_sf(statistic, theta.len() as f64);
                Ok(GeneWald { p_value, statistic, mle, sd })
            }
        })
        .collect::<anyhow::Result<_>>()?;

    let p_values = per_gene.iter().map(|g| g.p_value).collect();
    let log_fold_changes = per_gene.iter().map(|g| if g.mle.is_nan() { 0.0 } else { g.mle }).collect();
    Ok(DifferentialExpressionTest::new("wald", data, p_values, log_fold_changes, config.correction)?
        .with_statistics(per_gene.iter().map(|g| g.statistic).collect())
        .with_coefficients(
            per_gene.iter().map(|g| g.mle).collect(),
            per_gene.iter().map(|g| g.sd).collect(),
        )
        .with_log_likelihood(fits.log_likelihoods()))
}

/// Likelihood ratio test of a full against a nested reduced location model.
pub fn lrt(data: &ExpressionMatrix, spec: &LrtSpec, config: &TestConfig) -> anyhow::Result<DifferentialExpressionTest> {
    lrt_with(data, spec, config, &default_estimator(config))
}

/// [`lrt`] with a custom model-fitting engine.
pub fn lrt_with(
    data: &ExpressionMatrix,
    spec: &LrtSpec,
    config: &TestConfig,
    estimator: &dyn ModelEstimator,
) -> anyhow::Result<DifferentialExpressionTest> {
    config.install(|| lrt_inner(data, spec, config, estimator))
}

pub(crate) fn lrt_inner(
    data: &ExpressionMatrix,
    spec: &LrtSpec,
    config: &TestConfig,
    estimator: &dyn ModelEstimator,
) -> anyhow::Result<DifferentialExpressionTest> {
    check_description(data, spec.sample_description)?;
    let full = DesignMatrix::from_formula_str(spec.sample_description, &spec.full_formula_loc)?;
    let reduced = DesignMatrix::from_formula_str(spec.sample_description, &spec.reduced_formula_loc)?;

    if let Some(extra) = reduced
        .coefficient_names()
        .iter()
        .find(|name| full.coefficient_index(name).is_none())
    {
        return Err(DeError::InvalidParameter(format!(
            "reduced model '{}' is not nested in '{}': coefficient '{}' missing from the full model",
            spec.reduced_formula_loc, spec.full_formula_loc, extra
        ))
        .into());
    }
    let tested = full
        .coefficient_names()
        .iter()
        .position(|name| reduced.coefficient_index(name).is_none())
        .ok_or_else(|| {
            DeError::InvalidParameter(format!(
                "full model '{}' has no coefficients beyond the reduced model '{}'",
                spec.full_formula_loc, spec.reduced_formula_loc
            ))
        })?;

    info!(
        "lrt: {} genes, {} cells, '{}' against '{}' with {}",
        data.n_genes(),
        data.n_cells(),
        spec.full_formula_loc,
        spec.reduced_formula_loc,
        estimator.name()
    );

    let size_factors = spec.size_factors.as_deref();
    let full_fits = estimator.fit(data, &full, size_factors)?;
    let reduced_fits = estimator.fit(data, &reduced, size_factors)?;

    let fitted_ll = |fits: &GlmFits| -> Vec<f64> {
        fits.fits
            .iter()
            .map(|f| if f.fitted { f.log_likelihood } else { f64::NAN })
            .collect()
    };
    let ll_full = fitted_ll(&full_fits);
    let ll_reduced = fitted_ll(&reduced_fits);
    let p_values = likelihood_ratio_test(&ll_full, &ll_reduced, full.n_coefficients(), reduced.n_coefficients())?;
    let statistics: Vec<f64> = ll_full
        .iter()
        .zip(&ll_reduced)
        .map(|(f, r)| {
            let deviance = 2.0 * (f - r);
            if deviance < 0.0 { 0.0 } else { deviance }
        })
        .collect();

    let mle = full_fits.coef_mle(tested);
    let sd = full_fits.coef_sd(tested);
    let log_fold_changes = mle.iter().map(|&m| if m.is_nan() { 0.0 } else { m }).collect();

    let result = DifferentialExpressionTest::new("lrt", data, p_values, log_fold_changes, config.correction)?
        .with_statistics(statistics)
        .with_coefficients(mle, sd)
        .with_log_likelihood(full_fits.log_likelihoods());
    info!("lrt: finished, {} genes significant at q < 0.05", result.significant_genes(0.05).len());
    Ok(result)
}

/// Reference cells, other cells and group means per gene for a two-group comparison.
struct TwoGroups {
    reference: Vec<usize>,
    other: Vec<usize>,
    log_fold_changes: Vec<f64>,
}

fn two_groups(data: &ExpressionMatrix, grouping: &Grouping, config: &TestConfig) -> anyhow::Result<TwoGroups> {
    grouping.require_cells(data.n_cells())?;
    grouping.require_groups(2)?;
    let reference = grouping.cells_of(0);
    let other = grouping.cells_of(1);
    let mask0 = grouping.mask_of(0);
    let mask1 = grouping.mask_of(1);
    let (n0, n1) = (reference.len() as f64, other.len() as f64);
    let eps = config.fold_change_epsilon;

    let log_fold_changes = (0..data.n_genes())
        .into_par_iter()
        .map(|g| {
            let (sum0, _) = data.gene_sums_masked(g, &mask0);
            let (sum1, _) = data.gene_sums_masked(g, &mask1);
            log_fold_change_of_means(sum0 / n0, sum1 / n1, eps)
        })
        .collect();

    Ok(TwoGroups {
        reference,
        other,
        log_fold_changes,
    })
}

/// Welch's t-test between exactly two groups.
pub fn t_test(data: &ExpressionMatrix, grouping: &Grouping, config: &TestConfig) -> anyhow::Result<DifferentialExpressionTest> {
    config.install(|| t_test_inner(data, grouping, config))
}

pub(crate) fn t_test_inner(
    data: &ExpressionMatrix,
    grouping: &Grouping,
    config: &TestConfig,
) -> anyhow::Result<DifferentialExpressionTest> {
    let groups = two_groups(data, grouping, config)?;
    info!(
        "t_test: {} genes, {} vs {} cells ({} vs {})",
        data.n_genes(),
        groups.other.len(),
        groups.reference.len(),
        grouping.groups()[1],
        grouping.groups()[0]
    );
    let results = t_test_matrix_groups(data, &groups.reference, &groups.other, TTestType::Welch)?;
    let p_values = results.iter().map(|r| r.p_value).collect();
    let statistics = results.iter().map(|r| r.statistic).collect();
    Ok(
        DifferentialExpressionTest::new("t_test", data, p_values, groups.log_fold_changes, config.correction)?
            .with_statistics(statistics),
    )
}

/// Rank-sum test between exactly two groups.
pub fn rank_test(
    data: &ExpressionMatrix,
    grouping: &Grouping,
    config: &TestConfig,
) -> anyhow::Result<DifferentialExpressionTest> {
    config.install(|| rank_test_inner(data, grouping, config))
}

pub(crate) fn rank_test_inner(
    data: &ExpressionMatrix,
    grouping: &Grouping,
    config: &TestConfig,
) -> anyhow::Result<DifferentialExpressionTest> {
    let groups = two_groups(data, grouping, config)?;
    info!(
        "rank_test: {} genes, {} vs {} cells ({} vs {})",
        data.n_genes(),
        groups.other.len(),
        groups.reference.len(),
        grouping.groups()[1],
        grouping.groups()[0]
    );
    let results = mann_whitney_matrix_groups(data, &groups.other, &groups.reference, Alternative::TwoSided)?;
    let p_values = results.iter().map(|r| r.p_value).collect();
    let statistics = results.iter().map(|r| r.statistic).collect();
    Ok(
        DifferentialExpressionTest::new("rank_test", data, p_values, groups.log_fold_changes, config.correction)?
            .with_statistics(statistics),
    )
}

/// Compare two groups with the chosen test.
///
/// Wald and likelihood ratio tests fit `~ 1 + grouping` (and `~ 1` as the reduced
/// model) on a description generated from the grouping.
pub fn two_sample(
    data: &ExpressionMatrix,
    grouping: &Grouping,
    test: TwoSampleTest,
    config: &TestConfig,
) -> anyhow::Result<DifferentialExpressionTest> {
    two_sample_with(data, grouping, test, config, &default_estimator(config))
}

/// [`two_sample`] with a custom model-fitting engine.
pub fn two_sample_with(
    data: &ExpressionMatrix,
    grouping: &Grouping,
    test: TwoSampleTest,
    config: &TestConfig,
    estimator: &dyn ModelEstimator,
) -> anyhow::Result<DifferentialExpressionTest> {
    config.install(|| two_sample_inner(data, grouping, test, config, estimator))
}

pub(crate) fn two_sample_inner(
    data: &ExpressionMatrix,
    grouping: &Grouping,
    test: TwoSampleTest,
    config: &TestConfig,
    estimator: &dyn ModelEstimator,
) -> anyhow::Result<DifferentialExpressionTest> {
    grouping.require_cells(data.n_cells())?;
    grouping.require_groups(2)?;
    match test {
        TwoSampleTest::TTest => t_test_inner(data, grouping, config),
        TwoSampleTest::Rank => rank_test_inner(data, grouping, config),
        TwoSampleTest::Wald => {
            let description = SampleDescription::new(data.n_cells())
                .with_categorical(GROUPING_COLUMN, &grouping.labels())?;
            let spec = WaldSpec::factor(&description, "~ 1 + grouping", GROUPING_COLUMN);
            wald_inner(data, &spec, config, estimator)
        }
        TwoSampleTest::Lrt => {
            let description = SampleDescription::new(data.n_cells())
                .with_categorical(GROUPING_COLUMN, &grouping.labels())?;
            let spec = LrtSpec::new(&description, "~ 1 + grouping", "~ 1");
            lrt_inner(data, &spec, config, estimator)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GlmFit;
    use crate::testing::correction::CorrectionMethod;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    /// Four cells per group; gene 0 differs strongly, gene 1 is flat, gene 2 is empty.
    fn data() -> ExpressionMatrix {
        ExpressionMatrix::from_rows(&[
            vec![1.0, 5.0, 0.0],
            vec![2.0, 6.0, 0.0],
            vec![1.0, 4.0, 0.0],
            vec![2.0, 5.0, 0.0],
            vec![20.0, 5.0, 0.0],
            vec![25.0, 4.0, 0.0],
            vec![22.0, 6.0, 0.0],
            vec![24.0, 5.0, 0.0],
        ])
        .unwrap()
    }

    fn grouping() -> Grouping {
        Grouping::from_labels(&["a", "a", "a", "a", "b", "b", "b", "b"]).unwrap()
    }

    /// Returns fixed coefficients so tests do not depend on the fitter.
    struct FixedEstimator {
        coefficients: Vec<f64>,
        variance: f64,
        log_likelihood: f64,
    }

    impl ModelEstimator for FixedEstimator {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn fit(
            &self,
            data: &ExpressionMatrix,
            design: &DesignMatrix,
            _size_factors: Option<&[f64]>,
        ) -> anyhow::Result<GlmFits> {
            let p = design.n_coefficients();
            let fits = (0..data.n_genes())
                .map(|g| {
                    if data.is_all_zero(g) {
                        return GlmFit::unfitted(p);
                    }
                    GlmFit {
                        coefficients: self.coefficients[..p].to_vec(),
                        covariance: DMatrix::from_diagonal_element(p, p, self.variance),
                        log_likelihood: self.log_likelihood * p as f64,
                        dispersion: 1.0,
                        iterations: 1,
                        converged: true,
                        fitted: true,
                    }
                })
                .collect();
            Ok(GlmFits {
                fits,
                coefficient_names: design.coefficient_names().to_vec(),
                n_cells: data.n_cells(),
            })
        }
    }

    #[test]
    fn t_test_orients_fold_change_against_reference() {
        let result = t_test(&data(), &grouping(), &TestConfig::default()).unwrap();
        assert_eq!(result.test_name(), "t_test");
        let lfc = result.log_fold_change(None);
        assert_relative_eq!(lfc[0], (91.0f64 / 6.0).ln(), epsilon = 1e-9);
        assert_relative_eq!(lfc[1], 0.0, epsilon = 1e-12);
        assert!(result.pval()[0] < 1e-3);
        assert!(result.pval()[1] > 0.5);
        assert_eq!(result.pval()[2], 1.0);
        assert!(result.statistics().unwrap()[0] > 0.0);
    }

    #[test]
    fn rank_test_separates_groups() {
        let result = rank_test(&data(), &grouping(), &TestConfig::default()).unwrap();
        // U of the second group is 16 when every value exceeds the reference
        assert_eq!(result.statistics().unwrap()[0], 16.0);
        assert!(result.pval()[0] < 0.05);
        assert_eq!(result.pval()[2], 1.0);
    }

    #[test]
    fn two_groups_are_required() {
        let three = Grouping::from_labels(&["a", "a", "b", "b", "c", "c", "c", "c"]).unwrap();
        let err = t_test(&data(), &three, &TestConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeError>(),
            Some(DeError::InvalidParameter(_))
        ));
        let short = Grouping::from_labels(&["a", "b"]).unwrap();
        assert!(rank_test(&data(), &short, &TestConfig::default()).is_err());
    }

    #[test]
    fn wald_with_fixed_fits() {
        let estimator = FixedEstimator {
            coefficients: vec![1.0, 0.5],
            variance: 0.0625,
            log_likelihood: -10.0,
        };
        let description = SampleDescription::new(8)
            .with_categorical("cond", &grouping().labels())
            .unwrap();
        let spec = WaldSpec::factor(&description, "~ 1 + cond", "cond");
        let result = wald_with(&data(), &spec, &TestConfig::default(), &estimator).unwrap();
        // z = 0.5 / 0.25 = 2
        let expected = wald_test(&[2.0], &[1.0], 0.0).unwrap()[0];
        assert_relative_eq!(result.pval()[0], expected, epsilon = 1e-12);
        assert_relative_eq!(result.log_fold_change(None)[0], 0.5, epsilon = 1e-12);
        assert_eq!(result.coef_sd().unwrap()[0], 0.25);
        assert_eq!(result.pval()[2], 1.0);
    }

    #[test]
    fn wald_by_coefficient_name_and_missing_names() {
        let estimator = FixedEstimator {
            coefficients: vec![1.0, 0.5],
            variance: 0.0625,
            log_likelihood: -10.0,
        };
        let description = SampleDescription::new(8)
            .with_categorical("cond", &grouping().labels())
            .unwrap();
        let spec = WaldSpec::coefficients(&description, "~ 1 + cond", &["cond[T.b]"]);
        let result = wald_with(&data(), &spec, &TestConfig::default(), &estimator).unwrap();
        assert!(result.pval()[0] < 0.05);

        let missing = WaldSpec::coefficients(&description, "~ 1 + cond", &["cond[T.z]"]);
        assert!(wald_with(&data(), &missing, &TestConfig::default(), &estimator).is_err());
    }

    #[test]
    fn lrt_with_fixed_fits() {
        // full model has two coefficients: ll = -20 ; reduced has one: ll = -10 * 1
        // so the deviance is negative and is clamped to zero
        let estimator = FixedEstimator {
            coefficients: vec![1.0, 0.5],
            variance: 0.0625,
            log_likelihood: -10.0,
        };
        let description = SampleDescription::new(8)
            .with_categorical("cond", &grouping().labels())
            .unwrap();
        let spec = LrtSpec::new(&description, "~ 1 + cond", "~ 1");
        let result = lrt_with(&data(), &spec, &TestConfig::default(), &estimator).unwrap();
        assert_eq!(result.pval()[0], 1.0);
        assert_eq!(result.statistics().unwrap()[0], 0.0);
        assert_relative_eq!(result.log_fold_change(None)[0], 0.5, epsilon = 1e-12);

        let improving = FixedEstimator {
            coefficients: vec![1.0, 0.5],
            variance: 0.0625,
            log_likelihood: 10.0,
        };
        let result = lrt_with(&data(), &spec, &TestConfig::default(), &improving).unwrap();
        // deviance 2 * (20 - 10) = 20 on one degree of freedom
        assert!(result.pval()[0] < 1e-4);
    }

    #[test]
    fn lrt_requires_nested_models() {
        let description = SampleDescription::new(8)
            .with_categorical("cond", &grouping().labels())
            .unwrap()
            .with_numeric("depth", (0..8).map(|i| i as f64).collect())
            .unwrap();
        let spec = LrtSpec::new(&description, "~ 1 + cond", "~ 1 + depth");
        let err = lrt(&data(), &spec, &TestConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeError>(),
            Some(DeError::InvalidParameter(_))
        ));

        let same = LrtSpec::new(&description, "~ 1 + cond", "~ 1 + cond");
        assert!(lrt(&data(), &same, &TestConfig::default()).is_err());
    }

    #[test]
    fn two_sample_wald_fits_group_model() {
        let result = two_sample(&data(), &grouping(), TwoSampleTest::Wald, &TestConfig::default()).unwrap();
        assert_eq!(result.test_name(), "wald");
        assert!(result.pval()[0] < 1e-3);
        assert!(result.pval()[1] > 0.1);
        assert_eq!(result.pval()[2], 1.0);
        // the group coefficient of the NB model is the log ratio of group means
        assert_relative_eq!(result.log_fold_change(None)[0], (91.0f64 / 6.0).ln(), epsilon = 1e-3);
    }

    #[test]
    fn invalid_configs_are_rejected_before_testing() {
        let mut config = TestConfig::default();
        config.fold_change_epsilon = 0.0;
        let err = t_test(&data(), &grouping(), &config).unwrap_err();
        assert!(matches!(err.downcast_ref::<DeError>(), Some(DeError::Config(_))));

        let mut config = TestConfig::default();
        config.fit.max_iterations = 0;
        assert!(two_sample(&data(), &grouping(), TwoSampleTest::Wald, &config).is_err());
    }

    #[test]
    fn storey_q_values_through_a_test() {
        let config = TestConfig::default().with_correction(CorrectionMethod::Storey { lambda: 0.9 });
        let result = t_test(&data(), &grouping(), &config).unwrap();
        // two of three p-values exceed lambda, so pi0 is capped at one
        assert_relative_eq!(result.qval()[0], 3.0 * result.pval()[0], epsilon = 1e-12);
        assert_eq!(result.qval()[1], 1.0);
        assert!(result.qval().iter().zip(result.pval()).all(|(q, p)| q >= p));
        assert_eq!(result.significant_genes(0.05), vec!["gene_0"]);
    }

    #[test]
    fn size_factors_absorb_depth_differences() {
        // group b is sequenced four times deeper and shows exactly four-fold counts
        let counts = ExpressionMatrix::from_rows(&[
            vec![2.0],
            vec![3.0],
            vec![2.0],
            vec![3.0],
            vec![8.0],
            vec![12.0],
            vec![8.0],
            vec![12.0],
        ])
        .unwrap();
        let depth = vec![1.0, 1.0, 1.0, 1.0, 4.0, 4.0, 4.0, 4.0];
        let description = SampleDescription::new(8)
            .with_categorical("cond", &grouping().labels())
            .unwrap();
        let config = TestConfig::default();

        let raw = wald(&counts, &WaldSpec::factor(&description, "~ 1 + cond", "cond"), &config).unwrap();
        assert!(raw.pval()[0] < 0.01);
        assert_relative_eq!(raw.log_fold_change(None)[0], 4.0f64.ln(), epsilon = 1e-2);

        let spec = WaldSpec::factor(&description, "~ 1 + cond", "cond").with_size_factors(depth.clone());
        let scaled = wald(&counts, &spec, &config).unwrap();
        assert!(scaled.log_fold_change(None)[0].abs() < 1e-2);
        assert!(scaled.pval()[0] > 0.5);

        let raw_lrt = lrt(&counts, &LrtSpec::new(&description, "~ 1 + cond", "~ 1"), &config).unwrap();
        assert!(raw_lrt.pval()[0] < 0.01);
        let spec = LrtSpec::new(&description, "~ 1 + cond", "~ 1").with_size_factors(depth);
        let scaled_lrt = lrt(&counts, &spec, &config).unwrap();
        assert!(scaled_lrt.pval()[0] > 0.5);

        let short = WaldSpec::factor(&description, "~ 1 + cond", "cond").with_size_factors(vec![1.0; 3]);
        assert!(wald(&counts, &short, &config).is_err());
    }

    #[test]
    fn description_must_match_cells() {
        let description = SampleDescription::new(3)
            .with_categorical("cond", &["a", "b", "b"])
            .unwrap();
        let spec = WaldSpec::factor(&description, "~ 1 + cond", "cond");
        let err = wald(&data(), &spec, &TestConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeError>(),
            Some(DeError::DimensionMismatch { .. })
        ));
    }
}
