use crate::config::TestConfig;
use crate::data::{Column, ExpressionMatrix, Grouping, SampleDescription};
use crate::de::single::{lrt_inner, rank_test_inner, t_test_inner, two_sample_inner, wald_inner};
use crate::de::{DifferentialExpressionTest, GeneSummary, LrtSpec, TwoSampleTest, WaldSpec, WaldTarget, combined_summary};
use crate::error::DeError;
use crate::model::{Formula, ModelEstimator, NbGlmEstimator};
use log::{info, warn};

/// Cells split by the levels of one categorical annotation.
#[derive(Debug, Clone)]
pub struct Partition<'a> {
    data: &'a ExpressionMatrix,
    description: &'a SampleDescription,
    parts_column: String,
    levels: Vec<String>,
    cells: Vec<Vec<usize>>,
}

/// Split `data` by the levels of `parts_column`.
pub fn partition<'a>(
    data: &'a ExpressionMatrix,
    sample_description: &'a SampleDescription,
    parts_column: &str,
) -> anyhow::Result<Partition<'a>> {
    if sample_description.n_cells() != data.n_cells() {
        return Err(DeError::dimension("sample description rows", data.n_cells(), sample_description.n_cells()).into());
    }
    let parts = Grouping::from_description(sample_description, parts_column)?;
    let cells = (0..parts.n_groups()).map(|k| parts.cells_of(k)).collect();
    Ok(Partition {
        data,
        description: sample_description,
        parts_column: parts_column.to_string(),
        levels: parts.groups().to_vec(),
        cells,
    })
}

/// Categorical variables of `formula` that have fewer than two levels.
fn degenerate_factors(description: &SampleDescription, formula: &str) -> anyhow::Result<Vec<String>> {
    let formula = Formula::parse(formula)?;
    let mut degenerate = Vec::new();
    for var in formula.variables() {
        if let Column::Categorical(_) = description.column(var)? {
            if description.levels(var)?.len() < 2 {
                degenerate.push(var.to_string());
            }
        }
    }
    Ok(degenerate)
}

impl<'a> Partition<'a> {
    pub fn parts_column(&self) -> &str {
        &self.parts_column
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Cells of one partition level.
    pub fn cells(&self, level: &str) -> Option<&[usize]> {
        self.levels
            .iter()
            .position(|l| l == level)
            .map(|k| self.cells[k].as_slice())
    }

    /// Run `run` on every level; levels for which `skip` names a reason are left out.
    fn run_each<S, F>(&self, test_name: &str, skip: S, run: F) -> anyhow::Result<PartitionTest>
    where
        S: Fn(&SampleDescription) -> anyhow::Result<Option<String>>,
        F: Fn(&ExpressionMatrix, &SampleDescription) -> anyhow::Result<DifferentialExpressionTest>,
    {
        info!(
            "partition: {} in {} levels of '{}'",
            test_name,
            self.levels.len(),
            self.parts_column
        );
        let mut levels = Vec::new();
        let mut tests = Vec::new();
        let mut skipped = Vec::new();
        for (level, cells) in self.levels.iter().zip(&self.cells) {
            let description = self.description.subset(cells);
            if let Some(reason) = skip(&description)? {
                warn!("partition: skipping level '{}' of '{}': {}", level, self.parts_column, reason);
                skipped.push(level.clone());
                continue;
            }
            let data = self.data.subset_cells(cells)?;
            tests.push(run(&data, &description)?);
            levels.push(level.clone());
        }
        if tests.is_empty() {
            return Err(DeError::EmptyData(format!(
                "no level of '{}' could be tested",
                self.parts_column
            ))
            .into());
        }
        Ok(PartitionTest {
            test_name: test_name.to_string(),
            levels,
            skipped,
            tests,
            mean: self.data.gene_means(),
            all_zero: (0..self.data.n_genes()).map(|g| self.data.is_all_zero(g)).collect(),
        })
    }

    fn grouping_skip(grouping_column: &str) -> impl Fn(&SampleDescription) -> anyhow::Result<Option<String>> + '_ {
        move |description| {
            let grouping = Grouping::from_description(description, grouping_column)?;
            Ok(if grouping.n_groups() < 2 {
                Some(format!("'{}' has fewer than two groups", grouping_column))
            } else {
                None
            })
        }
    }

    pub fn two_sample(&self, grouping_column: &str, test: TwoSampleTest, config: &TestConfig) -> anyhow::Result<PartitionTest> {
        self.two_sample_with(grouping_column, test, config, &NbGlmEstimator::new(config.fit.clone()))
    }

    pub fn two_sample_with(
        &self,
        grouping_column: &str,
        test: TwoSampleTest,
        config: &TestConfig,
        estimator: &dyn ModelEstimator,
    ) -> anyhow::Result<PartitionTest> {
        config.install(|| {
            self.run_each(test.name(), Self::grouping_skip(grouping_column), |data, description| {
                let grouping = Grouping::from_description(description, grouping_column)?;
                two_sample_inner(data, &grouping, test, config, estimator)
            })
        })
    }

    pub fn t_test(&self, grouping_column: &str, config: &TestConfig) -> anyhow::Result<PartitionTest> {
        config.install(|| {
            self.run_each("t_test", Self::grouping_skip(grouping_column), |data, description| {
                let grouping = Grouping::from_description(description, grouping_column)?;
                t_test_inner(data, &grouping, config)
            })
        })
    }

    pub fn rank_test(&self, grouping_column: &str, config: &TestConfig) -> anyhow::Result<PartitionTest> {
        config.install(|| {
            self.run_each("rank_test", Self::grouping_skip(grouping_column), |data, description| {
                let grouping = Grouping::from_description(description, grouping_column)?;
                rank_test_inner(data, &grouping, config)
            })
        })
    }

    /// Wald test inside every level; size factors are not supported here.
    pub fn wald(&self, formula_loc: &str, target: WaldTarget, config: &TestConfig) -> anyhow::Result<PartitionTest> {
        let estimator = NbGlmEstimator::new(config.fit.clone());
        config.install(|| {
            self.run_each(
                "wald",
                |description| {
                    let degenerate = degenerate_factors(description, formula_loc)?;
                    Ok((!degenerate.is_empty()).then(|| format!("factors {:?} have a single level", degenerate)))
                },
                |data, description| {
                    let spec = WaldSpec {
                        sample_description: description,
                        formula_loc: formula_loc.to_string(),
                        target: target.clone(),
                        size_factors: None,
                    };
                    wald_inner(data, &spec, config, &estimator)
                },
            )
        })
    }

    pub fn lrt(&self, full_formula_loc: &str, reduced_formula_loc: &str, config: &TestConfig) -> anyhow::Result<PartitionTest> {
        let estimator = NbGlmEstimator::new(config.fit.clone());
        config.install(|| {
            self.run_each(
                "lrt",
                |description| {
                    let degenerate = degenerate_factors(description, full_formula_loc)?;
                    Ok((!degenerate.is_empty()).then(|| format!("factors {:?} have a single level", degenerate)))
                },
                |data, description| {
                    let spec = LrtSpec::new(description, full_formula_loc, reduced_formula_loc);
                    lrt_inner(data, &spec, config, &estimator)
                },
            )
        })
    }
}

/// One differential expression test per partition level.
#[derive(Debug, Clone)]
pub struct PartitionTest {
    test_name: String,
    levels: Vec<String>,
    skipped: Vec<String>,
    tests: Vec<DifferentialExpressionTest>,
    mean: Vec<f64>,
    all_zero: Vec<bool>,
}

impl PartitionTest {
    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Levels that were tested, in the order of [`PartitionTest::tests`].
    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Levels left out because their grouping was degenerate.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn tests(&self) -> &[DifferentialExpressionTest] {
        &self.tests
    }

    pub fn test(&self, level: &str) -> Option<&DifferentialExpressionTest> {
        self.levels.iter().position(|l| l == level).map(|k| &self.tests[k])
    }

    /// Per gene: smallest p- and q-value over the partitions and the largest fold change.
    pub fn summary(&self) -> Vec<GeneSummary> {
        let p: Vec<&[f64]> = self.tests.iter().map(|t| t.pval()).collect();
        let q: Vec<&[f64]> = self.tests.iter().map(|t| t.qval()).collect();
        let lfc_owned: Vec<Vec<f64>> = self.tests.iter().map(|t| t.log_fold_change(None)).collect();
        let lfc: Vec<&[f64]> = lfc_owned.iter().map(|v| v.as_slice()).collect();
        combined_summary(self.tests[0].gene_names(), &self.mean, &self.all_zero, &p, &q, &lfc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two batches of six cells; only batch "x" shows a shift in gene 0.
    fn setup() -> (ExpressionMatrix, SampleDescription) {
        let data = ExpressionMatrix::from_rows(&[
            vec![1.0, 3.0],
            vec![2.0, 4.0],
            vec![1.0, 3.0],
            vec![20.0, 4.0],
            vec![22.0, 3.0],
            vec![21.0, 4.0],
            vec![5.0, 3.0],
            vec![6.0, 4.0],
            vec![5.0, 3.0],
            vec![6.0, 4.0],
            vec![5.0, 3.0],
            vec![6.0, 4.0],
        ])
        .unwrap();
        let description = SampleDescription::new(12)
            .with_categorical("batch", &["x", "x", "x", "x", "x", "x", "y", "y", "y", "y", "y", "y"])
            .unwrap()
            .with_categorical("cond", &["a", "a", "a", "b", "b", "b", "a", "a", "a", "b", "b", "b"])
            .unwrap();
        (data, description)
    }

    #[test]
    fn t_test_per_level() {
        let (data, description) = setup();
        let parts = partition(&data, &description, "batch").unwrap();
        assert_eq!(parts.levels(), &["x", "y"]);
        assert_eq!(parts.cells("y").unwrap(), &[6, 7, 8, 9, 10, 11]);

        let result = parts.t_test("cond", &TestConfig::default()).unwrap();
        assert_eq!(result.tests().len(), 2);
        assert!(result.test("x").unwrap().pval()[0] < 0.01);
        assert!(result.test("y").unwrap().pval()[0] > 0.5);

        let summary = result.summary();
        assert_eq!(summary[0].pval, result.test("x").unwrap().pval()[0]);
        assert!(summary[0].log2fc > 3.0);
    }

    #[test]
    fn degenerate_levels_are_skipped() {
        let (data, description) = setup();
        let description = description
            .with_categorical("cond", &["a", "a", "a", "b", "b", "b", "a", "a", "a", "a", "a", "a"])
            .unwrap();
        let parts = partition(&data, &description, "batch").unwrap();
        let result = parts.rank_test("cond", &TestConfig::default()).unwrap();
        assert_eq!(result.levels(), &["x"]);
        assert_eq!(result.skipped(), &["y"]);
    }

    #[test]
    fn all_levels_degenerate_is_an_error() {
        let (data, description) = setup();
        let parts = partition(&data, &description, "cond").unwrap();
        // inside each level of "cond" the grouping by "cond" has one group
        let err = parts.t_test("cond", &TestConfig::default()).unwrap_err();
        assert!(matches!(err.downcast_ref::<DeError>(), Some(DeError::EmptyData(_))));
    }

    #[test]
    fn wald_per_level() {
        let (data, description) = setup();
        let parts = partition(&data, &description, "batch").unwrap();
        let result = parts
            .wald("~ 1 + cond", WaldTarget::Factor("cond".into()), &TestConfig::default())
            .unwrap();
        assert_eq!(result.test_name(), "wald");
        assert!(result.test("x").unwrap().pval()[0] < 0.01);
    }

    #[test]
    fn lrt_per_level() {
        let (data, description) = setup();
        let parts = partition(&data, &description, "batch").unwrap();
        let result = parts.lrt("~ 1 + cond", "~ 1", &TestConfig::default()).unwrap();
        assert_eq!(result.test_name(), "lrt");
        assert_eq!(result.levels(), &["x", "y"]);
        assert!(result.test("x").unwrap().pval()[0] < 0.01);
        assert!(result.test("y").unwrap().pval()[0] > 0.5);
        assert!(result.test("x").unwrap().log_fold_change(None)[0] > 2.0);
    }

    #[test]
    fn two_sample_per_level() {
        let (data, description) = setup();
        let parts = partition(&data, &description, "batch").unwrap();
        let config = TestConfig::default();

        let via_two_sample = parts.two_sample("cond", TwoSampleTest::TTest, &config).unwrap();
        let direct = parts.t_test("cond", &config).unwrap();
        for level in ["x", "y"] {
            assert_eq!(via_two_sample.test(level).unwrap().pval(), direct.test(level).unwrap().pval());
        }

        let description = description
            .with_categorical("cond", &["a", "a", "a", "b", "b", "b", "a", "a", "a", "a", "a", "a"])
            .unwrap();
        let parts = partition(&data, &description, "batch").unwrap();
        let ranks = parts.two_sample("cond", TwoSampleTest::Rank, &config).unwrap();
        assert_eq!(ranks.test_name(), TwoSampleTest::Rank.name());
        assert_eq!(ranks.levels(), &["x"]);
        assert_eq!(ranks.skipped(), &["y"]);
        // every cell of the second group exceeds the reference: U = 3 * 3
        assert_eq!(ranks.test("x").unwrap().statistics().unwrap()[0], 9.0);
    }

    #[test]
    fn partition_column_must_exist() {
        let (data, description) = setup();
        let err = partition(&data, &description, "donor").unwrap_err();
        assert!(matches!(err.downcast_ref::<DeError>(), Some(DeError::MissingColumn(_))));
    }
}
