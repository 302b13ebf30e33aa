use crate::config::TestConfig;
use crate::data::{ExpressionMatrix, Grouping};
use crate::de::single::two_sample_inner;
use crate::de::{GeneSummary, TwoSampleTest, combined_summary, comparison_summary, convert_base, threshold_summary};
use crate::error::DeError;
use crate::model::{DesignMatrix, ModelEstimator, NbGlmEstimator};
use crate::testing::correction;
use crate::testing::inference::likelihood::two_coef_z_test;
use log::info;

/// Test used for every pair of groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairwiseTest {
    /// One cell-means model on all cells; pairs are compared with a two-coefficient z-test.
    ZTest,
    TTest,
    Rank,
    Wald,
    Lrt,
}

impl PairwiseTest {
    pub fn name(&self) -> &'static str {
        match self {
            PairwiseTest::ZTest => "z_test",
            PairwiseTest::TTest => "t_test",
            PairwiseTest::Rank => "rank_test",
            PairwiseTest::Wald => "wald",
            PairwiseTest::Lrt => "lrt",
        }
    }

    fn two_sample(&self) -> Option<TwoSampleTest> {
        match self {
            PairwiseTest::ZTest => None,
            PairwiseTest::TTest => Some(TwoSampleTest::TTest),
            PairwiseTest::Rank => Some(TwoSampleTest::Rank),
            PairwiseTest::Wald => Some(TwoSampleTest::Wald),
            PairwiseTest::Lrt => Some(TwoSampleTest::Lrt),
        }
    }
}

fn group_position(groups: &[String], label: &str) -> anyhow::Result<usize> {
    groups.iter().position(|g| g == label).ok_or_else(|| {
        DeError::InvalidParameter(format!("unknown group '{}'; groups are {:?}", label, groups)).into()
    })
}

/// Results of all pairwise group comparisons.
///
/// Values are indexed `[a][b][gene]`. P- and q-values are symmetric with ones on the
/// diagonal; `log_fold_change_pair(a, b)` is the fold change of `b` over `a`.
#[derive(Debug, Clone)]
pub struct PairwiseResult {
    test_name: String,
    groups: Vec<String>,
    gene_names: Vec<String>,
    mean: Vec<f64>,
    all_zero: Vec<bool>,
    p_values: Vec<Vec<Vec<f64>>>,
    q_values: Vec<Vec<Vec<f64>>>,
    log_fold_changes: Vec<Vec<Vec<f64>>>,
}

impl PairwiseResult {
    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn gene_names(&self) -> &[String] {
        &self.gene_names
    }

    pub fn pval_pair(&self, a: &str, b: &str) -> anyhow::Result<&[f64]> {
        let (i, j) = (group_position(&self.groups, a)?, group_position(&self.groups, b)?);
        Ok(&self.p_values[i][j])
    }

    pub fn qval_pair(&self, a: &str, b: &str) -> anyhow::Result<&[f64]> {
        let (i, j) = (group_position(&self.groups, a)?, group_position(&self.groups, b)?);
        Ok(&self.q_values[i][j])
    }

    /// Natural-log fold change of group `b` over group `a`.
    pub fn log_fold_change_pair(&self, a: &str, b: &str) -> anyhow::Result<&[f64]> {
        let (i, j) = (group_position(&self.groups, a)?, group_position(&self.groups, b)?);
        Ok(&self.log_fold_changes[i][j])
    }

    pub fn log_fold_change_pair_base(&self, a: &str, b: &str, base: Option<f64>) -> anyhow::Result<Vec<f64>> {
        Ok(convert_base(self.log_fold_change_pair(a, b)?, base))
    }

    fn off_diagonal(&self) -> Vec<(usize, usize)> {
        let n = self.groups.len();
        (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
            .collect()
    }

    /// Per gene: smallest p- and q-value over all pairs and the largest fold change.
    pub fn summary(&self) -> Vec<GeneSummary> {
        let pairs = self.off_diagonal();
        let p: Vec<&[f64]> = pairs.iter().map(|&(i, j)| self.p_values[i][j].as_slice()).collect();
        let q: Vec<&[f64]> = pairs.iter().map(|&(i, j)| self.q_values[i][j].as_slice()).collect();
        let lfc: Vec<&[f64]> = pairs.iter().map(|&(i, j)| self.log_fold_changes[i][j].as_slice()).collect();
        combined_summary(&self.gene_names, &self.mean, &self.all_zero, &p, &q, &lfc)
    }

    pub fn summary_threshold(
        &self,
        qval_thres: Option<f64>,
        fc_upper_thres: Option<f64>,
        fc_lower_thres: Option<f64>,
        mean_thres: Option<f64>,
    ) -> Vec<GeneSummary> {
        threshold_summary(self.summary(), qval_thres, fc_upper_thres, fc_lower_thres, mean_thres)
    }

    /// Summary of one comparison, fold changes of `b` over `a`.
    pub fn summary_pair(&self, a: &str, b: &str) -> anyhow::Result<Vec<GeneSummary>> {
        let (i, j) = (group_position(&self.groups, a)?, group_position(&self.groups, b)?);
        Ok(comparison_summary(
            &self.gene_names,
            &self.mean,
            &self.all_zero,
            &self.p_values[i][j],
            &self.q_values[i][j],
            &self.log_fold_changes[i][j],
        ))
    }
}

/// Compare every pair of groups.
///
/// Multiple testing correction runs once over all pairs and genes.
pub fn pairwise(
    data: &ExpressionMatrix,
    grouping: &Grouping,
    test: PairwiseTest,
    config: &TestConfig,
) -> anyhow::Result<PairwiseResult> {
    pairwise_with(data, grouping, test, config, &NbGlmEstimator::new(config.fit.clone()))
}

/// [`pairwise`] with a custom model-fitting engine.
pub fn pairwise_with(
    data: &ExpressionMatrix,
    grouping: &Grouping,
    test: PairwiseTest,
    config: &TestConfig,
    estimator: &dyn ModelEstimator,
) -> anyhow::Result<PairwiseResult> {
    grouping.require_cells(data.n_cells())?;
    grouping.require_min_groups(2)?;
    let n_groups = grouping.n_groups();
    let n_genes = data.n_genes();
    info!(
        "pairwise: {} test over {} groups ({} pairs), {} genes",
        test.name(),
        n_groups,
        n_groups * (n_groups - 1) / 2,
        n_genes
    );

    let mut p_values = vec![vec![vec![1.0; n_genes]; n_groups]; n_groups];
    let mut log_fold_changes = vec![vec![vec![0.0; n_genes]; n_groups]; n_groups];

    config.install(|| {
        match test.two_sample() {
            None => {
                let design = DesignMatrix::for_groups(grouping)?;
                let fits = estimator.fit(data, &design, None)?;
                let mle: Vec<Vec<f64>> = (0..n_groups).map(|k| fits.coef_mle(k)).collect();
                let sd: Vec<Vec<f64>> = (0..n_groups).map(|k| fits.coef_sd(k)).collect();
                for i in 0..n_groups {
                    for j in i + 1..n_groups {
                        let p = two_coef_z_test(&mle[j], &mle[i], &sd[j], &sd[i])?;
                        let lfc: Vec<f64> = mle[j]
                            .iter()
                            .zip(&mle[i])
                            .map(|(b, a)| if (b - a).is_nan() { 0.0 } else { b - a })
                            .collect();
                        p_values[i][j] = p.clone();
                        p_values[j][i] = p;
                        log_fold_changes[j][i] = lfc.iter().map(|v| -v).collect();
                        log_fold_changes[i][j] = lfc;
                    }
                }
            }
            Some(two_sample_test) => {
                for i in 0..n_groups {
                    for j in i + 1..n_groups {
                        let mut cells = grouping.cells_of(i);
                        cells.extend(grouping.cells_of(j));
                        cells.sort_unstable();
                        let sub_data = data.subset_cells(&cells)?;
                        let sub_grouping = grouping.subset(&cells)?;
                        let result = two_sample_inner(&sub_data, &sub_grouping, two_sample_test, config, estimator)?;
                        let lfc = result.log_fold_change(None);
                        p_values[i][j] = result.pval().to_vec();
                        p_values[j][i] = result.pval().to_vec();
                        log_fold_changes[j][i] = lfc.iter().map(|v| -v).collect();
                        log_fold_changes[i][j] = lfc;
                    }
                }
            }
        }
        Ok(())
    })?;

    let all_zero: Vec<bool> = (0..n_genes).map(|g| data.is_all_zero(g)).collect();
    for i in 0..n_groups {
        for j in 0..n_groups {
            for (g, &zero) in all_zero.iter().enumerate() {
                if zero || i == j {
                    p_values[i][j][g] = 1.0;
                    log_fold_changes[i][j][g] = 0.0;
                }
            }
        }
    }

    // Each unordered pair enters the family once
    let family: Vec<f64> = (0..n_groups)
        .flat_map(|i| (i + 1..n_groups).map(move |j| (i, j)))
        .flat_map(|(i, j)| p_values[i][j].iter().copied())
        .collect();
    let adjusted = correction::correct(&family, config.correction)?;
    let mut q_values = vec![vec![vec![1.0; n_genes]; n_groups]; n_groups];
    let mut chunks = adjusted.chunks(n_genes);
    for i in 0..n_groups {
        for j in i + 1..n_groups {
            if let Some(chunk) = chunks.next() {
                q_values[i][j] = chunk.to_vec();
                q_values[j][i] = chunk.to_vec();
            }
        }
    }

    info!("pairwise: finished {} comparisons", n_groups * (n_groups - 1) / 2);
    Ok(PairwiseResult {
        test_name: test.name().to_string(),
        groups: grouping.groups().to_vec(),
        gene_names: data.gene_names().to_vec(),
        mean: data.gene_means(),
        all_zero,
        p_values,
        q_values,
        log_fold_changes,
    })
}

/// Results of testing every group against all remaining cells.
#[derive(Debug, Clone)]
pub struct VersusRestResult {
    test_name: String,
    groups: Vec<String>,
    gene_names: Vec<String>,
    mean: Vec<f64>,
    all_zero: Vec<bool>,
    p_values: Vec<Vec<f64>>,
    q_values: Vec<Vec<f64>>,
    log_fold_changes: Vec<Vec<f64>>,
}

impl VersusRestResult {
    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn gene_names(&self) -> &[String] {
        &self.gene_names
    }

    pub fn pval_group(&self, group: &str) -> anyhow::Result<&[f64]> {
        Ok(&self.p_values[group_position(&self.groups, group)?])
    }

    pub fn qval_group(&self, group: &str) -> anyhow::Result<&[f64]> {
        Ok(&self.q_values[group_position(&self.groups, group)?])
    }

    /// Natural-log fold change of `group` over the rest.
    pub fn log_fold_change_group(&self, group: &str) -> anyhow::Result<&[f64]> {
        Ok(&self.log_fold_changes[group_position(&self.groups, group)?])
    }

    pub fn summary(&self) -> Vec<GeneSummary> {
        let p: Vec<&[f64]> = self.p_values.iter().map(|v| v.as_slice()).collect();
        let q: Vec<&[f64]> = self.q_values.iter().map(|v| v.as_slice()).collect();
        let lfc: Vec<&[f64]> = self.log_fold_changes.iter().map(|v| v.as_slice()).collect();
        combined_summary(&self.gene_names, &self.mean, &self.all_zero, &p, &q, &lfc)
    }

    pub fn summary_threshold(
        &self,
        qval_thres: Option<f64>,
        fc_upper_thres: Option<f64>,
        fc_lower_thres: Option<f64>,
        mean_thres: Option<f64>,
    ) -> Vec<GeneSummary> {
        threshold_summary(self.summary(), qval_thres, fc_upper_thres, fc_lower_thres, mean_thres)
    }

    pub fn summary_group(&self, group: &str) -> anyhow::Result<Vec<GeneSummary>> {
        let k = group_position(&self.groups, group)?;
        Ok(comparison_summary(
            &self.gene_names,
            &self.mean,
            &self.all_zero,
            &self.p_values[k],
            &self.q_values[k],
            &self.log_fold_changes[k],
        ))
    }
}

const REST: &str = "rest";
const TARGET: &str = "target";

/// Test every group against all other cells.
pub fn versus_rest(
    data: &ExpressionMatrix,
    grouping: &Grouping,
    test: TwoSampleTest,
    config: &TestConfig,
) -> anyhow::Result<VersusRestResult> {
    versus_rest_with(data, grouping, test, config, &NbGlmEstimator::new(config.fit.clone()))
}

/// [`versus_rest`] with a custom model-fitting engine.
pub fn versus_rest_with(
    data: &ExpressionMatrix,
    grouping: &Grouping,
    test: TwoSampleTest,
    config: &TestConfig,
    estimator: &dyn ModelEstimator,
) -> anyhow::Result<VersusRestResult> {
    grouping.require_cells(data.n_cells())?;
    grouping.require_min_groups(2)?;
    let n_groups = grouping.n_groups();
    let n_genes = data.n_genes();
    info!(
        "versus_rest: {} test for {} groups, {} genes",
        test.name(),
        n_groups,
        n_genes
    );

    let per_group = config.install(|| {
        (0..n_groups)
            .map(|k| {
                // "rest" sorts before "target", so the rest is the reference group
                let labels: Vec<&str> = grouping
                    .codes()
                    .iter()
                    .map(|&c| if c == k { TARGET } else { REST })
                    .collect();
                let binary = Grouping::from_labels(&labels)?;
                two_sample_inner(data, &binary, test, config, estimator)
            })
            .collect::<anyhow::Result<Vec<_>>>()
    })?;

    let p_values: Vec<Vec<f64>> = per_group.iter().map(|r| r.pval().to_vec()).collect();
    let log_fold_changes: Vec<Vec<f64>> = per_group.iter().map(|r| r.log_fold_change(None)).collect();

    let family: Vec<f64> = p_values.iter().flatten().copied().collect();
    let adjusted = correction::correct(&family, config.correction)?;
    let q_values: Vec<Vec<f64>> = adjusted.chunks(n_genes).map(|c| c.to_vec()).collect();

    info!("versus_rest: finished");
    Ok(VersusRestResult {
        test_name: test.name().to_string(),
        groups: grouping.groups().to_vec(),
        gene_names: data.gene_names().to_vec(),
        mean: data.gene_means(),
        all_zero: (0..n_genes).map(|g| data.is_all_zero(g)).collect(),
        p_values,
        q_values,
        log_fold_changes,
    })
}
