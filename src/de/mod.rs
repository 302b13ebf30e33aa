//! Differential expression tests.
//!
//! Single tests ([`wald`], [`lrt`], [`t_test`], [`rank_test`], [`two_sample`]) produce a
//! [`DifferentialExpressionTest`] with one p-value, q-value and log fold change per
//! gene. Multi-tests ([`pairwise`], [`versus_rest`]) run many comparisons at once and
//! [`partition`] repeats a test inside every level of an annotation column.
//!
//! Fold changes are stored on the natural-log scale and oriented as the tested group
//! over the reference group (the first group in sorted order).

mod multi;
mod partition;
mod single;

pub use multi::{PairwiseResult, PairwiseTest, VersusRestResult, pairwise, pairwise_with, versus_rest, versus_rest_with};
pub use partition::{Partition, PartitionTest, partition};
pub use single::{
    LrtSpec, TwoSampleTest, WaldSpec, WaldTarget, lrt, lrt_with, rank_test, t_test, two_sample,
    two_sample_with, wald, wald_with,
};

use crate::data::ExpressionMatrix;
use crate::error::DeError;
use crate::testing::correction::{self, CorrectionMethod};
use serde::Serialize;
use std::cmp::Ordering;
use std::io::Write;

/// One row of a result table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneSummary {
    pub gene: String,
    pub pval: f64,
    pub qval: f64,
    pub log2fc: f64,
    pub mean: f64,
    /// True when the gene has no expression in any tested cell.
    pub zero_mean: bool,
    pub coef_mle: Option<f64>,
    pub coef_sd: Option<f64>,
    pub ll: Option<f64>,
}

/// Per-gene result of a single test.
#[derive(Debug, Clone)]
pub struct DifferentialExpressionTest {
    test_name: String,
    gene_names: Vec<String>,
    p_values: Vec<f64>,
    q_values: Vec<f64>,
    log_fold_changes: Vec<f64>,
    mean: Vec<f64>,
    all_zero: Vec<bool>,
    statistics: Option<Vec<f64>>,
    coef_mle: Option<Vec<f64>>,
    coef_sd: Option<Vec<f64>>,
    log_likelihood: Option<Vec<f64>>,
}

impl DifferentialExpressionTest {
    /// Assemble a result and derive q-values.
    ///
    /// Genes without expression get p = 1 and a zero fold change whatever the test
    /// reported for them.
    pub fn new(
        test_name: &str,
        data: &ExpressionMatrix,
        mut p_values: Vec<f64>,
        mut log_fold_changes: Vec<f64>,
        correction: CorrectionMethod,
    ) -> anyhow::Result<Self> {
        let n_genes = data.n_genes();
        if p_values.len() != n_genes {
            return Err(DeError::dimension("p-values", n_genes, p_values.len()).into());
        }
        if log_fold_changes.len() != n_genes {
            return Err(DeError::dimension("log fold changes", n_genes, log_fold_changes.len()).into());
        }
        if n_genes == 0 {
            return Err(DeError::EmptyData("no genes to test".into()).into());
        }

        let all_zero: Vec<bool> = (0..n_genes).map(|g| data.is_all_zero(g)).collect();
        for (g, &zero) in all_zero.iter().enumerate() {
            if zero {
                p_values[g] = 1.0;
                log_fold_changes[g] = 0.0;
            }
        }
        let q_values = correction::correct(&p_values, correction)?;

        Ok(DifferentialExpressionTest {
            test_name: test_name.to_string(),
            gene_names: data.gene_names().to_vec(),
            p_values,
            q_values,
            log_fold_changes,
            mean: data.gene_means(),
            all_zero,
            statistics: None,
            coef_mle: None,
            coef_sd: None,
            log_likelihood: None,
        })
    }

    pub fn with_statistics(mut self, statistics: Vec<f64>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    pub fn with_coefficients(mut self, mle: Vec<f64>, sd: Vec<f64>) -> Self {
        self.coef_mle = Some(mle);
        self.coef_sd = Some(sd);
        self
    }

    pub fn with_log_likelihood(mut self, ll: Vec<f64>) -> Self {
        self.log_likelihood = Some(ll);
        self
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn n_genes(&self) -> usize {
        self.gene_names.len()
    }

    pub fn gene_names(&self) -> &[String] {
        &self.gene_names
    }

    pub fn pval(&self) -> &[f64] {
        &self.p_values
    }

    pub fn qval(&self) -> &[f64] {
        &self.q_values
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn all_zero(&self) -> &[bool] {
        &self.all_zero
    }

    pub fn statistics(&self) -> Option<&[f64]> {
        self.statistics.as_deref()
    }

    pub fn coef_mle(&self) -> Option<&[f64]> {
        self.coef_mle.as_deref()
    }

    pub fn coef_sd(&self) -> Option<&[f64]> {
        self.coef_sd.as_deref()
    }

    pub fn log_likelihood(&self) -> Option<&[f64]> {
        self.log_likelihood.as_deref()
    }

    /// Fold changes in the given logarithm base; natural log when `base` is `None`.
    pub fn log_fold_change(&self, base: Option<f64>) -> Vec<f64> {
        convert_base(&self.log_fold_changes, base)
    }

    pub fn log2_fold_change(&self) -> Vec<f64> {
        self.log_fold_change(Some(2.0))
    }

    pub fn summary(&self) -> Vec<GeneSummary> {
        let log2fc = self.log2_fold_change();
        (0..self.n_genes())
            .map(|g| GeneSummary {
                gene: self.gene_names[g].clone(),
                pval: self.p_values[g],
                qval: self.q_values[g],
                log2fc: log2fc[g],
                mean: self.mean[g],
                zero_mean: self.all_zero[g],
                coef_mle: self.coef_mle.as_ref().map(|v| v[g]),
                coef_sd: self.coef_sd.as_ref().map(|v| v[g]),
                ll: self.log_likelihood.as_ref().map(|v| v[g]),
            })
            .collect()
    }

    /// Summary restricted to genes passing every given threshold.
    ///
    /// Fold change thresholds are on the linear scale. With both bounds set a gene
    /// passes when it is above the upper or below the lower bound.
    pub fn summary_threshold(
        &self,
        qval_thres: Option<f64>,
        fc_upper_thres: Option<f64>,
        fc_lower_thres: Option<f64>,
        mean_thres: Option<f64>,
    ) -> Vec<GeneSummary> {
        threshold_summary(self.summary(), qval_thres, fc_upper_thres, fc_lower_thres, mean_thres)
    }

    /// Genes with a q-value below `alpha`, in gene order.
    pub fn significant_genes(&self, alpha: f64) -> Vec<&str> {
        self.q_values
            .iter()
            .zip(&self.gene_names)
            .filter(|(q, _)| **q < alpha)
            .map(|(_, name)| name.as_str())
            .collect()
    }

    /// The `n` genes with the smallest q-values; ties are broken by p-value.
    pub fn top_genes(&self, n: usize) -> Vec<&str> {
        let mut order: Vec<usize> = (0..self.n_genes()).collect();
        order.sort_by(|&a, &b| {
            nan_last(self.q_values[a], self.q_values[b])
                .then_with(|| nan_last(self.p_values[a], self.p_values[b]))
        });
        order
            .into_iter()
            .take(n)
            .map(|g| self.gene_names[g].as_str())
            .collect()
    }

    /// Write the summary table as CSV.
    pub fn to_csv<W: Write>(&self, writer: W) -> anyhow::Result<()> {
        write_summary_csv(&self.summary(), writer)
    }
}

/// Write summary rows as CSV with a header line.
pub fn write_summary_csv<W: Write>(rows: &[GeneSummary], writer: W) -> anyhow::Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for row in rows {
        wtr.serialize(row).map_err(DeError::from)?;
    }
    wtr.flush().map_err(DeError::from)?;
    Ok(())
}

pub(crate) fn threshold_summary(
    rows: Vec<GeneSummary>,
    qval_thres: Option<f64>,
    fc_upper_thres: Option<f64>,
    fc_lower_thres: Option<f64>,
    mean_thres: Option<f64>,
) -> Vec<GeneSummary> {
    let upper = fc_upper_thres.map(f64::log2);
    let lower = fc_lower_thres.map(f64::log2);
    rows.into_iter()
        .filter(|r| qval_thres.is_none_or(|t| r.qval <= t))
        .filter(|r| match (upper, lower) {
            (Some(u), None) => r.log2fc >= u,
            (None, Some(l)) => r.log2fc <= l,
            (Some(u), Some(l)) => r.log2fc >= u || r.log2fc <= l,
            (None, None) => true,
        })
        .filter(|r| mean_thres.is_none_or(|t| r.mean >= t))
        .collect()
}

pub(crate) fn convert_base(values: &[f64], base: Option<f64>) -> Vec<f64> {
    match base {
        None => values.to_vec(),
        Some(b) => {
            let ln_base = b.ln();
            values.iter().map(|v| v / ln_base).collect()
        }
    }
}

pub(crate) fn nan_last(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Minimum over the non-NaN entries; NaN when there are none.
pub(crate) fn nan_min<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold(f64::NAN, |acc, v| if acc.is_nan() || v < acc { v } else { acc })
}

/// Entry with the largest magnitude, keeping its sign.
pub(crate) fn max_abs<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold(f64::NAN, |acc, v| if acc.is_nan() || v.abs() > acc.abs() { v } else { acc })
}

/// Per-gene summary over several comparisons: minimal p and q, largest fold change.
pub(crate) fn combined_summary(
    gene_names: &[String],
    mean: &[f64],
    all_zero: &[bool],
    p_values: &[&[f64]],
    q_values: &[&[f64]],
    log_fold_changes: &[&[f64]],
) -> Vec<GeneSummary> {
    let ln2 = std::f64::consts::LN_2;
    (0..gene_names.len())
        .map(|g| GeneSummary {
            gene: gene_names[g].clone(),
            pval: nan_min(p_values.iter().map(|p| p[g])),
            qval: nan_min(q_values.iter().map(|q| q[g])),
            log2fc: max_abs(log_fold_changes.iter().map(|l| l[g])) / ln2,
            mean: mean[g],
            zero_mean: all_zero[g],
            coef_mle: None,
            coef_sd: None,
            ll: None,
        })
        .collect()
}

/// Single comparison summary built from raw per-gene vectors.
pub(crate) fn comparison_summary(
    gene_names: &[String],
    mean: &[f64],
    all_zero: &[bool],
    p_values: &[f64],
    q_values: &[f64],
    log_fold_changes: &[f64],
) -> Vec<GeneSummary> {
    combined_summary(gene_names, mean, all_zero, &[p_values], &[q_values], &[log_fold_changes])
}
