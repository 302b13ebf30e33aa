//! Effect sizes between two groups of cells.
//!
//! Differential expression results report natural-log fold changes of group means
//! ([`log_fold_change_of_means`]); the standardised effect sizes are available for
//! marker ranking.

use crate::data::ExpressionMatrix;
use crate::error::DeError;

fn group_mean(data: &ExpressionMatrix, gene: usize, cells: &[usize]) -> f64 {
    data.gene_values_for(gene, cells).iter().sum::<f64>() / cells.len() as f64
}

fn check_groups(group1_indices: &[usize], group2_indices: &[usize]) -> anyhow::Result<()> {
    if group1_indices.is_empty() || group2_indices.is_empty() {
        return Err(DeError::EmptyData("group indices cannot be empty".into()).into());
    }
    Ok(())
}

/// `ln(max(mean1, eps)) - ln(max(mean0, eps))` with `mean0` the reference group.
pub fn log_fold_change_of_means(mean0: f64, mean1: f64, eps: f64) -> f64 {
    mean1.max(eps).ln() - mean0.max(eps).ln()
}

/// Natural-log fold change of `other` over `reference` for one gene.
pub fn group_log_fold_change(
    data: &ExpressionMatrix,
    gene: usize,
    reference: &[usize],
    other: &[usize],
    eps: f64,
) -> anyhow::Result<f64> {
    check_groups(reference, other)?;
    Ok(log_fold_change_of_means(
        group_mean(data, gene, reference),
        group_mean(data, gene, other),
        eps,
    ))
}

/// Calculate log2 fold change between two groups
pub fn calculate_log2_fold_change(
    data: &ExpressionMatrix,
    gene: usize,
    group1_indices: &[usize], // Group of interest
    group2_indices: &[usize], // Reference group
    pseudo_count: f64,        // Small value like 1e-9 or 1.0
) -> anyhow::Result<f64> {
    check_groups(group1_indices, group2_indices)?;

    let mean1 = group_mean(data, gene, group1_indices) + pseudo_count;
    let mean2 = group_mean(data, gene, group2_indices) + pseudo_count;

    Ok((mean1 / mean2).log2())
}

/// Calculate Cohen's d effect size for a gene, oriented as group 2 minus group 1
pub fn calculate_cohens_d(
    data: &ExpressionMatrix,
    gene: usize,
    group1_indices: &[usize],
    group2_indices: &[usize],
) -> anyhow::Result<f64> {
    if group1_indices.len() < 2 || group2_indices.len() < 2 {
        return Err(DeError::InvalidParameter(
            "each group must have at least 2 cells for Cohen's d".into(),
        )
        .into());
    }

    let group1_values = data.gene_values_for(gene, group1_indices);
    let group2_values = data.gene_values_for(gene, group2_indices);

    let n1 = group1_values.len() as f64;
    let n2 = group2_values.len() as f64;
    let mean1 = group1_values.iter().sum::<f64>() / n1;
    let mean2 = group2_values.iter().sum::<f64>() / n2;

    let var1 = group1_values.iter().map(|&x| (x - mean1).powi(2)).sum::<f64>() / (n1 - 1.0);
    let var2 = group2_values.iter().map(|&x| (x - mean2).powi(2)).sum::<f64>() / (n2 - 1.0);

    let pooled_sd = (((n1 - 1.0) * var1 + (n2 - 1.0) * var2) / (n1 + n2 - 2.0)).sqrt();

    Ok((mean2 - mean1) / pooled_sd)
}

/// Calculate Hedge's g (bias-corrected effect size)
pub fn calculate_hedges_g(
    data: &ExpressionMatrix,
    gene: usize,
    group1_indices: &[usize],
    group2_indices: &[usize],
) -> anyhow::Result<f64> {
    let d = calculate_cohens_d(data, gene, group1_indices, group2_indices)?;

    let n = (group1_indices.len() + group2_indices.len()) as f64;
    let j = 1.0 - 3.0 / (4.0 * (n - 2.0) - 1.0);

    Ok(j * d)
}
