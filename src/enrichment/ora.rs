use crate::de::{DifferentialExpressionTest, nan_last};
use crate::enrichment::RefSets;
use crate::error::DeError;
use crate::testing::correction::{self, CorrectionMethod};
use crate::testing::inference::discrete::hypergeom_test;
use log::info;
use serde::Serialize;
use std::collections::HashSet;

/// Enrichment of one reference set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetSummary {
    pub set: String,
    /// Genes of the set found in the background.
    pub size: usize,
    /// Significant genes in the set.
    pub overlap: usize,
    pub pval: f64,
    pub qval: f64,
}

#[derive(Debug, Clone)]
pub struct EnrichmentResult {
    rows: Vec<SetSummary>,
    n_background: usize,
    n_significant: usize,
}

impl EnrichmentResult {
    /// One row per reference set, in the order of the reference collection.
    pub fn summary(&self) -> &[SetSummary] {
        &self.rows
    }

    pub fn n_background(&self) -> usize {
        self.n_background
    }

    pub fn n_significant(&self) -> usize {
        self.n_significant
    }

    /// Sets with a q-value below `alpha`, most significant first.
    pub fn significant_sets(&self, alpha: f64) -> Vec<&SetSummary> {
        let mut sets: Vec<&SetSummary> = self.rows.iter().filter(|r| r.qval < alpha).collect();
        sets.sort_by(|a, b| nan_last(a.qval, b.qval));
        sets
    }

    pub fn to_csv<W: std::io::Write>(&self, writer: W) -> anyhow::Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for row in &self.rows {
            wtr.serialize(row).map_err(DeError::from)?;
        }
        wtr.flush().map_err(DeError::from)?;
        Ok(())
    }
}

/// Over-representation of the genes with `q < threshold` in every reference set.
///
/// The background is every tested gene; genes without expression are left out of it
/// unless `incl_all_zero` is set.
pub fn enrich(
    ref_sets: &RefSets,
    det: &DifferentialExpressionTest,
    threshold: f64,
    incl_all_zero: bool,
    correction: CorrectionMethod,
) -> anyhow::Result<EnrichmentResult> {
    let mut background = Vec::new();
    let mut significant = Vec::new();
    for (g, name) in det.gene_names().iter().enumerate() {
        if det.all_zero()[g] && !incl_all_zero {
            continue;
        }
        background.push(name.clone());
        if det.qval()[g] < threshold {
            significant.push(name.clone());
        }
    }
    enrich_lists(ref_sets, &background, &significant, correction)
}

/// Over-representation of `significant` genes against a background gene list.
pub fn enrich_lists(
    ref_sets: &RefSets,
    background: &[String],
    significant: &[String],
    correction: CorrectionMethod,
) -> anyhow::Result<EnrichmentResult> {
    if ref_sets.is_empty() {
        return Err(DeError::EmptyData("no reference gene sets".into()).into());
    }
    let background_set: HashSet<&str> = background.iter().map(|g| g.as_str()).collect();
    if background_set.is_empty() {
        return Err(DeError::EmptyData("empty background gene list".into()).into());
    }
    let significant_set: HashSet<&str> = significant
        .iter()
        .map(|g| g.as_str())
        .filter(|g| background_set.contains(g))
        .collect();
    if significant_set.len() < significant.len() {
        return Err(DeError::InvalidParameter(
            "significant genes must be distinct members of the background".into(),
        )
        .into());
    }

    let n_background = background_set.len() as u64;
    let n_significant = significant_set.len() as u64;
    info!(
        "enrichment: {} significant of {} background genes against {} sets",
        n_significant,
        n_background,
        ref_sets.len()
    );

    let mut rows = Vec::with_capacity(ref_sets.len());
    for set in ref_sets.sets() {
        let size = set.genes.iter().filter(|g| background_set.contains(g.as_str())).count();
        let overlap = set.genes.iter().filter(|g| significant_set.contains(g.as_str())).count();
        let pval = hypergeom_test(overlap as u64, n_significant, size as u64, n_background)?;
        rows.push(SetSummary {
            set: set.name.clone(),
            size,
            overlap,
            pval,
            qval: f64::NAN,
        });
    }

    let p_values: Vec<f64> = rows.iter().map(|r| r.pval).collect();
    let q_values = correction::correct(&p_values, correction)?;
    for (row, q) in rows.iter_mut().zip(q_values) {
        row.qval = q;
    }

    Ok(EnrichmentResult {
        rows,
        n_background: n_background as usize,
        n_significant: n_significant as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ExpressionMatrix;
    use approx::assert_relative_eq;

    fn genes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn hypergeometric_per_set() {
        let mut sets = RefSets::new();
        sets.add("hit", "", &["g0", "g1", "g2", "g3", "g4"]);
        sets.add("miss", "", &["g10", "g11"]);
        let background: Vec<String> = (0..20).map(|i| format!("g{}", i)).collect();
        let significant = genes(&["g0", "g1", "g2", "g15"]);

        let result = enrich_lists(&sets, &background, &significant, CorrectionMethod::Bonferroni).unwrap();
        let hit = &result.summary()[0];
        assert_eq!((hit.size, hit.overlap), (5, 3));
        assert_relative_eq!(hit.pval, 155.0 / 4845.0, epsilon = 1e-10);
        assert_relative_eq!(hit.qval, 2.0 * 155.0 / 4845.0, epsilon = 1e-10);
        assert_eq!(result.summary()[1].pval, 1.0);

        let significant_sets = result.significant_sets(0.1);
        assert_eq!(significant_sets.len(), 1);
        assert_eq!(significant_sets[0].set, "hit");
    }

    #[test]
    fn rejects_genes_outside_background() {
        let mut sets = RefSets::new();
        sets.add("a", "", &["g0"]);
        let background = genes(&["g0", "g1"]);
        assert!(enrich_lists(&sets, &background, &genes(&["g7"]), CorrectionMethod::Bonferroni).is_err());
        assert!(enrich_lists(&RefSets::new(), &background, &[], CorrectionMethod::Bonferroni).is_err());
    }

    #[test]
    fn enrich_uses_test_results() {
        let data = ExpressionMatrix::from_rows(&[vec![1.0, 0.0, 2.0, 3.0], vec![2.0, 0.0, 2.0, 1.0]])
            .unwrap()
            .with_gene_names(genes(&["a", "b", "c", "d"]))
            .unwrap();
        let det = DifferentialExpressionTest::new(
            "test",
            &data,
            vec![0.001, 0.5, 0.9, 0.002],
            vec![0.0; 4],
            CorrectionMethod::Bonferroni,
        )
        .unwrap();
        let mut sets = RefSets::new();
        sets.add("ad", "", &["a", "d"]);
        sets.add("bc", "", &["b", "c"]);

        let without_zero = enrich(&sets, &det, 0.05, false, CorrectionMethod::Bonferroni).unwrap();
        assert_eq!(without_zero.n_background(), 3);
        assert_eq!(without_zero.n_significant(), 2);
        assert_eq!(without_zero.summary()[1].size, 1);

        let with_zero = enrich(&sets, &det, 0.05, true, CorrectionMethod::Bonferroni).unwrap();
        assert_eq!(with_zero.n_background(), 4);
        // both significant genes fall into "ad": 1 / C(4, 2)
        assert_relative_eq!(with_zero.summary()[0].pval, 1.0 / 6.0, epsilon = 1e-10);

        let mut buf = Vec::new();
        with_zero.to_csv(&mut buf).unwrap();
        assert!(String::from_utf8(buf).unwrap().starts_with("set,size,overlap,pval,qval\n"));
    }
}
