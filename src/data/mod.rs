//! Expression data and per-cell annotations.
//!
//! [`ExpressionMatrix`] holds a cells × genes matrix in gene-major compressed form
//! so per-gene tests can read one gene's values without scanning the whole matrix.

mod sample;

pub use sample::{Column, Grouping, SampleDescription};

use crate::error::DeError;
use nalgebra_sparse::{CscMatrix, CsrMatrix};
use ndarray::Array2;
use single_utilities::traits::FloatOpsTS;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct ExpressionMatrix {
    n_cells: usize,
    n_genes: usize,
    col_offsets: Vec<usize>,
    cell_indices: Vec<usize>,
    values: Vec<f64>,
    gene_names: Vec<String>,
}

impl ExpressionMatrix {
    /// Build from `(cell, gene, value)` triplets; explicit zeros are dropped and
    /// NaN or infinite values are rejected.
    fn from_triplets(n_cells: usize, n_genes: usize, triplets: Vec<(usize, usize, f64)>) -> anyhow::Result<Self> {
        if let Some(&(cell, gene, value)) = triplets.iter().find(|t| !t.2.is_finite()) {
            return Err(DeError::InvalidParameter(format!(
                "cell {} gene {}: expression values must be finite, got {}",
                cell, gene, value
            ))
            .into());
        }

        let mut counts = vec![0usize; n_genes];
        for &(_, gene, value) in &triplets {
            if value != 0.0 {
                counts[gene] += 1;
            }
        }

        let mut col_offsets = Vec::with_capacity(n_genes + 1);
        col_offsets.push(0);
        for c in &counts {
            let last = *col_offsets.last().unwrap_or(&0);
            col_offsets.push(last + c);
        }

        let nnz = col_offsets[n_genes];
        let mut cell_indices = vec![0usize; nnz];
        let mut values = vec![0.0; nnz];
        let mut cursor: Vec<usize> = col_offsets[..n_genes].to_vec();
        for (cell, gene, value) in triplets {
            if value != 0.0 {
                let pos = cursor[gene];
                cell_indices[pos] = cell;
                values[pos] = value;
                cursor[gene] += 1;
            }
        }

        // Keep cells ascending within a gene
        for g in 0..n_genes {
            let (start, end) = (col_offsets[g], col_offsets[g + 1]);
            let mut pairs: Vec<(usize, f64)> = cell_indices[start..end]
                .iter()
                .copied()
                .zip(values[start..end].iter().copied())
                .collect();
            if pairs.windows(2).any(|w| w[0].0 > w[1].0) {
                pairs.sort_by_key(|p| p.0);
                for (k, (c, v)) in pairs.into_iter().enumerate() {
                    cell_indices[start + k] = c;
                    values[start + k] = v;
                }
            }
        }

        Ok(ExpressionMatrix {
            n_cells,
            n_genes,
            col_offsets,
            cell_indices,
            values,
            gene_names: (0..n_genes).map(|g| format!("gene_{}", g)).collect(),
        })
    }

    pub fn from_csr<T>(matrix: &CsrMatrix<T>) -> anyhow::Result<Self>
    where
        T: FloatOpsTS,
    {
        let triplets: Vec<(usize, usize, f64)> = matrix
            .triplet_iter()
            .map(|(r, c, v)| to_f64(r, c, *v).map(|x| (r, c, x)))
            .collect::<anyhow::Result<_>>()?;
        Self::from_triplets(matrix.nrows(), matrix.ncols(), triplets)
    }

    pub fn from_csc<T>(matrix: &CscMatrix<T>) -> anyhow::Result<Self>
    where
        T: FloatOpsTS,
    {
        let triplets: Vec<(usize, usize, f64)> = matrix
            .triplet_iter()
            .map(|(r, c, v)| to_f64(r, c, *v).map(|x| (r, c, x)))
            .collect::<anyhow::Result<_>>()?;
        Self::from_triplets(matrix.nrows(), matrix.ncols(), triplets)
    }

    pub fn from_dense<T>(matrix: &Array2<T>) -> anyhow::Result<Self>
    where
        T: FloatOpsTS,
    {
        let (n_cells, n_genes) = matrix.dim();
        let triplets: Vec<(usize, usize, f64)> = matrix
            .indexed_iter()
            .map(|((r, c), v)| to_f64(r, c, *v).map(|x| (r, c, x)))
            .collect::<anyhow::Result<_>>()?;
        Self::from_triplets(n_cells, n_genes, triplets)
    }

    /// Build from row-major dense rows, one `Vec` per cell.
    pub fn from_rows(rows: &[Vec<f64>]) -> anyhow::Result<Self> {
        let n_cells = rows.len();
        if n_cells == 0 {
            return Err(DeError::EmptyData("expression matrix has no cells".into()).into());
        }
        let n_genes = rows[0].len();
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n_genes {
                return Err(DeError::dimension(&format!("genes in row {}", i), n_genes, row.len()).into());
            }
        }
        Self::from_triplets(
            n_cells,
            n_genes,
            rows.iter()
                .enumerate()
                .flat_map(|(r, row)| row.iter().enumerate().map(move |(c, &v)| (r, c, v)))
                .collect(),
        )
    }

    /// Read a cells × genes CSV table: a header row of gene names after the cell id
    /// column, then one row per cell. Returns the cell identifiers with the matrix.
    pub fn from_csv_reader<R: std::io::Read>(reader: R) -> anyhow::Result<(Vec<String>, Self)> {
        let mut rdr = csv::Reader::from_reader(reader);
        let headers: Vec<String> = rdr
            .headers()
            .map_err(DeError::from)?
            .iter()
            .skip(1)
            .map(|h| h.trim().to_string())
            .collect();
        if headers.is_empty() {
            return Err(DeError::EmptyData("count table has no gene columns".into()).into());
        }
        let n_genes = headers.len();

        let mut cell_ids = Vec::new();
        let mut triplets = Vec::new();
        for (row, record) in rdr.records().enumerate() {
            let record = record.map_err(DeError::from)?;
            if record.len() != n_genes + 1 {
                return Err(DeError::dimension(&format!("fields in count row {}", row + 1), n_genes + 1, record.len()).into());
            }
            cell_ids.push(record.get(0).unwrap_or_default().to_string());
            for (gene, field) in record.iter().skip(1).enumerate() {
                let value: f64 = field.trim().parse().map_err(|_| {
                    DeError::InvalidParameter(format!(
                        "count row {} gene '{}': '{}' is not a number",
                        row + 1,
                        headers[gene],
                        field
                    ))
                })?;
                if !value.is_finite() || value < 0.0 {
                    return Err(DeError::InvalidParameter(format!(
                        "count row {} gene '{}' must be finite and non-negative, got {}",
                        row + 1,
                        headers[gene],
                        value
                    ))
                    .into());
                }
                triplets.push((row, gene, value));
            }
        }
        if cell_ids.is_empty() {
            return Err(DeError::EmptyData("count table has no cells".into()).into());
        }

        let matrix = Self::from_triplets(cell_ids.len(), n_genes, triplets)?.with_gene_names(headers)?;
        Ok((cell_ids, matrix))
    }

    pub fn with_gene_names(mut self, names: Vec<String>) -> anyhow::Result<Self> {
        if names.len() != self.n_genes {
            return Err(DeError::dimension("gene names", self.n_genes, names.len()).into());
        }
        let unique: HashSet<&str> = names.iter().map(|s| s.as_str()).collect();
        if unique.len() != names.len() {
            return Err(DeError::InvalidParameter("gene names must be unique".into()).into());
        }
        self.gene_names = names;
        Ok(self)
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    pub fn n_genes(&self) -> usize {
        self.n_genes
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Whether any stored value is negative, as in scaled or centred data.
    pub fn has_negative_values(&self) -> bool {
        self.values.iter().any(|&v| v < 0.0)
    }

    pub fn gene_names(&self) -> &[String] {
        &self.gene_names
    }

    pub fn gene_index(&self, name: &str) -> Option<usize> {
        self.gene_names.iter().position(|g| g == name)
    }

    /// Non-zero entries of one gene as `(cell indices, values)`.
    pub fn gene_entries(&self, gene: usize) -> (&[usize], &[f64]) {
        let (start, end) = (self.col_offsets[gene], self.col_offsets[gene + 1]);
        (&self.cell_indices[start..end], &self.values[start..end])
    }

    /// Dense values of one gene across all cells.
    pub fn gene_values(&self, gene: usize) -> Vec<f64> {
        let mut dense = vec![0.0; self.n_cells];
        let (cells, values) = self.gene_entries(gene);
        for (&c, &v) in cells.iter().zip(values) {
            dense[c] = v;
        }
        dense
    }

    /// Values of one gene for the given cells, in the order given.
    pub fn gene_values_for(&self, gene: usize, cells: &[usize]) -> Vec<f64> {
        let dense = self.gene_values(gene);
        cells.iter().map(|&c| dense[c]).collect()
    }

    pub fn is_all_zero(&self, gene: usize) -> bool {
        let (_, values) = self.gene_entries(gene);
        values.iter().all(|&v| v == 0.0)
    }

    /// Mean of every gene over all cells.
    pub fn gene_means(&self) -> Vec<f64> {
        let n = self.n_cells as f64;
        (0..self.n_genes)
            .map(|g| self.gene_entries(g).1.iter().sum::<f64>() / n)
            .collect()
    }

    /// Sum and sum of squares of one gene over a subset of cells given as a mask.
    pub fn gene_sums_masked(&self, gene: usize, mask: &[bool]) -> (f64, f64) {
        let (cells, values) = self.gene_entries(gene);
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        for (&c, &v) in cells.iter().zip(values) {
            if mask[c] {
                sum += v;
                sum_sq += v * v;
            }
        }
        (sum, sum_sq)
    }

    /// Total expression of every cell.
    pub fn cell_totals(&self) -> Vec<f64> {
        let mut totals = vec![0.0; self.n_cells];
        for (&c, &v) in self.cell_indices.iter().zip(&self.values) {
            totals[c] += v;
        }
        totals
    }

    /// Restrict to a subset of cells; the new cell order follows `cells`.
    pub fn subset_cells(&self, cells: &[usize]) -> anyhow::Result<Self> {
        let mut new_index = vec![usize::MAX; self.n_cells];
        for (new, &old) in cells.iter().enumerate() {
            if old >= self.n_cells {
                return Err(DeError::InvalidParameter(format!(
                    "cell index {} out of bounds for {} cells",
                    old, self.n_cells
                ))
                .into());
            }
            new_index[old] = new;
        }

        let mut triplets = Vec::new();
        for g in 0..self.n_genes {
            let (cells_g, values_g) = self.gene_entries(g);
            for (&c, &v) in cells_g.iter().zip(values_g) {
                let mapped = new_index[c];
                if mapped != usize::MAX {
                    triplets.push((mapped, g, v));
                }
            }
        }

        let mut subset = Self::from_triplets(cells.len(), self.n_genes, triplets)?;
        subset.gene_names = self.gene_names.clone();
        Ok(subset)
    }
}

fn to_f64<T: FloatOpsTS>(cell: usize, gene: usize, value: T) -> anyhow::Result<f64> {
    value.to_f64().ok_or_else(|| {
        DeError::InvalidParameter(format!("cell {} gene {}: value is not representable as f64", cell, gene)).into()
    })
}

impl<T: FloatOpsTS> TryFrom<&CsrMatrix<T>> for ExpressionMatrix {
    type Error = anyhow::Error;

    fn try_from(matrix: &CsrMatrix<T>) -> anyhow::Result<Self> {
        ExpressionMatrix::from_csr(matrix)
    }
}

impl<T: FloatOpsTS> TryFrom<&Array2<T>> for ExpressionMatrix {
    type Error = anyhow::Error;

    fn try_from(matrix: &Array2<T>) -> anyhow::Result<Self> {
        ExpressionMatrix::from_dense(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;
    use ndarray::array;

    #[test]
    fn reads_count_csv() {
        let text = "cell,g1,g2\nc1,0,3\nc2,2,0\n";
        let (ids, m) = ExpressionMatrix::from_csv_reader(text.as_bytes()).unwrap();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(m.gene_names(), &["g1", "g2"]);
        assert_eq!(m.gene_values(1), vec![3.0, 0.0]);
        assert_eq!(m.nnz(), 2);

        assert!(ExpressionMatrix::from_csv_reader("cell,g1\nc1,x\n".as_bytes()).is_err());
        assert!(ExpressionMatrix::from_csv_reader("cell,g1\nc1,-1\n".as_bytes()).is_err());
        assert!(ExpressionMatrix::from_csv_reader("cell,g1\n".as_bytes()).is_err());
    }

    fn small_csr() -> CsrMatrix<f64> {
        // 4 cells x 3 genes
        let coo = CooMatrix::try_from_triplets(
            4,
            3,
            vec![0, 1, 2, 3, 0, 3],
            vec![0, 0, 0, 0, 2, 2],
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        )
        .unwrap();
        CsrMatrix::from(&coo)
    }

    #[test]
    fn csr_and_dense_agree() {
        let sparse = ExpressionMatrix::from_csr(&small_csr()).unwrap();
        let dense = ExpressionMatrix::from_dense(&array![
            [1.0, 0.0, 5.0],
            [2.0, 0.0, 0.0],
            [3.0, 0.0, 0.0],
            [4.0, 0.0, 6.0]
        ])
        .unwrap();
        assert_eq!(sparse.n_cells(), 4);
        assert_eq!(sparse.n_genes(), 3);
        assert_eq!(sparse.nnz(), 6);
        for g in 0..3 {
            assert_eq!(sparse.gene_values(g), dense.gene_values(g));
        }
        assert!(sparse.is_all_zero(1));
        assert!(!sparse.is_all_zero(2));
    }

    #[test]
    fn constructors_reject_non_finite_values() {
        let err = ExpressionMatrix::from_rows(&[vec![1.0, f64::NAN], vec![0.0, 2.0]]).unwrap_err();
        assert!(matches!(err.downcast_ref::<DeError>(), Some(DeError::InvalidParameter(_))));
        assert!(ExpressionMatrix::from_dense(&array![[1.0, f64::INFINITY], [0.0, 2.0]]).is_err());

        let coo = CooMatrix::try_from_triplets(2, 1, vec![1], vec![0], vec![f64::NEG_INFINITY]).unwrap();
        let csr = CsrMatrix::from(&coo);
        assert!(ExpressionMatrix::from_csr(&csr).is_err());
        assert!(ExpressionMatrix::try_from(&csr).is_err());

        let scaled = ExpressionMatrix::from_rows(&[vec![-0.5, 1.0], vec![0.5, 2.0]]).unwrap();
        assert!(scaled.has_negative_values());
        assert!(!ExpressionMatrix::from_csr(&small_csr()).unwrap().has_negative_values());
    }

    #[test]
    fn means_and_totals() {
        let m = ExpressionMatrix::from_csr(&small_csr()).unwrap();
        assert_eq!(m.gene_means(), vec![2.5, 0.0, 2.75]);
        assert_eq!(m.cell_totals(), vec![6.0, 2.0, 3.0, 10.0]);
        let mask = vec![true, false, false, true];
        assert_eq!(m.gene_sums_masked(0, &mask), (5.0, 17.0));
    }

    #[test]
    fn subset_reorders_cells() {
        let m = ExpressionMatrix::from_csr(&small_csr()).unwrap();
        let s = m.subset_cells(&[3, 0]).unwrap();
        assert_eq!(s.n_cells(), 2);
        assert_eq!(s.gene_values(0), vec![4.0, 1.0]);
        assert_eq!(s.gene_values(2), vec![6.0, 5.0]);
        assert_eq!(s.gene_names(), m.gene_names());
        assert!(m.subset_cells(&[7]).is_err());
    }

    #[test]
    fn gene_names_are_validated() {
        let m = ExpressionMatrix::from_csr(&small_csr()).unwrap();
        assert!(m.clone().with_gene_names(vec!["a".into(), "b".into()]).is_err());
        assert!(
            m.clone()
                .with_gene_names(vec!["a".into(), "a".into(), "b".into()])
                .is_err()
        );
        let named = m
            .with_gene_names(vec!["a".into(), "b".into(), "c".into()])
            .unwrap();
        assert_eq!(named.gene_index("c"), Some(2));
    }

    #[test]
    fn from_rows_checks_shape() {
        assert!(ExpressionMatrix::from_rows(&[vec![1.0, 2.0], vec![3.0]]).is_err());
        assert!(ExpressionMatrix::from_rows(&[]).is_err());
        let m = ExpressionMatrix::from_rows(&[vec![1.0, 0.0], vec![0.0, 2.0]]).unwrap();
        assert_eq!(m.gene_values(1), vec![0.0, 2.0]);
    }
}
