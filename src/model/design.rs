//! Design matrices built from a formula and a sample description.
//!
//! Categorical variables use treatment coding against their first (sorted) level and
//! are named `var[T.level]`. When the formula has no intercept, the first categorical
//! term is coded in full (`var[level]`, one column per level) so every group gets its
//! own coefficient.

use crate::data::{Column, Grouping, SampleDescription};
use crate::error::DeError;
use crate::model::formula::{Formula, Term};
use nalgebra::DMatrix;
use std::ops::Range;

pub const INTERCEPT: &str = "Intercept";

#[derive(Debug, Clone)]
pub struct DesignMatrix {
    matrix: DMatrix<f64>,
    coefficient_names: Vec<String>,
    /// Column range of every term, the intercept included.
    term_slices: Vec<(String, Range<usize>)>,
}

/// Columns produced by one variable before interaction products.
fn variable_columns(
    description: &SampleDescription,
    var: &str,
    full_rank_coding: bool,
) -> anyhow::Result<Vec<(String, Vec<f64>)>> {
    match description.column(var)? {
        Column::Numeric(values) => Ok(vec![(var.to_string(), values.clone())]),
        Column::Categorical(values) => {
            let levels = description.levels(var)?;
            let coded: Vec<&String> = if full_rank_coding {
                levels.iter().collect()
            } else {
                levels.iter().skip(1).collect()
            };
            Ok(coded
                .into_iter()
                .map(|level| {
                    let name = if full_rank_coding {
                        format!("{}[{}]", var, level)
                    } else {
                        format!("{}[T.{}]", var, level)
                    };
                    let col = values.iter().map(|v| if v == level { 1.0 } else { 0.0 }).collect();
                    (name, col)
                })
                .collect())
        }
    }
}

impl DesignMatrix {
    pub fn from_matrix(matrix: DMatrix<f64>, coefficient_names: Vec<String>) -> anyhow::Result<Self> {
        if matrix.ncols() != coefficient_names.len() {
            return Err(DeError::dimension("coefficient names", matrix.ncols(), coefficient_names.len()).into());
        }
        let term_slices = coefficient_names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i..i + 1))
            .collect();
        Ok(DesignMatrix {
            matrix,
            coefficient_names,
            term_slices,
        })
    }

    pub fn from_formula(description: &SampleDescription, formula: &Formula) -> anyhow::Result<Self> {
        let n_cells = description.n_cells();
        for var in formula.variables() {
            if !description.has_column(var) {
                return Err(DeError::MissingColumn(var.to_string()).into());
            }
        }

        let mut names: Vec<String> = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();
        let mut term_slices = Vec::new();

        if formula.intercept {
            names.push(INTERCEPT.to_string());
            columns.push(vec![1.0; n_cells]);
            term_slices.push((INTERCEPT.to_string(), 0..1));
        }

        let mut full_coding_used = formula.intercept;
        for term in &formula.terms {
            let start = names.len();
            match term {
                Term::Main(var) => {
                    let is_categorical = matches!(description.column(var)?, Column::Categorical(_));
                    let full = is_categorical && !full_coding_used;
                    if full {
                        full_coding_used = true;
                    }
                    for (name, col) in variable_columns(description, var, full)? {
                        names.push(name);
                        columns.push(col);
                    }
                }
                Term::Interaction(vars) => {
                    let mut acc: Vec<(String, Vec<f64>)> = vec![(String::new(), vec![1.0; n_cells])];
                    for var in vars {
                        let var_cols = variable_columns(description, var, false)?;
                        let mut next = Vec::with_capacity(acc.len() * var_cols.len());
                        for (left_name, left) in &acc {
                            for (right_name, right) in &var_cols {
                                let name = if left_name.is_empty() {
                                    right_name.clone()
                                } else {
                                    format!("{}:{}", left_name, right_name)
                                };
                                let col = left.iter().zip(right).map(|(a, b)| a * b).collect();
                                next.push((name, col));
                            }
                        }
                        acc = next;
                    }
                    for (name, col) in acc {
                        names.push(name);
                        columns.push(col);
                    }
                }
            }
            term_slices.push((term.name(), start..names.len()));
        }

        if names.is_empty() {
            return Err(DeError::InvalidParameter("design matrix has no columns".into()).into());
        }

        let matrix = DMatrix::from_fn(n_cells, names.len(), |i, j| columns[j][i]);
        let design = DesignMatrix {
            matrix,
            coefficient_names: names,
            term_slices,
        };
        design.check_full_rank()?;
        Ok(design)
    }

    pub fn from_formula_str(description: &SampleDescription, formula: &str) -> anyhow::Result<Self> {
        Self::from_formula(description, &Formula::parse(formula)?)
    }

    /// Cell-means design `~ 0 + group`: one indicator column per group.
    pub fn for_groups(grouping: &Grouping) -> anyhow::Result<Self> {
        let names = grouping.groups().iter().map(|g| format!("group[{}]", g)).collect();
        let codes = grouping.codes();
        let matrix = DMatrix::from_fn(codes.len(), grouping.n_groups(), |i, j| {
            if codes[i] == j { 1.0 } else { 0.0 }
        });
        Self::from_matrix(matrix, names)
    }

    fn check_full_rank(&self) -> anyhow::Result<()> {
        let rank = self.matrix.rank(1e-10);
        if rank < self.n_coefficients() {
            return Err(DeError::InvalidParameter(format!(
                "design matrix with coefficients {:?} is rank deficient (rank {} < {})",
                self.coefficient_names,
                rank,
                self.n_coefficients()
            ))
            .into());
        }
        Ok(())
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn n_cells(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_coefficients(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn coefficient_names(&self) -> &[String] {
        &self.coefficient_names
    }

    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coefficient_names.iter().position(|n| n == name)
    }

    /// Columns belonging to a term (e.g. every level of a factor).
    pub fn term_indices(&self, term: &str) -> anyhow::Result<Vec<usize>> {
        self.term_slices
            .iter()
            .find(|(name, _)| name == term)
            .map(|(_, range)| range.clone().collect())
            .ok_or_else(|| {
                DeError::InvalidParameter(format!(
                    "term '{}' not in design; available terms: {:?}",
                    term,
                    self.term_slices.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>()
                ))
                .into()
            })
    }

    /// Resolve coefficient names to indices.
    pub fn coefficient_indices(&self, names: &[&str]) -> anyhow::Result<Vec<usize>> {
        names
            .iter()
            .map(|name| {
                self.coefficient_index(name).ok_or_else(|| {
                    DeError::InvalidParameter(format!(
                        "coefficient '{}' not found; available: {:?}",
                        name, self.coefficient_names
                    ))
                    .into()
                })
            })
            .collect()
    }

    /// Design without the given terms, e.g. the reduced model of a likelihood ratio test.
    pub fn drop_terms(&self, terms: &[&str]) -> anyhow::Result<DesignMatrix> {
        for term in terms {
            self.term_indices(term)?;
        }
        let mut keep: Vec<usize> = Vec::new();
        let mut term_slices = Vec::new();
        for (name, range) in &self.term_slices {
            if terms.contains(&name.as_str()) {
                continue;
            }
            let start = keep.len();
            keep.extend(range.clone());
            term_slices.push((name.clone(), start..keep.len()));
        }
        if keep.is_empty() {
            return Err(DeError::InvalidParameter("dropping every term leaves an empty design".into()).into());
        }
        let matrix = DMatrix::from_fn(self.n_cells(), keep.len(), |i, j| self.matrix[(i, keep[j])]);
        Ok(DesignMatrix {
            matrix,
            coefficient_names: keep.iter().map(|&j| self.coefficient_names[j].clone()).collect(),
            term_slices,
        })
    }

    /// Restrict the design to a subset of cells.
    pub fn subset_cells(&self, cells: &[usize]) -> DesignMatrix {
        let p = self.n_coefficients();
        let matrix = DMatrix::from_fn(cells.len(), p, |i, j| self.matrix[(cells[i], j)]);
        DesignMatrix {
            matrix,
            coefficient_names: self.coefficient_names.clone(),
            term_slices: self.term_slices.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description() -> SampleDescription {
        SampleDescription::new(6)
            .with_categorical("cond", &["a", "a", "b", "b", "c", "c"])
            .unwrap()
            .with_categorical("batch", &["x", "y", "x", "y", "x", "y"])
            .unwrap()
            .with_numeric("depth", vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap()
    }

    #[test]
    fn dropping_terms_keeps_the_rest() {
        let d = DesignMatrix::from_formula_str(&description(), "~ 1 + cond + depth").unwrap();
        let reduced = d.drop_terms(&["cond"]).unwrap();
        assert_eq!(reduced.coefficient_names(), &["Intercept", "depth"]);
        assert_eq!(reduced.term_indices("depth").unwrap(), vec![1]);
        assert_eq!(reduced.matrix()[(3, 1)], 4.0);
        assert!(d.drop_terms(&["nope"]).is_err());
        assert!(d.drop_terms(&["Intercept", "cond", "depth"]).is_err());
    }

    #[test]
    fn treatment_coding_with_intercept() {
        let d = DesignMatrix::from_formula_str(&description(), "~ 1 + cond + depth").unwrap();
        assert_eq!(
            d.coefficient_names(),
            &["Intercept", "cond[T.b]", "cond[T.c]", "depth"]
        );
        assert_eq!(d.term_indices("cond").unwrap(), vec![1, 2]);
        assert_eq!(d.matrix()[(2, 1)], 1.0);
        assert_eq!(d.matrix()[(4, 2)], 1.0);
        assert_eq!(d.matrix()[(0, 1)], 0.0);
        assert_eq!(d.matrix()[(5, 3)], 6.0);
    }

    #[test]
    fn full_coding_without_intercept() {
        let d = DesignMatrix::from_formula_str(&description(), "~ 0 + cond + batch").unwrap();
        assert_eq!(
            d.coefficient_names(),
            &["cond[a]", "cond[b]", "cond[c]", "batch[T.y]"]
        );
    }

    #[test]
    fn interaction_columns() {
        let d = DesignMatrix::from_formula_str(&description(), "~ 1 + cond + batch + cond:batch").unwrap();
        assert_eq!(
            &d.coefficient_names()[4..],
            &["cond[T.b]:batch[T.y]", "cond[T.c]:batch[T.y]"]
        );
        assert_eq!(d.term_indices("cond:batch").unwrap(), vec![4, 5]);
        assert_eq!(d.matrix()[(3, 4)], 1.0);
        assert_eq!(d.matrix()[(2, 4)], 0.0);
    }

    #[test]
    fn rejects_unknown_and_rank_deficient() {
        let err = DesignMatrix::from_formula_str(&description(), "~ 1 + nope").unwrap_err();
        assert!(matches!(err.downcast_ref::<DeError>(), Some(DeError::MissingColumn(_))));

        let confounded = description()
            .with_categorical("dup", &["a", "a", "b", "b", "c", "c"])
            .unwrap();
        assert!(DesignMatrix::from_formula_str(&confounded, "~ 1 + cond + dup").is_err());
    }

    #[test]
    fn group_design() {
        let grouping = Grouping::from_labels(&["b", "a", "b"]).unwrap();
        let d = DesignMatrix::for_groups(&grouping).unwrap();
        assert_eq!(d.coefficient_names(), &["group[a]", "group[b]"]);
        assert_eq!(d.matrix()[(0, 1)], 1.0);
        assert_eq!(d.matrix()[(1, 0)], 1.0);
        let s = d.subset_cells(&[1]);
        assert_eq!(s.n_cells(), 1);
        assert_eq!(s.matrix()[(0, 0)], 1.0);
    }
}
