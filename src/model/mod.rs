//! Model fitting for the likelihood-based tests.
//!
//! Wald and likelihood-ratio tests need per-gene maximum likelihood fits. Fitting goes
//! through the [`ModelEstimator`] trait; [`NbGlmEstimator`] is the default engine, a
//! negative binomial GLM with log link and per-gene dispersion.

pub mod design;
pub mod formula;
pub mod nb;

pub use design::{DesignMatrix, INTERCEPT};
pub use formula::{Formula, Term};
pub use nb::NbGlmEstimator;

use crate::data::ExpressionMatrix;
use crate::error::DeError;
use nalgebra::DMatrix;

/// Maximum likelihood fit of one gene.
#[derive(Debug, Clone)]
pub struct GlmFit {
    /// Location coefficients (log scale).
    pub coefficients: Vec<f64>,
    /// Inverse Fisher information of the location coefficients.
    pub covariance: DMatrix<f64>,
    pub log_likelihood: f64,
    /// Negative binomial theta; variance is `mu + mu^2 / theta`.
    pub dispersion: f64,
    pub iterations: usize,
    pub converged: bool,
    /// False for genes that were skipped, e.g. all-zero genes.
    pub fitted: bool,
}

impl GlmFit {
    /// Placeholder for a gene that was not fitted.
    pub fn unfitted(n_coef: usize) -> Self {
        GlmFit {
            coefficients: vec![f64::NAN; n_coef],
            covariance: DMatrix::from_element(n_coef, n_coef, f64::NAN),
            log_likelihood: 0.0,
            dispersion: f64::NAN,
            iterations: 0,
            converged: false,
            fitted: false,
        }
    }

    pub fn std_errors(&self) -> Vec<f64> {
        (0..self.coefficients.len())
            .map(|j| {
                let v = self.covariance[(j, j)];
                if v >= 0.0 { v.sqrt() } else { f64::NAN }
            })
            .collect()
    }

    pub fn std_error(&self, index: usize) -> f64 {
        let v = self.covariance[(index, index)];
        if v >= 0.0 { v.sqrt() } else { f64::NAN }
    }

    /// Covariance restricted to the given coefficients.
    pub fn sub_covariance(&self, indices: &[usize]) -> DMatrix<f64> {
        DMatrix::from_fn(indices.len(), indices.len(), |i, j| {
            self.covariance[(indices[i], indices[j])]
        })
    }
}

/// Fits of all genes against one design.
#[derive(Debug, Clone)]
pub struct GlmFits {
    pub fits: Vec<GlmFit>,
    pub coefficient_names: Vec<String>,
    pub n_cells: usize,
}

impl GlmFits {
    pub fn n_genes(&self) -> usize {
        self.fits.len()
    }

    pub fn n_coefficients(&self) -> usize {
        self.coefficient_names.len()
    }

    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coefficient_names.iter().position(|n| n == name)
    }

    pub fn coef_mle(&self, index: usize) -> Vec<f64> {
        self.fits.iter().map(|f| f.coefficients[index]).collect()
    }

    pub fn coef_sd(&self, index: usize) -> Vec<f64> {
        self.fits.iter().map(|f| f.std_error(index)).collect()
    }

    pub fn log_likelihoods(&self) -> Vec<f64> {
        self.fits.iter().map(|f| f.log_likelihood).collect()
    }

    pub fn n_converged(&self) -> usize {
        self.fits.iter().filter(|f| f.converged).count()
    }

    pub fn n_fitted(&self) -> usize {
        self.fits.iter().filter(|f| f.fitted).count()
    }
}

/// A model-fitting engine for per-gene location models.
pub trait ModelEstimator: Sync {
    fn name(&self) -> &'static str;

    fn fit(
        &self,
        data: &ExpressionMatrix,
        design: &DesignMatrix,
        size_factors: Option<&[f64]>,
    ) -> anyhow::Result<GlmFits>;
}

/// Check user supplied size factors and turn them into log offsets.
pub fn size_factor_offsets(size_factors: Option<&[f64]>, n_cells: usize) -> anyhow::Result<Vec<f64>> {
    match size_factors {
        None => Ok(vec![0.0; n_cells]),
        Some(sf) => {
            if sf.len() != n_cells {
                return Err(DeError::dimension("size factors", n_cells, sf.len()).into());
            }
            sf.iter()
                .enumerate()
                .map(|(i, &s)| {
                    if s > 0.0 && s.is_finite() {
                        Ok(s.ln())
                    } else {
                        Err(DeError::InvalidParameter(format!(
                            "size factor of cell {} must be positive and finite, got {}",
                            i, s
                        ))
                        .into())
                    }
                })
                .collect()
        }
    }
}

/// Library size factors: total expression per cell scaled to mean one.
pub fn library_size_factors(data: &ExpressionMatrix) -> anyhow::Result<Vec<f64>> {
    let totals = data.cell_totals();
    if let Some(i) = totals.iter().position(|&t| t <= 0.0) {
        return Err(DeError::InvalidParameter(format!(
            "cell {} has zero total expression; cannot derive a size factor",
            i
        ))
        .into());
    }
    let mean = totals.iter().sum::<f64>() / totals.len() as f64;
    Ok(totals.iter().map(|t| t / mean).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn size_factors_are_validated() {
        assert_eq!(size_factor_offsets(None, 3).unwrap(), vec![0.0; 3]);
        assert!(size_factor_offsets(Some(&[1.0, 2.0]), 3).is_err());
        assert!(size_factor_offsets(Some(&[1.0, 0.0, 2.0]), 3).is_err());
        let offsets = size_factor_offsets(Some(&[1.0, std::f64::consts::E]), 2).unwrap();
        assert_relative_eq!(offsets[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn library_size_factors_have_unit_mean() {
        let data = ExpressionMatrix::from_rows(&[vec![1.0, 1.0], vec![3.0, 3.0]]).unwrap();
        let sf = library_size_factors(&data).unwrap();
        assert_relative_eq!(sf[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(sf[1], 1.5, epsilon = 1e-12);

        let empty_cell = ExpressionMatrix::from_rows(&[vec![0.0], vec![3.0]]).unwrap();
        assert!(library_size_factors(&empty_cell).is_err());
    }

    #[test]
    fn fit_accessors() {
        let mut fit = GlmFit::unfitted(2);
        fit.covariance = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 9.0]);
        assert_eq!(fit.std_errors(), vec![2.0, 3.0]);
        let sub = fit.sub_covariance(&[1]);
        assert_eq!(sub[(0, 0)], 9.0);
    }
}
