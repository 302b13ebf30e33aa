//! Negative binomial GLM with log link.
//!
//! Per gene the location coefficients are fitted by iteratively reweighted least
//! squares with step halving, alternating with Newton updates of the dispersion on
//! the log scale. Genes are independent and fitted in parallel.

use crate::config::FitConfig;
use crate::data::ExpressionMatrix;
use crate::error::DeError;
use crate::model::{DesignMatrix, GlmFit, GlmFits, ModelEstimator, size_factor_offsets};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use statrs::function::gamma::{digamma, ln_gamma};

const MIN_MU: f64 = 1e-10;
const MAX_ETA: f64 = 30.0;
const MAX_STEP_HALVINGS: usize = 20;
const MAX_THETA_STEPS: usize = 25;

#[derive(Debug, Clone, Default)]
pub struct NbGlmEstimator {
    config: FitConfig,
}

impl NbGlmEstimator {
    pub fn new(config: FitConfig) -> Self {
        NbGlmEstimator { config }
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Fit a single gene given its dense counts, the design and log offsets.
    pub fn fit_gene(&self, y: &[f64], x: &DMatrix<f64>, offset: &[f64]) -> GlmFit {
        let n_coef = x.ncols();
        if y.iter().all(|&v| v == 0.0) {
            return GlmFit::unfitted(n_coef);
        }

        let cfg = &self.config;
        let y_vec = DVector::from_column_slice(y);
        let offset = DVector::from_column_slice(offset);

        // Start from least squares on log counts
        let z0 = DVector::from_iterator(
            y.len(),
            y.iter().zip(offset.iter()).map(|(&v, &o)| (v + 0.5).ln() - o),
        );
        let mut beta = match solve_normal_equations(x, None, &z0) {
            Some(b) => b,
            None => return GlmFit::unfitted(n_coef),
        };

        let mut mu = compute_mu(x, &beta, &offset);
        let mut theta = cfg
            .init_dispersion
            .clamp(cfg.min_dispersion, cfg.max_dispersion);
        theta = update_dispersion(&y_vec, &mu, theta, cfg);
        let mut ll = nb_log_likelihood(&y_vec, &mu, theta);

        let mut converged = false;
        let mut iterations = 0;
        for iter in 0..cfg.max_iterations {
            iterations = iter + 1;

            let w = irls_weights(&mu, theta);
            let z = DVector::from_iterator(
                y.len(),
                (0..y.len()).map(|i| {
                    let m = mu[i];
                    m.ln() - offset[i] + (y_vec[i] - m) / m
                }),
            );
            let proposal = match solve_normal_equations(x, Some(&w), &z) {
                Some(b) => b,
                None => break,
            };

            // Step halving keeps the likelihood from decreasing
            let mut step = &proposal - &beta;
            let mut accepted = None;
            for _ in 0..MAX_STEP_HALVINGS {
                let candidate = &beta + &step;
                let mu_c = compute_mu(x, &candidate, &offset);
                let ll_c = nb_log_likelihood(&y_vec, &mu_c, theta);
                if ll_c.is_finite() && ll_c >= ll - 1e-12 * ll.abs() {
                    accepted = Some((candidate, mu_c));
                    break;
                }
                step *= 0.5;
            }
            if let Some((b, m)) = accepted {
                beta = b;
                mu = m;
            }

            theta = update_dispersion(&y_vec, &mu, theta, cfg);
            let ll_new = nb_log_likelihood(&y_vec, &mu, theta);

            let rel_change = (ll_new - ll).abs() / (ll.abs() + 0.1);
            ll = ll_new;
            if rel_change < cfg.tolerance {
                converged = true;
                break;
            }
        }

        let w = irls_weights(&mu, theta);
        let covariance = fisher_information(x, &w)
            .try_inverse()
            .unwrap_or_else(|| DMatrix::from_element(n_coef, n_coef, f64::NAN));

        GlmFit {
            coefficients: beta.iter().copied().collect(),
            covariance,
            log_likelihood: ll,
            dispersion: theta,
            iterations,
            converged,
            fitted: true,
        }
    }
}

impl ModelEstimator for NbGlmEstimator {
    fn name(&self) -> &'static str {
        "nb_glm"
    }

    fn fit(
        &self,
        data: &ExpressionMatrix,
        design: &DesignMatrix,
        size_factors: Option<&[f64]>,
    ) -> anyhow::Result<GlmFits> {
        self.config.validate()?;
        if data.has_negative_values() {
            return Err(DeError::InvalidParameter(
                "negative binomial model needs non-negative counts".into(),
            )
            .into());
        }
        if design.n_cells() != data.n_cells() {
            return Err(DeError::dimension("design rows", data.n_cells(), design.n_cells()).into());
        }
        if data.n_cells() <= design.n_coefficients() {
            return Err(DeError::Numerical(format!(
                "model is saturated: {} cells for {} coefficients",
                data.n_cells(),
                design.n_coefficients()
            ))
            .into());
        }
        let offset = size_factor_offsets(size_factors, data.n_cells())?;
        let x = design.matrix();

        let fits: Vec<GlmFit> = (0..data.n_genes())
            .into_par_iter()
            .map(|g| self.fit_gene(&data.gene_values(g), x, &offset))
            .collect();

        let fits = GlmFits {
            fits,
            coefficient_names: design.coefficient_names().to_vec(),
            n_cells: data.n_cells(),
        };

        let n_fitted = fits.n_fitted();
        let n_converged = fits.n_converged();
        let mean_iterations = if n_fitted > 0 {
            fits.fits.iter().filter(|f| f.fitted).map(|f| f.iterations).sum::<usize>() as f64
                / n_fitted as f64
        } else {
            0.0
        };
        debug!(
            "nb_glm: fitted {} of {} genes with {} coefficients, {} converged, {:.1} iterations on average",
            n_fitted,
            fits.n_genes(),
            design.n_coefficients(),
            n_converged,
            mean_iterations
        );
        if n_converged < n_fitted {
            warn!(
                "nb_glm: {} of {} fitted genes did not converge within {} iterations",
                n_fitted - n_converged,
                n_fitted,
                self.config.max_iterations
            );
        }

        Ok(fits)
    }
}

fn compute_mu(x: &DMatrix<f64>, beta: &DVector<f64>, offset: &DVector<f64>) -> DVector<f64> {
    let eta = x * beta + offset;
    eta.map(|e| e.clamp(-MAX_ETA, MAX_ETA).exp().max(MIN_MU))
}

fn irls_weights(mu: &DVector<f64>, theta: f64) -> DVector<f64> {
    mu.map(|m| m / (1.0 + m / theta))
}

fn fisher_information(x: &DMatrix<f64>, w: &DVector<f64>) -> DMatrix<f64> {
    let mut xw = x.clone();
    for (i, mut row) in xw.row_iter_mut().enumerate() {
        row *= w[i];
    }
    x.transpose() * xw
}

/// Solve `(X' W X) b = X' W z`; `None` when the system is singular.
fn solve_normal_equations(
    x: &DMatrix<f64>,
    w: Option<&DVector<f64>>,
    z: &DVector<f64>,
) -> Option<DVector<f64>> {
    let (xtwx, xtwz) = match w {
        Some(w) => {
            let wz = z.component_mul(w);
            (fisher_information(x, w), x.transpose() * wz)
        }
        None => (x.transpose() * x, x.transpose() * z),
    };
    let solution = xtwx.cholesky()?.solve(&xtwz);
    if solution.iter().all(|b| b.is_finite()) {
        Some(solution)
    } else {
        None
    }
}

/// Negative binomial log-likelihood summed over cells.
pub fn nb_log_likelihood(y: &DVector<f64>, mu: &DVector<f64>, theta: f64) -> f64 {
    y.iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| {
            let m = mi.max(MIN_MU);
            ln_gamma(yi + theta) - ln_gamma(theta) - ln_gamma(yi + 1.0)
                + theta * (theta / (theta + m)).ln()
                + yi * (m / (theta + m)).ln()
        })
        .sum()
}

/// Derivative of the log-likelihood with respect to theta.
fn dispersion_score(y: &DVector<f64>, mu: &DVector<f64>, theta: f64) -> f64 {
    y.iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| {
            digamma(yi + theta) - digamma(theta) + theta.ln() + 1.0
                - (theta + mi).ln()
                - (theta + yi) / (theta + mi)
        })
        .sum()
}

/// Newton ascent on `kappa = ln(theta)` with the mean held fixed.
fn update_dispersion(y: &DVector<f64>, mu: &DVector<f64>, theta: f64, cfg: &FitConfig) -> f64 {
    let (lo, hi) = (cfg.min_dispersion.ln(), cfg.max_dispersion.ln());
    let mut kappa = theta.ln().clamp(lo, hi);
    let mut ll = nb_log_likelihood(y, mu, kappa.exp());
    let kappa_score = |k: f64| {
        let t = k.exp();
        t * dispersion_score(y, mu, t)
    };

    for _ in 0..MAX_THETA_STEPS {
        let grad = kappa_score(kappa);
        if !grad.is_finite() {
            break;
        }
        let h = 1e-4;
        let curvature = (kappa_score(kappa + h) - kappa_score(kappa - h)) / (2.0 * h);
        let mut step = if curvature < 0.0 && curvature.is_finite() {
            -grad / curvature
        } else {
            grad.signum()
        };
        step = step.clamp(-2.0, 2.0);

        let mut moved = false;
        for _ in 0..MAX_STEP_HALVINGS {
            let candidate = (kappa + step).clamp(lo, hi);
            let ll_c = nb_log_likelihood(y, mu, candidate.exp());
            if ll_c.is_finite() && ll_c >= ll {
                moved = (candidate - kappa).abs() > 1e-10;
                kappa = candidate;
                ll = ll_c;
                break;
            }
            step *= 0.5;
        }
        if !moved {
            break;
        }
    }

    kappa.exp()
}
