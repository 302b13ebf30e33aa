//! Run configuration for differential expression tests.
//!
//! A [`TestConfig`] can be built in code or loaded from a TOML document:
//!
//! ```toml
//! correction = "benjamini_hochberg"
//! fold_change_epsilon = 1e-8
//! n_threads = 4
//!
//! [fit]
//! max_iterations = 100
//! tolerance = 1e-6
//! ```

use crate::error::DeError;
use crate::testing::correction::CorrectionMethod;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings of the negative binomial model fitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Upper bound on IRLS rounds per gene.
    pub max_iterations: usize,
    /// Relative log-likelihood change below which a fit counts as converged.
    pub tolerance: f64,
    /// Lower bound of the dispersion parameter theta.
    pub min_dispersion: f64,
    /// Upper bound of the dispersion parameter theta.
    pub max_dispersion: f64,
    /// Starting value of theta before the first dispersion update.
    pub init_dispersion: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        FitConfig {
            max_iterations: 100,
            tolerance: 1e-6,
            min_dispersion: 1e-8,
            max_dispersion: 1e8,
            init_dispersion: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Multiple testing correction applied to produce q-values.
    pub correction: CorrectionMethod,
    /// Floor applied to group means before taking logarithms of fold changes.
    pub fold_change_epsilon: f64,
    /// Size of a dedicated worker pool; the global rayon pool is used when unset.
    pub n_threads: Option<usize>,
    pub fit: FitConfig,
}

impl Default for TestConfig {
    fn default() -> Self {
        TestConfig {
            correction: CorrectionMethod::BenjaminiHochberg,
            fold_change_epsilon: 1e-8,
            n_threads: None,
            fit: FitConfig::default(),
        }
    }
}

impl TestConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: TestConfig =
            toml::from_str(content).map_err(|e| DeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(DeError::from)?;
        Self::from_toml_str(&content)
    }

    pub fn with_correction(mut self, correction: CorrectionMethod) -> Self {
        self.correction = correction;
        self
    }

    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = Some(n_threads);
        self
    }

    /// Check every setting, including the fitter's.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.fit.validate()?;
        if !(self.fold_change_epsilon > 0.0) {
            return Err(DeError::Config("fold_change_epsilon must be positive".into()).into());
        }
        if self.n_threads == Some(0) {
            return Err(DeError::Config("n_threads must be at least 1".into()).into());
        }
        if let CorrectionMethod::Storey { lambda } = self.correction {
            if !(0.0..1.0).contains(&lambda) {
                return Err(DeError::Config(format!(
                    "Storey lambda must be in [0, 1), got {}",
                    lambda
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Run `op` on the configured worker pool after validating the configuration.
    pub fn install<R, F>(&self, op: F) -> anyhow::Result<R>
    where
        F: FnOnce() -> anyhow::Result<R> + Send,
        R: Send,
    {
        self.validate()?;
        match self.n_threads {
            Some(n) => {
                let pool = rayon::ThreadPoolBuilder::new().num_threads(n).build()?;
                pool.install(op)
            }
            None => op(),
        }
    }
}

impl FitConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_iterations == 0 {
            return Err(DeError::Config("fit.max_iterations must be positive".into()).into());
        }
        if !(self.tolerance > 0.0) {
            return Err(DeError::Config(format!(
                "fit.tolerance must be positive, got {}",
                self.tolerance
            ))
            .into());
        }
        if !(self.min_dispersion > 0.0) || self.min_dispersion >= self.max_dispersion {
            return Err(DeError::Config(format!(
                "invalid dispersion bounds [{}, {}]",
                self.min_dispersion, self.max_dispersion
            ))
            .into());
        }
        if !(self.init_dispersion > 0.0) {
            return Err(DeError::Config("fit.init_dispersion must be positive".into()).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.correction, CorrectionMethod::BenjaminiHochberg);
        assert_eq!(config.fit.max_iterations, 100);
    }

    #[test]
    fn parses_partial_toml() {
        let config = TestConfig::from_toml_str(
            r#"
            correction = "bonferroni"
            n_threads = 2

            [fit]
            tolerance = 1e-4
            "#,
        )
        .unwrap();
        assert_eq!(config.correction, CorrectionMethod::Bonferroni);
        assert_eq!(config.n_threads, Some(2));
        assert_eq!(config.fit.tolerance, 1e-4);
        assert_eq!(config.fit.max_iterations, 100);
    }

    #[test]
    fn accepts_fdr_bh_alias() {
        let config = TestConfig::from_toml_str("correction = \"fdr_bh\"").unwrap();
        assert_eq!(config.correction, CorrectionMethod::BenjaminiHochberg);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = TestConfig::from_toml_str("[fit]\ntolerance = -1.0").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeError>(),
            Some(DeError::Config(_))
        ));
        assert!(TestConfig::from_toml_str("n_threads = 0").is_err());
        assert!(TestConfig::from_toml_str("correction = \"nope\"").is_err());
    }

    #[test]
    fn install_rejects_configs_built_in_code() {
        let mut config = TestConfig::default();
        config.fold_change_epsilon = 0.0;
        let err = config.install(|| Ok(())).unwrap_err();
        assert!(matches!(err.downcast_ref::<DeError>(), Some(DeError::Config(_))));

        let mut config = TestConfig::default();
        config.fit.max_iterations = 0;
        assert!(config.install(|| Ok(())).is_err());
        assert!(config.fit.validate().is_err());

        let config = TestConfig::default().with_correction(CorrectionMethod::Storey { lambda: 1.5 });
        assert!(config.install(|| Ok(())).is_err());
    }

    #[test]
    fn install_runs_on_dedicated_pool() {
        let config = TestConfig::default().with_threads(2);
        let n = config
            .install(|| Ok(rayon::current_num_threads()))
            .unwrap();
        assert_eq!(n, 2);
    }
}
