//! # single-diffexp
//!
//! Differential expression testing for single-cell expression matrices.
//!
//! Given a cells × genes matrix and per-cell annotations, the crate computes per-gene
//! p-values, q-values and log fold changes for a chosen hypothesis test, and builds
//! result tables from them.
//!
//! ## Core Features
//!
//! - **Single tests**: Wald and likelihood ratio tests on negative binomial GLM fits,
//!   Welch's t-test and the rank-sum test on raw values
//! - **Multi-tests**: all pairwise group comparisons (including a fast z-test from a
//!   single cell-means model) and each group against the rest
//! - **Partitioned testing**: repeat a test inside every level of an annotation
//! - **Multiple Testing Correction**: Benjamini-Hochberg, Bonferroni, Holm and others
//! - **Enrichment**: hypergeometric over-representation of significant genes in
//!   reference gene sets
//!
//! ## Quick Start
//!
//! ```rust
//! use single_diffexp::config::TestConfig;
//! use single_diffexp::data::{ExpressionMatrix, Grouping};
//! use single_diffexp::de;
//!
//! let data = ExpressionMatrix::from_rows(&[
//!     vec![1.0, 5.0],
//!     vec![2.0, 4.0],
//!     vec![1.0, 6.0],
//!     vec![9.0, 5.0],
//!     vec![8.0, 4.0],
//!     vec![10.0, 6.0],
//! ])
//! .unwrap();
//! let grouping = Grouping::from_labels(&["ctrl", "ctrl", "ctrl", "treat", "treat", "treat"]).unwrap();
//! let result = de::t_test(&data, &grouping, &TestConfig::default()).unwrap();
//! assert!(result.pval()[0] < result.pval()[1]);
//! ```
//!
//! ## Module Organization
//!
//! - **[`data`]**: expression matrices, sample descriptions and groupings
//! - **[`model`]**: formulas, design matrices and the model-fitting engine
//! - **[`testing`]**: statistical tests, multiple testing correction and effect sizes
//! - **[`de`]**: differential expression tests and their results
//! - **[`enrichment`]**: gene set over-representation analysis
//! - **[`config`]**: run configuration

pub mod config;
pub mod data;
pub mod de;
pub mod enrichment;
pub mod error;
pub mod model;
pub mod testing;

pub use testing::correction;
pub use testing::inference as stats;

pub use config::{FitConfig, TestConfig};
pub use data::{ExpressionMatrix, Grouping, SampleDescription};
pub use de::DifferentialExpressionTest;
pub use error::DeError;
