//! Gene set enrichment of differential expression results.
//!
//! Reference gene sets are collected in [`RefSets`]. [`enrich`] then asks, for every
//! set, whether the significant genes of a test fall into it more often than chance
//! by a hypergeometric over-representation test (ORA).
//!
//! ## Quick Example
//!
//! ```rust
//! use single_diffexp::enrichment::{RefSets, enrich_lists};
//! use single_diffexp::testing::correction::CorrectionMethod;
//!
//! let mut sets = RefSets::new();
//! sets.add("cycle", "", &["g1", "g2", "g3"]);
//! let background: Vec<String> = (0..20).map(|i| format!("g{}", i)).collect();
//! let hits = vec!["g1".to_string(), "g2".to_string()];
//! let result = enrich_lists(&sets, &background, &hits, CorrectionMethod::BenjaminiHochberg).unwrap();
//! assert_eq!(result.summary()[0].overlap, 2);
//! ```

mod ora;
mod refsets;

pub use ora::{EnrichmentResult, SetSummary, enrich, enrich_lists};
pub use refsets::{RefSet, RefSets};
