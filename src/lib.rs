//! ssdann: disk-resident approximate nearest neighbor search.
//!
//! Indexes vector datasets that do not fit in RAM. A Vamana proximity graph
//! and the vectors live on SSD in block-aligned records; only compact PQ
//! codes and a small node cache stay in memory. Queries walk the graph with
//! a beam search that issues one batch of aligned reads per round.
//!
//! - `quantization/`: product quantization (in-memory and on-disk codes)
//! - `vamana/`: graph construction, including the budget-aware partitioned build
//! - `diskann/`: disk layout, node cache, beam search, range search
//! - `filtering/`: id exclusion bitsets and filtered-search strategy
//!
//! ```no_run
//! use ssdann::{Dataset, DiskAnnConfig, DiskAnnIndex};
//!
//! # fn main() -> ssdann::Result<()> {
//! let data: Vec<f32> = (0..1000 * 16).map(|i| (i % 97) as f32).collect();
//! let dataset = Dataset::new(data, 16)?;
//! let config = DiskAnnConfig::from_json(
//!     r#"{ "max_degree": 32, "pq_code_budget_gb": 0.0001, "build_dram_budget_gb": 1.0 }"#,
//! )?;
//!
//! let mut index = DiskAnnIndex::new("/tmp/ssdann-index");
//! index.build(&dataset, &config)?;
//! let hits = index.search(dataset.row(0), 10, &config, None)?;
//! assert_eq!(hits.len(), 10);
//! # Ok(())
//! # }
//! ```
//!
//! # Critical Nuances
//!
//! ## Every metric is searched as L2
//!
//! The graph is built in squared-L2 space. Cosine vectors are normalized
//! first; inner-product vectors gain one coordinate `sqrt(M^2 - |x|^2)` so
//! that L2 order matches inner-product order. Reported distances are mapped
//! back: squared L2, negated inner product, or `1 - cos`.
//!
//! ## Reads dominate latency
//!
//! A query costs roughly `rounds x (one SSD round trip)`. `beamwidth` trades
//! total reads for fewer round trips; the node cache removes the reads near
//! the entry point that every query repeats.

pub mod config;
pub mod diskann;
pub mod distance;
pub mod error;
pub mod filtering;
pub mod partitioning;
pub mod persistence;
pub mod quantization;
pub mod simd;
pub mod vamana;

// Re-exports
pub use config::DiskAnnConfig;
pub use diskann::{BuildReport, Dataset, DiskAnnIndex, RangeSearchResult};
pub use distance::DistanceMetric;
pub use error::{Result, RetrieveError};
pub use filtering::Bitset;
pub use vamana::Neighbor;
