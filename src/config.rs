//! Validated parameter set handed to build and search.
//!
//! Every field carries the default and range of the engine's public
//! configuration surface. Values usually arrive as JSON:
//!
//! ```rust
//! use ssdann::config::DiskAnnConfig;
//!
//! let cfg: DiskAnnConfig = serde_json::from_str(
//!     r#"{ "max_degree": 32, "pq_code_budget_gb": 0.01, "build_dram_budget_gb": 1.0 }"#,
//! ).unwrap();
//! assert_eq!(cfg.beamwidth, 8);
//! assert_eq!(cfg.check_and_adjust_for_search(5).unwrap(), 16);
//! ```

use crate::distance::DistanceMetric;
use crate::error::{Result, RetrieveError};
use serde::{Deserialize, Serialize};

/// Smallest search list used when the caller leaves `search_list_size` unset.
pub const SEARCH_LIST_SIZE_MIN: usize = 16;
/// Build-time search list size when unset.
pub const DEFAULT_SEARCH_LIST_SIZE_FOR_BUILD: usize = 128;

pub(crate) const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// DiskANN configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskAnnConfig {
    /// Metric used for build and search.
    pub metric_type: DistanceMetric,
    /// Graph degree bound (R). Typically 60-150; larger means bigger index, better recall.
    pub max_degree: usize,
    /// Search list size (L) for build or search. Unset means "use the default for this path".
    pub search_list_size: Option<usize>,
    /// Budget for in-memory PQ codes, in GB. Required for build.
    pub pq_code_budget_gb: Option<f32>,
    /// Memory allowed for graph construction, in GB. Required for build.
    pub build_dram_budget_gb: Option<f32>,
    /// Width of PQ codes stored on SSD instead of full vectors; 0 stores full precision.
    pub disk_pq_dims: usize,
    /// Run a single Vamana pass instead of two.
    pub accelerate_build: bool,
    /// Memory for cached graph nodes, in GB.
    pub search_cache_budget_gb: f32,
    /// Issue a throwaway query batch after cache population.
    pub warm_up: bool,
    /// Cache by BFS from the entry point instead of sample-query visit counts.
    pub use_bfs_cache: bool,
    /// Maximum reads issued per beam-search round.
    pub beamwidth: usize,
    /// Starting k for range search.
    pub min_k: usize,
    /// Largest k range search may double up to.
    pub max_k: usize,
    /// Range search list size as a multiple of k.
    pub search_list_and_k_ratio: f32,
    /// Excluded fraction at which filtered search switches to PQ + refine.
    /// Negative selects a threshold computed from k.
    pub filter_threshold: f32,
}

impl Default for DiskAnnConfig {
    fn default() -> Self {
        Self {
            metric_type: DistanceMetric::L2,
            max_degree: 48,
            search_list_size: None,
            pq_code_budget_gb: None,
            build_dram_budget_gb: None,
            disk_pq_dims: 0,
            accelerate_build: false,
            search_cache_budget_gb: 0.0,
            warm_up: false,
            use_bfs_cache: false,
            beamwidth: 8,
            min_k: 100,
            max_k: 10_000,
            search_list_and_k_ratio: 2.0,
            filter_threshold: -1.0,
        }
    }
}

/// Build parameters after validation and defaulting.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildParams {
    pub metric: DistanceMetric,
    pub max_degree: usize,
    pub search_list_size: usize,
    pub pq_code_budget_bytes: u64,
    pub build_dram_budget_bytes: u64,
    pub disk_pq_dims: usize,
    pub accelerate_build: bool,
}

impl DiskAnnConfig {
    /// Parse a JSON document, then validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| RetrieveError::config("config", e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Range-check every field.
    pub fn validate(&self) -> Result<()> {
        check_range("max_degree", self.max_degree, 1, 2048)?;
        if let Some(l) = self.search_list_size {
            check_range("search_list_size", l, 1, usize::MAX)?;
        }
        check_non_negative("pq_code_budget_gb", self.pq_code_budget_gb)?;
        check_non_negative("build_dram_budget_gb", self.build_dram_budget_gb)?;
        check_non_negative("search_cache_budget_gb", Some(self.search_cache_budget_gb))?;
        check_range("beamwidth", self.beamwidth, 1, 128)?;
        check_range("min_k", self.min_k, 1, usize::MAX)?;
        check_range("max_k", self.max_k, 1, usize::MAX)?;
        if self.min_k > self.max_k {
            return Err(RetrieveError::config(
                "min_k",
                format!("min_k({}) should not exceed max_k({})", self.min_k, self.max_k),
            ));
        }
        let ratio = self.search_list_and_k_ratio;
        if !(1.0..=5.0).contains(&ratio) {
            return Err(RetrieveError::config(
                "search_list_and_k_ratio",
                format!("must be in [1.0, 5.0], got {ratio}"),
            ));
        }
        let ft = self.filter_threshold;
        if !(-1.0..=1.0).contains(&ft) {
            return Err(RetrieveError::config(
                "filter_threshold",
                format!("must be in [-1.0, 1.0], got {ft}"),
            ));
        }
        Ok(())
    }

    /// Validate for a top-k search and resolve the search list size.
    ///
    /// Unset `search_list_size` becomes `max(k, 16)`; a set value below `k` is rejected.
    pub fn check_and_adjust_for_search(&self, k: usize) -> Result<usize> {
        self.validate()?;
        if k == 0 {
            return Err(RetrieveError::config("k", "must be at least 1"));
        }
        match self.search_list_size {
            None => Ok(k.max(SEARCH_LIST_SIZE_MIN)),
            Some(l) if k > l => Err(RetrieveError::config(
                "search_list_size",
                format!("search_list_size({l}) should be larger than k({k})"),
            )),
            Some(l) => Ok(l),
        }
    }

    /// Validate for build and resolve every build parameter.
    pub fn check_and_adjust_for_build(&self) -> Result<BuildParams> {
        self.validate()?;
        let pq = self
            .pq_code_budget_gb
            .ok_or_else(|| RetrieveError::config("pq_code_budget_gb", "required for build"))?;
        let dram = self
            .build_dram_budget_gb
            .ok_or_else(|| RetrieveError::config("build_dram_budget_gb", "required for build"))?;
        Ok(BuildParams {
            metric: self.metric_type,
            max_degree: self.max_degree,
            search_list_size: self
                .search_list_size
                .unwrap_or(DEFAULT_SEARCH_LIST_SIZE_FOR_BUILD),
            pq_code_budget_bytes: gb_to_bytes(pq),
            build_dram_budget_bytes: gb_to_bytes(dram),
            disk_pq_dims: self.disk_pq_dims,
            accelerate_build: self.accelerate_build,
        })
    }

    pub fn search_cache_budget_bytes(&self) -> u64 {
        gb_to_bytes(self.search_cache_budget_gb)
    }
}

pub(crate) fn gb_to_bytes(gb: f32) -> u64 {
    (gb as f64 * BYTES_PER_GB) as u64
}

fn check_range(field: &'static str, v: usize, lo: usize, hi: usize) -> Result<()> {
    if v < lo || v > hi {
        let reason = if hi == usize::MAX {
            format!("must be at least {lo}, got {v}")
        } else {
            format!("must be in [{lo}, {hi}], got {v}")
        };
        return Err(RetrieveError::config(field, reason));
    }
    Ok(())
}

fn check_non_negative(field: &'static str, v: Option<f32>) -> Result<()> {
    match v {
        Some(x) if !(x >= 0.0 && x.is_finite()) => Err(RetrieveError::config(
            field,
            format!("must be a finite value >= 0, got {x}"),
        )),
        _ => Ok(()),
    }
}
