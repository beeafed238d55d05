//! Build / load / search entrypoints for a disk index directory.

use super::cache::{warm_up, CacheSelector, CacheStrategy};
use super::layout::{DiskLayoutReader, DiskLayoutWriter, LayoutHeader};
use super::range::{RangeSearchController, RangeSearchParams, RangeSearchResult};
use super::search::{DiskSearcher, QueryStats, SearchParams};
use crate::config::DiskAnnConfig;
use crate::distance::{BuildSpace, DistanceMetric};
use crate::error::{Result, RetrieveError};
use crate::filtering::Bitset;
use crate::persistence::{self, PersistenceError};
use crate::quantization::{code_len_for_budget, PqCodebook};
use crate::vamana::{GraphBuilder, Neighbor, VamanaConfig, VectorSlice, DEFAULT_ALPHA};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DISK_INDEX_FILE: &str = "disk.index";
pub const PQ_PIVOTS_FILE: &str = "pq_pivots.bin";
pub const PQ_COMPRESSED_FILE: &str = "pq_compressed.bin";
pub const DISK_PQ_PIVOTS_FILE: &str = "disk_pq_pivots.bin";
pub const METADATA_FILE: &str = "metadata.json";

const METADATA_VERSION: u32 = 1;
const INDEX_SEED: u64 = 0x5eed_d15c;

/// Row-major `f32` vectors handed to the builder.
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    data: Vec<f32>,
    dim: usize,
}

impl Dataset {
    pub fn new(data: Vec<f32>, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(RetrieveError::InvalidParameter(
                "dataset dimension must be greater than 0".to_string(),
            ));
        }
        if data.len() % dim != 0 {
            return Err(RetrieveError::InvalidParameter(format!(
                "{} floats is not a whole number of {dim}-dimensional rows",
                data.len()
            )));
        }
        if let Some(pos) = data.iter().position(|x| !x.is_finite()) {
            return Err(RetrieveError::InvalidParameter(format!(
                "non-finite value in row {}",
                pos / dim
            )));
        }
        Ok(Self { data, dim })
    }

    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let dim = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().find(|r| r.len() != dim) {
            return Err(RetrieveError::DimensionMismatch {
                query_dim: bad.len(),
                doc_dim: dim,
            });
        }
        Self::new(rows.concat(), dim)
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// What a build produced.
#[derive(Clone, Debug)]
pub struct BuildReport {
    pub num_nodes: usize,
    pub dim: usize,
    pub num_shards: usize,
    pub passes: usize,
    pub medoid: u32,
    pub average_degree: f32,
    pub max_degree: usize,
    pub pq_code_len: usize,
    /// The PQ budget asked for more (or less) than the code length allows.
    pub pq_code_clamped: bool,
    pub disk_pq_dims: usize,
    pub disk_index_bytes: u64,
    pub elapsed: Duration,
}

/// Human-readable summary written next to the binary files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub version: u32,
    pub num_nodes: usize,
    pub dim: usize,
    pub stored_dim: usize,
    pub metric: DistanceMetric,
    pub max_norm: f32,
    pub entry_point: u32,
    pub max_degree: usize,
    pub search_list_size: usize,
    pub accelerate_build: bool,
    pub num_shards: usize,
    pub pq_code_len: usize,
    pub disk_pq_dims: usize,
}

/// A disk-resident index rooted at one directory.
pub struct DiskAnnIndex {
    dir: PathBuf,
    searcher: Option<DiskSearcher>,
    metadata: Option<IndexMetadata>,
    cache_strategy: Option<CacheStrategy>,
}

impl DiskAnnIndex {
    /// An index handle over `dir`. Nothing is read until `build` or `load`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            searcher: None,
            metadata: None,
            cache_strategy: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Build from `dataset`, write the index directory, then load it.
    pub fn build(&mut self, dataset: &Dataset, config: &DiskAnnConfig) -> Result<BuildReport> {
        let params = config.check_and_adjust_for_build()?;
        if dataset.is_empty() {
            return Err(RetrieveError::EmptyIndex);
        }
        let start = Instant::now();
        let n = dataset.len();
        log::info!(
            "building disk index at {}: {n} vectors, dim {}, metric {}",
            self.dir.display(),
            dataset.dim(),
            params.metric
        );

        let space = BuildSpace::fit(params.metric, dataset.as_slice(), dataset.dim());
        let stored = space.transform_base(dataset.as_slice());
        let stored_dim = space.stored_dim();
        let vectors = VectorSlice::new(&stored, stored_dim);

        // Codes are bounded by the user dimension; IP's extra coordinate gets no byte.
        let (pq_code_len, pq_code_clamped) =
            code_len_for_budget(params.pq_code_budget_bytes, n, dataset.dim());
        if pq_code_clamped {
            log::warn!(
                "PQ budget of {} bytes gives {} bytes/vector; using {pq_code_len}",
                params.pq_code_budget_bytes,
                params.pq_code_budget_bytes / n as u64
            );
        }
        let pq = Arc::new(PqCodebook::train(&stored, n, stored_dim, pq_code_len, INDEX_SEED)?);
        let pq_codes = pq.encode_all(&stored, n);
        log::info!("trained PQ codebook: {pq_code_len} bytes/vector");

        let disk_pq_dims = if params.disk_pq_dims > dataset.dim() {
            log::warn!(
                "disk_pq_dims {} exceeds dimension {}; clamping",
                params.disk_pq_dims,
                dataset.dim()
            );
            dataset.dim()
        } else {
            params.disk_pq_dims
        };
        let disk_pq = if disk_pq_dims > 0 {
            let codebook = PqCodebook::train(
                &stored,
                n,
                stored_dim,
                disk_pq_dims,
                INDEX_SEED.wrapping_add(1),
            )?;
            let codes = codebook.encode_all(&stored, n);
            Some((codebook, codes))
        } else {
            None
        };

        let vamana = VamanaConfig {
            max_degree: params.max_degree,
            search_list_size: params.search_list_size,
            alpha: DEFAULT_ALPHA,
            accelerate: params.accelerate_build,
            seed: INDEX_SEED,
        };
        let (graph, graph_stats) =
            GraphBuilder::new(vamana, params.build_dram_budget_bytes).build(vectors)?;

        std::fs::create_dir_all(&self.dir)?;
        let header = LayoutHeader {
            num_nodes: n as u64,
            dim: dataset.dim() as u32,
            stored_dim: stored_dim as u32,
            max_degree: params.max_degree as u32,
            entry_point: graph.medoid,
            metric: params.metric,
            max_norm: space.max_norm(),
            disk_pq_dims: disk_pq_dims as u32,
        };
        let disk_index_bytes = DiskLayoutWriter::new(header).write(
            &self.dir.join(DISK_INDEX_FILE),
            &graph,
            vectors,
            disk_pq.as_ref().map(|(_, codes)| codes.as_slice()),
        )?;
        persistence::write_postcard(&self.dir.join(PQ_PIVOTS_FILE), pq.as_ref())?;
        std::fs::write(self.dir.join(PQ_COMPRESSED_FILE), &pq_codes)?;
        match &disk_pq {
            Some((codebook, _)) => {
                persistence::write_postcard(&self.dir.join(DISK_PQ_PIVOTS_FILE), codebook)?
            }
            None => remove_if_present(&self.dir.join(DISK_PQ_PIVOTS_FILE))?,
        }

        let metadata = IndexMetadata {
            version: METADATA_VERSION,
            num_nodes: n,
            dim: dataset.dim(),
            stored_dim,
            metric: params.metric,
            max_norm: space.max_norm(),
            entry_point: graph.medoid,
            max_degree: params.max_degree,
            search_list_size: params.search_list_size,
            accelerate_build: params.accelerate_build,
            num_shards: graph_stats.num_shards,
            pq_code_len,
            disk_pq_dims,
        };
        let json = serde_json::to_vec_pretty(&metadata).map_err(PersistenceError::from)?;
        std::fs::write(self.dir.join(METADATA_FILE), json)?;
        drop(graph);

        self.load(config)?;
        let report = BuildReport {
            num_nodes: n,
            dim: dataset.dim(),
            num_shards: graph_stats.num_shards,
            passes: graph_stats.passes,
            medoid: graph_stats.medoid,
            average_degree: graph_stats.average_degree,
            max_degree: graph_stats.max_degree,
            pq_code_len,
            pq_code_clamped,
            disk_pq_dims,
            disk_index_bytes,
            elapsed: start.elapsed(),
        };
        log::info!(
            "disk index built in {:?}: {} shard(s), {} bytes on disk",
            report.elapsed,
            report.num_shards,
            report.disk_index_bytes
        );
        Ok(report)
    }

    /// Open the index directory and populate the node cache.
    pub fn load(&mut self, config: &DiskAnnConfig) -> Result<()> {
        config.validate()?;
        self.searcher = None;
        self.metadata = None;
        self.cache_strategy = None;

        let bytes = persistence::read_all(&self.dir.join(METADATA_FILE))?;
        let metadata: IndexMetadata =
            serde_json::from_slice(&bytes).map_err(PersistenceError::from)?;
        let layout = DiskLayoutReader::open(&self.dir.join(DISK_INDEX_FILE))?;
        check_metadata(&metadata, layout.header())?;

        let pq: PqCodebook = persistence::read_postcard(&self.dir.join(PQ_PIVOTS_FILE))?;
        let pq_codes = persistence::read_all(&self.dir.join(PQ_COMPRESSED_FILE))?;
        let disk_pq = if metadata.disk_pq_dims > 0 {
            let codebook: PqCodebook =
                persistence::read_postcard(&self.dir.join(DISK_PQ_PIVOTS_FILE))?;
            Some(Arc::new(codebook))
        } else {
            None
        };

        let header = layout.header();
        let space = BuildSpace::from_parts(header.metric, header.dim as usize, header.max_norm);
        let mut searcher = DiskSearcher::new(layout, space, Arc::new(pq), pq_codes, disk_pq)?;

        let strategy = CacheStrategy::from_config(config.use_bfs_cache);
        let cache = CacheSelector::new(
            &searcher,
            config.search_cache_budget_bytes(),
            config.beamwidth,
            INDEX_SEED,
        )
        .select(strategy)?;
        searcher.set_cache(cache);
        if config.warm_up {
            warm_up(&searcher, config.beamwidth, INDEX_SEED.wrapping_add(2))?;
        }

        log::info!(
            "loaded disk index from {}: {} nodes, {} cached ({} bytes)",
            self.dir.display(),
            metadata.num_nodes,
            searcher.cache().len(),
            searcher.cache().bytes_used()
        );
        self.searcher = Some(searcher);
        self.metadata = Some(metadata);
        self.cache_strategy = Some(strategy);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.searcher.is_some()
    }

    fn searcher(&self) -> Result<&DiskSearcher> {
        self.searcher.as_ref().ok_or_else(|| {
            RetrieveError::NotReady(format!(
                "index at {} has not been built or loaded",
                self.dir.display()
            ))
        })
    }

    /// Top-k search. Results are ascending by distance in the index metric.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        config: &DiskAnnConfig,
        filter: Option<&Bitset>,
    ) -> Result<Vec<Neighbor>> {
        let searcher = self.searcher()?;
        let search_list_size = config.check_and_adjust_for_search(k)?;
        let params = SearchParams::new(k, search_list_size, config.beamwidth)
            .with_filter_threshold(config.filter_threshold);
        Ok(searcher.search(query, &params, filter)?.0)
    }

    /// Top-k search with explicit bounds and per-query counters.
    pub fn search_with_params(
        &self,
        query: &[f32],
        params: &SearchParams,
        filter: Option<&Bitset>,
    ) -> Result<(Vec<Neighbor>, QueryStats)> {
        self.searcher()?.search(query, params, filter)
    }

    /// All vectors within `radius`, found by doubling k.
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        config: &DiskAnnConfig,
        filter: Option<&Bitset>,
    ) -> Result<RangeSearchResult> {
        let searcher = self.searcher()?;
        config.validate()?;
        let params = RangeSearchParams {
            radius,
            min_k: config.min_k,
            max_k: config.max_k,
            search_list_and_k_ratio: config.search_list_and_k_ratio,
            beamwidth: config.beamwidth,
            filter_threshold: config.filter_threshold,
        };
        RangeSearchController::new(searcher).search(query, &params, filter)
    }

    /// Stored vectors for `ids`, in order.
    pub fn get_vector_by_ids(&self, ids: &[u32]) -> Result<Vec<Vec<f32>>> {
        self.searcher()?.get_vectors(ids)
    }

    pub fn len(&self) -> usize {
        self.metadata.as_ref().map_or(0, |m| m.num_nodes)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> usize {
        self.metadata.as_ref().map_or(0, |m| m.dim)
    }

    pub fn metric(&self) -> Option<DistanceMetric> {
        self.metadata.as_ref().map(|m| m.metric)
    }

    pub fn metadata(&self) -> Option<&IndexMetadata> {
        self.metadata.as_ref()
    }

    pub fn cache_strategy(&self) -> Option<CacheStrategy> {
        self.cache_strategy
    }

    /// Cached nodes and the bytes they use.
    pub fn cache_usage(&self) -> Option<(usize, usize)> {
        self.searcher
            .as_ref()
            .map(|s| (s.cache().len(), s.cache().bytes_used()))
    }

    /// On-disk layout bytes plus resident PQ codes, codebooks and cache.
    pub fn size_bytes(&self) -> usize {
        self.searcher
            .as_ref()
            .map_or(0, |s| s.layout().file_len() as usize + s.memory_bytes())
    }
}

fn check_metadata(metadata: &IndexMetadata, header: &LayoutHeader) -> Result<()> {
    let consistent = metadata.version == METADATA_VERSION
        && metadata.num_nodes as u64 == header.num_nodes
        && metadata.dim == header.dim as usize
        && metadata.stored_dim == header.stored_dim as usize
        && metadata.metric == header.metric
        && metadata.entry_point == header.entry_point
        && metadata.disk_pq_dims == header.disk_pq_dims as usize;
    if consistent {
        Ok(())
    } else {
        Err(PersistenceError::Format(format!(
            "{METADATA_FILE} does not match the {DISK_INDEX_FILE} header"
        ))
        .into())
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
