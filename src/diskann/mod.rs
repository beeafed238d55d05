//! DiskANN implementation.
//!
//! Disk-based approximate nearest neighbor search for very large datasets
//! that don't fit in memory.
//!
//! Build: PQ training -> Vamana graph -> `disk.index` layout. Load: header,
//! PQ codes and codebooks into memory, then the node cache. Query: beam
//! search over cached and on-disk records, or PQ + refine under heavy
//! filters; radius queries double k on top of it.
//!
//! # References
//!
//! - Jayaram Subramanya et al. (2019): "DiskANN: Fast Accurate Billion-point
//!   Nearest Neighbor Search on a Single Node"

pub mod cache;
pub mod index;
pub mod io;
pub mod layout;
pub mod range;
pub mod search;

pub use cache::{CacheSelector, CacheStrategy, CacheTable};
pub use index::{BuildReport, Dataset, DiskAnnIndex, IndexMetadata};
pub use io::{AlignedReader, ReadRequest, SECTOR_LEN};
pub use layout::{DiskLayoutReader, DiskLayoutWriter, LayoutHeader, NodeRecord, RecordGeometry};
pub use range::{RangeSearchController, RangeSearchParams, RangeSearchResult};
pub use search::{DiskSearcher, QueryStats, SearchParams};
