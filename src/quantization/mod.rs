//! Vector quantization: compress vectors while preserving distance.
//!
//! Two product-quantization codebooks back a disk index:
//!
//! - the in-memory codebook, whose codes for every node stay resident and
//!   score candidates during beam search;
//! - the optional disk codebook (`disk_pq_dims > 0`), whose codes replace the
//!   full-precision vector inside each on-disk record.
//!
//! ```text
//! 1B vectors x 128 dims x 4 bytes = 512 GB   (full precision)
//! 1B vectors x 32 byte codes      =  32 GB   (PQ, 16x smaller)
//! ```

pub mod pq;

pub use pq::{code_len_for_budget, DistanceTable, PqCodebook, NUM_PQ_CENTROIDS};
