//! Clustering used for PQ training and shard assignment.

pub mod kmeans;

pub use kmeans::KMeans;
