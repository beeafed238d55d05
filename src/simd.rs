//! Dense vector kernels.
//!
//! With the `innr` feature (default) the kernels come from `innr`, which
//! dispatches to SIMD at runtime. Without it, fixed-width lane accumulations
//! let the compiler auto-vectorize on stable.
//!
//! ```rust
//! use ssdann::simd::{dot, l2_distance_squared, norm};
//!
//! let a = [1.0_f32, 0.0, 0.0];
//! let b = [0.0_f32, 1.0, 0.0];
//!
//! assert_eq!(dot(&a, &b), 0.0);
//! assert_eq!(l2_distance_squared(&a, &b), 2.0);
//! assert_eq!(norm(&a), 1.0);
//! ```

#[cfg(feature = "innr")]
pub use innr::{dot, l2_distance, l2_distance_squared, norm};

#[cfg(not(feature = "innr"))]
mod fallback {
    //! Portable kernels used when `innr` is disabled.

    const LANES: usize = 8;

    /// Dot product of two vectors.
    #[inline]
    #[must_use]
    pub fn dot(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let (a, b) = (&a[..n], &b[..n]);
        let mut acc = [0.0f32; LANES];

        let mut ca = a.chunks_exact(LANES);
        let mut cb = b.chunks_exact(LANES);
        for (xa, xb) in (&mut ca).zip(&mut cb) {
            for i in 0..LANES {
                acc[i] += xa[i] * xb[i];
            }
        }

        let tail: f32 = ca
            .remainder()
            .iter()
            .zip(cb.remainder())
            .map(|(x, y)| x * y)
            .sum();
        acc.iter().sum::<f32>() + tail
    }

    /// Squared L2 distance. Preferred for ranking; the graph is built on it.
    #[inline]
    #[must_use]
    pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let (a, b) = (&a[..n], &b[..n]);
        let mut acc = [0.0f32; LANES];

        let mut ca = a.chunks_exact(LANES);
        let mut cb = b.chunks_exact(LANES);
        for (xa, xb) in (&mut ca).zip(&mut cb) {
            for i in 0..LANES {
                let d = xa[i] - xb[i];
                acc[i] += d * d;
            }
        }

        let tail: f32 = ca
            .remainder()
            .iter()
            .zip(cb.remainder())
            .map(|(x, y)| (x - y) * (x - y))
            .sum();
        acc.iter().sum::<f32>() + tail
    }

    /// L2 (Euclidean) distance.
    #[inline]
    #[must_use]
    pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
        l2_distance_squared(a, b).sqrt()
    }

    /// L2 norm of a vector.
    #[inline]
    #[must_use]
    pub fn norm(v: &[f32]) -> f32 {
        dot(v, v).sqrt()
    }
}

#[cfg(not(feature = "innr"))]
pub use fallback::*;
