//! Disk persistence primitives shared by the layout writer and reader.
//!
//! The index directory written by [`crate::diskann::DiskAnnIndex`] holds:
//!
//! ```text
//! index_dir/
//! ├── disk.index            # header sector + block-aligned node records
//! ├── pq_pivots.bin         # in-memory PQ codebook (postcard)
//! ├── pq_compressed.bin     # in-memory PQ codes, n * num_chunks bytes
//! ├── disk_pq_pivots.bin    # disk PQ codebook, only when disk_pq_dims > 0
//! └── metadata.json         # human-readable summary
//! ```

pub mod error;

pub use error::{PersistenceError, PersistenceResult};

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Write a serde value as postcard bytes.
pub(crate) fn write_postcard<T: serde::Serialize>(path: &Path, value: &T) -> PersistenceResult<()> {
    let bytes = postcard::to_stdvec(value)?;
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read a postcard-encoded serde value.
pub(crate) fn read_postcard<T: serde::de::DeserializeOwned>(path: &Path) -> PersistenceResult<T> {
    let bytes = read_all(path)?;
    postcard::from_bytes(&bytes)
        .map_err(|e| PersistenceError::Deserialization(format!("{}: {}", path.display(), e)))
}

pub(crate) fn read_all(path: &Path) -> PersistenceResult<Vec<u8>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PersistenceError::NotFound(path.display().to_string()),
        _ => PersistenceError::Io(e),
    })?;
    let mut bytes = Vec::new();
    BufReader::new(file).read_to_end(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_all(&dir.path().join("nope.bin")).unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }

    #[test]
    fn postcard_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.bin");
        write_postcard(&path, &vec![1.5f32, -2.0, 3.25]).unwrap();
        let back: Vec<f32> = read_postcard(&path).unwrap();
        assert_eq!(back, vec![1.5, -2.0, 3.25]);
    }
}
