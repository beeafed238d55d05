//! Aligned positioned reads.
//!
//! Reads never move a shared file cursor, so one [`AlignedReader`] serves
//! any number of concurrent queries through `&self`. A beam-search round
//! hands its whole frontier to [`AlignedReader::read_batch`], which issues
//! the reads concurrently and returns once every one has completed.

use rayon::prelude::*;
use std::fs::File;
use std::io;
use std::path::Path;

/// Alignment and granularity of every read.
pub const SECTOR_LEN: u64 = 4096;

/// One aligned read: `len` bytes starting at `offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadRequest {
    pub offset: u64,
    pub len: usize,
}

impl ReadRequest {
    pub fn is_aligned(&self) -> bool {
        self.offset % SECTOR_LEN == 0 && self.len as u64 % SECTOR_LEN == 0
    }
}

#[derive(Debug)]
pub struct AlignedReader {
    file: File,
    len: u64,
}

impl AlignedReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    /// File length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read exactly `req.len` bytes at `req.offset`.
    pub fn read(&self, req: ReadRequest) -> io::Result<Vec<u8>> {
        if !req.is_aligned() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unaligned read at {} len {}", req.offset, req.len),
            ));
        }
        if req.offset + req.len as u64 > self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read at {} len {} past end of file ({} bytes)",
                    req.offset, req.len, self.len
                ),
            ));
        }
        let mut buf = vec![0u8; req.len];
        read_exact_at(&self.file, &mut buf, req.offset)?;
        Ok(buf)
    }

    /// Issue every request concurrently and wait for all of them.
    ///
    /// Buffers come back in request order. The first failure fails the batch.
    pub fn read_batch(&self, requests: &[ReadRequest]) -> io::Result<Vec<Vec<u8>>> {
        match requests {
            [] => Ok(Vec::new()),
            [one] => Ok(vec![self.read(*one)?]),
            _ => requests.par_iter().map(|&req| self.read(req)).collect(),
        }
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
