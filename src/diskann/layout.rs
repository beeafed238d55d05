//! On-disk index layout.
//!
//! Format of `disk.index`:
//! - Sector 0 (4096 bytes): header
//!   - Magic `DANN` (4 bytes), version (4 bytes)
//!   - Num nodes (8 bytes)
//!   - Dim, stored dim, max degree, entry point (4 bytes each)
//!   - Metric tag (1 byte), padding (3 bytes), max norm (4 bytes)
//!   - Disk PQ code length (4 bytes), padding (4 bytes)
//!   - Record length, records per sector, sectors per record (8 bytes each)
//!   - Zero padding to the end of the sector
//! - Sectors 1..: node records, in id order
//!   - Payload: `stored_dim` f32 values, or a disk PQ code of
//!     `disk_pq_dims` bytes
//!   - Degree (4 bytes)
//!   - Neighbors (`max_degree` * 4 bytes, zero padded)
//!
//! Records of at most one sector are packed `4096 / record_len` per sector
//! and never straddle a sector boundary. Larger records take
//! `ceil(record_len / 4096)` whole sectors. Fetching one node is always one
//! aligned read.

use super::io::{AlignedReader, ReadRequest, SECTOR_LEN};
use crate::distance::DistanceMetric;
use crate::persistence::error::{PersistenceError, PersistenceResult};
use crate::vamana::{VamanaGraph, VectorSlice};
use smallvec::SmallVec;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const LAYOUT_MAGIC: &[u8; 4] = b"DANN";
const LAYOUT_VERSION: u32 = 2;
const HEADER_BYTES: usize = 72;

/// Layout parameters persisted in sector 0.
#[derive(Clone, Debug, PartialEq)]
pub struct LayoutHeader {
    pub num_nodes: u64,
    /// Width of user vectors.
    pub dim: u32,
    /// Width of build-space vectors (dim + 1 for inner product).
    pub stored_dim: u32,
    pub max_degree: u32,
    pub entry_point: u32,
    pub metric: DistanceMetric,
    /// Largest base norm, used to undo the inner-product augmentation.
    pub max_norm: f32,
    /// Disk PQ code length; 0 means records carry full vectors.
    pub disk_pq_dims: u32,
}

impl LayoutHeader {
    pub fn geometry(&self) -> RecordGeometry {
        let payload_len = if self.disk_pq_dims > 0 {
            self.disk_pq_dims as usize
        } else {
            self.stored_dim as usize * 4
        };
        RecordGeometry::new(payload_len, self.max_degree as usize)
    }

    fn to_sector(&self) -> Vec<u8> {
        let geometry = self.geometry();
        let mut buf = Vec::with_capacity(SECTOR_LEN as usize);
        buf.extend_from_slice(LAYOUT_MAGIC);
        buf.extend_from_slice(&LAYOUT_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.num_nodes.to_le_bytes());
        buf.extend_from_slice(&self.dim.to_le_bytes());
        buf.extend_from_slice(&self.stored_dim.to_le_bytes());
        buf.extend_from_slice(&self.max_degree.to_le_bytes());
        buf.extend_from_slice(&self.entry_point.to_le_bytes());
        buf.push(self.metric.tag());
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&self.max_norm.to_le_bytes());
        buf.extend_from_slice(&self.disk_pq_dims.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&(geometry.record_len as u64).to_le_bytes());
        buf.extend_from_slice(&(geometry.records_per_sector as u64).to_le_bytes());
        buf.extend_from_slice(&(geometry.sectors_per_record as u64).to_le_bytes());
        debug_assert_eq!(buf.len(), HEADER_BYTES);
        buf.resize(SECTOR_LEN as usize, 0);
        buf
    }

    fn from_sector(buf: &[u8]) -> PersistenceResult<Self> {
        if buf.len() < HEADER_BYTES || &buf[0..4] != LAYOUT_MAGIC {
            return Err(PersistenceError::Format(
                "invalid disk index header".to_string(),
            ));
        }
        let mut r = FieldReader { buf, at: 4 };
        let version = r.u32();
        if version != LAYOUT_VERSION {
            return Err(PersistenceError::Format(format!(
                "unsupported layout version {version}, expected {LAYOUT_VERSION}"
            )));
        }
        let num_nodes = r.u64();
        let dim = r.u32();
        let stored_dim = r.u32();
        let max_degree = r.u32();
        let entry_point = r.u32();
        let tag = r.u8();
        r.skip(3);
        let max_norm = f32::from_bits(r.u32());
        let disk_pq_dims = r.u32();
        r.skip(4);
        let record_len = r.u64() as usize;
        let records_per_sector = r.u64() as usize;
        let sectors_per_record = r.u64() as usize;

        let metric = DistanceMetric::from_tag(tag)
            .ok_or_else(|| PersistenceError::Format(format!("unknown metric tag {tag}")))?;
        let header = Self {
            num_nodes,
            dim,
            stored_dim,
            max_degree,
            entry_point,
            metric,
            max_norm,
            disk_pq_dims,
        };

        let geometry = header.geometry();
        if geometry.record_len != record_len
            || geometry.records_per_sector != records_per_sector
            || geometry.sectors_per_record != sectors_per_record
        {
            return Err(PersistenceError::Format(
                "record geometry does not match header fields".to_string(),
            ));
        }
        if num_nodes > 0 && entry_point as u64 >= num_nodes {
            return Err(PersistenceError::Format(format!(
                "entry point {entry_point} out of range for {num_nodes} nodes"
            )));
        }
        Ok(header)
    }
}

struct FieldReader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl FieldReader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.at..self.at + N]);
        self.at += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    fn skip(&mut self, n: usize) {
        self.at += n;
    }
}

/// Where records live inside `disk.index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordGeometry {
    pub payload_len: usize,
    pub max_degree: usize,
    pub record_len: usize,
    pub records_per_sector: usize,
    pub sectors_per_record: usize,
}

impl RecordGeometry {
    pub fn new(payload_len: usize, max_degree: usize) -> Self {
        let record_len = payload_len + 4 + max_degree * 4;
        let sector = SECTOR_LEN as usize;
        let (records_per_sector, sectors_per_record) = if record_len <= sector {
            (sector / record_len, 1)
        } else {
            (1, record_len.div_ceil(sector))
        };
        Self {
            payload_len,
            max_degree,
            record_len,
            records_per_sector,
            sectors_per_record,
        }
    }

    /// Bytes of one read.
    pub fn block_len(&self) -> usize {
        self.sectors_per_record * SECTOR_LEN as usize
    }

    /// The aligned read holding `id` and the record's offset inside it.
    pub fn locate(&self, id: u32) -> (ReadRequest, usize) {
        let id = id as usize;
        let block = id / self.records_per_sector;
        let sector = 1 + (block * self.sectors_per_record) as u64;
        let req = ReadRequest {
            offset: sector * SECTOR_LEN,
            len: self.block_len(),
        };
        (req, (id % self.records_per_sector) * self.record_len)
    }

    /// Total file length for `num_nodes` records, header included.
    pub fn file_len(&self, num_nodes: usize) -> u64 {
        let blocks = num_nodes.div_ceil(self.records_per_sector) as u64;
        SECTOR_LEN * (1 + blocks * self.sectors_per_record as u64)
    }
}

/// Stored vector representation of a node.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordPayload {
    /// Build-space vector.
    Full(Vec<f32>),
    /// Disk PQ code.
    Pq(Vec<u8>),
}

impl RecordPayload {
    pub fn byte_len(&self) -> usize {
        match self {
            RecordPayload::Full(v) => v.len() * 4,
            RecordPayload::Pq(c) => c.len(),
        }
    }
}

/// A decoded node record.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRecord {
    pub payload: RecordPayload,
    pub neighbors: SmallVec<[u32; 32]>,
}

impl NodeRecord {
    /// Bytes charged against the cache budget.
    pub fn cache_bytes(&self) -> usize {
        self.payload.byte_len() + 4 * (1 + self.neighbors.len())
    }
}

/// Serializes a built graph and its vectors into `disk.index`.
pub struct DiskLayoutWriter {
    header: LayoutHeader,
    geometry: RecordGeometry,
}

impl DiskLayoutWriter {
    pub fn new(header: LayoutHeader) -> Self {
        let geometry = header.geometry();
        Self { header, geometry }
    }

    pub fn geometry(&self) -> RecordGeometry {
        self.geometry
    }

    /// Write header and records. `vectors` are build-space vectors; when the
    /// header asks for disk PQ, `disk_codes` holds `disk_pq_dims` bytes per
    /// node and replaces them. Returns the file length.
    pub fn write(
        &self,
        path: &Path,
        graph: &VamanaGraph,
        vectors: VectorSlice<'_>,
        disk_codes: Option<&[u8]>,
    ) -> PersistenceResult<u64> {
        let n = self.header.num_nodes as usize;
        let code_len = self.header.disk_pq_dims as usize;
        if graph.num_nodes() != n || vectors.len() != n {
            return Err(PersistenceError::Serialization(format!(
                "header declares {n} nodes, graph has {} and vectors {}",
                graph.num_nodes(),
                vectors.len()
            )));
        }
        if code_len > 0 && disk_codes.map_or(true, |c| c.len() != n * code_len) {
            return Err(PersistenceError::Serialization(
                "disk PQ layout needs one code per node".to_string(),
            ));
        }

        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&self.header.to_sector())?;

        let g = self.geometry;
        let ids: Vec<u32> = (0..n as u32).collect();
        let mut block = vec![0u8; g.block_len()];
        for group in ids.chunks(g.records_per_sector) {
            block.fill(0);
            for (slot, &id) in group.iter().enumerate() {
                let neighbors = &graph.adjacency[id as usize];
                if neighbors.len() > g.max_degree {
                    return Err(PersistenceError::Serialization(format!(
                        "node {id} degree {} exceeds max_degree {}",
                        neighbors.len(),
                        g.max_degree
                    )));
                }
                let rec = &mut block[slot * g.record_len..(slot + 1) * g.record_len];
                let (payload, rest) = rec.split_at_mut(g.payload_len);
                match disk_codes {
                    Some(codes) if code_len > 0 => {
                        let start = id as usize * code_len;
                        payload.copy_from_slice(&codes[start..start + code_len]);
                    }
                    _ => {
                        for (dst, x) in payload.chunks_exact_mut(4).zip(vectors.get(id)) {
                            dst.copy_from_slice(&x.to_le_bytes());
                        }
                    }
                }
                rest[0..4].copy_from_slice(&(neighbors.len() as u32).to_le_bytes());
                for (dst, nb) in rest[4..].chunks_exact_mut(4).zip(neighbors) {
                    dst.copy_from_slice(&nb.to_le_bytes());
                }
            }
            writer.write_all(&block)?;
        }
        writer.flush()?;
        Ok(g.file_len(n))
    }
}

/// Random access to the records of `disk.index`.
#[derive(Debug)]
pub struct DiskLayoutReader {
    header: LayoutHeader,
    geometry: RecordGeometry,
    reader: AlignedReader,
}

impl DiskLayoutReader {
    pub fn open(path: &Path) -> PersistenceResult<Self> {
        let reader = AlignedReader::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PersistenceError::NotFound(path.display().to_string()),
            _ => PersistenceError::Io(e),
        })?;
        if reader.len() < SECTOR_LEN {
            return Err(PersistenceError::Format(format!(
                "{} is shorter than one sector",
                path.display()
            )));
        }
        let sector = reader.read(ReadRequest {
            offset: 0,
            len: SECTOR_LEN as usize,
        })?;
        let header = LayoutHeader::from_sector(&sector)?;
        let geometry = header.geometry();
        let expected = geometry.file_len(header.num_nodes as usize);
        if reader.len() < expected {
            return Err(PersistenceError::Format(format!(
                "{} is truncated: {} bytes, expected {expected}",
                path.display(),
                reader.len()
            )));
        }
        Ok(Self {
            header,
            geometry,
            reader,
        })
    }

    pub fn header(&self) -> &LayoutHeader {
        &self.header
    }

    pub fn geometry(&self) -> RecordGeometry {
        self.geometry
    }

    pub fn num_nodes(&self) -> usize {
        self.header.num_nodes as usize
    }

    pub fn file_len(&self) -> u64 {
        self.reader.len()
    }

    /// Fetch several records with one concurrent batch of reads.
    pub fn read_nodes(&self, ids: &[u32]) -> PersistenceResult<Vec<NodeRecord>> {
        let mut requests = Vec::with_capacity(ids.len());
        let mut offsets = Vec::with_capacity(ids.len());
        for &id in ids {
            if id as u64 >= self.header.num_nodes {
                return Err(PersistenceError::Format(format!(
                    "node {id} out of range for {} nodes",
                    self.header.num_nodes
                )));
            }
            let (req, within) = self.geometry.locate(id);
            requests.push(req);
            offsets.push(within);
        }
        let blocks = self.reader.read_batch(&requests)?;
        blocks
            .iter()
            .zip(offsets)
            .map(|(block, within)| {
                self.parse_record(&block[within..within + self.geometry.record_len])
            })
            .collect()
    }

    pub fn read_node(&self, id: u32) -> PersistenceResult<NodeRecord> {
        let mut records = self.read_nodes(&[id])?;
        records
            .pop()
            .ok_or_else(|| PersistenceError::Format(format!("no record for node {id}")))
    }

    fn parse_record(&self, rec: &[u8]) -> PersistenceResult<NodeRecord> {
        let g = &self.geometry;
        let (payload, rest) = rec.split_at(g.payload_len);
        let payload = if self.header.disk_pq_dims > 0 {
            RecordPayload::Pq(payload.to_vec())
        } else {
            RecordPayload::Full(
                payload
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            )
        };

        let degree = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if degree > g.max_degree {
            return Err(PersistenceError::Format(format!(
                "record degree {degree} exceeds max_degree {}",
                g.max_degree
            )));
        }
        let mut neighbors = SmallVec::with_capacity(degree);
        for b in rest[4..4 + degree * 4].chunks_exact(4) {
            let nb = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            if nb as u64 >= self.header.num_nodes {
                return Err(PersistenceError::Format(format!(
                    "neighbor {nb} out of range"
                )));
            }
            neighbors.push(nb);
        }
        Ok(NodeRecord { payload, neighbors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(n: u64, stored_dim: u32, max_degree: u32, disk_pq_dims: u32) -> LayoutHeader {
        LayoutHeader {
            num_nodes: n,
            dim: stored_dim,
            stored_dim,
            max_degree,
            entry_point: 0,
            metric: DistanceMetric::L2,
            max_norm: 0.0,
            disk_pq_dims,
        }
    }

    #[test]
    fn small_records_share_sectors() {
        // 8 * 4 + 4 + 4 * 4 = 52 bytes
        let g = RecordGeometry::new(32, 4);
        assert_eq!(g.record_len, 52);
        assert_eq!(g.records_per_sector, 4096 / 52);
        assert_eq!(g.sectors_per_record, 1);

        let (req, within) = g.locate(0);
        assert_eq!((req.offset, within), (4096, 0));
        let (req, within) = g.locate(g.records_per_sector as u32 + 1);
        assert_eq!((req.offset, within), (8192, 52));
        assert!(req.is_aligned());
    }

    #[test]
    fn large_records_span_sectors() {
        let g = RecordGeometry::new(4096 * 2, 64);
        assert_eq!(g.records_per_sector, 1);
        assert_eq!(g.sectors_per_record, 3);
        let (req, within) = g.locate(2);
        assert_eq!(req.offset, 4096 * (1 + 6));
        assert_eq!(req.len, 3 * 4096);
        assert_eq!(within, 0);
        assert_eq!(g.file_len(3), 4096 * 10);
    }

    #[test]
    fn header_roundtrip_and_corruption() {
        let mut h = header(10, 3, 4, 0);
        h.metric = DistanceMetric::InnerProduct;
        h.max_norm = 2.5;
        h.entry_point = 7;
        let sector = h.to_sector();
        assert_eq!(sector.len(), SECTOR_LEN as usize);
        assert_eq!(LayoutHeader::from_sector(&sector).unwrap(), h);

        let mut bad = sector.clone();
        bad[0] = b'X';
        assert!(matches!(
            LayoutHeader::from_sector(&bad),
            Err(PersistenceError::Format(_))
        ));
        let mut bad_geometry = sector;
        bad_geometry[48] ^= 1;
        assert!(LayoutHeader::from_sector(&bad_geometry).is_err());
    }

    #[test]
    fn write_then_read_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.index");
        let data: Vec<f32> = (0..5 * 3).map(|i| i as f32 * 0.5).collect();
        let graph = VamanaGraph {
            adjacency: vec![vec![1, 2], vec![0], vec![0, 3, 4], vec![2], vec![2]],
            medoid: 2,
        };
        let mut h = header(5, 3, 3, 0);
        h.entry_point = 2;
        let len = DiskLayoutWriter::new(h.clone())
            .write(&path, &graph, VectorSlice::new(&data, 3), None)
            .unwrap();
        assert_eq!(len, std::fs::metadata(&path).unwrap().len());

        let reader = DiskLayoutReader::open(&path).unwrap();
        assert_eq!(reader.header(), &h);
        let recs = reader.read_nodes(&[4, 2, 0]).unwrap();
        assert_eq!(recs[0].payload, RecordPayload::Full(vec![6.0, 6.5, 7.0]));
        assert_eq!(recs[1].neighbors.as_slice(), &[0, 3, 4]);
        assert_eq!(recs[2].neighbors.as_slice(), &[1, 2]);
        assert_eq!(recs[2].cache_bytes(), 12 + 4 * 3);
        assert!(reader.read_node(5).is_err());
    }

    #[test]
    fn disk_pq_records_hold_codes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.index");
        let data = vec![0.0f32; 3 * 16];
        let codes: Vec<u8> = (0..3 * 4).map(|i| i as u8).collect();
        let graph = VamanaGraph {
            adjacency: vec![vec![1], vec![2], vec![0]],
            medoid: 0,
        };
        let h = header(3, 16, 2, 4);
        DiskLayoutWriter::new(h.clone())
            .write(&path, &graph, VectorSlice::new(&data, 16), Some(&codes))
            .unwrap();
        let reader = DiskLayoutReader::open(&path).unwrap();
        assert_eq!(reader.geometry().payload_len, 4);
        let rec = reader.read_node(1).unwrap();
        assert_eq!(rec.payload, RecordPayload::Pq(vec![4, 5, 6, 7]));

        let missing = DiskLayoutWriter::new(h).write(&path, &graph, VectorSlice::new(&data, 16), None);
        assert!(missing.is_err());
    }

    #[test]
    fn degree_over_limit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.index");
        let data = vec![0.0f32; 3];
        let graph = VamanaGraph {
            adjacency: vec![vec![1, 2], vec![0], vec![0]],
            medoid: 0,
        };
        let err = DiskLayoutWriter::new(header(3, 1, 1, 0))
            .write(&path, &graph, VectorSlice::new(&data, 1), None)
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Serialization(_)));
    }
}
