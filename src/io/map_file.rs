//! Self-describing binary container for sparse remap maps.
//!
//! A map file carries named dimensions (`n_a`, `n_b`, `n_s`) and named 1-d
//! variables over `n_s`: `row` and `col` (i32, 1-based gids) and `S` (f64
//! weights). The format is little-endian and position-addressed so that each
//! rank can read an arbitrary chunk, or an arbitrary gather list, of a
//! variable without touching the rest of the file.
//!
//! Layout:
//!
//! ```text
//! magic "CRMF" | version u16 | ndims u16 | nvars u16 | reserved u16
//! per dim:  name_len u16 | name bytes | len u64
//! per var:  name_len u16 | name bytes | dtype u8 (0=i32, 1=f64)
//!           | dim_name_len u16 | dim name bytes | data_offset u64
//! data blobs (LE scalars, one blob per variable)
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::RemapError;

const MAGIC: [u8; 4] = *b"CRMF";
const VERSION: u16 = 1;

const DTYPE_I32: u8 = 0;
const DTYPE_F64: u8 = 1;

fn io_err(path: &Path, msg: impl Into<String>) -> RemapError {
    RemapError::MapFileIo {
        path: path.to_path_buf(),
        msg: msg.into(),
    }
}

#[derive(Clone, Debug)]
struct VarEntry {
    dtype: u8,
    len: u64,
    offset: u64,
}

/// Chunk- and gather-addressable reader for map files.
#[derive(Debug)]
pub struct MapFileReader {
    file: File,
    path: PathBuf,
    dims: HashMap<String, u64>,
    vars: HashMap<String, VarEntry>,
}

impl MapFileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RemapError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|e| io_err(&path, e.to_string()))?;

        let mut hdr = [0u8; 10];
        file.read_exact(&mut hdr)
            .map_err(|e| io_err(&path, format!("reading header: {e}")))?;
        if hdr[0..4] != MAGIC {
            return Err(io_err(&path, "bad magic: not a map file"));
        }
        let version = u16::from_le_bytes([hdr[4], hdr[5]]);
        if version != VERSION {
            return Err(io_err(&path, format!("unsupported format version {version}")));
        }
        let ndims = u16::from_le_bytes([hdr[6], hdr[7]]) as usize;
        let nvars = u16::from_le_bytes([hdr[8], hdr[9]]) as usize;

        let mut dims = HashMap::with_capacity(ndims);
        for _ in 0..ndims {
            let name = read_name(&mut file, &path)?;
            let len = read_u64(&mut file, &path)?;
            dims.insert(name, len);
        }

        let mut vars = HashMap::with_capacity(nvars);
        for _ in 0..nvars {
            let name = read_name(&mut file, &path)?;
            let mut dtype = [0u8; 1];
            file.read_exact(&mut dtype)
                .map_err(|e| io_err(&path, format!("reading var dtype: {e}")))?;
            let dim_name = read_name(&mut file, &path)?;
            let len = *dims
                .get(&dim_name)
                .ok_or_else(|| io_err(&path, format!("var `{name}` references unknown dim `{dim_name}`")))?;
            let offset = read_u64(&mut file, &path)?;
            vars.insert(
                name,
                VarEntry {
                    dtype: dtype[0],
                    len,
                    offset,
                },
            );
        }

        Ok(Self {
            file,
            path,
            dims,
            vars,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dim(&self, name: &str) -> Result<u64, RemapError> {
        self.dims
            .get(name)
            .copied()
            .ok_or_else(|| io_err(&self.path, format!("no dimension `{name}`")))
    }

    /// Read `count` i32 values of `var` starting at element `start`.
    pub fn read_i32(&mut self, var: &str, start: u64, count: usize) -> Result<Vec<i32>, RemapError> {
        let bytes = self.read_raw(var, DTYPE_I32, 4, start, count)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().expect("4-byte chunk")))
            .collect())
    }

    /// Read `count` f64 values of `var` starting at element `start`.
    pub fn read_f64(&mut self, var: &str, start: u64, count: usize) -> Result<Vec<f64>, RemapError> {
        let bytes = self.read_raw(var, DTYPE_F64, 8, start, count)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().expect("8-byte chunk")))
            .collect())
    }

    /// Gather i32 values of `var` at the given element indices, coalescing
    /// consecutive runs into single reads. The output matches `idx` order.
    pub fn read_i32_at(&mut self, var: &str, idx: &[u64]) -> Result<Vec<i32>, RemapError> {
        let mut out = Vec::with_capacity(idx.len());
        for (start, count) in coalesce_runs(idx) {
            out.extend(self.read_i32(var, start, count)?);
        }
        Ok(out)
    }

    /// Gather f64 values of `var` at the given element indices; see
    /// [`read_i32_at`](Self::read_i32_at).
    pub fn read_f64_at(&mut self, var: &str, idx: &[u64]) -> Result<Vec<f64>, RemapError> {
        let mut out = Vec::with_capacity(idx.len());
        for (start, count) in coalesce_runs(idx) {
            out.extend(self.read_f64(var, start, count)?);
        }
        Ok(out)
    }

    fn read_raw(
        &mut self,
        var: &str,
        dtype: u8,
        elem: u64,
        start: u64,
        count: usize,
    ) -> Result<Vec<u8>, RemapError> {
        let entry = self
            .vars
            .get(var)
            .ok_or_else(|| io_err(&self.path, format!("no variable `{var}`")))?
            .clone();
        if entry.dtype != dtype {
            return Err(io_err(
                &self.path,
                format!("variable `{var}` has a different element type"),
            ));
        }
        if start + count as u64 > entry.len {
            return Err(io_err(
                &self.path,
                format!(
                    "read of `{var}` out of bounds: [{start}, {}) of {}",
                    start + count as u64,
                    entry.len
                ),
            ));
        }
        self.file
            .seek(SeekFrom::Start(entry.offset + start * elem))
            .map_err(|e| io_err(&self.path, e.to_string()))?;
        let mut buf = vec![0u8; count * elem as usize];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| io_err(&self.path, format!("reading `{var}`: {e}")))?;
        Ok(buf)
    }
}

fn read_name(file: &mut File, path: &Path) -> Result<String, RemapError> {
    let mut len = [0u8; 2];
    file.read_exact(&mut len)
        .map_err(|e| io_err(path, format!("reading name length: {e}")))?;
    let mut name = vec![0u8; u16::from_le_bytes(len) as usize];
    file.read_exact(&mut name)
        .map_err(|e| io_err(path, format!("reading name: {e}")))?;
    String::from_utf8(name).map_err(|_| io_err(path, "non-utf8 name in header"))
}

fn read_u64(file: &mut File, path: &Path) -> Result<u64, RemapError> {
    let mut b = [0u8; 8];
    file.read_exact(&mut b)
        .map_err(|e| io_err(path, e.to_string()))?;
    Ok(u64::from_le_bytes(b))
}

/// Split a sorted-or-not index list into maximal consecutive ascending runs.
fn coalesce_runs(idx: &[u64]) -> Vec<(u64, usize)> {
    let mut runs = Vec::new();
    let mut it = idx.iter().copied();
    let Some(first) = it.next() else {
        return runs;
    };
    let (mut start, mut count) = (first, 1usize);
    for i in it {
        if i == start + count as u64 {
            count += 1;
        } else {
            runs.push((start, count));
            start = i;
            count = 1;
        }
    }
    runs.push((start, count));
    runs
}

enum VarData {
    I32(Vec<i32>),
    F64(Vec<f64>),
}

/// Writer used by tools and tests to construct map files.
pub struct MapFileWriter {
    path: PathBuf,
    dims: Vec<(String, u64)>,
    vars: Vec<(String, String, VarData)>,
}

impl MapFileWriter {
    pub fn create(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            dims: Vec::new(),
            vars: Vec::new(),
        }
    }

    pub fn add_dim(&mut self, name: &str, len: u64) -> &mut Self {
        self.dims.push((name.to_string(), len));
        self
    }

    pub fn add_var_i32(&mut self, name: &str, dim: &str, data: &[i32]) -> &mut Self {
        self.vars
            .push((name.to_string(), dim.to_string(), VarData::I32(data.to_vec())));
        self
    }

    pub fn add_var_f64(&mut self, name: &str, dim: &str, data: &[f64]) -> &mut Self {
        self.vars
            .push((name.to_string(), dim.to_string(), VarData::F64(data.to_vec())));
        self
    }

    /// Validate lengths, lay out the header, and write the file.
    pub fn finish(self) -> Result<(), RemapError> {
        for (name, dim, data) in &self.vars {
            let dim_len = self
                .dims
                .iter()
                .find(|(d, _)| d == dim)
                .map(|(_, l)| *l)
                .ok_or_else(|| io_err(&self.path, format!("var `{name}` references unknown dim `{dim}`")))?;
            let len = match data {
                VarData::I32(v) => v.len() as u64,
                VarData::F64(v) => v.len() as u64,
            };
            if len != dim_len {
                return Err(io_err(
                    &self.path,
                    format!("var `{name}` has {len} elements but dim `{dim}` is {dim_len}"),
                ));
            }
        }

        // Header size must be known before data offsets can be assigned.
        let mut header_len = 10u64;
        for (name, _) in &self.dims {
            header_len += 2 + name.len() as u64 + 8;
        }
        for (name, dim, _) in &self.vars {
            header_len += 2 + name.len() as u64 + 1 + 2 + dim.len() as u64 + 8;
        }

        let mut offsets = Vec::with_capacity(self.vars.len());
        let mut pos = header_len;
        for (_, _, data) in &self.vars {
            offsets.push(pos);
            pos += match data {
                VarData::I32(v) => v.len() as u64 * 4,
                VarData::F64(v) => v.len() as u64 * 8,
            };
        }

        let mut buf = Vec::with_capacity(pos as usize);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.dims.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(self.vars.len() as u16).to_le_bytes());
        for (name, len) in &self.dims {
            write_name(&mut buf, name);
            buf.extend_from_slice(&len.to_le_bytes());
        }
        for ((name, dim, data), offset) in self.vars.iter().zip(&offsets) {
            write_name(&mut buf, name);
            buf.push(match data {
                VarData::I32(_) => DTYPE_I32,
                VarData::F64(_) => DTYPE_F64,
            });
            write_name(&mut buf, dim);
            buf.extend_from_slice(&offset.to_le_bytes());
        }
        debug_assert_eq!(buf.len() as u64, header_len);
        for (_, _, data) in &self.vars {
            match data {
                VarData::I32(v) => {
                    for x in v {
                        buf.extend_from_slice(&x.to_le_bytes());
                    }
                }
                VarData::F64(v) => {
                    for x in v {
                        buf.extend_from_slice(&x.to_le_bytes());
                    }
                }
            }
        }

        let mut file = File::create(&self.path).map_err(|e| io_err(&self.path, e.to_string()))?;
        file.write_all(&buf)
            .map_err(|e| io_err(&self.path, e.to_string()))?;
        Ok(())
    }
}

fn write_name(buf: &mut Vec<u8>, name: &str) {
    buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("coarse_remap_mapio_{}_{tag}.map", std::process::id()))
    }

    fn write_sample(path: &Path) {
        let mut w = MapFileWriter::create(path);
        w.add_dim("n_a", 6)
            .add_dim("n_b", 3)
            .add_dim("n_s", 6)
            .add_var_i32("row", "n_s", &[1, 1, 2, 2, 3, 3])
            .add_var_i32("col", "n_s", &[1, 4, 2, 5, 3, 6])
            .add_var_f64("S", "n_s", &[0.25, 0.75, 0.25, 0.75, 0.25, 0.75]);
        w.finish().unwrap();
    }

    #[test]
    fn roundtrip_dims_and_vars() {
        let path = tmp_path("roundtrip");
        write_sample(&path);
        let mut r = MapFileReader::open(&path).unwrap();
        assert_eq!(r.dim("n_s").unwrap(), 6);
        assert_eq!(r.dim("n_b").unwrap(), 3);
        assert_eq!(r.read_i32("row", 0, 6).unwrap(), vec![1, 1, 2, 2, 3, 3]);
        assert_eq!(r.read_f64("S", 0, 6).unwrap(), vec![0.25, 0.75, 0.25, 0.75, 0.25, 0.75]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn chunked_reads() {
        let path = tmp_path("chunks");
        write_sample(&path);
        let mut r = MapFileReader::open(&path).unwrap();
        assert_eq!(r.read_i32("col", 2, 3).unwrap(), vec![2, 5, 3]);
        assert_eq!(r.read_i32("col", 5, 1).unwrap(), vec![6]);
        assert_eq!(r.read_i32("col", 0, 0).unwrap(), Vec::<i32>::new());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn gather_reads_follow_index_order() {
        let path = tmp_path("gather");
        write_sample(&path);
        let mut r = MapFileReader::open(&path).unwrap();
        // two runs: [4,5] and [0,1,2]
        assert_eq!(
            r.read_i32_at("col", &[4, 5, 0, 1, 2]).unwrap(),
            vec![3, 6, 1, 4, 2]
        );
        assert_eq!(r.read_f64_at("S", &[5]).unwrap(), vec![0.75]);
        assert_eq!(r.read_f64_at("S", &[]).unwrap(), Vec::<f64>::new());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn out_of_bounds_and_bad_lookups_fail() {
        let path = tmp_path("bounds");
        write_sample(&path);
        let mut r = MapFileReader::open(&path).unwrap();
        assert!(r.read_i32("row", 4, 3).is_err());
        assert!(r.read_i32("nope", 0, 1).is_err());
        assert!(r.read_f64("row", 0, 1).is_err(), "dtype mismatch must fail");
        assert!(r.dim("n_q").is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn bad_magic_rejected() {
        let path = tmp_path("magic");
        std::fs::write(&path, b"NOTAMAPFILE").unwrap();
        let err = MapFileReader::open(&path).unwrap_err();
        assert!(matches!(err, RemapError::MapFileIo { .. }));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn writer_rejects_length_mismatch() {
        let path = tmp_path("mismatch");
        let mut w = MapFileWriter::create(&path);
        w.add_dim("n_s", 3).add_var_i32("row", "n_s", &[1, 2]);
        assert!(w.finish().is_err());
    }

    #[test]
    fn coalesce_runs_splits_correctly() {
        assert_eq!(coalesce_runs(&[]), vec![]);
        assert_eq!(coalesce_runs(&[3]), vec![(3, 1)]);
        assert_eq!(coalesce_runs(&[0, 1, 2, 7, 8, 4]), vec![(0, 3), (7, 2), (4, 1)]);
    }

    proptest::proptest! {
        #[test]
        fn coalesced_runs_reproduce_the_index_list(idx in proptest::collection::vec(0u64..512, 0..64)) {
            let runs = coalesce_runs(&idx);
            let rebuilt: Vec<u64> = runs
                .iter()
                .flat_map(|&(start, count)| start..start + count as u64)
                .collect();
            proptest::prop_assert_eq!(rebuilt, idx);
        }
    }
}
