//! Memory-mapped vector matrix
//!
//! A dense row-major f32 file of shape `[capacity x dim]`, mapped
//! read-write while the owning block is active. Capacity grows by
//! doubling; growth extends the file and re-maps.

use crate::error::{Error, Result};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub const VECTORS_FILE: &str = "vectors.bin";

/// Initial row capacity for a fresh block
const INITIAL_CAPACITY: u64 = 1024;

pub struct VectorMatrix {
    file: File,
    mmap: MmapMut,
    dim: usize,
    capacity: u64,
    path: PathBuf,
}

impl VectorMatrix {
    /// Create a fresh matrix file sized for `INITIAL_CAPACITY` rows.
    pub fn create(dir: &Path, dim: usize) -> Result<Self> {
        Self::with_capacity(dir, dim, INITIAL_CAPACITY)
    }

    /// Open an existing matrix file, trusting `capacity` from block meta.
    /// A file shorter than the recorded capacity is sized back up; rows
    /// past the journal watermark are garbage and get overwritten.
    pub fn open(dir: &Path, dim: usize, capacity: u64) -> Result<Self> {
        Self::with_capacity(dir, dim, capacity.max(INITIAL_CAPACITY))
    }

    fn with_capacity(dir: &Path, dim: usize, capacity: u64) -> Result<Self> {
        if dim == 0 {
            return Err(Error::Internal("vector dimension must be positive".into()));
        }
        let path = dir.join(VECTORS_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let wanted = capacity * dim as u64 * 4;
        if file.metadata()?.len() < wanted {
            file.set_len(wanted)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            file,
            mmap,
            dim,
            capacity,
            path,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Write row `id`, doubling capacity first when `id` falls past the
    /// current end. Only the single store writer calls this.
    pub fn write_row(&mut self, id: u64, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(Error::Internal(format!(
                "vector dimension mismatch: expected {}, got {}",
                self.dim,
                vector.len()
            )));
        }
        while id >= self.capacity {
            self.grow()?;
        }

        let start = id as usize * self.dim * 4;
        let row = &mut self.mmap[start..start + self.dim * 4];
        for (chunk, &val) in row.chunks_exact_mut(4).zip(vector.iter()) {
            chunk.copy_from_slice(&val.to_le_bytes());
        }
        Ok(())
    }

    /// Copy row `id` out of the map.
    pub fn row(&self, id: u64) -> Result<Vec<f32>> {
        let bytes = self.row_bytes(id)?;
        let mut out = Vec::with_capacity(self.dim);
        for chunk in bytes.chunks_exact(4) {
            out.push(f32::from_le_bytes(chunk.try_into().unwrap()));
        }
        Ok(out)
    }

    /// Dot product of row `id` with `query`, without allocating. The inner
    /// loop runs over the contiguous row so the compiler can vectorize it.
    pub fn dot_row(&self, id: u64, query: &[f32]) -> Result<f32> {
        let bytes = self.row_bytes(id)?;
        let mut acc = 0.0f32;
        for (chunk, &q) in bytes.chunks_exact(4).zip(query.iter()) {
            acc += f32::from_le_bytes(chunk.try_into().unwrap()) * q;
        }
        Ok(acc)
    }

    fn row_bytes(&self, id: u64) -> Result<&[u8]> {
        if id >= self.capacity {
            return Err(Error::Internal(format!("vector row {} out of bounds", id)));
        }
        let start = id as usize * self.dim * 4;
        Ok(&self.mmap[start..start + self.dim * 4])
    }

    fn grow(&mut self) -> Result<()> {
        let new_capacity = self.capacity * 2;
        self.mmap.flush()?;
        self.file.set_len(new_capacity * self.dim as u64 * 4)?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        self.capacity = new_capacity;
        tracing::debug!(
            path = %self.path.display(),
            capacity = new_capacity,
            "vector matrix grown"
        );
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_and_read_rows() {
        let dir = TempDir::new().unwrap();
        let mut matrix = VectorMatrix::create(dir.path(), 4).unwrap();

        matrix.write_row(0, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        matrix.write_row(1, &[0.0, 0.5, 0.5, 0.0]).unwrap();

        assert_eq!(matrix.row(0).unwrap(), vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(matrix.row(1).unwrap(), vec![0.0, 0.5, 0.5, 0.0]);
    }

    #[test]
    fn dot_row_matches_manual_product() {
        let dir = TempDir::new().unwrap();
        let mut matrix = VectorMatrix::create(dir.path(), 3).unwrap();
        matrix.write_row(0, &[0.5, 0.5, 0.0]).unwrap();

        let sim = matrix.dot_row(0, &[1.0, 0.0, 1.0]).unwrap();
        assert!((sim - 0.5).abs() < 1e-6);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let dir = TempDir::new().unwrap();
        let mut matrix = VectorMatrix::create(dir.path(), 2).unwrap();
        let initial = matrix.capacity();

        for id in 0..initial + 1 {
            matrix.write_row(id, &[id as f32, 1.0]).unwrap();
        }
        assert_eq!(matrix.capacity(), initial * 2);
        // Pre-growth rows survive the remap.
        assert_eq!(matrix.row(0).unwrap(), vec![0.0, 1.0]);
        assert_eq!(matrix.row(initial).unwrap(), vec![initial as f32, 1.0]);
    }

    #[test]
    fn reopen_preserves_rows() {
        let dir = TempDir::new().unwrap();
        {
            let mut matrix = VectorMatrix::create(dir.path(), 2).unwrap();
            matrix.write_row(0, &[0.25, 0.75]).unwrap();
            matrix.flush().unwrap();
        }
        let matrix = VectorMatrix::open(dir.path(), 2, INITIAL_CAPACITY).unwrap();
        assert_eq!(matrix.row(0).unwrap(), vec![0.25, 0.75]);
    }

    #[test]
    fn rejects_wrong_dimension() {
        let dir = TempDir::new().unwrap();
        let mut matrix = VectorMatrix::create(dir.path(), 4).unwrap();
        assert!(matrix.write_row(0, &[1.0]).is_err());
    }
}
