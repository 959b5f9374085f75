//! Chunked, read-only access to cube data.
//!
//! A chunk is one spectral plane. Consumers ask for a plane (or a spatial
//! window of one) only when they need it, so processing a cube never requires
//! holding more than a handful of planes in memory.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{s, Array2, Array3};
use once_cell::sync::OnceCell;
use tracing::trace;

use crate::error::{CubeError, Result, Stage};
use crate::fits::ImageReader;

/// Read access to a 3D `(spectral, y, x)` array, one plane at a time.
pub trait ChunkStore: Send + Sync + fmt::Debug {
    /// Full shape as `(n_channels, ny, nx)`.
    fn shape(&self) -> (usize, usize, usize);

    /// Read a spatial window of one spectral plane.
    fn read_window(&self, channel: usize, rows: Range<usize>, cols: Range<usize>)
        -> Result<Array2<f32>>;

    /// Read an entire spectral plane.
    fn read_plane(&self, channel: usize) -> Result<Array2<f32>> {
        let (_, ny, nx) = self.shape();
        self.read_window(channel, 0..ny, 0..nx)
    }
}

fn check_window(
    shape: (usize, usize, usize),
    channel: usize,
    rows: &Range<usize>,
    cols: &Range<usize>,
) -> Result<()> {
    let (nc, ny, nx) = shape;
    if channel >= nc || rows.end > ny || cols.end > nx || rows.start > rows.end || cols.start > cols.end {
        return Err(CubeError::shape(
            Stage::SourceOpen,
            format!(
                "window channel={channel} rows={rows:?} cols={cols:?} outside cube of shape {shape:?}"
            ),
        ));
    }
    Ok(())
}

/// Cube data held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    data: Array3<f32>,
}

impl MemoryStore {
    pub fn new(data: Array3<f32>) -> Self {
        Self { data }
    }
}

impl ChunkStore for MemoryStore {
    fn shape(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    fn read_window(&self, channel: usize, rows: Range<usize>, cols: Range<usize>) -> Result<Array2<f32>> {
        check_window(self.shape(), channel, &rows, &cols)?;
        Ok(self.data.slice(s![channel, rows, cols]).to_owned())
    }
}

/// Cube data read on demand from a FITS data unit.
///
/// A window read fetches the contiguous block of rows it spans and keeps only
/// the requested columns, so the bytes touched are proportional to the window.
#[derive(Debug)]
pub struct FitsStore {
    reader: ImageReader,
    shape: (usize, usize, usize),
}

impl FitsStore {
    /// `shape` is `(n_channels, ny, nx)`; the data unit must hold at least that
    /// many elements (a trailing degenerate Stokes axis is allowed).
    pub fn new(reader: ImageReader, shape: (usize, usize, usize)) -> Result<Self> {
        let (nc, ny, nx) = shape;
        if nc * ny * nx > reader.layout().num_elements() {
            return Err(CubeError::shape(
                Stage::SourceOpen,
                format!(
                    "cube shape {:?} exceeds data unit of {} elements",
                    shape,
                    reader.layout().num_elements()
                ),
            ));
        }
        Ok(Self { reader, shape })
    }
}

impl ChunkStore for FitsStore {
    fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    fn read_window(&self, channel: usize, rows: Range<usize>, cols: Range<usize>) -> Result<Array2<f32>> {
        check_window(self.shape, channel, &rows, &cols)?;
        let (_, ny, nx) = self.shape;
        let nrows = rows.end - rows.start;
        let start = channel * ny * nx + rows.start * nx;
        trace!("FITS read: channel {channel}, rows {rows:?}, cols {cols:?}");
        let values = self.reader.read_elements(start, nrows * nx)?;
        let block = Array2::from_shape_vec((nrows, nx), values)
            .map_err(|e| CubeError::shape(Stage::SourceOpen, e.to_string()))?;
        Ok(block.slice(s![.., cols]).to_owned())
    }
}

/// Memoizing wrapper that reads each plane from its inner store at most once.
///
/// The map of cells is guarded by a short-lived lock; each plane is populated
/// inside its own [`OnceCell`], so concurrent requests for the same plane wait
/// for a single read while requests for different planes proceed in parallel.
#[derive(Debug)]
pub struct CachedStore {
    inner: Arc<dyn ChunkStore>,
    planes: Mutex<HashMap<usize, Arc<OnceCell<Arc<Array2<f32>>>>>>,
    reads: AtomicUsize,
}

impl CachedStore {
    pub fn new(inner: Arc<dyn ChunkStore>) -> Self {
        Self {
            inner,
            planes: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
        }
    }

    /// Number of plane reads issued to the inner store.
    pub fn inner_reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Shared handle to a cached plane, reading it on first use.
    pub fn plane(&self, channel: usize) -> Result<Arc<Array2<f32>>> {
        let cell = {
            let mut map = self
                .planes
                .lock()
                .map_err(|_| CubeError::io_msg(Stage::SourceOpen, "plane cache lock poisoned"))?;
            map.entry(channel).or_default().clone()
        };
        cell.get_or_try_init(|| {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read_plane(channel).map(Arc::new)
        })
        .cloned()
    }
}

impl ChunkStore for CachedStore {
    fn shape(&self) -> (usize, usize, usize) {
        self.inner.shape()
    }

    fn read_window(&self, channel: usize, rows: Range<usize>, cols: Range<usize>) -> Result<Array2<f32>> {
        check_window(self.shape(), channel, &rows, &cols)?;
        let plane = self.plane(channel)?;
        Ok(plane.slice(s![rows, cols]).to_owned())
    }

    fn read_plane(&self, channel: usize) -> Result<Array2<f32>> {
        Ok(self.plane(channel)?.as_ref().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    fn ramp(nc: usize, ny: usize, nx: usize) -> Array3<f32> {
        Array3::from_shape_fn((nc, ny, nx), |(k, y, x)| (k * 100 + y * 10 + x) as f32)
    }

    #[test]
    fn test_memory_window() {
        let store = MemoryStore::new(ramp(3, 4, 5));
        let w = store.read_window(2, 1..3, 2..5).unwrap();
        assert_eq!(w.dim(), (2, 3));
        assert_eq!(w[[0, 0]], 212.0);
        assert_eq!(w[[1, 2]], 224.0);
        assert!(store.read_window(3, 0..1, 0..1).is_err());
        assert!(store.read_window(0, 0..5, 0..1).is_err());
    }

    #[test]
    fn test_cache_reads_each_plane_once_under_concurrency() {
        let inner: Arc<dyn ChunkStore> = Arc::new(MemoryStore::new(ramp(4, 8, 8)));
        let cache = CachedStore::new(inner);

        (0..64usize).into_par_iter().for_each(|i| {
            let plane = cache.read_plane(i % 4).unwrap();
            assert_eq!(plane[[1, 1]], ((i % 4) * 100 + 11) as f32);
        });

        assert_eq!(cache.inner_reads(), 4);
        let w = cache.read_window(3, 2..4, 5..8).unwrap();
        assert_eq!(w[[0, 0]], 325.0);
        assert_eq!(cache.inner_reads(), 4);
    }
}
