//! Opening cubes from local files or URLs.
//!
//! [`open`] resolves a [`Locator`] to a local FITS file (downloading through
//! the cache for URLs), locates the image HDU, parses its coordinate system
//! and returns a lazy [`Cube`]: no pixel data is read until a consumer asks
//! for a channel.

pub mod chunks;
pub mod fetch;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, info};

use crate::cube::{Beam, Cube, CubeMeta};
use crate::error::{CubeError, Result, Stage};
use crate::fits::{self, HduInfo, ImageReader};
use crate::wcs::CoordinateSystem;
use chunks::{CachedStore, ChunkStore, FitsStore};
pub use fetch::FetchConfig;

/// How per-channel work is executed.
///
/// The choice never changes results, only wall-clock time and peak memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheduler {
    /// Process channels one after another on the calling thread.
    #[default]
    Synchronous,
    /// Process channels on rayon worker threads. `threads: None` uses the
    /// global pool; `Some(n)` runs inside a dedicated pool of `n` threads.
    Threaded { threads: Option<usize> },
}

impl Scheduler {
    /// Evaluate `f` for every index in `0..n`, returning results in index order.
    pub fn map<T, F>(&self, n: usize, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Send + Sync,
    {
        match *self {
            Scheduler::Synchronous => (0..n).map(f).collect(),
            Scheduler::Threaded { threads: None } => (0..n).into_par_iter().map(f).collect(),
            Scheduler::Threaded { threads: Some(t) } => {
                pool(t)?.install(|| (0..n).into_par_iter().map(f).collect())
            }
        }
    }
}

/// Dedicated pools, built on first use and shared by every scheduler asking
/// for the same thread count.
static POOLS: Lazy<Mutex<HashMap<usize, Arc<ThreadPool>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn pool(threads: usize) -> Result<Arc<ThreadPool>> {
    let threads = threads.max(1);
    let mut pools = POOLS.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(p) = pools.get(&threads) {
        return Ok(Arc::clone(p));
    }
    let p = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map(Arc::new)
        .map_err(|e| CubeError::invalid(Stage::SourceOpen, format!("cannot build thread pool: {e}")))?;
    debug!("Built rayon pool with {threads} threads");
    pools.insert(threads, Arc::clone(&p));
    Ok(p)
}

/// Configuration for opening cubes.
#[derive(Debug, Clone, Default)]
pub struct SourceConfig {
    /// Remote download settings (cache directory, timeout, fallbacks).
    pub fetch: FetchConfig,
    /// Keep every plane read in memory so repeated passes hit the disk once.
    /// Trades memory for I/O; default false.
    pub cache_planes: bool,
    /// Scheduler attached to opened cubes.
    pub scheduler: Scheduler,
}

/// Where a cube lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Path(PathBuf),
    Url(String),
}

impl From<&str> for Locator {
    fn from(s: &str) -> Self {
        if s.starts_with("http://") || s.starts_with("https://") {
            Locator::Url(s.to_string())
        } else if let Some(p) = s.strip_prefix("file://") {
            Locator::Path(PathBuf::from(p))
        } else {
            Locator::Path(PathBuf::from(s))
        }
    }
}

impl From<String> for Locator {
    fn from(s: String) -> Self {
        Locator::from(s.as_str())
    }
}

impl From<&Path> for Locator {
    fn from(p: &Path) -> Self {
        Locator::Path(p.to_path_buf())
    }
}

impl From<PathBuf> for Locator {
    fn from(p: PathBuf) -> Self {
        Locator::Path(p)
    }
}

impl Locator {
    /// Local file path, fetching into the cache for URLs.
    pub fn resolve(&self, config: &FetchConfig) -> Result<PathBuf> {
        match self {
            Locator::Path(p) => {
                if p.exists() {
                    Ok(p.clone())
                } else {
                    Err(CubeError::io_msg(
                        Stage::SourceOpen,
                        format!("{} does not exist", p.display()),
                    ))
                }
            }
            Locator::Url(u) => fetch::fetch(u, config),
        }
    }
}

/// Open the first 3D image HDU of a FITS file or URL as a lazy cube.
pub fn open(locator: impl Into<Locator>, config: &SourceConfig) -> Result<Cube> {
    open_hdu(locator, None, config)
}

/// Open a specific HDU (0 = primary) or, with `None`, the first image HDU
/// with at least three axes.
pub fn open_hdu(locator: impl Into<Locator>, hdu: Option<usize>, config: &SourceConfig) -> Result<Cube> {
    let locator = locator.into();
    let path = locator.resolve(&config.fetch)?;
    info!("Opening cube {}", path.display());

    let hdus = fits::read_hdus(&path)?;
    let info = select_hdu(&hdus, hdu, &path)?;

    let (wcs, shape) = cube_geometry(info)?;
    let reader = ImageReader::open(&path, info)?;
    let mut store: Arc<dyn ChunkStore> = Arc::new(FitsStore::new(reader, shape)?);
    if config.cache_planes {
        store = Arc::new(CachedStore::new(store));
    }

    let header = &info.header;
    let beam = match (header.get_f64("BMAJ"), header.get_f64("BMIN")) {
        (Some(major_deg), Some(minor_deg)) => Some(Beam {
            major_deg,
            minor_deg,
            pa_deg: header.get_f64("BPA").unwrap_or(0.0),
        }),
        _ => None,
    };
    let meta = CubeMeta {
        unit: header.get_str("BUNIT").unwrap_or("").trim().to_string(),
        beam,
    };

    debug!("Cube shape (spectral, y, x) = {:?}, unit '{}'", shape, meta.unit);
    Ok(Cube::from_store(store, wcs, meta)?.with_scheduler(config.scheduler))
}

fn select_hdu<'a>(hdus: &'a [HduInfo], hdu: Option<usize>, path: &Path) -> Result<&'a HduInfo> {
    match hdu {
        Some(i) => hdus.get(i).filter(|h| h.is_image()).ok_or_else(|| {
            CubeError::format(
                Stage::SourceOpen,
                format!("HDU {} of {} is not an image HDU", i, path.display()),
            )
        }),
        None => hdus
            .iter()
            .find(|h| h.is_image() && h.header.get_i64("NAXIS").unwrap_or(0) >= 3)
            .ok_or_else(|| {
                CubeError::format(
                    Stage::SourceOpen,
                    format!("{} has no image HDU with 3 or more axes", path.display()),
                )
            }),
    }
}

/// Reduce the header's WCS to the three cube axes `(x, y, spectral)` and
/// return the array shape `(n_channels, ny, nx)`.
///
/// Extra axes (typically Stokes) are accepted only with length 1.
fn cube_geometry(info: &HduInfo) -> Result<(CoordinateSystem, (usize, usize, usize))> {
    let header = &info.header;
    let naxis = header.require_i64("NAXIS")? as usize;
    let naxes = (1..=naxis)
        .map(|i| header.require_i64(&format!("NAXIS{i}")).map(|n| n.max(0) as usize))
        .collect::<Result<Vec<_>>>()?;
    if naxis < 3 {
        return Err(CubeError::format(
            Stage::SourceOpen,
            format!("cube needs 3 axes, image has {naxis}"),
        ));
    }

    let full = CoordinateSystem::from_header(header)?;
    let spectral = full.spectral().ok_or_else(|| {
        CubeError::format(
            Stage::SourceOpen,
            format!(
                "no spectral axis among CTYPEs {:?}",
                full.axes().iter().map(|a| a.ctype.as_str()).collect::<Vec<_>>()
            ),
        )
    })?;
    if spectral.axis < 2 {
        return Err(CubeError::format(
            Stage::SourceOpen,
            format!("spectral axis must not be a spatial axis (found at axis {})", spectral.axis + 1),
        ));
    }
    for (i, &n) in naxes.iter().enumerate().skip(2) {
        if i != spectral.axis && n != 1 {
            return Err(CubeError::shape(
                Stage::SourceOpen,
                format!(
                    "axis {} ('{}') has length {}, only degenerate extra axes are supported",
                    i + 1,
                    full.axes()[i].ctype,
                    n
                ),
            ));
        }
    }

    let wcs = full.sub(&[0, 1, spectral.axis])?;
    Ok((wcs, (naxes[spectral.axis], naxes[1], naxes[0])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_parsing() {
        assert_eq!(
            Locator::from("https://example.org/a.fits"),
            Locator::Url("https://example.org/a.fits".into())
        );
        assert_eq!(
            Locator::from("file:///data/a.fits"),
            Locator::Path(PathBuf::from("/data/a.fits"))
        );
        assert_eq!(Locator::from("a.fits"), Locator::Path(PathBuf::from("a.fits")));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = open("/definitely/not/here.fits", &SourceConfig::default()).unwrap_err();
        assert!(matches!(err, CubeError::Io { stage: Stage::SourceOpen, .. }));
    }

    #[test]
    fn test_scheduler_preserves_order() {
        let f = |i: usize| Ok(i * i);
        let seq = Scheduler::Synchronous.map(50, f).unwrap();
        let par = Scheduler::Threaded { threads: None }.map(50, f).unwrap();
        let pool = Scheduler::Threaded { threads: Some(3) }.map(50, f).unwrap();
        assert_eq!(seq, par);
        assert_eq!(seq, pool);
    }

    #[test]
    fn test_dedicated_pool_is_reused() {
        let a = pool(5).unwrap();
        let b = pool(5).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.current_num_threads(), 5);
        // Zero is clamped to a single thread
        assert!(Arc::ptr_eq(&pool(0).unwrap(), &pool(1).unwrap()));
    }

    #[test]
    fn test_scheduler_propagates_errors() {
        let r: Result<Vec<usize>> = Scheduler::Threaded { threads: None }.map(10, |i| {
            if i == 7 {
                Err(CubeError::invalid(Stage::Moment, "boom"))
            } else {
                Ok(i)
            }
        });
        assert!(r.is_err());
    }
}
