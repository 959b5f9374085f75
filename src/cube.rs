//! The lazy spectral cube.
//!
//! A [`Cube`] is a *view*: a shared read-only chunk store, a window into it,
//! the coordinate system of that window, and a mask. Every transform returns
//! a new view; pixel data are only read when a consumer asks for a channel.
//!
//! Array axes are `(spectral, y, x)`. WCS axes are in FITS order
//! `(x, y, spectral)`.

use std::ops::Range;
use std::sync::Arc;

use ndarray::{Array2, Array3, Axis};

use crate::error::{CubeError, Result, Stage};
use crate::mask::CubeMask;
use crate::source::chunks::{ChunkStore, MemoryStore};
use crate::source::Scheduler;
use crate::wcs::{CoordinateSystem, RestValue, SpectralUnit, VelocityConvention};

/// Gaussian restoring beam, FWHM axes in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beam {
    pub major_deg: f64,
    pub minor_deg: f64,
    /// Position angle, degrees east of north.
    pub pa_deg: f64,
}

impl Beam {
    /// FWHM → Gaussian standard deviation factor, 1 / (2·sqrt(2·ln 2)).
    pub const FWHM_TO_SIGMA: f64 = 0.424_660_900_144_009_5;

    /// Beam solid angle in steradians.
    pub fn solid_angle_sr(&self) -> f64 {
        std::f64::consts::PI / (4.0 * std::f64::consts::LN_2)
            * self.major_deg.to_radians()
            * self.minor_deg.to_radians()
    }

    /// Standard deviations (major, minor) in pixels for a given pixel scale.
    pub fn stddev_pixels(&self, pixel_scale_deg: f64) -> (f64, f64) {
        (
            self.major_deg * Self::FWHM_TO_SIGMA / pixel_scale_deg,
            self.minor_deg * Self::FWHM_TO_SIGMA / pixel_scale_deg,
        )
    }
}

/// Non-coordinate metadata carried through transforms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CubeMeta {
    /// Intensity unit (FITS `BUNIT`), empty if unknown.
    pub unit: String,
    pub beam: Option<Beam>,
}

/// Sub-region of the backing store, in store coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub channels: Range<usize>,
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl Window {
    pub fn full(shape: (usize, usize, usize)) -> Self {
        Self {
            channels: 0..shape.0,
            rows: 0..shape.1,
            cols: 0..shape.2,
        }
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (
            self.channels.len(),
            self.rows.len(),
            self.cols.len(),
        )
    }

    /// Store-coordinate origin `(channel, row, col)` of this window.
    pub fn origin(&self) -> (usize, usize, usize) {
        (self.channels.start, self.rows.start, self.cols.start)
    }

    /// Compose with a window given relative to this one.
    fn narrow(&self, rel: &Window) -> Window {
        let shift = |base: &Range<usize>, r: &Range<usize>| base.start + r.start..base.start + r.end;
        Window {
            channels: shift(&self.channels, &rel.channels),
            rows: shift(&self.rows, &rel.rows),
            cols: shift(&self.cols, &rel.cols),
        }
    }
}

/// A lazily evaluated, masked spectral cube.
#[derive(Debug, Clone)]
pub struct Cube {
    store: Arc<dyn ChunkStore>,
    window: Window,
    wcs: CoordinateSystem,
    mask: CubeMask,
    meta: CubeMeta,
    scheduler: Scheduler,
}

impl PartialEq for Cube {
    /// Two cubes are equal when they are the same view of the same store.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.store, &other.store)
            && self.window == other.window
            && self.wcs == other.wcs
            && self.mask == other.mask
            && self.meta == other.meta
    }
}

impl Cube {
    /// Wrap an in-memory `(spectral, y, x)` array.
    pub fn from_array(data: Array3<f32>, wcs: CoordinateSystem) -> Result<Self> {
        Self::from_store(Arc::new(MemoryStore::new(data)), wcs, CubeMeta::default())
    }

    /// Build a cube over an arbitrary chunk store.
    ///
    /// The WCS must have three axes `(x, y, spectral)`.
    pub fn from_store(store: Arc<dyn ChunkStore>, wcs: CoordinateSystem, meta: CubeMeta) -> Result<Self> {
        if wcs.naxis() != 3 {
            return Err(CubeError::shape(
                Stage::SourceOpen,
                format!("cube WCS must have 3 axes, got {}", wcs.naxis()),
            ));
        }
        match wcs.spectral() {
            Some(s) if s.axis == 2 => {}
            _ => {
                return Err(CubeError::format(
                    Stage::SourceOpen,
                    "cube WCS axis 3 must be spectral (FREQ, VRAD, VOPT, VELO or WAVE)",
                ))
            }
        }
        let shape = store.shape();
        Ok(Self {
            store,
            window: Window::full(shape),
            wcs,
            mask: CubeMask::all(shape),
            meta,
            scheduler: Scheduler::default(),
        })
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.meta.unit = unit.to_string();
        self
    }

    pub fn with_beam(mut self, beam: Beam) -> Self {
        self.meta.beam = Some(beam);
        self
    }

    /// Choose the velocity convention used when spectral values are requested in velocity units.
    pub fn with_velocity_convention(mut self, convention: VelocityConvention) -> Self {
        self.wcs = self.wcs.with_velocity_convention(convention);
        self
    }

    /// Override the rest frequency/wavelength from the header.
    pub fn with_rest_value(mut self, rest: RestValue) -> Self {
        self.wcs = self.wcs.with_rest_value(rest);
        self
    }

    /// `(n_channels, ny, nx)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        self.window.shape()
    }

    pub fn n_channels(&self) -> usize {
        self.window.channels.len()
    }

    pub fn wcs(&self) -> &CoordinateSystem {
        &self.wcs
    }

    pub fn mask(&self) -> &CubeMask {
        &self.mask
    }

    pub fn meta(&self) -> &CubeMeta {
        &self.meta
    }

    pub fn unit(&self) -> &str {
        &self.meta.unit
    }

    pub fn beam(&self) -> Option<Beam> {
        self.meta.beam
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler
    }

    /// Window into the backing store.
    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Coordinate system of the full backing grid this view was cut from.
    pub fn root_wcs(&self) -> CoordinateSystem {
        let (k0, y0, x0) = self.window.origin();
        self.wcs
            .shifted(0, -(x0 as f64))
            .shifted(1, -(y0 as f64))
            .shifted(2, -(k0 as f64))
    }

    /// Spectral coordinates of every channel in `unit`.
    pub fn spectral_axis(&self, unit: SpectralUnit) -> Result<Vec<f64>> {
        self.wcs.spectral_values(self.n_channels(), unit)
    }

    /// Channel widths in `unit` (always positive).
    pub fn channel_widths(&self, unit: SpectralUnit) -> Result<Vec<f64>> {
        self.wcs.channel_widths(self.n_channels(), unit)
    }

    fn check_channel(&self, channel: usize, stage: Stage) -> Result<()> {
        if channel >= self.n_channels() {
            return Err(CubeError::shape(
                stage,
                format!("channel {} out of range 0..{}", channel, self.n_channels()),
            ));
        }
        Ok(())
    }

    /// Unmasked values of a window of one channel; rows/cols relative to this cube.
    pub fn raw_window(&self, channel: usize, rows: Range<usize>, cols: Range<usize>) -> Result<Array2<f32>> {
        self.check_channel(channel, Stage::Extraction)?;
        let (_, ny, nx) = self.shape();
        if rows.end > ny || cols.end > nx {
            return Err(CubeError::shape(
                Stage::Extraction,
                format!("window rows={rows:?} cols={cols:?} outside {ny}x{nx} plane"),
            ));
        }
        let r0 = self.window.rows.start;
        let c0 = self.window.cols.start;
        self.store.read_window(
            self.window.channels.start + channel,
            r0 + rows.start..r0 + rows.end,
            c0 + cols.start..c0 + cols.end,
        )
    }

    /// Masked window of one channel: excluded pixels are NaN.
    pub fn channel_window(&self, channel: usize, rows: Range<usize>, cols: Range<usize>) -> Result<Array2<f32>> {
        let (r0, c0) = (rows.start, cols.start);
        let mut plane = self.raw_window(channel, rows, cols)?;
        self.mask.apply_window(channel, r0, c0, &mut plane);
        Ok(plane)
    }

    /// Unmasked plane of one channel.
    pub fn raw_channel(&self, channel: usize) -> Result<Array2<f32>> {
        let (_, ny, nx) = self.shape();
        self.raw_window(channel, 0..ny, 0..nx)
    }

    /// Masked plane of one channel: excluded pixels are NaN.
    pub fn channel(&self, channel: usize) -> Result<Array2<f32>> {
        let (_, ny, nx) = self.shape();
        self.channel_window(channel, 0..ny, 0..nx)
    }

    /// Boolean inclusion mask of one channel, evaluated against its data.
    pub fn channel_mask(&self, channel: usize) -> Result<Array2<bool>> {
        let plane = self.raw_channel(channel)?;
        Ok(self.mask.evaluate(channel, 0, 0, &plane))
    }

    /// Masked spectrum at pixel `(y, x)`; reads a single pixel per channel.
    pub fn spectrum(&self, y: usize, x: usize) -> Result<Vec<f32>> {
        let (_, ny, nx) = self.shape();
        if y >= ny || x >= nx {
            return Err(CubeError::shape(
                Stage::Extraction,
                format!("pixel (y={y}, x={x}) outside {ny}x{nx} plane"),
            ));
        }
        self.scheduler.map(self.n_channels(), |k| {
            Ok(self.channel_window(k, y..y + 1, x..x + 1)?[[0, 0]])
        })
    }

    /// Read every channel into memory, masked values as NaN.
    pub fn to_array(&self) -> Result<Array3<f32>> {
        let (nc, ny, nx) = self.shape();
        let planes = self.scheduler.map(nc, |k| self.channel(k))?;
        let mut out = Array3::<f32>::zeros((nc, ny, nx));
        for (mut dst, plane) in out.axis_iter_mut(Axis(0)).zip(planes) {
            dst.assign(&plane);
        }
        Ok(out)
    }

    /// A view restricted to `rel` (relative to this cube) with a replacement mask.
    ///
    /// `mask` must already be expressed in the coordinates of `rel`.
    pub(crate) fn narrowed(&self, rel: &Window, mask: CubeMask) -> Self {
        let (k0, y0, x0) = rel.origin();
        let wcs = self
            .wcs
            .shifted(0, x0 as f64)
            .shifted(1, y0 as f64)
            .shifted(2, k0 as f64);
        Self {
            store: Arc::clone(&self.store),
            window: self.window.narrow(rel),
            wcs,
            mask,
            meta: self.meta.clone(),
            scheduler: self.scheduler,
        }
    }

    pub(crate) fn with_mask(&self, mask: CubeMask) -> Self {
        Self {
            mask,
            ..self.clone()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fits::Header;

    /// A small TAN/VRAD cube whose value at (k, y, x) is `k*100 + y*10 + x`.
    pub(crate) fn test_cube(nc: usize, ny: usize, nx: usize) -> Cube {
        let data = Array3::from_shape_fn((nc, ny, nx), |(k, y, x)| (k * 100 + y * 10 + x) as f32);
        Cube::from_array(data, test_wcs(nx, ny)).unwrap()
    }

    pub(crate) fn test_wcs(nx: usize, ny: usize) -> CoordinateSystem {
        let mut h = Header::new();
        h.set("NAXIS", 3_i64);
        h.set("CTYPE1", "RA---TAN");
        h.set("CTYPE2", "DEC--TAN");
        h.set("CTYPE3", "VRAD");
        h.set("CUNIT3", "m/s");
        h.set("CRPIX1", nx as f64 / 2.0 + 0.5);
        h.set("CRPIX2", ny as f64 / 2.0 + 0.5);
        h.set("CRPIX3", 1.0);
        h.set("CRVAL1", 150.0);
        h.set("CRVAL2", 2.0);
        h.set("CRVAL3", -5000.0);
        h.set("CDELT1", -0.001);
        h.set("CDELT2", 0.001);
        h.set("CDELT3", 1000.0);
        CoordinateSystem::from_header(&h).unwrap()
    }

    #[test]
    fn test_shape_and_channel_reads() {
        let cube = test_cube(4, 3, 5);
        assert_eq!(cube.shape(), (4, 3, 5));
        let plane = cube.channel(2).unwrap();
        assert_eq!(plane[[1, 3]], 213.0);
        assert!(cube.channel(4).is_err());

        let spectrum = cube.spectrum(2, 4).unwrap();
        assert_eq!(spectrum, vec![24.0, 124.0, 224.0, 324.0]);
    }

    #[test]
    fn test_spectral_axis_in_km_per_s() {
        let cube = test_cube(4, 3, 5);
        let v = cube.spectral_axis(SpectralUnit::KilometersPerSecond).unwrap();
        assert_eq!(v.len(), 4);
        assert!((v[0] + 5.0).abs() < 1e-12 && (v[3] + 2.0).abs() < 1e-12);
        let w = cube.channel_widths(SpectralUnit::KilometersPerSecond).unwrap();
        assert!(w.iter().all(|&d| (d - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_narrowed_view_reads_store_offsets() {
        let cube = test_cube(4, 6, 7);
        let rel = Window {
            channels: 1..3,
            rows: 2..5,
            cols: 3..7,
        };
        let sub = cube.narrowed(&rel, CubeMask::all(rel.shape()));
        assert_eq!(sub.shape(), (2, 3, 4));
        assert_eq!(sub.channel(0).unwrap()[[0, 0]], 123.0);

        // Same world position before and after narrowing
        let a = cube.wcs().pixel_to_world(&[3.0, 2.0, 1.0]).unwrap();
        let b = sub.wcs().pixel_to_world(&[0.0, 0.0, 0.0]).unwrap();
        for i in 0..3 {
            assert!((a[i] - b[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_to_array_matches_between_schedulers() {
        let cube = test_cube(6, 4, 4);
        let a = cube.to_array().unwrap();
        let b = cube
            .clone()
            .with_scheduler(Scheduler::Threaded { threads: Some(2) })
            .to_array()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_beam_conversions() {
        let beam = Beam {
            major_deg: 2.0 / 3600.0,
            minor_deg: 1.0 / 3600.0,
            pa_deg: 30.0,
        };
        let (sx, sy) = beam.stddev_pixels(0.5 / 3600.0);
        assert!((sx - 4.0 * Beam::FWHM_TO_SIGMA).abs() < 1e-9);
        assert!((sy - 2.0 * Beam::FWHM_TO_SIGMA).abs() < 1e-9);
        assert!(beam.solid_angle_sr() > 0.0);
    }
}
