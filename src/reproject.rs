//! Resampling cubes onto a new celestial grid.
//!
//! Every spectral plane is resampled independently with the same pixel map,
//! which is computed once: target pixel → world → source pixel. The spectral
//! axis is copied unchanged. Interpolation preserves surface brightness, not
//! flux; a pixel-area rescale is needed when the pixel size changes and flux
//! must be conserved.

use nalgebra::DMatrix;
use ndarray::{Array2, Array3, Axis};
use tracing::{debug, info};

use crate::cube::Cube;
use crate::error::{CubeError, Result, Stage};
use crate::fits::Header;
use crate::wcs::{CoordinateSystem, WorldAxis};

/// How a source plane is sampled at fractional pixel positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
}

#[derive(Debug, Clone, Default)]
pub struct ReprojectConfig {
    /// Default bilinear.
    pub interpolation: Interpolation,
}

/// Slack when deciding whether a mapped position lies on the source grid.
const EDGE_TOLERANCE: f64 = 1e-6;

fn unsupported(message: impl Into<String>) -> CubeError {
    CubeError::UnsupportedProjection {
        stage: Stage::Reproject,
        message: message.into(),
    }
}

/// Celestial axes at positions 0 and 1, as a 2-axis WCS with `lon_first`.
fn spatial_pair(wcs: &CoordinateSystem, what: &str) -> Result<(CoordinateSystem, bool)> {
    let cel = wcs
        .celestial()
        .ok_or_else(|| unsupported(format!("{what} has no celestial axes")))?;
    if cel.lon.max(cel.lat) > 1 {
        return Err(unsupported(format!("{what} celestial axes must be axes 1 and 2")));
    }
    Ok((wcs.sub(&[0, 1])?, cel.lon == 0))
}

/// Source pixel `(x, y)` for every target pixel, row-major over `(ny, nx)`.
fn pixel_map(
    source: &CoordinateSystem,
    target: &CoordinateSystem,
    shape: (usize, usize),
) -> Result<Vec<Option<(f64, f64)>>> {
    let (src, src_lon_first) = spatial_pair(source, "source cube")?;
    let (tgt, tgt_lon_first) = spatial_pair(target, "target coordinate system")?;
    if !tgt.is_invertible() {
        return Err(unsupported("target CD matrix is singular"));
    }
    if !src.is_invertible() {
        return Err(unsupported("source CD matrix is singular"));
    }
    let frame = |w: &CoordinateSystem, lon_first: bool| {
        let i = if lon_first { 0 } else { 1 };
        w.axes()[i].ctype.get(..2).unwrap_or("").to_string()
    };
    if frame(&src, src_lon_first) != frame(&tgt, tgt_lon_first) {
        return Err(unsupported(format!(
            "celestial frame conversion {} -> {} is not supported",
            src.axes()[0].ctype,
            tgt.axes()[0].ctype
        )));
    }

    let (ny, nx) = shape;
    let order = |a: f64, b: f64, lon_first: bool| if lon_first { [a, b] } else { [b, a] };
    Ok((0..ny * nx)
        .map(|i| {
            let (ty, tx) = ((i / nx) as f64, (i % nx) as f64);
            let w = tgt.pixel_to_world(&[tx, ty])?;
            let (lon, lat) = if tgt_lon_first { (w[0], w[1]) } else { (w[1], w[0]) };
            let p = src.world_to_pixel(&order(lon, lat, src_lon_first))?;
            Some((p[0], p[1]))
        })
        .collect())
}

/// Sample `plane` at fractional `(x, y)`; NaN off the grid or next to NaN data.
fn sample(plane: &Array2<f32>, x: f64, y: f64, method: Interpolation) -> f32 {
    let (ny, nx) = plane.dim();
    if ny == 0 || nx == 0 {
        return f32::NAN;
    }
    let (xmax, ymax) = ((nx - 1) as f64, (ny - 1) as f64);
    if !(x >= -EDGE_TOLERANCE && y >= -EDGE_TOLERANCE && x <= xmax + EDGE_TOLERANCE && y <= ymax + EDGE_TOLERANCE) {
        return f32::NAN;
    }
    let (x, y) = (x.clamp(0.0, xmax), y.clamp(0.0, ymax));
    match method {
        Interpolation::Nearest => plane[[y.round() as usize, x.round() as usize]],
        Interpolation::Bilinear => {
            let (x0, y0) = (x.floor() as usize, y.floor() as usize);
            let (x1, y1) = ((x0 + 1).min(nx - 1), (y0 + 1).min(ny - 1));
            let (fx, fy) = (x - x0 as f64, y - y0 as f64);
            let mut acc = 0.0f64;
            for (yy, wy) in [(y0, 1.0 - fy), (y1, fy)] {
                for (xx, wx) in [(x0, 1.0 - fx), (x1, fx)] {
                    let w = wx * wy;
                    if w == 0.0 {
                        continue;
                    }
                    let v = plane[[yy, xx]];
                    if !v.is_finite() {
                        return f32::NAN;
                    }
                    acc += w * v as f64;
                }
            }
            acc as f32
        }
    }
}

/// Output WCS: target celestial axes, source spectral axis.
fn output_wcs(source: &CoordinateSystem, target: &CoordinateSystem) -> Result<CoordinateSystem> {
    let spectral = source
        .spectral()
        .ok_or_else(|| CubeError::shape(Stage::Reproject, "source cube has no spectral axis"))?;
    let axes: Vec<WorldAxis> = vec![
        target.axes()[0].clone(),
        target.axes()[1].clone(),
        source.axes()[spectral.axis].clone(),
    ];
    let mut cd = DMatrix::<f64>::zeros(3, 3);
    for i in 0..2 {
        for j in 0..2 {
            cd[(i, j)] = target.cd()[(i, j)];
        }
    }
    cd[(2, 2)] = source.cd()[(spectral.axis, spectral.axis)];
    Ok(CoordinateSystem::new(axes, cd, spectral.rest)?.with_velocity_convention(spectral.convention))
}

/// Resample `cube` onto `target` (2 or 3 axes, celestial axes first) with
/// spatial shape `(ny, nx)`, bilinearly.
pub fn reproject(cube: &Cube, target: &CoordinateSystem, shape: (usize, usize)) -> Result<Cube> {
    reproject_with(cube, target, shape, &ReprojectConfig::default())
}

pub fn reproject_with(
    cube: &Cube,
    target: &CoordinateSystem,
    shape: (usize, usize),
    config: &ReprojectConfig,
) -> Result<Cube> {
    let (ny, nx) = shape;
    if ny == 0 || nx == 0 {
        return Err(CubeError::invalid(Stage::Reproject, format!("target shape {shape:?} is empty")));
    }
    let map = pixel_map(cube.wcs(), target, shape)?;
    let on_grid = map.iter().filter(|p| p.is_some()).count();
    info!(
        "Reprojecting {:?} cube onto {}x{} grid ({} of {} target pixels projectable)",
        cube.shape(),
        nx,
        ny,
        on_grid,
        map.len()
    );

    let planes = cube.scheduler().map(cube.n_channels(), |k| {
        let plane = cube.channel(k)?;
        Ok(Array2::from_shape_fn((ny, nx), |(y, x)| match map[y * nx + x] {
            Some((sx, sy)) => sample(&plane, sx, sy, config.interpolation),
            None => f32::NAN,
        }))
    })?;
    let mut data = Array3::<f32>::zeros((cube.n_channels(), ny, nx));
    for (mut dst, plane) in data.axis_iter_mut(Axis(0)).zip(planes) {
        dst.assign(&plane);
    }

    let wcs = output_wcs(cube.wcs(), target)?;
    debug!("Reprojected cube WCS: {:?}", wcs.axes());
    let mut out = Cube::from_array(data, wcs)?
        .with_unit(cube.unit())
        .with_scheduler(cube.scheduler());
    if let Some(beam) = cube.beam() {
        out = out.with_beam(beam);
    }
    Ok(out)
}

// ── Target headers ──────────────────────────────────────────────────────────

/// Keywords a target header must carry for the spatial axes.
const REQUIRED_2D: &[&str] = &[
    "NAXIS", "NAXIS1", "NAXIS2", "CD1_1", "CD1_2", "CD2_1", "CD2_2", "CRPIX1", "CRPIX2",
];
/// Additional keywords when the header describes a cube.
const REQUIRED_3D: &[&str] = &["NAXIS3", "CD3_3", "CRPIX3"];

/// Validate a synthetic target header and parse it.
///
/// Returns the coordinate system and the spatial shape `(ny, nx)`.
pub fn parse_target(header: &Header) -> Result<(CoordinateSystem, (usize, usize))> {
    let naxis = header
        .get_i64("NAXIS")
        .ok_or_else(|| CubeError::format(Stage::Reproject, "target header missing NAXIS"))?;
    let extra: &[&str] = if naxis >= 3 { REQUIRED_3D } else { &[] };
    for key in REQUIRED_2D.iter().chain(extra) {
        if !header.contains(key) {
            return Err(CubeError::format(
                Stage::Reproject,
                format!("target header missing {key}"),
            ));
        }
    }
    let nx = header.require_i64("NAXIS1")?.max(0) as usize;
    let ny = header.require_i64("NAXIS2")?.max(0) as usize;
    let wcs = CoordinateSystem::from_header(header)?;
    Ok((wcs, (ny, nx)))
}

/// Builder for a synthetic target header modelled on an existing cube.
///
/// The cube supplies axis types, units, reference values and the spectral
/// axis. The spatial grid (shape, reference pixel, pixel size and rotation)
/// must be set before [`TargetHeader::build`] succeeds.
#[derive(Debug, Clone)]
pub struct TargetHeader {
    header: Header,
}

impl TargetHeader {
    pub fn like(cube: &Cube) -> Self {
        let mut header = cube.wcs().to_header();
        for key in ["CD1_1", "CD1_2", "CD2_1", "CD2_2", "CRPIX1", "CRPIX2"] {
            header.remove(key);
        }
        header.set("NAXIS", 3_i64);
        header.set("NAXIS3", cube.n_channels());
        Self { header }
    }

    /// Spatial size in pixels.
    pub fn shape(mut self, nx: usize, ny: usize) -> Self {
        self.header.set("NAXIS1", nx);
        self.header.set("NAXIS2", ny);
        self
    }

    /// Reference world position (CRVAL1, CRVAL2) in degrees.
    pub fn reference(mut self, crval1: f64, crval2: f64) -> Self {
        self.header.set("CRVAL1", crval1);
        self.header.set("CRVAL2", crval2);
        self
    }

    /// Reference pixel in the FITS 1-based convention.
    pub fn reference_pixel(mut self, crpix1: f64, crpix2: f64) -> Self {
        self.header.set("CRPIX1", crpix1);
        self.header.set("CRPIX2", crpix2);
        self
    }

    /// Put the reference pixel at the grid center; call after [`Self::shape`].
    pub fn centered(self) -> Self {
        let nx = self.header.get_f64("NAXIS1");
        let ny = self.header.get_f64("NAXIS2");
        match (nx, ny) {
            (Some(nx), Some(ny)) => self.reference_pixel((nx + 1.0) / 2.0, (ny + 1.0) / 2.0),
            _ => self,
        }
    }

    /// Square pixels of `pixel_scale_deg`, rotated by `rotation_deg` (the
    /// CROTA2 sense, east to the left).
    pub fn pixel_grid(mut self, pixel_scale_deg: f64, rotation_deg: f64) -> Self {
        let (s, c) = rotation_deg.to_radians().sin_cos();
        let p = pixel_scale_deg;
        self.header.set("CD1_1", -p * c);
        self.header.set("CD1_2", -p * s);
        self.header.set("CD2_1", -p * s);
        self.header.set("CD2_2", p * c);
        self
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn into_header(self) -> Header {
        self.header
    }

    /// Target coordinate system and spatial shape `(ny, nx)`.
    pub fn build(&self) -> Result<(CoordinateSystem, (usize, usize))> {
        parse_target(&self.header)
    }
}
