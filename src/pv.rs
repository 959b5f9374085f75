//! Position-velocity diagrams.
//!
//! [`extract`] samples a path across the spatial plane and, for every channel,
//! averages the cube over each sample's footprint. Only the spatial window
//! spanned by the footprints is read from each channel.

use std::ops::Range;

use nalgebra::DMatrix;
use ndarray::Array2;
use tracing::{debug, info, warn};

use crate::cube::Cube;
use crate::error::{CubeError, Result, Stage};
use crate::path::{self, Path, Sample};
use crate::product::Image2d;
use crate::wcs::{angular_separation, CoordinateSystem, WorldAxis};

/// A PV diagram with the samples it was built from.
#[derive(Debug, Clone)]
pub struct PvDiagram {
    /// Data shaped `(n_channels, n_samples)`; column `j` is sample `j`'s spectrum.
    pub image: Image2d,
    pub samples: Vec<Sample>,
    /// Offset of each sample from the path start, in `offset_unit`.
    pub offsets: Vec<f64>,
    /// `"deg"` for cubes with celestial axes, otherwise `"pix"`.
    pub offset_unit: &'static str,
}

/// Arc length per pixel of path, segment by segment.
fn segment_scales(path: &Path, wcs: &CoordinateSystem) -> Option<Vec<f64>> {
    let cel = wcs.celestial()?;
    let sub = wcs.celestial_wcs()?;
    let to_world = |[x, y]: [f64; 2]| {
        let p = if cel.lon < cel.lat { [x, y] } else { [y, x] };
        sub.pixel_to_world(&p)
            .map(|w| (w[0].to_radians(), w[1].to_radians()))
    };
    path.waypoints()
        .windows(2)
        .map(|w| {
            let (lon0, lat0) = to_world(w[0])?;
            let (lon1, lat1) = to_world(w[1])?;
            let pix = (w[1][0] - w[0][0]).hypot(w[1][1] - w[0][1]);
            let deg = angular_separation(lon0, lat0, lon1, lat1).to_degrees();
            Some(if pix > 0.0 { deg / pix } else { 0.0 })
        })
        .collect()
}

/// Spatial window covering every in-bounds footprint pixel, in view coordinates.
fn footprint_window(samples: &[Sample], origin: (i64, i64), ny: usize, nx: usize) -> Option<(Range<usize>, Range<usize>)> {
    let (y0, x0) = origin;
    let mut rows: Option<Range<usize>> = None;
    let mut cols: Option<Range<usize>> = None;
    for &(x, y) in samples.iter().flat_map(|s| s.footprint.iter()) {
        let (x, y) = (x - x0, y - y0);
        if x < 0 || y < 0 || x >= nx as i64 || y >= ny as i64 {
            continue;
        }
        let (x, y) = (x as usize, y as usize);
        rows = Some(match rows {
            Some(r) => r.start.min(y)..r.end.max(y + 1),
            None => y..y + 1,
        });
        cols = Some(match cols {
            Some(c) => c.start.min(x)..c.end.max(x + 1),
            None => x..x + 1,
        });
    }
    Some((rows?, cols?))
}

/// Extract a PV diagram along `path`, sampling every `spacing` pixels.
///
/// Pixel-frame paths use the pixel grid of the cube's backing data (the same
/// convention as regions); sky paths are converted with the cube's WCS.
pub fn extract(cube: &Cube, path: &Path, spacing: f64) -> Result<PvDiagram> {
    if path.waypoints().len() < 2 {
        return Err(CubeError::EmptyPath {
            stage: Stage::Extraction,
            waypoints: path.waypoints().len(),
        });
    }
    let root = cube.root_wcs();
    let pixel_path = path.to_pixel(&root)?;
    let samples = path::sample(&pixel_path, spacing)?;
    let (nc, ny, nx) = cube.shape();
    let (_, wy, wx) = cube.window().origin();
    let origin = (wy as i64, wx as i64);

    // Physical offsets
    let lengths: Vec<f64> = pixel_path
        .waypoints()
        .windows(2)
        .map(|w| (w[1][0] - w[0][0]).hypot(w[1][1] - w[0][1]))
        .collect();
    let (offsets, offset_unit, scale) = match segment_scales(&pixel_path, &root) {
        Some(scales) => {
            let mut starts = Vec::with_capacity(lengths.len());
            let (mut pix, mut deg) = (0.0, 0.0);
            for (len, s) in lengths.iter().zip(&scales) {
                starts.push((pix, deg));
                pix += len;
                deg += len * s;
            }
            let offsets = samples
                .iter()
                .map(|s| {
                    let (p0, d0) = starts[s.segment];
                    d0 + (s.offset - p0) * scales[s.segment]
                })
                .collect();
            (offsets, "deg", if pix > 0.0 { deg / pix } else { 1.0 })
        }
        None => (samples.iter().map(|s| s.offset).collect(), "pix", 1.0),
    };

    info!(
        "Extracting PV diagram: {} samples x {} channels, width {} px",
        samples.len(),
        nc,
        path.width()
    );

    let mut data = Array2::<f32>::from_elem((nc, samples.len()), f32::NAN);
    match footprint_window(&samples, origin, ny, nx) {
        None => warn!("PV path footprints fall entirely outside the cube"),
        Some((rows, cols)) => {
            debug!("PV read window rows {:?} cols {:?}", rows, cols);
            let (r0, c0) = (rows.start as i64, cols.start as i64);
            let (nr, ncol) = (rows.len() as i64, cols.len() as i64);
            let spectra = cube.scheduler().map(nc, |k| {
                let plane = cube.channel_window(k, rows.clone(), cols.clone())?;
                Ok(samples
                    .iter()
                    .map(|s| {
                        let (sum, n) = s
                            .footprint
                            .iter()
                            .filter_map(|&(x, y)| {
                                let (i, j) = (y - origin.0 - r0, x - origin.1 - c0);
                                (i >= 0 && j >= 0 && i < nr && j < ncol)
                                    .then(|| plane[[i as usize, j as usize]])
                            })
                            .filter(|v| v.is_finite())
                            .fold((0.0f64, 0usize), |(acc, n), v| (acc + v as f64, n + 1));
                        if n == 0 {
                            f32::NAN
                        } else {
                            (sum / n as f64) as f32
                        }
                    })
                    .collect::<Vec<f32>>())
            })?;
            for (k, row) in spectra.into_iter().enumerate() {
                for (j, v) in row.into_iter().enumerate() {
                    data[[k, j]] = v;
                }
            }
        }
    }

    let wcs = pv_wcs(cube.wcs(), spacing * scale, offset_unit)?;
    let image = Image2d::new(data, wcs, cube.unit())?.with_beam(cube.beam());
    Ok(PvDiagram {
        image,
        samples,
        offsets,
        offset_unit,
    })
}

/// Two-axis WCS: linear OFFSET along columns, the cube's spectral axis along rows.
fn pv_wcs(cube_wcs: &CoordinateSystem, offset_step: f64, offset_unit: &str) -> Result<CoordinateSystem> {
    let spectral = cube_wcs.spectral().ok_or_else(|| {
        CubeError::shape(Stage::Extraction, "cube has no spectral axis")
    })?;
    let axes = vec![
        WorldAxis::new("OFFSET", offset_unit, 1.0, 0.0),
        cube_wcs.axes()[spectral.axis].clone(),
    ];
    let mut cd = DMatrix::<f64>::zeros(2, 2);
    cd[(0, 0)] = offset_step;
    cd[(1, 1)] = cube_wcs.cd()[(spectral.axis, spectral.axis)];
    Ok(CoordinateSystem::new(axes, cd, spectral.rest)?.with_velocity_convention(spectral.convention))
}
