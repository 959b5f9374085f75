//! Spectral moments and quicklook reductions.
//!
//! Moments collapse the spectral axis pixel by pixel:
//!
//! ```text
//! M0 = Σ I·Δv
//! M1 = Σ I·v·Δv / M0
//! M2 = Σ I·(v − M1)²·Δv / M0
//! ```
//!
//! Channels are read in small batches through the cube's scheduler and folded
//! into running sums in channel order, so memory stays bounded and results do
//! not depend on the scheduler.

use ndarray::{Array2, Zip};
use tracing::{debug, info};

use crate::cube::Cube;
use crate::error::{CubeError, Result, Stage};
use crate::product::Image2d;
use crate::wcs::SpectralUnit;

/// Channels read per scheduler batch.
const BATCH: usize = 16;

/// Half-open spectral interval `[lo, hi)` in `unit`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralRange {
    pub lo: f64,
    pub hi: f64,
    pub unit: SpectralUnit,
}

impl SpectralRange {
    pub fn new(lo: f64, hi: f64, unit: SpectralUnit) -> Self {
        Self { lo, hi, unit }
    }

    /// Every channel, with values expressed in `unit`.
    pub fn all(unit: SpectralUnit) -> Self {
        Self::new(f64::NEG_INFINITY, f64::INFINITY, unit)
    }

    pub fn contains(&self, v: f64) -> bool {
        v >= self.lo && v < self.hi
    }
}

/// Feed masked planes of `channels` to `f` in channel order.
fn fold_planes<F>(cube: &Cube, channels: &[usize], mut f: F) -> Result<()>
where
    F: FnMut(usize, &Array2<f32>),
{
    for batch in channels.chunks(BATCH) {
        let planes = cube.scheduler().map(batch.len(), |i| cube.channel(batch[i]))?;
        for (&k, plane) in batch.iter().zip(&planes) {
            f(k, plane);
        }
    }
    Ok(())
}

/// Channels inside `range` that the mask does not exclude outright.
fn selected_channels(cube: &Cube, range: &SpectralRange) -> Result<(Vec<usize>, Vec<f64>, Vec<f64>)> {
    if range.lo.is_nan() || range.hi.is_nan() {
        return Err(CubeError::invalid(Stage::Moment, "spectral range bound is NaN"));
    }
    let values = cube.spectral_axis(range.unit)?;
    let widths = cube.channel_widths(range.unit)?;
    let channels: Vec<usize> = (0..cube.n_channels())
        .filter(|&k| range.contains(values[k]) && cube.mask().channel_selected(k))
        .collect();
    debug!(
        "Spectral range [{}, {}) {} selects {} of {} channels",
        range.lo,
        range.hi,
        range.unit,
        channels.len(),
        cube.n_channels()
    );
    Ok((channels, values, widths))
}

fn spatial_wcs_image(cube: &Cube, data: Array2<f32>, unit: String) -> Result<Image2d> {
    let wcs = cube.wcs().sub(&[0, 1])?;
    Ok(Image2d::new(data, wcs, unit)?.with_beam(cube.beam()))
}

fn joined_unit(a: &str, b: &str) -> String {
    format!("{a} {b}").trim().to_string()
}

/// Moment map of `order` 0, 1 or 2 over the channels in `range`.
///
/// Masked and NaN voxels are skipped. A pixel with no valid channel is NaN;
/// orders 1 and 2 are also NaN where the order-0 sum is zero.
pub fn moment(cube: &Cube, order: u8, range: SpectralRange) -> Result<Image2d> {
    if order > 2 {
        return Err(CubeError::invalid(
            Stage::Moment,
            format!("moment order must be 0, 1 or 2, got {order}"),
        ));
    }
    let (channels, values, widths) = selected_channels(cube, &range)?;
    let (_, ny, nx) = cube.shape();
    info!("Computing moment {} over {} channels", order, channels.len());

    // Offsetting by a reference value keeps the second moment well conditioned
    let vref = if channels.is_empty() {
        0.0
    } else {
        channels.iter().map(|&k| values[k]).sum::<f64>() / channels.len() as f64
    };
    let mut s0 = Array2::<f64>::zeros((ny, nx));
    let mut s1 = Array2::<f64>::zeros((ny, nx));
    let mut s2 = Array2::<f64>::zeros((ny, nx));
    let mut count = Array2::<u32>::zeros((ny, nx));
    fold_planes(cube, &channels, |k, plane| {
        let dv = widths[k];
        let v = values[k] - vref;
        Zip::from(&mut s0)
            .and(&mut s1)
            .and(&mut s2)
            .and(&mut count)
            .and(plane)
            .for_each(|s0, s1, s2, n, &i| {
                if i.is_finite() {
                    let w = i as f64 * dv;
                    *s0 += w;
                    *s1 += w * v;
                    *s2 += w * v * v;
                    *n += 1;
                }
            });
    })?;

    let data = Zip::from(&s0)
        .and(&s1)
        .and(&s2)
        .and(&count)
        .map_collect(|&s0, &s1, &s2, &n| {
            if n == 0 || (order > 0 && s0 == 0.0) {
                return f32::NAN;
            }
            let m1 = s1 / s0;
            (match order {
                0 => s0,
                1 => vref + m1,
                _ => s2 / s0 - m1 * m1,
            }) as f32
        });

    let unit = match order {
        0 => joined_unit(cube.unit(), &range.unit.to_string()),
        1 => range.unit.to_string(),
        _ => format!("({})^2", range.unit),
    };
    spatial_wcs_image(cube, data, unit)
}

/// Intensity-weighted velocity dispersion, sqrt of moment 2.
pub fn linewidth_sigma(cube: &Cube, range: SpectralRange) -> Result<Image2d> {
    let m2 = moment(cube, 2, range)?;
    let data = m2.data().mapv(|v| if v >= 0.0 { v.sqrt() } else { f32::NAN });
    spatial_wcs_image(cube, data, range.unit.to_string())
}

/// Gaussian-equivalent FWHM linewidth, `sqrt(8 ln 2)·σ`.
pub fn linewidth_fwhm(cube: &Cube, range: SpectralRange) -> Result<Image2d> {
    let factor = (8.0 * std::f64::consts::LN_2).sqrt() as f32;
    let sigma = linewidth_sigma(cube, range)?;
    let data = sigma.data().mapv(|v| v * factor);
    spatial_wcs_image(cube, data, range.unit.to_string())
}

/// Per-pixel maximum over the spectral axis, ignoring masked and NaN values.
pub fn max(cube: &Cube) -> Result<Image2d> {
    let (nc, ny, nx) = cube.shape();
    let channels: Vec<usize> = (0..nc).filter(|&k| cube.mask().channel_selected(k)).collect();
    let mut peak = Array2::<f32>::from_elem((ny, nx), f32::NAN);
    fold_planes(cube, &channels, |_, plane| {
        Zip::from(&mut peak).and(plane).for_each(|p, &v| {
            if v.is_finite() && !(*p >= v) {
                *p = v;
            }
        });
    })?;
    spatial_wcs_image(cube, peak, cube.unit().to_string())
}
