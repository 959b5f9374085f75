//! Polyline paths and uniform arc-length sampling.
//!
//! A [`Path`] is an ordered list of waypoints plus a perpendicular averaging
//! width in pixels. [`sample`] walks the straight segments between waypoints
//! and places a [`Sample`] every `spacing` pixels, starting at the first
//! waypoint. Directions are piecewise constant: a sample that falls exactly on
//! a vertex takes the direction of the segment arriving at it.

use crate::error::{CubeError, Result, Stage};
use crate::region::sky_to_pixel;
use crate::wcs::CoordinateSystem;

/// Slack for floating-point accumulation when deciding whether the final
/// multiple of `spacing` still lies on the path.
const END_TOLERANCE: f64 = 1e-9;

/// Coordinate frame of path waypoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathFrame {
    /// `(x, y)` 0-based pixel coordinates.
    Pixel,
    /// `(lon, lat)` in degrees.
    Sky,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    frame: PathFrame,
    waypoints: Vec<[f64; 2]>,
    /// Perpendicular footprint length in pixels; 0 samples a single pixel.
    width: f64,
}

impl Path {
    pub fn pixel(waypoints: Vec<[f64; 2]>, width: f64) -> Self {
        Self {
            frame: PathFrame::Pixel,
            waypoints,
            width,
        }
    }

    /// Path through sky positions (degrees). The width stays in pixels.
    pub fn sky(waypoints: Vec<[f64; 2]>, width: f64) -> Self {
        Self {
            frame: PathFrame::Sky,
            waypoints,
            width,
        }
    }

    pub fn frame(&self) -> PathFrame {
        self.frame
    }

    pub fn waypoints(&self) -> &[[f64; 2]] {
        &self.waypoints
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    /// The same path expressed in the pixel frame of `wcs`.
    pub fn to_pixel(&self, wcs: &CoordinateSystem) -> Result<Path> {
        match self.frame {
            PathFrame::Pixel => Ok(self.clone()),
            PathFrame::Sky => {
                let waypoints = self
                    .waypoints
                    .iter()
                    .map(|&[lon, lat]| sky_to_pixel(wcs, lon, lat, Stage::Extraction).map(|(x, y)| [x, y]))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Path::pixel(waypoints, self.width))
            }
        }
    }

    /// Segment lengths in pixels.
    fn segment_lengths(&self) -> Vec<f64> {
        self.waypoints
            .windows(2)
            .map(|w| (w[1][0] - w[0][0]).hypot(w[1][1] - w[0][1]))
            .collect()
    }

    /// Total arc length in pixels.
    pub fn length(&self) -> f64 {
        self.segment_lengths().iter().sum()
    }
}

/// One sampling position along a path.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Arc length from the first waypoint, in pixels.
    pub offset: f64,
    /// Index of the segment the sample lies on.
    pub segment: usize,
    /// Sample center `(x, y)`.
    pub center: [f64; 2],
    /// Unit direction of travel `(dx, dy)`.
    pub direction: [f64; 2],
    /// Contributing pixels `(x, y)`, possibly outside the image.
    pub footprint: Vec<(i64, i64)>,
}

fn nearest_pixel(x: f64, y: f64) -> (i64, i64) {
    (x.round() as i64, y.round() as i64)
}

/// Pixels of a perpendicular segment of length `width` through `center`.
fn footprint(center: [f64; 2], direction: [f64; 2], width: f64) -> Vec<(i64, i64)> {
    if width == 0.0 {
        return vec![nearest_pixel(center[0], center[1])];
    }
    let normal = [-direction[1], direction[0]];
    let n = width.floor() as usize + 1;
    let mut pixels: Vec<(i64, i64)> = Vec::with_capacity(n);
    for i in 0..n {
        let t = -width / 2.0 + width * i as f64 / (n - 1).max(1) as f64;
        let p = nearest_pixel(center[0] + t * normal[0], center[1] + t * normal[1]);
        if !pixels.contains(&p) {
            pixels.push(p);
        }
    }
    pixels
}

/// Place samples every `spacing` pixels along a pixel-frame path.
pub fn sample(path: &Path, spacing: f64) -> Result<Vec<Sample>> {
    if path.waypoints.len() < 2 {
        return Err(CubeError::EmptyPath {
            stage: Stage::Extraction,
            waypoints: path.waypoints.len(),
        });
    }
    if path.frame != PathFrame::Pixel {
        return Err(CubeError::invalid(
            Stage::Extraction,
            "sky path must be converted with Path::to_pixel before sampling",
        ));
    }
    if !(spacing > 0.0 && spacing.is_finite()) {
        return Err(CubeError::invalid(
            Stage::Extraction,
            format!("spacing must be positive, got {spacing}"),
        ));
    }
    if !(path.width >= 0.0 && path.width.is_finite()) {
        return Err(CubeError::invalid(
            Stage::Extraction,
            format!("path width must be non-negative, got {}", path.width),
        ));
    }

    let lengths = path.segment_lengths();
    let total: f64 = lengths.iter().sum();
    if total <= 0.0 {
        return Err(CubeError::invalid(Stage::Extraction, "path has zero length"));
    }

    let n = (total / spacing + END_TOLERANCE).floor() as usize + 1;
    let mut samples = Vec::with_capacity(n);
    let mut seg = 0;
    let mut seg_start = 0.0;
    for j in 0..n {
        let offset = (j as f64 * spacing).min(total);
        // Advance while the sample lies strictly beyond the current segment's end
        while seg + 1 < lengths.len() && offset > seg_start + lengths[seg] + END_TOLERANCE {
            seg_start += lengths[seg];
            seg += 1;
        }
        // Zero-length segments carry no direction
        while seg + 1 < lengths.len() && lengths[seg] == 0.0 {
            seg += 1;
        }
        let [x0, y0] = path.waypoints[seg];
        let [x1, y1] = path.waypoints[seg + 1];
        let len = lengths[seg];
        let direction = [(x1 - x0) / len, (y1 - y0) / len];
        let t = (offset - seg_start).clamp(0.0, len);
        let center = [x0 + direction[0] * t, y0 + direction[1] * t];
        samples.push(Sample {
            offset,
            segment: seg,
            center,
            direction,
            footprint: footprint(center, direction, path.width),
        });
    }
    Ok(samples)
}
