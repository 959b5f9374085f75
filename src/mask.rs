//! Boolean inclusion masks over a cube.
//!
//! A [`CubeMask`] is a conjunction of up to four components:
//!
//! - a per-channel mask (velocity ranges),
//! - a per-pixel spatial mask (ellipses, boxes, polygons),
//! - a full voxel mask,
//! - an intensity threshold.
//!
//! The first three are *static*: they are known without touching data and
//! define the bounding box a sub-cube can be trimmed to. The threshold is
//! evaluated against channel values when a channel is read, so applying it
//! never forces a read.

use ndarray::{s, Array2, Array3, Axis, Zip};

use crate::cube::Window;
use crate::error::{CubeError, Result, Stage};

#[derive(Debug, Clone, PartialEq)]
pub struct CubeMask {
    shape: (usize, usize, usize),
    spectral: Option<Vec<bool>>,
    spatial: Option<Array2<bool>>,
    voxels: Option<Array3<bool>>,
    threshold: Option<f32>,
}

fn and_opt<T, F>(a: &Option<T>, b: &Option<T>, f: F) -> Option<T>
where
    T: Clone,
    F: FnOnce(&T, &T) -> T,
{
    match (a, b) {
        (Some(a), Some(b)) => Some(f(a, b)),
        (Some(v), None) | (None, Some(v)) => Some(v.clone()),
        (None, None) => None,
    }
}

/// Index range spanning every `true` in `flags`.
fn true_span(flags: impl Iterator<Item = bool>) -> Option<std::ops::Range<usize>> {
    let mut lo = None;
    let mut hi = 0;
    for (i, f) in flags.enumerate() {
        if f {
            lo.get_or_insert(i);
            hi = i + 1;
        }
    }
    lo.map(|lo| lo..hi)
}

fn intersect(a: std::ops::Range<usize>, b: std::ops::Range<usize>) -> std::ops::Range<usize> {
    let start = a.start.max(b.start);
    start..a.end.min(b.end).max(start)
}

impl CubeMask {
    /// Mask that includes every voxel.
    pub fn all(shape: (usize, usize, usize)) -> Self {
        Self {
            shape,
            spectral: None,
            spatial: None,
            voxels: None,
            threshold: None,
        }
    }

    /// Per-channel inclusion flags.
    pub fn from_spectral(shape: (usize, usize, usize), channels: Vec<bool>) -> Result<Self> {
        if channels.len() != shape.0 {
            return Err(CubeError::shape(
                Stage::MaskBuild,
                format!("spectral mask has {} channels, cube has {}", channels.len(), shape.0),
            ));
        }
        Ok(Self {
            spectral: Some(channels),
            ..Self::all(shape)
        })
    }

    /// Per-pixel inclusion flags shared by every channel, indexed `(y, x)`.
    pub fn from_spatial(shape: (usize, usize, usize), pixels: Array2<bool>) -> Result<Self> {
        if pixels.dim() != (shape.1, shape.2) {
            return Err(CubeError::shape(
                Stage::MaskBuild,
                format!(
                    "spatial mask is {:?}, cube plane is {:?}",
                    pixels.dim(),
                    (shape.1, shape.2)
                ),
            ));
        }
        Ok(Self {
            spatial: Some(pixels),
            ..Self::all(shape)
        })
    }

    /// Arbitrary voxel mask, indexed `(spectral, y, x)`.
    pub fn from_voxels(voxels: Array3<bool>) -> Self {
        let shape = voxels.dim();
        Self {
            voxels: Some(voxels),
            ..Self::all(shape)
        }
    }

    /// Include only voxels whose value is strictly greater than `threshold`.
    pub fn from_threshold(shape: (usize, usize, usize), threshold: f32) -> Result<Self> {
        if threshold.is_nan() {
            return Err(CubeError::invalid(Stage::MaskBuild, "threshold is NaN"));
        }
        Ok(Self {
            threshold: Some(threshold),
            ..Self::all(shape)
        })
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    pub fn threshold(&self) -> Option<f32> {
        self.threshold
    }

    /// True when the mask includes every voxel.
    pub fn is_trivial(&self) -> bool {
        self.spectral.is_none() && self.spatial.is_none() && self.voxels.is_none() && self.threshold.is_none()
    }

    /// Logical AND with another mask of the same shape.
    ///
    /// Commutative and associative; AND-ing a mask with itself returns it unchanged.
    pub fn and(&self, other: &CubeMask) -> Result<CubeMask> {
        if self.shape != other.shape {
            return Err(CubeError::shape(
                Stage::MaskBuild,
                format!("cannot combine masks of shape {:?} and {:?}", self.shape, other.shape),
            ));
        }
        Ok(CubeMask {
            shape: self.shape,
            spectral: and_opt(&self.spectral, &other.spectral, |a, b| {
                a.iter().zip(b).map(|(x, y)| *x && *y).collect()
            }),
            spatial: and_opt(&self.spatial, &other.spatial, |a, b| {
                Zip::from(a).and(b).map_collect(|x, y| *x && *y)
            }),
            voxels: and_opt(&self.voxels, &other.voxels, |a, b| {
                Zip::from(a).and(b).map_collect(|x, y| *x && *y)
            }),
            threshold: and_opt(&self.threshold, &other.threshold, |a, b| a.max(*b)),
        })
    }

    /// Whether the static components alone include voxel `(k, y, x)`.
    pub fn includes_static(&self, k: usize, y: usize, x: usize) -> bool {
        self.spectral.as_ref().is_none_or(|s| s[k])
            && self.spatial.as_ref().is_none_or(|s| s[[y, x]])
            && self.voxels.as_ref().is_none_or(|v| v[[k, y, x]])
    }

    /// Whether channel `k` can contain any included voxel.
    pub fn channel_selected(&self, k: usize) -> bool {
        self.spectral.as_ref().is_none_or(|s| s[k])
    }

    /// Smallest window containing every statically included voxel, or `None`
    /// when the static components select nothing.
    pub fn bounding_box(&self) -> Option<Window> {
        let (nc, ny, nx) = self.shape;
        let mut channels = 0..nc;
        let mut rows = 0..ny;
        let mut cols = 0..nx;

        if let Some(spectral) = &self.spectral {
            channels = true_span(spectral.iter().copied())?;
        }
        if let Some(sp) = &self.spatial {
            rows = intersect(rows, true_span(sp.outer_iter().map(|r| r.iter().any(|&v| v)))?);
            cols = intersect(cols, true_span(sp.columns().into_iter().map(|c| c.iter().any(|&v| v)))?);
        }
        if let Some(vox) = &self.voxels {
            let span = |axis: usize, n: usize| {
                true_span((0..n).map(|i| vox.index_axis(Axis(axis), i).iter().any(|&v| v)))
            };
            channels = intersect(channels, span(0, nc)?);
            rows = intersect(rows, span(1, ny)?);
            cols = intersect(cols, span(2, nx)?);
        }
        if channels.is_empty() || rows.is_empty() || cols.is_empty() {
            return None;
        }

        let window = Window { channels, rows, cols };
        // Separable spans can overlap without a common voxel
        let any = window.channels.clone().any(|k| {
            window
                .rows
                .clone()
                .any(|y| window.cols.clone().any(|x| self.includes_static(k, y, x)))
        });
        any.then_some(window)
    }

    /// True when no voxel can pass the static components.
    pub fn is_static_empty(&self) -> bool {
        self.bounding_box().is_none()
    }

    /// Restrict the mask to `window` (relative to this mask's shape).
    pub fn slice(&self, window: &Window) -> CubeMask {
        let (c, r, x) = (window.channels.clone(), window.rows.clone(), window.cols.clone());
        CubeMask {
            shape: window.shape(),
            spectral: self.spectral.as_ref().map(|s| s[c.clone()].to_vec()),
            spatial: self
                .spatial
                .as_ref()
                .map(|s| s.slice(s![r.clone(), x.clone()]).to_owned()),
            voxels: self.voxels.as_ref().map(|v| v.slice(s![c, r, x]).to_owned()),
            threshold: self.threshold,
        }
    }

    /// Inclusion flags for a window of channel `k` whose top-left pixel is
    /// `(row0, col0)`, given the window's data values.
    pub fn evaluate(&self, k: usize, row0: usize, col0: usize, values: &Array2<f32>) -> Array2<bool> {
        let (nr, nc) = values.dim();
        if !self.channel_selected(k) {
            return Array2::from_elem((nr, nc), false);
        }
        Array2::from_shape_fn((nr, nc), |(i, j)| {
            let (y, x) = (row0 + i, col0 + j);
            let v = values[[i, j]];
            self.spatial.as_ref().is_none_or(|s| s[[y, x]])
                && self.voxels.as_ref().is_none_or(|m| m[[k, y, x]])
                && self.threshold.is_none_or(|t| v > t)
        })
    }

    /// Set excluded values of a channel window to NaN in place.
    pub fn apply_window(&self, k: usize, row0: usize, col0: usize, values: &mut Array2<f32>) {
        if self.is_trivial() {
            return;
        }
        let keep = self.evaluate(k, row0, col0, values);
        Zip::from(values).and(&keep).for_each(|v, &keep| {
            if !keep {
                *v = f32::NAN;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_is_commutative_and_idempotent() {
        let shape = (3, 4, 4);
        let a = CubeMask::from_spectral(shape, vec![true, false, true]).unwrap();
        let b = CubeMask::from_spatial(shape, Array2::from_shape_fn((4, 4), |(y, x)| x >= y)).unwrap();
        let t = CubeMask::from_threshold(shape, 1.0).unwrap();

        let ab = a.and(&b).unwrap();
        assert_eq!(ab, b.and(&a).unwrap());
        assert_eq!(ab.and(&t).unwrap(), a.and(&b.and(&t).unwrap()).unwrap());
        assert_eq!(ab.and(&ab).unwrap(), ab);
    }

    #[test]
    fn test_shape_mismatch() {
        let a = CubeMask::all((2, 3, 3));
        let b = CubeMask::all((2, 3, 4));
        assert!(matches!(a.and(&b), Err(CubeError::ShapeMismatch { .. })));
        assert!(CubeMask::from_spectral((2, 3, 3), vec![true]).is_err());
    }

    #[test]
    fn test_bounding_box() {
        let shape = (5, 6, 7);
        let spectral = CubeMask::from_spectral(shape, vec![false, true, true, false, false]).unwrap();
        let mut px = Array2::from_elem((6, 7), false);
        px[[2, 3]] = true;
        px[[4, 5]] = true;
        let sp = CubeMask::from_spatial(shape, px).unwrap();
        let bb = spectral.and(&sp).unwrap().bounding_box().unwrap();
        assert_eq!(bb, Window { channels: 1..3, rows: 2..5, cols: 3..6 });

        let none = CubeMask::from_spectral(shape, vec![false; 5]).unwrap();
        assert!(none.is_static_empty());
        assert_eq!(CubeMask::all(shape).bounding_box(), Some(Window::full(shape)));
    }

    #[test]
    fn test_threshold_excludes_nan_and_equal() {
        let m = CubeMask::from_threshold((1, 1, 4), 2.0).unwrap();
        let mut v = Array2::from_shape_vec((1, 4), vec![1.0, 2.0, 3.0, f32::NAN]).unwrap();
        let keep = m.evaluate(0, 0, 0, &v);
        assert_eq!(keep.iter().copied().collect::<Vec<_>>(), vec![false, false, true, false]);
        m.apply_window(0, 0, 0, &mut v);
        assert!(v[[0, 0]].is_nan() && v[[0, 1]].is_nan() && v[[0, 2]] == 3.0);
    }

    #[test]
    fn test_slice_preserves_membership() {
        let shape = (2, 4, 4);
        let m = CubeMask::from_spatial(shape, Array2::from_shape_fn((4, 4), |(y, x)| (x + y) % 2 == 0))
            .unwrap();
        let w = Window { channels: 1..2, rows: 1..3, cols: 2..4 };
        let sub = m.slice(&w);
        assert_eq!(sub.shape(), (1, 2, 2));
        for y in 0..2 {
            for x in 0..2 {
                assert_eq!(sub.includes_static(0, y, x), m.includes_static(1, y + 1, x + 2));
            }
        }
    }
}
