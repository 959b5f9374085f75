//! Masked, trimmed sub-cubes.
//!
//! [`apply`] never reads pixel data: it combines masks, computes the bounding
//! box of their static components and returns a narrower view on the same
//! backing store. Threshold components are carried along and evaluated when
//! channels are read.

use tracing::debug;

use crate::cube::Cube;
use crate::error::{CubeError, Result, Stage};
use crate::mask::CubeMask;
use crate::region::{self, Region};
use crate::wcs::SpectralUnit;

/// Restrict `cube` to the conjunction of its own mask and `masks`.
///
/// Every mask must have the cube's shape. The result is trimmed to the
/// bounding box of the combined static mask, so each output dimension is at
/// most the input's.
pub fn apply(cube: &Cube, masks: &[CubeMask]) -> Result<Cube> {
    let combined = masks
        .iter()
        .try_fold(cube.mask().clone(), |acc, m| {
            if m.shape() != cube.shape() {
                return Err(CubeError::shape(
                    Stage::MaskBuild,
                    format!("mask shape {:?} does not match cube shape {:?}", m.shape(), cube.shape()),
                ));
            }
            acc.and(m)
        })?;

    let bbox = combined.bounding_box().ok_or_else(|| {
        CubeError::invalid(
            Stage::MaskBuild,
            format!("masks select no voxels of cube with shape {:?}", cube.shape()),
        )
    })?;

    if bbox.shape() == cube.shape() {
        return Ok(cube.with_mask(combined));
    }
    debug!(
        "Trimmed cube {:?} -> {:?} (channels {:?}, rows {:?}, cols {:?})",
        cube.shape(),
        bbox.shape(),
        bbox.channels,
        bbox.rows,
        bbox.cols
    );
    let sliced = combined.slice(&bbox);
    Ok(cube.narrowed(&bbox, sliced))
}

/// Convert each region against the cube and [`apply`] them together.
pub fn apply_regions(cube: &Cube, regions: &[Region]) -> Result<Cube> {
    let masks = regions
        .iter()
        .map(|r| region::mask_for_cube(r, cube))
        .collect::<Result<Vec<_>>>()?;
    apply(cube, &masks)
}

/// Channels whose spectral value lies in `[lo, hi)` in `unit`.
pub fn spectral_slab(cube: &Cube, lo: f64, hi: f64, unit: SpectralUnit) -> Result<Cube> {
    apply_regions(cube, &[Region::velocity_range(lo, hi, unit)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::tests::test_cube;

    #[test]
    fn test_trim_to_ellipse_bbox() {
        let cube = test_cube(3, 20, 30);
        let sub = apply_regions(&cube, &[Region::pixel_ellipse(10.0, 8.0, 4.5, 2.5, 0.0)]).unwrap();
        assert_eq!(sub.shape(), (3, 5, 9));
        // Window starts at (y=6, x=6) in the parent
        assert_eq!(sub.raw_channel(1).unwrap()[[0, 0]], 166.0);
        // Corner of the bbox lies outside the ellipse
        assert!(sub.channel(1).unwrap()[[0, 0]].is_nan());
        assert_eq!(sub.channel(1).unwrap()[[2, 4]], 190.0);
    }

    #[test]
    fn test_output_never_larger_than_input() {
        let cube = test_cube(4, 10, 10);
        let sub = apply_regions(&cube, &[Region::Threshold(150.0)]).unwrap();
        assert_eq!(sub.shape(), cube.shape());
        let big = apply_regions(&cube, &[Region::pixel_box(5.0, 5.0, 100.0, 100.0, 0.0)]).unwrap();
        assert_eq!(big.shape(), cube.shape());
    }

    #[test]
    fn test_idempotent() {
        let cube = test_cube(5, 16, 16);
        let regions = [
            Region::pixel_ellipse(7.0, 9.0, 5.5, 3.5, 0.4),
            Region::velocity_range(-4.5, -1.5, SpectralUnit::KilometersPerSecond),
        ];
        let once = apply_regions(&cube, &regions).unwrap();
        let twice = apply_regions(&once, &regions).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.to_array().unwrap(), twice.to_array().unwrap());
    }

    #[test]
    fn test_empty_selection_is_invalid() {
        let cube = test_cube(2, 8, 8);
        let err = apply_regions(&cube, &[Region::pixel_ellipse(50.0, 50.0, 2.0, 2.0, 0.0)]).unwrap_err();
        assert!(matches!(err, CubeError::InvalidArgument { stage: Stage::MaskBuild, .. }));
    }

    #[test]
    fn test_wrong_mask_shape() {
        let cube = test_cube(2, 8, 8);
        let err = apply(&cube, &[CubeMask::all((2, 8, 9))]).unwrap_err();
        assert!(matches!(err, CubeError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_spectral_slab() {
        let cube = test_cube(5, 4, 4);
        let slab = spectral_slab(&cube, -3.5, -1.5, SpectralUnit::KilometersPerSecond).unwrap();
        assert_eq!(slab.shape(), (2, 4, 4));
        let v = slab.spectral_axis(SpectralUnit::KilometersPerSecond).unwrap();
        assert!((v[0] + 3.0).abs() < 1e-12 && (v[1] + 2.0).abs() < 1e-12);
    }
}
