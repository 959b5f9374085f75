//! Declarative selections and their conversion to [`CubeMask`]s.
//!
//! Regions are value objects: they hold no cube data and can be converted
//! against any coordinate system. Shapes are given in pixel coordinates
//! (0-based, pixel centers at integers) or on the sky in degrees; rotation
//! angles are radians counter-clockwise from the +x pixel axis.

use ndarray::Array2;
use tracing::debug;

use crate::cube::Cube;
use crate::error::{CubeError, Result, Stage};
use crate::mask::CubeMask;
use crate::wcs::{CoordinateSystem, SpectralUnit};

/// A point in the spatial plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Position {
    Pixel { x: f64, y: f64 },
    /// Longitude/latitude in degrees.
    Sky { lon: f64, lat: f64 },
}

/// A spatial length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Length {
    Pixels(f64),
    Degrees(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Region {
    Ellipse {
        center: Position,
        semi_major: Length,
        semi_minor: Length,
        angle: f64,
    },
    /// Rotated rectangle with full `width` along the rotated x axis.
    Box {
        center: Position,
        width: Length,
        height: Length,
        angle: f64,
    },
    /// Closed polygon, even-odd rule on pixel centers.
    Polygon { vertices: Vec<Position> },
    /// Channels whose spectral value lies in `[min, max)`.
    VelocityRange { min: f64, max: f64, unit: SpectralUnit },
    /// Voxels with value strictly greater than the threshold.
    Threshold(f32),
    /// Logical AND of the members.
    Composite(Vec<Region>),
}

impl Region {
    pub fn pixel_ellipse(cx: f64, cy: f64, a: f64, b: f64, angle: f64) -> Self {
        Region::Ellipse {
            center: Position::Pixel { x: cx, y: cy },
            semi_major: Length::Pixels(a),
            semi_minor: Length::Pixels(b),
            angle,
        }
    }

    pub fn pixel_box(cx: f64, cy: f64, width: f64, height: f64, angle: f64) -> Self {
        Region::Box {
            center: Position::Pixel { x: cx, y: cy },
            width: Length::Pixels(width),
            height: Length::Pixels(height),
            angle,
        }
    }

    pub fn velocity_range(min: f64, max: f64, unit: SpectralUnit) -> Self {
        Region::VelocityRange { min, max, unit }
    }
}

/// Pixel coordinates `(x, y)` of a sky position.
pub(crate) fn sky_to_pixel(wcs: &CoordinateSystem, lon: f64, lat: f64, stage: Stage) -> Result<(f64, f64)> {
    let cel = wcs.celestial().ok_or_else(|| {
        CubeError::shape(stage, "sky coordinates given but the coordinate system has no celestial axes")
    })?;
    let sub = wcs
        .celestial_wcs()
        .ok_or_else(|| CubeError::shape(stage, "cannot isolate celestial axes"))?;
    let p = sub.world_to_pixel(&[lon, lat]).ok_or_else(|| {
        CubeError::invalid(stage, format!("sky position ({lon}, {lat}) cannot be projected"))
    })?;
    // `sub` orders axes (lon, lat); map back to array x/y
    if cel.lon < cel.lat {
        Ok((p[0], p[1]))
    } else {
        Ok((p[1], p[0]))
    }
}

fn resolve_position(p: &Position, wcs: &CoordinateSystem) -> Result<(f64, f64)> {
    match *p {
        Position::Pixel { x, y } => Ok((x, y)),
        Position::Sky { lon, lat } => sky_to_pixel(wcs, lon, lat, Stage::MaskBuild),
    }
}

fn resolve_length(l: &Length, wcs: &CoordinateSystem, what: &str) -> Result<f64> {
    let px = match *l {
        Length::Pixels(v) => v,
        Length::Degrees(d) => {
            let scale = wcs.pixel_scale_deg().ok_or_else(|| {
                CubeError::shape(
                    Stage::MaskBuild,
                    format!("{what} given in degrees but the coordinate system has no celestial axes"),
                )
            })?;
            d / scale
        }
    };
    if !(px > 0.0 && px.is_finite()) {
        return Err(CubeError::invalid(
            Stage::MaskBuild,
            format!("{what} must be positive, got {px} pixels"),
        ));
    }
    Ok(px)
}

/// Even-odd point-in-polygon test.
fn point_in_polygon(x: f64, y: f64, poly: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let mut j = poly.len() - 1;
    for i in 0..poly.len() {
        let (xi, yi) = poly[i];
        let (xj, yj) = poly[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Convert a region into a mask over a grid of `shape` described by `wcs`.
pub fn to_mask(region: &Region, wcs: &CoordinateSystem, shape: (usize, usize, usize)) -> Result<CubeMask> {
    to_mask_at(region, wcs, shape, (0, 0, 0))
}

/// Mask for `region` over a cube view.
///
/// Pixel coordinates refer to the grid of the cube's backing data, so the same
/// region selects the same voxels whether it is applied to a cube or to any
/// sub-cube cut from it.
pub fn mask_for_cube(region: &Region, cube: &Cube) -> Result<CubeMask> {
    to_mask_at(region, &cube.root_wcs(), cube.shape(), cube.window().origin())
}

/// Convert against a grid whose element `(0, 0, 0)` sits at `origin` of the
/// frame `wcs` describes.
fn to_mask_at(
    region: &Region,
    wcs: &CoordinateSystem,
    shape: (usize, usize, usize),
    origin: (usize, usize, usize),
) -> Result<CubeMask> {
    let (nc, ny, nx) = shape;
    let (k0, y0, x0) = origin;
    let spatial = |test: &dyn Fn(f64, f64) -> bool| -> Result<CubeMask> {
        let px = Array2::from_shape_fn((ny, nx), |(y, x)| test((x + x0) as f64, (y + y0) as f64));
        CubeMask::from_spatial(shape, px)
    };

    match region {
        Region::Ellipse {
            center,
            semi_major,
            semi_minor,
            angle,
        } => {
            let (cx, cy) = resolve_position(center, wcs)?;
            let a = resolve_length(semi_major, wcs, "ellipse semi-major axis")?;
            let b = resolve_length(semi_minor, wcs, "ellipse semi-minor axis")?;
            let (sin, cos) = angle.sin_cos();
            debug!("Ellipse mask: center=({cx:.2}, {cy:.2}) axes=({a:.2}, {b:.2}) px");
            spatial(&|x, y| {
                let (dx, dy) = (x - cx, y - cy);
                let u = (dx * cos + dy * sin) / a;
                let v = (-dx * sin + dy * cos) / b;
                u * u + v * v <= 1.0
            })
        }
        Region::Box {
            center,
            width,
            height,
            angle,
        } => {
            let (cx, cy) = resolve_position(center, wcs)?;
            let hw = resolve_length(width, wcs, "box width")? / 2.0;
            let hh = resolve_length(height, wcs, "box height")? / 2.0;
            let (sin, cos) = angle.sin_cos();
            spatial(&|x, y| {
                let (dx, dy) = (x - cx, y - cy);
                (dx * cos + dy * sin).abs() <= hw && (-dx * sin + dy * cos).abs() <= hh
            })
        }
        Region::Polygon { vertices } => {
            if vertices.len() < 3 {
                return Err(CubeError::invalid(
                    Stage::MaskBuild,
                    format!("polygon needs at least 3 vertices, got {}", vertices.len()),
                ));
            }
            let poly = vertices
                .iter()
                .map(|v| resolve_position(v, wcs))
                .collect::<Result<Vec<_>>>()?;
            spatial(&|x, y| point_in_polygon(x, y, &poly))
        }
        Region::VelocityRange { min, max, unit } => {
            if !(min < max) {
                return Err(CubeError::invalid(
                    Stage::MaskBuild,
                    format!("velocity range [{min}, {max}) {unit} is empty"),
                ));
            }
            if wcs.spectral().is_none() {
                return Err(CubeError::shape(
                    Stage::MaskBuild,
                    "velocity range given but the coordinate system has no spectral axis",
                ));
            }
            let channels = (0..nc)
                .map(|k| {
                    let v = wcs.spectral_value((k + k0) as f64, *unit)?;
                    Ok(v >= *min && v < *max)
                })
                .collect::<Result<Vec<_>>>()?;
            CubeMask::from_spectral(shape, channels)
        }
        Region::Threshold(t) => CubeMask::from_threshold(shape, *t),
        Region::Composite(members) => members.iter().try_fold(CubeMask::all(shape), |acc, r| {
            acc.and(&to_mask_at(r, wcs, shape, origin)?)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::tests::{test_cube, test_wcs};

    #[test]
    fn test_ellipse_membership() {
        let wcs = test_wcs(201, 201);
        let shape = (1, 201, 201);
        let m = to_mask(&Region::pixel_ellipse(100.0, 100.0, 50.0, 30.0, 0.0), &wcs, shape).unwrap();
        assert!(m.includes_static(0, 100, 100));
        assert!(!m.includes_static(0, 100, 151));
        assert!(m.includes_static(0, 100, 149));
        // Minor axis runs along y at angle 0
        assert!(m.includes_static(0, 130, 100));
        assert!(!m.includes_static(0, 131, 100));
    }

    #[test]
    fn test_rotated_box() {
        let wcs = test_wcs(21, 21);
        let r = Region::pixel_box(10.0, 10.0, 10.0, 2.0, std::f64::consts::FRAC_PI_2);
        let m = to_mask(&r, &wcs, (1, 21, 21)).unwrap();
        // Rotated 90°: long side along y
        assert!(m.includes_static(0, 14, 10));
        assert!(!m.includes_static(0, 10, 15));
    }

    #[test]
    fn test_polygon_even_odd() {
        let wcs = test_wcs(10, 10);
        let tri = Region::Polygon {
            vertices: vec![
                Position::Pixel { x: 0.5, y: 0.5 },
                Position::Pixel { x: 8.5, y: 0.5 },
                Position::Pixel { x: 0.5, y: 8.5 },
            ],
        };
        let m = to_mask(&tri, &wcs, (1, 10, 10)).unwrap();
        assert!(m.includes_static(0, 1, 1));
        assert!(!m.includes_static(0, 8, 8));
        assert!(!m.includes_static(0, 0, 0));
    }

    #[test]
    fn test_velocity_range_half_open() {
        let wcs = test_wcs(4, 4);
        // Channels at -5, -4, -3, -2, -1 km/s
        let r = Region::velocity_range(-4.0, -2.0, SpectralUnit::KilometersPerSecond);
        let m = to_mask(&r, &wcs, (5, 4, 4)).unwrap();
        let sel: Vec<bool> = (0..5).map(|k| m.channel_selected(k)).collect();
        assert_eq!(sel, vec![false, true, true, false, false]);
    }

    #[test]
    fn test_sky_ellipse_matches_pixel_ellipse() {
        let cube = test_cube(1, 41, 41);
        let wcs = cube.wcs().clone();
        let center = wcs.pixel_to_world(&[20.0, 20.0, 0.0]).unwrap();
        let sky = Region::Ellipse {
            center: Position::Sky { lon: center[0], lat: center[1] },
            semi_major: Length::Degrees(0.0105),
            semi_minor: Length::Degrees(0.0055),
            angle: 0.0,
        };
        let pix = Region::pixel_ellipse(20.0, 20.0, 10.5, 5.5, 0.0);
        assert_eq!(mask_for_cube(&sky, &cube).unwrap(), mask_for_cube(&pix, &cube).unwrap());
    }

    #[test]
    fn test_invalid_and_incompatible_regions() {
        let wcs = test_wcs(8, 8);
        let shape = (2, 8, 8);
        let bad = Region::pixel_ellipse(4.0, 4.0, 0.0, 2.0, 0.0);
        assert!(matches!(to_mask(&bad, &wcs, shape), Err(CubeError::InvalidArgument { .. })));

        let empty = Region::velocity_range(1.0, 1.0, SpectralUnit::KilometersPerSecond);
        assert!(matches!(to_mask(&empty, &wcs, shape), Err(CubeError::InvalidArgument { .. })));

        let cel = wcs.celestial_wcs().unwrap();
        let vel = Region::velocity_range(-1.0, 1.0, SpectralUnit::KilometersPerSecond);
        assert!(matches!(to_mask(&vel, &cel, shape), Err(CubeError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_composite_is_and_of_members() {
        let wcs = test_wcs(21, 21);
        let shape = (5, 21, 21);
        let ellipse = Region::pixel_ellipse(10.0, 10.0, 6.0, 3.0, 0.4);
        let slab = Region::velocity_range(-4.0, -2.0, SpectralUnit::KilometersPerSecond);
        let both = Region::Composite(vec![ellipse.clone(), slab.clone()]);

        let expected = to_mask(&ellipse, &wcs, shape)
            .unwrap()
            .and(&to_mask(&slab, &wcs, shape).unwrap())
            .unwrap();
        assert_eq!(to_mask(&both, &wcs, shape).unwrap(), expected);

        // Empty composite keeps everything
        assert!(to_mask(&Region::Composite(vec![]), &wcs, shape).unwrap().is_trivial());
    }

    #[test]
    fn test_composite_on_subcube_uses_root_grid() {
        let cube = test_cube(5, 21, 21);
        let sub = crate::subcube::apply_regions(
            &cube,
            &[
                Region::pixel_box(10.0, 10.0, 10.0, 8.0, 0.0),
                Region::velocity_range(-4.0, 0.0, SpectralUnit::KilometersPerSecond),
            ],
        )
        .unwrap();
        assert_eq!(sub.window().origin(), (1, 6, 5));

        let both = Region::Composite(vec![
            Region::pixel_ellipse(11.0, 9.0, 3.0, 2.0, 0.0),
            Region::velocity_range(-3.0, -1.0, SpectralUnit::KilometersPerSecond),
        ]);
        let on_sub = mask_for_cube(&both, &sub).unwrap();
        let on_root = mask_for_cube(&both, &cube).unwrap().slice(sub.window());
        assert_eq!(on_sub, on_root);

        // Channels at -4, -3, -2, -1 km/s inside the sub-cube
        let sel: Vec<bool> = (0..4).map(|k| on_sub.channel_selected(k)).collect();
        assert_eq!(sel, vec![false, true, true, false]);
        assert!(on_sub.includes_static(1, 9 - 6, 11 - 5));
        assert!(!on_sub.includes_static(1, 0, 0));
    }
}
