//! FITS world coordinate systems.
//!
//! A [`CoordinateSystem`] maps 0-based array pixel indices to world coordinates
//! through the standard FITS-WCS pipeline:
//!
//! ```text
//! pixel index → +1 (FITS 1-based) → subtract CRPIX → CD matrix → intermediate
//!   celestial pair: intermediate (deg) → deproject about CRVAL → (lon, lat) deg
//!   other axes:     CRVAL + intermediate
//! ```
//!
//! The linear part is always stored as a full CD matrix. Headers using
//! `CDELTi` (with an optional `PCi_j` matrix or the legacy `CROTA2` rotation)
//! are converted on parse. Axis indices follow FITS order: axis 0 is NAXIS1
//! (array `x`), axis 1 is NAXIS2 (`y`), axis 2 is NAXIS3 (spectral for cubes).

pub mod projection;
pub mod spectral;

use nalgebra::DMatrix;
use tracing::debug;

use crate::error::{CubeError, Result, Stage};
use crate::fits::Header;
pub use projection::{angular_separation, Projection};
pub use spectral::{
    RestValue, SpectralDimension, SpectralKind, SpectralUnit, VelocityConvention, SPEED_OF_LIGHT,
};

/// Description of one world axis.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldAxis {
    pub ctype: String,
    pub cunit: String,
    /// Reference pixel, FITS 1-based convention.
    pub crpix: f64,
    pub crval: f64,
}

impl WorldAxis {
    pub fn new(ctype: &str, cunit: &str, crpix: f64, crval: f64) -> Self {
        Self {
            ctype: ctype.to_string(),
            cunit: cunit.to_string(),
            crpix,
            crval,
        }
    }
}

/// Indices of the longitude/latitude axis pair and their projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CelestialAxes {
    pub lon: usize,
    pub lat: usize,
    pub projection: Projection,
}

/// The spectral axis and what it measures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralAxis {
    pub axis: usize,
    pub kind: SpectralKind,
    /// Native unit of CRVAL/CD along this axis.
    pub unit: SpectralUnit,
    pub rest: Option<RestValue>,
    /// Convention applied when values are requested as velocities.
    pub convention: VelocityConvention,
}

/// World coordinate system of an N-dimensional image.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateSystem {
    axes: Vec<WorldAxis>,
    cd: DMatrix<f64>,
    cd_inv: Option<DMatrix<f64>>,
    celestial: Option<CelestialAxes>,
    spectral: Option<SpectralAxis>,
}

fn is_lon(ctype: &str) -> bool {
    ["RA--", "GLON", "ELON", "SLON", "HLON"]
        .iter()
        .any(|p| ctype.starts_with(p))
        || ctype == "RA"
}

fn is_lat(ctype: &str) -> bool {
    ["DEC-", "GLAT", "ELAT", "SLAT", "HLAT"]
        .iter()
        .any(|p| ctype.starts_with(p))
        || ctype == "DEC"
}

fn partner_ok(lon: &str, lat: &str) -> bool {
    match (lon.get(..2), lat.get(..2)) {
        (Some("RA"), Some("DE")) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

impl CoordinateSystem {
    /// Build from per-axis descriptions and a full CD matrix.
    ///
    /// Celestial and spectral axes are identified from their CTYPE.
    pub fn new(axes: Vec<WorldAxis>, cd: DMatrix<f64>, rest: Option<RestValue>) -> Result<Self> {
        let n = axes.len();
        if cd.nrows() != n || cd.ncols() != n {
            return Err(CubeError::shape(
                Stage::Header,
                format!("CD matrix is {}x{} for {} axes", cd.nrows(), cd.ncols(), n),
            ));
        }

        let lon = axes.iter().position(|a| is_lon(&a.ctype));
        let lat = axes.iter().position(|a| is_lat(&a.ctype));
        let celestial = match (lon, lat) {
            (Some(lon), Some(lat)) => {
                if !partner_ok(&axes[lon].ctype, &axes[lat].ctype) {
                    return Err(CubeError::format(
                        Stage::Header,
                        format!(
                            "celestial axes {} and {} do not form a pair",
                            axes[lon].ctype, axes[lat].ctype
                        ),
                    ));
                }
                let projection = Projection::from_ctype(&axes[lon].ctype).ok_or_else(|| {
                    CubeError::format(
                        Stage::Header,
                        format!("unsupported projection in CTYPE '{}'", axes[lon].ctype),
                    )
                })?;
                Some(CelestialAxes {
                    lon,
                    lat,
                    projection,
                })
            }
            (None, None) => None,
            (Some(i), None) | (None, Some(i)) => {
                return Err(CubeError::format(
                    Stage::Header,
                    format!("celestial axis {} ('{}') has no partner", i + 1, axes[i].ctype),
                ))
            }
        };

        let spectral = axes
            .iter()
            .enumerate()
            .find_map(|(i, a)| SpectralKind::from_ctype(&a.ctype).map(|k| (i, k)))
            .map(|(axis, kind)| -> Result<SpectralAxis> {
                let cunit = axes[axis].cunit.trim();
                let unit = if cunit.is_empty() {
                    kind.default_unit()
                } else {
                    cunit.parse()?
                };
                let convention = match kind {
                    SpectralKind::Velocity(c) => c,
                    _ => VelocityConvention::Radio,
                };
                Ok(SpectralAxis {
                    axis,
                    kind,
                    unit,
                    rest,
                    convention,
                })
            })
            .transpose()?;

        let cd_inv = cd.clone().try_inverse();
        Ok(Self {
            axes,
            cd,
            cd_inv,
            celestial,
            spectral,
        })
    }

    /// Parse the WCS keywords of a header.
    ///
    /// Every axis must carry a CTYPE; CRPIX/CRVAL default to 0 and CDELT to 1
    /// as in the FITS standard.
    pub fn from_header(header: &Header) -> Result<Self> {
        let naxis = header
            .get_i64("WCSAXES")
            .or_else(|| header.get_i64("NAXIS"))
            .ok_or_else(|| CubeError::format(Stage::Header, "missing NAXIS"))?
            as usize;
        if naxis == 0 {
            return Err(CubeError::format(Stage::Header, "NAXIS is 0; no axes to describe"));
        }

        let mut axes = Vec::with_capacity(naxis);
        for i in 1..=naxis {
            let ctype = header.get_str(&format!("CTYPE{i}")).ok_or_else(|| {
                CubeError::format(Stage::Header, format!("missing CTYPE{i} (axis {i} of {naxis})"))
            })?;
            axes.push(WorldAxis {
                ctype: ctype.trim().to_string(),
                cunit: header
                    .get_str(&format!("CUNIT{i}"))
                    .unwrap_or("")
                    .trim()
                    .to_string(),
                crpix: header.get_f64(&format!("CRPIX{i}")).unwrap_or(0.0),
                crval: header.get_f64(&format!("CRVAL{i}")).unwrap_or(0.0),
            });
        }

        let has_cd = (1..=naxis)
            .any(|i| (1..=naxis).any(|j| header.contains(&format!("CD{i}_{j}"))));
        let cd = if has_cd {
            DMatrix::from_fn(naxis, naxis, |i, j| {
                header.get_f64(&format!("CD{}_{}", i + 1, j + 1)).unwrap_or(0.0)
            })
        } else {
            let cdelt: Vec<f64> = (1..=naxis)
                .map(|i| header.get_f64(&format!("CDELT{i}")).unwrap_or(1.0))
                .collect();
            let has_pc = (1..=naxis)
                .any(|i| (1..=naxis).any(|j| header.contains(&format!("PC{i}_{j}"))));
            let mut pc = DMatrix::<f64>::identity(naxis, naxis);
            if has_pc {
                for i in 0..naxis {
                    for j in 0..naxis {
                        if let Some(v) = header.get_f64(&format!("PC{}_{}", i + 1, j + 1)) {
                            pc[(i, j)] = v;
                        }
                    }
                }
            } else if let Some(crota) = header.get_f64("CROTA2").filter(|r| *r != 0.0) {
                // Legacy rotation applies to the celestial pair.
                let lon = axes.iter().position(|a| is_lon(&a.ctype));
                let lat = axes.iter().position(|a| is_lat(&a.ctype));
                if let (Some(lon), Some(lat)) = (lon, lat) {
                    let (s, c) = crota.to_radians().sin_cos();
                    let ratio = cdelt[lat] / cdelt[lon];
                    pc[(lon, lon)] = c;
                    pc[(lon, lat)] = -s * ratio;
                    pc[(lat, lon)] = s / ratio;
                    pc[(lat, lat)] = c;
                }
            }
            DMatrix::from_fn(naxis, naxis, |i, j| cdelt[i] * pc[(i, j)])
        };

        let rest = header
            .get_f64("RESTFRQ")
            .or_else(|| header.get_f64("RESTFREQ"))
            .filter(|f| *f > 0.0)
            .map(RestValue::Frequency)
            .or_else(|| {
                header
                    .get_f64("RESTWAV")
                    .filter(|w| *w > 0.0)
                    .map(RestValue::Wavelength)
            });

        let wcs = Self::new(axes, cd, rest)?;
        debug!(
            "Parsed {}-axis WCS: celestial={:?}, spectral={:?}",
            naxis,
            wcs.celestial.map(|c| c.projection),
            wcs.spectral.map(|s| s.kind)
        );
        Ok(wcs)
    }

    /// Write the WCS keywords (CTYPE, CUNIT, CRPIX, CRVAL, CD, rest value) into a header.
    pub fn to_header(&self) -> Header {
        let mut h = Header::new();
        self.write_header(&mut h);
        h
    }

    /// Add WCS keywords to an existing header, replacing any present.
    pub fn write_header(&self, h: &mut Header) {
        let n = self.naxis();
        h.set("WCSAXES", n);
        for (i, a) in self.axes.iter().enumerate() {
            let k = i + 1;
            h.set(&format!("CTYPE{k}"), a.ctype.as_str());
            if !a.cunit.is_empty() {
                h.set(&format!("CUNIT{k}"), a.cunit.as_str());
            }
            h.set(&format!("CRPIX{k}"), a.crpix);
            h.set(&format!("CRVAL{k}"), a.crval);
        }
        for i in 0..n {
            for j in 0..n {
                h.set(&format!("CD{}_{}", i + 1, j + 1), self.cd[(i, j)]);
            }
        }
        match self.spectral.and_then(|s| s.rest) {
            Some(RestValue::Frequency(f)) => h.set("RESTFRQ", f),
            Some(RestValue::Wavelength(w)) => h.set("RESTWAV", w),
            None => {}
        }
    }

    pub fn naxis(&self) -> usize {
        self.axes.len()
    }

    pub fn axes(&self) -> &[WorldAxis] {
        &self.axes
    }

    pub fn cd(&self) -> &DMatrix<f64> {
        &self.cd
    }

    pub fn celestial(&self) -> Option<CelestialAxes> {
        self.celestial
    }

    pub fn spectral(&self) -> Option<SpectralAxis> {
        self.spectral
    }

    pub fn has_celestial(&self) -> bool {
        self.celestial.is_some()
    }

    /// Whether world → pixel is defined (CD matrix invertible).
    pub fn is_invertible(&self) -> bool {
        self.cd_inv.is_some()
    }

    /// Select a velocity convention for spectral values requested as velocities.
    pub fn with_velocity_convention(mut self, convention: VelocityConvention) -> Self {
        if let Some(s) = self.spectral.as_mut() {
            s.convention = convention;
        }
        self
    }

    /// Set the rest value used for frequency ↔ velocity conversion.
    pub fn with_rest_value(mut self, rest: RestValue) -> Self {
        if let Some(s) = self.spectral.as_mut() {
            s.rest = Some(rest);
        }
        self
    }

    /// Convert 0-based pixel indices (FITS axis order) to world coordinates.
    ///
    /// Celestial coordinates are returned in degrees with longitude in [0, 360).
    /// Returns `None` if the point falls outside the projection's domain.
    pub fn pixel_to_world(&self, pixel: &[f64]) -> Option<Vec<f64>> {
        let n = self.naxis();
        if pixel.len() != n {
            return None;
        }
        let d = nalgebra::DVector::from_fn(n, |i, _| pixel[i] + 1.0 - self.axes[i].crpix);
        let x = &self.cd * d;
        let mut world: Vec<f64> = (0..n).map(|i| self.axes[i].crval + x[i]).collect();
        if let Some(c) = self.celestial {
            let lon0 = self.axes[c.lon].crval.to_radians();
            let lat0 = self.axes[c.lat].crval.to_radians();
            let (lon, lat) =
                c.projection
                    .deproject(x[c.lon].to_radians(), x[c.lat].to_radians(), lon0, lat0)?;
            world[c.lon] = lon.to_degrees().rem_euclid(360.0);
            world[c.lat] = lat.to_degrees();
        }
        Some(world)
    }

    /// Convert world coordinates to 0-based pixel indices (FITS axis order).
    pub fn world_to_pixel(&self, world: &[f64]) -> Option<Vec<f64>> {
        let n = self.naxis();
        let cd_inv = self.cd_inv.as_ref()?;
        if world.len() != n {
            return None;
        }
        let mut x = nalgebra::DVector::from_fn(n, |i, _| world[i] - self.axes[i].crval);
        if let Some(c) = self.celestial {
            let lon0 = self.axes[c.lon].crval.to_radians();
            let lat0 = self.axes[c.lat].crval.to_radians();
            let (px, py) = c.projection.project(
                world[c.lon].to_radians(),
                world[c.lat].to_radians(),
                lon0,
                lat0,
            )?;
            x[c.lon] = px.to_degrees();
            x[c.lat] = py.to_degrees();
        }
        let d = cd_inv * x;
        Some((0..n).map(|i| d[i] + self.axes[i].crpix - 1.0).collect())
    }

    /// Extract a lower-dimensional WCS keeping the listed axes in order.
    pub fn sub(&self, keep: &[usize]) -> Result<Self> {
        if let Some(&bad) = keep.iter().find(|&&k| k >= self.naxis()) {
            return Err(CubeError::shape(
                Stage::Header,
                format!("axis {} out of range for {}-axis WCS", bad + 1, self.naxis()),
            ));
        }
        let axes = keep.iter().map(|&k| self.axes[k].clone()).collect();
        let cd = DMatrix::from_fn(keep.len(), keep.len(), |i, j| self.cd[(keep[i], keep[j])]);
        let rest = self.spectral.and_then(|s| s.rest);
        let mut wcs = Self::new(axes, cd, rest)?;
        if let (Some(src), Some(dst)) = (self.spectral, wcs.spectral.as_mut()) {
            dst.convention = src.convention;
        }
        Ok(wcs)
    }

    /// The celestial pair as a 2-axis WCS.
    pub fn celestial_wcs(&self) -> Option<Self> {
        let c = self.celestial?;
        self.sub(&[c.lon, c.lat]).ok()
    }

    /// Shift the reference pixel as if the first `offset` pixels along `axis` were cut away.
    pub fn shifted(&self, axis: usize, offset: f64) -> Self {
        let mut out = self.clone();
        if let Some(a) = out.axes.get_mut(axis) {
            a.crpix -= offset;
        }
        out
    }

    /// Approximate celestial pixel scale in degrees per pixel (sqrt of |det CD|).
    pub fn pixel_scale_deg(&self) -> Option<f64> {
        let c = self.celestial?;
        let det = self.cd[(c.lon, c.lon)] * self.cd[(c.lat, c.lat)]
            - self.cd[(c.lon, c.lat)] * self.cd[(c.lat, c.lon)];
        Some(det.abs().sqrt())
    }

    /// Native world value of the spectral axis at a 0-based channel index.
    ///
    /// Assumes the spectral axis is not coupled to the spatial axes in the CD matrix.
    pub fn spectral_native(&self, channel: f64) -> Option<f64> {
        let s = self.spectral?;
        let a = &self.axes[s.axis];
        Some(a.crval + self.cd[(s.axis, s.axis)] * (channel + 1.0 - a.crpix))
    }

    /// Spectral value of a (fractional) channel in the requested unit.
    pub fn spectral_value(&self, channel: f64, unit: SpectralUnit) -> Result<f64> {
        let s = self.spectral.ok_or_else(|| {
            CubeError::shape(Stage::Header, "coordinate system has no spectral axis")
        })?;
        let native = self.spectral_native(channel).unwrap_or(f64::NAN) * s.unit.si_factor();
        spectral::convert(native, s.kind, s.rest, unit, s.convention)
    }

    /// Spectral values of channels `0..n` in the requested unit.
    pub fn spectral_values(&self, n: usize, unit: SpectralUnit) -> Result<Vec<f64>> {
        (0..n).map(|k| self.spectral_value(k as f64, unit)).collect()
    }

    /// Absolute channel widths in the requested unit, measured between channel edges.
    pub fn channel_widths(&self, n: usize, unit: SpectralUnit) -> Result<Vec<f64>> {
        (0..n)
            .map(|k| {
                let lo = self.spectral_value(k as f64 - 0.5, unit)?;
                let hi = self.spectral_value(k as f64 + 0.5, unit)?;
                Ok((hi - lo).abs())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_header() -> Header {
        let mut h = Header::new();
        h.set("NAXIS", 3_i64);
        h.set("CTYPE1", "RA---TAN");
        h.set("CTYPE2", "DEC--TAN");
        h.set("CTYPE3", "FREQ");
        h.set("CUNIT3", "Hz");
        h.set("CRPIX1", 51.0);
        h.set("CRPIX2", 41.0);
        h.set("CRPIX3", 1.0);
        h.set("CRVAL1", 83.8221);
        h.set("CRVAL2", -5.3911);
        h.set("CRVAL3", 115.2712018e9);
        h.set("CDELT1", -1.0 / 3600.0);
        h.set("CDELT2", 1.0 / 3600.0);
        h.set("CDELT3", -250e3);
        h.set("RESTFRQ", 115.2712018e9);
        h
    }

    #[test]
    fn test_reference_pixel_maps_to_crval_cd_matrix() {
        let mut h = Header::new();
        h.set("NAXIS", 2_i64);
        h.set("CTYPE1", "RA---TAN");
        h.set("CTYPE2", "DEC--TAN");
        h.set("CRPIX1", 120.5);
        h.set("CRPIX2", 80.25);
        h.set("CRVAL1", 201.365);
        h.set("CRVAL2", -43.019);
        let theta = 30.0_f64.to_radians();
        let s = 2.0e-4;
        h.set("CD1_1", -s * theta.cos());
        h.set("CD1_2", s * theta.sin());
        h.set("CD2_1", s * theta.sin());
        h.set("CD2_2", s * theta.cos());

        let wcs = CoordinateSystem::from_header(&h).unwrap();
        let world = wcs.pixel_to_world(&[119.5, 79.25]).unwrap();
        assert!(((world[0] - 201.365) / 201.365).abs() < 1e-9, "lon {}", world[0]);
        assert!(((world[1] + 43.019) / 43.019).abs() < 1e-9, "lat {}", world[1]);
    }

    #[test]
    fn test_pixel_world_roundtrip() {
        let wcs = CoordinateSystem::from_header(&cube_header()).unwrap();
        for p in [[0.0, 0.0, 0.0], [50.0, 40.0, 3.0], [99.0, 12.5, 17.0]] {
            let w = wcs.pixel_to_world(&p).unwrap();
            let q = wcs.world_to_pixel(&w).unwrap();
            for i in 0..3 {
                assert!((p[i] - q[i]).abs() < 1e-6, "axis {i}: {} vs {}", p[i], q[i]);
            }
        }
    }

    #[test]
    fn test_crota2_matches_cd_form() {
        let mut h = Header::new();
        h.set("NAXIS", 2_i64);
        h.set("CTYPE1", "GLON-CAR");
        h.set("CTYPE2", "GLAT-CAR");
        h.set("CDELT1", -0.01);
        h.set("CDELT2", 0.01);
        h.set("CROTA2", 20.0);
        let wcs = CoordinateSystem::from_header(&h).unwrap();
        let (s, c) = 20.0_f64.to_radians().sin_cos();
        let cd = wcs.cd();
        assert!((cd[(0, 0)] - (-0.01 * c)).abs() < 1e-15);
        assert!((cd[(0, 1)] - (-0.01 * s)).abs() < 1e-15);
        assert!((cd[(1, 0)] - (-0.01 * s)).abs() < 1e-15);
        assert!((cd[(1, 1)] - (0.01 * c)).abs() < 1e-15);
    }

    #[test]
    fn test_spectral_values_in_km_per_s() {
        let wcs = CoordinateSystem::from_header(&cube_header()).unwrap();
        let v = wcs
            .spectral_values(3, SpectralUnit::KilometersPerSecond)
            .unwrap();
        // Frequency decreasing → radio velocity increasing
        assert!(v[0].abs() < 1e-9);
        let dv = SPEED_OF_LIGHT * 250e3 / 115.2712018e9 / 1e3;
        assert!((v[1] - dv).abs() < 1e-9);
        let widths = wcs
            .channel_widths(3, SpectralUnit::KilometersPerSecond)
            .unwrap();
        assert!((widths[2] - dv).abs() < 1e-9);
    }

    #[test]
    fn test_header_roundtrip() {
        let wcs = CoordinateSystem::from_header(&cube_header()).unwrap();
        let mut h = wcs.to_header();
        h.set("NAXIS", 3_i64);
        let back = CoordinateSystem::from_header(&h).unwrap();
        assert_eq!(wcs, back);
    }

    #[test]
    fn test_missing_ctype_is_format_error() {
        let mut h = cube_header();
        h.remove("CTYPE3");
        let err = CoordinateSystem::from_header(&h).unwrap_err();
        assert!(matches!(err, CubeError::Format { .. }));
        assert!(err.to_string().contains("CTYPE3"));
    }

    #[test]
    fn test_sub_and_shift() {
        let wcs = CoordinateSystem::from_header(&cube_header()).unwrap();
        let cel = wcs.celestial_wcs().unwrap();
        assert_eq!(cel.naxis(), 2);
        assert!(cel.spectral().is_none());

        let shifted = wcs.shifted(0, 10.0);
        let a = wcs.pixel_to_world(&[15.0, 3.0, 0.0]).unwrap();
        let b = shifted.pixel_to_world(&[5.0, 3.0, 0.0]).unwrap();
        assert!((a[0] - b[0]).abs() < 1e-12 && (a[1] - b[1]).abs() < 1e-12);
        assert!((wcs.pixel_scale_deg().unwrap() - 1.0 / 3600.0).abs() < 1e-15);
    }
}
