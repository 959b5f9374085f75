//! Celestial projections between sky coordinates and the intermediate
//! (projection-plane) coordinates of a FITS world coordinate system.
//!
//! All angles here are in radians. Reference: Calabretta & Greisen (2002),
//! FITS WCS Paper II.

/// Supported celestial projection codes (the last three characters of CTYPE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Gnomonic.
    Tan,
    /// Orthographic / synthesis (common for interferometer images).
    Sin,
    /// Plate carrée, treated as a plain linear mapping of (lon, lat).
    Car,
}

impl Projection {
    /// Parse from the projection code of a celestial CTYPE (e.g. `RA---TAN`).
    pub fn from_ctype(ctype: &str) -> Option<Self> {
        let code = ctype.get(5..8).unwrap_or("").trim_matches('-');
        match code {
            "TAN" => Some(Projection::Tan),
            "SIN" => Some(Projection::Sin),
            "CAR" | "" => Some(Projection::Car),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Projection::Tan => "TAN",
            Projection::Sin => "SIN",
            Projection::Car => "CAR",
        }
    }

    /// Sky → projection plane. Returns `None` for points with no projection.
    pub fn project(&self, lon: f64, lat: f64, lon0: f64, lat0: f64) -> Option<(f64, f64)> {
        if let Projection::Car = self {
            return Some((wrap_pi(lon - lon0), lat - lat0));
        }
        let (x, y, cos_c) = to_native(lon, lat, lon0, lat0);
        match self {
            // Gnomonic: scale the direction onto the plane tangent at the reference point
            Projection::Tan if cos_c > 1e-12 => Some((x / cos_c, y / cos_c)),
            Projection::Sin if cos_c >= 0.0 => Some((x, y)),
            _ => None,
        }
    }

    /// Projection plane → sky. Returns `None` outside the valid domain.
    pub fn deproject(&self, x: f64, y: f64, lon0: f64, lat0: f64) -> Option<(f64, f64)> {
        match self {
            Projection::Tan => {
                let r = (1.0 + x * x + y * y).sqrt();
                Some(from_native(x / r, y / r, 1.0 / r, lon0, lat0))
            }
            Projection::Sin => {
                let rho_sq = x * x + y * y;
                if rho_sq > 1.0 {
                    return None;
                }
                Some(from_native(x, y, (1.0 - rho_sq).sqrt(), lon0, lat0))
            }
            Projection::Car => {
                let lat = lat0 + y;
                if lat.abs() > std::f64::consts::FRAC_PI_2 + 1e-12 {
                    return None;
                }
                Some((lon0 + x, lat))
            }
        }
    }
}

/// Unit vector of `(lon, lat)` in the frame centred on `(lon0, lat0)`:
/// east and north components, then the cosine of the distance from the centre.
fn to_native(lon: f64, lat: f64, lon0: f64, lat0: f64) -> (f64, f64, f64) {
    let (sin_dlon, cos_dlon) = (lon - lon0).sin_cos();
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_lat0, cos_lat0) = lat0.sin_cos();
    (
        cos_lat * sin_dlon,
        sin_lat * cos_lat0 - cos_lat * sin_lat0 * cos_dlon,
        sin_lat * sin_lat0 + cos_lat * cos_lat0 * cos_dlon,
    )
}

/// Inverse of [`to_native`] for a unit vector.
fn from_native(x: f64, y: f64, cos_c: f64, lon0: f64, lat0: f64) -> (f64, f64) {
    let (sin_lat0, cos_lat0) = lat0.sin_cos();
    let lat = (cos_c * sin_lat0 + y * cos_lat0).clamp(-1.0, 1.0).asin();
    let lon = lon0 + x.atan2(cos_c * cos_lat0 - y * sin_lat0);
    (lon, lat)
}

fn wrap_pi(a: f64) -> f64 {
    let two_pi = std::f64::consts::TAU;
    let mut a = a % two_pi;
    if a > std::f64::consts::PI {
        a -= two_pi;
    } else if a < -std::f64::consts::PI {
        a += two_pi;
    }
    a
}

/// Great-circle separation between two sky positions (radians), haversine form.
pub fn angular_separation(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * a.sqrt().min(1.0).asin()
}
