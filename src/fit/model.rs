//! Parametric models with analytic derivatives.

use std::f64::consts::LN_2;

use crate::cube::Beam;

/// FWHM of a Gaussian in units of its standard deviation, `2·sqrt(2 ln 2)`.
pub fn fwhm_per_sigma() -> f64 {
    2.0 * (2.0 * LN_2).sqrt()
}

/// Model families the fitter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    /// `A·exp(−(x−μ)²/2σ²)`; parameters `[A, μ, σ]`.
    Gaussian1D,
    /// Sum of `components` 1D Gaussians; parameters `[A₀, μ₀, σ₀, A₁, ...]`.
    GaussianSum { components: usize },
    /// Elliptical Gaussian over `(x, y)`; parameters
    /// `[A, x₀, y₀, σx, σy, θ]` with θ counter-clockwise from +x.
    Gaussian2D,
}

impl Model {
    pub fn n_params(&self) -> usize {
        match self {
            Model::Gaussian1D => 3,
            Model::GaussianSum { components } => 3 * components,
            Model::Gaussian2D => 6,
        }
    }

    /// Number of independent variables per observation.
    pub fn n_inputs(&self) -> usize {
        match self {
            Model::Gaussian1D | Model::GaussianSum { .. } => 1,
            Model::Gaussian2D => 2,
        }
    }

    pub fn param_names(&self) -> Vec<String> {
        match self {
            Model::Gaussian1D => vec!["amplitude".into(), "mean".into(), "stddev".into()],
            Model::GaussianSum { components } => (0..*components)
                .flat_map(|i| [format!("amplitude_{i}"), format!("mean_{i}"), format!("stddev_{i}")])
                .collect(),
            Model::Gaussian2D => ["amplitude", "x_mean", "y_mean", "x_stddev", "y_stddev", "theta"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Model value at one point.
    ///
    /// # Panics
    ///
    /// If `p` is shorter than [`Self::n_params`] or `x` shorter than
    /// [`Self::n_inputs`]. [`super::fit`] validates both before calling.
    pub fn eval(&self, p: &[f64], x: &[f64]) -> f64 {
        match self {
            Model::Gaussian1D => gauss1d(&p[..3], x[0]),
            Model::GaussianSum { .. } => p.chunks_exact(3).map(|c| gauss1d(c, x[0])).sum(),
            Model::Gaussian2D => {
                let (q, _, _) = gauss2d_q(p, x[0], x[1]);
                p[0] * (-q).exp()
            }
        }
    }

    /// Partial derivatives of the model with respect to each parameter.
    ///
    /// Same preconditions as [`Self::eval`]; `out` holds `n_params` values.
    pub fn gradient(&self, p: &[f64], x: &[f64], out: &mut [f64]) {
        match self {
            Model::Gaussian1D => gauss1d_grad(&p[..3], x[0], &mut out[..3]),
            Model::GaussianSum { .. } => {
                for (c, o) in p.chunks_exact(3).zip(out.chunks_exact_mut(3)) {
                    gauss1d_grad(c, x[0], o);
                }
            }
            Model::Gaussian2D => {
                let (amp, sx, sy) = (p[0], p[3], p[4]);
                let (q, u, v) = gauss2d_q(p, x[0], x[1]);
                let e = (-q).exp();
                let f = amp * e;
                let (sin, cos) = p[5].sin_cos();
                let (ux, vy) = (u / (sx * sx), v / (sy * sy));
                out[0] = e;
                out[1] = f * (ux * cos - vy * sin);
                out[2] = f * (ux * sin + vy * cos);
                out[3] = f * u * u / (sx * sx * sx);
                out[4] = f * v * v / (sy * sy * sy);
                out[5] = -f * u * v * (1.0 / (sx * sx) - 1.0 / (sy * sy));
            }
        }
    }
}

fn gauss1d(p: &[f64], x: f64) -> f64 {
    let z = (x - p[1]) / p[2];
    p[0] * (-0.5 * z * z).exp()
}

fn gauss1d_grad(p: &[f64], x: f64, out: &mut [f64]) {
    let (amp, mu, sigma) = (p[0], p[1], p[2]);
    let d = x - mu;
    let e = (-0.5 * d * d / (sigma * sigma)).exp();
    let f = amp * e;
    out[0] = e;
    out[1] = f * d / (sigma * sigma);
    out[2] = f * d * d / (sigma * sigma * sigma);
}

/// Quadratic form of the rotated 2D Gaussian and the rotated offsets `(u, v)`.
fn gauss2d_q(p: &[f64], x: f64, y: f64) -> (f64, f64, f64) {
    let (dx, dy) = (x - p[1], y - p[2]);
    let (sin, cos) = p[5].sin_cos();
    let u = dx * cos + dy * sin;
    let v = -dx * sin + dy * cos;
    (0.5 * (u * u / (p[3] * p[3]) + v * v / (p[4] * p[4])), u, v)
}

/// Indices of the shape parameters (`σx, σy, θ`) of [`Model::Gaussian2D`].
pub const GAUSSIAN2D_SHAPE: [usize; 3] = [3, 4, 5];

/// Initial [`Model::Gaussian2D`] parameters with the shape fixed to a beam.
///
/// The beam major axis maps to `σx`. The position angle (east of north) is
/// converted to a pixel-frame angle assuming north along +y and east along −x.
/// Hold [`GAUSSIAN2D_SHAPE`] fixed to fit only amplitude and position.
pub fn beam_gaussian2d(beam: &Beam, pixel_scale_deg: f64, amplitude: f64, x0: f64, y0: f64) -> Vec<f64> {
    let (sx, sy) = beam.stddev_pixels(pixel_scale_deg);
    vec![amplitude, x0, y0, sx, sy, (beam.pa_deg + 90.0).to_radians()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_gradient(model: Model, p: &[f64], x: &[f64]) -> Vec<f64> {
        (0..p.len())
            .map(|i| {
                let h = 1e-6 * p[i].abs().max(1.0);
                let mut hi = p.to_vec();
                let mut lo = p.to_vec();
                hi[i] += h;
                lo[i] -= h;
                (model.eval(&hi, x) - model.eval(&lo, x)) / (2.0 * h)
            })
            .collect()
    }

    #[test]
    fn test_analytic_gradients_match_finite_differences() {
        let cases: Vec<(Model, Vec<f64>, Vec<f64>)> = vec![
            (Model::Gaussian1D, vec![2.0, 0.3, 1.7], vec![1.1]),
            (
                Model::GaussianSum { components: 2 },
                vec![2.0, -1.0, 0.8, 1.0, 1.5, 1.2],
                vec![0.4],
            ),
            (Model::Gaussian2D, vec![3.0, 1.0, -0.5, 2.0, 1.2, 0.6], vec![2.2, 0.7]),
        ];
        for (model, p, x) in cases {
            let mut g = vec![0.0; model.n_params()];
            model.gradient(&p, &x, &mut g);
            let n = numeric_gradient(model, &p, &x);
            for i in 0..g.len() {
                assert!((g[i] - n[i]).abs() < 1e-6, "{model:?} param {i}: {} vs {}", g[i], n[i]);
            }
        }
    }

    #[test]
    fn test_param_names() {
        assert_eq!(Model::GaussianSum { components: 2 }.param_names().len(), 6);
        assert_eq!(Model::Gaussian2D.param_names()[3], "x_stddev");
        assert!((fwhm_per_sigma() - 2.354_820_045).abs() < 1e-9);
    }

    #[test]
    fn test_beam_gaussian2d() {
        let beam = Beam {
            major_deg: 4.0 / 3600.0,
            minor_deg: 2.0 / 3600.0,
            pa_deg: 0.0,
        };
        let p = beam_gaussian2d(&beam, 1.0 / 3600.0, 1.0, 5.0, 6.0);
        assert!((p[3] - 4.0 / fwhm_per_sigma()).abs() < 1e-9);
        // PA 0 means major axis along +y
        assert!((p[5] - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
    }
}
