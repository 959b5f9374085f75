//! Nonlinear least-squares fitting of Gaussian models.
//!
//! [`fit`] minimises `Σ (observed − model(params; x))²` with Levenberg–Marquardt
//! and analytic Jacobians. NaN observations are left out of the sum by default;
//! substituting zero instead biases amplitudes low and is only available as an
//! explicit [`NanPolicy::ZeroFill`].
//!
//! Running out of iterations is not an error: the best parameters found are
//! returned with a [`ConvergenceWarning`].

mod lm;
pub mod model;

use std::fmt;

use nalgebra::DMatrix;
use tracing::{debug, warn};

use crate::cube::Cube;
use crate::error::{CubeError, Result, Stage};
use crate::product::Image2d;
use crate::wcs::SpectralUnit;
pub use model::{beam_gaussian2d, fwhm_per_sigma, Model, GAUSSIAN2D_SHAPE};

/// Treatment of non-finite observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NanPolicy {
    /// Leave NaN observations out of the residual sum.
    #[default]
    Exclude,
    /// Replace NaN observations with zero.
    ZeroFill,
}

/// Configuration for [`fit`].
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// Maximum LM iterations. Default 200.
    pub max_iterations: usize,
    /// Initial damping factor. Default 1e-3.
    pub initial_lambda: f64,
    /// Damping multiplier after a rejected step. Default 10.
    pub lambda_up: f64,
    /// Damping multiplier after an accepted step. Default 0.1.
    pub lambda_down: f64,
    /// Converged when an accepted step lowers the cost by less than this
    /// fraction. Default 1e-10.
    pub cost_tolerance: f64,
    /// Converged when an accepted step is smaller than this fraction of the
    /// parameter vector norm. Default 1e-10.
    pub step_tolerance: f64,
    pub nan_policy: NanPolicy,
    /// Indices of parameters held at their initial values.
    pub fixed: Vec<usize>,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
            cost_tolerance: 1e-10,
            step_tolerance: 1e-10,
            nan_policy: NanPolicy::Exclude,
            fixed: Vec::new(),
        }
    }
}

impl FitConfig {
    pub fn with_fixed(mut self, fixed: &[usize]) -> Self {
        self.fixed = fixed.to_vec();
        self
    }

    /// Damping factors must let the search both back off and recover.
    fn validate(&self) -> Result<()> {
        if !(self.initial_lambda > 0.0 && self.initial_lambda.is_finite()) {
            return Err(CubeError::invalid(
                Stage::Fit,
                format!("initial_lambda must be positive, got {}", self.initial_lambda),
            ));
        }
        if !(self.lambda_up > 1.0 && self.lambda_up.is_finite()) {
            return Err(CubeError::invalid(
                Stage::Fit,
                format!("lambda_up must be greater than 1, got {}", self.lambda_up),
            ));
        }
        if !(self.lambda_down > 0.0 && self.lambda_down < 1.0) {
            return Err(CubeError::invalid(
                Stage::Fit,
                format!("lambda_down must lie in (0, 1), got {}", self.lambda_down),
            ));
        }
        Ok(())
    }
}

/// Non-fatal report that the fit stopped before meeting its tolerances.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceWarning {
    pub iterations: usize,
    pub cost: f64,
}

impl fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fit did not converge after {} iterations (cost {:.6e}); returning best parameters found",
            self.iterations, self.cost
        )
    }
}

#[derive(Debug, Clone)]
pub struct FitResult {
    pub model: Model,
    pub params: Vec<f64>,
    /// One-sigma uncertainties, zero for fixed parameters. `None` when the
    /// normal matrix is singular or there are no degrees of freedom.
    pub uncertainties: Option<Vec<f64>>,
    /// `s²·(JᵀJ)⁻¹` over all parameters, zero rows/columns for fixed ones.
    pub covariance: Option<DMatrix<f64>>,
    /// `observed − model` at every input point (NaN where excluded).
    pub residuals: Vec<f64>,
    /// Sum of squared residuals over the fitted points.
    pub cost: f64,
    /// Number of observations used.
    pub n_points: usize,
    pub iterations: usize,
    pub converged: bool,
    pub warning: Option<ConvergenceWarning>,
}

impl FitResult {
    /// Evaluate the fitted model at one point with `n_inputs` coordinates.
    pub fn evaluate(&self, x: &[f64]) -> Result<f64> {
        if x.len() != self.model.n_inputs() {
            return Err(CubeError::DimensionMismatch {
                stage: Stage::Fit,
                message: format!(
                    "{:?} takes {} coordinate(s) per point, got {}",
                    self.model,
                    self.model.n_inputs(),
                    x.len()
                ),
            });
        }
        Ok(self.model.eval(&self.params, x))
    }

    pub fn param(&self, name: &str) -> Option<f64> {
        self.model
            .param_names()
            .iter()
            .position(|n| n == name)
            .map(|i| self.params[i])
    }
}

/// Fit `model` to `observed` at the points given by `inputs`.
///
/// `inputs` holds one slice per independent variable (`[x]` for 1D models,
/// `[x, y]` for [`Model::Gaussian2D`]), each the same length as `observed`.
pub fn fit(
    model: Model,
    initial: &[f64],
    inputs: &[&[f64]],
    observed: &[f64],
    config: &FitConfig,
) -> Result<FitResult> {
    config.validate()?;
    if inputs.len() != model.n_inputs() {
        return Err(CubeError::DimensionMismatch {
            stage: Stage::Fit,
            message: format!(
                "{model:?} takes {} independent variable(s), got {}",
                model.n_inputs(),
                inputs.len()
            ),
        });
    }
    if let Some((i, v)) = inputs.iter().enumerate().find(|(_, v)| v.len() != observed.len()) {
        return Err(CubeError::DimensionMismatch {
            stage: Stage::Fit,
            message: format!(
                "independent variable {} has {} values, observations have {}",
                i,
                v.len(),
                observed.len()
            ),
        });
    }
    if initial.len() != model.n_params() {
        return Err(CubeError::invalid(
            Stage::Fit,
            format!("{model:?} needs {} parameters, got {}", model.n_params(), initial.len()),
        ));
    }
    if let Some(v) = initial.iter().find(|v| !v.is_finite()) {
        return Err(CubeError::invalid(Stage::Fit, format!("initial parameter {v} is not finite")));
    }
    if let Some(&k) = config.fixed.iter().find(|&&k| k >= model.n_params()) {
        return Err(CubeError::invalid(
            Stage::Fit,
            format!("fixed parameter index {k} out of range for {model:?}"),
        ));
    }
    let free: Vec<usize> = (0..model.n_params()).filter(|k| !config.fixed.contains(k)).collect();
    if free.is_empty() {
        return Err(CubeError::invalid(Stage::Fit, "every parameter is fixed"));
    }

    // Flatten usable points
    let n_inputs = model.n_inputs();
    let mut xs = Vec::with_capacity(observed.len() * n_inputs);
    let mut ys = Vec::with_capacity(observed.len());
    for (i, &obs) in observed.iter().enumerate() {
        if inputs.iter().any(|v| !v[i].is_finite()) {
            continue;
        }
        let y = match (obs.is_finite(), config.nan_policy) {
            (true, _) => obs,
            (false, NanPolicy::ZeroFill) => 0.0,
            (false, NanPolicy::Exclude) => continue,
        };
        xs.extend(inputs.iter().map(|v| v[i]));
        ys.push(y);
    }
    if ys.len() < free.len() {
        return Err(CubeError::invalid(
            Stage::Fit,
            format!("{} usable observations for {} free parameters", ys.len(), free.len()),
        ));
    }

    let data = lm::Data {
        x: &xs,
        y: &ys,
        n_inputs,
    };
    let start = lm::cost(&model, initial, &data);
    if !start.is_finite() {
        return Err(CubeError::invalid(
            Stage::Fit,
            format!("model is not finite at initial parameters {initial:?} (zero width?)"),
        ));
    }
    let out = lm::minimize(&model, initial, &free, &data, config);

    let dof = ys.len() - free.len();
    let covariance = if dof > 0 && out.jtj.iter().all(|v| v.is_finite()) {
        out.jtj.clone().try_inverse().map(|inv| {
            let s2 = out.cost / dof as f64;
            let mut full = DMatrix::zeros(model.n_params(), model.n_params());
            for (a, &i) in free.iter().enumerate() {
                for (b, &j) in free.iter().enumerate() {
                    full[(i, j)] = s2 * inv[(a, b)];
                }
            }
            full
        })
    } else {
        None
    };
    let uncertainties = covariance
        .as_ref()
        .map(|c| (0..model.n_params()).map(|i| c[(i, i)].max(0.0).sqrt()).collect());

    let residuals = observed
        .iter()
        .enumerate()
        .map(|(i, &obs)| {
            let x: Vec<f64> = inputs.iter().map(|v| v[i]).collect();
            let y = match (obs.is_finite(), config.nan_policy) {
                (false, NanPolicy::ZeroFill) => 0.0,
                _ => obs,
            };
            y - model.eval(&out.params, &x)
        })
        .collect();

    let warning = (!out.converged).then(|| ConvergenceWarning {
        iterations: out.iterations,
        cost: out.cost,
    });
    match &warning {
        Some(w) => warn!("{model:?}: {w}"),
        None => debug!(
            "{model:?} converged in {} iterations, cost {:.6e}, params {:?}",
            out.iterations, out.cost, out.params
        ),
    }

    Ok(FitResult {
        model,
        params: out.params,
        uncertainties,
        covariance,
        residuals,
        cost: out.cost,
        n_points: ys.len(),
        iterations: out.iterations,
        converged: out.converged,
        warning,
    })
}

/// Fit a 1D model to the spectrum at pixel `(y, x)`, with the spectral axis in `unit`.
pub fn fit_spectrum(
    cube: &Cube,
    y: usize,
    x: usize,
    model: Model,
    initial: &[f64],
    unit: SpectralUnit,
    config: &FitConfig,
) -> Result<FitResult> {
    let axis = cube.spectral_axis(unit)?;
    let spectrum: Vec<f64> = cube.spectrum(y, x)?.into_iter().map(f64::from).collect();
    fit(model, initial, &[&axis], &spectrum, config)
}

/// Fit a 2D model to an image, with `x` the column and `y` the row index.
pub fn fit_image(image: &Image2d, model: Model, initial: &[f64], config: &FitConfig) -> Result<FitResult> {
    let (rows, cols) = image.shape();
    let xs: Vec<f64> = (0..rows * cols).map(|i| (i % cols) as f64).collect();
    let ys: Vec<f64> = (0..rows * cols).map(|i| (i / cols) as f64).collect();
    let values: Vec<f64> = image.data().iter().map(|&v| f64::from(v)).collect();
    fit(model, initial, &[&xs, &ys], &values, config)
}
