//! Levenberg–Marquardt minimisation of a sum of squared residuals.
//!
//! Marquardt's scaling is used: the damping term multiplies the diagonal of
//! JᵀJ, so parameters of very different magnitude (amplitudes in K, centres
//! in km/s, widths in pixels) are damped evenly.

use nalgebra::{DMatrix, DVector};
use tracing::{debug, trace};

use super::model::Model;
use super::FitConfig;

/// Damping above which the search is considered stalled.
const MAX_LAMBDA: f64 = 1e12;

/// Sweep limit for the SVD of the damped normal matrix.
const SVD_MAX_ITER: usize = 500;

pub(crate) struct Outcome {
    pub params: Vec<f64>,
    pub cost: f64,
    pub iterations: usize,
    pub converged: bool,
    /// JᵀJ over the free parameters at `params`.
    pub jtj: DMatrix<f64>,
}

/// Observations prepared for fitting: `x` holds `n_inputs` values per point.
pub(crate) struct Data<'a> {
    pub x: &'a [f64],
    pub y: &'a [f64],
    pub n_inputs: usize,
}

impl Data<'_> {
    fn len(&self) -> usize {
        self.y.len()
    }

    fn point(&self, i: usize) -> &[f64] {
        &self.x[i * self.n_inputs..(i + 1) * self.n_inputs]
    }
}

pub(crate) fn cost(model: &Model, p: &[f64], data: &Data) -> f64 {
    (0..data.len())
        .map(|i| {
            let r = data.y[i] - model.eval(p, data.point(i));
            r * r
        })
        .sum()
}

/// Residual vector and Jacobian of the model over the free parameters.
fn linearize(model: &Model, p: &[f64], free: &[usize], data: &Data) -> (DVector<f64>, DMatrix<f64>) {
    let n = data.len();
    let mut r = DVector::zeros(n);
    let mut j = DMatrix::zeros(n, free.len());
    let mut grad = vec![0.0; model.n_params()];
    for i in 0..n {
        let x = data.point(i);
        r[i] = data.y[i] - model.eval(p, x);
        model.gradient(p, x, &mut grad);
        for (c, &k) in free.iter().enumerate() {
            j[(i, c)] = grad[k];
        }
    }
    (r, j)
}

/// Minimise from `initial`, varying only the `free` parameters.
///
/// Stops on the cost or step tolerance, after `max_iterations`, or when no
/// damping yields a downhill step. A stall counts as convergence only once at
/// least one step has been accepted. A non-finite Jacobian ends the search
/// without convergence.
pub(crate) fn minimize(model: &Model, initial: &[f64], free: &[usize], data: &Data, config: &FitConfig) -> Outcome {
    let mut p = initial.to_vec();
    let mut current = cost(model, &p, data);
    let mut lambda = config.initial_lambda;
    let mut converged = false;
    let mut accepted_any = false;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        iterations = iter + 1;
        if current == 0.0 {
            converged = true;
            break;
        }
        let (r, j) = linearize(model, &p, free, data);
        let jtj = j.transpose() * &j;
        let g = j.transpose() * r;
        if !jtj.iter().chain(g.iter()).all(|v| v.is_finite()) {
            debug!("LM iter {iter}: Jacobian is not finite at {p:?}, stopping");
            break;
        }

        // Retry with heavier damping until the cost drops
        let mut improved = false;
        while lambda <= MAX_LAMBDA {
            let mut a = jtj.clone();
            for d in 0..a.nrows() {
                a[(d, d)] += lambda * jtj[(d, d)].max(1e-12);
            }
            let delta = a
                .try_svd(true, true, f64::EPSILON, SVD_MAX_ITER)
                .and_then(|svd| svd.solve(&g, 1e-15).ok());
            let Some(delta) = delta else {
                lambda *= config.lambda_up;
                continue;
            };

            let mut trial = p.clone();
            for (c, &k) in free.iter().enumerate() {
                trial[k] += delta[c];
            }
            let trial_cost = cost(model, &trial, data);
            if trial_cost.is_finite() && trial_cost < current {
                let rel_drop = (current - trial_cost) / current;
                let scale = free.iter().map(|&k| p[k] * p[k]).sum::<f64>().sqrt();
                let step = delta.norm() / (scale + 1e-12);
                trace!("LM iter {iter}: cost {current:.6e} -> {trial_cost:.6e}, lambda {lambda:.1e}");
                p = trial;
                current = trial_cost;
                lambda = (lambda * config.lambda_down).max(1e-15);
                improved = true;
                accepted_any = true;
                if rel_drop < config.cost_tolerance || step < config.step_tolerance {
                    converged = true;
                }
                break;
            }
            lambda *= config.lambda_up;
        }

        if converged {
            break;
        }
        if !improved {
            // No downhill step at any damping: p is a minimum to machine
            // precision, unless nothing was ever accepted
            converged = accepted_any;
            debug!("LM iter {iter}: damping limit reached, converged={converged}");
            break;
        }
    }

    let (_, j) = linearize(model, &p, free, data);
    Outcome {
        params: p,
        cost: current,
        iterations,
        converged,
        jtj: j.transpose() * j,
    }
}
