//! Levenberg-Marquardt least squares for models with a runtime parameter count.
//!
//! Models expose weighted residuals `sqrt(w_i) * (model_i - data_i)`; the optimizer
//! minimizes their sum of squares. Jacobians are computed by forward differences so
//! models only need to evaluate themselves.
//!
//! # Algorithm
//!
//! 1. Build the Jacobian `J` and residual vector `r` at the current parameters
//! 2. Solve `(JᵀJ + λ diag(JᵀJ)) δ = -Jᵀr`
//! 3. Accept the step if chi² decreases (λ shrinks), otherwise grow λ and retry
//! 4. Stop once the relative chi² decrease falls under `ftol` or the step under `xtol`
//!
//! On convergence the parameter covariance `(JᵀJ)⁻¹` is reported so callers can
//! reject degenerate solutions.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Damping above which the optimizer gives up.
const MAX_LAMBDA: f64 = 1e10;

/// Floor applied to zero diagonal Hessian entries before damping.
const DIAGONAL_FLOOR: f64 = 1e-12;

/// Configuration for Levenberg-Marquardt optimization.
#[derive(Debug, Clone, PartialEq)]
pub struct LmConfig {
    /// Maximum number of residual evaluations.
    pub max_evaluations: usize,
    /// Relative chi² decrease that counts as converged.
    pub ftol: f64,
    /// Relative parameter step that counts as converged.
    pub xtol: f64,
    /// Initial damping parameter.
    pub initial_lambda: f64,
    /// Factor to increase lambda on failed step.
    pub lambda_up: f64,
    /// Factor to decrease lambda on successful step.
    pub lambda_down: f64,
    /// Relative forward-difference step for the Jacobian.
    pub diff_step: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_evaluations: 4000,
            ftol: 1e-5,
            xtol: 1e-5,
            initial_lambda: 0.001,
            lambda_up: 10.0,
            lambda_down: 0.1,
            diff_step: 1e-6,
        }
    }
}

/// Result of L-M optimization.
#[derive(Debug, Clone)]
pub struct LmResult {
    pub params: Vec<f64>,
    pub chi2: f64,
    pub converged: bool,
    pub iterations: usize,
    pub evaluations: usize,
    /// `(JᵀJ)⁻¹` at the solution, `None` when the normal matrix is singular
    pub covariance: Option<DMatrix<f64>>,
}

/// Errors that prevent optimization from starting or continuing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LmError {
    #[error("model rejected the starting parameters")]
    InvalidStart,
    #[error("model has {n_params} parameters but only {n_data} data points")]
    Underdetermined { n_params: usize, n_data: usize },
    #[error("non-finite residuals at the starting parameters")]
    NonFinite,
}

/// Trait for models that can be fit with L-M optimization.
pub trait LeastSquaresModel {
    /// Number of residuals produced per evaluation.
    fn n_data(&self) -> usize;

    /// Fill `out` with weighted residuals for `params`.
    ///
    /// Returns `false` when the parameters are outside the model's domain.
    fn residuals(&self, params: &[f64], out: &mut [f64]) -> bool;
}

struct Evaluator<'a, M: LeastSquaresModel> {
    model: &'a M,
    evaluations: usize,
}

impl<M: LeastSquaresModel> Evaluator<'_, M> {
    /// Evaluate residuals, returning chi² or `None` for invalid parameters.
    fn chi2(&mut self, params: &[f64], out: &mut [f64]) -> Option<f64> {
        self.evaluations += 1;
        if !self.model.residuals(params, out) {
            return None;
        }
        let chi2: f64 = out.iter().map(|r| r * r).sum();
        chi2.is_finite().then_some(chi2)
    }

    /// Forward-difference Jacobian, stepping backwards where the forward point is invalid.
    fn jacobian(
        &mut self,
        params: &[f64],
        residuals: &[f64],
        diff_step: f64,
        scratch: &mut [f64],
    ) -> Option<DMatrix<f64>> {
        let n_data = residuals.len();
        let mut jac = DMatrix::zeros(n_data, params.len());
        let mut trial = params.to_vec();

        for j in 0..params.len() {
            let h = diff_step * params[j].abs().max(1e-3);

            trial[j] = params[j] + h;
            let step = if self.chi2(&trial, scratch).is_some() {
                h
            } else {
                trial[j] = params[j] - h;
                self.chi2(&trial, scratch)?;
                -h
            };
            trial[j] = params[j];

            for i in 0..n_data {
                jac[(i, j)] = (scratch[i] - residuals[i]) / step;
            }
        }

        Some(jac)
    }
}

/// Run L-M optimization from `initial_params`.
///
/// # Returns
/// * `Ok(LmResult)` - Best parameters found; check `converged`
/// * `Err(LmError)` - If the starting point cannot be evaluated
pub fn minimize<M: LeastSquaresModel>(
    model: &M,
    initial_params: &[f64],
    config: &LmConfig,
) -> Result<LmResult, LmError> {
    let n_params = initial_params.len();
    let n_data = model.n_data();
    if n_data < n_params {
        return Err(LmError::Underdetermined { n_params, n_data });
    }

    let mut eval = Evaluator {
        model,
        evaluations: 0,
    };
    let mut residuals = vec![0.0; n_data];
    let mut scratch = vec![0.0; n_data];

    if !model.residuals(initial_params, &mut residuals) {
        return Err(LmError::InvalidStart);
    }
    let mut chi2 = eval.chi2(initial_params, &mut residuals).ok_or(LmError::NonFinite)?;

    let mut params = initial_params.to_vec();
    let mut lambda = config.initial_lambda;
    let mut converged = false;
    let mut iterations = 0;

    'outer: while eval.evaluations < config.max_evaluations {
        iterations += 1;

        if chi2 == 0.0 {
            converged = true;
            break;
        }

        let Some(jac) = eval.jacobian(&params, &residuals, config.diff_step, &mut scratch) else {
            break;
        };
        let hessian = jac.transpose() * &jac;
        let gradient = -(jac.transpose() * DVector::from_column_slice(&residuals));

        loop {
            let mut damped = hessian.clone();
            for i in 0..n_params {
                let d = damped[(i, i)].max(DIAGONAL_FLOOR);
                damped[(i, i)] = d * (1.0 + lambda);
            }

            let delta = damped.lu().solve(&gradient);
            let mut trial = params.clone();
            if let Some(delta) = delta.as_ref() {
                for (p, d) in trial.iter_mut().zip(delta.iter()) {
                    *p += d;
                }
            }

            let trial_chi2 = match delta {
                Some(_) => eval.chi2(&trial, &mut scratch),
                None => None,
            };

            match trial_chi2 {
                Some(new_chi2) if new_chi2 < chi2 => {
                    let step_small = params
                        .iter()
                        .zip(trial.iter())
                        .all(|(p, t)| (t - p).abs() <= config.xtol * (p.abs() + config.xtol));
                    let chi2_small = (chi2 - new_chi2) <= config.ftol * chi2;

                    params = trial;
                    chi2 = new_chi2;
                    std::mem::swap(&mut residuals, &mut scratch);
                    lambda *= config.lambda_down;

                    if step_small || chi2_small {
                        converged = true;
                        break 'outer;
                    }
                    break;
                }
                _ => {
                    lambda *= config.lambda_up;
                    if lambda > MAX_LAMBDA {
                        log::debug!("levenberg-marquardt damping exceeded {MAX_LAMBDA:e}");
                        break 'outer;
                    }
                    if eval.evaluations >= config.max_evaluations {
                        break 'outer;
                    }
                }
            }
        }
    }

    let covariance = if converged {
        eval.jacobian(&params, &residuals, config.diff_step, &mut scratch)
            .and_then(|jac| (jac.transpose() * &jac).try_inverse())
    } else {
        None
    };

    Ok(LmResult {
        params,
        chi2,
        converged,
        iterations,
        evaluations: eval.evaluations,
        covariance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// y = a * exp(-b * x) sampled at fixed abscissae
    struct Decay {
        x: Vec<f64>,
        y: Vec<f64>,
    }

    impl LeastSquaresModel for Decay {
        fn n_data(&self) -> usize {
            self.x.len()
        }

        fn residuals(&self, params: &[f64], out: &mut [f64]) -> bool {
            if params[1] < 0.0 {
                return false;
            }
            for ((o, &x), &y) in out.iter_mut().zip(&self.x).zip(&self.y) {
                *o = params[0] * (-params[1] * x).exp() - y;
            }
            true
        }
    }

    fn decay(a: f64, b: f64) -> Decay {
        let x: Vec<f64> = (0..30).map(|i| i as f64 * 0.2).collect();
        let y = x.iter().map(|x| a * (-b * x).exp()).collect();
        Decay { x, y }
    }

    #[test]
    fn test_recovers_exponential_decay() {
        let model = decay(3.0, 0.7);
        let result = minimize(&model, &[1.0, 0.2], &LmConfig::default()).unwrap();

        assert!(result.converged, "optimizer should converge on exact data");
        assert_relative_eq!(result.params[0], 3.0, epsilon = 1e-3);
        assert_relative_eq!(result.params[1], 0.7, epsilon = 1e-3);
        assert!(result.chi2 < 1e-6);
    }

    #[test]
    fn test_covariance_reported_on_convergence() {
        let mut model = decay(2.0, 0.5);
        // Perturb the data so chi² is not exactly zero
        for (i, y) in model.y.iter_mut().enumerate() {
            *y += if i % 2 == 0 { 1e-3 } else { -1e-3 };
        }
        let result = minimize(&model, &[1.5, 0.4], &LmConfig::default()).unwrap();

        assert!(result.converged);
        let cov = result.covariance.expect("covariance at solution");
        assert!(cov[(0, 0)] > 0.0);
        assert!(cov[(1, 1)] > 0.0);
    }

    #[test]
    fn test_invalid_start_rejected() {
        let model = decay(1.0, 1.0);
        let err = minimize(&model, &[1.0, -1.0], &LmConfig::default()).unwrap_err();
        assert_eq!(err, LmError::InvalidStart);
    }

    #[test]
    fn test_underdetermined_rejected() {
        let model = Decay {
            x: vec![0.0],
            y: vec![1.0],
        };
        let err = minimize(&model, &[1.0, 1.0], &LmConfig::default()).unwrap_err();
        assert!(matches!(err, LmError::Underdetermined { n_params: 2, n_data: 1 }));
    }

    #[test]
    fn test_evaluation_budget_limits_work() {
        let model = decay(3.0, 0.7);
        let config = LmConfig {
            max_evaluations: 3,
            ..LmConfig::default()
        };
        let result = minimize(&model, &[1.0, 0.2], &config).unwrap();

        assert!(!result.converged);
        assert!(result.covariance.is_none());
    }
}
