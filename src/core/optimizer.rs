//! Orthogonality-preserving update rules for SO(n)-valued parameters
//!
//! Both rules first project the raw gradient `G` at `V` onto the tangent
//! space, in `V`'s own frame: `Ω = VᵀG − GᵀV`. `Ω` is antisymmetric, so any
//! map from so(n) into SO(n) applied to `−lr·Ω` yields an orthogonal factor
//! and `V·M` stays on the manifold without renormalization.

use crate::utils::linalg;
use crate::{LieEmbedError, Result};
use ndarray::{Array2, ArrayView2};
use tracing::warn;

/// Given (parameter, gradient, learning rate), return the updated parameter
pub trait ManifoldOptimizer: Send + Sync {
    /// Short name of the rule
    fn name(&self) -> &str;

    /// One descent step on an n×n orthogonal parameter
    fn step(&self, param: ArrayView2<f64>, grad: ArrayView2<f64>, learning_rate: f64) -> Result<Array2<f64>>;
}

/// Riemannian gradient in the parameter's frame, `VᵀG − GᵀV`
pub fn tangent_projection(param: ArrayView2<f64>, grad: ArrayView2<f64>) -> Array2<f64> {
    param.t().dot(&grad) - grad.t().dot(&param)
}

/// Cayley transform `(I − A)(I + A)⁻¹`, `None` if `I + A` is singular within
/// `tolerance`
pub fn cayley_transform(a: ArrayView2<f64>, tolerance: f64) -> Option<Array2<f64>> {
    let eye = Array2::<f64>::eye(a.nrows());
    let minus = &eye - &a;
    let plus = &eye + &a;
    // (I − A) and (I + A)⁻¹ commute
    linalg::solve(plus.view(), minus.view(), tolerance)
}

fn check_step_inputs(param: ArrayView2<f64>, grad: ArrayView2<f64>) -> Result<()> {
    if param.nrows() != param.ncols() {
        return Err(LieEmbedError::ShapeMismatch(format!(
            "parameter must be square, got {}x{}",
            param.nrows(),
            param.ncols()
        )));
    }
    if grad.dim() != param.dim() {
        return Err(LieEmbedError::ShapeMismatch(format!(
            "gradient is {}x{} but parameter is {}x{}",
            grad.nrows(),
            grad.ncols(),
            param.nrows(),
            param.ncols()
        )));
    }
    if !linalg::is_finite(grad) {
        return Err(LieEmbedError::NumericalDivergence("non-finite gradient".to_string()));
    }
    Ok(())
}

/// `V ← V·(I − (lr/2)Ω)(I + (lr/2)Ω)⁻¹`
#[derive(Clone, Debug)]
pub struct CayleyOptimizer {
    singular_tolerance: f64,
    max_step_norm: f64,
}

impl CayleyOptimizer {
    /// Create the rule.
    ///
    /// `singular_tolerance` is the relative pivot size below which the
    /// denominator counts as singular; `max_step_norm` bounds `lr·‖Ω‖_F` on
    /// the single retry.
    pub fn new(singular_tolerance: f64, max_step_norm: f64) -> Self {
        CayleyOptimizer {
            singular_tolerance,
            max_step_norm,
        }
    }

    /// Multiplicative factor `M` for a given skew direction.
    ///
    /// If `I + (lr/2)Ω` is singular, retries once with `lr` reduced to at
    /// most `max_step_norm / ‖Ω‖_F`.
    pub fn update_factor(&self, skew: ArrayView2<f64>, learning_rate: f64) -> Result<Array2<f64>> {
        if let Some(m) = cayley_transform(skew.mapv(|v| v * learning_rate / 2.0).view(), self.singular_tolerance) {
            return Ok(m);
        }

        let norm = linalg::frobenius_norm(skew);
        let clamped = learning_rate.min(self.max_step_norm / norm.max(f64::MIN_POSITIVE));
        warn!(learning_rate, clamped, skew_norm = norm, "singular Cayley denominator, retrying with clamped rate");

        cayley_transform(skew.mapv(|v| v * clamped / 2.0).view(), self.singular_tolerance).ok_or_else(|| {
            LieEmbedError::SingularUpdate(format!(
                "I + (lr/2)Ω is singular for lr = {} and lr = {} (‖Ω‖ = {:e})",
                learning_rate, clamped, norm
            ))
        })
    }
}

impl Default for CayleyOptimizer {
    fn default() -> Self {
        CayleyOptimizer::new(1e-12, 1.0)
    }
}

impl ManifoldOptimizer for CayleyOptimizer {
    fn name(&self) -> &str {
        "cayley"
    }

    fn step(&self, param: ArrayView2<f64>, grad: ArrayView2<f64>, learning_rate: f64) -> Result<Array2<f64>> {
        check_step_inputs(param, grad)?;
        let skew = tangent_projection(param, grad);
        let m = self.update_factor(skew.view(), learning_rate)?;
        Ok(param.dot(&m))
    }
}

/// `V ← V·exp(−lr·Ω)`, the geodesic step
#[derive(Clone, Debug, Default)]
pub struct ExponentialRetraction;

impl ExponentialRetraction {
    /// Create the rule
    pub fn new() -> Self {
        ExponentialRetraction
    }
}

impl ManifoldOptimizer for ExponentialRetraction {
    fn name(&self) -> &str {
        "exponential"
    }

    fn step(&self, param: ArrayView2<f64>, grad: ArrayView2<f64>, learning_rate: f64) -> Result<Array2<f64>> {
        check_step_inputs(param, grad)?;
        let skew = tangent_projection(param, grad);
        let m = linalg::expm(skew.mapv(|v| -learning_rate * v).view())
            .ok_or_else(|| LieEmbedError::NumericalDivergence("non-finite update direction".to_string()))?;
        Ok(param.dot(&m))
    }
}
