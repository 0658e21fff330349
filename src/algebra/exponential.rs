//! Exponential map from so(n) coefficients to SO(n) and its differential
//!
//! The differential is the closed-form Lie derivative
//! `d/dt exp(X + tH) = exp(X) · φ(ad_X)(H)` with `φ(z) = (1 − e^{−z})/z`,
//! evaluated in the generator basis. It is returned together with the forward
//! pass as a [`Pullback`] closure.

use crate::algebra::GeneratorBasis;
use crate::utils::linalg;
use crate::{LieEmbedError, Result};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::warn;

/// Default diagonal shift added to the adjoint matrix before inverting it
pub const DEFAULT_DIFFERENTIAL_EPSILON: f64 = 1e-4;

/// Gradient of a scalar w.r.t. the forward coefficients, given the gradient
/// w.r.t. the forward outputs (shape `items×n×n`).
pub type Pullback<'a> = Box<dyn Fn(ArrayView3<f64>) -> Result<Array2<f64>> + Send + Sync + 'a>;

/// Batched `x ↦ exp(Σ x_I T_I)`
#[derive(Clone, Debug)]
pub struct ExponentialMap {
    basis: Arc<GeneratorBasis>,
    epsilon: f64,
}

impl ExponentialMap {
    /// Create the map over a shared basis
    pub fn new(basis: Arc<GeneratorBasis>) -> Self {
        ExponentialMap {
            basis,
            epsilon: DEFAULT_DIFFERENTIAL_EPSILON,
        }
    }

    /// Override the regularizer used by the differential.
    ///
    /// Values that are not strictly positive and finite fall back to
    /// [`DEFAULT_DIFFERENTIAL_EPSILON`].
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        if epsilon > 0.0 && epsilon.is_finite() {
            self.epsilon = epsilon;
        } else {
            warn!(epsilon, "invalid differential epsilon, keeping the default");
            self.epsilon = DEFAULT_DIFFERENTIAL_EPSILON;
        }
        self
    }

    /// The underlying basis
    pub fn basis(&self) -> &GeneratorBasis {
        &self.basis
    }

    /// Differential regularizer
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Exponential of a single coefficient vector
    pub fn exp(&self, coefficients: ArrayView1<f64>) -> Result<Array2<f64>> {
        let x = self.basis.algebra_element(coefficients)?;
        linalg::expm(x.view()).ok_or_else(|| {
            LieEmbedError::NumericalDivergence("non-finite algebra coefficients".to_string())
        })
    }

    /// Exponentiate every row of `coefficients` (shape `items×N`).
    ///
    /// Returns `items×n×n` orthogonal matrices with determinant +1.
    pub fn forward(&self, coefficients: ArrayView2<f64>) -> Result<Array3<f64>> {
        self.check_coefficients(coefficients)?;
        let matrices = coefficients
            .outer_iter()
            .into_par_iter()
            .map(|x| self.exp(x))
            .collect::<Result<Vec<_>>>()?;
        Ok(stack(self.basis.dimension(), &matrices))
    }

    /// Gradient w.r.t. `coefficients` given `upstream = ∂L/∂exp(X)` per item
    pub fn backward(&self, coefficients: ArrayView2<f64>, upstream: ArrayView3<f64>) -> Result<Array2<f64>> {
        let outputs = self.forward(coefficients)?;
        self.pull_back(coefficients, outputs.view(), upstream)
    }

    /// Forward pass bundled with its differential.
    ///
    /// The returned closure reuses the forward outputs, so the exponential is
    /// computed once per item.
    pub fn forward_differentiable<'a>(
        &'a self,
        coefficients: ArrayView2<'a, f64>,
    ) -> Result<(Array3<f64>, Pullback<'a>)> {
        let outputs = self.forward(coefficients)?;
        let cached = outputs.clone();
        let pullback: Pullback<'a> =
            Box::new(move |upstream: ArrayView3<f64>| self.pull_back(coefficients, cached.view(), upstream));
        Ok((outputs, pullback))
    }

    fn pull_back(
        &self,
        coefficients: ArrayView2<f64>,
        outputs: ArrayView3<f64>,
        upstream: ArrayView3<f64>,
    ) -> Result<Array2<f64>> {
        let n = self.basis.dimension();
        if upstream.dim() != (coefficients.nrows(), n, n) {
            return Err(LieEmbedError::ShapeMismatch(format!(
                "upstream gradient has shape {:?}, expected ({}, {}, {})",
                upstream.dim(),
                coefficients.nrows(),
                n,
                n
            )));
        }
        let rows = (0..coefficients.nrows())
            .into_par_iter()
            .map(|item| {
                coefficient_gradient(
                    &self.basis,
                    coefficients.row(item),
                    outputs.index_axis(Axis(0), item),
                    upstream.index_axis(Axis(0), item),
                    self.epsilon,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut grads = Array2::<f64>::zeros(coefficients.raw_dim());
        for (mut row, grad) in grads.outer_iter_mut().zip(rows.iter()) {
            row.assign(grad);
        }
        Ok(grads)
    }

    fn check_coefficients(&self, coefficients: ArrayView2<f64>) -> Result<()> {
        if coefficients.ncols() != self.basis.algebra_dim() {
            return Err(LieEmbedError::ShapeMismatch(format!(
                "coefficient table has {} columns, so({}) needs {}",
                coefficients.ncols(),
                self.basis.dimension(),
                self.basis.algebra_dim()
            )));
        }
        Ok(())
    }
}

/// Closed-form gradient for one item.
///
/// `x` are the algebra coefficients and `upstream` is `∂L/∂exp(X)`. Pure
/// function of its arguments.
pub fn exp_differential(
    basis: &GeneratorBasis,
    x: ArrayView1<f64>,
    upstream: ArrayView2<f64>,
    epsilon: f64,
) -> Result<Array1<f64>> {
    let n = basis.dimension();
    if upstream.dim() != (n, n) {
        return Err(LieEmbedError::ShapeMismatch(format!(
            "upstream gradient is {}x{}, expected {}x{}",
            upstream.nrows(),
            upstream.ncols(),
            n,
            n
        )));
    }
    let x_matrix = basis.algebra_element(x)?;
    let output = linalg::expm(x_matrix.view()).ok_or_else(|| {
        LieEmbedError::NumericalDivergence("non-finite algebra coefficients".to_string())
    })?;
    coefficient_gradient(basis, x, output.view(), upstream, epsilon)
}

fn coefficient_gradient(
    basis: &GeneratorBasis,
    x: ArrayView1<f64>,
    output: ArrayView2<f64>,
    upstream: ArrayView2<f64>,
    epsilon: f64,
) -> Result<Array1<f64>> {
    let big_n = basis.algebra_dim();

    // B = ad_X + εI, S = (I − exp(−B))·B⁻¹; both factors are functions of B
    // and commute, so S = B⁻¹·(I − exp(−B)).
    let mut b = basis.adjoint(x)?;
    b.diag_mut().mapv_inplace(|v| v + epsilon);
    let exp_neg_b = linalg::expm((-&b).view()).ok_or_else(|| {
        LieEmbedError::NumericalDivergence("non-finite adjoint matrix".to_string())
    })?;
    let numerator = Array2::<f64>::eye(big_n) - exp_neg_b;
    let s = linalg::solve(b.view(), numerator.view(), f64::EPSILON).ok_or_else(|| {
        LieEmbedError::NumericalDivergence("adjoint matrix is singular; raise the differential epsilon".to_string())
    })?;

    // c_L = <exp(X)ᵀ·G, T_L>
    let projected = output.t().dot(&upstream);
    let c: Array1<f64> = (0..big_n)
        .map(|l| {
            let (i, j) = basis.pair(l);
            projected[[i, j]] - projected[[j, i]]
        })
        .collect();

    Ok(s.dot(&c))
}

fn stack(n: usize, matrices: &[Array2<f64>]) -> Array3<f64> {
    let mut out = Array3::zeros((matrices.len(), n, n));
    for (mut slot, m) in out.outer_iter_mut().zip(matrices) {
        slot.assign(m);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::linalg::{determinant, orthogonality_defect};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_coefficients(rng: &mut StdRng, items: usize, big_n: usize, scale: f64) -> Array2<f64> {
        Array2::from_shape_fn((items, big_n), |_| rng.gen_range(-scale..scale))
    }

    /// Central differences of `loss(exp(Σ x_I T_I))`
    fn finite_difference<F>(map: &ExponentialMap, x: ArrayView1<f64>, loss: F) -> Array1<f64>
    where
        F: Fn(ArrayView2<f64>) -> f64,
    {
        let h = 1e-6;
        Array1::from_shape_fn(x.len(), |i| {
            let mut plus = x.to_owned();
            let mut minus = x.to_owned();
            plus[i] += h;
            minus[i] -= h;
            let lp = loss(map.exp(plus.view()).unwrap().view());
            let lm = loss(map.exp(minus.view()).unwrap().view());
            (lp - lm) / (2.0 * h)
        })
    }

    fn relative_error(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
        let diff = (a - b).mapv(|v| v * v).sum().sqrt();
        let scale = b.mapv(|v| v * v).sum().sqrt().max(1e-8);
        diff / scale
    }

    #[test]
    fn test_forward_orthogonal_with_unit_determinant() {
        let mut rng = StdRng::seed_from_u64(7);
        for n in 2..=6 {
            let basis = Arc::new(GeneratorBasis::new(n).unwrap());
            let map = ExponentialMap::new(basis.clone());
            let coefficients = random_coefficients(&mut rng, 16, basis.algebra_dim(), 0.1);
            let outputs = map.forward(coefficients.view()).unwrap();
            assert_eq!(outputs.dim(), (16, n, n));
            for m in outputs.outer_iter() {
                assert!(orthogonality_defect(m) < 1e-4);
                assert!((determinant(m) - 1.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_forward_large_coefficients_stay_orthogonal() {
        let mut rng = StdRng::seed_from_u64(11);
        let basis = Arc::new(GeneratorBasis::new(5).unwrap());
        let map = ExponentialMap::new(basis.clone());
        let coefficients = random_coefficients(&mut rng, 8, basis.algebra_dim(), 10.0);
        for m in map.forward(coefficients.view()).unwrap().outer_iter() {
            assert!(orthogonality_defect(m) < 1e-9);
        }
    }

    #[test]
    fn test_so2_is_plane_rotation() {
        let map = ExponentialMap::new(Arc::new(GeneratorBasis::new(2).unwrap()));
        let theta = 0.8;
        let m = map.exp(ndarray::arr1(&[theta]).view()).unwrap();
        // T_0 = [[0, 1], [-1, 0]] rotates clockwise
        assert!((m[[0, 0]] - theta.cos()).abs() < 1e-12);
        assert!((m[[0, 1]] - theta.sin()).abs() < 1e-12);
        assert!((m[[1, 0]] + theta.sin()).abs() < 1e-12);
    }

    #[test]
    fn test_forward_shape_mismatch() {
        let map = ExponentialMap::new(Arc::new(GeneratorBasis::new(3).unwrap()));
        let coefficients = Array2::zeros((2, 4));
        assert!(matches!(map.forward(coefficients.view()), Err(LieEmbedError::ShapeMismatch(_))));
    }

    #[test]
    fn test_forward_rejects_non_finite() {
        let map = ExponentialMap::new(Arc::new(GeneratorBasis::new(3).unwrap()));
        let mut coefficients = Array2::zeros((2, 3));
        coefficients[[1, 2]] = f64::INFINITY;
        assert!(matches!(
            map.forward(coefficients.view()),
            Err(LieEmbedError::NumericalDivergence(_))
        ));
    }

    #[test]
    fn test_differential_matches_finite_differences_linear_loss() {
        let mut rng = StdRng::seed_from_u64(3);
        for n in 2..=4 {
            let basis = Arc::new(GeneratorBasis::new(n).unwrap());
            let map = ExponentialMap::new(basis.clone());
            for _ in 0..5 {
                let x = Array1::from_shape_fn(basis.algebra_dim(), |_| rng.gen_range(-1.0..1.0));
                let weights = Array2::from_shape_fn((n, n), |_| rng.gen_range(-1.0..1.0));
                let analytic = exp_differential(&basis, x.view(), weights.view(), map.epsilon()).unwrap();
                let numeric = finite_difference(&map, x.view(), |y| (&y * &weights).sum());
                let err = relative_error(&analytic, &numeric);
                assert!(err < 1e-3, "n={} relative error {}", n, err);
            }
        }
    }

    #[test]
    fn test_differential_matches_finite_differences_similarity_loss() {
        // (tr(Yᵀ A)/n)², the pair similarity used in training
        let mut rng = StdRng::seed_from_u64(5);
        for n in 2..=4 {
            let basis = Arc::new(GeneratorBasis::new(n).unwrap());
            let map = ExponentialMap::new(basis.clone());
            let other = map
                .exp(Array1::from_shape_fn(basis.algebra_dim(), |_| rng.gen_range(-1.0..1.0)).view())
                .unwrap();
            let x = Array1::from_shape_fn(basis.algebra_dim(), |_| rng.gen_range(-1.0..1.0));
            let y = map.exp(x.view()).unwrap();
            let trace = (&y * &other).sum() / n as f64;
            let upstream = other.mapv(|v| 2.0 * trace * v / n as f64);

            let analytic = exp_differential(&basis, x.view(), upstream.view(), map.epsilon()).unwrap();
            let numeric = finite_difference(&map, x.view(), |y| {
                let t = (&y * &other).sum() / n as f64;
                t * t
            });
            let err = relative_error(&analytic, &numeric);
            assert!(err < 1e-3, "n={} relative error {}", n, err);
        }
    }

    #[test]
    fn test_differential_at_origin() {
        // exp'(0) is the identity map, up to the (1 − e^{−ε})/ε factor
        let basis = GeneratorBasis::new(4).unwrap();
        let x = Array1::zeros(basis.algebra_dim());
        let upstream = Array2::from_shape_fn((4, 4), |(i, j)| (i * 4 + j) as f64);
        let grad = exp_differential(&basis, x.view(), upstream.view(), DEFAULT_DIFFERENTIAL_EPSILON).unwrap();
        for l in 0..basis.algebra_dim() {
            let (i, j) = basis.pair(l);
            let expected = upstream[[i, j]] - upstream[[j, i]];
            assert!((grad[l] - expected).abs() < 1e-3 * expected.abs().max(1.0));
        }
    }

    #[test]
    fn test_invalid_epsilon_falls_back_to_default() {
        let basis = Arc::new(GeneratorBasis::new(3).unwrap());
        for epsilon in [0.0, -1e-3, f64::NAN, f64::INFINITY] {
            let map = ExponentialMap::new(basis.clone()).with_epsilon(epsilon);
            assert_eq!(map.epsilon(), DEFAULT_DIFFERENTIAL_EPSILON);

            // The differential at the origin stays well defined
            let coefficients = Array2::zeros((1, 3));
            let upstream = Array3::from_shape_fn((1, 3, 3), |(_, i, j)| (i + 2 * j) as f64);
            let grad = map.backward(coefficients.view(), upstream.view()).unwrap();
            assert!(grad.iter().all(|g| g.is_finite()));
        }
        assert_eq!(ExponentialMap::new(basis).with_epsilon(1e-6).epsilon(), 1e-6);
    }

    #[test]
    fn test_pullback_matches_backward() {
        let mut rng = StdRng::seed_from_u64(13);
        let basis = Arc::new(GeneratorBasis::new(3).unwrap());
        let map = ExponentialMap::new(basis.clone());
        let coefficients = random_coefficients(&mut rng, 4, 3, 0.5);
        let upstream = Array3::from_shape_fn((4, 3, 3), |_| rng.gen_range(-1.0..1.0));

        let (outputs, pullback) = map.forward_differentiable(coefficients.view()).unwrap();
        assert_eq!(outputs, map.forward(coefficients.view()).unwrap());
        let via_closure = pullback(upstream.view()).unwrap();
        let via_backward = map.backward(coefficients.view(), upstream.view()).unwrap();
        assert_eq!(via_closure.dim(), (4, 3));
        for (a, b) in via_closure.iter().zip(via_backward.iter()) {
            assert!((a - b).abs() < 1e-12);
        }

        let wrong = Array3::zeros((3, 3, 3));
        assert!(matches!(pullback(wrong.view()), Err(LieEmbedError::ShapeMismatch(_))));
    }
}
