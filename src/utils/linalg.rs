//! Dense linear algebra on small square matrices
//!
//! Matrices are stored as `ndarray` arrays throughout the crate; LU and QR
//! factorizations and the matrix exponential are delegated to `nalgebra`.

use nalgebra::DMatrix;
use ndarray::{Array2, ArrayView2};

/// Distance from the identity at which the logarithm series takes over
const LOG_SERIES_RADIUS: f64 = 0.25;

const MAX_SQUARE_ROOTS: usize = 40;
const MAX_ROOT_ITERATIONS: usize = 60;
const MAX_SERIES_TERMS: usize = 80;

/// Copy an ndarray matrix into an nalgebra matrix
pub fn to_nalgebra(a: ArrayView2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

/// Copy an nalgebra matrix back into an ndarray matrix
pub fn from_nalgebra(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Frobenius norm
pub fn frobenius_norm(a: ArrayView2<f64>) -> f64 {
    a.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// True when every entry is finite
pub fn is_finite(a: ArrayView2<f64>) -> bool {
    a.iter().all(|v| v.is_finite())
}

/// `‖MᵀM − I‖_F`, zero exactly when `M` is orthogonal
pub fn orthogonality_defect(m: ArrayView2<f64>) -> f64 {
    let mut gram = m.t().dot(&m);
    for i in 0..gram.nrows() {
        gram[[i, i]] -= 1.0;
    }
    frobenius_norm(gram.view())
}

/// Determinant via LU
pub fn determinant(a: ArrayView2<f64>) -> f64 {
    to_nalgebra(a).determinant()
}

/// Solve `A·X = B` by LU with partial pivoting.
///
/// Returns `None` when the smallest pivot of `A` is below `tolerance`
/// relative to the largest one.
pub fn solve(a: ArrayView2<f64>, b: ArrayView2<f64>, tolerance: f64) -> Option<Array2<f64>> {
    let lu = to_nalgebra(a).lu();
    let pivots = lu.u().diagonal().map(|p| p.abs());
    let largest = pivots.max();
    if largest == 0.0 || pivots.min() <= tolerance * largest {
        return None;
    }
    lu.solve(&to_nalgebra(b)).map(|x| from_nalgebra(&x))
}

/// Matrix inverse, `None` when singular within `tolerance`
pub fn inverse(a: ArrayView2<f64>, tolerance: f64) -> Option<Array2<f64>> {
    solve(a, Array2::eye(a.nrows()).view(), tolerance)
}

/// Matrix exponential, by nalgebra's scaling and squaring Padé approximant.
///
/// Returns `None` for non-finite input or output.
pub fn expm(a: ArrayView2<f64>) -> Option<Array2<f64>> {
    if !is_finite(a) {
        return None;
    }
    let result = from_nalgebra(&to_nalgebra(a).exp());
    if is_finite(result.view()) {
        Some(result)
    } else {
        None
    }
}

/// Principal square root by the Denman–Beavers iteration
fn sqrtm(a: ArrayView2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut y = a.to_owned();
    let mut z = Array2::<f64>::eye(n);
    for _ in 0..MAX_ROOT_ITERATIONS {
        let y_inv = inverse(y.view(), f64::EPSILON)?;
        let z_inv = inverse(z.view(), f64::EPSILON)?;
        let y_next = (&y + &z_inv) * 0.5;
        let z_next = (&z + &y_inv) * 0.5;
        let delta = frobenius_norm((&y_next - &y).view());
        y = y_next;
        z = z_next;
        if delta <= 1e-14 * (1.0 + frobenius_norm(y.view())) {
            return Some(y);
        }
    }
    None
}

/// Principal logarithm of a rotation matrix.
///
/// Inverse scaling and squaring: take square roots until the matrix is within
/// 0.25 of the identity, sum the `log(I + E)` series there and scale back up.
/// The result is projected onto the antisymmetric matrices. Returns `None`
/// when no principal branch exists (an eigenvalue at −1).
pub fn logm_rotation(q: ArrayView2<f64>) -> Option<Array2<f64>> {
    let n = q.nrows();
    let eye = Array2::<f64>::eye(n);
    let mut root = q.to_owned();
    let mut roots = 0;
    while frobenius_norm((&root - &eye).view()) > LOG_SERIES_RADIUS {
        if roots == MAX_SQUARE_ROOTS {
            return None;
        }
        root = sqrtm(root.view())?;
        roots += 1;
    }

    let e = &root - &eye;
    let mut log = Array2::<f64>::zeros((n, n));
    let mut power = eye;
    for k in 1..=MAX_SERIES_TERMS {
        power = power.dot(&e);
        let term = power.mapv(|v| v / k as f64);
        if k % 2 == 1 {
            log += &term;
        } else {
            log -= &term;
        }
        if frobenius_norm(term.view()) < 1e-18 {
            break;
        }
    }

    let log = log * 2f64.powi(roots as i32);
    let skew = (&log - &log.t()) * 0.5;
    if is_finite(skew.view()) {
        Some(skew)
    } else {
        None
    }
}
