//! Generator basis and structure constants of the Lie algebra so(n)
//!
//! Generators are indexed by the unordered pairs `(i, j)` with `i < j`,
//! enumerated row by row across the upper triangle:
//!
//! ```text
//! n = 4:  (0,1) (0,2) (0,3) (1,2) (1,3) (2,3)
//!           0     1     2     3     4     5
//! ```
//!
//! Generator `I ↔ (i, j)` has `+1` at `(i, j)` and `−1` at `(j, i)`.

use crate::{LieEmbedError, Result};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2};
use tracing::debug;

/// Dimension `N = n(n-1)/2` of so(n)
pub fn algebra_dim(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

/// Number of pairs in the rows above row `i`
fn row_offset(n: usize, i: usize) -> usize {
    i * (2 * n - i - 1) / 2
}

/// Generator index of the pair `(i, j)`, `i < j < n`
pub fn pair_to_index(n: usize, i: usize, j: usize) -> usize {
    debug_assert!(i < j && j < n, "pair ({}, {}) is not in the upper triangle of {}", i, j, n);
    row_offset(n, i) + (j - i - 1)
}

/// Pair `(i, j)` of generator `index`, inverse of [`pair_to_index`].
///
/// The row is the largest `i` with `row_offset(i) <= index`, found from the
/// quadratic `i² − (2n−1)i + 2·index = 0` and nudged by at most one step to
/// absorb floating point rounding.
pub fn index_to_pair(n: usize, index: usize) -> (usize, usize) {
    debug_assert!(index < algebra_dim(n), "generator {} out of range for n = {}", index, n);
    let b = (2 * n - 1) as f64;
    let discriminant = b * b - 8.0 * index as f64;
    let mut i = ((b - discriminant.sqrt()) / 2.0).floor().max(0.0) as usize;
    while i > 0 && row_offset(n, i) > index {
        i -= 1;
    }
    while i + 1 < n && row_offset(n, i + 1) <= index {
        i += 1;
    }
    let j = index - row_offset(n, i) + i + 1;
    (i, j)
}

/// How the index pairs of two distinct generators overlap.
///
/// With `I ↔ (a, b)` and `J ↔ (c, d)`, `a < b`, `c < d`, at most one of these
/// holds; if none does the generators commute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BracketCase {
    /// `a == c`: `[T_ab, T_ad] = −T_bd`
    SharedRow,
    /// `b == d`: `[T_ab, T_cb] = −T_ac`
    SharedColumn,
    /// `b == c`: `[T_ab, T_bd] = T_ad`
    ColumnMeetsRow,
    /// `a == d`: `[T_ab, T_ca] = T_bc`
    RowMeetsColumn,
}

impl BracketCase {
    /// Classify a pair of generator index pairs
    pub fn classify(first: (usize, usize), second: (usize, usize)) -> Option<Self> {
        let (a, b) = first;
        let (c, d) = second;
        if first == second {
            None
        } else if a == c {
            Some(BracketCase::SharedRow)
        } else if b == d {
            Some(BracketCase::SharedColumn)
        } else if b == c {
            Some(BracketCase::ColumnMeetsRow)
        } else if a == d {
            Some(BracketCase::RowMeetsColumn)
        } else {
            None
        }
    }
}

/// Single nonzero entry `gamma[first, second, output] = coefficient`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BracketTerm {
    /// Left generator
    pub first: usize,
    /// Right generator
    pub second: usize,
    /// Generator the commutator lands on
    pub output: usize,
    /// +1 or −1
    pub coefficient: f64,
}

/// Basis of so(n) together with its structure constants.
///
/// Built once from `n` and immutable afterwards; share it by reference or
/// behind an `Arc`.
#[derive(Clone, Debug)]
pub struct GeneratorBasis {
    n: usize,
    pairs: Vec<(usize, usize)>,
    generators: Array3<f64>,
    gamma: Array3<f64>,
    terms: Vec<BracketTerm>,
}

impl GeneratorBasis {
    /// Build the basis of so(n). Fails with `InvalidDimension` when `n < 2`.
    pub fn new(n: usize) -> Result<Self> {
        if n < 2 {
            return Err(LieEmbedError::InvalidDimension(n));
        }
        let big_n = algebra_dim(n);
        let pairs: Vec<(usize, usize)> = (0..big_n).map(|index| index_to_pair(n, index)).collect();

        let mut generators = Array3::zeros((big_n, n, n));
        for (index, &(i, j)) in pairs.iter().enumerate() {
            generators[[index, i, j]] = 1.0;
            generators[[index, j, i]] = -1.0;
        }

        let mut gamma = Array3::zeros((big_n, big_n, big_n));
        let mut terms = Vec::new();
        for first in 0..big_n {
            for second in 0..big_n {
                if let Some((output, coefficient)) = bracket_of_pairs(n, pairs[first], pairs[second]) {
                    gamma[[first, second, output]] = coefficient;
                    terms.push(BracketTerm { first, second, output, coefficient });
                }
            }
        }

        debug!(n, generators = big_n, nonzero = terms.len(), "built so(n) basis");

        Ok(GeneratorBasis { n, pairs, generators, gamma, terms })
    }

    /// Matrix dimension `n`
    pub fn dimension(&self) -> usize {
        self.n
    }

    /// Algebra dimension `N = n(n-1)/2`
    pub fn algebra_dim(&self) -> usize {
        self.pairs.len()
    }

    /// Index pair of generator `index`
    pub fn pair(&self, index: usize) -> (usize, usize) {
        self.pairs[index]
    }

    /// Generator index of the unordered pair `{i, j}`, if it is one
    pub fn index_of(&self, i: usize, j: usize) -> Option<usize> {
        let (lo, hi) = if i < j { (i, j) } else { (j, i) };
        if lo == hi || hi >= self.n {
            None
        } else {
            Some(pair_to_index(self.n, lo, hi))
        }
    }

    /// Generator `T_index` as an n×n view
    pub fn generator(&self, index: usize) -> ArrayView2<'_, f64> {
        self.generators.index_axis(ndarray::Axis(0), index)
    }

    /// All generators, shape `N×n×n`
    pub fn generators(&self) -> &Array3<f64> {
        &self.generators
    }

    /// Structure constants, shape `N×N×N`
    pub fn structure_constants(&self) -> &Array3<f64> {
        &self.gamma
    }

    /// `gamma[I, J, K]`
    pub fn gamma(&self, first: usize, second: usize, output: usize) -> f64 {
        self.gamma[[first, second, output]]
    }

    /// Nonzero structure constants
    pub fn bracket_terms(&self) -> &[BracketTerm] {
        &self.terms
    }

    /// `Σ x_I T_I`
    pub fn algebra_element(&self, coefficients: ArrayView1<f64>) -> Result<Array2<f64>> {
        self.check_coefficients(coefficients)?;
        let mut x = Array2::zeros((self.n, self.n));
        for (&(i, j), &c) in self.pairs.iter().zip(coefficients.iter()) {
            x[[i, j]] += c;
            x[[j, i]] -= c;
        }
        Ok(x)
    }

    /// Coefficients `x_I = <X, T_I>/2` of the antisymmetric part of `X`
    pub fn coefficients_of(&self, x: ArrayView2<f64>) -> Result<Array1<f64>> {
        if x.dim() != (self.n, self.n) {
            return Err(LieEmbedError::ShapeMismatch(format!(
                "expected a {0}x{0} matrix, got {1}x{2}",
                self.n,
                x.nrows(),
                x.ncols()
            )));
        }
        Ok(self.pairs.iter().map(|&(i, j)| (x[[i, j]] - x[[j, i]]) / 2.0).collect())
    }

    /// Lie bracket in coefficients: `z_K = Σ x_I y_J gamma[I, J, K]`
    pub fn bracket(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> Result<Array1<f64>> {
        self.check_coefficients(x)?;
        self.check_coefficients(y)?;
        let mut z = Array1::zeros(self.algebra_dim());
        for term in &self.terms {
            z[term.output] += term.coefficient * x[term.first] * y[term.second];
        }
        Ok(z)
    }

    /// Adjoint action of `X = Σ x_K T_K` in the generator basis.
    ///
    /// Row `I` holds the coefficients of `[X, T_I]`:
    /// `B[I, J] = Σ_K x_K gamma[K, I, J]`.
    pub fn adjoint(&self, coefficients: ArrayView1<f64>) -> Result<Array2<f64>> {
        self.check_coefficients(coefficients)?;
        let big_n = self.algebra_dim();
        let mut b = Array2::zeros((big_n, big_n));
        for term in &self.terms {
            b[[term.second, term.output]] += coefficients[term.first] * term.coefficient;
        }
        Ok(b)
    }

    fn check_coefficients(&self, coefficients: ArrayView1<f64>) -> Result<()> {
        if coefficients.len() != self.algebra_dim() {
            return Err(LieEmbedError::ShapeMismatch(format!(
                "expected {} algebra coefficients for n = {}, got {}",
                self.algebra_dim(),
                self.n,
                coefficients.len()
            )));
        }
        Ok(())
    }
}

/// Commutator of two basis generators given by their index pairs.
///
/// Uses `[T_ab, T_cd] = δ_bc T_ad + δ_ad T_bc − δ_ac T_bd − δ_bd T_ac`, where
/// `T_yx = −T_xy`. Returns the output generator and its sign.
fn bracket_of_pairs(n: usize, first: (usize, usize), second: (usize, usize)) -> Option<(usize, f64)> {
    let (a, b) = first;
    let (c, d) = second;
    let (x, y, sign) = match BracketCase::classify(first, second)? {
        BracketCase::SharedRow => (b, d, -1.0),
        BracketCase::SharedColumn => (a, c, -1.0),
        BracketCase::ColumnMeetsRow => (a, d, 1.0),
        BracketCase::RowMeetsColumn => (b, c, 1.0),
    };
    if x < y {
        Some((pair_to_index(n, x, y), sign))
    } else {
        Some((pair_to_index(n, y, x), -sign))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn commutator(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
        a.dot(&b) - b.dot(&a)
    }

    #[test]
    fn test_generator_count() {
        for n in 2..=8 {
            let basis = GeneratorBasis::new(n).unwrap();
            assert_eq!(basis.algebra_dim(), n * (n - 1) / 2);
            assert_eq!(basis.generators().dim(), (n * (n - 1) / 2, n, n));
        }
        assert_eq!(GeneratorBasis::new(2).unwrap().algebra_dim(), 1);
    }

    #[test]
    fn test_invalid_dimension() {
        assert!(matches!(GeneratorBasis::new(0), Err(LieEmbedError::InvalidDimension(0))));
        assert!(matches!(GeneratorBasis::new(1), Err(LieEmbedError::InvalidDimension(1))));
    }

    #[test]
    fn test_row_major_enumeration() {
        let expected = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];
        for (index, &pair) in expected.iter().enumerate() {
            assert_eq!(index_to_pair(4, index), pair);
            assert_eq!(pair_to_index(4, pair.0, pair.1), index);
        }
    }

    #[test]
    fn test_index_bijection_large_n() {
        for n in 2..=40 {
            let mut next = 0;
            for i in 0..n {
                for j in (i + 1)..n {
                    assert_eq!(pair_to_index(n, i, j), next);
                    assert_eq!(index_to_pair(n, next), (i, j));
                    next += 1;
                }
            }
            assert_eq!(next, algebra_dim(n));
        }
    }

    #[test]
    fn test_generators_antisymmetric_and_independent() {
        for n in 2..=6 {
            let basis = GeneratorBasis::new(n).unwrap();
            let big_n = basis.algebra_dim();
            for index in 0..big_n {
                let t = basis.generator(index);
                assert_eq!(t.to_owned(), -t.t().to_owned());
            }
            // Gram matrix <T_I, T_J> = 2δ_IJ, so the generators are independent
            for first in 0..big_n {
                for second in 0..big_n {
                    let inner: f64 = (&basis.generator(first) * &basis.generator(second)).sum();
                    let expected = if first == second { 2.0 } else { 0.0 };
                    assert_eq!(inner, expected);
                }
            }
        }
    }

    #[test]
    fn test_generators_span_antisymmetric_matrices() {
        let basis = GeneratorBasis::new(4).unwrap();
        let a = Array2::from_shape_fn((4, 4), |(i, j)| (i as f64) * 1.5 - (j as f64) * 0.25 + 0.1);
        let skew = &a - &a.t();
        let coefficients = basis.coefficients_of(skew.view()).unwrap();
        let rebuilt = basis.algebra_element(coefficients.view()).unwrap();
        for (x, y) in rebuilt.iter().zip(skew.iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn test_structure_constants_antisymmetric() {
        for n in 2..=6 {
            let basis = GeneratorBasis::new(n).unwrap();
            let big_n = basis.algebra_dim();
            for i in 0..big_n {
                for j in 0..big_n {
                    for k in 0..big_n {
                        assert_eq!(basis.gamma(i, j, k), -basis.gamma(j, i, k));
                    }
                }
                for k in 0..big_n {
                    assert_eq!(basis.gamma(i, i, k), 0.0);
                }
            }
        }
    }

    #[test]
    fn test_commutator_identity() {
        for n in 2..=6 {
            let basis = GeneratorBasis::new(n).unwrap();
            let big_n = basis.algebra_dim();
            for i in 0..big_n {
                for j in 0..big_n {
                    let lhs = commutator(basis.generator(i), basis.generator(j));
                    let mut rhs = Array2::<f64>::zeros((n, n));
                    for k in 0..big_n {
                        rhs.scaled_add(basis.gamma(i, j, k), &basis.generator(k));
                    }
                    for (x, y) in lhs.iter().zip(rhs.iter()) {
                        assert!((x - y).abs() < 1e-5, "n={} I={} J={}", n, i, j);
                    }
                }
            }
        }
    }

    #[test]
    fn test_so3_levi_civita() {
        // With pairs (0,1), (0,2), (1,2) the constants are minus the Levi-Civita symbol
        fn levi_civita(i: usize, j: usize, k: usize) -> f64 {
            match (i, j, k) {
                (0, 1, 2) | (1, 2, 0) | (2, 0, 1) => 1.0,
                (0, 2, 1) | (2, 1, 0) | (1, 0, 2) => -1.0,
                _ => 0.0,
            }
        }
        let basis = GeneratorBasis::new(3).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                for k in 0..3 {
                    assert_eq!(basis.gamma(i, j, k), -levi_civita(i, j, k));
                }
            }
        }
    }

    #[test]
    fn test_single_output_per_bracket() {
        let basis = GeneratorBasis::new(5).unwrap();
        let big_n = basis.algebra_dim();
        for i in 0..big_n {
            for j in 0..big_n {
                let nonzero = (0..big_n).filter(|&k| basis.gamma(i, j, k) != 0.0).count();
                let expected = if BracketCase::classify(basis.pair(i), basis.pair(j)).is_some() { 1 } else { 0 };
                assert_eq!(nonzero, expected);
            }
        }
    }

    #[test]
    fn test_bracket_and_adjoint_agree_with_matrices() {
        let basis = GeneratorBasis::new(4).unwrap();
        let x = Array1::from_shape_fn(6, |i| 0.3 * i as f64 - 0.7);
        let y = Array1::from_shape_fn(6, |i| (i as f64).sin());
        let xm = basis.algebra_element(x.view()).unwrap();
        let ym = basis.algebra_element(y.view()).unwrap();
        let expected = basis.coefficients_of(commutator(xm.view(), ym.view()).view()).unwrap();
        let z = basis.bracket(x.view(), y.view()).unwrap();
        let ad = basis.adjoint(x.view()).unwrap();
        let via_adjoint = y.dot(&ad);
        for k in 0..6 {
            assert!((z[k] - expected[k]).abs() < 1e-12);
            assert!((via_adjoint[k] - expected[k]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_shape_checks() {
        let basis = GeneratorBasis::new(3).unwrap();
        let wrong = Array1::zeros(4);
        assert!(matches!(basis.algebra_element(wrong.view()), Err(LieEmbedError::ShapeMismatch(_))));
        let square = Array2::zeros((2, 2));
        assert!(matches!(basis.coefficients_of(square.view()), Err(LieEmbedError::ShapeMismatch(_))));
        assert_eq!(basis.index_of(2, 0), Some(1));
        assert_eq!(basis.index_of(1, 1), None);
        assert_eq!(basis.index_of(0, 3), None);
    }

    proptest! {
        #[test]
        fn prop_index_round_trip(n in 2usize..200, seed in 0usize..1_000_000) {
            let index = seed % algebra_dim(n);
            let (i, j) = index_to_pair(n, index);
            prop_assert!(i < j && j < n);
            prop_assert_eq!(pair_to_index(n, i, j), index);
        }
    }
}
