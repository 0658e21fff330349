//! Table of SO(n) embeddings, one orthogonal matrix per vocabulary item

use crate::algebra::GeneratorBasis;
use crate::core::optimizer::ManifoldOptimizer;
use crate::utils::linalg;
use crate::{LieEmbedError, Result};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Orthonormalize a uniform random matrix, flipping one column if needed so
/// the determinant is +1
pub fn random_rotation<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Array2<f64> {
    loop {
        let draw = Array2::from_shape_fn((n, n), |_| rng.gen_range(-1.0..1.0));
        let qr = linalg::to_nalgebra(draw.view()).qr();
        // Rank-deficient draw
        if qr.r().diagonal().iter().any(|r| r.abs() < 1e-10) {
            continue;
        }
        let mut q = linalg::from_nalgebra(&qr.q());
        if linalg::determinant(q.view()) < 0.0 {
            q.column_mut(0).mapv_inplace(|v| -v);
        }
        return q;
    }
}

/// Vocabulary-indexed table of `n×n` orthogonal matrices
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingTable {
    matrices: Array3<f64>,
}

impl EmbeddingTable {
    /// Every item starts at the identity
    pub fn identity(vocab_size: usize, n: usize) -> Result<Self> {
        if n < 2 {
            return Err(LieEmbedError::InvalidDimension(n));
        }
        let mut matrices = Array3::zeros((vocab_size, n, n));
        for mut m in matrices.outer_iter_mut() {
            m.diag_mut().fill(1.0);
        }
        Ok(EmbeddingTable { matrices })
    }

    /// Independent random rotations per item
    pub fn random<R: Rng + ?Sized>(vocab_size: usize, n: usize, rng: &mut R) -> Result<Self> {
        let mut table = Self::identity(vocab_size, n)?;
        for mut m in table.matrices.outer_iter_mut() {
            m.assign(&random_rotation(n, rng));
        }
        Ok(table)
    }

    /// Wrap existing matrices, checking each is orthogonal within `tolerance`
    pub fn from_matrices(matrices: Array3<f64>, tolerance: f64) -> Result<Self> {
        let (_, rows, cols) = matrices.dim();
        if rows != cols {
            return Err(LieEmbedError::ShapeMismatch(format!(
                "embeddings must be square, got {}x{}",
                rows, cols
            )));
        }
        if rows < 2 {
            return Err(LieEmbedError::InvalidDimension(rows));
        }
        for (id, m) in matrices.outer_iter().enumerate() {
            let defect = linalg::orthogonality_defect(m);
            if !(defect <= tolerance) {
                return Err(LieEmbedError::NumericalDivergence(format!(
                    "embedding {} is not orthogonal (‖MᵀM − I‖ = {:e})",
                    id, defect
                )));
            }
        }
        Ok(EmbeddingTable { matrices })
    }

    /// Number of items
    pub fn vocab_size(&self) -> usize {
        self.matrices.len_of(Axis(0))
    }

    /// Matrix dimension n
    pub fn dimension(&self) -> usize {
        self.matrices.len_of(Axis(1))
    }

    /// All embeddings, shape `V×n×n`
    pub fn matrices(&self) -> ArrayView3<'_, f64> {
        self.matrices.view()
    }

    /// Embedding of one item
    pub fn row(&self, id: usize) -> Result<ArrayView2<'_, f64>> {
        self.check_id(id)?;
        Ok(self.matrices.index_axis(Axis(0), id))
    }

    /// Copy the embeddings of `ids` into a `len×n×n` array
    pub fn gather(&self, ids: &[usize]) -> Result<Array3<f64>> {
        for &id in ids {
            self.check_id(id)?;
        }
        Ok(self.matrices.select(Axis(0), ids))
    }

    /// Largest `‖MᵀM − I‖_F` over the table
    pub fn max_orthogonality_defect(&self) -> f64 {
        self.matrices
            .outer_iter()
            .map(linalg::orthogonality_defect)
            .fold(0.0, f64::max)
    }

    /// Apply one optimizer step to the rows referenced by a batch.
    ///
    /// `grads[k]` is the loss gradient w.r.t. the embedding of `ids[k]`;
    /// repeated ids have their gradients summed and are updated once. Every
    /// new row is computed before any is written, so on error the table is
    /// unchanged. Returns the number of rows updated.
    pub fn apply_sparse(
        &mut self,
        optimizer: &dyn ManifoldOptimizer,
        ids: &[usize],
        grads: ArrayView3<f64>,
        learning_rate: f64,
    ) -> Result<usize> {
        let n = self.dimension();
        if grads.dim() != (ids.len(), n, n) {
            return Err(LieEmbedError::ShapeMismatch(format!(
                "gradients have shape {:?} for {} ids of dimension {}",
                grads.dim(),
                ids.len(),
                n
            )));
        }

        let mut aggregated: BTreeMap<usize, Array2<f64>> = BTreeMap::new();
        for (&id, grad) in ids.iter().zip(grads.outer_iter()) {
            self.check_id(id)?;
            aggregated
                .entry(id)
                .and_modify(|sum| *sum += &grad)
                .or_insert_with(|| grad.to_owned());
        }

        let matrices = &self.matrices;
        let updates = aggregated
            .into_par_iter()
            .map(|(id, grad)| {
                optimizer
                    .step(matrices.index_axis(Axis(0), id), grad.view(), learning_rate)
                    .map(|updated| (id, updated))
            })
            .collect::<Result<Vec<_>>>()?;

        for (id, updated) in &updates {
            self.matrices.index_axis_mut(Axis(0), *id).assign(updated);
        }
        Ok(updates.len())
    }

    /// Group elements as nested arrays, `[item][row][col]`
    pub fn group_elements(&self) -> Vec<Vec<Vec<f64>>> {
        self.matrices
            .outer_iter()
            .map(|m| m.outer_iter().map(|row| row.to_vec()).collect())
            .collect()
    }

    /// Principal-branch algebra coefficients per item, `[item][I]`.
    ///
    /// Fails with `NumericalDivergence` for an item with a rotation angle of
    /// exactly π, where no principal logarithm exists.
    pub fn algebra_coefficients(&self, basis: &GeneratorBasis) -> Result<Vec<Vec<f64>>> {
        if basis.dimension() != self.dimension() {
            return Err(LieEmbedError::ShapeMismatch(format!(
                "basis is for n = {}, table has n = {}",
                basis.dimension(),
                self.dimension()
            )));
        }
        self.matrices
            .outer_iter()
            .into_par_iter()
            .enumerate()
            .map(|(id, m)| {
                let log = linalg::logm_rotation(m).ok_or_else(|| {
                    LieEmbedError::NumericalDivergence(format!("embedding {} has no principal logarithm", id))
                })?;
                Ok(basis.coefficients_of(log.view())?.to_vec())
            })
            .collect()
    }

    fn check_id(&self, id: usize) -> Result<()> {
        if id >= self.vocab_size() {
            return Err(LieEmbedError::ShapeMismatch(format!(
                "vocabulary id {} out of range for {} items",
                id,
                self.vocab_size()
            )));
        }
        Ok(())
    }
}
