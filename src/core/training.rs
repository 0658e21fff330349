//! Training driver for SO(n) embeddings
//!
//! Each constraint asks that the similarity `(tr(AᵀB)/n)²` of two embeddings
//! match a co-occurrence target. Batches are applied sequentially through a
//! [`ManifoldOptimizer`]; the driver keeps the best table seen so far.

use crate::algebra::ExponentialMap;
use crate::core::config::LieEmbedConfig;
use crate::core::embedding_table::EmbeddingTable;
use crate::core::optimizer::ManifoldOptimizer;
use crate::{LieEmbedError, Result};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Target similarity for a pair of vocabulary items
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CooccurrenceConstraint {
    /// First item
    pub id_a: usize,
    /// Second item
    pub id_b: usize,
    /// Target in [0, 1]
    pub target: f64,
}

impl CooccurrenceConstraint {
    /// Create a constraint
    pub fn new(id_a: usize, id_b: usize, target: f64) -> Self {
        CooccurrenceConstraint { id_a, id_b, target }
    }
}

/// `(tr(AᵀB)/n)²`, in [0, 1] for orthogonal `A`, `B`
pub fn similarity(a: ArrayView2<f64>, b: ArrayView2<f64>) -> f64 {
    let t = (&a * &b).sum() / a.nrows() as f64;
    t * t
}

/// Gradient of [`similarity`] with respect to `a`
pub fn similarity_gradient(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
    let n = a.nrows() as f64;
    let t = (&a * &b).sum() / n;
    b.mapv(|v| 2.0 * t * v / n)
}

/// Squared normalized co-occurrence, `(c_ab / max(√(o_a·o_b), ε))²`
pub fn target_similarity(cooccurrence: f64, occurrence_a: f64, occurrence_b: f64, epsilon: f64) -> f64 {
    let normalizer = (occurrence_a * occurrence_b).sqrt().max(epsilon);
    let ratio = cooccurrence / normalizer;
    ratio * ratio
}

/// Loss and per-row gradients for one batch
#[derive(Clone, Debug)]
pub struct BatchEvaluation {
    /// Σ |similarity − target|
    pub loss: f64,
    /// Row ids, two per constraint
    pub ids: Vec<usize>,
    /// Gradient for each entry of `ids`
    pub grads: Array3<f64>,
}

/// Absolute-error loss of a batch and its gradient w.r.t. the touched rows
pub fn evaluate_batch(table: &EmbeddingTable, batch: &[CooccurrenceConstraint]) -> Result<BatchEvaluation> {
    let n = table.dimension();
    let mut ids = Vec::with_capacity(2 * batch.len());
    let mut grads = Array3::zeros((2 * batch.len(), n, n));
    let mut loss = 0.0;

    for (k, constraint) in batch.iter().enumerate() {
        if !(0.0..=1.0).contains(&constraint.target) {
            return Err(LieEmbedError::InvalidConfig(format!(
                "target similarity {} for ({}, {}) is outside [0, 1]",
                constraint.target, constraint.id_a, constraint.id_b
            )));
        }
        let a = table.row(constraint.id_a)?;
        let b = table.row(constraint.id_b)?;
        let residual = similarity(a, b) - constraint.target;
        loss += residual.abs();

        let sign = if residual > 0.0 {
            1.0
        } else if residual < 0.0 {
            -1.0
        } else {
            0.0
        };
        grads
            .index_axis_mut(Axis(0), 2 * k)
            .assign(&(similarity_gradient(a, b) * sign));
        grads
            .index_axis_mut(Axis(0), 2 * k + 1)
            .assign(&(similarity_gradient(b, a) * sign));
        ids.push(constraint.id_a);
        ids.push(constraint.id_b);
    }

    if !loss.is_finite() {
        return Err(LieEmbedError::NumericalDivergence(format!("batch loss is {}", loss)));
    }
    Ok(BatchEvaluation { loss, ids, grads })
}

/// Batch loss with the embeddings parameterized in the Lie algebra.
///
/// Row `i` of `coefficients` holds the so(n) coordinates of item `i`, whose
/// embedding is their exponential. Returns the loss and its gradient with
/// respect to `coefficients`; rows not touched by the batch get zeros.
pub fn evaluate_coefficients<'a>(
    map: &'a ExponentialMap,
    coefficients: ArrayView2<'a, f64>,
    batch: &[CooccurrenceConstraint],
) -> Result<(f64, Array2<f64>)> {
    let (matrices, pullback) = map.forward_differentiable(coefficients)?;
    let table = EmbeddingTable::from_matrices(matrices, 1e-8)?;
    let evaluation = evaluate_batch(&table, batch)?;

    let mut upstream = Array3::<f64>::zeros(table.matrices().raw_dim());
    for (&id, grad) in evaluation.ids.iter().zip(evaluation.grads.outer_iter()) {
        let mut row = upstream.index_axis_mut(Axis(0), id);
        row += &grad;
    }
    let gradient = pullback(upstream.view())?;
    Ok((evaluation.loss, gradient))
}

/// Loss history and best-known state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingMetrics {
    /// Running mean per-constraint loss after each step
    pub loss_history: Vec<f64>,
    /// Best running loss
    pub best_loss: f64,
    /// Step with the best running loss
    pub best_step: usize,
    /// Steps taken
    pub steps: usize,
    /// Total training time
    pub total_time: Duration,
}

impl TrainingMetrics {
    /// Create new metrics tracker
    pub fn new() -> Self {
        TrainingMetrics {
            loss_history: Vec::new(),
            best_loss: f64::INFINITY,
            best_step: 0,
            steps: 0,
            total_time: Duration::from_secs(0),
        }
    }

    /// Record the running loss after a step, returning whether it is a new best
    pub fn record(&mut self, loss: f64) -> bool {
        self.loss_history.push(loss);
        self.steps += 1;
        if loss < self.best_loss {
            self.best_loss = loss;
            self.best_step = self.steps;
            true
        } else {
            false
        }
    }

    /// Check if the best loss is older than `patience` steps
    pub fn should_stop_early(&self, patience: usize) -> bool {
        self.steps > self.best_step + patience
    }

    /// Get summary statistics
    pub fn summary(&self) -> String {
        format!(
            "Best loss: {:.6} at step {}\nSteps: {}\nTotal training time: {:.2}s\nFinal loss: {:.6}",
            self.best_loss,
            self.best_step,
            self.steps,
            self.total_time.as_secs_f32(),
            self.loss_history.last().unwrap_or(&0.0)
        )
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Why [`Trainer::train`] returned
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Running loss fell below the configured threshold
    Converged,
    /// No improvement within the patience window
    Patience,
    /// Step budget exhausted
    MaxSteps,
}

/// Outcome of one update
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepReport {
    /// Batch loss before the update
    pub loss_before: f64,
    /// Batch loss after the update
    pub loss_after: f64,
    /// Distinct rows written
    pub rows_updated: usize,
}

/// Sequential trainer owning the embedding table
pub struct Trainer {
    table: EmbeddingTable,
    best_table: EmbeddingTable,
    optimizer: Box<dyn ManifoldOptimizer>,
    config: LieEmbedConfig,
    metrics: TrainingMetrics,
}

impl Trainer {
    /// Wrap an existing table
    pub fn new(table: EmbeddingTable, optimizer: Box<dyn ManifoldOptimizer>, config: LieEmbedConfig) -> Result<Self> {
        config.validate()?;
        if table.dimension() != config.dimension {
            return Err(LieEmbedError::ShapeMismatch(format!(
                "table has n = {}, config has n = {}",
                table.dimension(),
                config.dimension
            )));
        }
        Ok(Trainer {
            best_table: table.clone(),
            table,
            optimizer,
            config,
            metrics: TrainingMetrics::new(),
        })
    }

    /// Random orthogonal table of `vocab_size` items and the configured optimizer
    pub fn from_config(vocab_size: usize, config: LieEmbedConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_entropy(),
        };
        let table = EmbeddingTable::random(vocab_size, config.dimension, &mut rng)?;
        let optimizer = config.build_optimizer();
        Self::new(table, optimizer, config)
    }

    /// Current table
    pub fn table(&self) -> &EmbeddingTable {
        &self.table
    }

    /// Best table seen so far
    pub fn best_table(&self) -> &EmbeddingTable {
        &self.best_table
    }

    /// Training metrics
    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &LieEmbedConfig {
        &self.config
    }

    /// Consume the trainer, keeping the current table
    pub fn into_table(self) -> EmbeddingTable {
        self.table
    }

    /// Batch loss without updating
    pub fn evaluate(&self, batch: &[CooccurrenceConstraint]) -> Result<f64> {
        Ok(evaluate_batch(&self.table, batch)?.loss)
    }

    /// One update on a batch.
    ///
    /// The sparse update is atomic: if computing any new row fails, the table
    /// is left as it was. Evaluating the post-update loss happens after the
    /// commit.
    pub fn step(&mut self, batch: &[CooccurrenceConstraint]) -> Result<StepReport> {
        let evaluation = evaluate_batch(&self.table, batch)?;
        let rows_updated = self.table.apply_sparse(
            self.optimizer.as_ref(),
            &evaluation.ids,
            evaluation.grads.view(),
            self.config.learning_rate,
        )?;
        let loss_after = self.evaluate(batch)?;
        debug!(loss_before = evaluation.loss, loss_after, rows_updated, "applied batch");
        Ok(StepReport {
            loss_before: evaluation.loss,
            loss_after,
            rows_updated,
        })
    }

    /// Roll the table back to the best-known parameters
    pub fn restore_best(&mut self) {
        self.table = self.best_table.clone();
    }

    /// Cycle through `batches` until the running mean per-constraint loss is
    /// below the threshold, patience runs out or the step budget is spent,
    /// then restore the best table.
    ///
    /// The running loss keeps the post-update loss of the latest visit to each
    /// batch. A divergent step is reported after restoring the best table.
    pub fn train(&mut self, batches: &[Vec<CooccurrenceConstraint>]) -> Result<StopReason> {
        let total_constraints: usize = batches.iter().map(Vec::len).sum();
        if total_constraints == 0 {
            return Err(LieEmbedError::InvalidConfig("no constraints to train on".to_string()));
        }
        info!(
            batches = batches.len(),
            constraints = total_constraints,
            optimizer = self.optimizer.name(),
            "starting training"
        );
        let start = Instant::now();

        let mut batch_losses = batches
            .iter()
            .map(|batch| self.evaluate(batch))
            .collect::<Result<Vec<_>>>()?;
        let running = |losses: &[f64]| losses.iter().sum::<f64>() / total_constraints as f64;
        if self.metrics.record(running(&batch_losses)) {
            self.best_table = self.table.clone();
        }

        let mut reason = StopReason::MaxSteps;
        for index in (0..batches.len()).cycle().take(self.config.max_steps) {
            if self.metrics.best_loss < self.config.loss_threshold {
                reason = StopReason::Converged;
                break;
            }
            if self.metrics.should_stop_early(self.config.patience) {
                reason = StopReason::Patience;
                break;
            }

            let report = match self.step(&batches[index]) {
                Ok(report) => report,
                Err(err) => {
                    warn!(error = %err, step = self.metrics.steps, "update failed, restoring best parameters");
                    self.restore_best();
                    self.metrics.total_time += start.elapsed();
                    return Err(err);
                }
            };
            batch_losses[index] = report.loss_after;

            let loss = running(&batch_losses);
            if self.metrics.record(loss) {
                self.best_table = self.table.clone();
                debug!(step = self.metrics.steps, loss, "new best loss");
            }
        }
        if reason == StopReason::MaxSteps && self.metrics.best_loss < self.config.loss_threshold {
            reason = StopReason::Converged;
        }

        self.restore_best();
        self.metrics.total_time += start.elapsed();
        info!(?reason, best_loss = self.metrics.best_loss, steps = self.metrics.steps, "training complete");
        Ok(reason)
    }
}
