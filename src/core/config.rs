//! Configuration for SO(n) embedding training

use crate::algebra::{ExponentialMap, GeneratorBasis, DEFAULT_DIFFERENTIAL_EPSILON};
use crate::core::optimizer::{CayleyOptimizer, ExponentialRetraction, ManifoldOptimizer};
use crate::core::training;
use crate::{LieEmbedError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Manifold update rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// `V·(I − A)(I + A)⁻¹` with `A = (lr/2)·skew`
    Cayley,
    /// `V·exp(−lr·skew)`
    Exponential,
}

/// Embedding and training configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LieEmbedConfig {
    /// Matrix dimension n of SO(n)
    pub dimension: usize,
    /// Learning rate
    pub learning_rate: f64,
    /// Update rule
    pub optimizer: OptimizerKind,
    /// Diagonal shift of the adjoint matrix in the exponential differential
    pub differential_epsilon: f64,
    /// Relative pivot size below which a Cayley denominator counts as singular
    pub singular_tolerance: f64,
    /// Bound on `lr·‖skew‖_F` for the retry after a singular denominator
    pub max_step_norm: f64,
    /// Stop once the mean per-constraint loss falls below this
    pub loss_threshold: f64,
    /// Steps without a new best loss before stopping
    pub patience: usize,
    /// Hard cap on update steps
    pub max_steps: usize,
    /// Seed for the random orthogonal initialization
    pub seed: Option<u64>,
    /// Floor on the occurrence normalizer of the co-occurrence target
    pub similarity_epsilon: f64,
}

impl LieEmbedConfig {
    /// Config for SO(n) with defaults elsewhere
    pub fn for_dimension(dimension: usize) -> Self {
        LieEmbedConfig {
            dimension,
            ..Self::default()
        }
    }

    /// Parse a JSON config; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: LieEmbedConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the configured update rule
    pub fn build_optimizer(&self) -> Box<dyn ManifoldOptimizer> {
        match self.optimizer {
            OptimizerKind::Cayley => Box::new(CayleyOptimizer::new(self.singular_tolerance, self.max_step_norm)),
            OptimizerKind::Exponential => Box::new(ExponentialRetraction::new()),
        }
    }

    /// Exponential map over `basis` with the configured differential epsilon
    pub fn build_exponential_map(&self, basis: Arc<GeneratorBasis>) -> Result<ExponentialMap> {
        if basis.dimension() != self.dimension {
            return Err(LieEmbedError::ShapeMismatch(format!(
                "basis is for n = {}, config has n = {}",
                basis.dimension(),
                self.dimension
            )));
        }
        Ok(ExponentialMap::new(basis).with_epsilon(self.differential_epsilon))
    }

    /// Co-occurrence target for a pair, floored by `similarity_epsilon`.
    ///
    /// See [`crate::core::target_similarity`].
    pub fn target_similarity(&self, cooccurrence: f64, occurrence_a: f64, occurrence_b: f64) -> f64 {
        training::target_similarity(cooccurrence, occurrence_a, occurrence_b, self.similarity_epsilon)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.dimension < 2 {
            return Err(LieEmbedError::InvalidDimension(self.dimension));
        }

        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(LieEmbedError::InvalidConfig("Learning rate must be positive".to_string()));
        }

        if !(self.differential_epsilon > 0.0) {
            return Err(LieEmbedError::InvalidConfig("Differential epsilon must be positive".to_string()));
        }

        if !(self.singular_tolerance >= 0.0 && self.singular_tolerance < 1.0) {
            return Err(LieEmbedError::InvalidConfig(
                "Singular tolerance must lie in [0, 1)".to_string(),
            ));
        }

        if !(self.max_step_norm > 0.0) {
            return Err(LieEmbedError::InvalidConfig("Max step norm must be positive".to_string()));
        }

        if self.loss_threshold < 0.0 {
            return Err(LieEmbedError::InvalidConfig("Loss threshold must be non-negative".to_string()));
        }

        if self.max_steps == 0 {
            return Err(LieEmbedError::InvalidConfig("Max steps must be positive".to_string()));
        }

        if !(self.similarity_epsilon > 0.0) {
            return Err(LieEmbedError::InvalidConfig("Similarity epsilon must be positive".to_string()));
        }

        Ok(())
    }
}

impl Default for LieEmbedConfig {
    fn default() -> Self {
        LieEmbedConfig {
            dimension: 4,
            learning_rate: 1e-3,
            optimizer: OptimizerKind::Cayley,
            differential_epsilon: DEFAULT_DIFFERENTIAL_EPSILON,
            singular_tolerance: 1e-12,
            max_step_norm: 1.0,
            loss_threshold: 0.008,
            patience: 1000,
            max_steps: 100_000,
            seed: Some(42),
            similarity_epsilon: 1e-5,
        }
    }
}
