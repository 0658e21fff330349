//! # liegroup-embed: vocabulary embeddings in SO(n)
//!
//! Each vocabulary item is embedded as a rotation matrix, an element of the
//! special orthogonal group SO(n), and trained so that the similarity of two
//! embeddings matches an observed co-occurrence statistic.
//!
//! ## Features
//!
//! - **Lie algebra**: canonical so(n) generators and structure constants
//! - **Exponential map**: batched coefficients → rotations, with a closed-form
//!   differential bound to each forward pass
//! - **Manifold optimizers**: Cayley and exponential updates that keep every
//!   parameter exactly orthogonal
//! - **Training**: sparse, atomic updates of an embedding table with
//!   best-parameter retention

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Lie algebra so(n) and the exponential map
pub mod algebra;

/// Optimizers, embedding table and training
pub mod core;

/// Utility functions and helpers
pub mod utils;

// Re-export commonly used types
pub use crate::algebra::{ExponentialMap, GeneratorBasis};
pub use crate::core::{CayleyOptimizer, EmbeddingTable, LieEmbedConfig, ManifoldOptimizer, Trainer};

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum LieEmbedError {
    /// Matrix dimension below 2
    #[error("Invalid dimension: n = {0}, need n >= 2")]
    InvalidDimension(usize),

    /// Coefficient, gradient or table shapes disagree
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Cayley denominator not invertible, even after the retry
    #[error("Singular update: {0}")]
    SingularUpdate(String),

    /// Non-finite loss, gradient or matrix function
    #[error("Numerical divergence: {0}")]
    NumericalDivergence(String),

    /// Invalid configuration or training input
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for the library
pub type Result<T> = std::result::Result<T, LieEmbedError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        algebra::{ExponentialMap, GeneratorBasis, Pullback},
        core::{
            CayleyOptimizer, CooccurrenceConstraint, EmbeddingTable, ExponentialRetraction, LieEmbedConfig,
            ManifoldOptimizer, StopReason, Trainer, TrainingMetrics,
        },
        LieEmbedError, Result,
    };
}
