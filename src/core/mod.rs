//! Group-valued parameters: optimizers, the embedding table and training

mod config;
mod embedding_table;
mod optimizer;
mod training;

pub use config::{LieEmbedConfig, OptimizerKind};
pub use embedding_table::{random_rotation, EmbeddingTable};
pub use optimizer::{cayley_transform, tangent_projection, CayleyOptimizer, ExponentialRetraction, ManifoldOptimizer};
pub use training::{
    evaluate_batch, evaluate_coefficients, similarity, similarity_gradient, target_similarity, BatchEvaluation,
    CooccurrenceConstraint, StepReport, StopReason, Trainer, TrainingMetrics,
};
