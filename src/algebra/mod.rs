//! Lie algebra so(n): generator basis, structure constants and the
//! exponential map into SO(n)

mod basis;
mod exponential;

pub use basis::{algebra_dim, index_to_pair, pair_to_index, BracketCase, BracketTerm, GeneratorBasis};
pub use exponential::{exp_differential, ExponentialMap, Pullback, DEFAULT_DIFFERENTIAL_EPSILON};
