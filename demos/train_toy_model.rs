use liegroup_embed::core::{evaluate_coefficients, similarity, CooccurrenceConstraint, EmbeddingTable};
use liegroup_embed::{GeneratorBasis, LieEmbedConfig, LieEmbedError, Trainer};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> liegroup_embed::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Targets generated from hidden rotations, so a perfect fit exists
    let n = 4;
    let vocab_size = 12;
    let mut rng = StdRng::seed_from_u64(2024);
    let hidden = EmbeddingTable::random(vocab_size, n, &mut rng)?;

    let mut constraints = Vec::new();
    for a in 0..vocab_size {
        for b in (a + 1)..vocab_size {
            let target = similarity(hidden.row(a)?, hidden.row(b)?);
            constraints.push(CooccurrenceConstraint::new(a, b, target));
        }
    }
    let batches: Vec<Vec<CooccurrenceConstraint>> = constraints.chunks(8).map(|c| c.to_vec()).collect();

    let config = LieEmbedConfig {
        dimension: n,
        learning_rate: 0.01,
        max_steps: 20_000,
        ..LieEmbedConfig::default()
    };
    let mut trainer = Trainer::from_config(vocab_size, config)?;
    let reason = trainer.train(&batches)?;

    println!("Stopped: {:?}", reason);
    println!("{}", trainer.metrics().summary());
    println!("Max orthogonality defect: {:e}", trainer.table().max_orthogonality_defect());

    let basis = Arc::new(GeneratorBasis::new(n)?);
    let coefficients = trainer.table().algebra_coefficients(&basis)?;
    for (id, x) in coefficients.iter().take(3).enumerate() {
        println!("item {}: {:?}", id, x);
    }

    // Same objective seen from the algebra side
    let map = trainer.config().build_exponential_map(basis.clone())?;
    let flat: Vec<f64> = coefficients.iter().flatten().copied().collect();
    let coefficients = Array2::from_shape_vec((vocab_size, basis.algebra_dim()), flat)
        .map_err(|e| LieEmbedError::ShapeMismatch(e.to_string()))?;
    let (loss, gradient) = evaluate_coefficients(&map, coefficients.view(), &constraints)?;
    println!(
        "Algebra-side loss: {:.6}, gradient norm: {:.6}",
        loss / constraints.len() as f64,
        gradient.iter().map(|g| g * g).sum::<f64>().sqrt()
    );
    Ok(())
}
