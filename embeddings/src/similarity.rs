//! Vector math for embeddings.

use crate::error::{EmbeddingError, Result};

/// Why a vector cannot be scaled to unit length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degenerate {
    /// Every component is zero.
    Zero,
    /// A component is NaN or infinite.
    NonFinite,
}

/// Compute the dot product between two embeddings.
///
/// For unit vectors this equals the cosine similarity, which is what the
/// index relies on at query time.
pub fn dot_product(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    Ok(a.iter().zip(b.iter()).map(|(x, y)| x * y).sum())
}

/// L2 norm of a vector, accumulated in `f64` so large components cannot
/// overflow the sum of squares.
pub fn magnitude(v: &[f32]) -> f64 {
    v.iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt()
}

/// Normalize an embedding to unit length in place.
///
/// The vector is left untouched on error.
pub fn normalize(embedding: &mut [f32]) -> std::result::Result<(), Degenerate> {
    if embedding.iter().any(|x| !x.is_finite()) {
        return Err(Degenerate::NonFinite);
    }
    let magnitude = magnitude(embedding);
    if magnitude == 0.0 {
        return Err(Degenerate::Zero);
    }
    for x in embedding.iter_mut() {
        *x = (f64::from(*x) / magnitude) as f32;
    }
    Ok(())
}
