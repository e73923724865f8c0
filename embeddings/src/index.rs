//! Exact nearest-neighbour index over a fixed corpus.

use std::collections::HashMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Embedding;
use crate::corpus::VerseRecord;
use crate::error::IndexError;
use crate::similarity::{Degenerate, dot_product, normalize};

/// A ranked match returned by [`VectorIndex::query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// The matched record.
    pub record: VerseRecord,

    /// Cosine similarity between the query and the record's vector.
    pub score: f32,
}

/// An immutable similarity index over a corpus.
///
/// Vector `i` belongs to record `i`. Every vector is re-normalized to unit
/// length at build time and every query vector is re-normalized at query
/// time, so the inner product used for scoring is the cosine similarity even
/// when the caller hands in raw model output. Zero vectors are rejected.
///
/// The index is never mutated after [`VectorIndex::build`]; share it behind an
/// `Arc` and query it from as many tasks as needed.
#[derive(Debug)]
pub struct VectorIndex {
    vectors: Vec<Embedding>,
    records: Vec<VerseRecord>,
    positions: HashMap<String, usize>,
    dimension: usize,
}

impl VectorIndex {
    /// Build an index from parallel vector and record sequences.
    pub fn build(vectors: Vec<Embedding>, records: Vec<VerseRecord>) -> Result<Self, IndexError> {
        if vectors.len() != records.len() {
            return Err(IndexError::DimensionMismatch {
                vectors: vectors.len(),
                records: records.len(),
            });
        }
        let Some(first) = vectors.first() else {
            return Err(IndexError::EmptyCorpus);
        };

        let dimension = first.len();
        if dimension == 0 {
            return Err(IndexError::ZeroDimension);
        }

        let mut vectors = vectors;
        for (position, vector) in vectors.iter_mut().enumerate() {
            if vector.len() != dimension {
                return Err(IndexError::RaggedVectors {
                    position,
                    expected: dimension,
                    actual: vector.len(),
                });
            }
            match normalize(vector) {
                Ok(()) => {}
                Err(Degenerate::Zero) => return Err(IndexError::ZeroVector { position }),
                Err(Degenerate::NonFinite) => {
                    return Err(IndexError::NonFiniteVector { position });
                }
            }
        }

        let positions = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();

        info!(
            "Built vector index with {} entries ({dimension} dimensions)",
            records.len()
        );

        Ok(Self {
            vectors,
            records,
            positions,
            dimension,
        })
    }

    /// Return the `k` records most similar to `query`.
    ///
    /// Results are ordered by descending score, ties by ascending corpus
    /// position. `k` larger than the corpus is clamped; `k == 0` is an error.
    pub fn query(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
        if k == 0 {
            return Err(IndexError::InvalidArgument(
                "k must be a positive integer".to_string(),
            ));
        }
        if query.len() != self.dimension {
            return Err(IndexError::InvalidArgument(format!(
                "query has {} dimensions, index has {}",
                query.len(),
                self.dimension
            )));
        }

        let mut query = query.to_vec();
        if let Err(degenerate) = normalize(&mut query) {
            let problem = match degenerate {
                Degenerate::Zero => "has zero magnitude",
                Degenerate::NonFinite => "contains NaN or infinite components",
            };
            return Err(IndexError::InvalidArgument(format!("query vector {problem}")));
        }

        let mut scored = Vec::with_capacity(self.vectors.len());
        for (i, vector) in self.vectors.iter().enumerate() {
            let score = dot_product(vector, &query)
                .map_err(|e| IndexError::InvalidArgument(e.to_string()))?;
            scored.push((OrderedFloat(score), i));
        }

        // Score descending, then corpus position ascending.
        scored.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let k = k.min(self.records.len());
        let hits: Vec<SearchHit> = scored
            .into_iter()
            .take(k)
            .map(|(score, i)| SearchHit {
                record: self.records[i].clone(),
                score: score.0,
            })
            .collect();

        debug!("Index query returned {} hits", hits.len());
        Ok(hits)
    }

    /// Number of entries in the index.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Always `false`: an index cannot be built empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Width of every vector in the index.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Record at corpus position `position`.
    pub fn record(&self, position: usize) -> Option<&VerseRecord> {
        self.records.get(position)
    }

    /// Unit-length vector at corpus position `position`.
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        self.vectors.get(position).map(Vec::as_slice)
    }

    /// Look a record up by id.
    pub fn get(&self, id: &str) -> Option<&VerseRecord> {
        self.positions.get(id).map(|&i| &self.records[i])
    }
}
