//! Corpus records and loading of the persisted corpus.
//!
//! A corpus is stored as two JSON files produced offline: a metadata array of
//! records and a parallel array of embedding vectors. Record `i` describes
//! vector `i`.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::Embedding;
use crate::error::CorpusLoadError;
use crate::index::VectorIndex;

/// One corpus entry.
///
/// Field aliases accept the bilingual metadata layout (`verse_en`, `verse_ar`,
/// `surah_name`) as well as the older single-language `text` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerseRecord {
    /// Unique identifier within the corpus.
    pub id: String,

    /// Text in the primary (canonical) language.
    #[serde(alias = "verse_en", alias = "text")]
    pub text_primary: String,

    /// Text in the secondary language, when available.
    #[serde(default, alias = "verse_ar")]
    pub text_secondary: Option<String>,

    /// Grouping label such as the chapter name.
    #[serde(default, alias = "surah_name")]
    pub group_label: Option<String>,
}

impl VerseRecord {
    /// Create a record with only the required fields.
    pub fn new(id: impl Into<String>, text_primary: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text_primary: text_primary.into(),
            text_secondary: None,
            group_label: None,
        }
    }
}

/// Parse records and vectors from their JSON text and build an index.
pub fn index_from_json(
    metadata_json: &str,
    vectors_json: &str,
) -> Result<VectorIndex, CorpusLoadError> {
    let records: Vec<VerseRecord> =
        serde_json::from_str(metadata_json).map_err(|source| CorpusLoadError::Malformed {
            origin: "metadata".to_string(),
            source,
        })?;
    let vectors: Vec<Embedding> =
        serde_json::from_str(vectors_json).map_err(|source| CorpusLoadError::Malformed {
            origin: "vectors".to_string(),
            source,
        })?;

    check_unique_ids(&records)?;

    Ok(VectorIndex::build(vectors, records)?)
}

/// Load the metadata and vector files from disk and build an index.
pub async fn load_index(
    metadata_path: impl AsRef<Path>,
    vectors_path: impl AsRef<Path>,
) -> Result<VectorIndex, CorpusLoadError> {
    let metadata_path = metadata_path.as_ref();
    let vectors_path = vectors_path.as_ref();

    let metadata_json = read(metadata_path).await?;
    let vectors_json = read(vectors_path).await?;
    debug!(
        "Read corpus files: {} ({} bytes), {} ({} bytes)",
        metadata_path.display(),
        metadata_json.len(),
        vectors_path.display(),
        vectors_json.len()
    );

    let index = index_from_json(&metadata_json, &vectors_json).map_err(|e| match e {
        CorpusLoadError::Malformed { origin, source } => {
            let path = if origin == "metadata" {
                metadata_path
            } else {
                vectors_path
            };
            CorpusLoadError::Malformed {
                origin: path.display().to_string(),
                source,
            }
        }
        other => other,
    })?;

    info!(
        "Loaded corpus of {} records ({} dimensions)",
        index.len(),
        index.dimension()
    );
    Ok(index)
}

async fn read(path: &Path) -> Result<String, CorpusLoadError> {
    fs::read_to_string(path)
        .await
        .map_err(|source| CorpusLoadError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn check_unique_ids(records: &[VerseRecord]) -> Result<(), CorpusLoadError> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if !seen.insert(record.id.as_str()) {
            return Err(CorpusLoadError::DuplicateId(record.id.clone()));
        }
    }
    Ok(())
}
