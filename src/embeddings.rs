//! Text embedding providers.
//!
//! The dataset builder turns every raw text field into a fixed-width vector
//! through an [`EmbeddingProvider`]. Two offline providers are available:
//!
//! - [`HashingEmbeddings`]: signed feature hashing of lower-cased word
//!   unigrams, L2-normalized. Deterministic and dependency free.
//! - [`JsonlEmbeddings`]: vectors produced ahead of time by an external
//!   sentence encoder, one `{"text": ..., "embedding": [...]}` object per
//!   line.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::error::{FusionError, Result};

/// Maps texts to fixed-width vectors.
pub trait EmbeddingProvider: Send + Sync {
    /// Width of every returned vector.
    fn dim(&self) -> usize;

    /// Embed `texts`, returning one vector per input in the same order.
    ///
    /// # Errors
    ///
    /// Provider failures are fatal for the run.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Build the provider selected by the configuration.
///
/// # Errors
///
/// Fails when the `jsonl` provider has no path or its file is unreadable.
pub fn build_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider {
        EmbeddingProviderKind::Hashing => Ok(Box::new(HashingEmbeddings::new(config.dim))),
        EmbeddingProviderKind::Jsonl => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| FusionError::config("embedding.path is required for jsonl"))?;
            Ok(Box::new(JsonlEmbeddings::from_file(path)?))
        }
    }
}

/// Signed feature-hashing bag of words.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbeddings {
    dim: usize,
}

impl HashingEmbeddings {
    /// Provider producing `dim`-wide vectors.
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(token.to_lowercase().as_bytes());
            let index = (hash % self.dim as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl EmbeddingProvider for HashingEmbeddings {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, &b| (hash ^ u64::from(b)).wrapping_mul(PRIME))
}

#[derive(Deserialize)]
struct EmbeddingRecord {
    text: String,
    embedding: Vec<f32>,
}

/// Lookup table of precomputed sentence embeddings.
#[derive(Debug, Clone)]
pub struct JsonlEmbeddings {
    table: HashMap<String, Vec<f32>>,
    dim: usize,
}

impl JsonlEmbeddings {
    /// Load every record of a JSONL file.
    ///
    /// # Errors
    ///
    /// Fails on unreadable files, malformed lines, empty files or vectors of
    /// inconsistent width.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            FusionError::embedding(format!("cannot open {}: {e}", path.display()))
        })?;

        let mut table = HashMap::new();
        let mut dim = None;
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: EmbeddingRecord = serde_json::from_str(line).map_err(|e| {
                FusionError::embedding(format!("{}:{}: {e}", path.display(), line_no + 1))
            })?;
            let width = record.embedding.len();
            match dim {
                None => dim = Some(width),
                Some(expected) if expected != width => {
                    return Err(FusionError::embedding(format!(
                        "{}:{}: embedding has width {width}, expected {expected}",
                        path.display(),
                        line_no + 1
                    )));
                }
                Some(_) => {}
            }
            table.insert(record.text, record.embedding);
        }

        let dim = dim.ok_or_else(|| {
            FusionError::embedding(format!("{} contains no embeddings", path.display()))
        })?;
        tracing::info!("Loaded {} precomputed embeddings (dim {dim})", table.len());
        Ok(Self { table, dim })
    }

    /// Number of known texts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl EmbeddingProvider for JsonlEmbeddings {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts
            .iter()
            .map(|text| {
                self.table
                    .get(text)
                    .cloned()
                    .ok_or_else(|| FusionError::embedding(format!("no embedding for text {text:?}")))
            })
            .collect()
    }
}
