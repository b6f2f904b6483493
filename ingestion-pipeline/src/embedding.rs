//! Batched vector embedding over a remote provider.
//!
//! Texts go out in fixed-size batches with a short pause in between to
//! smooth provider rate limits; vectors come back in input order. Provider
//! errors surface verbatim so the error classifier can tell a rate limit
//! from a timeout.

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::CreateEmbeddingRequestArgs;
use common::error::AppError;
use common::storage::types::chunk_embedding::EMBEDDING_DIMENSIONS;
use common::utils::config::{AppConfig, EmbeddingBackendKind};
use sha2::{Digest, Sha256};
use tracing::debug;

const DEFAULT_BATCH_SIZE: usize = 50;
const INTER_BATCH_DELAY: Duration = Duration::from_millis(100);

enum Backend {
    OpenAI(async_openai::Client<OpenAIConfig>),
    /// Deterministic vectors derived from the text, for tests and offline
    /// evaluation.
    Hashed,
}

pub struct EmbeddingClient {
    backend: Backend,
    model: String,
    batch_size: usize,
    inter_batch_delay: Duration,
}

impl EmbeddingClient {
    pub fn from_config(cfg: &AppConfig) -> Self {
        match cfg.embedding_backend {
            EmbeddingBackendKind::OpenAI => Self::openai(&cfg.embeddings_api_key, &cfg.embeddings_model),
            EmbeddingBackendKind::Hashed => Self::hashed(&cfg.embeddings_model),
        }
    }

    pub fn openai(api_key: &str, model: &str) -> Self {
        let client = async_openai::Client::with_config(OpenAIConfig::new().with_api_key(api_key));
        Self {
            backend: Backend::OpenAI(client),
            model: model.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            inter_batch_delay: INTER_BATCH_DELAY,
        }
    }

    pub fn hashed(model: &str) -> Self {
        Self {
            backend: Backend::Hashed,
            model: model.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            inter_batch_delay: Duration::ZERO,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embeds all texts, batched, preserving input order. Empty input
    /// returns empty output without touching the provider.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = Vec::with_capacity(texts.len());
        let batch_count = texts.len().div_ceil(self.batch_size);
        for (batch_idx, batch) in texts.chunks(self.batch_size).enumerate() {
            if batch_idx > 0 && !self.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.inter_batch_delay).await;
            }
            debug!(
                batch = batch_idx + 1,
                batches = batch_count,
                texts = batch.len(),
                "embedding batch"
            );
            vectors.extend(self.embed_batch(batch).await?);
        }

        Ok(vectors)
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        match &self.backend {
            Backend::OpenAI(client) => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(&self.model)
                    .dimensions(EMBEDDING_DIMENSIONS as u32)
                    .input(batch.to_vec())
                    .build()?;

                let response = client.embeddings().create(request).await?;
                if response.data.len() != batch.len() {
                    return Err(AppError::InternalError(format!(
                        "provider returned {} embeddings for {} inputs",
                        response.data.len(),
                        batch.len()
                    )));
                }

                let mut vectors: Vec<(u32, Vec<f32>)> = response
                    .data
                    .into_iter()
                    .map(|d| (d.index, d.embedding))
                    .collect();
                vectors.sort_by_key(|(index, _)| *index);
                Ok(vectors.into_iter().map(|(_, v)| v).collect())
            }
            Backend::Hashed => Ok(batch.iter().map(|text| hashed_vector(text)).collect()),
        }
    }
}

/// Unit-norm pseudo-embedding seeded from a SHA-256 of the text. The same
/// text always maps to the same vector.
fn hashed_vector(text: &str) -> Vec<f32> {
    let seed = Sha256::digest(text.as_bytes());
    let mut state = u64::from_le_bytes(seed[..8].try_into().unwrap_or([1; 8])).max(1);

    let mut vector: Vec<f32> = (0..EMBEDDING_DIMENSIONS)
        .map(|_| {
            // xorshift64
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state as f64 / u64::MAX as f64) as f32 - 0.5
        })
        .collect();

    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}
