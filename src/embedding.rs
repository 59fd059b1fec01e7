//! Remote embedding service client.
//!
//! The embedder is an external service exposing `POST {"texts": [...]}` and
//! returning `{"embeddings": [[f32; dims], ...]}` — unit-L2-normalized
//! vectors. The model runs on a GPU, which is why requests go out in small
//! batches (default 8) rather than one large call.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::config::EmbeddingConfig;

/// Tolerance for the unit-norm contract check.
const UNIT_NORM_TOLERANCE: f32 = 1e-4;

static EMBEDDER: OnceLock<EmbeddingClient> = OnceLock::new();

/// Process-wide embedder accessor. The client is lazily initialized on first
/// use and lives for the worker process's lifetime.
pub fn global(config: &EmbeddingConfig) -> Result<&'static EmbeddingClient> {
    if let Some(client) = EMBEDDER.get() {
        return Ok(client);
    }
    let client = EmbeddingClient::new(config)?;
    Ok(EMBEDDER.get_or_init(|| client))
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

pub struct EmbeddingClient {
    endpoint: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            client,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Embed a batch of texts, preserving input order. Texts are sent to the
    /// service in batches of `batch_size`.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let embeddings = self.embed_batch(batch).await?;
            all.extend(embeddings);
        }
        Ok(all)
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut results = self.embed_batch(&[text.to_string()]).await?;
        results
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "texts": texts });
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self.client.post(&self.endpoint).json(&body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: EmbedResponse = response.json().await?;
                        return self.validate(texts.len(), parsed.embeddings);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Embedding service error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Embedding service error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }

    /// Enforce the service contract: one vector per input, declared
    /// dimension, unit L2 norm within tolerance.
    fn validate(&self, expected: usize, embeddings: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        if embeddings.len() != expected {
            bail!(
                "Embedding count mismatch: sent {} texts, got {} vectors",
                expected,
                embeddings.len()
            );
        }
        for vector in &embeddings {
            if vector.len() != self.dims {
                bail!(
                    "Embedding dimension mismatch: expected {}, got {}",
                    self.dims,
                    vector.len()
                );
            }
            let norm = l2_norm(vector);
            if (norm - 1.0).abs() > UNIT_NORM_TOLERANCE {
                bail!("Embedding is not unit-normalized (L2 norm {})", norm);
            }
        }
        Ok(embeddings)
    }
}

/// L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(dims: usize) -> EmbeddingClient {
        EmbeddingClient::new(&EmbeddingConfig {
            endpoint: "http://localhost:8001/embed".into(),
            model: "test".into(),
            dims,
            batch_size: 8,
            max_retries: 0,
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn l2_norm_of_unit_vector() {
        let v = vec![0.6, 0.8];
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn validate_accepts_unit_vectors() {
        let c = client(2);
        let out = c.validate(1, vec![vec![0.6, 0.8]]).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn validate_rejects_non_unit_vectors() {
        let c = client(2);
        assert!(c.validate(1, vec![vec![1.0, 1.0]]).is_err());
    }

    #[test]
    fn validate_rejects_wrong_dimension() {
        let c = client(3);
        assert!(c.validate(1, vec![vec![0.6, 0.8]]).is_err());
    }

    #[test]
    fn validate_rejects_count_mismatch() {
        let c = client(2);
        assert!(c.validate(2, vec![vec![0.6, 0.8]]).is_err());
    }
}
