use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use flowchat_core::config::EmbeddingConfig;
use flowchat_core::error::{FlowError, Result};
use flowchat_core::traits::EmbeddingProvider;
use flowchat_core::types::Embeddings;

/// HTTP-based embedding provider compatible with OpenAI, Ollama, etc.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dims: usize,
    price_per_1k: f64,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dims: config.dimensions,
            price_per_1k: config.price_per_1k,
        }
    }

    /// Number of dimensions in the embedding vectors.
    pub fn dimensions(&self) -> usize {
        self.dims
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<EmbeddingUsage>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingUsage {
    #[serde(default)]
    total_tokens: u64,
}

fn into_embeddings(response: EmbeddingResponse) -> Embeddings {
    let mut data = response.data;
    data.sort_by_key(|d| d.index);
    Embeddings {
        vectors: data.into_iter().map(|d| d.embedding).collect(),
        tokens: response.usage.map(|u| u.total_tokens).unwrap_or(0),
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn embed(&self, texts: Vec<String>) -> BoxFuture<'_, Result<Embeddings>> {
        Box::pin(async move {
            let url = format!("{}/embeddings", self.base_url);
            let count = texts.len();

            let mut req = self.client.post(&url).json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            });

            if let Some(ref key) = self.api_key {
                req = req.bearer_auth(key);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| FlowError::Embedding(e.to_string()))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(FlowError::Embedding(format!("HTTP {}: {}", status, body)));
            }

            let body: EmbeddingResponse = resp
                .json()
                .await
                .map_err(|e| FlowError::Embedding(format!("Failed to parse response: {}", e)))?;

            let embeddings = into_embeddings(body);
            if embeddings.vectors.len() != count {
                return Err(FlowError::Embedding(format!(
                    "expected {} vectors, got {}",
                    count,
                    embeddings.vectors.len()
                )));
            }
            debug!(model = %self.model, count, tokens = embeddings.tokens, "Texts embedded");
            Ok(embeddings)
        })
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn price_per_1k(&self) -> f64 {
        self.price_per_1k
    }
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let sim = cosine_similarity(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal_and_opposite() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_mismatched_or_empty() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_response_parsing_orders_by_index() {
        let body: EmbeddingResponse = serde_json::from_str(
            r#"{
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ],
                "usage": {"prompt_tokens": 6, "total_tokens": 6}
            }"#,
        )
        .unwrap();
        let embeddings = into_embeddings(body);
        assert_eq!(embeddings.vectors[0], vec![1.0, 0.0]);
        assert_eq!(embeddings.tokens, 6);
    }

    #[test]
    fn test_base_url_trimmed() {
        let provider = HttpEmbeddingProvider::new(&EmbeddingConfig {
            base_url: "http://localhost:11434/v1/".into(),
            api_key: None,
            model: "nomic-embed-text".into(),
            dimensions: 768,
            price_per_1k: 0.0,
        });
        assert_eq!(provider.base_url, "http://localhost:11434/v1");
        assert_eq!(provider.dimensions(), 768);
        assert_eq!(provider.model(), "nomic-embed-text");
    }
}
