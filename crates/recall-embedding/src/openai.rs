//! OpenAI-compatible embedding provider.
//!
//! Works with any provider that implements the `/v1/embeddings` endpoint:
//! OpenAI, Together, Mistral, Ollama, vLLM, LM Studio, etc.

use crate::embedding::{is_local, order_by_index, EmbeddingError, EmbeddingProvider, ProviderSettings};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

pub struct OpenAiEmbeddingProvider {
    api_key: Zeroizing<String>,
    base_url: String,
    model: String,
    client: reqwest::Client,
    dims: usize,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl OpenAiEmbeddingProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self, EmbeddingError> {
        let dims = infer_dimensions(&settings.model);
        Ok(Self {
            api_key: settings.api_key,
            base_url: settings.base_url,
            model: settings.model,
            client: reqwest::Client::new(),
            dims,
        })
    }
}

/// Infer embedding dimensions from model name.
fn infer_dimensions(model: &str) -> usize {
    match model {
        // OpenAI
        "text-embedding-3-small" => 1536,
        "text-embedding-3-large" => 3072,
        "text-embedding-ada-002" => 1536,
        // Local models
        "all-MiniLM-L6-v2" => 384,
        "all-mpnet-base-v2" => 768,
        "nomic-embed-text" => 768,
        "mxbai-embed-large" => 1024,
        "mistral-embed" => 1024,
        _ => 1536,
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if !self.is_configured() {
            return Err(EmbeddingError::MissingApiKey(format!(
                "no API key for {}",
                self.base_url
            )));
        }

        let url = format!("{}/embeddings", self.base_url);
        let body = EmbedRequest {
            model: &self.model,
            input: texts,
        };

        let mut req = self.client.post(&url).json(&body);
        if !self.api_key.as_str().is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key.as_str()));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EmbeddingError::Http(e.to_string()))?;
        let status = resp.status().as_u16();

        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api {
                status,
                message: body_text,
            });
        }

        let data: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Parse(e.to_string()))?;

        let rows = data
            .data
            .into_iter()
            .enumerate()
            .map(|(pos, d)| (d.index.unwrap_or(pos), d.embedding))
            .collect();
        let embeddings = order_by_index(rows, texts.len())?;

        debug!(
            model = %self.model,
            count = embeddings.len(),
            dims = embeddings.first().map(|e| e.len()).unwrap_or(0),
            "Embedded texts"
        );
        Ok(embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty() || is_local(&self.base_url)
    }
}
