//! Voyage AI embedding provider.

use crate::embedding::{order_by_index, EmbeddingError, EmbeddingProvider, ProviderSettings};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

pub struct VoyageEmbeddingProvider {
    api_key: Zeroizing<String>,
    base_url: String,
    model: String,
    client: reqwest::Client,
    dims: usize,
}

#[derive(Serialize)]
struct VoyageRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    /// Memories are stored documents, not search queries.
    input_type: &'static str,
}

#[derive(Deserialize)]
struct VoyageResponse {
    data: Vec<VoyageData>,
}

#[derive(Deserialize)]
struct VoyageData {
    embedding: Vec<f32>,
    index: usize,
}

impl VoyageEmbeddingProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self, EmbeddingError> {
        let dims = match settings.model.as_str() {
            "voyage-3-lite" | "voyage-3.5-lite" => 512,
            _ => 1024,
        };
        Ok(Self {
            api_key: settings.api_key,
            base_url: settings.base_url,
            model: settings.model,
            client: reqwest::Client::new(),
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for VoyageEmbeddingProvider {
    async fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if !self.is_configured() {
            return Err(EmbeddingError::MissingApiKey("Voyage API key not set".to_string()));
        }

        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key.as_str()))
            .json(&VoyageRequest {
                model: &self.model,
                input: texts,
                input_type: "document",
            })
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

        let data: VoyageResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Parse(e.to_string()))?;
        let rows = data.data.into_iter().map(|d| (d.index, d.embedding)).collect();
        let embeddings = order_by_index(rows, texts.len())?;

        debug!(model = %self.model, count = embeddings.len(), "Embedded texts with Voyage");
        Ok(embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }
}
