//! Embedding provider trait and factory.
//!
//! Providers turn memory content into vectors for similarity search and
//! consolidation. The factory picks an implementation from
//! [`EmbeddingConfig`] and resolves the API key from the environment.

use crate::openai::OpenAiEmbeddingProvider;
use crate::voyage::VoyageEmbeddingProvider;
use async_trait::async_trait;
use recall_types::config::EmbeddingConfig;
use recall_types::error::RecallError;
use std::sync::Arc;
use tracing::warn;
use zeroize::Zeroizing;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const VOYAGE_BASE_URL: &str = "https://api.voyageai.com/v1";
pub const TOGETHER_BASE_URL: &str = "https://api.together.xyz/v1";
pub const MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
pub const VLLM_BASE_URL: &str = "http://localhost:8000/v1";
pub const LMSTUDIO_BASE_URL: &str = "http://localhost:1234/v1";

/// Error type for embedding operations.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing API key: {0}")]
    MissingApiKey(String),
}

impl From<EmbeddingError> for RecallError {
    fn from(e: EmbeddingError) -> Self {
        RecallError::Provider(e.to_string())
    }
}

/// Resolved settings for one provider instance.
#[derive(Clone)]
pub struct ProviderSettings {
    /// Provider name, for logging.
    pub provider: String,
    pub model: String,
    /// May be empty for local servers.
    pub api_key: Zeroizing<String>,
    /// Base URL without the trailing `/embeddings`.
    pub base_url: String,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Trait for computing text embeddings.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Compute embedding vectors for a batch of texts, in input order.
    async fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Compute the embedding for a single text.
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let results = self.generate_embeddings(&[text]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Parse("Empty embedding response".to_string()))
    }

    /// Dimensionality of the vectors this provider produces.
    fn dimensions(&self) -> usize;

    /// Whether the provider has what it needs to make requests.
    fn is_configured(&self) -> bool;
}

/// Create an embedding provider from configuration.
pub fn create_embedding_provider(
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    let api_key = if config.api_key_env.is_empty() {
        String::new()
    } else {
        std::env::var(&config.api_key_env).unwrap_or_default()
    };

    let base_url = match config.base_url {
        Some(ref url) => url.trim_end_matches('/').to_string(),
        None => match config.provider.as_str() {
            "openai" => OPENAI_BASE_URL.to_string(),
            "voyage" => VOYAGE_BASE_URL.to_string(),
            "together" => TOGETHER_BASE_URL.to_string(),
            "mistral" => MISTRAL_BASE_URL.to_string(),
            "ollama" => OLLAMA_BASE_URL.to_string(),
            "vllm" => VLLM_BASE_URL.to_string(),
            "lmstudio" => LMSTUDIO_BASE_URL.to_string(),
            other => {
                warn!("Unknown embedding provider '{other}', using OpenAI-compatible format");
                format!("https://{other}/v1")
            }
        },
    };

    if !is_local(&base_url) {
        warn!(
            provider = %config.provider,
            base_url = %base_url,
            "Embedding provider configured to send data to external API, memory content will leave this machine"
        );
    }

    let settings = ProviderSettings {
        provider: config.provider.clone(),
        model: config.model.clone(),
        api_key: Zeroizing::new(api_key),
        base_url,
    };

    match config.provider.as_str() {
        "voyage" => Ok(Arc::new(VoyageEmbeddingProvider::new(settings)?)),
        _ => Ok(Arc::new(OpenAiEmbeddingProvider::new(settings)?)),
    }
}

/// Whether a base URL points at this machine.
pub(crate) fn is_local(base_url: &str) -> bool {
    base_url.contains("localhost") || base_url.contains("127.0.0.1") || base_url.contains("[::1]")
}

/// Put response rows back in request order and check the count.
pub(crate) fn order_by_index(
    mut rows: Vec<(usize, Vec<f32>)>,
    expected: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if rows.len() != expected {
        return Err(EmbeddingError::Parse(format!(
            "expected {expected} embeddings, got {}",
            rows.len()
        )));
    }
    rows.sort_by_key(|(index, _)| *index);
    Ok(rows.into_iter().map(|(_, embedding)| embedding).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str, model: &str, env: &str) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: provider.to_string(),
            model: model.to_string(),
            api_key_env: env.to_string(),
            base_url: None,
        }
    }

    #[test]
    fn test_factory_selects_provider_dimensions() {
        let openai = create_embedding_provider(&config(
            "openai",
            "text-embedding-3-large",
            "RECALL_TEST_UNSET_KEY",
        ))
        .unwrap();
        assert_eq!(openai.dimensions(), 3072);

        let voyage =
            create_embedding_provider(&config("voyage", "voyage-3-lite", "RECALL_TEST_UNSET_KEY"))
                .unwrap();
        assert_eq!(voyage.dimensions(), 512);
    }

    #[test]
    fn test_factory_reads_key_from_env() {
        std::env::set_var("RECALL_TEST_FACTORY_KEY", "sk-test");
        let provider =
            create_embedding_provider(&config("openai", "text-embedding-3-small", "RECALL_TEST_FACTORY_KEY"))
                .unwrap();
        assert!(provider.is_configured());

        let unkeyed = create_embedding_provider(&config(
            "openai",
            "text-embedding-3-small",
            "RECALL_TEST_MISSING_KEY",
        ))
        .unwrap();
        assert!(!unkeyed.is_configured());
    }

    #[test]
    fn test_local_provider_needs_no_key() {
        let provider = create_embedding_provider(&config("ollama", "nomic-embed-text", "")).unwrap();
        assert!(provider.is_configured());
        assert_eq!(provider.dimensions(), 768);
    }

    #[test]
    fn test_order_by_index() {
        let rows = vec![(1, vec![2.0]), (0, vec![1.0])];
        assert_eq!(order_by_index(rows, 2).unwrap(), vec![vec![1.0], vec![2.0]]);
        assert!(matches!(
            order_by_index(vec![(0, vec![1.0])], 2),
            Err(EmbeddingError::Parse(_))
        ));
    }

    #[test]
    fn test_error_converts_to_provider_error() {
        let err: RecallError = EmbeddingError::MissingApiKey("VOYAGE_API_KEY".to_string()).into();
        assert!(matches!(err, RecallError::Provider(ref m) if m.contains("VOYAGE_API_KEY")));
    }

    #[test]
    fn test_settings_debug_redacts_key() {
        let settings = ProviderSettings {
            provider: "openai".to_string(),
            model: "m".to_string(),
            api_key: Zeroizing::new("sk-secret".to_string()),
            base_url: OPENAI_BASE_URL.to_string(),
        };
        assert!(!format!("{settings:?}").contains("sk-secret"));
    }
}
