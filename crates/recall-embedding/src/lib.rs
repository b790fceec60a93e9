//! Embedding providers for the Recall memory core.
//!
//! [`create_embedding_provider`] builds a provider from configuration:
//! Voyage AI, or any OpenAI-compatible `/v1/embeddings` endpoint.

pub mod embedding;
pub mod openai;
pub mod voyage;

pub use embedding::{create_embedding_provider, EmbeddingError, EmbeddingProvider, ProviderSettings};
pub use openai::OpenAiEmbeddingProvider;
pub use voyage::VoyageEmbeddingProvider;
