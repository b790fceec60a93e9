//! Configuration types for the Recall core.
//!
//! Every section carries `#[serde(default)]` so a partial TOML file only
//! overrides what it names.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    pub storage: StorageConfig,
    pub memory: MemoryConfig,
    pub graph: GraphConfig,
    pub consolidation: ConsolidationConfig,
    pub embedding: EmbeddingConfig,
}

/// Where the SQLite substrate keeps its data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
}

/// Entity store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Memories at or above this importance join the important index.
    pub important_threshold: u8,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            important_threshold: 8,
        }
    }
}

/// Traversal bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Depth used when the caller passes none.
    pub default_depth: u32,
    /// Hard ceiling on any requested depth.
    pub max_depth: u32,
    /// Node ceiling used by memory-graph queries when the caller passes none.
    pub default_max_nodes: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            default_depth: 2,
            max_depth: 10,
            default_max_nodes: 50,
        }
    }
}

/// Consolidation thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Minimum number of embedded memories before an unforced run does anything.
    pub min_embedded_memories: u64,
    /// Cosine similarity a pair must exceed to share a cluster.
    pub similarity_threshold: f32,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            min_embedded_memories: 100,
            similarity_threshold: 0.85,
        }
    }
}

/// Embedding provider selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider name (openai, voyage, or any OpenAI-compatible host).
    pub provider: String,
    /// Model name.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Overrides the provider's default base URL.
    pub base_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: RecallConfig = toml::from_str(
            r#"
            [consolidation]
            similarity_threshold = 0.9
            "#,
        )
        .unwrap();
        assert_eq!(config.consolidation.similarity_threshold, 0.9);
        assert_eq!(config.consolidation.min_embedded_memories, 100);
        assert_eq!(config.graph, GraphConfig::default());
        assert!(config.storage.path.is_none());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config: RecallConfig = toml::from_str("").unwrap();
        assert_eq!(config, RecallConfig::default());
    }
}
