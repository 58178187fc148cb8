//! KGR Configuration Management
//!
//! Handles configuration from environment variables and TOML files
//! with sensible defaults for development.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Entity resolution configuration
    pub resolution: ResolutionConfig,

    /// Query-time retrieval configuration
    pub retrieval: RetrievalConfig,

    /// Rank fusion configuration
    pub ranking: RankingConfig,

    /// Embedding service configuration
    pub embedding: EmbeddingConfig,

    /// Query embedding cache configuration
    pub cache: CacheConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

fn parse_env<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        })
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        let config = Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseError { message, .. } => ConfigError::ParseError { path, message },
            other => other,
        })?;
        Ok(config)
    }

    /// Parse from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        self.apply_env()?;
        self.validate()?;
        Ok(self)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Resolution
        if let Ok(value) = std::env::var("KGR_SIMILARITY_THRESHOLD") {
            self.resolution.similarity_threshold = parse_env("KGR_SIMILARITY_THRESHOLD", value)?;
        }

        // Retrieval
        if let Ok(value) = std::env::var("KGR_KNN_TOP_K") {
            self.retrieval.knn_top_k = parse_env("KGR_KNN_TOP_K", value)?;
        }
        if let Ok(value) = std::env::var("KGR_TRAVERSAL_HOPS") {
            self.retrieval.traversal_hops = parse_env("KGR_TRAVERSAL_HOPS", value)?;
        }
        if let Ok(value) = std::env::var("KGR_MAX_TRAVERSAL_NODES") {
            self.retrieval.max_traversal_nodes = parse_env("KGR_MAX_TRAVERSAL_NODES", value)?;
        }
        if let Ok(value) = std::env::var("KGR_QUERY_TIMEOUT_MS") {
            self.retrieval.query_timeout_ms = parse_env("KGR_QUERY_TIMEOUT_MS", value)?;
        }
        if let Ok(value) = std::env::var("KGR_TRAVERSAL_TIMEOUT_SHARE") {
            self.retrieval.traversal_timeout_share =
                parse_env("KGR_TRAVERSAL_TIMEOUT_SHARE", value)?;
        }
        if let Ok(value) = std::env::var("KGR_TOKEN_BUDGET") {
            self.retrieval.token_budget = parse_env("KGR_TOKEN_BUDGET", value)?;
        }

        // Ranking
        if let Ok(value) = std::env::var("KGR_RRF_K") {
            self.ranking.rrf_k = parse_env("KGR_RRF_K", value)?;
        }

        // Embedding
        if let Ok(provider) = std::env::var("EMBEDDING_PROVIDER") {
            self.embedding.provider = provider.parse()?;
        }
        if let Ok(url) = std::env::var("OLLAMA_URL") {
            self.embedding.ollama_url = url;
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.embedding.openai_api_key = Some(key);
        }
        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            self.embedding.model = model;
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.resolution.similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "resolution.similarity_threshold".to_string(),
                value: threshold.to_string(),
            });
        }
        if !(1..=2).contains(&self.retrieval.traversal_hops) {
            return Err(ConfigError::InvalidValue {
                key: "retrieval.traversal_hops".to_string(),
                value: self.retrieval.traversal_hops.to_string(),
            });
        }
        let share = self.retrieval.traversal_timeout_share;
        if !(share > 0.0 && share < 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "retrieval.traversal_timeout_share".to_string(),
                value: share.to_string(),
            });
        }
        if self.ranking.rrf_k <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "ranking.rrf_k".to_string(),
                value: self.ranking.rrf_k.to_string(),
            });
        }
        Ok(())
    }
}

/// Entity resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Minimum cosine similarity for two candidates to be linked
    pub similarity_threshold: f32,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
        }
    }
}

/// Query-time retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Number of results from k-NN search
    pub knn_top_k: usize,

    /// Traversal depth (1 or 2)
    pub traversal_hops: u8,

    /// Global node cap across all traversal hops
    pub max_traversal_nodes: usize,

    /// Number of top k-NN hits used as traversal seeds
    pub seed_count: usize,

    /// Per-query deadline in milliseconds
    pub query_timeout_ms: u64,

    /// Fraction of `query_timeout_ms` traversal may use, in (0, 1); the rest
    /// is left for hydration and the relation fetch
    pub traversal_timeout_share: f32,

    /// Default token budget for context assembly
    pub token_budget: usize,
}

impl RetrievalConfig {
    /// Traversal deadline, measured from the start of the query
    pub fn traversal_timeout_ms(&self) -> u64 {
        (self.query_timeout_ms as f64 * f64::from(self.traversal_timeout_share)) as u64
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            knn_top_k: 20,
            traversal_hops: 2,
            max_traversal_nodes: 50,
            seed_count: 5,
            query_timeout_ms: 500,
            traversal_timeout_share: 0.6,
            token_budget: 4000,
        }
    }
}

/// Reciprocal Rank Fusion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// RRF constant
    pub rrf_k: f32,

    /// Weight of the k-NN list
    pub knn_weight: f32,

    /// Weight of the traversal list
    pub traversal_weight: f32,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            knn_weight: 1.0,
            // Traversal signals connectedness, not direct relevance
            traversal_weight: 0.5,
        }
    }
}

/// Embedding service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Embedding provider to use
    pub provider: EmbeddingProvider,

    /// Ollama server URL
    pub ollama_url: String,

    /// OpenAI API key
    pub openai_api_key: Option<String>,

    /// OpenAI API base URL (for Azure or compatible APIs)
    pub openai_base_url: Option<String>,

    /// Embedding model name
    pub model: String,

    /// Prefix prepended to query-mode texts
    pub query_prefix: String,

    /// Prefix prepended to document-mode texts
    pub document_prefix: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Ollama,
            ollama_url: "http://localhost:11434".to_string(),
            openai_api_key: None,
            openai_base_url: None,
            model: "nomic-embed-text".to_string(),
            query_prefix: "search_query: ".to_string(),
            document_prefix: "search_document: ".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Supported embedding providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    OpenAI,
    Ollama,
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            _ => Err(ConfigError::InvalidValue {
                key: "EMBEDDING_PROVIDER".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Query embedding cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the cache
    pub enabled: bool,

    /// Maximum number of cached embeddings
    pub max_capacity: u64,

    /// Time-to-live for cache entries (in seconds)
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // 10k embeddings @ ~3KB each = ~30MB
            max_capacity: 10_000,
            ttl_seconds: 3600,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,

    /// Include file/line in logs
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}
