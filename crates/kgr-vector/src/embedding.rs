//! Embedding clients for generating vector representations
//!
//! Supports OpenAI and Ollama embedding APIs. Query and document modes are
//! distinguished by configurable text prefixes, which is how asymmetric
//! embedding models such as `nomic-embed-text` expect to be called.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kgr_core::{EmbedMode, EmbeddingConfig, EmbeddingProvider, EmbeddingService, KgrError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

// ============================================================================
// Mode Prefixes
// ============================================================================

/// Per-mode text prefixes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModePrefixes {
    pub query: String,
    pub document: String,
}

impl ModePrefixes {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            query: config.query_prefix.clone(),
            document: config.document_prefix.clone(),
        }
    }

    /// The text actually sent to the model
    pub fn apply(&self, text: &str, mode: EmbedMode) -> String {
        let prefix = match mode {
            EmbedMode::Query => &self.query,
            EmbedMode::Document => &self.document,
        };
        format!("{prefix}{text}")
    }
}

fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| KgrError::Embedding(format!("Failed to build HTTP client: {e}")))
}

// ============================================================================
// OpenAI Embedding Client
// ============================================================================

/// OpenAI embedding API client
pub struct OpenAiEmbedding {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
    prefixes: ModePrefixes,
}

#[derive(Debug, Serialize)]
struct OpenAiEmbeddingRequest {
    input: Vec<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl OpenAiEmbedding {
    /// Create a new OpenAI embedding client
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        let dimension = match model.as_str() {
            "text-embedding-3-small" => 1536,
            "text-embedding-3-large" => 3072,
            "text-embedding-ada-002" => 1536,
            _ => 1536, // Default
        };

        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            model,
            dimension,
            prefixes: ModePrefixes::default(),
        }
    }

    /// Create from config
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| KgrError::Config("OpenAI API key required".to_string()))?;

        let mut client = Self::new(api_key.clone(), config.model.clone());
        client.client = build_client(config.timeout_secs)?;
        client.prefixes = ModePrefixes::from_config(config);
        if let Some(base_url) = &config.openai_base_url {
            client.base_url = base_url.trim_end_matches('/').to_string();
        }
        Ok(client)
    }

    /// Embed several texts in one request
    pub async fn embed_batch(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = OpenAiEmbeddingRequest {
            input: texts.iter().map(|t| self.prefixes.apply(t, mode)).collect(),
            model: self.model.clone(),
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| KgrError::Embedding(format!("Embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(KgrError::Embedding(format!(
                "OpenAI embedding error: {error_text}"
            )));
        }

        let result: OpenAiEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| KgrError::Embedding(format!("Failed to parse embedding response: {e}")))?;

        // Sort by index and extract embeddings
        let mut embeddings = result.data;
        embeddings.sort_by_key(|e| e.index);

        Ok(embeddings.into_iter().map(|e| e.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbedding {
    async fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()], mode)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| KgrError::Embedding("No embedding returned".to_string()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ============================================================================
// Ollama Embedding Client
// ============================================================================

/// Ollama embedding API client
pub struct OllamaEmbedding {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
    prefixes: ModePrefixes,
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedding {
    /// Create a new Ollama embedding client
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        let dimension = match model.as_str() {
            "nomic-embed-text" => 768,
            "mxbai-embed-large" => 1024,
            "all-minilm" => 384,
            _ => 768, // Default for most models
        };

        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model,
            dimension,
            prefixes: ModePrefixes::default(),
        }
    }

    /// Create from config
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let mut client = Self::new(config.ollama_url.clone(), config.model.clone());
        client.client = build_client(config.timeout_secs)?;
        client.prefixes = ModePrefixes::from_config(config);
        Ok(client)
    }

    pub fn with_prefixes(mut self, prefixes: ModePrefixes) -> Self {
        self.prefixes = prefixes;
        self
    }
}

#[async_trait]
impl EmbeddingService for OllamaEmbedding {
    async fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>> {
        let request = OllamaEmbeddingRequest {
            model: self.model.clone(),
            prompt: self.prefixes.apply(text, mode),
        };

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| KgrError::Embedding(format!("Ollama embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(KgrError::Embedding(format!(
                "Ollama embedding error: {error_text}"
            )));
        }

        let result: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| KgrError::Embedding(format!("Failed to parse embedding response: {e}")))?;

        if result.embedding.is_empty() {
            return Err(KgrError::Embedding("Ollama returned an empty embedding".to_string()));
        }
        Ok(result.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

// ============================================================================
// Factory function
// ============================================================================

/// Create an embedding service from config
pub fn create_embedding_service(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingService>> {
    tracing::debug!(
        provider = ?config.provider,
        model = %config.model,
        "Creating embedding service"
    );
    match config.provider {
        EmbeddingProvider::OpenAI => Ok(Arc::new(OpenAiEmbedding::from_config(config)?)),
        EmbeddingProvider::Ollama => Ok(Arc::new(OllamaEmbedding::from_config(config)?)),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_dimension() {
        let client = OpenAiEmbedding::new("test-key", "text-embedding-3-small");
        assert_eq!(client.dimension(), 1536);

        let client = OpenAiEmbedding::new("test-key", "text-embedding-3-large");
        assert_eq!(client.dimension(), 3072);
    }

    #[test]
    fn test_ollama_dimension() {
        let client = OllamaEmbedding::new("http://localhost:11434/", "nomic-embed-text");
        assert_eq!(client.dimension(), 768);
        assert_eq!(client.base_url, "http://localhost:11434");

        let client = OllamaEmbedding::new("http://localhost:11434", "mxbai-embed-large");
        assert_eq!(client.dimension(), 1024);
    }

    #[test]
    fn test_mode_prefixes() {
        let prefixes = ModePrefixes::from_config(&EmbeddingConfig::default());
        assert_eq!(
            prefixes.apply("who owns account 42", EmbedMode::Query),
            "search_query: who owns account 42"
        );
        assert_eq!(
            prefixes.apply("[Account] a-42", EmbedMode::Document),
            "search_document: [Account] a-42"
        );
    }

    #[test]
    fn test_factory_requires_openai_key() {
        let config = EmbeddingConfig {
            provider: EmbeddingProvider::OpenAI,
            ..Default::default()
        };
        assert!(matches!(
            create_embedding_service(&config),
            Err(KgrError::Config(_))
        ));

        let service = create_embedding_service(&EmbeddingConfig::default()).unwrap();
        assert_eq!(service.name(), "ollama");
    }
}
