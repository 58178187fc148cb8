//! KGR RAG - Query-time graph retrieval
//!
//! Builds the context handed to an agent for one question:
//! - k-NN over entity embeddings (semantic)
//! - N-hop traversal from seeds (structural)
//!
//! The two rankings are fused with Reciprocal Rank Fusion (RRF) and packed
//! into a token-budgeted [`ContextBundle`]. Every store call shares one
//! per-query deadline. Traversal gets an earlier cut-off, a share of that
//! deadline, so a slow or failing traversal degrades the bundle while
//! hydration and the relation fetch still have time to run.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kgr_core::{
    AppConfig, ContextBundle, Degradation, EmbedMode, EmbeddingService, Entity, EntityId,
    EntityStore, Hops, KgrError, KnnFilter, RankingConfig, Relation, Result, RetrievalConfig,
    TokenEstimator,
};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

pub mod budget;
pub mod cache;
pub mod fusion;
pub mod retrieval;

pub use budget::{CharRatioEstimator, ContextAssembler};
pub use cache::{CacheStats, CacheStatsReport, CachedEmbedder, EmbeddingCache};
pub use fusion::{reciprocal_rank_fusion, RankFuser, RankedList};
pub use retrieval::{RetrievalEngine, TraversalResult};

// ============================================================================
// Request
// ============================================================================

/// One retrieval request; unset limits fall back to [`RetrievalConfig`]
#[derive(Debug, Clone, PartialEq)]
pub struct ContextRequest {
    pub query: String,
    pub organization_id: String,
    /// Restrict k-NN to these types; empty means any
    pub types: BTreeSet<String>,
    pub top_k: Option<usize>,
    pub hops: Option<Hops>,
    pub max_nodes: Option<usize>,
    pub token_budget: Option<usize>,
    /// Caller-chosen traversal seeds; when present, traversal runs alongside k-NN
    pub pinned: Vec<EntityId>,
}

impl ContextRequest {
    pub fn new(organization_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            organization_id: organization_id.into(),
            types: BTreeSet::new(),
            top_k: None,
            hops: None,
            max_nodes: None,
            token_budget: None,
            pinned: Vec::new(),
        }
    }

    pub fn with_type(mut self, entity_type: impl Into<String>) -> Self {
        self.types.insert(entity_type.into());
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_hops(mut self, hops: Hops) -> Self {
        self.hops = Some(hops);
        self
    }

    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = Some(max_nodes);
        self
    }

    pub fn with_token_budget(mut self, token_budget: usize) -> Self {
        self.token_budget = Some(token_budget);
        self
    }

    pub fn with_pinned(mut self, id: impl Into<EntityId>) -> Self {
        self.pinned.push(id.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.organization_id.trim().is_empty() {
            return Err(KgrError::Validation("organization_id is required".to_string()));
        }
        if self.query.trim().is_empty() {
            return Err(KgrError::Validation("query is empty".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Retriever
// ============================================================================

/// Run a critical stage under the query deadline
async fn critical<T>(
    deadline: Instant,
    stage: &str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout_at(deadline, future).await {
        Ok(result) => result,
        Err(_) => Err(KgrError::RetryableStore(format!(
            "{stage} exceeded the query deadline"
        ))),
    }
}

/// Query-time orchestrator: embed, search, traverse, fuse, budget
pub struct GraphRagRetriever {
    /// Uncached embedding backend
    backend: Arc<dyn EmbeddingService>,
    /// Backend, wrapped by the cache when one is configured
    embedder: Arc<dyn EmbeddingService>,
    engine: RetrievalEngine,
    assembler: ContextAssembler,
    fuser: RankFuser,
    retrieval: RetrievalConfig,
    cache: Option<EmbeddingCache>,
}

impl GraphRagRetriever {
    /// Create a retriever; the query embedding cache is enabled per `config.cache`
    pub fn new(
        embedder: Arc<dyn EmbeddingService>,
        store: Arc<dyn EntityStore>,
        estimator: Arc<dyn TokenEstimator>,
        config: &AppConfig,
    ) -> Self {
        let retriever = Self {
            backend: Arc::clone(&embedder),
            embedder,
            engine: RetrievalEngine::new(store),
            assembler: ContextAssembler::new(estimator),
            fuser: RankFuser::new(config.ranking.clone()),
            retrieval: config.retrieval.clone(),
            cache: None,
        };

        if config.cache.enabled {
            retriever.with_cache(EmbeddingCache::with_config(&config.cache))
        } else {
            retriever
        }
    }

    /// Serve repeated query embeddings from `cache`
    pub fn with_cache(mut self, cache: EmbeddingCache) -> Self {
        self.embedder = Arc::new(CachedEmbedder::new(
            Arc::clone(&self.backend),
            cache.clone(),
        ));
        self.cache = Some(cache);
        self
    }

    /// Call the embedding backend directly on every query
    pub fn without_cache(mut self) -> Self {
        self.embedder = Arc::clone(&self.backend);
        self.cache = None;
        self
    }

    pub fn with_ranking(mut self, ranking: RankingConfig) -> Self {
        self.fuser = RankFuser::new(ranking);
        self
    }

    pub fn cache(&self) -> Option<&EmbeddingCache> {
        self.cache.as_ref()
    }

    pub fn engine(&self) -> &RetrievalEngine {
        &self.engine
    }

    /// Build a context bundle for `request`
    ///
    /// Resolves to [`KgrError::Cancelled`] as soon as `cancel` fires; the
    /// in-flight store calls are dropped.
    pub async fn retrieve(
        &self,
        request: &ContextRequest,
        cancel: &CancellationToken,
    ) -> Result<ContextBundle> {
        let span = info_span!(
            "retrieve",
            organization = %request.organization_id,
            pinned = request.pinned.len()
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(organization = %request.organization_id, "Query cancelled");
                Err(KgrError::Cancelled)
            }
            result = self.run(request).instrument(span) => result,
        }
    }

    async fn run(&self, request: &ContextRequest) -> Result<ContextBundle> {
        request.validate()?;

        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.retrieval.query_timeout_ms);
        let traversal_deadline =
            started + Duration::from_millis(self.retrieval.traversal_timeout_ms());

        let org = request.organization_id.as_str();
        let top_k = request.top_k.unwrap_or(self.retrieval.knn_top_k);
        let hops = match request.hops {
            Some(hops) => hops,
            None => Hops::try_from(self.retrieval.traversal_hops)?,
        };
        let max_nodes = request
            .max_nodes
            .unwrap_or(self.retrieval.max_traversal_nodes);
        let token_budget = request.token_budget.unwrap_or(self.retrieval.token_budget);

        let filter = KnnFilter {
            organization_id: request.organization_id.clone(),
            types: request.types.clone(),
        };

        let embedding = match timeout_at(
            deadline,
            self.embedder.embed(&request.query, EmbedMode::Query),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(KgrError::RetryableStore(
                    "query embedding exceeded the query deadline".to_string(),
                ))
            }
        };

        let mut degradations = Vec::new();

        let (hits, traversal) = if request.pinned.is_empty() {
            let knn = self.engine.knn(&embedding, top_k, &filter);
            let hits = critical(deadline, "k-NN", knn).await?;
            let seeds: Vec<EntityId> = hits
                .iter()
                .take(self.retrieval.seed_count)
                .map(|h| h.entity_id.clone())
                .collect();
            let traversal = self
                .bounded_traversal(traversal_deadline, org, &seeds, hops, max_nodes)
                .await;
            (hits, traversal)
        } else {
            let (hits, traversal) = tokio::join!(
                critical(deadline, "k-NN", self.engine.knn(&embedding, top_k, &filter)),
                self.bounded_traversal(traversal_deadline, org, &request.pinned, hops, max_nodes),
            );
            (hits?, traversal)
        };

        let (traversal, degradation) = traversal;
        degradations.extend(degradation);

        let fused = self.fuser.fuse(&hits, &traversal.entity_ids());

        let mut by_id: HashMap<EntityId, Entity> = traversal
            .entities
            .iter()
            .map(|e| (e.id.clone(), e.clone()))
            .collect();
        let missing: Vec<EntityId> = fused
            .iter()
            .filter(|s| !by_id.contains_key(&s.entity_id))
            .map(|s| s.entity_id.clone())
            .collect();
        let hydrated = critical(deadline, "hydration", self.engine.hydrate(org, &missing)).await?;
        by_id.extend(hydrated.into_iter().map(|e| (e.id.clone(), e)));

        let ranked: Vec<Entity> = fused
            .iter()
            .filter_map(|s| by_id.remove(&s.entity_id))
            .collect();

        let relations = self
            .ranked_relations(deadline, org, &ranked, &traversal, &mut degradations)
            .await;

        let mut bundle = self.assembler.assemble(&ranked, &relations, token_budget);
        bundle.degradations = degradations;

        info!(
            knn_hits = hits.len(),
            traversal_nodes = traversal.entities.len(),
            hops_completed = traversal.hops_completed,
            ranked = ranked.len(),
            entities = bundle.entities.len(),
            relations = bundle.relations.len(),
            used_tokens = bundle.used_tokens,
            token_budget,
            degraded = bundle.is_degraded(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Context assembled"
        );
        Ok(bundle)
    }

    /// Traversal that never fails the query; gives up at `deadline`
    async fn bounded_traversal(
        &self,
        deadline: Instant,
        organization_id: &str,
        seeds: &[EntityId],
        hops: Hops,
        max_nodes: usize,
    ) -> (TraversalResult, Option<Degradation>) {
        let outcome = timeout_at(
            deadline,
            self.engine.traverse(organization_id, seeds, hops, max_nodes),
        )
        .await;

        let (error, degradation) = match outcome {
            Ok(Ok(result)) => return (result, None),
            Ok(Err(err)) => (
                KgrError::DegradedTraversal(err.to_string()),
                Degradation::TraversalFailed(err.to_string()),
            ),
            Err(_) => (
                KgrError::DegradedTraversal("deadline exceeded".to_string()),
                Degradation::TraversalTimedOut,
            ),
        };

        warn!(error = %error, seeds = seeds.len(), "Falling back to k-NN ranking");
        (TraversalResult::empty(), Some(degradation))
    }

    /// Relations touching the ranked entities, or the traversal's on failure
    async fn ranked_relations(
        &self,
        deadline: Instant,
        organization_id: &str,
        ranked: &[Entity],
        traversal: &TraversalResult,
        degradations: &mut Vec<Degradation>,
    ) -> Vec<Relation> {
        if ranked.is_empty() {
            return Vec::new();
        }

        let ids: Vec<EntityId> = ranked.iter().map(|e| e.id.clone()).collect();
        let fetch = self.engine.store().get_relations(organization_id, &ids);

        let reason = match timeout_at(deadline, fetch).await {
            Ok(Ok(relations)) => return relations,
            Ok(Err(err)) => err.to_string(),
            Err(_) => "deadline exceeded".to_string(),
        };

        warn!(reason = %reason, "Using traversal relations only");
        degradations.push(Degradation::RelationsUnavailable(reason));
        traversal.relations.clone()
    }
}

impl std::fmt::Debug for GraphRagRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphRagRetriever")
            .field("embedder", &self.embedder.name())
            .field("engine", &self.engine)
            .field("retrieval", &self.retrieval)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = ContextRequest::new("org-1", "who is the trustee?")
            .with_type("Client")
            .with_top_k(5)
            .with_hops(Hops::One)
            .with_max_nodes(3)
            .with_token_budget(200)
            .with_pinned("trust-9");

        assert_eq!(request.top_k, Some(5));
        assert_eq!(request.hops, Some(Hops::One));
        assert_eq!(request.pinned, vec!["trust-9".to_string()]);
        assert!(request.types.contains("Client"));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_request_validation() {
        assert!(matches!(
            ContextRequest::new("", "question").validate(),
            Err(KgrError::Validation(_))
        ));
        assert!(matches!(
            ContextRequest::new("org-1", "   ").validate(),
            Err(KgrError::Validation(_))
        ));
    }
}
