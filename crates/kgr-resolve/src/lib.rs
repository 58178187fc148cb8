//! KGR Resolve - Entity resolution pipeline
//!
//! Collapses duplicate records arriving from several source systems into
//! canonical entities:
//!
//! 1. **Blocking** ([`fingerprint`]): per-type keys limit which records are
//!    compared.
//! 2. **Similarity** ([`similarity`]): cosine similarity over candidate pairs,
//!    then single-linkage clustering at a threshold.
//! 3. **Merging** ([`merger`]): one canonical record per cluster, attributes
//!    resolved by source authority, evidence accumulated, `sameAs` relations
//!    emitted for every absorbed record.
//!
//! A batch is processed as a single unit; nothing is written to a store
//! until [`ResolutionOutcome::persist`] is called.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use kgr_core::{
    Cluster, EmbedMode, EmbeddingService, Entity, EntityId, EntityStore, KgrError, Relation,
    ResolutionConfig, Result,
};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub mod fingerprint;
pub mod merger;
pub mod similarity;

pub use fingerprint::{BlockKey, Blocker, CandidatePair, FingerprintFn, KeyKind};
pub use merger::{select_canonical, CanonicalMerger};
pub use similarity::{ResolverStats, SimilarityEdge, SimilarityResolver};

/// Concurrent embedding requests issued by [`ResolutionBatch::embed_missing`]
const EMBED_CONCURRENCY: usize = 8;

// ============================================================================
// Batch
// ============================================================================

/// A record dropped at ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub id: String,
    pub reason: String,
}

/// Entities collected for one resolution run
#[derive(Debug, Clone)]
pub struct ResolutionBatch {
    batch_id: Uuid,
    received_at: DateTime<Utc>,
    entities: Vec<Entity>,
    rejected: Vec<RejectedRecord>,
}

impl ResolutionBatch {
    /// Validate and collect records
    ///
    /// Malformed records and repeated ids are logged and set aside; the rest
    /// of the batch proceeds.
    pub fn ingest(records: impl IntoIterator<Item = Entity>) -> Self {
        let batch_id = Uuid::new_v4();
        let mut seen: HashSet<EntityId> = HashSet::new();
        let mut entities = Vec::new();
        let mut rejected = Vec::new();

        for record in records {
            let check = record.validate().and_then(|_| {
                if seen.contains(&record.id) {
                    Err(KgrError::MalformedRecord {
                        id: record.id.clone(),
                        reason: "duplicate id in batch".to_string(),
                    })
                } else {
                    Ok(())
                }
            });

            match check {
                Ok(()) => {
                    seen.insert(record.id.clone());
                    entities.push(record);
                }
                Err(err) => {
                    warn!(batch_id = %batch_id, id = %record.id, error = %err, "Rejected record");
                    rejected.push(RejectedRecord {
                        id: record.id,
                        reason: err.to_string(),
                    });
                }
            }
        }

        Self {
            batch_id,
            received_at: Utc::now(),
            entities,
            rejected,
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn rejected(&self) -> &[RejectedRecord] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Compute document-mode embeddings for entities that lack one
    ///
    /// Returns how many entities were embedded. The first embedding failure
    /// aborts the call and leaves the batch unchanged.
    pub async fn embed_missing(&mut self, embedder: &dyn EmbeddingService) -> Result<usize> {
        let jobs: Vec<(usize, String)> = self
            .entities
            .iter()
            .enumerate()
            .filter(|(_, e)| e.embedding.is_none())
            .map(|(index, e)| (index, e.render_text()))
            .collect();

        if jobs.is_empty() {
            return Ok(0);
        }

        let embedded: Vec<(usize, Vec<f32>)> = stream::iter(jobs)
            .map(|(index, text)| async move {
                embedder
                    .embed(&text, EmbedMode::Document)
                    .await
                    .map(|vector| (index, vector))
            })
            .buffered(EMBED_CONCURRENCY)
            .try_collect()
            .await?;

        let count = embedded.len();
        for (index, vector) in embedded {
            self.entities[index].embedding = Some(vector);
        }

        info!(
            batch_id = %self.batch_id,
            embedder = embedder.name(),
            count,
            "Embedded entities"
        );
        Ok(count)
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Result of resolving one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub batch_id: Uuid,
    /// One entity per cluster, ordered by canonical id
    pub merged: Vec<Entity>,
    /// Non-canonical member records, stored without embeddings so k-NN only
    /// surfaces canonical entities
    #[serde(default)]
    pub absorbed: Vec<Entity>,
    /// sameAs relations, canonical -> member
    pub same_as: Vec<Relation>,
    pub clusters: Vec<Cluster>,
    pub stats: ResolverStats,
    pub rejected: Vec<RejectedRecord>,
}

impl ResolutionOutcome {
    /// Check every record and relation endpoint before anything is written
    fn check_writable(&self) -> Result<()> {
        let mut written: HashSet<&str> = HashSet::new();
        for entity in self.merged.iter().chain(&self.absorbed) {
            entity.validate()?;
            written.insert(entity.id.as_str());
        }

        for relation in &self.same_as {
            relation.validate()?;
            let endpoints = std::iter::once(&relation.subject_id).chain(relation.object_id());
            for id in endpoints {
                if !written.contains(id.as_str()) {
                    return Err(KgrError::InvalidRecord(format!(
                        "relation {} references {id}, which is not part of the outcome",
                        relation.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Write merged entities, absorbed members, then sameAs relations
    ///
    /// The outcome is checked up front; a malformed record or a dangling
    /// relation fails before the store is touched.
    pub async fn persist(&self, store: &dyn EntityStore) -> Result<()> {
        self.check_writable()?;

        for entity in self.merged.iter().chain(&self.absorbed) {
            store.put_entity(entity.clone()).await?;
        }
        for relation in &self.same_as {
            store.put_relation(relation.clone()).await?;
        }

        info!(
            batch_id = %self.batch_id,
            store = store.name(),
            entities = self.merged.len(),
            absorbed = self.absorbed.len(),
            relations = self.same_as.len(),
            "Resolution outcome persisted"
        );
        Ok(())
    }
}

/// Blocking, similarity and merging wired together
#[derive(Debug, Clone, Default)]
pub struct EntityResolver {
    blocker: Blocker,
    similarity: SimilarityResolver,
    merger: CanonicalMerger,
}

impl EntityResolver {
    pub fn new(config: &ResolutionConfig) -> Self {
        Self {
            blocker: Blocker::new(),
            similarity: SimilarityResolver::from_config(config),
            merger: CanonicalMerger::new(),
        }
    }

    pub fn with_blocker(mut self, blocker: Blocker) -> Self {
        self.blocker = blocker;
        self
    }

    /// Resolve a batch into merged entities and sameAs relations
    pub fn run(&self, batch: ResolutionBatch) -> Result<ResolutionOutcome> {
        let span = info_span!("resolution_batch", batch_id = %batch.batch_id);
        let _enter = span.enter();

        let entities = batch.entities();
        let unembedded = entities.iter().filter(|e| e.embedding.is_none()).count();
        if unembedded > 0 {
            warn!(unembedded, "Entities without embeddings stay singletons");
        }

        let pairs = self.blocker.candidate_pairs(entities);
        let edges = self.similarity.score_pairs(entities, &pairs);
        let clusters = self.similarity.cluster(entities, &edges);

        let by_id: HashMap<EntityId, &Entity> =
            entities.iter().map(|e| (e.id.clone(), e)).collect();

        let mut merged = Vec::with_capacity(clusters.len());
        let mut absorbed = Vec::new();
        let mut same_as = Vec::new();
        for cluster in &clusters {
            let (entity, relations) = self.merger.merge(cluster, &by_id)?;
            merged.push(entity);
            same_as.extend(relations);

            let members = cluster
                .members
                .iter()
                .filter(|id| **id != cluster.canonical_id)
                .filter_map(|id| by_id.get(id));
            for member in members {
                absorbed.push(Entity {
                    embedding: None,
                    ..(*member).clone()
                });
            }
        }

        let stats = ResolverStats {
            entities: entities.len(),
            candidate_pairs: pairs.len(),
            edges: edges.len(),
            clusters: clusters.len(),
            merged_members: entities.len() - clusters.len(),
            largest_cluster: clusters.iter().map(Cluster::len).max().unwrap_or(0),
        };

        info!(
            entities = stats.entities,
            candidate_pairs = stats.candidate_pairs,
            edges = stats.edges,
            clusters = stats.clusters,
            merged_members = stats.merged_members,
            largest_cluster = stats.largest_cluster,
            rejected = batch.rejected.len(),
            threshold = self.similarity.threshold(),
            "Resolution batch complete"
        );

        Ok(ResolutionOutcome {
            batch_id: batch.batch_id,
            merged,
            absorbed,
            same_as,
            clusters,
            stats,
            rejected: batch.rejected,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
