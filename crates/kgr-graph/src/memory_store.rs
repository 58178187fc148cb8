//! In-memory entity/relation store
//!
//! Brute-force cosine k-NN over stored embeddings and an adjacency index
//! over relations. A relation never crosses organizations; reads return it
//! only when every entity endpoint belongs to the caller's organization, in
//! insertion order.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use kgr_core::{
    Entity, EntityId, EntityStore, KgrError, KnnFilter, Relation, Result, ScoredEntity,
};
use kgr_vector::cosine_similarity;
use tokio::sync::RwLock;

use crate::GraphSnapshot;

#[derive(Debug, Default)]
struct GraphState {
    entities: HashMap<EntityId, Entity>,
    /// Relations in insertion order
    relations: Vec<Relation>,
    /// Relation id -> position in `relations`
    relation_positions: HashMap<String, usize>,
    /// Entity id -> positions of incident relations
    adjacency: HashMap<EntityId, BTreeSet<usize>>,
}

impl GraphState {
    fn endpoints(relation: &Relation) -> impl Iterator<Item = &EntityId> {
        std::iter::once(&relation.subject_id).chain(relation.object_id())
    }

    fn index(&mut self, position: usize) {
        let ids: Vec<EntityId> = Self::endpoints(&self.relations[position]).cloned().collect();
        for id in ids {
            self.adjacency.entry(id).or_default().insert(position);
        }
    }

    fn unindex(&mut self, position: usize) {
        let ids: Vec<EntityId> = Self::endpoints(&self.relations[position]).cloned().collect();
        for id in ids {
            if let Some(positions) = self.adjacency.get_mut(&id) {
                positions.remove(&position);
            }
        }
    }

    fn in_org(&self, id: &str, organization_id: &str) -> bool {
        self.entities
            .get(id)
            .is_some_and(|e| e.organization_id == organization_id)
    }

    /// Both entity endpoints belong to `organization_id`
    fn relation_in_org(&self, relation: &Relation, organization_id: &str) -> bool {
        Self::endpoints(relation).all(|id| self.in_org(id, organization_id))
    }
}

/// In-memory [`EntityStore`]
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    state: RwLock<GraphState>,
}

impl MemoryGraphStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store populated from a snapshot
    ///
    /// Entities are loaded before relations so relation endpoints resolve.
    pub async fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self> {
        let store = Self::new();
        let (entities, relations) = (snapshot.entities.len(), snapshot.relations.len());

        for entity in snapshot.entities {
            store.put_entity(entity).await?;
        }
        for relation in snapshot.relations {
            store.put_relation(relation).await?;
        }

        tracing::info!(entities, relations, "Loaded graph snapshot");
        Ok(store)
    }

    /// Number of stored entities
    pub async fn entity_count(&self) -> usize {
        self.state.read().await.entities.len()
    }

    /// Number of stored relations
    pub async fn relation_count(&self) -> usize {
        self.state.read().await.relations.len()
    }
}

#[async_trait]
impl EntityStore for MemoryGraphStore {
    async fn knn(&self, vector: &[f32], k: usize, filter: &KnnFilter) -> Result<Vec<ScoredEntity>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let mut scored: Vec<ScoredEntity> = state
            .entities
            .values()
            .filter(|e| filter.matches(e))
            .filter_map(|e| {
                let embedding = e.embedding.as_deref()?;
                let score = cosine_similarity(vector, embedding)?;
                Some(ScoredEntity::new(e.id.clone(), score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        scored.truncate(k);

        tracing::debug!(
            organization = %filter.organization_id,
            returned = scored.len(),
            "k-NN search completed"
        );
        Ok(scored)
    }

    async fn get_entities(&self, organization_id: &str, ids: &[EntityId]) -> Result<Vec<Entity>> {
        let state = self.state.read().await;
        let entities = ids
            .iter()
            .filter_map(|id| state.entities.get(id))
            .filter(|e| e.organization_id == organization_id)
            .cloned()
            .collect();
        Ok(entities)
    }

    async fn get_relations(
        &self,
        organization_id: &str,
        ids: &[EntityId],
    ) -> Result<Vec<Relation>> {
        let state = self.state.read().await;

        let positions: BTreeSet<usize> = ids
            .iter()
            .filter_map(|id| state.adjacency.get(id))
            .flatten()
            .copied()
            .collect();

        let relations = positions
            .into_iter()
            .map(|p| &state.relations[p])
            .filter(|r| state.relation_in_org(r, organization_id))
            .cloned()
            .collect();
        Ok(relations)
    }

    async fn put_entity(&self, entity: Entity) -> Result<()> {
        entity.validate()?;

        let mut state = self.state.write().await;
        if let Some(existing) = state.entities.get(&entity.id) {
            if existing.organization_id != entity.organization_id {
                return Err(KgrError::Validation(format!(
                    "entity {} already belongs to organization {}",
                    entity.id, existing.organization_id
                )));
            }
        }
        state.entities.insert(entity.id.clone(), entity);
        Ok(())
    }

    async fn put_relation(&self, relation: Relation) -> Result<()> {
        relation.validate()?;

        let mut state = self.state.write().await;
        let mut organization: Option<&str> = None;
        for id in GraphState::endpoints(&relation) {
            let Some(endpoint) = state.entities.get(id) else {
                return Err(KgrError::NotFound(format!(
                    "relation {} references unknown entity {id}",
                    relation.id
                )));
            };
            match organization {
                None => organization = Some(endpoint.organization_id.as_str()),
                Some(org) if org != endpoint.organization_id => {
                    return Err(KgrError::Validation(format!(
                        "relation {} links {} across organizations {org} and {}",
                        relation.id, id, endpoint.organization_id
                    )));
                }
                Some(_) => {}
            }
        }

        match state.relation_positions.get(&relation.id).copied() {
            Some(position) => {
                state.unindex(position);
                state.relations[position] = relation;
                state.index(position);
            }
            None => {
                let position = state.relations.len();
                state.relation_positions.insert(relation.id.clone(), position);
                state.relations.push(relation);
                state.index(position);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str, org: &str, embedding: Vec<f32>) -> Entity {
        Entity::new(id, org, "Client").with_embedding(embedding)
    }

    async fn seeded() -> MemoryGraphStore {
        let store = MemoryGraphStore::new();
        store.put_entity(entity("a", "org-1", vec![1.0, 0.0])).await.unwrap();
        store.put_entity(entity("b", "org-1", vec![0.8, 0.2])).await.unwrap();
        store.put_entity(entity("c", "org-1", vec![0.0, 1.0])).await.unwrap();
        store.put_entity(entity("x", "org-2", vec![1.0, 0.0])).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_knn_is_scoped_and_ordered() {
        let store = seeded().await;
        let hits = store
            .knn(&[1.0, 0.0], 10, &KnnFilter::new("org-1"))
            .await
            .unwrap();

        let ids: Vec<_> = hits.iter().map(|h| h.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_knn_respects_k_and_types() {
        let store = seeded().await;
        store
            .put_entity(Entity::new("acct", "org-1", "Account").with_embedding(vec![1.0, 0.0]))
            .await
            .unwrap();

        let hits = store
            .knn(&[1.0, 0.0], 1, &KnnFilter::new("org-1"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let accounts = store
            .knn(&[1.0, 0.0], 10, &KnnFilter::new("org-1").with_type("Account"))
            .await
            .unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].entity_id, "acct");
    }

    #[tokio::test]
    async fn test_relations_in_insertion_order_and_scoped() {
        let store = seeded().await;
        store
            .put_relation(Relation::between("a", "knows", "b").with_id("r1"))
            .await
            .unwrap();
        store
            .put_relation(Relation::between("c", "advises", "a").with_id("r2"))
            .await
            .unwrap();

        let relations = store
            .get_relations("org-1", &["a".to_string()])
            .await
            .unwrap();
        let ids: Vec<_> = relations.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);

        let foreign = store
            .get_relations("org-2", &["a".to_string()])
            .await
            .unwrap();
        assert!(foreign.is_empty());
    }

    #[tokio::test]
    async fn test_put_relation_requires_endpoints() {
        let store = seeded().await;
        let result = store
            .put_relation(Relation::between("a", "knows", "ghost"))
            .await;
        assert!(matches!(result, Err(KgrError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_put_relation_rejects_cross_organization_links() {
        let store = seeded().await;
        let result = store
            .put_relation(Relation::between("a", "knows", "x").with_id("leak"))
            .await;
        assert!(matches!(result, Err(KgrError::Validation(_))));

        store
            .put_relation(Relation::between("a", "knows", "c").with_id("r1"))
            .await
            .unwrap();
        assert_eq!(store.relation_count().await, 1);

        let relations = store
            .get_relations("org-1", &["a".to_string()])
            .await
            .unwrap();
        let ids: Vec<_> = relations.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1"]);
    }

    #[tokio::test]
    async fn test_relation_replace_reindexes() {
        let store = seeded().await;
        store
            .put_relation(Relation::between("a", "knows", "b").with_id("r1"))
            .await
            .unwrap();
        store
            .put_relation(Relation::between("a", "knows", "c").with_id("r1"))
            .await
            .unwrap();

        assert_eq!(store.relation_count().await, 1);
        let on_b = store
            .get_relations("org-1", &["b".to_string()])
            .await
            .unwrap();
        assert!(on_b.is_empty());
    }

    #[tokio::test]
    async fn test_put_entity_rejects_malformed_and_cross_tenant() {
        let store = seeded().await;

        let mut malformed = Entity::new("m", "org-1", "Client");
        malformed.types.clear();
        assert!(store.put_entity(malformed).await.is_err());

        let hijack = Entity::new("a", "org-2", "Client");
        assert!(matches!(
            store.put_entity(hijack).await,
            Err(KgrError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_get_entities_preserves_request_order() {
        let store = seeded().await;
        let ids = vec!["c".to_string(), "missing".to_string(), "a".to_string(), "x".to_string()];
        let entities = store.get_entities("org-1", &ids).await.unwrap();
        let got: Vec<_> = entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(got, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_from_snapshot() {
        let snapshot = GraphSnapshot {
            entities: vec![entity("a", "org-1", vec![1.0]), entity("b", "org-1", vec![1.0])],
            relations: vec![Relation::between("a", "knows", "b")],
        };
        let store = MemoryGraphStore::from_snapshot(snapshot).await.unwrap();
        assert_eq!(store.entity_count().await, 2);
        assert_eq!(store.relation_count().await, 1);
    }
}
