//! Retrieval engine: k-NN and capped N-hop traversal over an [`EntityStore`]

use std::collections::HashSet;
use std::sync::Arc;

use kgr_core::{Entity, EntityId, EntityStore, Hops, KnnFilter, Relation, Result, ScoredEntity};

/// Entities reached by a traversal and the relations walked to reach them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraversalResult {
    /// Visited entities in traversal order; seeds excluded
    pub entities: Vec<Entity>,
    /// Relations among seeds and visited entities, in fetch order
    pub relations: Vec<Relation>,
    /// Hops actually expanded (0, 1 or 2)
    pub hops_completed: u8,
}

impl TraversalResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|e| e.id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Collect neighbors of `frontier` reachable through `relations`
///
/// Candidates keep the relations' order, skip `excluded`, and stop at `limit`.
fn expand(
    relations: &[Relation],
    frontier: &HashSet<&str>,
    excluded: &HashSet<&str>,
    limit: usize,
) -> Vec<EntityId> {
    let mut found: Vec<EntityId> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for relation in relations {
        let Some(object) = relation.object_id() else {
            continue;
        };
        let subject = relation.subject_id.as_str();
        let object = object.as_str();

        let mut reached = Vec::with_capacity(2);
        if frontier.contains(subject) {
            reached.push(object);
        }
        if frontier.contains(object) {
            reached.push(subject);
        }

        for id in reached {
            if found.len() >= limit {
                return found;
            }
            if excluded.contains(id) || !seen.insert(id) {
                continue;
            }
            found.push(id.to_string());
        }
    }
    found
}

/// k-NN search and graph expansion over a shared store
#[derive(Clone)]
pub struct RetrievalEngine {
    store: Arc<dyn EntityStore>,
}

impl RetrievalEngine {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Nearest entities within the filter's organization and types
    pub async fn knn(
        &self,
        vector: &[f32],
        k: usize,
        filter: &KnnFilter,
    ) -> Result<Vec<ScoredEntity>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut hits = self.store.knn(vector, k, filter).await?;
        hits.truncate(k);
        Ok(hits)
    }

    /// Entities by id, in request order
    pub async fn hydrate(&self, organization_id: &str, ids: &[EntityId]) -> Result<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.store.get_entities(organization_id, ids).await
    }

    /// Breadth-first expansion from `seeds`, visiting at most `max_nodes` entities
    ///
    /// Hop 2 only runs when hop 1 left room under `max_nodes`.
    pub async fn traverse(
        &self,
        organization_id: &str,
        seeds: &[EntityId],
        hops: Hops,
        max_nodes: usize,
    ) -> Result<TraversalResult> {
        if seeds.is_empty() || max_nodes == 0 {
            return Ok(TraversalResult::empty());
        }

        let seed_set: HashSet<&str> = seeds.iter().map(String::as_str).collect();

        let first = self.store.get_relations(organization_id, seeds).await?;
        let hop1 = expand(&first, &seed_set, &seed_set, max_nodes);
        let mut visited = hop1.clone();
        let mut fetched = first;
        let mut hops_completed = 1;

        if hops == Hops::Two && !hop1.is_empty() && hop1.len() < max_nodes {
            let second = self.store.get_relations(organization_id, &hop1).await?;

            let frontier: HashSet<&str> = hop1.iter().map(String::as_str).collect();
            let excluded: HashSet<&str> = seed_set.union(&frontier).copied().collect();
            let hop2 = expand(&second, &frontier, &excluded, max_nodes - hop1.len());

            visited.extend(hop2);
            fetched.extend(second);
            hops_completed = 2;
        }

        let known: HashSet<&str> = seed_set
            .iter()
            .copied()
            .chain(visited.iter().map(String::as_str))
            .collect();
        let mut relation_ids: HashSet<&str> = HashSet::new();
        let mut relations = Vec::new();
        for relation in &fetched {
            let inside = known.contains(relation.subject_id.as_str())
                && relation
                    .object_id()
                    .map_or(true, |o| known.contains(o.as_str()));
            if inside && relation_ids.insert(relation.id.as_str()) {
                relations.push(relation.clone());
            }
        }

        let entities = self.hydrate(organization_id, &visited).await?;

        tracing::debug!(
            seeds = seeds.len(),
            visited = entities.len(),
            relations = relations.len(),
            hops_completed,
            "Traversal completed"
        );

        Ok(TraversalResult {
            entities,
            relations,
            hops_completed,
        })
    }
}

impl std::fmt::Debug for RetrievalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalEngine")
            .field("store", &self.store.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[&str]) -> Vec<EntityId> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn set<'a>(items: &[&'a str]) -> HashSet<&'a str> {
        items.iter().copied().collect()
    }

    #[test]
    fn test_expand_both_directions_in_order() {
        let relations = vec![
            Relation::between("s", "owns", "n1"),
            Relation::between("n2", "advises", "s"),
            Relation::between("s", "owns", "n1"),
            Relation::literal("s", "risk_score", 7),
        ];
        let found = expand(&relations, &set(&["s"]), &set(&["s"]), 10);
        assert_eq!(found, ids(&["n1", "n2"]));
    }

    #[test]
    fn test_expand_respects_limit_and_exclusions() {
        let relations = vec![
            Relation::between("s", "owns", "n1"),
            Relation::between("s", "owns", "n2"),
            Relation::between("s", "owns", "n3"),
        ];
        assert_eq!(expand(&relations, &set(&["s"]), &set(&["s"]), 1), ids(&["n1"]));
        assert_eq!(
            expand(&relations, &set(&["s"]), &set(&["s", "n1"]), 10),
            ids(&["n2", "n3"])
        );
    }

    #[test]
    fn test_relation_between_two_frontier_nodes() {
        let relations = vec![Relation::between("a", "knows", "b")];
        let found = expand(&relations, &set(&["a", "b"]), &set(&["a"]), 10);
        assert_eq!(found, ids(&["b"]));
    }
}
