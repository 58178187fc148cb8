//! Canonical selection and cluster merging

use std::cmp::Ordering;
use std::collections::HashMap;

use kgr_core::{Cluster, Entity, EntityId, KgrError, Relation, Result};

use crate::similarity::link_confidence;

/// Canonical precedence: lowest priority, then earliest creation, then smallest id
fn canonical_order(a: &Entity, b: &Entity) -> Ordering {
    a.source_priority
        .cmp(&b.source_priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Authority order: lowest priority, then most recently updated, then smallest id
fn authority_order(a: &Entity, b: &Entity) -> Ordering {
    a.source_priority
        .cmp(&b.source_priority)
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Pick the canonical member of a cluster; `None` for an empty slice
pub fn select_canonical<'a>(members: &[&'a Entity]) -> Option<&'a Entity> {
    members.iter().copied().min_by(|a, b| canonical_order(a, b))
}

/// Collapses a cluster into one entity plus its sameAs relations
#[derive(Debug, Clone, Default)]
pub struct CanonicalMerger;

impl CanonicalMerger {
    pub fn new() -> Self {
        Self
    }

    /// Merge a cluster's members into the canonical record
    ///
    /// Attribute conflicts go to the most authoritative member; evidence
    /// spans from every member are kept. Returns the merged entity and one
    /// `sameAs` relation per non-canonical member, canonical -> member.
    pub fn merge(
        &self,
        cluster: &Cluster,
        entities: &HashMap<EntityId, &Entity>,
    ) -> Result<(Entity, Vec<Relation>)> {
        if !cluster.members.contains(&cluster.canonical_id) {
            return Err(KgrError::Validation(format!(
                "canonical {} is not a member of its cluster",
                cluster.canonical_id
            )));
        }

        let mut members = Vec::with_capacity(cluster.members.len());
        for id in &cluster.members {
            let entity = entities.get(id).copied().ok_or_else(|| {
                KgrError::Validation(format!("cluster member {id} has no record"))
            })?;
            members.push(entity);
        }

        let canonical = entities
            .get(&cluster.canonical_id)
            .copied()
            .ok_or_else(|| {
                KgrError::Validation(format!("canonical {} has no record", cluster.canonical_id))
            })?;

        if members.len() == 1 {
            return Ok((canonical.clone(), Vec::new()));
        }

        if let Some(stray) = members
            .iter()
            .find(|m| m.organization_id != canonical.organization_id)
        {
            return Err(KgrError::Validation(format!(
                "cluster {} mixes organizations {} and {}",
                cluster.canonical_id, canonical.organization_id, stray.organization_id
            )));
        }

        members.sort_by(|a, b| authority_order(a, b));

        let mut merged = canonical.clone();
        merged.attributes.clear();
        merged.evidence_spans.clear();

        for member in &members {
            for (key, value) in &member.attributes {
                merged
                    .attributes
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
            merged.types.extend(member.types.iter().cloned());
            merged
                .evidence_spans
                .extend(member.evidence_spans.iter().cloned());
        }

        if merged.embedding.is_none() {
            merged.embedding = members.iter().find_map(|m| m.embedding.clone());
        }
        merged.created_at = members
            .iter()
            .map(|m| m.created_at)
            .min()
            .unwrap_or(canonical.created_at);
        merged.updated_at = members
            .iter()
            .map(|m| m.updated_at)
            .max()
            .unwrap_or(canonical.updated_at);

        let relations = self.same_as_relations(cluster, canonical, entities);

        tracing::debug!(
            canonical = %merged.id,
            members = members.len(),
            attributes = merged.attributes.len(),
            evidence = merged.evidence_spans.len(),
            "Cluster merged"
        );
        Ok((merged, relations))
    }

    fn same_as_relations(
        &self,
        cluster: &Cluster,
        canonical: &Entity,
        entities: &HashMap<EntityId, &Entity>,
    ) -> Vec<Relation> {
        cluster
            .members
            .iter()
            .filter(|id| **id != canonical.id)
            .map(|member_id| {
                let confidence = cluster
                    .same_as_links
                    .iter()
                    .find(|link| link.from == canonical.id && &link.to == member_id)
                    .map(|link| link.confidence)
                    .or_else(|| {
                        entities
                            .get(member_id)
                            .map(|member| link_confidence(canonical, member))
                    })
                    .unwrap_or(0.0);
                Relation::same_as(&canonical.id, member_id, confidence)
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use kgr_core::{source_priority, EvidenceSpan, SameAsLink, SAME_AS};

    fn index<'a>(entities: &'a [Entity]) -> HashMap<EntityId, &'a Entity> {
        entities.iter().map(|e| (e.id.clone(), e)).collect()
    }

    fn cluster_of(canonical: &str, members: &[&str]) -> Cluster {
        Cluster {
            members: members.iter().map(|m| m.to_string()).collect(),
            canonical_id: canonical.to_string(),
            same_as_links: Vec::new(),
        }
    }

    #[test]
    fn test_select_canonical_precedence() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = t0 + Duration::days(1);

        let crm = Entity::new("crm", "org-1", "Client")
            .with_source_priority(source_priority::CRM)
            .with_timestamps(t0, t0);
        let custodian = Entity::new("cust", "org-1", "Client")
            .with_source_priority(source_priority::CUSTODIAN)
            .with_timestamps(t1, t1);
        assert_eq!(select_canonical(&[&crm, &custodian]).unwrap().id, "cust");

        let older = Entity::new("z-older", "org-1", "Client").with_timestamps(t0, t0);
        let newer = Entity::new("a-newer", "org-1", "Client").with_timestamps(t1, t1);
        assert_eq!(select_canonical(&[&newer, &older]).unwrap().id, "z-older");

        let b = Entity::new("b", "org-1", "Client").with_timestamps(t0, t0);
        let a = Entity::new("a", "org-1", "Client").with_timestamps(t0, t0);
        assert_eq!(select_canonical(&[&b, &a]).unwrap().id, "a");

        assert!(select_canonical(&[]).is_none());
    }

    #[test]
    fn test_custodian_value_wins_and_evidence_is_kept() {
        let custodian_span =
            EvidenceSpan::new("custodian-stmt-7", "Net worth: $5,000,000", 0, 21, 0.97).unwrap();
        let crm_span = EvidenceSpan::new("crm-export", "NW 4M", 10, 15, 0.6).unwrap();

        let entities = vec![
            Entity::new("client-crm", "org-1", "Client")
                .with_source_priority(source_priority::CRM)
                .with_evidenced_attribute("net_worth", 4_000_000, crm_span)
                .with_attribute("email", "jane@example.com"),
            Entity::new("client-cust", "org-1", "Client")
                .with_source_priority(source_priority::CUSTODIAN)
                .with_evidenced_attribute("net_worth", 5_000_000, custodian_span),
        ];
        let cluster = cluster_of("client-cust", &["client-crm", "client-cust"]);

        let (merged, relations) = CanonicalMerger::new()
            .merge(&cluster, &index(&entities))
            .unwrap();

        assert_eq!(merged.id, "client-cust");
        assert_eq!(
            merged.attributes["net_worth"].value(),
            &serde_json::json!(5_000_000)
        );
        assert_eq!(merged.attribute_str("email"), Some("jane@example.com"));

        let sources: Vec<_> = merged
            .evidence_spans
            .iter()
            .map(EvidenceSpan::source_document_id)
            .collect();
        assert_eq!(sources, vec!["custodian-stmt-7", "crm-export"]);

        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].predicate, SAME_AS);
        assert_eq!(relations[0].subject_id, "client-cust");
        assert_eq!(relations[0].object_id().map(String::as_str), Some("client-crm"));
    }

    #[test]
    fn test_equal_priority_prefers_recent_update() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = t0 + Duration::days(30);

        let entities = vec![
            Entity::new("old", "org-1", "Client")
                .with_attribute("phone", "555-0100")
                .with_timestamps(t0, t0),
            Entity::new("new", "org-1", "Client")
                .with_attribute("phone", "555-0199")
                .with_timestamps(t1, t1),
        ];
        let cluster = cluster_of("old", &["new", "old"]);

        let (merged, _) = CanonicalMerger::new()
            .merge(&cluster, &index(&entities))
            .unwrap();
        assert_eq!(merged.id, "old");
        assert_eq!(merged.attribute_str("phone"), Some("555-0199"));
        assert_eq!(merged.created_at, t0);
        assert_eq!(merged.updated_at, t1);
    }

    #[test]
    fn test_types_union_and_embedding_fallback() {
        let entities = vec![
            Entity::new("a", "org-1", "Client").with_source_priority(1),
            Entity::new("b", "org-1", "Individual")
                .with_source_priority(2)
                .with_embedding(vec![0.1, 0.2]),
        ];
        let (merged, _) = CanonicalMerger::new()
            .merge(&cluster_of("a", &["a", "b"]), &index(&entities))
            .unwrap();

        assert!(merged.types.contains("Client"));
        assert!(merged.types.contains("Individual"));
        assert_eq!(merged.embedding, Some(vec![0.1, 0.2]));
    }

    #[test]
    fn test_link_confidence_carried_to_relation() {
        let entities = vec![
            Entity::new("a", "org-1", "Client"),
            Entity::new("b", "org-1", "Client"),
        ];
        let mut cluster = cluster_of("a", &["a", "b"]);
        cluster.same_as_links.push(SameAsLink {
            from: "a".to_string(),
            to: "b".to_string(),
            confidence: 0.91,
        });

        let (_, relations) = CanonicalMerger::new()
            .merge(&cluster, &index(&entities))
            .unwrap();
        let confidence = relations[0].grounding_confidence.unwrap();
        assert!((confidence - 0.91).abs() < 1e-6);
    }

    #[test]
    fn test_singleton_is_unchanged() {
        let entities = vec![Entity::new("solo", "org-1", "Client").with_attribute("name", "Solo")];
        let (merged, relations) = CanonicalMerger::new()
            .merge(&Cluster::singleton("solo"), &index(&entities))
            .unwrap();

        assert_eq!(merged, entities[0]);
        assert!(relations.is_empty());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let entities = vec![
            Entity::new("a", "org-1", "Client")
                .with_source_priority(1)
                .with_attribute("name", "A"),
            Entity::new("b", "org-1", "Client").with_attribute("city", "Boston"),
        ];
        let merger = CanonicalMerger::new();
        let (merged, _) = merger
            .merge(&cluster_of("a", &["a", "b"]), &index(&entities))
            .unwrap();

        let again = vec![merged.clone()];
        let (remerged, relations) = merger
            .merge(&Cluster::singleton("a"), &index(&again))
            .unwrap();
        assert_eq!(remerged, merged);
        assert!(relations.is_empty());
    }

    #[test]
    fn test_validation_errors() {
        let entities = vec![Entity::new("a", "org-1", "Client")];
        let merger = CanonicalMerger::new();

        let missing = merger.merge(&cluster_of("a", &["a", "ghost"]), &index(&entities));
        assert!(matches!(missing, Err(KgrError::Validation(_))));

        let outsider = merger.merge(&cluster_of("zzz", &["a"]), &index(&entities));
        assert!(matches!(outsider, Err(KgrError::Validation(_))));

        let mixed = vec![
            Entity::new("a", "org-1", "Client"),
            Entity::new("b", "org-2", "Client"),
        ];
        let result = merger.merge(&cluster_of("a", &["a", "b"]), &index(&mixed));
        assert!(matches!(result, Err(KgrError::Validation(_))));
    }
}
