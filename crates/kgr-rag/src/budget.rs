//! Token-budgeted context assembly

use std::collections::HashSet;
use std::sync::Arc;

use kgr_core::{ContextBundle, Entity, Relation, TokenEstimator};

/// Approximates tokens as one per four characters
#[derive(Debug, Clone, Copy, Default)]
pub struct CharRatioEstimator;

impl TokenEstimator for CharRatioEstimator {
    fn estimate_tokens(&self, text: &str) -> usize {
        let chars = text.chars().count();
        if chars == 0 {
            0
        } else {
            chars.div_ceil(4).max(1)
        }
    }
}

/// Packs ranked entities and their relations under a token budget
#[derive(Clone)]
pub struct ContextAssembler {
    estimator: Arc<dyn TokenEstimator>,
}

impl ContextAssembler {
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { estimator }
    }

    /// Greedily assemble a bundle
    ///
    /// Entities are taken in rank order until the first one that does not
    /// fit; nothing after it is considered. After each included entity its
    /// incident relations are added in order until one would overflow.
    pub fn assemble(
        &self,
        ranked: &[Entity],
        relations: &[Relation],
        token_budget: usize,
    ) -> ContextBundle {
        let mut bundle = ContextBundle::empty(token_budget);
        let mut remaining = token_budget;
        let mut included: HashSet<&str> = HashSet::new();

        for entity in ranked {
            let cost = self.estimator.estimate_tokens(&entity.render_text());
            if cost > remaining {
                tracing::debug!(
                    entity = %entity.id,
                    cost,
                    remaining,
                    "Budget exhausted"
                );
                break;
            }
            remaining -= cost;
            bundle.entities.push(entity.clone());

            for relation in relations.iter().filter(|r| r.touches(&entity.id)) {
                if included.contains(relation.id.as_str()) {
                    continue;
                }
                let cost = self.estimator.estimate_tokens(&relation.render_text());
                if cost > remaining {
                    break;
                }
                remaining -= cost;
                included.insert(relation.id.as_str());
                bundle.relations.push(relation.clone());
            }
        }

        bundle.used_tokens = token_budget - remaining;
        bundle
    }
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(Arc::new(CharRatioEstimator))
    }
}

impl std::fmt::Debug for ContextAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextAssembler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    /// Costs keyed by the first word after "] "
    struct TableEstimator {
        costs: HashMap<String, usize>,
    }

    impl TableEstimator {
        fn new(costs: &[(&str, usize)]) -> Self {
            Self {
                costs: costs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            }
        }
    }

    impl TokenEstimator for TableEstimator {
        fn estimate_tokens(&self, text: &str) -> usize {
            let key = text
                .split_once("] ")
                .map(|(_, rest)| rest)
                .unwrap_or(text)
                .split(|c: char| c == ';' || c.is_whitespace())
                .next()
                .unwrap_or_default();
            self.costs.get(key).copied().unwrap_or(1)
        }
    }

    fn entity(id: &str) -> Entity {
        Entity::new(id, "org-1", "Client")
    }

    fn assembler(costs: &[(&str, usize)]) -> ContextAssembler {
        ContextAssembler::new(Arc::new(TableEstimator::new(costs)))
    }

    #[test]
    fn test_char_ratio_estimator() {
        let estimator = CharRatioEstimator;
        assert_eq!(estimator.estimate_tokens(""), 0);
        assert_eq!(estimator.estimate_tokens("a"), 1);
        assert_eq!(estimator.estimate_tokens("abcd"), 1);
        assert_eq!(estimator.estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_budget_worked_example() {
        let ranked = vec![entity("e1"), entity("e2"), entity("e3")];
        let bundle = assembler(&[("e1", 40), ("e2", 50), ("e3", 30)])
            .assemble(&ranked, &[], 100);

        let ids: Vec<_> = bundle.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
        assert_eq!(bundle.used_tokens, 90);
        assert_eq!(bundle.token_budget, 100);
    }

    #[test]
    fn test_first_overflow_stops_outer_loop() {
        // e3 would fit after e2 is skipped, but the loop stops at e2
        let ranked = vec![entity("e1"), entity("e2"), entity("e3")];
        let bundle = assembler(&[("e1", 40), ("e2", 70), ("e3", 10)])
            .assemble(&ranked, &[], 100);
        assert_eq!(bundle.entities.len(), 1);
        assert_eq!(bundle.used_tokens, 40);
    }

    #[test]
    fn test_first_entity_too_large_is_empty() {
        let bundle = assembler(&[("big", 500)]).assemble(&[entity("big")], &[], 100);
        assert!(bundle.is_empty());
        assert_eq!(bundle.used_tokens, 0);
    }

    #[test]
    fn test_relation_overflow_only_stops_that_entity() {
        let ranked = vec![entity("a"), entity("b")];
        let relations = vec![
            Relation::between("a", "owns", "x").with_id("big"),
            Relation::between("a", "owns", "y").with_id("small-a"),
            Relation::between("b", "owns", "z").with_id("small-b"),
        ];
        // Relations render as "a [owns] x", so the table keys them on the object
        let costs = [("a", 10), ("b", 5), ("x", 25), ("y", 15), ("z", 5)];

        let bundle = assembler(&costs).assemble(&ranked, &relations, 45);

        let entity_ids: Vec<_> = bundle.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(entity_ids, vec!["a", "b"]);
        let relation_ids: Vec<_> = bundle.relations.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(relation_ids, vec!["big", "small-b"]);
        assert_eq!(bundle.used_tokens, 45);
    }

    #[test]
    fn test_shared_relation_included_once() {
        let ranked = vec![entity("a"), entity("b")];
        let relations = vec![Relation::between("a", "knows", "b").with_id("r1")];
        let bundle = ContextAssembler::default().assemble(&ranked, &relations, 10_000);
        assert_eq!(bundle.relations.len(), 1);
    }

    proptest! {
        #[test]
        fn test_used_tokens_never_exceed_budget(
            costs in proptest::collection::vec(0usize..200, 0..20),
            budget in 0usize..1000,
        ) {
            let names: Vec<String> = (0..costs.len()).map(|i| format!("e{i}")).collect();
            let table: Vec<(&str, usize)> =
                names.iter().map(String::as_str).zip(costs.iter().copied()).collect();
            let ranked: Vec<Entity> = names.iter().map(|n| entity(n)).collect();

            let bundle = assembler(&table).assemble(&ranked, &[], budget);
            prop_assert!(bundle.used_tokens <= budget);

            let included: usize = costs.iter().take(bundle.entities.len()).sum();
            prop_assert_eq!(bundle.used_tokens, included);
        }
    }
}
