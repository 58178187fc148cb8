//! Reciprocal Rank Fusion
//!
//! Combines several ranked lists of entity ids into one ordering:
//!
//! ```text
//! score(e) = sum_i  w_i / (k_rrf + rank_i(e) + 1)
//! ```
//!
//! with 0-indexed ranks, summed over the lists that contain `e`.

use std::collections::{HashMap, HashSet};

use kgr_core::{EntityId, RankingConfig, ScoredEntity};

/// One source ranking and its weight
#[derive(Debug, Clone, PartialEq)]
pub struct RankedList {
    pub ids: Vec<EntityId>,
    pub weight: f32,
}

impl RankedList {
    pub fn new(ids: Vec<EntityId>, weight: f32) -> Self {
        Self { ids, weight }
    }

    /// Ranked ids from scored k-NN hits, keeping their order
    pub fn from_scored(hits: &[ScoredEntity], weight: f32) -> Self {
        Self::new(hits.iter().map(|h| h.entity_id.clone()).collect(), weight)
    }
}

/// Fuse ranked lists
///
/// A repeated id within one list counts only at its first position. Output
/// is ordered by descending score, ties by ascending id.
pub fn reciprocal_rank_fusion(lists: &[RankedList], k_rrf: f32) -> Vec<ScoredEntity> {
    let mut scores: HashMap<&str, f32> = HashMap::new();

    for list in lists {
        let mut seen: HashSet<&str> = HashSet::with_capacity(list.ids.len());
        let mut rank = 0usize;
        for id in &list.ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            let contribution = list.weight / (k_rrf + rank as f32 + 1.0);
            *scores.entry(id.as_str()).or_insert(0.0) += contribution;
            rank += 1;
        }
    }

    let mut fused: Vec<ScoredEntity> = scores
        .into_iter()
        .map(|(id, score)| ScoredEntity::new(id, score))
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    fused
}

/// RRF with the configured constant and weights for k-NN and traversal lists
#[derive(Debug, Clone)]
pub struct RankFuser {
    config: RankingConfig,
}

impl RankFuser {
    pub fn new(config: RankingConfig) -> Self {
        Self { config }
    }

    pub fn fuse(&self, knn: &[ScoredEntity], traversal: &[EntityId]) -> Vec<ScoredEntity> {
        let lists = [
            RankedList::from_scored(knn, self.config.knn_weight),
            RankedList::new(traversal.to_vec(), self.config.traversal_weight),
        ];
        reciprocal_rank_fusion(&lists, self.config.rrf_k)
    }
}

impl Default for RankFuser {
    fn default() -> Self {
        Self::new(RankingConfig::default())
    }
}
