//! Similarity resolution
//!
//! Pairwise cosine similarity over candidate pairs runs as a parallel map
//! producing an edge list. Clusters are then formed single-threaded with a
//! union-find over that list, so the outcome does not depend on the order in
//! which comparisons finish.

use std::collections::{BTreeMap, BTreeSet};

use kgr_core::{Cluster, Entity, ResolutionConfig, SameAsLink};
use kgr_vector::cosine_similarity;
use petgraph::unionfind::UnionFind;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::fingerprint::CandidatePair;
use crate::merger::select_canonical;

/// A candidate pair whose similarity reached the threshold
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityEdge {
    pub left: usize,
    pub right: usize,
    pub similarity: f32,
}

/// Counters describing one resolution run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverStats {
    /// Entities accepted into the batch
    pub entities: usize,
    /// Pairs produced by blocking
    pub candidate_pairs: usize,
    /// Pairs at or above the threshold
    pub edges: usize,
    /// Clusters formed, singletons included
    pub clusters: usize,
    /// Entities merged into another record
    pub merged_members: usize,
    /// Size of the largest cluster; large values hint at chained merges
    pub largest_cluster: usize,
}

/// Threshold-based single-linkage resolver
#[derive(Debug, Clone)]
pub struct SimilarityResolver {
    threshold: f32,
}

impl SimilarityResolver {
    /// Create a resolver linking pairs with similarity >= `threshold`
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn from_config(config: &ResolutionConfig) -> Self {
        Self::new(config.similarity_threshold)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Score every candidate pair in parallel, keeping those at or above the threshold
    ///
    /// Pairs lacking comparable embeddings produce no edge. Edges come back in
    /// candidate order.
    pub fn score_pairs(&self, entities: &[Entity], pairs: &[CandidatePair]) -> Vec<SimilarityEdge> {
        pairs
            .par_iter()
            .filter_map(|pair| {
                let left = entities.get(pair.left)?.embedding.as_deref()?;
                let right = entities.get(pair.right)?.embedding.as_deref()?;
                let similarity = cosine_similarity(left, right)?;
                (similarity >= self.threshold).then_some(SimilarityEdge {
                    left: pair.left,
                    right: pair.right,
                    similarity,
                })
            })
            .collect()
    }

    /// Form clusters from an edge list
    ///
    /// Connected components of the edge graph; entities with no edge become
    /// singletons. Clusters are sorted by canonical id.
    pub fn cluster(&self, entities: &[Entity], edges: &[SimilarityEdge]) -> Vec<Cluster> {
        let mut sets = UnionFind::<usize>::new(entities.len());
        for edge in edges {
            sets.union(edge.left, edge.right);
        }

        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (index, root) in sets.into_labeling().into_iter().enumerate() {
            components.entry(root).or_default().push(index);
        }

        let mut clusters: Vec<Cluster> = components
            .into_values()
            .filter_map(|indices| {
                let members: Vec<&Entity> = indices.iter().map(|&i| &entities[i]).collect();
                build_cluster(&members)
            })
            .collect();

        clusters.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));
        clusters
    }

    /// Score and cluster in one step
    pub fn resolve(&self, entities: &[Entity], pairs: &[CandidatePair]) -> Vec<Cluster> {
        let edges = self.score_pairs(entities, pairs);
        self.cluster(entities, &edges)
    }
}

impl Default for SimilarityResolver {
    fn default() -> Self {
        Self::from_config(&ResolutionConfig::default())
    }
}

/// Similarity between canonical and member, clamped to [0, 1]; 0 when not comparable
pub(crate) fn link_confidence(canonical: &Entity, member: &Entity) -> f32 {
    match (canonical.embedding.as_deref(), member.embedding.as_deref()) {
        (Some(a), Some(b)) => cosine_similarity(a, b).unwrap_or(0.0).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

fn build_cluster(members: &[&Entity]) -> Option<Cluster> {
    let canonical = select_canonical(members)?;

    let mut others: Vec<&Entity> = members
        .iter()
        .copied()
        .filter(|m| m.id != canonical.id)
        .collect();
    others.sort_by(|a, b| a.id.cmp(&b.id));

    let same_as_links = others
        .into_iter()
        .map(|member| SameAsLink {
            from: canonical.id.clone(),
            to: member.id.clone(),
            confidence: link_confidence(canonical, member),
        })
        .collect();

    Some(Cluster {
        members: members.iter().map(|m| m.id.clone()).collect::<BTreeSet<_>>(),
        canonical_id: canonical.id.clone(),
        same_as_links,
    })
}

// ============================================================================
// Tests
// ============================================================================
