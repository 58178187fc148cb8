//! KGR Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions shared by the resolution and
//! retrieval crates:
//! - Knowledge graph models (entities, evidence spans, relations)
//! - Resolution artifacts (clusters, sameAs links)
//! - Query-time types (scored entities, context bundles)
//! - The error taxonomy
//! - Collaborator traits (embedding service, entity store, token estimator)
//! - Configuration management

pub mod config;

pub use config::{
    AppConfig, CacheConfig, ConfigError, EmbeddingConfig, EmbeddingProvider, LoggingConfig,
    RankingConfig, ResolutionConfig, RetrievalConfig,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for KGR operations
#[derive(Error, Debug)]
pub enum KgrError {
    /// Vector index or graph store unavailable or timed out
    #[error("Store unavailable (retryable): {0}")]
    RetryableStore(String),

    /// An entity record missing required fields
    #[error("Malformed record {id}: {reason}")]
    MalformedRecord { id: String, reason: String },

    /// Traversal timed out or failed; recovered by the retriever
    #[error("Traversal degraded: {0}")]
    DegradedTraversal(String),

    /// A record violates a construction invariant and must never reach the store
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KgrError {
    /// Whether the caller may retry the failed operation as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableStore(_))
    }
}

impl From<ConfigError> for KgrError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KgrError>;

// ============================================================================
// Provenance
// ============================================================================

/// Ordinal ranks of the originating systems. Lower is more authoritative.
pub mod source_priority {
    pub const CUSTODIAN: u8 = 1;
    pub const LEGAL_DOCUMENT: u8 = 2;
    pub const CRM: u8 = 3;
    pub const NOTES: u8 = 4;
}

fn check_confidence(confidence: f32, what: &str) -> Result<()> {
    if (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(KgrError::InvalidRecord(format!(
            "{what} confidence {confidence} outside [0, 1]"
        )))
    }
}

/// A provenance unit: an exact substring of a source document
///
/// Immutable once created. Construction (including deserialization) checks
/// `start_char < end_char` and `confidence` in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EvidenceSpanRecord")]
pub struct EvidenceSpan {
    source_document_id: String,
    text: String,
    start_char: usize,
    end_char: usize,
    confidence: f32,
}

#[derive(Deserialize)]
struct EvidenceSpanRecord {
    source_document_id: String,
    text: String,
    start_char: usize,
    end_char: usize,
    confidence: f32,
}

impl TryFrom<EvidenceSpanRecord> for EvidenceSpan {
    type Error = KgrError;

    fn try_from(record: EvidenceSpanRecord) -> Result<Self> {
        Self::new(
            record.source_document_id,
            record.text,
            record.start_char,
            record.end_char,
            record.confidence,
        )
    }
}

impl EvidenceSpan {
    /// Create a new evidence span
    pub fn new(
        source_document_id: impl Into<String>,
        text: impl Into<String>,
        start_char: usize,
        end_char: usize,
        confidence: f32,
    ) -> Result<Self> {
        if start_char >= end_char {
            return Err(KgrError::InvalidRecord(format!(
                "evidence span start {start_char} must precede end {end_char}"
            )));
        }
        check_confidence(confidence, "evidence")?;

        Ok(Self {
            source_document_id: source_document_id.into(),
            text: text.into(),
            start_char,
            end_char,
            confidence,
        })
    }

    pub fn source_document_id(&self) -> &str {
        &self.source_document_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn start_char(&self) -> usize {
        self.start_char
    }

    pub fn end_char(&self) -> usize {
        self.end_char
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

// ============================================================================
// Knowledge Graph Entities
// ============================================================================

/// Opaque entity identifier
pub type EntityId = String;

/// An attribute value: a bare scalar or a scalar backed by evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Evidenced {
        value: serde_json::Value,
        evidence: EvidenceSpan,
    },
    Scalar(serde_json::Value),
}

impl AttributeValue {
    /// The underlying scalar, regardless of evidence backing
    pub fn value(&self) -> &serde_json::Value {
        match self {
            Self::Scalar(value) => value,
            Self::Evidenced { value, .. } => value,
        }
    }

    /// The value as a string slice, if it is a JSON string
    pub fn as_str(&self) -> Option<&str> {
        self.value().as_str()
    }
}

impl From<serde_json::Value> for AttributeValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Scalar(value)
    }
}

/// A resolved or unresolved record in the knowledge graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Opaque identifier
    pub id: EntityId,

    /// Tenant scope
    pub organization_id: String,

    /// Ontology classes; never empty
    pub types: BTreeSet<String>,

    /// Attribute values keyed by name
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,

    /// Document-mode embedding, absent until computed
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,

    /// Rank of the originating system (see [`source_priority`])
    pub source_priority: u8,

    /// Provenance for this record
    #[serde(default)]
    pub evidence_spans: Vec<EvidenceSpan>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Create a new entity with a single type
    pub fn new(
        id: impl Into<EntityId>,
        organization_id: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            types: BTreeSet::from([entity_type.into()]),
            attributes: BTreeMap::new(),
            embedding: None,
            source_priority: source_priority::NOTES,
            evidence_spans: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Add another type
    pub fn with_type(mut self, entity_type: impl Into<String>) -> Self {
        self.types.insert(entity_type.into());
        self
    }

    /// Add a scalar attribute
    pub fn with_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.attributes
            .insert(name.into(), AttributeValue::Scalar(value.into()));
        self
    }

    /// Add an evidence-backed attribute. The span is also recorded on the entity.
    pub fn with_evidenced_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
        evidence: EvidenceSpan,
    ) -> Self {
        self.evidence_spans.push(evidence.clone());
        self.attributes.insert(
            name.into(),
            AttributeValue::Evidenced {
                value: value.into(),
                evidence,
            },
        );
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_source_priority(mut self, priority: u8) -> Self {
        self.source_priority = priority;
        self
    }

    pub fn with_evidence(mut self, span: EvidenceSpan) -> Self {
        self.evidence_spans.push(span);
        self
    }

    pub fn with_timestamps(mut self, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = updated_at;
        self
    }

    /// Attribute value as a string, if present and a JSON string
    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(AttributeValue::as_str)
    }

    /// Check the record-level invariants
    pub fn validate(&self) -> Result<()> {
        let malformed = |reason: &str| KgrError::MalformedRecord {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(malformed("missing id"));
        }
        if self.organization_id.trim().is_empty() {
            return Err(malformed("missing organization_id"));
        }
        if self.types.is_empty() {
            return Err(malformed("entity has no types"));
        }
        if self.types.iter().any(|t| t.trim().is_empty()) {
            return Err(malformed("blank type identifier"));
        }
        if matches!(&self.embedding, Some(v) if v.is_empty()) {
            return Err(malformed("empty embedding vector"));
        }
        Ok(())
    }

    /// Deterministic textual form, used for token estimation and document embedding
    pub fn render_text(&self) -> String {
        let types = self.types.iter().cloned().collect::<Vec<_>>().join(", ");
        let mut text = format!("[{types}] {}", self.id);
        for (name, value) in &self.attributes {
            let rendered = match value.value() {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text.push_str(&format!("; {name}: {rendered}"));
        }
        text
    }
}

// ============================================================================
// Relations
// ============================================================================

/// The object side of a relation: another entity or a literal value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationTarget {
    Entity(EntityId),
    Literal(serde_json::Value),
}

/// Predicate used for resolution provenance links
pub const SAME_AS: &str = "sameAs";

/// A typed edge from a subject entity to an entity or literal
///
/// On the wire a relation carries nullable `object_id` and `literal_value`;
/// exactly one of them must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RelationRecord", into = "RelationRecord")]
pub struct Relation {
    pub id: String,
    pub subject_id: EntityId,
    pub predicate: String,
    pub target: RelationTarget,
    pub evidence: Option<EvidenceSpan>,
    pub grounding_confidence: Option<f32>,
}

#[derive(Serialize, Deserialize)]
struct RelationRecord {
    id: String,
    subject_id: EntityId,
    predicate: String,
    #[serde(default)]
    object_id: Option<EntityId>,
    #[serde(default)]
    literal_value: Option<serde_json::Value>,
    #[serde(default)]
    evidence: Option<EvidenceSpan>,
    #[serde(default)]
    grounding_confidence: Option<f32>,
}

impl TryFrom<RelationRecord> for Relation {
    type Error = KgrError;

    fn try_from(record: RelationRecord) -> Result<Self> {
        let target = match (record.object_id, record.literal_value) {
            (Some(object_id), None) => RelationTarget::Entity(object_id),
            (None, Some(literal)) if !literal.is_null() => RelationTarget::Literal(literal),
            (Some(_), Some(_)) => {
                return Err(KgrError::InvalidRecord(format!(
                    "relation {} has both object_id and literal_value",
                    record.id
                )))
            }
            _ => {
                return Err(KgrError::InvalidRecord(format!(
                    "relation {} has neither object_id nor literal_value",
                    record.id
                )))
            }
        };

        let relation = Self {
            id: record.id,
            subject_id: record.subject_id,
            predicate: record.predicate,
            target,
            evidence: record.evidence,
            grounding_confidence: record.grounding_confidence,
        };
        relation.validate()?;
        Ok(relation)
    }
}

impl From<Relation> for RelationRecord {
    fn from(relation: Relation) -> Self {
        let (object_id, literal_value) = match relation.target {
            RelationTarget::Entity(id) => (Some(id), None),
            RelationTarget::Literal(value) => (None, Some(value)),
        };
        Self {
            id: relation.id,
            subject_id: relation.subject_id,
            predicate: relation.predicate,
            object_id,
            literal_value,
            evidence: relation.evidence,
            grounding_confidence: relation.grounding_confidence,
        }
    }
}

impl Relation {
    /// Create an entity-to-entity relation
    pub fn between(
        subject_id: impl Into<EntityId>,
        predicate: impl Into<String>,
        object_id: impl Into<EntityId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            predicate: predicate.into(),
            target: RelationTarget::Entity(object_id.into()),
            evidence: None,
            grounding_confidence: None,
        }
    }

    /// Create an entity-to-literal relation
    pub fn literal(
        subject_id: impl Into<EntityId>,
        predicate: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            predicate: predicate.into(),
            target: RelationTarget::Literal(value.into()),
            evidence: None,
            grounding_confidence: None,
        }
    }

    /// Provenance link from a canonical entity to a merged member
    ///
    /// The id is derived from both endpoints so re-running a batch yields the
    /// same relation.
    pub fn same_as(canonical_id: &str, member_id: &str, confidence: f32) -> Self {
        let name = format!("{canonical_id}\u{1f}{SAME_AS}\u{1f}{member_id}");
        Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string(),
            subject_id: canonical_id.to_string(),
            predicate: SAME_AS.to_string(),
            target: RelationTarget::Entity(member_id.to_string()),
            evidence: None,
            grounding_confidence: Some(confidence.clamp(0.0, 1.0)),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_evidence(mut self, evidence: EvidenceSpan) -> Self {
        self.evidence = Some(evidence);
        self
    }

    pub fn with_grounding_confidence(mut self, confidence: f32) -> Self {
        self.grounding_confidence = Some(confidence);
        self
    }

    /// The object entity id, if this relation points at an entity
    pub fn object_id(&self) -> Option<&EntityId> {
        match &self.target {
            RelationTarget::Entity(id) => Some(id),
            RelationTarget::Literal(_) => None,
        }
    }

    /// Whether `entity_id` is either endpoint
    pub fn touches(&self, entity_id: &str) -> bool {
        self.subject_id == entity_id || self.object_id().is_some_and(|id| id == entity_id)
    }

    /// The endpoint opposite `entity_id`, if `entity_id` is an endpoint and the
    /// opposite side is an entity
    pub fn other_end(&self, entity_id: &str) -> Option<&EntityId> {
        let object = self.object_id()?;
        if self.subject_id == entity_id {
            Some(object)
        } else if object == entity_id {
            Some(&self.subject_id)
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(KgrError::InvalidRecord("relation without id".to_string()));
        }
        if self.subject_id.trim().is_empty() {
            return Err(KgrError::InvalidRecord(format!(
                "relation {} has no subject",
                self.id
            )));
        }
        if self.predicate.trim().is_empty() {
            return Err(KgrError::InvalidRecord(format!(
                "relation {} has no predicate",
                self.id
            )));
        }
        match &self.target {
            RelationTarget::Entity(id) if id.trim().is_empty() => {
                return Err(KgrError::InvalidRecord(format!(
                    "relation {} has a blank object id",
                    self.id
                )))
            }
            RelationTarget::Literal(serde_json::Value::Null) => {
                return Err(KgrError::InvalidRecord(format!(
                    "relation {} has a null literal",
                    self.id
                )))
            }
            _ => {}
        }
        if let Some(confidence) = self.grounding_confidence {
            check_confidence(confidence, "grounding")?;
        }
        Ok(())
    }

    /// Deterministic textual form, used for token estimation
    pub fn render_text(&self) -> String {
        let object = match &self.target {
            RelationTarget::Entity(id) => id.clone(),
            RelationTarget::Literal(serde_json::Value::String(s)) => format!("\"{s}\""),
            RelationTarget::Literal(other) => other.to_string(),
        };
        format!("{} [{}] {}", self.subject_id, self.predicate, object)
    }
}

// ============================================================================
// Resolution Artifacts
// ============================================================================

/// Provenance link recorded for each non-canonical cluster member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SameAsLink {
    pub from: EntityId,
    pub to: EntityId,
    pub confidence: f32,
}

/// A set of entity records judged to be the same real-world entity
///
/// Transient: produced during a resolution batch and consumed by the merger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub members: BTreeSet<EntityId>,
    pub canonical_id: EntityId,
    pub same_as_links: Vec<SameAsLink>,
}

impl Cluster {
    /// A cluster holding a single entity
    pub fn singleton(id: impl Into<EntityId>) -> Self {
        let id = id.into();
        Self {
            members: BTreeSet::from([id.clone()]),
            canonical_id: id,
            same_as_links: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_singleton(&self) -> bool {
        self.members.len() == 1
    }
}

// ============================================================================
// Retrieval Types
// ============================================================================

/// An entity id paired with a ranking score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntity {
    pub entity_id: EntityId,
    pub score: f32,
}

impl ScoredEntity {
    pub fn new(entity_id: impl Into<EntityId>, score: f32) -> Self {
        Self {
            entity_id: entity_id.into(),
            score,
        }
    }
}

/// Scope and ontology filter for k-NN search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnnFilter {
    /// Mandatory tenant scope
    pub organization_id: String,

    /// Keep entities sharing at least one of these types; empty means any
    #[serde(default)]
    pub types: BTreeSet<String>,
}

impl KnnFilter {
    pub fn new(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            types: BTreeSet::new(),
        }
    }

    pub fn with_type(mut self, entity_type: impl Into<String>) -> Self {
        self.types.insert(entity_type.into());
        self
    }

    /// Whether an entity falls inside this filter
    pub fn matches(&self, entity: &Entity) -> bool {
        entity.organization_id == self.organization_id
            && (self.types.is_empty() || !self.types.is_disjoint(&entity.types))
    }
}

/// Traversal depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Hops {
    One,
    Two,
}

impl TryFrom<u8> for Hops {
    type Error = KgrError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            other => Err(KgrError::Validation(format!(
                "traversal hops must be 1 or 2, got {other}"
            ))),
        }
    }
}

impl From<Hops> for u8 {
    fn from(hops: Hops) -> Self {
        match hops {
            Hops::One => 1,
            Hops::Two => 2,
        }
    }
}

/// A recovered partial failure attached to a context bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Degradation {
    /// Traversal exceeded the query deadline; ranking used k-NN only
    TraversalTimedOut,
    /// Traversal failed; ranking used k-NN only
    TraversalFailed(String),
    /// Relations for the ranked entities could not be fetched
    RelationsUnavailable(String),
}

impl std::fmt::Display for Degradation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TraversalTimedOut => write!(f, "traversal timed out"),
            Self::TraversalFailed(reason) => write!(f, "traversal failed: {reason}"),
            Self::RelationsUnavailable(reason) => write!(f, "relations unavailable: {reason}"),
        }
    }
}

/// Query-time output handed to the agent layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    /// Ranked entities that fit the budget
    pub entities: Vec<Entity>,

    /// Relations of the included entities that fit the budget
    pub relations: Vec<Relation>,

    /// Tokens consumed; never above `token_budget`
    pub used_tokens: usize,

    /// Budget the bundle was assembled against
    pub token_budget: usize,

    /// Partial failures recovered while building this bundle
    #[serde(default)]
    pub degradations: Vec<Degradation>,
}

impl ContextBundle {
    /// An empty bundle for the given budget
    pub fn empty(token_budget: usize) -> Self {
        Self {
            token_budget,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Embedding mode; query and document embeddings may differ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedMode {
    Query,
    Document,
}

/// Trait for embedding services
#[async_trait::async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Embed a text in the given mode
    async fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>>;

    /// Embedding dimension
    fn dimension(&self) -> usize;

    /// Service name for logging
    fn name(&self) -> &str;
}

/// Trait for the entity/relation store
///
/// Every read is scoped by organization.
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    /// Nearest entities to `vector`, descending by similarity, at most `k`
    async fn knn(&self, vector: &[f32], k: usize, filter: &KnnFilter) -> Result<Vec<ScoredEntity>>;

    /// Entities by id, in the order requested; unknown ids are skipped
    async fn get_entities(&self, organization_id: &str, ids: &[EntityId]) -> Result<Vec<Entity>>;

    /// Relations touching any of `ids`, in their natural order
    async fn get_relations(&self, organization_id: &str, ids: &[EntityId])
        -> Result<Vec<Relation>>;

    /// Insert or replace an entity
    async fn put_entity(&self, entity: Entity) -> Result<()>;

    /// Insert or replace a relation
    async fn put_relation(&self, relation: Relation) -> Result<()>;

    /// Store name for logging
    fn name(&self) -> &str;
}

/// Estimates the token cost of a text. Must be pure.
pub trait TokenEstimator: Send + Sync {
    fn estimate_tokens(&self, text: &str) -> usize;
}

// ============================================================================
// Tests
// ============================================================================
