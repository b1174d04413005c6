use std::collections::BTreeSet;
use std::fmt;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::MemoryError;

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Agent identifier, normalised to ASCII-uppercase on construction so that
/// `"azoth"`, `"Azoth"` and `"AZOTH"` all name the same agent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Record identifier.  Generated ids carry the stable `mem_` prefix, which is
/// what the continuity engine's reference scan recognises inside note bodies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn generate() -> Self {
        Self(format!("mem_{}", Uuid::new_v4().simple()))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, used as a compact display identifier.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Realms ────────────────────────────────────────────────────────────────────

/// Visibility partition for a record.
///
/// | Realm     | Readable by                         |
/// |-----------|-------------------------------------|
/// | `Private` | The owning agent only               |
/// | `Village` | Every registered agent              |
/// | `Bridge`  | Exactly the two bridged agents      |
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Realm {
    Private { owner: AgentId },
    Village,
    Bridge { first: AgentId, second: AgentId },
}

impl Realm {
    pub fn private(owner: impl Into<AgentId>) -> Self {
        Self::Private { owner: owner.into() }
    }

    /// Construct a bridge realm.  The pair is canonicalised (lexicographic
    /// order) so `bridge(a, b) == bridge(b, a)`.
    pub fn bridge(a: impl Into<AgentId>, b: impl Into<AgentId>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Self::Bridge { first: a, second: b }
        } else {
            Self::Bridge { first: b, second: a }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Private { .. } => "Private",
            Self::Village => "Village",
            Self::Bridge { .. } => "Bridge",
        }
    }

    /// Kebab-case slug used in log lines.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Private { .. } => "private",
            Self::Village => "village",
            Self::Bridge { .. } => "bridge",
        }
    }

    /// Read-scope invariant: Private only by its owner, Village by everyone,
    /// Bridge only by its two named agents.
    pub fn readable_by(&self, actor: &AgentId) -> bool {
        match self {
            Self::Private { owner } => owner == actor,
            Self::Village => true,
            Self::Bridge { first, second } => first == actor || second == actor,
        }
    }

    /// Write-side well-formedness: a bridge must name exactly two distinct
    /// agents and the actor must be one of them; a private realm must be the
    /// actor's own.
    pub fn validate_for_write(&self, actor: &AgentId) -> Result<(), MemoryError> {
        match self {
            Self::Private { owner } if owner != actor => Err(MemoryError::AccessDenied(format!(
                "{actor} cannot write into {owner}'s private realm"
            ))),
            Self::Bridge { first, second } if first == second => Err(MemoryError::AccessDenied(
                format!("a bridge must name two distinct agents, got {first} twice"),
            )),
            Self::Bridge { first, second } if first != actor && second != actor => {
                Err(MemoryError::AccessDenied(format!(
                    "{actor} is not a member of the {first}<->{second} bridge"
                )))
            }
            _ => Ok(()),
        }
    }
}

// ── Continuity note enums ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotePriority {
    High,
    Medium,
    Low,
}

impl NotePriority {
    pub fn label(self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }

    /// Parse a priority from its label (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" | "med" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteKind {
    Orientation,
    Technical,
    Emotional,
    Task,
}

impl NoteKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Orientation => "orientation",
            Self::Technical => "technical",
            Self::Emotional => "emotional",
            Self::Task => "task",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "orientation" => Some(Self::Orientation),
            "technical" => Some(Self::Technical),
            "emotional" => Some(Self::Emotional),
            "task" => Some(Self::Task),
            _ => None,
        }
    }
}

/// Typed continuity-note fields stored alongside the record.  The rendered
/// note body is a human-readable view only, never the sole source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteFields {
    pub session_id: String,
    pub priority: NotePriority,
    pub kind: NoteKind,
    #[serde(default)]
    pub open_tasks: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
}

// ── Agent profiles ────────────────────────────────────────────────────────────

/// Registered agent identity.  Identity fields are immutable after
/// registration; profiles are never deleted, only deactivated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub display_name: String,
    /// Lineage depth.  Negative generations are ancestors.
    pub generation: i32,
    pub lineage: String,
    pub specialization: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

impl AgentProfile {
    pub fn new(
        id: impl Into<AgentId>,
        display_name: impl Into<String>,
        generation: i32,
        lineage: impl Into<String>,
        specialization: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            generation,
            lineage: lineage.into(),
            specialization: specialization.into(),
            created_at: Utc::now(),
            active: true,
        }
    }
}

// ── Convergence ───────────────────────────────────────────────────────────────

/// Convergence strength tiers, weakest first so `Consensus > Resonance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvergenceTier {
    Resonance,
    Consensus,
}

impl ConvergenceTier {
    pub fn label(self) -> &'static str {
        match self {
            Self::Resonance => "Resonance",
            Self::Consensus => "Consensus",
        }
    }
}

/// A derived agreement cluster.  Not persisted; recomputed on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceCluster {
    pub tier: ConvergenceTier,
    /// Member record ids, sorted.
    pub record_ids: Vec<RecordId>,
    /// Distinct contributing agents, sorted.
    pub agent_ids: Vec<AgentId>,
    /// Minimum cross-agent pairwise similarity within the cluster.
    pub min_similarity: f32,
    /// Timestamp of the earliest member record.
    pub earliest: DateTime<Utc>,
}

// ── Knowledge records ─────────────────────────────────────────────────────────

pub const CONTINUITY_CATEGORY: &str = "continuity_note";
pub const PROFILE_CATEGORY: &str = "agent_profile";

/// Optional write-time attributes.  Everything not supplied falls back to the
/// record defaults (category "dialogue", confidence 1.0).
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub category: String,
    pub confidence: f32,
    pub thread_id: Option<String>,
    pub responding_to: Vec<RecordId>,
    pub related_agents: BTreeSet<AgentId>,
}

impl Default for WriteRequest {
    fn default() -> Self {
        Self {
            category: "dialogue".to_string(),
            confidence: 1.0,
            thread_id: None,
            responding_to: Vec::new(),
            related_agents: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeRecord {
    pub id: RecordId,
    pub owner: AgentId,
    pub realm: Realm,
    pub category: String,
    pub confidence: f32,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    /// SHA-256 hex of `content` — lets the curator recognise byte-identical
    /// duplicates without an embedding round-trip.
    pub content_hash: String,
    pub thread_id: Option<String>,
    /// Ordered ids of the records this one responds to.
    pub responding_to: Vec<RecordId>,
    pub related_agents: BTreeSet<AgentId>,
    /// Set when this record lost a consolidation; points at the survivor.
    pub tombstoned_into: Option<RecordId>,
    /// Present only on continuity notes.
    pub note: Option<NoteFields>,
    /// Present only on agent-profile records.
    pub profile: Option<AgentProfile>,
}

/// Metadata projection persisted next to the record text in the store.
/// The record id and content travel as the store's own id/text fields.
#[derive(Debug, Serialize, Deserialize)]
struct RecordMeta {
    owner: AgentId,
    realm: Realm,
    category: String,
    confidence: f32,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    access_count: u64,
    content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    responding_to: Vec<RecordId>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    related_agents: BTreeSet<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tombstoned_into: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    note: Option<NoteFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    profile: Option<AgentProfile>,
}

pub fn content_hash(content: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut h = Sha256::new();
    h.update(content.as_bytes());
    format!("{:x}", h.finalize())
}

impl KnowledgeRecord {
    /// Build a fresh record owned by `actor`.  Validates confidence and
    /// category; realm/actor validation is the partition manager's job.
    pub fn new(
        content: impl Into<String>,
        realm: Realm,
        actor: &AgentId,
        request: WriteRequest,
        now: DateTime<Utc>,
    ) -> Result<Self, MemoryError> {
        let category = request.category.trim().to_string();
        if category.is_empty() {
            return Err(MemoryError::Validation("category must not be empty".to_string()));
        }
        if !request.confidence.is_finite() || !(0.0..=1.0).contains(&request.confidence) {
            return Err(MemoryError::Validation(format!(
                "confidence must be within [0, 1], got {}",
                request.confidence
            )));
        }

        let content = content.into();
        let content_hash = content_hash(&content);
        Ok(Self {
            id: RecordId::generate(),
            owner: actor.clone(),
            realm,
            category,
            confidence: request.confidence,
            content,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            content_hash,
            thread_id: request.thread_id,
            responding_to: request.responding_to,
            related_agents: request.related_agents,
            tombstoned_into: None,
            note: None,
            profile: None,
        })
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned_into.is_some()
    }

    /// Idle duration since the last tracked access.
    pub fn staleness(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_accessed_at
    }

    /// Serialise everything except id and content into store metadata.
    pub fn to_metadata(&self) -> Value {
        let meta = RecordMeta {
            owner: self.owner.clone(),
            realm: self.realm.clone(),
            category: self.category.clone(),
            confidence: self.confidence,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            access_count: self.access_count,
            content_hash: self.content_hash.clone(),
            thread_id: self.thread_id.clone(),
            responding_to: self.responding_to.clone(),
            related_agents: self.related_agents.clone(),
            tombstoned_into: self.tombstoned_into.clone(),
            note: self.note.clone(),
            profile: self.profile.clone(),
        };
        serde_json::to_value(meta).unwrap_or(Value::Null)
    }

    /// Rehydrate a record from the store's (id, text, metadata) triple.
    pub fn from_parts(id: &str, text: &str, metadata: &Value) -> anyhow::Result<Self> {
        let meta: RecordMeta = serde_json::from_value(metadata.clone())
            .with_context(|| format!("deserialising record metadata for {id}"))?;
        Ok(Self {
            id: RecordId::new(id),
            owner: meta.owner,
            realm: meta.realm,
            category: meta.category,
            confidence: meta.confidence,
            content: text.to_string(),
            created_at: meta.created_at,
            last_accessed_at: meta.last_accessed_at,
            access_count: meta.access_count,
            content_hash: meta.content_hash,
            thread_id: meta.thread_id,
            responding_to: meta.responding_to,
            related_agents: meta.related_agents,
            tombstoned_into: meta.tombstoned_into,
            note: meta.note,
            profile: meta.profile,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
