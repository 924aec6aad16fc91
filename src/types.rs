//! Core data types for the Hypnos memory system
//!
//! Memories carry two independent axes: *content depth* (five optional text
//! layers, summary through complete) and *temporal layer* (working, short,
//! long, archive), which governs expected lifespan and review eligibility.
//! The remaining types describe the relationship graph, the think queue and
//! the consolidation audit trail.

use crate::error::HypnosError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Number of content layers a memory can carry
pub const LAYER_COUNT: usize = 5;

/// Number of layers that carry an embedding vector
pub const EMBEDDED_LAYERS: usize = 2;

/// Generates `as_str`, `Display` and `FromStr` for enums persisted as text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Canonical storage representation
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            /// Every variant, in declaration order
            pub fn all() -> &'static [$name] {
                &[$($name::$variant,)+]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = HypnosError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(HypnosError::Other(format!(
                        concat!("Unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

/// Unique identifier for memories
///
/// Wraps a UUID to provide type safety and prevent mixing memory IDs
/// with task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Create a new random memory ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a memory ID from a string
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for think tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Temporal classification: how long a memory is expected to live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalLayer {
    /// Scratch observations, hours of ttl
    Working,
    /// Ongoing context, days of ttl
    Short,
    /// Durable knowledge, no ttl
    Long,
    /// Historical record, out of the review cycle
    Archive,
}

text_enum!(TemporalLayer {
    Working => "working",
    Short => "short",
    Long => "long",
    Archive => "archive",
});

/// Lifecycle status of a memory record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Active,
    Expired,
    PendingReview,
    Archived,
    Deleted,
}

text_enum!(MemoryStatus {
    Active => "active",
    Expired => "expired",
    PendingReview => "pending_review",
    Archived => "archived",
    Deleted => "deleted",
});

impl MemoryStatus {
    /// Deleted records never leave their state
    pub fn is_terminal(&self) -> bool {
        matches!(self, MemoryStatus::Deleted)
    }
}

/// Knowledge domain a memory belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// The agent's own identity and growth (`self`)
    #[serde(rename = "self")]
    Agent,
    User,
    Projects,
    World,
    System,
    General,
}

text_enum!(Domain {
    Agent => "self",
    User => "user",
    Projects => "projects",
    World => "world",
    System => "system",
    General => "general",
});

impl Default for Domain {
    fn default() -> Self {
        Domain::General
    }
}

/// Fate of a reviewed memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Keep for the long term
    Promote,
    /// Give it another short-term window
    Extend,
    /// Keep as a historical record
    Archive,
    /// Delete
    Forget,
}

text_enum!(Decision {
    Promote => "promote",
    Extend => "extend",
    Archive => "archive",
    Forget => "forget",
});

/// Typed relationship between two memories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    /// `from` was replaced by the newer version `to`
    SupersededBy,
    /// The belief in `from` evolved into `to`
    EvolvedTo,
    /// `from` originated from `to`
    OriginatedFrom,
    Contradicts,
    Reinforces,
    InspiredBy,
    RelatedTo,
}

text_enum!(RelationshipType {
    SupersededBy => "superseded_by",
    EvolvedTo => "evolved_to",
    OriginatedFrom => "originated_from",
    Contradicts => "contradicts",
    Reinforces => "reinforces",
    InspiredBy => "inspired_by",
    RelatedTo => "related_to",
});

/// Edge direction relative to a query root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Follow edges from -> to
    Forward,
    /// Follow edges to -> from
    Backward,
    /// Follow edges either way
    Both,
}

text_enum!(Direction {
    Forward => "forward",
    Backward => "backward",
    Both => "both",
});

/// Think task priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

text_enum!(Priority {
    Low => "low",
    Medium => "medium",
    High => "high",
    Urgent => "urgent",
});

impl Priority {
    /// Scheduling rank, higher runs first
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Urgent => 4,
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Think task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Complete,
    /// Held back by an operator until reset
    Postponed,
}

text_enum!(TaskStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Complete => "complete",
    Postponed => "postponed",
});

/// A single remembered unit
///
/// `layers[0]` is the one-line summary and `layers[4]` the complete record;
/// each layer is independently optional. Only the first two layers carry an
/// embedding, which is produced outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    // === Identity ===
    pub id: MemoryId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // === Content ===
    pub layers: [Option<String>; LAYER_COUNT],
    #[serde(skip)]
    pub embeddings: [Option<Vec<f32>>; EMBEDDED_LAYERS],
    pub tags: Vec<String>,
    pub domain: Domain,
    pub source_type: Option<String>,

    // === Scoring ===
    /// Importance in [0, 1]
    pub importance: f32,
    pub access_count: u32,
    pub last_accessed_at: Option<DateTime<Utc>>,

    // === Lifecycle ===
    pub temporal_layer: TemporalLayer,
    pub status: MemoryStatus,
    pub expires_at: Option<DateTime<Utc>>,
    /// Consolidation passes that produced no valid decision
    pub retry_count: u32,

    // === Lineage ===
    pub version: u32,
    pub is_current: bool,
    pub superseded_by: Option<MemoryId>,
    /// Denormalized hint; the relationship table is authoritative
    pub related_ids: Vec<MemoryId>,
}

impl Memory {
    /// All non-empty layers joined with blank lines
    pub fn content(&self) -> String {
        self.layers
            .iter()
            .flatten()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Most detailed layer available
    pub fn deepest_layer(&self) -> Option<&str> {
        self.layers.iter().rev().flatten().map(|s| s.as_str()).next()
    }

    /// Short label for logs
    pub fn headline(&self) -> String {
        let text = self.layers.iter().flatten().next().map(|s| s.as_str()).unwrap_or("");
        text.chars().take(60).collect()
    }

    /// Materialize a draft as a fresh version-1 record
    pub fn from_draft(draft: MemoryDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: MemoryId::new(),
            created_at: now,
            updated_at: now,
            layers: draft.layers,
            embeddings: draft.embeddings,
            tags: draft.tags,
            domain: draft.domain,
            source_type: draft.source_type,
            importance: draft.importance.clamp(0.0, 1.0),
            access_count: 0,
            last_accessed_at: None,
            temporal_layer: draft.temporal_layer,
            status: draft.status,
            expires_at: draft.expires_at,
            retry_count: 0,
            version: 1,
            is_current: true,
            superseded_by: None,
            related_ids: Vec::new(),
        }
    }

    /// Whether the ttl has elapsed as of `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == MemoryStatus::Active && self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

/// Input for depositing a new memory (the capture path's output)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDraft {
    pub layers: [Option<String>; LAYER_COUNT],
    pub embeddings: [Option<Vec<f32>>; EMBEDDED_LAYERS],
    pub tags: Vec<String>,
    pub domain: Domain,
    pub temporal_layer: TemporalLayer,
    pub status: MemoryStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub importance: f32,
    pub source_type: Option<String>,
}

impl MemoryDraft {
    /// Build a draft from raw content, deriving the first three layers
    pub fn from_content(content: &str) -> Self {
        Self {
            layers: auto_layer(content),
            embeddings: [None, None],
            tags: Vec::new(),
            domain: Domain::General,
            temporal_layer: TemporalLayer::Working,
            status: MemoryStatus::Active,
            expires_at: None,
            importance: 0.5,
            source_type: None,
        }
    }

    /// Working-layer draft expiring `ttl` from now
    pub fn working(content: &str, ttl: Duration) -> Self {
        Self::from_content(content).with_ttl(TemporalLayer::Working, ttl)
    }

    pub fn with_ttl(mut self, layer: TemporalLayer, ttl: Duration) -> Self {
        self.temporal_layer = layer;
        self.expires_at = Some(Utc::now() + ttl);
        self
    }

    pub fn with_layer(mut self, layer: TemporalLayer) -> Self {
        self.temporal_layer = layer;
        self
    }

    pub fn with_domain(mut self, domain: Domain) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            let tag = tag.into();
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_source(mut self, source_type: impl Into<String>) -> Self {
        self.source_type = Some(source_type.into());
        self
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// Split raw content into summary, context and detail layers
///
/// Layer 1 keeps the first 10 words, layer 2 the first 50, layer 3 the first
/// 2000 characters. Layers 4 and 5 are left for richer capture paths.
pub fn auto_layer(content: &str) -> [Option<String>; LAYER_COUNT] {
    let words: Vec<&str> = content.split_whitespace().collect();
    if words.is_empty() {
        return Default::default();
    }

    let take_words = |n: usize| {
        let mut s = words.iter().take(n).copied().collect::<Vec<_>>().join(" ");
        if words.len() > n {
            s.push_str("...");
        }
        s
    };

    [
        Some(take_words(10)),
        Some(take_words(50)),
        Some(content.chars().take(2000).collect()),
        None,
        None,
    ]
}

/// Directed edge in the relationship graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub from_id: MemoryId,
    pub to_id: MemoryId,
    pub relationship_type: RelationshipType,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Queued topic for the think cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkTask {
    pub id: TaskId,
    pub topic: String,
    pub priority: Priority,
    pub context: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    /// Informational only; does not gate eligibility
    pub due_at: Option<DateTime<Utc>>,
    /// Set when a run claims the task, cleared when it is released
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub insights_memory_id: Option<MemoryId>,
    pub metadata: serde_json::Value,
}

/// A planned lifecycle move for one memory
///
/// Produced by the decision rules and applied by storage with a
/// compare-and-set on the status the caller observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub memory_id: MemoryId,
    pub decision: Decision,
    pub from_layer: TemporalLayer,
    pub to_layer: TemporalLayer,
    pub to_status: MemoryStatus,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Immutable audit record of one applied decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewLogEntry {
    pub memory_id: MemoryId,
    pub decision: Decision,
    pub old_layer: TemporalLayer,
    pub new_layer: TemporalLayer,
    pub reason: String,
    pub reviewer: String,
    pub reviewed_at: DateTime<Utc>,
}
