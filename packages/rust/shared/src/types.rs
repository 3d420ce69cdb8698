//! Core domain types for crawled parent (hackathon) and child (project) records.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RecordId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for internal record identifiers (time-sortable).
///
/// This is the store's own identity; the source's identity lives in
/// `external_id` and never changes meaning across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Generate a new time-sortable record identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// RecordState / RecordKind
// ---------------------------------------------------------------------------

/// Processing state shared by parents and children.
///
/// Transitions are strictly linear: `Discovered -> Detailed -> Processed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    Discovered,
    Detailed,
    Processed,
}

impl RecordState {
    /// All states in lifecycle order.
    pub const ALL: [RecordState; 3] = [Self::Discovered, Self::Detailed, Self::Processed];

    /// The single legal successor, or `None` for the terminal state.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Discovered => Some(Self::Detailed),
            Self::Detailed => Some(Self::Processed),
            Self::Processed => None,
        }
    }

    /// The single legal predecessor, or `None` for the initial state.
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::Discovered => None,
            Self::Detailed => Some(Self::Discovered),
            Self::Processed => Some(Self::Detailed),
        }
    }

    /// Whether `to` is the next linear step from `self`.
    pub fn can_advance_to(self, to: Self) -> bool {
        self.next() == Some(to)
    }

    /// Stable string form used in storage and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "DISCOVERED",
            Self::Detailed => "DETAILED",
            Self::Processed => "PROCESSED",
        }
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "DISCOVERED" => Ok(Self::Discovered),
            "DETAILED" => Ok(Self::Detailed),
            "PROCESSED" => Ok(Self::Processed),
            other => Err(format!("unknown record state: {other}")),
        }
    }
}

/// Which table a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Parent,
    Child,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Child => "child",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "parent" => Ok(Self::Parent),
            "child" => Ok(Self::Child),
            other => Err(format!("unknown record kind: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// Ordered category labels. Order is kept for display but ignored by `==`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Categories(pub Vec<String>);

impl Categories {
    fn sorted(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.0.iter().map(String::as_str).collect();
        labels.sort_unstable();
        labels
    }
}

impl PartialEq for Categories {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.sorted() == other.sorted()
    }
}

impl Eq for Categories {}

impl From<Vec<String>> for Categories {
    fn from(labels: Vec<String>) -> Self {
        Self(labels)
    }
}

// ---------------------------------------------------------------------------
// ParentRecord / ChildRecord
// ---------------------------------------------------------------------------

/// A persisted parent (hackathon).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRecord {
    /// Internal identity, referenced by children.
    pub id: RecordId,
    /// Stable identity issued by the source. Immutable once stored.
    pub external_id: String,
    /// Human-readable secondary identity, unique when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    pub org_id: String,
    pub org_name: String,
    pub org_slug: String,
    pub categories: Categories,
    pub name: String,
    pub description: String,
    pub url: String,
    pub state: RecordState,
    /// Set once a pass has listed every child page of this parent through
    /// exhaustion. Drives targeted vs. full reconciliation.
    #[serde(default)]
    pub children_listed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ParentRecord {
    /// A fresh, empty record in the `Discovered` state.
    pub fn new(external_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            external_id: external_id.into(),
            slug: None,
            org_id: String::new(),
            org_name: String::new(),
            org_slug: String::new(),
            categories: Categories::default(),
            name: String::new(),
            description: String::new(),
            url: String::new(),
            state: RecordState::Discovered,
            children_listed: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A persisted child (project), owned by exactly one parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub id: RecordId,
    /// Globally unique source identity.
    pub external_id: String,
    /// Internal id of the owning [`ParentRecord`].
    pub parent_id: RecordId,
    pub title: String,
    pub description: String,
    pub url: String,
    /// Deduplicated, case-sensitive, sorted.
    pub tags: BTreeSet<String>,
    pub state: RecordState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChildRecord {
    /// A fresh, empty record in the `Discovered` state.
    pub fn new(external_id: impl Into<String>, parent_id: RecordId) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            external_id: external_id.into(),
            parent_id,
            title: String::new(),
            description: String::new(),
            url: String::new(),
            tags: BTreeSet::new(),
            state: RecordState::Discovered,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Whether an upsert inserted a new row or merged into an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

// ---------------------------------------------------------------------------
// Source-side values (raw, unnormalized)
// ---------------------------------------------------------------------------

/// Denormalized organization attributes carried by a parent listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
}

/// One parent as it appears in a listing page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentSummary {
    /// Empty when the source omitted it; the engine rejects such records.
    #[serde(default)]
    pub external_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub org: OrgInfo,
    #[serde(default)]
    pub categories: Vec<String>,
    /// Only eligible (closed/finished) parents are ever stored.
    #[serde(default)]
    pub eligible: bool,
}

/// One child as it appears in a parent's child listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSummary {
    #[serde(default)]
    pub external_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// Overview text fetched for a parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentDetail {
    pub description: String,
    pub url: String,
}

/// Detail page content fetched for a child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildDetail {
    pub title: Option<String>,
    pub description: String,
    pub tags: Vec<String>,
    pub url: Option<String>,
}

// ---------------------------------------------------------------------------
// Failure ledger
// ---------------------------------------------------------------------------

/// A record whose processing exhausted its retry budget in one or more runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: RecordKind,
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RecordId>,
    /// Number of runs in which this record failed.
    pub attempts: u32,
    pub last_error: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_roundtrip() {
        let id = RecordId::new();
        let parsed: RecordId = id.to_string().parse().expect("parse RecordId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn state_machine_is_linear() {
        assert!(RecordState::Discovered.can_advance_to(RecordState::Detailed));
        assert!(RecordState::Detailed.can_advance_to(RecordState::Processed));
        assert!(!RecordState::Discovered.can_advance_to(RecordState::Processed));
        assert!(!RecordState::Detailed.can_advance_to(RecordState::Discovered));
        assert!(!RecordState::Processed.can_advance_to(RecordState::Processed));
        assert_eq!(RecordState::Processed.next(), None);
        assert_eq!(RecordState::Discovered.previous(), None);
        assert_eq!(RecordState::Processed.previous(), Some(RecordState::Detailed));
    }

    #[test]
    fn state_serializes_screaming() {
        let json = serde_json::to_string(&RecordState::Detailed).expect("serialize");
        assert_eq!(json, "\"DETAILED\"");
        let parsed: RecordState = "PROCESSED".parse().expect("parse");
        assert_eq!(parsed, RecordState::Processed);
        assert!("processed".parse::<RecordState>().is_err());
    }

    #[test]
    fn categories_ignore_order_for_equality() {
        let a = Categories(vec!["AI".into(), "Web3".into()]);
        let b = Categories(vec!["Web3".into(), "AI".into()]);
        let c = Categories(vec!["AI".into(), "AI".into()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Display order is preserved.
        assert_eq!(b.0[0], "Web3");
    }

    #[test]
    fn parent_record_serialization() {
        let mut parent = ParentRecord::new("h1");
        parent.slug = Some("eth-lisbon".into());
        parent.categories = Categories(vec!["DeFi".into()]);

        let json = serde_json::to_string(&parent).expect("serialize");
        let parsed: ParentRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, parent);
        assert_eq!(parsed.state, RecordState::Discovered);
    }

    #[test]
    fn summary_tolerates_missing_fields() {
        let summary: ParentSummary = serde_json::from_str(r#"{"name": "No id"}"#).expect("parse");
        assert!(summary.external_id.is_empty());
        assert!(!summary.eligible);
    }
}
