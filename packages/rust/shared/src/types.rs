//! Core domain types: domains, knowledge items, core logic versions, and
//! distillation jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::CoreLogicError;

/// Generate a new time-sortable identifier (UUID v7).
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Render a timestamp in the fixed-width form used for storage and ordering.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored RFC 3339 timestamp.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, CoreLogicError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreLogicError::parse(format!("invalid timestamp '{s}': {e}")))
}

// ---------------------------------------------------------------------------
// Domain & knowledge (read-only inputs)
// ---------------------------------------------------------------------------

/// A named knowledge scope whose items are distilled together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,
    pub owner: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A single note or document contributing to a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: String,
    pub domain_id: String,
    pub owner: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Core logic content
// ---------------------------------------------------------------------------

/// The five categories of a distilled artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentCategory {
    FirstPrinciples,
    MentalModels,
    DecisionRules,
    AntiPatterns,
    CrossDomainLinks,
}

impl ContentCategory {
    /// Every category, in artifact order.
    pub const ALL: [ContentCategory; 5] = [
        Self::FirstPrinciples,
        Self::MentalModels,
        Self::DecisionRules,
        Self::AntiPatterns,
        Self::CrossDomainLinks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstPrinciples => "first_principles",
            Self::MentalModels => "mental_models",
            Self::DecisionRules => "decision_rules",
            Self::AntiPatterns => "anti_patterns",
            Self::CrossDomainLinks => "cross_domain_links",
        }
    }
}

/// The structured distilled artifact for a domain.
///
/// Entries are opaque JSON objects; only their counts and equality matter
/// to the version chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreLogicContent {
    #[serde(default)]
    pub first_principles: Vec<Value>,
    #[serde(default)]
    pub mental_models: Vec<Value>,
    #[serde(default)]
    pub decision_rules: Vec<Value>,
    #[serde(default)]
    pub anti_patterns: Vec<Value>,
    #[serde(default)]
    pub cross_domain_links: Vec<Value>,
}

impl CoreLogicContent {
    /// Entries for one category.
    pub fn category(&self, category: ContentCategory) -> &[Value] {
        match category {
            ContentCategory::FirstPrinciples => &self.first_principles,
            ContentCategory::MentalModels => &self.mental_models,
            ContentCategory::DecisionRules => &self.decision_rules,
            ContentCategory::AntiPatterns => &self.anti_patterns,
            ContentCategory::CrossDomainLinks => &self.cross_domain_links,
        }
    }

    /// SHA-256 of the canonical JSON form.
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Changelog
// ---------------------------------------------------------------------------

/// Count delta for one category between a version and its parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDelta {
    /// New length minus parent length (negative when entries were dropped).
    pub added: i64,
}

/// Per-category deltas recorded on an `update` changelog entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub first_principles: CategoryDelta,
    pub mental_models: CategoryDelta,
    pub decision_rules: CategoryDelta,
    pub anti_patterns: CategoryDelta,
}

impl ChangeCounts {
    /// Deltas of `new` relative to `parent` for the four counted categories.
    pub fn between(parent: &CoreLogicContent, new: &CoreLogicContent) -> Self {
        let delta = |category| CategoryDelta {
            added: new.category(category).len() as i64 - parent.category(category).len() as i64,
        };
        Self {
            first_principles: delta(ContentCategory::FirstPrinciples),
            mental_models: delta(ContentCategory::MentalModels),
            decision_rules: delta(ContentCategory::DecisionRules),
            anti_patterns: delta(ContentCategory::AntiPatterns),
        }
    }
}

/// One record in a version's changelog (newest first on the version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangelogEntry {
    Initial {
        version: u32,
        timestamp: DateTime<Utc>,
        summary: String,
    },
    Update {
        version: u32,
        timestamp: DateTime<Utc>,
        changes: ChangeCounts,
    },
    #[serde(rename_all = "camelCase")]
    Rollback {
        version: u32,
        timestamp: DateTime<Utc>,
        from_version: u32,
        to_version: u32,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ChangelogEntry {
    /// The version this entry was recorded for.
    pub fn version(&self) -> u32 {
        match self {
            Self::Initial { version, .. }
            | Self::Update { version, .. }
            | Self::Rollback { version, .. } => *version,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initial { .. } => "initial",
            Self::Update { .. } => "update",
            Self::Rollback { .. } => "rollback",
        }
    }
}

// ---------------------------------------------------------------------------
// CoreLogicVersion
// ---------------------------------------------------------------------------

/// An immutable, append-only snapshot of a domain's core logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreLogicVersion {
    pub id: String,
    pub domain_id: String,
    /// Strictly increasing per domain, starting at 1.
    pub version: u32,
    /// The version this one superseded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_version_id: Option<String>,
    pub content: CoreLogicContent,
    pub changelog: Vec<ChangelogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_summary: Option<String>,
    pub content_hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Distillation jobs
// ---------------------------------------------------------------------------

/// Lifecycle status of a distillation job.
///
/// `pending -> running -> {completed | failed}`; terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreLogicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(CoreLogicError::parse(format!("unknown job status '{other}'"))),
        }
    }
}

/// What caused a job to be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Scheduled,
    Manual,
    Api,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::Api => "api",
        }
    }
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggeredBy {
    type Err = CoreLogicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            "api" => Ok(Self::Api),
            other => Err(CoreLogicError::parse(format!("unknown trigger '{other}'"))),
        }
    }
}

/// Small summary recorded on a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResultSummary {
    pub version: u32,
    pub version_id: String,
    pub knowledge_items_processed: usize,
    pub tokens_used: u64,
}

/// A queued unit of work representing one distillation run for a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillationJob {
    pub id: String,
    pub domain_id: String,
    pub owner: String,
    pub status: JobStatus,
    /// Higher values are claimed first.
    pub priority: i32,
    pub triggered_by: TriggeredBy,
    /// Opaque distillation options.
    #[serde(default)]
    pub config: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResultSummary>,
}

impl DistillationJob {
    /// A fresh pending job.
    pub fn pending(
        domain_id: impl Into<String>,
        owner: impl Into<String>,
        priority: i32,
        triggered_by: TriggeredBy,
        config: Value,
    ) -> Self {
        Self {
            id: new_id(),
            domain_id: domain_id.into(),
            owner: owner.into(),
            status: JobStatus::Pending,
            priority,
            triggered_by,
            config,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        }
    }
}
