//! Version chain management: create, read, compare, and roll back core logic
//! versions while keeping exactly one active version per domain.
//!
//! History is append-only. A rollback never reactivates an old row; it
//! copies the target's content into a brand new version whose parent is the
//! version it replaces.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use corelogic_shared::{
    ChangeCounts, ChangelogEntry, CoreLogicContent, CoreLogicError, CoreLogicVersion, Result,
    new_id,
};
use corelogic_storage::Store;

use crate::diff::{VersionDiff, diff_versions};

/// Why a version is being created.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionOrigin {
    /// Fresh output from the distiller over `knowledge_items` items.
    Distilled {
        summary: Option<String>,
        knowledge_items: usize,
    },
    /// Content copied from an earlier version.
    Rollback {
        to_version: u32,
        reason: Option<String>,
    },
}

/// Creates and reads versions through a [`Store`].
#[derive(Clone)]
pub struct VersionChainManager {
    store: Arc<dyn Store>,
}

impl VersionChainManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Append a new active version for `domain_id`, superseding the current one.
    #[instrument(skip_all, fields(domain_id = %domain_id))]
    pub async fn create_version(
        &self,
        domain_id: &str,
        content: CoreLogicContent,
        origin: VersionOrigin,
    ) -> Result<CoreLogicVersion> {
        if self.store.get_domain(domain_id).await?.is_none() {
            return Err(CoreLogicError::not_found("domain", domain_id));
        }

        let parent = self.store.get_active_version(domain_id).await?;
        let next_version = parent.as_ref().map_or(0, |p| p.version) + 1;
        let now = Utc::now();

        let entry = changelog_entry(&origin, parent.as_ref(), &content, next_version, now);
        let mut changelog = vec![entry];
        if let Some(p) = &parent {
            changelog.extend(p.changelog.iter().cloned());
        }

        let change_summary = match &origin {
            VersionOrigin::Distilled {
                summary,
                knowledge_items,
            } => Some(match summary {
                Some(summary) => summary.clone(),
                None => format!("Distilled from {knowledge_items} knowledge items"),
            }),
            VersionOrigin::Rollback { to_version, reason } => Some(match reason {
                Some(reason) => format!("Rolled back to version {to_version}: {reason}"),
                None => format!("Rolled back to version {to_version}"),
            }),
        };

        let version = CoreLogicVersion {
            id: new_id(),
            domain_id: domain_id.to_string(),
            version: next_version,
            parent_version_id: parent.as_ref().map(|p| p.id.clone()),
            content_hash: content.content_hash(),
            content,
            changelog,
            change_summary,
            is_active: true,
            created_at: now,
        };

        self.store
            .insert_version(&version, parent.as_ref().map(|p| p.id.as_str()))
            .await?;

        info!(
            version = version.version,
            version_id = %version.id,
            parent = ?version.parent_version_id,
            kind = version.changelog[0].kind(),
            "committed core logic version"
        );
        Ok(version)
    }

    /// The numbered version, or the active one when `version` is `None`.
    pub async fn get_version(
        &self,
        domain_id: &str,
        version: Option<u32>,
    ) -> Result<CoreLogicVersion> {
        match version {
            Some(number) => self
                .store
                .get_version(domain_id, number)
                .await?
                .ok_or_else(|| CoreLogicError::not_found("version", format!("{domain_id}@{number}"))),
            None => self
                .store
                .get_active_version(domain_id)
                .await?
                .ok_or_else(|| {
                    CoreLogicError::not_found("active version", domain_id.to_string())
                }),
        }
    }

    /// Full history, newest version first.
    pub async fn list_versions(&self, domain_id: &str) -> Result<Vec<CoreLogicVersion>> {
        if self.store.get_domain(domain_id).await?.is_none() {
            return Err(CoreLogicError::not_found("domain", domain_id));
        }
        self.store.list_versions(domain_id).await
    }

    /// Structural diff from version `from_id` to version `to_id`.
    pub async fn compare(&self, from_id: &str, to_id: &str) -> Result<VersionDiff> {
        let from = self.version_by_id(from_id).await?;
        let to = self.version_by_id(to_id).await?;
        if from.domain_id != to.domain_id {
            return Err(CoreLogicError::validation(format!(
                "versions {from_id} and {to_id} belong to different domains"
            )));
        }
        Ok(diff_versions(&from, &to))
    }

    /// Create a new version carrying `target_version`'s content.
    #[instrument(skip_all, fields(domain_id = %domain_id, target_version))]
    pub async fn rollback(
        &self,
        domain_id: &str,
        target_version: u32,
        reason: Option<&str>,
    ) -> Result<CoreLogicVersion> {
        if target_version == 0 {
            return Err(CoreLogicError::validation(
                "rollback requires a target version (versions start at 1)",
            ));
        }

        let target = self.get_version(domain_id, Some(target_version)).await?;
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(String::from);

        self.create_version(
            domain_id,
            target.content,
            VersionOrigin::Rollback {
                to_version: target_version,
                reason,
            },
        )
        .await
    }

    async fn version_by_id(&self, version_id: &str) -> Result<CoreLogicVersion> {
        self.store
            .get_version_by_id(version_id)
            .await?
            .ok_or_else(|| CoreLogicError::not_found("version", version_id))
    }
}

/// The newest changelog record for a version about to be written.
fn changelog_entry(
    origin: &VersionOrigin,
    parent: Option<&CoreLogicVersion>,
    content: &CoreLogicContent,
    version: u32,
    timestamp: DateTime<Utc>,
) -> ChangelogEntry {
    match (origin, parent) {
        (VersionOrigin::Rollback { to_version, reason }, _) => ChangelogEntry::Rollback {
            version,
            timestamp,
            from_version: parent.map_or(0, |p| p.version),
            to_version: *to_version,
            reason: reason.clone(),
        },
        (VersionOrigin::Distilled { .. }, Some(parent)) => ChangelogEntry::Update {
            version,
            timestamp,
            changes: ChangeCounts::between(&parent.content, content),
        },
        (VersionOrigin::Distilled { .. }, None) => ChangelogEntry::Initial {
            version,
            timestamp,
            summary: "Initial core logic distillation".into(),
        },
    }
}
