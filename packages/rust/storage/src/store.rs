//! The [`Store`] trait: every storage primitive the engine relies on.
//!
//! Implementations must make two operations indivisible:
//! - [`Store::claim_next_pending_job`] moves exactly one job from `pending`
//!   to `running`, even with several worker processes claiming at once.
//! - [`Store::insert_version`] inserts the new active version and deactivates
//!   the one it supersedes in a single step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corelogic_shared::{
    CoreLogicVersion, DistillationJob, Domain, JobResultSummary, KnowledgeItem, Result,
};

/// Durable storage for domains, knowledge, versions, and jobs.
#[async_trait]
pub trait Store: Send + Sync {
    // --- domains & knowledge (read-only to the engine) ---

    async fn get_domain(&self, domain_id: &str) -> Result<Option<Domain>>;

    async fn list_domains(&self) -> Result<Vec<Domain>>;

    async fn count_knowledge_items(&self, domain_id: &str) -> Result<usize>;

    /// Knowledge items for a domain, newest first.
    async fn list_knowledge_items(&self, domain_id: &str) -> Result<Vec<KnowledgeItem>>;

    // --- versions ---

    async fn get_active_version(&self, domain_id: &str) -> Result<Option<CoreLogicVersion>>;

    async fn get_version(&self, domain_id: &str, version: u32)
    -> Result<Option<CoreLogicVersion>>;

    async fn get_version_by_id(&self, version_id: &str) -> Result<Option<CoreLogicVersion>>;

    /// Full history, version descending.
    async fn list_versions(&self, domain_id: &str) -> Result<Vec<CoreLogicVersion>>;

    /// Insert `version` as the domain's active version and deactivate
    /// `supersedes` atomically.
    ///
    /// Fails with `Conflict` and writes nothing if `supersedes` is no longer
    /// the active version, if `supersedes` is `None` while another version is
    /// active, or if the version number is already taken.
    async fn insert_version(
        &self,
        version: &CoreLogicVersion,
        supersedes: Option<&str>,
    ) -> Result<()>;

    /// Creation time of the active version, if any.
    async fn get_last_distill_time(&self, domain_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get_active_version(domain_id)
            .await?
            .map(|v| v.created_at))
    }

    // --- jobs ---

    async fn insert_job(&self, job: &DistillationJob) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<DistillationJob>>;

    /// Jobs newest first, optionally restricted to one domain.
    async fn list_jobs(&self, domain_id: Option<&str>) -> Result<Vec<DistillationJob>>;

    /// Whether the domain has a job that is pending or running.
    async fn has_open_job(&self, domain_id: &str) -> Result<bool>;

    /// Atomically move the next pending job to `running` and return it.
    ///
    /// Order is `priority DESC, created_at ASC`. Domains with a job already
    /// running are skipped.
    async fn claim_next_pending_job(&self) -> Result<Option<DistillationJob>>;

    /// `running -> completed`. Any other source status is `InvalidTransition`.
    async fn mark_job_complete(&self, job_id: &str, summary: &JobResultSummary) -> Result<()>;

    /// `running -> failed`. Any other source status is `InvalidTransition`.
    async fn mark_job_failed(&self, job_id: &str, error: &str) -> Result<()>;

    /// Fail every `running` job whose `started_at` is before `cutoff`,
    /// recording `error`. Returns the IDs of the jobs that were failed.
    async fn fail_stale_jobs(&self, cutoff: DateTime<Utc>, error: &str) -> Result<Vec<String>>;
}
