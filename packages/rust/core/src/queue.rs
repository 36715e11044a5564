//! Durable distillation job queue.
//!
//! Jobs move `pending -> running -> completed | failed`. The store performs
//! each transition atomically; this layer validates inputs and logs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use corelogic_shared::{
    CoreLogicError, DistillationJob, JobResultSummary, Result, TriggeredBy, format_timestamp,
};
use corelogic_storage::Store;

const UNKNOWN_FAILURE: &str = "job failed without an error message";

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn Store>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Insert a pending job for `domain_id`.
    ///
    /// `config` must be a JSON object or `null`; it is stored untouched and
    /// handed to the distiller as per-job options.
    pub async fn enqueue(
        &self,
        domain_id: &str,
        priority: i32,
        triggered_by: TriggeredBy,
        config: Value,
    ) -> Result<DistillationJob> {
        if !(config.is_object() || config.is_null()) {
            return Err(CoreLogicError::validation(
                "job config must be a JSON object",
            ));
        }
        let domain = self
            .store
            .get_domain(domain_id)
            .await?
            .ok_or_else(|| CoreLogicError::not_found("domain", domain_id))?;

        let job = DistillationJob::pending(&domain.id, &domain.owner, priority, triggered_by, config);
        self.store.insert_job(&job).await?;
        info!(
            job_id = %job.id,
            domain_id = %job.domain_id,
            priority,
            triggered_by = %triggered_by,
            "enqueued distillation job"
        );
        Ok(job)
    }

    /// Atomically claim the next runnable job, if any.
    pub async fn claim_next(&self) -> Result<Option<DistillationJob>> {
        let job = self.store.claim_next_pending_job().await?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, domain_id = %job.domain_id, "claimed job");
        }
        Ok(job)
    }

    pub async fn mark_complete(&self, job_id: &str, summary: &JobResultSummary) -> Result<()> {
        self.store.mark_job_complete(job_id, summary).await?;
        info!(job_id, version = summary.version, "job completed");
        Ok(())
    }

    /// Record a failure. Blank messages are replaced so failed jobs always
    /// carry some error text.
    pub async fn mark_failed(&self, job_id: &str, error: &str) -> Result<()> {
        let error = match error.trim() {
            "" => UNKNOWN_FAILURE,
            _ => error,
        };
        self.store.mark_job_failed(job_id, error).await?;
        warn!(job_id, error, "job failed");
        Ok(())
    }

    /// Fail jobs that have been `running` since before `cutoff`, releasing
    /// their domains for new claims.
    pub async fn fail_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let message = format!(
            "job abandoned: still running after being started before {}",
            format_timestamp(&cutoff)
        );
        let failed = self.store.fail_stale_jobs(cutoff, &message).await?;
        for job_id in &failed {
            warn!(job_id = %job_id, "failed abandoned job");
        }
        Ok(failed)
    }

    pub async fn get(&self, job_id: &str) -> Result<DistillationJob> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoreLogicError::not_found("job", job_id))
    }

    /// Jobs newest first, optionally for one domain.
    pub async fn list(&self, domain_id: Option<&str>) -> Result<Vec<DistillationJob>> {
        self.store.list_jobs(domain_id).await
    }
}
