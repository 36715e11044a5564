//! In-memory [`Store`] for tests and dry runs.
//!
//! Every operation runs under one mutex, which gives the claim and the
//! version swap the same all-or-nothing behavior the libSQL backend gets
//! from SQL.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corelogic_shared::{
    CoreLogicError, CoreLogicVersion, DistillationJob, Domain, JobResultSummary, JobStatus,
    KnowledgeItem, Result,
};

use crate::store::Store;

#[derive(Debug, Default)]
struct State {
    domains: Vec<Domain>,
    knowledge: Vec<KnowledgeItem>,
    versions: Vec<CoreLogicVersion>,
    /// Insertion order doubles as the claim tie-breaker.
    jobs: Vec<DistillationJob>,
    failing_domains: HashMap<String, String>,
}

/// In-memory store backed by plain vectors.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| CoreLogicError::Storage("memory store lock poisoned".into()))
    }

    /// Register a domain.
    pub fn add_domain(&self, domain: Domain) -> Result<()> {
        self.state()?.domains.push(domain);
        Ok(())
    }

    /// Register a knowledge item.
    pub fn add_knowledge_item(&self, item: KnowledgeItem) -> Result<()> {
        self.state()?.knowledge.push(item);
        Ok(())
    }

    /// Make knowledge lookups for `domain_id` fail with `message`.
    pub fn fail_domain(&self, domain_id: &str, message: &str) -> Result<()> {
        self.state()?
            .failing_domains
            .insert(domain_id.to_string(), message.to_string());
        Ok(())
    }

    fn check_domain(state: &State, domain_id: &str) -> Result<()> {
        match state.failing_domains.get(domain_id) {
            Some(message) => Err(CoreLogicError::Storage(message.clone())),
            None => Ok(()),
        }
    }

    fn transition(
        &self,
        job_id: &str,
        next: JobStatus,
        apply: impl FnOnce(&mut DistillationJob),
    ) -> Result<()> {
        let mut state = self.state()?;
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| CoreLogicError::not_found("job", job_id))?;
        if !job.status.can_transition_to(next) {
            return Err(CoreLogicError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status.to_string(),
                to: next.to_string(),
            });
        }
        job.status = next;
        job.completed_at = Some(Utc::now());
        apply(job);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_domain(&self, domain_id: &str) -> Result<Option<Domain>> {
        let state = self.state()?;
        Ok(state.domains.iter().find(|d| d.id == domain_id).cloned())
    }

    async fn list_domains(&self) -> Result<Vec<Domain>> {
        Ok(self.state()?.domains.clone())
    }

    async fn count_knowledge_items(&self, domain_id: &str) -> Result<usize> {
        let state = self.state()?;
        Self::check_domain(&state, domain_id)?;
        Ok(state
            .knowledge
            .iter()
            .filter(|k| k.domain_id == domain_id)
            .count())
    }

    async fn list_knowledge_items(&self, domain_id: &str) -> Result<Vec<KnowledgeItem>> {
        let state = self.state()?;
        Self::check_domain(&state, domain_id)?;
        let mut items: Vec<KnowledgeItem> = state
            .knowledge
            .iter()
            .filter(|k| k.domain_id == domain_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    async fn get_active_version(&self, domain_id: &str) -> Result<Option<CoreLogicVersion>> {
        let state = self.state()?;
        Ok(state
            .versions
            .iter()
            .find(|v| v.domain_id == domain_id && v.is_active)
            .cloned())
    }

    async fn get_version(
        &self,
        domain_id: &str,
        version: u32,
    ) -> Result<Option<CoreLogicVersion>> {
        let state = self.state()?;
        Ok(state
            .versions
            .iter()
            .find(|v| v.domain_id == domain_id && v.version == version)
            .cloned())
    }

    async fn get_version_by_id(&self, version_id: &str) -> Result<Option<CoreLogicVersion>> {
        let state = self.state()?;
        Ok(state.versions.iter().find(|v| v.id == version_id).cloned())
    }

    async fn list_versions(&self, domain_id: &str) -> Result<Vec<CoreLogicVersion>> {
        let state = self.state()?;
        let mut versions: Vec<CoreLogicVersion> = state
            .versions
            .iter()
            .filter(|v| v.domain_id == domain_id)
            .cloned()
            .collect();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    async fn insert_version(
        &self,
        version: &CoreLogicVersion,
        supersedes: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state()?;

        let active_id = state
            .versions
            .iter()
            .find(|v| v.domain_id == version.domain_id && v.is_active)
            .map(|v| v.id.clone());
        if active_id.as_deref() != supersedes {
            return Err(CoreLogicError::Conflict(format!(
                "active version for domain {} changed during commit",
                version.domain_id
            )));
        }
        if state
            .versions
            .iter()
            .any(|v| v.domain_id == version.domain_id && v.version == version.version)
        {
            return Err(CoreLogicError::Conflict(format!(
                "version {} already exists for domain {}",
                version.version, version.domain_id
            )));
        }

        if let Some(previous) = supersedes {
            if let Some(v) = state.versions.iter_mut().find(|v| v.id == previous) {
                v.is_active = false;
            }
        }
        state.versions.push(version.clone());
        Ok(())
    }

    async fn insert_job(&self, job: &DistillationJob) -> Result<()> {
        self.state()?.jobs.push(job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<DistillationJob>> {
        let state = self.state()?;
        Ok(state.jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn list_jobs(&self, domain_id: Option<&str>) -> Result<Vec<DistillationJob>> {
        let state = self.state()?;
        let mut jobs: Vec<DistillationJob> = state
            .jobs
            .iter()
            .filter(|j| domain_id.is_none_or(|d| j.domain_id == d))
            .cloned()
            .collect();
        jobs.reverse();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn has_open_job(&self, domain_id: &str) -> Result<bool> {
        let state = self.state()?;
        Ok(state
            .jobs
            .iter()
            .any(|j| j.domain_id == domain_id && !j.status.is_terminal()))
    }

    async fn claim_next_pending_job(&self) -> Result<Option<DistillationJob>> {
        let mut state = self.state()?;

        let busy: Vec<String> = state
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| j.domain_id.clone())
            .collect();

        let next = state
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.status == JobStatus::Pending && !busy.contains(&j.domain_id))
            .min_by(|(ia, a), (ib, b)| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(ia.cmp(ib))
            })
            .map(|(idx, _)| idx);

        Ok(next.map(|idx| {
            let job = &mut state.jobs[idx];
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.clone()
        }))
    }

    async fn mark_job_complete(&self, job_id: &str, summary: &JobResultSummary) -> Result<()> {
        self.transition(job_id, JobStatus::Completed, |job| {
            job.result = Some(summary.clone());
        })
    }

    async fn mark_job_failed(&self, job_id: &str, error: &str) -> Result<()> {
        self.transition(job_id, JobStatus::Failed, |job| {
            job.error = Some(error.to_string());
        })
    }

    async fn fail_stale_jobs(&self, cutoff: DateTime<Utc>, error: &str) -> Result<Vec<String>> {
        let mut state = self.state()?;
        let now = Utc::now();
        let mut failed = Vec::new();
        for job in state.jobs.iter_mut().filter(|j| {
            j.status == JobStatus::Running && j.started_at.is_some_and(|at| at < cutoff)
        }) {
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
            job.error = Some(error.to_string());
            failed.push(job.id.clone());
        }
        Ok(failed)
    }
}
