//! Fixtures shared by the unit tests in this crate.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::Semaphore;

use corelogic_shared::{
    CoreLogicContent, CoreLogicError, CoreLogicVersion, DistillationJob, Domain,
    JobResultSummary, KnowledgeItem, Result, new_id,
};
use corelogic_storage::{MemoryStore, Store};

use crate::distiller::{Distillation, DistillOptions, Distiller, DomainContext, Usage};

/// A memory store holding one domain named "primary" with `items` knowledge items.
pub fn seeded_store(items: usize) -> (Arc<MemoryStore>, Domain) {
    let store = Arc::new(MemoryStore::new());
    let domain = add_domain(&store, "primary", items);
    (store, domain)
}

pub fn add_domain(store: &MemoryStore, name: &str, items: usize) -> Domain {
    let domain = Domain {
        id: new_id(),
        owner: "owner-1".into(),
        name: name.into(),
        description: None,
        created_at: Utc::now() - Duration::days(30),
    };
    store.add_domain(domain.clone()).unwrap();
    add_items(store, &domain, items);
    domain
}

pub fn add_items(store: &MemoryStore, domain: &Domain, count: usize) {
    for n in 0..count {
        store
            .add_knowledge_item(KnowledgeItem {
                id: new_id(),
                domain_id: domain.id.clone(),
                owner: domain.owner.clone(),
                title: format!("note {n}"),
                content: format!("observation number {n}"),
                tags: vec![],
                created_at: Utc::now(),
            })
            .unwrap();
    }
}

/// Content with `principles` first principles and `models` mental models.
pub fn content_with(principles: usize, models: usize) -> CoreLogicContent {
    CoreLogicContent {
        first_principles: (0..principles)
            .map(|n| json!({"title": format!("principle {n}")}))
            .collect(),
        mental_models: (0..models)
            .map(|n| json!({"name": format!("model {n}")}))
            .collect(),
        ..Default::default()
    }
}

/// Distiller that returns fixed content sized by the snapshot.
#[derive(Default)]
pub struct EchoDistiller {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Distiller for EchoDistiller {
    async fn distill(
        &self,
        ctx: &DomainContext,
        _existing: Option<&CoreLogicVersion>,
        _options: &DistillOptions,
    ) -> Result<Distillation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Distillation {
            content: content_with(ctx.items.len(), 1),
            summary: Some(format!("distilled {} items", ctx.items.len())),
            usage: Usage { tokens_used: 42 },
        })
    }
}

/// Distiller that always fails with a provider error.
pub struct FailingDistiller(pub &'static str);

#[async_trait]
impl Distiller for FailingDistiller {
    async fn distill(
        &self,
        _ctx: &DomainContext,
        _existing: Option<&CoreLogicVersion>,
        _options: &DistillOptions,
    ) -> Result<Distillation> {
        Err(CoreLogicError::Provider(self.0.to_string()))
    }
}

/// Distiller that panics mid-job.
pub struct PanickingDistiller;

#[async_trait]
impl Distiller for PanickingDistiller {
    async fn distill(
        &self,
        _ctx: &DomainContext,
        _existing: Option<&CoreLogicVersion>,
        _options: &DistillOptions,
    ) -> Result<Distillation> {
        panic!("distiller exploded");
    }
}

/// Distiller that parks every call until released, tracking peak concurrency.
pub struct GatedDistiller {
    pub in_flight: AtomicUsize,
    pub peak: AtomicUsize,
    gate: Semaphore,
}

impl GatedDistiller {
    pub fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        }
    }

    /// Let `n` parked (or future) calls finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Wait until exactly `n` calls are parked.
    pub async fn wait_for_in_flight(&self, n: usize) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while self.in_flight.load(Ordering::SeqCst) != n {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("distiller calls never reached the expected count");
    }
}

#[async_trait]
impl Distiller for GatedDistiller {
    async fn distill(
        &self,
        ctx: &DomainContext,
        _existing: Option<&CoreLogicVersion>,
        _options: &DistillOptions,
    ) -> Result<Distillation> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.gate.acquire().await.expect("gate closed").forget();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Distillation {
            content: content_with(ctx.items.len(), 0),
            summary: None,
            usage: Usage::default(),
        })
    }
}

/// Memory store whose next `completion_failures` job completions fail with a
/// storage error. Everything else passes straight through.
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    completion_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>, completion_failures: usize) -> Self {
        Self {
            inner,
            completion_failures: AtomicUsize::new(completion_failures),
        }
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn get_domain(&self, domain_id: &str) -> Result<Option<Domain>> {
        self.inner.get_domain(domain_id).await
    }

    async fn list_domains(&self) -> Result<Vec<Domain>> {
        self.inner.list_domains().await
    }

    async fn count_knowledge_items(&self, domain_id: &str) -> Result<usize> {
        self.inner.count_knowledge_items(domain_id).await
    }

    async fn list_knowledge_items(&self, domain_id: &str) -> Result<Vec<KnowledgeItem>> {
        self.inner.list_knowledge_items(domain_id).await
    }

    async fn get_active_version(&self, domain_id: &str) -> Result<Option<CoreLogicVersion>> {
        self.inner.get_active_version(domain_id).await
    }

    async fn get_version(
        &self,
        domain_id: &str,
        version: u32,
    ) -> Result<Option<CoreLogicVersion>> {
        self.inner.get_version(domain_id, version).await
    }

    async fn get_version_by_id(&self, version_id: &str) -> Result<Option<CoreLogicVersion>> {
        self.inner.get_version_by_id(version_id).await
    }

    async fn list_versions(&self, domain_id: &str) -> Result<Vec<CoreLogicVersion>> {
        self.inner.list_versions(domain_id).await
    }

    async fn insert_version(
        &self,
        version: &CoreLogicVersion,
        supersedes: Option<&str>,
    ) -> Result<()> {
        self.inner.insert_version(version, supersedes).await
    }

    async fn insert_job(&self, job: &DistillationJob) -> Result<()> {
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<DistillationJob>> {
        self.inner.get_job(job_id).await
    }

    async fn list_jobs(&self, domain_id: Option<&str>) -> Result<Vec<DistillationJob>> {
        self.inner.list_jobs(domain_id).await
    }

    async fn has_open_job(&self, domain_id: &str) -> Result<bool> {
        self.inner.has_open_job(domain_id).await
    }

    async fn claim_next_pending_job(&self) -> Result<Option<DistillationJob>> {
        self.inner.claim_next_pending_job().await
    }

    async fn mark_job_complete(&self, job_id: &str, summary: &JobResultSummary) -> Result<()> {
        let failing = self
            .completion_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CoreLogicError::Storage("database is locked".into()));
        }
        self.inner.mark_job_complete(job_id, summary).await
    }

    async fn mark_job_failed(&self, job_id: &str, error: &str) -> Result<()> {
        self.inner.mark_job_failed(job_id, error).await
    }

    async fn fail_stale_jobs(&self, cutoff: DateTime<Utc>, error: &str) -> Result<Vec<String>> {
        self.inner.fail_stale_jobs(cutoff, error).await
    }
}
