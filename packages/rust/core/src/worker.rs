//! Bounded-concurrency job worker.
//!
//! Each tick claims at most one job and hands it to a spawned task that holds
//! a semaphore permit for the lifetime of the job. The permit count is the
//! concurrency bound; the tick itself never waits on processing.
//!
//! Jobs left `running` by a crashed process are failed once they exceed the
//! stale-job timeout, so their domains can be claimed again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use corelogic_shared::{
    CoreLogicError, DistillationJob, JobResultSummary, Result, WorkerConfig,
};
use corelogic_storage::Store;

use crate::distiller::{DistillOptions, Distiller, DomainContext};
use crate::queue::JobQueue;
use crate::versions::{VersionChainManager, VersionOrigin};

const PANIC_MESSAGE: &str = "job processing panicked";
const COMPLETION_ATTEMPTS: u32 = 3;
const COMPLETION_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Runtime knobs for a [`Worker`].
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub max_concurrent_jobs: usize,
    pub stale_job_timeout: Duration,
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_concurrent_jobs: config.max_concurrent_jobs,
            stale_job_timeout: config.stale_job_timeout(),
        }
    }
}

/// What a single [`Worker::tick`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick on this worker was still claiming.
    Busy,
    /// Every slot is taken.
    AtCapacity,
    /// Nothing claimable.
    Idle,
    /// A job was claimed and handed off.
    Dispatched(String),
}

// ---------------------------------------------------------------------------
// Job processing
// ---------------------------------------------------------------------------

/// Everything a spawned job task needs.
#[derive(Clone)]
struct JobProcessor {
    store: Arc<dyn Store>,
    queue: JobQueue,
    versions: VersionChainManager,
    distiller: Arc<dyn Distiller>,
}

impl JobProcessor {
    /// Snapshot, distill, commit.
    async fn execute(&self, job: &DistillationJob) -> Result<JobResultSummary> {
        let options = DistillOptions::from_job_config(&job.config)?;
        let domain = self
            .store
            .get_domain(&job.domain_id)
            .await?
            .ok_or_else(|| CoreLogicError::not_found("domain", job.domain_id.clone()))?;
        let items = self.store.list_knowledge_items(&job.domain_id).await?;
        let existing = self.store.get_active_version(&job.domain_id).await?;
        let ctx = DomainContext { domain, items };

        let distillation = self
            .distiller
            .distill(&ctx, existing.as_ref(), &options)
            .await?;

        let version = self
            .versions
            .create_version(
                &job.domain_id,
                distillation.content,
                VersionOrigin::Distilled {
                    summary: distillation.summary,
                    knowledge_items: ctx.items.len(),
                },
            )
            .await?;

        Ok(JobResultSummary {
            version: version.version,
            version_id: version.id,
            knowledge_items_processed: ctx.items.len(),
            tokens_used: distillation.usage.tokens_used,
        })
    }

    /// Run the job and record its outcome on the queue.
    async fn process(&self, job: DistillationJob) -> Result<JobResultSummary> {
        match self.execute(&job).await {
            Ok(summary) => match self.record_completion(&job.id, &summary).await {
                Ok(()) => Ok(summary),
                Err(record) => {
                    error!(
                        job_id = %job.id,
                        version = summary.version,
                        error = %record,
                        "version committed but job completion was not recorded"
                    );
                    let message = format!(
                        "version {} ({}) was committed but job completion could not be recorded: {record}",
                        summary.version, summary.version_id
                    );
                    if let Err(e) = self.queue.mark_failed(&job.id, &message).await {
                        error!(job_id = %job.id, error = %e, "failed to record job failure");
                    }
                    Err(record)
                }
            },
            Err(e) => {
                if let Err(record) = self.queue.mark_failed(&job.id, &e.to_string()).await {
                    error!(job_id = %job.id, error = %record, "failed to record job failure");
                }
                Err(e)
            }
        }
    }

    /// `mark_complete` with a short backoff. A transition the store rejects
    /// outright is not retried.
    async fn record_completion(&self, job_id: &str, summary: &JobResultSummary) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.queue.mark_complete(job_id, summary).await {
                Ok(()) => return Ok(()),
                Err(e @ (CoreLogicError::InvalidTransition { .. } | CoreLogicError::NotFound { .. })) => {
                    return Err(e);
                }
                Err(e) if attempt >= COMPLETION_ATTEMPTS => return Err(e),
                Err(e) => {
                    warn!(job_id, attempt, error = %e, "recording job completion failed, retrying");
                    tokio::time::sleep(COMPLETION_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct Worker {
    processor: JobProcessor,
    settings: WorkerSettings,
    slots: Arc<Semaphore>,
    tick_guard: Mutex<()>,
    finished: Arc<Notify>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn Store>,
        distiller: Arc<dyn Distiller>,
        settings: WorkerSettings,
    ) -> Result<Self> {
        if settings.max_concurrent_jobs == 0 || settings.max_concurrent_jobs > u32::MAX as usize {
            return Err(CoreLogicError::config(format!(
                "max_concurrent_jobs must be between 1 and {}",
                u32::MAX
            )));
        }

        Ok(Self {
            processor: JobProcessor {
                queue: JobQueue::new(store.clone()),
                versions: VersionChainManager::new(store.clone()),
                store,
                distiller,
            },
            slots: Arc::new(Semaphore::new(settings.max_concurrent_jobs)),
            settings,
            tick_guard: Mutex::new(()),
            finished: Arc::new(Notify::new()),
        })
    }

    /// Jobs currently processing.
    pub fn active_jobs(&self) -> usize {
        self.settings.max_concurrent_jobs - self.slots.available_permits()
    }

    pub fn settings(&self) -> WorkerSettings {
        self.settings
    }

    /// Fail jobs that have been running longer than the stale-job timeout.
    pub async fn reap_stale_jobs(&self) -> Result<Vec<String>> {
        let timeout = chrono::Duration::from_std(self.settings.stale_job_timeout)
            .map_err(|e| CoreLogicError::config(format!("stale job timeout out of range: {e}")))?;
        self.processor.queue.fail_stale(Utc::now() - timeout).await
    }

    /// Claim at most one job and dispatch it without waiting for it.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            return Ok(TickOutcome::Busy);
        };
        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            return Ok(TickOutcome::AtCapacity);
        };
        let Some(job) = self.processor.queue.claim_next().await? else {
            return Ok(TickOutcome::Idle);
        };

        let job_id = job.id.clone();
        self.dispatch(job, permit);
        Ok(TickOutcome::Dispatched(job_id))
    }

    /// Process an already-claimed job inline and record its outcome.
    pub async fn process_job(&self, job: DistillationJob) -> Result<JobResultSummary> {
        let span = info_span!("job", job_id = %job.id, domain_id = %job.domain_id);
        self.processor.process(job).instrument(span).await
    }

    fn dispatch(&self, job: DistillationJob, permit: OwnedSemaphorePermit) {
        let processor = self.processor.clone();
        let finished = self.finished.clone();
        let span = info_span!("job", job_id = %job.id, domain_id = %job.domain_id);

        tokio::spawn(
            async move {
                let job_id = job.id.clone();
                let inner = tokio::spawn({
                    let processor = processor.clone();
                    async move { processor.process(job).await }.in_current_span()
                });

                match inner.await {
                    Ok(Ok(summary)) => debug!(version = summary.version, "job finished"),
                    Ok(Err(e)) => debug!(error = %e, "job ended with error"),
                    Err(join) => {
                        error!(error = %join, "job task aborted");
                        if let Err(e) = processor.queue.mark_failed(&job_id, PANIC_MESSAGE).await {
                            error!(error = %e, "failed to record job failure");
                        }
                    }
                }

                drop(permit);
                finished.notify_one();
            }
            .instrument(span),
        );
    }

    /// Tick until nothing is claimable and no job is in flight.
    ///
    /// Returns the number of jobs dispatched.
    pub async fn run_until_idle(&self) -> Result<usize> {
        self.reap_stale_jobs().await?;
        let mut dispatched = 0;
        loop {
            match self.tick().await? {
                TickOutcome::Dispatched(_) => dispatched += 1,
                TickOutcome::Idle if self.active_jobs() == 0 => break,
                TickOutcome::Idle | TickOutcome::AtCapacity => self.finished.notified().await,
                TickOutcome::Busy => tokio::task::yield_now().await,
            }
        }
        Ok(dispatched)
    }

    /// Poll until `shutdown` flips to true, then wait for in-flight jobs.
    #[instrument(skip_all, fields(max = self.settings.max_concurrent_jobs))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let reap_every = (self.settings.stale_job_timeout / 4).max(self.settings.poll_interval);
        let mut reaper = tokio::time::interval(reap_every);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "worker started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(TickOutcome::Dispatched(job_id)) => info!(%job_id, "dispatched job"),
                        Ok(outcome) => debug!(?outcome, "worker tick"),
                        Err(e) => warn!(error = %e, "worker tick failed"),
                    }
                }
                _ = reaper.tick() => {
                    if let Err(e) = self.reap_stale_jobs().await {
                        warn!(error = %e, "stale job sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(active = self.active_jobs(), "worker stopping, draining jobs");
        self.drain().await;
        info!("worker stopped");
    }

    /// Wait for every in-flight job to finish.
    pub async fn drain(&self) {
        let all = self.settings.max_concurrent_jobs as u32;
        if let Ok(permits) = self.slots.acquire_many(all).await {
            drop(permits);
        }
    }
}

/// Run `worker` on its own task until shutdown.
pub fn spawn_worker_loop(worker: Arc<Worker>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move { worker.run(shutdown).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::testing::{
        EchoDistiller, FailingDistiller, FlakyStore, GatedDistiller, PanickingDistiller,
        add_domain, content_with, seeded_store,
    };
    use corelogic_shared::DistillationConfig;
    use corelogic_shared::{JobStatus, TriggeredBy};
    use corelogic_storage::MemoryStore;
    use serde_json::{Value, json};
    use std::sync::atomic::Ordering;

    fn settings(max: usize) -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(10),
            max_concurrent_jobs: max,
            stale_job_timeout: Duration::from_secs(3600),
        }
    }

    async fn enqueue(store: &Arc<MemoryStore>, domain_id: &str) -> DistillationJob {
        JobQueue::new(store.clone())
            .enqueue(domain_id, 5, TriggeredBy::Manual, Value::Null)
            .await
            .unwrap()
    }

    async fn job(store: &Arc<MemoryStore>, id: &str) -> DistillationJob {
        store.get_job(id).await.unwrap().unwrap()
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let (store, _) = seeded_store(0);
        let err = Worker::new(store, Arc::new(EchoDistiller::default()), settings(0))
            .err()
            .unwrap();
        assert!(matches!(err, CoreLogicError::Config { .. }));
    }

    #[tokio::test]
    async fn successful_job_commits_version() {
        let (store, domain) = seeded_store(6);
        let worker = Worker::new(store.clone(), Arc::new(EchoDistiller::default()), settings(3))
            .unwrap();
        let queued = enqueue(&store, &domain.id).await;

        assert_eq!(worker.run_until_idle().await.unwrap(), 1);

        let done = job(&store, &queued.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        let result = done.result.unwrap();
        assert_eq!(result.version, 1);
        assert_eq!(result.knowledge_items_processed, 6);
        assert_eq!(result.tokens_used, 42);

        let active = store.get_active_version(&domain.id).await.unwrap().unwrap();
        assert_eq!(active.id, result.version_id);
        assert_eq!(active.content.first_principles.len(), 6);
        assert_eq!(worker.active_jobs(), 0);
    }

    #[tokio::test]
    async fn failed_distillation_leaves_active_version() {
        let (store, domain) = seeded_store(6);
        let versions = VersionChainManager::new(store.clone());
        let v1 = versions
            .create_version(&domain.id, content_with(2, 2), VersionOrigin::Distilled {
                summary: None,
                knowledge_items: 6,
            })
            .await
            .unwrap();

        let worker = Worker::new(
            store.clone(),
            Arc::new(FailingDistiller("quota exceeded")),
            settings(3),
        )
        .unwrap();
        let queued = enqueue(&store, &domain.id).await;
        worker.run_until_idle().await.unwrap();

        let failed = job(&store, &queued.id).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap().contains("quota exceeded"));
        assert!(failed.result.is_none());

        let active = store.get_active_version(&domain.id).await.unwrap().unwrap();
        assert_eq!(active.id, v1.id);
        assert_eq!(store.list_versions(&domain.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_job_config_fails_without_distilling() {
        let (store, domain) = seeded_store(6);
        let distiller = Arc::new(EchoDistiller::default());
        let worker = Worker::new(store.clone(), distiller.clone(), settings(1)).unwrap();
        let queued = JobQueue::new(store.clone())
            .enqueue(&domain.id, 5, TriggeredBy::Api, json!({"temperature": "hot"}))
            .await
            .unwrap();

        worker.run_until_idle().await.unwrap();
        let failed = job(&store, &queued.id).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap().contains("invalid distillation options"));
        assert_eq!(distiller.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_job_is_marked_failed() {
        let (store, domain) = seeded_store(6);
        let worker = Worker::new(store.clone(), Arc::new(PanickingDistiller), settings(2)).unwrap();
        let queued = enqueue(&store, &domain.id).await;

        worker.run_until_idle().await.unwrap();
        let failed = job(&store, &queued.id).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some(PANIC_MESSAGE));
        assert_eq!(worker.active_jobs(), 0);

        // Still usable afterwards.
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn completion_is_retried_after_transient_store_error() {
        let (memory, domain) = seeded_store(6);
        let store = Arc::new(FlakyStore::new(memory.clone(), 1));
        let worker = Worker::new(store, Arc::new(EchoDistiller::default()), settings(1)).unwrap();
        let queued = enqueue(&memory, &domain.id).await;

        worker.run_until_idle().await.unwrap();

        let done = job(&memory, &queued.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.unwrap().version, 1);
        assert_eq!(memory.list_versions(&domain.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unrecorded_completion_fails_job_and_frees_domain() {
        let (memory, domain) = seeded_store(6);
        let store = Arc::new(FlakyStore::new(memory.clone(), COMPLETION_ATTEMPTS as usize));
        let worker = Worker::new(store.clone(), Arc::new(EchoDistiller::default()), settings(1))
            .unwrap();
        let queued = enqueue(&memory, &domain.id).await;

        worker.run_until_idle().await.unwrap();

        let failed = job(&memory, &queued.id).await;
        assert_eq!(failed.status, JobStatus::Failed);
        let active = memory.get_active_version(&domain.id).await.unwrap().unwrap();
        let error = failed.error.unwrap();
        assert!(error.contains("version 1"), "{error}");
        assert!(error.contains(&active.id), "{error}");
        assert!(!memory.has_open_job(&domain.id).await.unwrap());

        // Two days on, the domain is due again and nothing blocks it.
        let scheduler = Scheduler::new(store.clone(), &DistillationConfig::default());
        let report = scheduler
            .run_once(Utc::now() + chrono::Duration::days(2))
            .await
            .unwrap();
        assert_eq!((report.enqueued, report.skipped), (1, 0));

        let manual = JobQueue::new(store.clone())
            .enqueue(&domain.id, 9, TriggeredBy::Manual, Value::Null)
            .await
            .unwrap();
        assert_eq!(
            worker.tick().await.unwrap(),
            TickOutcome::Dispatched(manual.id.clone())
        );
        worker.drain().await;
        let done = job(&memory, &manual.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.unwrap().version, 2);
    }

    #[tokio::test]
    async fn abandoned_running_job_is_reaped() {
        let (store, domain) = seeded_store(6);
        let abandoned = enqueue(&store, &domain.id).await;
        // Claimed by a process that never finished it.
        store.claim_next_pending_job().await.unwrap().unwrap();

        let worker = Worker::new(
            store.clone(),
            Arc::new(EchoDistiller::default()),
            WorkerSettings {
                stale_job_timeout: Duration::from_millis(1),
                ..settings(1)
            },
        )
        .unwrap();
        let manual = JobQueue::new(store.clone())
            .enqueue(&domain.id, 9, TriggeredBy::Manual, Value::Null)
            .await
            .unwrap();
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            worker.reap_stale_jobs().await.unwrap(),
            vec![abandoned.id.clone()]
        );
        let reaped = job(&store, &abandoned.id).await;
        assert_eq!(reaped.status, JobStatus::Failed);
        assert!(reaped.error.unwrap().contains("abandoned"));

        assert_eq!(
            worker.tick().await.unwrap(),
            TickOutcome::Dispatched(manual.id.clone())
        );
        worker.drain().await;
        assert_eq!(job(&store, &manual.id).await.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn tick_outcomes() {
        let (store, domain) = seeded_store(6);
        let worker = Worker::new(store.clone(), Arc::new(EchoDistiller::default()), settings(1))
            .unwrap();
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);

        let queued = enqueue(&store, &domain.id).await;
        {
            let _held = worker.tick_guard.lock().await;
            assert_eq!(worker.tick().await.unwrap(), TickOutcome::Busy);
        }
        assert_eq!(
            worker.tick().await.unwrap(),
            TickOutcome::Dispatched(queued.id.clone())
        );
        worker.drain().await;
        assert_eq!(job(&store, &queued.id).await.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn never_exceeds_max_concurrent_jobs() {
        let (store, first) = seeded_store(5);
        let mut domains = vec![first];
        for n in 0..4 {
            domains.push(add_domain(&store, &format!("extra-{n}"), 5));
        }
        for domain in &domains {
            enqueue(&store, &domain.id).await;
        }

        let gated = Arc::new(GatedDistiller::new());
        let worker = Worker::new(store.clone(), gated.clone(), settings(2)).unwrap();

        assert!(matches!(worker.tick().await.unwrap(), TickOutcome::Dispatched(_)));
        assert!(matches!(worker.tick().await.unwrap(), TickOutcome::Dispatched(_)));
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::AtCapacity);
        gated.wait_for_in_flight(2).await;
        assert_eq!(worker.active_jobs(), 2);

        gated.release(domains.len());
        assert_eq!(worker.run_until_idle().await.unwrap(), 3);

        assert!(gated.peak.load(Ordering::SeqCst) <= 2);
        let jobs = store.list_jobs(None).await.unwrap();
        assert_eq!(jobs.len(), 5);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));

        // The gated distiller reports no summary of its own.
        let active = store.get_active_version(&domains[0].id).await.unwrap().unwrap();
        assert_eq!(
            active.change_summary.as_deref(),
            Some("Distilled from 5 knowledge items")
        );
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_drains() {
        let (store, domain) = seeded_store(6);
        let worker = Arc::new(
            Worker::new(store.clone(), Arc::new(EchoDistiller::default()), settings(2)).unwrap(),
        );
        let (tx, rx) = watch::channel(false);
        let handle = spawn_worker_loop(worker.clone(), rx);

        let queued = enqueue(&store, &domain.id).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while job(&store, &queued.id).await.status != JobStatus::Completed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job never completed");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
        assert_eq!(worker.active_jobs(), 0);
    }
}
