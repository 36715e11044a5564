//! Staleness policy and the periodic scheduler that enqueues distillations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use corelogic_shared::{DistillationConfig, Result, TriggeredBy};
use corelogic_storage::Store;

use crate::queue::JobQueue;

/// Decides whether a domain needs a fresh distillation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPolicy {
    pub min_knowledge_items: usize,
    pub interval: chrono::Duration,
}

impl TriggerPolicy {
    pub fn from_config(config: &DistillationConfig) -> Self {
        Self {
            min_knowledge_items: config.min_knowledge_items,
            interval: config.interval(),
        }
    }

    /// Below the minimum never triggers, regardless of age. With enough
    /// items, a domain without a version always triggers; otherwise it
    /// triggers once the active version is at least `interval` old.
    pub fn decide(
        &self,
        knowledge_items: usize,
        last_distilled: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if knowledge_items < self.min_knowledge_items {
            return false;
        }
        match last_distilled {
            None => true,
            Some(at) => now - at >= self.interval,
        }
    }

    pub async fn evaluate(
        &self,
        store: &dyn Store,
        domain_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let count = store.count_knowledge_items(domain_id).await?;
        if count < self.min_knowledge_items {
            return Ok(false);
        }
        let last = store.get_last_distill_time(domain_id).await?;
        Ok(self.decide(count, last, now))
    }
}

/// Counts from one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub evaluated: usize,
    pub enqueued: usize,
    /// Due, but a job was already pending or running.
    pub skipped: usize,
    pub failed: usize,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    queue: JobQueue,
    policy: TriggerPolicy,
    priority: i32,
    check_interval: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, config: &DistillationConfig) -> Self {
        Self {
            queue: JobQueue::new(store.clone()),
            store,
            policy: TriggerPolicy::from_config(config),
            priority: config.default_priority,
            check_interval: config.check_interval(),
        }
    }

    pub fn policy(&self) -> &TriggerPolicy {
        &self.policy
    }

    /// Evaluate every domain once. A failing domain is logged and counted,
    /// never fatal to the pass.
    #[instrument(skip_all)]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SchedulerReport> {
        let domains = self.store.list_domains().await?;
        let mut report = SchedulerReport::default();

        for domain in &domains {
            report.evaluated += 1;
            match self.schedule_domain(&domain.id, now).await {
                Ok(Decision::Enqueued) => report.enqueued += 1,
                Ok(Decision::AlreadyQueued) => report.skipped += 1,
                Ok(Decision::NotDue) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(domain_id = %domain.id, error = %e, "domain evaluation failed");
                }
            }
        }

        info!(
            evaluated = report.evaluated,
            enqueued = report.enqueued,
            skipped = report.skipped,
            failed = report.failed,
            "scheduler pass complete"
        );
        Ok(report)
    }

    async fn schedule_domain(&self, domain_id: &str, now: DateTime<Utc>) -> Result<Decision> {
        if !self.policy.evaluate(self.store.as_ref(), domain_id, now).await? {
            return Ok(Decision::NotDue);
        }
        if self.store.has_open_job(domain_id).await? {
            debug!(domain_id, "distillation already queued");
            return Ok(Decision::AlreadyQueued);
        }
        self.queue
            .enqueue(domain_id, self.priority, TriggeredBy::Scheduled, json!({}))
            .await?;
        Ok(Decision::Enqueued)
    }

    /// Run a pass immediately, then every `check_interval` until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            "scheduler started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        warn!(error = %e, "scheduler pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}

enum Decision {
    Enqueued,
    AlreadyQueued,
    NotDue,
}

pub fn spawn_scheduler_loop(
    scheduler: Arc<Scheduler>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move { scheduler.run(shutdown).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{add_domain, add_items, content_with, seeded_store};
    use crate::versions::{VersionChainManager, VersionOrigin};
    use corelogic_shared::{DistillationJob, JobStatus};

    fn policy() -> TriggerPolicy {
        TriggerPolicy::from_config(&DistillationConfig::default())
    }

    #[test]
    fn decide_boundaries() {
        let p = policy();
        let now = Utc::now();
        assert!(!p.decide(4, None, now));
        assert!(p.decide(5, None, now));
        // Count gate wins over age.
        assert!(!p.decide(4, Some(now - chrono::Duration::days(30)), now));
        assert!(!p.decide(5, Some(now - chrono::Duration::hours(10)), now));
        assert!(p.decide(5, Some(now - chrono::Duration::hours(24)), now));
    }

    #[tokio::test]
    async fn new_domain_with_enough_items_is_enqueued() {
        let (store, domain) = seeded_store(6);
        let scheduler = Scheduler::new(store.clone(), &DistillationConfig::default());

        let report = scheduler.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.enqueued, 1);

        let jobs: Vec<DistillationJob> = store.list_jobs(Some(&domain.id)).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Pending);
        assert_eq!(jobs[0].priority, 5);
        assert_eq!(jobs[0].triggered_by, TriggeredBy::Scheduled);
    }

    #[tokio::test]
    async fn recent_version_is_not_due() {
        let (store, domain) = seeded_store(6);
        let v = VersionChainManager::new(store.clone())
            .create_version(&domain.id, content_with(1, 1), VersionOrigin::Distilled {
                summary: None,
                knowledge_items: 6,
            })
            .await
            .unwrap();
        let p = policy();

        let ten_hours = v.created_at + chrono::Duration::hours(10);
        assert!(!p.evaluate(store.as_ref(), &domain.id, ten_hours).await.unwrap());
        let a_day = v.created_at + chrono::Duration::hours(24);
        assert!(p.evaluate(store.as_ref(), &domain.id, a_day).await.unwrap());

        let scheduler = Scheduler::new(store.clone(), &DistillationConfig::default());
        let report = scheduler.run_once(ten_hours).await.unwrap();
        assert_eq!(report, SchedulerReport {
            evaluated: 1,
            ..Default::default()
        });
        assert!(store.list_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn below_minimum_never_triggers() {
        let (store, domain) = seeded_store(4);
        let p = policy();
        assert!(!p.evaluate(store.as_ref(), &domain.id, Utc::now()).await.unwrap());

        add_items(&store, &domain, 1);
        assert!(p.evaluate(store.as_ref(), &domain.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn open_job_suppresses_duplicate() {
        let (store, _) = seeded_store(6);
        let scheduler = Scheduler::new(store.clone(), &DistillationConfig::default());

        scheduler.run_once(Utc::now()).await.unwrap();
        let second = scheduler.run_once(Utc::now()).await.unwrap();
        assert_eq!((second.enqueued, second.skipped), (0, 1));
        assert_eq!(store.list_jobs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_domain_does_not_stop_the_pass() {
        let (store, broken) = seeded_store(6);
        let healthy = add_domain(&store, "healthy", 6);
        store.fail_domain(&broken.id, "index corrupted").unwrap();

        let scheduler = Scheduler::new(store.clone(), &DistillationConfig::default());
        let report = scheduler.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.evaluated, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.enqueued, 1);

        let jobs = store.list_jobs(None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].domain_id, healthy.id);
    }

    #[tokio::test]
    async fn run_evaluates_immediately_and_stops() {
        let (store, _) = seeded_store(6);
        let scheduler = Arc::new(Scheduler::new(store.clone(), &DistillationConfig::default()));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_scheduler_loop(scheduler, rx);

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while store.list_jobs(None).await.unwrap().is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first pass never ran");

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
