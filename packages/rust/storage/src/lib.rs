//! libSQL storage layer and the [`Store`] abstraction.
//!
//! The [`Storage`] struct wraps a local libSQL database holding domains,
//! knowledge items, the core logic version chain, and the distillation job
//! queue. [`MemoryStore`] satisfies the same [`Store`] contract in memory.
//!
//! **Atomicity rules:**
//! - the job claim is a single conditional `UPDATE … RETURNING`, so it holds
//!   across processes sharing the database file;
//! - the version swap runs in one `IMMEDIATE` transaction.

mod memory;
mod migrations;
mod store;

pub use memory::MemoryStore;
pub use store::Store;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corelogic_shared::{
    CoreLogicError, CoreLogicVersion, DistillationJob, Domain, JobResultSummary, JobStatus,
    KnowledgeItem, Result, format_timestamp, parse_timestamp,
};
use libsql::{Connection, Database, TransactionBehavior, params};
use tokio::sync::Mutex;

const VERSION_COLUMNS: &str = "id, domain_id, version, parent_version_id, content_json, \
     changelog_json, change_summary, content_hash, is_active, created_at";

const JOB_COLUMNS: &str = "id, domain_id, owner, status, priority, triggered_by, config_json, \
     created_at, started_at, completed_at, error, result_json";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    /// Serializes writes on the shared connection so a transaction never
    /// absorbs another task's statements.
    write_lock: Mutex<()>,
}

fn db_err(e: libsql::Error) -> CoreLogicError {
    CoreLogicError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreLogicError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode (inspection commands).
    ///
    /// Never creates the file and never runs migrations.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(CoreLogicError::not_found(
                "database",
                path.display().to_string(),
            ));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CoreLogicError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CoreLogicError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Seeding (domains and knowledge are owned by external systems)
    // -----------------------------------------------------------------------

    /// Insert a domain record.
    pub async fn insert_domain(&self, domain: &Domain) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO domains (id, owner, name, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    domain.id.as_str(),
                    domain.owner.as_str(),
                    domain.name.as_str(),
                    domain.description.as_deref(),
                    format_timestamp(&domain.created_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Insert a knowledge item record.
    pub async fn insert_knowledge_item(&self, item: &KnowledgeItem) -> Result<()> {
        self.check_writable()?;
        let tags_json = serde_json::to_string(&item.tags)?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO knowledge_items (id, domain_id, owner, title, content, tags_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    item.id.as_str(),
                    item.domain_id.as_str(),
                    item.owner.as_str(),
                    item.title.as_str(),
                    item.content.as_str(),
                    tags_json,
                    format_timestamp(&item.created_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Report why a `running -> next` update touched no row.
    async fn transition_error(&self, job_id: &str, next: JobStatus) -> CoreLogicError {
        match self.get_job(job_id).await {
            Ok(Some(job)) => CoreLogicError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status.to_string(),
                to: next.to_string(),
            },
            Ok(None) => CoreLogicError::not_found("job", job_id),
            Err(e) => e,
        }
    }

    async fn query_versions(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<CoreLogicVersion>> {
        let mut rows = self.conn.query(sql, params).await.map_err(db_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_version(&row)?);
        }
        Ok(results)
    }

    async fn query_jobs(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<DistillationJob>> {
        let mut rows = self.conn.query(sql, params).await.map_err(db_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_job(&row)?);
        }
        Ok(results)
    }
}

#[async_trait]
impl Store for Storage {
    // -----------------------------------------------------------------------
    // Domain & knowledge operations
    // -----------------------------------------------------------------------

    async fn get_domain(&self, domain_id: &str) -> Result<Option<Domain>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, owner, name, description, created_at FROM domains WHERE id = ?1",
                params![domain_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_domain(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_domains(&self) -> Result<Vec<Domain>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, owner, name, description, created_at FROM domains ORDER BY created_at, id",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_domain(&row)?);
        }
        Ok(results)
    }

    async fn count_knowledge_items(&self, domain_id: &str) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM knowledge_items WHERE domain_id = ?1",
                params![domain_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)? as usize),
            None => Ok(0),
        }
    }

    async fn list_knowledge_items(&self, domain_id: &str) -> Result<Vec<KnowledgeItem>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, domain_id, owner, title, content, tags_json, created_at
                 FROM knowledge_items WHERE domain_id = ?1
                 ORDER BY created_at DESC, id DESC",
                params![domain_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_knowledge_item(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Version operations
    // -----------------------------------------------------------------------

    async fn get_active_version(&self, domain_id: &str) -> Result<Option<CoreLogicVersion>> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM core_logic_versions
             WHERE domain_id = ?1 AND is_active = 1"
        );
        Ok(self
            .query_versions(&sql, params![domain_id])
            .await?
            .into_iter()
            .next())
    }

    async fn get_version(
        &self,
        domain_id: &str,
        version: u32,
    ) -> Result<Option<CoreLogicVersion>> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM core_logic_versions
             WHERE domain_id = ?1 AND version = ?2"
        );
        Ok(self
            .query_versions(&sql, params![domain_id, version as i64])
            .await?
            .into_iter()
            .next())
    }

    async fn get_version_by_id(&self, version_id: &str) -> Result<Option<CoreLogicVersion>> {
        let sql = format!("SELECT {VERSION_COLUMNS} FROM core_logic_versions WHERE id = ?1");
        Ok(self
            .query_versions(&sql, params![version_id])
            .await?
            .into_iter()
            .next())
    }

    async fn list_versions(&self, domain_id: &str) -> Result<Vec<CoreLogicVersion>> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM core_logic_versions
             WHERE domain_id = ?1 ORDER BY version DESC"
        );
        self.query_versions(&sql, params![domain_id]).await
    }

    async fn insert_version(
        &self,
        version: &CoreLogicVersion,
        supersedes: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let content_json = serde_json::to_string(&version.content)?;
        let changelog_json = serde_json::to_string(&version.changelog)?;

        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;

        let swapped: Result<()> = async {
            match supersedes {
                Some(previous_id) => {
                    let changed = tx
                        .execute(
                            "UPDATE core_logic_versions SET is_active = 0
                             WHERE id = ?1 AND domain_id = ?2 AND is_active = 1",
                            params![previous_id, version.domain_id.as_str()],
                        )
                        .await
                        .map_err(db_err)?;
                    if changed == 0 {
                        return Err(CoreLogicError::Conflict(format!(
                            "version {previous_id} is no longer active for domain {}",
                            version.domain_id
                        )));
                    }
                }
                None => {
                    let mut rows = tx
                        .query(
                            "SELECT COUNT(*) FROM core_logic_versions
                             WHERE domain_id = ?1 AND is_active = 1",
                            params![version.domain_id.as_str()],
                        )
                        .await
                        .map_err(db_err)?;
                    let active = match rows.next().await.map_err(db_err)? {
                        Some(row) => row.get::<i64>(0).map_err(db_err)?,
                        None => 0,
                    };
                    if active > 0 {
                        return Err(CoreLogicError::Conflict(format!(
                            "domain {} already has an active version",
                            version.domain_id
                        )));
                    }
                }
            }

            tx.execute(
                "INSERT INTO core_logic_versions
                   (id, domain_id, version, parent_version_id, content_json, changelog_json,
                    change_summary, content_hash, is_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    version.id.as_str(),
                    version.domain_id.as_str(),
                    version.version as i64,
                    version.parent_version_id.as_deref(),
                    content_json,
                    changelog_json,
                    version.change_summary.as_deref(),
                    version.content_hash.as_str(),
                    if version.is_active { 1i64 } else { 0i64 },
                    format_timestamp(&version.created_at),
                ],
            )
            .await
            .map_err(|e| {
                let message = e.to_string();
                if message.contains("UNIQUE constraint failed") {
                    CoreLogicError::Conflict(format!(
                        "version {} already exists for domain {}",
                        version.version, version.domain_id
                    ))
                } else {
                    CoreLogicError::Storage(message)
                }
            })?;
            Ok(())
        }
        .await;

        match swapped {
            Ok(()) => tx.commit().await.map_err(db_err),
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "version swap rollback failed");
                }
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Job operations
    // -----------------------------------------------------------------------

    async fn insert_job(&self, job: &DistillationJob) -> Result<()> {
        self.check_writable()?;
        let config_json = serde_json::to_string(&job.config)?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO distillation_jobs
                   (id, domain_id, owner, status, priority, triggered_by, config_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    job.id.as_str(),
                    job.domain_id.as_str(),
                    job.owner.as_str(),
                    job.status.as_str(),
                    job.priority as i64,
                    job.triggered_by.as_str(),
                    config_json,
                    format_timestamp(&job.created_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<DistillationJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM distillation_jobs WHERE id = ?1");
        Ok(self.query_jobs(&sql, params![job_id]).await?.into_iter().next())
    }

    async fn list_jobs(&self, domain_id: Option<&str>) -> Result<Vec<DistillationJob>> {
        match domain_id {
            Some(domain_id) => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM distillation_jobs
                     WHERE domain_id = ?1 ORDER BY created_at DESC, id DESC"
                );
                self.query_jobs(&sql, params![domain_id]).await
            }
            None => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM distillation_jobs ORDER BY created_at DESC, id DESC"
                );
                self.query_jobs(&sql, params![]).await
            }
        }
    }

    async fn has_open_job(&self, domain_id: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM distillation_jobs
                 WHERE domain_id = ?1 AND status IN ('pending', 'running')",
                params![domain_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)? > 0),
            None => Ok(false),
        }
    }

    async fn claim_next_pending_job(&self) -> Result<Option<DistillationJob>> {
        self.check_writable()?;
        let now = format_timestamp(&Utc::now());
        let sql = format!(
            "UPDATE distillation_jobs
             SET status = 'running', started_at = ?1
             WHERE id = (
                 SELECT j.id FROM distillation_jobs j
                 WHERE j.status = 'pending'
                   AND NOT EXISTS (
                       SELECT 1 FROM distillation_jobs r
                       WHERE r.domain_id = j.domain_id AND r.status = 'running'
                   )
                 ORDER BY j.priority DESC, j.created_at ASC, j.rowid ASC
                 LIMIT 1
             )
             AND status = 'pending'
             RETURNING {JOB_COLUMNS}"
        );

        let _guard = self.write_lock.lock().await;
        let claimed = self.query_jobs(&sql, params![now]).await?.into_iter().next();
        if let Some(job) = &claimed {
            tracing::debug!(job_id = %job.id, domain_id = %job.domain_id, "claimed job");
        }
        Ok(claimed)
    }

    async fn mark_job_complete(&self, job_id: &str, summary: &JobResultSummary) -> Result<()> {
        self.check_writable()?;
        let result_json = serde_json::to_string(summary)?;
        let now = format_timestamp(&Utc::now());
        let changed = {
            let _guard = self.write_lock.lock().await;
            self.conn
                .execute(
                    "UPDATE distillation_jobs
                     SET status = 'completed', completed_at = ?1, result_json = ?2
                     WHERE id = ?3 AND status = 'running'",
                    params![now, result_json, job_id],
                )
                .await
                .map_err(db_err)?
        };
        if changed == 0 {
            return Err(self.transition_error(job_id, JobStatus::Completed).await);
        }
        Ok(())
    }

    async fn mark_job_failed(&self, job_id: &str, error: &str) -> Result<()> {
        self.check_writable()?;
        let now = format_timestamp(&Utc::now());
        let changed = {
            let _guard = self.write_lock.lock().await;
            self.conn
                .execute(
                    "UPDATE distillation_jobs
                     SET status = 'failed', completed_at = ?1, error = ?2
                     WHERE id = ?3 AND status = 'running'",
                    params![now, error, job_id],
                )
                .await
                .map_err(db_err)?
        };
        if changed == 0 {
            return Err(self.transition_error(job_id, JobStatus::Failed).await);
        }
        Ok(())
    }

    async fn fail_stale_jobs(&self, cutoff: DateTime<Utc>, error: &str) -> Result<Vec<String>> {
        self.check_writable()?;
        let now = format_timestamp(&Utc::now());
        let _guard = self.write_lock.lock().await;
        let mut rows = self
            .conn
            .query(
                "UPDATE distillation_jobs
                 SET status = 'failed', completed_at = ?1, error = ?2
                 WHERE status = 'running' AND started_at < ?3
                 RETURNING id",
                params![now, error, format_timestamp(&cutoff)],
            )
            .await
            .map_err(db_err)?;

        let mut failed = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            failed.push(row.get::<String>(0).map_err(db_err)?);
        }
        Ok(failed)
    }
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn row_to_domain(row: &libsql::Row) -> Result<Domain> {
    Ok(Domain {
        id: row.get::<String>(0).map_err(db_err)?,
        owner: row.get::<String>(1).map_err(db_err)?,
        name: row.get::<String>(2).map_err(db_err)?,
        description: row.get::<String>(3).ok(),
        created_at: parse_timestamp(&row.get::<String>(4).map_err(db_err)?)?,
    })
}

fn row_to_knowledge_item(row: &libsql::Row) -> Result<KnowledgeItem> {
    let tags_json: String = row.get(5).map_err(db_err)?;
    Ok(KnowledgeItem {
        id: row.get::<String>(0).map_err(db_err)?,
        domain_id: row.get::<String>(1).map_err(db_err)?,
        owner: row.get::<String>(2).map_err(db_err)?,
        title: row.get::<String>(3).map_err(db_err)?,
        content: row.get::<String>(4).map_err(db_err)?,
        tags: serde_json::from_str(&tags_json)?,
        created_at: parse_timestamp(&row.get::<String>(6).map_err(db_err)?)?,
    })
}

fn row_to_version(row: &libsql::Row) -> Result<CoreLogicVersion> {
    let content_json: String = row.get(4).map_err(db_err)?;
    let changelog_json: String = row.get(5).map_err(db_err)?;
    Ok(CoreLogicVersion {
        id: row.get::<String>(0).map_err(db_err)?,
        domain_id: row.get::<String>(1).map_err(db_err)?,
        version: row.get::<i64>(2).map_err(db_err)? as u32,
        parent_version_id: row.get::<String>(3).ok(),
        content: serde_json::from_str(&content_json)?,
        changelog: serde_json::from_str(&changelog_json)?,
        change_summary: row.get::<String>(6).ok(),
        content_hash: row.get::<String>(7).map_err(db_err)?,
        is_active: row.get::<i64>(8).map_err(db_err)? != 0,
        created_at: parse_timestamp(&row.get::<String>(9).map_err(db_err)?)?,
    })
}

fn row_to_job(row: &libsql::Row) -> Result<DistillationJob> {
    let status: String = row.get(3).map_err(db_err)?;
    let triggered_by: String = row.get(5).map_err(db_err)?;
    let config_json: String = row.get(6).map_err(db_err)?;
    Ok(DistillationJob {
        id: row.get::<String>(0).map_err(db_err)?,
        domain_id: row.get::<String>(1).map_err(db_err)?,
        owner: row.get::<String>(2).map_err(db_err)?,
        status: status.parse()?,
        priority: row.get::<i64>(4).map_err(db_err)? as i32,
        triggered_by: triggered_by.parse()?,
        config: serde_json::from_str(&config_json)?,
        created_at: parse_timestamp(&row.get::<String>(7).map_err(db_err)?)?,
        started_at: optional_timestamp(row, 8)?,
        completed_at: optional_timestamp(row, 9)?,
        error: row.get::<String>(10).ok(),
        result: match row.get::<String>(11).ok() {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        },
    })
}

fn optional_timestamp(row: &libsql::Row, idx: i32) -> Result<Option<chrono::DateTime<Utc>>> {
    match row.get::<String>(idx).ok() {
        Some(s) => Ok(Some(parse_timestamp(&s)?)),
        None => Ok(None),
    }
}
