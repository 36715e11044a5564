//! CLI command definitions, routing, and tracing setup.

use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use corelogic_core::{
    JobQueue, OpenAiDistiller, Scheduler, VersionChainManager, Worker, WorkerSettings,
    spawn_scheduler_loop, spawn_worker_loop,
};
use corelogic_shared::{
    AppConfig, ChangelogEntry, CoreLogicVersion, DistillationJob, Domain, JobStatus,
    KnowledgeItem, TriggeredBy, init_config, load_config, new_id, validate_api_key,
};
use corelogic_storage::{Storage, Store};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Core logic engine: distill domain knowledge into a versioned artifact.
#[derive(Parser)]
#[command(
    name = "corelogic",
    version,
    about = "Distill domain knowledge into versioned core logic.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the scheduler and worker until Ctrl-C.
    Run,

    /// Queue a manual distillation for a domain.
    Trigger {
        /// Domain ID.
        #[arg(long)]
        domain: String,

        /// Job priority (higher runs first). Defaults to the configured priority.
        #[arg(long)]
        priority: Option<i32>,
    },

    /// Queue a distillation and process the queue in the foreground.
    Distill {
        /// Domain ID.
        #[arg(long)]
        domain: String,
    },

    /// Inspect or roll back a domain's version chain.
    Versions {
        #[command(subcommand)]
        action: VersionsAction,
    },

    /// List distillation jobs, newest first.
    Jobs {
        /// Only jobs for this domain.
        #[arg(long)]
        domain: Option<String>,
    },

    /// Manage local domain records.
    Domain {
        #[command(subcommand)]
        action: DomainAction,
    },

    /// Manage local knowledge items.
    Knowledge {
        #[command(subcommand)]
        action: KnowledgeAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum VersionsAction {
    /// List every version of a domain.
    List {
        #[arg(long)]
        domain: String,
    },
    /// Show one version (the active one by default).
    Show {
        #[arg(long)]
        domain: String,

        /// Version number.
        #[arg(long)]
        version: Option<u32>,

        /// Print the full version as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Diff two versions by ID.
    Compare {
        /// Older version ID.
        from: String,
        /// Newer version ID.
        to: String,
    },
    /// Create a new version carrying an earlier version's content.
    Rollback {
        #[arg(long)]
        domain: String,

        /// Version number to restore.
        #[arg(long)]
        to: u32,

        /// Why the rollback happened.
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
pub(crate) enum DomainAction {
    /// Register a domain.
    Add {
        name: String,

        #[arg(long, default_value = "local")]
        owner: String,

        #[arg(long)]
        description: Option<String>,
    },
    /// List registered domains.
    List,
}

#[derive(Subcommand)]
pub(crate) enum KnowledgeAction {
    /// Add a knowledge item to a domain.
    Add {
        #[arg(long)]
        domain: String,

        #[arg(long)]
        title: String,

        /// Item body.
        content: String,

        /// Comma-separated tags.
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "corelogic=info,corelogic_core=info,corelogic_storage=info",
        1 => "corelogic=debug,corelogic_core=debug,corelogic_storage=debug",
        _ => "corelogic=trace,corelogic_core=trace,corelogic_storage=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run => cmd_run().await,
        Command::Trigger { domain, priority } => cmd_trigger(&domain, priority).await,
        Command::Distill { domain } => cmd_distill(&domain).await,
        Command::Versions { action } => match action {
            VersionsAction::List { domain } => cmd_versions_list(&domain).await,
            VersionsAction::Show {
                domain,
                version,
                json,
            } => cmd_versions_show(&domain, version, json).await,
            VersionsAction::Compare { from, to } => cmd_versions_compare(&from, &to).await,
            VersionsAction::Rollback { domain, to, reason } => {
                cmd_versions_rollback(&domain, to, reason.as_deref()).await
            }
        },
        Command::Jobs { domain } => cmd_jobs(domain.as_deref()).await,
        Command::Domain { action } => match action {
            DomainAction::Add {
                name,
                owner,
                description,
            } => cmd_domain_add(&name, &owner, description).await,
            DomainAction::List => cmd_domain_list().await,
        },
        Command::Knowledge { action } => match action {
            KnowledgeAction::Add {
                domain,
                title,
                content,
                tags,
            } => cmd_knowledge_add(&domain, &title, &content, tags).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Load and validate config, then open the database read-write.
async fn open_store(config: &AppConfig) -> Result<Arc<Storage>> {
    config.validate()?;
    let path = config.db_path()?;
    info!(path = %path.display(), "opening database");
    Ok(Arc::new(Storage::open(&path).await?))
}

/// Open the configured database read-only for inspection commands.
async fn open_inspection_store(config: &AppConfig) -> Result<Arc<Storage>> {
    config.validate()?;
    open_readonly_at(&config.db_path()?).await
}

/// Never creates or migrates the database at `path`.
async fn open_readonly_at(path: &Path) -> Result<Arc<Storage>> {
    info!(path = %path.display(), "opening database read-only");
    match Storage::open_readonly(path).await {
        Ok(storage) => Ok(Arc::new(storage)),
        Err(e) if e.is_not_found() => Err(eyre!(
            "no database at {}; create a domain first with `corelogic domain add`",
            path.display()
        )),
        Err(e) => Err(e.into()),
    }
}

/// Build a worker backed by the configured distillation provider.
fn build_worker(config: &AppConfig, store: Arc<dyn Store>) -> Result<Worker> {
    let api_key = validate_api_key(config)?;
    let distiller = Arc::new(OpenAiDistiller::new(&config.provider, api_key)?);
    Ok(Worker::new(
        store,
        distiller,
        WorkerSettings::from(&config.worker),
    )?)
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    Ok(spinner)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

async fn cmd_run() -> Result<()> {
    let config = load_config()?;
    let store: Arc<dyn Store> = open_store(&config).await?;
    let worker = Arc::new(build_worker(&config, store.clone())?);
    let scheduler = Arc::new(Scheduler::new(store, &config.distillation));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = spawn_scheduler_loop(scheduler, shutdown_rx.clone());
    let worker_task = spawn_worker_loop(worker, shutdown_rx);

    info!(
        max_concurrent_jobs = config.worker.max_concurrent_jobs,
        poll_interval_ms = config.worker.poll_interval_ms,
        check_interval_secs = config.distillation.check_interval_secs,
        "core logic engine running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, waiting for in-flight jobs");
    shutdown_tx.send(true)?;

    let (scheduler_done, worker_done) = tokio::join!(scheduler_task, worker_task);
    scheduler_done?;
    worker_done?;
    Ok(())
}

async fn cmd_trigger(domain_id: &str, priority: Option<i32>) -> Result<()> {
    let config = load_config()?;
    let store = open_store(&config).await?;
    let priority = priority.unwrap_or(config.distillation.default_priority);

    let job = JobQueue::new(store)
        .enqueue(domain_id, priority, TriggeredBy::Manual, serde_json::json!({}))
        .await?;

    println!("Queued job {} (priority {})", job.id, job.priority);
    Ok(())
}

async fn cmd_distill(domain_id: &str) -> Result<()> {
    let config = load_config()?;
    let store = open_store(&config).await?;
    let worker = build_worker(&config, store.clone())?;

    let job = JobQueue::new(store.clone())
        .enqueue(
            domain_id,
            config.distillation.default_priority,
            TriggeredBy::Manual,
            serde_json::json!({}),
        )
        .await?;

    let progress = spinner(&format!("Distilling domain {domain_id}"))?;
    let processed = worker.run_until_idle().await;
    progress.finish_and_clear();
    processed?;

    let job = store
        .get_job(&job.id)
        .await?
        .ok_or_else(|| eyre!("job {} disappeared", job.id))?;

    match job.status {
        JobStatus::Completed => {
            let result = job
                .result
                .ok_or_else(|| eyre!("completed job {} has no result", job.id))?;
            println!();
            println!("  Distillation complete!");
            println!("  Version: {}", result.version);
            println!("  ID:      {}", result.version_id);
            println!("  Items:   {}", result.knowledge_items_processed);
            println!("  Tokens:  {}", result.tokens_used);
            println!();
            Ok(())
        }
        JobStatus::Failed => Err(eyre!(
            "distillation failed: {}",
            job.error.unwrap_or_default()
        )),
        other => Err(eyre!("job {} is still {other}", job.id)),
    }
}

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

async fn cmd_versions_list(domain_id: &str) -> Result<()> {
    let config = load_config()?;
    let versions = VersionChainManager::new(open_inspection_store(&config).await?)
        .list_versions(domain_id)
        .await?;

    if versions.is_empty() {
        println!("No versions yet for domain {domain_id}.");
        return Ok(());
    }
    for v in &versions {
        println!("{}", version_line(v));
    }
    Ok(())
}

fn version_line(v: &CoreLogicVersion) -> String {
    let marker = if v.is_active { "*" } else { " " };
    format!(
        "{marker} v{:<4} {}  {}  {}",
        v.version,
        v.created_at.format("%Y-%m-%d %H:%M:%S"),
        v.id,
        v.change_summary.as_deref().unwrap_or("-"),
    )
}

async fn cmd_versions_show(domain_id: &str, version: Option<u32>, json: bool) -> Result<()> {
    let config = load_config()?;
    let v = VersionChainManager::new(open_inspection_store(&config).await?)
        .get_version(domain_id, version)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&v)?);
        return Ok(());
    }

    println!("{}", version_line(&v));
    println!("  hash: {}", v.content_hash);
    println!(
        "  first principles: {}, mental models: {}, decision rules: {}, anti-patterns: {}, links: {}",
        v.content.first_principles.len(),
        v.content.mental_models.len(),
        v.content.decision_rules.len(),
        v.content.anti_patterns.len(),
        v.content.cross_domain_links.len(),
    );
    println!("  changelog:");
    for entry in &v.changelog {
        println!("    {}", changelog_line(entry));
    }
    Ok(())
}

fn changelog_line(entry: &ChangelogEntry) -> String {
    match entry {
        ChangelogEntry::Initial {
            version, summary, ..
        } => format!("v{version} initial: {summary}"),
        ChangelogEntry::Update {
            version, changes, ..
        } => format!(
            "v{version} update: principles {:+}, models {:+}, rules {:+}, anti-patterns {:+}",
            changes.first_principles.added,
            changes.mental_models.added,
            changes.decision_rules.added,
            changes.anti_patterns.added,
        ),
        ChangelogEntry::Rollback {
            version,
            from_version,
            to_version,
            reason,
            ..
        } => format!(
            "v{version} rollback: v{from_version} -> content of v{to_version}{}",
            reason
                .as_deref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default()
        ),
    }
}

async fn cmd_versions_compare(from: &str, to: &str) -> Result<()> {
    let config = load_config()?;
    let diff = VersionChainManager::new(open_inspection_store(&config).await?)
        .compare(from, to)
        .await?;

    println!("v{} -> v{}", diff.from_version, diff.to_version);
    if diff.identical {
        println!("  content identical");
    }
    for c in &diff.categories {
        println!(
            "  {:<20} {:>3} -> {:<3} ({:+}, {} added, {} removed)",
            c.category.as_str(),
            c.from_count,
            c.to_count,
            c.delta,
            c.added.len(),
            c.removed.len(),
        );
    }
    Ok(())
}

async fn cmd_versions_rollback(domain_id: &str, target: u32, reason: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let v = VersionChainManager::new(open_store(&config).await?)
        .rollback(domain_id, target, reason)
        .await?;

    println!("Rolled back to the content of v{target}; new active version is v{}", v.version);
    Ok(())
}

// ---------------------------------------------------------------------------
// Jobs, domains, knowledge
// ---------------------------------------------------------------------------

async fn cmd_jobs(domain_id: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let jobs = JobQueue::new(open_inspection_store(&config).await?)
        .list(domain_id)
        .await?;

    if jobs.is_empty() {
        println!("No jobs.");
    }
    for job in &jobs {
        println!("{}", job_line(job));
    }
    Ok(())
}

fn job_line(job: &DistillationJob) -> String {
    let detail = match (&job.result, &job.error) {
        (Some(result), _) => format!("-> v{}", result.version),
        (None, Some(error)) => error.clone(),
        (None, None) => String::new(),
    };
    format!(
        "{}  {:<9} p{:<3} {:<9} {}  {}",
        job.id,
        job.status.as_str(),
        job.priority,
        job.triggered_by.as_str(),
        job.created_at.format("%Y-%m-%d %H:%M:%S"),
        detail,
    )
}

async fn cmd_domain_add(name: &str, owner: &str, description: Option<String>) -> Result<()> {
    let config = load_config()?;
    let storage = open_store(&config).await?;
    let domain = Domain {
        id: new_id(),
        owner: owner.to_string(),
        name: name.to_string(),
        description,
        created_at: chrono::Utc::now(),
    };
    storage.insert_domain(&domain).await?;
    println!("Created domain {} ({})", domain.name, domain.id);
    Ok(())
}

async fn cmd_domain_list() -> Result<()> {
    let config = load_config()?;
    let storage = open_inspection_store(&config).await?;
    for domain in storage.list_domains().await? {
        let items = storage.count_knowledge_items(&domain.id).await?;
        let active = storage
            .get_active_version(&domain.id)
            .await?
            .map(|v| format!("v{}", v.version))
            .unwrap_or_else(|| "-".into());
        println!("{}  {:<24} items={items:<5} active={active}", domain.id, domain.name);
    }
    Ok(())
}

async fn cmd_knowledge_add(
    domain_id: &str,
    title: &str,
    content: &str,
    tags: Vec<String>,
) -> Result<()> {
    let config = load_config()?;
    let storage = open_store(&config).await?;
    let domain = storage
        .get_domain(domain_id)
        .await?
        .ok_or_else(|| eyre!("domain '{domain_id}' not found"))?;

    let item = KnowledgeItem {
        id: new_id(),
        domain_id: domain.id.clone(),
        owner: domain.owner.clone(),
        title: title.to_string(),
        content: content.to_string(),
        tags,
        created_at: chrono::Utc::now(),
    };
    storage.insert_knowledge_item(&item).await?;
    println!("Added knowledge item {} to {}", item.id, domain.name);
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
