//! Shared types, error model, and configuration for the core logic engine.
//!
//! This crate is the foundation depended on by all other workspace crates.
//! It provides:
//! - [`CoreLogicError`], the unified error type
//! - Domain types ([`Domain`], [`KnowledgeItem`], [`CoreLogicVersion`], [`DistillationJob`])
//! - Configuration ([`AppConfig`], config loading, env overrides)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DistillationConfig, ProviderConfig, StorageConfig, WorkerConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{CoreLogicError, Result};
pub use types::{
    CategoryDelta, ChangeCounts, ChangelogEntry, ContentCategory, CoreLogicContent,
    CoreLogicVersion, DistillationJob, Domain, JobResultSummary, JobStatus, KnowledgeItem,
    TriggeredBy, format_timestamp, new_id, parse_timestamp,
};
