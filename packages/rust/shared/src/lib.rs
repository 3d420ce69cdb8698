//! Shared types, error model, configuration and text normalization for hackcrawl.
//!
//! This crate is the foundation depended on by all other hackcrawl crates.
//! It provides:
//! - [`HackCrawlError`]: the unified error type
//! - Domain types ([`ParentRecord`], [`ChildRecord`], [`RecordState`], source summaries)
//! - Configuration ([`AppConfig`], [`CrawlConfig`], [`RetryPolicy`], config loading)
//! - [`text::normalize`]: the free-text cleaner applied to every scraped field

pub mod config;
pub mod error;
pub mod text;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlConfig, CrawlPoliciesConfig, RetryConfig, RetryPolicy, SourceConfig,
    StorageConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    resolve_db_path, session_cookie, validate_source,
};
pub use error::{HackCrawlError, Result};
pub use types::{
    Categories, ChildDetail, ChildRecord, ChildSummary, FailureRecord, OrgInfo, ParentDetail,
    ParentRecord, ParentSummary, RecordId, RecordKind, RecordState, UpsertOutcome,
};
