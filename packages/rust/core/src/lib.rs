//! Crawl orchestration for hackcrawl.
//!
//! This crate ties a [`SourceClient`](hackcrawl_crawler::SourceClient) and an
//! [`IdentityStore`](hackcrawl_storage::IdentityStore) together into resumable
//! crawl runs (see [`CrawlEngine::run`]).

pub mod engine;
pub mod retry;
pub mod summary;

#[cfg(test)]
mod fake;

pub use engine::{CrawlEngine, Phase};
pub use retry::with_retry;
pub use summary::{KindCounts, ProgressReporter, RecordOutcome, RunSummary, SilentProgress};
