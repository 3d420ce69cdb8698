//! The paged-fetch contract the crawl engine consumes.

use async_trait::async_trait;

use hackcrawl_shared::{
    ChildDetail, ChildRecord, ChildSummary, ParentDetail, ParentRecord, ParentSummary, Result,
};

/// Read-only access to the upstream listing and detail pages.
///
/// Pages are zero-based. An empty page signals exhaustion; transport
/// failures and non-success statuses are returned as
/// [`HackCrawlError::Transient`] so the caller can retry the page instead of
/// treating it as the end of the listing. All returned text is raw.
///
/// [`HackCrawlError::Transient`]: hackcrawl_shared::HackCrawlError::Transient
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// One page of the parent listing.
    async fn list_parents(&self, page: u32) -> Result<Vec<ParentSummary>>;

    /// One page of the children listed under `parent_external_id`.
    async fn list_children(&self, parent_external_id: &str, page: u32)
    -> Result<Vec<ChildSummary>>;

    /// Overview text for a stored parent.
    async fn parent_detail(&self, parent: &ParentRecord) -> Result<ParentDetail>;

    /// Detail page content for a stored child.
    async fn child_detail(&self, child: &ChildRecord) -> Result<ChildDetail>;
}
