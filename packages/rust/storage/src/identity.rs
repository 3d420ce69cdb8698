//! The [`IdentityStore`] contract shared by every persistence backend.

use async_trait::async_trait;

use hackcrawl_shared::{
    ChildRecord, FailureRecord, ParentRecord, RecordId, RecordKind, RecordState, Result,
    UpsertOutcome,
};

/// Durable key-value store keyed by external identity.
///
/// Implementations must guarantee:
/// - `upsert_*` is atomic per `external_id`: concurrent calls never produce two
///   rows. Non-key fields are last-write-wins; `id`, `external_id`,
///   `created_at` and an assigned parent `slug` never change, and `state` is
///   left untouched on conflict.
/// - `set_*_state` only accepts the next linear step from the stored state and
///   returns [`HackCrawlError::InvalidTransition`] otherwise.
///
/// [`HackCrawlError::InvalidTransition`]: hackcrawl_shared::HackCrawlError::InvalidTransition
#[async_trait]
pub trait IdentityStore: Send + Sync {
    // --- parents ---

    async fn get_parent(&self, external_id: &str) -> Result<Option<ParentRecord>>;

    async fn get_parent_by_slug(&self, slug: &str) -> Result<Option<ParentRecord>>;

    /// Insert-or-merge by `external_id`. Returns the stored row.
    async fn upsert_parent(&self, record: &ParentRecord) -> Result<(ParentRecord, UpsertOutcome)>;

    async fn set_parent_state(&self, id: &RecordId, to: RecordState) -> Result<()>;

    /// Parents currently in `state`, ordered by `external_id`.
    async fn list_parents(&self, state: RecordState) -> Result<Vec<ParentRecord>>;

    // --- children ---

    async fn get_child(&self, external_id: &str) -> Result<Option<ChildRecord>>;

    /// Insert-or-merge by (globally unique) `external_id`. Returns the stored row.
    async fn upsert_child(&self, record: &ChildRecord) -> Result<(ChildRecord, UpsertOutcome)>;

    async fn set_child_state(&self, id: &RecordId, to: RecordState) -> Result<()>;

    /// Children owned by `parent_id`, ordered by `external_id`.
    async fn list_children_of(&self, parent_id: &RecordId) -> Result<Vec<ChildRecord>>;

    /// Remove every child of `parent_id`. Returns the number removed.
    async fn delete_children_of(&self, parent_id: &RecordId) -> Result<u64>;

    /// Remove the children of `parent_id` that have not reached `Processed`.
    async fn delete_unfinished_children_of(&self, parent_id: &RecordId) -> Result<u64>;

    // --- failure ledger ---

    /// Count one more failed run for this record and return the ledger row.
    async fn record_failure(
        &self,
        kind: RecordKind,
        external_id: &str,
        parent_id: Option<&RecordId>,
        error: &str,
    ) -> Result<FailureRecord>;

    async fn get_failure(&self, kind: RecordKind, external_id: &str)
    -> Result<Option<FailureRecord>>;

    async fn clear_failure(&self, kind: RecordKind, external_id: &str) -> Result<()>;

    async fn list_failures(&self) -> Result<Vec<FailureRecord>>;

    // --- bookkeeping ---

    /// Row count per state for one record kind, in lifecycle order.
    async fn count_by_state(&self, kind: RecordKind) -> Result<Vec<(RecordState, u64)>>;

    /// Record the start of a crawl run. Returns the run id.
    async fn begin_run(&self, phase: &str) -> Result<String>;

    /// Record completion stats for a crawl run.
    async fn finish_run(&self, run_id: &str, stats_json: &str) -> Result<()>;
}
