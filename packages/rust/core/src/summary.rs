//! Run accounting and progress reporting.

use std::time::Duration;

use serde::Serialize;

use hackcrawl_shared::{RecordKind, UpsertOutcome};

use crate::engine::Phase;

/// Final disposition of one record within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordOutcome {
    Created,
    Updated,
    /// Already PROCESSED when seen; no network calls were made for it.
    Skipped,
    Failed,
}

impl From<UpsertOutcome> for RecordOutcome {
    fn from(outcome: UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Created => Self::Created,
            UpsertOutcome::Updated => Self::Updated,
        }
    }
}

/// Per-kind tally of record outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl KindCounts {
    pub fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Created => self.created += 1,
            RecordOutcome::Updated => self.updated += 1,
            RecordOutcome::Skipped => self.skipped += 1,
            RecordOutcome::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.created + self.updated + self.skipped + self.failed
    }
}

/// Summary of a completed (or cancelled, or aborted) crawl run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub phase: Phase,
    pub parents: KindCounts,
    pub children: KindCounts,
    /// Listing pages fetched successfully, empty ones included.
    pub pages_listed: u64,
    /// Listing pages whose retry budget was exhausted.
    pub pages_failed: u64,
    /// Why the run stopped early because of listing failures, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            parents: KindCounts::default(),
            children: KindCounts::default(),
            pages_listed: 0,
            pages_failed: 0,
            aborted: None,
            cancelled: false,
            elapsed: Duration::ZERO,
        }
    }

    pub fn counts_mut(&mut self, kind: RecordKind) -> &mut KindCounts {
        match kind {
            RecordKind::Parent => &mut self.parents,
            RecordKind::Child => &mut self.children,
        }
    }

    /// True when the run hit its listing-failure limit.
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }
}

/// Progress callback for reporting crawl status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after each listing page is fetched.
    fn page_listed(&self, page: u32, records: usize);
    /// Called once per record with its final outcome for this run.
    fn record_done(&self, kind: RecordKind, external_id: &str, outcome: RecordOutcome);
    /// Called when the run completes.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn page_listed(&self, _page: u32, _records: usize) {}
    fn record_done(&self, _kind: RecordKind, _external_id: &str, _outcome: RecordOutcome) {}
    fn done(&self, _summary: &RunSummary) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_tally_by_outcome() {
        let mut summary = RunSummary::new(Phase::Full);
        summary.counts_mut(RecordKind::Child).record(RecordOutcome::Created);
        summary.counts_mut(RecordKind::Child).record(RecordOutcome::Failed);
        summary.counts_mut(RecordKind::Parent).record(RecordOutcome::Skipped);

        assert_eq!(summary.children.created, 1);
        assert_eq!(summary.children.failed, 1);
        assert_eq!(summary.children.total(), 2);
        assert_eq!(summary.parents.skipped, 1);
        assert!(!summary.is_aborted());
    }

    #[test]
    fn summary_serializes_for_run_log() {
        let mut summary = RunSummary::new(Phase::DetailChildren);
        summary.pages_listed = 4;
        let json = serde_json::to_value(&summary).expect("serialize");
        assert_eq!(json["phase"], "detail-children");
        assert_eq!(json["pages_listed"], 4);
        assert!(json.get("aborted").is_none());
    }
}
