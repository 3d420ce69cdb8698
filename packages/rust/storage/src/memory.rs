//! In-memory [`IdentityStore`] used as the reference implementation and in tests.
//!
//! A single async mutex guards all tables, so every operation is atomic.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use hackcrawl_shared::{
    ChildRecord, FailureRecord, HackCrawlError, ParentRecord, RecordId, RecordKind, RecordState,
    Result, UpsertOutcome,
};

use crate::identity::IdentityStore;

/// A write observed by a journaling [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    ParentUpserted { external_id: String, outcome: UpsertOutcome },
    ParentState { external_id: String, to: RecordState },
    ChildUpserted { external_id: String, outcome: UpsertOutcome },
    ChildState { external_id: String, to: RecordState },
    ChildrenDeleted { parent_external_id: String, count: u64 },
}

#[derive(Default)]
struct Tables {
    /// Keyed by `external_id`.
    parents: BTreeMap<String, ParentRecord>,
    /// Keyed by `external_id`.
    children: BTreeMap<String, ChildRecord>,
    failures: HashMap<(RecordKind, String), FailureRecord>,
    runs: Vec<(String, String, Option<String>)>,
    journal: Option<Vec<StoreEvent>>,
}

impl Tables {
    fn parent_by_id(&self, id: &RecordId) -> Option<&ParentRecord> {
        self.parents.values().find(|p| &p.id == id)
    }

    fn log(&mut self, event: StoreEvent) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(event);
        }
    }
}

/// Process-local store. Contents are lost when dropped.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that records every write in order, for ordering assertions.
    pub fn with_journal() -> Self {
        Self {
            tables: Mutex::new(Tables {
                journal: Some(Vec::new()),
                ..Tables::default()
            }),
        }
    }

    /// Snapshot of the writes recorded so far (empty unless journaling).
    pub async fn journal(&self) -> Vec<StoreEvent> {
        self.tables.lock().await.journal.clone().unwrap_or_default()
    }

    /// Snapshot of every stored child.
    pub async fn all_children(&self) -> Vec<ChildRecord> {
        self.tables.lock().await.children.values().cloned().collect()
    }

    /// Recorded runs as `(run_id, phase, stats_json)`; stats are set on finish.
    pub async fn runs(&self) -> Vec<(String, String, Option<String>)> {
        self.tables.lock().await.runs.clone()
    }
}

fn check_transition(
    kind: RecordKind,
    external_id: &str,
    from: RecordState,
    to: RecordState,
) -> Result<()> {
    if from.can_advance_to(to) {
        Ok(())
    } else {
        Err(HackCrawlError::InvalidTransition {
            kind,
            id: external_id.to_string(),
            from,
            to,
        })
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn get_parent(&self, external_id: &str) -> Result<Option<ParentRecord>> {
        Ok(self.tables.lock().await.parents.get(external_id).cloned())
    }

    async fn get_parent_by_slug(&self, slug: &str) -> Result<Option<ParentRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .parents
            .values()
            .find(|p| p.slug.as_deref() == Some(slug))
            .cloned())
    }

    async fn upsert_parent(&self, record: &ParentRecord) -> Result<(ParentRecord, UpsertOutcome)> {
        let mut tables = self.tables.lock().await;

        if let Some(slug) = record.slug.as_deref() {
            let taken = tables
                .parents
                .values()
                .any(|p| p.slug.as_deref() == Some(slug) && p.external_id != record.external_id);
            if taken {
                return Err(HackCrawlError::conflict(format!(
                    "UNIQUE constraint failed: parents.slug ({slug})"
                )));
            }
        }

        let now = Utc::now();
        let (stored, outcome) = match tables.parents.get_mut(&record.external_id) {
            Some(existing) => {
                if existing.slug.is_none() {
                    existing.slug = record.slug.clone();
                }
                existing.org_id = record.org_id.clone();
                existing.org_name = record.org_name.clone();
                existing.org_slug = record.org_slug.clone();
                existing.categories = record.categories.clone();
                existing.name = record.name.clone();
                existing.description = record.description.clone();
                existing.url = record.url.clone();
                existing.children_listed = record.children_listed;
                existing.updated_at = now;
                (existing.clone(), UpsertOutcome::Updated)
            }
            None => {
                let mut fresh = record.clone();
                fresh.created_at = now;
                fresh.updated_at = now;
                tables
                    .parents
                    .insert(fresh.external_id.clone(), fresh.clone());
                (fresh, UpsertOutcome::Created)
            }
        };

        tables.log(StoreEvent::ParentUpserted {
            external_id: stored.external_id.clone(),
            outcome,
        });
        Ok((stored, outcome))
    }

    async fn set_parent_state(&self, id: &RecordId, to: RecordState) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let parent = tables
            .parents
            .values_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| HackCrawlError::NotFound {
                kind: RecordKind::Parent,
                id: id.to_string(),
            })?;

        check_transition(RecordKind::Parent, &parent.external_id, parent.state, to)?;
        parent.state = to;
        parent.updated_at = Utc::now();
        let external_id = parent.external_id.clone();
        tables.log(StoreEvent::ParentState { external_id, to });
        Ok(())
    }

    async fn list_parents(&self, state: RecordState) -> Result<Vec<ParentRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .parents
            .values()
            .filter(|p| p.state == state)
            .cloned()
            .collect())
    }

    async fn get_child(&self, external_id: &str) -> Result<Option<ChildRecord>> {
        Ok(self.tables.lock().await.children.get(external_id).cloned())
    }

    async fn upsert_child(&self, record: &ChildRecord) -> Result<(ChildRecord, UpsertOutcome)> {
        let mut tables = self.tables.lock().await;

        if tables.parent_by_id(&record.parent_id).is_none() {
            return Err(HackCrawlError::conflict(format!(
                "FOREIGN KEY constraint failed: child {} references missing parent {}",
                record.external_id, record.parent_id
            )));
        }

        let now = Utc::now();
        let (stored, outcome) = match tables.children.get_mut(&record.external_id) {
            Some(existing) => {
                existing.parent_id = record.parent_id.clone();
                existing.title = record.title.clone();
                existing.description = record.description.clone();
                existing.url = record.url.clone();
                existing.tags = record.tags.clone();
                existing.updated_at = now;
                (existing.clone(), UpsertOutcome::Updated)
            }
            None => {
                let mut fresh = record.clone();
                fresh.created_at = now;
                fresh.updated_at = now;
                tables
                    .children
                    .insert(fresh.external_id.clone(), fresh.clone());
                (fresh, UpsertOutcome::Created)
            }
        };

        tables.log(StoreEvent::ChildUpserted {
            external_id: stored.external_id.clone(),
            outcome,
        });
        Ok((stored, outcome))
    }

    async fn set_child_state(&self, id: &RecordId, to: RecordState) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let child = tables
            .children
            .values_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| HackCrawlError::NotFound {
                kind: RecordKind::Child,
                id: id.to_string(),
            })?;

        check_transition(RecordKind::Child, &child.external_id, child.state, to)?;
        child.state = to;
        child.updated_at = Utc::now();
        let external_id = child.external_id.clone();
        tables.log(StoreEvent::ChildState { external_id, to });
        Ok(())
    }

    async fn list_children_of(&self, parent_id: &RecordId) -> Result<Vec<ChildRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .children
            .values()
            .filter(|c| &c.parent_id == parent_id)
            .cloned()
            .collect())
    }

    async fn delete_children_of(&self, parent_id: &RecordId) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let before = tables.children.len();
        tables.children.retain(|_, c| &c.parent_id != parent_id);
        let count = (before - tables.children.len()) as u64;

        let parent_external_id = tables
            .parent_by_id(parent_id)
            .map(|p| p.external_id.clone())
            .unwrap_or_default();
        tables.log(StoreEvent::ChildrenDeleted {
            parent_external_id,
            count,
        });
        Ok(count)
    }

    async fn delete_unfinished_children_of(&self, parent_id: &RecordId) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let before = tables.children.len();
        tables
            .children
            .retain(|_, c| &c.parent_id != parent_id || c.state == RecordState::Processed);
        let count = (before - tables.children.len()) as u64;

        let parent_external_id = tables
            .parent_by_id(parent_id)
            .map(|p| p.external_id.clone())
            .unwrap_or_default();
        tables.log(StoreEvent::ChildrenDeleted {
            parent_external_id,
            count,
        });
        Ok(count)
    }

    async fn record_failure(
        &self,
        kind: RecordKind,
        external_id: &str,
        parent_id: Option<&RecordId>,
        error: &str,
    ) -> Result<FailureRecord> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let entry = tables
            .failures
            .entry((kind, external_id.to_string()))
            .and_modify(|f| {
                f.attempts += 1;
                f.last_error = error.to_string();
                f.updated_at = now;
                if let Some(pid) = parent_id {
                    f.parent_id = Some(pid.clone());
                }
            })
            .or_insert_with(|| FailureRecord {
                kind,
                external_id: external_id.to_string(),
                parent_id: parent_id.cloned(),
                attempts: 1,
                last_error: error.to_string(),
                updated_at: now,
            });
        Ok(entry.clone())
    }

    async fn get_failure(
        &self,
        kind: RecordKind,
        external_id: &str,
    ) -> Result<Option<FailureRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables.failures.get(&(kind, external_id.to_string())).cloned())
    }

    async fn clear_failure(&self, kind: RecordKind, external_id: &str) -> Result<()> {
        self.tables
            .lock()
            .await
            .failures
            .remove(&(kind, external_id.to_string()));
        Ok(())
    }

    async fn list_failures(&self) -> Result<Vec<FailureRecord>> {
        let tables = self.tables.lock().await;
        let mut failures: Vec<FailureRecord> = tables.failures.values().cloned().collect();
        failures.sort_by(|a, b| (a.kind.as_str(), &a.external_id).cmp(&(b.kind.as_str(), &b.external_id)));
        Ok(failures)
    }

    async fn count_by_state(&self, kind: RecordKind) -> Result<Vec<(RecordState, u64)>> {
        let tables = self.tables.lock().await;
        let states: Vec<RecordState> = match kind {
            RecordKind::Parent => tables.parents.values().map(|p| p.state).collect(),
            RecordKind::Child => tables.children.values().map(|c| c.state).collect(),
        };
        Ok(RecordState::ALL
            .iter()
            .map(|s| (*s, states.iter().filter(|x| *x == s).count() as u64))
            .collect())
    }

    async fn begin_run(&self, phase: &str) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        self.tables
            .lock()
            .await
            .runs
            .push((id.clone(), phase.to_string(), None));
        Ok(id)
    }

    async fn finish_run(&self, run_id: &str, stats_json: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let run = tables
            .runs
            .iter_mut()
            .find(|(id, _, _)| id == run_id)
            .ok_or_else(|| HackCrawlError::storage(format!("unknown run {run_id}")))?;
        run.2 = Some(stats_json.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_same_identity_keeps_one_row() {
        let store = MemoryStore::new();
        let mut parent = ParentRecord::new("h1");
        parent.name = "First".into();
        let (first, outcome) = store.upsert_parent(&parent).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Created);

        let mut again = ParentRecord::new("h1");
        again.name = "Second".into();
        let (second, outcome) = store.upsert_parent(&again).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(second.id, first.id, "internal id is immutable");
        assert_eq!(second.name, "Second");
        assert_eq!(store.count_by_state(RecordKind::Parent).await.unwrap()[0].1, 1);
    }

    #[tokio::test]
    async fn upsert_does_not_touch_state() {
        let store = MemoryStore::new();
        let (parent, _) = store.upsert_parent(&ParentRecord::new("h1")).await.unwrap();
        store
            .set_parent_state(&parent.id, RecordState::Detailed)
            .await
            .unwrap();

        store.upsert_parent(&ParentRecord::new("h1")).await.unwrap();
        let stored = store.get_parent("h1").await.unwrap().unwrap();
        assert_eq!(stored.state, RecordState::Detailed);
    }

    #[tokio::test]
    async fn rejects_non_linear_transition() {
        let store = MemoryStore::new();
        let (parent, _) = store.upsert_parent(&ParentRecord::new("h1")).await.unwrap();
        let err = store
            .set_parent_state(&parent.id, RecordState::Processed)
            .await
            .unwrap_err();
        assert!(matches!(err, HackCrawlError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn slug_is_unique_across_parents() {
        let store = MemoryStore::new();
        let mut a = ParentRecord::new("h1");
        a.slug = Some("shared".into());
        store.upsert_parent(&a).await.unwrap();

        let mut b = ParentRecord::new("h2");
        b.slug = Some("shared".into());
        let err = store.upsert_parent(&b).await.unwrap_err();
        assert!(matches!(err, HackCrawlError::Conflict(_)));
        assert!(store.get_parent_by_slug("shared").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn child_requires_parent() {
        let store = MemoryStore::new();
        let orphan = ChildRecord::new("p1", RecordId::new());
        assert!(store.upsert_child(&orphan).await.is_err());
    }

    #[tokio::test]
    async fn delete_unfinished_keeps_processed_children() {
        let store = MemoryStore::new();
        let (parent, _) = store.upsert_parent(&ParentRecord::new("h1")).await.unwrap();
        let (done, _) = store
            .upsert_child(&ChildRecord::new("p1", parent.id.clone()))
            .await
            .unwrap();
        store.upsert_child(&ChildRecord::new("p2", parent.id.clone())).await.unwrap();
        store.set_child_state(&done.id, RecordState::Detailed).await.unwrap();
        store.set_child_state(&done.id, RecordState::Processed).await.unwrap();

        let removed = store.delete_unfinished_children_of(&parent.id).await.unwrap();
        assert_eq!(removed, 1);
        let left = store.list_children_of(&parent.id).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].external_id, "p1");

        assert_eq!(store.delete_children_of(&parent.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failure_ledger_counts_attempts() {
        let store = MemoryStore::new();
        let first = store
            .record_failure(RecordKind::Child, "p1", None, "timeout")
            .await
            .unwrap();
        assert_eq!(first.attempts, 1);
        let second = store
            .record_failure(RecordKind::Child, "p1", None, "HTTP 502")
            .await
            .unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(second.last_error, "HTTP 502");

        store.clear_failure(RecordKind::Child, "p1").await.unwrap();
        assert!(store.get_failure(RecordKind::Child, "p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_upserts_never_duplicate() {
        let store = MemoryStore::new();
        let writers = (0..16).map(|i| {
            let mut parent = ParentRecord::new("h1");
            parent.name = format!("writer {i}");
            let store = &store;
            async move { store.upsert_parent(&parent).await.unwrap().1 }
        });
        let outcomes = futures::future::join_all(writers).await;

        let created = outcomes.iter().filter(|o| **o == UpsertOutcome::Created).count();
        assert_eq!(created, 1);
        let counts = store.count_by_state(RecordKind::Parent).await.unwrap();
        assert_eq!(counts.iter().map(|(_, n)| n).sum::<u64>(), 1);
        let stored = store.get_parent("h1").await.unwrap().unwrap();
        assert!(stored.name.starts_with("writer "));
    }
}
