//! Persistence for crawled records.
//!
//! - [`IdentityStore`]: the contract the crawl engine writes through
//! - [`Storage`]: durable libSQL (Turso embedded) implementation
//! - [`MemoryStore`]: in-process reference implementation
//!
//! **Access rules:**
//! - `hackcrawl crawl`: read-write via [`Storage::open`]
//! - `hackcrawl status` / `export`: read-only via [`Storage::open_readonly`]

mod identity;
mod memory;
mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use uuid::Uuid;

use hackcrawl_shared::{
    Categories, ChildRecord, FailureRecord, HackCrawlError, ParentRecord, RecordId, RecordKind,
    RecordState, Result, UpsertOutcome,
};

pub use identity::IdentityStore;
pub use memory::{MemoryStore, StoreEvent};

const PARENT_COLUMNS: &str = "id, external_id, slug, org_id, org_name, org_slug, categories_json, \
     name, description, url, state, children_listed, created_at, updated_at";

const CHILD_COLUMNS: &str =
    "id, external_id, parent_id, title, description, url, tags_json, state, created_at, updated_at";

const FAILURE_COLUMNS: &str = "kind, external_id, parent_id, attempts, last_error, updated_at";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HackCrawlError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(HackCrawlError::storage)?;

        let conn = db.connect().map_err(HackCrawlError::storage)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.enable_foreign_keys().await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` for reads only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(HackCrawlError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "database does not exist"),
            ));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(HackCrawlError::storage)?;

        let conn = db.connect().map_err(HackCrawlError::storage)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    async fn enable_foreign_keys(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .await
            .map_err(HackCrawlError::storage)?;
        Ok(())
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
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    HackCrawlError::Storage(format!(
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
            return Err(HackCrawlError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Compare-and-set `state` to `to` if the stored state is its predecessor.
    async fn advance_state(
        &self,
        table: &str,
        kind: RecordKind,
        id: &RecordId,
        to: RecordState,
    ) -> Result<()> {
        self.check_writable()?;
        let id_str = id.to_string();

        if let Some(from) = to.previous() {
            let now = Utc::now().to_rfc3339();
            let changed = self
                .conn
                .execute(
                    &format!(
                        "UPDATE {table} SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4"
                    ),
                    params![to.as_str(), now.as_str(), id_str.as_str(), from.as_str()],
                )
                .await
                .map_err(sql_err)?;
            if changed == 1 {
                return Ok(());
            }
        }

        let mut rows = self
            .conn
            .query(
                &format!("SELECT external_id, state FROM {table} WHERE id = ?1"),
                params![id_str.as_str()],
            )
            .await
            .map_err(sql_err)?;

        match rows.next().await.map_err(sql_err)? {
            Some(row) => Err(HackCrawlError::InvalidTransition {
                kind,
                id: get_string(&row, 0)?,
                from: parse_state(&get_string(&row, 1)?)?,
                to,
            }),
            None => Err(HackCrawlError::NotFound { kind, id: id_str }),
        }
    }

    async fn query_one_parent(&self, column: &str, value: &str) -> Result<Option<ParentRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {PARENT_COLUMNS} FROM parents WHERE {column} = ?1"),
                params![value],
            )
            .await
            .map_err(sql_err)?;

        match rows.next().await.map_err(sql_err)? {
            Some(row) => Ok(Some(row_to_parent(&row)?)),
            None => Ok(None),
        }
    }

    async fn count_table_by_state(&self, table: &str) -> Result<Vec<(RecordState, u64)>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT state, COUNT(*) FROM {table} GROUP BY state"),
                params![],
            )
            .await
            .map_err(sql_err)?;

        let mut counts: Vec<(RecordState, u64)> =
            RecordState::ALL.iter().map(|s| (*s, 0)).collect();
        while let Some(row) = rows.next().await.map_err(sql_err)? {
            let state = parse_state(&get_string(&row, 0)?)?;
            let n = row.get::<i64>(1).map_err(sql_err)?;
            if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == state) {
                slot.1 = n as u64;
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl IdentityStore for Storage {
    // -----------------------------------------------------------------------
    // Parent operations
    // -----------------------------------------------------------------------

    async fn get_parent(&self, external_id: &str) -> Result<Option<ParentRecord>> {
        self.query_one_parent("external_id", external_id).await
    }

    async fn get_parent_by_slug(&self, slug: &str) -> Result<Option<ParentRecord>> {
        self.query_one_parent("slug", slug).await
    }

    /// Upsert a parent (insert or merge on conflict by `external_id`).
    async fn upsert_parent(&self, record: &ParentRecord) -> Result<(ParentRecord, UpsertOutcome)> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let categories_json = serde_json::to_string(&record.categories.0)
            .map_err(|e| HackCrawlError::validation(format!("categories: {e}")))?;

        let mut rows = self
            .conn
            .query(
                "INSERT INTO parents (id, external_id, slug, org_id, org_name, org_slug, categories_json,
                                      name, description, url, state, children_listed, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(external_id) DO UPDATE SET
                   slug = COALESCE(parents.slug, excluded.slug),
                   org_id = excluded.org_id,
                   org_name = excluded.org_name,
                   org_slug = excluded.org_slug,
                   categories_json = excluded.categories_json,
                   name = excluded.name,
                   description = excluded.description,
                   url = excluded.url,
                   children_listed = excluded.children_listed,
                   updated_at = excluded.updated_at
                 RETURNING created_at",
                params![
                    record.id.to_string(),
                    record.external_id.as_str(),
                    record.slug.as_deref(),
                    record.org_id.as_str(),
                    record.org_name.as_str(),
                    record.org_slug.as_str(),
                    categories_json,
                    record.name.as_str(),
                    record.description.as_str(),
                    record.url.as_str(),
                    record.state.as_str(),
                    i64::from(record.children_listed),
                    now.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(sql_err)?;
        let outcome = upsert_outcome(&mut rows, &now).await?;
        drop(rows);

        let stored = self
            .get_parent(&record.external_id)
            .await?
            .ok_or_else(|| HackCrawlError::NotFound {
                kind: RecordKind::Parent,
                id: record.external_id.clone(),
            })?;
        Ok((stored, outcome))
    }

    async fn set_parent_state(&self, id: &RecordId, to: RecordState) -> Result<()> {
        self.advance_state("parents", RecordKind::Parent, id, to).await
    }

    async fn list_parents(&self, state: RecordState) -> Result<Vec<ParentRecord>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {PARENT_COLUMNS} FROM parents WHERE state = ?1 ORDER BY external_id"
                ),
                params![state.as_str()],
            )
            .await
            .map_err(sql_err)?;
        collect_rows(rows, row_to_parent).await
    }

    // -----------------------------------------------------------------------
    // Child operations
    // -----------------------------------------------------------------------

    async fn get_child(&self, external_id: &str) -> Result<Option<ChildRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {CHILD_COLUMNS} FROM children WHERE external_id = ?1"),
                params![external_id],
            )
            .await
            .map_err(sql_err)?;

        match rows.next().await.map_err(sql_err)? {
            Some(row) => Ok(Some(row_to_child(&row)?)),
            None => Ok(None),
        }
    }

    /// Upsert a child (insert or merge on conflict by `external_id`).
    async fn upsert_child(&self, record: &ChildRecord) -> Result<(ChildRecord, UpsertOutcome)> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let tags_json = serde_json::to_string(&record.tags)
            .map_err(|e| HackCrawlError::validation(format!("tags: {e}")))?;

        let mut rows = self
            .conn
            .query(
                "INSERT INTO children (id, external_id, parent_id, title, description, url, tags_json,
                                       state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(external_id) DO UPDATE SET
                   parent_id = excluded.parent_id,
                   title = excluded.title,
                   description = excluded.description,
                   url = excluded.url,
                   tags_json = excluded.tags_json,
                   updated_at = excluded.updated_at
                 RETURNING created_at",
                params![
                    record.id.to_string(),
                    record.external_id.as_str(),
                    record.parent_id.to_string(),
                    record.title.as_str(),
                    record.description.as_str(),
                    record.url.as_str(),
                    tags_json,
                    record.state.as_str(),
                    now.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(sql_err)?;
        let outcome = upsert_outcome(&mut rows, &now).await?;
        drop(rows);

        let stored = self
            .get_child(&record.external_id)
            .await?
            .ok_or_else(|| HackCrawlError::NotFound {
                kind: RecordKind::Child,
                id: record.external_id.clone(),
            })?;
        Ok((stored, outcome))
    }

    async fn set_child_state(&self, id: &RecordId, to: RecordState) -> Result<()> {
        self.advance_state("children", RecordKind::Child, id, to).await
    }

    async fn list_children_of(&self, parent_id: &RecordId) -> Result<Vec<ChildRecord>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CHILD_COLUMNS} FROM children WHERE parent_id = ?1 ORDER BY external_id"
                ),
                params![parent_id.to_string()],
            )
            .await
            .map_err(sql_err)?;
        collect_rows(rows, row_to_child).await
    }

    async fn delete_children_of(&self, parent_id: &RecordId) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM children WHERE parent_id = ?1",
                params![parent_id.to_string()],
            )
            .await
            .map_err(sql_err)
    }

    async fn delete_unfinished_children_of(&self, parent_id: &RecordId) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM children WHERE parent_id = ?1 AND state != ?2",
                params![parent_id.to_string(), RecordState::Processed.as_str()],
            )
            .await
            .map_err(sql_err)
    }

    // -----------------------------------------------------------------------
    // Failure ledger
    // -----------------------------------------------------------------------

    async fn record_failure(
        &self,
        kind: RecordKind,
        external_id: &str,
        parent_id: Option<&RecordId>,
        error: &str,
    ) -> Result<FailureRecord> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO failures (kind, external_id, parent_id, attempts, last_error, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5)
                 ON CONFLICT(kind, external_id) DO UPDATE SET
                   attempts = failures.attempts + 1,
                   parent_id = COALESCE(excluded.parent_id, failures.parent_id),
                   last_error = excluded.last_error,
                   updated_at = excluded.updated_at",
                params![
                    kind.as_str(),
                    external_id,
                    parent_id.map(|p| p.to_string()),
                    error,
                    now.as_str(),
                ],
            )
            .await
            .map_err(sql_err)?;

        self.get_failure(kind, external_id)
            .await?
            .ok_or_else(|| HackCrawlError::NotFound {
                kind,
                id: external_id.to_string(),
            })
    }

    async fn get_failure(
        &self,
        kind: RecordKind,
        external_id: &str,
    ) -> Result<Option<FailureRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {FAILURE_COLUMNS} FROM failures WHERE kind = ?1 AND external_id = ?2"
                ),
                params![kind.as_str(), external_id],
            )
            .await
            .map_err(sql_err)?;

        match rows.next().await.map_err(sql_err)? {
            Some(row) => Ok(Some(row_to_failure(&row)?)),
            None => Ok(None),
        }
    }

    async fn clear_failure(&self, kind: RecordKind, external_id: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM failures WHERE kind = ?1 AND external_id = ?2",
                params![kind.as_str(), external_id],
            )
            .await
            .map_err(sql_err)?;
        Ok(())
    }

    async fn list_failures(&self) -> Result<Vec<FailureRecord>> {
        let rows = self
            .conn
            .query(
                &format!("SELECT {FAILURE_COLUMNS} FROM failures ORDER BY kind, external_id"),
                params![],
            )
            .await
            .map_err(sql_err)?;
        collect_rows(rows, row_to_failure).await
    }

    // -----------------------------------------------------------------------
    // Crawl run bookkeeping
    // -----------------------------------------------------------------------

    async fn count_by_state(&self, kind: RecordKind) -> Result<Vec<(RecordState, u64)>> {
        match kind {
            RecordKind::Parent => self.count_table_by_state("parents").await,
            RecordKind::Child => self.count_table_by_state("children").await,
        }
    }

    /// Insert a new crawl run. Returns the generated run ID.
    async fn begin_run(&self, phase: &str) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO crawl_runs (id, phase, started_at) VALUES (?1, ?2, ?3)",
                params![id.as_str(), phase, now.as_str()],
            )
            .await
            .map_err(sql_err)?;
        Ok(id)
    }

    /// Update a crawl run with completion data.
    async fn finish_run(&self, run_id: &str, stats_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE crawl_runs SET finished_at = ?1, stats_json = ?2 WHERE id = ?3",
                params![now.as_str(), stats_json, run_id],
            )
            .await
            .map_err(sql_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Constraint violations are per-record conflicts; anything else is a store failure.
fn sql_err(e: libsql::Error) -> HackCrawlError {
    let msg = e.to_string();
    if msg.contains("constraint failed") {
        HackCrawlError::conflict(msg)
    } else {
        HackCrawlError::storage(msg)
    }
}

async fn collect_rows<T>(
    mut rows: libsql::Rows,
    map: fn(&libsql::Row) -> Result<T>,
) -> Result<Vec<T>> {
    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(sql_err)? {
        results.push(map(&row)?);
    }
    Ok(results)
}

/// Classify an upsert from its `RETURNING created_at` row. A conflicting
/// update keeps the stored `created_at`, so only a fresh insert carries `stamp`.
async fn upsert_outcome(rows: &mut libsql::Rows, stamp: &str) -> Result<UpsertOutcome> {
    let row = rows
        .next()
        .await
        .map_err(sql_err)?
        .ok_or_else(|| HackCrawlError::storage("upsert returned no row"))?;
    if get_string(&row, 0)? == stamp {
        Ok(UpsertOutcome::Created)
    } else {
        Ok(UpsertOutcome::Updated)
    }
}

fn get_string(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(sql_err)
}

fn get_id(row: &libsql::Row, idx: i32) -> Result<RecordId> {
    let raw = get_string(row, idx)?;
    raw.parse()
        .map_err(|e| HackCrawlError::storage(format!("invalid record id '{raw}': {e}")))
}

fn get_time(row: &libsql::Row, idx: i32) -> Result<DateTime<Utc>> {
    let s = get_string(row, idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HackCrawlError::storage(format!("invalid date: {e}")))
}

fn parse_state(raw: &str) -> Result<RecordState> {
    raw.parse().map_err(HackCrawlError::storage)
}

/// Convert a database row to a [`ParentRecord`].
fn row_to_parent(row: &libsql::Row) -> Result<ParentRecord> {
    let categories: Vec<String> = serde_json::from_str(&get_string(row, 6)?)
        .map_err(|e| HackCrawlError::storage(format!("invalid categories_json: {e}")))?;

    Ok(ParentRecord {
        id: get_id(row, 0)?,
        external_id: get_string(row, 1)?,
        slug: row.get::<String>(2).ok(),
        org_id: get_string(row, 3)?,
        org_name: get_string(row, 4)?,
        org_slug: get_string(row, 5)?,
        categories: Categories(categories),
        name: get_string(row, 7)?,
        description: get_string(row, 8)?,
        url: get_string(row, 9)?,
        state: parse_state(&get_string(row, 10)?)?,
        children_listed: row.get::<i64>(11).map_err(sql_err)? != 0,
        created_at: get_time(row, 12)?,
        updated_at: get_time(row, 13)?,
    })
}

/// Convert a database row to a [`ChildRecord`].
fn row_to_child(row: &libsql::Row) -> Result<ChildRecord> {
    let tags = serde_json::from_str(&get_string(row, 6)?)
        .map_err(|e| HackCrawlError::storage(format!("invalid tags_json: {e}")))?;

    Ok(ChildRecord {
        id: get_id(row, 0)?,
        external_id: get_string(row, 1)?,
        parent_id: get_id(row, 2)?,
        title: get_string(row, 3)?,
        description: get_string(row, 4)?,
        url: get_string(row, 5)?,
        tags,
        state: parse_state(&get_string(row, 7)?)?,
        created_at: get_time(row, 8)?,
        updated_at: get_time(row, 9)?,
    })
}

/// Convert a database row to a [`FailureRecord`].
fn row_to_failure(row: &libsql::Row) -> Result<FailureRecord> {
    let kind: RecordKind = get_string(row, 0)?
        .parse()
        .map_err(HackCrawlError::storage)?;
    let parent_id = match row.get::<String>(2).ok() {
        Some(raw) => Some(
            raw.parse()
                .map_err(|e| HackCrawlError::storage(format!("invalid parent id '{raw}': {e}")))?,
        ),
        None => None,
    };

    Ok(FailureRecord {
        kind,
        external_id: get_string(row, 1)?,
        parent_id,
        attempts: row.get::<i64>(3).map_err(sql_err)? as u32,
        last_error: get_string(row, 4)?,
        updated_at: get_time(row, 5)?,
    })
}
