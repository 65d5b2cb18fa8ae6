//! SQLite store backend.
//!
//! Uses rusqlite with WAL mode and a busy timeout. The schema migration list
//! is append-only: never edit existing entries, only add new ones. Several
//! processes may share one database file; conditional replace is a single
//! `UPDATE ... WHERE etag = ?` so concurrent writers serialize in SQLite.
//!
//! Blocking calls run on `tokio::task::spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params, params_from_iter};
use serde_json::Value;

use super::{
    BoxFuture, PartitionedStore, Query, QueryScope, SortOrder, StoreResult, StoredItem,
    check_key, check_scope, policy_conflict,
};
use crate::error::StoreError;
use crate::partition::{PartitionKey, PartitionPolicy};

struct Migration {
    version: u32,
    sql: &'static str,
}

/// Append-only migration list.
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: "
        CREATE TABLE containers (
            name       TEXT PRIMARY KEY,
            policy     TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE items (
            position      INTEGER PRIMARY KEY AUTOINCREMENT,
            container     TEXT    NOT NULL REFERENCES containers(name),
            partition_key TEXT    NOT NULL,
            id            TEXT    NOT NULL,
            body          TEXT    NOT NULL,
            etag          INTEGER NOT NULL,
            UNIQUE (container, partition_key, id)
        );

        CREATE INDEX idx_items_partition ON items(container, partition_key);
    ",
}];

/// Open (or create) the store database at `path`, enable WAL mode and foreign
/// keys, set the busy timeout and apply any pending migrations.
fn open_db(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "foreign_keys", "on")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_meta (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    apply_migrations(&conn)?;
    Ok(conn)
}

fn apply_migrations(conn: &Connection) -> rusqlite::Result<()> {
    let max_applied: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_meta",
        [],
        |row| row.get(0),
    )?;

    for m in MIGRATIONS {
        if m.version > max_applied {
            conn.execute_batch(m.sql)?;
            conn.execute("INSERT INTO schema_meta (version) VALUES (?1)", [m.version])?;
        }
    }
    Ok(())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn load_policy(conn: &Connection, container: &str) -> StoreResult<Option<PartitionPolicy>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT policy FROM containers WHERE name = ?1",
            [container],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|p| {
        p.parse().map_err(|details| StoreError::Corrupt {
            container: container.to_string(),
            details,
        })
    })
    .transpose()
}

fn decode_row(
    container: &str,
    encoded_key: String,
    id: String,
    body: String,
    etag: i64,
) -> StoreResult<StoredItem> {
    let partition_key = PartitionKey::decode(&encoded_key).ok_or_else(|| StoreError::Corrupt {
        container: container.to_string(),
        details: format!("item '{id}' has undecodable partition key {encoded_key}"),
    })?;
    let body = serde_json::from_str(&body).map_err(|e| StoreError::Corrupt {
        container: container.to_string(),
        details: format!("item '{id}' has undecodable body: {e}"),
    })?;
    Ok(StoredItem {
        id,
        partition_key,
        body,
        etag: etag.to_string(),
    })
}

fn encode_body(body: &Value) -> String {
    // Value serialization cannot fail
    body.to_string()
}

/// Bind a JSON filter value as the SQL value `json_extract` would produce.
fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

/// Connection handle shared by the async wrappers.
type Shared = Arc<Mutex<Connection>>;

/// SQLite-backed partitioned store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Shared,
    path: PathBuf,
}

impl SqliteStore {
    /// Open the database at `path`, creating it and its schema if needed.
    pub fn open(path: &Path, busy_timeout: Duration) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("{}: {e}", parent.display())))?;
        }
        let conn = open_db(path, busy_timeout)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("join error: {e}")))?
    }
}

impl PartitionedStore for SqliteStore {
    fn ensure_container<'a>(
        &'a self,
        container: &'a str,
        policy: PartitionPolicy,
    ) -> BoxFuture<'a, StoreResult<()>> {
        let name = container.to_string();
        Box::pin(self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO containers (name, policy) VALUES (?1, ?2)
                 ON CONFLICT(name) DO NOTHING",
                params![name, policy.as_str()],
            )?;
            match load_policy(conn, &name)? {
                Some(declared) if declared != policy => {
                    Err(policy_conflict(&name, declared, policy))
                }
                _ => Ok(()),
            }
        }))
    }

    fn container_policy<'a>(
        &'a self,
        container: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<PartitionPolicy>>> {
        let name = container.to_string();
        Box::pin(self.with_conn(move |conn| load_policy(conn, &name)))
    }

    fn create<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
        body: &'a Value,
    ) -> BoxFuture<'a, StoreResult<StoredItem>> {
        let (name, key, id, body) = (container.to_string(), key.clone(), id.to_string(), body.clone());
        Box::pin(self.with_conn(move |conn| {
            check_key(&name, load_policy(conn, &name)?, &key)?;
            let inserted = conn.execute(
                "INSERT INTO items (container, partition_key, id, body, etag)
                 VALUES (?1, ?2, ?3, ?4, 1)",
                params![name, key.encode(), id, encode_body(&body)],
            );
            match inserted {
                Ok(_) => Ok(StoredItem {
                    id,
                    partition_key: key,
                    body,
                    etag: "1".to_string(),
                }),
                Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict {
                    container: name,
                    id,
                }),
                Err(e) => Err(e.into()),
            }
        }))
    }

    fn read<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
    ) -> BoxFuture<'a, StoreResult<StoredItem>> {
        let (name, key, id) = (container.to_string(), key.clone(), id.to_string());
        Box::pin(self.with_conn(move |conn| {
            check_key(&name, load_policy(conn, &name)?, &key)?;
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT body, etag FROM items
                     WHERE container = ?1 AND partition_key = ?2 AND id = ?3",
                    params![name, key.encode(), id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                Some((body, etag)) => decode_row(&name, key.encode(), id, body, etag),
                None => Err(StoreError::NotFound {
                    container: name,
                    id,
                }),
            }
        }))
    }

    fn replace_if_match<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
        body: &'a Value,
        etag: &'a str,
    ) -> BoxFuture<'a, StoreResult<StoredItem>> {
        let (name, key, id, body) = (container.to_string(), key.clone(), id.to_string(), body.clone());
        // A token that is not one of ours can never match.
        let expected: i64 = etag.parse().unwrap_or(-1);
        Box::pin(self.with_conn(move |conn| {
            check_key(&name, load_policy(conn, &name)?, &key)?;
            let tx = conn.transaction()?;
            let new_etag: Option<i64> = tx
                .query_row(
                    "UPDATE items SET body = ?1, etag = etag + 1
                     WHERE container = ?2 AND partition_key = ?3 AND id = ?4 AND etag = ?5
                     RETURNING etag",
                    params![encode_body(&body), name, key.encode(), id, expected],
                    |row| row.get(0),
                )
                .optional()?;
            let outcome = match new_etag {
                Some(etag) => Ok(StoredItem {
                    id,
                    partition_key: key,
                    body,
                    etag: etag.to_string(),
                }),
                None => {
                    let exists: bool = tx.query_row(
                        "SELECT EXISTS(SELECT 1 FROM items
                         WHERE container = ?1 AND partition_key = ?2 AND id = ?3)",
                        params![name, key.encode(), id],
                        |row| row.get(0),
                    )?;
                    if exists {
                        Err(StoreError::PreconditionFailed {
                            container: name,
                            id,
                        })
                    } else {
                        Err(StoreError::NotFound {
                            container: name,
                            id,
                        })
                    }
                }
            };
            tx.commit()?;
            outcome
        }))
    }

    fn upsert<'a>(
        &'a self,
        container: &'a str,
        key: &'a PartitionKey,
        id: &'a str,
        body: &'a Value,
    ) -> BoxFuture<'a, StoreResult<StoredItem>> {
        let (name, key, id, body) = (container.to_string(), key.clone(), id.to_string(), body.clone());
        Box::pin(self.with_conn(move |conn| {
            check_key(&name, load_policy(conn, &name)?, &key)?;
            let etag: i64 = conn.query_row(
                "INSERT INTO items (container, partition_key, id, body, etag)
                 VALUES (?1, ?2, ?3, ?4, 1)
                 ON CONFLICT(container, partition_key, id)
                 DO UPDATE SET body = excluded.body, etag = items.etag + 1
                 RETURNING etag",
                params![name, key.encode(), id, encode_body(&body)],
                |row| row.get(0),
            )?;
            Ok(StoredItem {
                id,
                partition_key: key,
                body,
                etag: etag.to_string(),
            })
        }))
    }

    fn query<'a>(
        &'a self,
        container: &'a str,
        query: &'a Query,
        scope: &'a QueryScope,
    ) -> BoxFuture<'a, StoreResult<Vec<StoredItem>>> {
        let (name, query, scope) = (container.to_string(), query.clone(), scope.clone());
        Box::pin(self.with_conn(move |conn| {
            check_scope(&name, load_policy(conn, &name)?, &scope)?;

            let mut sql =
                String::from("SELECT partition_key, id, body, etag FROM items WHERE container = ?");
            let mut args: Vec<SqlValue> = vec![SqlValue::Text(name.clone())];

            if let QueryScope::Partition(key) = &scope {
                sql.push_str(" AND partition_key = ?");
                args.push(SqlValue::Text(key.encode()));
            }
            for (field, value) in &query.filters {
                if value.is_null() {
                    sql.push_str(" AND json_extract(body, ?) IS NULL");
                    args.push(SqlValue::Text(json_path(field)));
                } else {
                    sql.push_str(" AND json_extract(body, ?) = ?");
                    args.push(SqlValue::Text(json_path(field)));
                    args.push(sql_value(value));
                }
            }

            // Ties fall back to insertion order, reversed for descending sorts.
            match &query.order_by {
                None => sql.push_str(" ORDER BY position ASC"),
                Some((field, SortOrder::Ascending)) => {
                    sql.push_str(" ORDER BY json_extract(body, ?) ASC, position ASC");
                    args.push(SqlValue::Text(json_path(field)));
                }
                Some((field, SortOrder::Descending)) => {
                    sql.push_str(" ORDER BY json_extract(body, ?) DESC, position DESC");
                    args.push(SqlValue::Text(json_path(field)));
                }
            }
            sql.push_str(" LIMIT ? OFFSET ?");
            args.push(SqlValue::Integer(
                query.limit.map(|l| l.min(i64::MAX as usize) as i64).unwrap_or(-1),
            ));
            args.push(SqlValue::Integer(query.offset.min(i64::MAX as usize) as i64));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(args), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(key, id, body, etag)| decode_row(&name, key, id, body, etag))
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_temp(policy: PartitionPolicy) -> (SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("ledger.db"), Duration::from_secs(5)).unwrap();
        store.ensure_container("c", policy).await.unwrap();
        (store, dir)
    }

    #[test]
    fn wal_mode_enabled() {
        let dir = TempDir::new().unwrap();
        let conn = open_db(&dir.path().join("t.db"), Duration::from_secs(1)).unwrap();
        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn migrations_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        drop(open_db(&path, Duration::from_secs(1)).unwrap());
        let conn = open_db(&path, Duration::from_secs(1)).unwrap();
        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM schema_meta", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn garbage_file_is_a_permanent_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.db");
        std::fs::write(&path, vec![0xAB; 8192]).unwrap();
        let err = match SqliteStore::open(&path, Duration::from_secs(1)) {
            Err(e) => e,
            Ok(_) => panic!("opened a non-database file"),
        };
        assert!(matches!(err, StoreError::Backend(_)), "{err}");
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn create_read_and_conflict() {
        let (store, _dir) = open_temp(PartitionPolicy::ItemId).await;
        let key = PartitionKey::single("x");
        let item = store.create("c", &key, "x", &json!({"v": 1})).await.unwrap();
        assert_eq!(store.read("c", &key, "x").await.unwrap(), item);

        let err = store.create("c", &key, "x", &json!({"v": 2})).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let err = store.read("c", &key, "y").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn conditional_replace() {
        let (store, _dir) = open_temp(PartitionPolicy::ItemId).await;
        let key = PartitionKey::single("x");
        let first = store.create("c", &key, "x", &json!({"v": 1})).await.unwrap();
        let second = store
            .replace_if_match("c", &key, "x", &json!({"v": 2}), &first.etag)
            .await
            .unwrap();
        assert_ne!(second.etag, first.etag);

        let stale = store
            .replace_if_match("c", &key, "x", &json!({"v": 3}), &first.etag)
            .await
            .unwrap_err();
        assert!(matches!(stale, StoreError::PreconditionFailed { .. }));
        assert_eq!(store.read("c", &key, "x").await.unwrap().body, json!({"v": 2}));
    }

    #[tokio::test]
    async fn arity_checked_against_declared_policy() {
        let (store, _dir) = open_temp(PartitionPolicy::Composite).await;
        let err = store
            .read("c", &PartitionKey::single("t"), "x")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidKey(ValidationError::KeyArity { .. })
        ));
        let err = store
            .ensure_container("c", PartitionPolicy::ItemId)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidKey(ValidationError::PolicyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn query_filters_orders_and_pages() {
        let (store, _dir) = open_temp(PartitionPolicy::LegacySingle).await;
        let a = PartitionKey::single("a");
        let b = PartitionKey::single("b");
        for (i, (key, kind)) in [(&a, "x"), (&b, "x"), (&a, "y"), (&a, "x")]
            .into_iter()
            .enumerate()
        {
            store
                .create("c", key, &format!("i{i}"), &json!({"kind": kind, "n": i}))
                .await
                .unwrap();
        }

        let hits = store
            .query(
                "c",
                &Query::new().filter("kind", "x").order_by("n", SortOrder::Descending),
                &QueryScope::Partition(a.clone()),
            )
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i3", "i0"]);

        let page = store
            .query("c", &Query::new().offset(1).limit(2), &QueryScope::CrossPartition)
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i1", "i2"]);
        assert_eq!(page[0].partition_key, b);
    }

    #[tokio::test]
    async fn upsert_overwrites_in_place() {
        let (store, dir) = open_temp(PartitionPolicy::ItemId).await;
        let key = PartitionKey::single("x");
        let first = store.upsert("c", &key, "x", &json!({"v": 1})).await.unwrap();
        let second = store.upsert("c", &key, "x", &json!({"v": 2})).await.unwrap();
        assert_ne!(first.etag, second.etag);

        // Visible to a second connection on the same file
        let other = SqliteStore::open(&dir.path().join("ledger.db"), Duration::from_secs(5)).unwrap();
        assert_eq!(other.read("c", &key, "x").await.unwrap().body, json!({"v": 2}));
    }
}
