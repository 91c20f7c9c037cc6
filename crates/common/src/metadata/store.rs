//! SQLite-backed object index.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::SqliteConnection;

use crate::error::{Error, Result};
use crate::object::{parent_key, parent_prefix, Object, NAME_SEPARATOR};

/// One change to the index, applied inside a transaction.
#[derive(Debug, Clone)]
pub enum Mutation {
    Update(Object),
    Delete(String),
}

/// Persistent `objects` / `parents_index` / `page_token` tables.
///
/// Every write goes through a single transaction, so the two object tables
/// are never observed out of step.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (or create) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        tracing::info!(path = %path.display(), "opened metadata store");
        Ok(store)
    }

    /// Private in-memory database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(":memory:");

        // one long-lived connection; a second would see a different database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn try_get(&self, object_id: &str) -> Result<Option<Object>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM objects WHERE id = ?")
            .bind(object_id)
            .fetch_optional(&self.pool)
            .await?;
        value.map(|v| decode(&v)).transpose()
    }

    pub async fn get(&self, object_id: &str) -> Result<Object> {
        self.try_get(object_id)
            .await?
            .ok_or_else(|| Error::NotFound(object_id.to_string()))
    }

    /// Children of `parent_id`, ordered by name.
    pub async fn list(&self, parent_id: &str) -> Result<Vec<Object>> {
        let prefix = parent_prefix(parent_id);
        // every key under the prefix sorts below the one with the separator bumped by one
        let upper = format!("{}{}", parent_id, (NAME_SEPARATOR as u8 + 1) as char);

        let values: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT o.value
            FROM parents_index p
            JOIN objects o ON o.id = p.object_id
            WHERE p.key >= ? AND p.key < ?
            ORDER BY p.key
            "#,
        )
        .bind(&prefix)
        .bind(&upper)
        .fetch_all(&self.pool)
        .await?;

        values.iter().map(|v| decode(v)).collect()
    }

    pub async fn lookup(&self, parent_id: &str, name: &str) -> Result<Object> {
        let key = parent_key(parent_id, name);
        let value: Option<String> = sqlx::query_scalar(
            r#"
            SELECT o.value
            FROM parents_index p
            JOIN objects o ON o.id = p.object_id
            WHERE p.key = ?
            "#,
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?;

        match value {
            Some(v) => decode(&v),
            None => Err(Error::NotFound(key)),
        }
    }

    /// Insert or replace `object`, moving its index keys to its current
    /// parents and name.
    pub async fn update(&self, object: &Object) -> Result<()> {
        self.apply(&[Mutation::Update(object.clone())], None).await
    }

    pub async fn update_batch(&self, objects: &[Object]) -> Result<()> {
        let mutations: Vec<Mutation> = objects.iter().cloned().map(Mutation::Update).collect();
        self.apply(&mutations, None).await
    }

    /// Remove an object and its index keys. Deleting an unknown id is a no-op.
    pub async fn delete(&self, object_id: &str) -> Result<()> {
        self.apply(&[Mutation::Delete(object_id.to_string())], None)
            .await
    }

    /// Apply `mutations` in order and optionally advance the page token, all
    /// in one transaction.
    pub async fn apply(&self, mutations: &[Mutation], page_token: Option<&str>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for mutation in mutations {
            match mutation {
                Mutation::Update(object) => upsert(&mut *tx, object).await?,
                Mutation::Delete(object_id) => remove(&mut *tx, object_id).await?,
            }
        }
        if let Some(token) = page_token {
            write_page_token(&mut *tx, token).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn page_token(&self) -> Result<Option<String>> {
        let token = sqlx::query_scalar("SELECT token FROM page_token WHERE id = 0")
            .fetch_optional(&self.pool)
            .await?;
        Ok(token)
    }

    pub async fn set_page_token(&self, token: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_page_token(&mut *conn, token).await
    }

    pub async fn object_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Raw `(key, object_id)` rows of the index, in key order.
    pub async fn index_entries(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query_as("SELECT key, object_id FROM parents_index ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

fn decode(value: &str) -> Result<Object> {
    Ok(serde_json::from_str(value)?)
}

async fn upsert(conn: &mut SqliteConnection, object: &Object) -> Result<()> {
    if object.name.contains(NAME_SEPARATOR) {
        return Err(Error::InvalidName(object.name.clone()));
    }
    let value = serde_json::to_string(object)?;

    sqlx::query("DELETE FROM parents_index WHERE object_id = ?")
        .bind(&object.object_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO objects (id, value) VALUES (?, ?)
        ON CONFLICT(id) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(&object.object_id)
    .bind(&value)
    .execute(&mut *conn)
    .await?;

    for key in object.parent_keys() {
        sqlx::query(
            r#"
            INSERT INTO parents_index (key, object_id) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET object_id = excluded.object_id
            "#,
        )
        .bind(&key)
        .bind(&object.object_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn remove(conn: &mut SqliteConnection, object_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM parents_index WHERE object_id = ?")
        .bind(object_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM objects WHERE id = ?")
        .bind(object_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn write_page_token(conn: &mut SqliteConnection, token: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO page_token (id, token) VALUES (0, ?)
        ON CONFLICT(id) DO UPDATE SET token = excluded.token
        "#,
    )
    .bind(token)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
