//! Metadata index: durable `id -> FileRecord` table.
//!
//! `SqliteMetadataIndex` keeps records in the `files` table created by
//! `migrations/0001_init.sql`.

use crate::models::file_record::FileRecord;
use async_trait::async_trait;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{str::FromStr, time::Duration};
use tracing::debug;

pub type IndexResult<T> = Result<T, sqlx::Error>;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[async_trait]
pub trait MetadataIndex: Send + Sync {
    async fn get(&self, id: &str) -> IndexResult<Option<FileRecord>>;

    /// All records in insertion order.
    async fn list(&self) -> IndexResult<Vec<FileRecord>>;

    /// Insert or update the record keyed by `record.id`.
    async fn put(&self, record: &FileRecord) -> IndexResult<()>;

    /// Returns `true` if a record was removed.
    async fn delete(&self, id: &str) -> IndexResult<bool>;

    async fn ping(&self) -> IndexResult<()>;
}

/// Open a SQLite pool, creating the database file if needed.
pub async fn connect_pool(database_url: &str, max_connections: u32) -> IndexResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
}

/// Apply the embedded schema. Every statement is idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> IndexResult<usize> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    for stmt in &statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(statements.len())
}

#[derive(Clone)]
pub struct SqliteMetadataIndex {
    db: SqlitePool,
}

impl SqliteMetadataIndex {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MetadataIndex for SqliteMetadataIndex {
    async fn get(&self, id: &str) -> IndexResult<Option<FileRecord>> {
        sqlx::query_as::<_, FileRecord>(
            "SELECT id, file_name, created_at, size, file_type, file_path, metadata, revision
             FROM files WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
    }

    async fn list(&self) -> IndexResult<Vec<FileRecord>> {
        sqlx::query_as::<_, FileRecord>(
            "SELECT id, file_name, created_at, size, file_type, file_path, metadata, revision
             FROM files ORDER BY rowid ASC",
        )
        .fetch_all(&self.db)
        .await
    }

    async fn put(&self, record: &FileRecord) -> IndexResult<()> {
        sqlx::query(
            r#"
            INSERT INTO files (
                id, file_name, created_at, size, file_type, file_path, metadata, revision
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                file_name = excluded.file_name,
                size = excluded.size,
                file_type = excluded.file_type,
                file_path = excluded.file_path,
                metadata = excluded.metadata,
                revision = excluded.revision
            "#,
        )
        .bind(&record.id)
        .bind(&record.file_name)
        .bind(record.created_at)
        .bind(record.size)
        .bind(&record.file_type)
        .bind(&record.file_path)
        .bind(&record.metadata)
        .bind(record.revision)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> IndexResult<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> IndexResult<()> {
        let one = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.db)
            .await?;
        if one != 1 {
            return Err(sqlx::Error::Protocol(format!("unexpected result: {}", one)));
        }
        Ok(())
    }
}
