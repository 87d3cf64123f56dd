//! SQLite persistence: per-thread session state and repository PATs.
//!
//! Thread state is written after every successful turn and every
//! environment-mode change, and read once at startup to restore sessions
//! after a daemon restart. PATs are keyed by repository full name with
//! upsert semantics.

use crate::error::Result;
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ThreadStateRow {
    pub thread_id: String,
    pub repo_full_name: String,
    pub repo_path: String,
    pub continuation_token: Option<String>,
    pub environment_mode: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PatRow {
    pub repo_full_name: String,
    pub token: String,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("botd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS threads (
                thread_id          TEXT PRIMARY KEY,
                repo_full_name     TEXT NOT NULL,
                repo_path          TEXT NOT NULL,
                continuation_token TEXT,
                environment_mode   TEXT NOT NULL DEFAULT 'host',
                updated_at         TEXT NOT NULL
            )",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS repository_pats (
                repo_full_name TEXT PRIMARY KEY,
                token          TEXT NOT NULL,
                description    TEXT,
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL
            )",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    // ─── Thread state ────────────────────────────────────────────────────────

    pub async fn upsert_thread_state(
        &self,
        thread_id: &str,
        repo_full_name: &str,
        repo_path: &str,
        continuation_token: Option<&str>,
        environment_mode: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO threads
                 (thread_id, repo_full_name, repo_path, continuation_token, environment_mode, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(thread_id) DO UPDATE SET
                 repo_full_name = excluded.repo_full_name,
                 repo_path = excluded.repo_path,
                 continuation_token = excluded.continuation_token,
                 environment_mode = excluded.environment_mode,
                 updated_at = excluded.updated_at",
        )
        .bind(thread_id)
        .bind(repo_full_name)
        .bind(repo_path)
        .bind(continuation_token)
        .bind(environment_mode)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_thread_states(&self) -> Result<Vec<ThreadStateRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM threads ORDER BY updated_at ASC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn delete_thread_state(&self, thread_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM threads WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Repository PATs ─────────────────────────────────────────────────────

    /// Insert or update the PAT for a repository. `created_at` is preserved
    /// across updates; `updated_at` always moves forward.
    pub async fn upsert_pat(
        &self,
        repo_full_name: &str,
        token: &str,
        description: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO repository_pats (repo_full_name, token, description, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(repo_full_name) DO UPDATE SET
                 token = excluded.token,
                 description = excluded.description,
                 updated_at = excluded.updated_at",
        )
        .bind(repo_full_name)
        .bind(token)
        .bind(description)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_pat(&self, repo_full_name: &str) -> Result<Option<PatRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM repository_pats WHERE repo_full_name = ?")
                .bind(repo_full_name)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_pats(&self) -> Result<Vec<PatRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM repository_pats ORDER BY repo_full_name ASC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn delete_pat(&self, repo_full_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM repository_pats WHERE repo_full_name = ?")
            .bind(repo_full_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
