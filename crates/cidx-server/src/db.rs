//! SQLite connection management for the registry database (repos, jobs,
//! users, groups, sessions, audit log). Vector/FTS/SCIP data lives
//! outside SQLite, under `storage.data_dir` — see [`crate::store`].
//!
//! WAL mode lets concurrent readers run alongside the single writer
//! each mutation takes turns as, so search requests never block on a
//! background job's registry update.

use std::str::FromStr;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Idempotent schema creation, run once per `connect()`. CIDX has no
/// migration framework yet — every statement is `CREATE TABLE IF NOT
/// EXISTS` — so this doubles as the migration log until the schema
/// needs a breaking change.
pub(crate) async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            base_name       TEXT PRIMARY KEY,
            public_alias    TEXT NOT NULL UNIQUE,
            source_url      TEXT NOT NULL,
            default_branch  TEXT NOT NULL,
            clone_path      TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            flags_json      TEXT NOT NULL,
            last_refresh    TEXT,
            refresh_policy_json TEXT NOT NULL,
            last_indexed_commit TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS activated_repositories (
            username        TEXT NOT NULL,
            user_alias      TEXT NOT NULL,
            golden_base_name TEXT NOT NULL,
            working_tree    TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            PRIMARY KEY (username, user_alias)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id              TEXT PRIMARY KEY,
            kind_label      TEXT NOT NULL,
            target_key      TEXT NOT NULL,
            kind_json       TEXT NOT NULL,
            username        TEXT NOT NULL,
            status          TEXT NOT NULL,
            progress        INTEGER NOT NULL,
            created_at      TEXT NOT NULL,
            started_at      TEXT,
            completed_at    TEXT,
            result_json     TEXT,
            error           TEXT,
            callback_url    TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_dedup ON jobs(kind_label, target_key, status)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            username        TEXT PRIMARY KEY,
            password_hash   TEXT NOT NULL,
            group_name      TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS groups (
            name            TEXT PRIMARY KEY,
            accessible_repos_json TEXT NOT NULL,
            permissions_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL,
            impersonating   TEXT,
            created_at      TEXT NOT NULL,
            expires_at      TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id              TEXT PRIMARY KEY,
            at              TEXT NOT NULL,
            actor           TEXT NOT NULL,
            acting_as       TEXT,
            action          TEXT NOT NULL,
            target          TEXT,
            correlation_id  TEXT NOT NULL,
            outcome         TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_at ON audit_log(at)")
        .execute(pool)
        .await?;

    Ok(())
}
