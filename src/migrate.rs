//! Versioned schema migrations.
//!
//! Each migration runs in its own transaction and is recorded in
//! `schema_migrations`, so `docflow init` is safe to run repeatedly and
//! an upgraded binary only applies what is new. Timestamps are stored as
//! unix milliseconds.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

struct Migration {
    version: i64,
    name: &'static str,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial schema",
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                storage_locator TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                content_sha256 TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted_at INTEGER
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_documents_tenant ON documents(tenant_id, created_at DESC)",
            r#"
            CREATE TABLE IF NOT EXISTS task_status (
                tenant_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                state TEXT NOT NULL,
                job_id TEXT,
                error TEXT,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (document_id, task_type),
                FOREIGN KEY (document_id) REFERENCES documents(id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                payload_json TEXT NOT NULL DEFAULT 'null',
                storage_locator TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                status TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                visible_at INTEGER,
                lease_token TEXT,
                last_error TEXT,
                dedup_key TEXT UNIQUE,
                updated_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs(task_type, status, visible_at)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_tenant ON jobs(tenant_id)",
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                attempt_count INTEGER NOT NULL,
                error TEXT NOT NULL,
                dead_lettered_at INTEGER NOT NULL,
                replayed_at INTEGER
            )
            "#,
            // At most one open dead letter per job.
            "CREATE UNIQUE INDEX IF NOT EXISTS ux_dead_letters_open ON dead_letters(job_id) WHERE replayed_at IS NULL",
            "CREATE INDEX IF NOT EXISTS idx_dead_letters_tenant ON dead_letters(tenant_id, dead_lettered_at DESC)",
            r#"
            CREATE TABLE IF NOT EXISTS task_results (
                tenant_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                job_id TEXT NOT NULL,
                output_json TEXT NOT NULL,
                confidence REAL,
                model_used TEXT,
                review_state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (document_id, task_type),
                FOREIGN KEY (document_id) REFERENCES documents(id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS result_corrections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                field TEXT NOT NULL,
                value_json TEXT NOT NULL,
                corrected_by TEXT NOT NULL,
                note TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_corrections_result ON result_corrections(document_id, task_type)",
            r#"
            CREATE TABLE IF NOT EXISTS chunk_sets (
                document_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                generation INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (document_id) REFERENCES documents(id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                hash TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                embedding_model TEXT NOT NULL,
                embedding_dims INTEGER NOT NULL,
                generation INTEGER NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (document_id, chunk_index),
                FOREIGN KEY (document_id) REFERENCES documents(id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_chunks_tenant_version ON chunks(tenant_id, embedding_model, embedding_dims)",
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                user_id TEXT,
                document_id TEXT,
                job_id TEXT,
                task_type TEXT,
                action TEXT NOT NULL,
                details_json TEXT NOT NULL DEFAULT '{}',
                dedup_key TEXT UNIQUE,
                created_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_audit_tenant_time ON audit_log(tenant_id, created_at)",
        ],
    },
    Migration {
        version: 2,
        name: "append-only audit and corrections",
        statements: &[
            r#"
            CREATE TRIGGER IF NOT EXISTS audit_log_no_update
            BEFORE UPDATE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit_log is append-only');
            END
            "#,
            r#"
            CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
            BEFORE DELETE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit_log is append-only');
            END
            "#,
            r#"
            CREATE TRIGGER IF NOT EXISTS result_corrections_no_update
            BEFORE UPDATE ON result_corrections
            BEGIN
                SELECT RAISE(ABORT, 'result_corrections is append-only');
            END
            "#,
            r#"
            CREATE TRIGGER IF NOT EXISTS result_corrections_no_delete
            BEFORE DELETE ON result_corrections
            BEGIN
                SELECT RAISE(ABORT, 'result_corrections is append-only');
            END
            "#,
        ],
    },
];

/// Latest schema version this binary knows about.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Apply pending migrations to `pool`. Returns how many were applied.
pub async fn apply(pool: &SqlitePool) -> Result<usize> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
        .fetch_one(pool)
        .await?;

    let mut applied = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let mut tx = pool.begin().await?;
        for statement in migration.statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("migration {} ({})", migration.version, migration.name))?;
        }
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(version = migration.version, name = migration.name, "applied migration");
        applied += 1;
    }
    Ok(applied)
}

pub async fn run_migrations(config: &Config) -> Result<usize> {
    let pool = db::connect(config).await?;
    let applied = apply(&pool).await?;
    pool.close().await;
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    async fn temp_pool(dir: &tempfile::TempDir) -> SqlitePool {
        let config = parse_config(&format!(
            "[db]\npath = \"{}\"\n",
            dir.path().join("t.sqlite").display()
        ))
        .unwrap();
        db::connect(&config).await.unwrap()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = temp_pool(&dir).await;
        assert_eq!(apply(&pool).await.unwrap(), MIGRATIONS.len());
        assert_eq!(apply(&pool).await.unwrap(), 0);
        let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, latest_version());
    }

    #[tokio::test]
    async fn audit_log_rejects_updates_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = temp_pool(&dir).await;
        apply(&pool).await.unwrap();
        sqlx::query(
            "INSERT INTO audit_log (tenant_id, action, details_json, created_at) VALUES ('t1', 'job_enqueued', '{}', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();
        assert!(sqlx::query("UPDATE audit_log SET action = 'x'")
            .execute(&pool)
            .await
            .is_err());
        assert!(sqlx::query("DELETE FROM audit_log").execute(&pool).await.is_err());
    }
}
